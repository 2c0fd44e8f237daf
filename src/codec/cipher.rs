//! AES-256-GCM chunk filter
//!
//! Each chunk is sealed under a provisioned key with a fresh random nonce:
//!
//! ```text
//! [nonce: 12][ciphertext: n][tag: 16]
//! ```

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use std::fmt;

use super::filter::StreamFilter;
use crate::error::FilterError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Bytes added to every chunk by [`AesGcmFilter`]
pub const GCM_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Shared 256-bit key
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey([u8; KEY_LEN]);

impl CipherKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse 64 hex characters
    pub fn from_hex(text: &str) -> Result<Self, FilterError> {
        let bytes = hex::decode(text.trim()).map_err(|e| FilterError::InvalidKey(e.to_string()))?;
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|v: Vec<u8>| {
            FilterError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, v.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Fresh key from the OS random source
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(key.as_slice());
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherKey(..)")
    }
}

/// Authenticated encryption filter
pub struct AesGcmFilter {
    cipher: Aes256Gcm,
}

impl AesGcmFilter {
    pub fn new(key: &CipherKey) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }
}

impl StreamFilter for AesGcmFilter {
    fn name(&self) -> &str {
        "aes-256-gcm"
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, data)
            .map_err(|e| FilterError::Encrypt(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
        if data.len() < GCM_OVERHEAD {
            return Err(FilterError::Truncated(data.len()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| FilterError::Decrypt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_key() -> CipherKey {
        CipherKey::from_bytes([7u8; KEY_LEN])
    }

    #[test]
    fn test_roundtrip_with_overhead() {
        let filter = AesGcmFilter::new(&test_key());
        let encoded = filter.encode(&[1, 2, 3, 4]).unwrap();
        assert_eq!(encoded.len(), 4 + GCM_OVERHEAD);
        assert_eq!(filter.decode(&encoded).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_fresh_nonce_per_chunk() {
        let filter = AesGcmFilter::new(&test_key());
        let a = filter.encode(b"same").unwrap();
        let b = filter.encode(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_chunk_rejected() {
        let filter = AesGcmFilter::new(&test_key());
        let mut encoded = filter.encode(b"voice").unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;
        assert!(matches!(filter.decode(&encoded), Err(FilterError::Decrypt(_))));
    }

    #[test]
    fn test_truncated_chunk_rejected() {
        let filter = AesGcmFilter::new(&test_key());
        assert_eq!(filter.decode(&[0u8; 10]), Err(FilterError::Truncated(10)));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let encoded = AesGcmFilter::new(&test_key()).encode(b"voice").unwrap();
        let other = AesGcmFilter::new(&CipherKey::from_bytes([8u8; KEY_LEN]));
        assert!(other.decode(&encoded).is_err());
    }

    #[test]
    fn test_key_hex_roundtrip() {
        let key = CipherKey::generate();
        assert_eq!(CipherKey::from_hex(&key.to_hex()).unwrap(), key);
        assert!(CipherKey::from_hex("abcd").is_err());
        assert_eq!(format!("{:?}", key), "CipherKey(..)");
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(payload in proptest::collection::vec(any::<u8>(), 0..227)) {
            let filter = AesGcmFilter::new(&test_key());
            let encoded = filter.encode(&payload).unwrap();
            prop_assert_eq!(filter.decode(&encoded).unwrap(), payload);
        }
    }
}
