//! Chunk framing for the media byte stream
//!
//! ```text
//! [len: u8][payload: len bytes]
//! ```
//!
//! Every chunk encodes to the same length, so the stream is a sequence of
//! fixed-size slots and each datagram carries a whole number of them (see
//! [`ChunkLayout`]). A slot whose length byte is zero never comes from a
//! sender: it is padding or a gap the jitter reader filled with zeros, and it
//! plays as one chunk of silence.

use super::filter::FilterChain;
use crate::constants::MAX_CHUNK_PAYLOAD;
use crate::error::{AudioError, Error, Result};

/// Sizes shared by both ends of the media stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    /// Raw audio bytes per chunk
    pub chunk_bytes: usize,
    /// Filtered payload bytes per chunk
    pub payload_len: usize,
    /// Bytes per datagram, a multiple of the slot length
    pub frame_size: usize,
}

impl ChunkLayout {
    /// Measure the chain's output for one chunk and fit whole slots into
    /// `max_packet_size`
    pub fn measure(chain: &FilterChain, chunk_bytes: usize, max_packet_size: usize) -> Result<Self> {
        let payload_len = chain.encode(&vec![0u8; chunk_bytes])?.len();
        if payload_len == 0 || payload_len > MAX_CHUNK_PAYLOAD {
            return Err(AudioError::ChunkTooLarge(payload_len).into());
        }

        let slot_len = payload_len + 1;
        let slots = max_packet_size / slot_len;
        if slots == 0 {
            return Err(Error::Config(format!(
                "max packet size {} cannot hold a {}-byte chunk",
                max_packet_size, slot_len
            )));
        }

        Ok(Self {
            chunk_bytes,
            payload_len,
            frame_size: slots * slot_len,
        })
    }

    /// Length byte plus payload
    pub fn slot_len(&self) -> usize {
        self.payload_len + 1
    }

    pub fn slots_per_frame(&self) -> usize {
        self.frame_size / self.slot_len()
    }
}

/// Consumer of framed bytes (the outbound side of the stream)
pub trait ChunkSink: Send {
    fn write(&mut self, bytes: &[u8]);

    /// Push out anything held back
    fn flush(&mut self) {}
}

/// Producer of stream bytes (the inbound side of the stream)
pub trait ByteSource: Send {
    /// Fill `buf` as far as possible; 0 means the stream is exhausted
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// One item pulled from a [`ByteSource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkRead {
    /// A filtered payload
    Payload(Vec<u8>),
    /// Zero length prefix: filler from an underrun
    Gap,
    /// The source had nothing to give
    Exhausted,
}

/// Prefix `payload` with its length and hand it to `sink` as one write
pub fn write_chunk(sink: &mut dyn ChunkSink, payload: &[u8]) -> std::result::Result<(), AudioError> {
    if payload.is_empty() || payload.len() > MAX_CHUNK_PAYLOAD {
        return Err(AudioError::ChunkTooLarge(payload.len()));
    }
    let mut framed = Vec::with_capacity(payload.len() + 1);
    framed.push(payload.len() as u8);
    framed.extend_from_slice(payload);
    sink.write(&framed);
    Ok(())
}

/// Read the next slot of `slot_len` bytes. A payload shorter than its
/// prefix is fatal.
pub fn read_chunk(source: &mut dyn ByteSource, slot_len: usize) -> std::result::Result<ChunkRead, AudioError> {
    let mut len = [0u8; 1];
    if source.read(&mut len) == 0 {
        return Ok(ChunkRead::Exhausted);
    }
    let expected = len[0] as usize;
    if expected == 0 {
        let mut rest = vec![0u8; slot_len.saturating_sub(1)];
        source.read(&mut rest);
        return Ok(ChunkRead::Gap);
    }

    let mut payload = vec![0u8; expected];
    let actual = source.read(&mut payload);
    if actual < expected {
        return Err(AudioError::ShortRead { expected, actual });
    }
    Ok(ChunkRead::Payload(payload))
}

impl ChunkSink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}
