//! Application configuration
//!
//! Everything the core consumes is passed in explicitly: services are built
//! from these structs and every start call receives its [`Binding`].

use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use crate::codec::cipher::{CipherKey, GCM_OVERHEAD};
use crate::constants::*;
use crate::error::{Error, NetworkError, Result};

/// Top-level configuration, usually loaded from `telephony.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub media: MediaConfig,
    pub audio: AudioConfig,
    pub cipher: CipherConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the platform config directory, falling back to defaults
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/direct-telephony/telephony.toml`
    pub fn default_path() -> Option<std::path::PathBuf> {
        directories::ProjectDirs::from("org", "deesthortered", "direct-telephony")
            .map(|dirs| dirs.config_dir().join("telephony.toml"))
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        self.media.validate()?;
        self.audio.validate()?;

        let encoded = self.audio.chunk_bytes + GCM_OVERHEAD;
        if encoded > MAX_CHUNK_PAYLOAD {
            return Err(Error::Config(format!(
                "audio.chunk_bytes = {} encrypts to {} bytes, the limit is {}",
                self.audio.chunk_bytes, encoded, MAX_CHUNK_PAYLOAD
            )));
        }

        if let Some(key) = &self.cipher.key {
            CipherKey::from_hex(key).map_err(|e| Error::Config(e.to_string()))?;
        }
        Ok(())
    }
}

/// How a socket picks its local address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Let the OS choose the port on all interfaces
    Auto,
    /// Bind exactly this host/port
    Fixed { host: String, port: u16 },
}

impl Binding {
    pub fn fixed(host: impl Into<String>, port: u16) -> Self {
        Binding::Fixed {
            host: host.into(),
            port,
        }
    }

    /// Resolve to a concrete socket address
    pub fn resolve(&self) -> std::result::Result<SocketAddr, NetworkError> {
        match self {
            Binding::Auto => Ok(SocketAddr::from(([0, 0, 0, 0], 0))),
            Binding::Fixed { host, port } => resolve(host, *port),
        }
    }
}

/// Resolve `host:port`, preferring IPv4
pub fn resolve(host: &str, port: u16) -> std::result::Result<SocketAddr, NetworkError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::Unresolved(format!("{}:{} ({})", host, port, e)))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| NetworkError::Unresolved(format!("{}:{}", host, port)))
}

/// Text session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Host to listen on (fixed binding) or to dial
    pub host: String,
    pub port: u16,
    /// Reserved line meaning "no more data is coming"
    pub close_sentinel: String,
    pub connect_timeout_ms: u64,
    /// How often a pending accept checks for cancellation
    pub accept_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_SESSION_PORT,
            close_sentinel: DEFAULT_CLOSE_SENTINEL.to_string(),
            connect_timeout_ms: 10_000,
            accept_poll_ms: 50,
        }
    }
}

impl SessionConfig {
    pub fn binding(&self, auto_assign: bool) -> Binding {
        if auto_assign {
            Binding::Auto
        } else {
            Binding::fixed(self.host.clone(), self.port)
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms.max(1))
    }

    fn validate(&self) -> Result<()> {
        if self.close_sentinel.is_empty() || self.close_sentinel.contains(['\n', '\r']) {
            return Err(Error::Config(
                "session.close_sentinel must be a non-empty single line".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::Config("session.connect_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}

/// One media direction's network data
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    /// Bind to an OS-chosen port instead of `host:port`
    pub auto_assign: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_MEDIA_PORT,
            auto_assign: false,
        }
    }
}

impl EndpointConfig {
    pub fn binding(&self) -> Binding {
        if self.auto_assign {
            Binding::Auto
        } else {
            Binding::fixed(self.host.clone(), self.port)
        }
    }
}

/// Voice streaming settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Inbound (listening) socket
    pub server: EndpointConfig,
    /// Remote endpoint the outbound socket sends to
    pub client: EndpointConfig,
    /// Bytes per datagram
    pub max_packet_size: usize,
    /// Frames held by the jitter buffer before the oldest is evicted
    pub jitter_capacity: usize,
    /// Frames queued for sending before the oldest is evicted
    pub outbound_capacity: usize,
    /// Socket read timeout used to observe stop requests
    pub poll_interval_ms: u64,
    /// Consecutive silent frames after which playback counts as finished
    pub exhaustion_frames: usize,
    /// SO_RCVBUF / SO_SNDBUF, 0 keeps the OS default
    pub socket_buffer_size: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            server: EndpointConfig::default(),
            // Port the peer's inbound socket listens on
            client: EndpointConfig {
                host: "127.0.0.1".to_string(),
                ..EndpointConfig::default()
            },
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            jitter_capacity: DEFAULT_JITTER_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            poll_interval_ms: 20,
            exhaustion_frames: 25,
            socket_buffer_size: 0,
        }
    }
}

impl MediaConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn validate(&self) -> Result<()> {
        if self.max_packet_size == 0 || self.max_packet_size > MAX_UDP_PAYLOAD {
            return Err(Error::Config(format!(
                "media.max_packet_size must be in 1..={}",
                MAX_UDP_PAYLOAD
            )));
        }
        if self.jitter_capacity == 0 || self.outbound_capacity == 0 {
            return Err(Error::Config("media queue capacities must be positive".to_string()));
        }
        if self.exhaustion_frames == 0 {
            return Err(Error::Config("media.exhaustion_frames must be positive".to_string()));
        }
        Ok(())
    }
}

/// PCM format shared by both lines (16-bit signed little-endian)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Raw bytes captured per chunk before filtering
    pub chunk_bytes: usize,
    /// Device names, `None` picks the host default
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    /// Bytes in one sample frame across all channels
    pub fn frame_bytes(&self) -> usize {
        BYTES_PER_SAMPLE * self.channels as usize
    }

    fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.sample_rate == 0 {
            return Err(Error::Config("audio format must have channels and a sample rate".to_string()));
        }
        if self.chunk_bytes == 0 || self.chunk_bytes % self.frame_bytes() != 0 {
            return Err(Error::Config(format!(
                "audio.chunk_bytes must be a positive multiple of {}",
                self.frame_bytes()
            )));
        }
        Ok(())
    }
}

/// Cipher provisioning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    /// 32-byte key as 64 hex characters, shared out of band by both peers
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
