//! Error types for the telephony core

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operation invoked in the wrong lifecycle state.
///
/// These are always returned synchronously and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("The {0} is already launched, it needs to be stopped first")]
    AlreadyLaunched(&'static str),

    #[error("The {0} is not launched")]
    NotLaunched(&'static str),

    #[error("No peer is connected")]
    NotConnected,

    #[error("Inbound audio must be started before outbound audio")]
    InboundNotLaunched,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Line is not open")]
    LineNotOpen,

    #[error("Stream is unexpectedly finished: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Chunk of {0} bytes does not fit the 1-byte length prefix")]
    ChunkTooLarge(usize),

    #[error("Filter failed: {0}")]
    Filter(#[from] FilterError),

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Encode/decode filter errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Input of {0} bytes is too short")]
    Truncated(usize),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Accept failed: {0}")]
    AcceptFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Cannot resolve address {0}")]
    Unresolved(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(e: cpal::BuildStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(e: cpal::PlayStreamError) -> Self {
        AudioError::CpalError(e.to_string())
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
