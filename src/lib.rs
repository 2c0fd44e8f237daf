//! # Direct Telephony
//!
//! Peer-to-peer text chat and encrypted voice between two hosts, with no
//! server in between.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── PEER A ────────────────────────────────┐
//! │                                                                         │
//! │  ┌──────────────────────────────┐     ┌──────────────────────────────┐  │
//! │  │ SessionService (TCP)         │     │ MediaService (UDP)           │  │
//! │  │  sender thread ◄── outbox    │     │                              │  │
//! │  │  receiver thread ──► events  │     │  Microphone                  │  │
//! │  │  close sentinel + barrier    │     │     │ CapturePipeline        │  │
//! │  └──────────────┬───────────────┘     │     ▼ FilterChain::encode    │  │
//! │                 │                     │  [len|payload] slots         │  │
//! │                 │                     │     ▼ FrameAssembler         │  │
//! │                 │                     │  outbound FrameRing ──► send │  │
//! │                 │                     │                              │  │
//! │                 │                     │  recv ──► jitter FrameRing   │  │
//! │                 │                     │     ▼ JitterReader           │  │
//! │                 │                     │     ▼ FilterChain::decode    │  │
//! │                 │                     │  Speaker (PlaybackPipeline)  │  │
//! │                 │                     └──────────────┬───────────────┘  │
//! └─────────────────┼────────────────────────────────────┼──────────────────┘
//!                   │ newline-delimited UTF-8            │ fixed-size datagrams
//!                   ▼                                    ▼
//!                 PEER B (same services, opposite roles)
//! ```
//!
//! Both services report through [`events::EventSink`] and take everything
//! they need from [`config`] when started.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod network;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for captured and played audio
    pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Signed 16-bit PCM
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Raw audio bytes per chunk; encrypts to 168 bytes, three slots per datagram
    pub const DEFAULT_CHUNK_BYTES: usize = 140;

    /// Largest payload a one-byte length prefix can describe
    pub const MAX_CHUNK_PAYLOAD: usize = 255;

    /// Datagram size that avoids IP fragmentation on any path
    pub const DEFAULT_MAX_PACKET_SIZE: usize = 508;

    /// Largest UDP payload over IPv4
    pub const MAX_UDP_PAYLOAD: usize = 65507;

    /// Jitter buffer depth in frames
    pub const DEFAULT_JITTER_CAPACITY: usize = 3;

    /// Outbound queue depth in frames
    pub const DEFAULT_OUTBOUND_CAPACITY: usize = 3;

    /// Default TCP port for the text session
    pub const DEFAULT_SESSION_PORT: u16 = 5050;

    /// Default UDP port for inbound voice
    pub const DEFAULT_MEDIA_PORT: u16 = 5060;

    /// Line that tells the peer no more messages are coming
    pub const DEFAULT_CLOSE_SENTINEL: &str = "\u{4}__direct_telephony_close__";
}
