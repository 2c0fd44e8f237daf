//! Reversible byte filters and chunk framing
//!
//! Every captured chunk goes through the [`FilterChain`] before it is framed
//! and every received chunk goes back through it in reverse order.

pub mod chunk;
pub mod cipher;
pub mod filter;

pub use chunk::{read_chunk, write_chunk, ByteSource, ChunkLayout, ChunkRead, ChunkSink};
pub use cipher::{AesGcmFilter, CipherKey};
pub use filter::{FilterChain, StreamFilter, XorFilter};
