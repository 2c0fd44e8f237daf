//! Hardware line seam
//!
//! The pipelines only see these traits. [`crate::audio::device`] backs them
//! with cpal, [`crate::audio::memory`] with in-process buffers.

use crate::config::AudioConfig;
use crate::error::AudioError;

/// A capture line (microphone)
pub trait InputLine: Send {
    fn open(&mut self) -> Result<(), AudioError>;

    fn start(&mut self) -> Result<(), AudioError>;

    /// While started, block until `buf` is full. After [`stop`](Self::stop),
    /// return what the line still holds without blocking, 0 once it is empty.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError>;

    fn stop(&mut self) -> Result<(), AudioError>;

    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// A playback line (speakers)
pub trait OutputLine: Send {
    fn open(&mut self) -> Result<(), AudioError>;

    fn start(&mut self) -> Result<(), AudioError>;

    /// May block while the line's buffer is full
    fn write(&mut self, data: &[u8]) -> Result<usize, AudioError>;

    fn stop(&mut self) -> Result<(), AudioError>;

    fn close(&mut self);
}

/// Creates lines for each start of the media service
pub trait AudioBackend: Send + Sync {
    fn input_line(&self, format: &AudioConfig) -> Result<Box<dyn InputLine>, AudioError>;

    fn output_line(&self, format: &AudioConfig) -> Result<Box<dyn OutputLine>, AudioError>;
}
