//! In-process audio lines
//!
//! Used for headless runs and tests: the input line plays back a script of
//! bytes (then silence), the output line records everything written to it.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::line::{AudioBackend, InputLine, OutputLine};
use crate::config::AudioConfig;
use crate::error::AudioError;

#[derive(Default)]
struct Script {
    bytes: Mutex<VecDeque<u8>>,
    fed: Condvar,
}

/// Bytes waiting to be "captured"
#[derive(Clone, Default)]
pub struct InputScript(Arc<Script>);

impl InputScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self, data: &[u8]) {
        self.0.bytes.lock().extend(data.iter().copied());
        self.0.fed.notify_all();
    }
}

/// Everything an output line was given, in order
#[derive(Clone, Default)]
pub struct OutputRecord(Arc<Mutex<Vec<u8>>>);

impl OutputRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Whether `needle` appears contiguously in the recording
    pub fn contains(&self, needle: &[u8]) -> bool {
        needle.is_empty() || self.0.lock().windows(needle.len()).any(|w| w == needle)
    }
}

/// Input line fed from an [`InputScript`].
///
/// While started and the script is empty, a read waits up to `idle` and then
/// yields silence, like a microphone in a quiet room.
pub struct MemoryInputLine {
    script: InputScript,
    idle: Duration,
    open: bool,
    started: bool,
}

impl MemoryInputLine {
    pub fn new(script: InputScript, idle: Duration) -> Self {
        Self {
            script,
            idle,
            open: false,
            started: false,
        }
    }

    fn take(&self, buf: &mut [u8]) -> usize {
        let mut bytes = self.script.0.bytes.lock();
        let n = buf.len().min(bytes.len());
        for (slot, byte) in buf.iter_mut().zip(bytes.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

impl InputLine for MemoryInputLine {
    fn open(&mut self) -> Result<(), AudioError> {
        self.open = true;
        Ok(())
    }

    fn start(&mut self) -> Result<(), AudioError> {
        if !self.open {
            return Err(AudioError::LineNotOpen);
        }
        self.started = true;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        if !self.open {
            return Err(AudioError::LineNotOpen);
        }
        if !self.started {
            return Ok(self.take(buf));
        }

        {
            let mut bytes = self.script.0.bytes.lock();
            if bytes.len() < buf.len() {
                self.script.0.fed.wait_for(&mut bytes, self.idle);
            }
        }
        let n = self.take(buf);
        buf[n..].fill(0);
        Ok(buf.len())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.started = false;
        Ok(())
    }

    fn close(&mut self) {
        self.started = false;
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Output line appending to an [`OutputRecord`]
pub struct MemoryOutputLine {
    record: OutputRecord,
    open: bool,
}

impl MemoryOutputLine {
    pub fn new(record: OutputRecord) -> Self {
        Self {
            record,
            open: false,
        }
    }
}

impl OutputLine for MemoryOutputLine {
    fn open(&mut self) -> Result<(), AudioError> {
        self.open = true;
        Ok(())
    }

    fn start(&mut self) -> Result<(), AudioError> {
        if !self.open {
            return Err(AudioError::LineNotOpen);
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, AudioError> {
        if !self.open {
            return Err(AudioError::LineNotOpen);
        }
        self.record.0.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }
}

/// Backend handing out memory lines bound to one script and one record
#[derive(Clone)]
pub struct MemoryBackend {
    pub script: InputScript,
    pub record: OutputRecord,
    idle: Duration,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            script: InputScript::new(),
            record: OutputRecord::new(),
            idle: Duration::from_millis(5),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for MemoryBackend {
    fn input_line(&self, _format: &AudioConfig) -> Result<Box<dyn InputLine>, AudioError> {
        Ok(Box::new(MemoryInputLine::new(self.script.clone(), self.idle)))
    }

    fn output_line(&self, _format: &AudioConfig) -> Result<Box<dyn OutputLine>, AudioError> {
        Ok(Box::new(MemoryOutputLine::new(self.record.clone())))
    }
}
