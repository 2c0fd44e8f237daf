//! Capture pipeline
//!
//! A long-lived thread drives the input line through
//! `Idle → Recording → Draining → Idle`. While recording it reads one chunk
//! at a time, runs it through the filter chain and writes the framed result
//! to the chunk sink. Stopping drains what the line still holds before the
//! line is closed, so the tail of the recording is not cut off.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::line::InputLine;
use crate::codec::chunk::{write_chunk, ChunkLayout, ChunkSink};
use crate::codec::filter::FilterChain;
use crate::error::AudioError;
use crate::events::{MediaEvent, SharedSink};

/// Longest the idle loop sleeps before re-checking its flags
const IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Recording,
    Draining,
}

#[derive(Default)]
struct Control {
    should_record: bool,
    closed: bool,
}

struct Shared {
    control: Mutex<Control>,
    wake: Condvar,
    state: Mutex<CaptureState>,
    chunks_captured: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: CaptureState) {
        *self.state.lock() = state;
    }

    fn state(&self) -> CaptureState {
        *self.state.lock()
    }
}

/// Handle to the capture thread
pub struct CapturePipeline {
    shared: Arc<Shared>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Spawn the capture thread. Nothing is recorded until
    /// [`start_recording`](Self::start_recording).
    pub fn spawn(
        line: Box<dyn InputLine>,
        filters: FilterChain,
        sink: Box<dyn ChunkSink>,
        layout: ChunkLayout,
        events: SharedSink<MediaEvent>,
    ) -> Result<Self, AudioError> {
        let shared = Arc::new(Shared {
            control: Mutex::new(Control::default()),
            wake: Condvar::new(),
            state: Mutex::new(CaptureState::Idle),
            chunks_captured: AtomicU64::new(0),
        });

        let mut worker = CaptureWorker {
            line,
            filters,
            sink,
            raw: vec![0u8; layout.chunk_bytes],
            shared: shared.clone(),
            events,
        };

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || worker.run())
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Self {
            shared,
            thread_handle: Some(handle),
        })
    }

    pub fn start_recording(&self) {
        self.shared.control.lock().should_record = true;
        self.shared.wake.notify_all();
    }

    pub fn stop_recording(&self) {
        self.shared.control.lock().should_record = false;
        self.shared.wake.notify_all();
    }

    pub fn state(&self) -> CaptureState {
        self.shared.state()
    }

    pub fn chunks_captured(&self) -> u64 {
        self.shared.chunks_captured.load(Ordering::Relaxed)
    }

    /// End the capture thread and wait for it
    pub fn close(&mut self) {
        self.shared.control.lock().closed = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.close();
    }
}

struct CaptureWorker {
    line: Box<dyn InputLine>,
    filters: FilterChain,
    sink: Box<dyn ChunkSink>,
    raw: Vec<u8>,
    shared: Arc<Shared>,
    events: SharedSink<MediaEvent>,
}

impl CaptureWorker {
    fn run(&mut self) {
        let result = self.capture_loop();

        if self.line.is_open() {
            let _ = self.line.stop();
            self.line.close();
        }
        self.shared.set_state(CaptureState::Idle);

        if let Err(e) = result {
            tracing::error!("Recording failed: {}", e);
            self.events.emit(MediaEvent::RecordingFailed {
                reason: e.to_string(),
            });
        }
    }

    fn capture_loop(&mut self) -> Result<(), AudioError> {
        loop {
            let (should_record, closed) = {
                let mut control = self.shared.control.lock();
                if !control.should_record
                    && !control.closed
                    && self.shared.state() == CaptureState::Idle
                {
                    self.shared.wake.wait_for(&mut control, IDLE_WAIT);
                }
                (control.should_record, control.closed)
            };

            if closed {
                return Ok(());
            }

            match (should_record, self.shared.state()) {
                (true, CaptureState::Idle) => {
                    self.line.open()?;
                    self.line.start()?;
                    self.shared.set_state(CaptureState::Recording);
                    tracing::info!("Recording started");
                }
                (true, CaptureState::Recording) => {
                    let n = self.line.read(&mut self.raw)?;
                    if n > 0 {
                        self.emit_chunk(n)?;
                    }
                }
                (false, CaptureState::Recording) => self.drain()?,
                _ => {}
            }
        }
    }

    /// Stop the line, forward what it still holds, then close it
    fn drain(&mut self) -> Result<(), AudioError> {
        self.shared.set_state(CaptureState::Draining);
        self.line.stop()?;

        let mut drained = 0;
        loop {
            let n = self.line.read(&mut self.raw)?;
            if n == 0 {
                break;
            }
            self.emit_chunk(n)?;
            drained += 1;
        }
        self.sink.flush();
        self.line.close();

        self.shared.set_state(CaptureState::Idle);
        tracing::info!("Recording stopped, {} chunks drained", drained);
        Ok(())
    }

    /// Filter and frame the first `n` bytes of the raw buffer.
    /// A short block is padded with silence so every chunk has the same size.
    fn emit_chunk(&mut self, n: usize) -> Result<(), AudioError> {
        self.raw[n..].fill(0);
        let encoded = self.filters.encode(&self.raw)?;
        write_chunk(self.sink.as_mut(), &encoded)?;
        self.shared.chunks_captured.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
