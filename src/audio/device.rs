//! cpal-backed audio lines
//!
//! cpal streams cannot move between threads, so each open line owns a
//! dedicated thread that builds the stream and keeps it alive. Samples cross
//! between that thread and the pipeline over bounded channels.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::line::{AudioBackend, InputLine, OutputLine};
use crate::config::AudioConfig;
use crate::error::AudioError;

/// Blocks of captured samples buffered between the callback and `read`
const INPUT_QUEUE_BLOCKS: usize = 64;
/// Blocks of written samples buffered between `write` and the callback
const OUTPUT_QUEUE_BLOCKS: usize = 16;

/// Names of the host's capture devices
pub fn input_device_names() -> Vec<String> {
    let host = cpal::default_host();
    host.input_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}

/// Names of the host's playback devices
pub fn output_device_names() -> Vec<String> {
    let host = cpal::default_host();
    host.output_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}

fn find_input_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string())),
        Some(name) => host
            .input_devices()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(name.to_string())),
    }
}

fn find_output_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string())),
        Some(name) => host
            .output_devices()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(name.to_string())),
    }
}

fn stream_config(format: &AudioConfig) -> StreamConfig {
    StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Microphone line
pub struct CpalInputLine {
    device_name: Option<String>,
    config: StreamConfig,
    running: Arc<AtomicBool>,
    capturing: Arc<AtomicBool>,
    samples_rx: Option<Receiver<Vec<u8>>>,
    error_rx: Option<Receiver<AudioError>>,
    pending: VecDeque<u8>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalInputLine {
    pub fn new(format: &AudioConfig) -> Self {
        Self {
            device_name: format.input_device.clone(),
            config: stream_config(format),
            running: Arc::new(AtomicBool::new(false)),
            capturing: Arc::new(AtomicBool::new(false)),
            samples_rx: None,
            error_rx: None,
            pending: VecDeque::new(),
            thread_handle: None,
        }
    }

    fn check_errors(&self) -> Result<(), AudioError> {
        match self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn take_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

impl InputLine for CpalInputLine {
    fn open(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (samples_tx, samples_rx) = bounded::<Vec<u8>>(INPUT_QUEUE_BLOCKS);
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running = self.running.clone();
        let capturing = self.capturing.clone();
        let device_name = self.device_name.clone();
        let config = self.config.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("capture-line".to_string())
            .spawn(move || {
                let device = match find_input_device(device_name.as_deref()) {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let stream = device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        if !capturing.load(Ordering::Relaxed) {
                            return;
                        }
                        let bytes = data.iter().flat_map(|s| s.to_le_bytes()).collect();
                        // Dropped when the pipeline falls behind
                        let _ = samples_tx.try_send(bytes);
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            let _ = ready_tx.send(Err(e.into()));
                            return;
                        }
                        let _ = ready_tx.send(Ok(()));

                        while running.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                        // Stream is dropped here, stopping capture
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        self.samples_rx = Some(samples_rx);
        self.error_rx = Some(error_rx);

        let opened = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("capture thread exited".to_string())));
        if opened.is_err() {
            self.close();
        }
        opened
    }

    fn start(&mut self) -> Result<(), AudioError> {
        if !self.is_open() {
            return Err(AudioError::LineNotOpen);
        }
        self.capturing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        self.check_errors()?;
        let rx = self.samples_rx.clone().ok_or(AudioError::LineNotOpen)?;

        if self.capturing.load(Ordering::SeqCst) {
            while self.pending.len() < buf.len() {
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(bytes) => self.pending.extend(bytes),
                    Err(RecvTimeoutError::Timeout) => {
                        self.check_errors()?;
                        if !self.capturing.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(AudioError::StreamError("input stream ended".to_string()));
                    }
                }
            }
        } else {
            while let Ok(bytes) = rx.try_recv() {
                self.pending.extend(bytes);
            }
        }

        Ok(self.take_pending(buf))
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.capturing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        self.capturing.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.samples_rx = None;
        self.error_rx = None;
        self.pending.clear();
    }

    fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CpalInputLine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Speaker line
pub struct CpalOutputLine {
    device_name: Option<String>,
    config: StreamConfig,
    running: Arc<AtomicBool>,
    playing: Arc<AtomicBool>,
    samples_tx: Option<Sender<Vec<u8>>>,
    error_rx: Option<Receiver<AudioError>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalOutputLine {
    pub fn new(format: &AudioConfig) -> Self {
        Self {
            device_name: format.output_device.clone(),
            config: stream_config(format),
            running: Arc::new(AtomicBool::new(false)),
            playing: Arc::new(AtomicBool::new(false)),
            samples_tx: None,
            error_rx: None,
            thread_handle: None,
        }
    }
}

impl OutputLine for CpalOutputLine {
    fn open(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (samples_tx, samples_rx) = bounded::<Vec<u8>>(OUTPUT_QUEUE_BLOCKS);
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running = self.running.clone();
        let playing = self.playing.clone();
        let device_name = self.device_name.clone();
        let config = self.config.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("playback-line".to_string())
            .spawn(move || {
                let device = match find_output_device(device_name.as_deref()) {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let mut pending: VecDeque<u8> = VecDeque::new();
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        if !playing.load(Ordering::Relaxed) {
                            data.fill(0);
                            return;
                        }
                        for sample in data.iter_mut() {
                            while pending.len() < 2 {
                                match samples_rx.try_recv() {
                                    Ok(bytes) => pending.extend(bytes),
                                    Err(_) => break,
                                }
                            }
                            *sample = match (pending.pop_front(), pending.pop_front()) {
                                (Some(lo), Some(hi)) => i16::from_le_bytes([lo, hi]),
                                // Hardware underrun plays silence
                                _ => 0,
                            };
                        }
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            let _ = ready_tx.send(Err(e.into()));
                            return;
                        }
                        let _ = ready_tx.send(Ok(()));

                        while running.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        self.samples_tx = Some(samples_tx);
        self.error_rx = Some(error_rx);

        let opened = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("playback thread exited".to_string())));
        if opened.is_err() {
            self.close();
        }
        opened
    }

    fn start(&mut self) -> Result<(), AudioError> {
        if self.samples_tx.is_none() {
            return Err(AudioError::LineNotOpen);
        }
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, AudioError> {
        if let Some(e) = self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok()) {
            return Err(e);
        }
        let tx = self.samples_tx.as_ref().ok_or(AudioError::LineNotOpen)?;
        tx.send(data.to_vec())
            .map_err(|_| AudioError::StreamError("output stream ended".to_string()))?;
        Ok(data.len())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        self.playing.store(false, Ordering::SeqCst);
        self.samples_tx = None;
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.error_rx = None;
    }
}

impl Drop for CpalOutputLine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Lines on the host's real audio devices
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn input_line(&self, format: &AudioConfig) -> Result<Box<dyn InputLine>, AudioError> {
        Ok(Box::new(CpalInputLine::new(format)))
    }

    fn output_line(&self, format: &AudioConfig) -> Result<Box<dyn OutputLine>, AudioError> {
        Ok(Box::new(CpalOutputLine::new(format)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_start_closed() {
        let format = AudioConfig::default();
        let mut input = CpalInputLine::new(&format);
        assert!(!input.is_open());
        assert!(matches!(input.start(), Err(AudioError::LineNotOpen)));
        assert!(matches!(input.read(&mut [0u8; 4]), Err(AudioError::LineNotOpen)));

        let mut output = CpalOutputLine::new(&format);
        assert!(matches!(output.write(&[0u8; 4]), Err(AudioError::LineNotOpen)));
    }

    #[test]
    fn test_open_default_input() {
        // This may fail on CI/systems without audio devices
        if input_device_names().is_empty() {
            return;
        }
        let mut line = CpalInputLine::new(&AudioConfig::default());
        if line.open().is_ok() {
            assert!(line.is_open());
            line.close();
            assert!(!line.is_open());
        }
    }
}
