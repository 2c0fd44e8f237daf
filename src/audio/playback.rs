//! Playback pipeline
//!
//! Pulls framed chunks from a [`ByteSource`], decodes them through the
//! filter chain in reverse and writes the audio to the output line. The
//! line is opened when the thread starts and stays open until it ends;
//! playing only gates whether the loop consumes the source.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::line::OutputLine;
use crate::codec::chunk::{read_chunk, ByteSource, ChunkLayout, ChunkRead};
use crate::codec::filter::FilterChain;
use crate::error::AudioError;
use crate::events::{MediaEvent, SharedSink};

const IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
    /// Left the playing state, either told to or out of data
    Stopped,
}

#[derive(Default)]
struct Control {
    should_play: bool,
    stop_requested: bool,
    closed: bool,
}

struct Shared {
    control: Mutex<Control>,
    wake: Condvar,
    state: Mutex<PlaybackState>,
    chunks_played: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: PlaybackState) {
        *self.state.lock() = state;
    }

    fn state(&self) -> PlaybackState {
        *self.state.lock()
    }
}

/// Handle to the playback thread
pub struct PlaybackPipeline {
    shared: Arc<Shared>,
    thread_handle: Option<JoinHandle<()>>,
}

impl PlaybackPipeline {
    pub fn spawn(
        line: Box<dyn OutputLine>,
        filters: FilterChain,
        source: Box<dyn ByteSource>,
        layout: ChunkLayout,
        events: SharedSink<MediaEvent>,
    ) -> Result<Self, AudioError> {
        let shared = Arc::new(Shared {
            control: Mutex::new(Control::default()),
            wake: Condvar::new(),
            state: Mutex::new(PlaybackState::Idle),
            chunks_played: AtomicU64::new(0),
        });

        let mut worker = PlaybackWorker {
            line,
            filters,
            source,
            silence: vec![0u8; layout.chunk_bytes],
            layout,
            shared: shared.clone(),
            events,
        };

        let handle = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || worker.run())
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Self {
            shared,
            thread_handle: Some(handle),
        })
    }

    /// Begin (or resume) consuming the source
    pub fn start_playing(&self) {
        let mut control = self.shared.control.lock();
        control.should_play = true;
        control.stop_requested = false;
        drop(control);
        self.shared.wake.notify_all();
    }

    pub fn stop_playing(&self) {
        let mut control = self.shared.control.lock();
        if control.should_play {
            control.should_play = false;
            control.stop_requested = true;
        }
        drop(control);
        self.shared.wake.notify_all();
    }

    /// True while playback has been asked to run
    pub fn is_playing(&self) -> bool {
        self.shared.control.lock().should_play
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    pub fn chunks_played(&self) -> u64 {
        self.shared.chunks_played.load(Ordering::Relaxed)
    }

    /// End the playback thread and wait for it
    pub fn close(&mut self) {
        self.shared.control.lock().closed = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.close();
    }
}

struct PlaybackWorker {
    line: Box<dyn OutputLine>,
    filters: FilterChain,
    source: Box<dyn ByteSource>,
    silence: Vec<u8>,
    layout: ChunkLayout,
    shared: Arc<Shared>,
    events: SharedSink<MediaEvent>,
}

impl PlaybackWorker {
    fn run(&mut self) {
        let result = self.line.open().and_then(|_| self.playback_loop());
        let _ = self.line.stop();
        self.line.close();

        self.shared.control.lock().should_play = false;
        if let Err(e) = result {
            self.shared.set_state(PlaybackState::Stopped);
            tracing::error!("Playback failed: {}", e);
            self.events.emit(MediaEvent::PlayingFailed {
                reason: e.to_string(),
            });
        }
    }

    fn playback_loop(&mut self) -> Result<(), AudioError> {
        loop {
            let (should_play, stop_requested, closed) = {
                let mut control = self.shared.control.lock();
                if !control.should_play && !control.stop_requested && !control.closed {
                    self.shared.wake.wait_for(&mut control, IDLE_WAIT);
                }
                (control.should_play, control.stop_requested, control.closed)
            };

            if closed {
                if self.shared.state() == PlaybackState::Playing {
                    if stop_requested {
                        self.finish(MediaEvent::PlayingStopped);
                    } else {
                        self.finish(MediaEvent::PlayingFinished);
                    }
                }
                return Ok(());
            }

            if should_play {
                if self.shared.state() != PlaybackState::Playing {
                    self.line.start()?;
                    self.shared.set_state(PlaybackState::Playing);
                    tracing::debug!("Playback started");
                }
                self.play_one()?;
            } else if stop_requested {
                self.finish(MediaEvent::PlayingStopped);
            }
        }
    }

    fn play_one(&mut self) -> Result<(), AudioError> {
        match read_chunk(self.source.as_mut(), self.layout.slot_len())? {
            ChunkRead::Payload(payload) => {
                let audio = self.filters.decode(&payload)?;
                self.line.write(&audio)?;
                self.shared.chunks_played.fetch_add(1, Ordering::Relaxed);
            }
            ChunkRead::Gap => {
                self.line.write(&self.silence)?;
            }
            ChunkRead::Exhausted => {
                let requested = {
                    let mut control = self.shared.control.lock();
                    let requested = control.stop_requested;
                    control.should_play = false;
                    requested
                };
                if requested {
                    self.finish(MediaEvent::PlayingStopped);
                } else {
                    self.finish(MediaEvent::PlayingFinished);
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self, event: MediaEvent) {
        self.shared.control.lock().stop_requested = false;
        if self.shared.state() == PlaybackState::Playing {
            let _ = self.line.stop();
        }
        self.shared.set_state(PlaybackState::Stopped);
        tracing::debug!("Playback left playing state: {:?}", event);
        self.events.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::memory::{MemoryOutputLine, OutputRecord};
    use crate::codec::filter::XorFilter;
    use crossbeam_channel::Receiver;
    use std::collections::VecDeque;
    use std::time::Instant;

    /// Source that yields its bytes once, then reports exhaustion
    struct Feed(Arc<Mutex<VecDeque<u8>>>);

    impl ByteSource for Feed {
        fn read(&mut self, buf: &mut [u8]) -> usize {
            let mut bytes = self.0.lock();
            let n = buf.len().min(bytes.len());
            for (slot, byte) in buf.iter_mut().zip(bytes.drain(..n)) {
                *slot = byte;
            }
            n
        }
    }

    /// Source that never runs dry
    struct Endless;

    impl ByteSource for Endless {
        fn read(&mut self, buf: &mut [u8]) -> usize {
            thread::sleep(Duration::from_millis(1));
            buf.fill(0);
            buf.len()
        }
    }

    fn layout() -> ChunkLayout {
        ChunkLayout {
            chunk_bytes: 4,
            payload_len: 4,
            frame_size: 15,
        }
    }

    fn spawn(
        source: Box<dyn ByteSource>,
        chain: FilterChain,
    ) -> (PlaybackPipeline, OutputRecord, Receiver<MediaEvent>) {
        let record = OutputRecord::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let events: SharedSink<MediaEvent> = Arc::new(tx);
        let playback = PlaybackPipeline::spawn(
            Box::new(MemoryOutputLine::new(record.clone())),
            chain,
            source,
            layout(),
            events,
        )
        .unwrap();
        (playback, record, rx)
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_plays_payloads_and_gaps_then_finishes() {
        let bytes = vec![4, 1, 2, 3, 4, 0, 0, 0, 0, 0, 4, 5, 6, 7, 8];
        let feed = Feed(Arc::new(Mutex::new(bytes.into())));
        let (mut playback, record, rx) = spawn(Box::new(feed), FilterChain::new());

        assert_eq!(playback.state(), PlaybackState::Idle);
        playback.start_playing();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, MediaEvent::PlayingFinished);
        assert_eq!(record.snapshot(), vec![1, 2, 3, 4, 0, 0, 0, 0, 5, 6, 7, 8]);
        assert_eq!(playback.chunks_played(), 2);
        assert_eq!(playback.state(), PlaybackState::Stopped);
        assert!(!playback.is_playing());
        playback.close();
    }

    #[test]
    fn test_decodes_through_filters() {
        let bytes = vec![4, 0xF0, 0xF0, 0xF0, 0xF0];
        let feed = Feed(Arc::new(Mutex::new(bytes.into())));
        let chain = FilterChain::new().with(XorFilter::new(vec![0xFF]));
        let (mut playback, record, rx) = spawn(Box::new(feed), chain);

        playback.start_playing();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(record.snapshot(), vec![0x0F; 4]);
        playback.close();
    }

    #[test]
    fn test_stop_reports_stopped() {
        let (mut playback, record, rx) = spawn(Box::new(Endless), FilterChain::new());

        playback.start_playing();
        assert!(wait_until(|| !record.is_empty()));
        playback.stop_playing();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, MediaEvent::PlayingStopped);
        assert!(wait_until(|| playback.state() == PlaybackState::Stopped));
        playback.close();
    }

    #[test]
    fn test_stop_then_close_reports_stopped() {
        let (mut playback, record, rx) = spawn(Box::new(Endless), FilterChain::new());

        playback.start_playing();
        assert!(wait_until(|| !record.is_empty()));
        playback.stop_playing();
        playback.close();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events, vec![MediaEvent::PlayingStopped]);
        assert_eq!(playback.state(), PlaybackState::Stopped);
    }

    #[test]
    fn test_close_while_playing_reports_once() {
        let (mut playback, record, rx) = spawn(Box::new(Endless), FilterChain::new());

        playback.start_playing();
        assert!(wait_until(|| !record.is_empty()));
        playback.close();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events, vec![MediaEvent::PlayingFinished]);
    }

    #[test]
    fn test_restart_after_finished() {
        let queue = Arc::new(Mutex::new(VecDeque::from(vec![4, 1, 1, 1, 1])));
        let (mut playback, record, rx) = spawn(Box::new(Feed(queue.clone())), FilterChain::new());

        playback.start_playing();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), MediaEvent::PlayingFinished);

        queue.lock().extend([4, 2, 2, 2, 2]);
        playback.start_playing();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), MediaEvent::PlayingFinished);
        assert_eq!(record.snapshot(), vec![1, 1, 1, 1, 2, 2, 2, 2]);
        playback.close();
    }

    #[test]
    fn test_short_payload_reports_failure() {
        let feed = Feed(Arc::new(Mutex::new(VecDeque::from(vec![4, 1, 2]))));
        let (mut playback, _record, rx) = spawn(Box::new(feed), FilterChain::new());

        playback.start_playing();
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, MediaEvent::PlayingFailed { .. }));
        playback.close();
    }
}
