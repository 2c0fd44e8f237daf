//! Voice streaming over UDP
//!
//! Two directions, launched separately:
//!
//! ```text
//!  inbound:  socket ──► jitter FrameRing ──► JitterReader ──► PlaybackPipeline
//!  outbound: CapturePipeline ──► FrameAssembler ──► outbound FrameRing ──► socket
//! ```
//!
//! Each direction runs on its own thread and owns its pipeline. Every
//! datagram is one frame of `ChunkLayout::frame_size` bytes.

use bytes::Bytes;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use super::udp::{create_socket, is_timeout, unspecified_for};
use crate::audio::buffer::{create_shared_ring, FrameAssembler, JitterReader, JitterRelease, SharedFrameRing};
use crate::audio::capture::{CapturePipeline, CaptureState};
use crate::audio::line::AudioBackend;
use crate::audio::playback::PlaybackPipeline;
use crate::codec::chunk::ChunkLayout;
use crate::codec::filter::FilterChain;
use crate::config::{resolve, AudioConfig, Binding, MediaConfig};
use crate::error::{Error, NetworkError, Result, StateError};
use crate::events::{MediaEvent, SharedSink};

/// Longest the outbound side waits for capture to drain on stop
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    /// Datagrams dropped because their size did not match the frame size
    pub frames_rejected: u64,
    pub jitter_overflows: usize,
    pub jitter_underruns: usize,
    pub outbound_overflows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

struct Running {
    id: u64,
    stop: Arc<AtomicBool>,
}

#[derive(Default)]
struct Launch {
    inbound: Option<Running>,
    outbound: Option<Running>,
}

impl Launch {
    fn slot(&mut self, direction: Direction) -> &mut Option<Running> {
        match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        }
    }
}

struct Inner {
    media: MediaConfig,
    audio: AudioConfig,
    filters: FilterChain,
    layout: ChunkLayout,
    backend: Arc<dyn AudioBackend>,
    events: SharedSink<MediaEvent>,
    launch: Mutex<Launch>,
    next_id: AtomicU64,
    jitter: SharedFrameRing,
    outbound: SharedFrameRing,
    inbound_addr: Mutex<Option<SocketAddr>>,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_rejected: AtomicU64,
}

impl Inner {
    fn stop(&self) -> Result<()> {
        let launch = self.launch.lock();
        if launch.inbound.is_none() && launch.outbound.is_none() {
            return Err(StateError::NotLaunched("media service").into());
        }
        for running in [&launch.inbound, &launch.outbound].into_iter().flatten() {
            running.stop.store(true, Ordering::SeqCst);
        }
        tracing::info!("Stopping media");
        Ok(())
    }

    /// Sink handed to the pipelines: forwards everything, stops on failure
    fn pipeline_sink(self: &Arc<Self>) -> SharedSink<MediaEvent> {
        let inner: Weak<Inner> = Arc::downgrade(self);
        Arc::new(move |event: MediaEvent| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let failed = matches!(
                event,
                MediaEvent::RecordingFailed { .. } | MediaEvent::PlayingFailed { .. }
            );
            inner.events.emit(event);
            if failed {
                let _ = inner.stop();
            }
        })
    }

    /// Clear a direction's slot and report `FullyFinished` if it was the last
    fn finish(&self, direction: Direction, id: u64) {
        let fully_finished = {
            let mut launch = self.launch.lock();
            let slot = launch.slot(direction);
            if slot.as_ref().map(|r| r.id) == Some(id) {
                *slot = None;
            }
            launch.inbound.is_none() && launch.outbound.is_none()
        };
        if fully_finished {
            tracing::info!("Media fully finished");
            self.events.emit(MediaEvent::FullyFinished);
        }
    }

    fn spawn_direction(
        self: &Arc<Self>,
        launch: &mut Launch,
        direction: Direction,
        name: &str,
        body: impl FnOnce(Arc<Inner>, u64, Arc<AtomicBool>) + Send + 'static,
    ) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stop = Arc::new(AtomicBool::new(false));
        let inner = self.clone();
        let thread_stop = stop.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(inner, id, thread_stop))
            .map_err(Error::Io)?;
        *launch.slot(direction) = Some(Running { id, stop });
        Ok(())
    }
}

/// Encrypted voice in both directions
pub struct MediaService {
    inner: Arc<Inner>,
}

impl MediaService {
    /// Fails if one filtered chunk cannot be framed within `max_packet_size`
    pub fn new(
        media: MediaConfig,
        audio: AudioConfig,
        filters: FilterChain,
        backend: Arc<dyn AudioBackend>,
        events: SharedSink<MediaEvent>,
    ) -> Result<Self> {
        let layout = ChunkLayout::measure(&filters, audio.chunk_bytes, media.max_packet_size)?;
        tracing::info!(
            "Media layout: {} raw bytes per chunk, {}-byte slots, {} per {}-byte frame",
            layout.chunk_bytes,
            layout.slot_len(),
            layout.slots_per_frame(),
            layout.frame_size
        );

        Ok(Self {
            inner: Arc::new(Inner {
                jitter: create_shared_ring(media.jitter_capacity),
                outbound: create_shared_ring(media.outbound_capacity),
                media,
                audio,
                filters,
                layout,
                backend,
                events,
                launch: Mutex::new(Launch::default()),
                next_id: AtomicU64::new(0),
                inbound_addr: Mutex::new(None),
                frames_received: AtomicU64::new(0),
                frames_sent: AtomicU64::new(0),
                frames_rejected: AtomicU64::new(0),
            }),
        })
    }

    /// Bind the inbound socket and start receiving into the jitter buffer.
    /// Playback starts with the first datagram.
    pub fn start_inbound(&self, binding: Binding) -> Result<()> {
        let inner = &self.inner;
        let mut launch = inner.launch.lock();
        if launch.inbound.is_some() {
            return Err(StateError::AlreadyLaunched("inbound media").into());
        }

        let bind_addr = binding.resolve()?;
        let socket = create_socket(bind_addr, inner.media.socket_buffer_size, inner.media.poll_interval())?;
        let local = socket.local_addr()?;

        let line = inner.backend.output_line(&inner.audio)?;
        inner.jitter.clear();
        inner.jitter.reset_stats();
        let reader = JitterReader::new(
            inner.jitter.clone(),
            inner.layout.frame_size,
            inner.media.exhaustion_frames,
        );
        let release = reader.release_handle();
        let playback = PlaybackPipeline::spawn(
            line,
            inner.filters.clone(),
            Box::new(reader),
            inner.layout,
            inner.pipeline_sink(),
        )?;

        inner.spawn_direction(&mut launch, Direction::Inbound, "media-inbound", move |inner, id, stop| {
            run_inbound(inner, id, stop, socket, playback, release)
        })?;
        drop(launch);

        *inner.inbound_addr.lock() = Some(local);
        tracing::info!("Inbound media listening on {}", local);
        inner.events.emit(MediaEvent::InboundListening { local });
        Ok(())
    }

    /// Start capturing and sending to `remote_host:remote_port`.
    /// Inbound must already be running.
    pub fn start_outbound(&self, remote_host: &str, remote_port: u16, binding: Binding) -> Result<()> {
        let inner = &self.inner;
        let mut launch = inner.launch.lock();
        if launch.outbound.is_some() {
            return Err(StateError::AlreadyLaunched("outbound media").into());
        }
        if launch.inbound.is_none() {
            return Err(StateError::InboundNotLaunched.into());
        }

        let remote = resolve(remote_host, remote_port)?;
        let bind_addr = match binding {
            Binding::Auto => unspecified_for(&remote),
            fixed => fixed.resolve()?,
        };
        let socket = create_socket(bind_addr, inner.media.socket_buffer_size, inner.media.poll_interval())?;

        let line = inner.backend.input_line(&inner.audio)?;
        inner.outbound.clear();
        inner.outbound.reset_stats();
        let assembler = FrameAssembler::new(inner.outbound.clone(), inner.layout.frame_size);
        let capture = CapturePipeline::spawn(
            line,
            inner.filters.clone(),
            Box::new(assembler),
            inner.layout,
            inner.pipeline_sink(),
        )?;
        capture.start_recording();

        inner.spawn_direction(&mut launch, Direction::Outbound, "media-outbound", move |inner, id, stop| {
            run_outbound(inner, id, stop, socket, remote, capture)
        })?;
        tracing::info!("Outbound media sending to {}", remote);
        Ok(())
    }

    /// Interrupt every running direction. Completion is reported through events.
    pub fn stop(&self) -> Result<()> {
        self.inner.stop()
    }

    pub fn is_launched(&self) -> bool {
        let launch = self.inner.launch.lock();
        launch.inbound.is_some() || launch.outbound.is_some()
    }

    pub fn is_inbound_launched(&self) -> bool {
        self.inner.launch.lock().inbound.is_some()
    }

    pub fn is_outbound_launched(&self) -> bool {
        self.inner.launch.lock().outbound.is_some()
    }

    /// Address the inbound socket is bound to, while it runs
    pub fn inbound_addr(&self) -> Option<SocketAddr> {
        *self.inner.inbound_addr.lock()
    }

    pub fn layout(&self) -> ChunkLayout {
        self.inner.layout
    }

    pub fn stats(&self) -> MediaStats {
        let inner = &self.inner;
        MediaStats {
            frames_received: inner.frames_received.load(Ordering::Relaxed),
            frames_sent: inner.frames_sent.load(Ordering::Relaxed),
            frames_rejected: inner.frames_rejected.load(Ordering::Relaxed),
            jitter_overflows: inner.jitter.overflow_count(),
            jitter_underruns: inner.jitter.underrun_count(),
            outbound_overflows: inner.outbound.overflow_count(),
        }
    }
}

impl Drop for MediaService {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run_inbound(
    inner: Arc<Inner>,
    id: u64,
    stop: Arc<AtomicBool>,
    socket: UdpSocket,
    mut playback: PlaybackPipeline,
    release: JitterRelease,
) {
    let frame_size = inner.layout.frame_size;
    let mut buf = vec![0u8; inner.media.max_packet_size.max(frame_size) + 1];

    let result = loop {
        if stop.load(Ordering::SeqCst) {
            break Ok(());
        }
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                if n != frame_size {
                    inner.frames_rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Dropped {}-byte datagram from {}, expected {}", n, from, frame_size);
                    continue;
                }
                inner.jitter.push(Bytes::copy_from_slice(&buf[..n]));
                inner.frames_received.fetch_add(1, Ordering::Relaxed);
                if !playback.is_playing() {
                    tracing::debug!("Audio arriving from {}, starting playback", from);
                    playback.start_playing();
                }
            }
            Err(e) if is_timeout(e.kind()) || e.kind() == ErrorKind::Interrupted => {}
            // Unconnected UDP sockets on some platforms report ICMP errors of earlier sends
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {}
            Err(e) => {
                if stop.load(Ordering::SeqCst) {
                    break Ok(());
                }
                break Err(NetworkError::ReceiveFailed(e.to_string()));
            }
        }
    };

    playback.stop_playing();
    release.release();
    playback.close();
    inner.jitter.clear();
    drop(socket);
    *inner.inbound_addr.lock() = None;

    match result {
        Ok(()) => {
            tracing::info!("Inbound media finished");
            inner.events.emit(MediaEvent::InboundFinished);
        }
        Err(e) => {
            tracing::error!("Inbound media failed: {}", e);
            inner.events.emit(MediaEvent::InboundFailed { reason: e.to_string() });
        }
    }
    inner.finish(Direction::Inbound, id);
}

fn run_outbound(
    inner: Arc<Inner>,
    id: u64,
    stop: Arc<AtomicBool>,
    socket: UdpSocket,
    remote: SocketAddr,
    mut capture: CapturePipeline,
) {
    let poll = inner.media.poll_interval();
    let mut established = false;

    let send = |frame: &[u8], established: &mut bool| -> std::result::Result<(), NetworkError> {
        socket
            .send_to(frame, remote)
            .map_err(|e| NetworkError::SendFailed(format!("{}: {}", remote, e)))?;
        inner.frames_sent.fetch_add(1, Ordering::Relaxed);
        if !*established {
            *established = true;
            tracing::info!("Outbound media established to {}", remote);
            inner.events.emit(MediaEvent::OutboundEstablished { remote });
        }
        Ok(())
    };

    let mut result = loop {
        if stop.load(Ordering::SeqCst) {
            break Ok(());
        }
        if let Some(frame) = inner.outbound.pop_timeout(poll) {
            if let Err(e) = send(&frame, &mut established) {
                break Err(e);
            }
        }
    };

    // Let capture drain its line, then send what it produced
    capture.stop_recording();
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while capture.state() != CaptureState::Idle && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    capture.close();
    if result.is_ok() {
        while let Some(frame) = inner.outbound.try_pop() {
            if let Err(e) = send(&frame, &mut established) {
                result = Err(e);
                break;
            }
        }
    }
    inner.outbound.clear();
    drop(socket);

    match result {
        Ok(()) => {
            tracing::info!("Outbound media finished, {} chunks captured", capture.chunks_captured());
            inner.events.emit(MediaEvent::OutboundFinished);
        }
        Err(e) => {
            tracing::error!("Outbound media failed: {}", e);
            inner.events.emit(MediaEvent::OutboundFailed { reason: e.to_string() });
        }
    }
    inner.finish(Direction::Outbound, id);
}
