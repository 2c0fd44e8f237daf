//! Asynchronous notifications from the services
//!
//! Services never assume which thread a sink runs on: events are emitted
//! straight from the worker threads. Any `Fn(E)` closure or a
//! `crossbeam_channel::Sender<E>` can be used as a sink.

use std::net::SocketAddr;
use std::sync::Arc;

/// Text session lifecycle and traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Listening socket bound, waiting for a peer
    ListenStarted { local: SocketAddr },
    ListenFailed { reason: String },
    /// A peer was accepted and the session is live
    PeerAttached { peer: SocketAddr },
    ConnectStarted { remote: String },
    ConnectSucceeded { peer: SocketAddr },
    ConnectFailed { reason: String },
    /// Sender and receiver are running on the initiator side
    ConnectFinished,
    MessageReceived(String),
    /// Graceful end of the session, fired once per lifecycle
    SessionFinished,
    /// Abrupt end of the session, fired once per lifecycle
    SessionFailed { reason: String },
}

impl SessionEvent {
    /// Whether this event ends the current lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::ListenFailed { .. }
                | SessionEvent::ConnectFailed { .. }
                | SessionEvent::SessionFinished
                | SessionEvent::SessionFailed { .. }
        )
    }
}

/// Voice streaming lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    InboundListening { local: SocketAddr },
    InboundFailed { reason: String },
    InboundFinished,
    /// First datagram left the outbound socket
    OutboundEstablished { remote: SocketAddr },
    OutboundFailed { reason: String },
    OutboundFinished,
    /// Both directions are down
    FullyFinished,
    RecordingFailed { reason: String },
    PlayingFailed { reason: String },
    /// Playback left the playing state because it was told to
    PlayingStopped,
    /// Playback ran out of data
    PlayingFinished,
}

/// Receiver of service events
pub trait EventSink<E>: Send + Sync {
    fn emit(&self, event: E);
}

impl<E, F> EventSink<E> for F
where
    F: Fn(E) + Send + Sync,
{
    fn emit(&self, event: E) {
        self(event)
    }
}

impl<E: Send> EventSink<E> for crossbeam_channel::Sender<E> {
    fn emit(&self, event: E) {
        // Nobody listening is not an error for the service
        let _ = self.send(event);
    }
}

pub type SharedSink<E> = Arc<dyn EventSink<E>>;

/// Sink that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink<SessionEvent> for LogSink {
    fn emit(&self, event: SessionEvent) {
        match &event {
            SessionEvent::ListenFailed { reason }
            | SessionEvent::ConnectFailed { reason }
            | SessionEvent::SessionFailed { reason } => {
                tracing::warn!("Session event: {:?} ({})", event, reason)
            }
            SessionEvent::MessageReceived(_) => tracing::debug!("Session event: {:?}", event),
            _ => tracing::info!("Session event: {:?}", event),
        }
    }
}

impl EventSink<MediaEvent> for LogSink {
    fn emit(&self, event: MediaEvent) {
        match &event {
            MediaEvent::InboundFailed { .. }
            | MediaEvent::OutboundFailed { .. }
            | MediaEvent::RecordingFailed { .. }
            | MediaEvent::PlayingFailed { .. } => tracing::warn!("Media event: {:?}", event),
            _ => tracing::info!("Media event: {:?}", event),
        }
    }
}
