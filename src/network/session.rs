//! Text session over TCP
//!
//! One peer listens, the other connects. Once attached, a sender thread
//! drains the outbox and a receiver thread reads lines, both sharing one
//! stream. Either side ends the session by writing the close sentinel; the
//! peer answers with its own sentinel.
//!
//! ```text
//!  sender:   outbox ──► "text\n" ... ──► sentinel ──► arrive ─┐
//!  receiver: "text\n" ──► events ... ──► sentinel ──► arrive ─┤
//!                                                             ▼
//!                                  last arriver: shutdown, Idle, one event
//! ```

use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::{resolve, Binding, SessionConfig};
use crate::error::{Error, NetworkError, Result, StateError};
use crate::events::{SessionEvent, SharedSink};

/// Longest line accepted from the peer, terminator included
const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    Initiator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Connecting,
    Connected,
    /// Sentinel sent or received, waiting for both threads to finish
    Closing,
}

struct Lifecycle {
    state: SessionState,
    role: Option<Role>,
    /// Bumped on every start so threads of an old session cannot reset a new one
    generation: u64,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    outbox: Option<Sender<String>>,
    stop_tx: Option<Sender<()>>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Lifecycle {
    fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            role: None,
            generation: 0,
            local: None,
            peer: None,
            outbox: None,
            stop_tx: None,
            cancel: None,
        }
    }
}

struct Inner {
    config: SessionConfig,
    events: SharedSink<SessionEvent>,
    lifecycle: Mutex<Lifecycle>,
}

impl Inner {
    /// Return to `Idle` if `generation` is still current
    fn reset(&self, generation: u64) {
        let mut lc = self.lifecycle.lock();
        if lc.generation != generation {
            return;
        }
        let next = lc.generation;
        *lc = Lifecycle::idle();
        lc.generation = next;
    }

    fn end(&self, generation: u64, event: SessionEvent) {
        self.reset(generation);
        self.events.emit(event);
    }

    fn is_cancelled(cancel: &AtomicBool) -> bool {
        cancel.load(Ordering::SeqCst)
    }

    /// Wire up a freshly connected stream and spawn its two threads.
    /// Returns false if the start was cancelled meanwhile.
    fn attach(
        self: &Arc<Self>,
        generation: u64,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> std::result::Result<bool, NetworkError> {
        let (outbox_tx, outbox_rx) = crossbeam_channel::unbounded::<String>();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let connection = Arc::new(Connection {
            stream,
            stop_tx: stop_tx.clone(),
            close: Mutex::new(CloseState::default()),
            generation,
        });

        {
            let mut lc = self.lifecycle.lock();
            let cancelled = lc.cancel.as_deref().map_or(true, Self::is_cancelled);
            if lc.generation != generation || cancelled {
                let _ = connection.stream.shutdown(Shutdown::Both);
                return Ok(false);
            }
            lc.state = SessionState::Connected;
            lc.peer = Some(peer);
            if lc.local.is_none() {
                lc.local = connection.stream.local_addr().ok();
            }
            lc.outbox = Some(outbox_tx);
            lc.stop_tx = Some(stop_tx);
            lc.cancel = None;
        }

        let sender = {
            let inner = self.clone();
            let connection = connection.clone();
            thread::Builder::new()
                .name("session-sender".to_string())
                .spawn(move || run_sender(inner, connection, outbox_rx, stop_rx))
        };
        if let Err(e) = sender {
            let _ = connection.stream.shutdown(Shutdown::Both);
            return Err(NetworkError::ConnectionFailed(e.to_string()));
        }

        let receiver = {
            let inner = self.clone();
            let connection = connection.clone();
            thread::Builder::new()
                .name("session-receiver".to_string())
                .spawn(move || run_receiver(inner, connection))
        };
        if let Err(e) = receiver {
            // The sender is already up: make it arrive in place of the receiver
            connection.fail(format!("receiver thread: {}", e));
            connection.signal_stop();
            connection.arrive(self, None);
        }

        tracing::info!("Session connected to {}", peer);
        Ok(true)
    }
}

#[derive(Default)]
struct CloseState {
    arrivals: u8,
    failure: Option<String>,
}

/// One attached stream shared by the sender and receiver threads
struct Connection {
    stream: TcpStream,
    stop_tx: Sender<()>,
    close: Mutex<CloseState>,
    generation: u64,
}

impl Connection {
    /// Record a failure unless an earlier one was already recorded
    fn fail(&self, reason: String) {
        let mut close = self.close.lock();
        if close.failure.is_none() {
            tracing::warn!("Session failure: {}", reason);
            close.failure = Some(reason);
        }
    }

    fn signal_stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Close barrier. The second arrival shuts the stream down, resets the
    /// service and emits the single terminal event.
    fn arrive(&self, inner: &Arc<Inner>, failure: Option<String>) {
        if let Some(reason) = failure {
            self.fail(reason);
        }

        let outcome = {
            let mut close = self.close.lock();
            close.arrivals += 1;
            if close.arrivals < 2 {
                return;
            }
            close.failure.take()
        };

        let _ = self.stream.shutdown(Shutdown::Both);
        match outcome {
            None => {
                tracing::info!("Session closed");
                inner.end(self.generation, SessionEvent::SessionFinished);
            }
            Some(reason) => {
                tracing::warn!("Session ended abruptly: {}", reason);
                inner.end(self.generation, SessionEvent::SessionFailed { reason });
            }
        }
    }
}

fn write_line(mut stream: &TcpStream, text: &str) -> std::io::Result<()> {
    let mut line = Vec::with_capacity(text.len() + 1);
    line.extend_from_slice(text.as_bytes());
    line.push(b'\n');
    stream.write_all(&line)?;
    stream.flush()
}

fn run_sender(
    inner: Arc<Inner>,
    connection: Arc<Connection>,
    outbox: Receiver<String>,
    stop_rx: Receiver<()>,
) {
    let mut failure = None;

    loop {
        // A pending stop wins over queued messages
        if !stop_rx.is_empty() {
            break;
        }
        select! {
            recv(outbox) -> message => match message {
                Ok(text) => {
                    if let Err(e) = write_line(&connection.stream, &text) {
                        failure = Some(NetworkError::SendFailed(e.to_string()).to_string());
                        break;
                    }
                    tracing::debug!("Sent {} bytes", text.len());
                }
                Err(_) => break,
            },
            recv(stop_rx) -> _ => break,
        }
    }

    if let Some(reason) = failure {
        connection.fail(reason);
        // Unblocks the receiver so it arrives too
        let _ = connection.stream.shutdown(Shutdown::Both);
        connection.arrive(&inner, None);
        return;
    }

    let discarded = outbox.try_iter().count();
    if discarded > 0 {
        tracing::debug!("Discarded {} unsent messages", discarded);
    }

    let result = write_line(&connection.stream, &inner.config.close_sentinel);
    let failure = result.err().map(|e| NetworkError::SendFailed(e.to_string()).to_string());
    if failure.is_some() {
        let _ = connection.stream.shutdown(Shutdown::Both);
    }
    connection.arrive(&inner, failure);
}

fn run_receiver(inner: Arc<Inner>, connection: Arc<Connection>) {
    let mut reader = BufReader::new(&connection.stream);
    let mut line = Vec::new();

    let failure = loop {
        line.clear();
        match (&mut reader).take(MAX_LINE_BYTES as u64).read_until(b'\n', &mut line) {
            Ok(0) => {
                break Some(NetworkError::ReceiveFailed("peer closed the stream without the close sentinel".to_string()));
            }
            Ok(n) if n == MAX_LINE_BYTES && line.last() != Some(&b'\n') => {
                break Some(NetworkError::ProtocolViolation(format!(
                    "line longer than {} bytes",
                    MAX_LINE_BYTES
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => break Some(NetworkError::ReceiveFailed(e.to_string())),
        }

        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }

        let text = match String::from_utf8(std::mem::take(&mut line)) {
            Ok(text) => text,
            Err(e) => break Some(NetworkError::ProtocolViolation(format!("invalid UTF-8: {}", e))),
        };

        if text == inner.config.close_sentinel {
            tracing::info!("Peer closed the session");
            let mut lc = inner.lifecycle.lock();
            if lc.generation == connection.generation && lc.state == SessionState::Connected {
                lc.state = SessionState::Closing;
            }
            break None;
        }

        inner.events.emit(SessionEvent::MessageReceived(text));
    };

    connection.signal_stop();
    connection.arrive(&inner, failure.map(|e| e.to_string()));
}

/// Peer-to-peer text session
pub struct SessionService {
    inner: Arc<Inner>,
}

impl SessionService {
    pub fn new(config: SessionConfig, events: SharedSink<SessionEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                events,
                lifecycle: Mutex::new(Lifecycle::idle()),
            }),
        }
    }

    /// Claim the service for a new session
    fn begin(&self, state: SessionState, role: Role) -> Result<(u64, Arc<AtomicBool>)> {
        let mut lc = self.inner.lifecycle.lock();
        if lc.state != SessionState::Idle {
            return Err(StateError::AlreadyLaunched("session").into());
        }
        let cancel = Arc::new(AtomicBool::new(false));
        lc.generation += 1;
        lc.state = state;
        lc.role = Some(role);
        lc.cancel = Some(cancel.clone());
        Ok((lc.generation, cancel))
    }

    fn spawn(&self, generation: u64, name: &str, body: impl FnOnce() + Send + 'static) -> Result<()> {
        thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map(|_| ())
            .map_err(|e| {
                self.inner.reset(generation);
                Error::Io(e)
            })
    }

    /// Wait for one peer on `binding`
    pub fn listen(&self, binding: Binding) -> Result<()> {
        let (generation, cancel) = self.begin(SessionState::Listening, Role::Listener)?;
        let inner = self.inner.clone();
        self.spawn(generation, "session-listen", move || {
            run_listener(inner, generation, cancel, binding)
        })
    }

    /// Dial `host:port`
    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        let (generation, cancel) = self.begin(SessionState::Connecting, Role::Initiator)?;
        let inner = self.inner.clone();
        let host = host.to_string();
        self.spawn(generation, "session-connect", move || {
            run_connector(inner, generation, cancel, host, port)
        })
    }

    /// Queue one line for the peer
    pub fn send(&self, text: &str) -> Result<()> {
        if text.contains(['\n', '\r']) {
            return Err(StateError::InvalidMessage("message contains a line break".to_string()).into());
        }
        if text == self.inner.config.close_sentinel {
            tracing::warn!("Outgoing message equals the close sentinel, the peer will close the session");
        }

        let lc = self.inner.lifecycle.lock();
        match (&lc.state, &lc.outbox) {
            (SessionState::Connected, Some(outbox)) => outbox
                .send(text.to_string())
                .map_err(|_| StateError::NotConnected.into()),
            _ => Err(StateError::NotConnected.into()),
        }
    }

    /// Cancel a pending start or begin the close handshake
    pub fn stop(&self) -> Result<()> {
        let mut lc = self.inner.lifecycle.lock();
        match lc.state {
            SessionState::Idle => Err(StateError::NotLaunched("session").into()),
            SessionState::Listening | SessionState::Connecting => {
                if let Some(cancel) = &lc.cancel {
                    cancel.store(true, Ordering::SeqCst);
                }
                tracing::info!("Cancelling pending {:?}", lc.state);
                Ok(())
            }
            SessionState::Connected => {
                lc.state = SessionState::Closing;
                if let Some(stop_tx) = &lc.stop_tx {
                    let _ = stop_tx.try_send(());
                }
                tracing::info!("Closing session");
                Ok(())
            }
            SessionState::Closing => Ok(()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lifecycle.lock().state
    }

    pub fn role(&self) -> Option<Role> {
        self.inner.lifecycle.lock().role
    }

    pub fn is_launched(&self) -> bool {
        self.state() != SessionState::Idle
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lifecycle.lock().local
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.lifecycle.lock().peer
    }
}

impl Drop for SessionService {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run_listener(inner: Arc<Inner>, generation: u64, cancel: Arc<AtomicBool>, binding: Binding) {
    let listener = match binding
        .resolve()
        .and_then(|addr| TcpListener::bind(addr).map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e))))
        .and_then(|listener| {
            listener
                .set_nonblocking(true)
                .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
            Ok(listener)
        }) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Listen failed: {}", e);
            inner.end(generation, SessionEvent::ListenFailed { reason: e.to_string() });
            return;
        }
    };

    let local = match listener.local_addr() {
        Ok(local) => local,
        Err(e) => {
            let reason = NetworkError::BindFailed(e.to_string()).to_string();
            inner.end(generation, SessionEvent::ListenFailed { reason });
            return;
        }
    };
    inner.lifecycle.lock().local = Some(local);
    tracing::info!("Listening for a peer on {}", local);
    inner.events.emit(SessionEvent::ListenStarted { local });

    let poll = inner.config.accept_poll();
    let (stream, peer) = loop {
        if Inner::is_cancelled(&cancel) {
            tracing::info!("Listen cancelled");
            inner.end(generation, SessionEvent::SessionFinished);
            return;
        }
        match listener.accept() {
            Ok(accepted) => break accepted,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                thread::sleep(poll);
            }
            Err(e) => {
                let reason = NetworkError::AcceptFailed(e.to_string()).to_string();
                tracing::error!("Accept failed: {}", reason);
                inner.end(generation, SessionEvent::ListenFailed { reason });
                return;
            }
        }
    };
    drop(listener);

    if let Err(e) = stream.set_nonblocking(false) {
        let reason = NetworkError::AcceptFailed(e.to_string()).to_string();
        inner.end(generation, SessionEvent::ListenFailed { reason });
        return;
    }

    match inner.attach(generation, stream, peer) {
        Ok(true) => inner.events.emit(SessionEvent::PeerAttached { peer }),
        Ok(false) => inner.end(generation, SessionEvent::SessionFinished),
        Err(e) => inner.end(generation, SessionEvent::ListenFailed { reason: e.to_string() }),
    }
}

fn run_connector(inner: Arc<Inner>, generation: u64, cancel: Arc<AtomicBool>, host: String, port: u16) {
    let remote = format!("{}:{}", host, port);
    inner.events.emit(SessionEvent::ConnectStarted { remote: remote.clone() });
    tracing::info!("Connecting to {}", remote);

    let result = resolve(&host, port).and_then(|addr| {
        dial(addr, inner.config.connect_timeout(), inner.config.accept_poll(), &cancel)
            .map(|stream| stream.map(|stream| (stream, addr)))
    });

    if Inner::is_cancelled(&cancel) {
        if let Ok(Some((stream, _))) = &result {
            let _ = stream.shutdown(Shutdown::Both);
        }
        tracing::info!("Connect cancelled");
        inner.end(generation, SessionEvent::SessionFinished);
        return;
    }

    let (stream, peer) = match result {
        Ok(Some(connected)) => connected,
        Ok(None) => {
            tracing::info!("Connect cancelled");
            inner.end(generation, SessionEvent::SessionFinished);
            return;
        }
        Err(e) => {
            tracing::error!("Connect failed: {}", e);
            inner.end(generation, SessionEvent::ConnectFailed { reason: e.to_string() });
            return;
        }
    };

    inner.events.emit(SessionEvent::ConnectSucceeded { peer });
    match inner.attach(generation, stream, peer) {
        Ok(true) => inner.events.emit(SessionEvent::ConnectFinished),
        Ok(false) => inner.end(generation, SessionEvent::SessionFinished),
        Err(e) => inner.end(generation, SessionEvent::ConnectFailed { reason: e.to_string() }),
    }
}

/// Dial `addr` with a deadline. Returns `None` as soon as `cancel` is set,
/// abandoning the pending connect.
fn dial(
    addr: SocketAddr,
    timeout: Duration,
    poll: Duration,
    cancel: &AtomicBool,
) -> std::result::Result<Option<TcpStream>, NetworkError> {
    let failed = |e: std::io::Error| NetworkError::ConnectionFailed(format!("{}: {}", addr, e));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .map_err(failed)?;

    let connected = runtime.block_on(async {
        let cancelled = async {
            while !Inner::is_cancelled(cancel) {
                tokio::time::sleep(poll).await;
            }
        };
        tokio::select! {
            connected = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)) => Some(connected),
            _ = cancelled => None,
        }
    });

    let Some(connected) = connected else {
        return Ok(None);
    };
    let stream = connected
        .map_err(|_| failed(ErrorKind::TimedOut.into()))?
        .map_err(failed)?
        .into_std()
        .map_err(failed)?;
    stream.set_nonblocking(false).map_err(failed)?;
    Ok(Some(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Receiver;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(5);

    fn service() -> (SessionService, Receiver<SessionEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (SessionService::new(SessionConfig::default(), Arc::new(tx)), rx)
    }

    fn next(rx: &Receiver<SessionEvent>) -> SessionEvent {
        rx.recv_timeout(WAIT).expect("no event")
    }

    fn loopback() -> Binding {
        Binding::fixed("127.0.0.1", 0)
    }

    #[test]
    fn test_idle_service_rejects_send_and_stop() {
        let (session, _rx) = service();
        assert!(matches!(session.send("hi"), Err(Error::State(StateError::NotConnected))));
        assert!(matches!(session.stop(), Err(Error::State(StateError::NotLaunched(_)))));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.role(), None);
    }

    #[test]
    fn test_multiline_message_rejected() {
        let (session, _rx) = service();
        assert!(matches!(
            session.send("two\nlines"),
            Err(Error::State(StateError::InvalidMessage(_)))
        ));
    }

    #[test]
    fn test_listen_twice_rejected() {
        let (session, rx) = service();
        session.listen(loopback()).unwrap();
        assert!(matches!(
            session.listen(loopback()),
            Err(Error::State(StateError::AlreadyLaunched(_)))
        ));
        assert!(matches!(session.connect("127.0.0.1", 1), Err(Error::State(_))));
        assert!(matches!(next(&rx), SessionEvent::ListenStarted { .. }));
        assert_eq!(session.role(), Some(Role::Listener));
        session.stop().unwrap();
        assert_eq!(next(&rx), SessionEvent::SessionFinished);
    }

    #[test]
    fn test_cancelled_listen_finishes_and_can_restart() {
        let (session, rx) = service();
        session.listen(loopback()).unwrap();
        let local = match next(&rx) {
            SessionEvent::ListenStarted { local } => local,
            other => panic!("unexpected {:?}", other),
        };
        assert_ne!(local.port(), 0);
        assert_eq!(session.local_addr(), Some(local));

        session.stop().unwrap();
        assert_eq!(next(&rx), SessionEvent::SessionFinished);
        assert_eq!(session.state(), SessionState::Idle);

        session.listen(loopback()).unwrap();
        assert!(matches!(next(&rx), SessionEvent::ListenStarted { .. }));
        session.stop().unwrap();
        assert_eq!(next(&rx), SessionEvent::SessionFinished);
    }

    #[test]
    fn test_listen_on_taken_port_fails() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let (session, rx) = service();
        session.listen(Binding::fixed("127.0.0.1", port)).unwrap();
        assert!(matches!(next(&rx), SessionEvent::ListenFailed { .. }));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_connect_refused_fails() {
        let port = {
            let scratch = TcpListener::bind("127.0.0.1:0").unwrap();
            scratch.local_addr().unwrap().port()
        };

        let (session, rx) = service();
        session.connect("127.0.0.1", port).unwrap();
        assert_eq!(
            next(&rx),
            SessionEvent::ConnectStarted {
                remote: format!("127.0.0.1:{}", port)
            }
        );
        assert!(matches!(next(&rx), SessionEvent::ConnectFailed { .. }));
        assert_eq!(session.state(), SessionState::Idle);
    }

    /// Listener that never accepts, with its backlog filled so new
    /// connects stay pending
    fn stalled_listener() -> (socket2::Socket, Vec<TcpStream>, SocketAddr) {
        use socket2::{Domain, Socket, Type};

        let listener = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        listener.bind(&bind.into()).unwrap();
        listener.listen(0).unwrap();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();

        let mut queued = Vec::new();
        for _ in 0..16 {
            match TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
                Ok(stream) => queued.push(stream),
                Err(_) => return (listener, queued, addr),
            }
        }
        panic!("backlog of {} never filled", addr);
    }

    #[test]
    fn test_stop_aborts_pending_connect() {
        let (_listener, _queued, addr) = stalled_listener();
        let config = SessionConfig {
            connect_timeout_ms: 30_000,
            ..SessionConfig::default()
        };
        let (tx, rx) = crossbeam_channel::unbounded();
        let session = SessionService::new(config, Arc::new(tx));

        session.connect("127.0.0.1", addr.port()).unwrap();
        assert!(matches!(next(&rx), SessionEvent::ConnectStarted { .. }));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(session.state(), SessionState::Connecting);

        let stopped_at = Instant::now();
        session.stop().unwrap();
        assert_eq!(next(&rx), SessionEvent::SessionFinished);
        assert!(stopped_at.elapsed() < Duration::from_secs(2));
        assert_eq!(session.state(), SessionState::Idle);

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_peer_without_sentinel_fails_session() {
        let (session, rx) = service();
        session.listen(loopback()).unwrap();
        let local = match next(&rx) {
            SessionEvent::ListenStarted { local } => local,
            other => panic!("unexpected {:?}", other),
        };

        let mut raw = TcpStream::connect(local).unwrap();
        assert!(matches!(next(&rx), SessionEvent::PeerAttached { .. }));
        raw.write_all(b"hello\r\n").unwrap();
        assert_eq!(next(&rx), SessionEvent::MessageReceived("hello".to_string()));

        drop(raw);
        assert!(matches!(next(&rx), SessionEvent::SessionFailed { .. }));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_oversized_line_fails_session() {
        let (session, rx) = service();
        session.listen(loopback()).unwrap();
        let local = match next(&rx) {
            SessionEvent::ListenStarted { local } => local,
            other => panic!("unexpected {:?}", other),
        };

        let mut raw = TcpStream::connect(local).unwrap();
        assert!(matches!(next(&rx), SessionEvent::PeerAttached { .. }));
        let _ = raw.write_all(&vec![b'a'; MAX_LINE_BYTES + 16]);

        match next(&rx) {
            SessionEvent::SessionFailed { reason } => assert!(reason.contains("longer than")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_raw_peer_sentinel_closes_gracefully() {
        let (session, rx) = service();
        session.listen(loopback()).unwrap();
        let local = match next(&rx) {
            SessionEvent::ListenStarted { local } => local,
            other => panic!("unexpected {:?}", other),
        };

        let raw = TcpStream::connect(local).unwrap();
        assert!(matches!(next(&rx), SessionEvent::PeerAttached { .. }));
        write_line(&raw, "bye soon").unwrap();
        write_line(&raw, crate::constants::DEFAULT_CLOSE_SENTINEL).unwrap();

        assert_eq!(next(&rx), SessionEvent::MessageReceived("bye soon".to_string()));
        assert_eq!(next(&rx), SessionEvent::SessionFinished);

        // The service answered with its own sentinel
        let mut reader = BufReader::new(&raw);
        let mut answer = String::new();
        reader.read_line(&mut answer).unwrap();
        assert_eq!(answer.trim_end(), crate::constants::DEFAULT_CLOSE_SENTINEL);
    }
}
