//! Console plumbing shared by the listener and initiator binaries

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use direct_telephony::{
    audio::CpalBackend,
    codec::{AesGcmFilter, CipherKey, FilterChain},
    config::{AppConfig, Binding},
    events::{EventSink, LogSink, MediaEvent, SessionEvent},
    network::{MediaService, SessionService},
};

/// How long to wait for media to wind down after the session ends
const MEDIA_SHUTDOWN_WAIT: Duration = Duration::from_secs(2);

pub fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the given file, or the platform default location
pub fn load_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load(&path).with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::load_or_default().context("loading default config")?,
    };
    Ok(config)
}

/// Both services of one peer plus their event streams
pub struct Peer {
    config: AppConfig,
    session: SessionService,
    session_rx: UnboundedReceiver<SessionEvent>,
    media: Option<MediaService>,
    media_rx: UnboundedReceiver<MediaEvent>,
}

impl Peer {
    /// Build the services. Voice is only enabled when a key is configured.
    pub fn new(config: AppConfig) -> Result<Self> {
        let (session_tx, session_rx) = unbounded_channel();
        let session = SessionService::new(
            config.session.clone(),
            Arc::new(move |event: SessionEvent| {
                LogSink.emit(event.clone());
                let _ = session_tx.send(event);
            }),
        );

        let (media_tx, media_rx) = unbounded_channel();
        let media = match &config.cipher.key {
            Some(hex) => {
                let key = CipherKey::from_hex(hex).context("cipher.key")?;
                let filters = FilterChain::new().with(AesGcmFilter::new(&key));
                let media = MediaService::new(
                    config.media.clone(),
                    config.audio.clone(),
                    filters,
                    Arc::new(CpalBackend),
                    Arc::new(move |event: MediaEvent| {
                        LogSink.emit(event.clone());
                        let _ = media_tx.send(event);
                    }),
                )?;
                Some(media)
            }
            None => {
                println!("No cipher.key configured, voice is disabled. A fresh key:");
                println!("  [cipher]\n  key = \"{}\"", CipherKey::generate().to_hex());
                None
            }
        };

        Ok(Self {
            config,
            session,
            session_rx,
            media,
            media_rx,
        })
    }

    pub fn session(&self) -> &SessionService {
        &self.session
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Open the inbound voice socket ahead of the session
    pub fn start_inbound(&self) -> Result<()> {
        if let Some(media) = &self.media {
            media.start_inbound(self.config.media.server.binding())?;
            if let Some(local) = media.inbound_addr() {
                println!("Voice inbound on {}", local);
            }
        }
        Ok(())
    }

    fn start_outbound(&self, remote_host: &str) {
        let Some(media) = &self.media else {
            return;
        };
        let port = self.config.media.client.port;
        if let Err(e) = media.start_outbound(remote_host, port, Binding::Auto) {
            tracing::error!("Could not start voice to {}:{}: {}", remote_host, port, e);
        }
    }

    /// Forward stdin to the peer until the session ends
    pub async fn run(mut self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;

        println!("Type a message and press Enter, /quit to hang up");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    println!("Hanging up");
                    if self.session.stop().is_err() {
                        break;
                    }
                }
                line = lines.next_line(), if stdin_open => {
                    match line? {
                        Some(line) if line.trim() == "/quit" => {
                            if self.session.stop().is_err() {
                                break;
                            }
                        }
                        Some(line) => {
                            if let Err(e) = self.session.send(&line) {
                                println!("! {}", e);
                            }
                        }
                        None => {
                            stdin_open = false;
                            let _ = self.session.stop();
                        }
                    }
                }
                Some(event) = self.session_rx.recv() => {
                    if self.on_session_event(event) {
                        break;
                    }
                }
                Some(event) = self.media_rx.recv() => on_media_event(event),
            }
        }

        self.shutdown_media().await;
        Ok(())
    }

    /// Returns true once the session is over
    fn on_session_event(&self, event: SessionEvent) -> bool {
        match &event {
            SessionEvent::ListenStarted { local } => println!("Waiting for a peer on {}", local),
            SessionEvent::PeerAttached { peer } => {
                println!("Peer {} connected", peer);
                self.start_outbound(&peer.ip().to_string());
            }
            SessionEvent::ConnectSucceeded { peer } => {
                println!("Connected to {}", peer);
                self.start_outbound(&peer.ip().to_string());
            }
            SessionEvent::MessageReceived(text) => println!("peer> {}", text),
            SessionEvent::SessionFinished => println!("Session closed"),
            SessionEvent::SessionFailed { reason }
            | SessionEvent::ListenFailed { reason }
            | SessionEvent::ConnectFailed { reason } => println!("Session failed: {}", reason),
            _ => {}
        }
        event.is_terminal()
    }

    async fn shutdown_media(&mut self) {
        let Some(media) = &self.media else {
            return;
        };
        if media.stop().is_err() {
            return;
        }
        let events = &mut self.media_rx;
        let wait = async {
            while let Some(event) = events.recv().await {
                if event == MediaEvent::FullyFinished {
                    break;
                }
            }
        };
        if tokio::time::timeout(MEDIA_SHUTDOWN_WAIT, wait).await.is_err() {
            tracing::warn!("Voice did not shut down in time");
        }
    }
}

fn on_media_event(event: MediaEvent) {
    match event {
        MediaEvent::OutboundEstablished { remote } => println!("Voice connected to {}", remote),
        MediaEvent::RecordingFailed { reason } | MediaEvent::PlayingFailed { reason } => {
            println!("Voice stopped: {}", reason)
        }
        _ => {}
    }
}
