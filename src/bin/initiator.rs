//! Initiator Application
//!
//! Dials a listener, then chats and streams voice until either side hangs up.
//!
//! Usage: `initiator [host] [port] [config.toml]`; host and port default to
//! the `[session]` section of the config.

use anyhow::{Context, Result};
use std::path::PathBuf;

mod common;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = common::load_config(args.get(2).map(PathBuf::from))?;
    common::init_logging(&config.log.level);

    let host = args.first().cloned().unwrap_or_else(|| config.session.host.clone());
    let port = match args.get(1) {
        Some(port) => port.parse().with_context(|| format!("invalid port {:?}", port))?,
        None => config.session.port,
    };

    tracing::info!("Starting Direct Telephony initiator, dialing {}:{}", host, port);

    let peer = common::Peer::new(config)?;
    peer.start_inbound()?;
    peer.session().connect(&host, port)?;

    peer.run().await
}
