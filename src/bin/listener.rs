//! Listener Application
//!
//! Waits for one peer on the configured session address, then chats and
//! streams voice until either side hangs up.
//!
//! Usage: `listener [config.toml]`

use anyhow::Result;
use std::path::PathBuf;

mod common;

#[tokio::main]
async fn main() -> Result<()> {
    let config = common::load_config(std::env::args().nth(1).map(PathBuf::from))?;
    common::init_logging(&config.log.level);

    tracing::info!("Starting Direct Telephony listener");

    let peer = common::Peer::new(config)?;
    peer.start_inbound()?;

    let binding = peer.config().session.binding(false);
    peer.session().listen(binding)?;

    peer.run().await
}
