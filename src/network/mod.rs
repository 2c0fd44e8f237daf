//! Network subsystem: TCP text session and UDP voice transport

pub mod media;
pub mod session;
pub mod udp;

pub use media::{MediaService, MediaStats};
pub use session::{Role, SessionService, SessionState};
pub use udp::create_socket;
