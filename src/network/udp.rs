//! UDP socket setup

use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::NetworkError;

/// Create a blocking UDP socket bound to `bind_addr`.
///
/// Reads time out after `read_timeout` so loops can check their stop flags.
/// A `buffer_size` of 0 keeps the OS defaults.
pub fn create_socket(
    bind_addr: SocketAddr,
    buffer_size: usize,
    read_timeout: Duration,
) -> Result<UdpSocket, NetworkError> {
    let domain = if bind_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    if buffer_size > 0 {
        if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
            tracing::warn!("Could not set receive buffer to {}: {}", buffer_size, e);
        }
        if let Err(e) = socket.set_send_buffer_size(buffer_size) {
            tracing::warn!("Could not set send buffer to {}: {}", buffer_size, e);
        }
    }

    socket
        .set_read_timeout(Some(read_timeout))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket
        .bind(&bind_addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", bind_addr, e)))?;

    let socket: UdpSocket = socket.into();
    tracing::debug!("UDP socket bound to {:?}", socket.local_addr().ok());
    Ok(socket)
}

/// Whether a socket error only means the read timed out
pub fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Unspecified bind address matching the family of `remote`
pub fn unspecified_for(remote: &SocketAddr) -> SocketAddr {
    if remote.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    }
}
