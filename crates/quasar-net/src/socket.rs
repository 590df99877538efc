//! UDP socket construction.
//!
//! The transport runs on a single non-blocking UDP socket pumped from the
//! engine tick. The socket is built through `socket2` so broadcast (for LAN
//! host discovery) and address reuse can be set before binding, then handed
//! over as a plain [`std::net::UdpSocket`].

use std::net::{IpAddr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::TransportError;

/// Socket options applied before binding.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Enable `SO_BROADCAST` so LAN discovery can probe the broadcast
    /// address. Default: true.
    pub broadcast: bool,
    /// Enable `SO_REUSEADDR` on the bound socket. Default: true except on
    /// Windows, where reuse semantics differ.
    pub reuse_addr: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            broadcast: true,
            reuse_addr: !cfg!(target_os = "windows"),
        }
    }
}

/// Builds a non-blocking UDP socket bound to `addr`.
pub fn create_socket(addr: SocketAddr, config: &SocketConfig) -> Result<UdpSocket, TransportError> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(open_error)?;

    if config.reuse_addr {
        socket.set_reuse_address(true).map_err(open_error)?;
    }
    if config.broadcast {
        socket.set_broadcast(true).map_err(open_error)?;
    }
    socket.set_nonblocking(true).map_err(open_error)?;
    socket.bind(&addr.into()).map_err(open_error)?;

    Ok(socket.into())
}

/// Binds to the first free port in `port .. port + retries + 1`.
///
/// A `port` of 0 asks the OS for an ephemeral port and never retries.
pub fn bind_with_retries(
    ip: IpAddr,
    port: u16,
    retries: u16,
    config: &SocketConfig,
) -> Result<UdpSocket, TransportError> {
    let mut last_err = None;
    let attempts = if port == 0 { 0 } else { retries };
    for offset in 0..=attempts {
        let candidate = SocketAddr::new(ip, port.saturating_add(offset));
        match create_socket(candidate, config) {
            Ok(socket) => {
                if offset > 0 {
                    tracing::info!(port = candidate.port(), "bound after port retry");
                }
                return Ok(socket);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or(TransportError::SocketOpen {
        message: "no bind attempts made".to_string(),
        code: None,
    }))
}

fn open_error(e: std::io::Error) -> TransportError {
    TransportError::SocketOpen {
        message: e.to_string(),
        code: e.raw_os_error(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_ephemeral_bind() {
        let socket = bind_with_retries(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            0,
            0,
            &SocketConfig::default(),
        )
        .unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_retry_walks_past_taken_port() {
        let config = SocketConfig {
            // Reuse would let the second bind share the port and defeat the test.
            reuse_addr: false,
            ..Default::default()
        };
        let first = bind_with_retries(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 0, &config).unwrap();
        let taken = first.local_addr().unwrap().port();

        let second = bind_with_retries(IpAddr::V4(Ipv4Addr::LOCALHOST), taken, 4, &config).unwrap();
        let got = second.local_addr().unwrap().port();
        assert_ne!(got, taken);
        assert!(got > taken && got <= taken + 4, "port {got} outside retry window");
    }

    #[test]
    fn test_socket_is_nonblocking() {
        let socket = bind_with_retries(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            0,
            0,
            &SocketConfig::default(),
        )
        .unwrap();
        let mut buf = [0u8; 16];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
