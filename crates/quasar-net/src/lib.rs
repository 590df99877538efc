//! UDP transport: the socket, point-to-point links with reliable message
//! channels, the connect/disconnect handshake, and tracked host probes.

pub mod channels;
pub mod link;
pub mod messages;
pub mod peer;
pub mod ping;
pub mod socket;

pub use channels::{Arrival, ChannelKind};
pub use link::{Link, LinkStatus, PARTIAL_SEND_WARN_BYTES};
pub use messages::{
    ConnectRequestData, ConnectResponseData, DisconnectNoticeData, DisconnectReason, HostPingData,
    HostPongData, HostPublishData, HostRecordEntry, HostRecordListData, Message, MessageError,
    MessageType, read_socket_addr, write_socket_addr,
};
pub use peer::{TransportEvent, TransportStats, UdpPeer, UdpPeerConfig};
pub use ping::{HostPingKind, PingEvent, PingManager, make_pong};
pub use socket::{SocketConfig, bind_with_retries, create_socket};

/// Transport-layer failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The socket could not be opened or bound.
    #[error("socket open failed: {message}")]
    SocketOpen {
        message: String,
        /// OS error code, when one was reported.
        code: Option<i32>,
    },

    /// A connect was issued while one is already pending or established.
    #[error("already connecting or connected to {0}")]
    DuplicateConnect(std::net::SocketAddr),

    /// No link exists for the address.
    #[error("no link to {0}")]
    NoSuchLink(std::net::SocketAddr),

    /// The link exists but is not connected.
    #[error("link to {0} is not connected")]
    NotConnected(std::net::SocketAddr),

    /// `respond_connect` was called without a pending inbound request.
    #[error("no pending connect request from {0}")]
    NoPendingRequest(std::net::SocketAddr),

    /// The encoded message exceeds the transport maximum.
    #[error("message of {size} bytes exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },
}
