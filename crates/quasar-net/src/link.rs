//! Link state: one point-to-point association with a remote peer.
//!
//! A link is created either by a local `connect` call (initiator) or by an
//! arriving connect request (responder). It owns the three message channels,
//! the partial-send buffer for datagrams the OS would not take, and the
//! handshake/disconnect bookkeeping. The [`UdpPeer`](crate::peer::UdpPeer)
//! drives all transitions; this module is the state itself.

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::channels::{ChannelKind, IncomingChannel, OutgoingChannel};
use crate::messages::{ConnectRequestData, DisconnectReason};

/// Connectivity status of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Handshake in flight.
    Connecting,
    /// Fully established; messages flow.
    Connected,
    /// Disconnect seen; the link lingers through the grace period so
    /// in-flight packets can still be acknowledged.
    Disconnected,
}

/// Partial-send depth that triggers a one-shot warning.
pub const PARTIAL_SEND_WARN_BYTES: usize = 64 * 1024;

/// State for one remote peer association.
#[derive(Debug)]
pub struct Link {
    /// Remote address the link is bound to.
    pub(crate) addr: SocketAddr,
    pub(crate) status: LinkStatus,
    /// Remote peer GUID, 0 until the handshake reveals it.
    pub(crate) remote_guid: u64,
    /// True when the local peer initiated the connect.
    pub(crate) initiated_locally: bool,

    pub(crate) outgoing: [OutgoingChannel; 3],
    pub(crate) incoming: [IncomingChannel; 3],

    /// Datagrams the socket would not take, retried next tick.
    pub(crate) partial_send: VecDeque<Vec<u8>>,
    pub(crate) partial_bytes: usize,
    pub(crate) partial_warned: bool,

    /// Acks owed to the remote, flushed once per update per channel.
    pub(crate) pending_acks: [Vec<u32>; 3],

    pub(crate) created_ms: u64,
    pub(crate) last_recv_ms: u64,
    pub(crate) last_send_ms: u64,

    /// Initiator: the encoded connect-request datagram, resent until a
    /// response arrives.
    pub(crate) connect_request_datagram: Option<Vec<u8>>,
    /// Responder: the encoded connect-response datagram, resent when the
    /// initiator repeats its request.
    pub(crate) connect_response_datagram: Option<Vec<u8>>,
    /// Responder: the stashed request awaiting the application's verdict.
    pub(crate) pending_request: Option<ConnectRequestData>,
    pub(crate) last_connect_send_ms: u64,

    /// Set when a send error demands a disconnect on the next update.
    pub(crate) marked_for_disconnect: Option<DisconnectReason>,
    /// End of the post-disconnect grace period.
    pub(crate) grace_until_ms: Option<u64>,
}

impl Link {
    fn new(addr: SocketAddr, now_ms: u64, initiated_locally: bool) -> Self {
        Self {
            addr,
            status: LinkStatus::Connecting,
            remote_guid: 0,
            initiated_locally,
            outgoing: Default::default(),
            incoming: [
                IncomingChannel::new(ChannelKind::ReliableOrdered),
                IncomingChannel::new(ChannelKind::ReliableUnordered),
                IncomingChannel::new(ChannelKind::Unreliable),
            ],
            partial_send: VecDeque::new(),
            partial_bytes: 0,
            partial_warned: false,
            pending_acks: Default::default(),
            created_ms: now_ms,
            last_recv_ms: now_ms,
            last_send_ms: now_ms,
            connect_request_datagram: None,
            connect_response_datagram: None,
            pending_request: None,
            last_connect_send_ms: 0,
            marked_for_disconnect: None,
            grace_until_ms: None,
        }
    }

    /// A link created by a local `connect`.
    pub(crate) fn initiator(addr: SocketAddr, now_ms: u64) -> Self {
        Self::new(addr, now_ms, true)
    }

    /// A link created by an arriving connect request.
    pub(crate) fn responder(addr: SocketAddr, now_ms: u64) -> Self {
        Self::new(addr, now_ms, false)
    }

    /// Remote address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current status.
    pub fn status(&self) -> LinkStatus {
        self.status
    }

    /// Remote peer GUID, 0 until known.
    pub fn remote_guid(&self) -> u64 {
        self.remote_guid
    }

    /// Queues a datagram the socket refused, tracking buffered depth.
    pub(crate) fn defer_send(&mut self, datagram: Vec<u8>) {
        self.partial_bytes += datagram.len();
        self.partial_send.push_back(datagram);
        if self.partial_bytes > PARTIAL_SEND_WARN_BYTES && !self.partial_warned {
            self.partial_warned = true;
            tracing::warn!(
                addr = %self.addr,
                buffered = self.partial_bytes,
                "partial-send buffer exceeds 64 KiB"
            );
        }
    }

    /// Bytes currently waiting in the partial-send buffer.
    pub fn partial_send_depth(&self) -> usize {
        self.partial_bytes
    }

    /// Total unacknowledged reliable messages across channels.
    pub fn in_flight(&self) -> usize {
        self.outgoing.iter().map(OutgoingChannel::in_flight).sum()
    }

    pub(crate) fn outgoing_mut(&mut self, kind: ChannelKind) -> &mut OutgoingChannel {
        &mut self.outgoing[kind as usize]
    }

    pub(crate) fn incoming_mut(&mut self, kind: ChannelKind) -> &mut IncomingChannel {
        &mut self.incoming[kind as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn test_new_links_start_connecting() {
        assert_eq!(Link::initiator(addr(), 0).status(), LinkStatus::Connecting);
        assert_eq!(Link::responder(addr(), 0).status(), LinkStatus::Connecting);
    }

    #[test]
    fn test_defer_send_tracks_depth() {
        let mut link = Link::initiator(addr(), 0);
        link.defer_send(vec![0u8; 100]);
        link.defer_send(vec![0u8; 50]);
        assert_eq!(link.partial_send_depth(), 150);
        assert_eq!(link.partial_send.len(), 2);
    }

    #[test]
    fn test_partial_warning_fires_once() {
        let mut link = Link::initiator(addr(), 0);
        link.defer_send(vec![0u8; PARTIAL_SEND_WARN_BYTES + 1]);
        assert!(link.partial_warned);
    }
}
