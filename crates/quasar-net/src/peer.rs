//! The tick-driven UDP transport peer.
//!
//! One [`UdpPeer`] owns one non-blocking UDP socket and every link riding on
//! it. Nothing here blocks: `update` pumps the socket dry, advances handshake
//! and resend timers, and queues outbound datagrams the OS refuses into
//! per-link partial-send buffers. All outcomes surface as
//! [`TransportEvent`]s drained by the owner each tick.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use rustc_hash::{FxHashMap, FxHashSet};

use quasar_bitstream::BitStream;

use crate::TransportError;
use crate::channels::{Arrival, ChannelKind, PendingSend};
use crate::link::{Link, LinkStatus};
use crate::messages::{
    ConnectRequestData, ConnectResponseData, DisconnectNoticeData, DisconnectReason, Message,
    MessageType,
};
use crate::socket::{SocketConfig, bind_with_retries};

/// Transport tuning knobs.
#[derive(Debug, Clone)]
pub struct UdpPeerConfig {
    /// Extra ports to try past the requested one when binding.
    pub port_retries: u16,
    /// Socket options.
    pub socket: SocketConfig,
    /// Interval between connect-request resends while Connecting.
    pub connect_resend_interval_ms: u64,
    /// Give-up threshold for an unanswered handshake.
    pub connect_timeout_ms: u64,
    /// Interval between reliable-message resends.
    pub resend_interval_ms: u64,
    /// A connected link with no inbound traffic for this long times out.
    pub idle_timeout_ms: u64,
    /// Keepalive interval on otherwise-quiet connected links.
    pub heartbeat_interval_ms: u64,
    /// How long a disconnected link lingers so in-flight packets can still
    /// be acknowledged.
    pub disconnect_grace_ms: u64,
    /// Largest encoded datagram the transport will send.
    pub max_message_bytes: usize,
}

impl Default for UdpPeerConfig {
    fn default() -> Self {
        Self {
            port_retries: 8,
            socket: SocketConfig::default(),
            connect_resend_interval_ms: 500,
            connect_timeout_ms: 10_000,
            resend_interval_ms: 300,
            idle_timeout_ms: 10_000,
            heartbeat_interval_ms: 1_000,
            disconnect_grace_ms: 1_000,
            max_message_bytes: 1_200,
        }
    }
}

/// Counters surfaced for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// Everything the transport reports upward, drained once per tick.
#[derive(Debug)]
pub enum TransportEvent {
    /// A remote peer asked to connect; answer with
    /// [`UdpPeer::respond_connect`].
    ConnectRequested {
        from: SocketAddr,
        request: ConnectRequestData,
    },
    /// Our outbound connect was answered.
    ConnectResponded {
        from: SocketAddr,
        response: ConnectResponseData,
    },
    /// A link reached Connected (fires on both sides).
    LinkConnected { addr: SocketAddr, remote_guid: u64 },
    /// A link went down. Fires exactly once per link.
    LinkDisconnected {
        addr: SocketAddr,
        reason: DisconnectReason,
        payload: BitStream,
    },
    /// A channeled message arrived on a link.
    MessageReceived { from: SocketAddr, message: Message },
    /// A connectionless message arrived (pings, pongs, publishes).
    UnconnectedReceived { from: SocketAddr, message: Message },
    /// A reliable message with a receipt id was acknowledged.
    ReceiptAcknowledged { addr: SocketAddr, receipt_id: u64 },
    /// A socket-level failure.
    SocketError { message: String, code: Option<i32> },
}

enum SendOutcome {
    Sent,
    Deferred,
    Failed,
}

/// The transport peer: one socket, many links.
pub struct UdpPeer {
    socket: UdpSocket,
    local_addr: SocketAddr,
    guid: u64,
    config: UdpPeerConfig,
    now_ms: u64,

    links: FxHashMap<SocketAddr, Link>,
    pending_connects: VecDeque<(SocketAddr, ConnectRequestData)>,
    events: VecDeque<TransportEvent>,
    /// Deferred connectionless datagrams (no link to buffer them on).
    unconnected_backlog: VecDeque<(SocketAddr, Vec<u8>)>,
    /// Message-type bytes already reported as unknown.
    unknown_logged: FxHashSet<u8>,
    stats: TransportStats,
}

impl UdpPeer {
    /// Binds the socket on `port` (walking up through the configured
    /// retries) and returns a peer ready to tick.
    pub fn open(
        ip: IpAddr,
        port: u16,
        guid: u64,
        config: UdpPeerConfig,
    ) -> Result<Self, TransportError> {
        let socket = bind_with_retries(ip, port, config.port_retries, &config.socket)?;
        let local_addr = socket.local_addr().map_err(|e| TransportError::SocketOpen {
            message: e.to_string(),
            code: e.raw_os_error(),
        })?;
        tracing::debug!(%local_addr, guid, "transport peer open");
        Ok(Self {
            socket,
            local_addr,
            guid,
            config,
            now_ms: 0,
            links: FxHashMap::default(),
            pending_connects: VecDeque::new(),
            events: VecDeque::new(),
            unconnected_backlog: VecDeque::new(),
            unknown_logged: FxHashSet::default(),
            stats: TransportStats::default(),
        })
    }

    /// Bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// This peer's GUID, as sent in handshakes.
    pub fn guid(&self) -> u64 {
        self.guid
    }

    /// Transport counters.
    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    /// Largest datagram `send` will accept.
    pub fn max_message_bytes(&self) -> usize {
        self.config.max_message_bytes
    }

    /// Looks up a link.
    pub fn link(&self, addr: SocketAddr) -> Option<&Link> {
        self.links.get(&addr)
    }

    /// Status of the link to `addr`, if any.
    pub fn link_status(&self, addr: SocketAddr) -> Option<LinkStatus> {
        self.links.get(&addr).map(Link::status)
    }

    /// Addresses of all Connected links.
    pub fn connected_links(&self) -> Vec<SocketAddr> {
        self.links
            .values()
            .filter(|l| l.status() == LinkStatus::Connected)
            .map(Link::addr)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// Enqueues an outbound connect. The request datagram goes out on the
    /// next `update`. A second connect to the same address while one is
    /// pending is refused.
    pub fn connect(
        &mut self,
        addr: SocketAddr,
        payload: BitStream,
        pending_user_adds: u32,
    ) -> Result<(), TransportError> {
        let already_linked = self
            .links
            .get(&addr)
            .is_some_and(|l| l.status() != LinkStatus::Disconnected);
        let already_queued = self.pending_connects.iter().any(|(a, _)| *a == addr);
        if already_linked || already_queued {
            tracing::warn!(%addr, "connect ignored: link already pending or established");
            return Err(TransportError::DuplicateConnect(addr));
        }
        self.pending_connects.push_back((
            addr,
            ConnectRequestData {
                peer_guid: self.guid,
                pending_user_adds,
                payload,
            },
        ));
        Ok(())
    }

    /// Answers a pending inbound connect request.
    pub fn respond_connect(
        &mut self,
        addr: SocketAddr,
        accept: bool,
        assigned_peer_id: u32,
        payload: BitStream,
    ) -> Result<(), TransportError> {
        let link = self
            .links
            .get_mut(&addr)
            .ok_or(TransportError::NoSuchLink(addr))?;
        if link.pending_request.take().is_none() {
            return Err(TransportError::NoPendingRequest(addr));
        }

        let response = ConnectResponseData {
            peer_guid: self.guid,
            accepted: accept,
            assigned_peer_id,
            payload,
        };
        let mut body = BitStream::new();
        response.write(&mut body);
        let datagram = encode_raw(MessageType::ConnectResponse, &body);

        if accept {
            link.status = LinkStatus::Connected;
            link.connect_response_datagram = Some(datagram.clone());
            let remote_guid = link.remote_guid;
            self.send_datagram_on_link(addr, datagram);
            self.events
                .push_back(TransportEvent::LinkConnected { addr, remote_guid });
        } else {
            // Deny: answer and drop the link immediately.
            self.send_raw_to(addr, &datagram);
            self.links.remove(&addr);
        }
        Ok(())
    }

    /// Sends a disconnect notice and begins the grace period.
    pub fn disconnect(
        &mut self,
        addr: SocketAddr,
        reason: DisconnectReason,
        payload: BitStream,
    ) -> Result<(), TransportError> {
        let link = self
            .links
            .get(&addr)
            .ok_or(TransportError::NoSuchLink(addr))?;
        if link.status() == LinkStatus::Disconnected {
            return Ok(());
        }
        self.begin_disconnect(addr, reason, payload, true);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Sends a channeled message on a connected link. Reliable channels hold
    /// the message until acked; `receipt` attaches an id surfaced as
    /// [`TransportEvent::ReceiptAcknowledged`] on delivery.
    pub fn send(
        &mut self,
        addr: SocketAddr,
        kind: ChannelKind,
        message: &Message,
        receipt: Option<u64>,
    ) -> Result<(), TransportError> {
        let link = self
            .links
            .get_mut(&addr)
            .ok_or(TransportError::NoSuchLink(addr))?;
        if link.status() != LinkStatus::Connected {
            return Err(TransportError::NotConnected(addr));
        }

        // Size check before the sequence number is claimed: a claimed-but-
        // never-sent sequence would stall the ordered channel forever.
        let header_bits: u64 = 8 + 2 + 32 + 1 + if receipt.is_some() { 64 } else { 0 };
        let size = (header_bits + message.payload.bits_written()).div_ceil(8) as usize;
        if size > self.config.max_message_bytes {
            return Err(TransportError::MessageTooLarge {
                size,
                max: self.config.max_message_bytes,
            });
        }

        let seq = link.outgoing_mut(kind).next_seq();
        let datagram = encode_channeled(message.ty, kind, seq, receipt, &message.payload);

        if kind.is_reliable() {
            let link = self.links.get_mut(&addr).expect("link just looked up");
            link.outgoing_mut(kind).track(PendingSend {
                seq,
                datagram: datagram.clone(),
                last_send_ms: self.now_ms,
                send_count: 1,
                receipt,
            });
        }
        self.stats.messages_sent += 1;
        self.send_datagram_on_link(addr, datagram);
        Ok(())
    }

    /// Sends a connectionless message (discovery traffic).
    pub fn send_unconnected(
        &mut self,
        addr: SocketAddr,
        message: &Message,
    ) -> Result<(), TransportError> {
        let datagram = encode_raw(message.ty, &message.payload);
        if datagram.len() > self.config.max_message_bytes {
            return Err(TransportError::MessageTooLarge {
                size: datagram.len(),
                max: self.config.max_message_bytes,
            });
        }
        self.stats.messages_sent += 1;
        match self.send_raw_to(addr, &datagram) {
            SendOutcome::Deferred => {
                self.unconnected_backlog.push_back((addr, datagram));
            }
            SendOutcome::Sent | SendOutcome::Failed => {}
        }
        Ok(())
    }

    /// Broadcasts a connectionless message to a port on the local network.
    pub fn broadcast(&mut self, port: u16, message: &Message) -> Result<(), TransportError> {
        self.send_unconnected(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port),
            message,
        )
    }

    // -----------------------------------------------------------------------
    // The tick
    // -----------------------------------------------------------------------

    /// Pumps the socket, advances timers, and flushes queued sends.
    pub fn update(&mut self, now_ms: u64) {
        self.now_ms = now_ms;
        self.pump_receive();
        self.start_pending_connects();
        self.advance_links();
        self.flush_acks();
        self.flush_backlogs();
    }

    /// Drains the events produced since the last drain.
    pub fn drain_events(&mut self) -> Vec<TransportEvent> {
        self.events.drain(..).collect()
    }

    fn pump_receive(&mut self) {
        let mut buf = [0u8; 65_536];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    self.stats.packets_received += 1;
                    self.handle_datagram(from, &buf[..len]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.events.push_back(TransportEvent::SocketError {
                        message: e.to_string(),
                        code: e.raw_os_error(),
                    });
                    break;
                }
            }
        }
    }

    fn handle_datagram(&mut self, from: SocketAddr, bytes: &[u8]) {
        let mut stream = BitStream::from_bytes(bytes);
        let Ok(type_byte) = stream.read_u8() else {
            return;
        };
        let Some(ty) = MessageType::from_u8(type_byte) else {
            if self.unknown_logged.insert(type_byte) {
                tracing::warn!(%from, type_byte, "unknown message type, discarding");
            }
            return;
        };

        if let Some(link) = self.links.get_mut(&from) {
            link.last_recv_ms = self.now_ms;
        }

        match ty {
            MessageType::ConnectRequest => self.handle_connect_request(from, stream),
            MessageType::ConnectResponse => self.handle_connect_response(from, stream),
            MessageType::DisconnectNotice => self.handle_disconnect_notice(from, stream),
            MessageType::Ack => self.handle_ack(from, stream),
            MessageType::Heartbeat => {}
            MessageType::NetHostPing | MessageType::NetHostPong | MessageType::NetHostPublish => {
                self.stats.messages_received += 1;
                self.events.push_back(TransportEvent::UnconnectedReceived {
                    from,
                    message: Message::new(ty, stream.read_remaining()),
                });
            }
            _ => self.handle_channeled(from, ty, stream),
        }
    }

    fn handle_connect_request(&mut self, from: SocketAddr, mut stream: BitStream) {
        let request = match ConnectRequestData::read(&mut stream) {
            Ok(r) => r,
            Err(_) => {
                self.deserialize_failure(from);
                return;
            }
        };

        if let Some(link) = self.links.get_mut(&from) {
            // Duplicate request: re-answer if we already did, otherwise the
            // application's verdict is still pending.
            let answered = link.connect_response_datagram.clone();
            if let Some(datagram) = answered {
                self.send_raw_to(from, &datagram);
            }
            return;
        }

        let mut link = Link::responder(from, self.now_ms);
        link.remote_guid = request.peer_guid;
        link.pending_request = Some(request.clone());
        self.links.insert(from, link);
        self.events
            .push_back(TransportEvent::ConnectRequested { from, request });
    }

    fn handle_connect_response(&mut self, from: SocketAddr, mut stream: BitStream) {
        let response = match ConnectResponseData::read(&mut stream) {
            Ok(r) => r,
            Err(_) => {
                self.deserialize_failure(from);
                return;
            }
        };

        let Some(link) = self.links.get_mut(&from) else {
            return;
        };
        if !link.initiated_locally || link.status() != LinkStatus::Connecting {
            return;
        }

        link.connect_request_datagram = None;
        if response.accepted {
            link.status = LinkStatus::Connected;
            link.remote_guid = response.peer_guid;
            let remote_guid = response.peer_guid;
            self.events.push_back(TransportEvent::ConnectResponded {
                from,
                response,
            });
            self.events
                .push_back(TransportEvent::LinkConnected { addr: from, remote_guid });
        } else {
            self.events
                .push_back(TransportEvent::ConnectResponded { from, response });
            self.links.remove(&from);
        }
    }

    fn handle_disconnect_notice(&mut self, from: SocketAddr, mut stream: BitStream) {
        let notice = match DisconnectNoticeData::read(&mut stream) {
            Ok(n) => n,
            Err(_) => {
                self.deserialize_failure(from);
                return;
            }
        };
        let Some(link) = self.links.get_mut(&from) else {
            return;
        };
        if link.status() == LinkStatus::Disconnected {
            return;
        }
        link.status = LinkStatus::Disconnected;
        link.grace_until_ms = Some(self.now_ms + self.config.disconnect_grace_ms);
        self.events.push_back(TransportEvent::LinkDisconnected {
            addr: from,
            reason: notice.reason,
            payload: notice.payload,
        });
    }

    fn handle_ack(&mut self, from: SocketAddr, mut stream: BitStream) {
        let Some(link) = self.links.get_mut(&from) else {
            return;
        };
        let header = (|| {
            let kind = ChannelKind::from_u8(stream.read_bits(2)? as u8);
            let count = stream.read_u8()?;
            Ok::<_, quasar_bitstream::BitStreamError>((kind, count))
        })();
        let Ok((Some(kind), count)) = header else {
            self.deserialize_failure(from);
            return;
        };
        let mut receipts = Vec::new();
        for _ in 0..count {
            let Ok(seq) = stream.read_u32() else {
                break;
            };
            if let Some(receipt) = link.outgoing_mut(kind).ack(seq)
                && let Some(receipt_id) = receipt
            {
                receipts.push(receipt_id);
            }
        }
        for receipt_id in receipts {
            self.events.push_back(TransportEvent::ReceiptAcknowledged {
                addr: from,
                receipt_id,
            });
        }
    }

    fn handle_channeled(&mut self, from: SocketAddr, ty: MessageType, mut stream: BitStream) {
        let Some(link) = self.links.get_mut(&from) else {
            return;
        };
        if link.status() == LinkStatus::Connecting {
            return;
        }

        let header = (|| {
            let kind = ChannelKind::from_u8(stream.read_bits(2)? as u8);
            let seq = stream.read_u32()?;
            if stream.read_bool()? {
                stream.read_u64()?; // receipt id, sender-side bookkeeping only
            }
            Ok::<_, quasar_bitstream::BitStreamError>((kind, seq))
        })();
        let Ok((Some(kind), seq)) = header else {
            self.deserialize_failure(from);
            return;
        };

        if kind.is_reliable() {
            link.pending_acks[kind as usize].push(seq);
        }

        let message = Message::new(ty, stream.read_remaining());
        match link.incoming_mut(kind).receive(seq, message) {
            Arrival::Deliver(messages) => {
                for message in messages {
                    self.stats.messages_received += 1;
                    self.events
                        .push_back(TransportEvent::MessageReceived { from, message });
                }
            }
            Arrival::Drop => {}
        }
    }

    /// A known message type whose body failed to parse: disconnect the
    /// originating link with reason Error (connectionless senders are just
    /// ignored).
    fn deserialize_failure(&mut self, from: SocketAddr) {
        let is_active_link = self
            .links
            .get(&from)
            .is_some_and(|l| l.status() != LinkStatus::Disconnected);
        if is_active_link {
            tracing::warn!(%from, "message body failed to deserialize, disconnecting link");
            self.begin_disconnect(from, DisconnectReason::Error, BitStream::new(), true);
        }
    }

    fn begin_disconnect(
        &mut self,
        addr: SocketAddr,
        reason: DisconnectReason,
        payload: BitStream,
        notify_remote: bool,
    ) {
        if notify_remote {
            let notice = DisconnectNoticeData {
                reason,
                payload: payload.clone(),
            };
            let mut body = BitStream::new();
            notice.write(&mut body);
            let datagram = encode_raw(MessageType::DisconnectNotice, &body);
            self.send_raw_to(addr, &datagram);
        }
        if let Some(link) = self.links.get_mut(&addr) {
            link.status = LinkStatus::Disconnected;
            link.grace_until_ms = Some(self.now_ms + self.config.disconnect_grace_ms);
            link.marked_for_disconnect = None;
        }
        self.events.push_back(TransportEvent::LinkDisconnected {
            addr,
            reason,
            payload,
        });
    }

    fn start_pending_connects(&mut self) {
        while let Some((addr, request)) = self.pending_connects.pop_front() {
            if self
                .links
                .get(&addr)
                .is_some_and(|l| l.status() != LinkStatus::Disconnected)
            {
                tracing::warn!(%addr, "queued connect dropped: link appeared meanwhile");
                continue;
            }
            let mut body = BitStream::new();
            request.write(&mut body);
            let datagram = encode_raw(MessageType::ConnectRequest, &body);

            let mut link = Link::initiator(addr, self.now_ms);
            link.connect_request_datagram = Some(datagram.clone());
            link.last_connect_send_ms = self.now_ms;
            self.links.insert(addr, link);
            self.send_raw_to(addr, &datagram);
        }
    }

    fn advance_links(&mut self) {
        let now = self.now_ms;
        let addrs: Vec<SocketAddr> = self.links.keys().copied().collect();
        for addr in addrs {
            // Send-error flags raised last tick.
            if let Some(reason) = self.links.get(&addr).and_then(|l| l.marked_for_disconnect) {
                self.begin_disconnect(addr, reason, BitStream::new(), true);
                continue;
            }

            let Some(link) = self.links.get_mut(&addr) else {
                continue;
            };
            match link.status() {
                LinkStatus::Connecting => {
                    if now.saturating_sub(link.created_ms) >= self.config.connect_timeout_ms {
                        let initiated = link.initiated_locally;
                        self.links.remove(&addr);
                        if initiated {
                            self.events.push_back(TransportEvent::LinkDisconnected {
                                addr,
                                reason: DisconnectReason::Timeout,
                                payload: BitStream::new(),
                            });
                        }
                        continue;
                    }
                    // Initiator keeps knocking until answered.
                    if let Some(datagram) = link.connect_request_datagram.clone()
                        && now.saturating_sub(link.last_connect_send_ms)
                            >= self.config.connect_resend_interval_ms
                    {
                        link.last_connect_send_ms = now;
                        self.send_raw_to(addr, &datagram);
                    }
                }
                LinkStatus::Connected => {
                    if now.saturating_sub(link.last_recv_ms) >= self.config.idle_timeout_ms {
                        self.begin_disconnect(
                            addr,
                            DisconnectReason::Timeout,
                            BitStream::new(),
                            true,
                        );
                        continue;
                    }
                    self.resend_reliable(addr);
                    let Some(link) = self.links.get_mut(&addr) else {
                        continue;
                    };
                    if now.saturating_sub(link.last_send_ms) >= self.config.heartbeat_interval_ms {
                        let datagram = encode_raw(MessageType::Heartbeat, &BitStream::new());
                        self.send_datagram_on_link(addr, datagram);
                    }
                }
                LinkStatus::Disconnected => {
                    if link.grace_until_ms.is_some_and(|t| now >= t) {
                        self.links.remove(&addr);
                    }
                }
            }
        }
    }

    fn resend_reliable(&mut self, addr: SocketAddr) {
        let now = self.now_ms;
        let interval = self.config.resend_interval_ms;
        let mut to_send = Vec::new();
        if let Some(link) = self.links.get_mut(&addr) {
            for kind in [ChannelKind::ReliableOrdered, ChannelKind::ReliableUnordered] {
                for pending in link.outgoing_mut(kind).due_for_resend(now, interval) {
                    pending.last_send_ms = now;
                    pending.send_count += 1;
                    to_send.push(pending.datagram.clone());
                }
            }
        }
        for datagram in to_send {
            self.send_datagram_on_link(addr, datagram);
        }
    }

    fn flush_acks(&mut self) {
        let addrs: Vec<SocketAddr> = self.links.keys().copied().collect();
        for addr in addrs {
            let Some(link) = self.links.get_mut(&addr) else {
                continue;
            };
            let mut datagrams = Vec::new();
            for kind in [ChannelKind::ReliableOrdered, ChannelKind::ReliableUnordered] {
                let acks = std::mem::take(&mut link.pending_acks[kind as usize]);
                if acks.is_empty() {
                    continue;
                }
                for chunk in acks.chunks(u8::MAX as usize) {
                    let mut body = BitStream::new();
                    body.write_bits(kind as u8 as u64, 2);
                    body.write_u8(chunk.len() as u8);
                    for &seq in chunk {
                        body.write_u32(seq);
                    }
                    datagrams.push(encode_raw(MessageType::Ack, &body));
                }
            }
            for datagram in datagrams {
                self.send_datagram_on_link(addr, datagram);
            }
        }
    }

    fn flush_backlogs(&mut self) {
        // Per-link partial-send buffers.
        let addrs: Vec<SocketAddr> = self.links.keys().copied().collect();
        for addr in addrs {
            loop {
                let Some(link) = self.links.get_mut(&addr) else {
                    break;
                };
                let Some(datagram) = link.partial_send.pop_front() else {
                    break;
                };
                link.partial_bytes -= datagram.len();
                match self.try_send_to(addr, &datagram) {
                    Ok(true) => {}
                    Ok(false) => {
                        // Still blocked: put it back and stop.
                        if let Some(link) = self.links.get_mut(&addr) {
                            link.partial_bytes += datagram.len();
                            link.partial_send.push_front(datagram);
                        }
                        break;
                    }
                    Err(_) => {
                        if let Some(link) = self.links.get_mut(&addr) {
                            link.marked_for_disconnect = Some(DisconnectReason::Error);
                        }
                        break;
                    }
                }
            }
        }

        // Connectionless backlog.
        let mut remaining = VecDeque::new();
        while let Some((addr, datagram)) = self.unconnected_backlog.pop_front() {
            match self.try_send_to(addr, &datagram) {
                Ok(true) => {}
                Ok(false) => {
                    remaining.push_back((addr, datagram));
                    break;
                }
                Err(_) => {}
            }
        }
        remaining.append(&mut self.unconnected_backlog);
        self.unconnected_backlog = remaining;
    }

    // -----------------------------------------------------------------------
    // Raw send plumbing
    // -----------------------------------------------------------------------

    /// Sends on a link, deferring into its partial-send buffer on a full OS
    /// queue and marking the link for disconnect on a hard error.
    fn send_datagram_on_link(&mut self, addr: SocketAddr, datagram: Vec<u8>) {
        match self.try_send_to(addr, &datagram) {
            Ok(true) => {
                if let Some(link) = self.links.get_mut(&addr) {
                    link.last_send_ms = self.now_ms;
                }
            }
            Ok(false) => {
                if let Some(link) = self.links.get_mut(&addr) {
                    link.defer_send(datagram);
                }
            }
            Err(_) => {
                if let Some(link) = self.links.get_mut(&addr) {
                    link.marked_for_disconnect = Some(DisconnectReason::Error);
                }
            }
        }
    }

    fn send_raw_to(&mut self, addr: SocketAddr, datagram: &[u8]) -> SendOutcome {
        match self.try_send_to(addr, datagram) {
            Ok(true) => SendOutcome::Sent,
            Ok(false) => SendOutcome::Deferred,
            Err(_) => SendOutcome::Failed,
        }
    }

    /// `Ok(true)` sent, `Ok(false)` would block, `Err` hard failure (also
    /// reported as a [`TransportEvent::SocketError`]).
    fn try_send_to(&mut self, addr: SocketAddr, datagram: &[u8]) -> Result<bool, ()> {
        match self.socket.send_to(datagram, addr) {
            Ok(_) => {
                self.stats.packets_sent += 1;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => {
                self.events.push_back(TransportEvent::SocketError {
                    message: e.to_string(),
                    code: e.raw_os_error(),
                });
                Err(())
            }
        }
    }
}

/// Encodes a headerless datagram: type byte then payload.
fn encode_raw(ty: MessageType, payload: &BitStream) -> Vec<u8> {
    let mut stream = BitStream::with_capacity(1 + payload.bytes_written());
    stream.write_u8(ty as u8);
    stream.write_stream(payload);
    stream.as_bytes().to_vec()
}

/// Encodes a channeled datagram: type byte, channel header, payload.
fn encode_channeled(
    ty: MessageType,
    kind: ChannelKind,
    seq: u32,
    receipt: Option<u64>,
    payload: &BitStream,
) -> Vec<u8> {
    debug_assert!(ty.is_channeled());
    let mut stream = BitStream::with_capacity(6 + payload.bytes_written());
    stream.write_u8(ty as u8);
    stream.write_bits(kind as u8 as u64, 2);
    stream.write_u32(seq);
    match receipt {
        Some(id) => {
            stream.write_bool(true);
            stream.write_u64(id);
        }
        None => {
            stream.write_bool(false);
        }
    }
    stream.write_stream(payload);
    stream.as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn open_peer(guid: u64) -> UdpPeer {
        UdpPeer::open(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            0,
            guid,
            UdpPeerConfig::default(),
        )
        .unwrap()
    }

    /// Ticks both peers a few times so datagrams settle.
    fn pump(a: &mut UdpPeer, b: &mut UdpPeer, start_ms: u64, ticks: u64) -> u64 {
        let mut now = start_ms;
        for _ in 0..ticks {
            now += 16;
            a.update(now);
            b.update(now);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        now
    }

    fn accept_all(server: &mut UdpPeer) -> Vec<TransportEvent> {
        let events = server.drain_events();
        for event in &events {
            if let TransportEvent::ConnectRequested { from, .. } = event {
                server
                    .respond_connect(*from, true, 1, BitStream::new())
                    .unwrap();
            }
        }
        events
    }

    fn establish(a: &mut UdpPeer, b: &mut UdpPeer) -> u64 {
        a.connect(b.local_addr(), BitStream::new(), 0).unwrap();
        let mut now = pump(a, b, 0, 3);
        accept_all(b);
        now = pump(a, b, now, 3);
        assert_eq!(a.link_status(b.local_addr()), Some(LinkStatus::Connected));
        assert_eq!(b.link_status(a.local_addr()), Some(LinkStatus::Connected));
        now
    }

    #[test]
    fn test_connect_handshake_accept() {
        let mut client = open_peer(1);
        let mut server = open_peer(2);

        client
            .connect(server.local_addr(), BitStream::new(), 2)
            .unwrap();
        let mut now = pump(&mut client, &mut server, 0, 3);

        let server_events = accept_all(&mut server);
        assert!(server_events.iter().any(|e| matches!(
            e,
            TransportEvent::ConnectRequested { request, .. }
                if request.peer_guid == 1 && request.pending_user_adds == 2
        )));

        now = pump(&mut client, &mut server, now, 3);
        let client_events = client.drain_events();
        assert!(client_events.iter().any(|e| matches!(
            e,
            TransportEvent::ConnectResponded { response, .. } if response.accepted
        )));
        assert!(
            client_events
                .iter()
                .any(|e| matches!(e, TransportEvent::LinkConnected { remote_guid: 2, .. }))
        );
        let _ = now;
    }

    #[test]
    fn test_connect_handshake_deny_destroys_link() {
        let mut client = open_peer(1);
        let mut server = open_peer(2);

        client
            .connect(server.local_addr(), BitStream::new(), 0)
            .unwrap();
        let mut now = pump(&mut client, &mut server, 0, 3);

        for event in server.drain_events() {
            if let TransportEvent::ConnectRequested { from, .. } = event {
                server
                    .respond_connect(from, false, 0, BitStream::new())
                    .unwrap();
            }
        }
        now = pump(&mut client, &mut server, now, 3);

        assert!(client.drain_events().iter().any(|e| matches!(
            e,
            TransportEvent::ConnectResponded { response, .. } if !response.accepted
        )));
        assert_eq!(client.link_status(server.local_addr()), None);
        assert_eq!(server.link_status(client.local_addr()), None);
    }

    #[test]
    fn test_duplicate_connect_refused() {
        let mut client = open_peer(1);
        let server = open_peer(2);

        client
            .connect(server.local_addr(), BitStream::new(), 0)
            .unwrap();
        let second = client.connect(server.local_addr(), BitStream::new(), 0);
        assert!(matches!(second, Err(TransportError::DuplicateConnect(_))));
    }

    #[test]
    fn test_reliable_ordered_delivery() {
        let mut client = open_peer(1);
        let mut server = open_peer(2);
        let mut now = establish(&mut client, &mut server);

        for i in 0..5u32 {
            let mut payload = BitStream::new();
            payload.write_u32(i);
            client
                .send(
                    server.local_addr(),
                    ChannelKind::ReliableOrdered,
                    &Message::new(MessageType::NetEvent, payload),
                    None,
                )
                .unwrap();
        }
        now = pump(&mut client, &mut server, now, 4);

        let received: Vec<u32> = server
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::MessageReceived { mut message, .. }
                    if message.ty == MessageType::NetEvent =>
                {
                    Some(message.payload.read_u32().unwrap())
                }
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![0, 1, 2, 3, 4]);

        // Acks should have drained the client's in-flight set.
        let _ = pump(&mut client, &mut server, now, 3);
        assert_eq!(client.link(server.local_addr()).unwrap().in_flight(), 0);
    }

    #[test]
    fn test_receipt_acknowledged() {
        let mut client = open_peer(1);
        let mut server = open_peer(2);
        let mut now = establish(&mut client, &mut server);
        server.drain_events();
        client.drain_events();

        client
            .send(
                server.local_addr(),
                ChannelKind::ReliableOrdered,
                &Message::empty(MessageType::NetGameLoadStarted),
                Some(99),
            )
            .unwrap();
        now = pump(&mut client, &mut server, now, 4);
        let _ = now;

        assert!(client.drain_events().iter().any(|e| matches!(
            e,
            TransportEvent::ReceiptAcknowledged { receipt_id: 99, .. }
        )));
    }

    #[test]
    fn test_disconnect_notice_reaches_remote() {
        let mut client = open_peer(1);
        let mut server = open_peer(2);
        let mut now = establish(&mut client, &mut server);
        client.drain_events();
        server.drain_events();

        client
            .disconnect(
                server.local_addr(),
                DisconnectReason::Request,
                BitStream::new(),
            )
            .unwrap();
        now = pump(&mut client, &mut server, now, 3);
        let _ = now;

        assert!(server.drain_events().iter().any(|e| matches!(
            e,
            TransportEvent::LinkDisconnected {
                reason: DisconnectReason::Request,
                ..
            }
        )));
        // Both sides report Disconnected during the grace period.
        assert_eq!(
            client.link_status(server.local_addr()),
            Some(LinkStatus::Disconnected)
        );
    }

    #[test]
    fn test_grace_period_removes_link() {
        let mut client = open_peer(1);
        let mut server = open_peer(2);
        let now = establish(&mut client, &mut server);

        client
            .disconnect(
                server.local_addr(),
                DisconnectReason::Request,
                BitStream::new(),
            )
            .unwrap();
        // Jump past the grace period.
        client.update(now + 5_000);
        assert_eq!(client.link_status(server.local_addr()), None);
    }

    #[test]
    fn test_unconnected_ping_roundtrip() {
        let mut a = open_peer(1);
        let mut b = open_peer(2);

        let mut payload = BitStream::new();
        payload.write_u64(42);
        a.send_unconnected(
            b.local_addr(),
            &Message::new(MessageType::NetHostPing, payload),
        )
        .unwrap();
        pump(&mut a, &mut b, 0, 3);

        assert!(b.drain_events().iter().any(|e| matches!(
            e,
            TransportEvent::UnconnectedReceived { message, .. }
                if message.ty == MessageType::NetHostPing
        )));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut client = open_peer(1);
        let mut server = open_peer(2);
        establish(&mut client, &mut server);

        let mut payload = BitStream::new();
        payload.write_bytes(&vec![0u8; 4096]);
        let result = client.send(
            server.local_addr(),
            ChannelKind::ReliableOrdered,
            &Message::new(MessageType::NetEvent, payload),
            None,
        );
        assert!(matches!(
            result,
            Err(TransportError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_idle_timeout_disconnects() {
        let mut client = open_peer(1);
        let mut server = open_peer(2);
        let now = establish(&mut client, &mut server);
        client.drain_events();

        // No traffic for longer than the idle timeout.
        client.update(now + 60_000);
        assert!(client.drain_events().iter().any(|e| matches!(
            e,
            TransportEvent::LinkDisconnected {
                reason: DisconnectReason::Timeout,
                ..
            }
        )));
    }
}
