//! Tracked host probes.
//!
//! A [`PingManager`] owns a set of pending pings, each retried on an interval
//! until a timeout. Ids (the manager's own id, ping ids, and per-resend
//! attempt ids) come from a randomly-incremented counter so replies cannot be
//! forged by guessing the next id. Several managers coexist on one peer (LAN
//! and internet discovery each own one); a pong is consumed only by the
//! manager whose id it echoes, and round-trip time is measured against the
//! specific send attempt that elicited the reply.

use std::collections::VecDeque;
use std::net::SocketAddr;

use rand::Rng;

use quasar_bitstream::BitStream;

use crate::messages::{HostPingData, HostPongData, Message, MessageType};
use crate::peer::UdpPeer;

/// What a pending ping is trying to learn. Local bookkeeping only; the wire
/// carries the request bundle instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPingKind {
    /// Broad scan; stays pending until timeout so every host can answer.
    DiscoverList,
    /// Refresh of one known host; concluded by its first pong.
    Refresh,
    /// Refresh routed through a master server; concluded by its first pong.
    MasterServerRefreshHost,
}

impl HostPingKind {
    /// True when the first pong satisfies the ping.
    fn concludes_on_pong(self) -> bool {
        matches!(self, Self::Refresh | Self::MasterServerRefreshHost)
    }
}

/// A probe awaiting replies.
#[derive(Debug)]
struct PendingPing {
    ping_id: u32,
    kind: HostPingKind,
    targets: Vec<SocketAddr>,
    created_ms: u64,
    last_send_ms: u64,
    timeout_ms: u64,
    payload: BitStream,
    /// Attempt ids with their send times, for per-attempt RTT.
    attempts: Vec<(u32, u64)>,
}

/// Events drained from the manager each tick.
#[derive(Debug)]
pub enum PingEvent {
    /// A matching pong arrived.
    PongReceived {
        ping_id: u32,
        kind: HostPingKind,
        from: SocketAddr,
        /// Round-trip time against the answered attempt, if it is known.
        rtt_ms: Option<u64>,
        /// The responder's payload.
        payload: BitStream,
    },
    /// A pending ping expired with no (or not enough) replies.
    PingTimeout { ping_id: u32, kind: HostPingKind },
    /// A ping was replaced by a newer identical request.
    PingCancelled { ping_id: u32, kind: HostPingKind },
}

/// Tracked-probe manager.
pub struct PingManager {
    manager_id: u32,
    next_random_id: u32,
    project_guid: u64,
    /// Interval between resends of an unanswered ping.
    ping_interval_ms: u64,
    /// Inclusive port range fanned out to when a target's port is 0.
    host_port_range: (u16, u16),
    pings: Vec<PendingPing>,
    events: VecDeque<PingEvent>,
}

impl PingManager {
    /// Creates a manager with a fresh random manager id.
    pub fn new(project_guid: u64, host_port_range: (u16, u16)) -> Self {
        let mut rng = rand::rng();
        Self {
            manager_id: rng.random(),
            next_random_id: rng.random(),
            project_guid,
            ping_interval_ms: 250,
            host_port_range,
            pings: Vec::new(),
            events: VecDeque::new(),
        }
    }

    /// This manager's id as echoed by pongs.
    pub fn manager_id(&self) -> u32 {
        self.manager_id
    }

    /// Updates the port range used for port-0 fan-out.
    pub fn set_host_port_range(&mut self, range: (u16, u16)) {
        self.host_port_range = range;
    }

    /// Bumps the id counter by a small random amount. Wrapping is fine; the
    /// randomness makes the next id unguessable, not unique forever.
    fn acquire_random_incremental_id(&mut self) -> u32 {
        self.next_random_id = self
            .next_random_id
            .wrapping_add(rand::rng().random_range(1..=1024));
        self.next_random_id
    }

    /// Starts (or restarts) a tracked ping. An existing pending ping with
    /// the same targets and kind is cancelled first. Returns the ping id.
    pub fn ping_host(
        &mut self,
        targets: Vec<SocketAddr>,
        kind: HostPingKind,
        timeout_ms: u64,
        payload: BitStream,
        now_ms: u64,
        transport: &mut UdpPeer,
    ) -> u32 {
        if let Some(index) = self
            .pings
            .iter()
            .position(|p| p.targets == targets && p.kind == kind)
        {
            let old = self.pings.remove(index);
            self.events.push_back(PingEvent::PingCancelled {
                ping_id: old.ping_id,
                kind: old.kind,
            });
        }

        let ping_id = self.acquire_random_incremental_id();
        self.pings.push(PendingPing {
            ping_id,
            kind,
            targets,
            created_ms: now_ms,
            last_send_ms: 0,
            timeout_ms,
            payload,
            attempts: Vec::new(),
        });
        self.send_ping_at(self.pings.len() - 1, now_ms, transport);
        ping_id
    }

    /// Drops a pending ping without an event.
    pub fn conclude(&mut self, ping_id: u32) {
        self.pings.retain(|p| p.ping_id != ping_id);
    }

    /// Cancels everything, firing a cancelled event per pending ping.
    pub fn cancel_all(&mut self) {
        for ping in self.pings.drain(..) {
            self.events.push_back(PingEvent::PingCancelled {
                ping_id: ping.ping_id,
                kind: ping.kind,
            });
        }
    }

    /// True while any ping is pending.
    pub fn has_pending(&self) -> bool {
        !self.pings.is_empty()
    }

    /// Resends overdue pings and expires timed-out ones.
    pub fn update(&mut self, now_ms: u64, transport: &mut UdpPeer) {
        let mut index = 0;
        while index < self.pings.len() {
            if now_ms.saturating_sub(self.pings[index].created_ms) >= self.pings[index].timeout_ms {
                let ping = self.pings.remove(index);
                self.events.push_back(PingEvent::PingTimeout {
                    ping_id: ping.ping_id,
                    kind: ping.kind,
                });
                continue;
            }
            if now_ms.saturating_sub(self.pings[index].last_send_ms) >= self.ping_interval_ms {
                self.send_ping_at(index, now_ms, transport);
            }
            index += 1;
        }
    }

    /// Starts a fresh send attempt for `self.pings[index]`.
    fn send_ping_at(&mut self, index: usize, now_ms: u64, transport: &mut UdpPeer) {
        let send_attempt_id = self.acquire_random_incremental_id();
        let manager_id = self.manager_id;
        let project_guid = self.project_guid;
        let (range_start, range_end) = self.host_port_range;

        let ping = &mut self.pings[index];
        ping.attempts.push((send_attempt_id, now_ms));
        ping.last_send_ms = now_ms;

        let data = HostPingData {
            project_guid,
            ping_id: ping.ping_id,
            send_attempt_id,
            manager_id,
            payload: ping.payload.clone(),
        };
        let mut body = BitStream::new();
        data.write(&mut body);
        let message = Message::new(MessageType::NetHostPing, body);

        for &target in &ping.targets {
            if target.port() != 0 {
                let _ = transport.send_unconnected(target, &message);
            } else {
                // Port 0 means "every port in the configured host range".
                for port in range_start..=range_end {
                    let _ = transport.send_unconnected(SocketAddr::new(target.ip(), port), &message);
                }
            }
        }
    }

    /// Offers a received pong to this manager. Returns true when consumed
    /// (matching manager id), even if the ping it answered is long gone.
    pub fn receive_pong(&mut self, from: SocketAddr, pong: &HostPongData, now_ms: u64) -> bool {
        if pong.manager_id != self.manager_id {
            return false;
        }
        let Some(ping) = self.pings.iter().find(|p| p.ping_id == pong.ping_id) else {
            // Timed out or cancelled earlier; consumed but stale.
            return true;
        };

        let rtt_ms = ping
            .attempts
            .iter()
            .find(|(id, _)| *id == pong.send_attempt_id)
            .map(|(_, sent)| now_ms.saturating_sub(*sent));
        let (ping_id, kind) = (ping.ping_id, ping.kind);

        self.events.push_back(PingEvent::PongReceived {
            ping_id,
            kind,
            from,
            rtt_ms,
            payload: pong.payload.clone(),
        });

        if kind.concludes_on_pong() {
            self.conclude(ping_id);
        }
        true
    }

    /// Drains the events produced since the last drain.
    pub fn drain_events(&mut self) -> Vec<PingEvent> {
        self.events.drain(..).collect()
    }
}

/// Builds the pong answering `ping` with the given response payload.
pub fn make_pong(project_guid: u64, ping: &HostPingData, payload: BitStream) -> Message {
    let data = HostPongData {
        project_guid,
        ping_id: ping.ping_id,
        send_attempt_id: ping.send_attempt_id,
        manager_id: ping.manager_id,
        payload,
    };
    let mut body = BitStream::new();
    data.write(&mut body);
    Message::new(MessageType::NetHostPong, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{TransportEvent, UdpPeer, UdpPeerConfig};
    use std::net::{IpAddr, Ipv4Addr};

    fn open_peer() -> UdpPeer {
        UdpPeer::open(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            0,
            7,
            UdpPeerConfig::default(),
        )
        .unwrap()
    }

    fn drain_pings(peer: &mut UdpPeer) -> Vec<(SocketAddr, HostPingData)> {
        peer.drain_events()
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::UnconnectedReceived { from, mut message }
                    if message.ty == MessageType::NetHostPing =>
                {
                    Some((from, HostPingData::read(&mut message.payload).unwrap()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_ping_pong_rtt() {
        let mut pinger = open_peer();
        let mut responder = open_peer();
        let mut manager = PingManager::new(99, (0, 0));

        manager.ping_host(
            vec![responder.local_addr()],
            HostPingKind::Refresh,
            5_000,
            BitStream::new(),
            100,
            &mut pinger,
        );

        std::thread::sleep(std::time::Duration::from_millis(2));
        responder.update(110);
        let pings = drain_pings(&mut responder);
        assert_eq!(pings.len(), 1);
        let (from, ping) = &pings[0];
        assert_eq!(ping.project_guid, 99);

        let pong = make_pong(99, ping, BitStream::new());
        responder.send_unconnected(*from, &pong).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        pinger.update(150);

        for event in pinger.drain_events() {
            if let TransportEvent::UnconnectedReceived { from, mut message } = event
                && message.ty == MessageType::NetHostPong
            {
                let data = HostPongData::read(&mut message.payload).unwrap();
                assert!(manager.receive_pong(from, &data, 150));
            }
        }

        let events = manager.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            PingEvent::PongReceived {
                rtt_ms: Some(50),
                kind: HostPingKind::Refresh,
                ..
            }
        )));
        // Refresh pings conclude on the first pong.
        assert!(!manager.has_pending());
    }

    #[test]
    fn test_foreign_manager_id_not_consumed() {
        let mut manager = PingManager::new(1, (0, 0));
        let pong = HostPongData {
            project_guid: 1,
            ping_id: 5,
            send_attempt_id: 6,
            manager_id: manager.manager_id().wrapping_add(1),
            payload: BitStream::new(),
        };
        assert!(!manager.receive_pong("127.0.0.1:1000".parse().unwrap(), &pong, 0));
    }

    #[test]
    fn test_timeout_fires_and_removes() {
        let mut pinger = open_peer();
        let mut manager = PingManager::new(1, (0, 0));
        let ping_id = manager.ping_host(
            vec!["127.0.0.1:9".parse().unwrap()],
            HostPingKind::DiscoverList,
            1_000,
            BitStream::new(),
            0,
            &mut pinger,
        );

        manager.update(2_000, &mut pinger);
        let events = manager.drain_events();
        assert!(events.iter().any(
            |e| matches!(e, PingEvent::PingTimeout { ping_id: id, .. } if *id == ping_id)
        ));
        assert!(!manager.has_pending());
    }

    #[test]
    fn test_identical_request_cancels_prior() {
        let mut pinger = open_peer();
        let mut manager = PingManager::new(1, (0, 0));
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let first = manager.ping_host(
            vec![target],
            HostPingKind::DiscoverList,
            5_000,
            BitStream::new(),
            0,
            &mut pinger,
        );
        let second = manager.ping_host(
            vec![target],
            HostPingKind::DiscoverList,
            5_000,
            BitStream::new(),
            10,
            &mut pinger,
        );
        assert_ne!(first, second);

        let events = manager.drain_events();
        assert!(events.iter().any(
            |e| matches!(e, PingEvent::PingCancelled { ping_id, .. } if *ping_id == first)
        ));
    }

    #[test]
    fn test_port_zero_fans_out_over_range() {
        let mut pinger = open_peer();
        let mut receiver_a = open_peer();
        let mut receiver_b = open_peer();
        let port_a = receiver_a.local_addr().port();
        let port_b = receiver_b.local_addr().port();
        let (lo, hi) = (port_a.min(port_b), port_a.max(port_b));
        // Keep the fan-out reasonable if the OS gave us distant ports.
        if hi - lo > 64 {
            return;
        }

        let mut manager = PingManager::new(1, (lo, hi));
        manager.ping_host(
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)],
            HostPingKind::DiscoverList,
            5_000,
            BitStream::new(),
            0,
            &mut pinger,
        );

        std::thread::sleep(std::time::Duration::from_millis(5));
        receiver_a.update(10);
        receiver_b.update(10);
        assert_eq!(drain_pings(&mut receiver_a).len(), 1);
        assert_eq!(drain_pings(&mut receiver_b).len(), 1);
    }

    #[test]
    fn test_stale_pong_consumed_quietly() {
        let mut manager = PingManager::new(1, (0, 0));
        let pong = HostPongData {
            project_guid: 1,
            ping_id: 12345,
            send_attempt_id: 1,
            manager_id: manager.manager_id(),
            payload: BitStream::new(),
        };
        assert!(manager.receive_pong("127.0.0.1:1000".parse().unwrap(), &pong, 0));
        assert!(manager.drain_events().is_empty());
    }
}
