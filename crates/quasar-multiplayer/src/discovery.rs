//! Host discovery.
//!
//! Two managers coexist on a peer: LAN (direct broadcast probes across the
//! configured port range) and Internet (probes routed through subscribed
//! master servers, plus record lists fetched over a short-lived link). Both
//! share this request core: a [`PingManager`] plus a list of open host
//! requests staged Unresponding → IndirectBasicHostInfo →
//! DirectBasicHostInfo → ExtraHostInfo.
//!
//! Direct probe payloads carry a single wants-extra bit. A request with
//! `get_extra_info` follows up each basic response with an extra-info probe
//! and only counts the host settled once the extra payload lands.
//!
//! The manager consumes ping-manager events each tick and emits
//! [`DiscoveryEvent`]s; the peer translates those into host-list mutations
//! and dispatched game events.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use rustc_hash::{FxHashMap, FxHashSet};

use quasar_bitstream::BitStream;
use quasar_net::{
    HostPingKind, HostPongData, PingEvent, PingManager, UdpPeer, read_socket_addr,
    write_socket_addr,
};

use crate::host::{NetHost, Network, RefreshResult};

/// The latest knowledge about a responding host, keyed by its real address.
#[derive(Debug, Clone)]
pub struct RespondingHostData {
    pub rtt_ms: Option<u64>,
    pub basic_info: BitStream,
    pub extra_info: Option<BitStream>,
    pub refresh_result: RefreshResult,
}

/// What a request is probing.
#[derive(Debug, Clone)]
enum RequestKind {
    /// One known host.
    Single { target: SocketAddr },
    /// A set of hosts (possibly discovered mid-request).
    Multi { expected: Vec<SocketAddr> },
}

/// An open host request.
#[derive(Debug)]
struct HostRequest {
    kind: RequestKind,
    /// New hosts may be added to the peer's list.
    allow_discovery: bool,
    /// Follow each basic response with an extra-info probe.
    get_extra_info: bool,
    /// Unresponsive expected hosts are removed from the peer's list on
    /// completion.
    remove_stale: bool,
    /// This request refreshes known hosts rather than discovering.
    is_refresh: bool,
    ping_id: u32,
    timeout_ms: u64,
    /// Hosts that responded at all (indirect or direct), by real address.
    responded: FxHashSet<SocketAddr>,
    /// Hosts that answered a direct probe.
    direct_responded: FxHashSet<SocketAddr>,
    /// Hosts already sent an extra-info probe.
    extra_requested: FxHashSet<SocketAddr>,
}

impl HostRequest {
    /// The stage a host must reach before it counts as settled.
    fn required_stage(&self) -> RefreshResult {
        if self.get_extra_info {
            RefreshResult::ExtraHostInfo
        } else {
            RefreshResult::DirectBasicHostInfo
        }
    }
}

/// What the manager reports upward each tick.
#[derive(Debug)]
pub enum DiscoveryEvent {
    /// A host produced a response for an open request.
    HostResponded {
        host: NetHost,
        /// First response from this address within its request.
        first_response: bool,
        /// May this host be added to the peer's host list?
        allow_discovery: bool,
        /// The request was a refresh (affects which event the peer fires).
        is_refresh: bool,
    },
    /// A request concluded.
    RequestCompleted {
        /// Hosts that responded, in address order.
        hosts: Vec<NetHost>,
        /// Expected hosts that never responded (only when `remove_stale`).
        stale: Vec<SocketAddr>,
        is_refresh: bool,
        /// Single-host requests complete silently; only multi-host requests
        /// fire a list event.
        multi_host: bool,
    },
}

/// One network's discovery manager.
pub struct HostDiscovery {
    network: Network,
    ping_manager: PingManager,
    project_guid: u64,
    requests: Vec<HostRequest>,
    responding: FxHashMap<SocketAddr, RespondingHostData>,
    /// Extra-info probe ping ids mapped back to their parent request.
    extra_pings: FxHashMap<u32, u32>,
    events: VecDeque<DiscoveryEvent>,
}

impl HostDiscovery {
    pub fn new(network: Network, project_guid: u64, host_port_range: (u16, u16)) -> Self {
        Self {
            network,
            ping_manager: PingManager::new(project_guid, host_port_range),
            project_guid,
            requests: Vec::new(),
            responding: FxHashMap::default(),
            extra_pings: FxHashMap::default(),
            events: VecDeque::new(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Id pongs must echo to reach this manager.
    pub fn manager_id(&self) -> u32 {
        self.ping_manager.manager_id()
    }

    pub fn set_host_port_range(&mut self, range: (u16, u16)) {
        self.ping_manager.set_host_port_range(range);
    }

    /// True while any request is open.
    pub fn is_busy(&self) -> bool {
        !self.requests.is_empty()
    }

    /// Payload of a direct probe: one wants-extra bit.
    fn direct_payload(wants_extra: bool) -> BitStream {
        let mut payload = BitStream::new();
        payload.write_bool(wants_extra);
        payload
    }

    // -----------------------------------------------------------------------
    // Starting requests
    // -----------------------------------------------------------------------

    /// Refreshes a single known host.
    ///
    /// On LAN the host is probed directly; on Internet the probe goes to
    /// every address in `via_masters` carrying a routed-refresh payload
    /// naming the wanted host.
    #[allow(clippy::too_many_arguments)]
    pub fn refresh_host(
        &mut self,
        target: SocketAddr,
        allow_discovery: bool,
        get_extra_info: bool,
        remove_stale: bool,
        timeout_ms: u64,
        via_masters: &[SocketAddr],
        now_ms: u64,
        transport: &mut UdpPeer,
    ) {
        let (ping_targets, kind, payload) = match self.network {
            Network::Lan => (
                vec![target],
                HostPingKind::Refresh,
                Self::direct_payload(false),
            ),
            Network::Internet => {
                let mut payload = BitStream::new();
                payload.write_u64(self.project_guid);
                write_socket_addr(&mut payload, target);
                (
                    via_masters.to_vec(),
                    HostPingKind::MasterServerRefreshHost,
                    payload,
                )
            }
        };
        if ping_targets.is_empty() {
            tracing::warn!("internet refresh requested with no master-server subscriptions");
            return;
        }
        let ping_id =
            self.ping_manager
                .ping_host(ping_targets, kind, timeout_ms, payload, now_ms, transport);
        self.requests.push(HostRequest {
            kind: RequestKind::Single { target },
            allow_discovery,
            get_extra_info,
            remove_stale,
            is_refresh: true,
            ping_id,
            timeout_ms,
            responded: FxHashSet::default(),
            direct_responded: FxHashSet::default(),
            extra_requested: FxHashSet::default(),
        });
    }

    /// LAN broadcast scan: probes every port in the configured host range on
    /// the broadcast address. Completes at timeout.
    pub fn discover_lan_hosts(
        &mut self,
        expected: Vec<SocketAddr>,
        get_extra_info: bool,
        remove_stale: bool,
        timeout_ms: u64,
        now_ms: u64,
        transport: &mut UdpPeer,
    ) {
        let broadcast = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), 0);
        let ping_id = self.ping_manager.ping_host(
            vec![broadcast],
            HostPingKind::DiscoverList,
            timeout_ms,
            Self::direct_payload(false),
            now_ms,
            transport,
        );
        self.requests.push(HostRequest {
            kind: RequestKind::Multi { expected },
            allow_discovery: true,
            get_extra_info,
            remove_stale,
            is_refresh: false,
            ping_id,
            timeout_ms,
            responded: FxHashSet::default(),
            direct_responded: FxHashSet::default(),
            extra_requested: FxHashSet::default(),
        });
    }

    /// Internet listing: a master server's record list arrived. Every listed
    /// host is reported immediately at the indirect stage, then probed
    /// directly; the request completes when all respond or at timeout.
    pub fn begin_internet_listing(
        &mut self,
        listed: Vec<(SocketAddr, BitStream)>,
        get_extra_info: bool,
        remove_stale: bool,
        timeout_ms: u64,
        now_ms: u64,
        transport: &mut UdpPeer,
    ) {
        let expected: Vec<SocketAddr> = listed.iter().map(|(addr, _)| *addr).collect();
        let ping_id = self.ping_manager.ping_host(
            expected.clone(),
            HostPingKind::DiscoverList,
            timeout_ms,
            Self::direct_payload(false),
            now_ms,
            transport,
        );
        let mut request = HostRequest {
            kind: RequestKind::Multi { expected },
            allow_discovery: true,
            get_extra_info,
            remove_stale,
            is_refresh: false,
            ping_id,
            timeout_ms,
            responded: FxHashSet::default(),
            direct_responded: FxHashSet::default(),
            extra_requested: FxHashSet::default(),
        };

        for (address, basic_info) in listed {
            self.responding.insert(
                address,
                RespondingHostData {
                    rtt_ms: None,
                    basic_info: basic_info.clone(),
                    extra_info: None,
                    refresh_result: RefreshResult::IndirectBasicHostInfo,
                },
            );
            let first = request.responded.insert(address);
            self.events.push_back(DiscoveryEvent::HostResponded {
                host: self.make_host(address),
                first_response: first,
                allow_discovery: true,
                is_refresh: false,
            });
        }
        self.requests.push(request);
    }

    /// Cancels everything and returns to idle.
    pub fn cancel(&mut self) {
        self.ping_manager.cancel_all();
        self.ping_manager.drain_events();
        self.requests.clear();
        self.responding.clear();
        self.extra_pings.clear();
        self.events.clear();
    }

    // -----------------------------------------------------------------------
    // The tick
    // -----------------------------------------------------------------------

    /// Offers a pong to this manager. Consumed when the manager id matches.
    pub fn receive_pong(&mut self, from: SocketAddr, pong: &HostPongData, now_ms: u64) -> bool {
        self.ping_manager.receive_pong(from, pong, now_ms)
    }

    /// Resends, times out, and converts ping events into discovery events.
    pub fn update(&mut self, now_ms: u64, transport: &mut UdpPeer) {
        self.ping_manager.update(now_ms, transport);
        for event in self.ping_manager.drain_events() {
            match event {
                PingEvent::PongReceived {
                    ping_id,
                    kind,
                    from,
                    rtt_ms,
                    payload,
                } => self.handle_pong_event(ping_id, kind, from, rtt_ms, payload, now_ms, transport),
                PingEvent::PingTimeout { ping_id, .. } => {
                    if let Some(parent) = self.extra_pings.remove(&ping_id) {
                        // An unanswered extra probe still ends its request.
                        self.complete_request(parent);
                    } else {
                        self.complete_request(ping_id);
                    }
                }
                PingEvent::PingCancelled { ping_id, .. } => {
                    self.extra_pings.remove(&ping_id);
                    self.requests.retain(|r| r.ping_id != ping_id);
                }
            }
        }
    }

    /// Drains pending discovery events.
    pub fn drain_events(&mut self) -> Vec<DiscoveryEvent> {
        self.events.drain(..).collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_pong_event(
        &mut self,
        ping_id: u32,
        kind: HostPingKind,
        from: SocketAddr,
        rtt_ms: Option<u64>,
        mut payload: BitStream,
        now_ms: u64,
        transport: &mut UdpPeer,
    ) {
        let (request_ping_id, is_extra) = match self.extra_pings.remove(&ping_id) {
            Some(parent) => (parent, true),
            None => (ping_id, false),
        };
        let Some(index) = self
            .requests
            .iter()
            .position(|r| r.ping_id == request_ping_id)
        else {
            return;
        };

        // A master-server routed refresh wraps the real host's address and
        // info inside the pong payload.
        let (address, data) = if kind == HostPingKind::MasterServerRefreshHost {
            let Ok(host_addr) = read_socket_addr(&mut payload) else {
                tracing::warn!(%from, "malformed master-server refresh pong");
                return;
            };
            (
                host_addr,
                RespondingHostData {
                    rtt_ms: None,
                    basic_info: payload.read_remaining(),
                    extra_info: None,
                    refresh_result: RefreshResult::IndirectBasicHostInfo,
                },
            )
        } else if is_extra {
            (
                from,
                RespondingHostData {
                    rtt_ms,
                    basic_info: BitStream::new(),
                    extra_info: Some(payload.read_remaining()),
                    refresh_result: RefreshResult::ExtraHostInfo,
                },
            )
        } else {
            (
                from,
                RespondingHostData {
                    rtt_ms,
                    basic_info: payload.read_remaining(),
                    extra_info: None,
                    refresh_result: RefreshResult::DirectBasicHostInfo,
                },
            )
        };

        // Stages only move forward; an extra response keeps its basic info.
        let entry = self
            .responding
            .entry(address)
            .or_insert_with(|| data.clone());
        if data.refresh_result >= entry.refresh_result {
            if is_extra {
                entry.refresh_result = RefreshResult::ExtraHostInfo;
                entry.extra_info = data.extra_info;
                entry.rtt_ms = data.rtt_ms.or(entry.rtt_ms);
            } else {
                let extra = entry.extra_info.take();
                *entry = data;
                entry.extra_info = extra;
            }
        }

        let request = &mut self.requests[index];
        let first = request.responded.insert(address);
        if kind != HostPingKind::MasterServerRefreshHost {
            request.direct_responded.insert(address);
        }
        let allow_discovery = request.allow_discovery;
        let is_refresh = request.is_refresh;

        self.events.push_back(DiscoveryEvent::HostResponded {
            host: self.make_host(address),
            first_response: first,
            allow_discovery,
            is_refresh,
        });

        self.maybe_probe_extra(index, address, now_ms, transport);

        // Single-host requests conclude once their target settles; multi-host
        // requests conclude once every expected host has.
        let required = self.requests[index].required_stage();
        let settled = |addr: &SocketAddr| {
            self.responding
                .get(addr)
                .is_some_and(|d| d.refresh_result >= required)
                || (!self.requests[index].get_extra_info
                    && self.requests[index].responded.contains(addr))
        };
        let done = match &self.requests[index].kind {
            RequestKind::Single { target } => {
                // An indirect-only answer still satisfies a basic refresh.
                (!self.requests[index].get_extra_info
                    && !self.requests[index].responded.is_empty())
                    || settled(target)
            }
            RequestKind::Multi { expected } => {
                !expected.is_empty() && expected.iter().all(settled)
            }
        };
        if done {
            let ping_id = self.requests[index].ping_id;
            self.ping_manager.conclude(ping_id);
            self.complete_request(ping_id);
        }
    }

    /// Follows a basic response with one extra-info probe when the request
    /// asked for it.
    fn maybe_probe_extra(
        &mut self,
        index: usize,
        address: SocketAddr,
        now_ms: u64,
        transport: &mut UdpPeer,
    ) {
        let request = &mut self.requests[index];
        if !request.get_extra_info || !request.extra_requested.insert(address) {
            return;
        }
        let already_extra = self
            .responding
            .get(&address)
            .is_some_and(|d| d.refresh_result >= RefreshResult::ExtraHostInfo);
        if already_extra {
            return;
        }
        let timeout_ms = request.timeout_ms;
        let parent = request.ping_id;
        let extra_ping_id = self.ping_manager.ping_host(
            vec![address],
            HostPingKind::Refresh,
            timeout_ms,
            Self::direct_payload(true),
            now_ms,
            transport,
        );
        self.extra_pings.insert(extra_ping_id, parent);
    }

    fn complete_request(&mut self, ping_id: u32) {
        let Some(index) = self.requests.iter().position(|r| r.ping_id == ping_id) else {
            return;
        };
        let request = self.requests.remove(index);
        self.extra_pings.retain(|_, parent| *parent != request.ping_id);

        let mut hosts: Vec<NetHost> = request
            .responded
            .iter()
            .map(|&addr| self.make_host(addr))
            .collect();
        hosts.sort_by_key(|h| h.address);

        let stale: Vec<SocketAddr> = if request.remove_stale {
            let expected: Vec<SocketAddr> = match &request.kind {
                RequestKind::Single { target } => vec![*target],
                RequestKind::Multi { expected } => expected.clone(),
            };
            expected
                .into_iter()
                .filter(|addr| !request.responded.contains(addr))
                .collect()
        } else {
            Vec::new()
        };

        self.events.push_back(DiscoveryEvent::RequestCompleted {
            hosts,
            stale,
            is_refresh: request.is_refresh,
            multi_host: matches!(request.kind, RequestKind::Multi { .. }),
        });
    }

    fn make_host(&self, address: SocketAddr) -> NetHost {
        let mut host = NetHost::new(self.network, address);
        if let Some(data) = self.responding.get(&address) {
            host.rtt_ms = data.rtt_ms;
            host.basic_info = data.basic_info.clone();
            host.extra_info = data.extra_info.clone();
            host.refresh_result = data.refresh_result;
        }
        host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quasar_net::{HostPingData, MessageType, TransportEvent, UdpPeerConfig, make_pong};
    use std::net::{IpAddr, Ipv4Addr};

    fn open_peer() -> UdpPeer {
        UdpPeer::open(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            0,
            1,
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

    /// Answers every received direct ping the way a discoverable server
    /// would: basic info, or extra info when the wants-extra bit is set.
    fn answer_pings(responder: &mut UdpPeer, basic: &str, extra: &str) {
        for (from, ping) in drain_pings(responder) {
            let wants_extra = ping.payload.clone().read_bool().unwrap_or(false);
            let mut info = BitStream::new();
            info.write_string(if wants_extra { extra } else { basic });
            responder
                .send_unconnected(from, &make_pong(9, &ping, info))
                .unwrap();
        }
    }

    fn route_pongs(pinger: &mut UdpPeer, discovery: &mut HostDiscovery, now: u64) {
        for event in pinger.drain_events() {
            if let TransportEvent::UnconnectedReceived { from, mut message } = event
                && message.ty == MessageType::NetHostPong
            {
                let data = HostPongData::read(&mut message.payload).unwrap();
                discovery.receive_pong(from, &data, now);
            }
        }
    }

    #[test]
    fn test_lan_refresh_direct_response() {
        let mut pinger = open_peer();
        let mut responder = open_peer();
        let mut discovery = HostDiscovery::new(Network::Lan, 9, (0, 0));

        discovery.refresh_host(
            responder.local_addr(),
            true,
            false,
            false,
            5_000,
            &[],
            0,
            &mut pinger,
        );

        std::thread::sleep(std::time::Duration::from_millis(3));
        responder.update(10);
        answer_pings(&mut responder, "HELLO", "");
        std::thread::sleep(std::time::Duration::from_millis(3));
        pinger.update(20);
        route_pongs(&mut pinger, &mut discovery, 20);
        discovery.update(20, &mut pinger);

        let events = discovery.drain_events();
        let responded = events.iter().find_map(|e| match e {
            DiscoveryEvent::HostResponded {
                host,
                first_response,
                ..
            } => Some((host.clone(), *first_response)),
            _ => None,
        });
        let (host, first) = responded.expect("host should respond");
        assert!(first);
        assert_eq!(host.refresh_result, RefreshResult::DirectBasicHostInfo);
        let mut info = host.basic_info.clone();
        assert_eq!(info.read_string().unwrap(), "HELLO");

        // Single refresh also completes (without a list event).
        assert!(events.iter().any(|e| matches!(
            e,
            DiscoveryEvent::RequestCompleted {
                multi_host: false,
                ..
            }
        )));
        assert!(!discovery.is_busy());
    }

    #[test]
    fn test_extra_info_follows_basic() {
        let mut pinger = open_peer();
        let mut responder = open_peer();
        let mut discovery = HostDiscovery::new(Network::Lan, 9, (0, 0));

        discovery.refresh_host(
            responder.local_addr(),
            true,
            true, // get_extra_info
            false,
            5_000,
            &[],
            0,
            &mut pinger,
        );

        // Round 1: the basic answer triggers an extra probe instead of
        // completing.
        std::thread::sleep(std::time::Duration::from_millis(3));
        responder.update(10);
        answer_pings(&mut responder, "BASIC", "EXTRA");
        std::thread::sleep(std::time::Duration::from_millis(3));
        pinger.update(20);
        route_pongs(&mut pinger, &mut discovery, 20);
        discovery.update(20, &mut pinger);
        assert!(discovery.is_busy(), "waiting on the extra exchange");

        // Round 2: the extra answer settles the request.
        std::thread::sleep(std::time::Duration::from_millis(3));
        responder.update(30);
        answer_pings(&mut responder, "BASIC", "EXTRA");
        std::thread::sleep(std::time::Duration::from_millis(3));
        pinger.update(40);
        route_pongs(&mut pinger, &mut discovery, 40);
        discovery.update(40, &mut pinger);

        let events = discovery.drain_events();
        let settled = events.iter().find_map(|e| match e {
            DiscoveryEvent::HostResponded { host, .. }
                if host.refresh_result == RefreshResult::ExtraHostInfo =>
            {
                Some(host.clone())
            }
            _ => None,
        });
        let host = settled.expect("the extra exchange should finish");
        let mut basic = host.basic_info.clone();
        assert_eq!(basic.read_string().unwrap(), "BASIC");
        let mut extra = host.extra_info.clone().expect("extra info present");
        assert_eq!(extra.read_string().unwrap(), "EXTRA");
        assert!(!discovery.is_busy());
    }

    #[test]
    fn test_internet_listing_stages_indirect_then_direct() {
        let mut pinger = open_peer();
        let mut host_peer = open_peer();
        let mut discovery = HostDiscovery::new(Network::Internet, 9, (0, 0));

        let mut info = BitStream::new();
        info.write_string("LISTED");
        discovery.begin_internet_listing(
            vec![(host_peer.local_addr(), info)],
            false,
            true,
            5_000,
            0,
            &mut pinger,
        );

        // The listing itself surfaces the host at the indirect stage.
        let events = discovery.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            DiscoveryEvent::HostResponded {
                host,
                first_response: true,
                ..
            } if host.refresh_result == RefreshResult::IndirectBasicHostInfo
        )));

        // The direct probe then upgrades the stage and completes the list.
        std::thread::sleep(std::time::Duration::from_millis(3));
        host_peer.update(10);
        answer_pings(&mut host_peer, "DIRECT", "");
        std::thread::sleep(std::time::Duration::from_millis(3));
        pinger.update(30);
        route_pongs(&mut pinger, &mut discovery, 30);
        discovery.update(30, &mut pinger);

        let events = discovery.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            DiscoveryEvent::HostResponded {
                host,
                first_response: false,
                ..
            } if host.refresh_result == RefreshResult::DirectBasicHostInfo
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            DiscoveryEvent::RequestCompleted {
                multi_host: true,
                ..
            }
        )));
    }

    #[test]
    fn test_timeout_reports_stale_hosts() {
        let mut pinger = open_peer();
        let mut discovery = HostDiscovery::new(Network::Lan, 9, (1, 0));
        let silent: SocketAddr = "127.0.0.1:9".parse().unwrap();

        discovery.discover_lan_hosts(vec![silent], false, true, 500, 0, &mut pinger);
        discovery.update(1_000, &mut pinger);

        let events = discovery.drain_events();
        let completed = events.iter().find_map(|e| match e {
            DiscoveryEvent::RequestCompleted { hosts, stale, .. } => {
                Some((hosts.clone(), stale.clone()))
            }
            _ => None,
        });
        let (hosts, stale) = completed.expect("request should time out");
        assert!(hosts.is_empty());
        assert_eq!(stale, vec![silent]);
    }

    #[test]
    fn test_cancel_resets_to_idle() {
        let mut pinger = open_peer();
        let mut discovery = HostDiscovery::new(Network::Lan, 9, (1, 0));
        discovery.discover_lan_hosts(Vec::new(), false, false, 5_000, 0, &mut pinger);
        assert!(discovery.is_busy());
        discovery.cancel();
        assert!(!discovery.is_busy());
        assert!(discovery.drain_events().is_empty());
    }
}
