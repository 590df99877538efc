//! Hosts as seen by a peer.
//!
//! Discovery results accumulate into per-network host lists deduplicated by
//! address. A host entry carries whatever the latest probe learned: RTT,
//! the serialized basic host info, optionally the extra info, and how far
//! the probe got.

use std::net::SocketAddr;

use quasar_bitstream::BitStream;

/// Which network a host was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Lan,
    Internet,
}

/// How far a refresh got for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RefreshResult {
    /// Nothing heard.
    NoResponse,
    /// A master server reported the host's info; the host itself has not
    /// been reached.
    IndirectBasicHostInfo,
    /// The host answered directly.
    DirectBasicHostInfo,
    /// The second-stage extra info exchange completed.
    ExtraHostInfo,
}

/// One known host.
#[derive(Debug, Clone)]
pub struct NetHost {
    pub network: Network,
    pub address: SocketAddr,
    /// Round-trip time of the latest direct response.
    pub rtt_ms: Option<u64>,
    /// Serialized game-defined basic host info.
    pub basic_info: BitStream,
    /// Serialized game-defined extra host info, when acquired.
    pub extra_info: Option<BitStream>,
    /// How far the latest probe got.
    pub refresh_result: RefreshResult,
}

impl NetHost {
    pub fn new(network: Network, address: SocketAddr) -> Self {
        Self {
            network,
            address,
            rtt_ms: None,
            basic_info: BitStream::new(),
            extra_info: None,
            refresh_result: RefreshResult::NoResponse,
        }
    }
}

/// Per-network host lists, deduplicated by address.
#[derive(Debug, Default)]
pub struct HostLists {
    lan: Vec<NetHost>,
    internet: Vec<NetHost>,
}

impl HostLists {
    fn list_mut(&mut self, network: Network) -> &mut Vec<NetHost> {
        match network {
            Network::Lan => &mut self.lan,
            Network::Internet => &mut self.internet,
        }
    }

    /// Hosts known on a network, in discovery order.
    pub fn hosts(&self, network: Network) -> &[NetHost] {
        match network {
            Network::Lan => &self.lan,
            Network::Internet => &self.internet,
        }
    }

    pub fn host(&self, network: Network, address: SocketAddr) -> Option<&NetHost> {
        self.hosts(network).iter().find(|h| h.address == address)
    }

    /// Inserts or replaces the entry for the host's address. Returns true
    /// when the host was new to the list.
    pub fn upsert(&mut self, host: NetHost) -> bool {
        let list = self.list_mut(host.network);
        match list.iter_mut().find(|h| h.address == host.address) {
            Some(existing) => {
                *existing = host;
                false
            }
            None => {
                list.push(host);
                true
            }
        }
    }

    /// Removes one host. Returns true when it was present.
    pub fn remove(&mut self, network: Network, address: SocketAddr) -> bool {
        let list = self.list_mut(network);
        let before = list.len();
        list.retain(|h| h.address != address);
        list.len() != before
    }

    /// Clears one network's list.
    pub fn clear(&mut self, network: Network) {
        self.list_mut(network).clear();
    }

    /// Clears everything (peer close).
    pub fn clear_all(&mut self) {
        self.lan.clear();
        self.internet.clear();
    }
}
