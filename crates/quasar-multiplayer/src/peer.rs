//! The NetPeer: the top-level network endpoint.
//!
//! A peer opens in one of four roles. Servers and offline peers hold
//! replication authority; clients materialize the authority's streams; a
//! master server is a transport-level server that keeps the host registry
//! instead of a game. The peer composes the transport ([`UdpPeer`]), the
//! replica arena ([`Replicator`]), the two discovery managers, and the
//! master registry, and drives them all from one `update` per engine tick.
//!
//! Everything the peer needs from its surroundings arrives through the
//! [`GameEngine`] trait bundle passed into each call; nothing global is
//! touched.

use std::collections::VecDeque;
use std::net::SocketAddr;

use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};

use quasar_bitstream::{BitStream, NetValue};
use quasar_net::{
    ChannelKind, DisconnectReason, HostPingData, HostPongData, HostPublishData,
    HostRecordListData, Message, MessageType, TransportError, TransportEvent, UdpPeer,
    UdpPeerConfig, make_pong, write_socket_addr,
};
use quasar_replication::{
    AuthorityMode, ChannelConfig, CreateContext, DetectionMode, EmplaceContext, NetPeerId,
    NetUserId, PropertyConfig, Replica, ReplicaChannel, ReplicaId, ReplicaProperty, ReplicaType,
    ReliabilityMode, Replicator, ReplicatorError, ReplicatorRole, SpawnMemberInfo,
};

use crate::config::NetPeerConfig;
use crate::discovery::{DiscoveryEvent, HostDiscovery};
use crate::engine::{CogId, EngineError, GameEngine, LevelId, NotifyLevel, PropertyValue};
use crate::events::{NetPeerEvent, PayloadBundle, RemoteEvent};
use crate::host::{HostLists, NetHost, Network};
use crate::master::{MasterServerRegistry, PublishOutcome};
use crate::object::{NetObjectBinding, NetObjectRole, PropertyBinding, PropertyBindingKind};
use crate::space::SpaceState;
use crate::user::{NetUser, PendingUserAdd, UserTables};

/// The built-in channel every net object carries, always first.
const BUILTIN_CHANNEL: &str = "NetObject";
/// Built-in property: the user id for user objects, 0 otherwise.
const BUILTIN_USER_ID: &str = "NetUserId";
/// Built-in property: the owning user, 0 when unowned.
const BUILTIN_OWNER: &str = "NetUserOwnerUserId";
/// Hard cap on serialized basic host info.
const BASIC_HOST_INFO_MAX_BYTES: usize = 480;
/// Largest tick delta fed into record aging and publish timers, so a
/// debugger pause does not mass-expire records.
const MAX_FRAME_DELTA_MS: u64 = 250;

/// The peer's role for a whole open/close cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetRole {
    Unspecified,
    Client,
    Server,
    Offline,
    MasterServer,
}

impl NetRole {
    /// Servers and offline peers hold replication authority.
    pub fn is_authority(self) -> bool {
        matches!(self, Self::Server | Self::Offline)
    }
}

/// NetPeer failures.
#[derive(Debug, thiserror::Error)]
pub enum NetPeerError {
    #[error("the peer is not open")]
    NotOpen,

    #[error("the peer is already open")]
    AlreadyOpen,

    #[error("cannot open with role Unspecified")]
    InvalidRole,

    #[error("networking is suppressed in editor mode")]
    EditorMode,

    #[error("operation requires the {0:?} role")]
    WrongRole(NetRole),

    #[error("no net object bound to replica {0}")]
    UnknownObject(ReplicaId),

    #[error("no such user {0}")]
    UnknownUser(NetUserId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Replication(#[from] ReplicatorError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// The top-level network endpoint.
pub struct NetPeer {
    config: NetPeerConfig,
    role: NetRole,
    guid: u64,
    net_peer_id: NetPeerId,

    transport: Option<UdpPeer>,
    replicator: Replicator,

    /// Replica -> cog binding (role, property routes).
    bindings: FxHashMap<ReplicaId, NetObjectBinding>,
    cog_to_replica: FxHashMap<CogId, ReplicaId>,
    /// Client: emplaced cogs parked until a clone binds them, keyed like the
    /// replicator's pending set.
    pending_emplace_cogs: FxHashMap<(String, u32), (CogId, NetObjectRole, Vec<PropertyBinding>)>,

    spaces: FxHashMap<ReplicaId, SpaceState>,
    game_cog: CogId,
    game_replica: ReplicaId,

    users: UserTables,
    pending_user_adds: VecDeque<PendingUserAdd>,
    /// Client: requests already forwarded, answered in order.
    forwarded_user_adds: VecDeque<PendingUserAdd>,

    /// Server: assigned ids per client link.
    peer_ids: FxHashMap<SocketAddr, NetPeerId>,
    next_peer_id: u32,

    host_lists: HostLists,
    lan_discovery: Option<HostDiscovery>,
    internet_discovery: Option<HostDiscovery>,
    master_subscriptions: Vec<SocketAddr>,
    /// Client links opened only to fetch a record list.
    master_listing_links: FxHashSet<SocketAddr>,
    /// `(get_extra_info, remove_stale)` of the in-flight internet listing.
    pending_listing: Option<(bool, bool)>,

    master_registry: MasterServerRegistry,
    /// Master: receipt id -> link to drop once the record list is delivered.
    receipt_targets: FxHashMap<u64, SocketAddr>,
    next_receipt_id: u64,
    publish_elapsed_ms: u64,

    /// Client: the link to the server once connected.
    server_addr: Option<SocketAddr>,
    receiving_game_clone: bool,
    game_started_pending: bool,

    last_update_ms: u64,
    is_open: bool,
}

impl NetPeer {
    pub fn new(config: NetPeerConfig) -> Self {
        let record_lifetime = config.internet_host_record_lifetime_secs;
        let ip_limit = config.internet_same_ip_host_record_limit;
        Self {
            config,
            role: NetRole::Unspecified,
            guid: 0,
            net_peer_id: NetPeerId(0),
            transport: None,
            replicator: Replicator::new(ReplicatorRole::Client),
            bindings: FxHashMap::default(),
            cog_to_replica: FxHashMap::default(),
            pending_emplace_cogs: FxHashMap::default(),
            spaces: FxHashMap::default(),
            game_cog: CogId(0),
            game_replica: ReplicaId(0),
            users: UserTables::default(),
            pending_user_adds: VecDeque::new(),
            forwarded_user_adds: VecDeque::new(),
            peer_ids: FxHashMap::default(),
            next_peer_id: 1,
            host_lists: HostLists::default(),
            lan_discovery: None,
            internet_discovery: None,
            master_subscriptions: Vec::new(),
            master_listing_links: FxHashSet::default(),
            pending_listing: None,
            master_registry: MasterServerRegistry::new(record_lifetime, ip_limit),
            receipt_targets: FxHashMap::default(),
            next_receipt_id: 1,
            publish_elapsed_ms: 0,
            server_addr: None,
            receiving_game_clone: false,
            game_started_pending: false,
            last_update_ms: 0,
            is_open: false,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn role(&self) -> NetRole {
        self.role
    }

    /// Random GUID chosen at open.
    pub fn guid(&self) -> u64 {
        self.guid
    }

    pub fn net_peer_id(&self) -> NetPeerId {
        self.net_peer_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().map(UdpPeer::local_addr)
    }

    pub fn config(&self) -> &NetPeerConfig {
        &self.config
    }

    pub fn replicator(&self) -> &Replicator {
        &self.replicator
    }

    /// The cog bound to a replica, if any.
    pub fn object_cog(&self, replica: ReplicaId) -> Option<CogId> {
        self.bindings.get(&replica).map(|b| b.cog)
    }

    /// The replica bound to a cog, if any.
    pub fn replica_of(&self, cog: CogId) -> Option<ReplicaId> {
        self.cog_to_replica.get(&cog).copied()
    }

    /// An object's owning user id (0 when unowned or unknown).
    pub fn net_user_owner(&self, replica: ReplicaId) -> NetUserId {
        self.replicator
            .get(replica)
            .map(|r| r.owner_user)
            .unwrap_or_default()
    }

    pub fn user(&self, id: NetUserId) -> Option<&NetUser> {
        self.users.get(id)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn hosts(&self, network: Network) -> &[NetHost] {
        self.host_lists.hosts(network)
    }

    // -----------------------------------------------------------------------
    // Open / close
    // -----------------------------------------------------------------------

    /// Opens the peer: binds the socket (walking the port retries), installs
    /// the replicator for the role, and emplaces the game session, its
    /// spaces, and their objects in game-setup order. Servers and offline
    /// peers fire `NetGameStarted` immediately.
    pub fn open<E: GameEngine>(
        &mut self,
        engine: &mut E,
        role: NetRole,
        port: u16,
        game_cog: CogId,
    ) -> Result<(), NetPeerError> {
        if self.is_open {
            return Err(NetPeerError::AlreadyOpen);
        }
        if role == NetRole::Unspecified {
            return Err(NetPeerError::InvalidRole);
        }
        if engine.is_editor_mode() {
            return Err(NetPeerError::EditorMode);
        }

        self.guid = rand::rng().random();
        let transport_config = UdpPeerConfig {
            port_retries: self.config.port_retries,
            idle_timeout_ms: self.config.link_idle_timeout_ms,
            ..Default::default()
        };
        let transport = UdpPeer::open(self.config.bind_ip, port, self.guid, transport_config)?;
        tracing::info!(role = ?role, addr = %transport.local_addr(), "net peer open");

        self.role = role;
        self.transport = Some(transport);
        self.replicator = Replicator::new(if role == NetRole::Client {
            ReplicatorRole::Client
        } else {
            ReplicatorRole::Authority
        });
        self.net_peer_id = NetPeerId(0);
        self.last_update_ms = engine.now_ms();

        let port_range = (
            self.config.host_port_range_start,
            self.config.host_port_range_end,
        );
        self.lan_discovery = Some(HostDiscovery::new(
            Network::Lan,
            self.config.project_guid,
            port_range,
        ));
        self.internet_discovery = Some(HostDiscovery::new(
            Network::Internet,
            self.config.project_guid,
            port_range,
        ));

        self.game_cog = game_cog;
        if role != NetRole::MasterServer {
            self.emplace_game_setup(engine)?;
        }

        self.is_open = true;
        engine.dispatch(NetPeerEvent::NetPeerOpened);
        if role.is_authority() {
            // Everything emplaced at open is live; bring it online in order.
            let ids: Vec<ReplicaId> = self.replicator.live_ids().to_vec();
            for id in ids {
                self.bring_online(engine, id);
            }
            engine.dispatch(NetPeerEvent::NetGameStarted);
        }
        Ok(())
    }

    /// Emplaces self, then each space, then each object in each space, all
    /// under the game-setup context. Both sides run this at open in the same
    /// order, which is what makes the emplace ids line up.
    fn emplace_game_setup<E: GameEngine>(&mut self, engine: &mut E) -> Result<(), NetPeerError> {
        let context = EmplaceContext::game_setup();

        let game_cog = self.game_cog;
        let game_replica =
            self.register_emplaced(engine, game_cog, NetObjectRole::Peer, &context)?;
        self.game_replica = game_replica;

        for space_cog in engine.spaces_of_game(game_cog) {
            let space_replica =
                self.register_emplaced(engine, space_cog, NetObjectRole::Space, &context)?;
            if space_replica != ReplicaId(0) {
                self.spaces
                    .insert(space_replica, SpaceState::new(space_replica, space_cog));
            }
            for object_cog in engine.objects_in_space(space_cog) {
                self.register_emplaced(engine, object_cog, NetObjectRole::Plain, &context)?;
            }
        }
        Ok(())
    }

    /// Closes the peer: cancels discovery, clears host lists, disconnects
    /// every link, and forgets every replica in reverse open order.
    pub fn close<E: GameEngine>(&mut self, engine: &mut E) {
        if !self.is_open {
            return;
        }
        if let Some(discovery) = &mut self.lan_discovery {
            discovery.cancel();
        }
        if let Some(discovery) = &mut self.internet_discovery {
            discovery.cancel();
        }
        self.host_lists.clear_all();

        if let Some(transport) = &mut self.transport {
            for addr in transport.connected_links() {
                let _ = transport.disconnect(
                    addr,
                    DisconnectReason::Request,
                    PayloadBundle::new().to_stream(),
                );
            }
        }

        // Offline events in reverse of the open-time emplace order.
        let drained = self.replicator.clear();
        for replica in &drained {
            let id = replica.id();
            if let Some(binding) = self.bindings.remove(&id) {
                self.cog_to_replica.remove(&binding.cog);
                if binding.role != NetObjectRole::Plain {
                    engine.dispatch(binding.role.offline_event(binding.cog, id));
                }
                engine.dispatch(NetPeerEvent::NetObjectOffline {
                    object: binding.cog,
                    replica: id,
                });
            }
        }

        self.pending_emplace_cogs.clear();
        self.spaces.clear();
        self.users.clear();
        self.pending_user_adds.clear();
        self.forwarded_user_adds.clear();
        self.peer_ids.clear();
        self.master_listing_links.clear();
        self.pending_listing = None;
        self.master_registry.clear();
        self.receipt_targets.clear();
        self.server_addr = None;
        self.receiving_game_clone = false;
        self.game_started_pending = false;
        self.transport = None;
        self.role = NetRole::Unspecified;
        self.is_open = false;
        engine.dispatch(NetPeerEvent::NetPeerClosed);
    }

    // -----------------------------------------------------------------------
    // Object registration
    // -----------------------------------------------------------------------

    /// Builds a replica (built-in channel first, then reflected channels in
    /// first-appearance order) plus the property routes back to reflection.
    fn build_replica<E: GameEngine>(
        &self,
        engine: &E,
        cog: CogId,
        replica_type: ReplicaType,
        create_context: CreateContext,
    ) -> (Replica, Vec<PropertyBinding>) {
        let mut replica = Replica::new(replica_type, create_context);

        let mut builtin = ReplicaChannel::new(
            BUILTIN_CHANNEL,
            ChannelConfig {
                detection_mode: DetectionMode::Manumatic,
                ..Default::default()
            },
        );
        builtin.add_property(ReplicaProperty::new(
            BUILTIN_USER_ID,
            NetValue::Integer(0),
            PropertyConfig::default(),
        ));
        builtin.add_property(ReplicaProperty::new(
            BUILTIN_OWNER,
            NetValue::Integer(0),
            PropertyConfig::default(),
        ));
        replica.add_channel(builtin);

        let mut bindings = Vec::new();
        for info in engine.net_properties(cog) {
            let Ok(value) = engine.get_property(cog, &info.component, &info.property) else {
                continue;
            };
            let (net_value, kind) = self.property_to_net(&value);
            if replica.channel(&info.channel).is_none() {
                replica.add_channel(ReplicaChannel::new(&info.channel, info.channel_config.clone()));
            }
            let channel = replica.channel_mut(&info.channel).expect("just added");
            channel.add_property(ReplicaProperty::new(
                &info.property,
                net_value,
                info.property_config.clone(),
            ));
            bindings.push(PropertyBinding {
                channel: info.channel.clone(),
                property: info.property.clone(),
                component: info.component.clone(),
                kind,
            });
        }
        (replica, bindings)
    }

    fn property_to_net(&self, value: &PropertyValue) -> (NetValue, PropertyBindingKind) {
        match value {
            PropertyValue::Value(v) => (v.clone(), PropertyBindingKind::Plain),
            PropertyValue::Cog(cog) => {
                let id = cog
                    .and_then(|c| self.cog_to_replica.get(&c).copied())
                    .unwrap_or_default();
                (NetValue::Integer(id.0 as i32), PropertyBindingKind::Cog)
            }
            PropertyValue::CogPath(path) => {
                (NetValue::String(path.clone()), PropertyBindingKind::CogPath)
            }
        }
    }

    fn net_to_property(&self, value: &NetValue, kind: PropertyBindingKind) -> PropertyValue {
        match kind {
            PropertyBindingKind::Plain => PropertyValue::Value(value.clone()),
            PropertyBindingKind::Cog => {
                let id = match value {
                    NetValue::Integer(raw) => ReplicaId(*raw as u32),
                    _ => ReplicaId(0),
                };
                PropertyValue::Cog(self.bindings.get(&id).map(|b| b.cog))
            }
            PropertyBindingKind::CogPath => {
                let path = match value {
                    NetValue::String(s) => s.clone(),
                    _ => String::new(),
                };
                PropertyValue::CogPath(path)
            }
        }
    }

    /// Emplaces one cog. On the authority the replica goes live and its id
    /// is returned; on a client it parks and `ReplicaId(0)` comes back.
    fn register_emplaced<E: GameEngine>(
        &mut self,
        engine: &mut E,
        cog: CogId,
        role: NetObjectRole,
        context: &EmplaceContext,
    ) -> Result<ReplicaId, NetPeerError> {
        let replica_type = engine.archetype_of(cog).unwrap_or_default();
        let create_context = self.create_context_for(engine, cog, role);
        let (replica, property_bindings) =
            self.build_replica(engine, cog, replica_type, create_context);
        let (id, emplace_id) = self.replicator.emplace(replica, context)?;

        if id != ReplicaId(0) {
            self.bindings.insert(
                id,
                NetObjectBinding {
                    cog,
                    role,
                    properties: property_bindings,
                },
            );
            self.cog_to_replica.insert(cog, id);
        } else {
            self.pending_emplace_cogs.insert(
                (context.as_str().to_string(), emplace_id),
                (cog, role, property_bindings),
            );
        }
        Ok(id)
    }

    fn create_context_for<E: GameEngine>(
        &self,
        engine: &E,
        cog: CogId,
        role: NetObjectRole,
    ) -> CreateContext {
        match role {
            NetObjectRole::Peer | NetObjectRole::Space => CreateContext(ReplicaId(0)),
            _ => {
                let space_replica = engine
                    .space_of(cog)
                    .and_then(|space| self.cog_to_replica.get(&space).copied())
                    .unwrap_or_default();
                CreateContext(space_replica)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Connect / disconnect
    // -----------------------------------------------------------------------

    /// Client: connects to a server. The request carries the payload bundle
    /// and the count of user-add requests queued behind it.
    pub fn connect(
        &mut self,
        addr: SocketAddr,
        payload: PayloadBundle,
    ) -> Result<(), NetPeerError> {
        if !self.is_open {
            return Err(NetPeerError::NotOpen);
        }
        if self.role != NetRole::Client {
            return Err(NetPeerError::WrongRole(NetRole::Client));
        }
        let pending = self.pending_user_adds.len() as u32;
        self.transport_mut()?
            .connect(addr, payload.to_stream(), pending)?;
        Ok(())
    }

    /// Disconnects one link.
    pub fn disconnect(&mut self, addr: SocketAddr) -> Result<(), NetPeerError> {
        self.transport_mut()?.disconnect(
            addr,
            DisconnectReason::Request,
            PayloadBundle::new().to_stream(),
        )?;
        Ok(())
    }

    fn transport_mut(&mut self) -> Result<&mut UdpPeer, NetPeerError> {
        self.transport.as_mut().ok_or(NetPeerError::NotOpen)
    }

    /// Connected links that carry game traffic (master-listing links are
    /// excluded).
    fn game_links(&self) -> Vec<SocketAddr> {
        let Some(transport) = &self.transport else {
            return Vec::new();
        };
        transport
            .connected_links()
            .into_iter()
            .filter(|addr| !self.master_listing_links.contains(addr))
            .collect()
    }

    // -----------------------------------------------------------------------
    // The tick
    // -----------------------------------------------------------------------

    /// One engine tick: pump the transport, dispatch handshake callbacks,
    /// advance discovery and pending requests, run per-space updates, run
    /// the replicator, and flush sends.
    pub fn update<E: GameEngine>(&mut self, engine: &mut E) {
        if !self.is_open {
            return;
        }
        let now = engine.now_ms();
        let dt_ms = now.saturating_sub(self.last_update_ms).min(MAX_FRAME_DELTA_MS);
        self.last_update_ms = now;

        let events = match &mut self.transport {
            Some(transport) => {
                transport.update(now);
                transport.drain_events()
            }
            None => Vec::new(),
        };
        for event in events {
            self.handle_transport_event(engine, event, now);
        }

        self.update_discovery(engine, now);
        self.process_pending_user_adds(engine);
        self.update_spaces(engine);
        self.run_replication(engine, now);
        self.update_master_duties(engine, dt_ms);
    }

    fn update_discovery<E: GameEngine>(&mut self, engine: &mut E, now: u64) {
        for network in [Network::Lan, Network::Internet] {
            let Some(mut discovery) = self.take_discovery(network) else {
                continue;
            };
            if let Some(transport) = &mut self.transport {
                discovery.update(now, transport);
            }
            let events = discovery.drain_events();
            self.put_discovery(network, discovery);
            for event in events {
                self.handle_discovery_event(engine, network, event);
            }
        }
    }

    fn take_discovery(&mut self, network: Network) -> Option<HostDiscovery> {
        match network {
            Network::Lan => self.lan_discovery.take(),
            Network::Internet => self.internet_discovery.take(),
        }
    }

    fn put_discovery(&mut self, network: Network, discovery: HostDiscovery) {
        match network {
            Network::Lan => self.lan_discovery = Some(discovery),
            Network::Internet => self.internet_discovery = Some(discovery),
        }
    }

    fn update_spaces<E: GameEngine>(&mut self, engine: &mut E) {
        if self.game_started_pending {
            self.game_started_pending = false;
            engine.dispatch(NetPeerEvent::NetGameStarted);
        }
        let pending: Vec<(ReplicaId, LevelId)> = self
            .spaces
            .values_mut()
            .filter_map(|space| space.level_started_pending.take().map(|l| (space.replica, l)))
            .collect();
        for (space_replica, level) in pending {
            let Some(space) = self.spaces.get(&space_replica) else {
                continue;
            };
            engine.dispatch(NetPeerEvent::NetLevelStarted {
                space: space.cog,
                level,
            });
        }
    }

    fn run_replication<E: GameEngine>(&mut self, engine: &mut E, now: u64) {
        // Sample authoritative values out of the cogs.
        let our_peer = self.net_peer_id;
        let authority = self.role.is_authority();
        let ids: Vec<ReplicaId> = self.replicator.live_ids().to_vec();
        for id in &ids {
            self.sample_object(engine, *id, now);
        }

        // Detect and emit change frames.
        let adder_of: FxHashMap<NetUserId, NetPeerId> = self
            .users
            .iter()
            .map(|u| (u.user_id, u.added_by))
            .collect();
        let frames = self.replicator.detect_changes(|replica, channel_index| {
            let channel = &replica.channels()[channel_index];
            match channel.config.authority {
                AuthorityMode::Fixed => authority,
                AuthorityMode::Dynamic => {
                    let owner_peer = adder_of.get(&replica.owner_user).copied();
                    if authority {
                        // The server keeps emitting until authority points at
                        // a client peer.
                        owner_peer.unwrap_or(NetPeerId(0)) == NetPeerId(0)
                    } else {
                        owner_peer == Some(our_peer) && our_peer != NetPeerId(0)
                    }
                }
            }
        });

        if !frames.is_empty() {
            let targets: Vec<SocketAddr> = if authority {
                self.game_links()
            } else {
                self.server_addr.into_iter().collect()
            };
            for frame in frames {
                let mut body = BitStream::new();
                body.write_u32(frame.replica.0);
                body.write_u8(frame.channel_index as u8);
                body.write_stream(&frame.data);
                let kind = match frame.reliability {
                    ReliabilityMode::Reliable => ChannelKind::ReliableOrdered,
                    ReliabilityMode::Sequenced => ChannelKind::Unreliable,
                };
                let message = Message::new(MessageType::ReplicaChange, body);
                for &addr in &targets {
                    if let Some(transport) = &mut self.transport {
                        let _ = transport.send(addr, kind, &message, None);
                    }
                }
            }
        }

        // Converge and push remotely-applied values into the cogs.
        if !authority {
            for id in &ids {
                if let Some(replica) = self.replicator.get_mut(*id) {
                    replica.converge_step();
                }
                self.push_applied(engine, *id);
            }
        }
    }

    /// Reads current cog values into the replica's properties (authority
    /// side of change detection).
    fn sample_object<E: GameEngine>(&mut self, engine: &E, id: ReplicaId, now: u64) {
        let Some(binding) = self.bindings.get(&id) else {
            return;
        };
        if !self.role.is_authority() && !self.has_dynamic_authority(id) {
            return;
        }
        let routes: Vec<PropertyBinding> = binding.properties.clone();
        let cog = binding.cog;
        for route in routes {
            let Ok(value) = engine.get_property(cog, &route.component, &route.property) else {
                continue;
            };
            let (net_value, _) = self.property_to_net(&value);
            if let Some(replica) = self.replicator.get_mut(id)
                && let Some(channel) = replica.channel_mut(&route.channel)
                && let Some(property) = channel.property_mut(&route.property)
            {
                property.set_value(net_value, now);
            }
        }
    }

    fn has_dynamic_authority(&self, id: ReplicaId) -> bool {
        let Some(replica) = self.replicator.get(id) else {
            return false;
        };
        let owner_peer = self
            .users
            .get(replica.owner_user)
            .map(|u| u.added_by);
        owner_peer == Some(self.net_peer_id)
            && self.net_peer_id != NetPeerId(0)
            && replica
                .channels()
                .iter()
                .any(|c| c.config.authority == AuthorityMode::Dynamic)
    }

    /// Writes remotely-applied (and converged) values back into the cog.
    fn push_applied<E: GameEngine>(&mut self, engine: &mut E, id: ReplicaId) {
        let Some(binding) = self.bindings.get(&id) else {
            return;
        };
        let cog = binding.cog;
        let routes: Vec<PropertyBinding> = binding.properties.clone();
        for route in routes {
            let applied = self
                .replicator
                .get(id)
                .and_then(|r| r.channel(&route.channel))
                .and_then(|c| c.property(&route.property))
                .map(|p| p.applied().clone());
            if let Some(value) = applied {
                let property_value = self.net_to_property(&value, route.kind);
                let _ = engine.set_property(cog, &route.component, &route.property, property_value);
            }
        }
    }

    fn update_master_duties<E: GameEngine>(&mut self, engine: &mut E, dt_ms: u64) {
        if self.role == NetRole::MasterServer {
            let expired = self.master_registry.tick(dt_ms as f64 / 1000.0);
            for record in expired {
                engine.dispatch(NetPeerEvent::NetHostRecordExpired {
                    address: record.address,
                });
            }
        }

        // Discoverable servers publish to their subscribed master servers.
        if self.role == NetRole::Server && self.config.internet_discoverable {
            self.publish_elapsed_ms += dt_ms;
            let interval_ms = (self.config.internet_host_publish_interval_secs * 1000.0) as u64;
            if interval_ms > 0 && self.publish_elapsed_ms >= interval_ms {
                self.publish_elapsed_ms -= interval_ms;
                if let Some(info) = self.acquire_checked_basic_info(engine) {
                    let data = HostPublishData {
                        project_guid: self.config.project_guid,
                        basic_host_info: info,
                    };
                    let mut body = BitStream::new();
                    data.write(&mut body);
                    let message = Message::new(MessageType::NetHostPublish, body);
                    let subscriptions = self.master_subscriptions.clone();
                    for addr in subscriptions {
                        if let Some(transport) = &mut self.transport {
                            let _ = transport.send_unconnected(addr, &message);
                        }
                    }
                }
            }
        }
    }

    fn acquire_checked_basic_info<E: GameEngine>(&mut self, engine: &mut E) -> Option<BitStream> {
        let stream = engine.acquire_basic_host_info().to_stream();
        if stream.bytes_written() > BASIC_HOST_INFO_MAX_BYTES {
            engine.notify(
                NotifyLevel::Error,
                "Basic Host Info Too Large",
                "Serialized basic host information must fit within 480 bytes",
            );
            return None;
        }
        Some(stream)
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    fn handle_transport_event<E: GameEngine>(
        &mut self,
        engine: &mut E,
        event: TransportEvent,
        now: u64,
    ) {
        match event {
            TransportEvent::ConnectRequested { from, request } => {
                self.handle_connect_requested(engine, from, request);
            }
            TransportEvent::ConnectResponded { from, response } => {
                let bundle = Self::parse_bundle(response.payload.clone());
                engine.dispatch(NetPeerEvent::NetPeerConnectResponded {
                    from,
                    accepted: response.accepted,
                    response: bundle,
                });
                if response.accepted {
                    if self.master_listing_links.contains(&from) {
                        // The record list follows on the link; nothing to do.
                    } else if self.role == NetRole::Client {
                        self.net_peer_id = NetPeerId(response.assigned_peer_id);
                        self.server_addr = Some(from);
                        self.forward_queued_user_adds(from);
                    }
                } else if self.master_listing_links.remove(&from) {
                    tracing::warn!(%from, "master server denied the record-list connection");
                }
            }
            TransportEvent::LinkConnected { addr, remote_guid } => {
                engine.dispatch(NetPeerEvent::NetLinkConnected { addr, remote_guid });
            }
            TransportEvent::LinkDisconnected {
                addr,
                reason,
                payload,
            } => {
                self.handle_link_disconnected(engine, addr, reason, payload);
            }
            TransportEvent::MessageReceived { from, message } => {
                self.handle_message(engine, from, message, now);
            }
            TransportEvent::UnconnectedReceived { from, message } => {
                self.handle_unconnected(engine, from, message, now);
            }
            TransportEvent::ReceiptAcknowledged { addr, receipt_id } => {
                // The master server drops a listing link once its record
                // list is confirmed delivered.
                if let Some(target) = self.receipt_targets.remove(&receipt_id)
                    && let Some(transport) = &mut self.transport
                {
                    debug_assert_eq!(target, addr);
                    let _ = transport.disconnect(
                        target,
                        DisconnectReason::Request,
                        PayloadBundle::new().to_stream(),
                    );
                }
            }
            TransportEvent::SocketError { message, code } => {
                engine.notify(
                    NotifyLevel::Error,
                    "Socket Error",
                    &match code {
                        Some(code) => format!("{message} (os error {code})"),
                        None => message,
                    },
                );
            }
        }
    }

    fn parse_bundle(mut stream: BitStream) -> PayloadBundle {
        PayloadBundle::from_stream(&mut stream, NetPeerId(0)).unwrap_or_default()
    }

    fn handle_connect_requested<E: GameEngine>(
        &mut self,
        engine: &mut E,
        from: SocketAddr,
        request: quasar_net::ConnectRequestData,
    ) {
        match self.role {
            NetRole::MasterServer => {
                // Accept, push the record list with a receipt, and wait for
                // the receipt to drop the link.
                let Ok(transport) = self.transport_mut() else {
                    return;
                };
                if transport
                    .respond_connect(from, true, 0, PayloadBundle::new().to_stream())
                    .is_err()
                {
                    return;
                }
                let list = self.master_registry.record_list();
                let mut body = BitStream::new();
                list.write(&mut body);
                let receipt_id = self.next_receipt_id;
                self.next_receipt_id += 1;
                self.receipt_targets.insert(receipt_id, from);
                if let Some(transport) = &mut self.transport {
                    let _ = transport.send(
                        from,
                        ChannelKind::ReliableOrdered,
                        &Message::new(MessageType::NetHostRecordList, body),
                        Some(receipt_id),
                    );
                }
            }
            NetRole::Server => {
                let bundle = Self::parse_bundle(request.payload.clone());
                let decision =
                    engine.handle_connect_request(from, &bundle, request.pending_user_adds);
                if decision.accept {
                    let assigned = NetPeerId(self.next_peer_id);
                    self.next_peer_id += 1;
                    self.peer_ids.insert(from, assigned);
                    let response = decision.response.to_stream();
                    if let Ok(transport) = self.transport_mut()
                        && transport
                            .respond_connect(from, true, assigned.0, response)
                            .is_ok()
                    {
                        self.clone_game_to_link(from);
                    }
                } else if let Ok(transport) = self.transport_mut() {
                    let _ = transport.respond_connect(from, false, 0, decision.response.to_stream());
                }
            }
            _ => {
                // Clients and offline peers accept no connections.
                if let Ok(transport) = self.transport_mut() {
                    let _ =
                        transport.respond_connect(from, false, 0, PayloadBundle::new().to_stream());
                }
            }
        }
    }

    fn handle_link_disconnected<E: GameEngine>(
        &mut self,
        engine: &mut E,
        addr: SocketAddr,
        reason: DisconnectReason,
        payload: BitStream,
    ) {
        self.master_listing_links.remove(&addr);
        engine.dispatch(NetPeerEvent::NetLinkDisconnected {
            addr,
            reason,
            payload: Self::parse_bundle(payload),
        });

        if self.role == NetRole::Server
            && let Some(peer_id) = self.peer_ids.remove(&addr)
        {
            // A departing peer takes its users with it.
            for user_id in self.users.added_by(peer_id) {
                let _ = self.remove_user_internal(engine, user_id, PayloadBundle::new());
            }
        }
        if self.server_addr == Some(addr) {
            self.server_addr = None;
        }
    }

    // -----------------------------------------------------------------------
    // Unconnected traffic (pings, pongs, publishes)
    // -----------------------------------------------------------------------

    fn handle_unconnected<E: GameEngine>(
        &mut self,
        engine: &mut E,
        from: SocketAddr,
        mut message: Message,
        now: u64,
    ) {
        match message.ty {
            MessageType::NetHostPing => {
                let Ok(ping) = HostPingData::read(&mut message.payload) else {
                    return;
                };
                self.answer_ping(engine, from, ping);
            }
            MessageType::NetHostPong => {
                let Ok(pong) = HostPongData::read(&mut message.payload) else {
                    return;
                };
                let from_master = self.master_subscriptions.contains(&from);
                if pong.project_guid != self.config.project_guid && !from_master {
                    return;
                }
                let mut consumed = false;
                if let Some(discovery) = &mut self.lan_discovery {
                    consumed = discovery.receive_pong(from, &pong, now);
                }
                if !consumed && let Some(discovery) = &mut self.internet_discovery {
                    discovery.receive_pong(from, &pong, now);
                }
            }
            MessageType::NetHostPublish => {
                if self.role != NetRole::MasterServer {
                    return;
                }
                let Ok(publish) = HostPublishData::read(&mut message.payload) else {
                    return;
                };
                match self.master_registry.receive_publish(
                    from,
                    publish.project_guid,
                    publish.basic_host_info,
                ) {
                    PublishOutcome::Discovered => {
                        engine.dispatch(NetPeerEvent::NetHostRecordDiscovered { address: from });
                    }
                    PublishOutcome::Updated => {
                        engine.dispatch(NetPeerEvent::NetHostRecordUpdate { address: from });
                    }
                    PublishOutcome::Rejected => {}
                }
            }
            _ => {}
        }
    }

    /// Answers a host ping per role. Clients and undiscoverable peers stay
    /// silent.
    fn answer_ping<E: GameEngine>(&mut self, engine: &mut E, from: SocketAddr, ping: HostPingData) {
        match self.role {
            NetRole::MasterServer => {
                // The request bundle names the project and host wanted.
                let mut payload = ping.payload.clone();
                let Ok(project_guid) = payload.read_u64() else {
                    return;
                };
                let Ok(host_addr) = quasar_net::read_socket_addr(&mut payload) else {
                    return;
                };
                // Presence checked before use; an unknown record is silence.
                let Some(record) = self.master_registry.find(project_guid, host_addr) else {
                    return;
                };
                let mut pong_payload = BitStream::new();
                write_socket_addr(&mut pong_payload, record.address);
                pong_payload.write_stream(&record.basic_info);
                let pong = make_pong(self.config.project_guid, &ping, pong_payload);
                if let Some(transport) = &mut self.transport {
                    let _ = transport.send_unconnected(from, &pong);
                }
            }
            NetRole::Server => {
                if !self.config.lan_discoverable && !self.config.internet_discoverable {
                    return;
                }
                if ping.project_guid != self.config.project_guid {
                    return;
                }
                // Direct probe payloads lead with a wants-extra bit.
                let wants_extra = ping.payload.clone().read_bool().unwrap_or(false);
                let info = if wants_extra {
                    let stream = engine.acquire_extra_host_info().to_stream();
                    let max = self
                        .transport
                        .as_ref()
                        .map_or(usize::MAX, UdpPeer::max_message_bytes);
                    if stream.bytes_written() > max {
                        engine.notify(
                            NotifyLevel::Error,
                            "Extra Host Info Too Large",
                            "Serialized extra NetHost information must fit in one message",
                        );
                        return;
                    }
                    stream
                } else {
                    let Some(stream) = self.acquire_checked_basic_info(engine) else {
                        return;
                    };
                    stream
                };
                let pong = make_pong(self.config.project_guid, &ping, info);
                if let Some(transport) = &mut self.transport {
                    let _ = transport.send_unconnected(from, &pong);
                }
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Channeled messages
    // -----------------------------------------------------------------------

    fn handle_message<E: GameEngine>(
        &mut self,
        engine: &mut E,
        from: SocketAddr,
        mut message: Message,
        now: u64,
    ) {
        let sender = self.peer_ids.get(&from).copied().unwrap_or(NetPeerId(0));
        let result: Result<(), NetPeerError> = match message.ty {
            MessageType::ReplicaSpawn | MessageType::ReplicaClone => {
                self.apply_object_stream(engine, &mut message.payload, now)
            }
            MessageType::ReplicaForget => self.handle_remote_forget(engine, &mut message.payload),
            MessageType::ReplicaDestroy => {
                self.handle_remote_destroy(engine, from, &mut message.payload)
            }
            MessageType::ReplicaChange => {
                self.handle_replica_change(engine, from, sender, &mut message.payload, now)
            }
            MessageType::ReplicaInterrupt => Ok(()),
            MessageType::NetGameLoadStarted => {
                self.receiving_game_clone = true;
                engine.dispatch(NetPeerEvent::NetGameLoadStarted { from });
                Ok(())
            }
            MessageType::NetGameLoadFinished => {
                self.finish_game_clone(engine, from);
                Ok(())
            }
            MessageType::NetLevelLoadStarted => {
                self.handle_level_load_started(engine, &mut message.payload)
            }
            MessageType::NetLevelLoadFinished => {
                self.handle_level_load_finished(engine, &mut message.payload)
            }
            MessageType::NetUserAddRequest => {
                let bundle = Self::parse_bundle(message.payload.read_remaining());
                self.process_user_add(engine, Some(from), sender, bundle)
            }
            MessageType::NetUserAddResponse => {
                self.handle_user_add_response(engine, &mut message.payload)
            }
            MessageType::NetUserRemoveRequest => {
                let user = NetUserId(message.payload.read_u32().unwrap_or_default());
                let bundle = Self::parse_bundle(message.payload.read_remaining());
                if self.role.is_authority() {
                    self.remove_user_internal(engine, user, bundle)
                } else {
                    Ok(())
                }
            }
            MessageType::NetEvent => self.handle_net_event(engine, sender, &mut message.payload),
            MessageType::NetHostRecordList => self.handle_record_list(from, &mut message.payload, now),
            _ => Ok(()),
        };
        if let Err(error) = result {
            tracing::warn!(%from, ty = ?message.ty, %error, "failed to process message");
            // A known type whose body would not deserialize means the link
            // is desynchronized; drop it. Stale ids and the like are not
            // fatal.
            let malformed = matches!(
                error,
                NetPeerError::Replication(
                    ReplicatorError::Bits(_) | ReplicatorError::Stream(_)
                )
            );
            if malformed && let Some(transport) = &mut self.transport {
                let _ = transport.disconnect(
                    from,
                    DisconnectReason::Error,
                    PayloadBundle::new().to_stream(),
                );
            }
        }
    }

    fn handle_replica_change<E: GameEngine>(
        &mut self,
        engine: &mut E,
        from: SocketAddr,
        sender: NetPeerId,
        payload: &mut BitStream,
        now: u64,
    ) -> Result<(), NetPeerError> {
        let id = ReplicaId(payload.read_u32().map_err(ReplicatorError::Bits)?);
        let channel_index = payload.read_u8().map_err(ReplicatorError::Bits)? as usize;

        // On the authority, only the dynamic-authority peer may drive a
        // channel.
        if self.role.is_authority() {
            let authorized = self
                .replicator
                .get(id)
                .and_then(|r| r.channels().get(channel_index))
                .is_some_and(|c| {
                    c.config.authority == AuthorityMode::Dynamic
                        && self
                            .replicator
                            .get(id)
                            .and_then(|r| self.users.get(r.owner_user))
                            .is_some_and(|u| u.added_by == sender)
                });
            if !authorized {
                tracing::warn!(%from, replica = %id, "ignoring unauthorized change frame");
                return Ok(());
            }
        }

        let previous_owner = self.net_user_owner(id);
        self.replicator.apply_change(id, channel_index, payload, now)?;

        // Owner changes ride the built-in channel; react when they land.
        if channel_index == 0 {
            let new_owner = self
                .replicator
                .get(id)
                .and_then(|r| r.channel(BUILTIN_CHANNEL))
                .and_then(|c| c.property(BUILTIN_OWNER))
                .and_then(|p| match p.value() {
                    NetValue::Integer(raw) => Some(NetUserId(*raw as u32)),
                    _ => None,
                })
                .unwrap_or_default();
            if new_owner != previous_owner {
                self.apply_ownership(engine, id, new_owner);
            }
        }

        // Forward authoritative re-broadcast of client-driven changes.
        if self.role.is_authority() {
            let mut body = BitStream::new();
            body.write_u32(id.0);
            body.write_u8(channel_index as u8);
            if let Some(replica) = self.replicator.get(id)
                && let Some(channel) = replica.channels().get(channel_index)
            {
                channel.write_snapshot(&mut body);
                let kind = match channel.config.reliability {
                    ReliabilityMode::Reliable => ChannelKind::ReliableOrdered,
                    ReliabilityMode::Sequenced => ChannelKind::Unreliable,
                };
                let message = Message::new(MessageType::ReplicaChange, body);
                for addr in self.game_links() {
                    if addr == from {
                        continue;
                    }
                    if let Some(transport) = &mut self.transport {
                        let _ = transport.send(addr, kind, &message, None);
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_remote_forget<E: GameEngine>(
        &mut self,
        engine: &mut E,
        payload: &mut BitStream,
    ) -> Result<(), NetPeerError> {
        let id = ReplicaId(payload.read_u32().map_err(ReplicatorError::Bits)?);
        self.forget_object(engine, id);
        Ok(())
    }

    fn handle_remote_destroy<E: GameEngine>(
        &mut self,
        engine: &mut E,
        from: SocketAddr,
        payload: &mut BitStream,
    ) -> Result<(), NetPeerError> {
        let id = ReplicaId(payload.read_u32().map_err(ReplicatorError::Bits)?);
        if self.role.is_authority() {
            // Only the authority issues destroys.
            tracing::warn!(%from, replica = %id, "ignoring destroy from non-authority");
            return Ok(());
        }
        let cog = self.object_cog(id);
        self.forget_object(engine, id);
        if let Some(cog) = cog {
            engine.destroy_cog(cog);
        }
        Ok(())
    }

    /// Removes the replica from local tracking, firing offline events. The
    /// cog is untouched.
    fn forget_object<E: GameEngine>(&mut self, engine: &mut E, id: ReplicaId) {
        self.take_offline(engine, id);
        self.replicator.forget(id);
        if let Some(binding) = self.bindings.remove(&id) {
            self.cog_to_replica.remove(&binding.cog);
            if let NetObjectRole::Space = binding.role {
                self.spaces.remove(&id);
            }
        }
        for space in self.spaces.values_mut() {
            space.remove_deferred_child(id);
        }
    }

    fn handle_net_event<E: GameEngine>(
        &mut self,
        engine: &mut E,
        sender: NetPeerId,
        payload: &mut BitStream,
    ) -> Result<(), NetPeerError> {
        let target = ReplicaId::read_quantized(payload).map_err(ReplicatorError::Bits)?;
        let event = match RemoteEvent::read(payload, sender, None) {
            Ok(event) => event,
            Err(error) => {
                engine.notify(
                    NotifyLevel::Warning,
                    "Invalid Net Event",
                    &format!("Failed to deserialize a network event: {error}"),
                );
                return Ok(());
            }
        };
        let Some(binding) = self.bindings.get(&target) else {
            tracing::warn!(replica = %target, "net event for unknown object dropped");
            return Ok(());
        };
        engine.dispatch(NetPeerEvent::NetEventReceived {
            object: binding.cog,
            event,
            sender,
        });
        Ok(())
    }

    fn handle_record_list(
        &mut self,
        from: SocketAddr,
        payload: &mut BitStream,
        now: u64,
    ) -> Result<(), NetPeerError> {
        let list = HostRecordListData::read(payload).map_err(ReplicatorError::Bits)?;
        if !self.master_listing_links.contains(&from) {
            tracing::warn!(%from, "unexpected host record list");
            return Ok(());
        }
        let (get_extra_info, remove_stale) = self.pending_listing.take().unwrap_or((false, false));
        let listed: Vec<(SocketAddr, BitStream)> = list
            .records
            .into_iter()
            .map(|record| (record.address, record.basic_host_info))
            .collect();
        if let Some(mut discovery) = self.internet_discovery.take() {
            if let Some(transport) = &mut self.transport {
                discovery.begin_internet_listing(
                    listed,
                    get_extra_info,
                    remove_stale,
                    self.config.host_ping_timeout_ms,
                    now,
                    transport,
                );
            }
            self.internet_discovery = Some(discovery);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Game and level cloning
    // -----------------------------------------------------------------------

    /// Brings a freshly-accepted client up to date: game, spaces, levels,
    /// objects, all on the reliable-ordered channel so the interrupt
    /// barriers hold.
    fn clone_game_to_link(&mut self, addr: SocketAddr) {
        self.send_ordered(addr, Message::empty(MessageType::NetGameLoadStarted), None);

        let game = self.game_replica;
        self.send_object_stream(addr, game, MessageType::ReplicaClone, false);

        let space_ids: Vec<ReplicaId> = self
            .replicator
            .live_ids()
            .iter()
            .copied()
            .filter(|id| self.spaces.contains_key(id))
            .collect();
        for space_id in space_ids {
            self.send_object_stream(addr, space_id, MessageType::ReplicaClone, false);
            self.clone_level_to_link(addr, space_id);
        }

        // Live objects that sit outside every space (created-as-space
        // context but not spaces themselves never occur; this covers user
        // objects and the like that were spawned with no space).
        let mut cloned_trees: FxHashSet<u32> = FxHashSet::default();
        let loose: Vec<ReplicaId> = self
            .replicator
            .live_ids()
            .iter()
            .copied()
            .filter(|id| {
                *id != game
                    && !self.spaces.contains_key(id)
                    && self
                        .replicator
                        .get(*id)
                        .is_some_and(|r| r.create_context.0 == ReplicaId(0) && r.is_online())
            })
            .collect();
        for id in loose {
            let Some(replica) = self.replicator.get(id) else {
                continue;
            };
            if replica.is_emplaced() {
                self.send_object_stream(addr, id, MessageType::ReplicaClone, false);
            } else {
                let tree = replica.family_tree;
                if tree.0 != 0 && !cloned_trees.insert(tree.0) {
                    continue;
                }
                self.send_object_stream(addr, id, MessageType::ReplicaClone, true);
            }
        }

        self.send_ordered(addr, Message::empty(MessageType::NetGameLoadFinished), None);
    }

    /// Clones one space's content: level-load bracket (when a level is
    /// loaded), the interrupt barrier, then every live object — emplaced
    /// ones as clone-from-emplacement, spawned ones as clone-from-spawn once
    /// per family tree.
    fn clone_level_to_link(&mut self, addr: SocketAddr, space_id: ReplicaId) {
        let level = self.spaces.get(&space_id).and_then(|s| s.level);
        if let Some(level) = level {
            let mut body = BitStream::new();
            space_id.write_quantized(&mut body);
            body.write_bool(true);
            body.write_u64(level);
            self.send_ordered(
                addr,
                Message::new(MessageType::NetLevelLoadStarted, body),
                None,
            );
            self.send_ordered(addr, Message::empty(MessageType::ReplicaInterrupt), None);
        }

        let mut cloned_trees: FxHashSet<u32> = FxHashSet::default();
        let object_ids: Vec<ReplicaId> = self
            .replicator
            .live_ids()
            .iter()
            .copied()
            .filter(|id| {
                self.replicator
                    .get(*id)
                    .is_some_and(|r| r.create_context.0 == space_id && r.is_online())
            })
            .collect();
        for id in object_ids {
            let Some(replica) = self.replicator.get(id) else {
                continue;
            };
            if replica.is_emplaced() {
                self.send_object_stream(addr, id, MessageType::ReplicaClone, false);
            } else {
                let tree = replica.family_tree;
                if tree.0 != 0 && !cloned_trees.insert(tree.0) {
                    continue;
                }
                let ancestor = self
                    .replicator
                    .family_tree(tree)
                    .map(|t| t.ancestor)
                    .unwrap_or(id);
                self.send_object_stream(addr, ancestor, MessageType::ReplicaClone, true);
            }
        }

        if let Some(level) = level {
            let mut body = BitStream::new();
            space_id.write_quantized(&mut body);
            self.send_ordered(
                addr,
                Message::new(MessageType::NetLevelLoadFinished, body),
                None,
            );
        }
    }

    fn send_object_stream(
        &mut self,
        addr: SocketAddr,
        ancestor: ReplicaId,
        ty: MessageType,
        clone_from_spawn: bool,
    ) {
        let mut body = BitStream::new();
        if self
            .replicator
            .write_spawn_stream(ancestor, clone_from_spawn, &mut body)
            .is_err()
        {
            return;
        }
        self.send_ordered(addr, Message::new(ty, body), None);
    }

    fn send_ordered(&mut self, addr: SocketAddr, message: Message, receipt: Option<u64>) {
        if let Some(transport) = &mut self.transport {
            if let Err(error) = transport.send(addr, ChannelKind::ReliableOrdered, &message, receipt)
            {
                tracing::warn!(%addr, %error, "failed to send ordered message");
            }
        }
    }

    /// Broadcasts an ordered message to every game link.
    fn broadcast_ordered(&mut self, message: &Message) {
        for addr in self.game_links() {
            self.send_ordered(addr, message.clone(), None);
        }
    }

    fn finish_game_clone<E: GameEngine>(&mut self, engine: &mut E, from: SocketAddr) {
        self.receiving_game_clone = false;

        // Emplaced objects the clone never mentioned were destroyed on the
        // server before we joined; destroy the local counterparts.
        self.replicator.drain_pending_emplaced("");
        let cogs: Vec<CogId> = self
            .pending_emplace_cogs
            .drain()
            .map(|(_, (cog, _, _))| cog)
            .collect();
        for cog in cogs {
            engine.destroy_cog(cog);
        }

        // Attach every child whose parent made it online, then clear the
        // maps outright.
        let parents: Vec<ReplicaId> = self.replicator.live_ids().to_vec();
        for parent in parents {
            self.attach_waiting_children(engine, parent);
        }
        for space in self.spaces.values_mut() {
            space.clear_deferred_attachments();
        }

        self.game_started_pending = true;
        engine.dispatch(NetPeerEvent::NetGameLoadFinished { from });
    }

    fn handle_level_load_started<E: GameEngine>(
        &mut self,
        engine: &mut E,
        payload: &mut BitStream,
    ) -> Result<(), NetPeerError> {
        let space_id = ReplicaId::read_quantized(payload).map_err(ReplicatorError::Bits)?;
        let has_level = payload.read_bool().map_err(ReplicatorError::Bits)?;
        let level = if has_level {
            Some(payload.read_u64().map_err(ReplicatorError::Bits)?)
        } else {
            None
        };

        let Some(space) = self.spaces.get_mut(&space_id) else {
            tracing::warn!(space = %space_id, "level load for unknown space");
            return Ok(());
        };
        space.receiving_level_clone = true;
        let space_cog = space.cog;
        let previous = space.level;

        if let Some(level) = level {
            if previous != Some(level) {
                engine.load_level(space_cog, level)?;
                if let Some(space) = self.spaces.get_mut(&space_id) {
                    space.level = Some(level);
                }
                self.emplace_level_objects(engine, space_id, level)?;
            }
        }
        Ok(())
    }

    /// Emplaces every not-yet-registered object of a freshly-loaded level
    /// under the space/level context, in creation order.
    fn emplace_level_objects<E: GameEngine>(
        &mut self,
        engine: &mut E,
        space_id: ReplicaId,
        level: LevelId,
    ) -> Result<(), NetPeerError> {
        let Some(space) = self.spaces.get(&space_id) else {
            return Ok(());
        };
        let space_cog = space.cog;
        let level_name = engine
            .level_name(level)
            .ok_or(EngineError::UnknownLevel(level))?;
        let context = EmplaceContext::space_level(space_id, &level_name);

        for cog in engine.objects_in_space(space_cog) {
            if self.cog_to_replica.contains_key(&cog) {
                continue;
            }
            let already_pending = self
                .pending_emplace_cogs
                .values()
                .any(|(pending, _, _)| *pending == cog);
            if already_pending {
                continue;
            }
            let id = self.register_emplaced(engine, cog, NetObjectRole::Plain, &context)?;
            if id != ReplicaId(0) {
                // Authority side: level objects come online right away.
                self.bring_online(engine, id);
            }
        }
        Ok(())
    }

    fn handle_level_load_finished<E: GameEngine>(
        &mut self,
        engine: &mut E,
        payload: &mut BitStream,
    ) -> Result<(), NetPeerError> {
        let space_id = ReplicaId::read_quantized(payload).map_err(ReplicatorError::Bits)?;
        let Some(space) = self.spaces.get_mut(&space_id) else {
            return Ok(());
        };
        space.receiving_level_clone = false;
        let level = space.level;
        space.level_started_pending = level;

        // Emplaced level objects the clone never bound: gone on the server.
        let prefix = format!("NetSpace_{}_Level_", space_id.0);
        self.replicator.drain_pending_emplaced(&prefix);
        let stale: Vec<(String, u32)> = self
            .pending_emplace_cogs
            .keys()
            .filter(|(ctx, _)| ctx.starts_with(&prefix))
            .cloned()
            .collect();
        for key in stale {
            if let Some((cog, _, _)) = self.pending_emplace_cogs.remove(&key) {
                engine.destroy_cog(cog);
            }
        }
        Ok(())
    }

    /// Server: switches a space's level and streams the transition to every
    /// connected client.
    pub fn change_level<E: GameEngine>(
        &mut self,
        engine: &mut E,
        space_id: ReplicaId,
        level: LevelId,
    ) -> Result<(), NetPeerError> {
        if !self.role.is_authority() {
            return Err(NetPeerError::WrongRole(NetRole::Server));
        }
        let Some(space) = self.spaces.get_mut(&space_id) else {
            return Err(NetPeerError::UnknownObject(space_id));
        };
        let space_cog = space.cog;
        engine.load_level(space_cog, level)?;
        if let Some(space) = self.spaces.get_mut(&space_id) {
            space.level = Some(level);
            space.level_started_pending = Some(level);
        }
        self.emplace_level_objects(engine, space_id, level)?;

        for addr in self.game_links() {
            self.clone_level_to_link(addr, space_id);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Applying spawn/clone streams (client side)
    // -----------------------------------------------------------------------

    fn apply_object_stream<E: GameEngine>(
        &mut self,
        engine: &mut E,
        payload: &mut BitStream,
        now: u64,
    ) -> Result<(), NetPeerError> {
        let header = Replicator::read_spawn_header(payload)?;
        let mut member_cogs: Vec<CogId> = Vec::new();
        let mut created: Vec<(ReplicaId, ReplicaId)> = Vec::new(); // (id, declared parent)

        for index in 0..header.member_count as usize {
            let Some(info) = Replicator::read_member_info(payload)? else {
                // Absent member: the archetype created a local counterpart
                // that no longer exists on the authority.
                if let Some(&cog) = member_cogs.get(index) {
                    engine.destroy_cog(cog);
                }
                continue;
            };

            if let Some((context, emplace_id)) = &info.emplace {
                if !self.apply_emplaced_member(engine, &info, context, *emplace_id, payload, now)? {
                    // Mismatched context: the warning is out; drop the rest
                    // of this stream.
                    return Ok(());
                }
                created.push((info.id, info.parent));
                continue;
            }

            if index == 0 {
                // First member materializes the whole subtree.
                let root_cog = if header.create_context.0 == ReplicaId(0) {
                    engine.create_space()?
                } else {
                    let space_cog = self
                        .bindings
                        .get(&header.create_context.0)
                        .map(|b| b.cog)
                        .ok_or(NetPeerError::UnknownObject(header.create_context.0))?;
                    engine.create_from_archetype(header.replica_type, Some(space_cog))?
                };
                member_cogs = dfs_preorder(engine, root_cog);
            }

            let Some(&cog) = member_cogs.get(index) else {
                tracing::warn!(
                    replica = %info.id,
                    "spawn stream has more members than the archetype produced"
                );
                return Ok(());
            };

            let role = if header.create_context.0 == ReplicaId(0) && index == 0 {
                NetObjectRole::Space
            } else {
                NetObjectRole::Plain
            };
            let (mut replica, property_bindings) =
                self.build_replica(engine, cog, header.replica_type, header.create_context);
            replica.parent = info.parent;
            self.replicator.register_clone(info.id, replica)?;
            self.replicator
                .get_mut(info.id)
                .expect("just registered")
                .read_channels(payload, now)
                .map_err(ReplicatorError::Stream)?;

            // User objects announce themselves through the built-in channel.
            let role = match self.builtin_user_id(info.id) {
                user if user != NetUserId(0) => NetObjectRole::User(user),
                _ => role,
            };
            if let NetObjectRole::User(user) = role {
                self.users
                    .insert(NetUser::new(user, cog, info.id, NetPeerId(0)));
            }
            if role == NetObjectRole::Space {
                self.spaces.insert(info.id, SpaceState::new(info.id, cog));
            }

            self.bindings.insert(
                info.id,
                NetObjectBinding {
                    cog,
                    role,
                    properties: property_bindings,
                },
            );
            self.cog_to_replica.insert(cog, info.id);
            created.push((info.id, info.parent));
        }

        if header.family_tree.0 != 0 {
            let members: Vec<ReplicaId> = created.iter().map(|(id, _)| *id).collect();
            self.replicator.register_family(header.family_tree, &members);
        }

        let created_set: FxHashSet<ReplicaId> = created.iter().map(|(id, _)| *id).collect();
        for (id, parent) in &created {
            self.push_applied(engine, *id);
            self.bring_online(engine, *id);
            // In-tree parents are already wired by the archetype; only
            // cross-references need attachment or deferral.
            if parent.0 != 0 && !created_set.contains(parent) {
                self.attach_or_defer(engine, *id, *parent);
            }
        }
        Ok(())
    }

    /// Binds one emplaced stream member. Returns false when the context was
    /// mismatched and the stream should be dropped.
    fn apply_emplaced_member<E: GameEngine>(
        &mut self,
        engine: &mut E,
        info: &SpawnMemberInfo,
        context: &EmplaceContext,
        emplace_id: u32,
        payload: &mut BitStream,
        now: u64,
    ) -> Result<bool, NetPeerError> {
        match self.replicator.bind_emplaced(context, emplace_id, info.id) {
            Ok(()) => {}
            Err(ReplicatorError::EmplaceMismatch { .. }) => {
                engine.notify(
                    NotifyLevel::Warning,
                    "Emplace Context Mismatch",
                    &format!(
                        "Unable to bind replica {}: the emplace context appears mismatched ({} #{})",
                        info.id,
                        context.as_str(),
                        emplace_id
                    ),
                );
                return Ok(false);
            }
            Err(error) => return Err(error.into()),
        }

        let key = (context.as_str().to_string(), emplace_id);
        let Some((cog, role, property_bindings)) = self.pending_emplace_cogs.remove(&key) else {
            return Err(NetPeerError::UnknownObject(info.id));
        };

        self.replicator
            .get_mut(info.id)
            .expect("just bound")
            .read_channels(payload, now)
            .map_err(ReplicatorError::Stream)?;

        if role == NetObjectRole::Peer {
            self.game_replica = info.id;
        }
        if role == NetObjectRole::Space {
            self.spaces.insert(info.id, SpaceState::new(info.id, cog));
        }
        self.bindings.insert(
            info.id,
            NetObjectBinding {
                cog,
                role,
                properties: property_bindings,
            },
        );
        self.cog_to_replica.insert(cog, info.id);
        Ok(true)
    }

    fn builtin_user_id(&self, id: ReplicaId) -> NetUserId {
        self.replicator
            .get(id)
            .and_then(|r| r.channel(BUILTIN_CHANNEL))
            .and_then(|c| c.property(BUILTIN_USER_ID))
            .and_then(|p| match p.value() {
                NetValue::Integer(raw) => Some(NetUserId(*raw as u32)),
                _ => None,
            })
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Online / offline
    // -----------------------------------------------------------------------

    /// Sets the online flag and fires the generic then role-specific online
    /// events, then attaches any children that were waiting on this object.
    fn bring_online<E: GameEngine>(&mut self, engine: &mut E, id: ReplicaId) {
        if self.replicator.mark_online(id).is_err() {
            return;
        }
        let Some(binding) = self.bindings.get(&id) else {
            return;
        };
        let cog = binding.cog;
        let role = binding.role;
        engine.dispatch(NetPeerEvent::NetObjectOnline {
            object: cog,
            replica: id,
        });
        if role != NetObjectRole::Plain {
            engine.dispatch(role.online_event(cog, id));
        }
        self.attach_waiting_children(engine, id);
    }

    fn attach_waiting_children<E: GameEngine>(&mut self, engine: &mut E, parent: ReplicaId) {
        if !self
            .replicator
            .get(parent)
            .is_some_and(Replica::is_online)
        {
            return;
        }
        let mut ready: Vec<ReplicaId> = Vec::new();
        for space in self.spaces.values_mut() {
            ready.extend(space.fulfill_attachments(parent));
        }
        let parent_cog = match self.bindings.get(&parent) {
            Some(binding) => binding.cog,
            None => return,
        };
        for child in ready {
            if let Some(child_binding) = self.bindings.get(&child) {
                let _ = engine.attach(child_binding.cog, parent_cog);
            }
        }
    }

    fn attach_or_defer<E: GameEngine>(&mut self, engine: &mut E, child: ReplicaId, parent: ReplicaId) {
        let parent_online = self
            .replicator
            .get(parent)
            .is_some_and(Replica::is_online);
        if parent_online {
            if let (Some(child_binding), Some(parent_binding)) =
                (self.bindings.get(&child), self.bindings.get(&parent))
            {
                let _ = engine.attach(child_binding.cog, parent_binding.cog);
            }
            return;
        }
        // Parent not here yet: park the child in its space's maps.
        if let Some(space) = self.space_of_object(engine, child) {
            if let Some(space_state) = self.spaces.get_mut(&space) {
                space_state.defer_attachment(child, parent);
            }
        }
    }

    fn space_of_object<E: GameEngine>(&self, engine: &E, id: ReplicaId) -> Option<ReplicaId> {
        let cog = self.bindings.get(&id)?.cog;
        let space_cog = engine.space_of(cog)?;
        self.cog_to_replica.get(&space_cog).copied()
    }

    /// Fires the role-specific then generic offline events and clears the
    /// online flag. On the authority the owner is released first.
    fn take_offline<E: GameEngine>(&mut self, engine: &mut E, id: ReplicaId) {
        let Some(binding) = self.bindings.get(&id) else {
            let _ = self.replicator.mark_offline(id);
            return;
        };
        if !self.replicator.get(id).is_some_and(Replica::is_online) {
            return;
        }
        let cog = binding.cog;
        let role = binding.role;

        if role != NetObjectRole::Plain {
            engine.dispatch(role.offline_event(cog, id));
        }
        engine.dispatch(NetPeerEvent::NetObjectOffline {
            object: cog,
            replica: id,
        });
        if self.role.is_authority() {
            self.apply_ownership(engine, id, NetUserId(0));
        }
        let _ = self.replicator.mark_offline(id);
    }

    // -----------------------------------------------------------------------
    // Spawning and destroying (authority API)
    // -----------------------------------------------------------------------

    /// Server/offline: registers a runtime-created cog (with its subtree) as
    /// net objects, assigns one family tree, and spawns the stream to every
    /// connected client. Returns the ancestor's replica id.
    pub fn spawn_object<E: GameEngine>(
        &mut self,
        engine: &mut E,
        cog: CogId,
    ) -> Result<ReplicaId, NetPeerError> {
        if !self.is_open {
            return Err(NetPeerError::NotOpen);
        }
        if !self.role.is_authority() {
            return Err(NetPeerError::WrongRole(NetRole::Server));
        }

        let subtree = dfs_preorder(engine, cog);
        let mut ids = Vec::with_capacity(subtree.len());
        for member_cog in &subtree {
            let replica_type = engine.archetype_of(*member_cog).unwrap_or_default();
            let create_context = self.create_context_for(engine, *member_cog, NetObjectRole::Plain);
            let (mut replica, property_bindings) =
                self.build_replica(engine, *member_cog, replica_type, create_context);
            if let Some(parent_cog) = engine.cog_parent(*member_cog) {
                replica.parent = self.cog_to_replica.get(&parent_cog).copied().unwrap_or_default();
            }
            let id = self.replicator.make_live(replica)?;
            self.bindings.insert(
                id,
                NetObjectBinding {
                    cog: *member_cog,
                    role: NetObjectRole::Plain,
                    properties: property_bindings,
                },
            );
            self.cog_to_replica.insert(*member_cog, id);
            ids.push(id);
        }

        if ids.len() > 1 {
            self.replicator.create_family(&ids)?;
        }
        for id in &ids {
            self.bring_online(engine, *id);
        }

        let ancestor = ids[0];
        for addr in self.game_links() {
            self.send_object_stream(addr, ancestor, MessageType::ReplicaSpawn, false);
        }
        Ok(ancestor)
    }

    /// Destroys a net object. On the authority this forgets it on every
    /// routed peer and deletes the cog; on a client it is an unauthorized
    /// destruction — reported, and only the local cog is destroyed.
    pub fn destroy_object<E: GameEngine>(
        &mut self,
        engine: &mut E,
        id: ReplicaId,
    ) -> Result<(), NetPeerError> {
        let binding = self
            .bindings
            .get(&id)
            .ok_or(NetPeerError::UnknownObject(id))?;
        let cog = binding.cog;

        if !self.role.is_authority() {
            engine.notify(
                NotifyLevel::Warning,
                "Unauthorized Destruction",
                &format!("The Client illegally destroyed a NetObject '{cog}'"),
            );
            self.forget_object(engine, id);
            engine.destroy_cog(cog);
            return Ok(());
        }

        let mut body = BitStream::new();
        body.write_u32(id.0);
        self.broadcast_ordered(&Message::new(MessageType::ReplicaDestroy, body));

        self.forget_object(engine, id);
        engine.destroy_cog(cog);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    /// Queues a user-add. Servers and offline peers process it locally this
    /// tick; clients forward it to the server once connected.
    pub fn add_user(&mut self, request: PayloadBundle) -> Result<(), NetPeerError> {
        if !self.is_open {
            return Err(NetPeerError::NotOpen);
        }
        self.pending_user_adds.push_back(PendingUserAdd { request });
        Ok(())
    }

    fn process_pending_user_adds<E: GameEngine>(&mut self, engine: &mut E) {
        if self.pending_user_adds.is_empty() {
            return;
        }
        if self.role.is_authority() {
            while let Some(pending) = self.pending_user_adds.pop_front() {
                let _ = self.process_user_add(engine, None, NetPeerId(0), pending.request);
            }
        } else if let Some(server) = self.server_addr {
            self.forward_queued_user_adds(server);
        }
    }

    fn forward_queued_user_adds(&mut self, server: SocketAddr) {
        while let Some(pending) = self.pending_user_adds.pop_front() {
            let mut body = BitStream::new();
            body.write_stream(&pending.request.to_stream());
            self.send_ordered(server, Message::new(MessageType::NetUserAddRequest, body), None);
            self.forwarded_user_adds.push_back(pending);
        }
    }

    /// Authority-side user add: ask the application, then materialize the
    /// user object and answer the requester.
    fn process_user_add<E: GameEngine>(
        &mut self,
        engine: &mut E,
        requester: Option<SocketAddr>,
        requester_peer: NetPeerId,
        request: PayloadBundle,
    ) -> Result<(), NetPeerError> {
        if !self.role.is_authority() {
            return Ok(());
        }
        let decision = engine.handle_user_add_request(requester_peer, &request);
        let accepted = decision.accept && decision.user_cog.is_some();

        let mut granted = NetUserId(0);
        if accepted {
            let user_cog = decision.user_cog.expect("checked above");
            granted = self.users.allocate_id();

            let replica = self.spawn_user_object(engine, user_cog, granted)?;
            self.users
                .insert(NetUser::new(granted, user_cog, replica, requester_peer));
            // The user owns its own object tree.
            self.apply_ownership(engine, replica, granted);
            self.replicate_owner_property(replica, granted);
        }

        match requester {
            Some(addr) => {
                let mut body = BitStream::new();
                body.write_bool(accepted);
                body.write_u32(granted.0);
                body.write_stream(&decision.response.to_stream());
                self.send_ordered(addr, Message::new(MessageType::NetUserAddResponse, body), None);
            }
            None => {
                let user_object = self.users.get(granted).map(|u| u.cog);
                engine.dispatch(NetPeerEvent::NetUserAddResponse {
                    accepted,
                    user: granted,
                    user_object,
                    response: decision.response,
                });
            }
        }
        Ok(())
    }

    /// Registers a user cog as a live User-role net object and spawns it to
    /// every client. The built-in channel carries the user id.
    fn spawn_user_object<E: GameEngine>(
        &mut self,
        engine: &mut E,
        cog: CogId,
        user: NetUserId,
    ) -> Result<ReplicaId, NetPeerError> {
        let replica_type = engine.archetype_of(cog).unwrap_or_default();
        let create_context = self.create_context_for(engine, cog, NetObjectRole::Plain);
        let (replica, property_bindings) =
            self.build_replica(engine, cog, replica_type, create_context);
        let id = self.replicator.make_live(replica)?;
        if let Some(replica) = self.replicator.get_mut(id)
            && let Some(channel) = replica.channel_mut(BUILTIN_CHANNEL)
            && let Some(property) = channel.property_mut(BUILTIN_USER_ID)
        {
            property.set_value(NetValue::Integer(user.0 as i32), 0);
        }
        self.bindings.insert(
            id,
            NetObjectBinding {
                cog,
                role: NetObjectRole::User(user),
                properties: property_bindings,
            },
        );
        self.cog_to_replica.insert(cog, id);
        self.bring_online(engine, id);

        for addr in self.game_links() {
            self.send_object_stream(addr, id, MessageType::ReplicaSpawn, false);
        }
        Ok(id)
    }

    fn handle_user_add_response<E: GameEngine>(
        &mut self,
        engine: &mut E,
        payload: &mut BitStream,
    ) -> Result<(), NetPeerError> {
        let accepted = payload.read_bool().map_err(ReplicatorError::Bits)?;
        let user = NetUserId(payload.read_u32().map_err(ReplicatorError::Bits)?);
        let response = Self::parse_bundle(payload.read_remaining());
        self.forwarded_user_adds.pop_front();

        let user_object = self.users.get(user).map(|u| u.cog);
        engine.dispatch(NetPeerEvent::NetUserAddResponse {
            accepted,
            user,
            user_object,
            response,
        });
        Ok(())
    }

    /// Requests removal of a user. Clients forward to the server; the
    /// authority destroys the user object, which releases everything it
    /// owned.
    pub fn remove_user<E: GameEngine>(
        &mut self,
        engine: &mut E,
        user: NetUserId,
        payload: PayloadBundle,
    ) -> Result<(), NetPeerError> {
        if !self.is_open {
            return Err(NetPeerError::NotOpen);
        }
        if self.role.is_authority() {
            return self.remove_user_internal(engine, user, payload);
        }
        let Some(server) = self.server_addr else {
            return Err(NetPeerError::NotOpen);
        };
        let mut body = BitStream::new();
        body.write_u32(user.0);
        body.write_stream(&payload.to_stream());
        self.send_ordered(server, Message::new(MessageType::NetUserRemoveRequest, body), None);
        Ok(())
    }

    fn remove_user_internal<E: GameEngine>(
        &mut self,
        engine: &mut E,
        user_id: NetUserId,
        _payload: PayloadBundle,
    ) -> Result<(), NetPeerError> {
        let Some(user) = self.users.get_mut(user_id) else {
            return Err(NetPeerError::UnknownUser(user_id));
        };
        let owned = user.take_owned();
        let user_replica = user.replica;

        // Releasing ownership fires one owner-changed per object and
        // replicates the cleared owner.
        for object in owned {
            self.apply_ownership(engine, object, NetUserId(0));
            self.replicate_owner_property(object, NetUserId(0));
        }

        // Destroying the user object tells every peer.
        self.destroy_object(engine, user_replica)?;
        self.users.remove(user_id, self.role.is_authority());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Ownership
    // -----------------------------------------------------------------------

    /// Authority API: changes an object's owning user and replicates it via
    /// the built-in channel.
    pub fn set_net_user_owner<E: GameEngine>(
        &mut self,
        engine: &mut E,
        object: ReplicaId,
        new_owner: NetUserId,
    ) -> Result<(), NetPeerError> {
        if !self.role.is_authority() {
            return Err(NetPeerError::WrongRole(NetRole::Server));
        }
        if !self.bindings.contains_key(&object) {
            return Err(NetPeerError::UnknownObject(object));
        }
        if new_owner != NetUserId(0) && self.users.get(new_owner).is_none() {
            return Err(NetPeerError::UnknownUser(new_owner));
        }
        self.apply_ownership(engine, object, new_owner);
        self.replicate_owner_property(object, new_owner);
        Ok(())
    }

    /// Shared owner-change bookkeeping: owned sets, events, and dynamic
    /// authority retargeting. Used on both receipt and local set.
    fn apply_ownership<E: GameEngine>(
        &mut self,
        engine: &mut E,
        object: ReplicaId,
        new_owner: NetUserId,
    ) {
        let Some(replica) = self.replicator.get_mut(object) else {
            return;
        };
        let previous = replica.owner_user;
        if previous == new_owner {
            return;
        }
        replica.owner_user = new_owner;

        let object_cog = self.bindings.get(&object).map(|b| b.cog).unwrap_or(CogId(0));

        if previous != NetUserId(0)
            && let Some(previous_user) = self.users.get_mut(previous)
        {
            previous_user.remove_owned(object);
            engine.dispatch(NetPeerEvent::NetUserLostObjectOwnership {
                user: previous,
                object: object_cog,
                current_owner: new_owner,
            });
        }
        if new_owner != NetUserId(0)
            && let Some(new_user) = self.users.get_mut(new_owner)
        {
            new_user.add_owned(object);
            engine.dispatch(NetPeerEvent::NetUserAcquiredObjectOwnership {
                user: new_owner,
                object: object_cog,
            });
        }
        engine.dispatch(NetPeerEvent::NetUserOwnerChanged {
            object: object_cog,
            replica: object,
            previous,
            current: new_owner,
        });

        // Dynamic-authority channels follow the owner's peer.
        let authority_peer = self
            .users
            .get(new_owner)
            .map(|u| u.added_by)
            .unwrap_or(NetPeerId(0));
        if let Some(replica) = self.replicator.get_mut(object) {
            for channel in replica.channels_mut() {
                if channel.config.authority == AuthorityMode::Dynamic {
                    channel.set_authority_client(authority_peer);
                }
            }
        }
    }

    /// Pushes the owner id into the built-in channel so the change
    /// replicates on the next detection pass.
    fn replicate_owner_property(&mut self, object: ReplicaId, owner: NetUserId) {
        if let Some(replica) = self.replicator.get_mut(object)
            && let Some(channel) = replica.channel_mut(BUILTIN_CHANNEL)
        {
            if let Some(property) = channel.property_mut(BUILTIN_OWNER) {
                property.set_value(NetValue::Integer(owner.0 as i32), self.last_update_ms);
            }
            channel.replicate_now();
        }
    }

    // -----------------------------------------------------------------------
    // Remote events
    // -----------------------------------------------------------------------

    /// Serializes an event and delivers it to `target`'s counterpart on the
    /// remote side (clients send to the server; the authority fans out to
    /// every client).
    pub fn send_event(
        &mut self,
        target: ReplicaId,
        event: &RemoteEvent,
    ) -> Result<(), NetPeerError> {
        if !self.is_open {
            return Err(NetPeerError::NotOpen);
        }
        if !self.bindings.contains_key(&target) {
            return Err(NetPeerError::UnknownObject(target));
        }
        let mut body = BitStream::new();
        target.write_quantized(&mut body);
        event.write(&mut body);
        let message = Message::new(MessageType::NetEvent, body);

        let targets: Vec<SocketAddr> = if self.role.is_authority() {
            self.game_links()
        } else {
            self.server_addr.into_iter().collect()
        };
        for addr in targets {
            self.send_ordered(addr, message.clone(), None);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Host discovery API
    // -----------------------------------------------------------------------

    /// Adds a master-server address used for publishing and routed
    /// refreshes.
    pub fn subscribe_master_server(&mut self, addr: SocketAddr) {
        if !self.master_subscriptions.contains(&addr) {
            self.master_subscriptions.push(addr);
        }
    }

    /// Refreshes a single host: directly on LAN, via the subscribed master
    /// servers on Internet. With `get_extra_info` the refresh follows the
    /// basic answer with the second-stage extra-info exchange.
    pub fn refresh_host(
        &mut self,
        network: Network,
        host: SocketAddr,
        allow_discovery: bool,
        get_extra_info: bool,
        remove_stale: bool,
    ) -> Result<(), NetPeerError> {
        if !self.is_open {
            return Err(NetPeerError::NotOpen);
        }
        let now = self.last_update_ms;
        let timeout = self.config.host_ping_timeout_ms;
        let masters = self.master_subscriptions.clone();
        let Some(mut discovery) = self.take_discovery(network) else {
            return Err(NetPeerError::NotOpen);
        };
        if let Some(transport) = &mut self.transport {
            discovery.refresh_host(
                host,
                allow_discovery,
                get_extra_info,
                remove_stale,
                timeout,
                &masters,
                now,
                transport,
            );
        }
        self.put_discovery(network, discovery);
        Ok(())
    }

    /// LAN: broadcast-scans the configured port range. Completion fires a
    /// host-list event; with `remove_stale`, silent known hosts are dropped.
    pub fn discover_hosts_lan(
        &mut self,
        get_extra_info: bool,
        remove_stale: bool,
    ) -> Result<(), NetPeerError> {
        if !self.is_open {
            return Err(NetPeerError::NotOpen);
        }
        let expected: Vec<SocketAddr> = self
            .host_lists
            .hosts(Network::Lan)
            .iter()
            .map(|h| h.address)
            .collect();
        let now = self.last_update_ms;
        let timeout = self.config.host_ping_timeout_ms;
        let Some(mut discovery) = self.take_discovery(Network::Lan) else {
            return Err(NetPeerError::NotOpen);
        };
        if let Some(transport) = &mut self.transport {
            discovery.discover_lan_hosts(
                expected,
                get_extra_info,
                remove_stale,
                timeout,
                now,
                transport,
            );
        }
        self.put_discovery(Network::Lan, discovery);
        Ok(())
    }

    /// Internet: fetches the record list from every subscribed master
    /// server over a short-lived link, then probes the listed hosts.
    pub fn discover_hosts_internet(
        &mut self,
        get_extra_info: bool,
        remove_stale: bool,
    ) -> Result<(), NetPeerError> {
        if !self.is_open {
            return Err(NetPeerError::NotOpen);
        }
        if self.master_subscriptions.is_empty() {
            tracing::warn!("internet discovery requested with no master-server subscriptions");
            return Ok(());
        }
        self.pending_listing = Some((get_extra_info, remove_stale));
        let subscriptions = self.master_subscriptions.clone();
        for addr in subscriptions {
            self.master_listing_links.insert(addr);
            if let Ok(transport) = self.transport_mut() {
                let _ = transport.connect(addr, PayloadBundle::new().to_stream(), 0);
            }
        }
        Ok(())
    }

    /// Cancels all discovery on one network.
    pub fn cancel_host_discovery(&mut self, network: Network) {
        if let Some(discovery) = match network {
            Network::Lan => self.lan_discovery.as_mut(),
            Network::Internet => self.internet_discovery.as_mut(),
        } {
            discovery.cancel();
        }
    }

    /// Clears one network's host list.
    pub fn clear_host_list(&mut self, network: Network) {
        self.host_lists.clear(network);
    }

    fn handle_discovery_event<E: GameEngine>(
        &mut self,
        engine: &mut E,
        network: Network,
        event: DiscoveryEvent,
    ) {
        match event {
            DiscoveryEvent::HostResponded {
                host,
                first_response,
                allow_discovery,
                is_refresh: _,
            } => {
                let known = self.host_lists.host(network, host.address).is_some();
                if !known && !allow_discovery {
                    return;
                }
                let refresh_result = host.refresh_result;
                let was_new = self.host_lists.upsert(host.clone());
                if first_response {
                    if was_new {
                        engine.dispatch(NetPeerEvent::NetHostDiscovered {
                            network,
                            host,
                            refresh_result,
                        });
                    } else {
                        engine.dispatch(NetPeerEvent::NetHostRefreshed {
                            network,
                            host,
                            refresh_result,
                        });
                    }
                }
            }
            DiscoveryEvent::RequestCompleted {
                hosts,
                stale,
                is_refresh,
                multi_host,
            } => {
                for address in stale {
                    self.host_lists.remove(network, address);
                }
                if multi_host {
                    if is_refresh {
                        engine.dispatch(NetPeerEvent::NetHostListRefreshed { network, hosts });
                    } else {
                        engine.dispatch(NetPeerEvent::NetHostListDiscovered { network, hosts });
                    }
                }
            }
        }
    }
}

/// Depth-first pre-order walk of a cog subtree, root first.
fn dfs_preorder<E: GameEngine>(engine: &E, root: CogId) -> Vec<CogId> {
    let mut out = vec![root];
    let mut stack: Vec<CogId> = engine.cog_children(root);
    stack.reverse();
    while let Some(cog) = stack.pop() {
        out.push(cog);
        let mut children = engine.cog_children(cog);
        children.reverse();
        stack.extend(children);
    }
    out
}

#[cfg(test)]
#[path = "peer_tests.rs"]
mod tests;
