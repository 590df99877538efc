//! The boundary to the rest of the engine.
//!
//! The networking subsystem never reaches into engine globals. Everything it
//! needs from the outside — the game-object container, property reflection,
//! the resource registry, a clock, the event/notification bus, and the
//! application's handshake verdicts — comes through the traits here,
//! implemented by the engine and passed into every [`NetPeer`] call.
//!
//! [`NetPeer`]: crate::peer::NetPeer

use quasar_bitstream::NetValue;
use quasar_replication::{ChannelConfig, NetPeerId, PropertyConfig, ReplicaType};

use crate::events::{NetPeerEvent, PayloadBundle};

/// Handle to a game object in the engine's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CogId(pub u64);

impl std::fmt::Display for CogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable resource id of a level.
pub type LevelId = u64;

/// Failures crossing the engine boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// No archetype with this resource id.
    #[error("unknown archetype {0:?}")]
    UnknownArchetype(ReplicaType),

    /// No level with this resource id.
    #[error("unknown level {0}")]
    UnknownLevel(LevelId),

    /// The cog handle is stale or foreign.
    #[error("unknown cog {0}")]
    UnknownCog(CogId),

    /// The named property does not exist on the cog.
    #[error("no property {component}.{property} on cog {cog}")]
    UnknownProperty {
        cog: CogId,
        component: String,
        property: String,
    },

    /// The value's type does not match the property's type.
    #[error("type mismatch writing {component}.{property}")]
    TypeMismatch { component: String, property: String },
}

/// A property value as exchanged with reflection. Cog references and cog
/// paths get dedicated variants because they translate to replica ids and
/// resolved path strings on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// A plain basic-typed value.
    Value(NetValue),
    /// A reference to another game object.
    Cog(Option<CogId>),
    /// A path to a game object, resolved to a string.
    CogPath(String),
}

/// One replicated property as reported by reflection.
#[derive(Debug, Clone)]
pub struct NetPropertyInfo {
    /// Component the property lives on.
    pub component: String,
    /// Property name.
    pub property: String,
    /// Channel the property replicates on.
    pub channel: String,
    /// Per-property replication settings from the property's attributes.
    pub property_config: PropertyConfig,
    /// Channel policy from the channel's attributes.
    pub channel_config: ChannelConfig,
}

/// The game-object ("cog") container.
pub trait GameObjectService {
    /// Instantiates an archetype, optionally into a space. The returned cog
    /// is the subtree root; children come from the archetype itself.
    fn create_from_archetype(
        &mut self,
        archetype: ReplicaType,
        space: Option<CogId>,
    ) -> Result<CogId, EngineError>;

    /// Creates an empty space.
    fn create_space(&mut self) -> Result<CogId, EngineError>;

    /// Destroys a cog (and its subtree).
    fn destroy_cog(&mut self, cog: CogId);

    /// True once a cog has been destroyed or marked for destruction.
    fn is_cog_destroyed(&self, cog: CogId) -> bool;

    fn attach(&mut self, child: CogId, parent: CogId) -> Result<(), EngineError>;

    fn detach(&mut self, child: CogId) -> Result<(), EngineError>;

    fn cog_parent(&self, cog: CogId) -> Option<CogId>;

    /// Direct children, in creation order.
    fn cog_children(&self, cog: CogId) -> Vec<CogId>;

    /// The space a cog lives in.
    fn space_of(&self, cog: CogId) -> Option<CogId>;

    /// Root objects of a space, in creation order. Creation order is the
    /// deterministic order emplacement relies on.
    fn objects_in_space(&self, space: CogId) -> Vec<CogId>;

    /// Spaces owned by a game session, in creation order.
    fn spaces_of_game(&self, game: CogId) -> Vec<CogId>;

    /// True in editor/preview sessions, where all networking is suppressed.
    fn is_editor_mode(&self) -> bool;
}

/// The property/type-reflection service.
pub trait PropertyReflection {
    /// Every `[NetProperty]`-tagged property on the cog's components, with
    /// channel and config attributes resolved.
    fn net_properties(&self, cog: CogId) -> Vec<NetPropertyInfo>;

    fn get_property(
        &self,
        cog: CogId,
        component: &str,
        property: &str,
    ) -> Result<PropertyValue, EngineError>;

    fn set_property(
        &mut self,
        cog: CogId,
        component: &str,
        property: &str,
        value: PropertyValue,
    ) -> Result<(), EngineError>;

    /// Resolves a cog to the path string a CogPath property serializes as.
    fn cog_path(&self, cog: CogId) -> Option<String>;

    /// Resolves a serialized cog path back to a cog.
    fn resolve_cog_path(&self, path: &str) -> Option<CogId>;
}

/// The resource registry.
pub trait ResourceService {
    fn archetype_exists(&self, archetype: ReplicaType) -> bool;

    /// Archetype a cog was created from, if any.
    fn archetype_of(&self, cog: CogId) -> Option<ReplicaType>;

    fn level_exists(&self, level: LevelId) -> bool;

    /// Display name of a level, used in emplace context strings.
    fn level_name(&self, level: LevelId) -> Option<String>;

    /// Level currently loaded in a space.
    fn current_level(&self, space: CogId) -> Option<LevelId>;

    /// Loads a level into a space. The newly created objects must be
    /// visible via `objects_in_space` when this returns.
    fn load_level(&mut self, space: CogId, level: LevelId) -> Result<(), EngineError>;
}

/// Milliseconds since the engine (or test harness) started.
pub trait NetClock {
    fn now_ms(&self) -> u64;
}

/// Severity of a user-visible diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Warning,
    Error,
}

/// The main-thread dispatch bus: typed events plus the notification surface.
pub trait EventSink {
    /// Posts a typed event for the game to consume this tick.
    fn dispatch(&mut self, event: NetPeerEvent);

    /// Posts a user-visible diagnostic. Never blocks.
    fn notify(&mut self, level: NotifyLevel, title: &str, message: &str);
}

/// The application's answer to an inbound connect request.
#[derive(Debug, Clone)]
pub struct ConnectDecision {
    pub accept: bool,
    /// Bundle returned to the initiator in the connect response.
    pub response: PayloadBundle,
}

/// The application's answer to a user-add request.
#[derive(Debug, Clone)]
pub struct UserAddDecision {
    pub accept: bool,
    /// The cog to become the NetUser. Accepting without one denies the
    /// request.
    pub user_cog: Option<CogId>,
    /// Bundle returned to the requester.
    pub response: PayloadBundle,
}

/// Synchronous application verdicts for the handshakes, plus the host-info
/// providers used by discovery.
pub trait SessionCallbacks {
    /// A remote peer wants to connect.
    fn handle_connect_request(
        &mut self,
        from: std::net::SocketAddr,
        request: &PayloadBundle,
        pending_user_adds: u32,
    ) -> ConnectDecision;

    /// A peer (possibly ourselves) wants to add a user.
    fn handle_user_add_request(
        &mut self,
        adding_peer: NetPeerId,
        request: &PayloadBundle,
    ) -> UserAddDecision;

    /// Serializes the game-defined basic host info (≤ 480 bytes).
    fn acquire_basic_host_info(&mut self) -> PayloadBundle;

    /// Serializes the game-defined extra host info (≤ one whole message).
    fn acquire_extra_host_info(&mut self) -> PayloadBundle;
}

/// Everything the networking subsystem needs from its surroundings.
pub trait GameEngine:
    GameObjectService + PropertyReflection + ResourceService + NetClock + EventSink + SessionCallbacks
{
}

impl<T> GameEngine for T where
    T: GameObjectService
        + PropertyReflection
        + ResourceService
        + NetClock
        + EventSink
        + SessionCallbacks
{
}
