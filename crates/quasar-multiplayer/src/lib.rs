//! Game-facing multiplayer: the NetPeer orchestration over the transport and
//! replica layers, host discovery, the master-server registry, and remote
//! event delivery.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod events;
pub mod host;
pub mod master;
pub mod object;
pub mod peer;
pub mod space;
pub mod testing;
pub mod user;

pub use config::NetPeerConfig;
pub use discovery::{DiscoveryEvent, HostDiscovery, RespondingHostData};
pub use engine::{
    CogId, ConnectDecision, EngineError, EventSink, GameEngine, GameObjectService, LevelId,
    NetClock, NetPropertyInfo, NotifyLevel, PropertyReflection, PropertyValue, ResourceService,
    SessionCallbacks, UserAddDecision,
};
pub use events::{
    EventProperty, NetPeerEvent, PayloadBundle, RemoteEvent, RemoteEventError,
};
pub use host::{HostLists, NetHost, Network, RefreshResult};
pub use master::{HostRecord, MasterServerRegistry, PublishOutcome};
pub use object::{NetObjectBinding, NetObjectRole, PropertyBinding, PropertyBindingKind};
pub use peer::{NetPeer, NetPeerError, NetRole};
pub use space::SpaceState;
pub use user::{NetUser, UserTables};

pub use quasar_replication::{
    FamilyTreeId, NetPeerId, NetUserId, ReplicaId, ReplicaType,
};
