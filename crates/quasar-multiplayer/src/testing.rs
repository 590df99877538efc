//! In-memory engine harness for tests.
//!
//! [`StubEngine`] implements the whole [`GameEngine`] boundary over a toy
//! cog container with archetype and level definitions, a manual clock, and
//! recorded dispatch/notification sinks. Two stubs built from the same
//! definitions produce identical creation orders, which is what the
//! emplacement handshake relies on.

use rustc_hash::FxHashMap;

use quasar_bitstream::NetValue;
use quasar_replication::{ChannelConfig, NetPeerId, PropertyConfig, ReplicaType};

use crate::engine::{
    CogId, ConnectDecision, EngineError, EventSink, GameObjectService, LevelId, NetClock,
    NetPropertyInfo, NotifyLevel, PropertyReflection, PropertyValue, ResourceService,
    SessionCallbacks, UserAddDecision,
};
use crate::events::{NetPeerEvent, PayloadBundle};

/// One replicated property in an archetype definition.
#[derive(Debug, Clone)]
pub struct StubProperty {
    pub component: String,
    pub property: String,
    pub channel: String,
    pub initial: NetValue,
    pub property_config: PropertyConfig,
    pub channel_config: ChannelConfig,
}

/// An archetype: properties plus child archetypes, instantiated as a
/// subtree.
#[derive(Debug, Clone, Default)]
pub struct StubArchetype {
    pub properties: Vec<StubProperty>,
    pub children: Vec<ReplicaType>,
}

/// A level: a name and the archetypes it creates, in order.
#[derive(Debug, Clone)]
pub struct StubLevel {
    pub name: String,
    pub objects: Vec<ReplicaType>,
}

#[derive(Debug, Default)]
struct StubCog {
    archetype: Option<ReplicaType>,
    parent: Option<CogId>,
    children: Vec<CogId>,
    space: Option<CogId>,
    is_space: bool,
    destroyed: bool,
    properties: FxHashMap<(String, String), PropertyValue>,
    net_properties: Vec<NetPropertyInfo>,
    current_level: Option<LevelId>,
}

/// The in-memory engine.
pub struct StubEngine {
    now_ms: u64,
    cogs: FxHashMap<CogId, StubCog>,
    next_cog: u64,
    /// Per-space root objects, creation-ordered.
    space_objects: FxHashMap<CogId, Vec<CogId>>,
    /// Per-game spaces, creation-ordered.
    game_spaces: FxHashMap<CogId, Vec<CogId>>,

    archetypes: FxHashMap<ReplicaType, StubArchetype>,
    levels: FxHashMap<LevelId, StubLevel>,

    /// Recorded dispatches, drained by tests.
    dispatched: Vec<NetPeerEvent>,
    /// Recorded notifications, drained by tests.
    notifications: Vec<(NotifyLevel, String, String)>,

    /// Connect verdict handed to the peer.
    pub accept_connections: bool,
    /// User-add verdict.
    pub accept_users: bool,
    /// Archetype instantiated for accepted user adds, created into
    /// `default_space`.
    pub user_archetype: Option<ReplicaType>,
    /// Space user objects are created into.
    pub default_space: Option<CogId>,
    /// Returned by `acquire_basic_host_info`.
    pub basic_host_info: PayloadBundle,
    /// Returned by `acquire_extra_host_info`.
    pub extra_host_info: PayloadBundle,
    /// Editor flag; true suppresses all networking.
    pub editor_mode: bool,
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StubEngine {
    pub fn new() -> Self {
        Self {
            now_ms: 0,
            cogs: FxHashMap::default(),
            next_cog: 1,
            space_objects: FxHashMap::default(),
            game_spaces: FxHashMap::default(),
            archetypes: FxHashMap::default(),
            levels: FxHashMap::default(),
            dispatched: Vec::new(),
            notifications: Vec::new(),
            accept_connections: true,
            accept_users: true,
            user_archetype: None,
            default_space: None,
            basic_host_info: PayloadBundle::new(),
            extra_host_info: PayloadBundle::new(),
            editor_mode: false,
        }
    }

    /// Advances the manual clock.
    pub fn advance(&mut self, ms: u64) {
        self.now_ms += ms;
    }

    pub fn define_archetype(&mut self, ty: ReplicaType, archetype: StubArchetype) {
        self.archetypes.insert(ty, archetype);
    }

    pub fn define_level(&mut self, id: LevelId, level: StubLevel) {
        self.levels.insert(id, level);
    }

    /// Creates the game-session cog.
    pub fn create_game(&mut self) -> CogId {
        let id = self.allocate();
        self.cogs.insert(id, StubCog::default());
        self.game_spaces.insert(id, Vec::new());
        id
    }

    /// Creates a space owned by a game session.
    pub fn create_space_in_game(&mut self, game: CogId) -> CogId {
        let id = self.allocate();
        self.cogs.insert(
            id,
            StubCog {
                is_space: true,
                ..Default::default()
            },
        );
        self.space_objects.insert(id, Vec::new());
        self.game_spaces.entry(game).or_default().push(id);
        id
    }

    /// Drains recorded dispatches.
    pub fn drain_dispatched(&mut self) -> Vec<NetPeerEvent> {
        std::mem::take(&mut self.dispatched)
    }

    /// Drains recorded notifications.
    pub fn drain_notifications(&mut self) -> Vec<(NotifyLevel, String, String)> {
        std::mem::take(&mut self.notifications)
    }

    /// True when a warning containing `fragment` was recorded.
    pub fn saw_warning(&self, fragment: &str) -> bool {
        self.notifications.iter().any(|(level, title, message)| {
            *level == NotifyLevel::Warning
                && (title.contains(fragment) || message.contains(fragment))
        })
    }

    /// A live (not destroyed) cog count, spaces and games excluded.
    pub fn live_object_count(&self) -> usize {
        self.cogs
            .values()
            .filter(|c| !c.destroyed && !c.is_space && c.archetype.is_some())
            .count()
    }

    fn allocate(&mut self) -> CogId {
        let id = CogId(self.next_cog);
        self.next_cog += 1;
        id
    }

    fn instantiate(
        &mut self,
        ty: ReplicaType,
        space: Option<CogId>,
        parent: Option<CogId>,
    ) -> Result<CogId, EngineError> {
        let archetype = self
            .archetypes
            .get(&ty)
            .cloned()
            .ok_or(EngineError::UnknownArchetype(ty))?;

        let id = self.allocate();
        let mut cog = StubCog {
            archetype: Some(ty),
            parent,
            space,
            ..Default::default()
        };
        for prop in &archetype.properties {
            cog.properties.insert(
                (prop.component.clone(), prop.property.clone()),
                PropertyValue::Value(prop.initial.clone()),
            );
            cog.net_properties.push(NetPropertyInfo {
                component: prop.component.clone(),
                property: prop.property.clone(),
                channel: prop.channel.clone(),
                property_config: prop.property_config.clone(),
                channel_config: prop.channel_config.clone(),
            });
        }
        self.cogs.insert(id, cog);

        match parent {
            Some(parent_id) => {
                if let Some(parent_cog) = self.cogs.get_mut(&parent_id) {
                    parent_cog.children.push(id);
                }
            }
            None => {
                if let Some(space_id) = space {
                    self.space_objects.entry(space_id).or_default().push(id);
                }
            }
        }

        for child_ty in archetype.children {
            self.instantiate(child_ty, space, Some(id))?;
        }
        Ok(id)
    }
}

impl GameObjectService for StubEngine {
    fn create_from_archetype(
        &mut self,
        archetype: ReplicaType,
        space: Option<CogId>,
    ) -> Result<CogId, EngineError> {
        self.instantiate(archetype, space, None)
    }

    fn create_space(&mut self) -> Result<CogId, EngineError> {
        let id = self.allocate();
        self.cogs.insert(
            id,
            StubCog {
                is_space: true,
                ..Default::default()
            },
        );
        self.space_objects.insert(id, Vec::new());
        Ok(id)
    }

    fn destroy_cog(&mut self, cog: CogId) {
        let children = self
            .cogs
            .get(&cog)
            .map(|c| c.children.clone())
            .unwrap_or_default();
        for child in children {
            self.destroy_cog(child);
        }
        if let Some(entry) = self.cogs.get_mut(&cog) {
            entry.destroyed = true;
            if let Some(space) = entry.space
                && let Some(objects) = self.space_objects.get_mut(&space)
            {
                objects.retain(|c| *c != cog);
            }
        }
    }

    fn is_cog_destroyed(&self, cog: CogId) -> bool {
        self.cogs.get(&cog).is_none_or(|c| c.destroyed)
    }

    fn attach(&mut self, child: CogId, parent: CogId) -> Result<(), EngineError> {
        if !self.cogs.contains_key(&parent) {
            return Err(EngineError::UnknownCog(parent));
        }
        self.detach(child)?;
        if let Some(cog) = self.cogs.get_mut(&child) {
            cog.parent = Some(parent);
            if let Some(space) = cog.space
                && let Some(objects) = self.space_objects.get_mut(&space)
            {
                objects.retain(|c| *c != child);
            }
        }
        if let Some(parent_cog) = self.cogs.get_mut(&parent) {
            parent_cog.children.push(child);
        }
        Ok(())
    }

    fn detach(&mut self, child: CogId) -> Result<(), EngineError> {
        let previous = self
            .cogs
            .get_mut(&child)
            .ok_or(EngineError::UnknownCog(child))?
            .parent
            .take();
        if let Some(parent) = previous
            && let Some(parent_cog) = self.cogs.get_mut(&parent)
        {
            parent_cog.children.retain(|c| *c != child);
        }
        Ok(())
    }

    fn cog_parent(&self, cog: CogId) -> Option<CogId> {
        self.cogs.get(&cog).and_then(|c| c.parent)
    }

    fn cog_children(&self, cog: CogId) -> Vec<CogId> {
        self.cogs.get(&cog).map(|c| c.children.clone()).unwrap_or_default()
    }

    fn space_of(&self, cog: CogId) -> Option<CogId> {
        self.cogs.get(&cog).and_then(|c| c.space)
    }

    fn objects_in_space(&self, space: CogId) -> Vec<CogId> {
        self.space_objects.get(&space).cloned().unwrap_or_default()
    }

    fn spaces_of_game(&self, game: CogId) -> Vec<CogId> {
        self.game_spaces.get(&game).cloned().unwrap_or_default()
    }

    fn is_editor_mode(&self) -> bool {
        self.editor_mode
    }
}

impl PropertyReflection for StubEngine {
    fn net_properties(&self, cog: CogId) -> Vec<NetPropertyInfo> {
        self.cogs
            .get(&cog)
            .map(|c| c.net_properties.clone())
            .unwrap_or_default()
    }

    fn get_property(
        &self,
        cog: CogId,
        component: &str,
        property: &str,
    ) -> Result<PropertyValue, EngineError> {
        self.cogs
            .get(&cog)
            .ok_or(EngineError::UnknownCog(cog))?
            .properties
            .get(&(component.to_string(), property.to_string()))
            .cloned()
            .ok_or_else(|| EngineError::UnknownProperty {
                cog,
                component: component.to_string(),
                property: property.to_string(),
            })
    }

    fn set_property(
        &mut self,
        cog: CogId,
        component: &str,
        property: &str,
        value: PropertyValue,
    ) -> Result<(), EngineError> {
        let entry = self.cogs.get_mut(&cog).ok_or(EngineError::UnknownCog(cog))?;
        entry
            .properties
            .insert((component.to_string(), property.to_string()), value);
        Ok(())
    }

    fn cog_path(&self, cog: CogId) -> Option<String> {
        self.cogs.get(&cog).map(|_| format!("cog:{}", cog.0))
    }

    fn resolve_cog_path(&self, path: &str) -> Option<CogId> {
        let raw = path.strip_prefix("cog:")?.parse().ok()?;
        let id = CogId(raw);
        self.cogs.contains_key(&id).then_some(id)
    }
}

impl ResourceService for StubEngine {
    fn archetype_exists(&self, archetype: ReplicaType) -> bool {
        self.archetypes.contains_key(&archetype)
    }

    fn archetype_of(&self, cog: CogId) -> Option<ReplicaType> {
        self.cogs.get(&cog).and_then(|c| c.archetype)
    }

    fn level_exists(&self, level: LevelId) -> bool {
        self.levels.contains_key(&level)
    }

    fn level_name(&self, level: LevelId) -> Option<String> {
        self.levels.get(&level).map(|l| l.name.clone())
    }

    fn current_level(&self, space: CogId) -> Option<LevelId> {
        self.cogs.get(&space).and_then(|c| c.current_level)
    }

    fn load_level(&mut self, space: CogId, level: LevelId) -> Result<(), EngineError> {
        let definition = self
            .levels
            .get(&level)
            .cloned()
            .ok_or(EngineError::UnknownLevel(level))?;
        for ty in definition.objects {
            self.instantiate(ty, Some(space), None)?;
        }
        self.cogs
            .get_mut(&space)
            .ok_or(EngineError::UnknownCog(space))?
            .current_level = Some(level);
        Ok(())
    }
}

impl NetClock for StubEngine {
    fn now_ms(&self) -> u64 {
        self.now_ms
    }
}

impl EventSink for StubEngine {
    fn dispatch(&mut self, event: NetPeerEvent) {
        self.dispatched.push(event);
    }

    fn notify(&mut self, level: NotifyLevel, title: &str, message: &str) {
        self.notifications
            .push((level, title.to_string(), message.to_string()));
    }
}

impl SessionCallbacks for StubEngine {
    fn handle_connect_request(
        &mut self,
        _from: std::net::SocketAddr,
        _request: &PayloadBundle,
        _pending_user_adds: u32,
    ) -> ConnectDecision {
        ConnectDecision {
            accept: self.accept_connections,
            response: PayloadBundle::new(),
        }
    }

    fn handle_user_add_request(
        &mut self,
        _adding_peer: NetPeerId,
        _request: &PayloadBundle,
    ) -> UserAddDecision {
        if !self.accept_users {
            return UserAddDecision {
                accept: false,
                user_cog: None,
                response: PayloadBundle::new(),
            };
        }
        let user_cog = match self.user_archetype {
            Some(ty) => self.instantiate(ty, self.default_space, None).ok(),
            None => None,
        };
        UserAddDecision {
            accept: user_cog.is_some(),
            user_cog,
            response: PayloadBundle::new(),
        }
    }

    fn acquire_basic_host_info(&mut self) -> PayloadBundle {
        self.basic_host_info.clone()
    }

    fn acquire_extra_host_info(&mut self) -> PayloadBundle {
        self.extra_host_info.clone()
    }
}
