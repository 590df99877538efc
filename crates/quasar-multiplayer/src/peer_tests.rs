//! End-to-end NetPeer tests over loopback UDP with stub engines.

use super::*;
use crate::engine::{GameObjectService, PropertyReflection, ResourceService};
use crate::events::EventProperty;
use crate::host::RefreshResult;
use crate::testing::{StubArchetype, StubEngine, StubLevel, StubProperty};

use glam::Vec3;
use quasar_bitstream::NetValue;
use quasar_replication::DetectionMode;
use std::net::{IpAddr, Ipv4Addr};

const PROJECT: u64 = 0xC0FFEE;
const PLAYER: ReplicaType = ReplicaType(10);
const SQUAD_MEMBER: ReplicaType = ReplicaType(11);
const SQUAD: ReplicaType = ReplicaType(20);
const USER: ReplicaType = ReplicaType(30);
const CRATE_PROP: ReplicaType = ReplicaType(40);
const ARENA_LEVEL: LevelId = 100;

fn test_config() -> NetPeerConfig {
    NetPeerConfig {
        project_guid: PROJECT,
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        host_ping_timeout_ms: 1_000,
        internet_host_publish_interval_secs: 0.05,
        ..Default::default()
    }
}

/// Builds a stub engine with the shared archetype/level definitions. Both
/// sides must run this identically for emplacement to line up.
fn build_engine() -> (StubEngine, CogId, CogId) {
    let mut engine = StubEngine::new();
    engine.define_archetype(
        PLAYER,
        StubArchetype {
            properties: vec![StubProperty {
                component: "Transform".to_string(),
                property: "Position".to_string(),
                channel: "Transform".to_string(),
                initial: NetValue::Real3(Vec3::ZERO),
                property_config: Default::default(),
                channel_config: quasar_replication::ChannelConfig {
                    detection_mode: DetectionMode::Automatic,
                    ..Default::default()
                },
            }],
            children: vec![],
        },
    );
    engine.define_archetype(SQUAD_MEMBER, StubArchetype::default());
    engine.define_archetype(
        SQUAD,
        StubArchetype {
            properties: vec![],
            children: vec![SQUAD_MEMBER, SQUAD_MEMBER],
        },
    );
    engine.define_archetype(USER, StubArchetype::default());
    engine.define_archetype(CRATE_PROP, StubArchetype::default());
    engine.define_level(
        ARENA_LEVEL,
        StubLevel {
            name: "Arena".to_string(),
            objects: vec![CRATE_PROP, CRATE_PROP],
        },
    );

    let game = engine.create_game();
    let space = engine.create_space_in_game(game);
    engine.default_space = Some(space);
    engine.user_archetype = Some(USER);
    (engine, game, space)
}

fn open_peer(role: NetRole) -> (NetPeer, StubEngine, CogId, CogId) {
    let (mut engine, game, space) = build_engine();
    let mut peer = NetPeer::new(test_config());
    peer.open(&mut engine, role, 0, game).unwrap();
    (peer, engine, game, space)
}

fn pump2(
    a: &mut NetPeer,
    ae: &mut StubEngine,
    b: &mut NetPeer,
    be: &mut StubEngine,
    ticks: u32,
) {
    for _ in 0..ticks {
        ae.advance(16);
        be.advance(16);
        a.update(ae);
        b.update(be);
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}

fn pump3(
    a: &mut NetPeer,
    ae: &mut StubEngine,
    b: &mut NetPeer,
    be: &mut StubEngine,
    c: &mut NetPeer,
    ce: &mut StubEngine,
    ticks: u32,
) {
    for _ in 0..ticks {
        ae.advance(16);
        be.advance(16);
        ce.advance(16);
        a.update(ae);
        b.update(be);
        c.update(ce);
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}

/// Connects a client to a server and pumps until the game clone settles.
fn join(
    server: &mut NetPeer,
    server_engine: &mut StubEngine,
    client: &mut NetPeer,
    client_engine: &mut StubEngine,
) {
    client
        .connect(server.local_addr().unwrap(), PayloadBundle::new())
        .unwrap();
    pump2(server, server_engine, client, client_engine, 20);
}

#[test]
fn test_server_open_starts_game() {
    let (peer, mut engine, game, space) = open_peer(NetRole::Server);
    let events = engine.drain_dispatched();
    assert!(events
        .iter()
        .any(|e| matches!(e, NetPeerEvent::NetGameStarted)));
    assert!(events.iter().any(
        |e| matches!(e, NetPeerEvent::NetGameOnline { object, .. } if *object == game)
    ));
    assert!(events.iter().any(
        |e| matches!(e, NetPeerEvent::NetSpaceOnline { object, .. } if *object == space)
    ));
    assert!(peer.is_open());
    assert_eq!(peer.net_peer_id(), NetPeerId(0), "0 is the server id");
}

#[test]
fn test_client_join_clones_game() {
    let (mut server, mut server_engine, _, _) = open_peer(NetRole::Server);
    let (mut client, mut client_engine, client_game, client_space) = open_peer(NetRole::Client);
    client_engine.drain_dispatched();

    join(&mut server, &mut server_engine, &mut client, &mut client_engine);

    let events = client_engine.drain_dispatched();
    assert!(events
        .iter()
        .any(|e| matches!(e, NetPeerEvent::NetGameLoadStarted { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, NetPeerEvent::NetGameLoadFinished { .. })));
    assert!(
        events.iter().any(|e| matches!(e, NetPeerEvent::NetGameStarted)),
        "the client fires NetGameStarted only after the clone completes"
    );
    assert!(events.iter().any(
        |e| matches!(e, NetPeerEvent::NetGameOnline { object, .. } if *object == client_game)
    ));
    assert!(events.iter().any(
        |e| matches!(e, NetPeerEvent::NetSpaceOnline { object, .. } if *object == client_space)
    ));

    // The client's game session is bound to the server-assigned id.
    let game_replica = client.replica_of(client_game).unwrap();
    assert_ne!(game_replica, ReplicaId(0));
    assert_ne!(client.net_peer_id(), NetPeerId(0), "server assigned us an id");
}

#[test]
fn test_connect_denied_destroys_link() {
    let (mut server, mut server_engine, _, _) = open_peer(NetRole::Server);
    server_engine.accept_connections = false;
    let (mut client, mut client_engine, _, _) = open_peer(NetRole::Client);

    client
        .connect(server.local_addr().unwrap(), PayloadBundle::new())
        .unwrap();
    pump2(&mut server, &mut server_engine, &mut client, &mut client_engine, 10);

    let events = client_engine.drain_dispatched();
    assert!(events.iter().any(|e| matches!(
        e,
        NetPeerEvent::NetPeerConnectResponded { accepted: false, .. }
    )));
    assert!(
        !events.iter().any(|e| matches!(e, NetPeerEvent::NetGameStarted)),
        "denied clients never start the game"
    );
}

#[test]
fn test_spawn_family_reaches_client() {
    let (mut server, mut server_engine, _, server_space) = open_peer(NetRole::Server);
    let (mut client, mut client_engine, _, _) = open_peer(NetRole::Client);
    join(&mut server, &mut server_engine, &mut client, &mut client_engine);
    client_engine.drain_dispatched();

    let before = client_engine.live_object_count();

    let squad_cog = server_engine
        .create_from_archetype(SQUAD, Some(server_space))
        .unwrap();
    let ancestor = server.spawn_object(&mut server_engine, squad_cog).unwrap();
    let server_tree = server.replicator().get(ancestor).unwrap().family_tree;
    assert_ne!(server_tree.0, 0, "a subtree spawn allocates a family tree");

    pump2(&mut server, &mut server_engine, &mut client, &mut client_engine, 10);

    // Three new cogs on the client, parents matching the archetype.
    assert_eq!(client_engine.live_object_count(), before + 3);
    let client_root_cog = client.object_cog(ancestor).unwrap();
    let children = client_engine.cog_children(client_root_cog);
    assert_eq!(children.len(), 2);
    for child in &children {
        assert_eq!(client_engine.cog_parent(*child), Some(client_root_cog));
    }

    // Both peers agree on the family tree id.
    let client_tree = client.replicator().get(ancestor).unwrap().family_tree;
    assert_eq!(client_tree, server_tree);

    let online_count = client_engine
        .drain_dispatched()
        .iter()
        .filter(|e| matches!(e, NetPeerEvent::NetObjectOnline { .. }))
        .count();
    assert_eq!(online_count, 3, "one online event per family member");
}

#[test]
fn test_property_change_replicates() {
    let (mut server, mut server_engine, _, server_space) = open_peer(NetRole::Server);
    let (mut client, mut client_engine, _, _) = open_peer(NetRole::Client);
    join(&mut server, &mut server_engine, &mut client, &mut client_engine);

    let player_cog = server_engine
        .create_from_archetype(PLAYER, Some(server_space))
        .unwrap();
    let replica = server.spawn_object(&mut server_engine, player_cog).unwrap();
    pump2(&mut server, &mut server_engine, &mut client, &mut client_engine, 10);

    let moved = Vec3::new(5.0, 0.0, 1.0);
    server_engine
        .set_property(
            player_cog,
            "Transform",
            "Position",
            PropertyValue::Value(NetValue::Real3(moved)),
        )
        .unwrap();
    pump2(&mut server, &mut server_engine, &mut client, &mut client_engine, 10);

    let client_cog = client.object_cog(replica).unwrap();
    let value = client_engine
        .get_property(client_cog, "Transform", "Position")
        .unwrap();
    assert_eq!(value, PropertyValue::Value(NetValue::Real3(moved)));
}

#[test]
fn test_unauthorized_client_destroy() {
    let (mut server, mut server_engine, _, server_space) = open_peer(NetRole::Server);
    let (mut client, mut client_engine, _, _) = open_peer(NetRole::Client);
    join(&mut server, &mut server_engine, &mut client, &mut client_engine);

    let player_cog = server_engine
        .create_from_archetype(PLAYER, Some(server_space))
        .unwrap();
    let replica = server.spawn_object(&mut server_engine, player_cog).unwrap();
    pump2(&mut server, &mut server_engine, &mut client, &mut client_engine, 10);

    let client_cog = client.object_cog(replica).unwrap();
    client.destroy_object(&mut client_engine, replica).unwrap();

    assert!(
        client_engine.saw_warning("illegally destroyed"),
        "the client must report the unauthorized destruction"
    );
    assert!(client_engine.is_cog_destroyed(client_cog));

    // The authority is unaffected.
    pump2(&mut server, &mut server_engine, &mut client, &mut client_engine, 10);
    assert!(server.replicator().get(replica).is_some());
    assert!(!server_engine.is_cog_destroyed(player_cog));
}

#[test]
fn test_local_user_add_and_removal_releases_ownership() {
    let (mut server, mut engine, _, space) = open_peer(NetRole::Server);
    server.add_user(PayloadBundle::new()).unwrap();
    engine.advance(16);
    server.update(&mut engine);

    let events = engine.drain_dispatched();
    let granted = events
        .iter()
        .find_map(|e| match e {
            NetPeerEvent::NetUserAddResponse {
                accepted: true,
                user,
                ..
            } => Some(*user),
            _ => None,
        })
        .expect("local user add should be granted");
    assert_ne!(granted, NetUserId(0));
    assert_eq!(server.user_count(), 1);

    // Give the user three objects.
    let mut owned = Vec::new();
    for _ in 0..3 {
        let cog = engine.create_from_archetype(PLAYER, Some(space)).unwrap();
        let replica = server.spawn_object(&mut engine, cog).unwrap();
        server
            .set_net_user_owner(&mut engine, replica, granted)
            .unwrap();
        owned.push(replica);
    }
    // Three spawned objects plus the user's own object tree.
    assert_eq!(server.user(granted).unwrap().owned_count(), 4);
    engine.drain_dispatched();

    server
        .remove_user(&mut engine, granted, PayloadBundle::new())
        .unwrap();

    let events = engine.drain_dispatched();
    let owner_changes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            NetPeerEvent::NetUserOwnerChanged {
                replica,
                previous,
                current,
                ..
            } => Some((*replica, *previous, *current)),
            _ => None,
        })
        .filter(|(replica, _, _)| owned.contains(replica))
        .collect();
    assert_eq!(owner_changes.len(), 3, "one owner change per owned object");
    for (replica, previous, current) in owner_changes {
        assert_eq!(previous, granted);
        assert_eq!(current, NetUserId(0));
        assert_eq!(server.net_user_owner(replica), NetUserId(0));
    }
    assert_eq!(server.user_count(), 0);
}

#[test]
fn test_client_user_add_roundtrip() {
    let (mut server, mut server_engine, _, _) = open_peer(NetRole::Server);
    let (mut client, mut client_engine, _, _) = open_peer(NetRole::Client);

    client.add_user(PayloadBundle::new()).unwrap();
    join(&mut server, &mut server_engine, &mut client, &mut client_engine);

    let events = client_engine.drain_dispatched();
    let granted = events
        .iter()
        .find_map(|e| match e {
            NetPeerEvent::NetUserAddResponse {
                accepted: true,
                user,
                ..
            } => Some(*user),
            _ => None,
        })
        .expect("forwarded user add should be granted");

    // The user object was spawned to the client before the response.
    assert!(events.iter().any(
        |e| matches!(e, NetPeerEvent::NetUserOnline { user, .. } if *user == granted)
    ));
    assert_eq!(server.user_count(), 1);
    assert_eq!(client.user_count(), 1);

    // The server parked the user's ownership on its own object tree.
    let server_user = server.user(granted).unwrap();
    assert!(server_user.owns(server_user.replica));
}

#[test]
fn test_remote_event_reaches_target_object() {
    let (mut server, mut server_engine, server_game, _) = open_peer(NetRole::Server);
    let (mut client, mut client_engine, client_game, _) = open_peer(NetRole::Client);
    join(&mut server, &mut server_engine, &mut client, &mut client_engine);
    server_engine.drain_dispatched();

    let target = client.replica_of(client_game).unwrap();
    let event = RemoteEvent::new("ChatMessage", "OnChatMessage")
        .with_property("Text", EventProperty::Value(NetValue::String("hi".into())))
        .with_property("FromPeer", EventProperty::NetPeerId(NetPeerId(0)));
    client.send_event(target, &event).unwrap();

    pump2(&mut server, &mut server_engine, &mut client, &mut client_engine, 10);

    let events = server_engine.drain_dispatched();
    let received = events
        .iter()
        .find_map(|e| match e {
            NetPeerEvent::NetEventReceived { object, event, sender } => {
                Some((*object, event.clone(), *sender))
            }
            _ => None,
        })
        .expect("the event should arrive");
    assert_eq!(received.0, server_game);
    assert_eq!(received.1.type_name, "ChatMessage");
    assert_ne!(received.2, NetPeerId(0), "sender is the client's peer id");
    // The [NetPeerId] slot was filled with the sender on receipt.
    assert_eq!(
        received.1.property("FromPeer"),
        Some(&EventProperty::NetPeerId(received.2))
    );
}

#[test]
fn test_level_change_streams_to_client() {
    let (mut server, mut server_engine, _, server_space) = open_peer(NetRole::Server);
    let (mut client, mut client_engine, _, client_space) = open_peer(NetRole::Client);
    join(&mut server, &mut server_engine, &mut client, &mut client_engine);
    client_engine.drain_dispatched();

    let before = client_engine.live_object_count();
    let space_replica = server.replica_of(server_space).unwrap();
    server
        .change_level(&mut server_engine, space_replica, ARENA_LEVEL)
        .unwrap();
    pump2(&mut server, &mut server_engine, &mut client, &mut client_engine, 15);

    // The client loaded the level and bound its two crates.
    assert_eq!(client_engine.current_level(client_space), Some(ARENA_LEVEL));
    assert_eq!(client_engine.live_object_count(), before + 2);

    let events = client_engine.drain_dispatched();
    assert!(events.iter().any(
        |e| matches!(e, NetPeerEvent::NetLevelStarted { level, .. } if *level == ARENA_LEVEL)
    ));
}

#[test]
fn test_editor_mode_suppresses_networking() {
    let (mut engine, game, _) = build_engine();
    engine.editor_mode = true;
    let mut peer = NetPeer::new(test_config());
    let result = peer.open(&mut engine, NetRole::Server, 0, game);
    assert!(matches!(result, Err(NetPeerError::EditorMode)));
    assert!(!peer.is_open());
}

#[test]
fn test_master_server_records_publishes() {
    let (mut master, mut master_engine, _, _) = open_peer(NetRole::MasterServer);

    let (mut server_engine, server_game, _) = build_engine();
    server_engine.basic_host_info =
        PayloadBundle::with_event(RemoteEvent::new("HostInfo", "HELLO"));
    let mut server = NetPeer::new(NetPeerConfig {
        internet_discoverable: true,
        ..test_config()
    });
    server
        .open(&mut server_engine, NetRole::Server, 0, server_game)
        .unwrap();
    server.subscribe_master_server(master.local_addr().unwrap());

    pump2(&mut master, &mut master_engine, &mut server, &mut server_engine, 15);

    let events = master_engine.drain_dispatched();
    assert!(events
        .iter()
        .any(|e| matches!(e, NetPeerEvent::NetHostRecordDiscovered { .. })));
}

#[test]
fn test_master_routed_refresh_yields_indirect_info() {
    let (mut master, mut master_engine, _, _) = open_peer(NetRole::MasterServer);

    let info_bundle = PayloadBundle::with_event(RemoteEvent::new("HostInfo", "HELLO"));
    let (mut server_engine, server_game, _) = build_engine();
    server_engine.basic_host_info = info_bundle.clone();
    let mut server = NetPeer::new(NetPeerConfig {
        internet_discoverable: true,
        ..test_config()
    });
    server
        .open(&mut server_engine, NetRole::Server, 0, server_game)
        .unwrap();
    server.subscribe_master_server(master.local_addr().unwrap());

    // Let the server publish once.
    pump2(&mut master, &mut master_engine, &mut server, &mut server_engine, 15);

    let (mut client, mut client_engine, _, _) = open_peer(NetRole::Client);
    client.subscribe_master_server(master.local_addr().unwrap());
    client
        .refresh_host(
            Network::Internet,
            server.local_addr().unwrap(),
            true,
            false,
            false,
        )
        .unwrap();

    pump3(
        &mut master,
        &mut master_engine,
        &mut server,
        &mut server_engine,
        &mut client,
        &mut client_engine,
        15,
    );

    let events = client_engine.drain_dispatched();
    let discovered = events
        .iter()
        .find_map(|e| match e {
            NetPeerEvent::NetHostDiscovered {
                network: Network::Internet,
                host,
                refresh_result,
            } => Some((host.clone(), *refresh_result)),
            _ => None,
        })
        .expect("the routed refresh should discover the host");
    assert_eq!(discovered.1, RefreshResult::IndirectBasicHostInfo);
    assert_eq!(discovered.0.address, server.local_addr().unwrap());

    let mut stream = discovered.0.basic_info.clone();
    let bundle = PayloadBundle::from_stream(&mut stream, NetPeerId(0)).unwrap();
    assert_eq!(bundle, info_bundle, "the stored basic info came back intact");
}

#[test]
fn test_lan_refresh_reaches_host_directly() {
    let (mut server_engine, server_game, _) = build_engine();
    server_engine.basic_host_info =
        PayloadBundle::with_event(RemoteEvent::new("HostInfo", "LAN"));
    let mut server = NetPeer::new(NetPeerConfig {
        lan_discoverable: true,
        ..test_config()
    });
    server
        .open(&mut server_engine, NetRole::Server, 0, server_game)
        .unwrap();

    let (mut client, mut client_engine, _, _) = open_peer(NetRole::Client);
    client
        .refresh_host(Network::Lan, server.local_addr().unwrap(), true, false, false)
        .unwrap();

    pump2(&mut server, &mut server_engine, &mut client, &mut client_engine, 10);

    let events = client_engine.drain_dispatched();
    assert!(events.iter().any(|e| matches!(
        e,
        NetPeerEvent::NetHostDiscovered {
            network: Network::Lan,
            refresh_result: RefreshResult::DirectBasicHostInfo,
            ..
        }
    )));
    assert_eq!(client.hosts(Network::Lan).len(), 1);
}

#[test]
fn test_lan_refresh_with_extra_info() {
    let (mut server_engine, server_game, _) = build_engine();
    server_engine.basic_host_info =
        PayloadBundle::with_event(RemoteEvent::new("HostInfo", "BASIC"));
    let extra_bundle = PayloadBundle::with_event(RemoteEvent::new("HostExtra", "EXTRA"));
    server_engine.extra_host_info = extra_bundle.clone();
    let mut server = NetPeer::new(NetPeerConfig {
        lan_discoverable: true,
        ..test_config()
    });
    server
        .open(&mut server_engine, NetRole::Server, 0, server_game)
        .unwrap();

    let (mut client, mut client_engine, _, _) = open_peer(NetRole::Client);
    client
        .refresh_host(Network::Lan, server.local_addr().unwrap(), true, true, false)
        .unwrap();

    pump2(&mut server, &mut server_engine, &mut client, &mut client_engine, 15);

    let host = client
        .hosts(Network::Lan)
        .iter()
        .find(|h| h.address == server.local_addr().unwrap())
        .cloned()
        .expect("host should be listed");
    assert_eq!(host.refresh_result, RefreshResult::ExtraHostInfo);
    let mut stream = host.extra_info.clone().expect("extra info acquired");
    let bundle = PayloadBundle::from_stream(&mut stream, NetPeerId(0)).unwrap();
    assert_eq!(bundle, extra_bundle);
}

#[test]
fn test_internet_listing_via_record_list() {
    let (mut master, mut master_engine, _, _) = open_peer(NetRole::MasterServer);

    let (mut server_engine, server_game, _) = build_engine();
    server_engine.basic_host_info =
        PayloadBundle::with_event(RemoteEvent::new("HostInfo", "LISTED"));
    let mut server = NetPeer::new(NetPeerConfig {
        internet_discoverable: true,
        ..test_config()
    });
    server
        .open(&mut server_engine, NetRole::Server, 0, server_game)
        .unwrap();
    server.subscribe_master_server(master.local_addr().unwrap());
    pump2(&mut master, &mut master_engine, &mut server, &mut server_engine, 15);

    let (mut client, mut client_engine, _, _) = open_peer(NetRole::Client);
    client.subscribe_master_server(master.local_addr().unwrap());
    client.discover_hosts_internet(false, false).unwrap();

    pump3(
        &mut master,
        &mut master_engine,
        &mut server,
        &mut server_engine,
        &mut client,
        &mut client_engine,
        25,
    );

    let events = client_engine.drain_dispatched();
    // Stage 1: the master's record list surfaces the host indirectly.
    assert!(events.iter().any(|e| matches!(
        e,
        NetPeerEvent::NetHostDiscovered {
            refresh_result: RefreshResult::IndirectBasicHostInfo,
            ..
        }
    )));
    // Stage 2: the direct probe upgrades it and completes the listing.
    assert!(events.iter().any(|e| matches!(
        e,
        NetPeerEvent::NetHostRefreshed {
            refresh_result: RefreshResult::DirectBasicHostInfo,
            ..
        }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        NetPeerEvent::NetHostListDiscovered { network: Network::Internet, hosts } if hosts.len() == 1
    )));
}

#[test]
fn test_close_fires_offline_in_reverse_order() {
    let (mut server, mut engine, game, space) = open_peer(NetRole::Server);
    engine.drain_dispatched();

    server.close(&mut engine);
    let events = engine.drain_dispatched();

    let offline_objects: Vec<CogId> = events
        .iter()
        .filter_map(|e| match e {
            NetPeerEvent::NetObjectOffline { object, .. } => Some(*object),
            _ => None,
        })
        .collect();
    // Space first, game last: the reverse of the open-time emplace order.
    assert_eq!(offline_objects, vec![space, game]);
    assert!(events
        .iter()
        .any(|e| matches!(e, NetPeerEvent::NetPeerClosed)));
    assert!(!server.is_open());
}
