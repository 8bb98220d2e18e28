//! End-to-end replication scenarios: a server-side manager produces
//! snapshots, a client-side manager with its own registries restores them.

use ecs_replica::test_utils::*;
use ecs_replica::*;

fn init_logging() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init()
        .ok();
}

fn manager() -> SnapshotManager {
    let (schemas, sync_vars, types) = registries().unwrap();
    SnapshotManager::with_registries(SnapshotConfig::default(), schemas, sync_vars, types)
}

fn entity(id: EntityId, position: Position) -> Entity {
    let mut entity = Entity::new(id, format!("entity{}", id));
    entity.add_component(position);
    entity
}

#[test]
fn position_round_trips_through_schema_codec() {
    init_logging();

    let schemas = SchemaRegistry::new();
    schemas
        .component("Position")
        .field(1, "x", FieldType::Float)
        .unwrap()
        .field(2, "y", FieldType::Float)
        .unwrap()
        .field(3, "z", FieldType::Float)
        .unwrap()
        .register()
        .unwrap();

    let codec = SchemaCodec::new(schemas);
    let data = codec.serialize(&Position::new(1.0, 2.0, 3.0)).unwrap();

    let fields = codec.decode_fields(&data).unwrap();
    assert_eq!(fields["x"], FieldValue::F32(1.0));
    assert_eq!(fields["y"], FieldValue::F32(2.0));
    assert_eq!(fields["z"], FieldValue::F32(3.0));

    let mut decoded = Position::default();
    assert!(codec.deserialize(&mut decoded, &data).unwrap());
    assert_eq!(decoded, Position::new(1.0, 2.0, 3.0));
}

#[test]
fn incremental_snapshot_contains_only_changed_entity() {
    init_logging();

    let mut server = manager();
    let mut world = vec![
        entity(1, Position::new(0.0, 0.0, 0.0)),
        entity(2, Position::new(5.0, 5.0, 5.0)),
    ];
    let base = server.create_scene_snapshot(&world, SnapshotKind::Full).unwrap();

    world[0].get_mut::<Position>().unwrap().x = 1.0;
    let delta = server.create_incremental_snapshot(&world, &base, true).unwrap();

    assert_eq!(delta.entities.len(), 1);
    assert_eq!(delta.entities[0].id, 1);
    assert_eq!(delta.entities[0].components.len(), 1);
    assert_eq!(delta.base_snapshot_id, Some(base.snapshot_id()));

    let client = manager();
    let mut replica = Vec::new();
    client.restore_from_snapshot(&base, &mut replica, true).unwrap();
    client.restore_from_snapshot(&delta, &mut replica, false).unwrap();

    assert_eq!(replica[0].get::<Position>().unwrap(), &Position::new(1.0, 0.0, 0.0));
    assert_eq!(replica[1].get::<Position>().unwrap(), &Position::new(5.0, 5.0, 5.0));
}

#[test]
fn full_restore_without_creation_drops_unknown_entities() {
    init_logging();

    let mut server = manager();
    let world = vec![
        entity(1, Position::new(1.0, 1.0, 1.0)),
        entity(2, Position::new(2.0, 2.0, 2.0)),
    ];
    let snapshot = server.create_scene_snapshot(&world, SnapshotKind::Full).unwrap();

    let client = manager();
    let mut targets = vec![entity(2, Position::default())];
    let restored = client.restore_from_snapshot(&snapshot, &mut targets, false).unwrap();

    assert_eq!(restored, vec![2]);
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].get::<Position>().unwrap().x, 2.0);
}

#[test]
fn unregistered_component_falls_back_by_codec() {
    init_logging();

    let (schemas, sync_vars, _) = registries().unwrap();
    let schema_codec = SchemaCodec::new(schemas);
    let reflective = ReflectiveCodec::new(sync_vars);

    let marker = Marker::new("spawn");
    assert!(matches!(
        schema_codec.serialize(&marker),
        Err(SyncError::UnregisteredSchema(_))
    ));
    assert!(reflective.serialize(&marker).unwrap().is_none());

    let inventory = Inventory::new(vec!["map".into(), "torch".into()], 1_234);
    assert!(matches!(
        schema_codec.serialize(&inventory),
        Err(SyncError::UnregisteredSchema(_))
    ));
    let envelope = reflective.serialize(&inventory).unwrap().unwrap();
    assert_eq!(envelope.kind, CodecKind::Reflective);

    let mut decoded = Inventory::default();
    assert!(reflective.deserialize(&mut decoded, &envelope).unwrap());
    assert_eq!(decoded, inventory);
}

#[test]
fn snapshots_survive_binary_transport_encoding() {
    init_logging();

    let mut server = manager();
    let mut player = entity(7, Position::new(0.5, 1.5, -2.0));
    player.add_component(Health::new(40, 100));
    player.add_component(Inventory::new(vec!["rope".into()], 99));
    player.add_component(Marker::new("hero"));
    player.children = vec![8];

    let snapshot = server.create_scene_snapshot([&player], SnapshotKind::Full).unwrap();
    server.cache_snapshot(snapshot.snapshot_id(), snapshot.clone());

    let wire = BinarySerializer::messagepack();
    let bytes = wire.serialize_snapshot(&snapshot).unwrap();
    let received = wire.deserialize_snapshot(&bytes).unwrap();
    assert_eq!(&received, server.get_cached_snapshot(&snapshot.snapshot_id()).unwrap());

    let client = manager();
    let mut replica = Vec::new();
    client.restore_from_snapshot(&received, &mut replica, true).unwrap();

    let restored = &replica[0];
    assert_eq!(restored.children, vec![8]);
    assert_eq!(restored.get::<Health>().unwrap(), &Health::new(40, 100));
    assert_eq!(restored.get::<Inventory>().unwrap().items, vec!["rope".to_string()]);
    assert_eq!(restored.get::<Marker>().unwrap().label, "hero");
}

#[test]
fn field_number_collision_fails_before_serialization() {
    let schemas = SchemaRegistry::new();
    let result = schemas
        .component("Velocity")
        .field(1, "dx", FieldType::Float)
        .and_then(|builder| builder.field(1, "dy", FieldType::Float));

    assert!(matches!(result, Err(SyncError::FieldNumberCollision { .. })));
    assert!(!schemas.has("Velocity"));
}
