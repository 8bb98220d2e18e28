use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ecs_replica::test_utils::{registries, Health, Inventory, Marker, Position};
use ecs_replica::{
    BinaryFormat, BinarySerializer, Entity, NetComponent, SceneSnapshot, SnapshotConfig,
    SnapshotKind, SnapshotManager,
};

fn create_manager() -> SnapshotManager {
    let (schemas, sync_vars, types) = registries().unwrap();
    SnapshotManager::with_registries(SnapshotConfig::default(), schemas, sync_vars, types)
}

fn create_world(entity_count: usize) -> Vec<Entity> {
    (0..entity_count)
        .map(|i| {
            let mut entity = Entity::new(i as u32, format!("Entity_{}", i));
            entity.add_component(Position::new(i as f32, (i * 2) as f32, -(i as f32)));
            entity.add_component(Health::new(i as i32 % 100, 100));
            if i % 4 == 0 {
                entity.add_component(Inventory::new(vec![format!("item_{}", i)], i as i64));
            }
            entity
        })
        .collect()
}

fn create_test_snapshot(entity_count: usize) -> SceneSnapshot {
    create_manager()
        .create_scene_snapshot(&create_world(entity_count), SnapshotKind::Full)
        .unwrap()
}

fn benchmark_component_codecs(c: &mut Criterion) {
    let manager = create_manager();
    let components: Vec<(&str, Box<dyn NetComponent>)> = vec![
        ("schema", Box::new(Position::new(1.0, 2.0, 3.0))),
        ("reflective", Box::new(Inventory::new(vec!["sword".into(), "shield".into()], 42))),
        ("untyped", Box::new(Marker::new("spawn"))),
    ];

    let mut group = c.benchmark_group("component_codecs");

    for (name, component) in &components {
        group.bench_with_input(BenchmarkId::new("serialize", name), component, |b, component| {
            b.iter(|| {
                black_box(manager.serialize_component(component.as_ref()).unwrap());
            });
        });
    }

    group.finish();
}

fn benchmark_serialization_formats(c: &mut Criterion) {
    let snapshot = create_test_snapshot(100);

    let mut group = c.benchmark_group("serialization_formats");

    for format in &[BinaryFormat::Json, BinaryFormat::MessagePack, BinaryFormat::Bincode] {
        let serializer = BinarySerializer::new(*format);
        let encoded = serializer.serialize_snapshot(&snapshot).unwrap();

        group.bench_with_input(
            BenchmarkId::new("serialize_snapshot", format.name()),
            format,
            |b, _| {
                b.iter(|| {
                    black_box(serializer.serialize_snapshot(&snapshot).unwrap());
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("deserialize_snapshot", format.name()),
            format,
            |b, _| {
                b.iter(|| {
                    black_box(serializer.deserialize_snapshot(&encoded).unwrap());
                });
            },
        );
    }

    group.finish();
}

fn benchmark_snapshot_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("scene_snapshot");

    for entity_count in [10, 100, 1000] {
        let world = create_world(entity_count);
        group.throughput(Throughput::Elements(entity_count as u64));

        group.bench_with_input(BenchmarkId::new("full", entity_count), &world, |b, world| {
            let mut manager = create_manager();
            b.iter(|| {
                black_box(manager.create_scene_snapshot(world, SnapshotKind::Full).unwrap());
            });
        });
    }

    group.finish();
}

fn benchmark_incremental(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental_snapshot");

    for changed_percent in [0usize, 10, 50] {
        let mut manager = create_manager();
        let mut world = create_world(500);
        let base = manager.create_scene_snapshot(&world, SnapshotKind::Full).unwrap();

        if changed_percent > 0 {
            for entity in world.iter_mut().step_by(100 / changed_percent) {
                if let Some(position) = entity.get_mut::<Position>() {
                    position.x += 1.0;
                }
            }
        }

        group.bench_with_input(
            BenchmarkId::new("changed_percent", changed_percent),
            &world,
            |b, world| {
                b.iter(|| {
                    black_box(manager.create_incremental_snapshot(world, &base, true).unwrap());
                });
            },
        );
    }

    group.finish();
}

fn benchmark_restore(c: &mut Criterion) {
    let snapshot = create_test_snapshot(100);
    let manager = create_manager();

    c.bench_function("restore_full/100", |b| {
        b.iter(|| {
            let mut targets = Vec::new();
            black_box(manager.restore_from_snapshot(&snapshot, &mut targets, true).unwrap());
        });
    });
}

criterion_group!(
    benches,
    benchmark_component_codecs,
    benchmark_serialization_formats,
    benchmark_snapshot_sizes,
    benchmark_incremental,
    benchmark_restore,
);

criterion_main!(benches);
