use crate::component::{ComponentTypeRegistry, NetComponent};
use crate::debug::{log_snapshot, trace_snapshot};
use crate::delta::{self, ChangeContext};
use crate::entity::{ComponentSlot, Entity};
use crate::error::{Result, SyncError};
use crate::protocol::{CodecKind, EntityId, FieldMap, SerializedData};
use crate::reflective::{ReflectiveCodec, ReflectiveRegistry};
use crate::schema::SchemaRegistry;
use crate::schema_codec::{SchemaCodec, SchemaCodecConfig};
use crate::snapshot::{
    current_timestamp, ComponentSnapshot, EntitySnapshot, SceneSnapshot, SnapshotKind,
};
use ahash::{AHashMap, AHashSet};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotConfig {
    pub max_cache_size: usize,
    pub snapshot_version: u32,
    /// Construct components a restore target lacks instead of skipping them.
    pub create_missing_components: bool,
    /// Return component restore failures instead of logging them.
    pub strict: bool,
    pub codec: SchemaCodecConfig,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 10,
            snapshot_version: 1,
            create_missing_components: false,
            strict: false,
            codec: SchemaCodecConfig::default(),
        }
    }
}

impl SnapshotConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_cache_size(mut self, size: usize) -> Self {
        self.max_cache_size = size.max(1);
        self
    }

    pub fn with_snapshot_version(mut self, version: u32) -> Self {
        self.snapshot_version = version;
        self
    }

    pub fn with_create_missing_components(mut self, enabled: bool) -> Self {
        self.create_missing_components = enabled;
        self
    }

    pub fn with_strict(mut self, enabled: bool) -> Self {
        self.strict = enabled;
        self
    }

    pub fn with_codec_config(mut self, config: SchemaCodecConfig) -> Self {
        self.codec = config;
        self
    }
}

/// Insertion-ordered snapshot store. Past the bound the oldest insert goes.
pub struct SnapshotCache {
    order: VecDeque<String>,
    snapshots: AHashMap<String, SceneSnapshot>,
    max_size: usize,
}

impl SnapshotCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            order: VecDeque::new(),
            snapshots: AHashMap::new(),
            max_size: max_size.max(1),
        }
    }

    /// Re-inserting an id replaces the snapshot but keeps its original slot.
    pub fn insert(&mut self, id: String, snapshot: SceneSnapshot) {
        if let Some(existing) = self.snapshots.get_mut(&id) {
            *existing = snapshot;
            return;
        }

        self.order.push_back(id.clone());
        self.snapshots.insert(id, snapshot);

        while self.order.len() > self.max_size {
            if let Some(oldest) = self.order.pop_front() {
                self.snapshots.remove(&oldest);
                log::trace!("Evicted cached snapshot {}", oldest);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&SceneSnapshot> {
        self.snapshots.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.snapshots.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.snapshots.clear();
    }
}

/// Builds, diffs and restores scene snapshots.
pub struct SnapshotManager {
    config: SnapshotConfig,
    schema_codec: SchemaCodec,
    reflective: ReflectiveCodec,
    types: ComponentTypeRegistry,
    cache: SnapshotCache,
    last_timestamp: u64,
}

impl SnapshotManager {
    /// Uses the process-wide registries.
    pub fn new(config: SnapshotConfig) -> Self {
        Self::with_registries(
            config,
            SchemaRegistry::global(),
            ReflectiveRegistry::global(),
            ComponentTypeRegistry::global(),
        )
    }

    pub fn with_registries(
        config: SnapshotConfig,
        schemas: SchemaRegistry,
        sync_vars: ReflectiveRegistry,
        types: ComponentTypeRegistry,
    ) -> Self {
        Self {
            schema_codec: SchemaCodec::with_config(schemas, config.codec.clone()),
            reflective: ReflectiveCodec::new(sync_vars),
            types,
            cache: SnapshotCache::new(config.max_cache_size),
            last_timestamp: 0,
            config,
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn schema_codec(&self) -> &SchemaCodec {
        &self.schema_codec
    }

    pub fn reflective_codec(&self) -> &ReflectiveCodec {
        &self.reflective
    }

    pub fn type_registry(&self) -> &ComponentTypeRegistry {
        &self.types
    }

    /// Timestamp of the most recent snapshot this manager produced, 0 if none.
    pub fn last_snapshot_timestamp(&self) -> u64 {
        self.last_timestamp
    }

    fn next_timestamp(&mut self) -> u64 {
        self.last_timestamp = current_timestamp().max(self.last_timestamp + 1);
        self.last_timestamp
    }

    pub fn create_scene_snapshot<'a>(
        &mut self,
        entities: impl IntoIterator<Item = &'a Entity>,
        kind: SnapshotKind,
    ) -> Result<SceneSnapshot> {
        let timestamp = self.next_timestamp();

        let snapshots = live_sorted(entities)
            .into_iter()
            .map(|entity| self.entity_snapshot(entity, timestamp))
            .collect::<Result<Vec<_>>>()?;

        let snapshot = SceneSnapshot {
            entities: snapshots,
            timestamp,
            version: self.config.snapshot_version,
            kind,
            base_snapshot_id: None,
            removed_entities: Vec::new(),
        };

        self.finish(&snapshot);
        Ok(snapshot)
    }

    pub fn create_entity_snapshot(&self, entity: &Entity) -> Result<EntitySnapshot> {
        self.entity_snapshot(entity, current_timestamp().max(self.last_timestamp))
    }

    fn entity_snapshot(&self, entity: &Entity, timestamp: u64) -> Result<EntitySnapshot> {
        let components = entity
            .components()
            .iter()
            .filter(|slot| slot.config.include_in_snapshot)
            .map(|slot| self.create_component_snapshot(slot))
            .collect::<Result<Vec<_>>>()?;

        Ok(entity_header(entity, components, timestamp))
    }

    pub fn create_component_snapshot(&self, slot: &ComponentSlot) -> Result<ComponentSnapshot> {
        Ok(ComponentSnapshot {
            component_type: slot.type_name().to_string(),
            id: slot.id(),
            data: self.serialize_component(slot.component())?,
            enabled: slot.enabled,
            config: slot.config,
        })
    }

    /// Schema codec first, then declared sync vars, then every field.
    pub fn serialize_component(&self, component: &dyn NetComponent) -> Result<SerializedData> {
        match self.schema_codec.serialize(component) {
            Ok(data) => return Ok(data),
            Err(SyncError::UnregisteredSchema(name)) => {
                log::debug!("No schema for '{}', using reflective codec", name);
            }
            Err(e) => {
                log::warn!(
                    "Schema serialization of '{}' failed, falling back to reflective codec: {}",
                    component.type_name(),
                    e
                );
            }
        }

        match self.reflective.serialize(component)? {
            Some(data) => Ok(data),
            None => self.reflective.serialize_untyped(component),
        }
    }

    /// Entities that are new or changed relative to `base`; within changed
    /// entities only the changed components. With change detection off,
    /// every live entity is sent in full.
    pub fn create_incremental_snapshot<'a>(
        &mut self,
        entities: impl IntoIterator<Item = &'a Entity>,
        base: &SceneSnapshot,
        enable_change_detection: bool,
    ) -> Result<SceneSnapshot> {
        let timestamp = self.next_timestamp();
        let live = live_sorted(entities);

        let base_entities: AHashMap<EntityId, &EntitySnapshot> =
            base.entities.iter().map(|e| (e.id, e)).collect();

        let mut snapshots = Vec::new();
        for entity in &live {
            let base_entity = match base_entities.get(&entity.id()) {
                Some(base_entity) if enable_change_detection => *base_entity,
                _ => {
                    snapshots.push(self.entity_snapshot(entity, timestamp)?);
                    continue;
                }
            };

            let structure_changed = delta::has_entity_structure_changed(entity, base_entity);
            let changed = self.get_changed_components(entity, base_entity);
            if !structure_changed && changed.is_empty() {
                continue;
            }

            let components = changed
                .into_iter()
                .map(|slot| self.create_component_snapshot(slot))
                .collect::<Result<Vec<_>>>()?;
            snapshots.push(entity_header(entity, components, timestamp));
        }

        let live_ids: AHashSet<EntityId> = live.iter().map(|e| e.id()).collect();
        let mut removed: Vec<EntityId> = base
            .entities
            .iter()
            .map(|e| e.id)
            .filter(|id| !live_ids.contains(id))
            .collect();
        removed.sort_unstable();

        let snapshot = SceneSnapshot {
            entities: snapshots,
            timestamp,
            version: self.config.snapshot_version,
            kind: SnapshotKind::Incremental,
            base_snapshot_id: Some(base.snapshot_id()),
            removed_entities: removed,
        };

        self.finish(&snapshot);
        Ok(snapshot)
    }

    fn finish(&self, snapshot: &SceneSnapshot) {
        log::debug!(
            "Created {:?} snapshot {} with {} entities",
            snapshot.kind,
            snapshot.snapshot_id(),
            snapshot.entities.len()
        );
        log_snapshot("Created", snapshot);
        trace_snapshot(snapshot);
    }

    pub fn has_entity_structure_changed(&self, entity: &Entity, base: &EntitySnapshot) -> bool {
        delta::has_entity_structure_changed(entity, base)
    }

    /// Included components that are new or changed since `base`.
    pub fn get_changed_components<'e>(&self, entity: &'e Entity, base: &EntitySnapshot) -> Vec<&'e ComponentSlot> {
        entity
            .components()
            .iter()
            .filter(|slot| slot.config.include_in_snapshot)
            .filter(|slot| self.component_changed(slot, base))
            .collect()
    }

    fn component_changed(&self, slot: &ComponentSlot, base: &EntitySnapshot) -> bool {
        let base_component = match base.component(slot.type_name()) {
            Some(component) => component,
            None => return true,
        };

        if !slot.config.enable_incremental || slot.enabled != base_component.enabled {
            return true;
        }

        let baseline = match self.decode_fields(&base_component.data) {
            Ok(fields) => fields,
            Err(e) => {
                log::debug!("Cannot decode base data for '{}': {}", slot.type_name(), e);
                return true;
            }
        };

        // Field metadata only describes the baseline when it came from that codec.
        let (schema, sync_vars) = match base_component.data.kind {
            CodecKind::Schema => (self.schema_codec.registry().get(slot.type_name()), None),
            CodecKind::Reflective => (None, self.reflective.registry().get(slot.type_name())),
        };
        let context = ChangeContext {
            component_type: slot.type_name(),
            baseline: &baseline,
            schema: schema.as_deref(),
            sync_vars: sync_vars.as_deref().map(Vec::as_slice),
        };

        slot.component().has_changed(&context).unwrap_or(true)
    }

    /// Decodes a payload with whichever codec produced it.
    pub fn decode_fields(&self, data: &SerializedData) -> Result<FieldMap> {
        match data.kind {
            CodecKind::Schema => self.schema_codec.decode_fields(data),
            CodecKind::Reflective => self.reflective.decode_fields(data),
        }
    }

    /// Applies `snapshot` to `targets`, returning the ids that were restored.
    ///
    /// Full snapshots create entities missing from `targets` when
    /// `create_missing_entities` is set and skip them otherwise. Incremental
    /// snapshots only update existing entities and destroy those listed as
    /// removed.
    pub fn restore_from_snapshot(
        &self,
        snapshot: &SceneSnapshot,
        targets: &mut Vec<Entity>,
        create_missing_entities: bool,
    ) -> Result<Vec<EntityId>> {
        log_snapshot("Restoring", snapshot);

        let may_create = snapshot.kind == SnapshotKind::Full && create_missing_entities;
        let mut restored = Vec::with_capacity(snapshot.entities.len());

        for entity_snapshot in &snapshot.entities {
            let existing = targets
                .iter()
                .position(|e| e.id() == entity_snapshot.id && !e.is_destroyed());

            let (index, created) = match existing {
                Some(index) => (index, false),
                None if may_create => {
                    targets.push(Entity::new(entity_snapshot.id, entity_snapshot.name.clone()));
                    (targets.len() - 1, true)
                }
                None => {
                    log::debug!("Entity {} not present, skipping", entity_snapshot.id);
                    continue;
                }
            };

            let entity = &mut targets[index];
            apply_header(entity, entity_snapshot);

            for component in &entity_snapshot.components {
                let allow_create = created || self.config.create_missing_components;
                match self.restore_component(entity, component, allow_create) {
                    Ok(_) => {}
                    Err(e) if self.config.strict => return Err(e),
                    Err(e) => log::warn!(
                        "Failed to restore '{}' on entity {}: {}",
                        component.component_type,
                        entity_snapshot.id,
                        e
                    ),
                }
            }

            restored.push(entity_snapshot.id);
        }

        if snapshot.kind == SnapshotKind::Incremental {
            for entity in targets.iter_mut() {
                if snapshot.removed_entities.contains(&entity.id()) && !entity.is_destroyed() {
                    log::debug!("Entity {} removed since base, destroying", entity.id());
                    entity.destroy();
                }
            }
        }

        Ok(restored)
    }

    /// Decodes one component snapshot into `entity`. `Ok(false)` when the
    /// component was skipped or its payload rejected.
    ///
    /// The payload is decoded by the codec named in its envelope. A reflective
    /// envelope for a type with a registered schema is accepted, since the
    /// sender falls back to it when schema encoding fails. A schema envelope
    /// for a type without a schema fails with `UnregisteredSchema`.
    pub fn restore_component_from_snapshot(
        &self,
        entity: &mut Entity,
        snapshot: &ComponentSnapshot,
    ) -> Result<bool> {
        self.restore_component(entity, snapshot, self.config.create_missing_components)
    }

    fn restore_component(
        &self,
        entity: &mut Entity,
        snapshot: &ComponentSnapshot,
        allow_create: bool,
    ) -> Result<bool> {
        let component_type = snapshot.component_type.as_str();

        if !self.types.has(component_type) {
            log::warn!("Unknown component type '{}' in snapshot, skipping", component_type);
            return Ok(false);
        }

        if !entity.has_component(component_type) {
            if !allow_create {
                log::error!(
                    "Entity {} has no '{}' component to restore into, skipping",
                    entity.id(),
                    component_type
                );
                return Ok(false);
            }

            match self.types.create(component_type) {
                Some(component) => {
                    entity.insert_slot(ComponentSlot::new(snapshot.id, component));
                }
                None => return Ok(false),
            }
        }

        let slot = match entity.get_component_mut(component_type) {
            Some(slot) => slot,
            None => return Ok(false),
        };

        if snapshot.data.kind == CodecKind::Reflective && self.schema_codec.supports(component_type) {
            log::debug!(
                "'{}' has a schema but arrived as a reflective envelope, decoding reflectively",
                component_type
            );
        }

        let applied = match snapshot.data.kind {
            CodecKind::Schema => self.schema_codec.deserialize(slot.component_mut(), &snapshot.data)?,
            CodecKind::Reflective => self.reflective.deserialize(slot.component_mut(), &snapshot.data)?,
        };

        if applied {
            slot.enabled = snapshot.enabled;
            slot.config = snapshot.config;
        }

        Ok(applied)
    }

    pub fn cache_snapshot(&mut self, id: impl Into<String>, snapshot: SceneSnapshot) {
        self.cache.insert(id.into(), snapshot);
    }

    pub fn get_cached_snapshot(&self, id: &str) -> Option<&SceneSnapshot> {
        self.cache.get(id)
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}

fn live_sorted<'a>(entities: impl IntoIterator<Item = &'a Entity>) -> Vec<&'a Entity> {
    let mut live: Vec<&Entity> = entities.into_iter().filter(|e| !e.is_destroyed()).collect();
    live.sort_by_key(|e| e.id());
    live
}

fn entity_header(entity: &Entity, components: Vec<ComponentSnapshot>, timestamp: u64) -> EntitySnapshot {
    EntitySnapshot {
        id: entity.id(),
        name: entity.name.clone(),
        enabled: entity.enabled,
        active: entity.active,
        tag: entity.tag,
        update_order: entity.update_order,
        components,
        children: entity.children.clone(),
        parent: entity.parent,
        timestamp,
    }
}

fn apply_header(entity: &mut Entity, snapshot: &EntitySnapshot) {
    entity.name = snapshot.name.clone();
    entity.enabled = snapshot.enabled;
    entity.active = snapshot.active;
    entity.tag = snapshot.tag;
    entity.update_order = snapshot.update_order;
    entity.children = snapshot.children.clone();
    entity.parent = snapshot.parent;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ComponentSnapshotConfig;
    use crate::protocol::FieldType;
    use crate::reflective::{SyncVar, ValueKind};
    use crate::schema::FieldOptions;
    use crate::test_utils::{registries, Blob, Health, Inventory, Marker, Position, Velocity};

    fn manager(config: SnapshotConfig) -> SnapshotManager {
        let (schemas, sync_vars, types) = registries().unwrap();
        SnapshotManager::with_registries(config, schemas, sync_vars, types)
    }

    fn player(id: EntityId, x: f32) -> Entity {
        let mut entity = Entity::new(id, format!("player{}", id));
        entity.add_component(Position::new(x, 0.0, 0.0));
        entity.add_component(Health::new(100, 100));
        entity
    }

    #[test]
    fn test_scene_snapshot_order_and_filters() {
        let mut manager = manager(SnapshotConfig::default());

        let mut hidden = player(1, 0.0);
        hidden.destroy();
        let mut second = player(3, 0.0);
        second.get_component_mut("Health").unwrap().config = ComponentSnapshotConfig::excluded();
        let entities = vec![second, player(2, 0.0), hidden];

        let snapshot = manager.create_scene_snapshot(&entities, SnapshotKind::Full).unwrap();
        let ids: Vec<EntityId> = snapshot.entities.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(snapshot.entities[1].component_types(), vec!["Position"]);
        assert_eq!(snapshot.version, 1);
        assert_eq!(manager.last_snapshot_timestamp(), snapshot.timestamp);
    }

    #[test]
    fn test_codec_fallback_order() {
        let manager = manager(SnapshotConfig::default());

        let schema = manager.serialize_component(&Position::new(1.0, 2.0, 3.0)).unwrap();
        assert_eq!(schema.kind, CodecKind::Schema);

        let reflective = manager.serialize_component(&Inventory::new(vec!["a".into()], 1)).unwrap();
        assert_eq!(reflective.kind, CodecKind::Reflective);

        let untyped = manager.serialize_component(&Marker::new("m")).unwrap();
        assert_eq!(untyped.kind, CodecKind::Reflective);
        assert!(untyped.as_json_str().unwrap().contains("\"label\":\"m\""));
    }

    #[test]
    fn test_incremental_only_changed_entity() {
        let mut manager = manager(SnapshotConfig::default());
        let mut entities = vec![player(1, 0.0), player(2, 0.0)];
        let base = manager.create_scene_snapshot(&entities, SnapshotKind::Full).unwrap();

        entities[0].get_mut::<Position>().unwrap().x = 1.0;

        let delta = manager.create_incremental_snapshot(&entities, &base, true).unwrap();
        assert_eq!(delta.kind, SnapshotKind::Incremental);
        assert_eq!(delta.entities.len(), 1);
        assert_eq!(delta.entities[0].id, 1);
        assert_eq!(delta.entities[0].component_types(), vec!["Position"]);
        assert!(delta.is_based_on(&base));
        assert!(delta.timestamp > base.timestamp);
    }

    #[test]
    fn test_incremental_unchanged_is_empty() {
        let mut manager = manager(SnapshotConfig::default());
        let entities = vec![player(1, 0.0)];
        let base = manager.create_scene_snapshot(&entities, SnapshotKind::Full).unwrap();

        let delta = manager.create_incremental_snapshot(&entities, &base, true).unwrap();
        assert!(delta.entities.is_empty());

        let everything = manager.create_incremental_snapshot(&entities, &base, false).unwrap();
        assert_eq!(everything.entities.len(), 1);
        assert_eq!(everything.entities[0].components.len(), 2);
    }

    #[test]
    fn test_unchanged_narrow_reflective_fields_are_not_resent() {
        let mut manager = manager(SnapshotConfig::default());
        manager
            .reflective_codec()
            .registry()
            .register(
                "Velocity",
                vec![SyncVar::new("dx", ValueKind::Float), SyncVar::new("hp", ValueKind::Int)],
            )
            .unwrap();

        let mut entity = Entity::new(1, "mover");
        entity.add_component(Velocity::new(0.123, 5));
        let base = manager.create_scene_snapshot([&entity], SnapshotKind::Full).unwrap();
        assert_eq!(base.entities[0].components[0].data.kind, CodecKind::Reflective);

        let delta = manager.create_incremental_snapshot([&entity], &base, true).unwrap();
        assert!(delta.entities.is_empty());

        entity.get_mut::<Velocity>().unwrap().hp = 4;
        let delta = manager.create_incremental_snapshot([&entity], &base, true).unwrap();
        assert_eq!(delta.entities.len(), 1);
    }

    #[test]
    fn test_unchanged_quantised_schema_fields_are_not_resent() {
        let mut manager = manager(SnapshotConfig::default());
        manager
            .schema_codec()
            .registry()
            .component("Velocity")
            .field_with(1, "dx", FieldType::Float, FieldOptions::new().with_precision(0.01))
            .unwrap()
            .field(2, "hp", FieldType::Int32)
            .unwrap()
            .register()
            .unwrap();

        let mut entity = Entity::new(1, "mover");
        entity.add_component(Velocity::new(0.123, 5));
        let base = manager.create_scene_snapshot([&entity], SnapshotKind::Full).unwrap();
        assert_eq!(base.entities[0].components[0].data.kind, CodecKind::Schema);

        let delta = manager.create_incremental_snapshot([&entity], &base, true).unwrap();
        assert!(delta.entities.is_empty());

        entity.get_mut::<Velocity>().unwrap().dx = 0.5;
        let delta = manager.create_incremental_snapshot([&entity], &base, true).unwrap();
        assert_eq!(delta.entities.len(), 1);
    }

    #[test]
    fn test_unchanged_untyped_component_is_not_resent() {
        let mut source = manager(SnapshotConfig::default());
        let mut entity = Entity::new(1, "cache");
        entity.add_component(Blob {
            payload: vec![9, 8, 7],
            seen_at: 1_234,
            mode: 1,
        });
        let base = source.create_scene_snapshot([&entity], SnapshotKind::Full).unwrap();

        let delta = source.create_incremental_snapshot([&entity], &base, true).unwrap();
        assert!(delta.entities.is_empty());

        let target = manager(SnapshotConfig::default());
        let mut world = vec![Entity::new(1, "cache")];
        assert_eq!(target.restore_from_snapshot(&base, &mut world, false).unwrap(), vec![1]);
        assert!(!world[0].has_component("Blob"));

        world[0].add_component(Blob::default());
        target.restore_from_snapshot(&base, &mut world, false).unwrap();
        assert_eq!(world[0].get::<Blob>().unwrap().payload, vec![9, 8, 7]);
    }

    #[test]
    fn test_incremental_structure_and_removals() {
        let mut manager = manager(SnapshotConfig::default());
        let mut entities = vec![player(1, 0.0), player(2, 0.0), player(3, 0.0)];
        let base = manager.create_scene_snapshot(&entities, SnapshotKind::Full).unwrap();

        entities[0].tag = 7;
        entities[1].add_component(Marker::new("new"));
        entities[2].destroy();
        entities.push(player(4, 0.0));

        let delta = manager.create_incremental_snapshot(&entities, &base, true).unwrap();
        let ids: Vec<EntityId> = delta.entities.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 4]);
        assert!(delta.entities[0].components.is_empty());
        assert_eq!(delta.entities[1].component_types(), vec!["Marker"]);
        assert_eq!(delta.entities[2].components.len(), 2);
        assert_eq!(delta.removed_entities, vec![3]);
    }

    #[test]
    fn test_components_without_hook_always_change() {
        let mut manager = manager(SnapshotConfig::default());
        let mut entity = player(1, 0.0);
        entity.add_component(Marker::new("same"));
        let base = manager.create_scene_snapshot([&entity], SnapshotKind::Full).unwrap();

        let changed = manager.get_changed_components(&entity, &base.entities[0]);
        let types: Vec<&str> = changed.iter().map(|slot| slot.type_name()).collect();
        assert_eq!(types, vec!["Marker"]);

        entity.get_component_mut("Health").unwrap().enabled = false;
        assert_eq!(manager.get_changed_components(&entity, &base.entities[0]).len(), 2);
    }

    #[test]
    fn test_restore_full_creates_when_asked() {
        let mut source = manager(SnapshotConfig::default());
        let mut entity = player(5, 4.5);
        entity.add_component(Inventory::new(vec!["key".into()], 99));
        let snapshot = source.create_scene_snapshot([&entity], SnapshotKind::Full).unwrap();

        let target = manager(SnapshotConfig::default());
        let mut world = Vec::new();
        assert!(target.restore_from_snapshot(&snapshot, &mut world, false).unwrap().is_empty());
        assert!(world.is_empty());

        let restored = target.restore_from_snapshot(&snapshot, &mut world, true).unwrap();
        assert_eq!(restored, vec![5]);
        assert_eq!(world[0].name, "player5");
        assert_eq!(world[0].get::<Position>().unwrap().x, 4.5);
        assert_eq!(world[0].get::<Inventory>().unwrap().items, vec!["key".to_string()]);
        assert_eq!(
            world[0].get_component("Position").unwrap().id(),
            entity.get_component("Position").unwrap().id()
        );
    }

    #[test]
    fn test_restore_incremental_never_creates() {
        let mut manager = manager(SnapshotConfig::default());
        let mut entities = vec![player(1, 0.0), player(2, 0.0)];
        let base = manager.create_scene_snapshot(&entities, SnapshotKind::Full).unwrap();

        entities[0].get_mut::<Position>().unwrap().x = 8.0;
        entities.remove(1);
        entities.push(player(9, 0.0));
        let delta = manager.create_incremental_snapshot(&entities, &base, true).unwrap();

        let mut world = vec![player(1, 0.0), player(2, 0.0)];
        let restored = manager.restore_from_snapshot(&delta, &mut world, true).unwrap();
        assert_eq!(restored, vec![1]);
        assert_eq!(world.len(), 2);
        assert_eq!(world[0].get::<Position>().unwrap().x, 8.0);
        assert!(world[1].is_destroyed());
    }

    #[test]
    fn test_missing_component_policy() {
        let mut source = manager(SnapshotConfig::default());
        let snapshot = source.create_scene_snapshot([&player(1, 3.0)], SnapshotKind::Full).unwrap();

        let skipping = manager(SnapshotConfig::default());
        let mut bare = Entity::new(1, "bare");
        let position = snapshot.entities[0].component("Position").unwrap();
        assert!(!skipping.restore_component_from_snapshot(&mut bare, position).unwrap());
        assert!(!bare.has_component("Position"));

        let creating = manager(SnapshotConfig::new().with_create_missing_components(true));
        assert!(creating.restore_component_from_snapshot(&mut bare, position).unwrap());
        assert_eq!(bare.get::<Position>().unwrap().x, 3.0);
    }

    #[test]
    fn test_strict_restore_surfaces_errors() {
        let mut entity = Entity::new(1, "e");
        entity.add_component(Marker::new("keep"));

        let bad = ComponentSnapshot {
            component_type: "Marker".to_string(),
            id: 1,
            data: SerializedData::schema("Marker", Vec::new(), "ecs.Marker".to_string(), 1),
            enabled: true,
            config: ComponentSnapshotConfig::default(),
        };
        let snapshot = SceneSnapshot {
            entities: vec![entity_header(&entity, vec![bad], 1)],
            timestamp: 1,
            version: 1,
            kind: SnapshotKind::Full,
            base_snapshot_id: None,
            removed_entities: Vec::new(),
        };

        let mut world = vec![entity];
        let lenient = manager(SnapshotConfig::default());
        assert_eq!(lenient.restore_from_snapshot(&snapshot, &mut world, false).unwrap(), vec![1]);
        assert_eq!(world[0].get::<Marker>().unwrap().label, "keep");

        let strict = manager(SnapshotConfig::new().with_strict(true));
        assert!(matches!(
            strict.restore_from_snapshot(&snapshot, &mut world, false),
            Err(SyncError::UnregisteredSchema(_))
        ));
    }

    #[test]
    fn test_restore_accepts_max_component_id() {
        let mut source = manager(SnapshotConfig::default());
        let mut snapshot = source.create_scene_snapshot([&player(1, 2.0)], SnapshotKind::Full).unwrap();
        snapshot.entities[0]
            .components
            .iter_mut()
            .find(|component| component.component_type == "Position")
            .unwrap()
            .id = u32::MAX;

        let target = manager(SnapshotConfig::default());
        let mut world = Vec::new();
        assert_eq!(target.restore_from_snapshot(&snapshot, &mut world, true).unwrap(), vec![1]);
        assert_eq!(world[0].get_component("Position").unwrap().id(), u32::MAX);
        assert_eq!(world[0].get::<Health>().unwrap().current, 100);
    }

    #[test]
    fn test_reflective_envelope_for_schema_type() {
        let manager = manager(SnapshotConfig::default());
        let fallback = ComponentSnapshot {
            component_type: "Position".to_string(),
            id: 1,
            data: manager.reflective_codec().serialize_untyped(&Position::new(6.0, 0.5, -1.0)).unwrap(),
            enabled: true,
            config: ComponentSnapshotConfig::default(),
        };

        let mut entity = Entity::new(1, "e");
        entity.add_component(Position::default());
        assert!(manager.restore_component_from_snapshot(&mut entity, &fallback).unwrap());
        assert_eq!(entity.get::<Position>().unwrap(), &Position::new(6.0, 0.5, -1.0));
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        let mut source = manager(SnapshotConfig::default());
        let snapshot = source.create_scene_snapshot([&player(1, 2.0)], SnapshotKind::Full).unwrap();

        let (schemas, sync_vars, types) = registries().unwrap();
        types.clear().unwrap();
        types.register_type::<Health>().unwrap();
        let target = SnapshotManager::with_registries(SnapshotConfig::default(), schemas, sync_vars, types);

        let mut world = vec![Entity::new(1, "e")];
        world[0].add_component(Position::default());
        world[0].add_component(Health::new(1, 1));

        assert_eq!(target.restore_from_snapshot(&snapshot, &mut world, false).unwrap(), vec![1]);
        assert_eq!(world[0].get::<Position>().unwrap().x, 0.0);
        assert_eq!(world[0].get::<Health>().unwrap().current, 100);
    }

    #[test]
    fn test_cache_is_fifo_and_bounded() {
        let mut manager = manager(SnapshotConfig::new().with_max_cache_size(3));
        let entities = vec![player(1, 0.0)];

        let mut ids = Vec::new();
        for _ in 0..4 {
            let snapshot = manager.create_scene_snapshot(&entities, SnapshotKind::Full).unwrap();
            ids.push(snapshot.snapshot_id());
            manager.cache_snapshot(snapshot.snapshot_id(), snapshot);
        }

        assert_eq!(manager.cache_len(), 3);
        assert!(manager.get_cached_snapshot(&ids[0]).is_none());
        assert!(manager.get_cached_snapshot(&ids[3]).is_some());

        // Reads do not refresh FIFO position.
        manager.get_cached_snapshot(&ids[1]);
        let next = manager.create_scene_snapshot(&entities, SnapshotKind::Full).unwrap();
        manager.cache_snapshot(next.snapshot_id(), next);
        assert!(manager.get_cached_snapshot(&ids[1]).is_none());

        manager.clear_cache();
        assert!(manager.cache().is_empty());
    }
}
