//! Minimal entity container the snapshot manager walks and restores into.

use crate::component::{ComponentTypeRegistry, NetComponent};
use crate::protocol::{ComponentId, EntityId};
use crate::snapshot::ComponentSnapshotConfig;

/// A component attached to an entity, with the per-instance state the ECS
/// owns rather than the component itself.
pub struct ComponentSlot {
    id: ComponentId,
    pub enabled: bool,
    pub config: ComponentSnapshotConfig,
    component: Box<dyn NetComponent>,
}

impl ComponentSlot {
    pub fn new(id: ComponentId, component: Box<dyn NetComponent>) -> Self {
        Self {
            id,
            enabled: true,
            config: component.snapshot_config(),
            component,
        }
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn type_name(&self) -> &str {
        self.component.type_name()
    }

    pub fn component(&self) -> &dyn NetComponent {
        self.component.as_ref()
    }

    pub fn component_mut(&mut self) -> &mut dyn NetComponent {
        self.component.as_mut()
    }

    pub fn downcast_ref<T: NetComponent>(&self) -> Option<&T> {
        self.component().as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: NetComponent>(&mut self) -> Option<&mut T> {
        self.component_mut().as_any_mut().downcast_mut::<T>()
    }
}

impl std::fmt::Debug for ComponentSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentSlot")
            .field("id", &self.id)
            .field("type", &self.type_name())
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[derive(Debug)]
pub struct Entity {
    id: EntityId,
    pub name: String,
    pub enabled: bool,
    pub active: bool,
    pub tag: u32,
    pub update_order: i32,
    pub children: Vec<EntityId>,
    pub parent: Option<EntityId>,
    destroyed: bool,
    components: Vec<ComponentSlot>,
    next_component_id: ComponentId,
}

impl Entity {
    pub fn new(id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            enabled: true,
            active: true,
            tag: 0,
            update_order: 0,
            children: Vec::new(),
            parent: None,
            destroyed: false,
            components: Vec::new(),
            next_component_id: 1,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn destroy(&mut self) {
        self.destroyed = true;
    }

    /// Attached components in insertion order.
    pub fn components(&self) -> &[ComponentSlot] {
        &self.components
    }

    pub fn components_mut(&mut self) -> impl Iterator<Item = &mut ComponentSlot> {
        self.components.iter_mut()
    }

    pub fn component_types(&self) -> Vec<&str> {
        self.components.iter().map(|slot| slot.type_name()).collect()
    }

    /// Attaches `component`, replacing any existing component of the same
    /// type in place (its id and position are kept).
    pub fn add_component<C: NetComponent>(&mut self, component: C) -> ComponentId {
        self.add_boxed(Box::new(component))
    }

    pub fn add_boxed(&mut self, component: Box<dyn NetComponent>) -> ComponentId {
        if let Some(slot) = self
            .components
            .iter_mut()
            .find(|slot| slot.type_name() == component.type_name())
        {
            slot.config = component.snapshot_config();
            slot.component = component;
            return slot.id;
        }

        let id = self.next_component_id;
        self.next_component_id = id.saturating_add(1);
        self.components.push(ComponentSlot::new(id, component));
        id
    }

    /// Inserts a slot with a caller-chosen id, e.g. one recorded in a snapshot.
    pub fn insert_slot(&mut self, slot: ComponentSlot) -> &mut ComponentSlot {
        self.next_component_id = self.next_component_id.max(slot.id.saturating_add(1));
        self.components.retain(|existing| existing.type_name() != slot.type_name());
        self.components.push(slot);
        let last = self.components.len() - 1;
        &mut self.components[last]
    }

    pub fn has_component(&self, type_name: &str) -> bool {
        self.get_component(type_name).is_some()
    }

    pub fn get_component(&self, type_name: &str) -> Option<&ComponentSlot> {
        self.components.iter().find(|slot| slot.type_name() == type_name)
    }

    pub fn get_component_mut(&mut self, type_name: &str) -> Option<&mut ComponentSlot> {
        self.components.iter_mut().find(|slot| slot.type_name() == type_name)
    }

    pub fn remove_component(&mut self, type_name: &str) -> Option<ComponentSlot> {
        let index = self.components.iter().position(|slot| slot.type_name() == type_name)?;
        Some(self.components.remove(index))
    }

    pub fn get<T: NetComponent>(&self) -> Option<&T> {
        self.components.iter().find_map(|slot| slot.downcast_ref::<T>())
    }

    pub fn get_mut<T: NetComponent>(&mut self) -> Option<&mut T> {
        self.components.iter_mut().find_map(|slot| slot.downcast_mut::<T>())
    }

    /// Constructs a component of a registered type and attaches it. Returns
    /// the existing slot if the entity already has one.
    pub fn create_component(
        &mut self,
        registry: &ComponentTypeRegistry,
        type_name: &str,
    ) -> Option<&mut ComponentSlot> {
        if !self.has_component(type_name) {
            let component = registry.create(type_name)?;
            self.add_boxed(component);
        }
        self.get_component_mut(type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Health, Position};

    #[test]
    fn test_add_and_replace_component() {
        let mut entity = Entity::new(1, "player");
        let first = entity.add_component(Position::new(1.0, 2.0, 3.0));
        let second = entity.add_component(Health::new(10, 20));
        let replaced = entity.add_component(Position::new(4.0, 5.0, 6.0));

        assert_eq!(first, replaced);
        assert_ne!(first, second);
        assert_eq!(entity.component_types(), vec!["Position", "Health"]);
        assert_eq!(entity.get::<Position>().unwrap().x, 4.0);
    }

    #[test]
    fn test_create_component_from_registry() {
        let registry = ComponentTypeRegistry::new();
        registry.register_type::<Health>().unwrap();

        let mut entity = Entity::new(7, "npc");
        assert!(entity.create_component(&registry, "Position").is_none());

        let slot = entity.create_component(&registry, "Health").unwrap();
        slot.downcast_mut::<Health>().unwrap().current = 3;
        assert_eq!(entity.get::<Health>().unwrap().current, 3);
    }

    #[test]
    fn test_insert_slot_keeps_ids_unique() {
        let mut entity = Entity::new(1, "e");
        entity.insert_slot(ComponentSlot::new(9, Box::new(Position::default())));
        let id = entity.add_component(Health::default());
        assert_eq!(id, 10);

        entity.destroy();
        assert!(entity.is_destroyed());
        assert!(entity.remove_component("Health").is_some());
        assert!(!entity.has_component("Health"));
    }
}
