use crate::delta::ChangeContext;
use crate::error::{Result, SyncError};
use crate::protocol::FieldMap;
use crate::snapshot::ComponentSnapshotConfig;
use ahash::AHashMap;
use once_cell::sync::Lazy;
use std::any::Any;
use std::sync::{Arc, RwLock};

/// Downcasting support for boxed components.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A component that can be replicated.
///
/// `to_fields` and `apply_fields` are the only bridge between a component's
/// own state and the codecs. `apply_fields` should read everything it needs
/// before assigning, so a rejected payload leaves the component untouched
/// (see [`FieldReader`](crate::protocol::FieldReader)).
pub trait NetComponent: AsAny {
    /// Stable name used by the registries and recorded in snapshots.
    fn type_name(&self) -> &str;

    fn to_fields(&self) -> FieldMap;

    fn apply_fields(&mut self, fields: &FieldMap) -> Result<()>;

    /// Cheap comparison against a baseline. `None` means the component has no
    /// comparator and is always treated as changed.
    fn has_changed(&self, _context: &ChangeContext<'_>) -> Option<bool> {
        None
    }

    fn snapshot_config(&self) -> ComponentSnapshotConfig {
        ComponentSnapshotConfig::default()
    }
}

/// A component type with a statically known name that can be constructed empty.
pub trait TypedComponent: NetComponent + Default {
    const TYPE_NAME: &'static str;
}

pub type ComponentConstructor = fn() -> Box<dyn NetComponent>;

fn construct<T: TypedComponent>() -> Box<dyn NetComponent> {
    Box::new(T::default())
}

static GLOBAL_TYPES: Lazy<ComponentTypeRegistry> = Lazy::new(ComponentTypeRegistry::new);

/// Maps stable type names to constructors, for materialising components
/// named in snapshot data.
pub struct ComponentTypeRegistry {
    types: Arc<RwLock<AHashMap<String, ComponentConstructor>>>,
}

impl ComponentTypeRegistry {
    pub fn new() -> Self {
        Self {
            types: Arc::new(RwLock::new(AHashMap::new())),
        }
    }

    pub fn global() -> ComponentTypeRegistry {
        GLOBAL_TYPES.clone()
    }

    pub fn register(&self, name: &str, constructor: ComponentConstructor) -> Result<()> {
        if name.is_empty() {
            return Err(SyncError::MissingTypeName);
        }

        let mut types = self.types.write().map_err(SyncError::poisoned)?;
        if types.insert(name.to_string(), constructor).is_some() {
            log::debug!("Component type '{}' re-registered", name);
        }

        Ok(())
    }

    pub fn register_type<T: TypedComponent>(&self) -> Result<()> {
        self.register(T::TYPE_NAME, construct::<T>)
    }

    pub fn get(&self, name: &str) -> Option<ComponentConstructor> {
        self.types.read().ok().and_then(|types| types.get(name).copied())
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn NetComponent>> {
        self.get(name).map(|constructor| constructor())
    }

    pub fn has(&self, name: &str) -> bool {
        self.types
            .read()
            .map(|types| types.contains_key(name))
            .unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .types
            .read()
            .map(|types| types.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.types.read().map(|types| types.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> Result<()> {
        self.types.write().map_err(SyncError::poisoned)?.clear();
        Ok(())
    }
}

impl Default for ComponentTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ComponentTypeRegistry {
    fn clone(&self) -> Self {
        Self {
            types: Arc::clone(&self.types),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Health, Position};

    #[test]
    fn test_register_and_create() {
        let registry = ComponentTypeRegistry::new();
        registry.register_type::<Position>().unwrap();
        registry.register_type::<Health>().unwrap();

        assert_eq!(registry.names(), vec!["Health".to_string(), "Position".to_string()]);

        let component = registry.create("Position").unwrap();
        assert_eq!(component.type_name(), "Position");

        let position = component.as_ref().as_any().downcast_ref::<Position>().unwrap();
        assert_eq!(position.x, 0.0);
    }

    #[test]
    fn test_unknown_type_is_not_found() {
        let registry = ComponentTypeRegistry::new();
        assert!(registry.get("Ghost").is_none());
        assert!(registry.create("Ghost").is_none());
        assert!(matches!(registry.register("", construct::<Position>), Err(SyncError::MissingTypeName)));
    }
}
