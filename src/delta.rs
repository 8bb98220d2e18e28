//! Change detection between live entities and a base snapshot.

use crate::entity::Entity;
use crate::protocol::{FieldMap, FieldValue};
use crate::reflective::SyncVar;
use crate::schema::ComponentSchema;
use crate::snapshot::EntitySnapshot;

/// What a component's `has_changed` hook gets to compare against: the base
/// snapshot's data for that component, decoded, plus whatever field metadata
/// is registered for its type.
pub struct ChangeContext<'a> {
    pub component_type: &'a str,
    pub baseline: &'a FieldMap,
    pub schema: Option<&'a ComponentSchema>,
    pub sync_vars: Option<&'a [SyncVar]>,
}

impl<'a> ChangeContext<'a> {
    /// Names of fields in `current` that moved meaningfully from the baseline.
    ///
    /// Schema fields honour their `change_threshold` and precision; sync vars
    /// honour their `delta` flag and custom compare. Everything else compares
    /// by value, ignoring the numeric width the baseline was decoded into.
    pub fn changed_fields(&self, current: &FieldMap) -> Vec<String> {
        if let Some(schema) = self.schema {
            return schema.changed_fields(current, self.baseline);
        }

        if let Some(vars) = self.sync_vars {
            return vars
                .iter()
                .filter(|var| var.changed(current.get(&var.name), self.baseline.get(&var.name)))
                .map(|var| var.name.clone())
                .collect();
        }

        let mut names: Vec<String> = current
            .iter()
            .filter(|(name, value)| {
                !self
                    .baseline
                    .get(*name)
                    .map_or(false, |base| base.same_value(value))
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.extend(
            self.baseline
                .keys()
                .filter(|name| !current.contains_key(*name))
                .cloned(),
        );
        names
    }

    pub fn differs(&self, current: &FieldMap) -> bool {
        !self.changed_fields(current).is_empty()
    }

    pub fn baseline_value(&self, name: &str) -> Option<&FieldValue> {
        self.baseline.get(name)
    }
}

/// Types of the components an entity would put into a snapshot, sorted.
pub fn snapshot_component_types(entity: &Entity) -> Vec<&str> {
    let mut types: Vec<&str> = entity
        .components()
        .iter()
        .filter(|slot| slot.config.include_in_snapshot)
        .map(|slot| slot.type_name())
        .collect();
    types.sort_unstable();
    types
}

/// Header fields or the set of component types differ from the base.
pub fn has_entity_structure_changed(entity: &Entity, base: &EntitySnapshot) -> bool {
    if entity.enabled != base.enabled
        || entity.active != base.active
        || entity.tag != base.tag
        || entity.update_order != base.update_order
    {
        return true;
    }

    snapshot_component_types(entity) != base.component_types()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FieldType;
    use crate::reflective::{SyncVar, ValueKind};
    use crate::schema::{FieldOptions, SchemaRegistry};

    fn map(pairs: &[(&str, FieldValue)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_exact_comparison_without_metadata() {
        let baseline = map(&[("x", FieldValue::F32(1.0)), ("gone", FieldValue::Bool(true))]);
        let context = ChangeContext {
            component_type: "Position",
            baseline: &baseline,
            schema: None,
            sync_vars: None,
        };

        let current = map(&[("x", FieldValue::F32(1.0)), ("y", FieldValue::F32(2.0))]);
        let mut changed = context.changed_fields(&current);
        changed.sort();
        assert_eq!(changed, vec!["gone".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_schema_threshold() {
        let registry = SchemaRegistry::new();
        let schema = registry
            .component("Position")
            .field_with(1, "x", FieldType::Float, FieldOptions::new().with_change_threshold(0.1))
            .unwrap()
            .register()
            .unwrap();

        let baseline = map(&[("x", FieldValue::F32(1.0))]);
        let context = ChangeContext {
            component_type: "Position",
            baseline: &baseline,
            schema: Some(&*schema),
            sync_vars: None,
        };

        assert!(!context.differs(&map(&[("x", FieldValue::F32(1.05))])));
        assert!(context.differs(&map(&[("x", FieldValue::F32(1.5))])));
    }

    #[test]
    fn test_sync_var_compare() {
        fn same_sign(a: &FieldValue, b: &FieldValue) -> bool {
            a.as_f64().map(f64::signum) == b.as_f64().map(f64::signum)
        }

        let vars = vec![
            SyncVar::new("speed", ValueKind::Float).with_compare(same_sign),
            SyncVar::new("label", ValueKind::String),
        ];
        let baseline = map(&[("speed", FieldValue::F64(2.0)), ("label", "a".into())]);
        let context = ChangeContext {
            component_type: "Mover",
            baseline: &baseline,
            schema: None,
            sync_vars: Some(&vars),
        };

        assert!(!context.differs(&map(&[("speed", FieldValue::F64(9.0)), ("label", "a".into())])));
        assert_eq!(
            context.changed_fields(&map(&[("speed", FieldValue::F64(-1.0)), ("label", "a".into())])),
            vec!["speed".to_string()]
        );
    }
}
