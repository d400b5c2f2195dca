use std::collections::BTreeMap;

use recordcache_core::{
    field_value::{Attributes, FieldValue},
    ids::ResourceKey,
    state::LifecycleState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// `None` for errors about the resource as a whole.
    pub field: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            message: message.into(),
        }
    }

    pub fn base(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedAttribute {
    pub canonical: Option<FieldValue>,
    pub current: FieldValue,
}

/// Cache entry for one resource.
///
/// Reads layer `local` over `in_flight` over `canonical`. A field is pending
/// in at most one of `local` and `in_flight`.
#[derive(Debug, Clone)]
pub struct ResourceRecord {
    pub key: ResourceKey,
    pub state: LifecycleState,
    pub canonical: Attributes,
    pub local: Option<Attributes>,
    pub in_flight: Option<Attributes>,
    pub errors: Vec<ValidationError>,
    pub is_reloading: bool,
}

impl ResourceRecord {
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            state: LifecycleState::Empty,
            canonical: Attributes::new(),
            local: None,
            in_flight: None,
            errors: Vec::new(),
            is_reloading: false,
        }
    }

    pub fn attribute(&self, field: &str) -> Option<&FieldValue> {
        self.local
            .as_ref()
            .and_then(|l| l.get(field))
            .or_else(|| self.in_flight.as_ref().and_then(|f| f.get(field)))
            .or_else(|| self.canonical.get(field))
    }

    pub fn attributes(&self) -> Attributes {
        let mut merged = self.canonical.clone();
        if let Some(in_flight) = &self.in_flight {
            merged.extend(in_flight.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(local) = &self.local {
            merged.extend(local.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }

    fn base_value(&self, field: &str) -> Option<&FieldValue> {
        self.in_flight
            .as_ref()
            .and_then(|f| f.get(field))
            .or_else(|| self.canonical.get(field))
    }

    pub fn has_local_changes(&self) -> bool {
        self.local.as_ref().is_some_and(|l| !l.is_empty())
    }

    pub fn is_in_flight(&self, field: &str) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.contains_key(field))
    }

    pub fn changed_attributes(&self) -> BTreeMap<String, ChangedAttribute> {
        let Some(local) = &self.local else {
            return BTreeMap::new();
        };
        local
            .iter()
            .map(|(field, value)| {
                (
                    field.clone(),
                    ChangedAttribute {
                        canonical: self.canonical.get(field).cloned(),
                        current: value.clone(),
                    },
                )
            })
            .collect()
    }

    /// Whether the record would still differ from its base if `field`
    /// were set to `value`.
    pub fn changes_after_set(&self, field: &str, value: &FieldValue) -> bool {
        let resets = self.base_value(field) == Some(value);
        let others = self
            .local
            .as_ref()
            .is_some_and(|l| l.keys().any(|k| k != field));
        !resets || others
    }

    /// Buffer a client change. Returns `true` when the effective value moved.
    pub fn set_local(&mut self, field: &str, value: FieldValue) -> bool {
        let before = self.attribute(field).cloned();
        if self.base_value(field) == Some(&value) {
            if let Some(local) = &mut self.local {
                local.remove(field);
            }
        } else {
            self.local
                .get_or_insert_with(Attributes::new)
                .insert(field.to_string(), value);
        }
        self.normalize_local();
        before.as_ref() != self.attribute(field)
    }

    /// Whether local edits survive once `incoming` becomes canonical.
    pub fn changes_after_canonical(&self, incoming: &Attributes) -> bool {
        self.local.as_ref().is_some_and(|local| {
            local.iter().any(|(field, value)| {
                incoming.get(field).or_else(|| self.base_value(field)) != Some(value)
            })
        })
    }

    /// Merge server data into the canonical layer. Local edits equal to the
    /// new canonical value are dropped. Returns fields whose canonical
    /// value changed.
    pub fn accept_canonical(&mut self, incoming: &Attributes) -> Vec<String> {
        let mut changed = Vec::new();
        for (field, value) in incoming {
            if self.canonical.get(field) != Some(value) {
                self.canonical.insert(field.clone(), value.clone());
                changed.push(field.clone());
            }
        }
        self.prune_local();
        changed
    }

    pub fn move_local_to_in_flight(&mut self) {
        let pending = self.local.take().unwrap_or_default();
        self.in_flight = Some(pending);
    }

    /// Commit acknowledged: the in-flight snapshot and any server data
    /// become canonical.
    pub fn adopt_in_flight(&mut self, server: Option<&Attributes>) -> Vec<String> {
        let mut changed = Vec::new();
        if let Some(sent) = self.in_flight.take() {
            for (field, value) in sent {
                if self.canonical.get(&field) != Some(&value) {
                    changed.push(field.clone());
                }
                self.canonical.insert(field, value);
            }
        }
        if let Some(server) = server {
            for field in self.accept_canonical(server) {
                if !changed.contains(&field) {
                    changed.push(field);
                }
            }
        }
        self.prune_local();
        changed
    }

    /// Commit rejected: the in-flight snapshot goes back under local edits
    /// made while the request was pending.
    pub fn restore_in_flight(&mut self) {
        let Some(sent) = self.in_flight.take() else {
            return;
        };
        let local = self.local.get_or_insert_with(Attributes::new);
        for (field, value) in sent {
            local.entry(field).or_insert(value);
        }
        self.prune_local();
    }

    /// Drop uncommitted edits. Returns fields whose effective value moved.
    pub fn discard_local(&mut self) -> Vec<String> {
        let mut fields: Vec<String> = self
            .local
            .take()
            .map(|l| l.into_keys().collect())
            .unwrap_or_default();
        if let Some(sent) = self.in_flight.take() {
            fields.extend(sent.into_keys().filter(|f| !fields.contains(f)).collect::<Vec<_>>());
        }
        fields
    }

    pub fn clear_data(&mut self) {
        self.canonical.clear();
        self.local = None;
        self.in_flight = None;
        self.errors.clear();
        self.is_reloading = false;
    }

    pub fn record_errors(&mut self, errors: Vec<ValidationError>) {
        for error in errors {
            if !self.errors.contains(&error) {
                self.errors.push(error);
            }
        }
    }

    pub fn clear_errors(&mut self) -> bool {
        let had = !self.errors.is_empty();
        self.errors.clear();
        had
    }

    pub fn clear_field_errors(&mut self, field: &str) -> bool {
        let before = self.errors.len();
        self.errors.retain(|e| e.field.as_deref() != Some(field));
        before != self.errors.len()
    }

    fn prune_local(&mut self) {
        if let Some(mut local) = self.local.take() {
            local.retain(|field, value| {
                self.in_flight
                    .as_ref()
                    .and_then(|f| f.get(field))
                    .or_else(|| self.canonical.get(field))
                    != Some(value)
            });
            self.local = Some(local);
        }
        self.normalize_local();
    }

    fn normalize_local(&mut self) {
        if self.local.as_ref().is_some_and(|l| l.is_empty()) {
            self.local = None;
        }
    }
}

/// Arena of resource records addressed by key.
pub trait RecordStore {
    fn get(&self, key: ResourceKey) -> Option<&ResourceRecord>;

    fn get_mut(&mut self, key: ResourceKey) -> Option<&mut ResourceRecord>;

    /// Fetch the record, creating an `empty` one when absent.
    fn ensure(&mut self, key: ResourceKey) -> &mut ResourceRecord;

    fn remove(&mut self, key: ResourceKey) -> Option<ResourceRecord>;

    fn contains(&self, key: ResourceKey) -> bool;

    /// Move the record stored under `from` to `to`.
    fn rekey(&mut self, from: ResourceKey, to: ResourceKey) -> Result<(), crate::StorageError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state_of(&self, key: ResourceKey) -> LifecycleState {
        self.get(key).map_or(LifecycleState::Empty, |r| r.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ResourceRecord {
        let mut record = ResourceRecord::new(ResourceKey::from_raw(1));
        record.accept_canonical(&Attributes::from([
            ("name".to_string(), FieldValue::from("Ada")),
            ("age".to_string(), FieldValue::from(36)),
        ]));
        record
    }

    #[test]
    fn local_edits_layer_over_canonical() {
        let mut record = record();
        assert!(record.set_local("name", "Grace".into()));
        assert_eq!(record.attribute("name"), Some(&FieldValue::from("Grace")));
        assert_eq!(record.canonical["name"], FieldValue::from("Ada"));
        assert!(record.has_local_changes());

        assert!(record.set_local("name", "Ada".into()));
        assert!(!record.has_local_changes());
        assert!(record.local.is_none());
    }

    #[test]
    fn changes_after_set_sees_resets() {
        let mut record = record();
        assert!(record.changes_after_set("name", &"Grace".into()));
        assert!(!record.changes_after_set("name", &"Ada".into()));
        record.set_local("age", 37.into());
        assert!(record.changes_after_set("name", &"Ada".into()));
    }

    #[test]
    fn commit_cycle_moves_data_through_layers() {
        let mut record = record();
        record.set_local("name", "Grace".into());
        record.move_local_to_in_flight();
        assert!(record.local.is_none());
        assert!(record.is_in_flight("name"));

        record.set_local("age", 40.into());
        let changed = record.adopt_in_flight(None);
        assert_eq!(changed, vec!["name".to_string()]);
        assert_eq!(record.canonical["name"], FieldValue::from("Grace"));
        assert!(record.in_flight.is_none());
        assert_eq!(record.attribute("age"), Some(&FieldValue::from(40)));
    }

    #[test]
    fn rejected_commit_restores_without_losing_newer_edits() {
        let mut record = record();
        record.set_local("name", "Grace".into());
        record.move_local_to_in_flight();
        record.local = Some(Attributes::from([(
            "name".to_string(),
            FieldValue::from("Hopper"),
        )]));
        record.restore_in_flight();
        assert!(record.in_flight.is_none());
        assert_eq!(record.attribute("name"), Some(&FieldValue::from("Hopper")));
    }

    #[test]
    fn canonical_push_prunes_matching_local_edits() {
        let mut record = record();
        record.set_local("name", "Grace".into());
        let incoming = Attributes::from([("name".to_string(), FieldValue::from("Grace"))]);
        assert!(!record.changes_after_canonical(&incoming));
        assert_eq!(record.accept_canonical(&incoming), vec!["name".to_string()]);
        assert!(!record.has_local_changes());
    }

    #[test]
    fn field_errors_clear_individually() {
        let mut record = record();
        record.record_errors(vec![
            ValidationError::field("name", "is taken"),
            ValidationError::base("locked"),
        ]);
        assert!(record.clear_field_errors("name"));
        assert!(!record.clear_field_errors("name"));
        assert_eq!(record.errors.len(), 1);
        assert!(record.clear_errors());
    }
}
