use std::collections::HashMap;

use indexmap::IndexSet;
use recordcache_core::{
    document::ResourceIdentifier,
    ids::{HandleAllocator, Identifier, LocalKey, ResourceKey},
};

use crate::error::StorageError;

/// Result of assigning a server id to a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityUpdate {
    /// The key already carried this id.
    Unchanged(ResourceKey),
    /// The id was free and now belongs to the key.
    Assigned(ResourceKey),
    /// Another key already owns `(type, id)`; the caller must merge.
    Conflict {
        key: ResourceKey,
        existing: ResourceKey,
    },
}

/// Maps `(type, id)` and `(type, lid)` to one stable `ResourceKey`.
///
/// Keys merged into another key stay resolvable through an alias so that
/// handles held by callers keep pointing at the surviving resource.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    handles: HandleAllocator,
    identifiers: HashMap<ResourceKey, Identifier>,
    by_id: HashMap<(String, String), ResourceKey>,
    by_lid: HashMap<(String, LocalKey), ResourceKey>,
    by_type: HashMap<String, IndexSet<ResourceKey>>,
    aliases: HashMap<ResourceKey, ResourceKey>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    /// Return the key for `ident`, allocating one when nothing matches.
    ///
    /// An id match wins over a lid match. A lid match whose key has no id
    /// yet adopts the id from `ident`.
    pub fn get_or_create(&mut self, ident: &ResourceIdentifier) -> Result<ResourceKey, StorageError> {
        ident.validate()?;
        let resource_type = ident.resource_type.as_str();

        if let Some(id) = &ident.id
            && let Some(key) = self.peek(resource_type, id)
        {
            return Ok(key);
        }

        if let Some(lid) = &ident.lid
            && let Some(key) = self.peek_local(resource_type, lid)
        {
            if let Some(id) = &ident.id {
                match self.update(key, id)? {
                    IdentityUpdate::Conflict { existing, .. } => return Ok(existing),
                    IdentityUpdate::Assigned(k) | IdentityUpdate::Unchanged(k) => return Ok(k),
                }
            }
            return Ok(key);
        }

        let local_key = match &ident.lid {
            Some(lid) => LocalKey::from_client(lid.clone()),
            None => LocalKey::generate(),
        };
        Ok(self.allocate(resource_type, ident.id.clone(), local_key))
    }

    /// Allocate a key for a client-created resource that has no id yet.
    pub fn create_local(&mut self, resource_type: &str) -> ResourceKey {
        self.allocate(resource_type, None, LocalKey::generate())
    }

    fn allocate(&mut self, resource_type: &str, id: Option<String>, local_key: LocalKey) -> ResourceKey {
        let key = self.handles.next_key();
        if let Some(id) = &id {
            self.by_id
                .insert((resource_type.to_string(), id.clone()), key);
        }
        self.by_lid
            .insert((resource_type.to_string(), local_key.clone()), key);
        self.by_type
            .entry(resource_type.to_string())
            .or_default()
            .insert(key);
        self.identifiers.insert(
            key,
            Identifier {
                key,
                resource_type: resource_type.to_string(),
                id,
                local_key,
            },
        );
        tracing::trace!(?key, resource_type, "allocated resource key");
        key
    }

    pub fn peek(&self, resource_type: &str, id: &str) -> Option<ResourceKey> {
        self.by_id
            .get(&(resource_type.to_string(), id.to_string()))
            .copied()
    }

    pub fn peek_local(&self, resource_type: &str, lid: &str) -> Option<ResourceKey> {
        self.by_lid
            .get(&(resource_type.to_string(), LocalKey::from_client(lid)))
            .copied()
    }

    /// Follow merge aliases to the live key. `None` once forgotten.
    pub fn resolve(&self, key: ResourceKey) -> Option<ResourceKey> {
        let mut cursor = key;
        while let Some(next) = self.aliases.get(&cursor) {
            cursor = *next;
        }
        self.identifiers.contains_key(&cursor).then_some(cursor)
    }

    pub fn identifier(&self, key: ResourceKey) -> Option<&Identifier> {
        self.resolve(key).and_then(|k| self.identifiers.get(&k))
    }

    pub fn resource_type(&self, key: ResourceKey) -> Option<&str> {
        self.identifier(key).map(|i| i.resource_type.as_str())
    }

    pub fn is_new(&self, key: ResourceKey) -> bool {
        self.identifier(key).is_some_and(Identifier::is_new)
    }

    /// Assign a server id to `key`.
    pub fn update(&mut self, key: ResourceKey, id: &str) -> Result<IdentityUpdate, StorageError> {
        let key = self.resolve(key).ok_or(StorageError::UnknownKey(key))?;
        let ident = self
            .identifiers
            .get(&key)
            .ok_or(StorageError::UnknownKey(key))?;

        match &ident.id {
            Some(current) if current == id => return Ok(IdentityUpdate::Unchanged(key)),
            Some(current) => {
                return Err(StorageError::IdChange {
                    resource: ident.to_string(),
                    from: current.clone(),
                    to: id.to_string(),
                });
            }
            None => {}
        }

        let resource_type = ident.resource_type.clone();
        if let Some(existing) = self.peek(&resource_type, id) {
            return Ok(IdentityUpdate::Conflict { key, existing });
        }

        self.by_id.insert((resource_type, id.to_string()), key);
        if let Some(ident) = self.identifiers.get_mut(&key) {
            ident.id = Some(id.to_string());
        }
        Ok(IdentityUpdate::Assigned(key))
    }

    /// Fold `loser` into `survivor`. The loser stops existing as an
    /// identity; its handle, id and lid all resolve to the survivor.
    pub fn merge(&mut self, survivor: ResourceKey, loser: ResourceKey) -> Result<&Identifier, StorageError> {
        let survivor = self.resolve(survivor).ok_or(StorageError::UnknownKey(survivor))?;
        let loser = self.resolve(loser).ok_or(StorageError::UnknownKey(loser))?;
        if survivor == loser {
            return self
                .identifiers
                .get(&survivor)
                .ok_or(StorageError::UnknownKey(survivor));
        }

        {
            let kept = self
                .identifiers
                .get(&survivor)
                .ok_or(StorageError::UnknownKey(survivor))?;
            let lost = self
                .identifiers
                .get(&loser)
                .ok_or(StorageError::UnknownKey(loser))?;
            if kept.resource_type != lost.resource_type {
                return Err(StorageError::TypeMismatch {
                    expected: kept.resource_type.clone(),
                    found: lost.resource_type.clone(),
                });
            }
            if let (Some(a), Some(b)) = (&kept.id, &lost.id)
                && a != b
            {
                return Err(StorageError::IdChange {
                    resource: kept.to_string(),
                    from: a.clone(),
                    to: b.clone(),
                });
            }
        }

        let lost = self
            .identifiers
            .remove(&loser)
            .ok_or(StorageError::UnknownKey(loser))?;
        let kept = self
            .identifiers
            .get_mut(&survivor)
            .ok_or(StorageError::UnknownKey(survivor))?;

        if kept.id.is_none() {
            kept.id = lost.id.clone();
        }
        let resource_type = kept.resource_type.clone();
        if let Some(id) = &kept.id {
            self.by_id.insert((resource_type.clone(), id.clone()), survivor);
        }
        for target in self.by_lid.values_mut() {
            if *target == loser {
                *target = survivor;
            }
        }
        for target in self.aliases.values_mut() {
            if *target == loser {
                *target = survivor;
            }
        }
        self.aliases.insert(loser, survivor);
        if let Some(keys) = self.by_type.get_mut(&resource_type) {
            keys.shift_remove(&loser);
        }
        tracing::debug!(?survivor, ?loser, "merged resource keys");

        self.identifiers
            .get(&survivor)
            .ok_or(StorageError::UnknownKey(survivor))
    }

    /// Drop every trace of `key`. Handles aliased to it stop resolving.
    pub fn forget(&mut self, key: ResourceKey) -> Option<Identifier> {
        let key = self.resolve(key)?;
        let ident = self.identifiers.remove(&key)?;
        if let Some(id) = &ident.id {
            self.by_id.remove(&(ident.resource_type.clone(), id.clone()));
        }
        self.by_lid.retain(|_, target| *target != key);
        self.aliases.retain(|_, target| *target != key);
        if let Some(keys) = self.by_type.get_mut(&ident.resource_type) {
            keys.shift_remove(&key);
        }
        tracing::trace!(%ident, "forgot resource key");
        Some(ident)
    }

    /// Live keys of a type in allocation order.
    pub fn keys_of_type(&self, resource_type: &str) -> Vec<ResourceKey> {
        self.by_type
            .get(resource_type)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_type_and_id_yield_same_key() {
        let mut registry = IdentityRegistry::new();
        let a = registry
            .get_or_create(&ResourceIdentifier::new("user", "1"))
            .unwrap();
        let b = registry
            .get_or_create(&ResourceIdentifier::new("user", "1"))
            .unwrap();
        let c = registry
            .get_or_create(&ResourceIdentifier::new("post", "1"))
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn lid_match_adopts_server_id() {
        let mut registry = IdentityRegistry::new();
        let key = registry
            .get_or_create(&ResourceIdentifier::local("user", "tmp-1"))
            .unwrap();
        assert!(registry.is_new(key));

        let with_id = ResourceIdentifier {
            resource_type: "user".into(),
            id: Some("5".into()),
            lid: Some("tmp-1".into()),
        };
        assert_eq!(registry.get_or_create(&with_id).unwrap(), key);
        assert_eq!(registry.peek("user", "5"), Some(key));
        assert!(!registry.is_new(key));
    }

    #[test]
    fn update_reports_conflict_with_existing_owner() {
        let mut registry = IdentityRegistry::new();
        let existing = registry
            .get_or_create(&ResourceIdentifier::new("user", "9"))
            .unwrap();
        let fresh = registry.create_local("user");
        assert_eq!(
            registry.update(fresh, "9").unwrap(),
            IdentityUpdate::Conflict {
                key: fresh,
                existing
            }
        );
        assert_eq!(
            registry.update(existing, "9").unwrap(),
            IdentityUpdate::Unchanged(existing)
        );
        assert!(registry.update(existing, "10").is_err());
    }

    #[test]
    fn merge_rebinds_loser_to_survivor() {
        let mut registry = IdentityRegistry::new();
        let existing = registry
            .get_or_create(&ResourceIdentifier::new("user", "9"))
            .unwrap();
        let fresh = registry.create_local("user");
        let fresh_lid = registry.identifier(fresh).unwrap().local_key.clone();

        let merged = registry.merge(fresh, existing).unwrap();
        assert_eq!(merged.key, fresh);
        assert_eq!(merged.id.as_deref(), Some("9"));

        assert_eq!(registry.resolve(existing), Some(fresh));
        assert_eq!(registry.peek("user", "9"), Some(fresh));
        assert_eq!(registry.peek_local("user", fresh_lid.as_str()), Some(fresh));
        assert_eq!(registry.keys_of_type("user"), vec![fresh]);
    }

    #[test]
    fn merge_refuses_type_mismatch() {
        let mut registry = IdentityRegistry::new();
        let user = registry.create_local("user");
        let post = registry.create_local("post");
        assert!(matches!(
            registry.merge(user, post),
            Err(StorageError::TypeMismatch { .. })
        ));
        assert!(registry.identifier(post).is_some());
    }

    #[test]
    fn forget_clears_aliases_and_indexes() {
        let mut registry = IdentityRegistry::new();
        let a = registry
            .get_or_create(&ResourceIdentifier::new("user", "1"))
            .unwrap();
        let b = registry.create_local("user");
        registry.merge(a, b).unwrap();

        assert!(registry.forget(a).is_some());
        assert_eq!(registry.resolve(a), None);
        assert_eq!(registry.resolve(b), None);
        assert_eq!(registry.peek("user", "1"), None);
        assert!(registry.keys_of_type("user").is_empty());
        assert!(registry.forget(a).is_none());

        let again = registry
            .get_or_create(&ResourceIdentifier::new("user", "1"))
            .unwrap();
        assert_ne!(again, a);
    }
}
