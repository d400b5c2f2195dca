//! Live collections of resource keys.
//!
//! "All of type" sets follow the visibility of their members. Changes are
//! batched per type and applied as add/remove diffs at flush time; a set is
//! only computed from scratch when it is first created. Query sets belong to
//! the caller, who replaces their membership wholesale.

use std::collections::{BTreeMap, HashMap};

use indexmap::{IndexMap, IndexSet};
use recordcache_core::ids::{HandleAllocator, LiveSetId, ResourceKey, SubscriptionId};

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    AllOfType(String),
    Query { resource_type: String, label: String },
}

impl Selector {
    pub fn resource_type(&self) -> &str {
        match self {
            Selector::AllOfType(t) => t,
            Selector::Query { resource_type, .. } => resource_type,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LiveSet {
    pub id: LiveSetId,
    pub selector: Selector,
    members: IndexSet<ResourceKey>,
}

impl LiveSet {
    pub fn members(&self) -> Vec<ResourceKey> {
        self.members.iter().copied().collect()
    }

    pub fn contains(&self, key: ResourceKey) -> bool {
        self.members.contains(&key)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// One incremental membership update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSetChange {
    pub set: LiveSetId,
    pub added: Vec<ResourceKey>,
    pub removed: Vec<ResourceKey>,
}

pub type LiveSetCallback = Box<dyn FnMut(&LiveSetChange) + Send>;

#[derive(Default)]
pub struct LiveSetManager {
    handles: HandleAllocator,
    sets: IndexMap<LiveSetId, LiveSet>,
    by_selector: HashMap<Selector, LiveSetId>,
    pending: BTreeMap<String, IndexSet<ResourceKey>>,
    observers: IndexMap<SubscriptionId, (LiveSetId, LiveSetCallback)>,
}

impl LiveSetManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the set for `selector`, creating it from `candidates` on first
    /// use. Only "all of type" sets consult `visible`.
    pub fn live_set_for(
        &mut self,
        selector: Selector,
        candidates: impl IntoIterator<Item = ResourceKey>,
        visible: impl Fn(ResourceKey) -> bool,
    ) -> LiveSetId {
        if let Some(id) = self.by_selector.get(&selector) {
            return *id;
        }
        let id = self.handles.next_live_set();
        let members = match &selector {
            Selector::AllOfType(_) => candidates.into_iter().filter(|k| visible(*k)).collect(),
            Selector::Query { .. } => IndexSet::new(),
        };
        tracing::trace!(?id, ?selector, "created live set");
        self.by_selector.insert(selector.clone(), id);
        self.sets.insert(
            id,
            LiveSet {
                id,
                selector,
                members,
            },
        );
        id
    }

    pub fn get(&self, id: LiveSetId) -> Option<&LiveSet> {
        self.sets.get(&id)
    }

    /// Record that a key's visibility may have changed.
    pub fn resource_changed(&mut self, resource_type: &str, key: ResourceKey) {
        self.pending
            .entry(resource_type.to_string())
            .or_default()
            .insert(key);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Re-check every batched key against its type's sets.
    pub fn flush(&mut self, visible: impl Fn(ResourceKey) -> bool) -> Vec<LiveSetChange> {
        let pending = std::mem::take(&mut self.pending);
        let mut changes = Vec::new();
        for (resource_type, keys) in pending {
            for set in self.sets.values_mut() {
                let Selector::AllOfType(t) = &set.selector else {
                    continue;
                };
                if *t != resource_type {
                    continue;
                }
                let mut change = LiveSetChange {
                    set: set.id,
                    added: Vec::new(),
                    removed: Vec::new(),
                };
                for key in &keys {
                    match (visible(*key), set.members.contains(key)) {
                        (true, false) => {
                            set.members.insert(*key);
                            change.added.push(*key);
                        }
                        (false, true) => {
                            set.members.shift_remove(key);
                            change.removed.push(*key);
                        }
                        _ => {}
                    }
                }
                if !change.added.is_empty() || !change.removed.is_empty() {
                    changes.push(change);
                }
            }
        }
        self.notify(&changes);
        changes
    }

    /// Replace a query set's membership and report the diff.
    pub fn replace_query_members(
        &mut self,
        id: LiveSetId,
        members: Vec<ResourceKey>,
    ) -> Result<LiveSetChange, EngineError> {
        let set = self.sets.get_mut(&id).ok_or(EngineError::UnknownLiveSet(id))?;
        if !matches!(set.selector, Selector::Query { .. }) {
            return Err(EngineError::NotAQuerySet(id));
        }
        let next: IndexSet<ResourceKey> = members.into_iter().collect();
        let change = LiveSetChange {
            set: id,
            added: next.difference(&set.members).copied().collect(),
            removed: set.members.difference(&next).copied().collect(),
        };
        set.members = next;
        self.notify(std::slice::from_ref(&change));
        Ok(change)
    }

    /// Drop a destroyed key from every set right away, queries included.
    pub fn remove_everywhere(&mut self, key: ResourceKey) -> Vec<LiveSetChange> {
        let mut changes = Vec::new();
        for set in self.sets.values_mut() {
            if set.members.shift_remove(&key) {
                changes.push(LiveSetChange {
                    set: set.id,
                    added: Vec::new(),
                    removed: vec![key],
                });
            }
        }
        for keys in self.pending.values_mut() {
            keys.shift_remove(&key);
        }
        self.pending.retain(|_, keys| !keys.is_empty());
        self.notify(&changes);
        changes
    }

    /// Swap `loser` for `survivor` in every set, keeping its position.
    pub fn rekey(&mut self, loser: ResourceKey, survivor: ResourceKey) {
        for set in self.sets.values_mut() {
            if let Some((index, _)) = set.members.shift_remove_full(&loser)
                && !set.members.contains(&survivor)
            {
                set.members.shift_insert(index, survivor);
            }
        }
        for keys in self.pending.values_mut() {
            if keys.shift_remove(&loser) {
                keys.insert(survivor);
            }
        }
    }

    pub fn observe(&mut self, token: SubscriptionId, id: LiveSetId, callback: LiveSetCallback) -> Result<(), EngineError> {
        if !self.sets.contains_key(&id) {
            return Err(EngineError::UnknownLiveSet(id));
        }
        self.observers.insert(token, (id, callback));
        Ok(())
    }

    pub fn unobserve(&mut self, token: SubscriptionId) -> bool {
        self.observers.shift_remove(&token).is_some()
    }

    fn notify(&mut self, changes: &[LiveSetChange]) {
        for change in changes {
            for (set, callback) in self.observers.values_mut() {
                if *set == change.set {
                    callback(change);
                }
            }
        }
    }
}
