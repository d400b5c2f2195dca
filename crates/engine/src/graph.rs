//! Relationship graph.
//!
//! Every `(key, field)` pair owns one edge holding a canonical member set
//! (server state) and a local member set (effective state, including
//! uncommitted client changes). Members are keys, never pointers, so cycles
//! are safe to traverse and to tear down as a unit.
//!
//! Adds and removes are mirrored onto the inverse edge exactly once: the
//! public entry points propagate, the mirrored call does not. A to-one edge
//! that gains a member first releases its previous member, and that release
//! is itself propagated so the displaced resource does not keep a stale
//! back-reference.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use indexmap::IndexSet;
use recordcache_core::{
    ids::ResourceKey,
    schema::{RelationshipKind, RelationshipSchema, SchemaSource},
};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Canonical,
    Local,
}

#[derive(Debug, Clone)]
pub struct RelationshipEdge {
    pub owner_type: String,
    pub schema: RelationshipSchema,
    pub link: Option<String>,
    /// Set once the server has said anything about this relationship.
    pub has_canonical_data: bool,
    canonical: IndexSet<ResourceKey>,
    local: IndexSet<ResourceKey>,
}

impl RelationshipEdge {
    fn new(owner_type: &str, schema: RelationshipSchema) -> Self {
        Self {
            owner_type: owner_type.to_string(),
            schema,
            link: None,
            has_canonical_data: false,
            canonical: IndexSet::new(),
            local: IndexSet::new(),
        }
    }

    pub fn kind(&self) -> RelationshipKind {
        self.schema.kind
    }

    pub fn inverse(&self) -> Option<&str> {
        self.schema.inverse.as_deref()
    }

    pub fn is_async(&self) -> bool {
        self.schema.is_async
    }

    pub fn canonical_members(&self) -> Vec<ResourceKey> {
        self.canonical.iter().copied().collect()
    }

    pub fn local_members(&self) -> Vec<ResourceKey> {
        self.local.iter().copied().collect()
    }

    pub fn contains(&self, member: ResourceKey) -> bool {
        self.canonical.contains(&member) || self.local.contains(&member)
    }

    fn all_members(&self) -> IndexSet<ResourceKey> {
        self.canonical.union(&self.local).copied().collect()
    }

    fn set(&self, side: Side) -> &IndexSet<ResourceKey> {
        match side {
            Side::Canonical => &self.canonical,
            Side::Local => &self.local,
        }
    }

    fn set_mut(&mut self, side: Side) -> &mut IndexSet<ResourceKey> {
        match side {
            Side::Canonical => &mut self.canonical,
            Side::Local => &mut self.local,
        }
    }
}

/// Outcome of an island search for orphan collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    Island(IndexSet<ResourceKey>),
    /// The search stopped after visiting more keys than allowed.
    Exceeded { visited: usize },
}

pub struct RelationshipGraph {
    schema: Arc<dyn SchemaSource>,
    edges: HashMap<ResourceKey, BTreeMap<String, RelationshipEdge>>,
    /// Which `(owner, field)` edges mention a key in either member set.
    inbound: HashMap<ResourceKey, IndexSet<(ResourceKey, String)>>,
    touched: IndexSet<(ResourceKey, String)>,
    pending_flush: IndexSet<(ResourceKey, String)>,
    collect_flush: bool,
    traversal: u64,
    marks: HashMap<ResourceKey, u64>,
}

impl RelationshipGraph {
    pub fn new(schema: Arc<dyn SchemaSource>) -> Self {
        Self {
            schema,
            edges: HashMap::new(),
            inbound: HashMap::new(),
            touched: IndexSet::new(),
            pending_flush: IndexSet::new(),
            collect_flush: false,
            traversal: 0,
            marks: HashMap::new(),
        }
    }

    pub fn lookup(&self, resource_type: &str, field: &str) -> Result<RelationshipSchema, EngineError> {
        self.schema
            .relationship(resource_type, field)
            .ok_or_else(|| EngineError::UnknownRelationship {
                resource_type: resource_type.to_string(),
                field: field.to_string(),
            })
    }

    pub fn edge(&self, key: ResourceKey, field: &str) -> Option<&RelationshipEdge> {
        self.edges.get(&key).and_then(|fields| fields.get(field))
    }

    pub fn fields(&self, key: ResourceKey) -> Vec<String> {
        self.edges
            .get(&key)
            .map(|fields| fields.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any edge other than the key's own still names it.
    pub fn is_referenced(&self, key: ResourceKey) -> bool {
        self.inbound
            .get(&key)
            .is_some_and(|owners| owners.iter().any(|(owner, _)| *owner != key))
    }

    /// Edges whose membership changed since the last call.
    pub fn take_touched(&mut self) -> Vec<(ResourceKey, String)> {
        self.touched.drain(..).collect()
    }

    fn touch(&mut self, key: ResourceKey, field: &str) {
        self.touched.insert((key, field.to_string()));
    }

    fn index(&mut self, member: ResourceKey, owner: ResourceKey, field: &str) {
        self.inbound
            .entry(member)
            .or_default()
            .insert((owner, field.to_string()));
    }

    fn unindex(&mut self, member: ResourceKey, owner: ResourceKey, field: &str) {
        if self.edge(owner, field).is_some_and(|e| e.contains(member)) {
            return;
        }
        if let Some(owners) = self.inbound.get_mut(&member) {
            owners.shift_remove(&(owner, field.to_string()));
            if owners.is_empty() {
                self.inbound.remove(&member);
            }
        }
    }

    fn ensure_edge(
        &mut self,
        key: ResourceKey,
        resource_type: &str,
        field: &str,
    ) -> Result<&mut RelationshipEdge, EngineError> {
        let exists = self.edge(key, field).is_some();
        if !exists {
            let schema = self.lookup(resource_type, field)?;
            self.edges
                .entry(key)
                .or_default()
                .insert(field.to_string(), RelationshipEdge::new(resource_type, schema));
        }
        self.edges
            .get_mut(&key)
            .and_then(|fields| fields.get_mut(field))
            .ok_or(EngineError::UnknownKey(key))
    }

    fn add_member(
        &mut self,
        side: Side,
        key: ResourceKey,
        resource_type: &str,
        field: &str,
        member: ResourceKey,
        propagate: bool,
    ) -> Result<bool, EngineError> {
        let edge = self.ensure_edge(key, resource_type, field)?;
        if edge.set(side).contains(&member) {
            return Ok(false);
        }
        let schema = edge.schema.clone();
        let displaced = match schema.kind {
            RelationshipKind::ToOne => edge.set(side).first().copied(),
            RelationshipKind::ToMany => None,
        };
        if let Some(old) = displaced {
            self.remove_member(side, key, field, old, true)?;
        }

        let edge = self.ensure_edge(key, resource_type, field)?;
        edge.set_mut(side).insert(member);
        if side == Side::Canonical {
            edge.has_canonical_data = true;
            if self.collect_flush {
                self.pending_flush.insert((key, field.to_string()));
            }
        }
        self.index(member, key, field);
        self.touch(key, field);

        if propagate && let Some(inverse) = &schema.inverse {
            self.add_member(side, member, &schema.related_type, inverse, key, false)?;
        }
        Ok(true)
    }

    fn remove_member(
        &mut self,
        side: Side,
        key: ResourceKey,
        field: &str,
        member: ResourceKey,
        propagate: bool,
    ) -> Result<bool, EngineError> {
        let Some(edge) = self.edges.get_mut(&key).and_then(|f| f.get_mut(field)) else {
            return Ok(false);
        };
        if !edge.set_mut(side).shift_remove(&member) {
            return Ok(false);
        }
        let inverse = edge.schema.inverse.clone();
        if side == Side::Canonical && self.collect_flush {
            self.pending_flush.insert((key, field.to_string()));
        }
        self.unindex(member, key, field);
        self.touch(key, field);

        if propagate && let Some(inverse) = inverse {
            self.remove_member(side, member, &inverse, key, false)?;
        }
        Ok(true)
    }

    fn reorder(&mut self, side: Side, key: ResourceKey, field: &str, order: &[ResourceKey]) {
        if let Some(edge) = self.edges.get_mut(&key).and_then(|f| f.get_mut(field)) {
            let position = |k: &ResourceKey| order.iter().position(|o| o == k).unwrap_or(usize::MAX);
            edge.set_mut(side).sort_by(|a, b| position(a).cmp(&position(b)));
        }
    }

    /// Move one side of an edge to exactly `target`, propagating each
    /// individual change to the inverse.
    fn converge(
        &mut self,
        side: Side,
        key: ResourceKey,
        resource_type: &str,
        field: &str,
        target: &[ResourceKey],
    ) -> Result<(), EngineError> {
        let current: Vec<ResourceKey> = self
            .edge(key, field)
            .map(|e| e.set(side).iter().copied().collect())
            .unwrap_or_default();
        for member in current.iter().filter(|m| !target.contains(m)) {
            self.remove_member(side, key, field, *member, true)?;
        }
        for member in target.iter().filter(|m| !current.contains(m)) {
            self.add_member(side, key, resource_type, field, *member, true)?;
        }
        self.reorder(side, key, field, target);
        Ok(())
    }

    fn tracking_flush<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let previous = std::mem::replace(&mut self.collect_flush, true);
        let result = f(self);
        self.collect_flush = previous;
        result
    }

    fn check_arity(
        &self,
        resource_type: &str,
        field: &str,
        members: &[ResourceKey],
    ) -> Result<RelationshipSchema, EngineError> {
        let schema = self.lookup(resource_type, field)?;
        if schema.kind == RelationshipKind::ToOne && members.len() > 1 {
            return Err(EngineError::InvalidOperation(format!(
                "{resource_type}.{field} is to-one but {} members were given",
                members.len()
            )));
        }
        Ok(schema)
    }

    /// Add members to one side of an edge. To-one edges replace their
    /// member; to-many edges append, skipping members already present.
    pub fn add_members(
        &mut self,
        key: ResourceKey,
        resource_type: &str,
        field: &str,
        members: &[ResourceKey],
        local: bool,
    ) -> Result<(), EngineError> {
        self.check_arity(resource_type, field, members)?;
        if local {
            for member in members {
                self.add_member(Side::Local, key, resource_type, field, *member, true)?;
            }
            return Ok(());
        }
        self.tracking_flush(|graph| {
            graph.ensure_edge(key, resource_type, field)?.has_canonical_data = true;
            graph.pending_flush.insert((key, field.to_string()));
            for member in members {
                graph.add_member(Side::Canonical, key, resource_type, field, *member, true)?;
            }
            Ok(())
        })
    }

    pub fn remove_members(
        &mut self,
        key: ResourceKey,
        resource_type: &str,
        field: &str,
        members: &[ResourceKey],
        local: bool,
    ) -> Result<(), EngineError> {
        self.lookup(resource_type, field)?;
        if local {
            for member in members {
                self.remove_member(Side::Local, key, field, *member, true)?;
            }
            return Ok(());
        }
        self.tracking_flush(|graph| {
            for member in members {
                graph.remove_member(Side::Canonical, key, field, *member, true)?;
            }
            Ok(())
        })
    }

    /// Canonical ingestion of a full membership list for one relationship.
    pub fn replace_canonical(
        &mut self,
        key: ResourceKey,
        resource_type: &str,
        field: &str,
        members: &[ResourceKey],
    ) -> Result<(), EngineError> {
        self.check_arity(resource_type, field, members)?;
        self.tracking_flush(|graph| {
            graph.ensure_edge(key, resource_type, field)?.has_canonical_data = true;
            graph.pending_flush.insert((key, field.to_string()));
            graph.converge(Side::Canonical, key, resource_type, field, members)
        })
    }

    /// Client-side replacement of a relationship's effective members.
    pub fn replace_local(
        &mut self,
        key: ResourceKey,
        resource_type: &str,
        field: &str,
        members: &[ResourceKey],
    ) -> Result<(), EngineError> {
        self.check_arity(resource_type, field, members)?;
        self.ensure_edge(key, resource_type, field)?;
        self.converge(Side::Local, key, resource_type, field, members)
    }

    pub fn set_link(
        &mut self,
        key: ResourceKey,
        resource_type: &str,
        field: &str,
        link: Option<String>,
    ) -> Result<(), EngineError> {
        let edge = self.ensure_edge(key, resource_type, field)?;
        if edge.link != link {
            edge.link = link;
            self.touch(key, field);
        }
        Ok(())
    }

    /// Bring local state of every edge changed by canonical ingestion back
    /// in line with canonical state. Local members that are still
    /// unpersisted survive when `retain_new` is set, since the server
    /// cannot know about them yet.
    pub fn flush_canonical(
        &mut self,
        is_new: &dyn Fn(ResourceKey) -> bool,
        retain_new: bool,
    ) -> Result<(), EngineError> {
        while !self.pending_flush.is_empty() {
            let Some((key, field)) = self.pending_flush.shift_remove_index(0) else {
                break;
            };
            let Some(edge) = self.edge(key, &field) else {
                continue;
            };
            let canonical = edge.canonical_members();
            let mut target = canonical.clone();
            if retain_new {
                match edge.kind() {
                    RelationshipKind::ToMany => {
                        target.extend(
                            edge.local
                                .iter()
                                .filter(|m| !canonical.contains(m) && is_new(**m))
                                .copied(),
                        );
                    }
                    RelationshipKind::ToOne => {
                        if canonical.is_empty()
                            && let Some(member) = edge.local.first()
                            && is_new(*member)
                        {
                            target.push(*member);
                        }
                    }
                }
            }
            let resource_type = edge.owner_type.clone();
            self.converge(Side::Local, key, &resource_type, &field, &target)?;
        }
        Ok(())
    }

    /// The server accepted the key's local relationship state.
    pub fn commit_local(&mut self, key: ResourceKey) -> Result<(), EngineError> {
        for field in self.fields(key) {
            let Some(edge) = self.edge(key, &field) else {
                continue;
            };
            let local = edge.local_members();
            let resource_type = edge.owner_type.clone();
            self.converge(Side::Canonical, key, &resource_type, &field, &local)?;
            if let Some(edge) = self.edges.get_mut(&key).and_then(|f| f.get_mut(&field)) {
                edge.has_canonical_data = true;
            }
        }
        Ok(())
    }

    /// Discard the key's uncommitted relationship changes.
    pub fn rollback_local(&mut self, key: ResourceKey) -> Result<(), EngineError> {
        for field in self.fields(key) {
            let Some(edge) = self.edge(key, &field) else {
                continue;
            };
            let canonical = edge.canonical_members();
            let resource_type = edge.owner_type.clone();
            self.converge(Side::Local, key, &resource_type, &field, &canonical)?;
        }
        Ok(())
    }

    /// Detach the key from every relationship on both sides. Used for
    /// resources that never reached the server.
    pub fn sever(&mut self, key: ResourceKey) -> Result<(), EngineError> {
        for field in self.fields(key) {
            let members = self
                .edge(key, &field)
                .map(RelationshipEdge::all_members)
                .unwrap_or_default();
            for member in members {
                self.remove_member(Side::Canonical, key, &field, member, true)?;
                self.remove_member(Side::Local, key, &field, member, true)?;
            }
        }
        let owners: Vec<(ResourceKey, String)> = self
            .inbound
            .get(&key)
            .map(|o| o.iter().cloned().collect())
            .unwrap_or_default();
        for (owner, field) in owners {
            self.remove_member(Side::Canonical, owner, &field, key, true)?;
            self.remove_member(Side::Local, owner, &field, key, true)?;
        }
        Ok(())
    }

    /// Tear down the key's own edges.
    ///
    /// Synchronous inverses drop the key from both member sets right away.
    /// Asynchronous inverses keep it as an unloaded member; their edges are
    /// returned so observers can be told the member dematerialized.
    pub fn destroy_edges(&mut self, key: ResourceKey) -> Vec<(ResourceKey, String)> {
        let mut notices: IndexSet<(ResourceKey, String)> = IndexSet::new();
        let own = self.edges.remove(&key).unwrap_or_default();

        for (field, edge) in &own {
            for member in edge.all_members() {
                self.unindex(member, key, field);
                let Some(inverse) = edge.inverse() else {
                    continue;
                };
                self.release_from(member, inverse, key, &mut notices);
            }
        }

        let owners: Vec<(ResourceKey, String)> = self
            .inbound
            .get(&key)
            .map(|o| o.iter().filter(|(owner, _)| *owner != key).cloned().collect())
            .unwrap_or_default();
        for (owner, field) in owners {
            if notices.contains(&(owner, field.clone())) {
                continue;
            }
            self.release_from(owner, &field, key, &mut notices);
        }

        self.marks.remove(&key);
        self.pending_flush.retain(|(k, _)| *k != key);
        self.touched.retain(|(k, _)| *k != key);
        notices.into_iter().collect()
    }

    fn release_from(
        &mut self,
        owner: ResourceKey,
        field: &str,
        key: ResourceKey,
        notices: &mut IndexSet<(ResourceKey, String)>,
    ) {
        let Some(edge) = self.edges.get_mut(&owner).and_then(|f| f.get_mut(field)) else {
            return;
        };
        if edge.is_async() {
            notices.insert((owner, field.to_string()));
            return;
        }
        let removed_canonical = edge.canonical.shift_remove(&key);
        let removed_local = edge.local.shift_remove(&key);
        if removed_canonical || removed_local {
            self.unindex(key, owner, field);
            self.touch(owner, field);
        }
    }

    /// Rebind everything `loser` participates in to `survivor`.
    ///
    /// When both keys hold a to-one edge the survivor's member stays, and
    /// the loser's member gives up its inverse pointing back at the loser.
    pub fn rekey(&mut self, loser: ResourceKey, survivor: ResourceKey) -> Result<(), EngineError> {
        if loser == survivor {
            return Ok(());
        }
        let redirect = |k: ResourceKey| if k == loser { survivor } else { k };

        if let Some(fields) = self.edges.remove(&loser) {
            for (field, mut edge) in fields {
                for member in edge.all_members() {
                    if let Some(owners) = self.inbound.get_mut(&member) {
                        owners.shift_remove(&(loser, field.clone()));
                    }
                }
                edge.canonical = edge.canonical.iter().map(|k| redirect(*k)).collect();
                edge.local = edge.local.iter().map(|k| redirect(*k)).collect();
                let inverse = edge.schema.inverse.clone();
                let mut dropped = Vec::new();
                let target = self.edges.entry(survivor).or_default();
                match target.get_mut(&field) {
                    Some(existing) => {
                        let keep_existing = edge.kind() == RelationshipKind::ToOne;
                        for side in [Side::Canonical, Side::Local] {
                            let kept = existing.set_mut(side);
                            if keep_existing && !kept.is_empty() {
                                dropped.extend(
                                    edge.set(side)
                                        .iter()
                                        .filter(|m| !kept.contains(*m))
                                        .map(|m| (side, *m)),
                                );
                            } else {
                                kept.extend(edge.set(side).iter().copied());
                            }
                        }
                        existing.has_canonical_data |= edge.has_canonical_data;
                        if existing.link.is_none() {
                            existing.link = edge.link.take();
                        }
                    }
                    None => {
                        target.insert(field.clone(), edge);
                    }
                }
                if let Some(inverse) = &inverse {
                    for (side, member) in dropped {
                        self.remove_member(side, member, inverse, loser, false)?;
                    }
                }
                let members = self
                    .edge(survivor, &field)
                    .map(|e| e.all_members())
                    .unwrap_or_default();
                for member in members {
                    self.index(member, survivor, &field);
                }
                self.touch(survivor, &field);
            }
        }

        if let Some(owners) = self.inbound.remove(&loser) {
            for (owner, field) in owners {
                let owner = redirect(owner);
                let Some(edge) = self.edges.get_mut(&owner).and_then(|f| f.get_mut(&field)) else {
                    continue;
                };
                for set in [&mut edge.canonical, &mut edge.local] {
                    if let Some((index, _)) = set.shift_remove_full(&loser)
                        && !set.contains(&survivor)
                    {
                        set.shift_insert(index, survivor);
                    }
                }
                self.index(survivor, owner, &field);
                self.touch(owner, &field);
            }
        }
        self.marks.remove(&loser);
        Ok(())
    }

    /// Breadth-first search over canonical and local members of every edge,
    /// starting at `start` (which is part of the result).
    ///
    /// Each search gets a fresh traversal id and tags the keys it visits.
    /// Meeting a tag from a later traversal means a search started while
    /// this one was running, which the engine never does.
    pub fn reachable_set(
        &mut self,
        start: ResourceKey,
        limit: Option<usize>,
    ) -> Result<Reachability, EngineError> {
        self.traversal += 1;
        let current = self.traversal;
        self.mark(start, current)?;

        let mut island = IndexSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(key) = queue.pop_front() {
            island.insert(key);
            if limit.is_some_and(|max| island.len() > max) {
                return Ok(Reachability::Exceeded {
                    visited: island.len(),
                });
            }
            let Some(fields) = self.edges.get(&key) else {
                continue;
            };
            for edge in fields.values() {
                for member in edge.canonical.iter().chain(edge.local.iter()) {
                    match self.marks.get(member) {
                        Some(&seen) if seen == current => continue,
                        Some(&seen) if seen > current => {
                            return Err(EngineError::ReentrantTraversal {
                                key: *member,
                                seen,
                                current,
                            });
                        }
                        _ => {
                            self.marks.insert(*member, current);
                            queue.push_back(*member);
                        }
                    }
                }
            }
        }
        Ok(Reachability::Island(island))
    }

    fn mark(&mut self, key: ResourceKey, current: u64) -> Result<(), EngineError> {
        if let Some(&seen) = self.marks.get(&key)
            && seen > current
        {
            return Err(EngineError::ReentrantTraversal { key, seen, current });
        }
        self.marks.insert(key, current);
        Ok(())
    }

    pub fn traversal_id(&self) -> u64 {
        self.traversal
    }
}
