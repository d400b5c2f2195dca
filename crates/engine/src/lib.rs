pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod live_set;
pub mod notify;
pub mod requests;
pub mod scheduler;

pub use error::EngineError;
pub use graph::{Reachability, RelationshipEdge, RelationshipGraph};
pub use lifecycle::{
    Effect, LifecycleEvent, LifecycleMachine, Outcome, RecordFacts, TransitionCacheStats, TransitionPath,
};
pub use live_set::{LiveSet, LiveSetChange, LiveSetManager, Selector};
pub use notify::{ChangeKind, Notification, NotificationHub};
pub use requests::{FetchFailure, FetchTicket, RequestTracker};
pub use scheduler::{Task, TaskQueue};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use recordcache_core::{
    config::CacheConfig,
    document::{Document, ResourceIdentifier, ResourceObject},
    field_value::{Attributes, FieldValue},
    ids::{Identifier, LiveSetId, ResourceKey, SubscriptionId},
    schema::{RelationshipKind, SchemaSource},
    state::LifecycleState,
};
use recordcache_storage::{
    ChangedAttribute, IdentityRegistry, IdentityUpdate, MemoryStore, RecordStore, ResourceRecord,
    ValidationError,
};

/// Client-side change to one relationship's effective members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationshipOp {
    Add(Vec<ResourceKey>),
    Remove(Vec<ResourceKey>),
    Replace(Vec<ResourceKey>),
}

/// Read model for one relationship.
///
/// Reading a relationship whose members were never loaded yields an empty
/// view with `has_data == false` rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipView {
    pub key: ResourceKey,
    pub field: String,
    pub kind: RelationshipKind,
    pub is_async: bool,
    pub link: Option<String>,
    pub members: Vec<ResourceKey>,
    pub canonical: Vec<ResourceKey>,
    pub has_data: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub destroyed: Vec<ResourceKey>,
    pub live_set_changes: Vec<LiveSetChange>,
}

/// Data carried along with a lifecycle event.
#[derive(Debug, Default)]
struct EventData {
    attributes: Option<Attributes>,
    errors: Vec<ValidationError>,
}

impl EventData {
    fn attributes(attributes: Attributes) -> Self {
        Self {
            attributes: Some(attributes),
            errors: Vec::new(),
        }
    }
}

fn is_visible(
    registry: &IdentityRegistry,
    records: &MemoryStore,
    tasks: &TaskQueue,
    dematerializing: &HashSet<ResourceKey>,
    key: ResourceKey,
) -> bool {
    if registry.resolve(key) != Some(key) {
        return false;
    }
    let state = records.state_of(key);
    !tasks.is_destroy_scheduled(key)
        && !dematerializing.contains(&key)
        && !state.is_empty()
        && state != LifecycleState::DeletedSaved
}

/// The resource cache: identity map, lifecycle, relationship graph and
/// live views behind one single-threaded owner.
///
/// Every public operation runs to completion before any observer is
/// called. Follow-up work (orphan collection, live-set refreshes) waits
/// for `flush`.
pub struct Cache {
    schema: Arc<dyn SchemaSource>,
    config: CacheConfig,
    registry: IdentityRegistry,
    records: MemoryStore,
    graph: RelationshipGraph,
    machine: LifecycleMachine,
    live_sets: LiveSetManager,
    hub: NotificationHub,
    tasks: TaskQueue,
    requests: RequestTracker,
    materialized: HashSet<ResourceKey>,
    dematerializing: HashSet<ResourceKey>,
}

impl Cache {
    pub fn new(schema: Arc<dyn SchemaSource>, config: CacheConfig) -> Self {
        Self {
            graph: RelationshipGraph::new(Arc::clone(&schema)),
            machine: LifecycleMachine::new(config.memoize_transitions),
            schema,
            config,
            registry: IdentityRegistry::new(),
            records: MemoryStore::new(),
            live_sets: LiveSetManager::new(),
            hub: NotificationHub::new(),
            tasks: TaskQueue::new(),
            requests: RequestTracker::new(),
            materialized: HashSet::new(),
            dematerializing: HashSet::new(),
        }
    }

    pub fn with_defaults(schema: Arc<dyn SchemaSource>) -> Self {
        Self::new(schema, CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn schema(&self) -> &dyn SchemaSource {
        self.schema.as_ref()
    }

    fn live_key(&self, key: ResourceKey) -> Result<ResourceKey, EngineError> {
        self.registry.resolve(key).ok_or(EngineError::UnknownKey(key))
    }

    fn describe(&self, key: ResourceKey) -> String {
        self.registry
            .identifier(key)
            .map(|i| i.to_string())
            .unwrap_or_else(|| format!("{key:?}"))
    }

    fn finish<T>(&mut self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        self.hub.deliver();
        result
    }

    fn mark_changed(&mut self, key: ResourceKey) {
        if let Some(resource_type) = self.registry.resource_type(key) {
            self.live_sets.resource_changed(resource_type, key);
        }
        self.tasks.schedule_live_flush();
    }

    fn notify_fields(&mut self, key: ResourceKey, kind: ChangeKind, fields: &[String]) {
        for field in fields {
            self.hub.enqueue(key, kind, Some(field));
        }
    }

    // ========================================================================
    // Identity
    // ========================================================================

    /// The key for `ident`, created on first reference.
    pub fn identifier_for(&mut self, ident: &ResourceIdentifier) -> Result<ResourceKey, EngineError> {
        let result = self.resolve_identifier(ident);
        self.finish(result)
    }

    pub fn peek(&self, resource_type: &str, id: &str) -> Option<ResourceKey> {
        self.registry.peek(resource_type, id)
    }

    pub fn identifier(&self, key: ResourceKey) -> Option<&Identifier> {
        self.registry.identifier(key)
    }

    /// The live key a handle currently stands for. `None` once forgotten.
    pub fn resolve(&self, key: ResourceKey) -> Option<ResourceKey> {
        self.registry.resolve(key)
    }

    pub fn is_known(&self, key: ResourceKey) -> bool {
        self.registry.resolve(key).is_some()
    }

    fn resolve_identifier(&mut self, ident: &ResourceIdentifier) -> Result<ResourceKey, EngineError> {
        ident.validate()?;
        if !self.schema.has_type(&ident.resource_type) {
            return Err(EngineError::InvalidOperation(format!(
                "unknown resource type {}",
                ident.resource_type
            )));
        }
        if let (Some(id), Some(lid)) = (&ident.id, &ident.lid)
            && let (Some(by_id), Some(by_lid)) = (
                self.registry.peek(&ident.resource_type, id),
                self.registry.peek_local(&ident.resource_type, lid),
            )
            && by_id != by_lid
        {
            return self.merge_keys(by_lid, by_id);
        }

        let adopting = ident.id.is_some()
            && ident
                .lid
                .as_deref()
                .and_then(|lid| self.registry.peek_local(&ident.resource_type, lid))
                .is_some_and(|k| self.registry.is_new(k));
        let key = self.registry.get_or_create(ident)?;
        if adopting {
            self.hub.enqueue(key, ChangeKind::Identity, None);
        }
        Ok(key)
    }

    /// Fold two keys for the same resource into one.
    ///
    /// `updating` is the key whose id assignment revealed the duplicate; its
    /// record carries the in-progress lifecycle and wins. The key with a
    /// materialized consumer survives, or `updating` when neither has one.
    fn merge_keys(&mut self, updating: ResourceKey, existing: ResourceKey) -> Result<ResourceKey, EngineError> {
        if self.materialized.contains(&updating) && self.materialized.contains(&existing) {
            return Err(EngineError::IrreconcilableMerge {
                resource: self.describe(existing),
            });
        }
        let (survivor, loser) = if self.materialized.contains(&existing) {
            (existing, updating)
        } else {
            (updating, existing)
        };

        self.registry.merge(survivor, loser)?;

        let updating_wins = self
            .records
            .get(updating)
            .is_some_and(|r| !r.state.is_empty() || !self.records.contains(existing));
        let (winner, discarded) = if updating_wins {
            (updating, existing)
        } else {
            (existing, updating)
        };
        self.records.remove(discarded);
        if winner != survivor && self.records.contains(winner) {
            self.records.rekey(winner, survivor)?;
        }

        self.graph.rekey(loser, survivor)?;
        self.live_sets.rekey(loser, survivor);
        self.tasks.rekey(loser, survivor);
        self.requests.rekey(loser, survivor);
        self.hub.rebind(loser, survivor);
        if self.materialized.remove(&loser) {
            self.materialized.insert(survivor);
        }
        self.dematerializing.remove(&loser);
        if !self.records.state_of(survivor).is_empty() {
            self.tasks.cancel_destroy(survivor);
            self.dematerializing.remove(&survivor);
        }

        tracing::debug!(%survivor, %loser, resource = %self.describe(survivor), "merged duplicate keys");
        self.hub.enqueue(survivor, ChangeKind::Identity, None);
        self.mark_changed(survivor);
        Ok(survivor)
    }

    // ========================================================================
    // Lifecycle dispatch
    // ========================================================================

    fn current_facts(&self, key: ResourceKey) -> RecordFacts {
        self.records
            .get(key)
            .map(|r| RecordFacts {
                has_local_changes: r.has_local_changes(),
                has_errors: !r.errors.is_empty(),
            })
            .unwrap_or_default()
    }

    /// Facts as they will be once the event's data is applied.
    fn facts_for(&self, key: ResourceKey, event: LifecycleEvent, data: &EventData) -> RecordFacts {
        let mut facts = self.current_facts(key);
        if event == LifecycleEvent::PushedData
            && let Some(incoming) = &data.attributes
            && let Some(record) = self.records.get(key)
        {
            facts.has_local_changes = record.changes_after_canonical(incoming);
        }
        facts
    }

    fn dispatch(&mut self, key: ResourceKey, event: LifecycleEvent, data: &mut EventData) -> Result<(), EngineError> {
        let facts = self.facts_for(key, event, data);
        let outcome = self.machine.send(self.records.state_of(key), event, facts)?;
        self.records.ensure(key);
        self.apply(key, outcome, data)
    }

    fn apply(&mut self, key: ResourceKey, outcome: Outcome, data: &mut EventData) -> Result<(), EngineError> {
        let mut followups = Vec::new();
        for effect in outcome.effects {
            self.apply_effect(key, effect, data, &mut followups)?;
        }
        if let Some(target) = outcome.target {
            self.transition(key, target, data, &mut followups)?;
        }
        for event in followups {
            self.dispatch(key, event, &mut EventData::default())?;
        }
        Ok(())
    }

    fn transition(
        &mut self,
        key: ResourceKey,
        target: LifecycleState,
        data: &mut EventData,
        followups: &mut Vec<LifecycleEvent>,
    ) -> Result<(), EngineError> {
        let from = self.records.state_of(key);
        let path = self.machine.transition_path(from, target);

        for node in &path.exits {
            for effect in LifecycleMachine::exit_effects(*node) {
                self.apply_effect(key, *effect, data, followups)?;
            }
        }
        self.records.ensure(key).state = path.destination;
        for node in &path.enters {
            for effect in LifecycleMachine::enter_effects(*node) {
                self.apply_effect(key, *effect, data, followups)?;
            }
        }
        let facts = self.current_facts(key);
        for effect in LifecycleMachine::setup_effects(path.destination, facts) {
            self.apply_effect(key, effect, data, followups)?;
        }

        if from != path.destination {
            tracing::debug!(%key, from = from.name(), to = path.destination.name(), "lifecycle transition");
            self.hub.enqueue(key, ChangeKind::State, None);
            self.mark_changed(key);
            if !path.destination.is_empty() {
                self.tasks.cancel_destroy(key);
                self.dematerializing.remove(&key);
            }
        }
        Ok(())
    }

    fn apply_effect(
        &mut self,
        key: ResourceKey,
        effect: Effect,
        data: &mut EventData,
        followups: &mut Vec<LifecycleEvent>,
    ) -> Result<(), EngineError> {
        match effect {
            Effect::AcceptPayload => {
                if let Some(incoming) = &data.attributes {
                    let changed = self.records.ensure(key).accept_canonical(incoming);
                    self.notify_fields(key, ChangeKind::Attributes, &changed);
                }
            }
            Effect::MoveLocalToInFlight => self.records.ensure(key).move_local_to_in_flight(),
            Effect::AdoptInFlight => {
                let changed = self.records.ensure(key).adopt_in_flight(data.attributes.as_ref());
                self.notify_fields(key, ChangeKind::Attributes, &changed);
            }
            Effect::RestoreInFlight => self.records.ensure(key).restore_in_flight(),
            Effect::RecordErrors => {
                let errors = std::mem::take(&mut data.errors);
                self.records.ensure(key).record_errors(errors);
                self.hub.enqueue(key, ChangeKind::Errors, None);
            }
            Effect::ClearErrors => {
                if self.records.ensure(key).clear_errors() {
                    self.hub.enqueue(key, ChangeKind::Errors, None);
                }
            }
            Effect::DiscardLocal => {
                let changed = self.records.ensure(key).discard_local();
                self.notify_fields(key, ChangeKind::Attributes, &changed);
            }
            Effect::CommitRelationships => {
                self.graph.commit_local(key)?;
                self.notify_touched();
            }
            Effect::RollbackRelationships => {
                self.graph.rollback_local(key)?;
                self.notify_touched();
            }
            Effect::SeverRelationships => {
                self.graph.sever(key)?;
                self.notify_touched();
            }
            Effect::Unload => {
                self.materialized.remove(&key);
                self.dematerializing.insert(key);
                self.tasks.schedule_destroy(key);
                self.hub.enqueue(key, ChangeKind::Unload, None);
                self.mark_changed(key);
            }
            Effect::ClearRecordData => self.records.ensure(key).clear_data(),
            Effect::MarkReloading => self.records.ensure(key).is_reloading = true,
            Effect::FinishLoad => self.records.ensure(key).is_reloading = false,
            Effect::Send(event) => followups.push(event),
        }
        Ok(())
    }

    fn notify_touched(&mut self) {
        for (key, field) in self.graph.take_touched() {
            self.hub.enqueue(key, ChangeKind::Relationships, Some(&field));
        }
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Merge a server document into the cache. Returns the keys of the
    /// primary resources in payload order.
    pub fn push(&mut self, document: &Document) -> Result<Vec<ResourceKey>, EngineError> {
        let result = self.ingest(document);
        self.finish(result)
    }

    /// Reject documents that would fail half-way through ingestion.
    fn validate_document(&self, document: &Document) -> Result<(), EngineError> {
        for resource in document.resources() {
            resource.identifier().validate()?;
            if resource.id.is_none() && resource.lid.is_none() {
                return Err(EngineError::InvalidOperation(format!(
                    "{} resource without id or lid",
                    resource.resource_type
                )));
            }
            self.validate_resource(resource)?;
        }
        Ok(())
    }

    fn validate_resource(&self, resource: &ResourceObject) -> Result<(), EngineError> {
        if !self.schema.has_type(&resource.resource_type) {
            return Err(EngineError::InvalidOperation(format!(
                "unknown resource type {}",
                resource.resource_type
            )));
        }
        for (field, relationship) in &resource.relationships {
            let schema = self.graph.lookup(&resource.resource_type, field)?;
            let Some(members) = relationship.members() else {
                continue;
            };
            if schema.kind == RelationshipKind::ToOne && members.len() > 1 {
                return Err(EngineError::InvalidOperation(format!(
                    "{}.{field} is to-one but the payload lists {} members",
                    resource.resource_type,
                    members.len()
                )));
            }
            for member in members {
                member.validate()?;
            }
        }
        Ok(())
    }

    fn ingest(&mut self, document: &Document) -> Result<Vec<ResourceKey>, EngineError> {
        self.validate_document(document)?;

        let mut resolved = Vec::new();
        for resource in document.resources() {
            let key = self.resolve_identifier(&resource.identifier())?;
            resolved.push((key, resource));
        }

        for (key, resource) in &resolved {
            let key = self.live_key(*key)?;
            tracing::trace!(%key, resource_type = %resource.resource_type, "ingesting resource");
            self.records.ensure(key);
            let mut data = EventData::attributes(resource.attributes.clone());
            self.dispatch(key, LifecycleEvent::PushedData, &mut data)?;
            self.mark_changed(key);
        }

        for (key, resource) in &resolved {
            let key = self.live_key(*key)?;
            if self.records.state_of(key) == LifecycleState::DeletedSaved {
                continue;
            }
            self.ingest_relationships(key, resource)?;
        }
        self.flush_graph()?;

        let primary = document.primary().len();
        resolved
            .iter()
            .take(primary)
            .map(|(key, _)| self.live_key(*key))
            .collect()
    }

    fn ingest_relationships(&mut self, key: ResourceKey, resource: &ResourceObject) -> Result<(), EngineError> {
        let resource_type = resource.resource_type.as_str();
        for (field, relationship) in &resource.relationships {
            if let Some(link) = relationship.related_link() {
                self.graph
                    .set_link(key, resource_type, field, Some(link.to_string()))?;
            }
            let Some(members) = relationship.members() else {
                continue;
            };
            let mut keys = Vec::with_capacity(members.len());
            for member in members {
                keys.push(self.resolve_identifier(member)?);
            }
            tracing::trace!(%key, field, members = keys.len(), "canonical relationship data");
            self.graph.replace_canonical(key, resource_type, field, &keys)?;
        }
        Ok(())
    }

    fn flush_graph(&mut self) -> Result<(), EngineError> {
        let registry = &self.registry;
        let records = &self.records;
        let is_new = |k: ResourceKey| records.state_of(k).is_new() || registry.is_new(k);
        self.graph
            .flush_canonical(&is_new, self.config.retain_new_members)?;
        self.notify_touched();
        Ok(())
    }

    // ========================================================================
    // Client mutations
    // ========================================================================

    /// Create a new, unsaved resource. A client-chosen `id` must not belong
    /// to a live record.
    pub fn create_record(
        &mut self,
        resource_type: &str,
        attributes: Attributes,
        id: Option<&str>,
    ) -> Result<ResourceKey, EngineError> {
        let result = self.create_record_inner(resource_type, attributes, id);
        self.finish(result)
    }

    fn create_record_inner(
        &mut self,
        resource_type: &str,
        attributes: Attributes,
        id: Option<&str>,
    ) -> Result<ResourceKey, EngineError> {
        if !self.schema.has_type(resource_type) {
            return Err(EngineError::InvalidOperation(format!(
                "unknown resource type {resource_type}"
            )));
        }

        let key = match id {
            Some(id) => {
                if let Some(existing) = self.registry.peek(resource_type, id) {
                    if self.tasks.is_destroy_scheduled(existing) {
                        self.destroy_now_inner(existing)?;
                    } else if !self.records.state_of(existing).is_empty() {
                        return Err(EngineError::DuplicateId {
                            resource: self.describe(existing),
                        });
                    }
                }
                self.resolve_identifier(&ResourceIdentifier::new(resource_type, id))?
            }
            None => self.registry.create_local(resource_type),
        };

        self.dispatch(key, LifecycleEvent::LoadedData, &mut EventData::default())?;
        let mut changed = Vec::new();
        let record = self.records.ensure(key);
        for (field, value) in attributes {
            if record.set_local(&field, value) {
                changed.push(field);
            }
        }
        self.notify_fields(key, ChangeKind::Attributes, &changed);
        tracing::debug!(%key, resource_type, "created record");
        Ok(key)
    }

    pub fn set_local_attribute(
        &mut self,
        key: ResourceKey,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> Result<(), EngineError> {
        let result = self.set_local_attribute_inner(key, field, value.into());
        self.finish(result)
    }

    fn set_local_attribute_inner(&mut self, key: ResourceKey, field: &str, value: FieldValue) -> Result<(), EngineError> {
        let key = self.live_key(key)?;
        let state = self.records.state_of(key);
        let facts = match self.records.get(key) {
            Some(record) => {
                if record.is_in_flight(field) {
                    return Err(EngineError::FieldInFlight {
                        resource: self.describe(key),
                        field: field.to_string(),
                    });
                }
                RecordFacts {
                    has_local_changes: record.changes_after_set(field, &value),
                    has_errors: record
                        .errors
                        .iter()
                        .any(|e| e.field.as_deref() != Some(field)),
                }
            }
            None => RecordFacts::default(),
        };
        let outcome = self
            .machine
            .send(state, LifecycleEvent::DidSetProperty, facts)?;

        let record = self.records.ensure(key);
        let moved = record.set_local(field, value);
        let cleared = record.clear_field_errors(field);
        if moved {
            self.hub.enqueue(key, ChangeKind::Attributes, Some(field));
        }
        if cleared {
            self.hub.enqueue(key, ChangeKind::Errors, Some(field));
        }
        self.apply(key, outcome, &mut EventData::default())
    }

    pub fn mutate_relationship(
        &mut self,
        key: ResourceKey,
        field: &str,
        op: RelationshipOp,
    ) -> Result<(), EngineError> {
        let result = self.mutate_relationship_inner(key, field, op);
        self.finish(result)
    }

    fn mutate_relationship_inner(&mut self, key: ResourceKey, field: &str, op: RelationshipOp) -> Result<(), EngineError> {
        let key = self.live_key(key)?;
        if self.records.state_of(key).is_deleted() {
            return Err(EngineError::InvalidOperation(format!(
                "cannot change relationships of deleted {}",
                self.describe(key)
            )));
        }
        let resource_type = self
            .registry
            .resource_type(key)
            .map(str::to_string)
            .ok_or(EngineError::UnknownKey(key))?;
        let schema = self.graph.lookup(&resource_type, field)?;

        let members = match &op {
            RelationshipOp::Add(m) | RelationshipOp::Remove(m) | RelationshipOp::Replace(m) => m,
        };
        let mut resolved = Vec::with_capacity(members.len());
        for member in members {
            let member = self.live_key(*member)?;
            let member_type = self.registry.resource_type(member).unwrap_or_default();
            if member_type != schema.related_type {
                return Err(EngineError::InvalidOperation(format!(
                    "{resource_type}.{field} holds {} resources, not {member_type}",
                    schema.related_type
                )));
            }
            resolved.push(member);
        }

        match op {
            RelationshipOp::Add(_) => self
                .graph
                .add_members(key, &resource_type, field, &resolved, true)?,
            RelationshipOp::Remove(_) => self
                .graph
                .remove_members(key, &resource_type, field, &resolved, true)?,
            RelationshipOp::Replace(_) => self
                .graph
                .replace_local(key, &resource_type, field, &resolved)?,
        }
        self.notify_touched();
        Ok(())
    }

    pub fn delete_record(&mut self, key: ResourceKey) -> Result<(), EngineError> {
        let result = self
            .live_key(key)
            .and_then(|key| self.dispatch(key, LifecycleEvent::DeleteRecord, &mut EventData::default()));
        self.finish(result)
    }

    /// Discard uncommitted changes. Never-saved records are detached from
    /// every relationship and end up deleted.
    pub fn rollback(&mut self, key: ResourceKey) -> Result<(), EngineError> {
        let result = self
            .live_key(key)
            .and_then(|key| self.dispatch(key, LifecycleEvent::RolledBack, &mut EventData::default()));
        self.finish(result)
    }

    // ========================================================================
    // Commit lifecycle
    // ========================================================================

    pub fn will_commit(&mut self, key: ResourceKey) -> Result<(), EngineError> {
        let result = self
            .live_key(key)
            .and_then(|key| self.dispatch(key, LifecycleEvent::WillCommit, &mut EventData::default()));
        self.finish(result)
    }

    /// The server accepted a save. `server` may carry the assigned id,
    /// canonical attributes and relationships. Returns the key the record
    /// lives under afterwards, which differs from `key` when the new id
    /// revealed a duplicate that won the merge.
    pub fn did_commit(&mut self, key: ResourceKey, server: Option<&ResourceObject>) -> Result<ResourceKey, EngineError> {
        let result = self.did_commit_inner(key, server);
        self.finish(result)
    }

    fn did_commit_inner(&mut self, key: ResourceKey, server: Option<&ResourceObject>) -> Result<ResourceKey, EngineError> {
        let mut key = self.live_key(key)?;
        let state = self.records.state_of(key);
        if !state.is_saving() {
            return Err(EngineError::Protocol {
                state,
                event: LifecycleEvent::DidCommit,
                reason: "record is not being saved".into(),
            });
        }
        if self.registry.is_new(key) && server.and_then(|s| s.id.as_ref()).is_none() {
            return Err(EngineError::InvalidOperation(format!(
                "server did not assign an id to {}",
                self.describe(key)
            )));
        }

        if let Some(server) = server {
            if server.resource_type != self.registry.resource_type(key).unwrap_or_default() {
                return Err(EngineError::InvalidOperation(format!(
                    "server returned {} for {}",
                    server.resource_type,
                    self.describe(key)
                )));
            }
            if let Some(id) = &server.id {
                ResourceIdentifier::new(&server.resource_type, id).validate()?;
            }
            self.validate_resource(server)?;
            if let Some(id) = &server.id {
                match self.registry.update(key, id)? {
                    IdentityUpdate::Conflict { key: updating, existing } => {
                        key = self.merge_keys(updating, existing)?;
                    }
                    IdentityUpdate::Assigned(assigned) => {
                        self.hub.enqueue(assigned, ChangeKind::Identity, None);
                    }
                    IdentityUpdate::Unchanged(_) => {}
                }
            }
        }

        let mut data = EventData {
            attributes: server.map(|s| s.attributes.clone()),
            errors: Vec::new(),
        };
        self.dispatch(key, LifecycleEvent::DidCommit, &mut data)?;

        if let Some(server) = server
            && self.records.state_of(key) != LifecycleState::DeletedSaved
        {
            self.ingest_relationships(key, server)?;
            self.flush_graph()?;
        }
        self.mark_changed(key);
        Ok(key)
    }

    /// The server refused a save. Validation errors leave the record
    /// invalid; without them it is in the error substate.
    pub fn commit_rejected(
        &mut self,
        key: ResourceKey,
        errors: Option<Vec<ValidationError>>,
    ) -> Result<(), EngineError> {
        let result = self.live_key(key).and_then(|key| match errors {
            Some(errors) => {
                let mut data = EventData {
                    attributes: None,
                    errors,
                };
                self.dispatch(key, LifecycleEvent::BecameInvalid, &mut data)
            }
            None => self.dispatch(key, LifecycleEvent::BecameError, &mut EventData::default()),
        });
        self.finish(result)
    }

    // ========================================================================
    // Fetching
    // ========================================================================

    /// Start loading `key`. A fetch already outstanding for the key is
    /// joined instead of starting a second one.
    pub fn fetch(&mut self, key: ResourceKey) -> Result<FetchTicket, EngineError> {
        let result = self.fetch_inner(key);
        self.finish(result)
    }

    fn fetch_inner(&mut self, key: ResourceKey) -> Result<FetchTicket, EngineError> {
        let key = self.live_key(key)?;
        let ticket = self.requests.begin(key);
        if ticket.deduplicated {
            tracing::trace!(%key, request = %ticket.request, "joined outstanding fetch");
            return Ok(ticket);
        }
        if let Err(err) = self.dispatch(key, LifecycleEvent::LoadingData, &mut EventData::default()) {
            self.requests.settle(ticket.request).ok();
            return Err(err);
        }
        Ok(ticket)
    }

    pub fn resolve_fetch(&mut self, ticket: FetchTicket, document: &Document) -> Result<Vec<ResourceKey>, EngineError> {
        let result = self.resolve_fetch_inner(ticket, document);
        self.finish(result)
    }

    fn resolve_fetch_inner(&mut self, ticket: FetchTicket, document: &Document) -> Result<Vec<ResourceKey>, EngineError> {
        // a rejected document leaves the request open for reject_fetch
        self.validate_document(document)?;
        let key = self.requests.settle(ticket.request)?;
        let keys = self.ingest(document)?;
        let key = self.live_key(key)?;
        if self.records.state_of(key).is_loading() {
            self.dispatch(key, LifecycleEvent::NotFound, &mut EventData::default())?;
        } else if let Some(record) = self.records.get_mut(key)
            && record.is_reloading
        {
            record.is_reloading = false;
            self.hub.enqueue(key, ChangeKind::State, None);
        }
        Ok(keys)
    }

    /// A fetch failed. Resources that were loading move to `empty` or
    /// `error`; loaded resources only stop reloading.
    pub fn reject_fetch(&mut self, ticket: FetchTicket, failure: FetchFailure) -> Result<(), EngineError> {
        let result = self.reject_fetch_inner(ticket, failure);
        self.finish(result)
    }

    fn reject_fetch_inner(&mut self, ticket: FetchTicket, failure: FetchFailure) -> Result<(), EngineError> {
        let key = self.requests.settle(ticket.request)?;
        let key = self.live_key(key)?;
        if self.records.state_of(key).is_loading() {
            match failure {
                FetchFailure::NotFound => {
                    self.dispatch(key, LifecycleEvent::NotFound, &mut EventData::default())?
                }
                FetchFailure::Error(message) => {
                    let mut data = EventData {
                        attributes: None,
                        errors: vec![ValidationError::base(message)],
                    };
                    self.dispatch(key, LifecycleEvent::BecameError, &mut data)?;
                    self.records.ensure(key).record_errors(data.errors);
                    self.hub.enqueue(key, ChangeKind::Errors, None);
                }
            }
        } else if let Some(record) = self.records.get_mut(key)
            && record.is_reloading
        {
            record.is_reloading = false;
            self.hub.enqueue(key, ChangeKind::State, None);
        }
        Ok(())
    }

    // ========================================================================
    // Unload and destruction
    // ========================================================================

    /// Mark that an external consumer holds the resource.
    pub fn materialize(&mut self, key: ResourceKey) -> Result<(), EngineError> {
        let key = self.live_key(key)?;
        self.materialized.insert(key);
        self.tasks.cancel_destroy(key);
        self.dematerializing.remove(&key);
        Ok(())
    }

    pub fn is_materialized(&self, key: ResourceKey) -> bool {
        self.registry
            .resolve(key)
            .is_some_and(|k| self.materialized.contains(&k))
    }

    pub fn unload_record(&mut self, key: ResourceKey) -> Result<(), EngineError> {
        let result = self
            .live_key(key)
            .and_then(|key| self.dispatch(key, LifecycleEvent::UnloadRecord, &mut EventData::default()));
        self.finish(result)
    }

    /// Unload every resource of a type. Resources that are loading or being
    /// saved are left alone. Returns how many were unloaded.
    pub fn unload_all(&mut self, resource_type: &str) -> Result<usize, EngineError> {
        let result = self.unload_all_inner(resource_type);
        self.finish(result)
    }

    fn unload_all_inner(&mut self, resource_type: &str) -> Result<usize, EngineError> {
        let mut unloaded = 0;
        for key in self.registry.keys_of_type(resource_type) {
            let state = self.records.state_of(key);
            if state.is_loading() || state.is_saving() {
                tracing::debug!(%key, state = state.name(), "skipping busy record during unload");
                continue;
            }
            self.dispatch(key, LifecycleEvent::UnloadRecord, &mut EventData::default())?;
            unloaded += 1;
        }
        Ok(unloaded)
    }

    pub fn is_destroy_scheduled(&self, key: ResourceKey) -> bool {
        self.registry
            .resolve(key)
            .is_some_and(|k| self.tasks.is_destroy_scheduled(k))
    }

    /// Tear a single unloaded resource down immediately instead of waiting
    /// for the next flush.
    pub fn destroy_now(&mut self, key: ResourceKey) -> Result<(), EngineError> {
        let result = self.destroy_now_inner(key);
        self.finish(result)
    }

    fn destroy_now_inner(&mut self, key: ResourceKey) -> Result<(), EngineError> {
        let key = self.live_key(key)?;
        let state = self.records.state_of(key);
        if !state.is_empty() && state != LifecycleState::DeletedSaved {
            return Err(EngineError::InvalidOperation(format!(
                "{} must be unloaded before it is destroyed",
                self.describe(key)
            )));
        }
        self.tasks.cancel_destroy(key);
        self.destroy(key)?;
        self.forget_if_unreferenced(key);
        tracing::debug!(%key, "destroyed resource eagerly");
        Ok(())
    }

    fn is_unloaded(&self, key: ResourceKey) -> bool {
        match self.registry.resolve(key) {
            None => true,
            Some(key) => !self.materialized.contains(&key) && self.records.state_of(key).is_empty(),
        }
    }

    fn destroy(&mut self, key: ResourceKey) -> Result<Vec<LiveSetChange>, EngineError> {
        if self.materialized.contains(&key) {
            return Err(EngineError::DestroyMaterialized(self.describe(key)));
        }
        for (owner, field) in self.graph.destroy_edges(key) {
            self.hub.enqueue(owner, ChangeKind::Relationships, Some(&field));
        }
        self.notify_touched();
        self.records.remove(key);
        self.dematerializing.remove(&key);
        Ok(self.live_sets.remove_everywhere(key))
    }

    fn forget_if_unreferenced(&mut self, key: ResourceKey) {
        if self.records.contains(key) || self.graph.is_referenced(key) || self.hub.has_subscribers(key) {
            return;
        }
        self.registry.forget(key);
    }

    /// Orphan collection for one unloaded key: the whole island it belongs
    /// to is destroyed when every member is unloaded, otherwise nothing is.
    fn collect_orphans(&mut self, key: ResourceKey, report: &mut FlushReport) -> Result<(), EngineError> {
        let Some(key) = self.registry.resolve(key) else {
            return Ok(());
        };
        if !self.is_unloaded(key) {
            return Ok(());
        }
        let limit = self.config.max_island_size;
        let island = match self.graph.reachable_set(key, limit)? {
            Reachability::Island(island) => island,
            Reachability::Exceeded { visited } => {
                tracing::warn!(%key, visited, limit = ?limit, "island exceeds traversal bound; keeping it");
                return Ok(());
            }
        };
        if !island.iter().all(|k| self.is_unloaded(*k)) {
            return Ok(());
        }

        let mut destroyed = Vec::with_capacity(island.len());
        for member in &island {
            let Some(member) = self.registry.resolve(*member) else {
                continue;
            };
            self.tasks.cancel_destroy(member);
            report.live_set_changes.extend(self.destroy(member)?);
            destroyed.push(member);
        }
        for member in &destroyed {
            self.forget_if_unreferenced(*member);
        }
        tracing::debug!(%key, size = destroyed.len(), "destroyed orphaned island");
        report.destroyed.extend(destroyed);
        Ok(())
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Run deferred work: orphan checks and live-set refreshes, in the order
    /// they were scheduled.
    pub fn flush(&mut self) -> Result<FlushReport, EngineError> {
        let result = self.flush_inner();
        self.finish(result)
    }

    fn flush_inner(&mut self) -> Result<FlushReport, EngineError> {
        let mut report = FlushReport::default();
        while let Some(task) = self.tasks.pop() {
            match task {
                Task::DestroyCheck(key) => self.collect_orphans(key, &mut report)?,
                Task::FlushLiveSets => report.live_set_changes.extend(self.flush_live_sets()),
            }
        }
        if self.live_sets.has_pending() {
            report.live_set_changes.extend(self.flush_live_sets());
        }
        Ok(report)
    }

    fn flush_live_sets(&mut self) -> Vec<LiveSetChange> {
        let (registry, records, tasks, dematerializing) =
            (&self.registry, &self.records, &self.tasks, &self.dematerializing);
        self.live_sets
            .flush(|k| is_visible(registry, records, tasks, dematerializing, k))
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    // ========================================================================
    // Live sets
    // ========================================================================

    /// The live "all of type" collection, created on first request.
    pub fn live_set_for(&mut self, resource_type: &str) -> LiveSetId {
        let candidates = self.registry.keys_of_type(resource_type);
        let (registry, records, tasks, dematerializing) =
            (&self.registry, &self.records, &self.tasks, &self.dematerializing);
        self.live_sets.live_set_for(
            Selector::AllOfType(resource_type.to_string()),
            candidates,
            |k| is_visible(registry, records, tasks, dematerializing, k),
        )
    }

    /// A caller-owned collection, filled by `populate_query`.
    pub fn query(&mut self, resource_type: &str, label: &str) -> LiveSetId {
        self.live_sets.live_set_for(
            Selector::Query {
                resource_type: resource_type.to_string(),
                label: label.to_string(),
            },
            [],
            |_| true,
        )
    }

    /// Push a query response and make its primary resources the query's
    /// membership.
    pub fn populate_query(&mut self, set: LiveSetId, document: &Document) -> Result<LiveSetChange, EngineError> {
        let result = self.populate_query_inner(set, document);
        self.finish(result)
    }

    fn populate_query_inner(&mut self, set: LiveSetId, document: &Document) -> Result<LiveSetChange, EngineError> {
        let live_set = self.live_sets.get(set).ok_or(EngineError::UnknownLiveSet(set))?;
        if !matches!(live_set.selector, Selector::Query { .. }) {
            return Err(EngineError::NotAQuerySet(set));
        }
        let keys = self.ingest(document)?;
        self.live_sets.replace_query_members(set, keys)
    }

    pub fn live_set(&self, set: LiveSetId) -> Option<&LiveSet> {
        self.live_sets.get(set)
    }

    pub fn observe_live_set(
        &mut self,
        set: LiveSetId,
        callback: impl FnMut(&LiveSetChange) + Send + 'static,
    ) -> Result<SubscriptionId, EngineError> {
        let token = self.hub.reserve_token();
        self.live_sets.observe(token, set, Box::new(callback))?;
        Ok(token)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub fn subscribe(
        &mut self,
        key: ResourceKey,
        callback: impl FnMut(ResourceKey, ChangeKind, Option<&str>) + Send + 'static,
    ) -> Result<SubscriptionId, EngineError> {
        let key = self.live_key(key)?;
        Ok(self.hub.subscribe(key, Box::new(callback)))
    }

    /// Drop a resource or live-set subscription. Unknown tokens are ignored.
    pub fn unsubscribe(&mut self, token: SubscriptionId) -> bool {
        self.hub.unsubscribe(token) || self.live_sets.unobserve(token)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn state(&self, key: ResourceKey) -> LifecycleState {
        self.registry
            .resolve(key)
            .map_or(LifecycleState::Empty, |k| self.records.state_of(k))
    }

    pub fn record(&self, key: ResourceKey) -> Option<&ResourceRecord> {
        self.registry.resolve(key).and_then(|k| self.records.get(k))
    }

    pub fn attribute(&self, key: ResourceKey, field: &str) -> Option<&FieldValue> {
        self.record(key).and_then(|r| r.attribute(field))
    }

    pub fn attributes(&self, key: ResourceKey) -> Attributes {
        self.record(key).map(ResourceRecord::attributes).unwrap_or_default()
    }

    pub fn changed_attributes(&self, key: ResourceKey) -> BTreeMap<String, ChangedAttribute> {
        self.record(key)
            .map(ResourceRecord::changed_attributes)
            .unwrap_or_default()
    }

    pub fn errors(&self, key: ResourceKey) -> Vec<ValidationError> {
        self.record(key).map(|r| r.errors.clone()).unwrap_or_default()
    }

    pub fn errors_for(&self, key: ResourceKey, field: &str) -> Vec<ValidationError> {
        self.errors(key)
            .into_iter()
            .filter(|e| e.field.as_deref() == Some(field))
            .collect()
    }

    pub fn is_reloading(&self, key: ResourceKey) -> bool {
        self.record(key).is_some_and(|r| r.is_reloading)
    }

    pub fn is_fetch_pending(&self, key: ResourceKey) -> bool {
        self.registry
            .resolve(key)
            .is_some_and(|k| self.requests.is_pending(k))
    }

    pub fn relationship(&self, key: ResourceKey, field: &str) -> Result<RelationshipView, EngineError> {
        let key = self.live_key(key)?;
        let resource_type = self
            .registry
            .resource_type(key)
            .ok_or(EngineError::UnknownKey(key))?;
        let schema = self.graph.lookup(resource_type, field)?;
        let view = match self.graph.edge(key, field) {
            Some(edge) => RelationshipView {
                key,
                field: field.to_string(),
                kind: edge.kind(),
                is_async: edge.is_async(),
                link: edge.link.clone(),
                members: edge.local_members(),
                canonical: edge.canonical_members(),
                has_data: edge.has_canonical_data || !edge.local_members().is_empty(),
            },
            None => RelationshipView {
                key,
                field: field.to_string(),
                kind: schema.kind,
                is_async: schema.is_async,
                link: None,
                members: Vec::new(),
                canonical: Vec::new(),
                has_data: false,
            },
        };
        Ok(view)
    }

    pub fn transition_stats(&self) -> TransitionCacheStats {
        self.machine.stats()
    }
}
