//! Per-resource lifecycle state machine.
//!
//! Handlers are looked up by `(state, event)` starting at the record's leaf
//! state and walking towards the root. A handler either accepts the event,
//! yielding effects for the engine to apply and an optional target state,
//! or forbids it. An event nobody handles is a protocol error.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use recordcache_core::state::{DirtyKind, LifecycleState};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    PushedData,
    DidSetProperty,
    BecomeDirty,
    WillCommit,
    DidCommit,
    BecameInvalid,
    BecameError,
    RolledBack,
    UnloadRecord,
    DeleteRecord,
    LoadingData,
    LoadedData,
    NotFound,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PushedData => "pushedData",
            Self::DidSetProperty => "didSetProperty",
            Self::BecomeDirty => "becomeDirty",
            Self::WillCommit => "willCommit",
            Self::DidCommit => "didCommit",
            Self::BecameInvalid => "becameInvalid",
            Self::BecameError => "becameError",
            Self::RolledBack => "rolledBack",
            Self::UnloadRecord => "unloadRecord",
            Self::DeleteRecord => "deleteRecord",
            Self::LoadingData => "loadingData",
            Self::LoadedData => "loadedData",
            Self::NotFound => "notFound",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work a handler or hook asks the engine to perform, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Merge the event's payload into canonical attributes and edges.
    AcceptPayload,
    MoveLocalToInFlight,
    AdoptInFlight,
    RestoreInFlight,
    RecordErrors,
    ClearErrors,
    DiscardLocal,
    /// Server confirmed the local relationship state.
    CommitRelationships,
    /// Local relationship state reverts to canonical.
    RollbackRelationships,
    /// Remove the resource from every relationship, both sides.
    SeverRelationships,
    Unload,
    ClearRecordData,
    MarkReloading,
    FinishLoad,
    /// Dispatch a follow-up event once the current one settles.
    Send(LifecycleEvent),
}

/// What the machine needs to know about a record to pick a branch.
/// Computed by the engine as if the event's data had already been applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordFacts {
    pub has_local_changes: bool,
    pub has_errors: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub effects: Vec<Effect>,
    pub target: Option<LifecycleState>,
}

enum Handler {
    Accept(Outcome),
    Forbid(&'static str),
}

fn act(effects: &[Effect], target: Option<LifecycleState>) -> Option<Handler> {
    Some(Handler::Accept(Outcome {
        effects: effects.to_vec(),
        target,
    }))
}

fn go(target: LifecycleState) -> Option<Handler> {
    act(&[], Some(target))
}

fn stay() -> Option<Handler> {
    act(&[], None)
}

fn forbid(reason: &'static str) -> Option<Handler> {
    Some(Handler::Forbid(reason))
}

fn uncommitted_of(kind: DirtyKind) -> LifecycleState {
    match kind {
        DirtyKind::Updated => LifecycleState::UpdatedUncommitted,
        DirtyKind::Created => LifecycleState::CreatedUncommitted,
        DirtyKind::Deleted => LifecycleState::DeletedUncommitted,
    }
}

fn inflight_of(kind: DirtyKind) -> LifecycleState {
    match kind {
        DirtyKind::Updated => LifecycleState::UpdatedInflight,
        DirtyKind::Created => LifecycleState::CreatedInflight,
        DirtyKind::Deleted => LifecycleState::DeletedInflight,
    }
}

fn invalid_of(kind: DirtyKind) -> LifecycleState {
    match kind {
        DirtyKind::Updated => LifecycleState::UpdatedInvalid,
        DirtyKind::Created => LifecycleState::CreatedInvalid,
        DirtyKind::Deleted => LifecycleState::DeletedInvalid,
    }
}

fn error_of(kind: DirtyKind) -> LifecycleState {
    match kind {
        DirtyKind::Updated => LifecycleState::UpdatedError,
        DirtyKind::Created => LifecycleState::CreatedError,
        DirtyKind::Deleted => LifecycleState::DeletedError,
    }
}

fn uncommitted(kind: DirtyKind, event: LifecycleEvent, facts: RecordFacts) -> Option<Handler> {
    use DirtyKind as K;
    use Effect::*;
    use LifecycleEvent as E;
    use LifecycleState as S;

    match (event, kind) {
        (E::PushedData, K::Updated) if !facts.has_local_changes => {
            act(&[AcceptPayload, FinishLoad], Some(S::LoadedSaved))
        }
        (E::PushedData, K::Created) => {
            let target = if facts.has_local_changes {
                S::UpdatedUncommitted
            } else {
                S::LoadedSaved
            };
            act(&[AcceptPayload], Some(target))
        }
        (E::PushedData, _) => act(&[AcceptPayload, FinishLoad], None),

        (E::DidSetProperty, K::Updated) if !facts.has_local_changes => go(S::LoadedSaved),
        (E::DidSetProperty, K::Updated | K::Created) => stay(),

        (E::BecomeDirty, _) => stay(),
        (E::WillCommit, _) => act(&[MoveLocalToInFlight], Some(inflight_of(kind))),

        (E::RolledBack, K::Created) => act(&[DiscardLocal, SeverRelationships], Some(S::DeletedSaved)),
        (E::RolledBack, _) => act(&[DiscardLocal, RollbackRelationships], Some(S::LoadedSaved)),

        (E::DeleteRecord, K::Updated) => go(S::DeletedUncommitted),
        (E::DeleteRecord, K::Created) => act(&[DiscardLocal, SeverRelationships], Some(S::DeletedSaved)),

        (E::UnloadRecord, K::Created) => {
            act(&[SeverRelationships, DiscardLocal, Unload], Some(S::Empty))
        }
        (E::UnloadRecord, _) => act(&[DiscardLocal, RollbackRelationships, Unload], Some(S::Empty)),

        _ => None,
    }
}

fn inflight(kind: DirtyKind, event: LifecycleEvent) -> Option<Handler> {
    use DirtyKind as K;
    use Effect::*;
    use LifecycleEvent as E;
    use LifecycleState as S;

    match (event, kind) {
        (E::PushedData, _) => act(&[AcceptPayload, FinishLoad], None),
        (E::DidSetProperty, K::Updated | K::Created) => stay(),
        (E::BecomeDirty, _) => stay(),

        (E::DidCommit, K::Deleted) => {
            act(&[AdoptInFlight, SeverRelationships, ClearErrors], Some(S::DeletedSaved))
        }
        (E::DidCommit, _) => act(&[AdoptInFlight, CommitRelationships, ClearErrors], Some(S::LoadedSaved)),

        (E::BecameInvalid, _) => act(&[RestoreInFlight, RecordErrors], Some(invalid_of(kind))),
        (E::BecameError, _) => act(&[RestoreInFlight], Some(error_of(kind))),

        (E::DeleteRecord, K::Deleted) => stay(),
        (E::DeleteRecord, _) => forbid("cannot delete a record while it is being saved"),
        (E::WillCommit, _) => forbid("record is already being saved"),
        (E::UnloadRecord, _) => forbid("cannot unload a record while it is being saved"),
        (E::RolledBack, _) => forbid("cannot roll back a record while it is being saved"),
        (E::LoadingData, _) => forbid("cannot reload a record while it is being saved"),

        _ => None,
    }
}

fn invalid(kind: DirtyKind, event: LifecycleEvent, facts: RecordFacts) -> Option<Handler> {
    use DirtyKind as K;
    use Effect::*;
    use LifecycleEvent as E;
    use LifecycleState as S;

    match (event, kind) {
        (E::DidSetProperty, K::Deleted) => None,
        (E::DidSetProperty, _) if facts.has_errors => stay(),
        (E::DidSetProperty, K::Updated) if !facts.has_local_changes => go(S::LoadedSaved),
        (E::DidSetProperty, _) => go(uncommitted_of(kind)),

        (E::BecameInvalid, _) => act(&[RecordErrors], None),
        _ => uncommitted(kind, event, facts),
    }
}

fn errored(kind: DirtyKind, event: LifecycleEvent, facts: RecordFacts) -> Option<Handler> {
    use DirtyKind as K;
    use LifecycleEvent as E;
    use LifecycleState as S;

    match (event, kind) {
        (E::DidSetProperty, K::Deleted) => None,
        (E::DidSetProperty, K::Updated) if !facts.has_local_changes => go(S::LoadedSaved),
        (E::DidSetProperty, _) => stay(),
        _ => uncommitted(kind, event, facts),
    }
}

/// The transition table. Only the handler registered on `node` itself is
/// consulted here; parent fallback happens in `LifecycleMachine::send`.
fn handler_for(node: LifecycleState, event: LifecycleEvent, facts: RecordFacts) -> Option<Handler> {
    use Effect::*;
    use LifecycleEvent as E;
    use LifecycleState as S;

    match node {
        S::Root => None,

        S::Empty => match event {
            E::LoadingData => go(S::Loading),
            E::LoadedData => go(S::CreatedUncommitted),
            E::PushedData => act(&[AcceptPayload], Some(S::LoadedSaved)),
            E::UnloadRecord => act(&[Unload], None),
            _ => None,
        },

        S::Loading => match event {
            E::PushedData => act(&[AcceptPayload], Some(S::LoadedSaved)),
            E::NotFound => go(S::Empty),
            E::BecameError => go(S::Error),
            E::UnloadRecord => forbid("cannot unload a record that is still loading"),
            _ => None,
        },

        S::Error => match event {
            E::LoadingData => go(S::Loading),
            E::PushedData => act(&[AcceptPayload], Some(S::LoadedSaved)),
            E::NotFound => go(S::Empty),
            E::UnloadRecord => act(&[Unload], Some(S::Empty)),
            _ => None,
        },

        S::Loaded => match event {
            E::PushedData => act(&[AcceptPayload, FinishLoad], None),
            E::LoadingData => act(&[MarkReloading], None),
            E::NotFound => act(&[FinishLoad], None),
            _ => None,
        },

        S::LoadedSaved => match event {
            E::DidSetProperty if facts.has_local_changes => go(S::UpdatedUncommitted),
            E::DidSetProperty => stay(),
            E::BecomeDirty => go(S::UpdatedUncommitted),
            E::WillCommit => act(&[MoveLocalToInFlight], Some(S::UpdatedInflight)),
            E::DidCommit => stay(),
            E::RolledBack => act(&[DiscardLocal, RollbackRelationships, ClearErrors], None),
            E::DeleteRecord => go(S::DeletedUncommitted),
            E::UnloadRecord => act(&[RollbackRelationships, Unload], Some(S::Empty)),
            _ => None,
        },

        S::Updated => None,
        S::Created => match event {
            E::LoadingData => forbid("cannot reload a record that has never been saved"),
            _ => None,
        },
        S::Deleted => match event {
            E::DidSetProperty => forbid("cannot set a property on a deleted record"),
            E::LoadingData => forbid("cannot reload a deleted record"),
            E::DeleteRecord => stay(),
            _ => None,
        },

        S::UpdatedUncommitted => uncommitted(DirtyKind::Updated, event, facts),
        S::CreatedUncommitted => uncommitted(DirtyKind::Created, event, facts),
        S::DeletedUncommitted => uncommitted(DirtyKind::Deleted, event, facts),

        S::UpdatedInflight => inflight(DirtyKind::Updated, event),
        S::CreatedInflight => inflight(DirtyKind::Created, event),
        S::DeletedInflight => inflight(DirtyKind::Deleted, event),

        S::UpdatedInvalid => invalid(DirtyKind::Updated, event, facts),
        S::CreatedInvalid => invalid(DirtyKind::Created, event, facts),
        S::DeletedInvalid => invalid(DirtyKind::Deleted, event, facts),

        S::UpdatedError => errored(DirtyKind::Updated, event, facts),
        S::CreatedError => errored(DirtyKind::Created, event, facts),
        S::DeletedError => errored(DirtyKind::Deleted, event, facts),

        S::DeletedSaved => match event {
            E::PushedData | E::WillCommit | E::DidCommit | E::RolledBack | E::BecomeDirty => stay(),
            E::UnloadRecord => act(&[Unload], Some(S::Empty)),
            _ => None,
        },
    }
}

fn enter_effects(node: LifecycleState) -> &'static [Effect] {
    match node {
        LifecycleState::Empty => &[Effect::ClearRecordData],
        _ => &[],
    }
}

fn exit_effects(node: LifecycleState) -> &'static [Effect] {
    use LifecycleState::*;
    match node {
        Loading => &[Effect::FinishLoad],
        UpdatedInvalid | CreatedInvalid | DeletedInvalid | Error => &[Effect::ClearErrors],
        _ => &[],
    }
}

fn setup_effects(node: LifecycleState, facts: RecordFacts) -> Vec<Effect> {
    match node {
        LifecycleState::LoadedSaved if facts.has_local_changes => {
            vec![Effect::Send(LifecycleEvent::BecomeDirty)]
        }
        _ => Vec::new(),
    }
}

/// Nodes exited (innermost first) and entered (outermost first) when moving
/// between two states, plus the leaf finally occupied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPath {
    pub exits: Vec<LifecycleState>,
    pub enters: Vec<LifecycleState>,
    pub destination: LifecycleState,
}

impl TransitionPath {
    pub fn compute(from: LifecycleState, to: LifecycleState) -> Self {
        let mut destination = to;
        let mut descent = Vec::new();
        while let Some(child) = destination.initial_child() {
            descent.push(child);
            destination = child;
        }

        let from_line = from.lineage();
        let to_line = to.lineage();
        let pivot = from_line
            .iter()
            .zip(to_line.iter())
            .take_while(|(a, b)| a == b)
            .count();

        let exits = from_line[pivot..].iter().rev().copied().collect();
        let mut enters: Vec<LifecycleState> = to_line[pivot..].to_vec();
        enters.extend(descent);

        Self {
            exits,
            enters,
            destination,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionCacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub struct LifecycleMachine {
    memoize: bool,
    paths: HashMap<(LifecycleState, LifecycleState), Arc<TransitionPath>>,
    stats: TransitionCacheStats,
}

impl LifecycleMachine {
    pub fn new(memoize: bool) -> Self {
        Self {
            memoize,
            paths: HashMap::new(),
            stats: TransitionCacheStats::default(),
        }
    }

    /// Resolve `event` against `state`, walking up the parent chain.
    pub fn send(
        &self,
        state: LifecycleState,
        event: LifecycleEvent,
        facts: RecordFacts,
    ) -> Result<Outcome, EngineError> {
        for node in state.ancestors() {
            match handler_for(node, event, facts) {
                Some(Handler::Accept(outcome)) => return Ok(outcome),
                Some(Handler::Forbid(reason)) => {
                    return Err(EngineError::Protocol {
                        state,
                        event,
                        reason: reason.to_string(),
                    });
                }
                None => continue,
            }
        }
        Err(EngineError::Protocol {
            state,
            event,
            reason: "no handler for this event in the state or any parent".into(),
        })
    }

    pub fn transition_path(&mut self, from: LifecycleState, to: LifecycleState) -> Arc<TransitionPath> {
        if !self.memoize {
            self.stats.misses += 1;
            return Arc::new(TransitionPath::compute(from, to));
        }
        if let Some(path) = self.paths.get(&(from, to)) {
            self.stats.hits += 1;
            return Arc::clone(path);
        }
        self.stats.misses += 1;
        let path = Arc::new(TransitionPath::compute(from, to));
        self.paths.insert((from, to), Arc::clone(&path));
        path
    }

    pub fn enter_effects(node: LifecycleState) -> &'static [Effect] {
        enter_effects(node)
    }

    pub fn exit_effects(node: LifecycleState) -> &'static [Effect] {
        exit_effects(node)
    }

    pub fn setup_effects(node: LifecycleState, facts: RecordFacts) -> Vec<Effect> {
        setup_effects(node, facts)
    }

    pub fn stats(&self) -> TransitionCacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState as S;

    fn facts(has_local_changes: bool, has_errors: bool) -> RecordFacts {
        RecordFacts {
            has_local_changes,
            has_errors,
        }
    }

    #[test]
    fn path_exits_to_pivot_then_enters_down() {
        let path = TransitionPath::compute(S::UpdatedInflight, S::DeletedSaved);
        assert_eq!(path.exits, vec![S::UpdatedInflight, S::Updated]);
        assert_eq!(path.enters, vec![S::Deleted, S::DeletedSaved]);
        assert_eq!(path.destination, S::DeletedSaved);
    }

    #[test]
    fn interior_target_descends_to_initial_leaf() {
        let path = TransitionPath::compute(S::Empty, S::Loaded);
        assert_eq!(path.exits, vec![S::Empty]);
        assert_eq!(path.enters, vec![S::Loaded, S::LoadedSaved]);
        assert_eq!(path.destination, S::LoadedSaved);
    }

    #[test]
    fn sibling_transition_keeps_shared_parent() {
        let path = TransitionPath::compute(S::UpdatedUncommitted, S::UpdatedInflight);
        assert_eq!(path.exits, vec![S::UpdatedUncommitted]);
        assert_eq!(path.enters, vec![S::UpdatedInflight]);
    }

    #[test]
    fn memoized_and_fresh_paths_agree() {
        let mut cached = LifecycleMachine::new(true);
        let mut fresh = LifecycleMachine::new(false);
        for _ in 0..3 {
            assert_eq!(
                *cached.transition_path(S::LoadedSaved, S::UpdatedUncommitted),
                *fresh.transition_path(S::LoadedSaved, S::UpdatedUncommitted)
            );
        }
        assert_eq!(cached.stats().hits, 2);
        assert_eq!(cached.stats().misses, 1);
        assert_eq!(fresh.stats().hits, 0);
    }

    #[test]
    fn unhandled_event_is_a_protocol_error() {
        let machine = LifecycleMachine::new(true);
        let err = machine
            .send(S::Empty, LifecycleEvent::WillCommit, RecordFacts::default())
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, EngineError::Protocol { .. }));
    }

    #[test]
    fn forbidden_events_are_protocol_errors() {
        let machine = LifecycleMachine::new(true);
        for event in [
            LifecycleEvent::WillCommit,
            LifecycleEvent::UnloadRecord,
            LifecycleEvent::RolledBack,
        ] {
            assert!(machine
                .send(S::UpdatedInflight, event, RecordFacts::default())
                .is_err());
        }
        assert!(machine
            .send(S::DeletedUncommitted, LifecycleEvent::DidSetProperty, facts(true, false))
            .is_err());
        assert!(machine
            .send(S::CreatedUncommitted, LifecycleEvent::LoadingData, RecordFacts::default())
            .is_err());
    }

    #[test]
    fn set_property_moves_between_clean_and_dirty() {
        let machine = LifecycleMachine::new(true);
        let dirty = machine
            .send(S::LoadedSaved, LifecycleEvent::DidSetProperty, facts(true, false))
            .unwrap();
        assert_eq!(dirty.target, Some(S::UpdatedUncommitted));

        let reset = machine
            .send(S::UpdatedUncommitted, LifecycleEvent::DidSetProperty, facts(false, false))
            .unwrap();
        assert_eq!(reset.target, Some(S::LoadedSaved));
    }

    #[test]
    fn deleting_a_new_record_skips_the_server() {
        let machine = LifecycleMachine::new(true);
        let outcome = machine
            .send(S::CreatedUncommitted, LifecycleEvent::DeleteRecord, facts(true, false))
            .unwrap();
        assert_eq!(outcome.target, Some(S::DeletedSaved));
        assert!(outcome.effects.contains(&Effect::SeverRelationships));
    }

    #[test]
    fn invalid_records_recover_once_errors_clear() {
        let machine = LifecycleMachine::new(true);
        let still = machine
            .send(S::CreatedInvalid, LifecycleEvent::DidSetProperty, facts(true, true))
            .unwrap();
        assert_eq!(still.target, None);
        let valid = machine
            .send(S::CreatedInvalid, LifecycleEvent::DidSetProperty, facts(true, false))
            .unwrap();
        assert_eq!(valid.target, Some(S::CreatedUncommitted));
        assert_eq!(LifecycleMachine::exit_effects(S::CreatedInvalid), &[Effect::ClearErrors]);
    }

    #[test]
    fn saved_setup_requests_dirty_when_changes_remain() {
        assert_eq!(
            LifecycleMachine::setup_effects(S::LoadedSaved, facts(true, false)),
            vec![Effect::Send(LifecycleEvent::BecomeDirty)]
        );
        assert!(LifecycleMachine::setup_effects(S::LoadedSaved, facts(false, false)).is_empty());
    }
}
