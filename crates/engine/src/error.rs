use recordcache_core::{CoreError, LifecycleState, LiveSetId, RequestId, ResourceKey};
use recordcache_storage::StorageError;
use thiserror::Error;

use crate::lifecycle::LifecycleEvent;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("unexpected event {event} in state {state}: {reason}")]
    Protocol {
        state: LifecycleState,
        event: LifecycleEvent,
        reason: String,
    },

    #[error("cannot merge {resource}: both keys are bound to a materialized consumer")]
    IrreconcilableMerge { resource: String },

    #[error("cannot destroy {0} while it is materialized")]
    DestroyMaterialized(String),

    #[error("traversal {current} met {key:?} already tagged by traversal {seen}")]
    ReentrantTraversal {
        key: ResourceKey,
        seen: u64,
        current: u64,
    },

    #[error("unknown resource key: {0:?}")]
    UnknownKey(ResourceKey),

    #[error("{resource_type} has no relationship named {field}")]
    UnknownRelationship { resource_type: String, field: String },

    #[error("{field} on {resource} is being saved and cannot change until the save settles")]
    FieldInFlight { resource: String, field: String },

    #[error("a live record already exists for {resource}")]
    DuplicateId { resource: String },

    #[error("unknown live set: {0:?}")]
    UnknownLiveSet(LiveSetId),

    #[error("live set {0:?} is not a query result")]
    NotAQuerySet(LiveSetId),

    #[error("unknown request: {0:?}")]
    UnknownRequest(RequestId),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl EngineError {
    /// Contract violations by the surrounding system. These must reach the
    /// caller and are never recovered from inside the engine.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Protocol { .. }
                | EngineError::IrreconcilableMerge { .. }
                | EngineError::DestroyMaterialized(_)
                | EngineError::ReentrantTraversal { .. }
        )
    }
}
