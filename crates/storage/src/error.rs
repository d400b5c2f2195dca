use recordcache_core::ResourceKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unknown resource key: {0:?}")]
    UnknownKey(ResourceKey),

    #[error("cannot change id of {resource} from {from} to {to}")]
    IdChange {
        resource: String,
        from: String,
        to: String,
    },

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("record already exists for {0:?}")]
    RecordExists(ResourceKey),

    #[error("core error: {0}")]
    Core(#[from] recordcache_core::CoreError),
}
