pub mod error;
pub mod identity;
pub mod memory;
pub mod traits;

pub use error::StorageError;
pub use identity::{IdentityRegistry, IdentityUpdate};
pub use memory::MemoryStore;
pub use traits::*;
