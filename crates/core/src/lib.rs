pub mod config;
pub mod document;
pub mod error;
pub mod field_value;
pub mod ids;
pub mod schema;
pub mod state;

pub use config::CacheConfig;
pub use error::CoreError;
pub use field_value::{Attributes, FieldValue};
pub use ids::*;
pub use state::LifecycleState;
