use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Reuse computed exit/enter paths between lifecycle states.
    pub memoize_transitions: bool,
    /// Upper bound on the island examined by orphan collection. Islands
    /// larger than this are kept alive. `None` means unbounded.
    pub max_island_size: Option<usize>,
    /// Keep locally-added, never-persisted members when canonical data for
    /// the same relationship arrives.
    pub retain_new_members: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memoize_transitions: true,
            max_island_size: None,
            retain_new_members: true,
        }
    }
}

impl CacheConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, CoreError> {
        toml::from_str(source).map_err(|e| CoreError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let config = CacheConfig::from_toml_str("max_island_size = 64").unwrap();
        assert_eq!(config.max_island_size, Some(64));
        assert!(config.memoize_transitions);
        assert!(config.retain_new_members);
    }

    #[test]
    fn rejects_wrong_types() {
        assert!(CacheConfig::from_toml_str("memoize_transitions = 3").is_err());
    }
}
