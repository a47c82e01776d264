//! Scene sizing knobs.

use serde::{Deserialize, Serialize};

use crate::EcsError;

/// Up-front capacities for a [`Scene`](crate::scene::Scene).
///
/// All fields are hints; storage still grows past them on demand. Missing
/// fields in serialized form fall back to [`SceneConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// Entity slots reserved in the allocator.
    pub entity_capacity: usize,
    /// Rows reserved per column when an archetype is created.
    pub row_capacity: usize,
    /// Pending events reserved in the event queue.
    pub event_capacity: usize,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            entity_capacity: 1024,
            row_capacity: 64,
            event_capacity: 256,
        }
    }
}

impl SceneConfig {
    /// Parse a config from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, EcsError> {
        serde_json::from_str(json).map_err(EcsError::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config = SceneConfig::from_json_str(r#"{ "row_capacity": 8 }"#).unwrap();
        assert_eq!(config.row_capacity, 8);
        assert_eq!(config.entity_capacity, SceneConfig::default().entity_capacity);
        assert_eq!(config.event_capacity, SceneConfig::default().event_capacity);
    }

    #[test]
    fn malformed_json_is_config_error() {
        let err = SceneConfig::from_json_str("{ row_capacity: ").unwrap_err();
        assert!(matches!(err, EcsError::Config(_)));
    }

    #[test]
    fn json_roundtrip() {
        let config = SceneConfig {
            entity_capacity: 10,
            row_capacity: 2,
            event_capacity: 0,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(SceneConfig::from_json_str(&json).unwrap(), config);
    }
}
