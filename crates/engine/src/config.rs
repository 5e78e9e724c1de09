//! Client configuration.

use std::collections::HashMap;

use schema::SchemaRegistry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::QueryError;

/// Tuning knobs for the query client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Scalar fields left out of default projections, per entity.
    pub omit: HashMap<String, Vec<String>>,
    /// Deepest nesting accepted for filters, selections and nested writes.
    pub max_depth: usize,
    /// Opaque options handed to the storage executor's constructor.
    pub executor: Map<String, Json>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            omit: HashMap::new(),
            max_depth: 8,
            executor: Map::new(),
        }
    }
}

impl ClientConfig {
    /// Check the configuration against the registry it will be used with.
    pub fn validate(&self, registry: &SchemaRegistry) -> Result<(), QueryError> {
        if self.max_depth == 0 {
            return Err(QueryError::validation("*", "config.maxDepth", "must be at least 1"));
        }
        for (entity_name, fields) in &self.omit {
            let path = format!("config.omit.{entity_name}");
            let entity = registry
                .entity(entity_name)
                .map_err(|e| QueryError::validation(entity_name, &path, e.to_string()))?;
            for name in fields {
                if entity.field(name).is_none() {
                    return Err(QueryError::validation(
                        entity_name,
                        &format!("{path}.{name}"),
                        format!("unknown field '{name}'"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Fields of `entity` omitted by default.
    pub fn omitted(&self, entity: &str) -> &[String] {
        self.omit.get(entity).map_or(&[][..], Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::platform::platform_registry;
    use serde_json::json;

    #[test]
    fn defaults_apply_to_missing_keys() {
        let config: ClientConfig = serde_json::from_value(json!({"omit": {"ApiKey": ["keyHash"]}})).unwrap();
        assert_eq!(config.max_depth, 8);
        assert_eq!(config.omitted("ApiKey"), ["keyHash".to_string()]);
        assert!(config.omitted("User").is_empty());
    }

    #[test]
    fn unknown_omitted_fields_are_rejected() {
        let registry = platform_registry().unwrap();
        let config = ClientConfig {
            omit: HashMap::from([("ApiKey".to_string(), vec!["password".to_string()])]),
            ..ClientConfig::default()
        };
        let err = config.validate(&registry).unwrap_err();
        assert!(matches!(err, QueryError::Validation { path, .. } if path == "config.omit.ApiKey.password"));
    }
}
