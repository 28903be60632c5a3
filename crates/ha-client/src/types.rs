//! Request types for the Home Assistant REST API.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Create-or-update request for a single entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpsert {
    /// Full entity id, including the domain (e.g. `sensor.nostr_outdoor_temperature`).
    #[serde(skip)]
    pub entity_id: String,
    /// New state value.
    pub state: String,
    /// State attributes.
    #[serde(skip_serializing_if = "Map::is_empty", default)]
    pub attributes: Map<String, Value>,
}

impl EntityUpsert {
    pub fn new(
        entity_id: impl Into<String>,
        state: impl Into<String>,
        attributes: Map<String, Value>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes,
        }
    }

    /// Look up an attribute value.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

/// A custom event fired on the Home Assistant event bus.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformEvent {
    pub event_type: String,
    pub data: Map<String, Value>,
}

impl PlatformEvent {
    pub fn new(event_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }
}

/// Response body of `GET /api/`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiStatus {
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upsert_body_omits_entity_id() {
        let mut attributes = Map::new();
        attributes.insert("unit_of_measurement".to_string(), json!("°F"));
        let upsert = EntityUpsert::new("sensor.nostr_temp", "72.5", attributes);

        let body = serde_json::to_value(&upsert).unwrap();
        assert_eq!(
            body,
            json!({"state": "72.5", "attributes": {"unit_of_measurement": "°F"}})
        );
    }

    #[test]
    fn test_upsert_body_without_attributes() {
        let upsert = EntityUpsert::new("binary_sensor.nostr_door", "on", Map::new());
        let body = serde_json::to_value(&upsert).unwrap();
        assert_eq!(body, json!({"state": "on"}));
    }
}
