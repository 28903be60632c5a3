use std::fmt;

use ha_client::{EntityUpsert, PlatformEvent};
use serde::Deserialize;
use serde_json::{Map, Number, Value};

use super::validation::{
    friendly_name, sanitize_for_log, validate_entity_id, validate_url, ValidationError,
};
use super::EntityCommand;

pub const GENERIC_SOURCE: &str = "nostr";
const ENTITY_PICTURE: &str = "entity_picture";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SensorValue {
    Number(Number),
    Text(String),
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorValue::Number(n) => write!(f, "{}", n),
            SensorValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorPayload {
    pub entity_id: String,
    pub value: SensorValue,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub device_class: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinarySensorPayload {
    pub entity_id: String,
    pub state: bool,
    #[serde(default)]
    pub device_class: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationPayload {
    #[serde(default)]
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub severity: Severity,
}

/// A generic payload, selected by its `type` field.
#[derive(Debug, Clone)]
pub enum Payload {
    Sensor(SensorPayload),
    BinarySensor(BinarySensorPayload),
    Notification(NotificationPayload),
}

impl Payload {
    pub fn parse(value: Value) -> Result<Self, ValidationError> {
        let kind = match value.as_object() {
            Some(object) => match object.get("type").and_then(Value::as_str) {
                Some(kind) => kind.to_string(),
                None => return Err(ValidationError::MissingField("type")),
            },
            None => return Err(ValidationError::NotAnObject),
        };

        let malformed =
            |e: serde_json::Error| ValidationError::Malformed(sanitize_for_log(&e.to_string()));
        match kind.as_str() {
            "sensor" => serde_json::from_value(value).map(Payload::Sensor).map_err(malformed),
            "binary_sensor" => serde_json::from_value(value)
                .map(Payload::BinarySensor)
                .map_err(malformed),
            "notification" => serde_json::from_value(value)
                .map(Payload::Notification)
                .map_err(malformed),
            other => Err(ValidationError::UnknownType(sanitize_for_log(other))),
        }
    }

    /// Validate and translate into the entity call for `prefix`.
    pub fn into_command(self, prefix: &str) -> Result<EntityCommand, ValidationError> {
        match self {
            Payload::Sensor(p) => {
                validate_entity_id(&p.entity_id)?;
                let mut attributes = checked_attributes(p.attributes)?;
                attributes.insert("unit_of_measurement".into(), Value::String(p.unit));
                attributes.insert("device_class".into(), Value::String(p.device_class));
                set_reserved(&mut attributes, &p.entity_id);
                Ok(EntityCommand::Upsert(EntityUpsert::new(
                    format!("sensor.{}_{}", prefix, p.entity_id),
                    p.value.to_string(),
                    attributes,
                )))
            }
            Payload::BinarySensor(p) => {
                validate_entity_id(&p.entity_id)?;
                let mut attributes = checked_attributes(p.attributes)?;
                attributes.insert("device_class".into(), Value::String(p.device_class));
                set_reserved(&mut attributes, &p.entity_id);
                let state = if p.state { "on" } else { "off" };
                Ok(EntityCommand::Upsert(EntityUpsert::new(
                    format!("binary_sensor.{}_{}", prefix, p.entity_id),
                    state,
                    attributes,
                )))
            }
            Payload::Notification(p) => {
                let mut data = Map::new();
                data.insert("title".into(), Value::String(p.title));
                data.insert("message".into(), Value::String(p.message));
                data.insert("severity".into(), Value::String(p.severity.as_str().into()));
                Ok(EntityCommand::Fire(PlatformEvent::new(
                    format!("{}_notification", prefix),
                    data,
                )))
            }
        }
    }
}

fn checked_attributes(
    attributes: Map<String, Value>,
) -> Result<Map<String, Value>, ValidationError> {
    match attributes.get(ENTITY_PICTURE) {
        None => {}
        Some(Value::String(url)) => {
            validate_url(url)?;
        }
        Some(other) => return Err(ValidationError::Url(sanitize_for_log(&other.to_string()))),
    }
    Ok(attributes)
}

fn set_reserved(attributes: &mut Map<String, Value>, entity_id: &str) {
    attributes.insert("friendly_name".into(), Value::String(friendly_name(entity_id)));
    attributes.insert("source".into(), Value::String(GENERIC_SOURCE.into()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upsert(command: EntityCommand) -> EntityUpsert {
        match command {
            EntityCommand::Upsert(upsert) => upsert,
            EntityCommand::Fire(event) => panic!("expected upsert, got {:?}", event),
        }
    }

    #[test]
    fn test_sensor_upsert() {
        let payload = Payload::parse(json!({
            "type": "sensor",
            "entity_id": "outdoor_temperature",
            "value": 72.5,
            "unit": "°F",
            "device_class": "temperature"
        }))
        .unwrap();

        let upsert = upsert(payload.into_command("nostr").unwrap());
        assert_eq!(upsert.entity_id, "sensor.nostr_outdoor_temperature");
        assert_eq!(upsert.state, "72.5");
        assert_eq!(upsert.attribute("unit_of_measurement"), Some(&json!("°F")));
        assert_eq!(upsert.attribute("device_class"), Some(&json!("temperature")));
        assert_eq!(upsert.attribute("friendly_name"), Some(&json!("Outdoor Temperature")));
        assert_eq!(upsert.attribute("source"), Some(&json!("nostr")));
    }

    #[test]
    fn test_sensor_value_rendering() {
        for (value, expected) in [(json!(42), "42"), (json!(-3), "-3"), (json!("idle"), "idle")] {
            let payload = Payload::parse(json!({
                "type": "sensor", "entity_id": "x", "value": value
            }))
            .unwrap();
            assert_eq!(upsert(payload.into_command("nostr").unwrap()).state, expected);
        }
    }

    #[test]
    fn test_reserved_attributes_override_payload() {
        let payload = Payload::parse(json!({
            "type": "sensor",
            "entity_id": "humidity",
            "value": 40,
            "attributes": {
                "friendly_name": "Attacker Chosen",
                "source": "elsewhere",
                "unit_of_measurement": "lies",
                "room": "kitchen"
            }
        }))
        .unwrap();

        let upsert = upsert(payload.into_command("nostr").unwrap());
        assert_eq!(upsert.attribute("friendly_name"), Some(&json!("Humidity")));
        assert_eq!(upsert.attribute("source"), Some(&json!("nostr")));
        assert_eq!(upsert.attribute("unit_of_measurement"), Some(&json!("")));
        assert_eq!(upsert.attribute("room"), Some(&json!("kitchen")));
    }

    #[test]
    fn test_binary_sensor_states() {
        let payload = Payload::parse(json!({
            "type": "binary_sensor",
            "entity_id": "front_door",
            "state": true,
            "device_class": "door"
        }))
        .unwrap();
        let upsert = upsert(payload.into_command("home").unwrap());
        assert_eq!(upsert.entity_id, "binary_sensor.home_front_door");
        assert_eq!(upsert.state, "on");

        let payload = Payload::parse(json!({
            "type": "binary_sensor", "entity_id": "front_door", "state": false
        }))
        .unwrap();
        assert_eq!(upsert_state(payload), "off");
    }

    fn upsert_state(payload: Payload) -> String {
        upsert(payload.into_command("home").unwrap()).state
    }

    #[test]
    fn test_notification_fires_event() {
        let payload = Payload::parse(json!({
            "type": "notification",
            "title": "Smoke Alarm",
            "message": "Kitchen smoke detected",
            "severity": "critical"
        }))
        .unwrap();

        match payload.into_command("nostr").unwrap() {
            EntityCommand::Fire(event) => {
                assert_eq!(event.event_type, "nostr_notification");
                assert_eq!(event.data["title"], json!("Smoke Alarm"));
                assert_eq!(event.data["severity"], json!("critical"));
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_notification_defaults() {
        let payload = Payload::parse(json!({"type": "notification", "message": "hi"})).unwrap();
        match payload {
            Payload::Notification(n) => {
                assert_eq!(n.title, "");
                assert_eq!(n.severity, Severity::Info);
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert!(Payload::parse(json!({
            "type": "notification",
            "message": "hi",
            "severity": "panic"
        }))
        .is_err());
    }

    #[test]
    fn test_parse_error_strips_control_characters() {
        let err = Payload::parse(json!({
            "type": "notification",
            "message": "hi",
            "severity": "x\nINFO nostr_bridge: forged line\r"
        }))
        .unwrap_err();

        assert!(matches!(err, ValidationError::Malformed(_)));
        let rendered = err.to_string();
        assert!(!rendered.contains('\n'));
        assert!(!rendered.contains('\r'));
        assert!(rendered.contains("forged line"));
    }

    #[test]
    fn test_rejected_payloads() {
        assert_eq!(
            Payload::parse(json!({"entity_id": "x"})).unwrap_err(),
            ValidationError::MissingField("type")
        );
        assert!(matches!(
            Payload::parse(json!({"type": "light"})),
            Err(ValidationError::UnknownType(_))
        ));
        assert_eq!(Payload::parse(json!([1, 2])).unwrap_err(), ValidationError::NotAnObject);
        assert!(matches!(
            Payload::parse(json!({"type": "sensor", "entity_id": "x"})),
            Err(ValidationError::Malformed(_))
        ));

        let bad_id =
            Payload::parse(json!({"type": "sensor", "entity_id": "bad id!", "value": 1})).unwrap();
        assert!(matches!(bad_id.into_command("nostr"), Err(ValidationError::EntityId(_))));
    }

    #[test]
    fn test_entity_picture_scheme() {
        let with_picture = |url: Value| {
            Payload::parse(json!({
                "type": "sensor",
                "entity_id": "cam",
                "value": 1,
                "attributes": {"entity_picture": url}
            }))
            .unwrap()
            .into_command("nostr")
        };

        assert!(matches!(with_picture(json!("ftp://x")), Err(ValidationError::Url(_))));
        assert!(matches!(with_picture(json!(5)), Err(ValidationError::Url(_))));
        let ok = upsert(with_picture(json!("https://x")).unwrap());
        assert_eq!(ok.attribute("entity_picture"), Some(&json!("https://x")));
    }
}
