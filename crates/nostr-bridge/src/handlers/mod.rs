//! Entity sync handlers: turn decrypted payloads into entity client calls.

pub mod mealplanner;
mod payload;
mod validation;

pub use mealplanner::{MealPlannerHandler, MEALPLANNER_PREFIX};
pub use payload::{
    BinarySensorPayload, NotificationPayload, Payload, SensorPayload, SensorValue, Severity,
    GENERIC_SOURCE,
};
pub use validation::{
    friendly_name, sanitize_for_log, validate_entity_id, validate_prefix, validate_url,
    ValidationError, MAX_ENTITY_ID_LENGTH, MAX_LOG_PREVIEW, MAX_PREFIX_LENGTH,
};

use async_trait::async_trait;
use chrono::NaiveDate;
use ha_client::{EntityUpsert, PlatformEvent};
use serde_json::Value;

use crate::Error;

/// A call to make against the entity client.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityCommand {
    Upsert(EntityUpsert),
    Fire(PlatformEvent),
}

impl EntityCommand {
    /// Entity id or event type, for logging.
    pub fn target(&self) -> &str {
        match self {
            EntityCommand::Upsert(upsert) => &upsert.entity_id,
            EntityCommand::Fire(event) => &event.event_type,
        }
    }
}

/// Handler for events whose identity tag starts with a registered prefix.
#[async_trait]
pub trait AppHandler: Send {
    fn name(&self) -> &str;

    /// Translate one decrypted payload. Returning an error drops the event.
    async fn handle(&mut self, payload: Value, d_tag: &str) -> Result<Vec<EntityCommand>, Error>;

    /// Periodic housekeeping with the current local date.
    async fn tick(&mut self, _today: NaiveDate) -> Vec<EntityCommand> {
        Vec::new()
    }
}
