//! Home Assistant REST client library.
//!
//! This crate provides the entity capability the Nostr bridge writes into:
//!
//! - Creating or updating entity states (`POST /api/states/<entity_id>`)
//! - Firing custom events (`POST /api/events/<event_type>`)
//! - Checking API reachability (`GET /api/`)
//!
//! # Example
//!
//! ```no_run
//! use ha_client::{EntityClient, EntityUpsert, HaConfig, HomeAssistantClient};
//!
//! # async fn example() -> Result<(), ha_client::HaError> {
//! let client = HomeAssistantClient::new(HaConfig::from_env()?)?;
//! client.check_api().await?;
//!
//! let upsert = EntityUpsert::new("sensor.nostr_outdoor_temperature", "72.5", Default::default());
//! client.upsert_state(&upsert).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod types;

pub use client::{EntityClient, HomeAssistantClient};
pub use config::{HaConfig, DEFAULT_BASE_URL};
pub use error::HaError;
pub use types::{ApiStatus, EntityUpsert, PlatformEvent};

/// Crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
