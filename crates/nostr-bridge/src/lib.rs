//! Bridge from encrypted Nostr relay events to Home Assistant entities.
//!
//! The bridge keeps live subscriptions to one or more relays, decrypts
//! kind-30078 payloads addressed to its key pair, drops replays, and turns
//! each payload into entity updates or platform events.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         NOSTR-BRIDGE                             │
//! │                                                                  │
//! │  ┌──────────────────┐   ┌──────────────────┐                    │
//! │  │ RelayConnection  │   │   Fallback poll  │                    │
//! │  │ (one per relay)  │   │  (fetch_events)  │                    │
//! │  └────────┬─────────┘   └────────┬─────────┘                    │
//! │           └───────── mpsc ───────┘                              │
//! │                       ▼                                          │
//! │              ┌──────────────────┐                               │
//! │              │  RelayManager    │  SeenCache (dedupe)           │
//! │              └────────┬─────────┘                               │
//! │                       ▼                                          │
//! │              ┌──────────────────┐                               │
//! │              │   EventRouter    │  envelope decrypt + chunks    │
//! │              └────────┬─────────┘                               │
//! │          ┌────────────┴────────────┐                            │
//! │          ▼                         ▼                             │
//! │   App handlers (mmp:)      sensor / binary_sensor /             │
//! │                            notification                          │
//! │                       ▼                                          │
//! │               ha_client::EntityClient                            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Payloads
//!
//! | `type` | Entity | State |
//! |--------|--------|-------|
//! | `sensor` | `sensor.<prefix>_<entity_id>` | `value` as text |
//! | `binary_sensor` | `binary_sensor.<prefix>_<entity_id>` | `on` / `off` |
//! | `notification` | event `<prefix>_notification` | n/a |
//!
//! Events whose `d` tag starts with a registered prefix (e.g. `mmp:`) go to
//! that app handler instead.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use nostr_bridge::{BridgeConfig, BridgeContext, EventRouter, MealPlannerHandler, RelayManager};
//!
//! let config = BridgeConfig::load()?;
//! let context = BridgeContext::from_config(&config)?;
//! let ha_config = ha_client::HaConfig::from_env()?;
//! let client = Arc::new(ha_client::HomeAssistantClient::new(ha_config)?);
//!
//! let key = context.conversation_key.clone();
//! let mut router = EventRouter::new(key, &context.entity_prefix, client);
//! router.register("mmp:", MealPlannerHandler::new(&context.entity_prefix));
//!
//! let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
//! RelayManager::new(context.relay_settings(&config), router).run(stop_rx).await?;
//! ```

mod config;
mod dedupe;
pub mod envelope;
mod error;
mod events;
pub mod handlers;
pub mod relay;
mod router;

pub use config::{
    BridgeConfig, BridgeContext, ADDON_OPTIONS_PATH, LOCAL_OPTIONS_PATH, MIN_POLL_INTERVAL_SECS,
    OPTIONS_PATH_ENV,
};
pub use dedupe::{SeenCache, DEFAULT_SEEN_CAPACITY};
pub use envelope::{decrypt, encrypt, encrypt_chunked, ConversationKey, EnvelopeError};
pub use error::Error;
pub use events::{
    author_filter, close_message, identity_tag, req_message, short_id, unix_timestamp,
    KIND_APP_DATA,
};
pub use handlers::{
    AppHandler, EntityCommand, MealPlannerHandler, ValidationError, MEALPLANNER_PREFIX,
};
pub use relay::{
    ConnectionState, EventConsumer, Inbound, ReconnectConfig, RelayManager, RelaySettings, Source,
};
pub use router::{apply_commands, EventRouter};

/// Crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
