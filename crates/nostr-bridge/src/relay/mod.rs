//! Relay transport: persistent subscriptions, one-shot queries, and the
//! manager that merges both into a single deduplicated event stream.

mod backoff;
mod connection;
mod manager;
mod query;

pub use backoff::ReconnectConfig;
pub use connection::{ConnectionState, RelayConnection};
pub use manager::{EventConsumer, Inbound, RelayManager, RelaySettings, Source};
pub use query::fetch_events;

use std::time::Duration;

use nostr_sdk::prelude::SubscriptionId;
use rand_core::{OsRng, RngCore};
use tokio::sync::watch;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_QUERY_LIMIT: usize = 500;
/// Idle time before a ping; twice this without any frame drops the session.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// How far before the last known-good moment a resumed subscription starts.
pub const RESUME_SKEW_SECS: u64 = 60;

pub(crate) fn subscription_id(purpose: &str) -> SubscriptionId {
    let mut bytes = [0u8; 6];
    OsRng.fill_bytes(&mut bytes);
    SubscriptionId::new(format!("ha-bridge-{}-{}", purpose, hex::encode(bytes)))
}

/// Resolves once shutdown is signalled or the sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
