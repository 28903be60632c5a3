//! NIP-01 helpers over nostr-sdk's event, filter and message types.

use nostr_sdk::prelude::*;

/// NIP-78 application-specific data; parameterized replaceable.
pub const KIND_APP_DATA: u16 = 30078;

/// Subscription filter for one author and a set of kinds.
pub fn author_filter(author: PublicKey, kinds: &[u16]) -> Filter {
    Filter::new()
        .author(author)
        .kinds(kinds.iter().copied().map(Kind::from))
}

/// `["REQ", <subscription_id>, <filter>]`
pub fn req_message(subscription_id: &SubscriptionId, filter: &Filter) -> String {
    ClientMessage::req(subscription_id.clone(), filter.clone()).as_json()
}

/// `["CLOSE", <subscription_id>]`
pub fn close_message(subscription_id: &SubscriptionId) -> String {
    ClientMessage::close(subscription_id.clone()).as_json()
}

/// The identity ("d") tag, if present.
pub fn identity_tag(event: &Event) -> Option<&str> {
    event.tags.identifier()
}

/// Event id shortened for log lines.
pub fn short_id(id: &EventId) -> String {
    let mut hex = id.to_hex();
    hex.truncate(12);
    hex
}

pub fn unix_timestamp() -> u64 {
    Timestamp::now().as_u64()
}
