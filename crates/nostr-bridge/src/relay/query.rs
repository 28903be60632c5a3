use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use nostr_sdk::prelude::{Event, Filter, JsonUtil, RelayMessage};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::subscription_id;
use crate::events::{close_message, req_message};
use crate::handlers::sanitize_for_log;
use crate::Error;

/// One-shot query: collect stored events until EOSE, close or `wait` elapses.
///
/// Hitting the deadline is not an error; whatever arrived is returned.
pub async fn fetch_events(
    url: &str,
    filter: &Filter,
    wait: Duration,
) -> Result<Vec<Event>, Error> {
    let deadline = Instant::now() + wait;
    let (mut ws, _) = timeout(wait, connect_async(url))
        .await
        .map_err(|_| Error::Timeout)??;

    let sub_id = subscription_id("poll");
    ws.send(Message::Text(req_message(&sub_id, filter))).await?;

    let mut events = Vec::new();
    loop {
        let frame = match timeout_at(deadline, ws.next()).await {
            Err(_) => {
                debug!(
                    relay = url,
                    received = events.len(),
                    "Query deadline reached before EOSE"
                );
                break;
            }
            Ok(None) => break,
            Ok(Some(frame)) => frame?,
        };

        match frame {
            Message::Text(text) => match RelayMessage::from_json(&text) {
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                }) if *subscription_id == sub_id => events.push(event.into_owned()),
                Ok(RelayMessage::EndOfStoredEvents(id)) if *id == sub_id => break,
                Ok(RelayMessage::Closed {
                    subscription_id,
                    message,
                }) if *subscription_id == sub_id => {
                    warn!(relay = url, reason = %sanitize_for_log(&message), "Relay closed query");
                    break;
                }
                Ok(RelayMessage::Notice(notice)) => {
                    warn!(relay = url, notice = %sanitize_for_log(&notice), "Relay notice");
                }
                Ok(_) => {}
                Err(e) => warn!(relay = url, error = %e, "Skipping malformed relay frame"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    let _ = ws.send(Message::Text(close_message(&sub_id))).await;
    let _ = ws.close(None).await;
    Ok(events)
}
