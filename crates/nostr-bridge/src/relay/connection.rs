use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use nostr_sdk::prelude::{Filter, JsonUtil, RelayMessage, SubscriptionId, Timestamp};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::backoff::ReconnectConfig;
use super::manager::{Inbound, Source};
use super::{
    subscription_id, wait_for_shutdown, DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEPALIVE,
    RESUME_SKEW_SECS,
};
use crate::events::{close_message, req_message, unix_timestamp};
use crate::handlers::sanitize_for_log;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
}

enum SessionEnd {
    /// Relay closed the socket or the stream ended.
    Dropped,
    /// Shutdown was requested or the ingestion channel is gone.
    Stopped,
}

/// A persistent subscription to one relay.
///
/// Runs until shutdown, reconnecting with exponential backoff. Each new
/// session resumes from shortly before the previous one dropped.
pub struct RelayConnection {
    url: String,
    filter: Filter,
    reconnect: ReconnectConfig,
    connect_timeout: Duration,
    keepalive: Duration,
    state: watch::Sender<ConnectionState>,
}

impl RelayConnection {
    pub fn new(url: impl Into<String>, filter: Filter, reconnect: ReconnectConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url: url.into(),
            filter,
            reconnect,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive: DEFAULT_KEEPALIVE,
            state,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Ping after this much silence; give up after twice as much.
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive.max(Duration::from_millis(10));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn run(self, tx: mpsc::Sender<Inbound>, mut shutdown: watch::Receiver<bool>) {
        if self.url.starts_with("ws://") {
            warn!(relay = %self.url, "Relay uses unencrypted ws:// transport");
        }

        let mut since = unix_timestamp();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            let mut subscribed_at = None;
            let result = self
                .session(since, &tx, &mut shutdown, &mut subscribed_at)
                .await;
            self.set_state(ConnectionState::Disconnected);

            match result {
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::Dropped) => info!(relay = %self.url, "Relay connection closed"),
                Err(e) => warn!(relay = %self.url, error = %e, "Relay session failed"),
            }

            if let Some(at) = subscribed_at {
                since = unix_timestamp().saturating_sub(RESUME_SKEW_SECS);
                if at.elapsed() >= self.reconnect.stable_after {
                    attempt = 0;
                }
            }

            let delay = self.reconnect.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            info!(
                relay = %self.url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to relay"
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        debug!(relay = %self.url, "Relay connection task finished");
    }

    async fn session(
        &self,
        since: u64,
        tx: &mpsc::Sender<Inbound>,
        shutdown: &mut watch::Receiver<bool>,
        subscribed_at: &mut Option<Instant>,
    ) -> Result<SessionEnd, Error> {
        let (mut ws, _) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| Error::transport(&self.url, "connect timed out"))??;

        let sub_id = subscription_id("live");
        let filter = self.filter.clone().since(Timestamp::from(since));
        ws.send(Message::Text(req_message(&sub_id, &filter))).await?;

        self.set_state(ConnectionState::Subscribed);
        *subscribed_at = Some(Instant::now());
        info!(relay = %self.url, since, "Subscribed to relay");

        let first_tick = tokio::time::Instant::now() + self.keepalive;
        let mut keepalive = interval_at(first_tick, self.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_frame = Instant::now();

        loop {
            tokio::select! {
                _ = wait_for_shutdown(shutdown) => {
                    let _ = ws.send(Message::Text(close_message(&sub_id))).await;
                    let _ = ws.close(None).await;
                    return Ok(SessionEnd::Stopped);
                }
                _ = keepalive.tick() => {
                    let idle = last_frame.elapsed();
                    if idle >= self.keepalive * 2 {
                        return Err(Error::transport(&self.url, "read timed out"));
                    }
                    if idle >= self.keepalive {
                        debug!(relay = %self.url, "Relay idle, sending ping");
                        ws.send(Message::Ping(Vec::new())).await?;
                    }
                }
                frame = ws.next() => {
                    let Some(frame) = frame else {
                        return Ok(SessionEnd::Dropped);
                    };
                    last_frame = Instant::now();
                    match frame? {
                        Message::Text(text) => {
                            if let Some(end) = self.handle_text(&text, &sub_id, tx).await? {
                                return Ok(end);
                            }
                        }
                        Message::Close(_) => return Ok(SessionEnd::Dropped),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Handle one text frame. `Some` ends the session.
    async fn handle_text(
        &self,
        text: &str,
        sub_id: &SubscriptionId,
        tx: &mpsc::Sender<Inbound>,
    ) -> Result<Option<SessionEnd>, Error> {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(relay = %self.url, error = %e, "Skipping malformed relay frame");
                return Ok(None);
            }
        };

        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                if *subscription_id != *sub_id {
                    debug!(relay = %self.url, "Ignoring event for another subscription");
                    return Ok(None);
                }
                let inbound = Inbound::Event {
                    relay: self.url.clone(),
                    source: Source::Live,
                    event: event.into_owned(),
                };
                if tx.send(inbound).await.is_err() {
                    return Ok(Some(SessionEnd::Stopped));
                }
            }
            RelayMessage::EndOfStoredEvents(_) => {
                debug!(relay = %self.url, "Relay finished sending stored events");
            }
            RelayMessage::Notice(notice) => {
                warn!(relay = %self.url, notice = %sanitize_for_log(&notice), "Relay notice");
            }
            RelayMessage::Closed { message, .. } => {
                return Err(Error::transport(
                    &self.url,
                    format!("subscription closed: {}", sanitize_for_log(&message)),
                ));
            }
            _ => {}
        }
        Ok(None)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}
