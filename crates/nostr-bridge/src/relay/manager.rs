use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::{Event, Filter, PublicKey, Timestamp};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::connection::{ConnectionState, RelayConnection};
use super::query::fetch_events;
use super::{
    wait_for_shutdown, ReconnectConfig, DEFAULT_KEEPALIVE, DEFAULT_QUERY_LIMIT,
    DEFAULT_QUERY_TIMEOUT, RESUME_SKEW_SECS, SHUTDOWN_GRACE,
};
use crate::dedupe::{SeenCache, DEFAULT_SEEN_CAPACITY};
use crate::events::{author_filter, short_id, unix_timestamp};
use crate::Error;

const INGEST_CHANNEL_CAPACITY: usize = 256;

/// Which path delivered an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Live,
    Poll,
}

/// Items on the single ingestion channel.
#[derive(Debug)]
pub enum Inbound {
    Event {
        relay: String,
        source: Source,
        event: Event,
    },
    /// A poll cycle over every relay has finished.
    PollComplete,
}

/// Receives each unique event exactly once, in arrival order.
#[async_trait]
pub trait EventConsumer: Send {
    async fn consume(&mut self, event: Event);

    /// Periodic housekeeping, called after each poll cycle.
    async fn tick(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub relays: Vec<String>,
    /// The only accepted author.
    pub author: PublicKey,
    pub kinds: Vec<u16>,
    pub poll_interval: Duration,
    pub reconnect: ReconnectConfig,
    pub seen_capacity: usize,
    pub query_timeout: Duration,
    pub query_limit: usize,
    pub keepalive: Duration,
}

impl RelaySettings {
    pub fn new(relays: Vec<String>, author: PublicKey, kinds: Vec<u16>) -> Self {
        Self {
            relays,
            author,
            kinds,
            poll_interval: Duration::from_secs(300),
            reconnect: ReconnectConfig::default(),
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            query_limit: DEFAULT_QUERY_LIMIT,
            keepalive: DEFAULT_KEEPALIVE,
        }
    }

    fn filter(&self) -> Filter {
        author_filter(self.author, &self.kinds)
    }
}

/// Owns the relay tasks and the single consumer loop.
///
/// Connection and poll tasks only produce; deduplication and handing events
/// to the consumer happen on one task, so neither needs a lock.
pub struct RelayManager<C: EventConsumer> {
    settings: RelaySettings,
    connections: Vec<RelayConnection>,
    seen: SeenCache,
    consumer: C,
}

impl<C: EventConsumer> RelayManager<C> {
    pub fn new(settings: RelaySettings, consumer: C) -> Self {
        let connections = settings
            .relays
            .iter()
            .map(|url| {
                RelayConnection::new(url.clone(), settings.filter(), settings.reconnect.clone())
                    .with_keepalive(settings.keepalive)
            })
            .collect();
        Self {
            seen: SeenCache::new(settings.seen_capacity),
            settings,
            connections,
            consumer,
        }
    }

    /// Per-relay connection state, observable while `run` is active.
    pub fn connection_states(&self) -> Vec<(String, watch::Receiver<ConnectionState>)> {
        self.connections
            .iter()
            .map(|conn| (conn.url().to_string(), conn.state()))
            .collect()
    }

    pub fn seen(&self) -> &SeenCache {
        &self.seen
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    /// Filter, deduplicate, and dispatch one inbound item.
    pub async fn ingest(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Event {
                relay,
                source,
                event,
            } => {
                let id = short_id(&event.id);
                if event.pubkey != self.settings.author {
                    debug!(relay = %relay, id = %id, "Dropping event from unexpected author");
                    return;
                }
                let kind = event.kind.as_u16();
                if !self.settings.kinds.contains(&kind) {
                    debug!(relay = %relay, id = %id, kind, "Dropping event of unexpected kind");
                    return;
                }
                if self.seen.check_and_mark(&event.id.to_hex()) {
                    debug!(relay = %relay, ?source, id = %id, "Duplicate event");
                    return;
                }
                debug!(relay = %relay, ?source, id = %id, "Dispatching event");
                self.consumer.consume(event).await;
            }
            Inbound::PollComplete => self.consumer.tick().await,
        }
    }

    /// Run until shutdown is signalled. Returns the consumer.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<C, Error> {
        if self.connections.is_empty() {
            return Err(Error::Config("no relays configured".to_string()));
        }

        let (tx, mut rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
        let mut tasks = JoinSet::new();

        for conn in std::mem::take(&mut self.connections) {
            info!(relay = %conn.url(), "Starting relay connection");
            tasks.spawn(conn.run(tx.clone(), shutdown.clone()));
        }
        tasks.spawn(poll_loop(self.settings.clone(), tx.clone(), shutdown.clone()));
        drop(tx);

        let mut stop = shutdown.clone();
        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut stop) => break,
                inbound = rx.recv() => match inbound {
                    Some(inbound) => self.ingest(inbound).await,
                    None => break,
                },
            }
        }

        info!("Stopping relay tasks");
        rx.close();
        let drained = timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Relay tasks did not stop within grace period; aborting");
            tasks.abort_all();
        }

        Ok(self.consumer)
    }
}

async fn poll_loop(
    settings: RelaySettings,
    tx: mpsc::Sender<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(settings.poll_interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_poll: Option<u64> = None;

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => return,
            _ = ticker.tick() => {}
        }

        let started = unix_timestamp();
        let mut filter = settings.filter().limit(settings.query_limit);
        if let Some(previous) = last_poll {
            filter = filter.since(Timestamp::from(previous.saturating_sub(RESUME_SKEW_SECS)));
        }

        let finished = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => return,
            finished = poll_once(&settings, &filter, &tx) => finished,
        };
        if !finished {
            return;
        }

        last_poll = Some(started);
        if tx.send(Inbound::PollComplete).await.is_err() {
            return;
        }
    }
}

/// Query every relay once. Returns `false` if the ingestion channel closed.
async fn poll_once(
    settings: &RelaySettings,
    filter: &Filter,
    tx: &mpsc::Sender<Inbound>,
) -> bool {
    for url in &settings.relays {
        match fetch_events(url, filter, settings.query_timeout).await {
            Ok(events) => {
                debug!(relay = %url, count = events.len(), "Poll query finished");
                for event in events {
                    let inbound = Inbound::Event {
                        relay: url.clone(),
                        source: Source::Poll,
                        event,
                    };
                    if tx.send(inbound).await.is_err() {
                        return false;
                    }
                }
            }
            Err(e) => warn!(relay = %url, error = %e, "Poll query failed"),
        }
    }
    true
}
