//! Event router: decrypts forwarded events and dispatches them to handlers.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use ha_client::EntityClient;
use nostr_sdk::prelude::Event;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::envelope::{self, ChunkReassembler, ConversationKey, EnvelopeError, Opened};
use crate::events::{identity_tag, short_id};
use crate::handlers::{sanitize_for_log, AppHandler, EntityCommand, Payload, ValidationError};
use crate::relay::EventConsumer;
use crate::Error;

/// Routes decrypted payloads to app handlers (by identity-tag prefix) or to
/// the generic sensor/binary_sensor/notification handlers.
pub struct EventRouter {
    key: ConversationKey,
    prefix: String,
    handlers: Vec<(String, Box<dyn AppHandler>)>,
    reassembler: ChunkReassembler,
    client: Arc<dyn EntityClient>,
}

impl EventRouter {
    pub fn new(
        key: ConversationKey,
        prefix: impl Into<String>,
        client: Arc<dyn EntityClient>,
    ) -> Self {
        Self {
            key,
            prefix: prefix.into(),
            handlers: Vec::new(),
            reassembler: ChunkReassembler::default(),
            client,
        }
    }

    pub fn with_reassembler(mut self, reassembler: ChunkReassembler) -> Self {
        self.reassembler = reassembler;
        self
    }

    /// Register an app handler for identity tags starting with `prefix`.
    ///
    /// Returns `false` and leaves the existing handler in place if the prefix
    /// is already taken.
    pub fn register<H>(&mut self, prefix: impl Into<String>, handler: H) -> bool
    where
        H: AppHandler + 'static,
    {
        let prefix = prefix.into();
        if self.handlers.iter().any(|(existing, _)| *existing == prefix) {
            warn!(prefix = %prefix, "Handler prefix already registered");
            return false;
        }
        info!(prefix = %prefix, handler = handler.name(), "Registering app handler");
        self.handlers.push((prefix, Box::new(handler)));
        true
    }

    pub fn prefixes(&self) -> Vec<&str> {
        self.handlers.iter().map(|(prefix, _)| prefix.as_str()).collect()
    }

    pub fn pending_chunk_groups(&self) -> usize {
        self.reassembler.pending()
    }

    /// Decrypt and translate one event into entity commands.
    ///
    /// Returns no commands while a chunk group is still incomplete.
    pub async fn route(&mut self, event: &Event) -> Result<Vec<EntityCommand>, Error> {
        let event_id = short_id(&event.id);
        let Some(plaintext) = self.decrypt(event)? else {
            debug!(event_id = %event_id, "Waiting for remaining chunks");
            return Ok(Vec::new());
        };
        debug!(
            event_id = %event_id,
            preview = %sanitize_for_log(&plaintext),
            "Decrypted event"
        );

        let payload: Value = serde_json::from_str(&plaintext).map_err(|_| {
            warn!(
                event_id = %event_id,
                preview = %sanitize_for_log(&plaintext),
                "Content is not valid JSON"
            );
            ValidationError::Malformed("content is not valid JSON".to_string())
        })?;

        if let Some(d_tag) = identity_tag(event) {
            if let Some(handler) = self.handler_for(d_tag) {
                debug!(
                    event_id = %event_id,
                    handler = handler.name(),
                    "Dispatching to app handler"
                );
                return handler.handle(payload, d_tag).await;
            }
        }

        let payload = Payload::parse(payload)?;
        Ok(vec![payload.into_command(&self.prefix)?])
    }

    /// Run periodic handler housekeeping for `today` and apply the results.
    pub async fn tick_at(&mut self, today: NaiveDate) -> usize {
        self.reassembler.prune(Instant::now());

        let mut commands = Vec::new();
        for (_, handler) in self.handlers.iter_mut() {
            commands.extend(handler.tick(today).await);
        }
        apply_commands(self.client.as_ref(), commands).await
    }

    fn decrypt(&mut self, event: &Event) -> Result<Option<String>, Error> {
        let bytes = match envelope::open(&event.content, &self.key)? {
            Opened::Message(bytes) => bytes,
            Opened::Chunks(chunks) => match self.reassembler.accept(chunks, Instant::now())? {
                Some(bytes) => bytes,
                None => return Ok(None),
            },
        };
        let text = String::from_utf8(bytes).map_err(EnvelopeError::from)?;
        Ok(Some(text))
    }

    fn handler_for(&mut self, d_tag: &str) -> Option<&mut Box<dyn AppHandler>> {
        self.handlers
            .iter_mut()
            .filter(|entry| d_tag.starts_with(entry.0.as_str()))
            .max_by_key(|entry| entry.0.len())
            .map(|entry| &mut entry.1)
    }
}

/// Execute commands in order. Failures are logged, not retried.
/// Returns how many succeeded.
pub async fn apply_commands(client: &dyn EntityClient, commands: Vec<EntityCommand>) -> usize {
    let mut applied = 0;
    for command in commands {
        let result = match &command {
            EntityCommand::Upsert(upsert) => client.upsert_state(upsert).await,
            EntityCommand::Fire(event) => client.fire_event(event).await,
        };
        match result {
            Ok(()) => {
                info!(entity = %command.target(), "Entity updated");
                applied += 1;
            }
            Err(e) => {
                let error = Error::Downstream(e);
                warn!(entity = %command.target(), error = %error, "Entity client call failed");
            }
        }
    }
    applied
}

#[async_trait]
impl EventConsumer for EventRouter {
    async fn consume(&mut self, event: Event) {
        match self.route(&event).await {
            Ok(commands) => {
                apply_commands(self.client.as_ref(), commands).await;
            }
            Err(e) => warn!(event_id = short_id(&event.id), error = %e, "Dropping event"),
        }
    }

    async fn tick(&mut self) {
        self.tick_at(Local::now().date_naive()).await;
    }
}
