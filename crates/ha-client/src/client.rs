//! Home Assistant REST client.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::HaConfig;
use crate::error::HaError;
use crate::types::{ApiStatus, EntityUpsert, PlatformEvent};

/// Capability the bridge needs from the home-automation platform.
///
/// Implementations must be cheap to share; the bridge calls them from its
/// single dispatch task and never retries a failed call synchronously.
#[async_trait]
pub trait EntityClient: Send + Sync {
    /// Create or update an entity's state.
    async fn upsert_state(&self, upsert: &EntityUpsert) -> Result<(), HaError>;

    /// Fire a custom event on the platform's event bus.
    async fn fire_event(&self, event: &PlatformEvent) -> Result<(), HaError>;
}

/// Client for the Home Assistant Core REST API.
#[derive(Clone)]
pub struct HomeAssistantClient {
    http: Client,
    config: HaConfig,
}

impl HomeAssistantClient {
    /// Build a client. No request is made until the first call.
    pub fn new(config: HaConfig) -> Result<Self, HaError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(HaError::Http)?;

        Ok(Self { http, config })
    }

    /// Get the client configuration.
    pub fn config(&self) -> &HaConfig {
        &self.config
    }

    /// Verify the API is reachable and the token is accepted.
    ///
    /// Returns the API status message on success.
    pub async fn check_api(&self) -> Result<String, HaError> {
        let url = self.config.api_url();
        debug!("API check: {}", url);

        let resp = self.authorize(self.http.get(&url)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(HaError::Status {
                status: status.as_u16(),
                url,
                body,
            });
        }

        let api: ApiStatus = resp.json().await?;
        info!("Connected to Home Assistant: {}", api.message);
        Ok(api.message)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.config.has_token() {
            request.bearer_auth(self.config.token())
        } else {
            request
        }
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: String,
        body: &T,
        accepted: &[StatusCode],
    ) -> Result<(), HaError> {
        let resp = self
            .authorize(self.http.post(&url))
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if accepted.contains(&status) {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), url = %url, "Home Assistant rejected request");
        Err(HaError::Status {
            status: status.as_u16(),
            url,
            body,
        })
    }
}

#[async_trait]
impl EntityClient for HomeAssistantClient {
    async fn upsert_state(&self, upsert: &EntityUpsert) -> Result<(), HaError> {
        let url = self.config.state_url(&upsert.entity_id);
        debug!(entity_id = %upsert.entity_id, "Setting entity state");
        self.post_json(url, upsert, &[StatusCode::OK, StatusCode::CREATED])
            .await
    }

    async fn fire_event(&self, event: &PlatformEvent) -> Result<(), HaError> {
        let url = self.config.event_url(&event.event_type);
        debug!(event_type = %event.event_type, "Firing event");
        self.post_json(url, &event.data, &[StatusCode::OK]).await
    }
}
