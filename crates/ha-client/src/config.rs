//! Configuration types for ha-client.

use std::env;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::HaError;

/// Base URL the Home Assistant supervisor exposes to add-ons.
pub const DEFAULT_BASE_URL: &str = "http://supervisor/core";

/// Configuration for talking to the Home Assistant REST API.
#[derive(Debug, Clone)]
pub struct HaConfig {
    /// Base URL of Home Assistant Core (e.g., "http://supervisor/core").
    pub base_url: String,
    /// Request timeout for each API call.
    pub timeout: Duration,
    /// Long-lived access token or supervisor token. Empty means no auth header.
    token: SecretString,
}

impl HaConfig {
    /// Create a new configuration with the given base URL and token.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(10),
            token: SecretString::from(token.into()),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `HA_BASE_URL` - Default: http://supervisor/core
    /// - `SUPERVISOR_TOKEN` - Injected by the supervisor for add-ons with API access
    /// - `HA_TIMEOUT_SECS` - Default: 10
    pub fn from_env() -> Result<Self, HaError> {
        let base_url = env::var("HA_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let token = env::var("SUPERVISOR_TOKEN").unwrap_or_default();

        let timeout_secs = env::var("HA_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u64>()
            .map_err(|e| HaError::Config(format!("Invalid HA_TIMEOUT_SECS: {}", e)))?;

        Ok(Self::new(base_url, token).with_timeout(Duration::from_secs(timeout_secs)))
    }

    /// Builder method to set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether a token was configured.
    pub fn has_token(&self) -> bool {
        !self.token.expose_secret().is_empty()
    }

    pub(crate) fn token(&self) -> &str {
        self.token.expose_secret()
    }

    /// Get the API root URL (used as a connectivity check).
    pub fn api_url(&self) -> String {
        format!("{}/api/", self.base_url)
    }

    /// Get the state endpoint URL for an entity.
    pub fn state_url(&self, entity_id: &str) -> String {
        format!(
            "{}/api/states/{}",
            self.base_url,
            urlencoding::encode(entity_id)
        )
    }

    /// Get the event endpoint URL for an event type.
    pub fn event_url(&self, event_type: &str) -> String {
        format!(
            "{}/api/events/{}",
            self.base_url,
            urlencoding::encode(event_type)
        )
    }
}

impl Default for HaConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL, "")
    }
}
