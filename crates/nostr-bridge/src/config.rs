use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nostr_sdk::prelude::*;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use ::url::Url;

use crate::envelope::{ChunkReassembler, ConversationKey, DEFAULT_MAX_GROUPS};
use crate::events::KIND_APP_DATA;
use crate::handlers::validate_prefix;
use crate::relay::{ReconnectConfig, RelaySettings};
use crate::Error;

/// Options file written by the add-on supervisor.
pub const ADDON_OPTIONS_PATH: &str = "/data/options.json";
/// Fallback for local development.
pub const LOCAL_OPTIONS_PATH: &str = "options.local.json";
/// Overrides the options file location.
pub const OPTIONS_PATH_ENV: &str = "BRIDGE_OPTIONS_PATH";

pub const MIN_POLL_INTERVAL_SECS: u64 = 10;

fn default_relays() -> Vec<String> {
    vec!["wss://relay.damus.io".to_string()]
}

fn default_event_kinds() -> Vec<u16> {
    vec![KIND_APP_DATA]
}

fn default_poll_interval() -> u64 {
    300
}

fn default_entity_prefix() -> String {
    "nostr".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_reconnect_initial_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_delay_secs() -> u64 {
    60
}

fn default_chunk_group_ttl_secs() -> u64 {
    120
}

fn default_seen_capacity() -> usize {
    10_000
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

/// Bridge options, as found in the add-on options file.
#[derive(Clone, Deserialize)]
pub struct BridgeConfig {
    /// Bridge secret key, hex or nsec.
    #[serde(deserialize_with = "deserialize_secret")]
    pub nostr_private_key: SecretString,
    /// Publisher public key, hex or npub.
    pub publisher_public_key: String,
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,
    #[serde(default = "default_event_kinds")]
    pub event_kinds: Vec<u16>,
    /// Seconds between fallback polls.
    #[serde(default = "default_poll_interval")]
    pub poll_fallback_interval: u64,
    #[serde(default = "default_entity_prefix")]
    pub entity_prefix: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,
    #[serde(default = "default_chunk_group_ttl_secs")]
    pub chunk_group_ttl_secs: u64,
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("nostr_private_key", &"[REDACTED]")
            .field("publisher_public_key", &self.publisher_public_key)
            .field("relays", &self.relays)
            .field("event_kinds", &self.event_kinds)
            .field("poll_fallback_interval", &self.poll_fallback_interval)
            .field("entity_prefix", &self.entity_prefix)
            .field("log_level", &self.log_level)
            .finish_non_exhaustive()
    }
}

impl BridgeConfig {
    /// Load from `BRIDGE_OPTIONS_PATH`, else the add-on path, else the local file.
    pub fn load() -> Result<Self, Error> {
        let path = match env::var(OPTIONS_PATH_ENV) {
            Ok(path) => PathBuf::from(path),
            Err(_) => [ADDON_OPTIONS_PATH, LOCAL_OPTIONS_PATH]
                .iter()
                .map(PathBuf::from)
                .find(|path| path.exists())
                .ok_or_else(|| {
                    Error::Config(format!(
                        "no options file found at {} or {}",
                        ADDON_OPTIONS_PATH, LOCAL_OPTIONS_PATH
                    ))
                })?,
        };
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.nostr_private_key.expose_secret().trim().is_empty() {
            return Err(Error::Config("nostr_private_key is required".to_string()));
        }
        if self.publisher_public_key.trim().is_empty() {
            return Err(Error::Config("publisher_public_key is required".to_string()));
        }
        if self.relays.is_empty() {
            return Err(Error::Config("at least one relay is required".to_string()));
        }
        for relay in &self.relays {
            let url = Url::parse(relay)?;
            if url.scheme() != "wss" && url.scheme() != "ws" {
                return Err(Error::Config(format!("relay {} must use ws:// or wss://", relay)));
            }
        }
        if self.event_kinds.is_empty() {
            return Err(Error::Config("event_kinds must not be empty".to_string()));
        }
        if self.poll_fallback_interval < MIN_POLL_INTERVAL_SECS {
            return Err(Error::Config(format!(
                "poll_fallback_interval must be at least {} seconds",
                MIN_POLL_INTERVAL_SECS
            )));
        }
        validate_prefix(&self.entity_prefix)
            .map_err(|e| Error::Config(format!("entity_prefix: {}", e)))?;
        if self.reconnect_initial_delay_ms == 0 {
            return Err(Error::Config("reconnect_initial_delay_ms must be positive".to_string()));
        }
        if self.reconnect_max_delay_secs.saturating_mul(1000) < self.reconnect_initial_delay_ms {
            return Err(Error::Config(
                "reconnect_max_delay_secs must not be below the initial delay".to_string(),
            ));
        }
        if self.chunk_group_ttl_secs == 0 || self.seen_capacity == 0 {
            return Err(Error::Config(
                "chunk_group_ttl_secs and seen_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_fallback_interval)
    }

    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            max_delay: Duration::from_secs(self.reconnect_max_delay_secs),
            ..ReconnectConfig::default()
        }
    }

    pub fn chunk_reassembler(&self) -> ChunkReassembler {
        ChunkReassembler::new(Duration::from_secs(self.chunk_group_ttl_secs), DEFAULT_MAX_GROUPS)
    }
}

/// Long-lived state derived once from [`BridgeConfig`] at startup.
pub struct BridgeContext {
    pub keys: Keys,
    pub publisher: PublicKey,
    pub conversation_key: ConversationKey,
    pub relays: Vec<String>,
    pub kinds: Vec<u16>,
    pub entity_prefix: String,
}

impl BridgeContext {
    pub fn from_config(config: &BridgeConfig) -> Result<Self, Error> {
        config.validate()?;
        let keys = Keys::parse(config.nostr_private_key.expose_secret().trim())?;
        let publisher = PublicKey::parse(config.publisher_public_key.trim())?;
        let conversation_key = ConversationKey::derive(keys.secret_key(), &publisher)?;

        Ok(Self {
            keys,
            publisher,
            conversation_key,
            relays: config.relays.clone(),
            kinds: config.event_kinds.clone(),
            entity_prefix: config.entity_prefix.clone(),
        })
    }

    pub fn relay_settings(&self, config: &BridgeConfig) -> RelaySettings {
        let mut settings =
            RelaySettings::new(self.relays.clone(), self.publisher, self.kinds.clone());
        settings.poll_interval = config.poll_interval();
        settings.reconnect = config.reconnect();
        settings.seen_capacity = config.seen_capacity;
        settings
    }
}

impl fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeContext")
            .field("bridge_public_key", &self.keys.public_key().to_hex())
            .field("publisher", &self.publisher.to_hex())
            .field("relays", &self.relays)
            .field("kinds", &self.kinds)
            .field("entity_prefix", &self.entity_prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal(bridge: &Keys, publisher: &Keys) -> serde_json::Value {
        json!({
            "nostr_private_key": bridge.secret_key().to_secret_hex(),
            "publisher_public_key": publisher.public_key().to_hex(),
        })
    }

    #[test]
    fn test_defaults_apply() {
        let (bridge, publisher) = (Keys::generate(), Keys::generate());
        let config = BridgeConfig::from_json(&minimal(&bridge, &publisher).to_string()).unwrap();

        assert_eq!(config.relays, vec!["wss://relay.damus.io"]);
        assert_eq!(config.event_kinds, vec![30078]);
        assert_eq!(config.poll_fallback_interval, 300);
        assert_eq!(config.entity_prefix, "nostr");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.seen_capacity, 10_000);
        assert_eq!(config.reconnect().initial_delay, Duration::from_millis(500));
        assert_eq!(config.reconnect().max_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let (bridge, publisher) = (Keys::generate(), Keys::generate());
        let cases = [
            ("poll_fallback_interval", json!(5)),
            ("entity_prefix", json!("Bad-Prefix")),
            ("relays", json!([])),
            ("relays", json!(["https://relay.example"])),
            ("event_kinds", json!([])),
            ("seen_capacity", json!(0)),
        ];
        for (field, value) in cases {
            let mut options = minimal(&bridge, &publisher);
            options[field] = value;
            assert!(
                BridgeConfig::from_json(&options.to_string()).is_err(),
                "{} should be rejected",
                field
            );
        }

        assert!(BridgeConfig::from_json(r#"{"publisher_public_key": "x"}"#).is_err());
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let (bridge, publisher) = (Keys::generate(), Keys::generate());
        let config = BridgeConfig::from_json(&minimal(&bridge, &publisher).to_string()).unwrap();
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains(&bridge.secret_key().to_secret_hex()));
    }

    #[test]
    fn test_context_accepts_bech32_keys() {
        let (bridge, publisher) = (Keys::generate(), Keys::generate());
        let options = json!({
            "nostr_private_key": bridge.secret_key().to_bech32().unwrap(),
            "publisher_public_key": publisher.public_key().to_bech32().unwrap(),
            "entity_prefix": "home",
        });
        let config = BridgeConfig::from_json(&options.to_string()).unwrap();
        let context = BridgeContext::from_config(&config).unwrap();

        assert_eq!(context.publisher, publisher.public_key());
        assert_eq!(context.keys.public_key(), bridge.public_key());
        let settings = context.relay_settings(&config);
        assert_eq!(settings.author, publisher.public_key());
        assert_eq!(settings.poll_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_context_rejects_bad_key() {
        let publisher = Keys::generate();
        let options = json!({
            "nostr_private_key": "not-a-key",
            "publisher_public_key": publisher.public_key().to_hex(),
        });
        let config = BridgeConfig::from_json(&options.to_string()).unwrap();
        assert!(matches!(
            BridgeContext::from_config(&config),
            Err(Error::NostrKey(_))
        ));
    }

    #[test]
    fn test_from_file_reports_missing_path() {
        let err = BridgeConfig::from_file(Path::new("/nonexistent/options.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
