//! Input validation for values that end up in entity ids, attributes and logs.

use thiserror::Error;
use url::Url;

/// Maximum length of a payload-supplied entity id.
pub const MAX_ENTITY_ID_LENGTH: usize = 64;

/// Maximum length of the configured entity prefix.
pub const MAX_PREFIX_LENGTH: usize = 32;

/// Maximum number of characters of untrusted text written to logs.
pub const MAX_LOG_PREVIEW: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid entity id {0:?}: expected [a-z0-9_]{{1,64}}")]
    EntityId(String),
    #[error("invalid entity prefix {0:?}: expected [a-z0-9_]{{1,32}}")]
    Prefix(String),
    #[error("invalid url {0:?}: only http and https with a host are allowed")]
    Url(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("unknown payload type: {0}")]
    UnknownType(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

fn is_identifier(value: &str, max: usize) -> bool {
    !value.is_empty()
        && value.len() <= max
        && value
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Validate a payload-supplied entity id against `[a-z0-9_]{1,64}`.
pub fn validate_entity_id(id: &str) -> Result<(), ValidationError> {
    if is_identifier(id, MAX_ENTITY_ID_LENGTH) {
        Ok(())
    } else {
        Err(ValidationError::EntityId(sanitize_for_log(id)))
    }
}

/// Validate the configured entity prefix against `[a-z0-9_]{1,32}`.
pub fn validate_prefix(prefix: &str) -> Result<(), ValidationError> {
    if is_identifier(prefix, MAX_PREFIX_LENGTH) {
        Ok(())
    } else {
        Err(ValidationError::Prefix(sanitize_for_log(prefix)))
    }
}

/// Accept only absolute `http`/`https` URLs that name a host.
pub fn validate_url(value: &str) -> Result<Url, ValidationError> {
    let reject = || ValidationError::Url(sanitize_for_log(value));
    let url = Url::parse(value).map_err(|_| reject())?;
    match url.scheme() {
        "http" | "https" if url.host_str().map(|h| !h.is_empty()).unwrap_or(false) => Ok(url),
        _ => Err(reject()),
    }
}

/// Strip control characters (CR/LF included) and truncate for logging.
pub fn sanitize_for_log(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control())
        .take(MAX_LOG_PREVIEW)
        .collect()
}

/// `outdoor_temperature` -> `Outdoor Temperature`
pub fn friendly_name(id: &str) -> String {
    id.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
