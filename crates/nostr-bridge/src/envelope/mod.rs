//! Authenticated encryption of event content.
//!
//! A single envelope is `base64(0x02 ‖ nonce[24] ‖ ciphertext ‖ mac[32])`.
//! Per-message keys are HKDF-expanded from the [`ConversationKey`] using the
//! nonce; the body is XChaCha20 over a length-prefixed padded plaintext and the
//! MAC is HMAC-SHA256 over `version ‖ nonce ‖ ciphertext`.
//!
//! Plaintexts over 65535 bytes travel as a chunk wrapper,
//! `{"_chunks": [envelope, ...]}`, where every chunk's plaintext starts with a
//! `group_id ‖ index ‖ total` header.

mod chunks;
mod keys;

pub use chunks::{
    Chunk, ChunkGroup, ChunkReassembler, GroupId, CHUNK_HEADER_LEN, DEFAULT_GROUP_TTL,
    DEFAULT_MAX_GROUPS,
};
pub use keys::ConversationKey;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{Key, XChaCha20, XNonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::handlers::sanitize_for_log;

type HmacSha256 = Hmac<Sha256>;

pub const VERSION: u8 = 2;
pub const MAX_PLAINTEXT_LEN: usize = 65535;
/// Chunk data size used when a plaintext must be split.
pub const DEFAULT_CHUNK_LEN: usize = 32 * 1024;

const NONCE_LEN: usize = 24;
const MAC_LEN: usize = 32;
const MIN_PADDED_LEN: usize = 32;
const MIN_ENVELOPE_LEN: usize = 1 + NONCE_LEN + 2 + MIN_PADDED_LEN + MAC_LEN;
const MAX_ENVELOPE_LEN: usize = 1 + NONCE_LEN + 2 + 65536 + MAC_LEN;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u8),
    #[error("invalid envelope length: {0}")]
    InvalidLength(usize),
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("authentication failed")]
    AuthTag,
    #[error("invalid padding")]
    InvalidPadding,
    #[error("plaintext length {0} outside 1..=65535")]
    PlaintextLength(usize),
    #[error("malformed chunk wrapper: {0}")]
    MalformedWrapper(String),
    #[error("invalid chunk header")]
    InvalidChunkHeader,
    #[error("chunk {index} out of sequence, expected {expected}")]
    OutOfOrder { index: u16, expected: usize },
    #[error("chunk group incomplete: {received} of {total}")]
    MissingChunks { received: usize, total: usize },
    #[error("chunk belongs to a different group")]
    GroupMismatch,
    #[error("conflicting duplicate of chunk {0}")]
    ConflictingChunk(u16),
    #[error("too many chunks: {0}")]
    TooManyChunks(usize),
    #[error("plaintext is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("key derivation failed")]
    KeyDerivation,
}

#[derive(Serialize, Deserialize)]
struct ChunkWrapper {
    #[serde(rename = "_chunks")]
    chunks: Vec<String>,
}

/// Result of opening event content without holding any cross-event state.
#[derive(Debug)]
pub enum Opened {
    Message(Vec<u8>),
    Chunks(Vec<Chunk>),
}

/// Encrypt `plaintext`, splitting into a chunk wrapper only when it exceeds
/// the single-envelope limit.
pub fn encrypt(plaintext: &str, key: &ConversationKey) -> Result<String, EnvelopeError> {
    if plaintext.len() <= MAX_PLAINTEXT_LEN {
        seal(plaintext.as_bytes(), key)
    } else {
        encrypt_chunked(plaintext, key, DEFAULT_CHUNK_LEN)
    }
}

/// Always produce a chunk wrapper, splitting the bytes every `chunk_len`.
pub fn encrypt_chunked(
    plaintext: &str,
    key: &ConversationKey,
    chunk_len: usize,
) -> Result<String, EnvelopeError> {
    let envelopes = seal_chunks(plaintext.as_bytes(), key, chunk_len)?;
    Ok(wrap_chunks(&envelopes))
}

/// Seal every chunk of one group. Chunks may be wrapped together or split
/// across several wrappers.
pub fn seal_chunks(
    bytes: &[u8],
    key: &ConversationKey,
    chunk_len: usize,
) -> Result<Vec<String>, EnvelopeError> {
    if bytes.is_empty() {
        return Err(EnvelopeError::PlaintextLength(0));
    }
    let chunk_len = chunk_len.clamp(1, MAX_PLAINTEXT_LEN - CHUNK_HEADER_LEN);
    let parts: Vec<&[u8]> = bytes.chunks(chunk_len).collect();
    let total = u16::try_from(parts.len()).map_err(|_| EnvelopeError::TooManyChunks(parts.len()))?;
    let group_id = chunks::new_group_id();

    parts
        .into_iter()
        .enumerate()
        .map(|(index, data)| {
            let chunk = Chunk {
                group_id,
                index: index as u16,
                total,
                data: data.to_vec(),
            };
            seal(&chunk.encode(), key)
        })
        .collect()
}

pub fn wrap_chunks(envelopes: &[String]) -> String {
    serde_json::json!({ "_chunks": envelopes }).to_string()
}

/// Decrypt content that carries a complete message, single or chunked.
pub fn decrypt(content: &str, key: &ConversationKey) -> Result<String, EnvelopeError> {
    let bytes = match open(content, key)? {
        Opened::Message(bytes) => bytes,
        Opened::Chunks(chunks) => ChunkGroup::assemble(chunks)?,
    };
    Ok(String::from_utf8(bytes)?)
}

/// Authenticate and decrypt every envelope in `content`.
pub fn open(content: &str, key: &ConversationKey) -> Result<Opened, EnvelopeError> {
    if !content.trim_start().starts_with('{') {
        return open_envelope(content, key).map(Opened::Message);
    }

    let wrapper: ChunkWrapper = serde_json::from_str(content)
        .map_err(|e| EnvelopeError::MalformedWrapper(sanitize_for_log(&e.to_string())))?;
    if wrapper.chunks.is_empty() {
        return Err(EnvelopeError::MalformedWrapper("no chunks".to_string()));
    }
    let chunks = wrapper
        .chunks
        .iter()
        .map(|envelope| open_envelope(envelope, key).and_then(|bytes| Chunk::decode(&bytes)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Opened::Chunks(chunks))
}

fn seal(plaintext: &[u8], key: &ConversationKey) -> Result<String, EnvelopeError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let keys = MessageKeys::derive(key, &nonce)?;
    let mut body = pad(plaintext)?;
    keys.cipher(&nonce).apply_keystream(&mut body);
    let tag = keys.mac(&nonce, &body)?.finalize().into_bytes();

    let mut out = Vec::with_capacity(1 + NONCE_LEN + body.len() + MAC_LEN);
    out.push(VERSION);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&body);
    out.extend_from_slice(&tag);
    Ok(STANDARD.encode(out))
}

fn open_envelope(envelope: &str, key: &ConversationKey) -> Result<Vec<u8>, EnvelopeError> {
    let data = STANDARD.decode(envelope.trim())?;
    match data.first() {
        None => return Err(EnvelopeError::InvalidLength(0)),
        Some(&version) if version != VERSION => {
            return Err(EnvelopeError::UnsupportedVersion(version))
        }
        Some(_) => {}
    }
    if data.len() < MIN_ENVELOPE_LEN || data.len() > MAX_ENVELOPE_LEN {
        return Err(EnvelopeError::InvalidLength(data.len()));
    }

    let (nonce, rest) = data[1..].split_at(NONCE_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - MAC_LEN);

    let keys = MessageKeys::derive(key, nonce)?;
    keys.mac(nonce, ciphertext)?
        .verify_slice(tag)
        .map_err(|_| EnvelopeError::AuthTag)?;

    let mut body = ciphertext.to_vec();
    keys.cipher(nonce).apply_keystream(&mut body);
    unpad(&body)
}

struct MessageKeys {
    cipher_key: Zeroizing<[u8; 32]>,
    mac_key: Zeroizing<[u8; 32]>,
}

impl MessageKeys {
    fn derive(key: &ConversationKey, nonce: &[u8]) -> Result<Self, EnvelopeError> {
        let hkdf =
            Hkdf::<Sha256>::from_prk(key.as_bytes()).map_err(|_| EnvelopeError::KeyDerivation)?;
        let mut okm = Zeroizing::new([0u8; 64]);
        hkdf.expand(nonce, &mut okm[..])
            .map_err(|_| EnvelopeError::KeyDerivation)?;

        let mut cipher_key = Zeroizing::new([0u8; 32]);
        let mut mac_key = Zeroizing::new([0u8; 32]);
        cipher_key.copy_from_slice(&okm[..32]);
        mac_key.copy_from_slice(&okm[32..]);
        Ok(Self {
            cipher_key,
            mac_key,
        })
    }

    fn cipher(&self, nonce: &[u8]) -> XChaCha20 {
        XChaCha20::new(Key::from_slice(&self.cipher_key[..]), XNonce::from_slice(nonce))
    }

    fn mac(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<HmacSha256, EnvelopeError> {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key[..])
            .map_err(|_| EnvelopeError::KeyDerivation)?;
        mac.update(&[VERSION]);
        mac.update(nonce);
        mac.update(ciphertext);
        Ok(mac)
    }
}

pub(crate) fn padded_len(unpadded: usize) -> usize {
    if unpadded <= MIN_PADDED_LEN {
        return MIN_PADDED_LEN;
    }
    let next_power = 1usize << (usize::BITS - (unpadded - 1).leading_zeros());
    let step = if next_power <= 256 { 32 } else { next_power / 8 };
    step * ((unpadded - 1) / step + 1)
}

fn pad(plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let len = plaintext.len();
    if len == 0 || len > MAX_PLAINTEXT_LEN {
        return Err(EnvelopeError::PlaintextLength(len));
    }
    let mut out = Vec::with_capacity(2 + padded_len(len));
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(plaintext);
    out.resize(2 + padded_len(len), 0);
    Ok(out)
}

fn unpad(padded: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    if padded.len() < 2 {
        return Err(EnvelopeError::InvalidPadding);
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len == 0 || padded.len() != 2 + padded_len(len) {
        return Err(EnvelopeError::InvalidPadding);
    }
    Ok(padded[2..2 + len].to_vec())
}
