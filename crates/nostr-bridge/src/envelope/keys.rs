use std::fmt;

use hkdf::Hkdf;
use nostr_sdk::prelude::*;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::Error;

const CONVERSATION_SALT: &[u8] = b"nip44-v2";

/// Long-lived key shared by the bridge and the publisher.
///
/// Derived once at startup from the ECDH secret of the two key pairs; both
/// sides derive the same value. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ConversationKey([u8; 32]);

impl ConversationKey {
    pub fn derive(secret_key: &SecretKey, public_key: &PublicKey) -> Result<Self, Error> {
        let mut shared = nostr_sdk::nostr::util::generate_shared_key(secret_key, public_key)
            .map_err(|e| Error::KeyExchange(e.to_string()))?;
        let key = Self::from_shared_secret(&shared);
        shared.zeroize();
        Ok(key)
    }

    /// HKDF-extract over an ECDH x-coordinate.
    pub fn from_shared_secret(shared: &[u8; 32]) -> Self {
        let (prk, _) = Hkdf::<Sha256>::extract(Some(CONVERSATION_SALT), shared);
        let mut key = [0u8; 32];
        key.copy_from_slice(&prk);
        Self(key)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConversationKey(..)")
    }
}
