//! API keys identify merchants to their own backends: settlement callbacks
//! are signed with a key derived from the user's most recent API key, and the
//! merchant verifies by re-deriving it from the cleartext only they hold.

use crate::hex::Hex;
use crate::user;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::Digest;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Id(pub i32);

/// A stored API key. Only the hash survives; the cleartext is handed to the
/// user once at creation.
#[derive(Debug)]
pub struct ApiKey {
    pub id: Id,
    pub user_id: user::Id,
    pub key_hash: Vec<u8>,
    pub created: DateTime<Utc>,
}

pub(crate) struct GeneratedKey {
    pub cleartext: Hex,
    pub key_hash: Vec<u8>,
}

impl GeneratedKey {
    /// Generates a random 128-bit key. SHA-256 without salting is enough for
    /// storage because the keys have full entropy to begin with.
    pub(crate) fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let cleartext = Hex::encode(&bytes);
        let key_hash = hash_key(cleartext.as_str());
        Self {
            cleartext,
            key_hash,
        }
    }
}

/// The stored form of a cleartext key, also the HMAC key for callbacks.
pub fn hash_key(cleartext: &str) -> Vec<u8> {
    let mut hasher = sha2::Sha256::new();
    hasher.update(cleartext.as_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_hash_matches_cleartext() {
        let generated = GeneratedKey::generate();
        assert_eq!(generated.cleartext.as_str().len(), 32);
        assert_eq!(generated.key_hash, hash_key(generated.cleartext.as_str()));
    }

    #[test]
    fn hash_is_sha256_sized() {
        assert_eq!(hash_key("anything").len(), 32);
    }
}
