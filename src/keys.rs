//! API key generation and hashing
//!
//! Keys are shown to their owner once at generation time. Only the SHA-256
//! digest is ever stored or compared.

use rand::RngExt;
use sha2::{Digest, Sha256};

/// Prefix of every generated key
pub const KEY_PREFIX: &str = "gw_live_";

/// Generate a new API key: `gw_live_` followed by 32 random bytes in hex
#[must_use]
pub fn generate_api_key() -> String {
    let random_bytes: [u8; 32] = rand::rng().random();
    format!("{KEY_PREFIX}{}", hex::encode(random_bytes))
}

/// One-way hash of an API key (lowercase SHA-256 hex)
#[must_use]
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_shape() {
        let key = generate_api_key();
        assert!(key.starts_with(KEY_PREFIX));
        let random = &key[KEY_PREFIX.len()..];
        assert_eq!(random.len(), 64);
        assert!(random.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(generate_api_key(), generate_api_key());
    }

    #[test]
    fn test_hash_is_stable_sha256_hex() {
        // echo -n "abc" | sha256sum
        assert_eq!(
            hash_api_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(hash_api_key("gw_live_x"), hash_api_key("gw_live_x"));
    }
}
