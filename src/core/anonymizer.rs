//! Keyed, deterministic client-identifier anonymization.
//!
//! Identifiers are replaced with a truncated BLAKE3 keyed hash. The same key
//! always maps an identifier to the same token; the token cannot be reversed
//! without brute-forcing the address space and the key. This is best-effort
//! pseudonymization, not strong anonymity.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::config::ANON_TOKEN_BYTES;

const KEY_CONTEXT: &str = "netpulse 2024 client identifier anonymization";

/// Where the anonymization key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Explicit,
    Environment,
    Random,
}

/// Replaces client identifiers with stable opaque tokens.
#[derive(Clone)]
pub struct Anonymizer {
    key: [u8; 32],
}

impl std::fmt::Debug for Anonymizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Anonymizer").finish_non_exhaustive()
    }
}

impl Anonymizer {
    /// Derive a hashing key from arbitrary key material.
    pub fn new(key_material: &[u8]) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, key_material),
        }
    }

    /// Pick key material by precedence: explicit value, then environment, then random.
    pub fn from_sources(explicit: Option<&str>, env: Option<&str>) -> (Self, KeySource) {
        if let Some(key) = explicit.filter(|k| !k.is_empty()) {
            return (Self::new(key.as_bytes()), KeySource::Explicit);
        }
        if let Some(key) = env.filter(|k| !k.is_empty()) {
            return (Self::new(key.as_bytes()), KeySource::Environment);
        }
        let random: [u8; 32] = rand::random();
        (Self::new(&random), KeySource::Random)
    }

    /// Token for `client_id`.
    pub fn anonymize(&self, client_id: &str) -> String {
        let hash = blake3::keyed_hash(&self.key, client_id.as_bytes());
        URL_SAFE_NO_PAD.encode(&hash.as_bytes()[..ANON_TOKEN_BYTES])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_same_token() {
        let a = Anonymizer::new(b"secret");
        let b = Anonymizer::new(b"secret");
        assert_eq!(a.anonymize("10.0.0.2"), a.anonymize("10.0.0.2"));
        assert_eq!(a.anonymize("10.0.0.2"), b.anonymize("10.0.0.2"));
    }

    #[test]
    fn test_different_keys_different_tokens() {
        let a = Anonymizer::new(b"secret-one");
        let b = Anonymizer::new(b"secret-two");
        assert_ne!(a.anonymize("10.0.0.2"), b.anonymize("10.0.0.2"));
    }

    #[test]
    fn test_token_differs_from_raw_identifier() {
        let a = Anonymizer::new(b"k");
        for ip in ["10.0.0.2", "192.168.1.1", "::1", "fe80::1"] {
            assert_ne!(a.anonymize(ip), ip);
        }
    }

    #[test]
    fn test_distinct_identifiers_get_distinct_tokens() {
        let a = Anonymizer::new(b"k");
        assert_ne!(a.anonymize("10.0.0.2"), a.anonymize("10.0.0.3"));
    }

    #[test]
    fn test_token_length_matches_configured_bytes() {
        let token = Anonymizer::new(b"k").anonymize("10.0.0.2");
        // base64 without padding: 4 chars per 3 bytes.
        assert_eq!(token.len(), (ANON_TOKEN_BYTES * 4).div_ceil(3));
    }

    #[test]
    fn test_key_precedence_explicit_over_env() {
        let (anon, source) = Anonymizer::from_sources(Some("cli"), Some("env"));
        assert_eq!(source, KeySource::Explicit);
        assert_eq!(anon.anonymize("x"), Anonymizer::new(b"cli").anonymize("x"));
    }

    #[test]
    fn test_key_precedence_env_over_random() {
        let (anon, source) = Anonymizer::from_sources(None, Some("env"));
        assert_eq!(source, KeySource::Environment);
        assert_eq!(anon.anonymize("x"), Anonymizer::new(b"env").anonymize("x"));
    }

    #[test]
    fn test_random_key_when_nothing_configured() {
        let (first, source) = Anonymizer::from_sources(None, Some(""));
        let (second, _) = Anonymizer::from_sources(None, None);
        assert_eq!(source, KeySource::Random);
        assert_ne!(first.anonymize("x"), second.anonymize("x"));
    }
}
