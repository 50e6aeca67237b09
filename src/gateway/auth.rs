//! Shared API key check with optional loopback bypass.

use sha2::{Digest, Sha256};

use crate::config::AuthConfig;
use crate::guard::is_loopback;

/// Authentication policy applied to stream and management clients.
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    key_digest: Option<[u8; 32]>,
    allow_loopback: bool,
}

impl AuthPolicy {
    /// Build from the `[auth]` section (with the runtime-loaded key).
    #[must_use]
    pub fn from_config(auth: &AuthConfig) -> Self {
        Self::new(auth.api_key.as_deref(), auth.allow_loopback_without_key)
    }

    /// Build from an optional key and the loopback flag.
    #[must_use]
    pub fn new(api_key: Option<&str>, allow_loopback: bool) -> Self {
        Self {
            key_digest: api_key.filter(|k| !k.is_empty()).map(digest),
            allow_loopback,
        }
    }

    /// Whether `peer` must present the key.
    #[must_use]
    pub fn requires_key(&self, peer: &str) -> bool {
        !(self.allow_loopback && is_loopback(peer))
    }

    /// Whether a key is configured at all.
    #[must_use]
    pub fn has_key(&self) -> bool {
        self.key_digest.is_some()
    }

    /// Compare `provided` against the configured key in constant time over
    /// SHA-256 digests. Always `false` when no key is configured.
    #[must_use]
    pub fn verify(&self, provided: &str) -> bool {
        let Some(expected) = &self.key_digest else {
            return false;
        };
        let actual = digest(provided);
        expected
            .iter()
            .zip(actual.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Admit `peer` given an optional presented key.
    #[must_use]
    pub fn admits(&self, peer: &str, provided: Option<&str>) -> bool {
        !self.requires_key(peer) || provided.is_some_and(|key| self.verify(key))
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}
