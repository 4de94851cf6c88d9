//! Cache key derivation.
//!
//! A [`CacheKey`] identifies one query entry. The default derivation is a
//! stable structural serialization of the arguments (object keys sorted)
//! wrapped in the endpoint name, e.g. `getPost({"id":1})`.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::payload::Payload;

/// Derived identity of a query entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of one logical request (query or mutation call).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Custom per-endpoint key derivation.
pub type KeyFn = Arc<dyn Fn(&str, &Payload) -> CacheKey + Send + Sync>;

/// Strategy used to turn `(endpoint, args)` into a [`CacheKey`].
#[derive(Clone, Default)]
pub enum KeyStrategy {
    /// `endpoint(<sorted json>)`.
    #[default]
    Structural,
    /// `endpoint#<sha256 of sorted json>`, for large argument trees.
    Digest,
    Custom(KeyFn),
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::Structural => f.write_str("Structural"),
            KeyStrategy::Digest => f.write_str("Digest"),
            KeyStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl KeyStrategy {
    pub fn derive(&self, endpoint: &str, args: &Payload) -> CacheKey {
        match self {
            KeyStrategy::Structural => derive_key(endpoint, args),
            KeyStrategy::Digest => digest_key(endpoint, args),
            KeyStrategy::Custom(f) => f(endpoint, args),
        }
    }
}

/// Default derivation: endpoint name plus the stable serialization of `args`.
pub fn derive_key(endpoint: &str, args: &Payload) -> CacheKey {
    CacheKey::new(format!("{endpoint}({})", stable_json(args)))
}

/// Fixed-length derivation: endpoint name plus a hex SHA-256 of the args.
pub fn digest_key(endpoint: &str, args: &Payload) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(stable_json(args).as_bytes());
    CacheKey::new(format!("{endpoint}#{}", hex::encode(hasher.finalize())))
}

// Payload objects are BTreeMaps and serde_json's map is sorted by default, so
// the rendered form is independent of insertion order.
fn stable_json(args: &Payload) -> String {
    args.to_json().to_string()
}
