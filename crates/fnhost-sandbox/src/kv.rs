//! Namespaced key/value store with TTL expiry.
//!
//! This is the only state that may outlive a single invocation. Entries are
//! partitioned by namespace (the engine passes the function's project id),
//! and a namespace never observes another namespace's keys.
//!
//! # Concurrency contract
//!
//! One mutex serializes every operation on a store. Concurrent writers to the
//! same key race and the last writer wins; no ordering is guaranteed between
//! concurrent invocations.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::Value;

use crate::KvCapability;

/// Key validation regex: alphanumerics plus `_`, `-`, `.`, `:`, 1–256 chars.
static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_\-.:]{1,256}$").expect("static regex is valid"));

/// Limits applied by a [`KvStore`].
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Maximum number of live keys across all namespaces (default: 1024).
    pub max_keys: usize,
    /// Maximum size of a single JSON-serialized value in bytes (default: 1 MiB).
    pub max_value_size: usize,
    /// Maximum combined size of all values in bytes (default: 32 MiB).
    pub max_total_size: usize,
    /// TTL applied when a caller does not specify one (default: 1 hour).
    pub default_ttl: Duration,
    /// Hard ceiling on caller-supplied TTLs (default: 24 hours).
    pub max_ttl: Duration,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            max_keys: 1024,
            max_value_size: 1024 * 1024,
            max_total_size: 32 * 1024 * 1024,
            default_ttl: Duration::from_secs(3600),
            max_ttl: Duration::from_secs(86400),
        }
    }
}

/// Errors returned by key/value operations.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The store already holds the maximum number of keys.
    #[error("kv key limit exceeded (max {max} keys)")]
    KeyLimitExceeded {
        /// Configured maximum.
        max: usize,
    },
    /// The serialized value exceeds the per-value size limit.
    #[error("kv value too large ({size} bytes, max {max} bytes)")]
    ValueTooLarge {
        /// Actual size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
    /// Adding the value would push the total size past the limit.
    #[error("kv total size exceeded ({total} bytes, max {max} bytes)")]
    TotalSizeExceeded {
        /// Projected total.
        total: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The key exceeds 256 characters.
    #[error("kv key too long ({len} chars, max 256)")]
    KeyTooLong {
        /// Actual length.
        len: usize,
    },
    /// The key contains characters outside `[a-zA-Z0-9_\-.:]`.
    #[error("kv key contains invalid characters")]
    InvalidKey,
    /// The caller-supplied TTL is zero or exceeds `max_ttl`.
    #[error("kv TTL out of range ({requested_secs}s, max {max_secs}s)")]
    TtlOutOfRange {
        /// Requested TTL in seconds.
        requested_secs: u64,
        /// Configured maximum TTL in seconds.
        max_secs: u64,
    },
    /// The value could not be serialized.
    #[error("kv value is not serializable: {0}")]
    Serialization(#[from] serde_json::Error),
}

struct KvEntry {
    value: Value,
    size_bytes: usize,
    created_at: Instant,
    ttl: Duration,
}

impl KvEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

#[derive(Default)]
struct KvState {
    entries: HashMap<(String, String), KvEntry>,
    total_size: usize,
}

impl KvState {
    fn reap_expired(&mut self) -> usize {
        let before = self.entries.len();
        let mut freed = 0;
        self.entries.retain(|_, entry| {
            if entry.is_expired() {
                freed += entry.size_bytes;
                false
            } else {
                true
            }
        });
        self.total_size -= freed;
        before - self.entries.len()
    }
}

/// Validate a key, returning an appropriate error on failure.
pub(crate) fn validate_key(key: &str) -> Result<(), KvError> {
    if key.len() > 256 {
        return Err(KvError::KeyTooLong { len: key.len() });
    }
    if !KEY_RE.is_match(key) {
        return Err(KvError::InvalidKey);
    }
    Ok(())
}

/// Shared, namespaced key/value store.
pub struct KvStore {
    state: Mutex<KvState>,
    config: KvConfig,
}

impl KvStore {
    /// Create an empty store with the given limits.
    pub fn new(config: KvConfig) -> Self {
        Self {
            state: Mutex::new(KvState::default()),
            config,
        }
    }

    /// The limits this store enforces.
    pub fn config(&self) -> &KvConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, KvState> {
        // Every mutation leaves the state consistent before it can panic,
        // so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a value under `key` in `namespace`, replacing any existing entry.
    pub fn put(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        validate_key(key)?;

        let value_size = serde_json::to_vec(&value)?.len();
        if value_size > self.config.max_value_size {
            return Err(KvError::ValueTooLarge {
                size: value_size,
                max: self.config.max_value_size,
            });
        }

        let ttl = match ttl {
            Some(d) if d.is_zero() || d > self.config.max_ttl => {
                return Err(KvError::TtlOutOfRange {
                    requested_secs: d.as_secs(),
                    max_secs: self.config.max_ttl.as_secs(),
                });
            }
            Some(d) => d,
            None => self.config.default_ttl,
        };

        let mut state = self.lock();
        let id = (namespace.to_string(), key.to_string());
        let old_size = state.entries.get(&id).map(|e| e.size_bytes);

        if old_size.is_none() && state.entries.len() >= self.config.max_keys {
            state.reap_expired();
            if state.entries.len() >= self.config.max_keys {
                return Err(KvError::KeyLimitExceeded {
                    max: self.config.max_keys,
                });
            }
        }

        let mut new_total = state.total_size - old_size.unwrap_or(0) + value_size;
        if new_total > self.config.max_total_size {
            // expired bytes still count until reaped
            state.reap_expired();
            let old_size = state.entries.get(&id).map(|e| e.size_bytes);
            new_total = state.total_size - old_size.unwrap_or(0) + value_size;
            if new_total > self.config.max_total_size {
                return Err(KvError::TotalSizeExceeded {
                    total: new_total,
                    max: self.config.max_total_size,
                });
            }
        }

        state.total_size = new_total;
        state.entries.insert(
            id,
            KvEntry {
                value,
                size_bytes: value_size,
                created_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    /// Fetch the value under `key`. Missing and expired entries are `None`.
    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, KvError> {
        validate_key(key)?;
        let state = self.lock();
        let id = (namespace.to_string(), key.to_string());
        Ok(state
            .entries
            .get(&id)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone()))
    }

    /// Remove the entry under `key`. Returns `true` if a live entry was removed.
    pub fn delete(&self, namespace: &str, key: &str) -> Result<bool, KvError> {
        validate_key(key)?;
        let mut state = self.lock();
        let id = (namespace.to_string(), key.to_string());
        match state.entries.remove(&id) {
            Some(entry) => {
                state.total_size -= entry.size_bytes;
                Ok(!entry.is_expired())
            }
            None => Ok(false),
        }
    }

    /// Live keys in `namespace`, sorted.
    pub fn keys(&self, namespace: &str) -> Vec<String> {
        let state = self.lock();
        let mut keys: Vec<String> = state
            .entries
            .iter()
            .filter(|((ns, _), entry)| ns == namespace && !entry.is_expired())
            .map(|((_, key), _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remove all expired entries and return how many were removed.
    pub fn reap_expired(&self) -> usize {
        self.lock().reap_expired()
    }

    /// Number of stored entries, including expired ones not yet reaped.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns `true` if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Combined size in bytes of all stored values.
    pub fn total_size(&self) -> usize {
        self.lock().total_size
    }

    /// A capability bound to one namespace, suitable for injection into a
    /// sandbox context.
    pub fn scoped(self: &Arc<Self>, namespace: impl Into<String>) -> NamespacedKv {
        NamespacedKv {
            store: Arc::clone(self),
            namespace: namespace.into(),
        }
    }
}

/// A [`KvStore`] view restricted to a single namespace.
#[derive(Clone)]
pub struct NamespacedKv {
    store: Arc<KvStore>,
    namespace: String,
}

impl NamespacedKv {
    /// The namespace this view is bound to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl KvCapability for NamespacedKv {
    fn get(&self, key: &str) -> Result<Option<Value>, KvError> {
        self.store.get(&self.namespace, key)
    }

    fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), KvError> {
        self.store.put(&self.namespace, key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<bool, KvError> {
        self.store.delete(&self.namespace, key)
    }

    fn keys(&self) -> Result<Vec<String>, KvError> {
        Ok(self.store.keys(&self.namespace))
    }
}
