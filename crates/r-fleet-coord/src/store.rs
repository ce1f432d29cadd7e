//! ---
//! fleet_section: "04-coordination"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Coordination store and distributed network lock."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

/// Errors raised by a coordination store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("coordination store rejected key {key}: {reason}")]
    Rejected { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Shared key-value store with per-key expiry and atomic conditional writes.
///
/// Implementations must make each method atomic with respect to the others;
/// the lock protocol depends on `set_if_absent`, `compare_and_expire` and
/// `compare_and_delete` not interleaving.
pub trait CoordinationStore: Send + Sync + fmt::Debug {
    /// Unconditionally store `value`, replacing any previous value and expiry.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    /// Read a live value.
    fn get(&self, key: &str) -> Result<Option<String>>;
    /// Remove a key, reporting whether a live value was present.
    fn delete(&self, key: &str) -> Result<bool>;
    /// Live keys starting with `prefix`.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
    /// Store `value` only when no live value exists.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    /// Reset the expiry of `key` to `ttl` when it still holds `expected`.
    fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;
    /// Remove `key` when it still holds `expected`.
    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }
}

/// Process-local store used by tests, the simulator and single-node setups.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor returning the store behind the trait object.
    pub fn shared() -> Arc<dyn CoordinationStore> {
        Arc::new(Self::new())
    }

    fn live_value<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        let expired = entries.get(key).is_some_and(|entry| !entry.is_live(now));
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get_mut(key)
    }
}

impl CoordinationStore for MemoryStore {
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        self.entries.lock().insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        Ok(Self::live_value(&mut entries, key, Instant::now()).map(|entry| entry.value.clone()))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        Ok(entries
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if Self::live_value(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match Self::live_value(&mut entries, key, now) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let matches = Self::live_value(&mut entries, key, now)
            .is_some_and(|entry| entry.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }
}

/// View of a store that prefixes every key, keeping subsystems apart.
#[derive(Debug, Clone)]
pub struct Namespace {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
}

impl Namespace {
    pub fn new(store: Arc<dyn CoordinationStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.store.set(&self.key(key), value, ttl)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.store.get(&self.key(key))
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        self.store.delete(&self.key(key))
    }

    /// Live keys under `prefix` inside this namespace, with the namespace stripped.
    pub fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .keys(&self.key(prefix))?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&self.prefix).map(str::to_owned))
            .collect())
    }

    pub fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.store.set_if_absent(&self.key(key), value, ttl)
    }

    pub fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        self.store.compare_and_expire(&self.key(key), expected, ttl)
    }

    pub fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.store.compare_and_delete(&self.key(key), expected)
    }
}
