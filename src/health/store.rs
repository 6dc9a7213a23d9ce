use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::health::clock::Clock;

/// Shared key/value store with hash-field semantics.
///
/// Health records for every provider of one (endpoint, model) pair live in a
/// single hash so routing can read them in one round trip. Implementations
/// only need per-field atomic increments; multi-field updates are allowed to
/// race.
#[async_trait]
pub trait HealthStore: Send + Sync {
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hash_set(&self, key: &str, fields: Vec<(String, String)>) -> Result<()>;

    /// Sets `field` only when absent. Returns whether the value was written.
    async fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> Result<bool>;

    /// Atomically adds `delta` to an integer field (missing counts as 0).
    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct HashEntry {
    fields: HashMap<String, String>,
    expires_at_ms: Option<i64>,
}

impl HashEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map_or(false, |at| now_ms >= at)
    }
}

/// In-process store for single-node deployments.
pub struct MemoryHealthStore {
    entries: RwLock<HashMap<String, HashEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryHealthStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn key_count(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries.read().values().filter(|e| !e.is_expired(now)).count()
    }

    /// Drops expired keys. Reads already ignore them; this only frees memory.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let purged = before - entries.len();
        if purged > 0 {
            debug!("Purged {} expired health keys", purged);
        }
        purged
    }

    fn live_entry<'a>(entries: &'a mut HashMap<String, HashEntry>, key: &str, now: i64) -> &'a mut HashEntry {
        let expired = entries.get(key).map_or(false, |e| e.is_expired(now));
        if expired {
            entries.remove(key);
        }
        entries.entry(key.to_string()).or_default()
    }
}

#[async_trait]
impl HealthStore for MemoryHealthStore {
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let now = self.clock.now_ms();
        let entries = self.entries.read();
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.fields.clone())
            .unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, fields: Vec<(String, String)>) -> Result<()> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.write();
        let entry = Self::live_entry(&mut entries, key, now);
        entry.fields.extend(fields);
        Ok(())
    }

    async fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.write();
        let entry = Self::live_entry(&mut entries, key, now);
        if entry.fields.contains_key(field) {
            return Ok(false);
        }
        entry.fields.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.write();
        let entry = Self::live_entry(&mut entries, key, now);
        let current = match entry.fields.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                Error::health_store(format!("field {} of {} is not an integer: {}", field, key, raw))
            })?,
            None => 0,
        };
        let next = current + delta;
        entry.fields.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.expires_at_ms = Some(now + ttl.as_millis() as i64);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}
