use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct KeyCounters {
    hits: u64,
    misses: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyStats {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub active_entries: usize,
    pub total_hits: u64,
    pub total_misses: u64,
    pub hit_rate: f64,
    pub keys: BTreeMap<String, KeyStats>,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<String, (V, Instant)>,
    counters: HashMap<String, KeyCounters>,
}

/// Read-path cache with per-entry TTL. Every operation takes the same lock.
#[derive(Debug)]
pub struct TtlCache<V> {
    default_ttl: Duration,
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                counters: HashMap::new(),
            }),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        let mut inner = self.inner.lock().map_err(|_| CacheError::Poisoned)?;
        let now = Instant::now();
        let hit = match inner.entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Some(value.clone()),
            Some(_) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        };
        let counters = inner.counters.entry(key.to_string()).or_default();
        if hit.is_some() {
            counters.hits += 1;
        } else {
            counters.misses += 1;
        }
        Ok(hit)
    }

    /// Store `value` for `ttl`, or the default TTL when `None`.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = Instant::now() + ttl.unwrap_or(self.default_ttl);
        let mut inner = self.inner.lock().map_err(|_| CacheError::Poisoned)?;
        inner.entries.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    /// Returns whether the key was present.
    pub fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut inner = self.inner.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(inner.entries.remove(key).is_some())
    }

    /// Drop every entry. Hit/miss statistics survive a clear.
    pub fn clear(&self) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().map_err(|_| CacheError::Poisoned)?;
        inner.entries.clear();
        Ok(())
    }

    pub fn clean_expired(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().map_err(|_| CacheError::Poisoned)?;
        let before = inner.entries.len();
        inner.entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(before - inner.entries.len())
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let now = Instant::now();
        let inner = self.inner.lock().map_err(|_| CacheError::Poisoned)?;
        let total_entries = inner.entries.len();
        let expired_entries = inner
            .entries
            .values()
            .filter(|(_, expires_at)| *expires_at <= now)
            .count();

        let mut total_hits = 0;
        let mut total_misses = 0;
        let mut keys = BTreeMap::new();
        for (key, counters) in &inner.counters {
            total_hits += counters.hits;
            total_misses += counters.misses;
            let total_requests = counters.hits + counters.misses;
            keys.insert(
                key.clone(),
                KeyStats {
                    hits: counters.hits,
                    misses: counters.misses,
                    total_requests,
                    hit_rate: ratio(counters.hits, total_requests),
                },
            );
        }

        Ok(CacheStats {
            total_entries,
            expired_entries,
            active_entries: total_entries - expired_entries,
            total_hits,
            total_misses,
            hit_rate: ratio(total_hits, total_hits + total_misses),
            keys,
        })
    }

    /// `method:<sha256 of the JSON-encoded params>`. `serde_json::Value` objects
    /// serialize with sorted keys, so equal params give equal keys.
    pub fn cache_key(method: &str, params: &serde_json::Value) -> String {
        format!("{method}:{}", sha256_hex(params.to_string().as_bytes()))
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
