//! Process-local read cache with lazy TTL expiry.
//!
//! Entries live in one namespace per entity type. A key is the SHA-256 of the
//! operation name plus its canonical JSON arguments, so identical reads share
//! an entry and invalidating a type drops exactly that type's namespace.
//!
//! Each namespace also carries a generation that invalidation bumps. A reader
//! takes a `Generation` before loading and stores with `put_if_current`, so a
//! result loaded before a concurrent write can't land after that write's
//! invalidation.

use crate::core::record::Record;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq)]
pub enum CachedValue {
    Records(Vec<Record>),
    Record(Option<Record>),
    Count(u64),
    Number(f64),
}

#[derive(Clone, Debug)]
struct CacheEntry {
    value: CachedValue,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Snapshot of a namespace's invalidation count plus the global clear epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Generation {
    epoch: u64,
    namespace: u64,
}

#[derive(Default)]
struct CacheState {
    namespaces: FxHashMap<String, FxHashMap<String, CacheEntry>>,
    generations: FxHashMap<String, u64>,
    epoch: u64,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn generation(&self, entity_type: &str) -> Generation {
        Generation {
            epoch: self.epoch,
            namespace: self.generations.get(entity_type).copied().unwrap_or(0),
        }
    }

    fn insert(&mut self, entity_type: &str, key: String, value: CachedValue, ttl: Duration) {
        self.namespaces
            .entry(entity_type.to_string())
            .or_default()
            .insert(
                key,
                CacheEntry {
                    value,
                    inserted_at: Instant::now(),
                    ttl,
                },
            );
    }
}

pub struct QueryCache {
    state: Mutex<CacheState>,
    default_ttl: Duration,
    enabled: bool,
}

/// Deterministic cache key for `(operation, args)`.
pub fn cache_key(operation: &str, args: &JsonValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update([0u8]);
    hasher.update(args.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

impl QueryCache {
    pub fn new(default_ttl: Duration, enabled: bool) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            default_ttl,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, entity_type: &str, key: &str) -> Option<CachedValue> {
        if !self.enabled {
            return None;
        }
        let mut state = self.state.lock().ok()?;
        let now = Instant::now();
        let lookup = state
            .namespaces
            .get(entity_type)
            .and_then(|ns| ns.get(key))
            .map(|entry| (entry.is_expired(now), entry.value.clone()));
        match lookup {
            Some((false, value)) => {
                state.hits += 1;
                Some(value)
            }
            Some((true, _)) => {
                if let Some(ns) = state.namespaces.get_mut(entity_type) {
                    ns.remove(key);
                }
                state.misses += 1;
                None
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, entity_type: &str, key: String, value: CachedValue) {
        self.put_with_ttl(entity_type, key, value, self.default_ttl);
    }

    pub fn put_with_ttl(&self, entity_type: &str, key: String, value: CachedValue, ttl: Duration) {
        if !self.enabled {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            state.insert(entity_type, key, value, ttl);
        }
    }

    pub fn generation(&self, entity_type: &str) -> Option<Generation> {
        self.state.lock().ok().map(|state| state.generation(entity_type))
    }

    /// Store `value` only if nothing invalidated `entity_type` since `seen`.
    /// Returns whether the entry was stored.
    pub fn put_if_current(
        &self,
        entity_type: &str,
        seen: Generation,
        key: String,
        value: CachedValue,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.generation(entity_type) != seen {
            return false;
        }
        let ttl = self.default_ttl;
        state.insert(entity_type, key, value, ttl);
        true
    }

    /// Drop every entry of `entity_type`. Returns how many entries went away.
    pub fn invalidate_type(&self, entity_type: &str) -> usize {
        match self.state.lock() {
            Ok(mut state) => {
                *state.generations.entry(entity_type.to_string()).or_default() += 1;
                state
                    .namespaces
                    .remove(entity_type)
                    .map(|ns| ns.len())
                    .unwrap_or(0)
            }
            Err(_) => 0,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.namespaces.clear();
            state.epoch += 1;
        }
    }

    /// Eagerly remove expired entries; reads already expire lazily.
    pub fn prune_expired(&self) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        let now = Instant::now();
        let mut removed = 0;
        for ns in state.namespaces.values_mut() {
            let before = ns.len();
            ns.retain(|_, entry| !entry.is_expired(now));
            removed += before - ns.len();
        }
        state.namespaces.retain(|_, ns| !ns.is_empty());
        removed
    }

    pub fn stats(&self) -> CacheStats {
        match self.state.lock() {
            Ok(state) => CacheStats {
                hits: state.hits,
                misses: state.misses,
                entries: state.namespaces.values().map(|ns| ns.len()).sum(),
            },
            Err(_) => CacheStats::default(),
        }
    }
}
