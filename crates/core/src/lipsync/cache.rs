use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::LipSyncResult;

/// SHA-256 of the encoded audio bytes, rendered as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Bounded least-recently-used store of analysis results.
pub struct AnalysisCache {
    state: Mutex<CacheState>,
}

struct CacheState {
    entries: HashMap<ContentFingerprint, CacheEntry>,
    capacity: usize,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

struct CacheEntry {
    result: Arc<LipSyncResult>,
    last_used: u64,
}

impl AnalysisCache {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                capacity,
                tick: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    pub fn get(&self, key: &ContentFingerprint) -> Option<Arc<LipSyncResult>> {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.last_used = tick;
                let result = entry.result.clone();
                state.hits += 1;
                Some(result)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    pub fn contains(&self, key: &ContentFingerprint) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn insert(&self, key: ContentFingerprint, result: Arc<LipSyncResult>) {
        let mut state = self.state.lock();
        if state.capacity == 0 {
            return;
        }
        state.tick += 1;
        let last_used = state.tick;
        state.entries.insert(key, CacheEntry { result, last_used });
        state.evict_to_capacity();
    }

    pub fn remove(&self, key: &ContentFingerprint) -> Option<Arc<LipSyncResult>> {
        self.state.lock().entries.remove(key).map(|entry| entry.result)
    }

    /// Drops every entry. Counters are kept.
    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.state.lock();
        state.capacity = capacity;
        state.evict_to_capacity();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            capacity: state.capacity,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }
}

impl CacheState {
    fn evict_to_capacity(&mut self) {
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            let Some(key) = oldest else { break };
            self.entries.remove(&key);
            self.evictions += 1;
            debug!(fingerprint = %key, "evicted lip-sync analysis");
        }
    }
}

impl fmt::Debug for AnalysisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisCache")
            .field("stats", &self.stats())
            .finish()
    }
}
