//! Size- and age-bounded cache of compiled IR, keyed by source content hash.
//!
//! The cache is an ordinary value: construct one, wrap it in
//! `Arc<Mutex<_>>` and hand it to
//! [`IrCompiler::with_cache`](crate::compiler::IrCompiler::with_cache).
//! Independent compilers with independent caches never interfere.
//!
//! Eviction is least-recently-used: every successful [`IrCache::get`]
//! touches the entry, and inserting into a full cache drops the entry that
//! was touched longest ago. A use-ordered index sits beside the entry map
//! so finding that entry does not scan the cache. Entries also expire `max_age` after insertion.
//!
//! The `*_at` variants take an explicit `Instant` so expiry can be tested
//! without sleeping.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use manifest_ir::Ir;
use serde::Serialize;

/// Cache limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrCacheConfig {
    /// Maximum number of entries held at once.
    pub max_entries: usize,
    /// Age after which an entry is treated as absent.
    pub max_age: Duration,
}

impl Default for IrCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            max_age: Duration::from_secs(60 * 60),
        }
    }
}

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IrCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped for capacity, expiry or hash mismatch.
    pub evictions: u64,
}

#[derive(Debug)]
struct CacheEntry {
    ir: Ir,
    inserted_at: Instant,
    last_used: u64,
}

/// LRU + TTL cache of compiled IR.
#[derive(Debug)]
pub struct IrCache {
    config: IrCacheConfig,
    entries: HashMap<String, CacheEntry>,
    /// `last_used` stamp to key, one per entry; the first is the LRU victim.
    recency: BTreeMap<u64, String>,
    /// Monotonic use counter; larger means more recently used.
    clock: u64,
    stats: IrCacheStats,
}

impl Default for IrCache {
    fn default() -> Self {
        Self::new(IrCacheConfig::default())
    }
}

impl IrCache {
    pub fn new(config: IrCacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            clock: 0,
            stats: IrCacheStats::default(),
        }
    }

    pub fn config(&self) -> IrCacheConfig {
        self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove_entry(&mut self, hash: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(hash)?;
        self.recency.remove(&entry.last_used);
        Some(entry)
    }

    /// Look up IR compiled from source with the given content hash.
    pub fn get(&mut self, hash: &str) -> Option<Ir> {
        self.get_at(hash, Instant::now())
    }

    /// [`get`](Self::get) evaluated at `now`.
    ///
    /// Misses on absence, on expiry, and when the stored IR's
    /// `provenance.contentHash` does not match `hash`; the last two also
    /// evict the stale entry.
    pub fn get_at(&mut self, hash: &str, now: Instant) -> Option<Ir> {
        let stale = match self.entries.get(hash) {
            None => {
                self.stats.misses += 1;
                return None;
            }
            Some(entry) => {
                now.saturating_duration_since(entry.inserted_at) >= self.config.max_age
                    || entry.ir.provenance.content_hash != hash
            }
        };
        if stale {
            self.remove_entry(hash);
            self.stats.evictions += 1;
            self.stats.misses += 1;
            tracing::debug!(hash, "evicted stale IR cache entry");
            return None;
        }
        let stamp = self.tick();
        self.stats.hits += 1;
        let entry = self.entries.get_mut(hash)?;
        self.recency.remove(&entry.last_used);
        self.recency.insert(stamp, hash.to_owned());
        entry.last_used = stamp;
        Some(entry.ir.clone())
    }

    /// Store IR under its content hash.
    pub fn set(&mut self, hash: impl Into<String>, ir: Ir) {
        self.set_at(hash, ir, Instant::now());
    }

    /// [`set`](Self::set) evaluated at `now`.
    pub fn set_at(&mut self, hash: impl Into<String>, ir: Ir, now: Instant) {
        let hash = hash.into();
        if self.config.max_entries == 0 {
            return;
        }
        if self.remove_entry(&hash).is_none() {
            while self.entries.len() >= self.config.max_entries {
                self.evict_least_recent();
            }
        }
        let stamp = self.tick();
        self.recency.insert(stamp, hash.clone());
        self.entries.insert(
            hash,
            CacheEntry {
                ir,
                inserted_at: now,
                last_used: stamp,
            },
        );
    }

    fn evict_least_recent(&mut self) {
        if let Some((_, key)) = self.recency.pop_first() {
            self.entries.remove(&key);
            self.stats.evictions += 1;
            tracing::debug!(hash = %key, "evicted least recently used IR cache entry");
        }
    }

    /// Remove one entry. Returns whether it was present.
    pub fn invalidate(&mut self, hash: &str) -> bool {
        self.remove_entry(hash).is_some()
    }

    /// Remove every entry. Counters are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    /// Drop expired entries and return how many were removed.
    pub fn cleanup(&mut self) -> usize {
        self.cleanup_at(Instant::now())
    }

    /// [`cleanup`](Self::cleanup) evaluated at `now`.
    pub fn cleanup_at(&mut self, now: Instant) -> usize {
        let max_age = self.config.max_age;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.inserted_at) >= max_age)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove_entry(key);
        }
        self.stats.evictions += expired.len() as u64;
        expired.len()
    }

    pub fn stats(&self) -> IrCacheStats {
        IrCacheStats {
            entries: self.entries.len(),
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ir_for(hash: &str) -> Ir {
        let mut ir = Ir::empty();
        ir.provenance.content_hash = hash.to_owned();
        ir
    }

    fn cache(max_entries: usize) -> IrCache {
        IrCache::new(IrCacheConfig {
            max_entries,
            max_age: Duration::from_secs(60),
        })
    }

    #[test]
    fn hit_and_miss_are_counted() {
        let mut c = cache(4);
        assert!(c.get("a").is_none());
        c.set("a", ir_for("a"));
        assert_eq!(c.get("a").unwrap().provenance.content_hash, "a");
        let stats = c.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn evicts_least_recently_used_not_oldest_inserted() {
        let mut c = cache(2);
        c.set("a", ir_for("a"));
        c.set("b", ir_for("b"));
        // touching "a" makes "b" the eviction candidate
        assert!(c.get("a").is_some());
        c.set("c", ir_for("c"));
        assert!(c.get("a").is_some());
        assert!(c.get("b").is_none());
        assert!(c.get("c").is_some());
        assert_eq!(c.stats().evictions, 1);
    }

    #[test]
    fn reinserting_existing_key_does_not_evict() {
        let mut c = cache(2);
        c.set("a", ir_for("a"));
        c.set("b", ir_for("b"));
        c.set("a", ir_for("a"));
        assert_eq!(c.len(), 2);
        assert_eq!(c.stats().evictions, 0);
    }

    #[test]
    fn expired_entry_is_a_miss_and_is_evicted() {
        let mut c = cache(4);
        let start = Instant::now();
        c.set_at("a", ir_for("a"), start);
        assert!(c.get_at("a", start + Duration::from_secs(30)).is_some());
        assert!(c.get_at("a", start + Duration::from_secs(61)).is_none());
        assert!(c.is_empty());
    }

    #[test]
    fn content_hash_mismatch_is_a_miss() {
        let mut c = cache(4);
        c.set("a", ir_for("not-a"));
        assert!(c.get("a").is_none());
        assert!(c.is_empty());
    }

    #[test]
    fn cleanup_removes_only_expired() {
        let mut c = cache(4);
        let start = Instant::now();
        c.set_at("old", ir_for("old"), start);
        c.set_at("new", ir_for("new"), start + Duration::from_secs(50));
        assert_eq!(c.cleanup_at(start + Duration::from_secs(70)), 1);
        assert!(c.get_at("new", start + Duration::from_secs(70)).is_some());
    }

    #[test]
    fn invalidate_and_clear() {
        let mut c = cache(4);
        c.set("a", ir_for("a"));
        c.set("b", ir_for("b"));
        assert!(c.invalidate("a"));
        assert!(!c.invalidate("a"));
        c.clear();
        assert!(c.is_empty());
    }

    #[test]
    fn eviction_follows_use_order_across_many_entries() {
        let mut c = cache(50);
        for i in 0..50 {
            c.set(format!("k{i}"), ir_for(&format!("k{i}")));
        }
        // touch the even keys so the odd ones become the oldest
        for i in (0..50).step_by(2) {
            assert!(c.get(&format!("k{i}")).is_some());
        }
        for i in 50..75 {
            c.set(format!("k{i}"), ir_for(&format!("k{i}")));
        }
        assert_eq!(c.len(), 50);
        assert!((1..50).step_by(2).all(|i| !c.entries.contains_key(&format!("k{i}"))));
        assert!((0..50).step_by(2).all(|i| c.entries.contains_key(&format!("k{i}"))));
    }

    #[test]
    fn recency_index_tracks_entries() {
        let mut c = cache(3);
        let start = Instant::now();
        c.set_at("a", ir_for("a"), start);
        c.set_at("b", ir_for("b"), start + Duration::from_secs(30));
        c.set_at("a", ir_for("a"), start);
        assert!(c.get_at("b", start + Duration::from_secs(30)).is_some());
        c.set_at("c", ir_for("c"), start + Duration::from_secs(30));
        c.set_at("d", ir_for("d"), start + Duration::from_secs(30));
        c.invalidate("c");
        c.cleanup_at(start + Duration::from_secs(61));

        let mut indexed: Vec<&str> = c.recency.values().map(String::as_str).collect();
        indexed.sort_unstable();
        let mut keys: Vec<&str> = c.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(indexed, keys);
        assert_eq!(keys, vec!["b", "d"]);
        for (stamp, key) in &c.recency {
            assert_eq!(c.entries[key].last_used, *stamp);
        }
    }

    #[test]
    fn default_config_matches_documented_limits() {
        let config = IrCacheConfig::default();
        assert_eq!(config.max_entries, 100);
        assert_eq!(config.max_age, Duration::from_secs(3600));
    }
}
