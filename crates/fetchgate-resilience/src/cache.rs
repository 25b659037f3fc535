//! Result caching for upstream fetches.
//!
//! Entries are keyed by [`RequestFingerprint`] and expire individually: the
//! TTL is chosen by the caller at insert time. When the cache is full, the
//! least recently accessed entry is evicted. Recency is tracked with a
//! monotonic tick, so ties between equally old accesses cannot occur.

use crate::timeout::instant_after;
use fetchgate_core::RequestFingerprint;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries in the cache
    pub capacity: usize,
    /// TTL used when the caller does not choose one
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// A cached value with its lifecycle timestamps
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// Key of the entry
    pub fingerprint: RequestFingerprint,
    /// The cached value
    pub value: V,
    /// When the entry was stored
    pub created_at: Instant,
    /// When the entry stops being served
    pub expires_at: Instant,
    /// Last successful read (or the insert time)
    pub last_accessed_at: Instant,
    /// Number of times this entry has been served
    pub hits: u64,
    /// Recency tick, key into the LRU index
    tick: u64,
    /// Insert tick, disambiguates equal expiry instants in the expiry index
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime at `now`
    #[must_use]
    pub fn ttl_remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses (including expired lookups)
    pub misses: u64,
    /// Current number of entries
    pub entries: usize,
    /// Maximum number of entries
    pub capacity: usize,
    /// Entries evicted to make room
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
    /// Entries removed by explicit invalidation
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate hit rate
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

/// Cache lookup result for metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookupResult {
    /// Cache hit
    Hit,
    /// No entry for the key
    Miss,
    /// An entry existed but its TTL had elapsed
    Expired,
}

impl CacheLookupResult {
    /// Label used in metrics
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Expired => "expired",
        }
    }
}

struct CacheInner<V> {
    entries: HashMap<RequestFingerprint, CacheEntry<V>>,
    /// Recency index: oldest access first
    recency: BTreeMap<u64, RequestFingerprint>,
    /// Expiry index: soonest expiry first
    expiry: BTreeMap<(Instant, u64), RequestFingerprint>,
    next_tick: u64,
    stats: CacheStats,
}

impl<V> CacheInner<V> {
    fn tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn remove(&mut self, fingerprint: &RequestFingerprint) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(fingerprint)?;
        self.recency.remove(&entry.tick);
        self.expiry.remove(&(entry.expires_at, entry.seq));
        Some(entry)
    }

    /// Drop expired entries, soonest expiry first. Stops at the first live one.
    fn purge_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some(entry) = self.expiry.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let fingerprint = entry.remove();
            if let Some(expired) = self.entries.remove(&fingerprint) {
                self.recency.remove(&expired.tick);
                removed += 1;
            }
        }
        self.stats.expirations += removed as u64;
        removed
    }

    fn evict_lru(&mut self) -> Option<RequestFingerprint> {
        let (_, fingerprint) = self.recency.pop_first()?;
        if let Some(entry) = self.entries.remove(&fingerprint) {
            self.expiry.remove(&(entry.expires_at, entry.seq));
        }
        self.stats.evictions += 1;
        Some(fingerprint)
    }
}

/// In-memory TTL + LRU cache
pub struct TtlLruCache<V> {
    /// Cache configuration
    config: CacheConfig,
    /// Entries, recency index and statistics under one lock
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone> TtlLruCache<V> {
    /// Create a new cache. A capacity of zero is treated as one.
    #[must_use]
    pub fn new(mut config: CacheConfig) -> Self {
        config.capacity = config.capacity.max(1);
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(config.capacity.min(4096)),
                recency: BTreeMap::new(),
                expiry: BTreeMap::new(),
                next_tick: 0,
                stats: CacheStats {
                    capacity: config.capacity,
                    ..CacheStats::default()
                },
            }),
            config,
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Default TTL for entries
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    /// Get a cached value, refreshing its recency on a hit
    pub fn get(&self, fingerprint: &RequestFingerprint) -> Option<V> {
        self.lookup(fingerprint).0
    }

    /// Get a cached value together with how the lookup resolved
    pub fn lookup(&self, fingerprint: &RequestFingerprint) -> (Option<V>, CacheLookupResult) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(fingerprint) {
            None => {
                inner.stats.misses += 1;
                debug!(fingerprint = %fingerprint, "Cache miss");
                return (None, CacheLookupResult::Miss);
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.remove(fingerprint);
            inner.stats.misses += 1;
            inner.stats.expirations += 1;
            inner.stats.entries = inner.entries.len();
            debug!(fingerprint = %fingerprint, "Cache miss (expired)");
            return (None, CacheLookupResult::Expired);
        }

        let tick = inner.tick();
        let inner = &mut *inner;
        let Some(entry) = inner.entries.get_mut(fingerprint) else {
            return (None, CacheLookupResult::Miss);
        };
        inner.recency.remove(&entry.tick);
        inner.recency.insert(tick, fingerprint.clone());
        entry.tick = tick;
        entry.last_accessed_at = now;
        entry.hits += 1;
        inner.stats.hits += 1;
        debug!(fingerprint = %fingerprint, hits = entry.hits, "Cache hit");
        (Some(entry.value.clone()), CacheLookupResult::Hit)
    }

    /// Insert or replace an entry that expires `ttl` from now.
    ///
    /// Returns the fingerprint evicted to make room, if any.
    pub fn put(&self, fingerprint: RequestFingerprint, value: V, ttl: Duration) -> Option<RequestFingerprint> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let replaced = inner.remove(&fingerprint).is_some();
        let mut evicted = None;
        if !replaced && inner.entries.len() >= self.config.capacity {
            // Expired entries go first so a live entry is never evicted in their place
            if inner.purge_expired(now) == 0 {
                evicted = inner.evict_lru();
            }
        }

        let tick = inner.tick();
        let expires_at = instant_after(now, ttl);
        inner.recency.insert(tick, fingerprint.clone());
        inner.expiry.insert((expires_at, tick), fingerprint.clone());
        inner.entries.insert(
            fingerprint.clone(),
            CacheEntry {
                fingerprint: fingerprint.clone(),
                value,
                created_at: now,
                expires_at,
                last_accessed_at: now,
                hits: 0,
                tick,
                seq: tick,
            },
        );
        inner.stats.entries = inner.entries.len();

        if let Some(victim) = &evicted {
            debug!(fingerprint = %victim, "Evicted least recently used entry");
        }
        debug!(
            fingerprint = %fingerprint,
            ttl_secs = ttl.as_secs(),
            entries = inner.stats.entries,
            "Result cached"
        );
        evicted
    }

    /// Insert with the configured default TTL
    pub fn put_default(&self, fingerprint: RequestFingerprint, value: V) -> Option<RequestFingerprint> {
        self.put(fingerprint, value, self.config.default_ttl)
    }

    /// Remove an entry if present. Returns whether one was removed.
    pub fn invalidate(&self, fingerprint: &RequestFingerprint) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.remove(fingerprint).is_some();
        if removed {
            inner.stats.invalidations += 1;
            inner.stats.entries = inner.entries.len();
            debug!(fingerprint = %fingerprint, "Cache entry invalidated");
        }
        removed
    }

    /// Remove every entry for an operation
    pub fn invalidate_operation(&self, operation: &str) -> usize {
        let mut inner = self.inner.lock();
        let matching: Vec<RequestFingerprint> = inner
            .entries
            .keys()
            .filter(|fp| fp.operation() == operation)
            .cloned()
            .collect();
        for fingerprint in &matching {
            inner.remove(fingerprint);
        }
        inner.stats.invalidations += matching.len() as u64;
        inner.stats.entries = inner.entries.len();

        if !matching.is_empty() {
            info!(operation, removed = matching.len(), "Operation cache invalidated");
        }
        matching.len()
    }

    /// Whether an unexpired entry exists, without touching recency
    #[must_use]
    pub fn contains(&self, fingerprint: &RequestFingerprint) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .get(fingerprint)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Unexpired value for `fingerprint`, without touching recency or statistics
    #[must_use]
    pub fn peek(&self, fingerprint: &RequestFingerprint) -> Option<V> {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .get(fingerprint)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Copy of an entry with its metadata, without touching recency
    #[must_use]
    pub fn peek_entry(&self, fingerprint: &RequestFingerprint) -> Option<CacheEntry<V>> {
        self.inner.lock().entries.get(fingerprint).cloned()
    }

    /// Number of stored entries (expired ones included until purged)
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all cache entries
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
        inner.expiry.clear();
        inner.stats.entries = 0;

        info!("Cache cleared");
    }

    /// Remove expired entries, returning how many were dropped
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let removed = inner.purge_expired(now);
        inner.stats.entries = inner.entries.len();

        if removed > 0 {
            debug!(removed, "Expired cache entries removed");
        }
        removed
    }

    /// Get cache statistics
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }
}

impl<V> std::fmt::Debug for TtlLruCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlLruCache")
            .field("capacity", &self.config.capacity)
            .field("default_ttl", &self.config.default_ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> RequestFingerprint {
        RequestFingerprint::from_parts("gene", name)
    }

    fn cache(capacity: usize) -> TtlLruCache<u32> {
        TtlLruCache::new(CacheConfig {
            capacity,
            default_ttl: Duration::from_secs(60),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_before_and_after_ttl() {
        let cache = cache(10);
        cache.put(key("a"), 1, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get(&key("a")), Some(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&key("a")), None);
        // The stale entry is gone, not just hidden
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_miss() {
        let cache = cache(10);
        assert_eq!(cache.lookup(&key("missing")), (None, CacheLookupResult::Miss));
    }

    #[test]
    fn test_touched_entry_survives_eviction() {
        // capacity=2: put(A), put(B), get(A), put(C) evicts B
        let cache = cache(2);
        cache.put(key("a"), 1, Duration::from_secs(60));
        cache.put(key("b"), 2, Duration::from_secs(60));
        assert_eq!(cache.get(&key("a")), Some(1));

        let evicted = cache.put(key("c"), 3, Duration::from_secs(60));
        assert_eq!(evicted, Some(key("b")));

        assert_eq!(cache.get(&key("b")), None);
        assert_eq!(cache.get(&key("a")), Some(1));
        assert_eq!(cache.get(&key("c")), Some(3));
    }

    #[test]
    fn test_overflow_evicts_first_inserted() {
        let capacity = 5;
        let cache = cache(capacity);
        for i in 0..=capacity {
            cache.put(key(&format!("k{i}")), i as u32, Duration::from_secs(60));
        }

        assert_eq!(cache.len(), capacity);
        assert!(!cache.contains(&key("k0")));
        for i in 1..=capacity {
            assert!(cache.contains(&key(&format!("k{i}"))), "k{i} should remain");
        }
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_replace_does_not_evict() {
        let cache = cache(2);
        cache.put(key("a"), 1, Duration::from_secs(60));
        cache.put(key("b"), 2, Duration::from_secs(60));
        assert_eq!(cache.put(key("a"), 10, Duration::from_secs(60)), None);

        assert_eq!(cache.get(&key("a")), Some(10));
        assert_eq!(cache.get(&key("b")), Some(2));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_evicted_before_live_ones() {
        let cache = cache(2);
        cache.put(key("short"), 1, Duration::from_secs(1));
        cache.put(key("long"), 2, Duration::from_secs(600));
        // Make "long" the least recently used live entry
        assert_eq!(cache.get(&key("short")), Some(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.put(key("new"), 3, Duration::from_secs(60)), None);

        assert_eq!(cache.get(&key("long")), Some(2));
        assert_eq!(cache.get(&key("new")), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl_is_stored() {
        let cache = cache(2);
        assert_eq!(cache.put(key("forever"), 1, Duration::MAX), None);
        assert_eq!(cache.get(&key("forever")), Some(1));

        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
        assert_eq!(cache.get(&key("forever")), Some(1));
        let entry = cache.peek_entry(&key("forever")).expect("entry");
        assert!(entry.ttl_remaining(Instant::now()) > Duration::from_secs(86_400 * 365));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cache_purges_expired_then_evicts_lru() {
        let cache = cache(3);
        cache.put(key("a"), 1, Duration::from_secs(1));
        cache.put(key("b"), 2, Duration::from_secs(60));
        cache.put(key("c"), 3, Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(2)).await;
        // Only "a" has expired; "b" and "c" stay
        assert_eq!(cache.put(key("d"), 4, Duration::from_secs(60)), None);
        assert_eq!(cache.stats().expirations, 1);
        assert_eq!(cache.len(), 3);

        // No expired entries left, so the least recently used live one goes
        assert_eq!(cache.put(key("e"), 5, Duration::from_secs(60)), Some(key("b")));
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().expirations, 1);
        assert!(cache.contains(&key("c")));
        assert!(cache.contains(&key("d")));
        assert!(cache.contains(&key("e")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_entry_uses_new_expiry() {
        let cache = cache(10);
        cache.put(key("a"), 1, Duration::from_secs(1));
        cache.put(key("a"), 2, Duration::from_secs(100));
        cache.put(key("b"), 3, Duration::from_secs(1));
        cache.invalidate(&key("b"));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.cleanup_expired(), 0);
        assert_eq!(cache.get(&key("a")), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_entry_ttl() {
        let cache = cache(10);
        cache.put(key("brief"), 1, Duration::from_secs(5));
        cache.put(key("lasting"), 2, Duration::from_secs(500));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get(&key("brief")), None);
        assert_eq!(cache.get(&key("lasting")), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_updates_last_accessed() {
        let cache = cache(10);
        cache.put(key("a"), 1, Duration::from_secs(60));
        let stored = cache.peek_entry(&key("a")).expect("entry");

        tokio::time::advance(Duration::from_secs(5)).await;
        cache.get(&key("a"));
        let touched = cache.peek_entry(&key("a")).expect("entry");

        assert_eq!(touched.created_at, stored.created_at);
        assert_eq!(touched.expires_at, stored.expires_at);
        assert!(touched.last_accessed_at > stored.last_accessed_at);
        assert_eq!(touched.hits, 1);
    }

    #[test]
    fn test_peek_is_invisible_to_lru_and_stats() {
        let cache = cache(2);
        cache.put(key("a"), 1, Duration::from_secs(60));
        cache.put(key("b"), 2, Duration::from_secs(60));

        assert_eq!(cache.peek(&key("a")), Some(1));
        assert_eq!(cache.put(key("c"), 3, Duration::from_secs(60)), Some(key("a")));

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_invalidate() {
        let cache = cache(10);
        cache.put(key("a"), 1, Duration::from_secs(60));

        assert!(cache.invalidate(&key("a")));
        assert!(!cache.invalidate(&key("a")));
        assert_eq!(cache.get(&key("a")), None);
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_invalidate_operation() {
        let cache = cache(10);
        cache.put(RequestFingerprint::from_parts("gene", "1"), 1, Duration::from_secs(60));
        cache.put(RequestFingerprint::from_parts("gene", "2"), 2, Duration::from_secs(60));
        cache.put(RequestFingerprint::from_parts("exon", "1"), 3, Duration::from_secs(60));

        assert_eq!(cache.invalidate_operation("gene"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&RequestFingerprint::from_parts("exon", "1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired() {
        let cache = cache(10);
        cache.put(key("a"), 1, Duration::from_secs(1));
        cache.put(key("b"), 2, Duration::from_secs(1));
        cache.put(key("c"), 3, Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.cleanup_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_clear() {
        let cache = cache(10);
        cache.put(key("a"), 1, Duration::from_secs(60));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&key("a")), None);
    }

    #[test]
    fn test_stats() {
        let cache = cache(10);
        cache.get(&key("a"));
        cache.put_default(key("a"), 1);
        cache.get(&key("a"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.capacity, 10);
        assert!((stats.hit_rate() - 50.0).abs() < 0.1);
    }
}
