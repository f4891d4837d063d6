//! Chunk-addressed RAM cache with exact byte accounting, insertion-order
//! high-watermark eviction and per-entry TTL.
//!
//! The cache is either [`Active`] or [`Disabled`], so every call site
//! handles the disabled deployment (NVMe hosts where RAM caching hurts
//! latency) without a null sentinel.
//!
//! [`Active`]: ChunkCache::Active
//! [`Disabled`]: ChunkCache::Disabled

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tracing::debug;

use crate::config::CacheConfig;
use crate::util::Clock;


/// Fraction of the byte budget that triggers a batch eviction.
const HIGH_WATERMARK: f64 = 0.9;
/// Fraction of the byte budget eviction shrinks down to.
const LOW_WATERMARK: f64 = 0.8;


/// Key of a cached chunk payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub region: PathBuf,
    pub cx: i32,
    pub cz: i32,
}

impl CacheKey {

    pub fn new(region: impl Into<PathBuf>, cx: i32, cz: i32) -> Self {
        Self { region: region.into(), cx, cz }
    }

}

#[derive(Debug)]
struct CacheSlot {
    data: Arc<Vec<u8>>,
    inserted: Instant,
}

#[derive(Debug, Default)]
struct CacheInner {
    map: IndexMap<CacheKey, CacheSlot>,
    /// Sum of entry sizes, kept exact under the lock.
    current: usize,
}

/// Counter snapshot of the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}


/// The chunk cache, or its disabled stand-in.
pub enum ChunkCache {
    Active(ActiveCache),
    Disabled,
}

impl ChunkCache {

    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        if config.enabled && config.max_bytes > 0 {
            Self::Active(ActiveCache {
                max_bytes: config.max_bytes as usize,
                ttl: config.ttl,
                clock,
                inner: Mutex::new(CacheInner::default()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                expirations: AtomicU64::new(0),
            })
        } else {
            Self::Disabled
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<Vec<u8>>> {
        match self {
            Self::Active(cache) => cache.get(key),
            Self::Disabled => None,
        }
    }

    pub fn put(&self, key: CacheKey, data: Arc<Vec<u8>>) {
        if let Self::Active(cache) = self {
            cache.put(key, data);
        }
    }

    pub fn invalidate(&self, key: &CacheKey) {
        if let Self::Active(cache) = self {
            cache.invalidate(key);
        }
    }

    pub fn clear_region(&self, region: &Path) {
        if let Self::Active(cache) = self {
            cache.clear_region(region);
        }
    }

    pub fn current_bytes(&self) -> usize {
        match self {
            Self::Active(cache) => cache.inner.lock().unwrap().current,
            Self::Disabled => 0,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Active(cache) => cache.inner.lock().unwrap().map.len(),
            Self::Disabled => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counters(&self) -> CacheCounters {
        match self {
            Self::Active(cache) => CacheCounters {
                hits: cache.hits.load(Ordering::Relaxed),
                misses: cache.misses.load(Ordering::Relaxed),
                evictions: cache.evictions.load(Ordering::Relaxed),
                expirations: cache.expirations.load(Ordering::Relaxed),
            },
            Self::Disabled => CacheCounters::default(),
        }
    }

}


/// The live cache behind [`ChunkCache::Active`].
pub struct ActiveCache {
    max_bytes: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl ActiveCache {

    fn get(&self, key: &CacheKey) -> Option<Arc<Vec<u8>>> {

        let mut inner = self.inner.lock().unwrap();

        if let Some(slot) = inner.map.get(key) {
            let age = self.clock.now().saturating_duration_since(slot.inserted);
            if age > self.ttl {
                let slot = inner.map.shift_remove(key).unwrap();
                inner.current -= slot.data.len();
                self.expirations.fetch_add(1, Ordering::Relaxed);
            } else {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(Arc::clone(&slot.data));
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None

    }

    fn put(&self, key: CacheKey, data: Arc<Vec<u8>>) {

        let incoming = data.len();
        if incoming > self.max_bytes {
            return;
        }

        let mut inner = self.inner.lock().unwrap();

        if let Some(old) = inner.map.shift_remove(&key) {
            inner.current -= old.data.len();
        }

        if (inner.current + incoming) as f64 > self.max_bytes as f64 * HIGH_WATERMARK {

            let target = (self.max_bytes as f64 * LOW_WATERMARK) as usize;
            let mut count = 0;
            let mut remaining = inner.current;
            for slot in inner.map.values() {
                if remaining <= target {
                    break;
                }
                remaining -= slot.data.len();
                count += 1;
            }

            let drained: usize = inner.map.drain(0..count).map(|(_, slot)| slot.data.len()).sum();
            inner.current -= drained;
            self.evictions.fetch_add(count as u64, Ordering::Relaxed);
            debug!("evicted {count} cache entries, {} bytes kept", inner.current);

        }

        inner.current += incoming;
        inner.map.insert(key, CacheSlot { data, inserted: self.clock.now() });

    }

    fn invalidate(&self, key: &CacheKey) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.map.shift_remove(key) {
            inner.current -= slot.data.len();
        }
    }

    fn clear_region(&self, region: &Path) {
        let mut inner = self.inner.lock().unwrap();
        let mut removed = 0;
        inner.map.retain(|key, slot| {
            if key.region == region {
                removed += slot.data.len();
                false
            } else {
                true
            }
        });
        inner.current -= removed;
    }

}


#[cfg(test)]
mod tests {

    use super::*;

    struct FakeClock(Mutex<Instant>);

    impl FakeClock {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Instant::now())))
        }
        fn advance(&self, by: Duration) {
            *self.0.lock().unwrap() += by;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            *self.0.lock().unwrap()
        }
    }

    fn config(max_bytes: u64) -> CacheConfig {
        CacheConfig { enabled: true, max_bytes, ttl: Duration::from_secs(600) }
    }

    fn key(n: i32) -> CacheKey {
        CacheKey::new("r.0.0.lrf", n, 0)
    }

    fn bytes(len: usize) -> Arc<Vec<u8>> {
        Arc::new(vec![0xAB; len])
    }

    #[test]
    fn hit_miss_and_accounting() {
        let clock = FakeClock::new();
        let cache = ChunkCache::new(&config(1000), clock);
        assert!(cache.get(&key(1)).is_none());
        cache.put(key(1), bytes(100));
        cache.put(key(2), bytes(200));
        assert_eq!(cache.current_bytes(), 300);
        assert_eq!(cache.get(&key(1)).unwrap().len(), 100);
        let counters = cache.counters();
        assert_eq!(counters.hits, 1);
        assert_eq!(counters.misses, 1);

        // Replacing a key keeps the accounting exact.
        cache.put(key(1), bytes(50));
        assert_eq!(cache.current_bytes(), 250);
    }

    #[test]
    fn watermark_eviction_in_insertion_order() {
        let clock = FakeClock::new();
        let cache = ChunkCache::new(&config(1000), clock);
        for i in 0..8 {
            cache.put(key(i), bytes(100));
        }
        assert_eq!(cache.current_bytes(), 800);
        // 800 + 200 crosses 0.9 * 1000, eviction shrinks below 0.8 * 1000.
        cache.put(key(100), bytes(200));
        assert!(cache.current_bytes() <= 800);
        assert!(cache.get(&key(0)).is_none());
        assert!(cache.get(&key(100)).is_some());
        assert!(cache.counters().evictions > 0);
    }

    #[test]
    fn ttl_expiry_on_lookup() {
        let clock = FakeClock::new();
        let cache = ChunkCache::new(
            &CacheConfig { enabled: true, max_bytes: 1000, ttl: Duration::from_secs(60) },
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        cache.put(key(1), bytes(10));
        clock.advance(Duration::from_secs(61));
        assert!(cache.get(&key(1)).is_none());
        assert_eq!(cache.current_bytes(), 0);
        assert_eq!(cache.counters().expirations, 1);
    }

    #[test]
    fn invalidate_and_clear_region() {
        let clock = FakeClock::new();
        let cache = ChunkCache::new(&config(10_000), clock);
        cache.put(CacheKey::new("a.lrf", 0, 0), bytes(10));
        cache.put(CacheKey::new("a.lrf", 1, 0), bytes(10));
        cache.put(CacheKey::new("b.lrf", 0, 0), bytes(10));

        cache.invalidate(&CacheKey::new("a.lrf", 0, 0));
        assert_eq!(cache.current_bytes(), 20);
        cache.clear_region(Path::new("a.lrf"));
        assert_eq!(cache.current_bytes(), 10);
        assert!(cache.get(&CacheKey::new("b.lrf", 0, 0)).is_some());
    }

    #[test]
    fn disabled_cache_short_circuits() {
        let clock = FakeClock::new();
        let cache = ChunkCache::new(
            &CacheConfig { enabled: false, max_bytes: 1000, ttl: Duration::from_secs(60) },
            clock,
        );
        assert!(!cache.is_enabled());
        cache.put(key(1), bytes(10));
        assert!(cache.get(&key(1)).is_none());
        assert_eq!(cache.current_bytes(), 0);
        assert_eq!(cache.counters(), CacheCounters::default());
    }

    #[test]
    fn oversized_entry_is_not_cached() {
        let clock = FakeClock::new();
        let cache = ChunkCache::new(&config(100), clock);
        cache.put(key(1), bytes(101));
        assert_eq!(cache.current_bytes(), 0);
    }

}
