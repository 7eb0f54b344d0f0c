use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use super::ImageCaching;
use crate::container::ImageContainer;
use crate::keys::MemoryCacheKey;

const DEFAULT_COST_LIMIT: usize = 256 * 1024 * 1024;

/// LRU image cache bounded by total pixel cost and entry count.
///
/// Cost is the decoded bitmap footprint (see `Image::cost`). Writing an
/// existing key replaces the entry in place, so repeated stores of the
/// same container keep exactly one slot.
pub struct MemoryCache {
    inner: Mutex<MemoryCacheInner>,
    cost_limit: usize,
}

struct MemoryCacheInner {
    entries: LruCache<MemoryCacheKey, CacheEntry>,
    total_cost: usize,
}

struct CacheEntry {
    container: ImageContainer,
    cost: usize,
}

impl MemoryCache {
    pub fn new(cost_limit: usize, count_limit: usize) -> Self {
        let capacity = NonZeroUsize::new(count_limit.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(MemoryCacheInner {
                entries: LruCache::new(capacity),
                total_cost: 0,
            }),
            cost_limit,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_cost(&self) -> usize {
        self.inner.lock().total_cost
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_COST_LIMIT, usize::MAX)
    }
}

impl ImageCaching for MemoryCache {
    fn get(&self, key: &MemoryCacheKey) -> Option<ImageContainer> {
        let mut inner = self.inner.lock();
        inner.entries.get(key).map(|entry| entry.container.clone())
    }

    fn set(&self, key: MemoryCacheKey, container: ImageContainer) {
        let cost = container.image.cost();
        let mut inner = self.inner.lock();
        // `push` reports both same-key replacement and count-limit
        // eviction, so the cost ledger stays exact either way.
        if let Some((_, displaced)) =
            inner.entries.push(key, CacheEntry { container, cost })
        {
            inner.total_cost =
                inner.total_cost.saturating_sub(displaced.cost);
        }
        inner.total_cost += cost;
        while inner.total_cost > self.cost_limit {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.total_cost =
                        inner.total_cost.saturating_sub(evicted.cost);
                    debug!(cost = evicted.cost, "memory cache evicted entry");
                }
                None => break,
            }
        }
    }

    fn remove(&self, key: &MemoryCacheKey) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.pop(key) {
            inner.total_cost = inner.total_cost.saturating_sub(entry.cost);
        }
    }

    fn contains(&self, key: &MemoryCacheKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    fn remove_all(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_cost = 0;
    }
}
