use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;

use super::CacheKey;

/// The unsynchronized part of a [`MemoryStore`].
#[derive(Debug)]
struct LruState<V> {
    entries: LruCache<CacheKey, (V, u64)>,
    total_cost: u64,
}

impl<V> LruState<V> {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_cost: 0,
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<V> {
        let (value, cost) = self.entries.pop(key)?;
        self.total_cost -= cost;
        Some(value)
    }

    fn pop_lru(&mut self) -> Option<CacheKey> {
        let (key, (_, cost)) = self.entries.pop_lru()?;
        self.total_cost -= cost;
        Some(key)
    }
}

/// A fixed-budget, in-memory least-recently-used cache.
///
/// The store is bounded by both the total cost of its entries (usually their size in bytes) and
/// the number of entries. All operations are synchronous, never perform I/O, and are O(1)
/// amortized. The store is internally synchronized and can be shared between tasks.
#[derive(Debug)]
pub struct MemoryStore<V> {
    name: &'static str,
    max_cost: u64,
    max_count: usize,
    state: Mutex<LruState<V>>,
}

impl<V: Clone> MemoryStore<V> {
    /// Creates an empty store with the given cost and count budgets.
    pub fn new(name: &'static str, max_cost: u64, max_count: usize) -> Self {
        Self {
            name,
            max_cost,
            max_count,
            state: Mutex::new(LruState::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, LruState<V>> {
        // No operation panics halfway through an update.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up `key`, marking it as the most recently used entry on a hit.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let mut state = self.state();
        state.entries.get(key).map(|(value, _)| value.clone())
    }

    /// Inserts `value` under `key`, evicting least recently used entries until both budgets fit.
    ///
    /// Returns `false` if the entry alone exceeds the budget and was not stored. In that case a
    /// previous value stored under `key` is removed as well.
    pub fn put(&self, key: CacheKey, value: V, cost: u64) -> bool {
        let mut state = self.state();

        state.remove(&key);

        if cost > self.max_cost || self.max_count == 0 {
            tracing::debug!(
                cache = self.name,
                key = %key,
                cost,
                "Entry exceeds in-memory budget, not caching",
            );
            return false;
        }

        let mut evicted = 0i64;
        while state
            .total_cost
            .checked_add(cost)
            .is_none_or(|total| total > self.max_cost)
            || state.entries.len() >= self.max_count
        {
            let Some(evicted_key) = state.pop_lru() else {
                break;
            };
            tracing::trace!(cache = self.name, key = %evicted_key, "Evicting in-memory entry");
            evicted += 1;
        }
        if evicted > 0 {
            metric!(counter("caches.memory.evicted") += evicted, "cache" => self.name);
        }

        state.total_cost += cost;
        state.entries.put(key, (value, cost));
        true
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&self, key: &CacheKey) -> Option<V> {
        self.state().remove(key)
    }

    /// Drops all entries.
    pub fn clear(&self) {
        let mut state = self.state();
        let count = state.entries.len();
        state.entries.clear();
        state.total_cost = 0;
        tracing::debug!(cache = self.name, count, "Cleared in-memory cache");
    }

    /// Whether an entry for `key` is present, without touching its recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state().entries.contains(key)
    }

    /// The number of entries currently stored.
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The sum of the costs of all stored entries.
    pub fn total_cost(&self) -> u64 {
        self.state().total_cost
    }

    pub fn max_cost(&self) -> u64 {
        self.max_cost
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }
}
