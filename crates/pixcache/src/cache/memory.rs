//! # Memory tier
//!
//! An LRU map bounded by entry count and by total cost. Cost is computed once per
//! insert by a pluggable function (decoded pixel area for images, byte length by
//! default). Entries may disappear at any time; the disk tier stays authoritative.

use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::trace;

use crate::sync::GuardedState;

pub type CostFn<V> = Arc<dyn Fn(&V) -> u64 + Send + Sync>;
pub type EvictFn<K, V> = Arc<dyn Fn(&K, &V) + Send + Sync>;

struct TierState<K: Hash + Eq, V> {
    entries: LruCache<K, (V, u64)>,
    total_cost: u64,
}

pub struct MemoryTier<K: Hash + Eq, V> {
    state: GuardedState<TierState<K, V>>,
    count_limit: usize,
    cost_limit: u64,
    cost_fn: CostFn<V>,
    on_evict: Option<EvictFn<K, V>>,
}

impl<K, V> MemoryTier<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(count_limit: usize, cost_limit: u64, cost_fn: CostFn<V>) -> Self {
        let capacity = NonZeroUsize::new(count_limit).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: GuardedState::new(TierState {
                entries: LruCache::new(capacity),
                total_cost: 0,
            }),
            count_limit: capacity.get(),
            cost_limit,
            cost_fn,
            on_evict: None,
        }
    }

    /// Called for entries dropped to honor the limits (not for explicit removal).
    pub fn with_eviction_callback(mut self, on_evict: EvictFn<K, V>) -> Self {
        self.on_evict = Some(on_evict);
        self
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.state
            .write(|state| state.entries.get(key).map(|(value, _)| value.clone()))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.state.read(|state| state.entries.contains(key))
    }

    pub fn insert(&self, key: K, value: V) {
        let cost = (self.cost_fn)(&value);

        let evicted = self.state.write(|state| {
            let mut evicted = Vec::new();

            if cost > self.cost_limit {
                // Never fits; make sure a stale value does not linger either.
                if let Some((_, old_cost)) = state.entries.pop(&key) {
                    state.total_cost -= old_cost;
                }
                trace!(cost, limit = self.cost_limit, "Entry exceeds memory cost limit");
                return evicted;
            }

            state.total_cost += cost;
            if let Some((old_key, (old_value, old_cost))) = state.entries.push(key.clone(), (value, cost)) {
                state.total_cost -= old_cost;
                if old_key != key {
                    evicted.push((old_key, old_value));
                }
            }

            while state.total_cost > self.cost_limit {
                match state.entries.pop_lru() {
                    Some((k, (v, c))) => {
                        state.total_cost -= c;
                        evicted.push((k, v));
                    }
                    None => break,
                }
            }
            evicted
        });

        if let Some(on_evict) = &self.on_evict {
            for (k, v) in &evicted {
                on_evict(k, v);
            }
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.state.write(|state| {
            state.entries.pop(key).map(|(value, cost)| {
                state.total_cost -= cost;
                value
            })
        })
    }

    pub fn clear(&self) {
        self.state.write(|state| {
            state.entries.clear();
            state.total_cost = 0;
        });
    }

    pub fn len(&self) -> usize {
        self.state.read(|state| state.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_cost(&self) -> u64 {
        self.state.read(|state| state.total_cost)
    }

    pub fn count_limit(&self) -> usize {
        self.count_limit
    }

    pub fn cost_limit(&self) -> u64 {
        self.cost_limit
    }
}

impl<K: Hash + Eq, V> fmt::Debug for MemoryTier<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (len, cost) = self
            .state
            .read(|state| (state.entries.len(), state.total_cost));
        f.debug_struct("MemoryTier")
            .field("len", &len)
            .field("total_cost", &cost)
            .field("count_limit", &self.count_limit)
            .field("cost_limit", &self.cost_limit)
            .finish()
    }
}
