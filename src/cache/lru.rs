use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const SHARD_BITS: usize = 4;
const SHARD_COUNT: usize = 1 << SHARD_BITS;

struct Entry<V> {
    value: Arc<V>,
    charge: usize,
    /// Matches the generation recorded in the recency queue; a stale queue
    /// slot is skipped at eviction time instead of being removed eagerly.
    generation: u64,
}

struct Shard<K, V> {
    map: HashMap<K, Entry<V>>,
    recency: VecDeque<(K, u64)>,
    used: usize,
    next_generation: u64,
}

impl<K: Eq + Hash + Clone, V> Shard<K, V> {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            recency: VecDeque::new(),
            used: 0,
            next_generation: 0,
        }
    }

    fn touch(&mut self, key: &K) -> Option<Arc<V>> {
        let generation = self.next_generation;
        let entry = self.map.get_mut(key)?;
        entry.generation = generation;
        self.next_generation += 1;
        self.recency.push_back((key.clone(), generation));
        Some(entry.value.clone())
    }

    fn insert(&mut self, key: K, value: Arc<V>, charge: usize) {
        if let Some(old) = self.map.remove(&key) {
            self.used -= old.charge;
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        self.used += charge;
        self.recency.push_back((key.clone(), generation));
        self.map.insert(
            key,
            Entry {
                value,
                charge,
                generation,
            },
        );
    }

    fn erase(&mut self, key: &K) -> Option<Arc<V>> {
        let entry = self.map.remove(key)?;
        self.used -= entry.charge;
        Some(entry.value)
    }

    fn evict_to(&mut self, capacity: usize) -> Vec<(K, Arc<V>)> {
        let mut evicted = Vec::new();
        while self.used > capacity {
            let (key, generation) = match self.recency.pop_front() {
                Some(slot) => slot,
                None => break,
            };
            let live = matches!(self.map.get(&key), Some(e) if e.generation == generation);
            if live {
                let entry = self.map.remove(&key).unwrap();
                self.used -= entry.charge;
                evicted.push((key, entry.value));
            }
        }
        evicted
    }
}

/// Sharded, internally synchronised LRU with a byte-charge capacity.
///
/// Values are handed out as `Arc<V>`, so an evicted entry stays alive for
/// readers still holding it. An optional eviction hook observes every entry
/// leaving the cache by capacity pressure.
pub struct ShardedLru<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    shards: Vec<Mutex<Shard<K, V>>>,
    shard_capacity: usize,
    hits: AtomicUsize,
    misses: AtomicUsize,
    #[allow(clippy::type_complexity)]
    on_evict: Option<Box<dyn Fn(&K, &Arc<V>) + Send + Sync>>,
}

impl<K, V> ShardedLru<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new(capacity: usize) -> Self {
        Self::with_evict_hook(capacity, None)
    }

    #[allow(clippy::type_complexity)]
    pub fn with_evict_hook(
        capacity: usize,
        on_evict: Option<Box<dyn Fn(&K, &Arc<V>) + Send + Sync>>,
    ) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(Shard::new())).collect();
        Self {
            shards,
            shard_capacity: (capacity / SHARD_COUNT).max(1),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            on_evict,
        }
    }

    fn shard(&self, key: &K) -> &Mutex<Shard<K, V>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (SHARD_COUNT - 1)]
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let found = self.shard(key).lock().unwrap().touch(key);
        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn insert(&self, key: K, value: Arc<V>, charge: usize) {
        let evicted = {
            let shard = self.shard(&key);
            let mut shard = shard.lock().unwrap();
            shard.insert(key, value, charge);
            shard.evict_to(self.shard_capacity)
        };
        if let Some(hook) = &self.on_evict {
            for (key, value) in &evicted {
                hook(key, value);
            }
        }
    }

    pub fn erase(&self, key: &K) -> Option<Arc<V>> {
        self.shard(key).lock().unwrap().erase(key)
    }

    /// Drop every entry matching the predicate. Used when an SSTable is
    /// deleted and all of its blocks must leave the cache at once.
    pub fn erase_if(&self, pred: impl Fn(&K) -> bool) {
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            let doomed: Vec<K> = shard.map.keys().filter(|k| pred(k)).cloned().collect();
            for key in doomed {
                shard.erase(&key);
            }
        }
    }

    pub fn total_charge(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().used).sum()
    }

    /// (hits, misses) since construction.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_insert_get_erase() {
        let cache: ShardedLru<u64, Vec<u8>> = ShardedLru::new(1 << 20);
        cache.insert(1, Arc::new(b"one".to_vec()), 3);
        cache.insert(2, Arc::new(b"two".to_vec()), 3);

        assert_eq!(cache.get(&1).unwrap().as_slice(), b"one");
        assert!(cache.get(&3).is_none());
        assert_eq!(cache.stats(), (1, 1));

        cache.erase(&1);
        assert!(cache.get(&1).is_none());
    }

    /// Find keys that land in the same shard by replaying the shard hash.
    fn colliding_keys(count: usize) -> Vec<u64> {
        fn shard_of(key: u64) -> usize {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() as usize) & (SHARD_COUNT - 1)
        }
        let target = shard_of(0);
        (0u64..).filter(|k| shard_of(*k) == target).take(count).collect()
    }

    #[test]
    fn test_charge_eviction_is_lru() {
        let cache: ShardedLru<u64, u64> = ShardedLru::new(3 * SHARD_COUNT);
        let keys = colliding_keys(4); // All in one shard, capacity 3 there.
        cache.insert(keys[0], Arc::new(0), 1);
        cache.insert(keys[1], Arc::new(1), 1);
        cache.insert(keys[2], Arc::new(2), 1);

        // Touch the oldest so keys[1] becomes the eviction victim.
        cache.get(&keys[0]);
        cache.insert(keys[3], Arc::new(3), 1);

        assert!(cache.get(&keys[0]).is_some());
        assert!(cache.get(&keys[1]).is_none());
        assert!(cache.get(&keys[3]).is_some());
    }

    #[test]
    fn test_evict_hook_fires() {
        static EVICTED: AtomicUsize = AtomicUsize::new(0);
        let cache: ShardedLru<u64, u64> = ShardedLru::with_evict_hook(
            SHARD_COUNT,
            Some(Box::new(|_, _| {
                EVICTED.fetch_add(1, Ordering::SeqCst);
            })),
        );
        for i in 0..8 {
            cache.insert(i * SHARD_COUNT as u64, Arc::new(i), 1);
        }
        assert!(EVICTED.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_erase_if_prefix() {
        let cache: ShardedLru<(u64, u64), u64> = ShardedLru::new(1 << 20);
        for i in 0..4 {
            cache.insert((7, i), Arc::new(i), 1);
            cache.insert((9, i), Arc::new(i), 1);
        }
        cache.erase_if(|(fid, _)| *fid == 7);
        assert!(cache.get(&(7, 0)).is_none());
        assert!(cache.get(&(9, 0)).is_some());
    }
}
