use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Access-ordered map backing the window, file handle and delta base caches.
///
/// Every access stamps the entry with a monotonically increasing tick; the
/// `order` map keeps stamps sorted so the oldest entry is found without a
/// full scan.
pub(crate) struct Lru<K, V> {
    entries: HashMap<K, Stamped<V>>,
    order: BTreeMap<u64, K>,
    clock: u64,
}

struct Stamped<V> {
    value: V,
    stamp: u64,
}

impl<K: Hash + Eq + Clone, V> Lru<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            clock: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Look up `key` and mark it most recently used.
    pub(crate) fn get(&mut self, key: &K) -> Option<&V> {
        let stamp = self.tick();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.stamp);
        entry.stamp = stamp;
        self.order.insert(stamp, key.clone());
        Some(&entry.value)
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.remove(&key);
        let stamp = self.tick();
        self.order.insert(stamp, key.clone());
        self.entries.insert(key, Stamped { value, stamp });
        previous
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.stamp);
        Some(entry.value)
    }

    /// Remove the least recently used entry accepted by `evictable`.
    pub(crate) fn evict_oldest_where(
        &mut self,
        mut evictable: impl FnMut(&K, &V) -> bool,
    ) -> Option<(K, V)> {
        let victim = self
            .order
            .values()
            .find(|key| {
                self.entries
                    .get(*key)
                    .is_some_and(|entry| evictable(key, &entry.value))
            })?
            .clone();
        let value = self.remove(&victim)?;
        Some((victim, value))
    }

    /// Remove every entry whose key matches `drop`, returning the values.
    pub(crate) fn drain_where(&mut self, mut drop: impl FnMut(&K) -> bool) -> Vec<V> {
        let victims: Vec<K> = self.entries.keys().filter(|k| drop(k)).cloned().collect();
        victims.iter().filter_map(|k| self.remove(k)).collect()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
