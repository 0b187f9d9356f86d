use std::sync::{Arc, Mutex, MutexGuard};

use odb_types::ObjectKind;

use crate::lru::Lru;
use crate::pack_file::PackKey;

struct CachedBase {
    kind: ObjectKind,
    data: Arc<[u8]>,
}

struct BaseState {
    entries: Lru<(PackKey, u64), CachedBase>,
    bytes: u64,
}

/// Expanded delta bases shared across lookups, keyed by pack and entry
/// offset, under a byte budget.
pub struct DeltaBaseCache {
    limit: u64,
    state: Mutex<BaseState>,
}

impl DeltaBaseCache {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            state: Mutex::new(BaseState {
                entries: Lru::new(),
                bytes: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BaseState> {
        self.state.lock().expect("delta base cache lock poisoned")
    }

    pub fn get(&self, pack: PackKey, offset: u64) -> Option<(ObjectKind, Arc<[u8]>)> {
        self.lock()
            .entries
            .get(&(pack, offset))
            .map(|base| (base.kind, Arc::clone(&base.data)))
    }

    /// Remember an expanded base. Bases larger than the whole budget are
    /// not kept.
    pub fn store(&self, pack: PackKey, offset: u64, kind: ObjectKind, data: Arc<[u8]>) {
        let size = data.len() as u64;
        if size > self.limit {
            return;
        }
        let mut state = self.lock();
        if let Some(previous) = state.entries.insert((pack, offset), CachedBase { kind, data }) {
            state.bytes -= previous.data.len() as u64;
        }
        state.bytes += size;
        while state.bytes > self.limit {
            match state.entries.evict_oldest_where(|_, _| true) {
                Some((_, evicted)) => state.bytes -= evicted.data.len() as u64,
                None => break,
            }
        }
    }

    pub fn purge(&self, pack: PackKey) {
        let mut state = self.lock();
        let dropped: u64 = state
            .entries
            .drain_where(|(key, _)| *key == pack)
            .iter()
            .map(|b| b.data.len() as u64)
            .sum();
        state.bytes -= dropped;
    }

    pub fn resident_bytes(&self) -> u64 {
        self.lock().bytes
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for DeltaBaseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaBaseCache")
            .field("limit", &self.limit)
            .field("bytes", &self.resident_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(n: usize) -> Arc<[u8]> {
        vec![0u8; n].into()
    }

    #[test]
    fn stores_and_returns_bases() {
        let cache = DeltaBaseCache::new(1024);
        let key = PackKey::next();
        cache.store(key, 12, ObjectKind::Tree, Arc::from(&b"tree"[..]));
        let (kind, data) = cache.get(key, 12).unwrap();
        assert_eq!(kind, ObjectKind::Tree);
        assert_eq!(&*data, b"tree");
        assert!(cache.get(key, 13).is_none());
    }

    #[test]
    fn evicts_to_budget() {
        let cache = DeltaBaseCache::new(100);
        let key = PackKey::next();
        for offset in 0..10 {
            cache.store(key, offset, ObjectKind::Blob, bytes(30));
            assert!(cache.resident_bytes() <= 100);
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.get(key, 9).is_some());
        assert!(cache.get(key, 0).is_none());
    }

    #[test]
    fn oversized_bases_are_skipped() {
        let cache = DeltaBaseCache::new(10);
        cache.store(PackKey::next(), 0, ObjectKind::Blob, bytes(11));
        assert!(cache.is_empty());
    }

    #[test]
    fn purge_only_touches_one_pack() {
        let cache = DeltaBaseCache::new(1000);
        let (a, b) = (PackKey::next(), PackKey::next());
        cache.store(a, 1, ObjectKind::Blob, bytes(10));
        cache.store(b, 1, ObjectKind::Blob, bytes(20));
        cache.purge(a);
        assert!(cache.get(a, 1).is_none());
        assert!(cache.get(b, 1).is_some());
        assert_eq!(cache.resident_bytes(), 20);
    }
}
