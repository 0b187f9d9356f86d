use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use odb_types::{AbbreviatedObjectId, ObjectId};

use crate::error::StoreResult;
use crate::object::RawObject;
use crate::traits::LooseObjectSource;

/// In-memory loose object store.
///
/// Intended for tests and embedding. Objects live in a `BTreeMap` behind a
/// `RwLock`, so prefix resolution is a range scan over the sorted keys.
pub struct InMemoryLooseStore {
    objects: RwLock<BTreeMap<ObjectId, RawObject>>,
}

impl InMemoryLooseStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Store an object and return its id. Re-inserting is a no-op.
    pub fn insert(&self, object: RawObject) -> ObjectId {
        let id = object.compute_id();
        let mut map = self.objects.write().expect("lock poisoned");
        map.entry(id).or_insert(object);
        id
    }

    /// Remove an object. Returns `true` if it existed.
    pub fn remove(&self, id: &ObjectId) -> bool {
        self.objects
            .write()
            .expect("lock poisoned")
            .remove(id)
            .is_some()
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// All stored ids, in sorted order.
    pub fn all_ids(&self) -> Vec<ObjectId> {
        self.objects
            .read()
            .expect("lock poisoned")
            .keys()
            .copied()
            .collect()
    }
}

impl Default for InMemoryLooseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LooseObjectSource for InMemoryLooseStore {
    fn has(&self, id: &ObjectId) -> StoreResult<bool> {
        Ok(self.objects.read().expect("lock poisoned").contains_key(id))
    }

    fn open(&self, id: &ObjectId) -> StoreResult<Option<RawObject>> {
        Ok(self.objects.read().expect("lock poisoned").get(id).cloned())
    }

    fn resolve(
        &self,
        prefix: &AbbreviatedObjectId,
        matches: &mut BTreeSet<ObjectId>,
    ) -> StoreResult<()> {
        let map = self.objects.read().expect("lock poisoned");
        // The zero-padded prefix is the smallest id that can match.
        let start = ObjectId::from_hash(*prefix.as_bytes());
        for id in map.range(start..).map(|(id, _)| id) {
            if !prefix.matches(id) {
                break;
            }
            matches.insert(*id);
        }
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryLooseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLooseStore")
            .field("object_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odb_types::ObjectKind;

    fn blob(content: &[u8]) -> RawObject {
        RawObject::new(ObjectKind::Blob, content.to_vec())
    }

    #[test]
    fn insert_and_open() {
        let store = InMemoryLooseStore::new();
        let id = store.insert(blob(b"hello"));
        assert!(store.has(&id).unwrap());
        let obj = store.open(&id).unwrap().unwrap();
        assert_eq!(obj.data, b"hello");
        assert_eq!(obj.kind, ObjectKind::Blob);
    }

    #[test]
    fn insert_is_idempotent() {
        let store = InMemoryLooseStore::new();
        let a = store.insert(blob(b"same"));
        let b = store.insert(blob(b"same"));
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn open_missing_returns_none() {
        let store = InMemoryLooseStore::new();
        assert!(store.is_empty());
        let id = ObjectId::hash_object(ObjectKind::Blob, b"missing");
        assert!(store.open(&id).unwrap().is_none());
        assert!(!store.has(&id).unwrap());
    }

    #[test]
    fn remove_deletes() {
        let store = InMemoryLooseStore::new();
        let id = store.insert(blob(b"gone"));
        assert!(store.remove(&id));
        assert!(!store.remove(&id));
        assert!(!store.has(&id).unwrap());
    }

    #[test]
    fn resolve_collects_prefix_matches() {
        let store = InMemoryLooseStore::new();
        let ids: Vec<_> = (0..64u8).map(|i| store.insert(blob(&[i]))).collect();
        let target = ids[17];

        let mut matches = BTreeSet::new();
        store
            .resolve(&target.abbreviate(40).unwrap(), &mut matches)
            .unwrap();
        assert_eq!(matches.into_iter().collect::<Vec<_>>(), vec![target]);

        let mut matches = BTreeSet::new();
        let short = target.abbreviate(4).unwrap();
        store.resolve(&short, &mut matches).unwrap();
        assert!(matches.contains(&target));
        assert!(matches.iter().all(|id| short.matches(id)));
        let expected = ids.iter().filter(|id| short.matches(id)).count();
        assert_eq!(matches.len(), expected);
    }
}
