use std::path::PathBuf;

use odb_types::ObjectId;

use crate::error::{PackError, PackResult};
use crate::index::PackIndex;

/// Index entries ordered by pack offset instead of id.
#[derive(Debug)]
pub struct PackReverseIndex {
    index_path: PathBuf,
    /// `(offset, id)` pairs sorted by offset.
    entries: Vec<(u64, ObjectId)>,
}

impl PackReverseIndex {
    pub fn build(index: &PackIndex) -> Self {
        let mut entries: Vec<(u64, ObjectId)> = index.iter().map(|e| (e.offset, e.id)).collect();
        entries.sort_unstable_by_key(|&(offset, _)| offset);
        Self {
            index_path: index.path().to_path_buf(),
            entries,
        }
    }

    fn position(&self, offset: u64) -> Option<usize> {
        self.entries.binary_search_by_key(&offset, |&(o, _)| o).ok()
    }

    /// Object starting exactly at `offset`.
    pub fn find_object(&self, offset: u64) -> Option<ObjectId> {
        self.position(offset).map(|pos| self.entries[pos].1)
    }

    /// First entry offset after `offset`, or `max` when `offset` is the last
    /// entry. Used to bound the raw bytes of the entry at `offset`.
    pub fn find_next_offset(&self, offset: u64, max: u64) -> PackResult<u64> {
        let pos = self.position(offset).ok_or_else(|| PackError::CorruptIndex {
            path: self.index_path.clone(),
            reason: format!("no object starts at offset {offset}"),
        })?;
        Ok(self.entries.get(pos + 1).map_or(max, |&(next, _)| next))
    }

    /// Entry offsets in pack order.
    pub fn offsets(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|&(offset, _)| offset)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::sample_entries;

    fn reverse() -> (PackIndex, PackReverseIndex) {
        let index = PackIndex::from_entries(sample_entries(25), [0; 20]);
        let reverse = PackReverseIndex::build(&index);
        (index, reverse)
    }

    #[test]
    fn find_object_inverts_find_offset() {
        let (index, reverse) = reverse();
        for entry in index.iter() {
            let offset = index.find_offset(&entry.id).unwrap();
            assert_eq!(reverse.find_object(offset), Some(entry.id));
        }
        assert_eq!(reverse.len(), 25);
    }

    #[test]
    fn non_entry_offsets_are_not_found() {
        let (_, reverse) = reverse();
        assert_eq!(reverse.find_object(0), None);
        assert_eq!(reverse.find_object(13), None);
    }

    #[test]
    fn next_offset_bounds_entries() {
        let (_, reverse) = reverse();
        assert_eq!(reverse.find_next_offset(12, 9999).unwrap(), 112);
        let last = 12 + 24 * 100;
        assert_eq!(reverse.find_next_offset(last, 9999).unwrap(), 9999);
    }

    #[test]
    fn next_offset_of_non_entry_is_corrupt() {
        let (_, reverse) = reverse();
        assert!(matches!(
            reverse.find_next_offset(50, 9999),
            Err(PackError::CorruptIndex { .. })
        ));
    }

    #[test]
    fn offsets_are_ascending() {
        let (_, reverse) = reverse();
        let offsets: Vec<u64> = reverse.offsets().collect();
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    }
}
