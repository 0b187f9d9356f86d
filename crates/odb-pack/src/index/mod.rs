//! Pack index: sorted object ids mapped to pack offsets.
//!
//! Both on-disk formats are decoded into the same columnar structure. A
//! 256-entry fan-out table records, for every first byte `b`, how many ids
//! start with a byte `<= b`; lookups binary-search only the bucket the
//! fan-out selects.
//!
//! ```text
//! v1:  fan-out[256] | { offset u32, id[20] } * N | pack sha1 | index sha1
//! v2:  \xfftOc | 2 | fan-out[256] | id[20] * N | crc32 * N | offset32 * N
//!      | offset64 * M | pack sha1 | index sha1
//! ```

mod v1;
mod v2;
mod writer;

pub use writer::{oldest_possible_version, PackIndexWriter};

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use odb_types::{AbbreviatedObjectId, ObjectId};

use crate::error::{PackError, PackResult};
use crate::io::sha1_digest;

pub const INDEX_V2_MAGIC: [u8; 4] = [0xff, b't', b'O', b'c'];
pub(crate) const FAN_OUT_LEN: usize = 256 * 4;
pub(crate) const TRAILER_LEN: usize = 40;

/// Location of one object inside a pack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedObjectInfo {
    pub id: ObjectId,
    pub offset: u64,
    /// CRC-32 of the raw entry bytes. Only version 2 indexes record it.
    pub crc32: Option<u32>,
}

impl PackedObjectInfo {
    pub fn new(id: ObjectId, offset: u64, crc32: Option<u32>) -> Self {
        Self { id, offset, crc32 }
    }
}

/// Decoded columns shared by both index formats.
pub(crate) struct IndexColumns {
    pub fan_out: [u32; 256],
    pub ids: Vec<ObjectId>,
    pub offsets: Vec<u64>,
    pub crc32s: Option<Vec<u32>>,
}

/// Immutable, memory-resident pack index.
#[derive(Clone)]
pub struct PackIndex {
    path: PathBuf,
    version: u32,
    fan_out: [u32; 256],
    ids: Vec<ObjectId>,
    offsets: Vec<u64>,
    crc32s: Option<Vec<u32>>,
    pack_checksum: [u8; 20],
}

impl PackIndex {
    /// Read and validate an index file.
    pub fn open(path: &Path) -> PackResult<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < (FAN_OUT_LEN + TRAILER_LEN) as u64 {
            return Err(corrupt(path, format!("file too small ({len} bytes)")));
        }
        // SAFETY: index files are written once and renamed into place; the
        // map is only read while decoding below and dropped before returning.
        let map = unsafe { Mmap::map(&file)? };
        Self::parse(&map, path)
    }

    /// Decode an index from bytes, detecting the format version.
    pub fn parse(data: &[u8], path: &Path) -> PackResult<Self> {
        if data.len() < FAN_OUT_LEN + TRAILER_LEN {
            return Err(corrupt(path, format!("file too small ({} bytes)", data.len())));
        }

        let body_end = data.len() - 20;
        if sha1_digest(&data[..body_end]) != data[body_end..] {
            return Err(corrupt(path, "index checksum mismatch"));
        }

        let (version, columns) = if data[..4] == INDEX_V2_MAGIC {
            let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            if version != 2 {
                return Err(PackError::UnsupportedVersion(version));
            }
            (2, v2::parse(data, path)?)
        } else {
            (1, v1::parse(data, path)?)
        };

        validate_columns(&columns, path)?;

        let mut pack_checksum = [0u8; 20];
        pack_checksum.copy_from_slice(&data[data.len() - TRAILER_LEN..body_end]);

        Ok(Self {
            path: path.to_path_buf(),
            version,
            fan_out: columns.fan_out,
            ids: columns.ids,
            offsets: columns.offsets,
            crc32s: columns.crc32s,
            pack_checksum,
        })
    }

    /// Build an index directly from entries, without a file behind it.
    pub fn from_entries(mut entries: Vec<PackedObjectInfo>, pack_checksum: [u8; 20]) -> Self {
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries.dedup_by(|a, b| a.id == b.id);
        let version = if entries.iter().all(|e| e.crc32.is_some()) { 2 } else { 1 };
        let fan_out = fan_out_of(entries.iter().map(|e| &e.id));
        let crc32s = (version == 2).then(|| entries.iter().map(|e| e.crc32.unwrap_or(0)).collect());
        Self {
            path: PathBuf::new(),
            version,
            fan_out,
            ids: entries.iter().map(|e| e.id).collect(),
            offsets: entries.iter().map(|e| e.offset).collect(),
            crc32s,
            pack_checksum,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Digest of the pack this index describes.
    pub fn pack_checksum(&self) -> &[u8; 20] {
        &self.pack_checksum
    }

    pub fn object_count(&self) -> usize {
        self.ids.len()
    }

    pub fn has_crc32(&self) -> bool {
        self.crc32s.is_some()
    }

    /// Half-open range of positions whose ids start with `first`.
    fn bucket(&self, first: u8) -> (usize, usize) {
        let end = self.fan_out[first as usize] as usize;
        let start = match first {
            0 => 0,
            b => self.fan_out[b as usize - 1] as usize,
        };
        (start, end)
    }

    /// Position of `id` in id order.
    pub fn find_position(&self, id: &ObjectId) -> Option<usize> {
        let (start, end) = self.bucket(id.first_byte());
        self.ids[start..end]
            .binary_search(id)
            .ok()
            .map(|pos| start + pos)
    }

    pub fn find_offset(&self, id: &ObjectId) -> Option<u64> {
        self.find_position(id).map(|pos| self.offsets[pos])
    }

    /// CRC-32 recorded for `id`. Version 1 indexes have none to give.
    pub fn find_crc32(&self, id: &ObjectId) -> PackResult<Option<u32>> {
        let crc32s = self
            .crc32s
            .as_ref()
            .ok_or(PackError::Crc32NotSupported {
                version: self.version,
            })?;
        Ok(self.find_position(id).map(|pos| crc32s[pos]))
    }

    pub fn has_object(&self, id: &ObjectId) -> bool {
        self.find_position(id).is_some()
    }

    pub fn id_at(&self, position: usize) -> Option<&ObjectId> {
        self.ids.get(position)
    }

    pub fn offset_at(&self, position: usize) -> Option<u64> {
        self.offsets.get(position).copied()
    }

    pub fn crc32_at(&self, position: usize) -> Option<u32> {
        self.crc32s.as_ref().and_then(|c| c.get(position).copied())
    }

    /// Entries in id order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = PackedObjectInfo> + '_ {
        (0..self.ids.len()).map(move |pos| PackedObjectInfo {
            id: self.ids[pos],
            offset: self.offsets[pos],
            crc32: self.crc32_at(pos),
        })
    }

    /// Add every id starting with `prefix` to `matches`.
    ///
    /// The fan-out narrows the search to the prefix's first-byte bucket,
    /// then a lower-bound binary search finds the first candidate and the
    /// scan stops at the first id that no longer matches.
    pub fn resolve(&self, prefix: &AbbreviatedObjectId, matches: &mut BTreeSet<ObjectId>) {
        let (start, end) = self.bucket(prefix.first_byte());
        let candidates = &self.ids[start..end];
        let first = candidates.partition_point(|id| prefix.prefix_compare(id) == Ordering::Greater);
        matches.extend(
            candidates[first..]
                .iter()
                .take_while(|id| prefix.matches(id))
                .copied(),
        );
    }
}

impl std::fmt::Debug for PackIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackIndex")
            .field("path", &self.path)
            .field("version", &self.version)
            .field("objects", &self.ids.len())
            .finish()
    }
}

pub(crate) fn corrupt(path: &Path, reason: impl Into<String>) -> PackError {
    PackError::CorruptIndex {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

pub(crate) fn read_fan_out(data: &[u8], path: &Path) -> PackResult<[u32; 256]> {
    let mut fan_out = [0u32; 256];
    let mut previous = 0;
    for (i, chunk) in data[..FAN_OUT_LEN].chunks_exact(4).enumerate() {
        let count = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if count < previous {
            return Err(corrupt(path, format!("fan-out decreases at entry {i}")));
        }
        fan_out[i] = count;
        previous = count;
    }
    Ok(fan_out)
}

pub(crate) fn fan_out_of<'a>(ids: impl Iterator<Item = &'a ObjectId>) -> [u32; 256] {
    let mut fan_out = [0u32; 256];
    for id in ids {
        fan_out[id.first_byte() as usize] += 1;
    }
    let mut total = 0;
    for slot in fan_out.iter_mut() {
        total += *slot;
        *slot = total;
    }
    fan_out
}

/// Ids must be strictly ascending and agree with the fan-out table, or
/// binary search silently returns wrong answers.
fn validate_columns(columns: &IndexColumns, path: &Path) -> PackResult<()> {
    if let Some(pos) = columns.ids.windows(2).position(|w| w[0] >= w[1]) {
        return Err(corrupt(path, format!("ids out of order at position {}", pos + 1)));
    }
    if fan_out_of(columns.ids.iter()) != columns.fan_out {
        return Err(corrupt(path, "fan-out does not match ids"));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use odb_types::ObjectKind;

    pub(crate) fn sample_entries(n: usize) -> Vec<PackedObjectInfo> {
        (0..n)
            .map(|i| {
                let id = ObjectId::hash_object(ObjectKind::Blob, format!("object {i}").as_bytes());
                PackedObjectInfo::new(id, 12 + i as u64 * 100, Some(i as u32 * 7))
            })
            .collect()
    }

    pub(crate) fn encode(entries: &[PackedObjectInfo], version: u32) -> Vec<u8> {
        let mut out = Vec::new();
        let mut entries = entries.to_vec();
        PackIndexWriter::new(&mut out, version)
            .unwrap()
            .write(&mut entries, &[0xab; 20])
            .unwrap();
        out
    }

    #[test]
    fn from_entries_lookup() {
        let entries = sample_entries(50);
        let index = PackIndex::from_entries(entries.clone(), [0; 20]);
        assert_eq!(index.object_count(), 50);
        assert_eq!(index.version(), 2);
        for entry in &entries {
            assert_eq!(index.find_offset(&entry.id), Some(entry.offset));
            assert_eq!(index.find_crc32(&entry.id).unwrap(), entry.crc32);
        }
        let missing = ObjectId::hash_object(ObjectKind::Blob, b"absent");
        assert!(!index.has_object(&missing));
        assert_eq!(index.find_crc32(&missing).unwrap(), None);
    }

    #[test]
    fn iteration_is_id_ordered() {
        let index = PackIndex::from_entries(sample_entries(30), [0; 20]);
        let ids: Vec<ObjectId> = index.iter().map(|e| e.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(index.iter().len(), 30);
    }

    #[test]
    fn v1_has_no_crc() {
        let entries = sample_entries(5);
        let data = encode(&entries, 1);
        let index = PackIndex::parse(&data, Path::new("a.idx")).unwrap();
        assert_eq!(index.version(), 1);
        assert!(!index.has_crc32());
        assert!(matches!(
            index.find_crc32(&entries[0].id),
            Err(PackError::Crc32NotSupported { version: 1 })
        ));
        assert_eq!(index.find_offset(&entries[3].id), Some(entries[3].offset));
        assert_eq!(index.pack_checksum(), &[0xab; 20]);
    }

    #[test]
    fn open_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pack-x.idx");
        let entries = sample_entries(20);
        std::fs::write(&path, encode(&entries, 2)).unwrap();
        let index = PackIndex::open(&path).unwrap();
        assert_eq!(index.path(), path.as_path());
        assert_eq!(index.object_count(), 20);
    }

    #[test]
    fn checksum_mismatch_is_corrupt() {
        let mut data = encode(&sample_entries(3), 2);
        data[1030] ^= 0xff;
        assert!(matches!(
            PackIndex::parse(&data, Path::new("bad.idx")),
            Err(PackError::CorruptIndex { .. })
        ));
    }

    #[test]
    fn truncated_file_is_corrupt() {
        assert!(matches!(
            PackIndex::parse(&[0u8; 100], Path::new("short.idx")),
            Err(PackError::CorruptIndex { .. })
        ));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.idx");
        std::fs::write(&path, b"").unwrap();
        assert!(PackIndex::open(&path).is_err());
    }

    #[test]
    fn unknown_version_rejected() {
        let mut data = encode(&sample_entries(1), 2);
        data[7] = 3;
        let end = data.len() - 20;
        let digest = sha1_digest(&data[..end]);
        data[end..].copy_from_slice(&digest);
        assert!(matches!(
            PackIndex::parse(&data, Path::new("v3.idx")),
            Err(PackError::UnsupportedVersion(3))
        ));
    }

    #[test]
    fn resolve_prefix_within_bucket() {
        let entries = sample_entries(200);
        let index = PackIndex::from_entries(entries.clone(), [0; 20]);
        for entry in entries.iter().take(20) {
            let mut matches = BTreeSet::new();
            index.resolve(&entry.id.abbreviate(40).unwrap(), &mut matches);
            assert_eq!(matches.len(), 1);
            assert!(matches.contains(&entry.id));

            let mut matches = BTreeSet::new();
            let short = entry.id.abbreviate(4).unwrap();
            index.resolve(&short, &mut matches);
            let expected = entries.iter().filter(|e| short.matches(&e.id)).count();
            assert_eq!(matches.len(), expected);
        }
    }

    #[test]
    fn resolve_finds_nothing_for_unknown_prefix() {
        let index = PackIndex::from_entries(sample_entries(10), [0; 20]);
        let mut matches = BTreeSet::new();
        let missing = ObjectId::hash_object(ObjectKind::Blob, b"nothing here");
        index.resolve(&missing.abbreviate(12).unwrap(), &mut matches);
        assert!(matches.is_empty());
    }
}
