use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use odb_store::{InMemoryLooseStore, LooseObjectSource, RawObject};
use odb_types::{ObjectId, ObjectKind};
use tracing::debug;

use crate::config::{IndexVersion, IndexerConfig};
use crate::delta::apply_delta;
use crate::entry::{self, encode_header, PackEntryKind, MAX_HEADER_LEN};
use crate::error::{PackError, PackResult};
use crate::index::{PackIndex, PackIndexWriter, PackedObjectInfo};
use crate::io::{grow_inflate_buffer, sha1_digest};
use crate::pack_file::{PACK_HEADER_LEN, PACK_SIGNATURE, PACK_TRAILER_LEN};
use crate::progress::{check_cancelled, ProgressMonitor};

/// Objects a thin pack may delta against.
pub trait BaseSource {
    fn find_base(&self, id: &ObjectId) -> PackResult<Option<RawObject>>;
}

impl BaseSource for InMemoryLooseStore {
    fn find_base(&self, id: &ObjectId) -> PackResult<Option<RawObject>> {
        Ok(self.open(id)?)
    }
}

/// A fully parsed and resolved pack, ready to have its index written.
#[derive(Debug)]
pub struct IndexedPack {
    /// Pack bytes; differs from the input when thin bases were appended.
    pub pack_data: Vec<u8>,
    /// Entries in pack order.
    pub entries: Vec<PackedObjectInfo>,
    pub pack_checksum: [u8; 20],
    pub thin_bases_added: usize,
}

impl IndexedPack {
    pub fn write_index<W: Write>(&mut self, out: W, version: IndexVersion) -> PackResult<[u8; 20]> {
        let mut entries = self.entries.clone();
        PackIndexWriter::for_config(out, version, &entries)?.write(&mut entries, &self.pack_checksum)
    }

    pub fn to_index(&self) -> PackIndex {
        PackIndex::from_entries(self.entries.clone(), self.pack_checksum)
    }
}

struct ParsedEntry {
    offset: u64,
    kind: PackEntryKind,
    /// Inflated object bytes or delta instructions.
    payload: Vec<u8>,
    crc32: u32,
}

/// One resolved object waiting for its dependents to be expanded.
struct Resolved {
    entry: Option<usize>,
    id: ObjectId,
    kind: ObjectKind,
    data: Arc<[u8]>,
    depth: usize,
}

/// Parses pack streams, resolves their deltas and produces index entries.
pub struct PackIndexer {
    config: IndexerConfig,
}

impl PackIndexer {
    pub fn new(config: IndexerConfig) -> Self {
        Self { config }
    }

    /// Index `data`, a complete pack stream. `source` supplies bases for
    /// thin packs and is only consulted when `allow_thin` is set.
    pub fn index(
        &self,
        mut data: Vec<u8>,
        source: Option<&dyn BaseSource>,
        progress: &dyn ProgressMonitor,
    ) -> PackResult<IndexedPack> {
        let path = PathBuf::from("<incoming pack>");
        let count = self.check_framing(&data, &path)?;
        let body_end = data.len() - PACK_TRAILER_LEN as usize;

        progress.begin_task("Indexing objects", Some(count as u64));
        let mut parsed = Vec::with_capacity(count.min(body_end));
        let mut pos = PACK_HEADER_LEN as usize;
        for done in 0..count {
            check_cancelled(progress)?;
            let header_end = (pos + MAX_HEADER_LEN).min(body_end);
            if pos >= body_end {
                return Err(corrupt(&path, pos as u64, "pack ends before its last object"));
            }
            let header = entry::parse_header(&data[pos..header_end], pos as u64, &path)?;
            let start = pos + header.header_len;
            let (payload, consumed) = inflate_entry(&data[start..body_end], header.size, &path, pos as u64)?;
            let end = start + consumed;
            parsed.push(ParsedEntry {
                offset: pos as u64,
                kind: header.kind,
                payload,
                crc32: crc32fast::hash(&data[pos..end]),
            });
            pos = end;
            progress.update(done as u64 + 1);
        }
        progress.end_task();
        if pos != body_end {
            return Err(corrupt(&path, pos as u64, "unexpected bytes after last object"));
        }

        let (ids, missing) = self.resolve(&parsed, source, &path, progress)?;

        let mut entries: Vec<PackedObjectInfo> = parsed
            .iter()
            .zip(&ids)
            .map(|(entry, id)| PackedObjectInfo::new(*id, entry.offset, Some(entry.crc32)))
            .collect();

        let mut thin_bases_added = 0;
        if self.config.fix_thin && !missing.is_empty() {
            data.truncate(body_end);
            for base in &missing {
                let offset = data.len() as u64;
                let mut entry = Vec::new();
                encode_header(&PackEntryKind::Whole(base.kind), base.size, offset, &mut entry);
                let mut encoder = ZlibEncoder::new(entry, Compression::default());
                encoder.write_all(&base.data)?;
                let entry = encoder.finish()?;
                entries.push(PackedObjectInfo::new(base.compute_id(), offset, Some(crc32fast::hash(&entry))));
                data.extend_from_slice(&entry);
            }
            let total = u32::try_from(entries.len())
                .map_err(|_| corrupt(&path, 8, "too many objects after completing thin pack"))?;
            data[8..12].copy_from_slice(&total.to_be_bytes());
            let trailer = sha1_digest(&data);
            data.extend_from_slice(&trailer);
            thin_bases_added = missing.len();
            debug!(bases = thin_bases_added, "completed thin pack");
        }

        let pack_checksum: [u8; 20] = data[data.len() - PACK_TRAILER_LEN as usize..]
            .try_into()
            .map_err(|_| corrupt(&path, 0, "pack trailer missing"))?;
        Ok(IndexedPack {
            pack_data: data,
            entries,
            pack_checksum,
            thin_bases_added,
        })
    }

    /// Validate the pack header and trailer; returns the object count.
    fn check_framing(&self, data: &[u8], path: &Path) -> PackResult<usize> {
        if data.len() < (PACK_HEADER_LEN + PACK_TRAILER_LEN) as usize {
            return Err(corrupt(path, 0, format!("pack is only {} bytes", data.len())));
        }
        if data[..4] != PACK_SIGNATURE {
            return Err(corrupt(path, 0, "missing PACK signature"));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if !matches!(version, 2 | 3) {
            return Err(PackError::UnsupportedVersion(version));
        }
        if self.config.verify_checksum {
            let body_end = data.len() - PACK_TRAILER_LEN as usize;
            if sha1_digest(&data[..body_end])[..] != data[body_end..] {
                return Err(corrupt(path, body_end as u64, "pack checksum does not match contents"));
            }
        }
        Ok(u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize)
    }

    /// Expand every delta, breadth first from the whole objects. Returns the
    /// id of each entry and the external bases that had to be fetched.
    fn resolve(
        &self,
        parsed: &[ParsedEntry],
        source: Option<&dyn BaseSource>,
        path: &Path,
        progress: &dyn ProgressMonitor,
    ) -> PackResult<(Vec<ObjectId>, Vec<RawObject>)> {
        let mut ids: Vec<Option<ObjectId>> = vec![None; parsed.len()];
        let mut by_offset: HashMap<u64, Vec<usize>> = HashMap::new();
        let mut by_id: BTreeMap<ObjectId, Vec<usize>> = BTreeMap::new();
        let mut queue = VecDeque::new();

        for (i, entry) in parsed.iter().enumerate() {
            match &entry.kind {
                PackEntryKind::Whole(kind) => {
                    let id = ObjectId::hash_object(*kind, &entry.payload);
                    ids[i] = Some(id);
                    queue.push_back(Resolved {
                        entry: Some(i),
                        id,
                        kind: *kind,
                        data: entry.payload.as_slice().into(),
                        depth: 0,
                    });
                }
                PackEntryKind::OfsDelta { base_offset } => by_offset.entry(*base_offset).or_default().push(i),
                PackEntryKind::RefDelta { base } => by_id.entry(*base).or_default().push(i),
            }
        }

        progress.begin_task("Resolving deltas", Some(parsed.len() as u64));
        self.drain(parsed, &mut queue, &mut by_offset, &mut by_id, &mut ids, path, progress)?;

        if let Some((offset, children)) = by_offset.iter().next() {
            let child = parsed[children[0]].offset;
            return Err(corrupt(path, child, format!("delta base offset {offset} is not an object")));
        }

        let mut missing = Vec::new();
        if !by_id.is_empty() {
            let source = match source {
                Some(source) if self.config.allow_thin => source,
                _ => {
                    let base = *by_id.keys().next().unwrap_or(&ObjectId::zero());
                    return Err(PackError::MissingDeltaBase { base });
                }
            };
            let wanted: Vec<ObjectId> = by_id.keys().copied().collect();
            for base in wanted {
                let object = source
                    .find_base(&base)?
                    .ok_or(PackError::MissingDeltaBase { base })?;
                queue.push_back(Resolved {
                    entry: None,
                    id: base,
                    kind: object.kind,
                    data: object.data.as_slice().into(),
                    depth: 0,
                });
                missing.push(object);
            }
            self.drain(parsed, &mut queue, &mut by_offset, &mut by_id, &mut ids, path, progress)?;
        }
        progress.end_task();

        let mut out = Vec::with_capacity(ids.len());
        for (i, id) in ids.into_iter().enumerate() {
            match id {
                Some(id) => out.push(id),
                None => return Err(corrupt(path, parsed[i].offset, "delta could not be resolved")),
            }
        }
        Ok((out, missing))
    }

    #[allow(clippy::too_many_arguments)]
    fn drain(
        &self,
        parsed: &[ParsedEntry],
        queue: &mut VecDeque<Resolved>,
        by_offset: &mut HashMap<u64, Vec<usize>>,
        by_id: &mut BTreeMap<ObjectId, Vec<usize>>,
        ids: &mut [Option<ObjectId>],
        path: &Path,
        progress: &dyn ProgressMonitor,
    ) -> PackResult<()> {
        let mut done = ids.iter().filter(|id| id.is_some()).count() as u64;
        while let Some(base) = queue.pop_front() {
            check_cancelled(progress)?;
            let mut children = by_id.remove(&base.id).unwrap_or_default();
            if let Some(i) = base.entry {
                children.extend(by_offset.remove(&parsed[i].offset).unwrap_or_default());
            }
            for child in children {
                let entry = &parsed[child];
                if base.depth + 1 > self.config.max_delta_depth {
                    return Err(corrupt(
                        path,
                        entry.offset,
                        format!("delta chain deeper than {}", self.config.max_delta_depth),
                    ));
                }
                let result = apply_delta(&base.data, &entry.payload)
                    .map_err(|e| corrupt(path, entry.offset, e.to_string()))?;
                let id = ObjectId::hash_object(base.kind, &result);
                ids[child] = Some(id);
                done += 1;
                progress.update(done);
                queue.push_back(Resolved {
                    entry: Some(child),
                    id,
                    kind: base.kind,
                    data: result.into(),
                    depth: base.depth + 1,
                });
            }
        }
        Ok(())
    }
}

fn corrupt(path: &Path, offset: u64, reason: impl Into<String>) -> PackError {
    PackError::CorruptPack {
        pack: path.to_path_buf(),
        offset,
        reason: reason.into(),
    }
}

/// Inflate one zlib stream that must produce exactly `size` bytes. Returns
/// the bytes and how much input the stream occupied.
fn inflate_entry(input: &[u8], size: u64, path: &Path, offset: u64) -> PackResult<(Vec<u8>, usize)> {
    let size = usize::try_from(size).map_err(|_| corrupt(path, offset, "object too large for memory"))?;
    let ceiling = size.saturating_add(1);
    let mut out = Vec::new();
    let mut inflater = Decompress::new(true);
    loop {
        grow_inflate_buffer(&mut out, ceiling)
            .map_err(|_| corrupt(path, offset, format!("cannot allocate {size} bytes")))?;
        let in_pos = inflater.total_in() as usize;
        let out_pos = out.len();
        let status = inflater
            .decompress_vec(&input[in_pos..], &mut out, FlushDecompress::None)
            .map_err(|e| corrupt(path, offset, format!("invalid deflate stream: {e}")))?;
        if out.len() > size {
            return Err(corrupt(path, offset, "inflated data exceeds declared size"));
        }
        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if inflater.total_in() as usize == in_pos && out.len() == out_pos {
                    return Err(corrupt(path, offset, "deflate stream truncated"));
                }
            }
        }
    }
    if out.len() != size {
        return Err(corrupt(
            path,
            offset,
            format!("inflated {} bytes, header declared {size}", out.len()),
        ));
    }
    Ok((out, inflater.total_in() as usize))
}
