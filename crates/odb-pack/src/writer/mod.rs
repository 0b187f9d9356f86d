//! Pack construction.
//!
//! A [`PackWriter`] moves through `Created -> Prepared -> Written ->
//! Released`. Preparing selects the objects and decides, per object,
//! whether stored bytes are copied from an existing pack, a stored delta is
//! reused, a new delta is computed, or the object is deflated from scratch.
//! Writing streams the pack; the index and name are only available after.

mod delta_search;
mod walk;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use odb_types::{ObjectId, ObjectKind};
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::PackConfig;
use crate::cursor::WindowCursor;
use crate::database::{pack_name, PackDatabase};
use crate::entry::{encode_header, PackEntryKind};
use crate::error::{PackError, PackResult};
use crate::index::{PackIndexWriter, PackedObjectInfo};
use crate::io::DigestWriter;
use crate::pack_file::PackFile;
use crate::progress::{check_cancelled, ProgressMonitor};

use delta_search::{Base, Candidate, Slot};
use walk::{ObjectWalk, WalkedObject};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriterState {
    Created,
    Prepared,
    Written,
    Released,
}

impl WriterState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Prepared => "prepared",
            Self::Written => "written",
            Self::Released => "released",
        }
    }
}

/// Counters describing the last written pack.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PackStatistics {
    pub total_objects: u64,
    pub total_deltas: u64,
    /// Whole objects copied from an existing pack without re-deflating.
    pub reused_objects: u64,
    pub reused_deltas: u64,
    pub computed_deltas: u64,
    /// Distinct bases referenced but not included.
    pub thin_bases: u64,
    pub total_bytes: u64,
}

/// Pack and index installed by [`PackWriter::write_to_directory`].
#[derive(Clone, Debug)]
pub struct WrittenPack {
    pub name: String,
    pub pack_path: PathBuf,
    pub index_path: PathBuf,
    pub checksum: [u8; 20],
    pub statistics: PackStatistics,
}

enum Representation {
    /// Deflate from the object content.
    Whole,
    ReuseWhole {
        pack: Arc<PackFile>,
        offset: u64,
    },
    ReuseDelta {
        pack: Arc<PackFile>,
        offset: u64,
        base: ObjectId,
    },
    Delta {
        base: ObjectId,
        delta: Vec<u8>,
    },
}

impl Representation {
    fn delta_base(&self) -> Option<&ObjectId> {
        match self {
            Self::ReuseDelta { base, .. } | Self::Delta { base, .. } => Some(base),
            Self::Whole | Self::ReuseWhole { .. } => None,
        }
    }
}

struct ObjectToPack {
    id: ObjectId,
    kind: ObjectKind,
    path_hash: u32,
    representation: Representation,
}

/// Builds one pack from a selection of objects in a [`PackDatabase`].
pub struct PackWriter {
    db: PackDatabase,
    config: PackConfig,
    state: WriterState,
    objects: Vec<ObjectToPack>,
    positions: HashMap<ObjectId, usize>,
    edges: Vec<WalkedObject>,
    order: Vec<usize>,
    entries: Vec<PackedObjectInfo>,
    checksum: Option<[u8; 20]>,
    statistics: PackStatistics,
}

impl PackWriter {
    pub fn new(db: PackDatabase, config: PackConfig) -> PackResult<Self> {
        config.validate()?;
        Ok(Self {
            db,
            config,
            state: WriterState::Created,
            objects: Vec::new(),
            positions: HashMap::new(),
            edges: Vec::new(),
            order: Vec::new(),
            entries: Vec::new(),
            checksum: None,
            statistics: PackStatistics::default(),
        })
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn config(&self) -> &PackConfig {
        &self.config
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn statistics(&self) -> &PackStatistics {
        &self.statistics
    }

    /// Ids in the order they will be (or were) written.
    pub fn write_order(&self) -> Vec<ObjectId> {
        self.order.iter().map(|&i| self.objects[i].id).collect()
    }

    fn expect_state(&self, expected: WriterState) -> PackResult<()> {
        if self.state != expected {
            return Err(PackError::InvalidState {
                expected: expected.name(),
                actual: self.state.name(),
            });
        }
        Ok(())
    }

    /// Select everything reachable from `interesting` that is not reachable
    /// from `uninteresting`.
    pub fn prepare_pack(
        &mut self,
        interesting: &[ObjectId],
        uninteresting: &[ObjectId],
        progress: &dyn ProgressMonitor,
    ) -> PackResult<()> {
        self.expect_state(WriterState::Created)?;
        let walk = ObjectWalk::new(
            &self.db,
            progress,
            self.config.ignore_missing_uninteresting,
            self.config.thin,
        )
        .run(interesting, uninteresting)?;
        self.select(walk.objects, walk.edges, progress)
    }

    /// Select exactly `ids`, without walking references.
    pub fn prepare_objects(&mut self, ids: &[ObjectId], progress: &dyn ProgressMonitor) -> PackResult<()> {
        self.expect_state(WriterState::Created)?;
        let mut seen = HashSet::new();
        let mut objects = Vec::with_capacity(ids.len());
        for id in ids {
            check_cancelled(progress)?;
            if !seen.insert(*id) {
                continue;
            }
            let loader = self.db.open_object(id, None)?;
            objects.push(WalkedObject {
                id: *id,
                kind: loader.kind(),
                path_hash: 0,
            });
        }
        self.select(objects, Vec::new(), progress)
    }

    fn select(
        &mut self,
        walked: Vec<WalkedObject>,
        edges: Vec<WalkedObject>,
        progress: &dyn ProgressMonitor,
    ) -> PackResult<()> {
        self.objects = walked
            .into_iter()
            .map(|object| ObjectToPack {
                id: object.id,
                kind: object.kind,
                path_hash: object.path_hash,
                representation: Representation::Whole,
            })
            .collect();
        self.positions = self
            .objects
            .iter()
            .enumerate()
            .map(|(i, object)| (object.id, i))
            .collect();
        self.edges = edges;

        if self.config.reuse_objects || self.config.reuse_deltas {
            self.choose_reuse(progress)?;
        }
        self.limit_depth();
        if self.config.delta_compress {
            self.search_deltas(progress)?;
            self.limit_depth();
        }
        self.order = self.compute_order();
        self.state = WriterState::Prepared;
        debug!(
            objects = self.objects.len(),
            edges = self.edges.len(),
            "prepared pack"
        );
        Ok(())
    }

    fn can_reference(&self, base: &ObjectId) -> bool {
        self.positions.contains_key(base) || (self.config.thin && self.edges.iter().any(|e| e.id == *base))
    }

    /// Look up each object's stored form and keep it when allowed.
    fn choose_reuse(&mut self, progress: &dyn ProgressMonitor) -> PackResult<()> {
        let ctx = self.db.read_context();
        let mut cursor = WindowCursor::new(ctx.cache());
        for i in 0..self.objects.len() {
            check_cancelled(progress)?;
            let id = self.objects[i].id;
            let Some(pack) = self.db.find_pack(&id)? else {
                continue;
            };
            let Some(offset) = pack.index().find_offset(&id) else {
                continue;
            };
            let header = match pack.read_entry_header(&mut cursor, offset) {
                Ok(header) => header,
                Err(err) => {
                    warn!(%id, pack = %pack.name(), error = %err, "stored entry unreadable, not reusing");
                    continue;
                }
            };
            let base = match header.kind {
                PackEntryKind::Whole(_) => None,
                PackEntryKind::OfsDelta { base_offset } => pack.reverse_index().find_object(base_offset),
                PackEntryKind::RefDelta { base } => Some(base),
            };
            let representation = match base {
                None if self.config.reuse_objects && !header.kind.is_delta() => {
                    Representation::ReuseWhole { pack, offset }
                }
                Some(base) if self.config.reuse_deltas && self.can_reference(&base) => {
                    Representation::ReuseDelta { pack, offset, base }
                }
                _ => continue,
            };
            self.objects[i].representation = representation;
        }
        Ok(())
    }

    fn search_deltas(&mut self, progress: &dyn ProgressMonitor) -> PackResult<()> {
        let mut candidates = Vec::new();
        for (i, object) in self.objects.iter().enumerate() {
            if matches!(object.representation, Representation::ReuseDelta { .. }) {
                continue;
            }
            let size = self.db.open_object(&object.id, Some(object.kind))?.size();
            candidates.push(Candidate {
                slot: Slot::Target(i),
                id: object.id,
                kind: object.kind,
                path_hash: object.path_hash,
                size,
            });
        }
        if self.config.thin {
            for edge in &self.edges {
                let size = match self.db.open_object(&edge.id, Some(edge.kind)) {
                    Ok(loader) => loader.size(),
                    Err(PackError::MissingObject(_)) => continue,
                    Err(err) => return Err(err),
                };
                candidates.push(Candidate {
                    slot: Slot::Edge,
                    id: edge.id,
                    kind: edge.kind,
                    path_hash: edge.path_hash,
                    size,
                });
            }
        }

        let choices = delta_search::search(
            &self.db,
            candidates,
            self.config.delta_search_window,
            self.config.max_delta_depth,
            progress,
        )?;
        for choice in choices {
            let base = match choice.base {
                Base::Target(index) => self.objects[index].id,
                Base::Edge(id) => id,
            };
            self.objects[choice.target].representation = Representation::Delta {
                base,
                delta: choice.delta,
            };
        }
        Ok(())
    }

    /// Break delta cycles and chains deeper than `max_delta_depth` by
    /// turning the offending objects back into whole objects.
    fn limit_depth(&mut self) {
        let max = self.config.max_delta_depth;
        let mut depth: Vec<Option<usize>> = vec![None; self.objects.len()];
        for start in 0..self.objects.len() {
            let mut path: Vec<usize> = Vec::new();
            let mut current = start;
            let mut below = loop {
                if let Some(known) = depth[current] {
                    break known;
                }
                if let Some(at) = path.iter().position(|&p| p == current) {
                    self.objects[current].representation = Representation::Whole;
                    depth[current] = Some(0);
                    path.truncate(at);
                    break 0;
                }
                let Some(base) = self.objects[current].representation.delta_base().copied() else {
                    depth[current] = Some(0);
                    break 0;
                };
                path.push(current);
                match self.positions.get(&base) {
                    Some(&next) => current = next,
                    None => break 0,
                }
            };
            for &node in path.iter().rev() {
                let mut d = below + 1;
                if d > max {
                    self.objects[node].representation = Representation::Whole;
                    d = 0;
                }
                depth[node] = Some(d);
                below = d;
            }
        }
    }

    /// Commits, tags, trees, then blobs; every in-pack delta base ahead of
    /// its dependents.
    fn compute_order(&self) -> Vec<usize> {
        let mut placed = vec![false; self.objects.len()];
        let mut order = Vec::with_capacity(self.objects.len());
        for kind in [ObjectKind::Commit, ObjectKind::Tag, ObjectKind::Tree, ObjectKind::Blob] {
            for i in 0..self.objects.len() {
                if self.objects[i].kind != kind || placed[i] {
                    continue;
                }
                let mut chain = vec![i];
                let mut current = i;
                while let Some(base) = self.objects[current].representation.delta_base() {
                    match self.positions.get(base) {
                        Some(&next) if !placed[next] && !chain.contains(&next) => {
                            chain.push(next);
                            current = next;
                        }
                        _ => break,
                    }
                }
                for &node in chain.iter().rev() {
                    placed[node] = true;
                    order.push(node);
                }
            }
        }
        order
    }

    /// Stream the pack to `out` and return its trailing digest.
    pub fn write_pack<W: Write>(&mut self, out: W, progress: &dyn ProgressMonitor) -> PackResult<[u8; 20]> {
        self.expect_state(WriterState::Prepared)?;
        let count = u32::try_from(self.order.len())
            .map_err(|_| PackError::InvalidConfig("too many objects for one pack".into()))?;
        let mut out = DigestWriter::new(out);
        out.write_all(b"PACK")?;
        out.write_all(&2u32.to_be_bytes())?;
        out.write_all(&count.to_be_bytes())?;

        let ctx = self.db.read_context();
        let mut cursor = WindowCursor::new(ctx.cache());
        let mut offsets: HashMap<ObjectId, u64> = HashMap::with_capacity(self.order.len());
        let mut entries = Vec::with_capacity(self.order.len());
        let mut statistics = PackStatistics::default();
        let mut thin_bases: HashSet<ObjectId> = HashSet::new();

        progress.begin_task("Writing objects", Some(self.order.len() as u64));
        for (done, &i) in self.order.iter().enumerate() {
            check_cancelled(progress)?;
            let offset = out.count();
            out.reset_crc();
            let object = &self.objects[i];
            self.write_object(&mut out, &mut cursor, object, offset, &offsets, &mut statistics)?;
            if let Some(base) = object.representation.delta_base() {
                if !self.positions.contains_key(base) {
                    thin_bases.insert(*base);
                }
            }
            offsets.insert(object.id, offset);
            entries.push(PackedObjectInfo::new(object.id, offset, Some(out.crc())));
            progress.update(done as u64 + 1);
        }
        progress.end_task();

        let checksum = out.digest();
        out.write_all(&checksum)?;
        out.flush()?;

        statistics.total_objects = entries.len() as u64;
        statistics.thin_bases = thin_bases.len() as u64;
        statistics.total_bytes = out.count();
        info!(
            objects = statistics.total_objects,
            deltas = statistics.total_deltas,
            reused_deltas = statistics.reused_deltas,
            reused_objects = statistics.reused_objects,
            bytes = statistics.total_bytes,
            "wrote pack"
        );
        self.entries = entries;
        self.checksum = Some(checksum);
        self.statistics = statistics;
        self.state = WriterState::Written;
        Ok(checksum)
    }

    fn write_object<W: Write>(
        &self,
        out: &mut DigestWriter<W>,
        cursor: &mut WindowCursor,
        object: &ObjectToPack,
        offset: u64,
        offsets: &HashMap<ObjectId, u64>,
        statistics: &mut PackStatistics,
    ) -> PackResult<()> {
        let mut header = Vec::new();
        match &object.representation {
            Representation::ReuseWhole { pack, offset: stored } => match pack.raw_entry(cursor, *stored) {
                Ok(raw) => {
                    encode_header(&PackEntryKind::Whole(object.kind), raw.header.size, offset, &mut header);
                    out.write_all(&header)?;
                    out.write_all(raw.payload())?;
                    statistics.reused_objects += 1;
                    return Ok(());
                }
                Err(err) => warn!(id = %object.id, error = %err, "cannot reuse stored object, recompressing"),
            },
            Representation::ReuseDelta {
                pack,
                offset: stored,
                base,
            } => match pack.raw_entry(cursor, *stored) {
                Ok(raw) => {
                    let kind = self.delta_kind(base, offsets);
                    encode_header(&kind, raw.header.size, offset, &mut header);
                    out.write_all(&header)?;
                    out.write_all(raw.payload())?;
                    statistics.reused_deltas += 1;
                    statistics.total_deltas += 1;
                    return Ok(());
                }
                Err(err) => warn!(id = %object.id, error = %err, "cannot reuse stored delta, recompressing"),
            },
            Representation::Delta { base, delta } => {
                let kind = self.delta_kind(base, offsets);
                encode_header(&kind, delta.len() as u64, offset, &mut header);
                out.write_all(&header)?;
                self.deflate_into(out, &mut delta.as_slice())?;
                statistics.computed_deltas += 1;
                statistics.total_deltas += 1;
                return Ok(());
            }
            Representation::Whole => {}
        }

        let loader = self.db.open_object(&object.id, Some(object.kind))?;
        header.clear();
        encode_header(&PackEntryKind::Whole(object.kind), loader.size(), offset, &mut header);
        out.write_all(&header)?;
        let mut stream = loader.open_stream()?;
        self.deflate_into(out, &mut stream)
    }

    fn delta_kind(&self, base: &ObjectId, offsets: &HashMap<ObjectId, u64>) -> PackEntryKind {
        match offsets.get(base) {
            Some(&base_offset) if self.config.delta_base_as_offset => PackEntryKind::OfsDelta { base_offset },
            _ => PackEntryKind::RefDelta { base: *base },
        }
    }

    fn deflate_into<W: Write>(&self, out: &mut DigestWriter<W>, input: &mut dyn io::Read) -> PackResult<()> {
        let mut encoder = ZlibEncoder::new(out, Compression::new(self.config.compression_level));
        io::copy(input, &mut encoder).map_err(PackError::from_stream_error)?;
        encoder.finish()?;
        Ok(())
    }

    /// Hex digest naming the written pack.
    pub fn compute_name(&self) -> PackResult<String> {
        self.expect_state(WriterState::Written)?;
        Ok(self.checksum.map(hex::encode).unwrap_or_default())
    }

    /// Entries of the written pack, in pack order.
    pub fn entries(&self) -> PackResult<&[PackedObjectInfo]> {
        self.expect_state(WriterState::Written)?;
        Ok(&self.entries)
    }

    /// Write the index of the written pack in the configured version.
    pub fn write_index<W: Write>(&self, out: W) -> PackResult<[u8; 20]> {
        self.expect_state(WriterState::Written)?;
        let checksum = self.checksum.unwrap_or_default();
        let mut entries = self.entries.clone();
        PackIndexWriter::for_config(out, self.config.index_version, &entries)?.write(&mut entries, &checksum)
    }

    /// Write pack and index into `dir` as `pack-<name>.pack`/`.idx`. Both go
    /// through temporary files; the pack is renamed into place first.
    pub fn write_to_directory(&mut self, dir: &Path, progress: &dyn ProgressMonitor) -> PackResult<WrittenPack> {
        self.expect_state(WriterState::Prepared)?;
        fs::create_dir_all(dir)?;

        let mut pack_tmp = NamedTempFile::new_in(dir)?;
        let checksum = {
            let mut buffered = BufWriter::new(pack_tmp.as_file_mut());
            let checksum = self.write_pack(&mut buffered, progress)?;
            buffered.flush()?;
            checksum
        };
        pack_tmp.as_file().sync_all()?;

        let mut index_tmp = NamedTempFile::new_in(dir)?;
        {
            let mut buffered = BufWriter::new(index_tmp.as_file_mut());
            self.write_index(&mut buffered)?;
            buffered.flush()?;
        }
        index_tmp.as_file().sync_all()?;

        let name = pack_name(&checksum);
        let pack_path = dir.join(format!("{name}.pack"));
        let index_path = dir.join(format!("{name}.idx"));
        pack_tmp.persist(&pack_path).map_err(|e| PackError::Io(e.error))?;
        index_tmp.persist(&index_path).map_err(|e| PackError::Io(e.error))?;
        debug!(pack = %name, "pack files in place");

        Ok(WrittenPack {
            name,
            pack_path,
            index_path,
            checksum,
            statistics: self.statistics.clone(),
        })
    }

    /// Drop the selection. The writer cannot be used afterwards.
    pub fn release(&mut self) {
        self.objects.clear();
        self.positions.clear();
        self.edges.clear();
        self.order.clear();
        self.state = WriterState::Released;
    }
}

impl std::fmt::Debug for PackWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackWriter")
            .field("state", &self.state)
            .field("objects", &self.objects.len())
            .finish()
    }
}
