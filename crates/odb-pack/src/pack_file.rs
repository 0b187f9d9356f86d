use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use odb_types::{ObjectId, ObjectKind};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::base_cache::DeltaBaseCache;
use crate::cursor::{PackRangeReader, WindowCursor};
use crate::delta::{self, DeltaHeader};
use crate::entry::{self, EntryHeader, PackEntryKind, MAX_HEADER_LEN};
use crate::error::{PackError, PackResult};
use crate::index::PackIndex;
use crate::loader::{ObjectLoader, StreamBase};
use crate::reverse_index::PackReverseIndex;
use crate::window_cache::{read_exact_at, SharedWindowCache};
use crate::MAX_DELTA_DEPTH;

pub const PACK_SIGNATURE: [u8; 4] = *b"PACK";
pub const PACK_HEADER_LEN: u64 = 12;
pub const PACK_TRAILER_LEN: u64 = 20;

/// Streamed deltas nest one reader per link. Bases deeper than this are
/// expanded in memory instead.
pub(crate) const MAX_STREAMED_DELTA_DEPTH: usize = 64;

/// Process-unique identity of an opened pack, used to key cached windows
/// and delta bases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackKey(u64);

impl PackKey {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lookup of objects that are not in the pack being read: thin-pack bases
/// and replacements for a pack that disappeared mid-read.
pub trait ExternalObjects: Send + Sync {
    /// Open `id` from some other source. `depth` is the delta depth already
    /// spent by the caller.
    fn open_external(&self, id: &ObjectId, depth: usize) -> PackResult<Option<ObjectLoader>>;
}

/// Everything a read needs besides the pack itself.
#[derive(Clone)]
pub struct ReadContext {
    pub(crate) cache: SharedWindowCache,
    pub(crate) base_cache: Arc<DeltaBaseCache>,
    pub(crate) external: Option<Arc<dyn ExternalObjects>>,
}

impl ReadContext {
    pub fn new(cache: SharedWindowCache) -> Self {
        let limit = cache.config().delta_base_cache_limit;
        Self {
            cache,
            base_cache: Arc::new(DeltaBaseCache::new(limit)),
            external: None,
        }
    }

    pub fn with_base_cache(mut self, base_cache: Arc<DeltaBaseCache>) -> Self {
        self.base_cache = base_cache;
        self
    }

    pub fn with_external(mut self, external: Arc<dyn ExternalObjects>) -> Self {
        self.external = Some(external);
        self
    }

    pub fn cache(&self) -> &SharedWindowCache {
        &self.cache
    }

    pub fn base_cache(&self) -> &DeltaBaseCache {
        &self.base_cache
    }

    pub fn stream_threshold(&self) -> u64 {
        self.cache.current().config().stream_threshold as u64
    }
}

/// Raw stored bytes of one entry, header included.
#[derive(Clone, Debug)]
pub struct RawEntry {
    pub header: EntryHeader,
    pub bytes: Vec<u8>,
}

impl RawEntry {
    /// Deflated payload following the header.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.header.header_len..]
    }
}

struct DeltaLink {
    offset: u64,
    data_offset: u64,
    delta_size: u64,
}

enum ChainBase {
    Whole {
        offset: u64,
        data_offset: u64,
        kind: ObjectKind,
        size: u64,
    },
    Cached {
        kind: ObjectKind,
        data: Arc<[u8]>,
    },
    External(ObjectLoader),
}

impl ChainBase {
    fn kind(&self) -> ObjectKind {
        match self {
            Self::Whole { kind, .. } | Self::Cached { kind, .. } => *kind,
            Self::External(loader) => loader.kind(),
        }
    }

    fn into_stream_base(self) -> StreamBase {
        match self {
            Self::Whole { offset, .. } => StreamBase::Offset(offset),
            Self::Cached { data, .. } => StreamBase::Cached(data),
            Self::External(loader) => StreamBase::External(Box::new(loader)),
        }
    }
}

/// One `.pack` file paired with its index.
///
/// The file handle itself is owned by the window cache and opened lazily;
/// every open re-checks the pack against the index so a replaced file is
/// detected instead of misread.
pub struct PackFile {
    key: PackKey,
    pack_path: PathBuf,
    name: String,
    index: Arc<PackIndex>,
    reverse: OnceLock<PackReverseIndex>,
    length: AtomicU64,
    invalid: AtomicBool,
    modified: Option<SystemTime>,
}

impl PackFile {
    /// Open `pack-*.pack` together with the `.idx` beside it.
    pub fn open(pack_path: &Path) -> PackResult<Self> {
        let index = PackIndex::open(&pack_path.with_extension("idx"))?;
        Ok(Self::with_index(pack_path, index))
    }

    pub fn with_index(pack_path: &Path, index: PackIndex) -> Self {
        let name = pack_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let modified = fs::metadata(pack_path).and_then(|m| m.modified()).ok();
        Self {
            key: PackKey::next(),
            pack_path: pack_path.to_path_buf(),
            name,
            index: Arc::new(index),
            reverse: OnceLock::new(),
            length: AtomicU64::new(0),
            invalid: AtomicBool::new(false),
            modified,
        }
    }

    pub fn key(&self) -> PackKey {
        self.key
    }

    pub fn path(&self) -> &Path {
        &self.pack_path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> &Arc<PackIndex> {
        &self.index
    }

    pub fn reverse_index(&self) -> &PackReverseIndex {
        self.reverse.get_or_init(|| PackReverseIndex::build(&self.index))
    }

    pub fn object_count(&self) -> usize {
        self.index.object_count()
    }

    pub fn has_object(&self, id: &ObjectId) -> bool {
        !self.is_invalid() && self.index.has_object(id)
    }

    /// File length, known once a handle has been opened; zero before.
    pub fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Stop serving reads from this pack and drop its cached state.
    pub fn invalidate(&self, ctx: &ReadContext) {
        if !self.invalid.swap(true, Ordering::AcqRel) {
            warn!(pack = %self.name, "invalidating pack");
        }
        ctx.cache.current().purge(self.key);
        ctx.base_cache.purge(self.key);
    }

    pub(crate) fn corrupt(&self, offset: u64, reason: impl Into<String>) -> PackError {
        PackError::CorruptPack {
            pack: self.pack_path.clone(),
            offset,
            reason: reason.into(),
        }
    }

    fn corrupt_object(&self, id: ObjectId, offset: u64, reason: impl std::fmt::Display) -> PackError {
        PackError::CorruptObject {
            id,
            pack: self.pack_path.clone(),
            reason: format!("delta at offset {offset}: {reason}"),
        }
    }

    fn mismatch(&self, reason: impl Into<String>) -> PackError {
        PackError::PackMismatch {
            pack: self.pack_path.clone(),
            reason: reason.into(),
        }
    }

    /// Open the pack file and check that it is the pack the index describes.
    pub(crate) fn open_handle(&self) -> PackResult<File> {
        let file = File::open(&self.pack_path)?;
        let length = file.metadata()?.len();
        if length < PACK_HEADER_LEN + PACK_TRAILER_LEN {
            return Err(self.mismatch(format!("file is only {length} bytes")));
        }

        let mut header = [0u8; PACK_HEADER_LEN as usize];
        read_exact_at(&file, &mut header, 0)?;
        if header[..4] != PACK_SIGNATURE {
            return Err(self.mismatch("missing PACK signature"));
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if !matches!(version, 2 | 3) {
            return Err(PackError::UnsupportedVersion(version));
        }
        let count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        if count != self.index.object_count() {
            return Err(self.mismatch(format!(
                "pack holds {count} objects, index lists {}",
                self.index.object_count()
            )));
        }

        let mut trailer = [0u8; PACK_TRAILER_LEN as usize];
        read_exact_at(&file, &mut trailer, length - PACK_TRAILER_LEN)?;
        if &trailer != self.index.pack_checksum() {
            return Err(self.mismatch("pack checksum differs from index"));
        }

        self.length.store(length, Ordering::Release);
        debug!(pack = %self.name, length, "opened pack");
        Ok(file)
    }

    pub fn read_entry_header(&self, cursor: &mut WindowCursor, offset: u64) -> PackResult<EntryHeader> {
        if offset < PACK_HEADER_LEN {
            return Err(self.corrupt(offset, "entry offset inside pack header"));
        }
        let mut buf = [0u8; MAX_HEADER_LEN];
        let n = cursor.copy(self, offset, &mut buf)?;
        entry::parse_header(&buf[..n], offset, &self.pack_path)
    }

    /// Open `id` if this pack holds it.
    pub fn open_object(self: &Arc<Self>, ctx: &ReadContext, id: &ObjectId) -> PackResult<Option<ObjectLoader>> {
        match self.index.find_offset(id) {
            Some(offset) => self.load_at(ctx, Some(*id), offset, 0).map(Some),
            None => Ok(None),
        }
    }

    /// Open the object whose entry starts at `offset`.
    pub fn load_offset(self: &Arc<Self>, ctx: &ReadContext, offset: u64) -> PackResult<ObjectLoader> {
        self.load_at(ctx, None, offset, 0)
    }

    pub(crate) fn load_at(
        self: &Arc<Self>,
        ctx: &ReadContext,
        id: Option<ObjectId>,
        offset: u64,
        depth: usize,
    ) -> PackResult<ObjectLoader> {
        if depth > MAX_DELTA_DEPTH {
            return Err(self.corrupt(offset, format!("delta chain deeper than {MAX_DELTA_DEPTH}")));
        }
        let id = match id {
            Some(id) => id,
            None => self
                .reverse_index()
                .find_object(offset)
                .ok_or_else(|| self.corrupt(offset, "no indexed object starts here"))?,
        };
        let threshold = ctx.stream_threshold();
        let mut cursor = WindowCursor::new(&ctx.cache);
        let header = self.read_entry_header(&mut cursor, offset)?;
        let data_offset = offset + header.header_len as u64;

        if let PackEntryKind::Whole(kind) = header.kind {
            if header.size > threshold {
                return Ok(ObjectLoader::whole(
                    id,
                    kind,
                    header.size,
                    threshold,
                    Arc::clone(self),
                    ctx.clone(),
                    data_offset,
                ));
            }
            let data = cursor.inflate(self, data_offset, header.size)?;
            return Ok(ObjectLoader::from_bytes(id, kind, data, threshold));
        }

        if let Some((kind, data)) = ctx.base_cache.get(self.key, offset) {
            return Ok(ObjectLoader::from_bytes(id, kind, data, threshold));
        }

        let (links, base) = self.walk_chain(&mut cursor, ctx, offset, header, depth)?;
        let top = &links[0];
        let sizes = self.delta_sizes(&mut cursor, top)?;
        let kind = base.kind();

        if sizes.result_size > threshold && depth < MAX_STREAMED_DELTA_DEPTH {
            let base = match links.get(1) {
                Some(next) => StreamBase::Offset(next.offset),
                None => base.into_stream_base(),
            };
            return Ok(ObjectLoader::delta(
                id,
                kind,
                sizes.result_size,
                threshold,
                Arc::clone(self),
                ctx.clone(),
                top.data_offset,
                top.delta_size,
                sizes.base_size,
                base,
                depth,
            ));
        }

        let data = self.apply_chain(&mut cursor, ctx, id, &links, base)?;
        Ok(ObjectLoader::from_bytes(id, kind, data, threshold))
    }

    /// Follow base references from the delta at `offset` down to something
    /// with bytes: a whole entry, a cached base, or an external object.
    /// `links[0]` is the requested entry.
    fn walk_chain(
        &self,
        cursor: &mut WindowCursor,
        ctx: &ReadContext,
        offset: u64,
        mut header: EntryHeader,
        depth: usize,
    ) -> PackResult<(Vec<DeltaLink>, ChainBase)> {
        let mut links = Vec::new();
        let mut visited = HashSet::new();
        let mut current = offset;
        loop {
            if !visited.insert(current) {
                return Err(self.corrupt(current, "delta chain loops back on itself"));
            }
            if depth + links.len() > MAX_DELTA_DEPTH {
                return Err(self.corrupt(offset, format!("delta chain deeper than {MAX_DELTA_DEPTH}")));
            }
            let data_offset = current + header.header_len as u64;
            let link = DeltaLink {
                offset: current,
                data_offset,
                delta_size: header.size,
            };
            let base_offset = match header.kind {
                PackEntryKind::Whole(kind) => {
                    let base = ChainBase::Whole {
                        offset: current,
                        data_offset,
                        kind,
                        size: header.size,
                    };
                    return Ok((links, base));
                }
                PackEntryKind::OfsDelta { base_offset } => base_offset,
                PackEntryKind::RefDelta { base } => match self.index.find_offset(&base) {
                    Some(base_offset) => base_offset,
                    None => {
                        links.push(link);
                        let external = ctx
                            .external
                            .as_ref()
                            .ok_or(PackError::MissingDeltaBase { base })?;
                        let loader = external
                            .open_external(&base, depth + links.len())?
                            .ok_or(PackError::MissingDeltaBase { base })?;
                        return Ok((links, ChainBase::External(loader)));
                    }
                },
            };
            links.push(link);
            if let Some((kind, data)) = ctx.base_cache.get(self.key, base_offset) {
                return Ok((links, ChainBase::Cached { kind, data }));
            }
            current = base_offset;
            header = self.read_entry_header(cursor, current)?;
        }
    }

    fn delta_sizes(&self, cursor: &mut WindowCursor, link: &DeltaLink) -> PackResult<DeltaHeader> {
        let max = link.delta_size.min(20) as usize;
        let prefix = cursor.inflate_prefix(self, link.data_offset, max)?;
        delta::parse_header(&prefix).map_err(|e| self.corrupt(link.offset, e.to_string()))
    }

    /// Expand the chain bottom-up, caching every intermediate base.
    fn apply_chain(
        &self,
        cursor: &mut WindowCursor,
        ctx: &ReadContext,
        id: ObjectId,
        links: &[DeltaLink],
        base: ChainBase,
    ) -> PackResult<Arc<[u8]>> {
        let (kind, mut data): (ObjectKind, Arc<[u8]>) = match base {
            ChainBase::Whole {
                offset,
                data_offset,
                kind,
                size,
            } => {
                let data: Arc<[u8]> = cursor.inflate(self, data_offset, size)?.into();
                ctx.base_cache.store(self.key, offset, kind, Arc::clone(&data));
                (kind, data)
            }
            ChainBase::Cached { kind, data } => (kind, data),
            ChainBase::External(loader) => (loader.kind(), loader.read_all()?.into()),
        };
        for (i, link) in links.iter().enumerate().rev() {
            let delta = cursor.inflate(self, link.data_offset, link.delta_size)?;
            data = delta::apply_delta(&data, &delta)
                .map_err(|e| self.corrupt_object(id, link.offset, e))?
                .into();
            if i > 0 {
                ctx.base_cache.store(self.key, link.offset, kind, Arc::clone(&data));
            }
        }
        Ok(data)
    }

    /// Stored bytes of the entry at `offset`, checked against the index
    /// CRC-32 when the index has one.
    pub fn raw_entry(&self, cursor: &mut WindowCursor, offset: u64) -> PackResult<RawEntry> {
        let header = self.read_entry_header(cursor, offset)?;
        let end = self
            .reverse_index()
            .find_next_offset(offset, self.length() - PACK_TRAILER_LEN)?;
        let mut bytes = vec![0u8; (end - offset) as usize];
        cursor.read_exact(self, offset, &mut bytes)?;

        if let Some(id) = self.reverse_index().find_object(offset) {
            if let Ok(Some(expected)) = self.index.find_crc32(&id) {
                let actual = crc32fast::hash(&bytes);
                if actual != expected {
                    return Err(self.corrupt(
                        offset,
                        format!("CRC-32 {actual:08x} does not match index {expected:08x}"),
                    ));
                }
            }
        }
        Ok(RawEntry { header, bytes })
    }

    /// Copy the stored bytes of one entry to `out`.
    pub fn copy_raw(&self, cursor: &mut WindowCursor, offset: u64, out: &mut dyn Write) -> PackResult<u64> {
        let raw = self.raw_entry(cursor, offset)?;
        out.write_all(&raw.bytes)?;
        Ok(raw.bytes.len() as u64)
    }

    /// Re-hash the whole pack, check every entry CRC and every object id.
    pub fn verify(self: &Arc<Self>, ctx: &ReadContext) -> PackResult<()> {
        let mut range = PackRangeReader::new(Arc::clone(self), &ctx.cache, 0);
        range.prime()?;
        let length = self.length();
        let mut hasher = Sha1::new();
        let mut reader = range.take(length - PACK_TRAILER_LEN);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).map_err(PackError::from_stream_error)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest: [u8; 20] = hasher.finalize().into();
        if &digest != self.index.pack_checksum() {
            return Err(self.corrupt(length - PACK_TRAILER_LEN, "pack checksum does not match contents"));
        }

        let mut cursor = WindowCursor::new(&ctx.cache);
        let offsets: Vec<u64> = self.reverse_index().offsets().collect();
        for offset in offsets {
            self.raw_entry(&mut cursor, offset)?;
            let loader = self.load_at(ctx, None, offset, 0)?;
            let data = loader.read_all()?;
            let actual = ObjectId::hash_object(loader.kind(), &data);
            if actual != loader.id() {
                return Err(PackError::CorruptObject {
                    id: loader.id(),
                    pack: self.pack_path.clone(),
                    reason: format!("content hashes to {actual}"),
                });
            }
        }
        debug!(pack = %self.name, objects = self.object_count(), "verified pack");
        Ok(())
    }
}

impl std::fmt::Debug for PackFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackFile")
            .field("path", &self.pack_path)
            .field("objects", &self.index.object_count())
            .field("invalid", &self.is_invalid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowCacheConfig;
    use crate::testutil::{build_pack, encode_pack, noise, write_pack, TestObject};
    use odb_store::RawObject;

    fn context(stream_threshold: usize) -> ReadContext {
        let cache = SharedWindowCache::new(WindowCacheConfig {
            window_size: 4096,
            max_bytes: 64 * 4096,
            stream_threshold,
            ..Default::default()
        })
        .unwrap();
        ReadContext::new(cache)
    }

    fn versions(count: usize) -> Vec<Vec<u8>> {
        let mut current = noise(3000, 11);
        (0..count)
            .map(|i| {
                let at = (i * 131) % current.len();
                current[at] ^= 0x5a;
                current.extend_from_slice(format!("revision {i}\n").as_bytes());
                current.clone()
            })
            .collect()
    }

    fn open(built: &crate::testutil::BuiltPack) -> Arc<PackFile> {
        Arc::new(PackFile::open(&built.pack_path).unwrap())
    }

    struct Fixed(RawObject);

    impl ExternalObjects for Fixed {
        fn open_external(&self, id: &ObjectId, _depth: usize) -> PackResult<Option<ObjectLoader>> {
            if *id == self.0.compute_id() {
                return Ok(Some(ObjectLoader::from_raw(*id, self.0.clone(), u64::MAX)));
            }
            Ok(None)
        }
    }

    #[test]
    fn loads_whole_and_delta_objects() {
        let dir = tempfile::tempdir().unwrap();
        let v = versions(4);
        let built = build_pack(
            dir.path(),
            &[
                TestObject::blob(v[0].clone()),
                TestObject::ofs_delta(0, v[1].clone()),
                TestObject::ofs_delta(1, v[2].clone()),
                TestObject::ref_delta(2, v[3].clone()),
            ],
        );
        let pack = open(&built);
        let ctx = context(1 << 20);
        for (i, id) in built.ids().iter().enumerate() {
            let loader = pack.open_object(&ctx, id).unwrap().unwrap();
            assert_eq!(loader.kind(), ObjectKind::Blob);
            assert_eq!(loader.cached_bytes().unwrap(), &v[i][..]);
        }
        assert!(!ctx.base_cache().is_empty());
        assert!(pack
            .open_object(&ctx, &ObjectId::hash_object(ObjectKind::Blob, b"absent"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn large_objects_stream() {
        let dir = tempfile::tempdir().unwrap();
        let v = versions(3);
        let built = build_pack(
            dir.path(),
            &[
                TestObject::blob(v[0].clone()),
                TestObject::ofs_delta(0, v[1].clone()),
                TestObject::ofs_delta(1, v[2].clone()),
            ],
        );
        let pack = open(&built);
        let ctx = context(1000);
        for (i, id) in built.ids().iter().enumerate() {
            let loader = pack.open_object(&ctx, id).unwrap().unwrap();
            assert!(loader.is_large());
            assert_eq!(loader.size(), v[i].len() as u64);
            assert!(matches!(loader.cached_bytes(), Err(PackError::LargeObject { .. })));
            let mut out = Vec::new();
            loader.open_stream().unwrap().read_to_end(&mut out).unwrap();
            assert_eq!(out, v[i]);
        }
    }

    #[test]
    fn deep_large_chains_stream_with_bounded_nesting() {
        let dir = tempfile::tempdir().unwrap();
        let links = MAX_STREAMED_DELTA_DEPTH + 6;
        let mut current = noise(400, 17);
        let mut objects = vec![TestObject::blob(current.clone())];
        let mut tip = current.clone();
        for i in 0..links {
            current[(i * 7) % 400] ^= 0x33;
            current.extend_from_slice(b"+");
            tip = current.clone();
            objects.push(TestObject::ofs_delta(i, tip.clone()));
        }
        let built = build_pack(dir.path(), &objects);
        let pack = open(&built);
        let ctx = context(100);

        let loader = pack.open_object(&ctx, &built.ids()[links]).unwrap().unwrap();
        assert!(loader.is_large());
        let mut out = Vec::new();
        loader.open_stream().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, tip);

        let deep_base = built.entries[links - MAX_STREAMED_DELTA_DEPTH].offset;
        let base = pack.load_at(&ctx, None, deep_base, MAX_STREAMED_DELTA_DEPTH).unwrap();
        assert!(base.is_large());
        assert!(base.cached_arc().is_some());
        let shallow = pack.load_at(&ctx, None, deep_base, 0).unwrap();
        assert!(shallow.cached_arc().is_none());
    }

    #[test]
    fn threshold_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let data = noise(500, 3);
        let built = build_pack(dir.path(), &[TestObject::blob(data.clone())]);
        let pack = open(&built);
        let id = built.ids()[0];

        let at_limit = pack.open_object(&context(500), &id).unwrap().unwrap();
        assert!(!at_limit.is_large());
        assert_eq!(at_limit.cached_bytes().unwrap(), &data[..]);

        let over = pack.open_object(&context(499), &id).unwrap().unwrap();
        assert!(over.is_large());
    }

    #[test]
    fn thin_delta_needs_external_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = RawObject::new(ObjectKind::Blob, noise(2000, 5));
        let mut target = base.data.clone();
        target.extend_from_slice(b"appended");
        let built = build_pack(dir.path(), &[TestObject::thin(base.clone(), target.clone())]);
        let pack = open(&built);
        let id = built.ids()[0];

        let ctx = context(1 << 20);
        assert!(matches!(
            pack.open_object(&ctx, &id),
            Err(PackError::MissingDeltaBase { base: b }) if b == base.compute_id()
        ));

        let ctx = ctx.with_external(Arc::new(Fixed(base)));
        let loader = pack.open_object(&ctx, &id).unwrap().unwrap();
        assert_eq!(loader.cached_bytes().unwrap(), &target[..]);
    }

    #[test]
    fn index_for_other_pack_is_a_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let a = build_pack(dir.path(), &[TestObject::blob(b"one".to_vec())]);
        let b = build_pack(dir.path(), &[TestObject::blob(b"two".to_vec())]);
        fs::copy(&b.pack_path, &a.pack_path).unwrap();
        let pack = open(&a);
        let ctx = context(1 << 20);
        let err = pack.open_object(&ctx, &a.ids()[0]).unwrap_err();
        assert!(matches!(err, PackError::PackMismatch { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn missing_pack_file_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let built = build_pack(dir.path(), &[TestObject::blob(b"gone".to_vec())]);
        let pack = open(&built);
        fs::remove_file(&built.pack_path).unwrap();
        let err = pack.open_object(&context(1 << 20), &built.ids()[0]).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn raw_entry_checks_crc() {
        let dir = tempfile::tempdir().unwrap();
        let encoded = encode_pack(&[TestObject::blob(noise(300, 9)), TestObject::blob(b"tail".to_vec())]);
        let built = write_pack(dir.path(), &encoded, 2);
        let pack = open(&built);
        let ctx = context(1 << 20);
        let mut cursor = WindowCursor::new(&ctx.cache);

        let offset = built.entries[0].offset;
        let raw = pack.raw_entry(&mut cursor, offset).unwrap();
        assert_eq!(raw.bytes.len() as u64, built.entries[1].offset - offset);
        assert_eq!(crc32fast::hash(&raw.bytes), built.entries[0].crc32.unwrap());

        let mut corrupted = encoded.bytes.clone();
        corrupted[offset as usize + 20] ^= 0xff;
        fs::write(&built.pack_path, &corrupted).unwrap();
        let pack = open(&built);
        let mut cursor = WindowCursor::new(&ctx.cache);
        assert!(matches!(
            pack.raw_entry(&mut cursor, offset),
            Err(PackError::CorruptPack { .. })
        ));
    }

    #[test]
    fn verify_accepts_good_pack_and_rejects_damage() {
        let dir = tempfile::tempdir().unwrap();
        let v = versions(3);
        let encoded = encode_pack(&[
            TestObject::blob(v[0].clone()),
            TestObject::ofs_delta(0, v[1].clone()),
            TestObject::ref_delta(0, v[2].clone()),
        ]);
        let built = write_pack(dir.path(), &encoded, 2);
        let ctx = context(1 << 20);
        open(&built).verify(&ctx).unwrap();

        let mut damaged = encoded.bytes.clone();
        damaged[40] ^= 0x01;
        fs::write(&built.pack_path, &damaged).unwrap();
        assert!(open(&built).verify(&context(1 << 20)).is_err());
    }

    #[test]
    fn invalidate_purges_cached_state() {
        let dir = tempfile::tempdir().unwrap();
        let v = versions(2);
        let built = build_pack(
            dir.path(),
            &[TestObject::blob(v[0].clone()), TestObject::ofs_delta(0, v[1].clone())],
        );
        let pack = open(&built);
        let ctx = context(1 << 20);
        pack.open_object(&ctx, &built.ids()[1]).unwrap();
        assert!(ctx.cache().stats().open_windows > 0);

        pack.invalidate(&ctx);
        assert!(pack.is_invalid());
        assert!(!pack.has_object(&built.ids()[0]));
        assert_eq!(ctx.cache().stats().open_windows, 0);
        assert!(ctx.base_cache().is_empty());
    }
}
