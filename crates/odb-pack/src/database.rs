use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, SystemTime};

use odb_store::{LooseObjectSource, RawObject, Resolution};
use odb_types::{AbbreviatedObjectId, ObjectId, ObjectKind, MIN_ABBREVIATION_LENGTH, OBJECT_ID_HEX_LENGTH};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::base_cache::DeltaBaseCache;
use crate::config::IndexerConfig;
use crate::error::{PackError, PackResult};
use crate::index::PackIndex;
use crate::indexer::{BaseSource, PackIndexer};
use crate::loader::ObjectLoader;
use crate::pack_file::{ExternalObjects, PackFile, ReadContext};
use crate::progress::NullProgress;
use crate::window_cache::SharedWindowCache;

/// Directory modification times this close to the scan are not trusted;
/// a change landing in the same timestamp tick would go unnoticed.
const RACY_WINDOW: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug)]
struct DirSnapshot {
    modified: Option<SystemTime>,
    scanned: SystemTime,
}

impl DirSnapshot {
    fn take(dir: &Path) -> Self {
        Self {
            modified: modified_time(dir),
            scanned: SystemTime::now(),
        }
    }

    fn is_modified(&self, dir: &Path) -> bool {
        if modified_time(dir) != self.modified {
            return true;
        }
        match self.modified {
            Some(modified) => self
                .scanned
                .duration_since(modified)
                .map_or(true, |age| age < RACY_WINDOW),
            None => false,
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

struct PackList {
    packs: Vec<Arc<PackFile>>,
    snapshot: Option<DirSnapshot>,
}

struct DatabaseInner {
    directory: PathBuf,
    cache: SharedWindowCache,
    base_cache: Arc<DeltaBaseCache>,
    loose: Option<Arc<dyn LooseObjectSource>>,
    state: RwLock<PackList>,
    this: Weak<DatabaseInner>,
}

/// All packs of one `objects/pack` directory, optionally backed by a loose
/// object store.
///
/// Lookups go newest pack first. The pack list is refreshed when the
/// directory changes and once more whenever a lookup misses, so packs
/// written or removed by another process are picked up.
#[derive(Clone)]
pub struct PackDatabase {
    inner: Arc<DatabaseInner>,
}

impl PackDatabase {
    pub fn open(
        directory: impl Into<PathBuf>,
        cache: SharedWindowCache,
        loose: Option<Arc<dyn LooseObjectSource>>,
    ) -> PackResult<Self> {
        let base_cache = Arc::new(DeltaBaseCache::new(cache.config().delta_base_cache_limit));
        let directory = directory.into();
        let inner = Arc::new_cyclic(|this| DatabaseInner {
            directory,
            cache,
            base_cache,
            loose,
            state: RwLock::new(PackList {
                packs: Vec::new(),
                snapshot: None,
            }),
            this: this.clone(),
        });
        inner.rescan()?;
        Ok(Self { inner })
    }

    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    pub fn cache(&self) -> &SharedWindowCache {
        &self.inner.cache
    }

    /// Read context whose thin-pack and retry lookups come back to this
    /// database.
    pub fn read_context(&self) -> ReadContext {
        self.inner.context()
    }

    /// Usable packs, newest first. Rescans first if the directory changed.
    pub fn packs(&self) -> PackResult<Vec<Arc<PackFile>>> {
        self.inner.packs()
    }

    /// Re-read the pack directory.
    pub fn rescan(&self) -> PackResult<()> {
        self.inner.rescan()
    }

    pub fn has(&self, id: &ObjectId) -> PackResult<bool> {
        if self.inner.has_once(id)? {
            return Ok(true);
        }
        self.inner.rescan()?;
        self.inner.has_once(id)
    }

    /// Open `id`, failing with [`PackError::IncorrectType`] when `expected`
    /// names another kind.
    pub fn open_object(&self, id: &ObjectId, expected: Option<ObjectKind>) -> PackResult<ObjectLoader> {
        let loader = self.inner.find(id, 0)?.ok_or(PackError::MissingObject(*id))?;
        match expected {
            Some(kind) => loader.expect_kind(kind),
            None => Ok(loader),
        }
    }

    /// Whole content of `id`, streaming it in if it is large.
    pub fn read(&self, id: &ObjectId) -> PackResult<RawObject> {
        let loader = self.open_object(id, None)?;
        let data = loader.read_all()?;
        Ok(RawObject::new(loader.kind(), data))
    }

    /// Newest usable pack holding `id`.
    pub fn find_pack(&self, id: &ObjectId) -> PackResult<Option<Arc<PackFile>>> {
        Ok(self.packs()?.into_iter().find(|pack| pack.has_object(id)))
    }

    /// Every stored id matching `prefix`, from all packs and loose storage.
    pub fn resolve(&self, prefix: &AbbreviatedObjectId) -> PackResult<BTreeSet<ObjectId>> {
        let mut matches = BTreeSet::new();
        for pack in self.packs()? {
            pack.index().resolve(prefix, &mut matches);
        }
        if let Some(loose) = &self.inner.loose {
            loose.resolve(prefix, &mut matches)?;
        }
        Ok(matches)
    }

    pub fn resolution(&self, prefix: &AbbreviatedObjectId) -> PackResult<Resolution> {
        Ok(Resolution::from_candidates(self.resolve(prefix)?))
    }

    /// Shortest abbreviation of `id`, at least `min_len` digits, that no
    /// other stored object shares.
    pub fn shortest_unique_abbreviation(&self, id: &ObjectId, min_len: usize) -> PackResult<AbbreviatedObjectId> {
        for nibbles in min_len.clamp(MIN_ABBREVIATION_LENGTH, OBJECT_ID_HEX_LENGTH)..OBJECT_ID_HEX_LENGTH {
            let abbrev = id.abbreviate(nibbles)?;
            if self.resolve(&abbrev)?.iter().all(|candidate| candidate == id) {
                return Ok(abbrev);
            }
        }
        Ok(id.abbreviate(OBJECT_ID_HEX_LENGTH)?)
    }

    /// Move a finished pack and index into the directory under their
    /// content name. The pack lands before the index so no reader sees an
    /// index without its pack.
    pub fn install_pack(&self, pack_path: &Path, index_path: &Path) -> PackResult<Arc<PackFile>> {
        let index = PackIndex::open(index_path)?;
        let name = pack_name(index.pack_checksum());
        let (pack_dest, index_dest) = self.destination(&name);
        fs::create_dir_all(&self.inner.directory)?;
        fs::rename(pack_path, &pack_dest)?;
        fs::rename(index_path, &index_dest)?;
        debug!(pack = %name, objects = index.object_count(), "installed pack");
        self.installed(&pack_dest)
    }

    /// Index a received pack stream and install it.
    pub fn insert_pack_bytes(&self, bytes: Vec<u8>, config: &IndexerConfig) -> PackResult<Arc<PackFile>> {
        let indexer = PackIndexer::new(config.clone());
        let source: Option<&dyn BaseSource> = if config.allow_thin { Some(self) } else { None };
        let mut indexed = indexer.index(bytes, source, &NullProgress)?;

        let mut index_bytes = Vec::new();
        indexed.write_index(&mut index_bytes, config.index_version)?;

        let name = pack_name(&indexed.pack_checksum);
        let (pack_dest, index_dest) = self.destination(&name);
        fs::create_dir_all(&self.inner.directory)?;
        persist(&self.inner.directory, &indexed.pack_data, &pack_dest)?;
        persist(&self.inner.directory, &index_bytes, &index_dest)?;
        debug!(pack = %name, objects = indexed.entries.len(), thin_bases = indexed.thin_bases_added, "inserted pack");
        self.installed(&pack_dest)
    }

    fn destination(&self, name: &str) -> (PathBuf, PathBuf) {
        let dir = &self.inner.directory;
        (dir.join(format!("{name}.pack")), dir.join(format!("{name}.idx")))
    }

    fn installed(&self, pack_path: &Path) -> PackResult<Arc<PackFile>> {
        self.inner.rescan()?;
        self.packs()?
            .into_iter()
            .find(|pack| pack.path() == pack_path)
            .ok_or_else(|| PackError::Io(io::Error::new(io::ErrorKind::NotFound, "installed pack vanished")))
    }
}

impl std::fmt::Debug for PackDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackDatabase")
            .field("directory", &self.inner.directory)
            .field("packs", &self.inner.read_state().packs.len())
            .finish()
    }
}

impl BaseSource for PackDatabase {
    fn find_base(&self, id: &ObjectId) -> PackResult<Option<RawObject>> {
        match self.inner.find(id, 0)? {
            Some(loader) => {
                let data = loader.read_all()?;
                Ok(Some(RawObject::new(loader.kind(), data)))
            }
            None => Ok(None),
        }
    }
}

/// `pack-<hex>` for a pack digest.
pub fn pack_name(checksum: &[u8; 20]) -> String {
    format!("pack-{}", hex::encode(checksum))
}

/// Write `bytes` to a temporary file in `dir`, then rename it to `dest`.
pub(crate) fn persist(dir: &Path, bytes: &[u8], dest: &Path) -> PackResult<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| PackError::Io(e.error))?;
    Ok(())
}

impl DatabaseInner {
    fn read_state(&self) -> RwLockReadGuard<'_, PackList> {
        self.state.read().expect("pack list lock poisoned")
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, PackList> {
        self.state.write().expect("pack list lock poisoned")
    }

    fn context(&self) -> ReadContext {
        let ctx = ReadContext::new(self.cache.clone()).with_base_cache(Arc::clone(&self.base_cache));
        match self.this.upgrade() {
            Some(this) => ctx.with_external(this),
            None => ctx,
        }
    }

    fn packs(&self) -> PackResult<Vec<Arc<PackFile>>> {
        let stale = {
            let state = self.read_state();
            state
                .snapshot
                .map_or(true, |snapshot| snapshot.is_modified(&self.directory))
        };
        if stale {
            self.rescan()?;
        }
        Ok(self
            .read_state()
            .packs
            .iter()
            .filter(|pack| !pack.is_invalid())
            .cloned()
            .collect())
    }

    fn rescan(&self) -> PackResult<()> {
        let mut state = self.write_state();
        let snapshot = DirSnapshot::take(&self.directory);

        let listing = match fs::read_dir(&self.directory) {
            Ok(listing) => listing,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.drop_packs(&state.packs, &[]);
                state.packs.clear();
                state.snapshot = Some(snapshot);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        for entry in listing {
            let path = entry?.path();
            let is_pack = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("pack-") && name.ends_with(".pack"));
            if is_pack && path.with_extension("idx").is_file() {
                found.push(path);
            }
        }

        let mut packs: Vec<Arc<PackFile>> = Vec::with_capacity(found.len());
        for path in found {
            let reusable = state
                .packs
                .iter()
                .find(|pack| pack.path() == path && !pack.is_invalid() && pack.modified() == modified_time(&path));
            match reusable {
                Some(pack) => packs.push(Arc::clone(pack)),
                None => match PackFile::open(&path) {
                    Ok(pack) => packs.push(Arc::new(pack)),
                    Err(e) => warn!(pack = ?path, error = %e, "skipping unreadable pack"),
                },
            }
        }
        packs.sort_by(|a, b| b.modified().cmp(&a.modified()).then_with(|| a.path().cmp(b.path())));

        self.drop_packs(&state.packs, &packs);
        debug!(directory = ?self.directory, packs = packs.len(), "scanned pack directory");
        state.packs = packs;
        state.snapshot = Some(snapshot);
        Ok(())
    }

    /// Release cached state of packs in `old` that are not in `kept`.
    fn drop_packs(&self, old: &[Arc<PackFile>], kept: &[Arc<PackFile>]) {
        for pack in old {
            if !kept.iter().any(|k| k.key() == pack.key()) {
                debug!(pack = %pack.name(), "dropping pack");
                self.cache.current().purge(pack.key());
                self.base_cache.purge(pack.key());
            }
        }
    }

    fn has_once(&self, id: &ObjectId) -> PackResult<bool> {
        if self.packs()?.iter().any(|pack| pack.has_object(id)) {
            return Ok(true);
        }
        match &self.loose {
            Some(loose) => Ok(loose.has(id)?),
            None => Ok(false),
        }
    }

    /// Look `id` up in every pack, then loose storage; on a miss rescan the
    /// directory and look once more.
    fn find(&self, id: &ObjectId, depth: usize) -> PackResult<Option<ObjectLoader>> {
        for attempt in 0..2 {
            if attempt > 0 {
                self.rescan()?;
            }
            if let Some(loader) = self.find_once(id, depth)? {
                return Ok(Some(loader));
            }
        }
        Ok(None)
    }

    fn find_once(&self, id: &ObjectId, depth: usize) -> PackResult<Option<ObjectLoader>> {
        let ctx = self.context();
        for pack in self.packs()? {
            let Some(offset) = pack.index().find_offset(id) else {
                continue;
            };
            if pack.is_invalid() {
                continue;
            }
            match pack.load_at(&ctx, Some(*id), offset, depth) {
                Ok(loader) => return Ok(Some(loader)),
                Err(err) if err.is_transient() => {
                    warn!(id = %id, pack = %pack.name(), error = %err, "pack changed during lookup");
                    pack.invalidate(&ctx);
                }
                Err(err) => return Err(err),
            }
        }
        if let Some(loose) = &self.loose {
            if let Some(object) = loose.open(id)? {
                return Ok(Some(ObjectLoader::from_raw(*id, object, ctx.stream_threshold())));
            }
        }
        Ok(None)
    }
}

impl ExternalObjects for DatabaseInner {
    fn open_external(&self, id: &ObjectId, depth: usize) -> PackResult<Option<ObjectLoader>> {
        self.find(id, depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowCacheConfig;
    use crate::testutil::{build_pack, TestObject};
    use odb_store::InMemoryLooseStore;

    fn cache() -> SharedWindowCache {
        SharedWindowCache::new(WindowCacheConfig::default()).unwrap()
    }

    fn blob_id(data: &[u8]) -> ObjectId {
        ObjectId::hash_object(ObjectKind::Blob, data)
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = PackDatabase::open(dir.path().join("absent"), cache(), None).unwrap();
        assert!(db.packs().unwrap().is_empty());
        assert!(!db.has(&blob_id(b"x")).unwrap());
        assert!(matches!(
            db.open_object(&blob_id(b"x"), None),
            Err(PackError::MissingObject(_))
        ));
    }

    #[test]
    fn reads_from_every_pack_and_loose_store() {
        let dir = tempfile::tempdir().unwrap();
        build_pack(dir.path(), &[TestObject::blob(b"first".to_vec())]);
        build_pack(dir.path(), &[TestObject::blob(b"second".to_vec())]);
        let loose = Arc::new(InMemoryLooseStore::new());
        let loose_id = loose.insert(RawObject::new(ObjectKind::Blob, b"loose".to_vec()));

        let db = PackDatabase::open(dir.path(), cache(), Some(loose)).unwrap();
        assert_eq!(db.packs().unwrap().len(), 2);
        assert_eq!(db.read(&blob_id(b"first")).unwrap().data, b"first");
        assert_eq!(db.read(&blob_id(b"second")).unwrap().data, b"second");
        assert_eq!(db.read(&loose_id).unwrap().data, b"loose");
        assert!(db.has(&loose_id).unwrap());
        assert!(db.find_pack(&loose_id).unwrap().is_none());
    }

    #[test]
    fn expected_kind_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        build_pack(dir.path(), &[TestObject::blob(b"typed".to_vec())]);
        let db = PackDatabase::open(dir.path(), cache(), None).unwrap();
        let id = blob_id(b"typed");
        assert!(db.open_object(&id, Some(ObjectKind::Blob)).is_ok());
        assert!(matches!(
            db.open_object(&id, Some(ObjectKind::Commit)),
            Err(PackError::IncorrectType {
                expected: ObjectKind::Commit,
                actual: ObjectKind::Blob,
                ..
            })
        ));
    }

    #[test]
    fn miss_triggers_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let db = PackDatabase::open(dir.path(), cache(), None).unwrap();
        build_pack(dir.path(), &[TestObject::blob(b"late".to_vec())]);
        assert_eq!(db.read(&blob_id(b"late")).unwrap().data, b"late");
    }

    #[test]
    fn removed_pack_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let built = build_pack(dir.path(), &[TestObject::blob(b"doomed".to_vec())]);
        let db = PackDatabase::open(dir.path(), cache(), None).unwrap();
        assert!(db.has(&blob_id(b"doomed")).unwrap());

        fs::remove_file(&built.pack_path).unwrap();
        fs::remove_file(&built.index_path).unwrap();
        db.rescan().unwrap();
        assert!(db.packs().unwrap().is_empty());
        assert!(!db.has(&blob_id(b"doomed")).unwrap());
    }

    #[test]
    fn corrupt_index_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        build_pack(dir.path(), &[TestObject::blob(b"good".to_vec())]);
        let bad = build_pack(dir.path(), &[TestObject::blob(b"bad".to_vec())]);
        fs::write(&bad.index_path, b"not an index").unwrap();

        let db = PackDatabase::open(dir.path(), cache(), None).unwrap();
        assert_eq!(db.packs().unwrap().len(), 1);
        assert!(db.has(&blob_id(b"good")).unwrap());
    }

    #[test]
    fn resolve_collects_packs_and_loose() {
        let dir = tempfile::tempdir().unwrap();
        let built = build_pack(
            dir.path(),
            &[TestObject::blob(b"a".to_vec()), TestObject::blob(b"b".to_vec())],
        );
        let loose = Arc::new(InMemoryLooseStore::new());
        let loose_id = loose.insert(RawObject::new(ObjectKind::Blob, b"c".to_vec()));
        let db = PackDatabase::open(dir.path(), cache(), Some(loose)).unwrap();

        for id in built.ids().iter().chain([&loose_id]) {
            let full = id.abbreviate(40).unwrap();
            assert_eq!(db.resolve(&full).unwrap(), BTreeSet::from([*id]));
            let short = db.shortest_unique_abbreviation(id, 4).unwrap();
            assert!(short.nibbles() >= 4);
            assert_eq!(db.resolution(&short).unwrap(), Resolution::Unique(*id));
        }

        let mut expected: BTreeSet<ObjectId> = built.ids().into_iter().collect();
        expected.insert(loose_id);
        let all: BTreeSet<ObjectId> = expected
            .iter()
            .flat_map(|id| db.resolve(&id.abbreviate(MIN_ABBREVIATION_LENGTH).unwrap()).unwrap())
            .collect();
        assert_eq!(all, expected);
        assert!(db.shortest_unique_abbreviation(&loose_id, 1).unwrap().nibbles() >= MIN_ABBREVIATION_LENGTH);
    }

    #[test]
    fn install_moves_pack_pair() {
        let staging = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let built = build_pack(staging.path(), &[TestObject::blob(b"moved".to_vec())]);
        let db = PackDatabase::open(target.path(), cache(), None).unwrap();

        let pack = db.install_pack(&built.pack_path, &built.index_path).unwrap();
        assert_eq!(pack.name(), pack_name(&built.checksum));
        assert!(!built.pack_path.exists());
        assert_eq!(db.read(&blob_id(b"moved")).unwrap().data, b"moved");
    }

    #[test]
    fn racy_snapshot_counts_as_modified() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = DirSnapshot::take(dir.path());
        assert!(snapshot.is_modified(dir.path()));

        let settled = DirSnapshot {
            modified: modified_time(dir.path()),
            scanned: SystemTime::now() + RACY_WINDOW * 2,
        };
        assert!(!settled.is_modified(dir.path()));
    }
}
