//! Process-wide cache of fixed-size pack windows and open file handles.
//!
//! Windows are handed out as `Arc<Window>` leases. The cache keeps its own
//! reference, so a window is borrowed exactly when its strong count is above
//! one, and borrowed windows are skipped during eviction. File reads happen
//! outside the bookkeeping lock.
//!
//! File handles follow the same lease rule. Every handle, cached or already
//! dropped from the map but still in a reader's hands, holds a slot of the
//! `max_open_files` budget until the file is closed; a reader that finds the
//! budget spent waits for a slot instead of opening past it.

use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::config::WindowCacheConfig;
use crate::error::PackResult;
use crate::lru::Lru;
use crate::pack_file::{PackFile, PackKey};

/// One cached slice of a pack file.
pub struct Window {
    pack: PackKey,
    start: u64,
    data: Box<[u8]>,
}

impl Window {
    pub(crate) fn contains(&self, pack: PackKey, position: u64) -> bool {
        self.pack == pack && position >= self.start && position < self.end()
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes from `position` to the end of the window.
    pub(crate) fn bytes_from(&self, position: u64) -> &[u8] {
        &self.data[(position - self.start) as usize..]
    }
}

/// How long a reader waits for a file slot before checking again. Slots
/// freed by a dropped handle notify without the cache lock, so a wakeup can
/// be missed.
const HANDLE_WAIT: Duration = Duration::from_millis(5);

#[derive(Default)]
struct HandleBudget {
    live: AtomicUsize,
    peak: AtomicUsize,
    released: Condvar,
}

impl HandleBudget {
    fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

/// One unit of the open file budget, returned on drop.
struct HandleSlot(Arc<HandleBudget>);

impl HandleSlot {
    fn reserve(budget: &Arc<HandleBudget>) -> Self {
        let now = budget.live.fetch_add(1, Ordering::AcqRel) + 1;
        budget.peak.fetch_max(now, Ordering::AcqRel);
        Self(Arc::clone(budget))
    }
}

impl Drop for HandleSlot {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::AcqRel);
        self.0.released.notify_all();
    }
}

/// Open pack file. The file closes before its budget slot is returned.
pub(crate) struct PackHandle {
    file: File,
    _slot: HandleSlot,
}

impl Deref for PackHandle {
    type Target = File;

    fn deref(&self) -> &File {
        &self.file
    }
}

/// Point-in-time counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Handles currently open, including ones being read after eviction.
    pub open_files: usize,
    /// Most handles ever open at once.
    pub peak_open_files: usize,
    pub open_windows: usize,
    pub open_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub evictions: u64,
    pub file_opens: u64,
}

type WindowKey = (PackKey, u64);

struct CacheState {
    windows: Lru<WindowKey, Arc<Window>>,
    files: Lru<PackKey, Arc<PackHandle>>,
    /// Packs some thread is opening right now.
    opening: HashSet<PackKey>,
    open_bytes: u64,
}

pub struct WindowCache {
    config: WindowCacheConfig,
    state: Mutex<CacheState>,
    budget: Arc<HandleBudget>,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
    file_opens: AtomicU64,
}

impl WindowCache {
    pub fn new(config: WindowCacheConfig) -> PackResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(CacheState {
                windows: Lru::new(),
                files: Lru::new(),
                opening: HashSet::new(),
                open_bytes: 0,
            }),
            budget: Arc::default(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            file_opens: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &WindowCacheConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().expect("window cache lock poisoned")
    }

    /// Lease the window covering `position`, reading it if absent.
    pub(crate) fn get(&self, pack: &PackFile, position: u64) -> PackResult<Arc<Window>> {
        let start = position & !(self.config.window_size as u64 - 1);
        let key = (pack.key(), start);
        if let Some(window) = self.lock().windows.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(window));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let file = self.file(pack)?;
        let length = pack.length();
        if position >= length {
            return Err(pack.corrupt(position, format!("offset beyond end of {length} byte pack")));
        }
        let len = (self.config.window_size as u64).min(length - start) as usize;
        let mut data = vec![0u8; len];
        read_exact_at(&file, &mut data, start)?;
        drop(file);
        self.loads.fetch_add(1, Ordering::Relaxed);
        debug!(pack = %pack.name(), start, len, "loaded window");

        let window = Arc::new(Window {
            pack: pack.key(),
            start,
            data: data.into_boxed_slice(),
        });

        let mut state = self.lock();
        if let Some(existing) = state.windows.get(&key) {
            return Ok(Arc::clone(existing));
        }
        state.windows.insert(key, Arc::clone(&window));
        state.open_bytes += len as u64;
        self.evict_windows(&mut state);
        Ok(window)
    }

    fn evict_windows(&self, state: &mut CacheState) {
        while state.open_bytes > self.config.max_bytes {
            let victim = state
                .windows
                .evict_oldest_where(|_, window| Arc::strong_count(window) == 1);
            match victim {
                Some((_, window)) => {
                    state.open_bytes -= window.len() as u64;
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    debug!(open_bytes = state.open_bytes, "all windows borrowed, over budget");
                    break;
                }
            }
        }
    }

    /// Shared handle to `pack`, opening and verifying it when not cached.
    ///
    /// At most one thread opens a given pack at a time. When every slot of
    /// the file budget is taken by a borrowed handle, this blocks until one
    /// is dropped.
    pub(crate) fn file(&self, pack: &PackFile) -> PackResult<Arc<PackHandle>> {
        let key = pack.key();
        let mut state = self.lock();
        let slot = loop {
            if let Some(handle) = state.files.get(&key) {
                return Ok(Arc::clone(handle));
            }
            if !state.opening.contains(&key) {
                self.close_idle_handles(&mut state);
                if self.budget.live() < self.config.max_open_files {
                    state.opening.insert(key);
                    break HandleSlot::reserve(&self.budget);
                }
            }
            state = self
                .budget
                .released
                .wait_timeout(state, HANDLE_WAIT)
                .expect("window cache lock poisoned")
                .0;
        };
        drop(state);

        let opened = pack.open_handle();
        let mut state = self.lock();
        state.opening.remove(&key);
        let handle = match opened {
            Ok(file) => Arc::new(PackHandle { file, _slot: slot }),
            Err(err) => {
                drop(state);
                drop(slot);
                return Err(err);
            }
        };
        self.file_opens.fetch_add(1, Ordering::Relaxed);
        state.files.insert(key, Arc::clone(&handle));
        drop(state);
        self.budget.released.notify_all();
        Ok(handle)
    }

    /// Close cached handles nobody is reading through until a slot is free.
    fn close_idle_handles(&self, state: &mut CacheState) {
        while self.budget.live() >= self.config.max_open_files {
            match state.files.evict_oldest_where(|_, handle| Arc::strong_count(handle) == 1) {
                Some((key, _)) => debug!(?key, "closed pack handle"),
                None => break,
            }
        }
    }

    /// Forget every window and the handle belonging to `pack`.
    pub(crate) fn purge(&self, pack: PackKey) {
        let mut state = self.lock();
        let dropped = state.windows.drain_where(|(key, _)| *key == pack);
        let bytes: u64 = dropped.iter().map(|w| w.len() as u64).sum();
        state.open_bytes -= bytes;
        state.files.remove(&pack);
    }

    /// Drop all windows and handles. Leases already handed out stay valid.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.windows.clear();
        state.files.clear();
        state.open_bytes = 0;
    }

    /// Files open right now, whether cached or still held by a reader.
    pub fn open_file_count(&self) -> usize {
        self.budget.live()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            open_files: self.budget.live(),
            peak_open_files: self.budget.peak.load(Ordering::Acquire),
            open_windows: state.windows.len(),
            open_bytes: state.open_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            file_opens: self.file_opens.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for WindowCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Reference-counted handle to the active window cache.
///
/// Reconfiguring installs a new cache; cursors that already hold the old one
/// keep reading through it until they are dropped.
#[derive(Clone, Debug)]
pub struct SharedWindowCache {
    inner: Arc<RwLock<Arc<WindowCache>>>,
}

impl SharedWindowCache {
    pub fn new(config: WindowCacheConfig) -> PackResult<Self> {
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(WindowCache::new(config)?))),
        })
    }

    pub fn current(&self) -> Arc<WindowCache> {
        Arc::clone(&self.inner.read().expect("window cache handle poisoned"))
    }

    pub fn config(&self) -> WindowCacheConfig {
        self.current().config().clone()
    }

    /// Swap in a cache built from `config`. The configuration is validated
    /// before anything changes.
    pub fn reconfigure(&self, config: WindowCacheConfig) -> PackResult<()> {
        let replacement = Arc::new(WindowCache::new(config)?);
        let previous = {
            let mut guard = self.inner.write().expect("window cache handle poisoned");
            std::mem::replace(&mut *guard, replacement)
        };
        debug!(stats = ?previous.stats(), "window cache reconfigured");
        previous.clear();
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        self.current().stats()
    }
}

#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
