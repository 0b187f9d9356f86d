//! Packed-object storage for the odb object store.
//!
//! Reads and writes git pack files: delta-compressed objects concatenated
//! into one `.pack`, located through a sorted `.idx`. Reads go through a
//! shared, bounded window cache so that many threads can serve objects from
//! many packs with a fixed number of open files and resident bytes.
//!
//! # Architecture
//!
//! - **Pack index** (`.idx` v1/v2): fan-out table, sorted ids, offsets, CRC-32s
//! - **Reverse index**: offset order, for entry boundaries and OFS_DELTA bases
//! - **Window cache**: process-wide cache of file handles and byte windows
//! - **Pack file**: header/trailer checks, entry parsing, delta chain walking
//! - **Object loader**: small objects in memory, large ones as streams
//! - **Pack database**: a directory of packs plus a loose store, newest first
//! - **Pack writer**: object selection, delta reuse and search, pack + index
//! - **Pack indexer**: builds an index for a received pack, thin packs included

pub mod base_cache;
pub mod config;
pub mod cursor;
pub mod database;
pub mod delta;
pub mod entry;
pub mod error;
pub mod index;
pub mod indexer;
mod io;
pub mod loader;
mod lru;
pub mod pack_file;
pub mod progress;
pub mod reverse_index;
pub mod window_cache;
pub mod writer;

#[cfg(test)]
mod testutil;

/// Longest delta chain any reader or indexer will follow.
pub const MAX_DELTA_DEPTH: usize = 10_000;

pub use base_cache::DeltaBaseCache;
pub use config::{IndexVersion, IndexerConfig, PackConfig, WindowCacheConfig};
pub use cursor::WindowCursor;
pub use database::{pack_name, PackDatabase};
pub use delta::{apply_delta, compute_delta, DeltaError, DeltaStream};
pub use entry::{EntryHeader, PackEntryKind};
pub use error::{PackError, PackResult};
pub use index::{oldest_possible_version, PackIndex, PackIndexWriter, PackedObjectInfo};
pub use indexer::{BaseSource, IndexedPack, PackIndexer};
pub use loader::{ObjectLoader, ObjectStream};
pub use pack_file::{ExternalObjects, PackFile, PackKey, RawEntry, ReadContext};
pub use progress::{NullProgress, ProgressMonitor, TracingProgress};
pub use reverse_index::PackReverseIndex;
pub use window_cache::{CacheStats, SharedWindowCache, WindowCache};
pub use writer::{PackStatistics, PackWriter, WriterState, WrittenPack};
