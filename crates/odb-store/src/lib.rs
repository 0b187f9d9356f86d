//! Object model and collaborator interfaces for the odb object store.
//!
//! The packed-object engine (`odb-pack`) consumes the loose store only through
//! the [`LooseObjectSource`] trait defined here. This crate also owns the
//! canonical encodings of trees, commits, and tags so that graph walks can
//! discover which objects another object references.
//!
//! # Object Types
//!
//! - [`RawObject`] -- kind tag + canonical bytes, the unit every store returns
//! - [`Tree`] -- directory listing mapping names to object references
//! - [`Commit`] -- root tree plus parent commits
//! - [`Tag`] -- annotated pointer at another object
//!
//! # Backends
//!
//! - [`InMemoryLooseStore`] -- `BTreeMap`-based loose store for tests and embedding
//!
//! # Design Rules
//!
//! 1. Objects are immutable once written (content addressing guarantees this).
//! 2. Concurrent reads are always safe.
//! 3. Ambiguity of a short prefix is decided by the caller, never by a store
//!    (see [`Resolution`]).

pub mod error;
pub mod memory;
pub mod object;
pub mod resolution;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryLooseStore;
pub use object::{references, Commit, EntryMode, ObjectRef, RawObject, Tag, Tree, TreeEntry};
pub use resolution::Resolution;
pub use traits::LooseObjectSource;
