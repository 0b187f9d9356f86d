//! Foundation types for the odb object store.
//!
//! Every other odb crate depends on `odb-types`. The types here are plain
//! values: they own no I/O and carry no shared state.
//!
//! # Key Types
//!
//! - [`ObjectId`] — fixed-length content digest naming a stored object
//! - [`AbbreviatedObjectId`] — a hex prefix of an [`ObjectId`] plus its nibble count
//! - [`ObjectKind`] — commit, tree, blob, or tag

pub mod abbrev;
pub mod error;
pub mod kind;
pub mod object;

pub use abbrev::{AbbreviatedObjectId, MIN_ABBREVIATION_LENGTH};
pub use error::TypeError;
pub use kind::ObjectKind;
pub use object::{ObjectId, OBJECT_ID_HEX_LENGTH, OBJECT_ID_LENGTH};
