use std::collections::BTreeSet;

use odb_types::{AbbreviatedObjectId, ObjectId};

use crate::error::StoreResult;
use crate::object::RawObject;

/// Loose (one-file-per-object) storage, as seen by the packed-object engine.
///
/// Implementations must satisfy these invariants:
/// - Objects are immutable once written.
/// - Concurrent reads are always safe.
/// - Prefix resolution only collects candidates; it never decides that more
///   than one candidate is an error.
pub trait LooseObjectSource: Send + Sync {
    /// Check whether an object exists in loose storage.
    fn has(&self, id: &ObjectId) -> StoreResult<bool>;

    /// Read an object by id.
    ///
    /// Returns `Ok(None)` if the object does not exist.
    fn open(&self, id: &ObjectId) -> StoreResult<Option<RawObject>>;

    /// Add every stored id that starts with `prefix` to `matches`.
    fn resolve(
        &self,
        prefix: &AbbreviatedObjectId,
        matches: &mut BTreeSet<ObjectId>,
    ) -> StoreResult<()>;
}
