use std::collections::BTreeSet;

use odb_types::{AbbreviatedObjectId, ObjectId};

use crate::error::{StoreError, StoreResult};

/// Outcome of resolving a short id, seen from a layer that requires
/// uniqueness.
///
/// Stores only ever report candidate sets. Whether more than one candidate is
/// an error is a policy of the caller; this type is where that policy lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing matched.
    None,
    /// Exactly one object matched.
    Unique(ObjectId),
    /// Several objects matched; all of them are listed in id order.
    Ambiguous(Vec<ObjectId>),
}

impl Resolution {
    /// Classify a candidate set.
    pub fn from_candidates(candidates: BTreeSet<ObjectId>) -> Self {
        let mut iter = candidates.into_iter();
        match (iter.next(), iter.next()) {
            (None, _) => Self::None,
            (Some(only), None) => Self::Unique(only),
            (Some(first), Some(second)) => {
                Self::Ambiguous([first, second].into_iter().chain(iter).collect())
            }
        }
    }

    /// Collapse into a single id, failing with [`StoreError::Ambiguous`] when
    /// more than one object matched.
    pub fn into_unique(self, prefix: &AbbreviatedObjectId) -> StoreResult<Option<ObjectId>> {
        match self {
            Self::None => Ok(None),
            Self::Unique(id) => Ok(Some(id)),
            Self::Ambiguous(candidates) => Err(StoreError::Ambiguous {
                prefix: prefix.to_hex(),
                candidates,
            }),
        }
    }
}
