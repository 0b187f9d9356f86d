use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::abbrev::AbbreviatedObjectId;
use crate::error::TypeError;
use crate::kind::ObjectKind;

/// Length of an object id in bytes.
pub const OBJECT_ID_LENGTH: usize = 20;

/// Length of an object id in hex digits.
pub const OBJECT_ID_HEX_LENGTH: usize = OBJECT_ID_LENGTH * 2;

/// Content-addressed identifier for any stored object.
///
/// An `ObjectId` is the digest of an object's type header and content.
/// Equality and ordering are byte-lexicographic, which is also the order
/// pack indexes sort their entries in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; OBJECT_ID_LENGTH]);

impl ObjectId {
    /// Compute the name of an object from its kind and content.
    ///
    /// The digest covers `"<kind> <len>\0"` followed by the content.
    pub fn hash_object(kind: ObjectKind, data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(kind.name().as_bytes());
        hasher.update(b" ");
        hasher.update(data.len().to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Create an `ObjectId` from a pre-computed digest.
    pub const fn from_hash(hash: [u8; OBJECT_ID_LENGTH]) -> Self {
        Self(hash)
    }

    /// Create an `ObjectId` from a raw byte slice of exactly 20 bytes.
    pub fn from_raw(bytes: &[u8]) -> Result<Self, TypeError> {
        let arr: [u8; OBJECT_ID_LENGTH] =
            bytes.try_into().map_err(|_| TypeError::InvalidLength {
                expected: OBJECT_ID_LENGTH,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    /// The all-zero object id. Represents "no object".
    pub const fn zero() -> Self {
        Self([0u8; OBJECT_ID_LENGTH])
    }

    /// Returns `true` if this is the all-zero id.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; OBJECT_ID_LENGTH]
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LENGTH] {
        &self.0
    }

    /// The first byte, which selects the fan-out bucket in a pack index.
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a 40-digit hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        if s.len() != OBJECT_ID_HEX_LENGTH {
            return Err(TypeError::InvalidLength {
                expected: OBJECT_ID_HEX_LENGTH,
                actual: s.len(),
            });
        }
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_raw(&bytes)
    }

    /// Truncate this id to its first `nibbles` hex digits.
    pub fn abbreviate(&self, nibbles: usize) -> Result<AbbreviatedObjectId, TypeError> {
        AbbreviatedObjectId::from_object_id(self, nibbles)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; OBJECT_ID_LENGTH]> for ObjectId {
    fn from(bytes: [u8; OBJECT_ID_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl From<ObjectId> for [u8; OBJECT_ID_LENGTH] {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for ObjectId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
