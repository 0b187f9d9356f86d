use std::io;
use std::path::PathBuf;

use odb_store::StoreError;
use odb_types::{ObjectId, ObjectKind, TypeError};
use thiserror::Error;

use crate::delta::DeltaError;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("missing object {0}")]
    MissingObject(ObjectId),

    #[error("object {id} is a {actual}, expected {expected}")]
    IncorrectType {
        id: ObjectId,
        expected: ObjectKind,
        actual: ObjectKind,
    },

    #[error("corrupt pack index {path:?}: {reason}")]
    CorruptIndex { path: PathBuf, reason: String },

    #[error("corrupt pack {pack:?} at offset {offset}: {reason}")]
    CorruptPack {
        pack: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("corrupt object {id} in {pack:?}: {reason}")]
    CorruptObject {
        id: ObjectId,
        pack: PathBuf,
        reason: String,
    },

    #[error("object {id} is {size} bytes, above the {limit} byte streaming threshold")]
    LargeObject { id: ObjectId, size: u64, limit: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),

    #[error("pack index version {version} does not record CRC-32 checksums")]
    Crc32NotSupported { version: u32 },

    #[error("delta base {base} is not in the pack and no external base was supplied")]
    MissingDeltaBase { base: ObjectId },

    #[error("pack {pack:?} does not match its index: {reason}")]
    PackMismatch { pack: PathBuf, reason: String },

    #[error("pack writer is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid delta: {0}")]
    Delta(#[from] DeltaError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Type(#[from] TypeError),
}

impl PackError {
    /// Failures caused by the pack file being replaced or removed underneath
    /// a reader. These are retried once against a fresh view of the pack
    /// directory; everything else is final for the lookup.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::PackMismatch { .. } => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Recover a `PackError` that was carried through an `io::Error`
    /// by one of the object streams.
    pub fn from_stream_error(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<PackError>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(pack_err) = inner.downcast::<PackError>() {
                    return *pack_err;
                }
            }
            return Self::Io(io::Error::new(io::ErrorKind::Other, "stream error"));
        }
        Self::Io(err)
    }
}

impl From<PackError> for io::Error {
    fn from(err: PackError) -> Self {
        match err {
            PackError::Io(inner) => inner,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

pub type PackResult<T> = Result<T, PackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_transient() {
        let err = PackError::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.is_transient());
        let err = PackError::PackMismatch {
            pack: PathBuf::from("p.pack"),
            reason: "checksum".into(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn corruption_is_not_transient() {
        let err = PackError::CorruptPack {
            pack: PathBuf::from("p.pack"),
            offset: 12,
            reason: "bad".into(),
        };
        assert!(!err.is_transient());
        assert!(!PackError::MissingObject(ObjectId::zero()).is_transient());
    }

    #[test]
    fn pack_error_survives_io_roundtrip() {
        let original = PackError::CorruptPack {
            pack: PathBuf::from("p.pack"),
            offset: 99,
            reason: "truncated".into(),
        };
        let io_err: io::Error = original.into();
        match PackError::from_stream_error(io_err) {
            PackError::CorruptPack { offset, .. } => assert_eq!(offset, 99),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn plain_io_errors_pass_through() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        match PackError::from_stream_error(io_err) {
            PackError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }
}
