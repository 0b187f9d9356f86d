use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid abbreviation length {0}: must be between 4 and 40 hex digits")]
    InvalidAbbreviation(usize),

    #[error("unknown object type: {0}")]
    UnknownKind(String),
}
