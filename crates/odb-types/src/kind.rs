use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// The kind of a stored object.
///
/// The discriminants are the type codes used in pack entry headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    /// A snapshot pointing at a root tree and its parent commits.
    Commit,
    /// A directory listing of named entries.
    Tree,
    /// Raw file content.
    Blob,
    /// An annotated tag pointing at another object.
    Tag,
}

impl ObjectKind {
    /// All kinds, in pack type-code order.
    pub const ALL: [ObjectKind; 4] = [Self::Commit, Self::Tree, Self::Blob, Self::Tag];

    /// The 3-bit type code stored in a pack entry header.
    pub fn type_code(self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
        }
    }

    /// Parse a pack type code. Delta codes (6, 7) are not object kinds.
    pub fn from_type_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Commit),
            2 => Some(Self::Tree),
            3 => Some(Self::Blob),
            4 => Some(Self::Tag),
            _ => None,
        }
    }

    /// Canonical lowercase name, as used in the object hash header.
    pub fn name(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ObjectKind {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(Self::Commit),
            "tree" => Ok(Self::Tree),
            "blob" => Ok(Self::Blob),
            "tag" => Ok(Self::Tag),
            other => Err(TypeError::UnknownKind(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_code_roundtrip() {
        for kind in ObjectKind::ALL {
            assert_eq!(ObjectKind::from_type_code(kind.type_code()), Some(kind));
        }
    }

    #[test]
    fn delta_codes_are_not_kinds() {
        assert!(ObjectKind::from_type_code(0).is_none());
        assert!(ObjectKind::from_type_code(5).is_none());
        assert!(ObjectKind::from_type_code(6).is_none());
        assert!(ObjectKind::from_type_code(7).is_none());
    }

    #[test]
    fn parse_names() {
        assert_eq!("blob".parse::<ObjectKind>().unwrap(), ObjectKind::Blob);
        assert_eq!("commit".parse::<ObjectKind>().unwrap(), ObjectKind::Commit);
        assert!("receipt".parse::<ObjectKind>().is_err());
    }

    #[test]
    fn display_matches_name() {
        assert_eq!(ObjectKind::Tree.to_string(), "tree");
        assert_eq!(ObjectKind::Tag.to_string(), "tag");
    }
}
