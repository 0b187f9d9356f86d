use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::object::{ObjectId, OBJECT_ID_HEX_LENGTH, OBJECT_ID_LENGTH};

/// Fewest hex digits an abbreviation may carry.
pub const MIN_ABBREVIATION_LENGTH: usize = 4;

fn check_length(nibbles: usize) -> Result<(), TypeError> {
    if (MIN_ABBREVIATION_LENGTH..=OBJECT_ID_HEX_LENGTH).contains(&nibbles) {
        Ok(())
    } else {
        Err(TypeError::InvalidAbbreviation(nibbles))
    }
}

/// A hex prefix of an [`ObjectId`].
///
/// Only the first `nibbles` hex digits are significant; the remaining bits of
/// `bytes` are always zero so two abbreviations of the same prefix compare
/// equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AbbreviatedObjectId {
    bytes: [u8; OBJECT_ID_LENGTH],
    nibbles: u8,
}

impl AbbreviatedObjectId {
    /// Parse a prefix of 4 to 40 hex digits (either case).
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let len = s.len();
        check_length(len)?;
        let mut bytes = [0u8; OBJECT_ID_LENGTH];
        for (i, c) in s.bytes().enumerate() {
            let nibble = hex_value(c).ok_or_else(|| TypeError::InvalidHex(s.to_string()))?;
            if i % 2 == 0 {
                bytes[i / 2] |= nibble << 4;
            } else {
                bytes[i / 2] |= nibble;
            }
        }
        Ok(Self {
            bytes,
            nibbles: len as u8,
        })
    }

    /// Truncate a full id to its first `nibbles` hex digits.
    pub fn from_object_id(id: &ObjectId, nibbles: usize) -> Result<Self, TypeError> {
        check_length(nibbles)?;
        let mut bytes = [0u8; OBJECT_ID_LENGTH];
        let full = nibbles / 2;
        bytes[..full].copy_from_slice(&id.as_bytes()[..full]);
        if nibbles % 2 == 1 {
            bytes[full] = id.as_bytes()[full] & 0xf0;
        }
        Ok(Self {
            bytes,
            nibbles: nibbles as u8,
        })
    }

    /// Number of significant hex digits.
    pub fn nibbles(&self) -> usize {
        self.nibbles as usize
    }

    /// Returns `true` when all 40 digits are present.
    pub fn is_complete(&self) -> bool {
        self.nibbles() == OBJECT_ID_HEX_LENGTH
    }

    /// The full id, if this abbreviation is complete.
    pub fn to_object_id(&self) -> Option<ObjectId> {
        self.is_complete().then(|| ObjectId::from_hash(self.bytes))
    }

    /// The prefix bytes, zero-padded past the significant nibbles.
    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LENGTH] {
        &self.bytes
    }

    /// First byte every matching id shares.
    pub fn first_byte(&self) -> u8 {
        self.bytes[0]
    }

    /// Compare this prefix against the same-length prefix of `id`.
    ///
    /// Returns `Equal` when `id` starts with this abbreviation, otherwise the
    /// ordering of the prefix relative to `id`.
    pub fn prefix_compare(&self, id: &ObjectId) -> Ordering {
        let other = id.as_bytes();
        let full = self.nibbles() / 2;
        match self.bytes[..full].cmp(&other[..full]) {
            Ordering::Equal => {}
            ord => return ord,
        }
        if self.nibbles % 2 == 1 {
            return self.bytes[full].cmp(&(other[full] & 0xf0));
        }
        Ordering::Equal
    }

    /// Returns `true` when `id` starts with this prefix.
    pub fn matches(&self, id: &ObjectId) -> bool {
        self.prefix_compare(id) == Ordering::Equal
    }

    /// Hex form, exactly `nibbles` digits long.
    pub fn to_hex(&self) -> String {
        let mut s = hex::encode(self.bytes);
        s.truncate(self.nibbles());
        s
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl fmt::Debug for AbbreviatedObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AbbreviatedObjectId({})", self.to_hex())
    }
}

impl fmt::Display for AbbreviatedObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::ObjectKind;
    use proptest::prelude::*;

    fn sample() -> ObjectId {
        ObjectId::from_hex("3b18e512dba79e4c8300dd08aeb37f8e728b8dad").unwrap()
    }

    #[test]
    fn parse_even_and_odd_lengths() {
        let even = AbbreviatedObjectId::from_hex("3b18").unwrap();
        assert_eq!(even.nibbles(), 4);
        assert_eq!(even.to_hex(), "3b18");

        let odd = AbbreviatedObjectId::from_hex("3b18e").unwrap();
        assert_eq!(odd.nibbles(), 5);
        assert_eq!(odd.as_bytes()[2], 0xe0);
    }

    #[test]
    fn uppercase_is_accepted() {
        let abbrev = AbbreviatedObjectId::from_hex("3B18E5").unwrap();
        assert!(abbrev.matches(&sample()));
    }

    #[test]
    fn rejects_short_and_overlong() {
        assert_eq!(
            AbbreviatedObjectId::from_hex(""),
            Err(TypeError::InvalidAbbreviation(0))
        );
        assert_eq!(
            AbbreviatedObjectId::from_hex("3b1"),
            Err(TypeError::InvalidAbbreviation(3))
        );
        assert_eq!(sample().abbreviate(3), Err(TypeError::InvalidAbbreviation(3)));
        assert_eq!(sample().abbreviate(41), Err(TypeError::InvalidAbbreviation(41)));
        let long = "a".repeat(41);
        assert_eq!(
            AbbreviatedObjectId::from_hex(&long),
            Err(TypeError::InvalidAbbreviation(41))
        );
        assert!(matches!(
            AbbreviatedObjectId::from_hex("3b1g"),
            Err(TypeError::InvalidHex(_))
        ));
    }

    #[test]
    fn matches_only_significant_nibbles() {
        let id = sample();
        assert!(AbbreviatedObjectId::from_hex("3b18e").unwrap().matches(&id));
        assert!(!AbbreviatedObjectId::from_hex("3b18f").unwrap().matches(&id));
        assert!(!AbbreviatedObjectId::from_hex("3c18").unwrap().matches(&id));
    }

    #[test]
    fn prefix_compare_orders_mismatches() {
        let id = sample();
        let lower = AbbreviatedObjectId::from_hex("3a18").unwrap();
        let higher = AbbreviatedObjectId::from_hex("3b19").unwrap();
        assert_eq!(lower.prefix_compare(&id), Ordering::Less);
        assert_eq!(higher.prefix_compare(&id), Ordering::Greater);
    }

    #[test]
    fn complete_abbreviation_converts_back() {
        let id = sample();
        let abbrev = AbbreviatedObjectId::from_hex(&id.to_hex()).unwrap();
        assert!(abbrev.is_complete());
        assert_eq!(abbrev.to_object_id(), Some(id));
        assert_eq!(
            AbbreviatedObjectId::from_hex("3b18").unwrap().to_object_id(),
            None
        );
    }

    #[test]
    fn first_byte_is_the_fan_out_bucket() {
        assert_eq!(AbbreviatedObjectId::from_hex("3b18").unwrap().first_byte(), 0x3b);
        assert_eq!(sample().abbreviate(4).unwrap().first_byte(), sample().first_byte());
    }

    #[test]
    fn from_object_id_equals_parsed_prefix() {
        let id = ObjectId::hash_object(ObjectKind::Blob, b"abbrev");
        for n in MIN_ABBREVIATION_LENGTH..=40 {
            let truncated = id.abbreviate(n).unwrap();
            let parsed = AbbreviatedObjectId::from_hex(&id.to_hex()[..n]).unwrap();
            assert_eq!(truncated, parsed);
        }
    }

    proptest! {
        #[test]
        fn every_abbreviation_matches_its_source(bytes in any::<[u8; 20]>(), n in 4usize..=40) {
            let id = ObjectId::from_hash(bytes);
            let abbrev = id.abbreviate(n).unwrap();
            prop_assert!(abbrev.matches(&id));
            prop_assert_eq!(abbrev.to_hex(), id.to_hex()[..n].to_string());
        }
    }
}
