use std::path::Path;

use odb_types::{ObjectId, ObjectKind, OBJECT_ID_LENGTH};

use crate::error::{PackError, PackResult};

pub const OBJ_OFS_DELTA: u8 = 6;
pub const OBJ_REF_DELTA: u8 = 7;

/// Longest possible entry header: 10 size bytes, then a 20-byte base id.
pub const MAX_HEADER_LEN: usize = 10 + OBJECT_ID_LENGTH;

/// Type tag for pack entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackEntryKind {
    /// Complete object, deflated as-is.
    Whole(ObjectKind),
    /// Delta against the entry starting at `base_offset` in the same pack.
    OfsDelta { base_offset: u64 },
    /// Delta against the object named `base`, inside or outside the pack.
    RefDelta { base: ObjectId },
}

impl PackEntryKind {
    pub fn type_code(&self) -> u8 {
        match self {
            Self::Whole(kind) => kind.type_code(),
            Self::OfsDelta { .. } => OBJ_OFS_DELTA,
            Self::RefDelta { .. } => OBJ_REF_DELTA,
        }
    }

    pub fn is_delta(&self) -> bool {
        !matches!(self, Self::Whole(_))
    }
}

/// Decoded entry header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    pub kind: PackEntryKind,
    /// Inflated size of the payload: the object for whole entries, the
    /// delta instructions for delta entries.
    pub size: u64,
    /// Bytes from the start of the entry to the deflated payload.
    pub header_len: usize,
}

/// Parse the entry header at `offset`. `data` starts at the entry and may
/// extend past it.
pub fn parse_header(data: &[u8], offset: u64, pack: &Path) -> PackResult<EntryHeader> {
    let corrupt = |reason: &str| PackError::CorruptPack {
        pack: pack.to_path_buf(),
        offset,
        reason: reason.to_string(),
    };

    let first = *data.first().ok_or_else(|| corrupt("truncated entry header"))?;
    let type_code = (first >> 4) & 0x07;
    let mut size = u64::from(first & 0x0f);
    let mut shift = 4u32;
    let mut pos = 1;
    let mut byte = first;
    while byte & 0x80 != 0 {
        byte = *data
            .get(pos)
            .ok_or_else(|| corrupt("truncated entry header"))?;
        let bits = u64::from(byte & 0x7f);
        if shift > 60 || (bits << shift) >> shift != bits {
            return Err(corrupt("entry size overflows 64 bits"));
        }
        size |= bits << shift;
        shift += 7;
        pos += 1;
    }

    let kind = match type_code {
        OBJ_OFS_DELTA => {
            let (distance, used) = decode_ofs_distance(&data[pos..])
                .ok_or_else(|| corrupt("truncated delta base offset"))?;
            pos += used;
            if distance == 0 || distance > offset {
                return Err(corrupt("delta base offset points outside the pack"));
            }
            PackEntryKind::OfsDelta {
                base_offset: offset - distance,
            }
        }
        OBJ_REF_DELTA => {
            let raw = data
                .get(pos..pos + OBJECT_ID_LENGTH)
                .ok_or_else(|| corrupt("truncated delta base id"))?;
            pos += OBJECT_ID_LENGTH;
            PackEntryKind::RefDelta {
                base: ObjectId::from_raw(raw).map_err(|_| corrupt("invalid delta base id"))?,
            }
        }
        code => PackEntryKind::Whole(
            ObjectKind::from_type_code(code)
                .ok_or_else(|| corrupt(&format!("invalid object type {code}")))?,
        ),
    };

    Ok(EntryHeader {
        kind,
        size,
        header_len: pos,
    })
}

/// Encode an entry header for an object or delta of `size` inflated bytes.
/// `entry_offset` is only consulted for offset deltas.
pub fn encode_header(kind: &PackEntryKind, size: u64, entry_offset: u64, out: &mut Vec<u8>) {
    let mut byte = (kind.type_code() << 4) | (size & 0x0f) as u8;
    let mut rest = size >> 4;
    while rest != 0 {
        out.push(byte | 0x80);
        byte = (rest & 0x7f) as u8;
        rest >>= 7;
    }
    out.push(byte);

    match kind {
        PackEntryKind::Whole(_) => {}
        PackEntryKind::OfsDelta { base_offset } => {
            encode_ofs_distance(entry_offset - base_offset, out);
        }
        PackEntryKind::RefDelta { base } => out.extend_from_slice(base.as_bytes()),
    }
}

/// Offset-delta distances use a big-endian base-128 encoding where each
/// continuation adds one before shifting, so no value has two encodings.
pub fn decode_ofs_distance(data: &[u8]) -> Option<(u64, usize)> {
    let mut byte = *data.first()?;
    let mut value = u64::from(byte & 0x7f);
    let mut pos = 1;
    while byte & 0x80 != 0 {
        byte = *data.get(pos)?;
        pos += 1;
        value = value.checked_add(1)?.checked_mul(128)? | u64::from(byte & 0x7f);
    }
    Some((value, pos))
}

pub fn encode_ofs_distance(mut distance: u64, out: &mut Vec<u8>) {
    let mut buf = [0u8; 10];
    let mut pos = buf.len() - 1;
    buf[pos] = (distance & 0x7f) as u8;
    distance >>= 7;
    while distance != 0 {
        distance -= 1;
        pos -= 1;
        buf[pos] = 0x80 | (distance & 0x7f) as u8;
        distance >>= 7;
    }
    out.extend_from_slice(&buf[pos..]);
}
