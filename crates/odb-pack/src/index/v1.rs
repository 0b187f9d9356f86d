use std::io::Write;
use std::path::Path;

use odb_types::ObjectId;

use super::{corrupt, read_fan_out, IndexColumns, PackedObjectInfo, FAN_OUT_LEN, TRAILER_LEN};
use crate::error::{PackError, PackResult};

const ENTRY_LEN: usize = 4 + 20;

pub(super) fn parse(data: &[u8], path: &Path) -> PackResult<IndexColumns> {
    let fan_out = read_fan_out(data, path)?;
    let count = fan_out[255] as usize;
    let expected = FAN_OUT_LEN + count * ENTRY_LEN + TRAILER_LEN;
    if data.len() != expected {
        return Err(corrupt(
            path,
            format!("v1 index for {count} objects should be {expected} bytes, found {}", data.len()),
        ));
    }

    let mut ids = Vec::with_capacity(count);
    let mut offsets = Vec::with_capacity(count);
    for entry in data[FAN_OUT_LEN..FAN_OUT_LEN + count * ENTRY_LEN].chunks_exact(ENTRY_LEN) {
        offsets.push(u64::from(u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]])));
        ids.push(ObjectId::from_raw(&entry[4..]).map_err(|e| corrupt(path, e.to_string()))?);
    }

    Ok(IndexColumns {
        fan_out,
        ids,
        offsets,
        crc32s: None,
    })
}

/// Body of a v1 index (fan-out and entries). `entries` must be sorted.
pub(super) fn write_body(out: &mut impl Write, entries: &[PackedObjectInfo], fan_out: &[u32; 256]) -> PackResult<()> {
    for count in fan_out {
        out.write_all(&count.to_be_bytes())?;
    }
    for entry in entries {
        let offset = u32::try_from(entry.offset).map_err(|_| {
            PackError::InvalidConfig(format!(
                "offset {} of {} does not fit a version 1 index",
                entry.offset, entry.id
            ))
        })?;
        out.write_all(&offset.to_be_bytes())?;
        out.write_all(entry.id.as_bytes())?;
    }
    Ok(())
}
