use std::io::Write;
use std::path::Path;

use odb_types::ObjectId;

use super::{
    corrupt, read_fan_out, IndexColumns, PackedObjectInfo, FAN_OUT_LEN, INDEX_V2_MAGIC,
    TRAILER_LEN,
};
use crate::error::{PackError, PackResult};

const HEADER_LEN: usize = 8;
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

fn be32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

pub(super) fn parse(data: &[u8], path: &Path) -> PackResult<IndexColumns> {
    if data.len() < HEADER_LEN + FAN_OUT_LEN + TRAILER_LEN {
        return Err(corrupt(path, "truncated v2 header"));
    }
    let fan_out = read_fan_out(&data[HEADER_LEN..], path)?;
    let count = fan_out[255] as usize;

    let ids_at = HEADER_LEN + FAN_OUT_LEN;
    let crc_at = ids_at + count * 20;
    let small_at = crc_at + count * 4;
    let large_at = small_at + count * 4;
    let trailer_at = data.len() - TRAILER_LEN;
    if large_at > trailer_at || (trailer_at - large_at) % 8 != 0 {
        return Err(corrupt(
            path,
            format!("v2 index size {} is inconsistent with {count} objects", data.len()),
        ));
    }
    let large_count = (trailer_at - large_at) / 8;

    let ids = data[ids_at..crc_at]
        .chunks_exact(20)
        .map(ObjectId::from_raw)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| corrupt(path, e.to_string()))?;

    let crc32s = (0..count).map(|i| be32(data, crc_at + i * 4)).collect();

    let mut offsets = Vec::with_capacity(count);
    for i in 0..count {
        let small = be32(data, small_at + i * 4);
        if small & LARGE_OFFSET_FLAG == 0 {
            offsets.push(u64::from(small));
            continue;
        }
        let slot = (small & !LARGE_OFFSET_FLAG) as usize;
        if slot >= large_count {
            return Err(corrupt(
                path,
                format!("64-bit offset slot {slot} out of range ({large_count} present)"),
            ));
        }
        let at = large_at + slot * 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[at..at + 8]);
        offsets.push(u64::from_be_bytes(raw));
    }

    Ok(IndexColumns {
        fan_out,
        ids,
        offsets,
        crc32s: Some(crc32s),
    })
}

/// Body of a v2 index, everything before the trailer. `entries` must be
/// sorted.
pub(super) fn write_body(out: &mut impl Write, entries: &[PackedObjectInfo], fan_out: &[u32; 256]) -> PackResult<()> {
    out.write_all(&INDEX_V2_MAGIC)?;
    out.write_all(&2u32.to_be_bytes())?;
    for count in fan_out {
        out.write_all(&count.to_be_bytes())?;
    }
    for entry in entries {
        out.write_all(entry.id.as_bytes())?;
    }
    for entry in entries {
        let crc = entry.crc32.ok_or_else(|| {
            PackError::InvalidConfig(format!(
                "version 2 index needs a CRC-32 for {}",
                entry.id
            ))
        })?;
        out.write_all(&crc.to_be_bytes())?;
    }
    let mut large = Vec::new();
    for entry in entries {
        if entry.offset < u64::from(LARGE_OFFSET_FLAG) {
            out.write_all(&(entry.offset as u32).to_be_bytes())?;
        } else {
            let slot = LARGE_OFFSET_FLAG | large.len() as u32;
            out.write_all(&slot.to_be_bytes())?;
            large.push(entry.offset);
        }
    }
    for offset in large {
        out.write_all(&offset.to_be_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::{encode, sample_entries};
    use crate::index::PackIndex;

    #[test]
    fn large_offsets_use_64_bit_table() {
        let mut entries = sample_entries(4);
        entries[1].offset = 0x1_2345_6789;
        entries[3].offset = u64::from(LARGE_OFFSET_FLAG);
        let data = encode(&entries, 2);
        let index = PackIndex::parse(&data, Path::new("big.idx")).unwrap();
        for entry in &entries {
            assert_eq!(index.find_offset(&entry.id), Some(entry.offset));
        }
        let small = HEADER_LEN + FAN_OUT_LEN + 4 * 20 + 4 * 4;
        assert_eq!(data.len(), small + 4 * 4 + 2 * 8 + TRAILER_LEN);
    }

    #[test]
    fn crc_values_survive() {
        let entries = sample_entries(6);
        let index = PackIndex::parse(&encode(&entries, 2), Path::new("c.idx")).unwrap();
        for entry in &entries {
            assert_eq!(index.find_crc32(&entry.id).unwrap(), entry.crc32);
        }
    }

    #[test]
    fn missing_crc_refused() {
        let mut entries = sample_entries(2);
        entries[0].crc32 = None;
        let fan_out = crate::index::fan_out_of(entries.iter().map(|e| &e.id));
        let mut out = Vec::new();
        assert!(write_body(&mut out, &entries, &fan_out).is_err());
    }

    #[test]
    fn dangling_large_offset_slot() {
        let entries = sample_entries(1);
        let mut body = Vec::new();
        let fan_out = crate::index::fan_out_of(entries.iter().map(|e| &e.id));
        write_body(&mut body, &entries, &fan_out).unwrap();
        let small_at = HEADER_LEN + FAN_OUT_LEN + 20 + 4;
        body[small_at..small_at + 4].copy_from_slice(&(LARGE_OFFSET_FLAG | 3).to_be_bytes());
        body.extend_from_slice(&[0u8; TRAILER_LEN]);
        assert!(matches!(
            parse(&body, Path::new("d.idx")),
            Err(PackError::CorruptIndex { .. })
        ));
    }
}
