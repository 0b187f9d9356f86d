use super::{decode_copy, parse_header, DeltaError};

/// Apply `delta` to `base`, validating every instruction against the
/// declared sizes.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let header = parse_header(delta)?;
    if header.base_size != base.len() as u64 {
        return Err(DeltaError::BaseSizeMismatch {
            expected: header.base_size,
            actual: base.len() as u64,
        });
    }

    let expected = header.result_size;
    let hint = (base.len() as u64).saturating_add(delta.len() as u64);
    let mut result = Vec::with_capacity(expected.min(hint) as usize);
    let mut pos = header.header_len;

    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;
        if cmd & 0x80 != 0 {
            let (offset, len, used) = decode_copy(cmd, &delta[pos..])
                .ok_or(DeltaError::TruncatedInstruction(pos - 1))?;
            pos += used;
            let end = offset
                .checked_add(len)
                .filter(|&end| end <= base.len() as u64)
                .ok_or(DeltaError::CopyOutOfBounds {
                    offset,
                    len,
                    base_size: base.len() as u64,
                })?;
            if result.len() as u64 + len > expected {
                return Err(DeltaError::ResultOverflow(expected));
            }
            result.extend_from_slice(&base[offset as usize..end as usize]);
        } else if cmd != 0 {
            let end = pos + cmd as usize;
            let literal = delta
                .get(pos..end)
                .ok_or(DeltaError::TruncatedInstruction(pos - 1))?;
            if result.len() as u64 + literal.len() as u64 > expected {
                return Err(DeltaError::ResultOverflow(expected));
            }
            result.extend_from_slice(literal);
            pos = end;
        } else {
            return Err(DeltaError::ReservedOpcode(pos - 1));
        }
    }

    if result.len() as u64 != expected {
        return Err(DeltaError::ResultSizeMismatch {
            expected,
            actual: result.len() as u64,
        });
    }
    Ok(result)
}
