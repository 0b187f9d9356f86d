//! Git binary delta format.
//!
//! A delta starts with two little-endian base-128 varints (source size, then
//! result size) followed by instructions:
//!
//! ```text
//! 1xxxxxxx [offset bytes] [size bytes]   copy from the source
//! 0nnnnnnn <n literal bytes>             insert, n in 1..=127
//! 00000000                               reserved, always invalid
//! ```
//!
//! Copy commands carry up to four offset bytes (flags 0x01-0x08) and three
//! size bytes (flags 0x10-0x40); a size of zero means 0x10000.

mod apply;
mod compute;
mod stream;

pub use apply::apply_delta;
pub use compute::{compute_delta, compute_delta_limited};
pub use stream::DeltaStream;

use thiserror::Error;

/// Largest literal carried by one insert instruction.
pub const MAX_INSERT: usize = 0x7f;
/// Largest range carried by one copy instruction.
pub const MAX_COPY: usize = 0x00ff_ffff;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeltaError {
    #[error("truncated delta header")]
    TruncatedHeader,
    #[error("delta size overflows 64 bits")]
    SizeOverflow,
    #[error("delta expects a {expected} byte base, got {actual}")]
    BaseSizeMismatch { expected: u64, actual: u64 },
    #[error("reserved delta opcode 0 at byte {0}")]
    ReservedOpcode(usize),
    #[error("truncated instruction at byte {0}")]
    TruncatedInstruction(usize),
    #[error("copy of {len} bytes at {offset} exceeds the {base_size} byte base")]
    CopyOutOfBounds { offset: u64, len: u64, base_size: u64 },
    #[error("delta produces more than the declared {0} bytes")]
    ResultOverflow(u64),
    #[error("delta produced {actual} bytes, declared {expected}")]
    ResultSizeMismatch { expected: u64, actual: u64 },
    #[error("delta base ended early")]
    BaseTruncated,
}

/// One decoded delta instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaInstruction {
    Copy { offset: u64, len: u64 },
    Insert(Vec<u8>),
}

/// Sizes declared at the front of a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaHeader {
    pub base_size: u64,
    pub result_size: u64,
    /// Bytes occupied by the two varints.
    pub header_len: usize,
}

/// Decode one size varint, returning the value and bytes consumed.
pub fn read_size_varint(data: &[u8]) -> Result<(u64, usize), DeltaError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        let bits = u64::from(byte & 0x7f);
        if shift > 63 || (bits << shift) >> shift != bits {
            return Err(DeltaError::SizeOverflow);
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(DeltaError::TruncatedHeader)
}

pub fn write_size_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

pub fn parse_header(delta: &[u8]) -> Result<DeltaHeader, DeltaError> {
    let (base_size, a) = read_size_varint(delta)?;
    let (result_size, b) = read_size_varint(&delta[a..])?;
    Ok(DeltaHeader {
        base_size,
        result_size,
        header_len: a + b,
    })
}

/// Decode a copy command's operand bytes. `cmd` has the high bit set.
/// Returns `(offset, len, bytes consumed)`.
pub(crate) fn decode_copy(cmd: u8, operands: &[u8]) -> Option<(u64, u64, usize)> {
    let mut used = 0;
    let mut next = |flag: u8| -> Option<u64> {
        if cmd & flag == 0 {
            return Some(0);
        }
        let byte = *operands.get(used)?;
        used += 1;
        Some(u64::from(byte))
    };
    let offset = next(0x01)? | next(0x02)? << 8 | next(0x04)? << 16 | next(0x08)? << 24;
    let mut len = next(0x10)? | next(0x20)? << 8 | next(0x40)? << 16;
    if len == 0 {
        len = 0x10000;
    }
    Some((offset, len, used))
}

/// Split a delta into its header and instruction list.
pub fn parse_instructions(delta: &[u8]) -> Result<(DeltaHeader, Vec<DeltaInstruction>), DeltaError> {
    let header = parse_header(delta)?;
    let mut pos = header.header_len;
    let mut instructions = Vec::new();
    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;
        if cmd & 0x80 != 0 {
            let (offset, len, used) = decode_copy(cmd, &delta[pos..])
                .ok_or(DeltaError::TruncatedInstruction(pos - 1))?;
            pos += used;
            instructions.push(DeltaInstruction::Copy { offset, len });
        } else if cmd != 0 {
            let end = pos + cmd as usize;
            let literal = delta
                .get(pos..end)
                .ok_or(DeltaError::TruncatedInstruction(pos - 1))?;
            instructions.push(DeltaInstruction::Insert(literal.to_vec()));
            pos = end;
        } else {
            return Err(DeltaError::ReservedOpcode(pos - 1));
        }
    }
    Ok((header, instructions))
}

/// Incremental builder for delta byte streams.
#[derive(Debug)]
pub struct DeltaEncoder {
    out: Vec<u8>,
}

impl DeltaEncoder {
    pub fn new(base_size: u64, result_size: u64) -> Self {
        let mut out = Vec::new();
        write_size_varint(&mut out, base_size);
        write_size_varint(&mut out, result_size);
        Self { out }
    }

    /// Current encoded length, header included.
    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn copy(&mut self, mut offset: u64, mut len: u64) {
        while len > 0 {
            let chunk = len.min(MAX_COPY as u64);
            encode_copy(&mut self.out, offset, chunk);
            offset += chunk;
            len -= chunk;
        }
    }

    pub fn insert(&mut self, data: &[u8]) {
        for chunk in data.chunks(MAX_INSERT) {
            self.out.push(chunk.len() as u8);
            self.out.extend_from_slice(chunk);
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }
}

fn encode_copy(out: &mut Vec<u8>, offset: u64, len: u64) {
    let cmd_pos = out.len();
    out.push(0x80);
    let mut cmd = 0x80u8;
    for i in 0..4 {
        let byte = (offset >> (i * 8)) as u8;
        if byte != 0 {
            cmd |= 1 << i;
            out.push(byte);
        }
    }
    // 0x10000 is the implicit size when no size bytes are present.
    if len != 0x10000 {
        for i in 0..3 {
            let byte = (len >> (i * 8)) as u8;
            if byte != 0 {
                cmd |= 0x10 << i;
                out.push(byte);
            }
        }
    }
    out[cmd_pos] = cmd;
}

/// Encode a whole instruction list.
pub fn encode_instructions(
    base_size: u64,
    result_size: u64,
    instructions: &[DeltaInstruction],
) -> Vec<u8> {
    let mut encoder = DeltaEncoder::new(base_size, result_size);
    for instruction in instructions {
        match instruction {
            DeltaInstruction::Copy { offset, len } => encoder.copy(*offset, *len),
            DeltaInstruction::Insert(data) => encoder.insert(data),
        }
    }
    encoder.finish()
}
