use std::io::{self, Read};

use super::{read_size_varint, DeltaError, MAX_INSERT};

type BaseReader = Box<dyn Read + Send>;
type BaseOpener = Box<dyn FnMut() -> io::Result<BaseReader> + Send>;

enum Op {
    Idle,
    Copy { remaining: u64 },
    Insert { remaining: usize },
}

/// Applies a delta lazily while it is read.
///
/// The delta itself is consumed sequentially. The base is reached through
/// an opener so a copy that moves backwards can start a fresh base reader
/// instead of holding the whole base in memory.
pub struct DeltaStream {
    delta: Box<dyn Read + Send>,
    open_base: BaseOpener,
    base: Option<BaseReader>,
    base_pos: u64,
    base_size: u64,
    result_size: u64,
    produced: u64,
    op: Op,
}

impl DeltaStream {
    /// Read the delta header and prepare to stream the result.
    ///
    /// `base_size` is the actual length of the base; it must agree with the
    /// size recorded in the delta.
    pub fn new(
        mut delta: Box<dyn Read + Send>,
        base_size: u64,
        open_base: BaseOpener,
    ) -> io::Result<Self> {
        let declared_base = read_varint(&mut delta)?;
        let result_size = read_varint(&mut delta)?;
        if declared_base != base_size {
            return Err(invalid(DeltaError::BaseSizeMismatch {
                expected: declared_base,
                actual: base_size,
            }));
        }
        Ok(Self {
            delta,
            open_base,
            base: None,
            base_pos: 0,
            base_size,
            result_size,
            produced: 0,
            op: Op::Idle,
        })
    }

    /// Size of the reconstructed object.
    pub fn result_size(&self) -> u64 {
        self.result_size
    }

    fn next_op(&mut self) -> io::Result<bool> {
        let mut cmd = [0u8; 1];
        if read_some(&mut self.delta, &mut cmd)? == 0 {
            return Ok(false);
        }
        let cmd = cmd[0];
        if cmd & 0x80 != 0 {
            let mut operands = [0u8; 7];
            let needed = (cmd & 0x7f).count_ones() as usize;
            self.delta
                .read_exact(&mut operands[..needed])
                .map_err(|_| invalid(DeltaError::TruncatedInstruction(0)))?;
            let (offset, len, _) = super::decode_copy(cmd, &operands[..needed])
                .ok_or_else(|| invalid(DeltaError::TruncatedInstruction(0)))?;
            if offset + len > self.base_size {
                return Err(invalid(DeltaError::CopyOutOfBounds {
                    offset,
                    len,
                    base_size: self.base_size,
                }));
            }
            self.check_room(len)?;
            self.seek_base(offset)?;
            self.op = Op::Copy { remaining: len };
        } else if cmd != 0 {
            debug_assert!(cmd as usize <= MAX_INSERT);
            self.check_room(u64::from(cmd))?;
            self.op = Op::Insert {
                remaining: cmd as usize,
            };
        } else {
            return Err(invalid(DeltaError::ReservedOpcode(0)));
        }
        Ok(true)
    }

    fn check_room(&self, len: u64) -> io::Result<()> {
        if self.produced + len > self.result_size {
            return Err(invalid(DeltaError::ResultOverflow(self.result_size)));
        }
        Ok(())
    }

    /// Position the base reader at `offset`, reopening if it is behind us.
    fn seek_base(&mut self, offset: u64) -> io::Result<()> {
        if self.base.is_none() || offset < self.base_pos {
            self.base = Some((self.open_base)()?);
            self.base_pos = 0;
        }
        let skip = offset - self.base_pos;
        if skip > 0 {
            if let Some(base) = self.base.as_mut() {
                let skipped = io::copy(&mut base.take(skip), &mut io::sink())?;
                if skipped != skip {
                    return Err(invalid(DeltaError::BaseTruncated));
                }
            }
            self.base_pos = offset;
        }
        Ok(())
    }
}

impl Read for DeltaStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.op {
                Op::Copy { remaining } if remaining > 0 => {
                    let want = remaining.min(buf.len() as u64) as usize;
                    let base = match self.base.as_mut() {
                        Some(base) => base,
                        None => return Err(invalid(DeltaError::BaseTruncated)),
                    };
                    let n = read_some(base, &mut buf[..want])?;
                    if n == 0 {
                        return Err(invalid(DeltaError::BaseTruncated));
                    }
                    self.base_pos += n as u64;
                    self.produced += n as u64;
                    self.op = Op::Copy {
                        remaining: remaining - n as u64,
                    };
                    return Ok(n);
                }
                Op::Insert { remaining } if remaining > 0 => {
                    let want = remaining.min(buf.len());
                    let n = read_some(&mut self.delta, &mut buf[..want])?;
                    if n == 0 {
                        return Err(invalid(DeltaError::TruncatedInstruction(0)));
                    }
                    self.produced += n as u64;
                    self.op = Op::Insert {
                        remaining: remaining - n,
                    };
                    return Ok(n);
                }
                _ => {
                    if !self.next_op()? {
                        if self.produced != self.result_size {
                            return Err(invalid(DeltaError::ResultSizeMismatch {
                                expected: self.result_size,
                                actual: self.produced,
                            }));
                        }
                        return Ok(0);
                    }
                }
            }
        }
    }
}

fn read_some(reader: &mut (impl Read + ?Sized), buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn read_varint(reader: &mut (impl Read + ?Sized)) -> io::Result<u64> {
    let mut bytes = Vec::with_capacity(10);
    let mut byte = [0u8; 1];
    loop {
        if bytes.len() >= 10 || read_some(reader, &mut byte)? == 0 {
            return Err(invalid(DeltaError::TruncatedHeader));
        }
        bytes.push(byte[0]);
        if byte[0] & 0x80 == 0 {
            break;
        }
    }
    read_size_varint(&bytes).map(|(value, _)| value).map_err(invalid)
}

fn invalid(err: DeltaError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, crate::PackError::Delta(err))
}
