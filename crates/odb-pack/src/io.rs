use std::collections::TryReserveError;
use std::io::{self, Write};

use sha1::{Digest, Sha1};

/// Writer that tracks the byte count, a running SHA-1 over everything
/// written, and a resettable CRC-32 used for per-entry checksums.
pub(crate) struct DigestWriter<W> {
    inner: W,
    sha1: Sha1,
    crc: crc32fast::Hasher,
    count: u64,
}

impl<W: Write> DigestWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            sha1: Sha1::new(),
            crc: crc32fast::Hasher::new(),
            count: 0,
        }
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    pub(crate) fn reset_crc(&mut self) {
        self.crc = crc32fast::Hasher::new();
    }

    pub(crate) fn crc(&self) -> u32 {
        self.crc.clone().finalize()
    }

    /// Digest of everything written so far. Does not write it.
    pub(crate) fn digest(&self) -> [u8; 20] {
        self.sha1.clone().finalize().into()
    }

    pub(crate) fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.sha1.update(&buf[..n]);
        self.crc.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// First capacity handed to an inflater whose declared size is untrusted.
pub(crate) const INFLATE_CHUNK: usize = 64 * 1024;

/// Make room in a full `out` for more inflated bytes. Capacity doubles from
/// what has been produced so far and never exceeds `ceiling`.
pub(crate) fn grow_inflate_buffer(out: &mut Vec<u8>, ceiling: usize) -> Result<(), TryReserveError> {
    if out.len() < out.capacity() {
        return Ok(());
    }
    let room = out.len().max(INFLATE_CHUNK).min(ceiling.saturating_sub(out.len()));
    out.try_reserve_exact(room)
}

/// SHA-1 of a byte slice as a fixed array.
pub(crate) fn sha1_digest(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}
