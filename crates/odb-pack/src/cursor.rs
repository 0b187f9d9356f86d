use std::io::{self, Read};
use std::sync::Arc;

use flate2::{Decompress, FlushDecompress, Status};

use crate::error::PackResult;
use crate::io::grow_inflate_buffer;
use crate::pack_file::PackFile;
use crate::window_cache::{SharedWindowCache, Window, WindowCache};

/// Scoped reader over the window cache. Holds at most one window lease at a
/// time and gives it back on drop or when it moves to another window.
pub struct WindowCursor {
    cache: Arc<WindowCache>,
    window: Option<Arc<Window>>,
}

impl WindowCursor {
    pub fn new(cache: &SharedWindowCache) -> Self {
        Self {
            cache: cache.current(),
            window: None,
        }
    }

    pub fn cache(&self) -> &WindowCache {
        &self.cache
    }

    /// Lease the window covering `position` in `pack`.
    pub(crate) fn pin(&mut self, pack: &PackFile, position: u64) -> PackResult<&Window> {
        let window = match self.window.take() {
            Some(window) if window.contains(pack.key(), position) => window,
            _ => self.cache.get(pack, position)?,
        };
        Ok(&**self.window.insert(window))
    }

    /// Copy up to `buf.len()` bytes starting at `position`. Returns fewer
    /// only at the end of the pack.
    pub fn copy(&mut self, pack: &PackFile, mut position: u64, buf: &mut [u8]) -> PackResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            if filled > 0 && position >= pack.length() {
                break;
            }
            let available = self.pin(pack, position)?.bytes_from(position);
            let n = available.len().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&available[..n]);
            filled += n;
            position += n as u64;
        }
        Ok(filled)
    }

    /// Like [`copy`](Self::copy) but the whole range must exist.
    pub fn read_exact(&mut self, pack: &PackFile, position: u64, buf: &mut [u8]) -> PackResult<()> {
        let n = self.copy(pack, position, buf)?;
        if n < buf.len() {
            return Err(pack.corrupt(position, format!("wanted {} bytes, pack ends after {n}", buf.len())));
        }
        Ok(())
    }

    /// Inflate exactly `size` bytes from the zlib stream at `position`.
    ///
    /// The stream must end exactly at `size`; producing more or less is
    /// corruption. The buffer grows with the inflated data, so a corrupt
    /// `size` cannot force a large allocation.
    pub fn inflate(&mut self, pack: &PackFile, position: u64, size: u64) -> PackResult<Vec<u8>> {
        let size = usize::try_from(size)
            .map_err(|_| pack.corrupt(position, format!("object size {size} exceeds memory")))?;
        let mut out = Vec::new();
        self.run_inflate(pack, position, &mut out, size, true)?;
        if out.len() != size {
            return Err(pack.corrupt(
                position,
                format!("inflated {} bytes, header declared {size}", out.len()),
            ));
        }
        Ok(out)
    }

    /// Inflate at most `max` bytes from the start of the stream at
    /// `position`, without requiring the stream to end.
    pub fn inflate_prefix(&mut self, pack: &PackFile, position: u64, max: usize) -> PackResult<Vec<u8>> {
        let mut out = Vec::new();
        self.run_inflate(pack, position, &mut out, max, false)?;
        out.truncate(max);
        Ok(out)
    }

    /// Feed windows into a zlib inflater until `limit` bytes are out
    /// (`to_end` false) or the stream ends (`to_end` true).
    fn run_inflate(
        &mut self,
        pack: &PackFile,
        mut position: u64,
        out: &mut Vec<u8>,
        limit: usize,
        to_end: bool,
    ) -> PackResult<()> {
        let start = position;
        let ceiling = if to_end { limit.saturating_add(1) } else { limit };
        let mut inflater = Decompress::new(true);
        loop {
            let produced = out.len();
            if !to_end && produced >= limit {
                return Ok(());
            }
            grow_inflate_buffer(out, ceiling)
                .map_err(|_| pack.corrupt(start, format!("cannot allocate {limit} bytes")))?;
            let input = self.pin(pack, position)?.bytes_from(position);
            let before_in = inflater.total_in();
            let status = inflater
                .decompress_vec(input, out, FlushDecompress::None)
                .map_err(|e| pack.corrupt(start, format!("invalid deflate stream: {e}")))?;
            let consumed = inflater.total_in() - before_in;
            position += consumed;

            if to_end && out.len() > limit {
                return Err(pack.corrupt(start, "inflated data exceeds declared size"));
            }
            match status {
                Status::StreamEnd => return Ok(()),
                Status::Ok | Status::BufError => {
                    if consumed == 0 && out.len() == produced {
                        return Err(pack.corrupt(start, "deflate stream stalled"));
                    }
                }
            }
        }
    }

    /// Drop the current lease early.
    pub fn release(&mut self) {
        self.window = None;
    }
}

/// Sequential reader over a byte range of a pack.
pub(crate) struct PackRangeReader {
    pack: Arc<PackFile>,
    cursor: WindowCursor,
    position: u64,
}

impl PackRangeReader {
    pub(crate) fn new(pack: Arc<PackFile>, cache: &SharedWindowCache, position: u64) -> Self {
        Self {
            pack,
            cursor: WindowCursor::new(cache),
            position,
        }
    }

    /// Lease the first window now so a missing file surfaces before any
    /// bytes are promised to a caller.
    pub(crate) fn prime(&mut self) -> PackResult<()> {
        self.cursor.pin(&self.pack, self.position).map(|_| ())
    }
}

impl Read for PackRangeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let length = self.pack.length();
        if buf.is_empty() || (length > 0 && self.position >= length) {
            return Ok(0);
        }
        let n = self.cursor.copy(&self.pack, self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowCacheConfig;
    use crate::testutil::{build_pack, TestObject};
    use crate::PackError;
    use odb_types::ObjectKind;

    fn setup(data: Vec<u8>) -> (tempfile::TempDir, Arc<PackFile>, SharedWindowCache, u64) {
        let dir = tempfile::tempdir().unwrap();
        let built = build_pack(dir.path(), &[TestObject::whole(ObjectKind::Blob, data)]);
        let pack = Arc::new(PackFile::open(&built.pack_path).unwrap());
        let cache = SharedWindowCache::new(WindowCacheConfig {
            window_size: 4096,
            max_bytes: 16 * 4096,
            ..Default::default()
        })
        .unwrap();
        (dir, pack, cache, built.entries[0].offset)
    }

    #[test]
    fn inflate_across_windows() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i.wrapping_mul(31) % 251) as u8).collect();
        let (_dir, pack, cache, offset) = setup(data.clone());
        let mut cursor = WindowCursor::new(&cache);
        let header = pack.read_entry_header(&mut cursor, offset).unwrap();
        let out = cursor
            .inflate(&pack, offset + header.header_len as u64, header.size)
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn inflate_with_wrong_size_is_corrupt() {
        let (_dir, pack, cache, offset) = setup(b"twelve bytes".to_vec());
        let mut cursor = WindowCursor::new(&cache);
        let data_at = offset + 1;
        assert!(matches!(
            cursor.inflate(&pack, data_at, 5),
            Err(PackError::CorruptPack { .. })
        ));
        assert!(matches!(
            cursor.inflate(&pack, data_at, 40),
            Err(PackError::CorruptPack { .. })
        ));
        assert_eq!(cursor.inflate(&pack, data_at, 12).unwrap(), b"twelve bytes");
    }

    #[test]
    fn huge_declared_size_fails_without_allocating_it() {
        let (_dir, pack, cache, offset) = setup(b"twelve bytes".to_vec());
        let mut cursor = WindowCursor::new(&cache);
        for size in [1u64 << 62, u64::MAX] {
            assert!(matches!(
                cursor.inflate(&pack, offset + 1, size),
                Err(PackError::CorruptPack { .. })
            ));
        }
    }

    #[test]
    fn inflate_prefix_stops_early() {
        let (_dir, pack, cache, offset) = setup(b"abcdefghijklmnop".to_vec());
        let mut cursor = WindowCursor::new(&cache);
        assert_eq!(cursor.inflate_prefix(&pack, offset + 1, 4).unwrap(), b"abcd");
    }

    #[test]
    fn copy_stops_at_pack_end() {
        let (_dir, pack, cache, _) = setup(b"x".to_vec());
        let mut cursor = WindowCursor::new(&cache);
        let mut buf = vec![0u8; 1000];
        let n = cursor.copy(&pack, 0, &mut buf).unwrap();
        assert_eq!(n as u64, pack.length());
        assert_eq!(&buf[..4], b"PACK");
        assert!(cursor.read_exact(&pack, 0, &mut buf).is_err());
    }

    #[test]
    fn range_reader_reads_sequentially() {
        let (_dir, pack, cache, _) = setup(b"range".to_vec());
        let mut reader = PackRangeReader::new(Arc::clone(&pack), &cache, 0);
        reader.prime().unwrap();
        let mut head = [0u8; 12];
        reader.read_exact(&mut head).unwrap();
        assert_eq!(&head[..4], b"PACK");
        assert_eq!(u32::from_be_bytes([head[8], head[9], head[10], head[11]]), 1);
    }
}
