use std::io::{self, Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;

use flate2::read::ZlibDecoder;
use odb_store::RawObject;
use odb_types::{ObjectId, ObjectKind};
use tracing::warn;

use crate::cursor::PackRangeReader;
use crate::delta::DeltaStream;
use crate::error::{PackError, PackResult};
use crate::pack_file::{PackFile, ReadContext};

/// Where a streamed delta finds its base.
#[derive(Clone)]
pub(crate) enum StreamBase {
    /// Another entry of the same pack.
    Offset(u64),
    Cached(Arc<[u8]>),
    /// Thin-pack base supplied from outside the pack.
    External(Box<ObjectLoader>),
}

#[derive(Clone)]
enum Source {
    Cached(Arc<[u8]>),
    Whole {
        pack: Arc<PackFile>,
        ctx: ReadContext,
        data_offset: u64,
    },
    Delta {
        pack: Arc<PackFile>,
        ctx: ReadContext,
        data_offset: u64,
        delta_size: u64,
        base_size: u64,
        base: StreamBase,
        depth: usize,
    },
}

/// Handle to one object's content.
///
/// Objects at or under the stream threshold are fully materialized; larger
/// ones only remember where they live and are produced through
/// [`open_stream`](Self::open_stream).
#[derive(Clone)]
pub struct ObjectLoader {
    id: ObjectId,
    kind: ObjectKind,
    size: u64,
    threshold: u64,
    source: Source,
}

impl ObjectLoader {
    pub fn from_bytes(id: ObjectId, kind: ObjectKind, data: impl Into<Arc<[u8]>>, threshold: u64) -> Self {
        let data = data.into();
        Self {
            id,
            kind,
            size: data.len() as u64,
            threshold,
            source: Source::Cached(data),
        }
    }

    pub fn from_raw(id: ObjectId, object: RawObject, threshold: u64) -> Self {
        Self::from_bytes(id, object.kind, object.data, threshold)
    }

    pub(crate) fn whole(
        id: ObjectId,
        kind: ObjectKind,
        size: u64,
        threshold: u64,
        pack: Arc<PackFile>,
        ctx: ReadContext,
        data_offset: u64,
    ) -> Self {
        Self {
            id,
            kind,
            size,
            threshold,
            source: Source::Whole {
                pack,
                ctx,
                data_offset,
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn delta(
        id: ObjectId,
        kind: ObjectKind,
        size: u64,
        threshold: u64,
        pack: Arc<PackFile>,
        ctx: ReadContext,
        data_offset: u64,
        delta_size: u64,
        base_size: u64,
        base: StreamBase,
        depth: usize,
    ) -> Self {
        Self {
            id,
            kind,
            size,
            threshold,
            source: Source::Delta {
                pack,
                ctx,
                data_offset,
                delta_size,
                base_size,
                base,
                depth,
            },
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_large(&self) -> bool {
        self.size > self.threshold
    }

    /// Fail with [`PackError::IncorrectType`] unless the object is `expected`.
    pub fn expect_kind(self, expected: ObjectKind) -> PackResult<Self> {
        if self.kind != expected {
            return Err(PackError::IncorrectType {
                id: self.id,
                expected,
                actual: self.kind,
            });
        }
        Ok(self)
    }

    /// The materialized content. Large objects refuse with
    /// [`PackError::LargeObject`]; read them through a stream instead.
    pub fn cached_bytes(&self) -> PackResult<&[u8]> {
        match &self.source {
            Source::Cached(data) if !self.is_large() => Ok(data),
            _ => Err(PackError::LargeObject {
                id: self.id,
                size: self.size,
                limit: self.threshold,
            }),
        }
    }

    pub(crate) fn cached_arc(&self) -> Option<Arc<[u8]>> {
        match &self.source {
            Source::Cached(data) => Some(Arc::clone(data)),
            _ => None,
        }
    }

    /// Entire content regardless of size.
    pub fn read_all(&self) -> PackResult<Vec<u8>> {
        if let Some(data) = self.cached_arc() {
            return Ok(data.to_vec());
        }
        let mut stream = self.open_stream()?;
        let mut out = Vec::with_capacity(self.size.min(1 << 20) as usize);
        stream.read_to_end(&mut out).map_err(PackError::from_stream_error)?;
        Ok(out)
    }

    pub fn into_raw(self) -> PackResult<RawObject> {
        let data = self.cached_bytes()?.to_vec();
        Ok(RawObject::new(self.kind, data))
    }

    /// Stream the content. Works for every object; small ones stream from
    /// memory.
    ///
    /// Opening touches the pack before returning, so a pack that vanished
    /// since this loader was made is noticed here and the object is looked
    /// up again elsewhere.
    pub fn open_stream(&self) -> PackResult<ObjectStream> {
        let opened = match &self.source {
            Source::Cached(data) => {
                let reader = Cursor::new(Arc::clone(data));
                return Ok(ObjectStream::new(self.kind, self.size, Box::new(reader)));
            }
            Source::Whole {
                pack,
                ctx,
                data_offset,
            } => self.open_whole(pack, ctx, *data_offset),
            Source::Delta {
                pack,
                ctx,
                data_offset,
                delta_size,
                base_size,
                base,
                depth,
            } => self.open_delta(pack, ctx, *data_offset, *delta_size, *base_size, base, *depth),
        };
        match opened {
            Err(err) if err.is_transient() => self.reopen_elsewhere(err),
            other => other,
        }
    }

    fn open_whole(&self, pack: &Arc<PackFile>, ctx: &ReadContext, data_offset: u64) -> PackResult<ObjectStream> {
        let mut range = PackRangeReader::new(Arc::clone(pack), &ctx.cache, data_offset);
        range.prime()?;
        let inflater = SizedInflater::new(range, self.size, pack.path().to_path_buf(), data_offset);
        Ok(ObjectStream::new(self.kind, self.size, Box::new(inflater)))
    }

    #[allow(clippy::too_many_arguments)]
    fn open_delta(
        &self,
        pack: &Arc<PackFile>,
        ctx: &ReadContext,
        data_offset: u64,
        delta_size: u64,
        base_size: u64,
        base: &StreamBase,
        depth: usize,
    ) -> PackResult<ObjectStream> {
        let mut range = PackRangeReader::new(Arc::clone(pack), &ctx.cache, data_offset);
        range.prime()?;
        let delta = SizedInflater::new(range, delta_size, pack.path().to_path_buf(), data_offset);
        let opener = base_opener(Arc::clone(pack), ctx.clone(), base.clone(), depth);
        let stream =
            DeltaStream::new(Box::new(delta), base_size, opener).map_err(PackError::from_stream_error)?;
        if stream.result_size() != self.size {
            return Err(pack.corrupt(
                data_offset,
                format!("delta result is {} bytes, expected {}", stream.result_size(), self.size),
            ));
        }
        Ok(ObjectStream::new(self.kind, self.size, Box::new(stream)))
    }

    fn reopen_elsewhere(&self, err: PackError) -> PackResult<ObjectStream> {
        let (pack, ctx) = match &self.source {
            Source::Whole { pack, ctx, .. } | Source::Delta { pack, ctx, .. } => (pack, ctx),
            Source::Cached(_) => return Err(err),
        };
        warn!(id = %self.id, pack = %pack.name(), error = %err, "pack changed while opening stream");
        pack.invalidate(ctx);
        let Some(external) = ctx.external.as_ref() else {
            return Err(err);
        };
        match external.open_external(&self.id, 0)? {
            Some(loader) => loader.open_stream(),
            None => Err(PackError::MissingObject(self.id)),
        }
    }
}

impl std::fmt::Debug for ObjectLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            Source::Cached(_) => "cached",
            Source::Whole { .. } => "whole",
            Source::Delta { .. } => "delta",
        };
        f.debug_struct("ObjectLoader")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("source", &source)
            .finish()
    }
}

fn base_opener(
    pack: Arc<PackFile>,
    ctx: ReadContext,
    base: StreamBase,
    depth: usize,
) -> Box<dyn FnMut() -> io::Result<Box<dyn Read + Send>> + Send> {
    let mut resolved: Option<Arc<[u8]>> = None;
    Box::new(move || {
        if let Some(bytes) = &resolved {
            return Ok(Box::new(Cursor::new(Arc::clone(bytes))) as Box<dyn Read + Send>);
        }
        let loader = match &base {
            StreamBase::Cached(bytes) => return Ok(Box::new(Cursor::new(Arc::clone(bytes)))),
            StreamBase::External(loader) => (**loader).clone(),
            StreamBase::Offset(offset) => pack.load_at(&ctx, None, *offset, depth + 1)?,
        };
        if let Some(bytes) = loader.cached_arc() {
            resolved = Some(Arc::clone(&bytes));
            return Ok(Box::new(Cursor::new(bytes)));
        }
        Ok(Box::new(loader.open_stream()?))
    })
}

/// Readable content of one object.
pub struct ObjectStream {
    kind: ObjectKind,
    size: u64,
    inner: Box<dyn Read + Send>,
}

impl ObjectStream {
    fn new(kind: ObjectKind, size: u64, inner: Box<dyn Read + Send>) -> Self {
        Self { kind, size, inner }
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for ObjectStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl std::fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStream")
            .field("kind", &self.kind)
            .field("size", &self.size)
            .finish()
    }
}

/// Zlib reader that must yield exactly `size` bytes.
struct SizedInflater<R: Read> {
    decoder: ZlibDecoder<R>,
    size: u64,
    remaining: u64,
    finished: bool,
    pack: PathBuf,
    offset: u64,
}

impl<R: Read> SizedInflater<R> {
    fn new(inner: R, size: u64, pack: PathBuf, offset: u64) -> Self {
        Self {
            decoder: ZlibDecoder::new(inner),
            size,
            remaining: size,
            finished: false,
            pack,
            offset,
        }
    }

    fn corrupt(&self, reason: String) -> io::Error {
        PackError::CorruptPack {
            pack: self.pack.clone(),
            offset: self.offset,
            reason,
        }
        .into()
    }

    fn decode(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.decoder.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.get_ref().is_some_and(|inner| inner.is::<PackError>()) => Err(e),
            Err(e) => Err(self.corrupt(format!("invalid deflate stream: {e}"))),
        }
    }
}

impl<R: Read> Read for SizedInflater<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            if !self.finished {
                let mut probe = [0u8; 1];
                if self.decode(&mut probe)? != 0 {
                    return Err(self.corrupt("inflated data exceeds declared size".to_string()));
                }
                self.finished = true;
            }
            return Ok(0);
        }
        let want = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.decode(&mut buf[..want])?;
        if n == 0 {
            let got = self.size - self.remaining;
            return Err(self.corrupt(format!("stream ended after {got} of {} bytes", self.size)));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}
