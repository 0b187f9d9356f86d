//! Hand-assembled packs for unit tests.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use odb_store::RawObject;
use odb_types::{ObjectId, ObjectKind};

use crate::delta::compute_delta;
use crate::entry::{encode_header, PackEntryKind};
use crate::index::{PackIndexWriter, PackedObjectInfo};
use crate::io::sha1_digest;

pub(crate) enum TestObject {
    Whole { kind: ObjectKind, data: Vec<u8> },
    /// Offset delta against an earlier object in the same list.
    OfsDelta { base: usize, data: Vec<u8> },
    /// Reference delta against another object in the same list.
    RefDelta { base: usize, data: Vec<u8> },
    /// Reference delta against an object outside the pack.
    Thin { base: RawObject, data: Vec<u8> },
}

impl TestObject {
    pub(crate) fn whole(kind: ObjectKind, data: impl Into<Vec<u8>>) -> Self {
        Self::Whole {
            kind,
            data: data.into(),
        }
    }

    pub(crate) fn blob(data: impl Into<Vec<u8>>) -> Self {
        Self::whole(ObjectKind::Blob, data)
    }

    pub(crate) fn ofs_delta(base: usize, data: impl Into<Vec<u8>>) -> Self {
        Self::OfsDelta {
            base,
            data: data.into(),
        }
    }

    pub(crate) fn ref_delta(base: usize, data: impl Into<Vec<u8>>) -> Self {
        Self::RefDelta {
            base,
            data: data.into(),
        }
    }

    pub(crate) fn thin(base: RawObject, data: impl Into<Vec<u8>>) -> Self {
        Self::Thin {
            base,
            data: data.into(),
        }
    }
}

pub(crate) struct EncodedPack {
    pub bytes: Vec<u8>,
    /// One entry per input object, in input order.
    pub entries: Vec<PackedObjectInfo>,
    /// Resolved content per input object.
    pub objects: Vec<RawObject>,
    pub checksum: [u8; 20],
}

impl EncodedPack {
    pub(crate) fn ids(&self) -> Vec<ObjectId> {
        self.entries.iter().map(|e| e.id).collect()
    }
}

pub(crate) struct BuiltPack {
    pub pack_path: PathBuf,
    pub index_path: PathBuf,
    pub entries: Vec<PackedObjectInfo>,
    pub objects: Vec<RawObject>,
    pub checksum: [u8; 20],
}

impl BuiltPack {
    pub(crate) fn ids(&self) -> Vec<ObjectId> {
        self.entries.iter().map(|e| e.id).collect()
    }
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// Serialize `objects` as a version 2 pack. Delta bases must precede their
/// deltas for offset deltas; reference deltas may point anywhere.
pub(crate) fn encode_pack(objects: &[TestObject]) -> EncodedPack {
    let resolved: Vec<RawObject> = {
        let mut out: Vec<RawObject> = Vec::with_capacity(objects.len());
        for (i, object) in objects.iter().enumerate() {
            let raw = match object {
                TestObject::Whole { kind, data } => RawObject::new(*kind, data.clone()),
                TestObject::OfsDelta { base, data } | TestObject::RefDelta { base, data } => {
                    assert!(*base < i, "test delta bases must come first");
                    RawObject::new(out[*base].kind, data.clone())
                }
                TestObject::Thin { base, data } => RawObject::new(base.kind, data.clone()),
            };
            out.push(raw);
        }
        out
    };

    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"PACK");
    bytes.extend_from_slice(&2u32.to_be_bytes());
    bytes.extend_from_slice(&(objects.len() as u32).to_be_bytes());

    let mut entries: Vec<PackedObjectInfo> = Vec::with_capacity(objects.len());
    for (i, object) in objects.iter().enumerate() {
        let offset = bytes.len() as u64;
        let mut entry = Vec::new();
        let (kind, payload) = match object {
            TestObject::Whole { kind, data } => (PackEntryKind::Whole(*kind), data.clone()),
            TestObject::OfsDelta { base, data } => (
                PackEntryKind::OfsDelta {
                    base_offset: entries[*base].offset,
                },
                compute_delta(&resolved[*base].data, data),
            ),
            TestObject::RefDelta { base, data } => (
                PackEntryKind::RefDelta {
                    base: entries[*base].id,
                },
                compute_delta(&resolved[*base].data, data),
            ),
            TestObject::Thin { base, data } => (
                PackEntryKind::RefDelta {
                    base: base.compute_id(),
                },
                compute_delta(&base.data, data),
            ),
        };
        encode_header(&kind, payload.len() as u64, offset, &mut entry);
        entry.extend_from_slice(&deflate(&payload));
        let crc = crc32fast::hash(&entry);
        bytes.extend_from_slice(&entry);
        entries.push(PackedObjectInfo::new(resolved[i].compute_id(), offset, Some(crc)));
    }

    let checksum = sha1_digest(&bytes);
    bytes.extend_from_slice(&checksum);
    EncodedPack {
        bytes,
        entries,
        objects: resolved,
        checksum,
    }
}

/// Write `pack-<checksum>.pack` and a version 2 `.idx` into `dir`.
pub(crate) fn build_pack(dir: &Path, objects: &[TestObject]) -> BuiltPack {
    let encoded = encode_pack(objects);
    write_pack(dir, &encoded, 2)
}

pub(crate) fn write_pack(dir: &Path, encoded: &EncodedPack, index_version: u32) -> BuiltPack {
    let name = format!("pack-{}", hex::encode(encoded.checksum));
    let pack_path = dir.join(format!("{name}.pack"));
    let index_path = dir.join(format!("{name}.idx"));
    fs::write(&pack_path, &encoded.bytes).unwrap();

    let mut sorted = encoded.entries.clone();
    let mut idx = Vec::new();
    PackIndexWriter::new(&mut idx, index_version)
        .unwrap()
        .write(&mut sorted, &encoded.checksum)
        .unwrap();
    fs::write(&index_path, idx).unwrap();

    BuiltPack {
        pack_path,
        index_path,
        entries: encoded.entries.clone(),
        objects: encoded.objects.clone(),
        checksum: encoded.checksum,
    }
}

/// Deterministic pseudo-random bytes.
pub(crate) fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}
