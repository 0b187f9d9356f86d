use std::io::Write;

use crate::config::IndexVersion;
use crate::error::{PackError, PackResult};
use crate::io::DigestWriter;

use super::{fan_out_of, v1, v2, PackedObjectInfo};

/// Oldest index format able to describe `entries`: version 1 unless an
/// offset needs more than 32 bits.
pub fn oldest_possible_version(entries: &[PackedObjectInfo]) -> u32 {
    if entries.iter().all(|e| e.offset <= u64::from(u32::MAX)) {
        1
    } else {
        2
    }
}

/// Serializes a pack index in version 1 or 2.
pub struct PackIndexWriter<W: Write> {
    out: DigestWriter<W>,
    version: u32,
}

impl<W: Write> PackIndexWriter<W> {
    pub fn new(out: W, version: u32) -> PackResult<Self> {
        if !matches!(version, 1 | 2) {
            return Err(PackError::UnsupportedVersion(version));
        }
        Ok(Self {
            out: DigestWriter::new(out),
            version,
        })
    }

    /// Writer for the version a configuration asks for, resolving `Auto`
    /// against the entries to be written.
    pub fn for_config(out: W, version: IndexVersion, entries: &[PackedObjectInfo]) -> PackResult<Self> {
        let version = match version {
            IndexVersion::Auto => oldest_possible_version(entries),
            IndexVersion::V1 => 1,
            IndexVersion::V2 => 2,
        };
        Self::new(out, version)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Sort `entries` by id, write the index and its trailer, and return the
    /// index digest.
    pub fn write(mut self, entries: &mut [PackedObjectInfo], pack_checksum: &[u8; 20]) -> PackResult<[u8; 20]> {
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(pair) = entries.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(PackError::InvalidConfig(format!(
                "object {} listed twice",
                pair[0].id
            )));
        }
        let fan_out = fan_out_of(entries.iter().map(|e| &e.id));
        match self.version {
            1 => v1::write_body(&mut self.out, entries, &fan_out)?,
            _ => v2::write_body(&mut self.out, entries, &fan_out)?,
        }
        self.out.write_all(pack_checksum)?;
        let digest = self.out.digest();
        self.out.write_all(&digest)?;
        self.out.flush()?;
        Ok(digest)
    }
}
