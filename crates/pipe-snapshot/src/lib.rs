//! Section-framed snapshot files for the pipe device.
//!
//! A file is a fixed header followed by `(id, version, flags, len)` sections. Readers skip
//! sections they do not know, so newer writers can append state without breaking older readers.

mod error;
mod format;
pub mod io;

pub use crate::error::{Result, SnapshotError};
pub use crate::format::{SectionId, SNAPSHOT_ENDIANNESS_BIG, SNAPSHOT_MAGIC, SNAPSHOT_VERSION_V1};

use std::io::{Read, Seek, SeekFrom, Write};

use crate::io::{ReadBeExt, WriteBeExt};

const MAX_LABEL_LEN: usize = 4096;
const MAX_PIPE_DEVICE_SECTION_LEN: u64 = 256 * 1024 * 1024;

/// Free-form information about a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub snapshot_id: u64,
    pub label: Option<String>,
}

impl SnapshotMeta {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        w.write_u64_be(self.snapshot_id)?;
        match &self.label {
            Some(label) => {
                w.write_bool(true)?;
                w.write_string_u32(label)?;
            }
            None => w.write_bool(false)?,
        }
        Ok(())
    }

    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        let snapshot_id = r.read_u64_be()?;
        let label = if r.read_bool()? {
            Some(r.read_string_u32(MAX_LABEL_LEN)?)
        } else {
            None
        };
        Ok(Self { snapshot_id, label })
    }
}

pub trait SnapshotSource {
    fn snapshot_meta(&mut self) -> SnapshotMeta {
        SnapshotMeta::default()
    }

    fn save_pipe_device(&mut self, w: &mut dyn Write) -> Result<()>;
}

pub trait SnapshotTarget {
    fn restore_meta(&mut self, _meta: SnapshotMeta) {}

    fn restore_pipe_device(&mut self, r: &mut dyn Read) -> Result<()>;

    /// Runs once every section has been consumed.
    fn post_restore(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn save_snapshot<W: Write + Seek, S: SnapshotSource + ?Sized>(
    w: &mut W,
    source: &mut S,
) -> Result<()> {
    write_file_header(w)?;

    write_section(w, SectionId::META, 1, 0, |w| source.snapshot_meta().encode(w))?;

    write_section(w, SectionId::PIPE_DEVICE, 1, 0, |w| source.save_pipe_device(w))?;

    Ok(())
}

pub fn restore_snapshot<R: Read, T: SnapshotTarget + ?Sized>(
    r: &mut R,
    target: &mut T,
) -> Result<()> {
    read_file_header(r)?;

    let mut seen_device = false;

    while let Some(header) = read_section_header(r)? {
        if header.id == SectionId::PIPE_DEVICE && header.len > MAX_PIPE_DEVICE_SECTION_LEN {
            return Err(SnapshotError::Corrupt("pipe device section too large"));
        }

        let mut section_reader = r.take(header.len);
        match header.id {
            id if id == SectionId::META => {
                if header.version == 1 {
                    let meta = SnapshotMeta::decode(&mut section_reader)?;
                    target.restore_meta(meta);
                }
            }
            id if id == SectionId::PIPE_DEVICE => {
                if header.version == 1 {
                    if seen_device {
                        return Err(SnapshotError::Corrupt("duplicate pipe device section"));
                    }
                    target.restore_pipe_device(&mut section_reader)?;
                    seen_device = true;
                }
            }
            _ => {
                // Unknown section; skip.
            }
        }

        // Consume any trailing bytes (forward-compatible additions inside known sections).
        std::io::copy(&mut section_reader, &mut std::io::sink())?;
        if section_reader.limit() != 0 {
            return Err(SnapshotError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated section payload",
            )));
        }
    }

    if !seen_device {
        return Err(SnapshotError::Corrupt("missing pipe device section"));
    }
    target.post_restore()?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct SectionHeader {
    id: SectionId,
    version: u16,
    len: u64,
}

fn write_file_header<W: Write>(w: &mut W) -> Result<()> {
    w.write_bytes(SNAPSHOT_MAGIC)?;
    w.write_u16_be(SNAPSHOT_VERSION_V1)?;
    w.write_u8(SNAPSHOT_ENDIANNESS_BIG)?;
    w.write_u8(0)?; // reserved
    w.write_u32_be(0)?; // flags/reserved
    Ok(())
}

fn read_file_header<R: Read>(r: &mut R) -> Result<()> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != SNAPSHOT_MAGIC {
        return Err(SnapshotError::InvalidMagic);
    }
    let version = r.read_u16_be()?;
    if version != SNAPSHOT_VERSION_V1 {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    let endianness = r.read_u8()?;
    if endianness != SNAPSHOT_ENDIANNESS_BIG {
        return Err(SnapshotError::InvalidEndianness(endianness));
    }
    let _reserved = r.read_u8()?;
    let _flags = r.read_u32_be()?;
    Ok(())
}

fn write_section<W: Write + Seek>(
    w: &mut W,
    id: SectionId,
    version: u16,
    flags: u16,
    f: impl FnOnce(&mut W) -> Result<()>,
) -> Result<()> {
    let header_pos = w.stream_position()?;
    w.write_u32_be(id.0)?;
    w.write_u16_be(version)?;
    w.write_u16_be(flags)?;
    w.write_u64_be(0)?; // placeholder len

    let payload_start = w.stream_position()?;
    f(w)?;
    let payload_end = w.stream_position()?;

    let len = payload_end
        .checked_sub(payload_start)
        .ok_or(SnapshotError::Corrupt("stream position underflow"))?;

    w.seek(SeekFrom::Start(header_pos + 8))?;
    w.write_u64_be(len)?;
    w.seek(SeekFrom::Start(payload_end))?;
    Ok(())
}

fn read_section_header<R: Read>(r: &mut R) -> Result<Option<SectionHeader>> {
    let mut first = [0u8; 1];
    if r.read(&mut first)? == 0 {
        return Ok(None);
    }
    let mut tag_bytes = [0u8; 4];
    tag_bytes[0] = first[0];
    r.read_exact(&mut tag_bytes[1..])?;
    let id = SectionId(u32::from_be_bytes(tag_bytes));
    let version = r.read_u16_be()?;
    let _flags = r.read_u16_be()?;
    let len = r.read_u64_be()?;
    Ok(Some(SectionHeader { id, version, len }))
}
