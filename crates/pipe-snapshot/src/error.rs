use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("invalid snapshot magic")]
    InvalidMagic,

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u16),

    #[error("invalid endianness tag {0}")]
    InvalidEndianness(u8),

    #[error("unsupported pipe device version {0}")]
    UnsupportedDeviceVersion(u32),

    #[error("unsupported pipe driver version {0}")]
    UnsupportedDriverVersion(u32),

    #[error("{what} at guest address 0x{paddr:x} is not backed by RAM")]
    UnmappedGuestBuffer { what: &'static str, paddr: u64 },

    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),

    #[error("utf-8 decoding failed: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}
