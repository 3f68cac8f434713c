use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid magic: 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("malformed: {0}")]
    Malformed(String),

    #[error("missing checkpoint map")]
    MissingCheckpointMap,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("volume is locked")]
    Locked,

    #[error("invalid credential")]
    BadCredential,

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("no volume found in container")]
    NoVolume,
}

pub type Result<T> = std::result::Result<T, ApfsError>;
