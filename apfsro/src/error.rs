use thiserror::Error;

// Host error codes, reachable only through ApfsError::errno().
pub const ENOENT: i32 = 2;
pub const EIO: i32 = 5;
pub const ENOMEM: i32 = 12;
pub const EINVAL: i32 = 22;
pub const EROFS: i32 = 30;
pub const EFSCORRUPTED: i32 = 117;

#[derive(Error, Debug)]
pub enum ApfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid magic: 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("invalid block size: {0}")]
    InvalidBlockSize(u32),

    #[error("invalid mount option: {0}")]
    InvalidOption(String),

    #[error("invalid volume number: {0}")]
    InvalidVolume(u32),

    #[error("invalid checksum")]
    InvalidChecksum,

    #[error("invalid B-tree: {0}")]
    InvalidBTree(String),

    #[error("corrupted data: {0}")]
    CorruptedData(String),

    #[error("record not found")]
    NotFound,

    #[error("filesystem is read-only")]
    ReadOnly,

    #[error("out of memory")]
    Nomem,
}

impl ApfsError {
    /// Collapse to the negative errno the host expects. Everything internal
    /// stays a typed variant; the numeric code exists only at this boundary.
    pub fn errno(&self) -> i32 {
        match self {
            ApfsError::Io(_) => -EIO,
            ApfsError::InvalidMagic(_)
            | ApfsError::InvalidBlockSize(_)
            | ApfsError::InvalidOption(_)
            | ApfsError::InvalidVolume(_) => -EINVAL,
            ApfsError::InvalidChecksum
            | ApfsError::InvalidBTree(_)
            | ApfsError::CorruptedData(_) => -EFSCORRUPTED,
            ApfsError::NotFound => -ENOENT,
            ApfsError::ReadOnly => -EROFS,
            ApfsError::Nomem => -ENOMEM,
        }
    }
}

pub type Result<T> = std::result::Result<T, ApfsError>;
