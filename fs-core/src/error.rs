//! Crate-wide error type and the integer code taxonomy used by the shell

use thiserror::Error;

use crate::blockdev::BlockDeviceError;

/// Error type for filesystem operations
#[derive(Error, Debug)]
pub enum FsError {
    /// Unexpected internal condition (also: non-empty directory on rmdir)
    #[error("unexpected internal error")]
    Generic,

    /// Path component missing, dentry not present
    #[error("not found")]
    NotFound,

    /// Target name already present
    #[error("already exists")]
    Exists,

    /// Block or inode bitmap exhausted, or indirect capacity exceeded
    #[error("no space left on device")]
    NoSpace,

    /// Malformed path, wrong type for the operation, invalid argument
    #[error("invalid argument or malformed path")]
    Invalid,

    /// Underlying device error
    #[error("I/O error: {0}")]
    Io(#[from] BlockDeviceError),

    /// Open-flag mismatch on read/write
    #[error("permission denied")]
    Permission,
}

impl FsError {
    /// Stable integer code for each error class. Success is 0 by convention;
    /// the codes below are what the shell reports.
    pub fn code(&self) -> i32 {
        match self {
            FsError::Generic => -1,
            FsError::NotFound => -2,
            FsError::Exists => -3,
            FsError::NoSpace => -4,
            FsError::Invalid => -5,
            FsError::Io(_) => -6,
            FsError::Permission => -7,
        }
    }
}

/// Result type for filesystem operations
pub type Result<T> = std::result::Result<T, FsError>;
