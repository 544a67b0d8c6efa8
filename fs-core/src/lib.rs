//! ferrofs - an educational Unix-like block filesystem in a single image file
//!
//! The crate implements a small storage engine over a fixed 512-byte block
//! device: a superblock describing the on-disk layout, bitmap-backed block
//! and inode allocators, an inode table with direct and single-indirect
//! addressing, fixed-slot directory entries, and POSIX-style path resolution
//! with `.`/`..` traversal. Files support random-access I/O, hard links, and
//! reference-counted deletion.
//!
//! Single mounter at a time; there is no journal, and crash consistency is
//! limited to the atomicity of individual block writes.

#![warn(rust_2018_idioms)]

pub mod bitmap;
pub mod blockdev;
pub mod dentry;
pub mod error;
pub mod fs;
pub mod inode;
pub mod layout;
pub mod path;

pub use bitmap::Bitmap;
pub use blockdev::{BlockDevice, BlockDeviceError, FileBackedBlockDevice, BLOCK_SIZE};
pub use dentry::{Dentry, DENTRIES_PER_BLOCK, DENTRY_DISK_SIZE};
pub use error::{FsError, Result};
pub use fs::{flags, Filesystem, FsStats, OpenFile};
pub use inode::{Inode, InodeType, INODE_DISK_SIZE, INODES_PER_BLOCK, ROOT_INODE};
pub use layout::{Superblock, MAGIC};

/// Common types and traits
pub mod prelude {
    pub use crate::bitmap::Bitmap;
    pub use crate::blockdev::{BlockDevice, BlockDeviceError, FileBackedBlockDevice, BLOCK_SIZE};
    pub use crate::dentry::Dentry;
    pub use crate::error::{FsError, Result};
    pub use crate::fs::{flags, Filesystem, OpenFile};
    pub use crate::inode::{Inode, InodeType, ROOT_INODE};
    pub use crate::layout::Superblock;
}

/// Seconds since the Unix epoch, the timestamp unit used on disk
pub(crate) fn unix_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
