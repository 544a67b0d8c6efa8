//! Block device trait definitions for ferrofs

use std::io;
use thiserror::Error;

/// Block size in bytes (512B)
pub const BLOCK_SIZE: usize = 512;

/// Error type for block device operations
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid block number: {0}")]
    InvalidBlockNumber(u64),
    #[error("Invalid block size: {0} (expected {BLOCK_SIZE})")]
    InvalidBlockSize(usize),
    #[error("Access beyond device end: offset {offset}, length {len}")]
    OutOfBounds { offset: u64, len: usize },
    #[error("Device is already closed")]
    DeviceClosed,
}

/// Result type for block device operations
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Trait for block device operations
#[async_trait::async_trait]
pub trait BlockDevice: Send + Sync + 'static {
    /// Read a block from the device
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()>;

    /// Write a block to the device
    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()>;

    /// Read raw bytes starting at an arbitrary offset
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write raw bytes starting at an arbitrary offset
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Get the total number of blocks in the device
    fn block_count(&self) -> u64;

    /// Get the total size of the device in bytes
    fn size(&self) -> u64;

    /// Get the block size in bytes
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Sync any pending writes to the device
    async fn sync(&self) -> Result<()>;

    /// Close the device. Implies a final sync.
    async fn close(&self) -> Result<()>;

    /// Check if the device is still attached
    fn is_attached(&self) -> bool;
}
