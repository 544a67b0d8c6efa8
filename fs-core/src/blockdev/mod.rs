//! Block device I/O over a backing image file

mod blockdev_trait;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

pub use self::blockdev_trait::{BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};

/// A block device backed by a regular file on the host filesystem.
///
/// The image is an ordered sequence of fixed 512-byte blocks indexed from 0.
/// Writes become visible to later reads within the same attachment; `close`
/// syncs outstanding writes before releasing the file.
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Mutex<Option<File>>,
    path: PathBuf,
    size: u64,
    block_count: u64,
    attached: AtomicBool,
}

impl FileBackedBlockDevice {
    /// Create a new image file of the given size, truncating any existing one
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        file.set_len(size).await?;

        let block_count = size / BLOCK_SIZE as u64;
        log::debug!(
            "attached new image {:?} ({} bytes, {} blocks)",
            path,
            size,
            block_count
        );

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size,
            block_count,
            attached: AtomicBool::new(true),
        })
    }

    /// Open an existing image file; its size determines the block count
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path).await?;

        let size = file.metadata().await?.len();
        let block_count = size / BLOCK_SIZE as u64;
        log::debug!(
            "attached existing image {:?} ({} bytes, {} blocks)",
            path,
            size,
            block_count
        );

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size,
            block_count,
            attached: AtomicBool::new(true),
        })
    }

    /// Path of the backing image
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BlockDevice for FileBackedBlockDevice {
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        if block_num >= self.block_count {
            return Err(BlockDeviceError::InvalidBlockNumber(block_num));
        }
        if buf.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(buf.len()));
        }

        let offset = block_num * BLOCK_SIZE as u64;
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(buf).await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if block_num >= self.block_count {
            return Err(BlockDeviceError::InvalidBlockNumber(block_num));
        }
        if data.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(data.len()));
        }

        let offset = block_num * BLOCK_SIZE as u64;
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            file.flush().await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.size {
            return Err(BlockDeviceError::OutOfBounds {
                offset,
                len: buf.len(),
            });
        }

        let mut file_guard = self.file.lock().await;
        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(buf).await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > self.size {
            return Err(BlockDeviceError::OutOfBounds {
                offset,
                len: data.len(),
            });
        }

        let mut file_guard = self.file.lock().await;
        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            file.flush().await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn sync(&self) -> Result<()> {
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.sync_all().await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    async fn close(&self) -> Result<()> {
        let mut file_guard = self.file.lock().await;

        if let Some(file) = file_guard.take() {
            file.sync_all().await?;
            self.attached.store(false, Ordering::Release);
            log::debug!("detached image {:?}", self.path);
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}
