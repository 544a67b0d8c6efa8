//! On-disk layout descriptor: the superblock
//!
//! Block 0 holds the superblock. Its region pointers are computed once at
//! format time and trusted as-is on mount.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::error::{FsError, Result};
use crate::inode::INODE_DISK_SIZE;
use crate::unix_now;

/// Magic number identifying a valid filesystem
pub const MAGIC: u32 = 0x1234_5678;

/// Block number of the superblock
pub const SUPERBLOCK_BLOCK: u64 = 0;

/// Serialized superblock size in bytes; the rest of block 0 is zero
pub const SUPERBLOCK_DISK_SIZE: usize = 108;

const RESERVED_BYTES: usize = 32;

const _: () = assert!(SUPERBLOCK_DISK_SIZE == 14 * 4 + 2 * 8 + 4 + RESERVED_BYTES);
const _: () = assert!(SUPERBLOCK_DISK_SIZE <= BLOCK_SIZE);

/// Global filesystem metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    pub total_blocks: u32,
    pub total_inodes: u32,
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub block_size: u32,
    pub inode_size: u32,
    pub block_bitmap_start: u32,
    pub block_bitmap_blocks: u32,
    pub inode_bitmap_start: u32,
    pub inode_bitmap_blocks: u32,
    pub inode_table_start: u32,
    pub inode_table_blocks: u32,
    pub first_data_block: u32,
    pub created_time: i64,
    pub last_mount_time: i64,
    pub mount_count: u32,
}

/// Whole blocks needed to hold `bytes` bytes
pub(crate) fn blocks_needed(bytes: usize) -> u32 {
    bytes.div_ceil(BLOCK_SIZE) as u32
}

impl Superblock {
    /// Compute the layout for a fresh filesystem, placing regions greedily
    /// from block 1: block bitmap, inode bitmap, inode table, data area.
    pub fn init(total_blocks: u32, total_inodes: u32) -> Result<Self> {
        let mut current_block = 1u32;

        let block_bitmap_bytes = (total_blocks as usize).div_ceil(8);
        let block_bitmap_blocks = blocks_needed(block_bitmap_bytes);
        let block_bitmap_start = current_block;
        current_block += block_bitmap_blocks;

        let inode_bitmap_bytes = (total_inodes as usize).div_ceil(8);
        let inode_bitmap_blocks = blocks_needed(inode_bitmap_bytes);
        let inode_bitmap_start = current_block;
        current_block += inode_bitmap_blocks;

        let inode_table_bytes = total_inodes as usize * INODE_DISK_SIZE;
        let inode_table_blocks = blocks_needed(inode_table_bytes);
        let inode_table_start = current_block;
        current_block += inode_table_blocks;

        let first_data_block = current_block;
        if first_data_block >= total_blocks {
            log::error!(
                "layout needs {} blocks but only {} are available",
                first_data_block,
                total_blocks
            );
            return Err(FsError::NoSpace);
        }

        Ok(Self {
            magic: MAGIC,
            total_blocks,
            total_inodes,
            free_blocks: total_blocks - first_data_block,
            // inode 0 is reserved; the root debit happens at allocation
            free_inodes: total_inodes - 1,
            block_size: BLOCK_SIZE as u32,
            inode_size: INODE_DISK_SIZE as u32,
            block_bitmap_start,
            block_bitmap_blocks,
            inode_bitmap_start,
            inode_bitmap_blocks,
            inode_table_start,
            inode_table_blocks,
            first_data_block,
            created_time: unix_now(),
            last_mount_time: 0,
            mount_count: 0,
        })
    }

    /// Check the magic number
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC
    }

    /// Read the superblock from block 0 and validate it
    pub async fn read(device: &dyn BlockDevice) -> Result<Self> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        device.read_block(SUPERBLOCK_BLOCK, &mut buf).await?;

        let sb = Self::from_bytes(&buf)?;
        if !sb.is_valid() {
            log::warn!("bad superblock magic 0x{:08X}", sb.magic);
            return Err(FsError::Invalid);
        }
        Ok(sb)
    }

    /// Persist the superblock at block 0
    pub async fn write(&self, device: &dyn BlockDevice) -> Result<()> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.write_bytes(&mut buf);
        device.write_block(SUPERBLOCK_BLOCK, &buf).await?;
        Ok(())
    }

    fn write_bytes(&self, buf: &mut [u8]) {
        let mut cursor = Cursor::new(buf);
        // all writes below target a BLOCK_SIZE buffer, they cannot fail
        cursor.write_u32::<LittleEndian>(self.magic).unwrap();
        cursor.write_u32::<LittleEndian>(self.total_blocks).unwrap();
        cursor.write_u32::<LittleEndian>(self.total_inodes).unwrap();
        cursor.write_u32::<LittleEndian>(self.free_blocks).unwrap();
        cursor.write_u32::<LittleEndian>(self.free_inodes).unwrap();
        cursor.write_u32::<LittleEndian>(self.block_size).unwrap();
        cursor.write_u32::<LittleEndian>(self.inode_size).unwrap();
        cursor
            .write_u32::<LittleEndian>(self.block_bitmap_start)
            .unwrap();
        cursor
            .write_u32::<LittleEndian>(self.block_bitmap_blocks)
            .unwrap();
        cursor
            .write_u32::<LittleEndian>(self.inode_bitmap_start)
            .unwrap();
        cursor
            .write_u32::<LittleEndian>(self.inode_bitmap_blocks)
            .unwrap();
        cursor
            .write_u32::<LittleEndian>(self.inode_table_start)
            .unwrap();
        cursor
            .write_u32::<LittleEndian>(self.inode_table_blocks)
            .unwrap();
        cursor
            .write_u32::<LittleEndian>(self.first_data_block)
            .unwrap();
        cursor.write_i64::<LittleEndian>(self.created_time).unwrap();
        cursor
            .write_i64::<LittleEndian>(self.last_mount_time)
            .unwrap();
        cursor.write_u32::<LittleEndian>(self.mount_count).unwrap();
        // remaining RESERVED_BYTES stay zero
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPERBLOCK_DISK_SIZE {
            return Err(FsError::Invalid);
        }
        let mut cursor = Cursor::new(buf);
        let read_err = |_| FsError::Invalid;

        Ok(Self {
            magic: cursor.read_u32::<LittleEndian>().map_err(read_err)?,
            total_blocks: cursor.read_u32::<LittleEndian>().map_err(read_err)?,
            total_inodes: cursor.read_u32::<LittleEndian>().map_err(read_err)?,
            free_blocks: cursor.read_u32::<LittleEndian>().map_err(read_err)?,
            free_inodes: cursor.read_u32::<LittleEndian>().map_err(read_err)?,
            block_size: cursor.read_u32::<LittleEndian>().map_err(read_err)?,
            inode_size: cursor.read_u32::<LittleEndian>().map_err(read_err)?,
            block_bitmap_start: cursor.read_u32::<LittleEndian>().map_err(read_err)?,
            block_bitmap_blocks: cursor.read_u32::<LittleEndian>().map_err(read_err)?,
            inode_bitmap_start: cursor.read_u32::<LittleEndian>().map_err(read_err)?,
            inode_bitmap_blocks: cursor.read_u32::<LittleEndian>().map_err(read_err)?,
            inode_table_start: cursor.read_u32::<LittleEndian>().map_err(read_err)?,
            inode_table_blocks: cursor.read_u32::<LittleEndian>().map_err(read_err)?,
            first_data_block: cursor.read_u32::<LittleEndian>().map_err(read_err)?,
            created_time: cursor.read_i64::<LittleEndian>().map_err(read_err)?,
            last_mount_time: cursor.read_i64::<LittleEndian>().map_err(read_err)?,
            mount_count: cursor.read_u32::<LittleEndian>().map_err(read_err)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::FileBackedBlockDevice;
    use tempfile::tempdir;

    #[test]
    fn test_layout_computation() {
        let sb = Superblock::init(1000, 128).unwrap();

        // 1000 bits -> 125 bytes -> 1 block at index 1
        assert_eq!(sb.block_bitmap_start, 1);
        assert_eq!(sb.block_bitmap_blocks, 1);
        // 128 bits -> 16 bytes -> 1 block
        assert_eq!(sb.inode_bitmap_start, 2);
        assert_eq!(sb.inode_bitmap_blocks, 1);
        // 128 inodes x 128B = 16384 bytes -> 32 blocks
        assert_eq!(sb.inode_table_start, 3);
        assert_eq!(sb.inode_table_blocks, 32);
        assert_eq!(sb.first_data_block, 35);

        assert_eq!(sb.free_blocks, 1000 - 35);
        assert_eq!(sb.free_inodes, 127);
        assert_eq!(sb.block_size, 512);
        assert_eq!(sb.inode_size, 128);
        assert!(sb.is_valid());
    }

    #[test]
    fn test_init_rejects_too_small_disk() {
        // metadata alone would not fit
        let result = Superblock::init(30, 1024);
        assert!(matches!(result, Err(FsError::NoSpace)));
    }

    #[tokio::test]
    async fn test_superblock_round_trip() {
        let temp_dir = tempdir().unwrap();
        let device =
            FileBackedBlockDevice::create(temp_dir.path().join("sb.img"), 100 * BLOCK_SIZE as u64)
                .await
                .unwrap();

        let mut sb = Superblock::init(100, 32).unwrap();
        sb.mount_count = 7;
        sb.last_mount_time = 1_700_000_000;
        sb.write(&device).await.unwrap();

        let read_back = Superblock::read(&device).await.unwrap();
        assert_eq!(sb, read_back);
        assert_eq!(read_back.magic, MAGIC);
    }

    #[tokio::test]
    async fn test_read_rejects_bad_magic() {
        let temp_dir = tempdir().unwrap();
        let device = FileBackedBlockDevice::create(
            temp_dir.path().join("junk.img"),
            100 * BLOCK_SIZE as u64,
        )
        .await
        .unwrap();

        let junk = vec![0x5Au8; BLOCK_SIZE];
        device.write_block(SUPERBLOCK_BLOCK, &junk).await.unwrap();

        let result = Superblock::read(&device).await;
        assert!(matches!(result, Err(FsError::Invalid)));
    }
}
