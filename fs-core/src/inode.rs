//! Inode table access: read/modify/write, allocation, freeing
//!
//! Inodes are 128 bytes on disk, four to a block. Individual inodes are
//! updated by reading their containing block, patching the slot, and writing
//! the block back, which preserves the three sibling inodes.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::bitmap::Bitmap;
use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::error::{FsError, Result};
use crate::layout::Superblock;
use crate::unix_now;

/// Serialized inode size in bytes
pub const INODE_DISK_SIZE: usize = 128;

/// Inodes stored in one block
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_DISK_SIZE;

/// Direct block pointers per inode
pub const DIRECT_POINTERS: usize = 12;

/// Block pointers held by the single indirect block
pub const INDIRECT_POINTERS: usize = BLOCK_SIZE / 4;

/// Reserved invalid inode number
pub const INVALID_INODE: u32 = 0;

/// Inode number of the root directory
pub const ROOT_INODE: u32 = 1;

const _: () = assert!(INODES_PER_BLOCK == 4);
const _: () = assert!(INDIRECT_POINTERS == 128);
const _: () = assert!(BLOCK_SIZE % INODE_DISK_SIZE == 0);

/// What an inode describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InodeType {
    Free = 0,
    File = 1,
    Directory = 2,
}

impl TryFrom<u8> for InodeType {
    type Error = FsError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(InodeType::Free),
            1 => Ok(InodeType::File),
            2 => Ok(InodeType::Directory),
            _ => Err(FsError::Invalid),
        }
    }
}

/// On-disk descriptor of a file or directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub kind: InodeType,
    /// Size in bytes
    pub size: u32,
    /// Blocks referenced by this inode, indirect block included
    pub blocks_used: u32,
    /// Direct pointers to data blocks; 0 means "no block"
    pub direct: [u32; DIRECT_POINTERS],
    /// Single indirect pointer; that block is an array of 128 pointers
    pub indirect: u32,
    pub created_time: i64,
    pub modified_time: i64,
    pub accessed_time: i64,
    /// Permission bits, stored but not enforced
    pub permissions: u16,
    /// Number of dentries referencing this inode
    pub links_count: u16,
}

impl Inode {
    /// Fresh inode of the given type: timestamps set to now, one link,
    /// no data blocks
    pub fn new(kind: InodeType, permissions: u16) -> Self {
        let now = unix_now();
        Self {
            kind,
            size: 0,
            blocks_used: 0,
            direct: [0; DIRECT_POINTERS],
            indirect: 0,
            created_time: now,
            modified_time: now,
            accessed_time: now,
            permissions,
            links_count: 1,
        }
    }

    /// Zeroed record marking a free inode slot
    pub fn zeroed() -> Self {
        Self {
            kind: InodeType::Free,
            size: 0,
            blocks_used: 0,
            direct: [0; DIRECT_POINTERS],
            indirect: 0,
            created_time: 0,
            modified_time: 0,
            accessed_time: 0,
            permissions: 0,
            links_count: 0,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == InodeType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == InodeType::File
    }

    pub(crate) fn to_bytes(&self) -> [u8; INODE_DISK_SIZE] {
        let mut buf = [0u8; INODE_DISK_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        // fixed-size target, writes cannot fail
        cursor.write_u8(self.kind as u8).unwrap();
        cursor.write_u8(0).unwrap();
        cursor.write_u32::<LittleEndian>(self.size).unwrap();
        cursor.write_u32::<LittleEndian>(self.blocks_used).unwrap();
        for &ptr in &self.direct {
            cursor.write_u32::<LittleEndian>(ptr).unwrap();
        }
        cursor.write_u32::<LittleEndian>(self.indirect).unwrap();
        cursor.write_i64::<LittleEndian>(self.created_time).unwrap();
        cursor.write_i64::<LittleEndian>(self.modified_time).unwrap();
        cursor.write_i64::<LittleEndian>(self.accessed_time).unwrap();
        cursor.write_u16::<LittleEndian>(self.permissions).unwrap();
        cursor.write_u16::<LittleEndian>(self.links_count).unwrap();
        // rest of the record is padding
        buf
    }

    pub(crate) fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < INODE_DISK_SIZE {
            return Err(FsError::Invalid);
        }
        let mut cursor = Cursor::new(buf);
        let read_err = |_| FsError::Invalid;

        let kind = InodeType::try_from(cursor.read_u8().map_err(read_err)?)?;
        cursor.read_u8().map_err(read_err)?; // padding
        let size = cursor.read_u32::<LittleEndian>().map_err(read_err)?;
        let blocks_used = cursor.read_u32::<LittleEndian>().map_err(read_err)?;
        let mut direct = [0u32; DIRECT_POINTERS];
        for ptr in direct.iter_mut() {
            *ptr = cursor.read_u32::<LittleEndian>().map_err(read_err)?;
        }
        let indirect = cursor.read_u32::<LittleEndian>().map_err(read_err)?;
        let created_time = cursor.read_i64::<LittleEndian>().map_err(read_err)?;
        let modified_time = cursor.read_i64::<LittleEndian>().map_err(read_err)?;
        let accessed_time = cursor.read_i64::<LittleEndian>().map_err(read_err)?;
        let permissions = cursor.read_u16::<LittleEndian>().map_err(read_err)?;
        let links_count = cursor.read_u16::<LittleEndian>().map_err(read_err)?;

        Ok(Self {
            kind,
            size,
            blocks_used,
            direct,
            indirect,
            created_time,
            modified_time,
            accessed_time,
            permissions,
            links_count,
        })
    }
}

/// Containing block and byte offset of an inode within the inode table
pub fn position(sb: &Superblock, inode_num: u32) -> (u64, usize) {
    let block = sb.inode_table_start as u64 + (inode_num as usize / INODES_PER_BLOCK) as u64;
    let offset = (inode_num as usize % INODES_PER_BLOCK) * INODE_DISK_SIZE;
    (block, offset)
}

/// Read a single inode from the table
pub async fn read(device: &dyn BlockDevice, sb: &Superblock, inode_num: u32) -> Result<Inode> {
    let (block, offset) = position(sb, inode_num);
    let mut buf = vec![0u8; BLOCK_SIZE];
    device.read_block(block, &mut buf).await?;
    Inode::from_bytes(&buf[offset..offset + INODE_DISK_SIZE])
}

/// Write a single inode, preserving the other inodes sharing its block
pub async fn write(
    device: &dyn BlockDevice,
    sb: &Superblock,
    inode_num: u32,
    inode: &Inode,
) -> Result<()> {
    let (block, offset) = position(sb, inode_num);
    let mut buf = vec![0u8; BLOCK_SIZE];
    device.read_block(block, &mut buf).await?;
    buf[offset..offset + INODE_DISK_SIZE].copy_from_slice(&inode.to_bytes());
    device.write_block(block, &buf).await?;
    Ok(())
}

/// Allocate the first free inode and persist a fresh record into it.
/// Rolls the bitmap bit back if the table write fails.
pub async fn alloc(
    device: &dyn BlockDevice,
    sb: &Superblock,
    inode_bitmap: &mut Bitmap,
    kind: InodeType,
    permissions: u16,
) -> Result<(Inode, u32)> {
    let free_idx = inode_bitmap.find_first_free().ok_or(FsError::NoSpace)?;
    inode_bitmap.set(free_idx)?;

    let inode = Inode::new(kind, permissions);
    if let Err(e) = write(device, sb, free_idx as u32, &inode).await {
        let _ = inode_bitmap.clear(free_idx);
        log::warn!("inode {} allocation rolled back: {}", free_idx, e);
        return Err(e);
    }

    log::debug!("allocated inode {} ({:?})", free_idx, kind);
    Ok((inode, free_idx as u32))
}

/// Release every data block reachable from the inode: all direct pointers,
/// every populated slot of the indirect block, and the indirect block itself.
/// Pointers are zeroed in memory. Returns the number of freed blocks.
pub async fn release_blocks(
    device: &dyn BlockDevice,
    block_bitmap: &mut Bitmap,
    inode: &mut Inode,
) -> Result<u32> {
    let mut freed = 0u32;

    for ptr in inode.direct.iter_mut() {
        if *ptr != 0 {
            block_bitmap.clear(*ptr as usize)?;
            *ptr = 0;
            freed += 1;
        }
    }

    if inode.indirect != 0 {
        let mut buf = vec![0u8; BLOCK_SIZE];
        device.read_block(inode.indirect as u64, &mut buf).await?;

        let mut cursor = Cursor::new(&buf[..]);
        for _ in 0..INDIRECT_POINTERS {
            let ptr = cursor.read_u32::<LittleEndian>().map_err(|_| FsError::Invalid)?;
            if ptr != 0 {
                block_bitmap.clear(ptr as usize)?;
                freed += 1;
            }
        }

        block_bitmap.clear(inode.indirect as usize)?;
        inode.indirect = 0;
        freed += 1;
    }

    inode.blocks_used = 0;
    Ok(freed)
}

/// Free an inode: release its blocks, clear its bitmap bit, and overwrite the
/// table slot with a zeroed record. Returns the number of freed data blocks;
/// the caller adjusts the superblock counters.
pub async fn free(
    device: &dyn BlockDevice,
    sb: &Superblock,
    inode_bitmap: &mut Bitmap,
    block_bitmap: &mut Bitmap,
    inode_num: u32,
) -> Result<u32> {
    let mut inode = read(device, sb, inode_num).await?;
    let freed = release_blocks(device, block_bitmap, &mut inode).await?;

    inode_bitmap.clear(inode_num as usize)?;
    write(device, sb, inode_num, &Inode::zeroed()).await?;

    log::debug!("freed inode {} ({} data blocks)", inode_num, freed);
    Ok(freed)
}
