//! Directory entry storage: fixed-size slots across a directory's data blocks
//!
//! A directory's data blocks form a flat array of 256-byte slots, two per
//! block; a slot with `inode_num == 0` is free. Blocks are never compacted:
//! `remove` leaves holes that a later `add` can refill.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::bitmap::Bitmap;
use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::error::{FsError, Result};
use crate::inode::{self, InodeType, DIRECT_POINTERS, INDIRECT_POINTERS};
use crate::layout::Superblock;
use crate::path;
use crate::unix_now;

/// Serialized dentry size in bytes
pub const DENTRY_DISK_SIZE: usize = 256;

/// Dentries stored in one block
pub const DENTRIES_PER_BLOCK: usize = BLOCK_SIZE / DENTRY_DISK_SIZE;

/// Size of the on-disk filename buffer; names are NUL-terminated within it
pub const NAME_CAPACITY: usize = 250;

const _: () = assert!(DENTRIES_PER_BLOCK == 2);
const _: () = assert!(DENTRY_DISK_SIZE == 4 + 1 + 1 + NAME_CAPACITY);

/// A directory entry mapping a name to an inode number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dentry {
    pub inode_num: u32,
    pub file_type: InodeType,
    name: String,
}

impl Dentry {
    /// Build a validated entry. The name must pass the dentry name rules;
    /// `.` and `..` are rejected here and created only by the filesystem
    /// itself through [`Dentry::special`].
    pub fn new(name: &str, inode_num: u32, file_type: InodeType) -> Result<Self> {
        if !path::filename_is_valid(name) {
            return Err(FsError::Invalid);
        }
        if inode_num == 0 {
            return Err(FsError::Invalid);
        }
        if file_type != InodeType::File && file_type != InodeType::Directory {
            return Err(FsError::Invalid);
        }
        Ok(Self {
            inode_num,
            file_type,
            name: name.to_string(),
        })
    }

    /// Self-maintained `.` / `..` entry, bypassing the name validator
    pub(crate) fn special(name: &str, inode_num: u32) -> Self {
        debug_assert!(name == "." || name == "..");
        Self {
            inode_num,
            file_type: InodeType::Directory,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for the self-maintained `.` and `..` entries
    pub fn is_special(&self) -> bool {
        self.name == "." || self.name == ".."
    }

    fn to_bytes(&self) -> [u8; DENTRY_DISK_SIZE] {
        let mut buf = [0u8; DENTRY_DISK_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        // fixed-size target, writes cannot fail
        cursor.write_u32::<LittleEndian>(self.inode_num).unwrap();
        cursor.write_u8(self.name.len() as u8).unwrap();
        cursor.write_u8(self.file_type as u8).unwrap();
        let name_bytes = self.name.as_bytes();
        buf[6..6 + name_bytes.len()].copy_from_slice(name_bytes);
        buf
    }

    /// Decode one slot; `None` when the slot is free
    fn from_slot(buf: &[u8]) -> Result<Option<Self>> {
        let mut cursor = Cursor::new(buf);
        let read_err = |_| FsError::Invalid;

        let inode_num = cursor.read_u32::<LittleEndian>().map_err(read_err)?;
        if inode_num == 0 {
            return Ok(None);
        }
        let name_len = cursor.read_u8().map_err(read_err)? as usize;
        let file_type = InodeType::try_from(cursor.read_u8().map_err(read_err)?)?;
        if name_len >= NAME_CAPACITY {
            return Err(FsError::Invalid);
        }
        let name = String::from_utf8(buf[6..6 + name_len].to_vec()).map_err(|_| FsError::Invalid)?;

        Ok(Some(Self {
            inode_num,
            file_type,
            name,
        }))
    }
}

/// Pointers stored in an indirect block
async fn read_indirect_pointers(device: &dyn BlockDevice, block_num: u32) -> Result<Vec<u32>> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    device.read_block(block_num as u64, &mut buf).await?;

    let mut cursor = Cursor::new(&buf[..]);
    let mut pointers = Vec::with_capacity(INDIRECT_POINTERS);
    for _ in 0..INDIRECT_POINTERS {
        pointers.push(cursor.read_u32::<LittleEndian>().map_err(|_| FsError::Invalid)?);
    }
    Ok(pointers)
}

/// Data blocks of a directory in traversal order: the direct region up to its
/// first unused pointer, then the indirect chain likewise.
async fn data_blocks(device: &dyn BlockDevice, dir_inode: &inode::Inode) -> Result<Vec<u32>> {
    let mut blocks = Vec::new();

    for &ptr in dir_inode.direct.iter() {
        if ptr == 0 {
            break;
        }
        blocks.push(ptr);
    }

    if dir_inode.indirect != 0 {
        for ptr in read_indirect_pointers(device, dir_inode.indirect).await? {
            if ptr == 0 {
                break;
            }
            blocks.push(ptr);
        }
    }

    Ok(blocks)
}

async fn read_dir_inode(
    device: &dyn BlockDevice,
    sb: &Superblock,
    dir_inode_num: u32,
) -> Result<inode::Inode> {
    let dir_inode = inode::read(device, sb, dir_inode_num).await?;
    if !dir_inode.is_directory() {
        return Err(FsError::Invalid);
    }
    Ok(dir_inode)
}

/// Find an entry by name. Returns the entry and its global slot index.
pub async fn find(
    device: &dyn BlockDevice,
    sb: &Superblock,
    dir_inode_num: u32,
    name: &str,
) -> Result<(Dentry, u32)> {
    let dir_inode = read_dir_inode(device, sb, dir_inode_num).await?;

    let mut slot_index = 0u32;
    let mut buf = vec![0u8; BLOCK_SIZE];
    for block in data_blocks(device, &dir_inode).await? {
        device.read_block(block as u64, &mut buf).await?;
        for j in 0..DENTRIES_PER_BLOCK {
            let slot = &buf[j * DENTRY_DISK_SIZE..(j + 1) * DENTRY_DISK_SIZE];
            if let Some(entry) = Dentry::from_slot(slot)? {
                if entry.name == name {
                    return Ok((entry, slot_index));
                }
            }
            slot_index += 1;
        }
    }

    Err(FsError::NotFound)
}

/// Place an entry in a zeroed block buffer's first slot and write it
async fn write_fresh_block(
    device: &dyn BlockDevice,
    block_num: u32,
    entry: &Dentry,
) -> Result<()> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    buf[..DENTRY_DISK_SIZE].copy_from_slice(&entry.to_bytes());
    device.write_block(block_num as u64, &buf).await?;
    Ok(())
}

/// Try to place an entry in a free slot of an existing block.
/// Returns true when the entry was written.
async fn place_in_block(
    device: &dyn BlockDevice,
    block_num: u32,
    entry: &Dentry,
) -> Result<bool> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    device.read_block(block_num as u64, &mut buf).await?;

    for j in 0..DENTRIES_PER_BLOCK {
        let start = j * DENTRY_DISK_SIZE;
        let free = u32::from_le_bytes(buf[start..start + 4].try_into().unwrap()) == 0;
        if free {
            buf[start..start + DENTRY_DISK_SIZE].copy_from_slice(&entry.to_bytes());
            device.write_block(block_num as u64, &buf).await?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Insert an entry into the first empty slot, scanning direct blocks then the
/// indirect chain. New blocks are allocated zero-initialized as needed; every
/// allocation rolls back its bitmap bit and pointer updates when a later disk
/// write fails. Returns the number of blocks newly allocated (0, 1, or 2).
pub async fn add(
    device: &dyn BlockDevice,
    sb: &Superblock,
    dir_inode_num: u32,
    new_entry: &Dentry,
    block_bitmap: &mut Bitmap,
) -> Result<u32> {
    let mut dir_inode = read_dir_inode(device, sb, dir_inode_num).await?;

    match find(device, sb, dir_inode_num, new_entry.name()).await {
        Ok(_) => return Err(FsError::Exists),
        Err(FsError::NotFound) => {}
        Err(e) => return Err(e),
    }

    // direct region first
    for i in 0..DIRECT_POINTERS {
        if dir_inode.direct[i] == 0 {
            let new_block = block_bitmap.find_first_free().ok_or(FsError::NoSpace)? as u32;
            block_bitmap.set(new_block as usize)?;

            dir_inode.direct[i] = new_block;
            dir_inode.blocks_used += 1;
            dir_inode.modified_time = unix_now();
            if let Err(e) = inode::write(device, sb, dir_inode_num, &dir_inode).await {
                let _ = block_bitmap.clear(new_block as usize);
                return Err(e);
            }

            if let Err(e) = write_fresh_block(device, new_block, new_entry).await {
                dir_inode.direct[i] = 0;
                dir_inode.blocks_used -= 1;
                let _ = inode::write(device, sb, dir_inode_num, &dir_inode).await;
                let _ = block_bitmap.clear(new_block as usize);
                return Err(e);
            }
            return Ok(1);
        }

        if place_in_block(device, dir_inode.direct[i], new_entry).await? {
            dir_inode.modified_time = unix_now();
            inode::write(device, sb, dir_inode_num, &dir_inode).await?;
            return Ok(0);
        }
    }

    // direct region exhausted, move to the indirect chain
    let mut allocated = 0u32;
    if dir_inode.indirect == 0 {
        let indirect_block = block_bitmap.find_first_free().ok_or(FsError::NoSpace)? as u32;
        block_bitmap.set(indirect_block as usize)?;

        dir_inode.indirect = indirect_block;
        dir_inode.blocks_used += 1;
        if let Err(e) = inode::write(device, sb, dir_inode_num, &dir_inode).await {
            let _ = block_bitmap.clear(indirect_block as usize);
            return Err(e);
        }

        let zeros = vec![0u8; BLOCK_SIZE];
        if let Err(e) = device.write_block(indirect_block as u64, &zeros).await {
            dir_inode.indirect = 0;
            dir_inode.blocks_used -= 1;
            let _ = inode::write(device, sb, dir_inode_num, &dir_inode).await;
            let _ = block_bitmap.clear(indirect_block as usize);
            return Err(e.into());
        }
        allocated += 1;
    }

    let mut indirect_buf = vec![0u8; BLOCK_SIZE];
    device
        .read_block(dir_inode.indirect as u64, &mut indirect_buf)
        .await?;

    for i in 0..INDIRECT_POINTERS {
        let start = i * 4;
        let ptr = u32::from_le_bytes(indirect_buf[start..start + 4].try_into().unwrap());

        if ptr == 0 {
            let new_block = block_bitmap.find_first_free().ok_or(FsError::NoSpace)? as u32;
            block_bitmap.set(new_block as usize)?;

            indirect_buf[start..start + 4].copy_from_slice(&new_block.to_le_bytes());
            if let Err(e) = device
                .write_block(dir_inode.indirect as u64, &indirect_buf)
                .await
            {
                let _ = block_bitmap.clear(new_block as usize);
                return Err(e.into());
            }

            dir_inode.blocks_used += 1;
            dir_inode.modified_time = unix_now();
            if let Err(e) = inode::write(device, sb, dir_inode_num, &dir_inode).await {
                indirect_buf[start..start + 4].copy_from_slice(&0u32.to_le_bytes());
                let _ = device
                    .write_block(dir_inode.indirect as u64, &indirect_buf)
                    .await;
                let _ = block_bitmap.clear(new_block as usize);
                return Err(e);
            }

            if let Err(e) = write_fresh_block(device, new_block, new_entry).await {
                indirect_buf[start..start + 4].copy_from_slice(&0u32.to_le_bytes());
                let _ = device
                    .write_block(dir_inode.indirect as u64, &indirect_buf)
                    .await;
                let _ = block_bitmap.clear(new_block as usize);
                return Err(e);
            }
            return Ok(allocated + 1);
        }

        if place_in_block(device, ptr, new_entry).await? {
            dir_inode.modified_time = unix_now();
            inode::write(device, sb, dir_inode_num, &dir_inode).await?;
            return Ok(allocated);
        }
    }

    Err(FsError::NoSpace)
}

/// Remove an entry by zeroing its slot. Emptied blocks stay allocated.
pub async fn remove(
    device: &dyn BlockDevice,
    sb: &Superblock,
    dir_inode_num: u32,
    name: &str,
) -> Result<()> {
    let mut dir_inode = read_dir_inode(device, sb, dir_inode_num).await?;

    let mut buf = vec![0u8; BLOCK_SIZE];
    for block in data_blocks(device, &dir_inode).await? {
        device.read_block(block as u64, &mut buf).await?;
        for j in 0..DENTRIES_PER_BLOCK {
            let start = j * DENTRY_DISK_SIZE;
            let slot = &buf[start..start + DENTRY_DISK_SIZE];
            if let Some(entry) = Dentry::from_slot(slot)? {
                if entry.name == name {
                    buf[start..start + DENTRY_DISK_SIZE].fill(0);
                    device.write_block(block as u64, &buf).await?;

                    dir_inode.modified_time = unix_now();
                    inode::write(device, sb, dir_inode_num, &dir_inode).await?;
                    return Ok(());
                }
            }
        }
    }

    Err(FsError::NotFound)
}

/// List all entries: count the populated slots, then fill an exact-sized
/// vector in the same traversal order.
pub async fn list(
    device: &dyn BlockDevice,
    sb: &Superblock,
    dir_inode_num: u32,
) -> Result<Vec<Dentry>> {
    let dir_inode = read_dir_inode(device, sb, dir_inode_num).await?;
    let blocks = data_blocks(device, &dir_inode).await?;

    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut total = 0usize;
    for &block in &blocks {
        device.read_block(block as u64, &mut buf).await?;
        for j in 0..DENTRIES_PER_BLOCK {
            let start = j * DENTRY_DISK_SIZE;
            if u32::from_le_bytes(buf[start..start + 4].try_into().unwrap()) != 0 {
                total += 1;
            }
        }
    }

    let mut entries = Vec::with_capacity(total);
    for &block in &blocks {
        device.read_block(block as u64, &mut buf).await?;
        for j in 0..DENTRIES_PER_BLOCK {
            let slot = &buf[j * DENTRY_DISK_SIZE..(j + 1) * DENTRY_DISK_SIZE];
            if let Some(entry) = Dentry::from_slot(slot)? {
                entries.push(entry);
            }
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::FileBackedBlockDevice;
    use tempfile::tempdir;

    #[test]
    fn test_codec_round_trip() {
        let entry = Dentry::new("notes.txt", 7, InodeType::File).unwrap();
        let bytes = entry.to_bytes();
        assert_eq!(bytes.len(), DENTRY_DISK_SIZE);

        let decoded = Dentry::from_slot(&bytes).unwrap().unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn test_zeroed_slot_is_free() {
        assert!(Dentry::from_slot(&[0u8; DENTRY_DISK_SIZE])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_name_validation() {
        assert!(Dentry::new("ok", 1, InodeType::File).is_ok());
        assert!(Dentry::new("", 1, InodeType::File).is_err());
        assert!(Dentry::new(".", 1, InodeType::Directory).is_err());
        assert!(Dentry::new("..", 1, InodeType::Directory).is_err());
        assert!(Dentry::new("a/b", 1, InodeType::File).is_err());
        assert!(Dentry::new("x", 0, InodeType::File).is_err());
        assert!(Dentry::new(&"n".repeat(250), 1, InodeType::File).is_err());
        assert!(Dentry::new(&"n".repeat(249), 1, InodeType::File).is_ok());

        // the special constructor is how . and .. come to exist
        let dot = Dentry::special(".", 5);
        assert!(dot.is_special());
        assert_eq!(dot.file_type, InodeType::Directory);
    }

    async fn dir_fixture() -> (
        tempfile::TempDir,
        FileBackedBlockDevice,
        Superblock,
        Bitmap,
        u32,
    ) {
        let temp_dir = tempdir().unwrap();
        let device = FileBackedBlockDevice::create(
            temp_dir.path().join("dir.img"),
            1000 * BLOCK_SIZE as u64,
        )
        .await
        .unwrap();
        let sb = Superblock::init(1000, 128).unwrap();

        let mut block_bitmap = Bitmap::new(1000);
        // reserve the metadata area so allocations land in the data region
        block_bitmap
            .set_range(0, sb.first_data_block as usize)
            .unwrap();

        let mut inode_bitmap = Bitmap::new(128);
        inode_bitmap.set(0).unwrap();
        let (_, dir_num) = inode::alloc(&device, &sb, &mut inode_bitmap, InodeType::Directory, 0o755)
            .await
            .unwrap();

        (temp_dir, device, sb, block_bitmap, dir_num)
    }

    #[tokio::test]
    async fn test_add_find_remove() {
        let (_tmp, device, sb, mut bitmap, dir) = dir_fixture().await;

        let entry = Dentry::new("hello.txt", 9, InodeType::File).unwrap();
        // first add allocates the directory's first data block
        let allocated = add(&device, &sb, dir, &entry, &mut bitmap).await.unwrap();
        assert_eq!(allocated, 1);

        let (found, index) = find(&device, &sb, dir, "hello.txt").await.unwrap();
        assert_eq!(found.inode_num, 9);
        assert_eq!(index, 0);

        // duplicate names are rejected
        let dup = Dentry::new("hello.txt", 10, InodeType::File).unwrap();
        assert!(matches!(
            add(&device, &sb, dir, &dup, &mut bitmap).await,
            Err(FsError::Exists)
        ));

        remove(&device, &sb, dir, "hello.txt").await.unwrap();
        assert!(matches!(
            find(&device, &sb, dir, "hello.txt").await,
            Err(FsError::NotFound)
        ));

        // the hole is refilled by the next add, no new block needed
        let refill = Dentry::new("again.txt", 11, InodeType::File).unwrap();
        let allocated = add(&device, &sb, dir, &refill, &mut bitmap).await.unwrap();
        assert_eq!(allocated, 0);
        let (_, index) = find(&device, &sb, dir, "again.txt").await.unwrap();
        assert_eq!(index, 0);
    }

    #[tokio::test]
    async fn test_list_spans_blocks() {
        let (_tmp, device, sb, mut bitmap, dir) = dir_fixture().await;

        // 5 entries -> 3 blocks at two slots per block
        for i in 0..5 {
            let entry = Dentry::new(&format!("file{}", i), 100 + i, InodeType::File).unwrap();
            add(&device, &sb, dir, &entry, &mut bitmap).await.unwrap();
        }

        let entries = list(&device, &sb, dir).await.unwrap();
        assert_eq!(entries.len(), 5);
        let names: Vec<_> = entries.iter().map(|e| e.name().to_string()).collect();
        for i in 0..5 {
            assert!(names.contains(&format!("file{}", i)));
        }

        let dir_inode = inode::read(&device, &sb, dir).await.unwrap();
        assert_eq!(dir_inode.blocks_used, 3);
    }

    #[tokio::test]
    async fn test_remove_missing_name() {
        let (_tmp, device, sb, mut bitmap, dir) = dir_fixture().await;
        let entry = Dentry::new("present", 3, InodeType::File).unwrap();
        add(&device, &sb, dir, &entry, &mut bitmap).await.unwrap();

        assert!(matches!(
            remove(&device, &sb, dir, "absent").await,
            Err(FsError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_remove_keeps_block_allocated() {
        let (_tmp, device, sb, mut bitmap, dir) = dir_fixture().await;

        let entry = Dentry::new("only", 4, InodeType::File).unwrap();
        add(&device, &sb, dir, &entry, &mut bitmap).await.unwrap();
        let dir_inode = inode::read(&device, &sb, dir).await.unwrap();
        let block = dir_inode.direct[0];
        assert_ne!(block, 0);

        remove(&device, &sb, dir, "only").await.unwrap();

        // the emptied block is intentionally not released
        let dir_inode = inode::read(&device, &sb, dir).await.unwrap();
        assert_eq!(dir_inode.direct[0], block);
        assert!(bitmap.get(block as usize));
        assert_eq!(dir_inode.blocks_used, 1);
    }
}
