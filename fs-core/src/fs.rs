//! Filesystem core: format, mount/unmount, path resolution, and the file and
//! directory operations
//!
//! Every operation that touches several on-disk structures rolls back its own
//! mutations on a mid-operation failure: a dentry that could not be added
//! frees the inode allocated for it, a failed directory initialization
//! removes the parent entry, and so on. Bitmaps and the superblock are
//! flushed once an operation concludes. There is no journal; a crash between
//! the individual block writes of one operation may leave the image
//! inconsistent.

use std::fmt;
use std::sync::Arc;

use crate::bitmap::Bitmap;
use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::dentry::{self, Dentry};
use crate::error::{FsError, Result};
use crate::inode::{self, Inode, InodeType, DIRECT_POINTERS, INDIRECT_POINTERS, ROOT_INODE};
use crate::layout::{Superblock, SUPERBLOCK_BLOCK};
use crate::path;
use crate::unix_now;

/// Open flags, OR-combinable
pub mod flags {
    /// Open for reading
    pub const RDONLY: u32 = 0x01;
    /// Open for writing
    pub const WRONLY: u32 = 0x02;
    /// Open for reading and writing
    pub const RDWR: u32 = 0x03;
    /// Create the file if it does not exist
    pub const CREAT: u32 = 0x08;
    /// Start with the offset at end of file
    pub const APPEND: u32 = 0x10;
    /// Release all data blocks upon opening
    pub const TRUNC: u32 = 0x20;
}

/// An open file: a cursor over an inode snapshot.
///
/// The snapshot is refreshed by reads and writes through this handle only;
/// a write through another handle becomes visible after the other handle
/// persists its inode and this file is reopened.
#[derive(Debug)]
pub struct OpenFile {
    inode_num: u32,
    inode: Inode,
    offset: u32,
    flags: u32,
}

impl OpenFile {
    pub fn inode_num(&self) -> u32 {
        self.inode_num
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn size(&self) -> u32 {
        self.inode.size
    }

    /// Move the cursor, clamped to `[0, size]`
    pub fn seek(&mut self, offset: u32) {
        self.offset = offset.min(self.inode.size);
    }
}

/// Snapshot of the filesystem counters for display
#[derive(Debug, Clone)]
pub struct FsStats {
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub total_inodes: u32,
    pub free_inodes: u32,
    pub block_size: u32,
    pub inode_size: u32,
    pub first_data_block: u32,
    pub created_time: i64,
    pub last_mount_time: i64,
    pub mount_count: u32,
    pub mounted: bool,
    pub current_dir_inode: u32,
}

impl fmt::Display for FsStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Blocks : {} total, {} free", self.total_blocks, self.free_blocks)?;
        writeln!(f, "Inodes : {} total, {} free", self.total_inodes, self.free_inodes)?;
        writeln!(
            f,
            "Layout : {}B blocks, {}B inodes, data starts at block {}",
            self.block_size, self.inode_size, self.first_data_block
        )?;
        writeln!(
            f,
            "Created: {}  Last mount: {}  Mounts: {}",
            self.created_time, self.last_mount_time, self.mount_count
        )?;
        write!(
            f,
            "Mounted: {}  Current dir inode: {}",
            if self.mounted { "yes" } else { "no" },
            self.current_dir_inode
        )
    }
}

/// A mounted filesystem instance
pub struct Filesystem {
    device: Arc<dyn BlockDevice>,
    sb: Superblock,
    block_bitmap: Bitmap,
    inode_bitmap: Bitmap,
    current_dir_inode: u32,
    mounted: bool,
}

/// Read a bitmap region off disk into an in-memory bitmap. Bytes beyond the
/// bitmap's storage in the last block are ignored.
async fn load_bitmap_region(
    device: &dyn BlockDevice,
    start: u32,
    blocks: u32,
    bitmap: &mut Bitmap,
) -> Result<()> {
    let mut bytes = Vec::with_capacity(blocks as usize * BLOCK_SIZE);
    let mut buf = vec![0u8; BLOCK_SIZE];
    for i in 0..blocks {
        device.read_block((start + i) as u64, &mut buf).await?;
        bytes.extend_from_slice(&buf);
    }
    bitmap.copy_from_bytes(&bytes);
    Ok(())
}

/// Write an in-memory bitmap back to its disk region, zero-padding the tail
async fn store_bitmap_region(
    device: &dyn BlockDevice,
    start: u32,
    blocks: u32,
    bitmap: &Bitmap,
) -> Result<()> {
    let data = bitmap.as_bytes();
    for i in 0..blocks {
        let mut buf = vec![0u8; BLOCK_SIZE];
        let offset = i as usize * BLOCK_SIZE;
        if offset < data.len() {
            let n = BLOCK_SIZE.min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
        }
        device.write_block((start + i) as u64, &buf).await?;
    }
    Ok(())
}

impl Filesystem {
    /// Format a device: compute and write the superblock, mark the metadata
    /// regions used, and build the root directory with its `.` and `..`
    /// entries. The root must receive inode number 1.
    pub async fn format(
        device: &dyn BlockDevice,
        total_blocks: u32,
        total_inodes: u32,
    ) -> Result<()> {
        if total_blocks == 0 || total_inodes == 0 {
            return Err(FsError::Invalid);
        }
        if total_blocks as u64 > device.block_count() {
            log::error!(
                "format wants {} blocks but the device has {}",
                total_blocks,
                device.block_count()
            );
            return Err(FsError::NoSpace);
        }

        let mut sb = Superblock::init(total_blocks, total_inodes)?;
        sb.write(device).await?;

        let mut block_bitmap = Bitmap::new(total_blocks as usize);
        let mut inode_bitmap = Bitmap::new(total_inodes as usize);

        block_bitmap.set(SUPERBLOCK_BLOCK as usize)?;
        block_bitmap.set_range(sb.block_bitmap_start as usize, sb.block_bitmap_blocks as usize)?;
        block_bitmap.set_range(sb.inode_bitmap_start as usize, sb.inode_bitmap_blocks as usize)?;
        block_bitmap.set_range(sb.inode_table_start as usize, sb.inode_table_blocks as usize)?;
        inode_bitmap.set(0)?;

        let (_, root_num) =
            inode::alloc(device, &sb, &mut inode_bitmap, InodeType::Directory, 0o755).await?;
        sb.free_inodes -= 1;

        if let Err(e) =
            Self::format_root(device, &mut sb, &mut block_bitmap, &mut inode_bitmap, root_num)
                .await
        {
            log::warn!("format failed, rolling back the root inode: {}", e);
            match inode::free(device, &sb, &mut inode_bitmap, &mut block_bitmap, root_num).await {
                Ok(freed) => sb.free_blocks += freed,
                Err(e) => log::error!("root inode rollback failed: {}", e),
            }
            sb.free_inodes += 1;
            let _ = sb.write(device).await;
            return Err(e);
        }

        log::info!(
            "formatted filesystem: {} blocks, {} inodes, data from block {}",
            total_blocks,
            total_inodes,
            sb.first_data_block
        );
        Ok(())
    }

    async fn format_root(
        device: &dyn BlockDevice,
        sb: &mut Superblock,
        block_bitmap: &mut Bitmap,
        inode_bitmap: &mut Bitmap,
        root_num: u32,
    ) -> Result<()> {
        // inode 0 is pre-reserved, so the first free index must be 1
        if root_num != ROOT_INODE {
            log::error!("root landed on inode {} instead of {}", root_num, ROOT_INODE);
            return Err(FsError::Generic);
        }

        let dot = Dentry::special(".", root_num);
        let allocated = dentry::add(device, sb, root_num, &dot, block_bitmap).await?;
        sb.free_blocks -= allocated;

        let dotdot = Dentry::special("..", root_num);
        let allocated = dentry::add(device, sb, root_num, &dotdot, block_bitmap).await?;
        sb.free_blocks -= allocated;

        // two references: its own "." and its (virtual) name in the tree
        let mut root = inode::read(device, sb, root_num).await?;
        root.links_count = 2;
        inode::write(device, sb, root_num, &root).await?;

        store_bitmap_region(device, sb.block_bitmap_start, sb.block_bitmap_blocks, block_bitmap)
            .await?;
        store_bitmap_region(device, sb.inode_bitmap_start, sb.inode_bitmap_blocks, inode_bitmap)
            .await?;
        sb.write(device).await?;
        Ok(())
    }

    /// Mount a formatted device: validate the superblock, load the bitmaps,
    /// and stamp the mount metadata
    pub async fn mount(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let mut sb = Superblock::read(device.as_ref()).await?;

        let mut block_bitmap = Bitmap::new(sb.total_blocks as usize);
        let mut inode_bitmap = Bitmap::new(sb.total_inodes as usize);
        load_bitmap_region(
            device.as_ref(),
            sb.block_bitmap_start,
            sb.block_bitmap_blocks,
            &mut block_bitmap,
        )
        .await?;
        load_bitmap_region(
            device.as_ref(),
            sb.inode_bitmap_start,
            sb.inode_bitmap_blocks,
            &mut inode_bitmap,
        )
        .await?;

        sb.last_mount_time = unix_now();
        sb.mount_count += 1;
        sb.write(device.as_ref()).await?;

        log::info!("mounted filesystem (mount #{})", sb.mount_count);
        Ok(Self {
            device,
            sb,
            block_bitmap,
            inode_bitmap,
            current_dir_inode: ROOT_INODE,
            mounted: true,
        })
    }

    /// Write the bitmaps and superblock back and mark the handle unmounted
    pub async fn unmount(&mut self) -> Result<()> {
        self.flush_metadata().await?;
        self.mounted = false;
        log::info!("unmounted filesystem");
        Ok(())
    }

    async fn flush_metadata(&mut self) -> Result<()> {
        store_bitmap_region(
            self.device.as_ref(),
            self.sb.block_bitmap_start,
            self.sb.block_bitmap_blocks,
            &self.block_bitmap,
        )
        .await?;
        store_bitmap_region(
            self.device.as_ref(),
            self.sb.inode_bitmap_start,
            self.sb.inode_bitmap_blocks,
            &self.inode_bitmap,
        )
        .await?;
        self.sb.write(self.device.as_ref()).await?;
        Ok(())
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn current_dir(&self) -> u32 {
        self.current_dir_inode
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub fn stats(&self) -> FsStats {
        FsStats {
            total_blocks: self.sb.total_blocks,
            free_blocks: self.sb.free_blocks,
            total_inodes: self.sb.total_inodes,
            free_inodes: self.sb.free_inodes,
            block_size: self.sb.block_size,
            inode_size: self.sb.inode_size,
            first_data_block: self.sb.first_data_block,
            created_time: self.sb.created_time,
            last_mount_time: self.sb.last_mount_time,
            mount_count: self.sb.mount_count,
            mounted: self.mounted,
            current_dir_inode: self.current_dir_inode,
        }
    }

    /// Resolve a path to an inode number. Absolute paths walk from the root,
    /// relative paths from the current directory; `..` follows the literal
    /// dentry, with the root's `..` looping back to the root.
    pub async fn resolve(&self, path_str: &str) -> Result<u32> {
        if !path::is_valid(path_str) {
            return Err(FsError::Invalid);
        }
        let normalized = path::normalize(path_str)?;
        if path::is_root(&normalized) {
            return Ok(ROOT_INODE);
        }

        let pc = path::parse(&normalized)?;
        let mut current = if pc.is_absolute {
            ROOT_INODE
        } else {
            self.current_dir_inode
        };

        for component in &pc.components {
            // "." survives normalize only as a lone relative path; skip anyway
            if component == "." {
                continue;
            }
            if component == ".." {
                match dentry::find(self.device.as_ref(), &self.sb, current, "..").await {
                    Ok((entry, _)) => current = entry.inode_num,
                    Err(FsError::NotFound) if current == ROOT_INODE => {}
                    Err(e) => return Err(e),
                }
                continue;
            }
            let (entry, _) =
                dentry::find(self.device.as_ref(), &self.sb, current, component).await?;
            current = entry.inode_num;
        }

        Ok(current)
    }

    /// Validate a creation path and resolve its parent. Returns the parent
    /// inode number and the new name, after checking the name is absent.
    async fn prepare_create(&self, path_str: &str) -> Result<(u32, String)> {
        if !path::is_valid(path_str) {
            return Err(FsError::Invalid);
        }
        let normalized = path::normalize(path_str)?;
        let (parent_path, name) = path::split(&normalized)?;
        if !path::filename_is_valid(&name) {
            return Err(FsError::Invalid);
        }

        let parent = self.resolve(&parent_path).await?;
        let parent_inode = inode::read(self.device.as_ref(), &self.sb, parent).await?;
        if !parent_inode.is_directory() {
            return Err(FsError::Invalid);
        }

        match dentry::find(self.device.as_ref(), &self.sb, parent, &name).await {
            Ok(_) => Err(FsError::Exists),
            Err(FsError::NotFound) => Ok((parent, name)),
            Err(e) => Err(e),
        }
    }

    /// Free a just-allocated inode and credit whatever blocks it held
    async fn rollback_new_inode(&mut self, inode_num: u32) {
        match inode::free(
            self.device.as_ref(),
            &self.sb,
            &mut self.inode_bitmap,
            &mut self.block_bitmap,
            inode_num,
        )
        .await
        {
            Ok(freed) => self.sb.free_blocks += freed,
            Err(e) => log::error!("rollback of inode {} failed: {}", inode_num, e),
        }
    }

    /// Create an empty file
    pub async fn create(&mut self, path_str: &str, permissions: u16) -> Result<()> {
        let (parent, name) = self.prepare_create(path_str).await?;

        let (mut new_inode, new_num) = inode::alloc(
            self.device.as_ref(),
            &self.sb,
            &mut self.inode_bitmap,
            InodeType::File,
            permissions,
        )
        .await?;

        let entry = match Dentry::new(&name, new_num, InodeType::File) {
            Ok(entry) => entry,
            Err(e) => {
                self.rollback_new_inode(new_num).await;
                return Err(e);
            }
        };

        match dentry::add(
            self.device.as_ref(),
            &self.sb,
            parent,
            &entry,
            &mut self.block_bitmap,
        )
        .await
        {
            Ok(allocated) => self.sb.free_blocks -= allocated,
            Err(e) => {
                self.rollback_new_inode(new_num).await;
                return Err(e);
            }
        }

        new_inode.modified_time = unix_now();
        new_inode.accessed_time = new_inode.modified_time;
        if let Err(e) = inode::write(self.device.as_ref(), &self.sb, new_num, &new_inode).await {
            let _ = dentry::remove(self.device.as_ref(), &self.sb, parent, &name).await;
            self.rollback_new_inode(new_num).await;
            return Err(e);
        }

        self.sb.free_inodes -= 1;
        self.flush_metadata().await?;
        log::debug!("created '{}' as inode {}", path_str, new_num);
        Ok(())
    }

    /// Populate a fresh directory with `.` and `..` and fix both link counts
    async fn init_directory(&mut self, parent: u32, new_num: u32) -> Result<()> {
        let dot = Dentry::special(".", new_num);
        let allocated = dentry::add(
            self.device.as_ref(),
            &self.sb,
            new_num,
            &dot,
            &mut self.block_bitmap,
        )
        .await?;
        self.sb.free_blocks -= allocated;

        let dotdot = Dentry::special("..", parent);
        let allocated = dentry::add(
            self.device.as_ref(),
            &self.sb,
            new_num,
            &dotdot,
            &mut self.block_bitmap,
        )
        .await?;
        self.sb.free_blocks -= allocated;

        // referenced by the parent's entry and its own "."
        let mut dir_inode = inode::read(self.device.as_ref(), &self.sb, new_num).await?;
        dir_inode.links_count = 2;
        dir_inode.modified_time = unix_now();
        inode::write(self.device.as_ref(), &self.sb, new_num, &dir_inode).await?;

        // the child's ".." references the parent
        let mut parent_inode = inode::read(self.device.as_ref(), &self.sb, parent).await?;
        parent_inode.links_count += 1;
        parent_inode.modified_time = unix_now();
        inode::write(self.device.as_ref(), &self.sb, parent, &parent_inode).await?;
        Ok(())
    }

    /// Create a directory
    pub async fn mkdir(&mut self, path_str: &str, permissions: u16) -> Result<()> {
        let (parent, name) = self.prepare_create(path_str).await?;

        let (_, new_num) = inode::alloc(
            self.device.as_ref(),
            &self.sb,
            &mut self.inode_bitmap,
            InodeType::Directory,
            permissions,
        )
        .await?;

        let entry = match Dentry::new(&name, new_num, InodeType::Directory) {
            Ok(entry) => entry,
            Err(e) => {
                self.rollback_new_inode(new_num).await;
                return Err(e);
            }
        };

        match dentry::add(
            self.device.as_ref(),
            &self.sb,
            parent,
            &entry,
            &mut self.block_bitmap,
        )
        .await
        {
            Ok(allocated) => self.sb.free_blocks -= allocated,
            Err(e) => {
                self.rollback_new_inode(new_num).await;
                return Err(e);
            }
        }

        if let Err(e) = self.init_directory(parent, new_num).await {
            let _ = dentry::remove(self.device.as_ref(), &self.sb, parent, &name).await;
            self.rollback_new_inode(new_num).await;
            let _ = self.flush_metadata().await;
            return Err(e);
        }

        self.sb.free_inodes -= 1;
        if let Err(e) = self.flush_metadata().await {
            // deepest rollback layer: revert the parent link first
            self.sb.free_inodes += 1;
            if let Ok(mut parent_inode) =
                inode::read(self.device.as_ref(), &self.sb, parent).await
            {
                parent_inode.links_count -= 1;
                let _ = inode::write(self.device.as_ref(), &self.sb, parent, &parent_inode).await;
            }
            let _ = dentry::remove(self.device.as_ref(), &self.sb, parent, &name).await;
            self.rollback_new_inode(new_num).await;
            return Err(e);
        }

        log::debug!("created directory '{}' as inode {}", path_str, new_num);
        Ok(())
    }

    /// Remove a name. The inode and its data blocks are freed only when the
    /// last link disappears.
    pub async fn unlink(&mut self, path_str: &str) -> Result<()> {
        if !path::is_valid(path_str) {
            return Err(FsError::Invalid);
        }
        let inode_num = self.resolve(path_str).await?;
        let mut target = inode::read(self.device.as_ref(), &self.sb, inode_num).await?;
        if target.is_directory() {
            return Err(FsError::Invalid);
        }

        target.links_count -= 1;
        if target.links_count == 0 {
            let freed = inode::free(
                self.device.as_ref(),
                &self.sb,
                &mut self.inode_bitmap,
                &mut self.block_bitmap,
                inode_num,
            )
            .await?;
            self.sb.free_inodes += 1;
            self.sb.free_blocks += freed;
        } else {
            inode::write(self.device.as_ref(), &self.sb, inode_num, &target).await?;
        }

        let normalized = path::normalize(path_str)?;
        let (parent_path, name) = path::split(&normalized)?;
        let parent = self.resolve(&parent_path).await?;
        dentry::remove(self.device.as_ref(), &self.sb, parent, &name).await?;

        self.flush_metadata().await?;
        log::debug!("unlinked '{}'", path_str);
        Ok(())
    }

    /// Remove an empty directory
    pub async fn rmdir(&mut self, path_str: &str) -> Result<()> {
        if !path::is_valid(path_str) {
            return Err(FsError::Invalid);
        }
        if path::is_root(path_str) {
            return Err(FsError::Invalid);
        }

        let target_num = self.resolve(path_str).await?;
        if target_num == ROOT_INODE {
            return Err(FsError::Invalid);
        }
        let target = inode::read(self.device.as_ref(), &self.sb, target_num).await?;
        if !target.is_directory() {
            return Err(FsError::Invalid);
        }

        let entries = dentry::list(self.device.as_ref(), &self.sb, target_num).await?;
        if entries.iter().any(|e| !e.is_special()) {
            log::debug!("rmdir '{}': directory not empty", path_str);
            return Err(FsError::Generic);
        }

        let normalized = path::normalize(path_str)?;
        let (parent_path, name) = path::split(&normalized)?;
        let parent = self.resolve(&parent_path).await?;

        let freed = inode::free(
            self.device.as_ref(),
            &self.sb,
            &mut self.inode_bitmap,
            &mut self.block_bitmap,
            target_num,
        )
        .await?;
        self.sb.free_inodes += 1;
        self.sb.free_blocks += freed;

        dentry::remove(self.device.as_ref(), &self.sb, parent, &name).await?;

        // the removed child's ".." no longer references the parent
        let mut parent_inode = inode::read(self.device.as_ref(), &self.sb, parent).await?;
        parent_inode.links_count -= 1;
        parent_inode.modified_time = unix_now();
        inode::write(self.device.as_ref(), &self.sb, parent, &parent_inode).await?;

        self.flush_metadata().await?;
        log::debug!("removed directory '{}'", path_str);
        Ok(())
    }

    /// Create a hard link: a second name for an existing file inode
    pub async fn link(&mut self, existing_path: &str, new_path: &str) -> Result<()> {
        if !path::is_valid(existing_path) || !path::is_valid(new_path) {
            return Err(FsError::Invalid);
        }

        let existing_num = self.resolve(existing_path).await?;
        let mut target = inode::read(self.device.as_ref(), &self.sb, existing_num).await?;
        if target.is_directory() {
            return Err(FsError::Invalid);
        }

        let normalized = path::normalize(new_path)?;
        let (parent_path, name) = path::split(&normalized)?;
        if !path::filename_is_valid(&name) {
            return Err(FsError::Invalid);
        }

        let parent = self.resolve(&parent_path).await?;
        let parent_inode = inode::read(self.device.as_ref(), &self.sb, parent).await?;
        if !parent_inode.is_directory() {
            return Err(FsError::Invalid);
        }
        if dentry::find(self.device.as_ref(), &self.sb, parent, &name)
            .await
            .is_ok()
        {
            return Err(FsError::Exists);
        }

        let entry = Dentry::new(&name, existing_num, InodeType::File)?;
        let allocated = dentry::add(
            self.device.as_ref(),
            &self.sb,
            parent,
            &entry,
            &mut self.block_bitmap,
        )
        .await?;
        self.sb.free_blocks -= allocated;

        target.links_count += 1;
        target.modified_time = unix_now();
        inode::write(self.device.as_ref(), &self.sb, existing_num, &target).await?;

        self.flush_metadata().await?;
        log::debug!("linked '{}' -> '{}'", new_path, existing_path);
        Ok(())
    }

    /// Open a file, creating it when `CREAT` is set and truncating its data
    /// when `TRUNC` is set. `APPEND` starts the cursor at end of file.
    pub async fn open(&mut self, path_str: &str, open_flags: u32) -> Result<OpenFile> {
        if !path::is_valid(path_str) {
            return Err(FsError::Invalid);
        }

        let inode_num = match self.resolve(path_str).await {
            Err(FsError::NotFound) if open_flags & flags::CREAT != 0 => {
                self.create(path_str, 0o644).await?;
                self.resolve(path_str).await?
            }
            other => other?,
        };

        let mut file_inode = inode::read(self.device.as_ref(), &self.sb, inode_num).await?;
        if !file_inode.is_file() {
            return Err(FsError::Invalid);
        }

        if open_flags & flags::TRUNC != 0 {
            let freed = inode::release_blocks(
                self.device.as_ref(),
                &mut self.block_bitmap,
                &mut file_inode,
            )
            .await?;
            self.sb.free_blocks += freed;
            file_inode.size = 0;
            file_inode.modified_time = unix_now();
            inode::write(self.device.as_ref(), &self.sb, inode_num, &file_inode).await?;
            self.flush_metadata().await?;
        }

        let offset = if open_flags & flags::APPEND != 0 {
            file_inode.size
        } else {
            0
        };

        Ok(OpenFile {
            inode_num,
            inode: file_inode,
            offset,
            flags: open_flags,
        })
    }

    /// Read from the file cursor. Returns the number of bytes read, clipped
    /// at end of file.
    pub async fn read(&mut self, file: &mut OpenFile, buf: &mut [u8]) -> Result<usize> {
        if file.flags & flags::RDONLY == 0 {
            return Err(FsError::Permission);
        }

        let n = self.read_inode_data(&file.inode, file.offset, buf).await?;
        file.offset += n as u32;

        file.inode.accessed_time = unix_now();
        inode::write(self.device.as_ref(), &self.sb, file.inode_num, &file.inode).await?;
        Ok(n)
    }

    /// Write at the file cursor, allocating and extending as needed.
    /// Returns the number of bytes written.
    pub async fn write(&mut self, file: &mut OpenFile, data: &[u8]) -> Result<usize> {
        if file.flags & flags::WRONLY == 0 {
            return Err(FsError::Permission);
        }

        let n = self
            .write_inode_data(&mut file.inode, file.inode_num, file.offset, data)
            .await?;
        file.offset += n as u32;

        self.flush_metadata().await?;
        Ok(n)
    }

    /// List a directory, `.` and `..` included
    pub async fn list(&self, path_str: &str) -> Result<Vec<Dentry>> {
        if !path::is_valid(path_str) {
            return Err(FsError::Invalid);
        }
        let inode_num = self.resolve(path_str).await?;
        let dir_inode = inode::read(self.device.as_ref(), &self.sb, inode_num).await?;
        if !dir_inode.is_directory() {
            return Err(FsError::Invalid);
        }
        dentry::list(self.device.as_ref(), &self.sb, inode_num).await
    }

    /// Inode number and inode contents for a path
    pub async fn stat(&self, path_str: &str) -> Result<(u32, Inode)> {
        if !path::is_valid(path_str) {
            return Err(FsError::Invalid);
        }
        let inode_num = self.resolve(path_str).await?;
        let target = inode::read(self.device.as_ref(), &self.sb, inode_num).await?;
        Ok((inode_num, target))
    }

    /// Change the current directory
    pub async fn cd(&mut self, path_str: &str) -> Result<()> {
        let inode_num = self.resolve(path_str).await?;
        let target = inode::read(self.device.as_ref(), &self.sb, inode_num).await?;
        if !target.is_directory() {
            return Err(FsError::Invalid);
        }
        self.current_dir_inode = inode_num;
        Ok(())
    }

    /// Absolute path of a directory inode, reconstructed by walking `..`
    /// upward and matching the child in each parent's entries
    pub async fn inode_to_path(&self, inode_num: u32) -> Result<String> {
        const MAX_DEPTH: usize = 64;

        if inode_num == ROOT_INODE {
            return Ok("/".to_string());
        }

        let mut components: Vec<String> = Vec::new();
        let mut current = inode_num;

        while current != ROOT_INODE {
            if components.len() >= MAX_DEPTH {
                return Err(FsError::NoSpace);
            }

            let (parent_entry, _) =
                dentry::find(self.device.as_ref(), &self.sb, current, "..").await?;
            let parent_num = parent_entry.inode_num;

            let entries = dentry::list(self.device.as_ref(), &self.sb, parent_num).await?;
            let name = entries
                .iter()
                .find(|e| !e.is_special() && e.inode_num == current)
                .map(|e| e.name().to_string())
                .ok_or(FsError::NotFound)?;

            components.push(name);
            current = parent_num;
        }

        components.reverse();
        Ok(format!("/{}", components.join("/")))
    }

    /// Pick the target block for a block index within a file
    async fn locate_block(&self, file_inode: &Inode, block_idx: usize) -> Result<u32> {
        if block_idx < DIRECT_POINTERS {
            return Ok(file_inode.direct[block_idx]);
        }
        let indirect_idx = block_idx - DIRECT_POINTERS;
        if indirect_idx >= INDIRECT_POINTERS {
            return Err(FsError::Invalid);
        }
        if file_inode.indirect == 0 {
            return Err(FsError::Invalid);
        }

        let mut buf = vec![0u8; BLOCK_SIZE];
        self.device
            .read_block(file_inode.indirect as u64, &mut buf)
            .await?;
        let start = indirect_idx * 4;
        Ok(u32::from_le_bytes(buf[start..start + 4].try_into().unwrap()))
    }

    /// Block-offset read: clip to the inode size, then copy block by block.
    /// A zero pointer is a hole and reads as zeros.
    async fn read_inode_data(
        &self,
        file_inode: &Inode,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        let available = file_inode.size.saturating_sub(offset);
        let to_read = (buf.len() as u32).min(available) as usize;
        if to_read == 0 {
            return Ok(0);
        }

        let mut block_idx = offset as usize / BLOCK_SIZE;
        let mut intra = offset as usize % BLOCK_SIZE;
        let mut copied = 0usize;
        let mut block_buf = vec![0u8; BLOCK_SIZE];

        while copied < to_read {
            let chunk = (to_read - copied).min(BLOCK_SIZE - intra);
            let block_num = self.locate_block(file_inode, block_idx).await?;

            if block_num == 0 {
                buf[copied..copied + chunk].fill(0);
            } else {
                self.device.read_block(block_num as u64, &mut block_buf).await?;
                buf[copied..copied + chunk].copy_from_slice(&block_buf[intra..intra + chunk]);
            }

            copied += chunk;
            block_idx += 1;
            intra = 0;
        }

        Ok(to_read)
    }

    fn alloc_data_block(&mut self, allocated: &mut Vec<u32>) -> Result<u32> {
        let block = self.block_bitmap.find_first_free().ok_or(FsError::NoSpace)? as u32;
        self.block_bitmap.set(block as usize)?;
        allocated.push(block);
        Ok(block)
    }

    /// Block-offset write. On failure every bitmap bit set by this call is
    /// cleared again and the in-memory inode is restored, so a fresh indirect
    /// pointer also reverts to zero.
    async fn write_inode_data(
        &mut self,
        file_inode: &mut Inode,
        inode_num: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<usize> {
        let saved = file_inode.clone();
        let mut allocated: Vec<u32> = Vec::new();

        match self
            .write_inode_data_inner(file_inode, inode_num, offset, data, &mut allocated)
            .await
        {
            Ok(n) => {
                self.sb.free_blocks -= allocated.len() as u32;
                Ok(n)
            }
            Err(e) => {
                for block in allocated {
                    let _ = self.block_bitmap.clear(block as usize);
                }
                *file_inode = saved;
                Err(e)
            }
        }
    }

    async fn write_inode_data_inner(
        &mut self,
        file_inode: &mut Inode,
        inode_num: u32,
        offset: u32,
        data: &[u8],
        allocated: &mut Vec<u32>,
    ) -> Result<usize> {
        let mut block_idx = offset as usize / BLOCK_SIZE;
        let mut intra = offset as usize % BLOCK_SIZE;
        let mut written = 0usize;
        let mut block_buf = vec![0u8; BLOCK_SIZE];

        while written < data.len() {
            let mut fresh = false;
            let block_num: u32;

            if block_idx < DIRECT_POINTERS {
                if file_inode.direct[block_idx] == 0 {
                    let block = self.alloc_data_block(allocated)?;
                    file_inode.direct[block_idx] = block;
                    file_inode.blocks_used += 1;
                    fresh = true;
                    block_num = block;
                } else {
                    block_num = file_inode.direct[block_idx];
                }
            } else {
                let indirect_idx = block_idx - DIRECT_POINTERS;
                if indirect_idx >= INDIRECT_POINTERS {
                    return Err(FsError::NoSpace);
                }

                if file_inode.indirect == 0 {
                    let block = self.alloc_data_block(allocated)?;
                    let zeros = vec![0u8; BLOCK_SIZE];
                    self.device.write_block(block as u64, &zeros).await?;
                    file_inode.indirect = block;
                    file_inode.blocks_used += 1;
                }

                let mut indirect_buf = vec![0u8; BLOCK_SIZE];
                self.device
                    .read_block(file_inode.indirect as u64, &mut indirect_buf)
                    .await?;
                let start = indirect_idx * 4;
                let ptr = u32::from_le_bytes(indirect_buf[start..start + 4].try_into().unwrap());

                if ptr == 0 {
                    let block = self.alloc_data_block(allocated)?;
                    indirect_buf[start..start + 4].copy_from_slice(&block.to_le_bytes());
                    self.device
                        .write_block(file_inode.indirect as u64, &indirect_buf)
                        .await?;
                    file_inode.blocks_used += 1;
                    fresh = true;
                    block_num = block;
                } else {
                    block_num = ptr;
                }
            }

            let chunk = (data.len() - written).min(BLOCK_SIZE - intra);
            if fresh {
                // freshly allocated blocks start out zeroed
                block_buf.fill(0);
            } else if intra != 0 || chunk < BLOCK_SIZE {
                // partial write preserves the untouched bytes
                self.device.read_block(block_num as u64, &mut block_buf).await?;
            }
            block_buf[intra..intra + chunk].copy_from_slice(&data[written..written + chunk]);
            self.device.write_block(block_num as u64, &block_buf).await?;

            written += chunk;
            block_idx += 1;
            intra = 0;
        }

        let end = offset as u64 + data.len() as u64;
        if end > file_inode.size as u64 {
            file_inode.size = end as u32;
        }
        file_inode.modified_time = unix_now();
        inode::write(self.device.as_ref(), &self.sb, inode_num, file_inode).await?;

        Ok(data.len())
    }
}
