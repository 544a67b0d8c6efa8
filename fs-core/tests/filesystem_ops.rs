//! End-to-end scenarios driving the public filesystem API

use std::sync::Arc;

use tempfile::TempDir;

use ferrofs::prelude::*;
use ferrofs::ROOT_INODE;

const TOTAL_BLOCKS: u32 = 1000;
const TOTAL_INODES: u32 = 128;

async fn fresh_fs() -> (TempDir, Filesystem) {
    env_logger::builder().is_test(true).try_init().ok();

    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let image_path = temp_dir.path().join("test.img");

    let device = Arc::new(
        FileBackedBlockDevice::create(&image_path, TOTAL_BLOCKS as u64 * BLOCK_SIZE as u64)
            .await
            .expect("Failed to create device"),
    );

    Filesystem::format(device.as_ref(), TOTAL_BLOCKS, TOTAL_INODES)
        .await
        .expect("Failed to format");
    let fs = Filesystem::mount(device).await.expect("Failed to mount");

    (temp_dir, fs)
}

#[tokio::test]
async fn test_format_and_mount() {
    let (_tmp, fs) = fresh_fs().await;

    assert!(fs.is_mounted());
    assert_eq!(fs.current_dir(), ROOT_INODE);

    let sb = fs.superblock();
    assert_eq!(sb.magic, 0x12345678);
    assert_eq!(sb.total_blocks, TOTAL_BLOCKS);
    assert_eq!(sb.total_inodes, TOTAL_INODES);
    // 128 inodes minus the reserved inode 0 and the root directory
    assert_eq!(sb.free_inodes, 126);
    assert_eq!(sb.mount_count, 1);

    // the root directory holds exactly . and ..
    let entries = fs.list("/").await.unwrap();
    let mut names: Vec<_> = entries.iter().map(|e| e.name()).collect();
    names.sort();
    assert_eq!(names, vec![".", ".."]);

    let (num, root) = fs.stat("/").await.unwrap();
    assert_eq!(num, ROOT_INODE);
    assert_eq!(root.kind, InodeType::Directory);
    assert_eq!(root.links_count, 2);
}

#[tokio::test]
async fn test_mkdir() {
    let (_tmp, mut fs) = fresh_fs().await;

    fs.mkdir("/dir1", 0o755).await.unwrap();

    let (_, dir) = fs.stat("/dir1").await.unwrap();
    assert_eq!(dir.kind, InodeType::Directory);
    assert_eq!(dir.links_count, 2);
    assert_eq!(dir.permissions, 0o755);

    let names: Vec<_> = fs
        .list("/")
        .await
        .unwrap()
        .iter()
        .map(|e| e.name().to_string())
        .collect();
    assert!(names.contains(&"dir1".to_string()));
    assert!(names.contains(&".".to_string()));
    assert!(names.contains(&"..".to_string()));

    // the child's ".." adds a link to the parent
    let (_, root) = fs.stat("/").await.unwrap();
    assert_eq!(root.links_count, 3);

    assert!(matches!(
        fs.mkdir("/dir1", 0o755).await,
        Err(FsError::Exists)
    ));
}

#[tokio::test]
async fn test_write_then_read() {
    let (_tmp, mut fs) = fresh_fs().await;

    fs.create("/data.bin", 0o644).await.unwrap();
    let mut file = fs.open("/data.bin", flags::RDWR).await.unwrap();

    let payload = b"Hello filesystem!";
    let written = fs.write(&mut file, payload).await.unwrap();
    assert_eq!(written, 17);

    file.seek(0);
    let mut buf = [0u8; 64];
    let read = fs.read(&mut file, &mut buf).await.unwrap();
    assert_eq!(read, 17);
    assert_eq!(&buf[..17], payload);

    let (_, ino) = fs.stat("/data.bin").await.unwrap();
    assert_eq!(ino.size, 17);
    assert_eq!(ino.blocks_used, 1);
}

#[tokio::test]
async fn test_hard_link() {
    let (_tmp, mut fs) = fresh_fs().await;

    fs.create("/orig.txt", 0o644).await.unwrap();
    let mut file = fs.open("/orig.txt", flags::RDWR).await.unwrap();
    let payload = b"hello through links";
    fs.write(&mut file, payload).await.unwrap();
    drop(file);

    fs.link("/orig.txt", "/alias.txt").await.unwrap();

    let (orig_num, orig) = fs.stat("/orig.txt").await.unwrap();
    let (alias_num, alias) = fs.stat("/alias.txt").await.unwrap();
    assert_eq!(orig_num, alias_num);
    assert_eq!(orig.links_count, 2);
    assert_eq!(alias.links_count, 2);

    let mut file = fs.open("/alias.txt", flags::RDONLY).await.unwrap();
    let mut buf = [0u8; 32];
    let read = fs.read(&mut file, &mut buf).await.unwrap();
    assert_eq!(read, payload.len());
    assert_eq!(&buf[..read], payload);

    // a write through one name is readable through the other
    let mut file = fs.open("/alias.txt", flags::WRONLY).await.unwrap();
    fs.write(&mut file, b"HELLO").await.unwrap();
    drop(file);

    let mut file = fs.open("/orig.txt", flags::RDONLY).await.unwrap();
    let read = fs.read(&mut file, &mut buf).await.unwrap();
    assert_eq!(&buf[..read], b"HELLO through links");

    // unlinking one name keeps the data alive through the other
    fs.unlink("/orig.txt").await.unwrap();
    let (_, alias) = fs.stat("/alias.txt").await.unwrap();
    assert_eq!(alias.links_count, 1);
    assert!(matches!(fs.stat("/orig.txt").await, Err(FsError::NotFound)));

    assert!(matches!(
        fs.link("/nope", "/x").await,
        Err(FsError::NotFound)
    ));
}

#[tokio::test]
async fn test_cd_traversal() {
    let (_tmp, mut fs) = fresh_fs().await;

    fs.mkdir("/a", 0o755).await.unwrap();
    fs.mkdir("/a/b", 0o755).await.unwrap();

    fs.cd("/a/b").await.unwrap();
    let (b_num, _) = fs.stat("/a/b").await.unwrap();
    assert_eq!(fs.current_dir(), b_num);
    assert_eq!(fs.inode_to_path(fs.current_dir()).await.unwrap(), "/a/b");

    fs.cd("..").await.unwrap();
    let (a_num, _) = fs.stat("/a").await.unwrap();
    assert_eq!(fs.current_dir(), a_num);

    fs.cd("..").await.unwrap();
    assert_eq!(fs.current_dir(), ROOT_INODE);

    // .. at the root stays at the root
    fs.cd("..").await.unwrap();
    assert_eq!(fs.current_dir(), ROOT_INODE);

    assert!(matches!(fs.cd("/no").await, Err(FsError::NotFound)));

    fs.cd("/a/b/../..").await.unwrap();
    assert_eq!(fs.current_dir(), ROOT_INODE);

    // relative resolution from the current directory
    fs.cd("a").await.unwrap();
    assert_eq!(fs.current_dir(), a_num);
}

#[tokio::test]
async fn test_rmdir_requires_empty() {
    let (_tmp, mut fs) = fresh_fs().await;

    fs.mkdir("/d", 0o755).await.unwrap();
    fs.create("/d/f", 0o644).await.unwrap();

    assert!(matches!(fs.rmdir("/d").await, Err(FsError::Generic)));

    fs.unlink("/d/f").await.unwrap();
    fs.rmdir("/d").await.unwrap();
    assert!(matches!(fs.stat("/d").await, Err(FsError::NotFound)));

    // the parent's link count dropped back
    let (_, root) = fs.stat("/").await.unwrap();
    assert_eq!(root.links_count, 2);
}

#[tokio::test]
async fn test_root_is_immovable() {
    let (_tmp, mut fs) = fresh_fs().await;

    assert!(matches!(fs.rmdir("/").await, Err(FsError::Invalid)));
    assert!(matches!(fs.rmdir("///").await, Err(FsError::Invalid)));
    fs.cd("/").await.unwrap();
    assert_eq!(fs.current_dir(), ROOT_INODE);
}

#[tokio::test]
async fn test_truncate_zeroes_file() {
    let (_tmp, mut fs) = fresh_fs().await;

    fs.create("/t.bin", 0o644).await.unwrap();
    // baseline after create: the parent may have grown a dentry block,
    // which removal intentionally never reclaims
    let free_before = fs.superblock().free_blocks;
    let mut file = fs.open("/t.bin", flags::WRONLY).await.unwrap();
    fs.write(&mut file, &[7u8; 3000]).await.unwrap();
    drop(file);

    let (_, ino) = fs.stat("/t.bin").await.unwrap();
    assert_eq!(ino.size, 3000);
    assert_eq!(ino.blocks_used, 6);

    let file = fs.open("/t.bin", flags::WRONLY | flags::TRUNC).await.unwrap();
    assert_eq!(file.size(), 0);
    drop(file);

    let (_, ino) = fs.stat("/t.bin").await.unwrap();
    assert_eq!(ino.size, 0);
    assert_eq!(ino.blocks_used, 0);
    assert_eq!(fs.superblock().free_blocks, free_before);
}

#[tokio::test]
async fn test_create_unlink_accounting() {
    let (_tmp, mut fs) = fresh_fs().await;

    let free_inodes = fs.superblock().free_inodes;

    fs.create("/tmp.txt", 0o644).await.unwrap();
    let free_blocks = fs.superblock().free_blocks;
    let mut file = fs.open("/tmp.txt", flags::WRONLY).await.unwrap();
    fs.write(&mut file, &[1u8; 2048]).await.unwrap();
    drop(file);
    assert_eq!(fs.superblock().free_inodes, free_inodes - 1);
    assert_eq!(fs.superblock().free_blocks, free_blocks - 4);

    fs.unlink("/tmp.txt").await.unwrap();
    assert_eq!(fs.superblock().free_inodes, free_inodes);
    assert_eq!(fs.superblock().free_blocks, free_blocks);
    assert!(matches!(fs.stat("/tmp.txt").await, Err(FsError::NotFound)));
}

#[tokio::test]
async fn test_file_spanning_indirect_blocks() {
    let (_tmp, mut fs) = fresh_fs().await;

    // 40 data blocks, well past the 12 direct pointers
    let payload: Vec<u8> = (0..20480u32).map(|i| (i % 251) as u8).collect();

    fs.create("/big.bin", 0o644).await.unwrap();
    let mut file = fs.open("/big.bin", flags::RDWR).await.unwrap();
    let written = fs.write(&mut file, &payload).await.unwrap();
    assert_eq!(written, payload.len());

    let (_, ino) = fs.stat("/big.bin").await.unwrap();
    assert_eq!(ino.size, 20480);
    // 40 data blocks plus the indirect block itself
    assert_eq!(ino.blocks_used, 41);
    assert_ne!(ino.indirect, 0);

    file.seek(0);
    let mut buf = vec![0u8; payload.len()];
    let read = fs.read(&mut file, &mut buf).await.unwrap();
    assert_eq!(read, payload.len());
    assert_eq!(buf, payload);

    // read across the direct/indirect boundary
    file.seek(11 * 512);
    let mut buf = vec![0u8; 1024];
    let read = fs.read(&mut file, &mut buf).await.unwrap();
    assert_eq!(read, 1024);
    assert_eq!(buf, payload[11 * 512..13 * 512]);

    // unlinking returns every block
    let free_before = fs.superblock().free_blocks;
    fs.unlink("/big.bin").await.unwrap();
    assert_eq!(fs.superblock().free_blocks, free_before + 41);
}

#[tokio::test]
async fn test_partial_overwrite() {
    let (_tmp, mut fs) = fresh_fs().await;

    fs.create("/o.txt", 0o644).await.unwrap();
    let mut file = fs.open("/o.txt", flags::RDWR).await.unwrap();
    fs.write(&mut file, b"aaaaaaaaaa").await.unwrap();

    file.seek(3);
    fs.write(&mut file, b"XYZ").await.unwrap();

    file.seek(0);
    let mut buf = [0u8; 16];
    let read = fs.read(&mut file, &mut buf).await.unwrap();
    assert_eq!(&buf[..read], b"aaaXYZaaaa");

    // overwriting inside the file does not grow it
    let (_, ino) = fs.stat("/o.txt").await.unwrap();
    assert_eq!(ino.size, 10);
}

#[tokio::test]
async fn test_append_flag() {
    let (_tmp, mut fs) = fresh_fs().await;

    fs.create("/log.txt", 0o644).await.unwrap();
    let mut file = fs.open("/log.txt", flags::WRONLY).await.unwrap();
    fs.write(&mut file, b"first").await.unwrap();
    drop(file);

    let mut file = fs
        .open("/log.txt", flags::WRONLY | flags::APPEND)
        .await
        .unwrap();
    assert_eq!(file.offset(), 5);
    fs.write(&mut file, b" second").await.unwrap();
    drop(file);

    let mut file = fs.open("/log.txt", flags::RDONLY).await.unwrap();
    let mut buf = [0u8; 32];
    let read = fs.read(&mut file, &mut buf).await.unwrap();
    assert_eq!(&buf[..read], b"first second");
}

#[tokio::test]
async fn test_open_creat_flag() {
    let (_tmp, mut fs) = fresh_fs().await;

    assert!(matches!(
        fs.open("/new.txt", flags::RDWR).await,
        Err(FsError::NotFound)
    ));

    let file = fs
        .open("/new.txt", flags::RDWR | flags::CREAT)
        .await
        .unwrap();
    assert_eq!(file.size(), 0);
    drop(file);

    let (_, ino) = fs.stat("/new.txt").await.unwrap();
    assert_eq!(ino.kind, InodeType::File);
    assert_eq!(ino.permissions, 0o644);
}

#[tokio::test]
async fn test_open_flag_mismatches() {
    let (_tmp, mut fs) = fresh_fs().await;

    fs.create("/p.txt", 0o644).await.unwrap();

    let mut file = fs.open("/p.txt", flags::RDONLY).await.unwrap();
    assert!(matches!(
        fs.write(&mut file, b"x").await,
        Err(FsError::Permission)
    ));

    let mut file = fs.open("/p.txt", flags::WRONLY).await.unwrap();
    let mut buf = [0u8; 8];
    assert!(matches!(
        fs.read(&mut file, &mut buf).await,
        Err(FsError::Permission)
    ));
}

#[tokio::test]
async fn test_type_mismatches() {
    let (_tmp, mut fs) = fresh_fs().await;

    fs.mkdir("/d", 0o755).await.unwrap();
    fs.create("/f", 0o644).await.unwrap();

    assert!(matches!(
        fs.open("/d", flags::RDONLY).await,
        Err(FsError::Invalid)
    ));
    assert!(matches!(fs.unlink("/d").await, Err(FsError::Invalid)));
    assert!(matches!(fs.cd("/f").await, Err(FsError::Invalid)));
    assert!(matches!(fs.rmdir("/f").await, Err(FsError::Invalid)));
    assert!(matches!(fs.list("/f").await, Err(FsError::Invalid)));
    assert!(matches!(
        fs.link("/d", "/d2").await,
        Err(FsError::Invalid)
    ));
}

#[tokio::test]
async fn test_seek_clamps_to_size() {
    let (_tmp, mut fs) = fresh_fs().await;

    fs.create("/s.txt", 0o644).await.unwrap();
    let mut file = fs.open("/s.txt", flags::RDWR).await.unwrap();
    fs.write(&mut file, b"0123456789").await.unwrap();

    file.seek(10_000);
    assert_eq!(file.offset(), 10);

    let mut buf = [0u8; 8];
    assert_eq!(fs.read(&mut file, &mut buf).await.unwrap(), 0);

    file.seek(4);
    let read = fs.read(&mut file, &mut buf).await.unwrap();
    assert_eq!(&buf[..read], b"456789");
}

#[tokio::test]
async fn test_multi_block_directory() {
    let (_tmp, mut fs) = fresh_fs().await;

    // 30 entries: with two slots per block this spans many blocks
    for i in 0..30 {
        fs.create(&format!("/file{:02}", i), 0o644).await.unwrap();
    }

    let entries = fs.list("/").await.unwrap();
    assert_eq!(entries.len(), 32); // 30 files plus . and ..

    for i in 0..30 {
        let (_, ino) = fs.stat(&format!("/file{:02}", i)).await.unwrap();
        assert_eq!(ino.kind, InodeType::File);
    }

    // holes left by removals are refilled
    fs.unlink("/file07").await.unwrap();
    fs.create("/replacement", 0o644).await.unwrap();
    let entries = fs.list("/").await.unwrap();
    assert_eq!(entries.len(), 32);
}

#[tokio::test]
async fn test_nested_paths_and_inode_to_path() {
    let (_tmp, mut fs) = fresh_fs().await;

    fs.mkdir("/a", 0o755).await.unwrap();
    fs.mkdir("/a/b", 0o755).await.unwrap();
    fs.mkdir("/a/b/c", 0o755).await.unwrap();
    fs.create("/a/b/c/leaf.txt", 0o644).await.unwrap();

    let (c_num, _) = fs.stat("/a/b/c").await.unwrap();
    assert_eq!(fs.inode_to_path(c_num).await.unwrap(), "/a/b/c");
    assert_eq!(fs.inode_to_path(ROOT_INODE).await.unwrap(), "/");

    // resolution through redundant separators and dot components
    let (leaf_num, _) = fs.stat("/a//b/./c/../c/leaf.txt").await.unwrap();
    let (direct_num, _) = fs.stat("/a/b/c/leaf.txt").await.unwrap();
    assert_eq!(leaf_num, direct_num);
}

#[tokio::test]
async fn test_invalid_paths_rejected() {
    let (_tmp, mut fs) = fresh_fs().await;

    assert!(matches!(fs.stat("").await, Err(FsError::Invalid)));
    assert!(matches!(
        fs.create("/bad\x02name", 0o644).await,
        Err(FsError::Invalid)
    ));
    assert!(matches!(fs.create("/", 0o644).await, Err(FsError::Invalid)));
    let long = format!("/{}", "n".repeat(300));
    assert!(matches!(fs.create(&long, 0o644).await, Err(FsError::Invalid)));
}
