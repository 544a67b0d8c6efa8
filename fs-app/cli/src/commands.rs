//! Command handlers binding the shell to the filesystem core

use std::sync::Arc;

use ferrofs::{
    flags, BlockDevice, Dentry, FileBackedBlockDevice, Filesystem, FsError, InodeType, BLOCK_SIZE,
};

const DEFAULT_INODES: u32 = 256;

fn print_fs_error(cmd: &str, err: &FsError, path: &str) {
    eprintln!("{}: cannot operate on '{}': {}", cmd, path, err);
}

/// `format <disk.img> <num_blocks>` - create and format a fresh image
pub async fn format(args: &[String]) {
    if args.len() != 2 {
        eprintln!("Usage: format <disk.img> <num_blocks>");
        return;
    }

    let filename = &args[0];
    let blocks: u32 = match args[1].parse() {
        Ok(n) => n,
        Err(_) => {
            eprintln!("format: invalid block count '{}'", args[1]);
            return;
        }
    };

    let device = match FileBackedBlockDevice::create(filename, blocks as u64 * BLOCK_SIZE as u64)
        .await
    {
        Ok(device) => Arc::new(device),
        Err(e) => {
            eprintln!("format: cannot attach '{}': {}", filename, e);
            return;
        }
    };

    match Filesystem::format(device.as_ref(), blocks, DEFAULT_INODES).await {
        Ok(()) => println!(
            "Filesystem '{}' formatted ({} bytes)",
            filename,
            blocks as u64 * BLOCK_SIZE as u64
        ),
        Err(e) => eprintln!("format: failed to format '{}': {}", filename, e),
    }

    if let Err(e) = device.close().await {
        eprintln!("format: detach failed: {}", e);
    }
}

/// `pwd` - print the absolute path of the current directory
pub async fn pwd(fs: &Filesystem) {
    match fs.inode_to_path(fs.current_dir()).await {
        Ok(path) => println!("{}", path),
        Err(e) => eprintln!("pwd: error resolving current directory: {}", e),
    }
}

/// `cd <path>`
pub async fn cd(fs: &mut Filesystem, args: &[String]) {
    if args.len() != 1 {
        eprintln!("Usage: cd <path>");
        return;
    }
    if let Err(e) = fs.cd(&args[0]).await {
        print_fs_error("cd", &e, &args[0]);
    }
}

fn join_path(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{}", name)
    } else if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// `ls [path]` - list a directory with type and size columns
pub async fn ls(fs: &Filesystem, args: &[String]) {
    let path = match args.len() {
        0 => ".",
        1 => args[0].as_str(),
        _ => {
            eprintln!("Usage: ls [path]");
            return;
        }
    };

    let mut entries: Vec<Dentry> = match fs.list(path).await {
        Ok(entries) => entries,
        Err(e) => {
            print_fs_error("ls", &e, path);
            return;
        }
    };
    entries.sort_by(|a, b| a.name().cmp(b.name()));

    for entry in entries {
        let type_char = match entry.file_type {
            InodeType::Directory => 'd',
            _ => '-',
        };
        let size = match fs.stat(&join_path(path, entry.name())).await {
            Ok((_, ino)) => ino.size,
            Err(_) => 0,
        };
        println!("{} {:>8}  {}", type_char, size, entry.name());
    }
}

/// `touch <file>` - create an empty file
pub async fn touch(fs: &mut Filesystem, args: &[String]) {
    if args.len() != 1 {
        eprintln!("Usage: touch <file>");
        return;
    }
    if let Err(e) = fs.create(&args[0], 0o644).await {
        print_fs_error("touch", &e, &args[0]);
    }
}

async fn write_payload(fs: &mut Filesystem, path: &str, text: &str, open_flags: u32, cmd: &str) {
    let mut file = match fs.open(path, open_flags).await {
        Ok(file) => file,
        Err(e) => {
            print_fs_error(cmd, &e, path);
            return;
        }
    };

    match fs.write(&mut file, text.as_bytes()).await {
        Ok(written) => println!("{} bytes written", written),
        Err(e) => print_fs_error(cmd, &e, path),
    }
}

/// `write <file> "text"` - replace a file's contents
pub async fn write(fs: &mut Filesystem, args: &[String]) {
    if args.len() != 2 {
        eprintln!("Usage: write <file> \"text\"");
        return;
    }
    write_payload(
        fs,
        &args[0],
        &args[1],
        flags::WRONLY | flags::CREAT | flags::TRUNC,
        "write",
    )
    .await;
}

/// `append <file> "text"` - write at end of file
pub async fn append(fs: &mut Filesystem, args: &[String]) {
    if args.len() != 2 {
        eprintln!("Usage: append <file> \"text\"");
        return;
    }
    write_payload(
        fs,
        &args[0],
        &args[1],
        flags::WRONLY | flags::CREAT | flags::APPEND,
        "append",
    )
    .await;
}

/// `rm <file>`
pub async fn rm(fs: &mut Filesystem, args: &[String]) {
    if args.len() != 1 {
        eprintln!("Usage: rm <file>");
        return;
    }
    if let Err(e) = fs.unlink(&args[0]).await {
        print_fs_error("rm", &e, &args[0]);
    }
}

/// `cat <file>` - print a file's contents
pub async fn cat(fs: &mut Filesystem, args: &[String]) {
    if args.len() != 1 {
        eprintln!("Usage: cat <file>");
        return;
    }

    let mut file = match fs.open(&args[0], flags::RDONLY).await {
        Ok(file) => file,
        Err(e) => {
            print_fs_error("cat", &e, &args[0]);
            return;
        }
    };

    let mut buf = [0u8; 1024];
    loop {
        match fs.read(&mut file, &mut buf).await {
            Ok(0) => break,
            Ok(n) => print!("{}", String::from_utf8_lossy(&buf[..n])),
            Err(e) => {
                print_fs_error("cat", &e, &args[0]);
                return;
            }
        }
    }
    println!();
}

/// `mkdir <dir>`
pub async fn mkdir(fs: &mut Filesystem, args: &[String]) {
    if args.len() != 1 {
        eprintln!("Usage: mkdir <dir>");
        return;
    }
    if let Err(e) = fs.mkdir(&args[0], 0o755).await {
        print_fs_error("mkdir", &e, &args[0]);
    }
}

/// `rmdir <dir>`
pub async fn rmdir(fs: &mut Filesystem, args: &[String]) {
    if args.len() != 1 {
        eprintln!("Usage: rmdir <dir>");
        return;
    }
    if let Err(e) = fs.rmdir(&args[0]).await {
        print_fs_error("rmdir", &e, &args[0]);
    }
}

/// `ln <src> <dst>` - create a hard link
pub async fn ln(fs: &mut Filesystem, args: &[String]) {
    if args.len() != 2 {
        eprintln!("Usage: ln <src> <dst>");
        return;
    }
    if let Err(e) = fs.link(&args[0], &args[1]).await {
        print_fs_error("ln", &e, &args[0]);
    }
}

/// `stat <path>` - print the inode behind a path
pub async fn stat(fs: &Filesystem, args: &[String]) {
    if args.len() != 1 {
        eprintln!("Usage: stat <path>");
        return;
    }

    let (inode_num, ino) = match fs.stat(&args[0]).await {
        Ok(result) => result,
        Err(e) => {
            print_fs_error("stat", &e, &args[0]);
            return;
        }
    };

    let kind = match ino.kind {
        InodeType::File => "file",
        InodeType::Directory => "directory",
        InodeType::Free => "free",
    };

    println!("Inode #{} ({})", inode_num, kind);
    println!("  Size       : {} bytes", ino.size);
    println!("  Blocks     : {}", ino.blocks_used);
    println!("  Links      : {}", ino.links_count);
    println!("  Permissions: {:o}", ino.permissions);
    println!("  Created    : {}", ino.created_time);
    println!("  Modified   : {}", ino.modified_time);
    println!("  Accessed   : {}", ino.accessed_time);
}

/// `fsinfo` - print superblock counters and mount state
pub fn fsinfo(fs: &Filesystem) {
    println!("=== Filesystem Statistics ===");
    println!("{}", fs.stats());
}
