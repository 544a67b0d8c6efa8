//! The interactive read-eval loop and its tokenizer

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use ferrofs::{BlockDevice, FileBackedBlockDevice, Filesystem};

use crate::commands;

/// Shell state: at most one mounted filesystem at a time
pub struct Shell {
    fs: Option<Filesystem>,
    device: Option<Arc<FileBackedBlockDevice>>,
}

/// Split a command line into tokens, grouping double-quoted strings:
/// `write "/path to/file" "hello world"` yields three tokens.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else { break };

        let mut token = String::new();
        if first == '"' {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                token.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }

    tokens
}

impl Shell {
    pub fn new() -> Self {
        Self {
            fs: None,
            device: None,
        }
    }

    /// Attach an image and mount the filesystem on it
    pub async fn mount_image(&mut self, path: &Path) {
        if self.fs.is_some() {
            eprintln!("mount: a filesystem is already mounted");
            return;
        }

        let device = match FileBackedBlockDevice::open(path).await {
            Ok(device) => Arc::new(device),
            Err(e) => {
                eprintln!("mount: cannot open disk '{}': {}", path.display(), e);
                return;
            }
        };

        match Filesystem::mount(device.clone()).await {
            Ok(fs) => {
                println!("Mounted {}", path.display());
                self.fs = Some(fs);
                self.device = Some(device);
            }
            Err(e) => {
                eprintln!("mount: failed to mount '{}': {}", path.display(), e);
                let _ = device.close().await;
            }
        }
    }

    /// Unmount the current filesystem and detach its image
    pub async fn unmount_image(&mut self) {
        let Some(mut fs) = self.fs.take() else {
            eprintln!("unmount: no filesystem mounted");
            return;
        };

        if let Err(e) = fs.unmount().await {
            eprintln!("unmount: {}", e);
        }
        if let Some(device) = self.device.take() {
            if let Err(e) = device.close().await {
                eprintln!("unmount: detach failed: {}", e);
            }
        }
        println!("Filesystem unmounted.");
    }

    async fn prompt(&self) -> String {
        match (&self.fs, &self.device) {
            (Some(fs), Some(device)) => {
                let cwd = fs
                    .inode_to_path(fs.current_dir())
                    .await
                    .unwrap_or_else(|_| "?".to_string());
                format!("[{}:{}]$ ", device.path().display(), cwd)
            }
            _ => "[no-mount]$ ".to_string(),
        }
    }

    /// Run the interactive loop until `exit` or end of input
    pub async fn run(&mut self) -> Result<()> {
        println!();
        println!("ferrofs shell v{}", env!("CARGO_PKG_VERSION"));
        println!("Type 'help' to get available commands.");
        println!("Type 'exit' to quit.");
        println!();

        let stdin = std::io::stdin();
        let mut lines = stdin.lock().lines();

        loop {
            print!("{}", self.prompt().await);
            std::io::stdout().flush()?;

            let Some(line) = lines.next() else { break };
            let line = line?;

            let tokens = tokenize(&line);
            if tokens.is_empty() {
                continue;
            }

            if !self.dispatch(&tokens).await {
                break;
            }
        }

        if self.fs.is_some() {
            self.unmount_image().await;
        }
        Ok(())
    }

    /// Execute one command. Returns false when the shell should exit.
    async fn dispatch(&mut self, tokens: &[String]) -> bool {
        let cmd = tokens[0].as_str();
        let args = &tokens[1..];

        match cmd {
            "exit" => return false,
            "help" => print_help(),
            "format" => {
                if self.fs.is_some() {
                    eprintln!("format: cannot format while a filesystem is mounted.");
                    eprintln!("Please run 'unmount' first.");
                } else {
                    commands::format(args).await;
                }
            }
            "mount" => {
                if args.len() != 1 {
                    eprintln!("Usage: mount <disk.img>");
                } else {
                    self.mount_image(Path::new(&args[0])).await;
                }
            }
            "unmount" => self.unmount_image().await,
            _ => {
                // everything else needs a mounted filesystem
                let Some(fs) = self.fs.as_mut() else {
                    eprintln!("Error: no filesystem mounted.");
                    return true;
                };

                match cmd {
                    "pwd" => commands::pwd(fs).await,
                    "cd" => commands::cd(fs, args).await,
                    "ls" => commands::ls(fs, args).await,
                    "touch" => commands::touch(fs, args).await,
                    "write" => commands::write(fs, args).await,
                    "append" => commands::append(fs, args).await,
                    "rm" => commands::rm(fs, args).await,
                    "cat" => commands::cat(fs, args).await,
                    "mkdir" => commands::mkdir(fs, args).await,
                    "rmdir" => commands::rmdir(fs, args).await,
                    "ln" => commands::ln(fs, args).await,
                    "stat" => commands::stat(fs, args).await,
                    "fsinfo" => commands::fsinfo(fs),
                    _ => eprintln!("Unknown command: {}", cmd),
                }
            }
        }

        true
    }
}

fn print_help() {
    println!("Available commands:");
    println!("  format <disk.img> <num_blocks>");
    println!("  mount <disk.img>");
    println!("  unmount");
    println!("  pwd");
    println!("  cd <path>");
    println!("  ls [path]");
    println!("  touch <file>");
    println!("  write <file> \"text\"");
    println!("  append <file> \"text\"");
    println!("  rm <file>");
    println!("  cat <file>");
    println!("  mkdir <dir>");
    println!("  rmdir <dir>");
    println!("  ln <src> <dst>");
    println!("  stat <path>");
    println!("  fsinfo");
    println!("  help");
    println!("  exit");
}
