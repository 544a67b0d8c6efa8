//! ferrofs command line interface
//!
//! Interactive shell for creating, mounting, and manipulating ferrofs images.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::LevelFilter;

mod commands;
mod shell;

/// ferrofs - educational block filesystem shell
#[derive(Parser)]
#[command(
    name = "ferrofs",
    about = "Interactive shell for ferrofs images",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Image file to mount at startup
    image: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new().filter_level(log_level).init();

    let mut shell = shell::Shell::new();

    if let Some(image) = cli.image {
        shell.mount_image(&image).await;
    }

    shell.run().await
}
