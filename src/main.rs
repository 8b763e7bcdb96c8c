//! patchfs - read-only overlay filesystem
//!
//! Usage:
//!   patchfs mount <root> <patch> <mount_point>  - Mount the merged view
//!   patchfs unmount <mount_point>               - Unmount it

use clap::{Parser, Subcommand};
use patchfs::{
    config::Config,
    fs::{mount_options, PatchFs, PatchFuse},
    Error, Result,
};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "patchfs")]
#[command(version)]
#[command(about = "Read-only overlay that shadows a root tree with a patch tree")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the merged view in the foreground
    Mount {
        /// Base tree
        root: PathBuf,

        /// Override tree; its entries shadow the base tree
        patch: PathBuf,

        /// Mount point directory
        mount_point: PathBuf,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    if let Err(e) = run_command(cli.command) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::Mount {
            root,
            patch,
            mount_point,
            allow_other,
        } => cmd_mount(&root, &patch, &mount_point, allow_other),

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),
    }
}

fn cmd_mount(root: &Path, patch: &Path, mount_point: &Path, allow_other: bool) -> Result<()> {
    let config = Config::new(root, patch, mount_point)?;

    info!("Root tree: {:?}", config.root);
    info!("Patch tree: {:?}", config.patch);
    info!("Mounting at {:?}", config.mountpoint);

    let fs = PatchFuse::new(PatchFs::new(config.layers()));
    fuser::mount2(fs, &config.mountpoint, &mount_options(allow_other))?;

    info!("Unmounted {:?}", config.mountpoint);
    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        Err(Error::Unmount(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}
