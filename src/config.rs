use std::path::PathBuf;

use clap::{Parser, Subcommand};

fn default_device() -> Option<PathBuf> {
    std::env::var_os("UNFS_DEVICE").map(PathBuf::from)
}

#[derive(Parser)]
#[command(name = "unfs", about = "Format, check, and inspect UNFS block device images")]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Suppress informational output; only errors are printed.
    #[clap(long, short, global = true, default_value_t = false)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Write a fresh, empty filesystem to DEVICE.
    Format {
        #[clap(value_parser, default_value = None)]
        device: Option<PathBuf>,

        /// Human-readable label stored in the header.
        #[clap(long, short = 'l', default_value = "")]
        label: String,

        /// Deletion-stack capacity; defaults to the layout's default.
        #[clap(long)]
        delmax: Option<u32>,

        /// Total pages to size a newly created backing file to (only used
        /// when DEVICE does not already exist).
        #[clap(long)]
        pages: Option<u64>,
    },
    /// Verify DEVICE's on-disk structures without mutating anything.
    Check {
        #[clap(value_parser, default_value = None)]
        device: Option<PathBuf>,
    },
    /// Print header and root-directory summary stats for DEVICE.
    Stat {
        #[clap(value_parser, default_value = None)]
        device: Option<PathBuf>,
    },
}

impl Config {
    /// Resolves the device path for whichever subcommand was invoked,
    /// falling back to `UNFS_DEVICE` when no positional argument was given.
    pub fn device_path(&self) -> crate::error::Result<PathBuf> {
        let explicit = match &self.command {
            Command::Format { device, .. } => device.clone(),
            Command::Check { device } => device.clone(),
            Command::Stat { device } => device.clone(),
        };
        explicit.or_else(default_device).ok_or_else(|| {
            crate::error::Error::InvalidArgument(
                "no DEVICE given and UNFS_DEVICE is not set".to_string(),
            )
        })
    }
}
