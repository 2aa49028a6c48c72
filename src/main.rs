use std::sync::Arc;

use clap::Parser;
use unfs::config::{Command, Config};
use unfs::{Device, FileDevice, Filesystem};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::parse();
    let path = config.device_path()?;

    match &config.command {
        Command::Format { label, delmax, pages, .. } => {
            let dev = if path.exists() {
                FileDevice::open(&path)?
            } else {
                let pages = pages.ok_or_else(|| {
                    anyhow::anyhow!("{} does not exist; pass --pages to create it", path.display())
                })?;
                FileDevice::create(&path, pages)?
            };
            Filesystem::format(&dev, label, *delmax)?;
            if !config.quiet {
                println!("formatted {}", path.display());
            }
        }
        Command::Check { .. } => {
            let dev = FileDevice::open(&path)?;
            Filesystem::check_device(&dev)?;
            if !config.quiet {
                println!("{} is consistent", path.display());
            }
        }
        Command::Stat { .. } => {
            let dev = Arc::new(FileDevice::open(&path)?);
            let page_count = dev.page_count();
            let fs = Filesystem::open_device(dev)?;
            let (exists, isdir, size) = fs.exist("/");
            if !config.quiet {
                println!("device: {}", path.display());
                println!("pages: {page_count}");
                println!("root present: {exists}, isdir: {isdir}, size: {size}");
                for entry in fs.dir_list("/")? {
                    println!("  {} ({}, {} bytes)", entry.name, if entry.isdir { "dir" } else { "file" }, entry.size);
                }
            }
            fs.close_filesystem()?;
        }
    }
    Ok(())
}
