//! Device provider contract and a raw-file-backed implementation.
//!
//! Mirrors the original raw block-device provider's `pread`/`pwrite` retry
//! loop, adapted to `std::os::unix::fs::FileExt` instead of raw syscalls.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::{Error, Result};
use crate::layout::PAGE_SIZE;
use crate::page::PageBuf;

/// Per-operation I/O context. The raw file provider needs none; the type
/// exists so an NVMe-style provider with real per-thread queues can plug in.
pub struct IoContext;

pub trait Device: Send + Sync {
    fn page_count(&self) -> u64;

    fn ioc_alloc(&self) -> IoContext {
        IoContext
    }

    fn ioc_free(&self, _ioc: IoContext) {}

    fn page_alloc(&self, _ioc: &IoContext, count: u64) -> PageBuf {
        PageBuf::zeroed(count)
    }

    fn page_free(&self, _ioc: &IoContext, _buf: PageBuf) {}

    fn read(&self, ioc: &IoContext, buf: &mut [u8], page_addr: u64, page_count: u64) -> Result<()>;

    fn write(&self, ioc: &IoContext, buf: &[u8], page_addr: u64, page_count: u64) -> Result<()>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct FileDevice {
    file: File,
    page_count: u64,
}

impl FileDevice {
    /// Opens an existing image for `format`/`check`/`open`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let page_count = len / PAGE_SIZE;
        Ok(FileDevice { file, page_count })
    }

    /// Creates (or truncates) a backing file sized for `page_count` pages.
    pub fn create(path: &Path, page_count: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(page_count * PAGE_SIZE)?;
        Ok(FileDevice { file, page_count })
    }
}

impl Device for FileDevice {
    fn page_count(&self) -> u64 {
        self.page_count
    }

    fn read(&self, _ioc: &IoContext, buf: &mut [u8], page_addr: u64, page_count: u64) -> Result<()> {
        let want = (page_count * PAGE_SIZE) as usize;
        if buf.len() < want {
            return Err(Error::InvalidArgument("read buffer too small".into()));
        }
        let offset = page_addr * PAGE_SIZE;
        let mut done = 0usize;
        while done < want {
            let n = self.file.read_at(&mut buf[done..want], offset + done as u64)?;
            if n == 0 {
                return Err(Error::DeviceIo(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short read from device",
                )));
            }
            done += n;
        }
        Ok(())
    }

    fn write(&self, _ioc: &IoContext, buf: &[u8], page_addr: u64, page_count: u64) -> Result<()> {
        let want = (page_count * PAGE_SIZE) as usize;
        if buf.len() < want {
            return Err(Error::InvalidArgument("write buffer too small".into()));
        }
        let offset = page_addr * PAGE_SIZE;
        let mut done = 0usize;
        while done < want {
            let n = self.file.write_at(&buf[done..want], offset + done as u64)?;
            if n == 0 {
                return Err(Error::DeviceIo(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "short write to device",
                )));
            }
            done += n;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
