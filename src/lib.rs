pub mod bitmap;
pub mod config;
pub mod device;
pub mod entry;
pub mod error;
pub mod extent;
pub mod fdalloc;
pub mod fs;
pub mod header;
pub mod layout;
pub mod mach;
pub mod mount;
pub mod page;

pub use device::{Device, FileDevice, IoContext};
pub use error::{Error, Result};
pub use fs::{DirEntry, Fd, Filesystem, OpenMode, Stat};
