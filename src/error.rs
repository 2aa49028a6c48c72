//! Error taxonomy for the UNFS core.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    InvalidArgument(String),
    NotFound(String),
    AlreadyExists(String),
    Busy(String),
    OutOfSpace,
    DeviceIo(std::io::Error),
    CorruptHeader(String),
    CorruptBitmap(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::NotFound(name) => write!(f, "not found: {name}"),
            Error::AlreadyExists(name) => write!(f, "already exists: {name}"),
            Error::Busy(name) => write!(f, "busy: {name}"),
            Error::OutOfSpace => write!(f, "out of space"),
            Error::DeviceIo(err) => write!(f, "device I/O error: {err}"),
            Error::CorruptHeader(msg) => write!(f, "corrupt header: {msg}"),
            Error::CorruptBitmap(msg) => write!(f, "corrupt bitmap: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::DeviceIo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::DeviceIo(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
