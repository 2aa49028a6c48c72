//! Typed on-disk header: the fixed fields occupying the first
//! [`HEADER_FIXED_LEN`](crate::layout::HEADER_FIXED_LEN) bytes of the two
//! header pages, followed by the deletion stack.

use crate::error::{Error, Result};
use crate::layout::{self, header_off as off, HEADER_FIXED_LEN, HEADER_PAGES, PAGE_SIZE, VERSION};
use crate::mach;

#[derive(Debug, Clone)]
pub struct Header {
    pub label: String,
    pub block_count: u64,
    pub page_count: u64,
    pub page_free: u64,
    pub block_size: u32,
    pub page_size: u32,
    pub data_page: u64,
    pub fd_next_page: u64,
    pub fd_count: u64,
    pub dir_count: u64,
    pub mapsize: u64,
    pub delmax: u32,
    pub delstack: Vec<u64>,
}

fn write_str(buf: &mut [u8], field: &str, len: usize) {
    let bytes = field.as_bytes();
    let n = bytes.len().min(len);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf[n..len].fill(0);
}

fn read_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

impl Header {
    /// Capacity, in slots, of the deletion stack given the fixed header
    /// layout: however many `u64`s fit after the fixed fields in the two
    /// header pages.
    pub fn delstack_capacity() -> u64 {
        (HEADER_PAGES * PAGE_SIZE - HEADER_FIXED_LEN) / 8
    }

    /// Encodes this header (including its deletion stack) into a flat
    /// `HEADER_PAGES * PAGE_SIZE`-byte buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.delstack.len() as u64 > Self::delstack_capacity() {
            return Err(Error::InvalidArgument("deletion stack exceeds header capacity".into()));
        }
        let mut buf = vec![0u8; (HEADER_PAGES * PAGE_SIZE) as usize];

        write_str(&mut buf[off::LABEL..off::LABEL + off::LABEL_LEN], &self.label, off::LABEL_LEN);
        write_str(&mut buf[off::VERSION..off::VERSION + off::VERSION_LEN], VERSION, off::VERSION_LEN);
        mach::write_u64(&mut buf[off::BLOCK_COUNT..], self.block_count);
        mach::write_u64(&mut buf[off::PAGE_COUNT..], self.page_count);
        mach::write_u64(&mut buf[off::PAGE_FREE..], self.page_free);
        mach::write_u32(&mut buf[off::BLOCK_SIZE..], self.block_size);
        mach::write_u32(&mut buf[off::PAGE_SIZE..], self.page_size);
        mach::write_u64(&mut buf[off::DATA_PAGE..], self.data_page);
        mach::write_u64(&mut buf[off::FD_NEXT_PAGE..], self.fd_next_page);
        mach::write_u64(&mut buf[off::FD_COUNT..], self.fd_count);
        mach::write_u64(&mut buf[off::DIR_COUNT..], self.dir_count);
        mach::write_u64(&mut buf[off::MAPSIZE..], self.mapsize);
        mach::write_u32(&mut buf[off::DELMAX..], self.delmax);
        mach::write_u32(&mut buf[off::DELCOUNT..], self.delstack.len() as u32);

        let mut pos = off::DELSTACK;
        for &slot in &self.delstack {
            mach::write_u64(&mut buf[pos..], slot);
            pos += 8;
        }
        Ok(buf)
    }

    /// Parses a header from a flat `HEADER_PAGES * PAGE_SIZE`-byte buffer,
    /// validating the version label and the declared sizes against the
    /// fixed layout constants this binary was built with.
    pub fn decode(buf: &[u8]) -> Result<Header> {
        if buf.len() < (HEADER_PAGES * PAGE_SIZE) as usize {
            return Err(Error::CorruptHeader("header buffer too short".into()));
        }
        let version = read_str(&buf[off::VERSION..off::VERSION + off::VERSION_LEN]);
        if version != VERSION {
            return Err(Error::CorruptHeader(format!("unexpected version: {version}")));
        }
        let page_size = mach::read_u32(&buf[off::PAGE_SIZE..]);
        if page_size as u64 != layout::PAGE_SIZE {
            return Err(Error::CorruptHeader(format!("unexpected page size: {page_size}")));
        }

        let delcount = mach::read_u32(&buf[off::DELCOUNT..]) as u64;
        if delcount > Self::delstack_capacity() {
            return Err(Error::CorruptHeader("deletion stack count exceeds header capacity".into()));
        }
        let mut delstack = Vec::with_capacity(delcount as usize);
        let mut pos = off::DELSTACK;
        for _ in 0..delcount {
            delstack.push(mach::read_u64(&buf[pos..]));
            pos += 8;
        }

        Ok(Header {
            label: read_str(&buf[off::LABEL..off::LABEL + off::LABEL_LEN]),
            block_count: mach::read_u64(&buf[off::BLOCK_COUNT..]),
            page_count: mach::read_u64(&buf[off::PAGE_COUNT..]),
            page_free: mach::read_u64(&buf[off::PAGE_FREE..]),
            block_size: mach::read_u32(&buf[off::BLOCK_SIZE..]),
            page_size,
            data_page: mach::read_u64(&buf[off::DATA_PAGE..]),
            fd_next_page: mach::read_u64(&buf[off::FD_NEXT_PAGE..]),
            fd_count: mach::read_u64(&buf[off::FD_COUNT..]),
            dir_count: mach::read_u64(&buf[off::DIR_COUNT..]),
            mapsize: mach::read_u64(&buf[off::MAPSIZE..]),
            delmax: mach::read_u32(&buf[off::DELMAX..]),
            delstack,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        Header {
            label: "test-image".into(),
            block_count: 1024,
            page_count: 1024,
            page_free: 900,
            block_size: 512,
            page_size: PAGE_SIZE as u32,
            data_page: 34,
            fd_next_page: 990,
            fd_count: 3,
            dir_count: 1,
            mapsize: 32,
            delmax: layout::DEFAULT_DELMAX,
            delstack: vec![992, 994],
        }
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let h = sample();
        let buf = h.encode().unwrap();
        let back = Header::decode(&buf).unwrap();
        assert_eq!(back.label, h.label);
        assert_eq!(back.data_page, h.data_page);
        assert_eq!(back.fd_next_page, h.fd_next_page);
        assert_eq!(back.delstack, h.delstack);
        assert_eq!(back.delmax, h.delmax);
    }

    #[test]
    fn decode_rejects_wrong_version() {
        let mut buf = sample().encode().unwrap();
        buf[off::VERSION..off::VERSION + 4].copy_from_slice(b"bogu");
        assert!(Header::decode(&buf).is_err());
    }

    #[test]
    fn label_longer_than_field_is_truncated_not_overflowed() {
        let mut h = sample();
        h.label = "x".repeat(off::LABEL_LEN + 10);
        let buf = h.encode().unwrap();
        let back = Header::decode(&buf).unwrap();
        assert_eq!(back.label.len(), off::LABEL_LEN);
    }

    #[test]
    fn encode_rejects_oversized_delstack() {
        let mut h = sample();
        h.delstack = vec![0u64; (Header::delstack_capacity() + 1) as usize];
        assert!(h.encode().is_err());
    }
}
