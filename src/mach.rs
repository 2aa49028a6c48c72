// Functions related to encoding on-disk integers.
use byteorder::{ByteOrder, LittleEndian};

// UNFS stores all multi-byte integers little-endian.
type E = LittleEndian;

pub fn read_u16(buf: &[u8]) -> u16 {
    E::read_u16(buf)
}

pub fn read_u32(buf: &[u8]) -> u32 {
    E::read_u32(buf)
}

pub fn read_u64(buf: &[u8]) -> u64 {
    E::read_u64(buf)
}

pub fn write_u16(buf: &mut [u8], v: u16) {
    E::write_u16(buf, v);
}

pub fn write_u32(buf: &mut [u8], v: u32) {
    E::write_u32(buf, v);
}

pub fn write_u64(buf: &mut [u8], v: u64) {
    E::write_u64(buf, v);
}
