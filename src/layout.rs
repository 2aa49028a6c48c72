//! On-disk constants and byte offsets for the UNFS layout.
//!
//! Page 0..1       header + deletion stack
//! Page 2..DATA-1  free bitmap, MSB-first within each u64
//! Page DATA..FDN  data pages
//! Page FDN+1..END FD slots, two pages each, growing downward from END

pub const PAGE_SIZE: u64 = 4096;
pub const FILE_SLOT_PAGES: u64 = 2;
pub const HEADER_PAGES: u64 = 2;
pub const HEADER_PAGE_ADDR: u64 = 0;

/// Start of the free bitmap, immediately after the header pages.
pub const MAP_PAGE_ADDR: u64 = HEADER_PAGES;

/// Max length, in bytes, of a canonical name (NUL-terminated on disk).
pub const MAX_PATH: usize = (PAGE_SIZE - 2) as usize;

/// Bytes of a fixed-size `EntryHeader`: pageid + parentid + size + isdir + dscount.
pub const ENTRY_HEADER_SIZE: u64 = 8 + 8 + 8 + 4 + 4;

/// Bytes of a single on-disk extent: pageid + pagecount.
pub const EXTENT_SIZE: u64 = 8 + 8;

/// Max number of extents that fit in one entry-header page.
pub const MAX_EXTENTS: u64 = (PAGE_SIZE - ENTRY_HEADER_SIZE) / EXTENT_SIZE;

/// Default deletion-stack capacity, chosen so the stack fits in the header pages
/// alongside the fixed fields (`HEADER_FIXED_LEN` bytes).
pub const DEFAULT_DELMAX: u32 = 512;

pub const VERSION: &str = "UNFS-1.0";

// Header field byte offsets (within the 2 header pages, treated as one flat buffer).
pub mod header_off {
    pub const LABEL: usize = 0;
    pub const LABEL_LEN: usize = 64;
    pub const VERSION: usize = 64;
    pub const VERSION_LEN: usize = 16;
    pub const BLOCK_COUNT: usize = 80;
    pub const PAGE_COUNT: usize = 88;
    pub const PAGE_FREE: usize = 96;
    pub const BLOCK_SIZE: usize = 104;
    pub const PAGE_SIZE: usize = 108;
    pub const DATA_PAGE: usize = 112;
    pub const FD_NEXT_PAGE: usize = 120;
    pub const FD_COUNT: usize = 128;
    pub const DIR_COUNT: usize = 136;
    pub const MAPSIZE: usize = 144;
    pub const DELMAX: usize = 152;
    pub const DELCOUNT: usize = 156;
    pub const DELSTACK: usize = 160;
}

/// Total fixed-field length before the deletion stack begins.
pub const HEADER_FIXED_LEN: u64 = header_off::DELSTACK as u64;

// Entry-header field byte offsets (first page of a two-page slot).
pub mod entry_off {
    pub const PAGEID: usize = 0;
    pub const PARENTID: usize = 8;
    pub const SIZE: usize = 16;
    pub const ISDIR: usize = 24;
    pub const DSCOUNT: usize = 28;
    pub const EXTENTS: usize = 32;
}

/// Word index and MSB-first bit mask for data page `page`, relative to `data_page`.
pub fn bitmap_word_and_mask(page: u64, data_page: u64) -> (usize, u64) {
    let rel = page - data_page;
    let word = (rel / 64) as usize;
    let bit = 63 - (rel % 64);
    (word, 1u64 << bit)
}
