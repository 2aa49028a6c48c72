//! In-memory name-indexed entry tree.
//!
//! Arena-style ownership via `BTreeMap<String, EntryRef>`: no raw parent
//! pointers, per the Rust-native redesign called for over the source's
//! `tsearch`-based tree of flexible-array-member nodes. Each entry is its
//! own `RwLock` so file I/O on distinct entries can proceed concurrently
//! once the caller has released the filesystem lock (§5).

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::layout::{self, entry_off as off, EXTENT_SIZE, FILE_SLOT_PAGES, MAX_EXTENTS, PAGE_SIZE};
use crate::mach;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub pageid: u64,
    pub pagecount: u64,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub pageid: u64,
    pub parentid: u64,
    pub size: u64,
    pub isdir: bool,
    pub extents: Vec<Extent>,
    pub open_count: u32,
    pub dirty: bool,
}

/// A shared, individually lockable handle to an in-memory entry.
pub type EntryRef = Arc<RwLock<Entry>>;

impl Entry {
    pub fn new_dir(name: String, pageid: u64, parentid: u64) -> Self {
        Entry {
            name,
            pageid,
            parentid,
            size: 0,
            isdir: true,
            extents: Vec::new(),
            open_count: 0,
            dirty: true,
        }
    }

    pub fn new_file(name: String, pageid: u64, parentid: u64) -> Self {
        Entry {
            name,
            pageid,
            parentid,
            size: 0,
            isdir: false,
            extents: Vec::new(),
            open_count: 0,
            dirty: true,
        }
    }

    /// Placeholder ancestor directory inserted during mount-time scan before
    /// its real slot has been read; reconciled when that slot is found.
    pub fn stub(name: String) -> Self {
        Entry {
            name,
            pageid: 0,
            parentid: 0,
            size: 0,
            isdir: true,
            extents: Vec::new(),
            open_count: 0,
            dirty: false,
        }
    }

    pub fn is_stub(&self) -> bool {
        self.pageid == 0 && self.name != "/"
    }

    /// Encodes this entry's slot contents: the first page holds the fixed
    /// header and extent array, the second the NUL-terminated name.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.extents.len() as u64 > MAX_EXTENTS {
            return Err(Error::InvalidArgument("too many extents".into()));
        }
        if self.name.len() > layout::MAX_PATH {
            return Err(Error::InvalidArgument(format!("name too long: {}", self.name)));
        }
        let mut buf = vec![0u8; (FILE_SLOT_PAGES * PAGE_SIZE) as usize];

        mach::write_u64(&mut buf[off::PAGEID..], self.pageid);
        mach::write_u64(&mut buf[off::PARENTID..], self.parentid);
        mach::write_u64(&mut buf[off::SIZE..], self.size);
        mach::write_u32(&mut buf[off::ISDIR..], self.isdir as u32);
        mach::write_u32(&mut buf[off::DSCOUNT..], self.extents.len() as u32);

        let mut pos = off::EXTENTS;
        for extent in &self.extents {
            mach::write_u64(&mut buf[pos..], extent.pageid);
            mach::write_u64(&mut buf[pos + 8..], extent.pagecount);
            pos += EXTENT_SIZE as usize;
        }

        let name_page = PAGE_SIZE as usize;
        let name_bytes = self.name.as_bytes();
        buf[name_page..name_page + name_bytes.len()].copy_from_slice(name_bytes);
        Ok(buf)
    }

    /// Decodes a slot buffer written by [`Entry::encode`]. `dscount`
    /// greater than `MAX_EXTENTS` or a name missing its terminator are
    /// reported as corruption rather than panicking, since this runs over
    /// data coming straight off the device.
    pub fn decode(buf: &[u8]) -> Result<Entry> {
        if buf.len() < (FILE_SLOT_PAGES * PAGE_SIZE) as usize {
            return Err(Error::CorruptHeader("entry slot buffer too short".into()));
        }
        let dscount = mach::read_u32(&buf[off::DSCOUNT..]) as u64;
        if dscount > MAX_EXTENTS {
            return Err(Error::CorruptHeader("entry dscount exceeds MAX_EXTENTS".into()));
        }
        let mut extents = Vec::with_capacity(dscount as usize);
        let mut pos = off::EXTENTS;
        for _ in 0..dscount {
            extents.push(Extent {
                pageid: mach::read_u64(&buf[pos..]),
                pagecount: mach::read_u64(&buf[pos + 8..]),
            });
            pos += EXTENT_SIZE as usize;
        }

        let name_page = PAGE_SIZE as usize;
        let name_buf = &buf[name_page..name_page + layout::MAX_PATH];
        let end = name_buf.iter().position(|&b| b == 0).ok_or_else(|| {
            Error::CorruptHeader("entry name missing NUL terminator".into())
        })?;
        let name = String::from_utf8(name_buf[..end].to_vec())
            .map_err(|_| Error::CorruptHeader("entry name is not valid utf-8".into()))?;

        Ok(Entry {
            name,
            pageid: mach::read_u64(&buf[off::PAGEID..]),
            parentid: mach::read_u64(&buf[off::PARENTID..]),
            size: mach::read_u64(&buf[off::SIZE..]),
            isdir: mach::read_u32(&buf[off::ISDIR..]) != 0,
            extents,
            open_count: 0,
            dirty: false,
        })
    }
}

/// A byte is printable if it is not a control character and not `/`;
/// see SPEC_FULL.md §9(d) for the rationale behind this explicit policy.
pub fn is_printable_path_byte(b: u8) -> bool {
    b != b'/' && (b'!'..=b'~').contains(&b) || b >= 0x80
}

/// Validates a canonical path per invariant 1.
pub fn validate_name(name: &str) -> Result<()> {
    if name.len() > crate::layout::MAX_PATH {
        return Err(Error::InvalidArgument(format!("name too long: {name}")));
    }
    if !name.starts_with('/') {
        return Err(Error::InvalidArgument(format!("name not absolute: {name}")));
    }
    if name == "/" {
        return Ok(());
    }
    if name.ends_with('/') {
        return Err(Error::InvalidArgument(format!("trailing slash: {name}")));
    }
    for seg in name[1..].split('/') {
        if seg.is_empty() || seg == "." || seg == ".." {
            return Err(Error::InvalidArgument(format!("invalid path segment in: {name}")));
        }
        if !seg.bytes().all(is_printable_path_byte) {
            return Err(Error::InvalidArgument(format!("non-printable byte in: {name}")));
        }
    }
    Ok(())
}

/// True iff `child` is an immediate child of `parent` (§4.3).
pub fn is_immediate_child(parent: &str, child: &str) -> bool {
    if child.len() <= parent.len() || !child.starts_with(parent) {
        return false;
    }
    let rest = &child[parent.len()..];
    rest.starts_with('/') && !rest[1..].contains('/') && rest.len() > 1
}

/// Splits `name` into (parent name, final segment). Returns `None` for root.
pub fn split_parent(name: &str) -> Option<(&str, &str)> {
    if name == "/" {
        return None;
    }
    let idx = name.rfind('/').expect("canonical names always contain a slash");
    let parent = if idx == 0 { "/" } else { &name[..idx] };
    Some((parent, &name[idx + 1..]))
}

pub struct EntryTree {
    entries: BTreeMap<String, EntryRef>,
}

impl EntryTree {
    pub fn new() -> Self {
        EntryTree { entries: BTreeMap::new() }
    }

    pub fn find(&self, name: &str) -> Option<EntryRef> {
        self.entries.get(name).cloned()
    }

    pub fn find_parent(&self, name: &str) -> Option<EntryRef> {
        let (parent, _) = split_parent(name)?;
        self.find(parent)
    }

    pub fn find_by_pageid(&self, pageid: u64) -> Option<EntryRef> {
        self.entries
            .values()
            .find(|e| e.read().expect("entry lock poisoned").pageid == pageid)
            .cloned()
    }

    /// Inserts `entry`, validating its name and, when a parent is supplied,
    /// that `entry.name` is an immediate child of `parent.name` and that
    /// `parentid` matches when both are known.
    pub fn add(&mut self, entry: Entry) -> Result<()> {
        validate_name(&entry.name)?;
        if let Some((parent_name, _)) = split_parent(&entry.name) {
            if let Some(parent) = self.entries.get(parent_name) {
                let parent = parent.read().expect("entry lock poisoned");
                if !is_immediate_child(parent_name, &entry.name) {
                    return Err(Error::InvalidArgument(format!(
                        "{} is not an immediate child of {}",
                        entry.name, parent_name
                    )));
                }
                if parent.pageid != 0 && entry.parentid != 0 && parent.pageid != entry.parentid {
                    return Err(Error::InvalidArgument(format!(
                        "{}'s parentid does not match {}'s pageid",
                        entry.name, parent_name
                    )));
                }
            }
        }
        self.entries.insert(entry.name.clone(), Arc::new(RwLock::new(entry)));
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<EntryRef> {
        self.entries.remove(name)
    }

    /// Re-keys an entry from `old_name` to `new_name`, preserving identity
    /// (the same `EntryRef`, so any handle already holding it observes the
    /// rename). Fails if `new_name` already exists.
    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        if self.entries.contains_key(new_name) {
            return Err(Error::AlreadyExists(new_name.to_string()));
        }
        let entry_ref = self
            .entries
            .remove(old_name)
            .ok_or_else(|| Error::NotFound(old_name.to_string()))?;
        entry_ref.write().expect("entry lock poisoned").name = new_name.to_string();
        self.entries.insert(new_name.to_string(), entry_ref);
        Ok(())
    }

    pub fn children_of<'a>(&'a self, parent: &'a str) -> impl Iterator<Item = EntryRef> + 'a {
        self.entries
            .range(parent.to_string()..)
            .take_while(move |(name, _)| name.starts_with(parent))
            .filter(move |(name, _)| is_immediate_child(parent, name))
            .map(|(_, e)| e.clone())
    }

    /// During mount, inserts stub directories for every ancestor of `name`
    /// that isn't already present, so out-of-order FD-area scans never see
    /// a child before its parent.
    pub fn ensure_ancestors(&mut self, name: &str) -> Result<()> {
        let mut prefix = String::new();
        for seg in name.trim_start_matches('/').split('/') {
            let next = if prefix.is_empty() {
                format!("/{seg}")
            } else {
                format!("{prefix}/{seg}")
            };
            if next == name {
                break;
            }
            if !self.entries.contains_key(&next) {
                self.entries.insert(next.clone(), Arc::new(RwLock::new(Entry::stub(next.clone()))));
            }
            prefix = next;
        }
        if !self.entries.contains_key("/") {
            self.entries.insert("/".to_string(), Arc::new(RwLock::new(Entry::stub("/".to_string()))));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = EntryRef> + '_ {
        self.entries.values().cloned()
    }
}

impl Default for EntryTree {
    fn default() -> Self {
        Self::new()
    }
}
