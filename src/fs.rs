//! `Filesystem`: the public handle type tying together the header, bitmap,
//! FD allocator, and entry tree behind the locking model of §5.
//!
//! No process-wide singleton (unlike the source's `g_unfs`): `open_device`
//! returns an owned handle a caller can hold for as long as it needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{info, warn};

use crate::bitmap::Bitmap;
use crate::device::Device;
use crate::entry::{self, Entry, EntryRef, EntryTree, Extent};
use crate::error::{Error, Result};
use crate::fdalloc::{FdAllocator, FreeOutcome};
use crate::header::Header;
use crate::layout::{FILE_SLOT_PAGES, HEADER_PAGES, MAP_PAGE_ADDR, PAGE_SIZE};
use crate::mach;
use crate::mount;

/// Serializes `format`/`open_device`/`close_filesystem` process-wide, per
/// §5's single mount `Mutex`. A raw `pread`/`pwrite` device has no shared
/// kernel-level mount state to protect, but the lock still guards against
/// two threads racing `open_device` against the same backing file.
static MOUNT_LOCK: Mutex<()> = Mutex::new(());
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

struct Inner {
    header: Header,
    bitmap: Bitmap,
    fdalloc: FdAllocator,
    tree: EntryTree,
}

pub struct Filesystem {
    device: Arc<dyn Device>,
    session_id: u64,
    inner: RwLock<Inner>,
}

/// An open file or directory handle. Carries the mount's session id so a
/// handle from a previous mount of the same `Filesystem` value is rejected
/// rather than silently operating on unrelated state.
pub struct Fd {
    session_id: u64,
    entry: EntryRef,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenMode {
    pub create: bool,
    pub readonly: bool,
    pub exclusive: bool,
}

#[derive(Debug, Clone)]
pub struct Stat {
    pub size: u64,
    pub isdir: bool,
    pub extents: Vec<Extent>,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub isdir: bool,
}

fn find_real(tree: &EntryTree, name: &str) -> Option<EntryRef> {
    tree.find(name).filter(|e| !e.read().expect("entry lock poisoned").is_stub())
}

impl Filesystem {
    /// Writes a fresh, empty filesystem to `device` (§4.6).
    pub fn format(device: &dyn Device, label: &str, delmax: Option<u32>) -> Result<()> {
        let _guard = MOUNT_LOCK.lock().expect("mount lock poisoned");
        let ioc = device.ioc_alloc();
        mount::format(device, &ioc, label, delmax)
    }

    /// Opens a formatted device, scanning the FD area and rebuilding the
    /// entry tree (§4.6).
    pub fn open_device(device: Arc<dyn Device>) -> Result<Self> {
        let _guard = MOUNT_LOCK.lock().expect("mount lock poisoned");
        let ioc = device.ioc_alloc();
        let mounted = mount::open(device.as_ref(), &ioc)?;
        let session_id = NEXT_SESSION.fetch_add(1, Ordering::SeqCst);
        info!("mounted device with session id {session_id}");
        Ok(Filesystem {
            device,
            session_id,
            inner: RwLock::new(Inner {
                header: mounted.header,
                bitmap: mounted.bitmap,
                fdalloc: mounted.fdalloc,
                tree: mounted.tree,
            }),
        })
    }

    /// Runs the same scan as `open_device` plus the extra bitmap/parentid
    /// cross-checks of `unfs_check`, without retaining the handle.
    pub fn check_device(device: &dyn Device) -> Result<()> {
        let ioc = device.ioc_alloc();
        mount::check(device, &ioc)?;
        Ok(())
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    fn check_session(&self, fd: &Fd) -> Result<()> {
        if fd.session_id != self.session_id {
            return Err(Error::InvalidArgument("stale file handle from a previous mount".into()));
        }
        Ok(())
    }

    /// The bitmap word index at or beyond which data-page allocation must
    /// not reach, since pages from there on belong to the FD area.
    fn limit_word(&self, inner: &Inner) -> usize {
        let (word, _) = crate::layout::bitmap_word_and_mask(inner.fdalloc.frontier(), inner.header.data_page);
        word
    }

    fn sync_header_locked(&self, inner: &mut Inner) -> Result<()> {
        inner.header.fd_next_page = inner.fdalloc.fd_next_page();
        inner.header.fd_count = inner.fdalloc.fd_count();
        inner.header.dir_count = inner.fdalloc.dir_count();
        inner.header.delmax = inner.fdalloc.delmax();
        inner.header.delstack = inner.fdalloc.delstack().to_vec();
        inner.header.page_free = inner.header.page_count - inner.bitmap.popcount();

        let ioc = self.device.ioc_alloc();
        self.device.write(&ioc, &inner.header.encode()?, 0, HEADER_PAGES)?;

        if let Some((lo, hi)) = inner.bitmap.take_dirty_pages() {
            let words_per_page = (PAGE_SIZE / 8) as usize;
            let words = &inner.bitmap.words()[lo * words_per_page..(hi + 1) * words_per_page];
            let mut buf = vec![0u8; words.len() * 8];
            for (i, word) in words.iter().enumerate() {
                mach::write_u64(&mut buf[i * 8..], *word);
            }
            self.device.write(&ioc, &buf, MAP_PAGE_ADDR + lo as u64, (hi - lo + 1) as u64)?;
        }
        Ok(())
    }

    /// Flushes the header and any dirty bitmap ranges. Per §9(a), this is
    /// the only implicit sync point besides `close`; mutating calls do not
    /// sync on every invocation.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.write().expect("filesystem lock poisoned");
        self.sync_header_locked(&mut inner)?;
        self.device.close()
    }

    /// Flushes and releases the device, completing the `Open → Closed`
    /// transition.
    pub fn close_filesystem(self) -> Result<()> {
        let _guard = MOUNT_LOCK.lock().expect("mount lock poisoned");
        let mut inner = self.inner.write().expect("filesystem lock poisoned");
        self.sync_header_locked(&mut inner)?;
        self.device.close()
    }

    fn write_slot(&self, entry: &Entry) -> Result<()> {
        let ioc = self.device.ioc_alloc();
        self.device.write(&ioc, &entry.encode()?, entry.pageid, FILE_SLOT_PAGES)
    }

    /// Creates `name` with kind `isdir`, creating ancestor directories
    /// first when `mkparents` is set. Idempotent: creating an existing
    /// entry of the same kind is a no-op (§8).
    fn create_locked(&self, inner: &mut Inner, name: &str, isdir: bool, mkparents: bool) -> Result<EntryRef> {
        if let Some(existing) = find_real(&inner.tree, name) {
            let matches = existing.read().expect("entry lock poisoned").isdir == isdir;
            if matches {
                return Ok(existing);
            }
            return Err(Error::AlreadyExists(name.to_string()));
        }

        let (parent_name, _) = entry::split_parent(name)
            .ok_or_else(|| Error::InvalidArgument("cannot create the root directory".into()))?;
        let parent = match find_real(&inner.tree, parent_name) {
            Some(p) => p,
            None if mkparents => self.create_locked(inner, parent_name, true, true)?,
            None => return Err(Error::NotFound(parent_name.to_string())),
        };
        let parentid = parent.read().expect("entry lock poisoned").pageid;

        let slot = inner.fdalloc.allocate(&mut inner.bitmap, isdir)?;
        let new_entry = if isdir {
            Entry::new_dir(name.to_string(), slot, parentid)
        } else {
            Entry::new_file(name.to_string(), slot, parentid)
        };
        self.write_slot(&new_entry)?;
        inner.tree.add(new_entry)?;
        self.bump_child_count(inner, &parent, 1)?;
        self.sync_header_locked(inner)?;
        Ok(inner.tree.find(name).expect("just inserted"))
    }

    /// Adjusts `dir`'s child count by `delta` and persists its slot,
    /// keeping invariant 6 (`P.size` equals the count of its children).
    fn bump_child_count(&self, _inner: &mut Inner, dir: &EntryRef, delta: i64) -> Result<()> {
        let updated = {
            let mut e = dir.write().expect("entry lock poisoned");
            e.size = (e.size as i64 + delta).max(0) as u64;
            e.dirty = true;
            e.clone()
        };
        self.write_slot(&updated)
    }

    pub fn create(&self, name: &str, isdir: bool, mkparents: bool) -> Result<()> {
        entry::validate_name(name)?;
        let mut inner = self.inner.write().expect("filesystem lock poisoned");
        self.create_locked(&mut inner, name, isdir, mkparents)?;
        Ok(())
    }

    /// Frees `name`'s slot and extents, applying any resulting FD-area
    /// relocation. Fails if it's an open entry or a non-empty directory.
    pub fn remove(&self, name: &str, isdir: bool) -> Result<()> {
        if name == "/" {
            return Err(Error::InvalidArgument("cannot remove the root directory".into()));
        }
        let mut inner = self.inner.write().expect("filesystem lock poisoned");
        let entry_ref = find_real(&inner.tree, name).ok_or_else(|| Error::NotFound(name.to_string()))?;

        let (pageid, extents, entry_isdir) = {
            let e = entry_ref.read().expect("entry lock poisoned");
            if e.isdir != isdir {
                return Err(Error::InvalidArgument(format!("{name} is not a {}", if isdir { "directory" } else { "file" })));
            }
            if e.open_count > 0 {
                return Err(Error::Busy(name.to_string()));
            }
            (e.pageid, e.extents.clone(), e.isdir)
        };
        if entry_isdir && inner.tree.children_of(name).next().is_some() {
            return Err(Error::Busy(format!("{name} is not empty")));
        }

        for extent in &extents {
            inner.bitmap.free(extent.pageid, extent.pagecount)?;
        }
        let outcome = {
            let inner = &mut *inner;
            inner.fdalloc.free(&mut inner.bitmap, pageid, entry_isdir)
        };
        inner.tree.remove(name);
        if let Some(parent) = inner.tree.find_parent(name) {
            self.bump_child_count(&mut inner, &parent, -1)?;
        }
        self.apply_free_outcome(&mut inner, outcome)?;
        self.sync_header_locked(&mut inner)?;
        Ok(())
    }

    /// Rewrites the entry that lived at `from`'s old slot into `to`, and —
    /// if it's a directory — every child's `parentid`, per the relocation
    /// contract described in `fdalloc::FreeOutcome`.
    fn apply_free_outcome(&self, inner: &mut Inner, outcome: FreeOutcome) -> Result<()> {
        let FreeOutcome::Relocate { from, to } = outcome else {
            return Ok(());
        };
        let moved = inner
            .tree
            .find_by_pageid(from)
            .ok_or_else(|| Error::CorruptHeader("relocation source entry missing from tree".into()))?;

        let (name, was_dir) = {
            let mut e = moved.write().expect("entry lock poisoned");
            e.pageid = to;
            e.dirty = true;
            (e.name.clone(), e.isdir)
        };
        self.write_slot(&moved.read().expect("entry lock poisoned"))?;
        warn!("relocated fd slot for {name}: {from} -> {to}");

        if was_dir {
            for child in inner.tree.children_of(&name).collect::<Vec<_>>() {
                {
                    let mut c = child.write().expect("entry lock poisoned");
                    c.parentid = to;
                    c.dirty = true;
                }
                self.write_slot(&child.read().expect("entry lock poisoned"))?;
            }
        }
        Ok(())
    }

    /// Frees an existing entry the way `remove` does, used by `rename`
    /// when overwriting an existing destination.
    fn remove_entry_locked(&self, inner: &mut Inner, name: &str, entry_ref: &EntryRef) -> Result<()> {
        let (pageid, extents, isdir) = {
            let e = entry_ref.read().expect("entry lock poisoned");
            (e.pageid, e.extents.clone(), e.isdir)
        };
        for extent in &extents {
            inner.bitmap.free(extent.pageid, extent.pagecount)?;
        }
        let outcome = inner.fdalloc.free(&mut inner.bitmap, pageid, isdir);
        inner.tree.remove(name);
        if let Some(parent) = inner.tree.find_parent(name) {
            self.bump_child_count(inner, &parent, -1)?;
        }
        self.apply_free_outcome(inner, outcome)
    }

    /// Atomically re-keys `src` to `dst`, rewriting its parent link and
    /// name page on device. When `override_existing` is set and `dst`
    /// already exists, the old entry is removed first.
    pub fn rename(&self, src: &str, dst: &str, override_existing: bool) -> Result<()> {
        entry::validate_name(dst)?;
        let mut inner = self.inner.write().expect("filesystem lock poisoned");

        let entry_ref = find_real(&inner.tree, src).ok_or_else(|| Error::NotFound(src.to_string()))?;
        if entry_ref.read().expect("entry lock poisoned").open_count > 0 {
            return Err(Error::Busy(src.to_string()));
        }

        if let Some(existing) = find_real(&inner.tree, dst) {
            if !override_existing {
                return Err(Error::AlreadyExists(dst.to_string()));
            }
            if existing.read().expect("entry lock poisoned").open_count > 0 {
                return Err(Error::Busy(dst.to_string()));
            }
            self.remove_entry_locked(&mut inner, dst, &existing)?;
        }

        let (dst_parent_name, _) = entry::split_parent(dst)
            .ok_or_else(|| Error::InvalidArgument("cannot rename onto the root directory".into()))?;
        let dst_parent = find_real(&inner.tree, dst_parent_name).ok_or_else(|| Error::NotFound(dst_parent_name.to_string()))?;
        let new_parentid = dst_parent.read().expect("entry lock poisoned").pageid;
        let src_parent = inner.tree.find_parent(src);

        inner.tree.rename(src, dst)?;
        {
            let mut e = entry_ref.write().expect("entry lock poisoned");
            e.parentid = new_parentid;
            e.dirty = true;
        }
        self.write_slot(&entry_ref.read().expect("entry lock poisoned"))?;
        if src_parent.as_ref().map(|p| Arc::ptr_eq(p, &dst_parent)) != Some(true) {
            if let Some(old_parent) = src_parent {
                self.bump_child_count(&mut inner, &old_parent, -1)?;
            }
            self.bump_child_count(&mut inner, &dst_parent, 1)?;
        }
        self.sync_header_locked(&mut inner)?;
        Ok(())
    }

    pub fn exist(&self, name: &str) -> (bool, bool, u64) {
        let inner = self.inner.read().expect("filesystem lock poisoned");
        match find_real(&inner.tree, name) {
            Some(e) => {
                let e = e.read().expect("entry lock poisoned");
                (true, e.isdir, e.size)
            }
            None => (false, false, 0),
        }
    }

    pub fn dir_list(&self, name: &str) -> Result<Vec<DirEntry>> {
        let inner = self.inner.read().expect("filesystem lock poisoned");
        let dir = find_real(&inner.tree, name).ok_or_else(|| Error::NotFound(name.to_string()))?;
        if !dir.read().expect("entry lock poisoned").isdir {
            return Err(Error::InvalidArgument(format!("{name} is not a directory")));
        }
        Ok(inner
            .tree
            .children_of(name)
            .map(|c| {
                let c = c.read().expect("entry lock poisoned");
                DirEntry { name: c.name.clone(), size: c.size, isdir: c.isdir }
            })
            .collect())
    }

    /// Opens `name`, creating it first when `mode.create` is set.
    /// `mode.exclusive` fails with `Busy` if the entry already has an open
    /// handle.
    pub fn open(&self, name: &str, mode: OpenMode) -> Result<Fd> {
        entry::validate_name(name)?;
        let mut inner = self.inner.write().expect("filesystem lock poisoned");

        let entry_ref = match find_real(&inner.tree, name) {
            Some(e) => {
                if mode.exclusive && e.read().expect("entry lock poisoned").open_count > 0 {
                    return Err(Error::Busy(name.to_string()));
                }
                e
            }
            None => {
                if !mode.create {
                    return Err(Error::NotFound(name.to_string()));
                }
                self.create_locked(&mut inner, name, false, false)?
            }
        };
        entry_ref.write().expect("entry lock poisoned").open_count += 1;
        Ok(Fd { session_id: self.session_id, entry: entry_ref })
    }

    pub fn close(&self, fd: Fd) -> Result<()> {
        self.check_session(&fd)?;
        let mut inner = self.inner.write().expect("filesystem lock poisoned");
        let (pageid, dirty, buf) = {
            let mut e = fd.entry.write().expect("entry lock poisoned");
            e.open_count = e.open_count.saturating_sub(1);
            if e.dirty {
                let buf = e.encode()?;
                e.dirty = false;
                (e.pageid, true, Some(buf))
            } else {
                (e.pageid, false, None)
            }
        };
        if dirty {
            let ioc = self.device.ioc_alloc();
            self.device.write(&ioc, &buf.expect("dirty implies a buffer"), pageid, FILE_SLOT_PAGES)?;
            self.sync_header_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Reads `len` bytes at `off` into `buf`. Takes only the entry's own
    /// lock: distinct files may be read concurrently (§5).
    pub fn read(&self, fd: &Fd, buf: &mut [u8], off: u64, len: u64) -> Result<()> {
        self.check_session(fd)?;
        let entry = fd.entry.read().expect("entry lock poisoned");
        let ioc = self.device.ioc_alloc();
        crate::extent::read(&entry, self.device.as_ref(), &ioc, buf, off, len)
    }

    /// Writes `len` bytes at `off`, auto-extending the file when needed
    /// (§9(b)). Takes the filesystem write lock for the whole call, since
    /// a write may need to allocate; this trades away concurrency on
    /// in-range writes for a simpler, obviously-correct locking story (see
    /// DESIGN.md).
    pub fn write(&self, fd: &Fd, buf: &[u8], off: u64, len: u64) -> Result<()> {
        self.check_session(fd)?;
        let mut inner = self.inner.write().expect("filesystem lock poisoned");
        let limit_word = self.limit_word(&inner);
        let mut entry = fd.entry.write().expect("entry lock poisoned");
        let ioc = self.device.ioc_alloc();
        crate::extent::write(&mut entry, &mut inner.bitmap, self.device.as_ref(), &ioc, limit_word, buf, off, len)?;
        drop(entry);
        self.sync_header_locked(&mut inner)
    }

    /// Grows or shrinks the file to `new_size`. `fill` is the byte pattern
    /// written into newly-allocated pages on growth; `None` leaves them
    /// whatever the device returns.
    pub fn resize(&self, fd: &Fd, new_size: u64, fill: Option<u8>) -> Result<()> {
        self.check_session(fd)?;
        let mut inner = self.inner.write().expect("filesystem lock poisoned");
        let limit_word = self.limit_word(&inner);
        let mut entry = fd.entry.write().expect("entry lock poisoned");
        let ioc = self.device.ioc_alloc();
        if new_size >= entry.size {
            crate::extent::grow(&mut entry, &mut inner.bitmap, self.device.as_ref(), &ioc, limit_word, new_size, fill)?;
        } else {
            crate::extent::shrink(&mut entry, &mut inner.bitmap, new_size)?;
        }
        drop(entry);
        self.sync_header_locked(&mut inner)
    }

    pub fn stat(&self, fd: &Fd) -> Result<Stat> {
        self.check_session(fd)?;
        let entry = fd.entry.read().expect("entry lock poisoned");
        Ok(Stat { size: entry.size, isdir: entry.isdir, extents: entry.extents.clone() })
    }

    pub fn checksum(&self, fd: &Fd) -> Result<u64> {
        self.check_session(fd)?;
        let entry = fd.entry.read().expect("entry lock poisoned");
        let ioc = self.device.ioc_alloc();
        crate::extent::checksum(&entry, self.device.as_ref(), &ioc)
    }
}
