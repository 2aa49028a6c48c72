//! Format/open/check state machine (§4.6): building and validating the
//! on-disk layout, and the mount-time FD-area scan that reconstructs the
//! in-memory entry tree.

use log::{debug, info, warn};

use crate::bitmap::Bitmap;
use crate::device::{Device, IoContext};
use crate::entry::{self, Entry, EntryTree};
use crate::error::{Error, Result};
use crate::fdalloc::FdAllocator;
use crate::header::Header;
use crate::layout::{self, FILE_SLOT_PAGES, HEADER_PAGES, MAP_PAGE_ADDR, PAGE_SIZE};

/// Everything recovered from a device, ready to be wrapped in a
/// `Filesystem`.
pub struct Mounted {
    pub header: Header,
    pub bitmap: Bitmap,
    pub fdalloc: FdAllocator,
    pub tree: EntryTree,
}

/// Computes the data-page start address and bitmap word count for a
/// device of `page_count` pages, solving the small fixed point between
/// "how many pages does the bitmap need" and "how many pages are left for
/// the bitmap to describe".
fn layout_for(page_count: u64) -> Result<(u64, u64)> {
    if page_count <= HEADER_PAGES + 1 {
        return Err(Error::InvalidArgument("device too small to format".into()));
    }
    let mut bitmap_pages = 1u64;
    for _ in 0..8 {
        let data_page = HEADER_PAGES + bitmap_pages;
        if data_page >= page_count {
            return Err(Error::InvalidArgument("device too small to format".into()));
        }
        let coverable = page_count - data_page;
        let words = coverable.div_ceil(64);
        let need_pages = (words * 8).div_ceil(PAGE_SIZE);
        if need_pages == bitmap_pages {
            return Ok((data_page, words));
        }
        bitmap_pages = need_pages;
    }
    Err(Error::InvalidArgument("bitmap sizing did not converge".into()))
}

/// Writes a fresh header, zeroed bitmap, and a root directory entry to
/// `device`, per `unfs_format`.
pub fn format(device: &dyn Device, ioc: &IoContext, label: &str, delmax: Option<u32>) -> Result<()> {
    let page_count = device.page_count();
    let (data_page, mapsize) = layout_for(page_count)?;
    let delmax = delmax.unwrap_or(layout::DEFAULT_DELMAX).min(Header::delstack_capacity() as u32);

    let mut bitmap = Bitmap::new(mapsize, data_page);
    let mut fdalloc = FdAllocator::new(page_count - FILE_SLOT_PAGES, 0, 0, delmax, data_page);

    let root_slot = fdalloc.allocate(&mut bitmap, true)?;
    let root = Entry::new_dir("/".to_string(), root_slot, 0);

    let header = Header {
        label: label.to_string(),
        block_count: page_count,
        page_count,
        page_free: page_count - bitmap.popcount(),
        block_size: PAGE_SIZE as u32,
        page_size: PAGE_SIZE as u32,
        data_page,
        fd_next_page: fdalloc.fd_next_page(),
        fd_count: fdalloc.fd_count(),
        dir_count: fdalloc.dir_count(),
        mapsize,
        delmax,
        delstack: fdalloc.delstack().to_vec(),
    };

    device.write(ioc, &header.encode()?, 0, HEADER_PAGES)?;

    let bitmap_pages = (mapsize * 8).div_ceil(PAGE_SIZE);
    let mut bitmap_buf = vec![0u8; (bitmap_pages * PAGE_SIZE) as usize];
    for (i, word) in bitmap.words().iter().enumerate() {
        crate::mach::write_u64(&mut bitmap_buf[i * 8..], *word);
    }
    device.write(ioc, &bitmap_buf, MAP_PAGE_ADDR, bitmap_pages)?;

    device.write(ioc, &root.encode()?, root_slot, FILE_SLOT_PAGES)?;
    device.close()?;
    info!("formatted device: {page_count} pages, {data_page} data start, label {label:?}");
    Ok(())
}

/// Reads the header and bitmap from `device` and scans the FD area from
/// the device's top downward, reconciling every live slot into the entry
/// tree (creating ancestor stubs as needed), per `unfs_open`.
pub fn open(device: &dyn Device, ioc: &IoContext) -> Result<Mounted> {
    let mut hdr_buf = vec![0u8; (HEADER_PAGES * PAGE_SIZE) as usize];
    device.read(ioc, &mut hdr_buf, 0, HEADER_PAGES)?;
    let header = Header::decode(&hdr_buf)?;

    if header.page_count != device.page_count() {
        return Err(Error::CorruptHeader(format!(
            "header page_count {} does not match device page_count {}",
            header.page_count,
            device.page_count()
        )));
    }

    let bitmap_pages = (header.mapsize * 8).div_ceil(PAGE_SIZE);
    let mut bitmap_buf = vec![0u8; (bitmap_pages * PAGE_SIZE) as usize];
    device.read(ioc, &mut bitmap_buf, MAP_PAGE_ADDR, bitmap_pages)?;
    let words: Vec<u64> = bitmap_buf
        .chunks_exact(8)
        .take(header.mapsize as usize)
        .map(crate::mach::read_u64)
        .collect();
    let bitmap = Bitmap::from_words(words, header.data_page);

    let delcount = header.delstack.len() as u64;
    let expected_fd_next = header
        .page_count
        .checked_sub((header.fd_count + delcount + 1) * FILE_SLOT_PAGES)
        .ok_or_else(|| Error::CorruptHeader("fd_count/delstack imply a negative fd_next_page".into()))?;
    if header.fd_next_page != expected_fd_next {
        return Err(Error::CorruptHeader(format!(
            "fd_next_page {} does not match the fd_count/delcount-derived {expected_fd_next}",
            header.fd_next_page
        )));
    }

    let expected_free = header.page_count - bitmap.popcount();
    if header.page_free != expected_free {
        return Err(Error::CorruptHeader(format!(
            "header page_free {} does not match popcount-derived {expected_free}",
            header.page_free
        )));
    }

    let fdalloc = FdAllocator::new(
        header.fd_next_page,
        header.fd_count,
        header.dir_count,
        header.delmax,
        header.data_page,
    )
    .with_delstack(header.delstack.clone());

    let tree = scan_fd_area(device, ioc, &header, &fdalloc)?;
    fdalloc_sanity_check(&tree, &fdalloc)?;

    Ok(Mounted { header, bitmap, fdalloc, tree })
}

fn scan_fd_area(device: &dyn Device, ioc: &IoContext, header: &Header, fdalloc: &FdAllocator) -> Result<EntryTree> {
    let mut tree = EntryTree::new();
    let delstack: std::collections::HashSet<u64> = header.delstack.iter().copied().collect();

    let mut addr = header.page_count - FILE_SLOT_PAGES;
    let frontier = fdalloc.frontier();
    let mut found = 0u64;

    while addr >= frontier {
        if delstack.contains(&addr) {
            addr -= FILE_SLOT_PAGES;
            continue;
        }
        let mut buf = vec![0u8; (FILE_SLOT_PAGES * PAGE_SIZE) as usize];
        device.read(ioc, &mut buf, addr, FILE_SLOT_PAGES)?;
        let entry = Entry::decode(&buf)?;
        if entry.pageid != addr {
            warn!("fd scan: slot {addr} contains mismatched pageid {}", entry.pageid);
        }
        tree.ensure_ancestors(&entry.name)?;
        let name = entry.name.clone();
        tree.add(entry)?;
        found += 1;
        debug!("fd scan: recovered {name} at {addr}");
        if addr < FILE_SLOT_PAGES {
            break;
        }
        addr -= FILE_SLOT_PAGES;
    }

    let root_is_real = tree.find("/").map(|e| !e.read().expect("entry lock poisoned").is_stub()).unwrap_or(false);
    if !root_is_real {
        return Err(Error::CorruptHeader("root directory slot missing".into()));
    }

    info!("fd scan recovered {found} entries");
    Ok(tree)
}

fn fdalloc_sanity_check(tree: &EntryTree, fdalloc: &FdAllocator) -> Result<()> {
    let live = tree
        .iter()
        .filter(|e| !e.read().expect("entry lock poisoned").is_stub())
        .count() as u64;
    if live != fdalloc.fd_count() {
        return Err(Error::CorruptHeader(format!(
            "fd_count {} does not match {live} recovered entries",
            fdalloc.fd_count()
        )));
    }
    Ok(())
}

/// Re-derives the same state as [`open`] and additionally verifies every
/// bitmap bit the recovered tree implies is actually set, and that every
/// non-root entry's `parentid` names an in-range slot it's an immediate
/// child of, per `unfs_check`. Returns the mounted state on success so
/// callers (the `check` CLI subcommand) can report summary stats.
pub fn check(device: &dyn Device, ioc: &IoContext) -> Result<Mounted> {
    let mounted = open(device, ioc)?;
    let mut parent_buf = vec![0u8; (FILE_SLOT_PAGES * PAGE_SIZE) as usize];
    for entry_ref in mounted.tree.iter() {
        let entry = entry_ref.read().expect("entry lock poisoned");
        if entry.is_stub() {
            continue;
        }
        if !mounted.bitmap.is_set(entry.pageid) {
            return Err(Error::CorruptBitmap(format!(
                "entry {} at {} not marked allocated in bitmap",
                entry.name, entry.pageid
            )));
        }
        for extent in &entry.extents {
            for p in extent.pageid..extent.pageid + extent.pagecount {
                if !mounted.bitmap.is_set(p) {
                    return Err(Error::CorruptBitmap(format!(
                        "extent page {p} of {} not marked allocated in bitmap",
                        entry.name
                    )));
                }
            }
        }

        // Root has no parent to cross-check; every other live entry must
        // point at an in-range slot holding a directory it's an immediate
        // child of, per `unfs_check`.
        if entry.name != "/" {
            let parentid = entry.parentid;
            if parentid <= mounted.header.fd_next_page || parentid >= mounted.header.page_count {
                return Err(Error::CorruptHeader(format!(
                    "{} has out-of-range parentid {parentid}",
                    entry.name
                )));
            }
            device.read(ioc, &mut parent_buf, parentid, FILE_SLOT_PAGES)?;
            let parent = Entry::decode(&parent_buf)?;
            if !entry::is_immediate_child(&parent.name, &entry.name) {
                return Err(Error::CorruptHeader(format!(
                    "{} is not a child of {}",
                    entry.name, parent.name
                )));
            }
        }
    }
    Ok(mounted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileDevice;

    #[test]
    fn format_then_open_recovers_the_root_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image");
        let dev = FileDevice::create(&path, 4096).unwrap();
        let ioc = dev.ioc_alloc();

        format(&dev, &ioc, "my-image", None).unwrap();
        let mounted = open(&dev, &ioc).unwrap();

        let root = mounted.tree.find("/").unwrap();
        assert!(root.read().unwrap().isdir);
        assert_eq!(mounted.header.label, "my-image");
        assert_eq!(mounted.fdalloc.fd_count(), 1);
    }

    #[test]
    fn check_succeeds_on_a_freshly_formatted_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image");
        let dev = FileDevice::create(&path, 4096).unwrap();
        let ioc = dev.ioc_alloc();

        format(&dev, &ioc, "label", None).unwrap();
        assert!(check(&dev, &ioc).is_ok());
    }

    #[test]
    fn layout_for_rejects_a_too_small_device() {
        assert!(layout_for(2).is_err());
    }
}
