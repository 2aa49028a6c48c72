use std::sync::Arc;

use unfs::layout::{MAX_EXTENTS, PAGE_SIZE};
use unfs::{Device, FileDevice, Filesystem, OpenMode};

fn main() {
    scenario_1_format_a_1gib_device();
    scenario_2_mkparents_builds_the_whole_chain();
    scenario_3_write_then_read_then_checksum();
    scenario_4_fragmentation_forces_a_merge();
    scenario_5_deletion_stack_full_triggers_relocation();
    scenario_6_rename_moves_child_count_between_directories();
}

fn new_device(page_count: u64) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("image");
    FileDevice::create(&path, page_count).expect("create backing file");
    (dir, path)
}

fn scenario_1_format_a_1gib_device() {
    let (_dir, path) = new_device(262144);
    let dev = FileDevice::open(&path).unwrap();
    Filesystem::format(&dev, "", None).unwrap();
    drop(dev);

    let dev = Arc::new(FileDevice::open(&path).unwrap());
    Filesystem::check_device(dev.as_ref()).expect("a freshly formatted 1 GiB device must check out");

    let fs = Filesystem::open_device(dev).unwrap();
    let (exists, isdir, _) = fs.exist("/");
    assert!(exists && isdir);
    fs.close_filesystem().unwrap();
}

fn scenario_2_mkparents_builds_the_whole_chain() {
    let (_dir, path) = new_device(4096);
    let dev = FileDevice::open(&path).unwrap();
    Filesystem::format(&dev, "", None).unwrap();
    let fs = Filesystem::open_device(Arc::new(dev)).unwrap();

    fs.create("/a/b/c", false, true).unwrap();
    assert_eq!(fs.exist("/").2, 1);
    assert_eq!(fs.exist("/a").2, 1);
    assert_eq!(fs.exist("/a/b").2, 1);
    let (exists, isdir, size) = fs.exist("/a/b/c");
    assert!(exists && !isdir && size == 0);

    fs.close_filesystem().unwrap();
}

fn scenario_3_write_then_read_then_checksum() {
    let (_dir, path) = new_device(4096);
    let dev = FileDevice::open(&path).unwrap();
    Filesystem::format(&dev, "", None).unwrap();
    let fs = Filesystem::open_device(Arc::new(dev)).unwrap();

    let fd = fs.open("/f", OpenMode { create: true, ..Default::default() }).unwrap();
    let payload = b"hello, world!";
    fs.write(&fd, payload, 0, payload.len() as u64).unwrap();

    let stat = fs.stat(&fd).unwrap();
    assert_eq!(stat.size, payload.len() as u64);
    assert_eq!(stat.extents.len(), 1);
    assert_eq!(stat.extents[0].pagecount, 1);

    let mut back = vec![0u8; payload.len()];
    fs.read(&fd, &mut back, 0, payload.len() as u64).unwrap();
    assert_eq!(&back, payload);

    let mut expect_page = vec![0u8; PAGE_SIZE as usize];
    expect_page[..payload.len()].copy_from_slice(payload);
    let expected_checksum = rolling_checksum(&expect_page[..payload.len()]);
    assert_eq!(fs.checksum(&fd).unwrap(), expected_checksum);

    fs.close(fd).unwrap();
    fs.close_filesystem().unwrap();
}

/// Replicates the defined rolling checksum independently of `extent::checksum`,
/// for cross-checking: `sum += (remaining_size << 32) | byte`, counting down.
fn rolling_checksum(bytes: &[u8]) -> u64 {
    let mut sum = 0u64;
    let mut remaining = bytes.len() as u64;
    for &b in bytes {
        sum = sum.wrapping_add((remaining << 32) | b as u64);
        remaining -= 1;
    }
    sum
}

fn scenario_4_fragmentation_forces_a_merge() {
    let (_dir, path) = new_device(16384);
    let dev = FileDevice::open(&path).unwrap();
    Filesystem::format(&dev, "", None).unwrap();
    let fs = Filesystem::open_device(Arc::new(dev)).unwrap();

    let target = fs.open("/target", OpenMode { create: true, ..Default::default() }).unwrap();
    let page = vec![0x42u8; PAGE_SIZE as usize];
    let mut mirror: Vec<u8> = Vec::new();

    fs.write(&target, &page, 0, page.len() as u64).unwrap();
    mirror.extend_from_slice(&page);

    // Interleave a one-page decoy allocation before every further growth of
    // `target`, so the bitmap's lowest-address-first allocator can never
    // extend target's last extent in place; every growth becomes its own
    // extent until MAX_EXTENTS forces a merge-compact.
    for i in 0..MAX_EXTENTS {
        let decoy = fs.create(&format!("/decoy{i}"), false, false);
        decoy.unwrap();
        let decoy_fd = fs.open(&format!("/decoy{i}"), OpenMode::default()).unwrap();
        fs.write(&decoy_fd, &page, 0, page.len() as u64).unwrap();
        fs.close(decoy_fd).unwrap();

        let off = mirror.len() as u64;
        fs.write(&target, &page, off, page.len() as u64).unwrap();
        mirror.extend_from_slice(&page);
    }

    let stat = fs.stat(&target).unwrap();
    assert_eq!(stat.size, mirror.len() as u64);
    assert!(
        (stat.extents.len() as u64) < MAX_EXTENTS,
        "a merge-compact must have collapsed the extent list well below MAX_EXTENTS, got {}",
        stat.extents.len()
    );

    let mut readback = vec![0u8; mirror.len()];
    fs.read(&target, &mut readback, 0, mirror.len() as u64).unwrap();
    assert_eq!(readback, mirror, "post-merge contents must match the pre-merge bytes exactly");
    assert_eq!(fs.checksum(&target).unwrap(), rolling_checksum(&mirror));

    fs.close(target).unwrap();
    fs.close_filesystem().unwrap();
}

fn scenario_5_deletion_stack_full_triggers_relocation() {
    let (_dir, path) = new_device(4096);
    let dev = FileDevice::open(&path).unwrap();
    Filesystem::format(&dev, "", Some(3)).unwrap();
    let fs = Filesystem::open_device(Arc::new(dev)).unwrap();

    let names: Vec<String> = (0..10).map(|i| format!("/f{i}")).collect();
    for (i, name) in names.iter().enumerate() {
        let fd = fs.open(name, OpenMode { create: true, ..Default::default() }).unwrap();
        let content = format!("content-{i}").into_bytes();
        fs.write(&fd, &content, 0, content.len() as u64).unwrap();
        fs.close(fd).unwrap();
    }

    // f9 was allocated last, so its slot sits at the current frontier.
    // Removing f1, f2, f3 fills a delmax=3 deletion stack with interior
    // holes that are not the frontier.
    fs.remove("/f1", false).unwrap();
    fs.remove("/f2", false).unwrap();
    fs.remove("/f3", false).unwrap();

    // The stack is now full; removing another interior slot must relocate
    // whichever entry sits at the frontier into the freed slot.
    fs.remove("/f4", false).unwrap();

    fs.close_filesystem().unwrap();

    let dev = Arc::new(FileDevice::open(&path).unwrap());
    Filesystem::check_device(dev.as_ref()).expect("device must remain consistent after relocation");
    let fs = Filesystem::open_device(dev).unwrap();

    let surviving: Vec<&String> = names
        .iter()
        .filter(|n| !["/f1", "/f2", "/f3", "/f4"].contains(&n.as_str()))
        .collect();
    for (i, name) in names.iter().enumerate() {
        let should_exist = surviving.contains(&name);
        assert_eq!(fs.exist(name).0, should_exist, "{name} existence mismatch after reopen");
        if should_exist {
            let fd = fs.open(name, OpenMode::default()).unwrap();
            let expected = format!("content-{i}").into_bytes();
            let mut buf = vec![0u8; expected.len()];
            fs.read(&fd, &mut buf, 0, expected.len() as u64).unwrap();
            assert_eq!(buf, expected, "{name} lost its contents across relocation + reopen");
            fs.close(fd).unwrap();
        }
    }
    fs.close_filesystem().unwrap();
}

fn scenario_6_rename_moves_child_count_between_directories() {
    let (_dir, path) = new_device(4096);
    let dev = FileDevice::open(&path).unwrap();
    Filesystem::format(&dev, "", None).unwrap();
    let fs = Filesystem::open_device(Arc::new(dev)).unwrap();

    fs.create("/d1", true, false).unwrap();
    fs.create("/d2", true, false).unwrap();
    fs.create("/d1/x", false, false).unwrap();
    assert_eq!(fs.exist("/d1").2, 1);
    assert_eq!(fs.exist("/d2").2, 0);

    fs.rename("/d1/x", "/d2/x", false).unwrap();

    assert_eq!(fs.exist("/d1").2, 0, "/d1's child count must drop by one");
    assert_eq!(fs.exist("/d2").2, 1, "/d2's child count must rise by one");
    assert!(!fs.dir_list("/d1").unwrap().iter().any(|e| e.name == "/d1/x"));
    assert!(fs.dir_list("/d2").unwrap().iter().any(|e| e.name == "/d2/x"));

    fs.close_filesystem().unwrap();
}
