use std::sync::Arc;

use bolero::check;
use unfs::{Device, FileDevice, Filesystem};

fn main() {
    check!().with_generator(16u64..=600).for_each(|pages: &u64| {
        let pages = *pages;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image");

        let dev = FileDevice::create(&path, pages).expect("create backing file");
        Filesystem::format(&dev, "roundtrip", None).expect("format");
        drop(dev);

        let dev = Arc::new(FileDevice::open(&path).expect("reopen after format"));
        assert_eq!(dev.page_count(), pages);
        let fs = Filesystem::open_device(dev.clone()).expect("first open");
        assert!(fs.exist("/").0, "root must survive the first mount");
        fs.close_filesystem().expect("close");

        Filesystem::check_device(dev.as_ref()).expect("device must be consistent before reopen");

        let fs = Filesystem::open_device(dev).expect("second open");
        let (exists, isdir, size) = fs.exist("/");
        assert!(exists && isdir && size == 0, "root must round-trip through a second mount unchanged");
        fs.close_filesystem().expect("close");
    });
}
