use std::fs;
use std::io::SeekFrom;

use block_fs::{
    BackStore, BlockCache, FileDevice, FileKind, FileSystem, FsError, BLOCK_SIZE, STORE_BYTES,
};
use tempfile::TempDir;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn read_all<D: block_fs::BlockDevice>(fs: &mut FileSystem<D>, path: &str) -> Vec<u8> {
    let fd = fs.open(path).unwrap();
    let mut out = vec![];
    let mut buf = [0; 3000];
    loop {
        let n = fs.read(fd, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    fs.close(fd).unwrap();
    out
}

#[test]
fn backing_file_has_fixed_size() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("store.img");
    let store = BackStore::create(&image).unwrap();
    store.close().unwrap();
    assert_eq!(fs::metadata(&image).unwrap().len(), STORE_BYTES);

    assert!(matches!(BackStore::create(""), Err(FsError::InvalidName)));
    assert!(BackStore::open(dir.path().join("missing.img")).is_err());
}

#[test]
fn bitmap_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("store.img");

    let mut store = BackStore::create(&image).unwrap();
    let a = store.allocate().unwrap();
    let b = store.allocate().unwrap();
    store.write(b, &[9; BLOCK_SIZE]).unwrap();
    store.release(a);
    let free = store.free_blocks();
    store.close().unwrap();

    let store = BackStore::open(&image).unwrap();
    assert_eq!(store.free_blocks(), free);
    assert!(!store.is_allocated(a));
    let mut buf = [0; BLOCK_SIZE];
    store.read(b, &mut buf).unwrap();
    assert_eq!(buf, [9; BLOCK_SIZE]);
    assert!(matches!(store.read(a, &mut buf), Err(FsError::InvalidBlock(_))));
}

#[test]
fn end_to_end() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("fs.img");

    let mut fs = FileSystem::format(&image).unwrap();
    fs.create("/docs", FileKind::Directory).unwrap();
    fs.create("/docs/a.txt", FileKind::Regular).unwrap();
    let fd = fs.open("/docs/a.txt").unwrap();
    assert_eq!(fs.write(fd, b"hello").unwrap(), 5);
    assert_eq!(fs.seek(fd, SeekFrom::Start(0)).unwrap(), 0);
    let mut buf = [0; 5];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
    fs.close(fd).unwrap();
    fs.unmount().unwrap();

    let mut fs = FileSystem::mount(&image).unwrap();
    let listing = fs.list_directory("/docs").unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "a.txt");
    assert_eq!(listing[0].kind, FileKind::Regular);
    assert_eq!(read_all(&mut fs, "/docs/a.txt"), b"hello");
    assert_eq!(fs.stat("/docs/a.txt").unwrap().size, 5);
}

#[test]
fn large_files_through_the_cache() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("fs.img");
    // crosses into the double-indirect tier
    let big = pattern(600_000, 3);
    let small = pattern(1025, 7);

    {
        let dev = FileDevice::create(&image).unwrap();
        let mut fs = FileSystem::format_on(BlockCache::new(dev)).unwrap();
        for (path, data) in [("/big", &big), ("/small", &small)] {
            fs.create(path, FileKind::Regular).unwrap();
            let fd = fs.open(path).unwrap();
            assert_eq!(fs.write(fd, data).unwrap(), data.len());
            fs.close(fd).unwrap();
        }
        fs.unmount().unwrap();
    }

    let mut fs = FileSystem::mount(&image).unwrap();
    assert_eq!(read_all(&mut fs, "/big"), big);
    assert_eq!(read_all(&mut fs, "/small"), small);

    let free = fs.free_blocks();
    fs.remove("/big").unwrap();
    assert!(fs.free_blocks() > free + big.len() / BLOCK_SIZE);
}

#[test]
fn moved_file_keeps_content_after_remount() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("fs.img");
    let data = pattern(10_000, 1);

    let mut fs = FileSystem::format(&image).unwrap();
    fs.create("/src", FileKind::Directory).unwrap();
    fs.create("/dst", FileKind::Directory).unwrap();
    fs.create("/src/f", FileKind::Regular).unwrap();
    let fd = fs.open("/src/f").unwrap();
    fs.write(fd, &data).unwrap();
    fs.move_entry("/src/f", "/dst/renamed").unwrap();
    fs.unmount().unwrap();

    let mut fs = FileSystem::mount(&image).unwrap();
    assert!(fs.list_directory("/src").unwrap().is_empty());
    assert!(matches!(fs.open("/src/f"), Err(FsError::NotFound)));
    assert_eq!(read_all(&mut fs, "/dst/renamed"), data);
}

#[test]
fn mount_rejects_garbage() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("short.img");
    fs::write(&image, [0u8; 4096]).unwrap();
    assert!(FileSystem::mount(&image).is_err());

    let image = dir.path().join("blank.img");
    let store = BackStore::create(&image).unwrap();
    store.close().unwrap();
    // a bare store has no inode table
    assert!(matches!(FileSystem::mount(&image), Err(FsError::Corrupt(_))));
}
