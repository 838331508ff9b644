#![cfg(not(target_arch = "wasm32"))]

use aero_vhd::{
    bat, Disk, DynamicDiskConfig, FileChecker, MemBackend, Severity, StdFileBackend,
    StorageBackend, VhdImage, VirtualDisk,
};

const MIB: u64 = 1024 * 1024;
const BLOCK: u32 = 512 * 1024;
const TABLE_OFFSET: u64 = 1536;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn dynamic_with_two_blocks() -> MemBackend {
    let mut backend = MemBackend::new();
    let mut content = VhdImage::create_dynamic(
        &mut backend,
        DynamicDiskConfig {
            capacity_bytes: 4 * MIB,
            block_size_bytes: BLOCK,
            geometry: None,
        },
    )
    .unwrap()
    .open_content(None)
    .unwrap();
    content.write_at(0, &[1u8; 512]).unwrap();
    content.write_at(BLOCK as u64, &[2u8; 512]).unwrap();
    content.close().unwrap();
    backend
}

fn bat_entry(backend: &mut MemBackend, block: u64) -> u32 {
    let mut raw = [0u8; 4];
    backend.read_at(TABLE_OFFSET + block * 4, &mut raw).unwrap();
    u32::from_be_bytes(raw)
}

#[test]
fn chain_files_on_disk_pass() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base.vhd");
    let child = dir.path().join("child.vhd");

    let mut disk = Disk::create_dynamic(&base, DynamicDiskConfig::new(16 * MIB)).unwrap();
    disk.write_at(MIB, &[9u8; 4096]).unwrap();
    disk.close().unwrap();
    let mut disk = Disk::create_differencing(&child, &base).unwrap();
    disk.write_at(3 * MIB, &[8u8; 512]).unwrap();
    disk.close().unwrap();

    for path in [&base, &child] {
        let report = FileChecker::new(StdFileBackend::open_read_only(path).unwrap())
            .check()
            .unwrap();
        assert!(report.passed(), "{}: {report}", path.display());
    }
}

#[test]
fn overlapping_block_regions_are_reported() {
    init_tracing();
    let mut backend = dynamic_with_two_blocks();
    let first = bat_entry(&mut backend, 0);
    backend
        .write_at(TABLE_OFFSET + 4, &first.to_be_bytes())
        .unwrap();

    let report = FileChecker::new(&mut backend).check().unwrap();
    assert!(!report.passed());
    assert!(report.errors().count() >= 1, "{report}");
}

#[test]
fn region_past_end_of_file_is_reported() {
    init_tracing();
    let mut backend = dynamic_with_two_blocks();
    let len = backend.len().unwrap();
    let beyond = (len / 512 + 16) as u32;
    backend
        .write_at(TABLE_OFFSET + 2 * 4, &beyond.to_be_bytes())
        .unwrap();

    let report = FileChecker::new(&mut backend).check().unwrap();
    assert!(report.has(Severity::Error), "{report}");
}

#[test]
fn damaged_leading_footer_is_reported() {
    init_tracing();
    let mut backend = dynamic_with_two_blocks();
    backend.write_at(70, &[0xffu8; 4]).unwrap();

    let report = FileChecker::new(&mut backend).check().unwrap();
    assert!(report.has(Severity::Error), "{report}");

    // The trailing footer still opens the image.
    let mut content = VhdImage::open(&mut backend)
        .unwrap()
        .open_content(None)
        .unwrap();
    let mut buf = [0u8; 512];
    content.read_at(BLOCK as u64, &mut buf).unwrap();
    assert!(buf.iter().all(|b| *b == 2));
}

#[test]
fn bat_helpers_agree_with_written_layout() {
    let mut backend = dynamic_with_two_blocks();
    let first = bat_entry(&mut backend, 0);
    let second = bat_entry(&mut backend, 1);
    assert_eq!(
        bat::block_region_start(second) - bat::block_region_start(first),
        bat::block_region_len(BLOCK)
    );

    let mut data = [0u8; 512];
    backend
        .read_at(bat::block_data_start(second, BLOCK), &mut data)
        .unwrap();
    assert!(data.iter().all(|b| *b == 2));
}
