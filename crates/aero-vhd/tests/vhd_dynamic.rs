use std::io::{Read, Seek, SeekFrom, Write};

use aero_vhd::{
    ByteRange, DiskCursor, DiskType, DynamicDiskConfig, MemBackend, VhdImage, VirtualDisk,
    WriteOutcome, DEFAULT_BLOCK_SIZE,
};

const MIB: u64 = 1024 * 1024;

fn new_dynamic(capacity: u64, block_size: u32) -> MemBackend {
    let mut backend = MemBackend::new();
    VhdImage::create_dynamic(
        &mut backend,
        DynamicDiskConfig {
            capacity_bytes: capacity,
            block_size_bytes: block_size,
            geometry: None,
        },
    )
    .unwrap();
    backend
}

#[test]
fn write_then_read_allocates_a_single_block() {
    let mut backend = new_dynamic(64 * MIB, 2 * MIB as u32);
    let pristine_len = backend.as_slice().len();

    {
        let image = VhdImage::open(&mut backend).unwrap();
        assert_eq!(image.disk_type(), DiskType::Dynamic);
        let mut content = image.open_content(None).unwrap();

        let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let outcome = content.write_at_tracked(5 * MIB, &data).unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Allocated {
                first_block: 2,
                count: 1
            }
        );

        let mut back = vec![0u8; 1024];
        content.read_at(5 * MIB, &mut back).unwrap();
        assert_eq!(back, data);

        let mut hole = vec![0xffu8; 4096];
        content.read_at(5 * MIB + 2048, &mut hole).unwrap();
        assert!(hole.iter().all(|b| *b == 0));

        let dynamic = content.as_dynamic_mut().unwrap();
        assert_eq!(dynamic.bat().allocated_count(), 1);
        assert!(dynamic.bat().lookup(2).unwrap().is_some());

        // Sector 2048 of block 2 and its neighbour are the only bits set.
        let bitmap = dynamic.block_bitmap(2).unwrap().unwrap();
        let set_bits: u32 = bitmap.iter().map(|b| b.count_ones()).sum();
        assert_eq!(set_bits, 2);
        assert_eq!(bitmap[256], 0xc0);

        content.close().unwrap();
    }

    // One region (bitmap sector plus data) was inserted ahead of the trailing footer.
    let grown = backend.as_slice().len() - pristine_len;
    assert_eq!(grown as u64, 512 + 2 * MIB);

    let mut content = VhdImage::open(&mut backend)
        .unwrap()
        .open_content(None)
        .unwrap();
    let mut back = vec![0u8; 1024];
    content.read_at(5 * MIB, &mut back).unwrap();
    assert_eq!(back[1], 1);
    assert_eq!(back[1023], (1023 % 251) as u8);
}

#[test]
fn partial_sector_write_preserves_neighbours() {
    let mut backend = new_dynamic(8 * MIB, 64 * 1024);
    let mut content = VhdImage::open(&mut backend)
        .unwrap()
        .open_content(None)
        .unwrap();

    content.write_at(1000, &[0x11u8; 100]).unwrap();
    content.write_at(1050, &[0x22u8; 10]).unwrap();

    let mut sector = vec![0u8; 512];
    content.read_at(512, &mut sector).unwrap();
    for (i, b) in sector.iter().enumerate() {
        let offset = 512 + i as u64;
        let expected = match offset {
            1050..=1059 => 0x22,
            1000..=1099 => 0x11,
            _ => 0,
        };
        assert_eq!(*b, expected, "offset {offset}");
    }
}

#[test]
fn extents_follow_written_sectors() {
    let mut backend = new_dynamic(16 * 1024 * MIB, DEFAULT_BLOCK_SIZE);
    let mut content = VhdImage::open(&mut backend)
        .unwrap()
        .open_content(None)
        .unwrap();

    // Zero-filled writes still allocate and mark their sectors present.
    content.write_at(20 * 512, &[0u8; 4 * 512]).unwrap();

    let extents = content.extents_in_range(0, 21 * 512).unwrap();
    assert_eq!(extents.ranges(), &[ByteRange::new(20 * 512, 21 * 512)]);

    let extents = content.extents_in_range(21 * 512, 20 * 512).unwrap();
    assert_eq!(extents.ranges(), &[ByteRange::new(21 * 512, 24 * 512)]);

    let extents = content.extents_in_range(25 * 512, 4 * 512).unwrap();
    assert!(extents.is_empty());

    let extents = content.extents_in_range(21 * 512 + 10, 20 * 512).unwrap();
    assert_eq!(extents.ranges(), &[ByteRange::new(21 * 512 + 10, 24 * 512)]);

    assert_eq!(content.extents().unwrap().total_len(), 4 * 512);
}

#[test]
fn cursor_overlapping_writes() {
    let mut backend = new_dynamic(16 * 1024 * MIB, DEFAULT_BLOCK_SIZE);
    let content = VhdImage::open(&mut backend)
        .unwrap()
        .open_content(None)
        .unwrap();
    let mut cursor = DiskCursor::new(content);

    let first: Vec<u8> = (10u8..50).collect();
    let second: Vec<u8> = (50u8..100).collect();
    cursor.write_all(&first).unwrap();
    cursor.seek(SeekFrom::Start(40)).unwrap();
    cursor.write_all(&second).unwrap();

    cursor.seek(SeekFrom::Start(0)).unwrap();
    let mut back = [0u8; 100];
    cursor.read_exact(&mut back).unwrap();
    for (i, b) in back.iter().enumerate() {
        let expected = if i < 90 { 10 + i as u8 } else { 0 };
        assert_eq!(*b, expected, "byte {i}");
    }
}

#[test]
fn large_write_spans_blocks() {
    let mut backend = new_dynamic(64 * MIB, DEFAULT_BLOCK_SIZE);
    let mut content = VhdImage::open(&mut backend)
        .unwrap()
        .open_content(None)
        .unwrap();

    let data: Vec<u8> = (0..3 * MIB).map(|i| (i % 253) as u8).collect();
    let outcome = content.write_at_tracked(MIB, &data).unwrap();
    assert_eq!(
        outcome,
        WriteOutcome::Allocated {
            first_block: 0,
            count: 2
        }
    );

    // Rewriting the same range allocates nothing new.
    let outcome = content.write_at_tracked(MIB, &data[..4096]).unwrap();
    assert_eq!(outcome, WriteOutcome::NoAllocation);

    let mut back = vec![0u8; data.len()];
    content.read_at(MIB, &mut back).unwrap();
    assert!(back == data);
}

#[test]
fn reads_of_unwritten_space_are_zero_and_out_of_range_fails() {
    let mut backend = new_dynamic(4 * MIB, 64 * 1024);
    let mut content = VhdImage::open(&mut backend)
        .unwrap()
        .open_content(None)
        .unwrap();

    let mut buf = vec![0x55u8; 100];
    content.read_at(4 * MIB - 100, &mut buf).unwrap();
    assert!(buf.iter().all(|b| *b == 0));

    assert!(content.read_at(4 * MIB - 50, &mut buf).is_err());
    assert!(content.write_at(4 * MIB, &[1]).is_err());
}

#[test]
fn read_only_backend_rejects_writes() {
    let backend = new_dynamic(4 * MIB, 64 * 1024).with_read_only(true);
    let image = VhdImage::open(backend).unwrap();
    assert!(image.is_read_only());
    let mut content = image.open_content(None).unwrap();
    assert!(content.is_read_only());
    assert!(content.write_at(0, &[1u8; 512]).is_err());
}
