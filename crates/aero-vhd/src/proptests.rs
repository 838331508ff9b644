use std::cell::RefCell;
use std::rc::Rc;
use std::time::SystemTime;

use crate::{
    ByteRange, Disk, DynamicDiskConfig, FixedDiskConfig, MemBackend, ParentLocations, RangeSet,
    Result, StorageBackend, VhdContent, VhdImage, VirtualDisk, SECTOR_SIZE,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

#[derive(Debug, Clone)]
enum Op {
    Write { offset: u32, data: Vec<u8> },
    Read { offset: u32, len: usize },
    Flush,
    Reopen,
}

const MAX_DISK_SIZE: u32 = 1024 * 1024; // 1 MiB
const MAX_OPS: usize = 48;
const MAX_RW_LEN: usize = 8 * 1024;

const SECTOR_SIZE_U32: u32 = SECTOR_SIZE as u32;
const MAX_DISK_SECTORS: u32 = MAX_DISK_SIZE / SECTOR_SIZE_U32;

/// One image file that survives closing and reopening the layers on top of it.
#[derive(Clone, Default)]
struct SharedBackend(Rc<RefCell<MemBackend>>);

impl StorageBackend for SharedBackend {
    fn len(&mut self) -> Result<u64> {
        self.0.borrow_mut().len()
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.0.borrow_mut().set_len(len)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.0.borrow_mut().read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.0.borrow_mut().write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.0.borrow_mut().flush()
    }
}

fn disk_size_strategy() -> impl Strategy<Value = u32> {
    (1u32..=MAX_DISK_SECTORS).prop_map(|sectors| sectors * SECTOR_SIZE_U32)
}

fn block_size_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![
        Just(512u32),
        Just(1024u32),
        Just(4096u32),
        Just(16 * 1024u32),
    ]
}

fn offset_strategy(disk_size: u32) -> BoxedStrategy<u32> {
    let max_offset = disk_size;

    let any = 0u32..=max_offset;
    let sector_aligned =
        (0u32..=max_offset / SECTOR_SIZE_U32).prop_map(|lba| lba * SECTOR_SIZE_U32);
    let sector_boundary_plus_delta = (0u32..=max_offset / SECTOR_SIZE_U32, 0u32..SECTOR_SIZE_U32)
        .prop_map(move |(lba, delta)| {
            let off = lba * SECTOR_SIZE_U32 + delta;
            off.min(max_offset)
        });
    let block_aligned = (0u32..=max_offset / 4096).prop_map(|blk| blk * 4096);
    let near_end =
        (0u32..=SECTOR_SIZE_U32).prop_map(move |delta| max_offset.saturating_sub(delta));

    prop_oneof![
        4 => any,
        2 => sector_aligned,
        2 => sector_boundary_plus_delta,
        2 => block_aligned,
        1 => near_end,
    ]
    .boxed()
}

fn write_op_strategy(disk_size: u32) -> BoxedStrategy<Op> {
    offset_strategy(disk_size)
        .prop_flat_map(move |offset| {
            let remaining = disk_size - offset;
            let max_len = (remaining as usize).min(MAX_RW_LEN);
            (Just(offset), prop::collection::vec(any::<u8>(), 0..=max_len))
        })
        .prop_map(|(offset, data)| Op::Write { offset, data })
        .boxed()
}

fn read_op_strategy(disk_size: u32) -> BoxedStrategy<Op> {
    offset_strategy(disk_size)
        .prop_flat_map(move |offset| {
            let remaining = disk_size - offset;
            let max_len = (remaining as usize).min(MAX_RW_LEN);
            (Just(offset), 0usize..=max_len)
        })
        .prop_map(|(offset, len)| Op::Read { offset, len })
        .boxed()
}

fn op_strategy(disk_size: u32) -> BoxedStrategy<Op> {
    prop_oneof![
        5 => write_op_strategy(disk_size),
        4 => read_op_strategy(disk_size),
        1 => Just(Op::Flush),
        1 => Just(Op::Reopen),
    ]
    .boxed()
}

fn ops_strategy(disk_size: u32) -> BoxedStrategy<Vec<Op>> {
    prop::collection::vec(op_strategy(disk_size), 1..=MAX_OPS).boxed()
}

fn fixed_scenario_strategy() -> BoxedStrategy<(u32, Vec<Op>)> {
    disk_size_strategy()
        .prop_flat_map(|disk_size| (Just(disk_size), ops_strategy(disk_size)))
        .boxed()
}

fn dynamic_scenario_strategy() -> BoxedStrategy<(u32, u32, Vec<Op>)> {
    (disk_size_strategy(), block_size_strategy())
        .prop_flat_map(|(disk_size, block_size)| {
            (Just(disk_size), Just(block_size), ops_strategy(disk_size))
        })
        .boxed()
}

fn differencing_scenario_strategy() -> BoxedStrategy<(u32, u32, u8, Vec<Op>)> {
    (disk_size_strategy(), block_size_strategy(), any::<u8>())
        .prop_flat_map(|(disk_size, block_size, seed)| {
            (Just(disk_size), Just(block_size), Just(seed), ops_strategy(disk_size))
        })
        .boxed()
}

fn ranges_strategy() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((0u64..256, 0u64..64).prop_map(|(s, l)| (s, s + l)), 0..12)
}

fn run_ops<D, Reopen>(
    mut disk: D,
    mut model: Vec<u8>,
    ops: &[Op],
    mut reopen: Reopen,
) -> TestCaseResult
where
    D: VirtualDisk,
    Reopen: FnMut(D) -> D,
{
    let capacity = disk.capacity_bytes() as usize;
    prop_assert_eq!(capacity, model.len());

    for op in ops {
        match op {
            Op::Write { offset, data } => {
                let offset = *offset as usize;
                disk.write_at(offset as u64, data).unwrap();
                model[offset..offset + data.len()].copy_from_slice(data);

                let mut read_back = vec![0xA5u8; data.len()];
                disk.read_at(offset as u64, &mut read_back).unwrap();
                prop_assert_eq!(read_back.as_slice(), data.as_slice());
            }
            Op::Read { offset, len } => {
                let offset = *offset as usize;
                let len = *len;
                let mut buf = vec![0xA5u8; len];
                disk.read_at(offset as u64, &mut buf).unwrap();
                prop_assert_eq!(buf.as_slice(), &model[offset..offset + len]);
            }
            Op::Flush => {
                disk.flush().unwrap();
            }
            Op::Reopen => {
                disk.flush().unwrap();
                disk = reopen(disk);
                prop_assert_eq!(disk.capacity_bytes() as usize, capacity);
            }
        }
    }

    disk.flush().unwrap();
    disk = reopen(disk);
    prop_assert_eq!(disk.capacity_bytes() as usize, capacity);

    let mut all = vec![0u8; capacity];
    disk.read_at(0, &mut all).unwrap();
    prop_assert_eq!(all.as_slice(), model.as_slice());

    Ok(())
}

fn make_base_pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

fn dynamic_config(disk_size: u32, block_size: u32) -> DynamicDiskConfig {
    DynamicDiskConfig {
        capacity_bytes: disk_size as u64,
        block_size_bytes: block_size,
        geometry: None,
    }
}

fn open_layer(file: &SharedBackend) -> VhdContent<'static, SharedBackend> {
    VhdImage::open(file.clone())
        .unwrap()
        .open_content(None)
        .unwrap()
}

fn open_chain(child: &SharedBackend, parent: &SharedBackend) -> Disk<SharedBackend> {
    Disk::from_images(vec![
        VhdImage::open(child.clone()).unwrap(),
        VhdImage::open(parent.clone()).unwrap(),
    ])
    .unwrap()
}

/// Sector-granular set of bytes touched by the writes in `ops`.
fn written_sectors(ops: &[Op]) -> RangeSet {
    let mut set = RangeSet::new();
    for op in ops {
        if let Op::Write { offset, data } = op {
            if data.is_empty() {
                continue;
            }
            let start = (*offset as u64 / 512) * 512;
            let end = (*offset as u64 + data.len() as u64).div_ceil(512) * 512;
            set.insert(start, end);
        }
    }
    set
}

fn to_bits(ranges: &[(u64, u64)]) -> Vec<bool> {
    let mut bits = vec![false; 320];
    for (s, e) in ranges {
        for b in &mut bits[*s as usize..*e as usize] {
            *b = true;
        }
    }
    bits
}

fn set_bits(set: &RangeSet) -> Vec<bool> {
    to_bits(
        &set.ranges()
            .iter()
            .map(|r| (r.start, r.end))
            .collect::<Vec<_>>(),
    )
}

fn is_normalized(set: &RangeSet) -> bool {
    set.ranges().iter().all(|r| !r.is_empty())
        && set.ranges().windows(2).all(|w| w[0].end < w[1].start)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_fixed_disk_matches_reference((disk_size, ops) in fixed_scenario_strategy()) {
        let file = SharedBackend::default();
        VhdImage::create_fixed(file.clone(), FixedDiskConfig::new(disk_size as u64)).unwrap();
        let disk = open_layer(&file);
        let model = vec![0u8; disk_size as usize];

        run_ops(disk, model, &ops, |disk| {
            drop(disk);
            open_layer(&file)
        })?;
    }

    #[test]
    fn prop_dynamic_disk_matches_reference((disk_size, block_size, ops) in dynamic_scenario_strategy()) {
        let file = SharedBackend::default();
        VhdImage::create_dynamic(file.clone(), dynamic_config(disk_size, block_size)).unwrap();
        let disk = open_layer(&file);
        let model = vec![0u8; disk_size as usize];

        run_ops(disk, model, &ops, |disk| {
            drop(disk);
            open_layer(&file)
        })?;
    }

    #[test]
    fn prop_dynamic_extents_are_written_sectors((disk_size, block_size, ops) in dynamic_scenario_strategy()) {
        let file = SharedBackend::default();
        VhdImage::create_dynamic(file.clone(), dynamic_config(disk_size, block_size)).unwrap();
        let mut disk = open_layer(&file);
        for op in &ops {
            if let Op::Write { offset, data } = op {
                disk.write_at(*offset as u64, data).unwrap();
            }
        }
        prop_assert_eq!(disk.extents().unwrap(), written_sectors(&ops));
    }

    #[test]
    fn prop_differencing_disk_matches_reference((disk_size, block_size, seed, ops) in differencing_scenario_strategy()) {
        let parent_file = SharedBackend::default();
        let parent = VhdImage::create_dynamic(parent_file.clone(), dynamic_config(disk_size, block_size)).unwrap();
        let model = make_base_pattern(disk_size as usize, seed);

        let child_file = SharedBackend::default();
        VhdImage::create_differencing(
            child_file.clone(),
            &parent,
            &ParentLocations {
                absolute_path: "/images/parent.vhd".into(),
                relative_path: "parent.vhd".into(),
                modified: SystemTime::now(),
            },
        )
        .unwrap();

        let mut parent_content = parent.open_content(None).unwrap();
        parent_content.write_at(0, &model).unwrap();
        parent_content.close().unwrap();
        let parent_bytes = parent_file.0.borrow().as_slice().to_vec();

        let disk = open_chain(&child_file, &parent_file);
        run_ops(disk, model, &ops, |disk| {
            drop(disk);
            open_chain(&child_file, &parent_file)
        })?;

        // The chain never writes below the leaf.
        let after = parent_file.0.borrow();
        prop_assert_eq!(after.as_slice(), parent_bytes.as_slice());
    }

    #[test]
    fn prop_range_set_algebra_matches_bitmap(a in ranges_strategy(), b in ranges_strategy()) {
        let sa = RangeSet::from_ranges(a.iter().map(|(s, e)| ByteRange::new(*s, *e)));
        let sb = RangeSet::from_ranges(b.iter().map(|(s, e)| ByteRange::new(*s, *e)));
        let (ba, bb) = (to_bits(&a), to_bits(&b));

        let union = sa.union(&sb);
        let inter = sa.intersect(&sb);
        prop_assert!(is_normalized(&union));
        prop_assert!(is_normalized(&inter));

        let expect_union: Vec<bool> = ba.iter().zip(&bb).map(|(x, y)| *x || *y).collect();
        let expect_inter: Vec<bool> = ba.iter().zip(&bb).map(|(x, y)| *x && *y).collect();
        prop_assert_eq!(set_bits(&union), expect_union);
        prop_assert_eq!(set_bits(&inter), expect_inter);

        let clipped = sa.clip(40, 200);
        let expect_clip: Vec<bool> = ba
            .iter()
            .enumerate()
            .map(|(i, x)| *x && (40..200).contains(&i))
            .collect();
        prop_assert_eq!(set_bits(&clipped), expect_clip);
    }
}
