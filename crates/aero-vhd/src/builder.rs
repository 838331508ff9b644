use serde::Serialize;
use uuid::Uuid;

use crate::bat::{bitmap_set, bitmap_size, block_region_len, BlockAllocationTable};
use crate::dynamic_header::{DynamicHeader, DYNAMIC_HEADER_SIZE};
use crate::footer::{DiskType, Footer, FOOTER_SIZE};
use crate::geometry::Geometry;
use crate::image::DynamicDiskConfig;
use crate::range_set::RangeSet;
use crate::util::{align_down_u64, align_up_u64};
use crate::{DiskError, Result, StorageBackend, VirtualDisk, SECTOR_SIZE};

const SECTOR: u64 = SECTOR_SIZE as u64;
const HEADER_OFFSET: u64 = FOOTER_SIZE as u64;
const TABLE_OFFSET: u64 = HEADER_OFFSET + DYNAMIC_HEADER_SIZE as u64;

/// What [`DynamicDiskBuilder::build`] wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    pub capacity_bytes: u64,
    pub block_size: u32,
    pub blocks_allocated: u64,
    /// Bytes of source data marked present in block bitmaps.
    pub bytes_present: u64,
    pub file_len: u64,
    pub unique_id: Uuid,
}

/// Serializes a sparse logical stream into a new dynamic image.
///
/// Only blocks that intersect the source's extent set are allocated, and only the sectors
/// covering those extents are marked present; everything else reads back as zero.
#[derive(Debug, Clone)]
pub struct DynamicDiskBuilder {
    config: DynamicDiskConfig,
}

impl DynamicDiskBuilder {
    pub fn new(config: DynamicDiskConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Builder sized to `source`, with the default block size.
    pub fn for_source<S: VirtualDisk + ?Sized>(source: &S) -> Result<Self> {
        Self::new(DynamicDiskConfig::new(source.capacity_bytes()))
    }

    pub fn block_size(mut self, block_size_bytes: u32) -> Result<Self> {
        self.config.block_size_bytes = block_size_bytes;
        self.config.validate()?;
        Ok(self)
    }

    pub fn geometry(mut self, geometry: Geometry) -> Self {
        self.config.geometry = Some(geometry);
        self
    }

    pub fn config(&self) -> &DynamicDiskConfig {
        &self.config
    }

    /// Writes the image to `target`, replacing whatever it held.
    ///
    /// Source content past `capacity_bytes` is ignored.
    pub fn build<S, B>(&self, source: &mut S, mut target: B) -> Result<BuildSummary>
    where
        S: VirtualDisk + ?Sized,
        B: StorageBackend,
    {
        let capacity = self.config.capacity_bytes;
        let block_size = self.config.block_size_bytes;
        let geometry = self
            .config
            .geometry
            .unwrap_or_else(|| Geometry::from_capacity(capacity));

        let mut footer = Footer::new(geometry, capacity, DiskType::Dynamic);
        footer.data_offset = HEADER_OFFSET;
        footer.update_checksum();
        let header = DynamicHeader::new(TABLE_OFFSET, block_size, capacity)?;
        let mut bat = BlockAllocationTable::new_unallocated(TABLE_OFFSET, header.max_table_entries)?;

        let source_end = capacity.min(source.capacity_bytes());
        let extents = source.extents_in_range(0, source_end)?;

        target.set_len(0)?;
        target.write_at(0, &footer.to_bytes())?;
        target.write_at(HEADER_OFFSET, &header.to_bytes())?;
        target.write_at(TABLE_OFFSET, &bat.to_bytes())?;

        let bs = block_size as u64;
        let bitmap_len = bitmap_size(block_size);
        let mut next = TABLE_OFFSET
            .checked_add(header.bat_size_bytes())
            .ok_or(DiskError::OffsetOverflow)?;
        let mut bitmap = vec![0u8; bitmap_len as usize];
        let mut data = Vec::new();
        let mut blocks_allocated = 0u64;
        let mut bytes_present = 0u64;

        for block in 0..header.max_table_entries as u64 {
            let block_start = block * bs;
            let block_end = (block_start + bs).min(capacity);
            let present = extents.clip(block_start, block_end);
            if present.is_empty() {
                continue;
            }

            if data.is_empty() {
                data = vec![0u8; block_size as usize];
            } else {
                data.fill(0);
            }
            bitmap.fill(0);

            for range in sector_ranges(&present, block_end)?.ranges() {
                let first = (range.start - block_start) / SECTOR;
                let last = (range.end - block_start).div_ceil(SECTOR);
                for sector in first..last {
                    bitmap_set(&mut bitmap, sector)?;
                }
                bytes_present += range.len();

                let read_end = range.end.min(source_end);
                if read_end > range.start {
                    let lo = (range.start - block_start) as usize;
                    let hi = (read_end - block_start) as usize;
                    source.read_at(range.start, &mut data[lo..hi])?;
                }
            }

            let sector: u32 = (next / SECTOR)
                .try_into()
                .map_err(|_| DiskError::Unsupported("vhd block offset"))?;
            target.write_at(next, &bitmap)?;
            target.write_at(next + bitmap_len, &data)?;
            bat.set(block, sector)?;
            tracing::trace!(block, sector, "built vhd block");

            next = next
                .checked_add(block_region_len(block_size))
                .ok_or(DiskError::OffsetOverflow)?;
            blocks_allocated += 1;
        }

        target.write_at(TABLE_OFFSET, &bat.to_bytes())?;
        target.write_at(next, &footer.to_bytes())?;
        target.flush()?;

        let file_len = next + FOOTER_SIZE as u64;
        tracing::debug!(
            capacity,
            block_size,
            blocks_allocated,
            file_len,
            "built dynamic vhd image"
        );
        Ok(BuildSummary {
            capacity_bytes: capacity,
            block_size,
            blocks_allocated,
            bytes_present,
            file_len,
            unique_id: footer.unique_id,
        })
    }
}

/// `present` widened to whole sectors, clamped to `limit`.
fn sector_ranges(present: &RangeSet, limit: u64) -> Result<RangeSet> {
    let mut out = RangeSet::new();
    for r in present.ranges() {
        let start = align_down_u64(r.start, SECTOR);
        let end = align_up_u64(r.end, SECTOR)?.min(limit);
        out.insert(start, end);
    }
    Ok(out)
}
