use std::num::NonZeroUsize;

use lru::LruCache;

use crate::bat::{
    bitmap_get, bitmap_mask, bitmap_size, block_region_len, sectors_per_block,
    BlockAllocationTable, MAX_BITMAP_BYTES,
};
use crate::disk::ParentDisk;
use crate::dynamic_header::{DynamicHeader, DYNAMIC_HEADER_SIZE};
use crate::footer::{Footer, FOOTER_SIZE};
use crate::range_set::{ByteRange, RangeSet};
use crate::util::{align_down_u64, checked_range, write_zeroes};
use crate::{DiskError, Result, StorageBackend, VirtualDisk, SECTOR_SIZE};

const SECTOR: u64 = SECTOR_SIZE as u64;

// Bound bitmap caching when touching many blocks of a large image.
const BITMAP_CACHE_BUDGET_BYTES: u64 = 16 * 1024 * 1024; // 16 MiB

/// Whether a write had to allocate new blocks in this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    NoAllocation,
    /// `count` blocks were allocated; `first_block` is the lowest block index among them.
    Allocated { first_block: u64, count: u64 },
}

impl WriteOutcome {
    fn record(&mut self, block: u64) {
        *self = match *self {
            Self::NoAllocation => Self::Allocated {
                first_block: block,
                count: 1,
            },
            Self::Allocated { first_block, count } => Self::Allocated {
                first_block: first_block.min(block),
                count: count + 1,
            },
        };
    }
}

/// Read/write content of one dynamic or differencing layer.
///
/// Sectors whose bitmap bit is clear are served by `parent` (a [`crate::ZeroDisk`] for plain
/// dynamic disks). New blocks are appended where the trailing footer was; the footer is then
/// rewritten after the new block, immediately when auto-commit is on, otherwise on
/// [`DynamicDisk::flush`], [`DynamicDisk::close`] or drop.
pub struct DynamicDisk<'p, B: StorageBackend> {
    backend: B,
    footer: Footer,
    header: DynamicHeader,
    capacity: u64,
    bat: BlockAllocationTable,
    bitmap_size: u64,
    /// Write-through: every cached bitmap matches the file, so eviction never loses bits.
    bitmaps: LruCache<u64, Vec<u8>>,
    next_block_start: u64,
    metadata_end: u64,
    auto_commit_footer: bool,
    footer_pending: bool,
    read_only: bool,
    parent: ParentDisk<'p>,
}

impl<'p, B: StorageBackend> DynamicDisk<'p, B> {
    /// Opens the content of a layer whose footer and dynamic header are already decoded.
    ///
    /// `parent` supplies every sector this layer does not store. Whether it is dropped with
    /// this layer is decided by the [`ParentDisk`] variant.
    pub fn open(
        mut backend: B,
        footer: Footer,
        header: DynamicHeader,
        parent: ParentDisk<'p>,
    ) -> Result<Self> {
        let block_size = header.block_size;
        if block_size < SECTOR_SIZE as u32 || !block_size.is_power_of_two() {
            return Err(DiskError::InvalidDynamicHeader("block size invalid"));
        }
        if !header.table_offset.is_multiple_of(SECTOR) {
            return Err(DiskError::InvalidDynamicHeader("bat offset misaligned"));
        }
        let bitmap_size = bitmap_size(block_size);
        if bitmap_size > MAX_BITMAP_BYTES {
            return Err(DiskError::Unsupported("vhd bitmap too large"));
        }

        let cache_entries = (BITMAP_CACHE_BUDGET_BYTES / bitmap_size)
            .min(BITMAP_CACHE_BUDGET_BYTES / SECTOR)
            .max(1) as usize;
        let cache_cap =
            NonZeroUsize::new(cache_entries).ok_or(DiskError::InvalidConfig("vhd bitmap cache"))?;

        let capacity = footer.current_size;
        let required_entries = capacity.div_ceil(block_size as u64);
        if (header.max_table_entries as u64) < required_entries {
            return Err(DiskError::CorruptImage("vhd bat too small"));
        }

        let bat =
            BlockAllocationTable::read_from(&mut backend, header.table_offset, header.max_table_entries)?;

        let dyn_header_end = footer
            .data_offset
            .checked_add(DYNAMIC_HEADER_SIZE as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        let bat_end = header
            .table_offset
            .checked_add(header.bat_size_bytes())
            .ok_or(DiskError::OffsetOverflow)?;
        let metadata_end = (FOOTER_SIZE as u64).max(dyn_header_end).max(bat_end);

        let next_block_start = find_next_block_start(&mut backend)?;
        if next_block_start < metadata_end {
            return Err(DiskError::CorruptImage("vhd footer overlaps metadata"));
        }

        let read_only = backend.is_read_only();
        Ok(Self {
            backend,
            footer,
            header,
            capacity,
            bat,
            bitmap_size,
            bitmaps: LruCache::new(cache_cap),
            next_block_start,
            metadata_end,
            auto_commit_footer: true,
            footer_pending: false,
            read_only,
            parent,
        })
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn header(&self) -> &DynamicHeader {
        &self.header
    }

    pub fn bat(&self) -> &BlockAllocationTable {
        &self.bat
    }

    pub fn block_size(&self) -> u32 {
        self.header.block_size
    }

    /// File offset where the next block region will be placed.
    pub fn next_block_start(&self) -> u64 {
        self.next_block_start
    }

    pub fn parent(&self) -> &ParentDisk<'p> {
        &self.parent
    }

    pub fn auto_commit_footer(&self) -> bool {
        self.auto_commit_footer
    }

    /// Enabling auto-commit writes any pending trailing footer immediately.
    pub fn set_auto_commit_footer(&mut self, enabled: bool) -> Result<()> {
        self.auto_commit_footer = enabled;
        if enabled {
            self.commit_footer()?;
        }
        Ok(())
    }

    /// Writes the trailing footer after the last block region, if blocks were allocated since
    /// the last commit.
    pub fn commit_footer(&mut self) -> Result<()> {
        if !self.footer_pending {
            return Ok(());
        }
        self.backend
            .write_at(self.next_block_start, &self.footer.to_bytes())?;
        self.footer_pending = false;
        tracing::debug!(
            offset = self.next_block_start,
            "committed vhd trailing footer"
        );
        Ok(())
    }

    /// Commits the footer and flushes the backend, consuming the layer.
    ///
    /// An owned parent is dropped only after this layer is finished.
    pub fn close(mut self) -> Result<()> {
        self.commit_footer()?;
        self.backend.flush()
    }

    /// Copy of the sector bitmap for `block`, or `None` if it is not allocated.
    pub fn block_bitmap(&mut self, block: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.load_bitmap(block)?.map(<[u8]>::to_vec))
    }

    /// Like [`VirtualDisk::write_at`], reporting which blocks had to be allocated.
    pub fn write_at_tracked(&mut self, offset: u64, buf: &[u8]) -> Result<WriteOutcome> {
        checked_range(offset, buf.len(), self.capacity)?;
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }

        let block_size = self.header.block_size as u64;
        let mut outcome = WriteOutcome::NoAllocation;
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset
                .checked_add(pos as u64)
                .ok_or(DiskError::OffsetOverflow)?;
            let block = abs / block_size;
            let within = abs % block_size;

            let region = match self.bat.lookup(block)? {
                Some(entry) => entry,
                None => {
                    self.allocate_block(block)?;
                    outcome.record(block);
                    self.bat
                        .lookup(block)?
                        .ok_or(DiskError::CorruptImage("vhd block allocation lost"))?
                }
            };
            let data_start = (region as u64)
                .checked_mul(SECTOR)
                .and_then(|v| v.checked_add(self.bitmap_size))
                .ok_or(DiskError::OffsetOverflow)?;
            self.ensure_bitmap(block)?;

            let sector = within / SECTOR;
            let in_sector = (within % SECTOR) as usize;
            let remaining = buf.len() - pos;
            let remaining_in_block = (block_size - within) as usize;

            let written = if in_sector != 0 || remaining.min(remaining_in_block) < SECTOR_SIZE {
                let len = remaining.min(SECTOR_SIZE - in_sector);
                let mut sector_buf = [0u8; SECTOR_SIZE];
                let phys = data_start + sector * SECTOR;
                if self.sector_present(block, sector)? {
                    self.backend_read_at(phys, &mut sector_buf, "vhd block data truncated")?;
                } else {
                    self.read_parent(align_down_u64(abs, SECTOR), &mut sector_buf)?;
                }
                sector_buf[in_sector..in_sector + len].copy_from_slice(&buf[pos..pos + len]);
                self.backend.write_at(phys, &sector_buf)?;
                self.mark_present(block, sector, 1)?;
                len
            } else {
                let len = remaining.min(remaining_in_block) / SECTOR_SIZE * SECTOR_SIZE;
                self.backend
                    .write_at(data_start + within, &buf[pos..pos + len])?;
                self.mark_present(block, sector, (len / SECTOR_SIZE) as u64)?;
                len
            };
            pos += written;
        }

        Ok(outcome)
    }

    fn backend_read_at(&mut self, offset: u64, buf: &mut [u8], ctx: &'static str) -> Result<()> {
        match self.backend.read_at(offset, buf) {
            Ok(()) => Ok(()),
            Err(DiskError::OutOfBounds { .. }) => Err(DiskError::CorruptImage(ctx)),
            Err(e) => Err(e),
        }
    }

    /// Reads parent content. Bytes past the parent's capacity read as zero.
    fn read_parent(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let parent = self.parent.as_disk_mut();
        let parent_cap = parent.capacity_bytes();
        let avail = parent_cap.saturating_sub(offset).min(buf.len() as u64) as usize;
        if avail > 0 {
            parent.read_at(offset, &mut buf[..avail])?;
        }
        buf[avail..].fill(0);
        Ok(())
    }

    fn validate_block_bounds(&mut self, block_start: u64) -> Result<()> {
        // A corrupt BAT entry must not point into the footer copy, header or BAT.
        if block_start < self.metadata_end {
            return Err(DiskError::CorruptImage("vhd block overlaps metadata"));
        }
        let block_end = block_start
            .checked_add(block_region_len(self.header.block_size))
            .ok_or(DiskError::OffsetOverflow)?;
        if block_end > self.backend.len()? {
            return Err(DiskError::CorruptImage("vhd block extends beyond end of file"));
        }
        Ok(())
    }

    /// Cached bitmap for `block`, reading it on first touch. `None` if unallocated.
    fn load_bitmap(&mut self, block: u64) -> Result<Option<&[u8]>> {
        if !self.bitmaps.contains(&block) {
            let Some(entry) = self.bat.lookup(block)? else {
                return Ok(None);
            };
            let block_start = (entry as u64)
                .checked_mul(SECTOR)
                .ok_or(DiskError::OffsetOverflow)?;
            self.validate_block_bounds(block_start)?;
            let mut bitmap = vec![0u8; self.bitmap_size as usize];
            self.backend_read_at(block_start, &mut bitmap, "vhd block bitmap truncated")?;
            self.bitmaps.put(block, bitmap);
        }
        Ok(self.bitmaps.get(&block).map(Vec::as_slice))
    }

    fn ensure_bitmap(&mut self, block: u64) -> Result<()> {
        match self.load_bitmap(block)? {
            Some(_) => Ok(()),
            None => Err(DiskError::CorruptImage("vhd block not allocated")),
        }
    }

    fn sector_present(&mut self, block: u64, sector: u64) -> Result<bool> {
        match self.load_bitmap(block)? {
            Some(bitmap) => bitmap_get(bitmap, sector),
            None => Ok(false),
        }
    }

    /// Sets `count` bits starting at `first_sector` and writes back the bytes that changed.
    fn mark_present(&mut self, block: u64, first_sector: u64, count: u64) -> Result<()> {
        let entry = self
            .bat
            .lookup(block)?
            .ok_or(DiskError::CorruptImage("vhd block not allocated"))?;
        self.ensure_bitmap(block)?;
        let bitmap = self
            .bitmaps
            .get_mut(&block)
            .ok_or(DiskError::CorruptImage("vhd bitmap cache missing"))?;

        let mut dirty: Option<(usize, usize)> = None;
        for sector in first_sector..first_sector + count {
            let (byte, mask) = bitmap_mask(sector);
            let value = bitmap
                .get_mut(byte)
                .ok_or(DiskError::CorruptImage("vhd bitmap too small"))?;
            if *value & mask == 0 {
                *value |= mask;
                dirty = Some(match dirty {
                    None => (byte, byte),
                    Some((lo, hi)) => (lo.min(byte), hi.max(byte)),
                });
            }
        }

        let Some((lo, hi)) = dirty else {
            return Ok(());
        };
        let bytes = bitmap[lo..=hi].to_vec();
        let offset = entry as u64 * SECTOR + lo as u64;
        if let Err(e) = self.backend.write_at(offset, &bytes) {
            // Drop the cached copy so the next access re-reads what is actually on disk.
            self.bitmaps.pop(&block);
            return Err(e);
        }
        Ok(())
    }

    fn allocate_block(&mut self, block: u64) -> Result<()> {
        if self.bat.lookup(block)?.is_some() {
            return Err(DiskError::CorruptImage("vhd block already allocated"));
        }

        let block_start = self.next_block_start;
        let sector: u32 = (block_start / SECTOR)
            .try_into()
            .map_err(|_| DiskError::Unsupported("vhd block offset"))?;
        let region_end = block_start
            .checked_add(block_region_len(self.header.block_size))
            .ok_or(DiskError::OffsetOverflow)?;

        write_zeroes(&mut self.backend, block_start, self.bitmap_size)?;
        if self.backend.len()? < region_end {
            self.backend.set_len(region_end)?;
        }
        self.bat.write_entry(&mut self.backend, block, sector)?;

        self.next_block_start = region_end;
        self.bitmaps
            .put(block, vec![0u8; self.bitmap_size as usize]);
        self.footer_pending = true;
        tracing::debug!(block, sector, "allocated vhd block");

        if self.auto_commit_footer {
            self.commit_footer()?;
        }
        Ok(())
    }

    /// Ranges stored in this layer, starting from the sector containing `start`.
    fn layer_extents(&mut self, start: u64, end: u64) -> Result<Vec<ByteRange>> {
        let block_size = self.header.block_size as u64;
        let spb = sectors_per_block(self.header.block_size);
        let capacity = self.capacity;
        let mut out: Vec<ByteRange> = Vec::new();

        let mut pos = align_down_u64(start, SECTOR);
        while pos < end {
            let block = pos / block_size;
            let block_base = block * block_size;
            let block_end = block_base + block_size;
            let Some(bitmap) = self.load_bitmap(block)? else {
                pos = block_end;
                continue;
            };

            let first = (pos - block_base) / SECTOR;
            let last = (end.min(block_end) - block_base).div_ceil(SECTOR).min(spb);
            let mut sector = first;
            while sector < last {
                if !bitmap_get(bitmap, sector)? {
                    sector += 1;
                    continue;
                }
                let run_start = sector;
                while sector < last && bitmap_get(bitmap, sector)? {
                    sector += 1;
                }
                let r = ByteRange::new(
                    block_base + run_start * SECTOR,
                    (block_base + sector * SECTOR).min(capacity),
                );
                match out.last_mut() {
                    Some(prev) if prev.end == r.start => prev.end = r.end,
                    _ => out.push(r),
                }
            }
            pos = block_end;
        }
        Ok(out)
    }
}

/// Where the next block region goes: over the trailing footer if one is present, otherwise at
/// the (sector-rounded) end of file.
fn find_next_block_start<B: StorageBackend + ?Sized>(backend: &mut B) -> Result<u64> {
    let end = align_down_u64(backend.len()?, SECTOR);
    if end < FOOTER_SIZE as u64 {
        return Ok(end);
    }
    let mut raw = [0u8; FOOTER_SIZE];
    backend.read_at(end - FOOTER_SIZE as u64, &mut raw)?;
    let has_footer = Footer::from_bytes(&raw)?.is_valid();
    Ok(if has_footer {
        end - FOOTER_SIZE as u64
    } else {
        end
    })
}

impl<B: StorageBackend> VirtualDisk for DynamicDisk<'_, B> {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity)?;

        let block_size = self.header.block_size as u64;
        let spb = sectors_per_block(self.header.block_size);
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset
                .checked_add(pos as u64)
                .ok_or(DiskError::OffsetOverflow)?;
            let block = abs / block_size;
            let within_block = abs % block_size;
            let chunk_len = (block_size - within_block).min((buf.len() - pos) as u64) as usize;

            let Some(entry) = self.bat.lookup(block)? else {
                self.read_parent(abs, &mut buf[pos..pos + chunk_len])?;
                pos += chunk_len;
                continue;
            };
            let data_start = (entry as u64)
                .checked_mul(SECTOR)
                .and_then(|v| v.checked_add(self.bitmap_size))
                .ok_or(DiskError::OffsetOverflow)?;

            let mut within = within_block;
            let mut remaining = chunk_len;
            while remaining > 0 {
                let limit = within + remaining as u64;
                let bitmap = self
                    .load_bitmap(block)?
                    .ok_or(DiskError::CorruptImage("vhd block not allocated"))?;

                let mut sector = within / SECTOR;
                if sector >= spb {
                    return Err(DiskError::CorruptImage("vhd sector index out of range"));
                }
                let present = bitmap_get(bitmap, sector)?;
                let mut run_end = ((sector + 1) * SECTOR).min(limit);
                while run_end < limit {
                    sector += 1;
                    if sector >= spb || bitmap_get(bitmap, sector)? != present {
                        break;
                    }
                    run_end = ((sector + 1) * SECTOR).min(limit);
                }
                let run_len = (run_end - within) as usize;

                let out = &mut buf[pos..pos + run_len];
                if present {
                    self.backend_read_at(data_start + within, out, "vhd block data truncated")?;
                } else {
                    self.read_parent(block * block_size + within, out)?;
                }

                within = run_end;
                pos += run_len;
                remaining -= run_len;
            }
        }

        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.write_at_tracked(offset, buf).map(|_| ())
    }

    fn flush(&mut self) -> Result<()> {
        self.commit_footer()?;
        self.backend.flush()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn extents_in_range(&mut self, offset: u64, len: u64) -> Result<RangeSet> {
        let end = offset
            .checked_add(len)
            .ok_or(DiskError::OffsetOverflow)?
            .min(self.capacity);
        if end <= offset {
            return Ok(RangeSet::new());
        }

        let layer = RangeSet::from_ranges(self.layer_extents(offset, end)?);
        let parent = self.parent.as_disk_mut();
        let parent_end = end.min(parent.capacity_bytes());
        let below = if parent_end > offset {
            parent.extents_in_range(offset, parent_end - offset)?
        } else {
            RangeSet::new()
        };
        Ok(layer.union(&below).clip(offset, end))
    }
}

impl<B: StorageBackend> Drop for DynamicDisk<'_, B> {
    fn drop(&mut self) {
        if let Err(err) = self.commit_footer() {
            tracing::warn!("failed to commit vhd footer on drop: {err}");
        }
    }
}

impl<B: StorageBackend> std::fmt::Debug for DynamicDisk<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicDisk")
            .field("capacity", &self.capacity)
            .field("block_size", &self.header.block_size)
            .field("allocated_blocks", &self.bat.allocated_count())
            .field("next_block_start", &self.next_block_start)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}
