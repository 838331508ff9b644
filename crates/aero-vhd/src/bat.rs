//! Block allocation table and per-block bitmap addressing.
//!
//! Everything here is pure arithmetic over the header parameters, except
//! [`BlockAllocationTable::read_from`] / [`BlockAllocationTable::write_entry`].

use crate::util::{align_up_u64, be_u32};
use crate::{DiskError, Result, StorageBackend, SECTOR_SIZE};

/// BAT value for a block that was never allocated.
pub const UNALLOCATED: u32 = 0xFFFF_FFFF;

// Hard caps to avoid absurd allocations from untrusted images.
pub const MAX_BAT_BYTES: u64 = 128 * 1024 * 1024; // 128 MiB
pub const MAX_BITMAP_BYTES: u64 = 32 * 1024 * 1024; // 32 MiB

const SECTOR: u64 = SECTOR_SIZE as u64;

pub fn block_of(offset: u64, block_size: u32) -> u64 {
    offset / block_size as u64
}

pub fn sector_in_block(offset: u64, block_size: u32) -> u64 {
    (offset % block_size as u64) / SECTOR
}

pub fn sectors_per_block(block_size: u32) -> u64 {
    (block_size as u64).div_ceil(SECTOR)
}

/// Bitmap bytes in front of each block: one bit per sector, padded to a whole sector.
pub fn bitmap_size(block_size: u32) -> u64 {
    let bytes = sectors_per_block(block_size).div_ceil(8);
    bytes.div_ceil(SECTOR) * SECTOR
}

pub fn block_region_start(bat_entry: u32) -> u64 {
    bat_entry as u64 * SECTOR
}

pub fn block_data_start(bat_entry: u32, block_size: u32) -> u64 {
    block_region_start(bat_entry) + bitmap_size(block_size)
}

/// Bitmap followed by block data.
pub fn block_region_len(block_size: u32) -> u64 {
    bitmap_size(block_size) + block_size as u64
}

/// On-disk BAT size for `entries` entries, padded to a whole sector.
pub fn bat_size_bytes(entries: u32) -> u64 {
    (entries as u64 * 4).div_ceil(SECTOR) * SECTOR
}

/// Byte index and mask for `sector` in a block bitmap. Sector 0 is the MSB of byte 0.
pub fn bitmap_mask(sector: u64) -> (usize, u8) {
    ((sector / 8) as usize, 0x80u8 >> (sector % 8))
}

pub fn bitmap_get(bitmap: &[u8], sector: u64) -> Result<bool> {
    let (byte, mask) = bitmap_mask(sector);
    let value = bitmap
        .get(byte)
        .ok_or(DiskError::CorruptImage("vhd bitmap too small"))?;
    Ok(value & mask != 0)
}

pub fn bitmap_set(bitmap: &mut [u8], sector: u64) -> Result<()> {
    let (byte, mask) = bitmap_mask(sector);
    let value = bitmap
        .get_mut(byte)
        .ok_or(DiskError::CorruptImage("vhd bitmap too small"))?;
    *value |= mask;
    Ok(())
}

/// In-memory copy of the BAT. Entries are sector numbers of block regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAllocationTable {
    table_offset: u64,
    entries: Vec<u32>,
}

impl BlockAllocationTable {
    pub fn new_unallocated(table_offset: u64, entries: u32) -> Result<Self> {
        if bat_size_bytes(entries) > MAX_BAT_BYTES {
            return Err(DiskError::Unsupported("vhd bat too large"));
        }
        Ok(Self {
            table_offset,
            entries: vec![UNALLOCATED; entries as usize],
        })
    }

    /// Reads `entries` entries at `table_offset`. Sector padding is not read.
    pub fn read_from<B: StorageBackend + ?Sized>(
        backend: &mut B,
        table_offset: u64,
        entries: u32,
    ) -> Result<Self> {
        let bat_bytes = entries as u64 * 4;
        if align_up_u64(bat_bytes, SECTOR)? > MAX_BAT_BYTES {
            return Err(DiskError::Unsupported("vhd bat too large"));
        }
        let mut buf = vec![0u8; bat_bytes as usize];
        match backend.read_at(table_offset, &mut buf) {
            Ok(()) => {}
            Err(DiskError::OutOfBounds { .. }) => {
                return Err(DiskError::CorruptImage("vhd bat truncated"));
            }
            Err(e) => return Err(e),
        }
        Ok(Self {
            table_offset,
            entries: buf.chunks_exact(4).map(be_u32).collect(),
        })
    }

    pub fn table_offset(&self) -> u64 {
        self.table_offset
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    /// Raw entry for `block`; `UNALLOCATED` for unallocated blocks.
    pub fn entry(&self, block: u64) -> Result<u32> {
        usize::try_from(block)
            .ok()
            .and_then(|i| self.entries.get(i))
            .copied()
            .ok_or(DiskError::CorruptImage("vhd block index out of range"))
    }

    /// Sector of the block region, if the block is allocated.
    pub fn lookup(&self, block: u64) -> Result<Option<u32>> {
        let entry = self.entry(block)?;
        Ok((entry != UNALLOCATED).then_some(entry))
    }

    pub fn allocated_count(&self) -> usize {
        self.entries.iter().filter(|e| **e != UNALLOCATED).count()
    }

    /// `(block, sector)` for every allocated block, in block order.
    pub fn allocated(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| **e != UNALLOCATED)
            .map(|(i, e)| (i as u64, *e))
    }

    pub fn entry_offset(&self, block: u64) -> Result<u64> {
        block
            .checked_mul(4)
            .and_then(|o| self.table_offset.checked_add(o))
            .ok_or(DiskError::OffsetOverflow)
    }

    /// Updates the entry in memory and in the backing file.
    pub fn write_entry<B: StorageBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        block: u64,
        sector: u32,
    ) -> Result<()> {
        let index =
            usize::try_from(block).map_err(|_| DiskError::CorruptImage("vhd block index"))?;
        if index >= self.entries.len() {
            return Err(DiskError::CorruptImage("vhd block index out of range"));
        }
        let offset = self.entry_offset(block)?;
        backend.write_at(offset, &sector.to_be_bytes())?;
        self.entries[index] = sector;
        Ok(())
    }

    pub fn set(&mut self, block: u64, sector: u32) -> Result<()> {
        let slot = usize::try_from(block)
            .ok()
            .and_then(|i| self.entries.get_mut(i))
            .ok_or(DiskError::CorruptImage("vhd block index out of range"))?;
        *slot = sector;
        Ok(())
    }

    /// Serialized table, padded to a whole sector with `UNALLOCATED`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let size = bat_size_bytes(self.entries.len() as u32) as usize;
        let mut buf = vec![0xffu8; size];
        for (chunk, e) in buf.chunks_exact_mut(4).zip(&self.entries) {
            chunk.copy_from_slice(&e.to_be_bytes());
        }
        buf
    }
}
