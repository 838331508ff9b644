use crate::range_set::RangeSet;
use crate::util::checked_range;
use crate::{DiskError, Result, StorageBackend};

pub const SECTOR_SIZE: usize = 512;

/// A byte-addressed logical disk: the content stream exposed by one layer or a whole chain.
///
/// Reads and writes must lie entirely inside `[0, capacity_bytes())`.
pub trait VirtualDisk {
    fn capacity_bytes(&self) -> u64;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn is_read_only(&self) -> bool {
        false
    }

    /// Byte ranges inside `[offset, offset + len)` that hold stored data.
    ///
    /// Ranges outside the returned set read as zero (or as whatever a missing layer implies).
    fn extents_in_range(&mut self, offset: u64, len: u64) -> Result<RangeSet>;

    fn extents(&mut self) -> Result<RangeSet> {
        let capacity = self.capacity_bytes();
        self.extents_in_range(0, capacity)
    }

    /// VHD layers never resize in place.
    fn set_capacity(&mut self, _capacity_bytes: u64) -> Result<()> {
        Err(DiskError::CapacityExceeded("disk capacity is fixed"))
    }

    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        if !buf.len().is_multiple_of(SECTOR_SIZE) {
            return Err(DiskError::UnalignedLength {
                len: buf.len(),
                alignment: SECTOR_SIZE,
            });
        }
        let offset = lba
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        self.read_at(offset, buf)
    }

    fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
        if !buf.len().is_multiple_of(SECTOR_SIZE) {
            return Err(DiskError::UnalignedLength {
                len: buf.len(),
                alignment: SECTOR_SIZE,
            });
        }
        let offset = lba
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        self.write_at(offset, buf)
    }
}

impl<D: VirtualDisk + ?Sized> VirtualDisk for Box<D> {
    fn capacity_bytes(&self) -> u64 {
        (**self).capacity_bytes()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }

    fn extents_in_range(&mut self, offset: u64, len: u64) -> Result<RangeSet> {
        (**self).extents_in_range(offset, len)
    }

    fn set_capacity(&mut self, capacity_bytes: u64) -> Result<()> {
        (**self).set_capacity(capacity_bytes)
    }
}

impl<D: VirtualDisk + ?Sized> VirtualDisk for &mut D {
    fn capacity_bytes(&self) -> u64 {
        (**self).capacity_bytes()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }

    fn extents_in_range(&mut self, offset: u64, len: u64) -> Result<RangeSet> {
        (**self).extents_in_range(offset, len)
    }

    fn set_capacity(&mut self, capacity_bytes: u64) -> Result<()> {
        (**self).set_capacity(capacity_bytes)
    }
}

/// Read-only all-zero disk. Sits under a dynamic disk that has no parent.
#[derive(Debug, Clone, Copy)]
pub struct ZeroDisk {
    capacity: u64,
}

impl ZeroDisk {
    pub fn new(capacity: u64) -> Self {
        Self { capacity }
    }
}

impl VirtualDisk for ZeroDisk {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity)?;
        buf.fill(0);
        Ok(())
    }

    fn write_at(&mut self, _offset: u64, _buf: &[u8]) -> Result<()> {
        Err(DiskError::ReadOnly)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn extents_in_range(&mut self, _offset: u64, _len: u64) -> Result<RangeSet> {
        Ok(RangeSet::new())
    }
}

/// Flat content of a fixed disk: logical byte `n` is backend byte `n`.
///
/// The trailing footer lives past `capacity` and is never touched through this type.
pub struct RawDisk<B> {
    backend: B,
    capacity: u64,
}

impl<B: StorageBackend> RawDisk<B> {
    /// Wraps a backend that already holds at least `capacity` bytes.
    pub fn open(mut backend: B, capacity: u64) -> Result<Self> {
        if backend.len()? < capacity {
            return Err(DiskError::CorruptImage("fixed disk truncated"));
        }
        Ok(Self { backend, capacity })
    }

    /// Sizes an empty backend to `capacity` zero bytes.
    pub fn create(mut backend: B, capacity: u64) -> Result<Self> {
        backend.set_len(capacity)?;
        Ok(Self { backend, capacity })
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

impl<B: StorageBackend> VirtualDisk for RawDisk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity)?;
        match self.backend.read_at(offset, buf) {
            Ok(()) => Ok(()),
            Err(DiskError::OutOfBounds { .. }) => {
                Err(DiskError::CorruptImage("fixed disk truncated"))
            }
            Err(e) => Err(e),
        }
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity)?;
        if self.backend.is_read_only() {
            return Err(DiskError::ReadOnly);
        }
        self.backend.write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }

    fn is_read_only(&self) -> bool {
        self.backend.is_read_only()
    }

    fn extents_in_range(&mut self, offset: u64, len: u64) -> Result<RangeSet> {
        let end = offset.checked_add(len).ok_or(DiskError::OffsetOverflow)?;
        let mut set = RangeSet::new();
        set.insert(offset.min(self.capacity), end.min(self.capacity));
        Ok(set)
    }
}

/// The layer underneath a dynamic disk, with explicit ownership.
///
/// `Owned` parents are dropped together with the child, after the child has committed its
/// footer. `Borrowed` parents stay with the caller.
pub enum ParentDisk<'p> {
    Owned(Box<dyn VirtualDisk + 'p>),
    Borrowed(&'p mut dyn VirtualDisk),
}

impl<'p> ParentDisk<'p> {
    pub fn owned<D: VirtualDisk + 'p>(disk: D) -> Self {
        Self::Owned(Box::new(disk))
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }

    pub fn as_disk_mut(&mut self) -> &mut dyn VirtualDisk {
        match self {
            Self::Owned(d) => d.as_mut(),
            Self::Borrowed(d) => &mut **d,
        }
    }

    pub fn as_disk(&self) -> &dyn VirtualDisk {
        match self {
            Self::Owned(d) => d.as_ref(),
            Self::Borrowed(d) => &**d,
        }
    }
}

impl std::fmt::Debug for ParentDisk<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_owned() { "Owned" } else { "Borrowed" };
        f.debug_struct("ParentDisk")
            .field("kind", &kind)
            .field("capacity", &self.as_disk().capacity_bytes())
            .finish()
    }
}
