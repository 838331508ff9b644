use std::time::SystemTime;

use uuid::Uuid;

use crate::bat::BlockAllocationTable;
use crate::disk::{ParentDisk, RawDisk, ZeroDisk};
use crate::dynamic::{DynamicDisk, WriteOutcome};
use crate::dynamic_header::{
    DynamicHeader, HeaderLink, DEFAULT_BLOCK_SIZE, DYNAMIC_HEADER_COOKIE, DYNAMIC_HEADER_SIZE,
};
use crate::footer::{system_time_to_vhd_timestamp, DiskType, Footer, FOOTER_SIZE};
use crate::geometry::Geometry;
use crate::parent_locator::{encode_utf16be, LocatorKind, ParentLocator, LOCATOR_DATA_SPACE};
use crate::range_set::RangeSet;
use crate::util::align_up_u64;
use crate::{DiskError, Result, StorageBackend, VirtualDisk, SECTOR_SIZE};

/// Upper bound on headers followed from `footer.data_offset`.
pub const MAX_HEADER_CHAIN: usize = 16;

const DYNAMIC_HEADER_OFFSET: u64 = FOOTER_SIZE as u64;
const TABLE_OFFSET: u64 = DYNAMIC_HEADER_OFFSET + DYNAMIC_HEADER_SIZE as u64;

/// Parameters for a new dynamic disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicDiskConfig {
    pub capacity_bytes: u64,
    pub block_size_bytes: u32,
    /// Defaults to the geometry derived from the capacity.
    pub geometry: Option<Geometry>,
}

impl DynamicDiskConfig {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            block_size_bytes: DEFAULT_BLOCK_SIZE,
            geometry: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity_bytes == 0 {
            return Err(DiskError::InvalidConfig("capacity must be non-zero"));
        }
        if self.block_size_bytes < SECTOR_SIZE as u32 || !self.block_size_bytes.is_power_of_two()
        {
            return Err(DiskError::InvalidConfig(
                "block size must be a power of two and at least 512",
            ));
        }
        Ok(())
    }
}

/// Parameters for a new fixed disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDiskConfig {
    pub capacity_bytes: u64,
    pub geometry: Option<Geometry>,
}

impl FixedDiskConfig {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            geometry: None,
        }
    }
}

/// Where a new differencing disk records its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLocations {
    pub absolute_path: String,
    /// Relative to the directory of the differencing disk.
    pub relative_path: String,
    /// Parent modification time, stored in the dynamic header.
    pub modified: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ParentLocationKind {
    Absolute,
    Relative,
    /// Derived from the display name embedded in the dynamic header.
    DisplayName,
}

/// One candidate location for the parent of a differencing disk, as stored in the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLocation {
    pub kind: ParentLocationKind,
    pub path: String,
}

/// One image file: its footer, its dynamic header (for dynamic and differencing disks) and
/// the backend holding it.
pub struct VhdImage<B> {
    backend: B,
    footer: Footer,
    dynamic_header: Option<DynamicHeader>,
    used_leading_footer: bool,
}

impl<B: StorageBackend> VhdImage<B> {
    /// Reads and validates the footer and, for sparse disks, the dynamic header.
    ///
    /// A damaged trailing footer is tolerated when the leading copy is valid.
    pub fn open(mut backend: B) -> Result<Self> {
        let len = backend.len()?;
        if len < FOOTER_SIZE as u64 {
            return Err(DiskError::InvalidFooter("file too small"));
        }

        let mut raw = [0u8; FOOTER_SIZE];
        backend.read_at(len - FOOTER_SIZE as u64, &mut raw)?;
        let trailing = Footer::from_bytes(&raw)?;
        let (footer, used_leading_footer) = if trailing.is_valid() {
            (trailing, false)
        } else {
            backend.read_at(0, &mut raw)?;
            let leading = Footer::from_bytes(&raw)?;
            if !leading.is_valid() {
                return Err(DiskError::InvalidFooter(
                    "no valid footer at end or start of file",
                ));
            }
            tracing::warn!("vhd trailing footer is invalid; using the copy at offset 0");
            (leading, true)
        };

        let dynamic_header = match footer.disk_type {
            DiskType::Fixed => {
                if len - (FOOTER_SIZE as u64) < footer.current_size {
                    return Err(DiskError::CorruptImage("vhd fixed disk truncated"));
                }
                None
            }
            DiskType::Dynamic | DiskType::Differencing => {
                Some(read_dynamic_header(&mut backend, footer.data_offset)?)
            }
            DiskType::None | DiskType::Other(_) => {
                return Err(DiskError::Unsupported("vhd disk type"));
            }
        };

        Ok(Self {
            backend,
            footer,
            dynamic_header,
            used_leading_footer,
        })
    }

    /// Writes a fixed disk: `capacity` zero bytes (sector-rounded) and a trailing footer.
    pub fn create_fixed(mut backend: B, config: FixedDiskConfig) -> Result<Self> {
        if config.capacity_bytes == 0 {
            return Err(DiskError::InvalidConfig("capacity must be non-zero"));
        }
        let geometry = config
            .geometry
            .unwrap_or_else(|| Geometry::from_capacity(config.capacity_bytes));
        let footer = Footer::new(geometry, config.capacity_bytes, DiskType::Fixed);

        let data_len = align_up_u64(config.capacity_bytes, SECTOR_SIZE as u64)?;
        backend.set_len(0)?;
        backend.set_len(data_len)?;
        backend.write_at(data_len, &footer.to_bytes())?;

        Ok(Self {
            backend,
            footer,
            dynamic_header: None,
            used_leading_footer: false,
        })
    }

    /// Writes an empty dynamic disk: footer copy, dynamic header at 512, BAT at 1536 and the
    /// trailing footer.
    pub fn create_dynamic(mut backend: B, config: DynamicDiskConfig) -> Result<Self> {
        config.validate()?;
        let geometry = config
            .geometry
            .unwrap_or_else(|| Geometry::from_capacity(config.capacity_bytes));

        let mut footer = Footer::new(geometry, config.capacity_bytes, DiskType::Dynamic);
        footer.data_offset = DYNAMIC_HEADER_OFFSET;
        footer.update_checksum();

        let header =
            DynamicHeader::new(TABLE_OFFSET, config.block_size_bytes, config.capacity_bytes)?;
        let bat = BlockAllocationTable::new_unallocated(TABLE_OFFSET, header.max_table_entries)?;
        let bat_bytes = bat.to_bytes();

        backend.set_len(0)?;
        backend.write_at(0, &footer.to_bytes())?;
        backend.write_at(DYNAMIC_HEADER_OFFSET, &header.to_bytes())?;
        backend.write_at(TABLE_OFFSET, &bat_bytes)?;
        backend.write_at(TABLE_OFFSET + bat_bytes.len() as u64, &footer.to_bytes())?;

        Ok(Self {
            backend,
            footer,
            dynamic_header: Some(header),
            used_leading_footer: false,
        })
    }

    /// Writes an empty differencing disk whose parent is `parent`.
    ///
    /// Capacity and geometry come from the parent; so does the block size when the parent is
    /// sparse. Slot 7 records the absolute path and slot 6 the relative one, each with 512
    /// bytes of text space placed right after the BAT.
    pub fn create_differencing<P: StorageBackend>(
        mut backend: B,
        parent: &VhdImage<P>,
        locations: &ParentLocations,
    ) -> Result<Self> {
        let parent_footer = parent.footer();
        let mut footer = Footer::new(
            parent_footer.geometry,
            parent_footer.current_size,
            DiskType::Differencing,
        );
        footer.original_size = parent_footer.original_size;
        footer.data_offset = DYNAMIC_HEADER_OFFSET;
        footer.update_checksum();

        let block_size = parent
            .dynamic_header()
            .map_or(DEFAULT_BLOCK_SIZE, |h| h.block_size);
        let mut header = DynamicHeader::new(TABLE_OFFSET, block_size, footer.current_size)?;
        let bat = BlockAllocationTable::new_unallocated(TABLE_OFFSET, header.max_table_entries)?;
        let bat_bytes = bat.to_bytes();
        let abs_offset = TABLE_OFFSET + bat_bytes.len() as u64;
        let rel_offset = abs_offset + LOCATOR_DATA_SPACE as u64;

        header.parent_unique_id = parent_footer.unique_id;
        header.parent_timestamp = system_time_to_vhd_timestamp(locations.modified);
        header.set_parent_unicode_name(file_name_of(&locations.absolute_path))?;
        header.parent_locators[7] =
            ParentLocator::for_path(LocatorKind::Absolute, &locations.absolute_path, abs_offset)?;
        header.parent_locators[6] =
            ParentLocator::for_path(LocatorKind::Relative, &locations.relative_path, rel_offset)?;
        header.update_checksum();

        let mut abs_text = encode_utf16be(&locations.absolute_path);
        abs_text.resize(LOCATOR_DATA_SPACE as usize, 0);
        let mut rel_text = encode_utf16be(&locations.relative_path);
        rel_text.resize(LOCATOR_DATA_SPACE as usize, 0);

        backend.set_len(0)?;
        backend.write_at(0, &footer.to_bytes())?;
        backend.write_at(DYNAMIC_HEADER_OFFSET, &header.to_bytes())?;
        backend.write_at(TABLE_OFFSET, &bat_bytes)?;
        backend.write_at(abs_offset, &abs_text)?;
        backend.write_at(rel_offset, &rel_text)?;
        backend.write_at(rel_offset + LOCATOR_DATA_SPACE as u64, &footer.to_bytes())?;

        Ok(Self {
            backend,
            footer,
            dynamic_header: Some(header),
            used_leading_footer: false,
        })
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn dynamic_header(&self) -> Option<&DynamicHeader> {
        self.dynamic_header.as_ref()
    }

    pub fn disk_type(&self) -> DiskType {
        self.footer.disk_type
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.footer.current_size
    }

    pub fn geometry(&self) -> Geometry {
        self.footer.geometry
    }

    pub fn unique_id(&self) -> Uuid {
        self.footer.unique_id
    }

    pub fn needs_parent(&self) -> bool {
        self.footer.needs_parent()
    }

    /// Identity of the parent this image was created against; nil for non-differencing disks.
    pub fn parent_unique_id(&self) -> Uuid {
        match &self.dynamic_header {
            Some(h) if self.needs_parent() => h.parent_unique_id,
            _ => Uuid::nil(),
        }
    }

    /// Whether the trailing footer was damaged and the leading copy was used instead.
    pub fn used_leading_footer(&self) -> bool {
        self.used_leading_footer
    }

    pub fn is_read_only(&self) -> bool {
        self.backend.is_read_only()
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_parts(self) -> (B, Footer, Option<DynamicHeader>) {
        (self.backend, self.footer, self.dynamic_header)
    }

    /// Candidate parent locations in probing order: absolute slots, relative slots, then the
    /// embedded display name.
    pub fn parent_locations(&mut self) -> Result<Vec<ParentLocation>> {
        let header = match &self.dynamic_header {
            Some(h) if self.footer.needs_parent() => h.clone(),
            _ => {
                return Err(DiskError::InvalidConfig(
                    "only differencing disks have parent locations",
                ))
            }
        };

        let mut absolute = Vec::new();
        let mut relative = Vec::new();
        for locator in header.parent_locators.iter().filter(|l| !l.is_empty()) {
            let Some(path) = locator.read_path(&mut self.backend)? else {
                continue;
            };
            if path.is_empty() {
                continue;
            }
            let location = |kind| ParentLocation { kind, path };
            match locator.kind() {
                LocatorKind::Absolute => absolute.push(location(ParentLocationKind::Absolute)),
                LocatorKind::Relative => relative.push(location(ParentLocationKind::Relative)),
                LocatorKind::Other => {}
            }
        }

        let mut out = absolute;
        out.append(&mut relative);
        if !header.parent_unicode_name().is_empty() {
            out.push(ParentLocation {
                kind: ParentLocationKind::DisplayName,
                path: header.parent_unicode_name().to_string(),
            });
        }
        Ok(out)
    }

    /// Turns the image into its logical content stream.
    ///
    /// Differencing disks require `parent`; plain dynamic disks read unallocated sectors as
    /// zero. A parent passed to a fixed disk is dropped.
    pub fn open_content<'p>(self, parent: Option<ParentDisk<'p>>) -> Result<VhdContent<'p, B>> {
        let capacity = self.footer.current_size;
        match (self.footer.disk_type, self.dynamic_header) {
            (DiskType::Fixed, _) => Ok(VhdContent::Fixed(RawDisk::open(self.backend, capacity)?)),
            (DiskType::Dynamic, Some(header)) => {
                let parent = parent.unwrap_or_else(|| ParentDisk::owned(ZeroDisk::new(capacity)));
                Ok(VhdContent::Dynamic(DynamicDisk::open(
                    self.backend,
                    self.footer,
                    header,
                    parent,
                )?))
            }
            (DiskType::Differencing, Some(header)) => {
                let parent = parent.ok_or_else(|| {
                    DiskError::BrokenChain("differencing disk opened without its parent".into())
                })?;
                Ok(VhdContent::Dynamic(DynamicDisk::open(
                    self.backend,
                    self.footer,
                    header,
                    parent,
                )?))
            }
            _ => Err(DiskError::Unsupported("vhd disk type")),
        }
    }
}

impl<B> std::fmt::Debug for VhdImage<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VhdImage")
            .field("disk_type", &self.footer.disk_type)
            .field("capacity", &self.footer.current_size)
            .field("unique_id", &self.footer.unique_id)
            .finish_non_exhaustive()
    }
}

/// Follows the header chain from `offset` and returns the `cxsparse` header.
fn read_dynamic_header<B: StorageBackend + ?Sized>(
    backend: &mut B,
    offset: u64,
) -> Result<DynamicHeader> {
    let mut found = None;
    let mut pos = offset;
    let mut visited = 0usize;
    while pos != u64::MAX {
        visited += 1;
        if visited > MAX_HEADER_CHAIN {
            return Err(DiskError::InvalidDynamicHeader("header chain too long"));
        }

        let mut raw = [0u8; DYNAMIC_HEADER_SIZE];
        match backend.read_at(pos, &mut raw) {
            Ok(()) => {}
            Err(DiskError::OutOfBounds { .. }) => {
                return Err(DiskError::InvalidDynamicHeader("header truncated"));
            }
            Err(e) => return Err(e),
        }

        let link = HeaderLink::from_bytes(&raw);
        if link.cookie == DYNAMIC_HEADER_COOKIE {
            found = Some(DynamicHeader::parse(&raw)?);
        }
        pos = link.data_offset;
    }
    found.ok_or(DiskError::InvalidDynamicHeader("dynamic header missing"))
}

/// Last component of a Windows or POSIX style path.
pub(crate) fn file_name_of(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

/// Content stream of a single image, chosen once from the footer's disk type.
pub enum VhdContent<'p, B: StorageBackend> {
    Fixed(RawDisk<B>),
    Dynamic(DynamicDisk<'p, B>),
}

impl<'p, B: StorageBackend> VhdContent<'p, B> {
    /// Fixed disks never allocate.
    pub fn write_at_tracked(&mut self, offset: u64, buf: &[u8]) -> Result<WriteOutcome> {
        match self {
            Self::Fixed(d) => d.write_at(offset, buf).map(|()| WriteOutcome::NoAllocation),
            Self::Dynamic(d) => d.write_at_tracked(offset, buf),
        }
    }

    pub fn set_auto_commit_footer(&mut self, enabled: bool) -> Result<()> {
        match self {
            Self::Fixed(_) => Ok(()),
            Self::Dynamic(d) => d.set_auto_commit_footer(enabled),
        }
    }

    pub fn as_dynamic_mut(&mut self) -> Option<&mut DynamicDisk<'p, B>> {
        match self {
            Self::Fixed(_) => None,
            Self::Dynamic(d) => Some(d),
        }
    }

    /// Commits any pending footer and flushes.
    pub fn close(self) -> Result<()> {
        match self {
            Self::Fixed(mut d) => d.flush(),
            Self::Dynamic(d) => d.close(),
        }
    }
}

impl<B: StorageBackend> std::fmt::Debug for VhdContent<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(d) => f
                .debug_struct("Fixed")
                .field("capacity", &d.capacity_bytes())
                .finish_non_exhaustive(),
            Self::Dynamic(d) => f.debug_tuple("Dynamic").field(d).finish(),
        }
    }
}

impl<B: StorageBackend> VirtualDisk for VhdContent<'_, B> {
    fn capacity_bytes(&self) -> u64 {
        match self {
            Self::Fixed(d) => d.capacity_bytes(),
            Self::Dynamic(d) => d.capacity_bytes(),
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Self::Fixed(d) => d.read_at(offset, buf),
            Self::Dynamic(d) => d.read_at(offset, buf),
        }
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        match self {
            Self::Fixed(d) => d.write_at(offset, buf),
            Self::Dynamic(d) => d.write_at(offset, buf),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            Self::Fixed(d) => d.flush(),
            Self::Dynamic(d) => d.flush(),
        }
    }

    fn is_read_only(&self) -> bool {
        match self {
            Self::Fixed(d) => d.is_read_only(),
            Self::Dynamic(d) => d.is_read_only(),
        }
    }

    fn extents_in_range(&mut self, offset: u64, len: u64) -> Result<RangeSet> {
        match self {
            Self::Fixed(d) => d.extents_in_range(offset, len),
            Self::Dynamic(d) => d.extents_in_range(offset, len),
        }
    }
}
