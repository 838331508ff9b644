//! Read-only structural validation of an image file.
//!
//! The checker keeps going after individual problems and reports all of them; it only stops
//! early when nothing sensible can be checked any more (no usable footer, unreadable BAT).

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::bat::{bat_size_bytes, block_region_len, MAX_BAT_BYTES, UNALLOCATED};
use crate::dynamic_header::{
    DynamicHeader, HeaderLink, DEFAULT_BLOCK_SIZE, DYNAMIC_HEADER_COOKIE, DYNAMIC_HEADER_SIZE,
    DYNAMIC_HEADER_VERSION_1,
};
use crate::footer::{
    DiskType, Footer, FEATURE_TEMPORARY, FEATURE_RESERVED, FOOTER_COOKIE, FOOTER_SIZE,
    HOST_OS_MACINTOSH, HOST_OS_WINDOWS, VHD_VERSION_1,
};
use crate::geometry::Geometry;
use crate::image::MAX_HEADER_CHAIN;
use crate::parent_locator::LocatorKind;
use crate::util::{be_u32, vhd_timestamp_now};
use crate::{DiskError, Result, StorageBackend, SECTOR_SIZE};

const SECTOR: u64 = SECTOR_SIZE as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
}

/// Everything a check found. The image passes when there are no error-level findings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub findings: Vec<Finding>,
}

impl CheckReport {
    pub fn passed(&self) -> bool {
        !self.has(Severity::Error)
    }

    pub fn has(&self, severity: Severity) -> bool {
        self.findings.iter().any(|f| f.severity == severity)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.with_severity(Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.with_severity(Severity::Warning)
    }

    pub fn with_severity(&self, severity: Severity) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.severity == severity)
    }

    /// Whether any finding's message contains `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.findings.iter().any(|f| f.message.contains(needle))
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for finding in &self.findings {
            writeln!(f, "{}: {}", finding.severity, finding.message)?;
        }
        Ok(())
    }
}

/// Validates an image without modifying it.
pub struct FileChecker<B> {
    backend: B,
    len: u64,
    report: CheckReport,
}

impl<B: StorageBackend> FileChecker<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            len: 0,
            report: CheckReport::default(),
        }
    }

    /// Runs every check. Only backend I/O failures are returned as `Err`; structural problems
    /// are findings.
    pub fn check(mut self) -> Result<CheckReport> {
        self.len = self.backend.len()?;
        if self.len < FOOTER_SIZE as u64 {
            self.error("file too small to hold a footer");
            return Ok(self.report);
        }

        let Some(footer) = self.check_footer_copies()? else {
            self.error("unable to continue: no valid footer at end or start of file");
            return Ok(self.report);
        };
        self.check_footer_fields(&footer);

        if footer.disk_type.is_sparse()
            && footer.data_offset != 0
            && footer.data_offset != u64::MAX
        {
            if let Some((header, metadata_end)) = self.check_dynamic_header(&footer)? {
                self.check_bat(&header, metadata_end)?;
            }
        }

        Ok(self.report)
    }

    fn push(&mut self, severity: Severity, message: String) {
        tracing::debug!(%severity, "{message}");
        self.report.findings.push(Finding { severity, message });
    }

    fn info(&mut self, message: impl Into<String>) {
        self.push(Severity::Info, message.into());
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.push(Severity::Warning, message.into());
    }

    fn error(&mut self, message: impl Into<String>) {
        self.push(Severity::Error, message.into());
    }

    /// Reads `buf.len()` bytes, or returns `false` if the range runs past end of file.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<bool> {
        match self.backend.read_at(offset, buf) {
            Ok(()) => Ok(true),
            Err(DiskError::OutOfBounds { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Picks the footer to check against: the trailing one if valid, else the leading copy.
    fn check_footer_copies(&mut self) -> Result<Option<Footer>> {
        let mut trailing_raw = [0u8; FOOTER_SIZE];
        self.backend
            .read_at(self.len - FOOTER_SIZE as u64, &mut trailing_raw)?;
        let trailing = Footer::from_bytes(&trailing_raw)?;
        if !trailing.is_valid() {
            self.error("footer: invalid footer at end of file");
        }
        if trailing.is_valid() && !trailing.disk_type.is_sparse() {
            return Ok(Some(trailing));
        }

        let mut leading_raw = [0u8; FOOTER_SIZE];
        self.backend.read_at(0, &mut leading_raw)?;
        let leading = Footer::from_bytes(&leading_raw)?;
        if !leading.is_valid() {
            self.error("footer: invalid footer copy at start of file");
        }
        if leading_raw != trailing_raw {
            self.error("footer: copy at start of file differs from footer at end");
        }

        Ok(if trailing.is_valid() {
            Some(trailing)
        } else if leading.is_valid() {
            Some(leading)
        } else {
            None
        })
    }

    fn check_footer_fields(&mut self, footer: &Footer) {
        if footer.cookie != FOOTER_COOKIE {
            self.error("footer: invalid cookie, expected 'conectix'");
        }
        if footer.features & !FEATURE_TEMPORARY != FEATURE_RESERVED {
            self.error(format!(
                "footer: invalid features {:#x}, expected 0x2 or 0x3",
                footer.features
            ));
        }
        if footer.format_version != VHD_VERSION_1 {
            self.error(format!(
                "footer: unrecognized file format version {:#010x}",
                footer.format_version
            ));
        }

        match footer.disk_type {
            DiskType::Fixed if footer.data_offset != u64::MAX => {
                self.error("footer: fixed disks must have data offset 0xFFFFFFFFFFFFFFFF");
            }
            DiskType::Dynamic | DiskType::Differencing
                if footer.data_offset == 0 || footer.data_offset == u64::MAX =>
            {
                self.error(format!(
                    "footer: invalid data offset {:#x} for a sparse disk",
                    footer.data_offset
                ));
            }
            DiskType::None | DiskType::Other(_) => {
                self.error(format!(
                    "footer: undocumented disk type {}",
                    footer.disk_type.as_u32()
                ));
            }
            _ => {}
        }

        if footer.timestamp > vhd_timestamp_now() {
            self.error("footer: creation time is in the future");
        }
        if footer.creator_host_os != HOST_OS_WINDOWS && footer.creator_host_os != HOST_OS_MACINTOSH
        {
            self.warning(format!(
                "footer: undocumented creator host OS '{}'",
                String::from_utf8_lossy(&footer.creator_host_os)
            ));
        }
        if footer.original_size != footer.current_size {
            self.info("footer: current size differs from original size");
        }
        if footer.current_size == 0 {
            self.error("footer: current size is 0 bytes");
        }
        if footer.geometry != Geometry::from_capacity(footer.current_size) {
            self.warning(format!(
                "footer: geometry {} does not match the standard geometry for this capacity",
                footer.geometry
            ));
        }
        if !footer.is_checksum_valid() {
            self.error("footer: invalid checksum");
        }
        if footer.unique_id.is_nil() {
            self.warning("footer: unique id is nil");
        }
    }

    /// Walks the header chain and validates the dynamic header. Returns it together with the
    /// end of the last header, or `None` when there is nothing to check the BAT against.
    fn check_dynamic_header(&mut self, footer: &Footer) -> Result<Option<(DynamicHeader, u64)>> {
        let mut header: Option<DynamicHeader> = None;
        let mut metadata_end = footer.data_offset.saturating_add(FOOTER_SIZE as u64);
        let mut visited = HashSet::new();
        let mut pos = footer.data_offset;

        while pos != u64::MAX {
            if !visited.insert(pos) {
                self.error(format!("dynamic header: header chain loops back to {pos:#x}"));
                break;
            }
            if visited.len() > MAX_HEADER_CHAIN {
                self.error("dynamic header: header chain too long");
                break;
            }
            if pos % SECTOR != 0 {
                self.error(format!("dynamic header: unaligned header at {pos:#x}"));
            }

            let mut raw = [0u8; DYNAMIC_HEADER_SIZE];
            if !self.read_exact_at(pos, &mut raw)? {
                self.error(format!(
                    "dynamic header: header at {pos:#x} extends beyond end of file"
                ));
                break;
            }
            let link = HeaderLink::from_bytes(&raw);
            if link.cookie == DYNAMIC_HEADER_COOKIE {
                if header.is_some() {
                    self.error("dynamic header: duplicate dynamic header");
                }
                match DynamicHeader::from_bytes(&raw) {
                    Ok(h) => header = Some(h),
                    Err(err) => self.error(format!("dynamic header: {err}")),
                }
                metadata_end = metadata_end.max(pos.saturating_add(DYNAMIC_HEADER_SIZE as u64));
            } else {
                self.warning(format!(
                    "dynamic header: undocumented header with cookie '{}'",
                    String::from_utf8_lossy(&link.cookie)
                ));
                metadata_end = metadata_end.max(pos.saturating_add(FOOTER_SIZE as u64));
            }
            pos = link.data_offset;
        }

        let Some(header) = header else {
            self.error("dynamic header: no dynamic header found");
            return Ok(None);
        };

        if header.table_offset < metadata_end {
            self.error("dynamic header: BAT offset is before the end of the last header");
        }
        if header.table_offset % SECTOR != 0 {
            self.error("dynamic header: BAT offset is not sector aligned");
        }
        if header.header_version != DYNAMIC_HEADER_VERSION_1 {
            self.error(format!(
                "dynamic header: unrecognized header version {:#010x}",
                header.header_version
            ));
        }
        if !header.block_size.is_power_of_two() || header.block_size < SECTOR_SIZE as u32 {
            self.error(format!(
                "dynamic header: block size {} is not a power of two of at least 512",
                header.block_size
            ));
        } else {
            let expected = footer.current_size.div_ceil(header.block_size as u64);
            if header.max_table_entries as u64 != expected {
                self.error(format!(
                    "dynamic header: max table entries is {}, expected {expected}",
                    header.max_table_entries
                ));
            }
        }
        if header.block_size != DEFAULT_BLOCK_SIZE && header.block_size != 512 * 1024 {
            self.warning(format!(
                "dynamic header: non-standard block size {}",
                header.block_size
            ));
        }
        if !header.is_checksum_valid() {
            self.error("dynamic header: invalid checksum");
        }

        match footer.disk_type {
            DiskType::Dynamic if !header.parent_unique_id.is_nil() => {
                self.warning("dynamic header: parent id is set on a dynamic disk");
            }
            DiskType::Differencing => self.check_parent_fields(&header),
            _ => {}
        }

        Ok(Some((header, metadata_end)))
    }

    fn check_parent_fields(&mut self, header: &DynamicHeader) {
        if header.parent_unique_id.is_nil() {
            self.error("dynamic header: parent id is nil on a differencing disk");
        }
        if header.parent_timestamp > vhd_timestamp_now() {
            self.warning("dynamic header: parent timestamp is in the future");
        }

        let mut has_path = false;
        for (i, locator) in header.parent_locators.iter().enumerate() {
            if locator.is_empty() {
                continue;
            }
            if locator.kind() != LocatorKind::Other {
                has_path = true;
            }
            let end = locator
                .platform_data_offset
                .checked_add(locator.platform_data_length as u64);
            if end.is_none_or(|end| end > self.len) {
                self.error(format!(
                    "dynamic header: parent locator {i} ('{}') data lies beyond end of file",
                    locator.platform_code_str()
                ));
            }
            if locator.platform_data_length > locator.platform_data_space
                && locator.platform_data_space >= SECTOR as u32
            {
                self.warning(format!(
                    "dynamic header: parent locator {i} data length exceeds its data space"
                ));
            }
        }
        if !has_path {
            self.warning("dynamic header: differencing disk has no absolute or relative parent locator");
        }
    }

    fn check_bat(&mut self, header: &DynamicHeader, metadata_end: u64) -> Result<()> {
        let bat_size = bat_size_bytes(header.max_table_entries);
        if bat_size > MAX_BAT_BYTES {
            self.error("bat: table too large to check");
            return Ok(());
        }
        let bat_end = match header.table_offset.checked_add(bat_size) {
            Some(end) if end <= self.len => end,
            _ => {
                self.error("bat: table extends beyond end of file");
                return Ok(());
            }
        };

        let mut raw = vec![0u8; bat_size as usize];
        self.backend.read_at(header.table_offset, &mut raw)?;
        let entries: Vec<u32> = raw.chunks_exact(4).map(be_u32).collect();
        let used = header.max_table_entries as usize;

        for (i, entry) in entries.iter().enumerate().skip(used) {
            if *entry != UNALLOCATED {
                self.error(format!("bat: padding entry {i} should be 0xFFFFFFFF"));
            }
        }

        if !header.block_size.is_power_of_two() || header.block_size < SECTOR_SIZE as u32 {
            // Region sizes are meaningless; header errors already cover this.
            return Ok(());
        }
        let region_len = block_region_len(header.block_size);
        let data_floor = metadata_end.max(bat_end);

        let mut regions: Vec<(u64, u64)> = Vec::new();
        for (block, entry) in entries.iter().take(used).enumerate() {
            if *entry == UNALLOCATED {
                continue;
            }
            let start = *entry as u64 * SECTOR;
            let end = start + region_len;
            if start < data_floor {
                self.error(format!(
                    "bat: block {block} at {start:#x} overlaps image metadata"
                ));
            }
            if end > self.len {
                self.error(format!(
                    "bat: block {block} at {start:#x} extends beyond end of file"
                ));
            }
            regions.push((start, block as u64));
        }

        regions.sort_unstable();
        for pair in regions.windows(2) {
            let (a_start, a_block) = pair[0];
            let (b_start, b_block) = pair[1];
            if a_start + region_len > b_start {
                self.error(format!(
                    "bat: blocks {a_block} and {b_block} occupy overlapping file space"
                ));
            }
        }

        Ok(())
    }
}
