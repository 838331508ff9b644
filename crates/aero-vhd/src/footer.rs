use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use uuid::Uuid;

use crate::geometry::Geometry;
use crate::util::{be_u32, be_u64, vhd_checksum, VHD_EPOCH_UNIX_SECS};
use crate::{DiskError, Result};

pub const FOOTER_SIZE: usize = 512;
pub const FOOTER_COOKIE: [u8; 8] = *b"conectix";

pub const FEATURE_TEMPORARY: u32 = 0x0000_0001;
pub const FEATURE_RESERVED: u32 = 0x0000_0002;

pub const VHD_VERSION_1: u32 = 0x0001_0000;

pub const HOST_OS_WINDOWS: [u8; 4] = *b"Wi2k";
pub const HOST_OS_MACINTOSH: [u8; 4] = *b"Mac ";

pub const CREATOR_APP: [u8; 4] = *b"aero";
pub const CREATOR_VERSION: u32 = 0x0001_0000;

const CHECKSUM_FIELD: std::ops::Range<usize> = 64..68;
const RESERVED_OFFSET: usize = 85;

/// Disk type discriminant at footer offset 0x3C.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiskType {
    None,
    Fixed,
    Dynamic,
    Differencing,
    /// Values reserved or deprecated by the format (1, 5, 6) and anything else.
    Other(u32),
}

impl DiskType {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::None,
            2 => Self::Fixed,
            3 => Self::Dynamic,
            4 => Self::Differencing,
            other => Self::Other(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed => 2,
            Self::Dynamic => 3,
            Self::Differencing => 4,
            Self::Other(v) => v,
        }
    }

    /// Whether the image carries a dynamic header, BAT and block bitmaps.
    pub fn is_sparse(self) -> bool {
        matches!(self, Self::Dynamic | Self::Differencing)
    }
}

/// The 512-byte record at the end of every image.
///
/// Decoding keeps every field as stored, including the reserved tail, so a record decoded
/// from bytes re-encodes to exactly those bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub cookie: [u8; 8],
    pub features: u32,
    pub format_version: u32,
    /// Absolute offset of the dynamic header; `u64::MAX` for fixed disks.
    pub data_offset: u64,
    /// Seconds since 2000-01-01T00:00:00Z.
    pub timestamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_host_os: [u8; 4],
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: Geometry,
    pub disk_type: DiskType,
    pub checksum: u32,
    pub unique_id: Uuid,
    pub saved_state: u8,
    reserved: Box<[u8; FOOTER_SIZE - RESERVED_OFFSET]>,
}

impl Footer {
    /// A fresh footer with a new unique id, stamped with the current time.
    ///
    /// The checksum is already up to date.
    pub fn new(geometry: Geometry, capacity: u64, disk_type: DiskType) -> Self {
        let mut footer = Self {
            cookie: FOOTER_COOKIE,
            features: FEATURE_RESERVED,
            format_version: VHD_VERSION_1,
            data_offset: u64::MAX,
            timestamp: crate::util::vhd_timestamp_now(),
            creator_app: CREATOR_APP,
            creator_version: CREATOR_VERSION,
            creator_host_os: HOST_OS_WINDOWS,
            original_size: capacity,
            current_size: capacity,
            geometry,
            disk_type,
            checksum: 0,
            unique_id: Uuid::new_v4(),
            saved_state: 0,
            reserved: Box::new([0; FOOTER_SIZE - RESERVED_OFFSET]),
        };
        footer.update_checksum();
        footer
    }

    /// Field-by-field decode with no validation. `buf` must hold at least 512 bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < FOOTER_SIZE {
            return Err(DiskError::InvalidFooter("footer truncated"));
        }
        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&buf[0..8]);
        let mut creator_app = [0u8; 4];
        creator_app.copy_from_slice(&buf[28..32]);
        let mut creator_host_os = [0u8; 4];
        creator_host_os.copy_from_slice(&buf[36..40]);
        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[68..84]);
        let mut reserved = Box::new([0u8; FOOTER_SIZE - RESERVED_OFFSET]);
        reserved.copy_from_slice(&buf[RESERVED_OFFSET..FOOTER_SIZE]);

        Ok(Self {
            cookie,
            features: be_u32(&buf[8..12]),
            format_version: be_u32(&buf[12..16]),
            data_offset: be_u64(&buf[16..24]),
            timestamp: be_u32(&buf[24..28]),
            creator_app,
            creator_version: be_u32(&buf[32..36]),
            creator_host_os,
            original_size: be_u64(&buf[40..48]),
            current_size: be_u64(&buf[48..56]),
            geometry: Geometry::from_bytes(&buf[56..60]),
            disk_type: DiskType::from_u32(be_u32(&buf[60..64])),
            checksum: be_u32(&buf[64..68]),
            unique_id: Uuid::from_bytes(id),
            saved_state: buf[84],
            reserved,
        })
    }

    /// Decodes and rejects a stored checksum that does not match the record bytes.
    ///
    /// Cookie and version are left for the caller to judge.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let footer = Self::from_bytes(buf)?;
        if vhd_checksum(&buf[..FOOTER_SIZE], CHECKSUM_FIELD) != footer.checksum {
            return Err(DiskError::InvalidFooter("checksum mismatch"));
        }
        Ok(footer)
    }

    /// Decodes a footer that must be fully valid (cookie, version and checksum).
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let footer = Self::decode(buf)?;
        if footer.cookie != FOOTER_COOKIE {
            return Err(DiskError::InvalidFooter("cookie mismatch"));
        }
        if footer.format_version != VHD_VERSION_1 {
            return Err(DiskError::InvalidFooter("unsupported format version"));
        }
        Ok(footer)
    }

    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..8].copy_from_slice(&self.cookie);
        buf[8..12].copy_from_slice(&self.features.to_be_bytes());
        buf[12..16].copy_from_slice(&self.format_version.to_be_bytes());
        buf[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[28..32].copy_from_slice(&self.creator_app);
        buf[32..36].copy_from_slice(&self.creator_version.to_be_bytes());
        buf[36..40].copy_from_slice(&self.creator_host_os);
        buf[40..48].copy_from_slice(&self.original_size.to_be_bytes());
        buf[48..56].copy_from_slice(&self.current_size.to_be_bytes());
        buf[56..60].copy_from_slice(&self.geometry.to_bytes());
        buf[60..64].copy_from_slice(&self.disk_type.as_u32().to_be_bytes());
        buf[64..68].copy_from_slice(&self.checksum.to_be_bytes());
        buf[68..84].copy_from_slice(self.unique_id.as_bytes());
        buf[84] = self.saved_state;
        buf[RESERVED_OFFSET..].copy_from_slice(&self.reserved[..]);
        buf
    }

    pub fn compute_checksum(&self) -> u32 {
        vhd_checksum(&self.to_bytes(), CHECKSUM_FIELD)
    }

    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn is_checksum_valid(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    pub fn is_valid(&self) -> bool {
        self.cookie == FOOTER_COOKIE
            && self.format_version == VHD_VERSION_1
            && self.is_checksum_valid()
    }

    pub fn needs_parent(&self) -> bool {
        self.disk_type == DiskType::Differencing
    }

    pub fn modified(&self) -> SystemTime {
        vhd_timestamp_to_system_time(self.timestamp)
    }
}

pub fn vhd_timestamp_to_system_time(ts: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(VHD_EPOCH_UNIX_SECS + ts as u64)
}

/// Converts to a VHD timestamp, saturating outside the representable window.
pub fn system_time_to_vhd_timestamp(t: SystemTime) -> u32 {
    let unix = t
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    unix.saturating_sub(VHD_EPOCH_UNIX_SECS)
        .min(u32::MAX as u64) as u32
}
