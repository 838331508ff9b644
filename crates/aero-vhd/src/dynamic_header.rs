use uuid::Uuid;

use crate::parent_locator::{encode_utf16be, ParentLocator, LOCATOR_SIZE};
use crate::util::{be_u32, be_u64, div_ceil_u64, vhd_checksum};
use crate::{DiskError, Result};

pub const DYNAMIC_HEADER_SIZE: usize = 1024;
pub const DYNAMIC_HEADER_COOKIE: [u8; 8] = *b"cxsparse";
pub const DYNAMIC_HEADER_VERSION_1: u32 = 0x0001_0000;

/// 2 MiB, the block size used when none is requested.
pub const DEFAULT_BLOCK_SIZE: u32 = 0x0020_0000;

pub const PARENT_LOCATOR_COUNT: usize = 8;

const CHECKSUM_FIELD: std::ops::Range<usize> = 36..40;
const RESERVED1: std::ops::Range<usize> = 60..64;
const PARENT_NAME_OFFSET: usize = 64;
const PARENT_NAME_BYTES: usize = 512;
const LOCATORS_OFFSET: usize = 576;
const TAIL_OFFSET: usize = LOCATORS_OFFSET + PARENT_LOCATOR_COUNT * LOCATOR_SIZE;

/// Cookie and next-header pointer shared by every header in the chain at `footer.data_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLink {
    pub cookie: [u8; 8],
    /// Next header in the chain, or `u64::MAX` for none.
    pub data_offset: u64,
}

impl HeaderLink {
    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&buf[0..8]);
        Self {
            cookie,
            data_offset: be_u64(&buf[8..16]),
        }
    }
}

/// The 1024-byte record describing the BAT and, for differencing disks, the parent.
///
/// Reserved bytes and the raw parent-name field are kept as read, so `to_bytes` reproduces a
/// decoded record exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicHeader {
    pub cookie: [u8; 8],
    pub data_offset: u64,
    pub table_offset: u64,
    pub header_version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub parent_unique_id: Uuid,
    /// Parent modification time, seconds since 2000-01-01T00:00:00Z.
    pub parent_timestamp: u32,
    parent_unicode_name: String,
    pub parent_locators: [ParentLocator; PARENT_LOCATOR_COUNT],
    reserved1: [u8; 4],
    parent_name_raw: Box<[u8; PARENT_NAME_BYTES]>,
    tail: Box<[u8; DYNAMIC_HEADER_SIZE - TAIL_OFFSET]>,
}

impl DynamicHeader {
    /// Header for a `capacity`-byte disk whose BAT starts at `table_offset`.
    pub fn new(table_offset: u64, block_size: u32, capacity: u64) -> Result<Self> {
        if block_size == 0 {
            return Err(DiskError::InvalidConfig("block size must be non-zero"));
        }
        let entries = div_ceil_u64(capacity, block_size as u64)?;
        let max_table_entries: u32 = entries
            .try_into()
            .map_err(|_| DiskError::InvalidConfig("too many blocks for capacity"))?;
        let mut header = Self {
            cookie: DYNAMIC_HEADER_COOKIE,
            data_offset: u64::MAX,
            table_offset,
            header_version: DYNAMIC_HEADER_VERSION_1,
            max_table_entries,
            block_size,
            checksum: 0,
            parent_unique_id: Uuid::nil(),
            parent_timestamp: 0,
            parent_unicode_name: String::new(),
            parent_locators: [ParentLocator::default(); PARENT_LOCATOR_COUNT],
            reserved1: [0; 4],
            parent_name_raw: Box::new([0; PARENT_NAME_BYTES]),
            tail: Box::new([0; DYNAMIC_HEADER_SIZE - TAIL_OFFSET]),
        };
        header.update_checksum();
        Ok(header)
    }

    /// Field-by-field decode with no validation. `buf` must hold at least 1024 bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < DYNAMIC_HEADER_SIZE {
            return Err(DiskError::InvalidDynamicHeader("header truncated"));
        }
        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&buf[0..8]);
        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[40..56]);

        let mut parent_locators = [ParentLocator::default(); PARENT_LOCATOR_COUNT];
        for (i, loc) in parent_locators.iter_mut().enumerate() {
            let off = LOCATORS_OFFSET + i * LOCATOR_SIZE;
            *loc = ParentLocator::from_bytes(&buf[off..off + LOCATOR_SIZE]);
        }

        let mut parent_name_raw = Box::new([0u8; PARENT_NAME_BYTES]);
        parent_name_raw
            .copy_from_slice(&buf[PARENT_NAME_OFFSET..PARENT_NAME_OFFSET + PARENT_NAME_BYTES]);
        let units: Vec<u16> = parent_name_raw
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .take_while(|u| *u != 0)
            .collect();
        let parent_unicode_name = String::from_utf16_lossy(&units);

        let mut reserved1 = [0u8; 4];
        reserved1.copy_from_slice(&buf[RESERVED1]);
        let mut tail = Box::new([0u8; DYNAMIC_HEADER_SIZE - TAIL_OFFSET]);
        tail.copy_from_slice(&buf[TAIL_OFFSET..DYNAMIC_HEADER_SIZE]);

        Ok(Self {
            cookie,
            data_offset: be_u64(&buf[8..16]),
            table_offset: be_u64(&buf[16..24]),
            header_version: be_u32(&buf[24..28]),
            max_table_entries: be_u32(&buf[28..32]),
            block_size: be_u32(&buf[32..36]),
            checksum: be_u32(&buf[36..40]),
            parent_unique_id: Uuid::from_bytes(id),
            parent_timestamp: be_u32(&buf[56..60]),
            parent_unicode_name,
            parent_locators,
            reserved1,
            parent_name_raw,
            tail,
        })
    }

    /// Decodes and rejects a stored checksum that does not match the record bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = Self::from_bytes(buf)?;
        if vhd_checksum(&buf[..DYNAMIC_HEADER_SIZE], CHECKSUM_FIELD) != header.checksum {
            return Err(DiskError::InvalidDynamicHeader("checksum mismatch"));
        }
        Ok(header)
    }

    /// Decodes a header that must be fully valid (cookie, version and checksum).
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let header = Self::decode(buf)?;
        if header.cookie != DYNAMIC_HEADER_COOKIE {
            return Err(DiskError::InvalidDynamicHeader("cookie mismatch"));
        }
        if header.header_version != DYNAMIC_HEADER_VERSION_1 {
            return Err(DiskError::InvalidDynamicHeader("unsupported header version"));
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> [u8; DYNAMIC_HEADER_SIZE] {
        let mut buf = [0u8; DYNAMIC_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.cookie);
        buf[8..16].copy_from_slice(&self.data_offset.to_be_bytes());
        buf[16..24].copy_from_slice(&self.table_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.header_version.to_be_bytes());
        buf[28..32].copy_from_slice(&self.max_table_entries.to_be_bytes());
        buf[32..36].copy_from_slice(&self.block_size.to_be_bytes());
        buf[36..40].copy_from_slice(&self.checksum.to_be_bytes());
        buf[40..56].copy_from_slice(self.parent_unique_id.as_bytes());
        buf[56..60].copy_from_slice(&self.parent_timestamp.to_be_bytes());
        buf[RESERVED1].copy_from_slice(&self.reserved1);
        buf[PARENT_NAME_OFFSET..PARENT_NAME_OFFSET + PARENT_NAME_BYTES]
            .copy_from_slice(&self.parent_name_raw[..]);

        for (i, loc) in self.parent_locators.iter().enumerate() {
            let off = LOCATORS_OFFSET + i * LOCATOR_SIZE;
            buf[off..off + LOCATOR_SIZE].copy_from_slice(&loc.to_bytes());
        }
        buf[TAIL_OFFSET..].copy_from_slice(&self.tail[..]);
        buf
    }

    /// Parent display name, up to the first NUL. Unpaired surrogates decode as U+FFFD.
    pub fn parent_unicode_name(&self) -> &str {
        &self.parent_unicode_name
    }

    /// Sets the display name, which must fit the 512-byte UTF-16BE field.
    pub fn set_parent_unicode_name(&mut self, name: &str) -> Result<()> {
        let encoded = encode_utf16be(name);
        if encoded.len() > PARENT_NAME_BYTES {
            return Err(DiskError::InvalidConfig("parent name too long"));
        }
        self.parent_name_raw.fill(0);
        self.parent_name_raw[..encoded.len()].copy_from_slice(&encoded);
        self.parent_unicode_name = name.to_string();
        Ok(())
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
        self.cookie == DYNAMIC_HEADER_COOKIE
            && self.header_version == DYNAMIC_HEADER_VERSION_1
            && self.is_checksum_valid()
    }

    /// On-disk BAT size: `max_table_entries` 4-byte entries, rounded up to a sector.
    pub fn bat_size_bytes(&self) -> u64 {
        crate::bat::bat_size_bytes(self.max_table_entries)
    }
}
