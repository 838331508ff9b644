use serde::Serialize;

use crate::util::{be_u32, be_u64};
use crate::{DiskError, Result, StorageBackend};

pub const LOCATOR_SIZE: usize = 24;

/// Windows absolute path, UTF-16 text.
pub const PLATFORM_CODE_W2KU: [u8; 4] = *b"W2ku";
/// Windows path relative to the child image, UTF-16 text.
pub const PLATFORM_CODE_W2RU: [u8; 4] = *b"W2ru";

/// Default data space reserved per locator when creating differencing disks.
pub const LOCATOR_DATA_SPACE: u32 = 512;

// Locator text is a path; anything larger than this is not a path.
const MAX_LOCATOR_DATA_BYTES: u32 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LocatorKind {
    Absolute,
    Relative,
    Other,
}

/// One 24-byte parent-locator slot of the dynamic header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParentLocator {
    pub platform_code: [u8; 4],
    pub platform_data_space: u32,
    pub platform_data_length: u32,
    pub reserved: u32,
    pub platform_data_offset: u64,
}

impl ParentLocator {
    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut platform_code = [0u8; 4];
        platform_code.copy_from_slice(&buf[0..4]);
        Self {
            platform_code,
            platform_data_space: be_u32(&buf[4..8]),
            platform_data_length: be_u32(&buf[8..12]),
            reserved: be_u32(&buf[12..16]),
            platform_data_offset: be_u64(&buf[16..24]),
        }
    }

    pub fn to_bytes(&self) -> [u8; LOCATOR_SIZE] {
        let mut buf = [0u8; LOCATOR_SIZE];
        buf[0..4].copy_from_slice(&self.platform_code);
        buf[4..8].copy_from_slice(&self.platform_data_space.to_be_bytes());
        buf[8..12].copy_from_slice(&self.platform_data_length.to_be_bytes());
        buf[12..16].copy_from_slice(&self.reserved.to_be_bytes());
        buf[16..24].copy_from_slice(&self.platform_data_offset.to_be_bytes());
        buf
    }

    /// A slot pointing at `path` encoded as UTF-16BE at `offset`.
    pub fn for_path(kind: LocatorKind, path: &str, offset: u64) -> Result<Self> {
        let platform_code = match kind {
            LocatorKind::Absolute => PLATFORM_CODE_W2KU,
            LocatorKind::Relative => PLATFORM_CODE_W2RU,
            LocatorKind::Other => return Err(DiskError::InvalidConfig("unsupported locator kind")),
        };
        let len = encode_utf16be(path).len();
        if len > LOCATOR_DATA_SPACE as usize {
            return Err(DiskError::InvalidConfig("parent path too long for locator"));
        }
        Ok(Self {
            platform_code,
            platform_data_space: LOCATOR_DATA_SPACE,
            platform_data_length: len as u32,
            reserved: 0,
            platform_data_offset: offset,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.platform_code == [0; 4]
    }

    pub fn kind(&self) -> LocatorKind {
        match self.platform_code {
            PLATFORM_CODE_W2KU => LocatorKind::Absolute,
            PLATFORM_CODE_W2RU => LocatorKind::Relative,
            _ => LocatorKind::Other,
        }
    }

    pub fn platform_code_str(&self) -> String {
        String::from_utf8_lossy(&self.platform_code)
            .trim_end_matches('\0')
            .to_string()
    }

    /// Reads exactly `platform_data_length` bytes at `platform_data_offset`.
    pub fn read_data<B: StorageBackend + ?Sized>(&self, backend: &mut B) -> Result<Vec<u8>> {
        if self.platform_data_length > MAX_LOCATOR_DATA_BYTES {
            return Err(DiskError::Unsupported("parent locator data too large"));
        }
        let mut buf = vec![0u8; self.platform_data_length as usize];
        match backend.read_at(self.platform_data_offset, &mut buf) {
            Ok(()) => Ok(buf),
            Err(DiskError::OutOfBounds { .. }) => {
                Err(DiskError::CorruptImage("parent locator data truncated"))
            }
            Err(e) => Err(e),
        }
    }

    /// Decoded path text for the Windows locator kinds; `None` for other platforms.
    pub fn read_path<B: StorageBackend + ?Sized>(&self, backend: &mut B) -> Result<Option<String>> {
        match self.kind() {
            LocatorKind::Absolute | LocatorKind::Relative => {
                let data = self.read_data(backend)?;
                decode_utf16be(&data).map(Some)
            }
            LocatorKind::Other => Ok(None),
        }
    }
}

pub fn encode_utf16be(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_be_bytes()).collect()
}

/// Decodes UTF-16BE text, stopping at the first NUL code unit.
pub fn decode_utf16be(bytes: &[u8]) -> Result<String> {
    let units = bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .take_while(|u| *u != 0);
    char::decode_utf16(units)
        .collect::<std::result::Result<String, _>>()
        .map_err(|_| DiskError::CorruptImage("invalid UTF-16 text"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemBackend;

    #[test]
    fn locator_layout() {
        let loc = ParentLocator {
            platform_code: PLATFORM_CODE_W2RU,
            platform_data_space: 512,
            platform_data_length: 22,
            reserved: 0,
            platform_data_offset: 0x0102_0304_0506,
        };
        let b = loc.to_bytes();
        assert_eq!(&b[0..4], b"W2ru");
        assert_eq!(&b[4..8], &[0, 0, 2, 0]);
        assert_eq!(&b[8..12], &[0, 0, 0, 22]);
        assert_eq!(&b[16..24], &[0, 0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(ParentLocator::from_bytes(&b), loc);
        assert_eq!(loc.kind(), LocatorKind::Relative);
    }

    #[test]
    fn path_text_is_utf16_big_endian() {
        let enc = encode_utf16be("a\\b");
        assert_eq!(enc, [0, b'a', 0, b'\\', 0, b'b']);
        assert_eq!(decode_utf16be(&enc).unwrap(), "a\\b");

        let mut padded = encode_utf16be("disk.vhd");
        padded.resize(512, 0);
        assert_eq!(decode_utf16be(&padded).unwrap(), "disk.vhd");
    }

    #[test]
    fn read_path_reads_exactly_data_length() {
        let mut backend = MemBackend::new();
        let mut data = encode_utf16be(".\\parent.vhd");
        data.extend_from_slice(&encode_utf16be("garbage"));
        backend.write_at(2048, &data).unwrap();

        let loc =
            ParentLocator::for_path(LocatorKind::Relative, ".\\parent.vhd", 2048).unwrap();
        assert_eq!(
            loc.read_path(&mut backend).unwrap().as_deref(),
            Some(".\\parent.vhd")
        );
    }

    #[test]
    fn truncated_data_is_corrupt() {
        let mut backend = MemBackend::with_len(100).unwrap();
        let loc = ParentLocator::for_path(LocatorKind::Absolute, "C:\\x.vhd", 96).unwrap();
        assert!(matches!(
            loc.read_path(&mut backend).unwrap_err(),
            DiskError::CorruptImage(_)
        ));
    }

    #[test]
    fn other_platforms_have_no_path() {
        let mut backend = MemBackend::new();
        let loc = ParentLocator {
            platform_code: *b"MacX",
            ..Default::default()
        };
        assert_eq!(loc.read_path(&mut backend).unwrap(), None);
        assert!(ParentLocator::default().is_empty());
    }
}
