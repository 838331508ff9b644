use std::time::SystemTime;

use serde::Serialize;
use uuid::Uuid;

use crate::dynamic_header::DynamicHeader;
use crate::footer::{vhd_timestamp_to_system_time, DiskType, Footer};
use crate::geometry::Geometry;
use crate::image::VhdImage;
use crate::parent_locator::LocatorKind;
use crate::{Result, StorageBackend};

/// Every footer and dynamic header field of one image, decoded for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskImageInfo {
    pub cookie: String,
    pub features: u32,
    pub format_version: u32,
    pub data_offset: u64,
    pub timestamp: u32,
    pub created: SystemTime,
    pub creator_app: String,
    pub creator_version: u32,
    pub creator_host_os: String,
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: Geometry,
    pub disk_type: DiskType,
    pub checksum: u32,
    pub unique_id: Uuid,
    pub saved_state: bool,
    pub dynamic_header: Option<DynamicHeaderInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DynamicHeaderInfo {
    pub cookie: String,
    pub data_offset: u64,
    pub table_offset: u64,
    pub header_version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub parent_unique_id: Uuid,
    pub parent_timestamp: u32,
    pub parent_modified: SystemTime,
    pub parent_unicode_name: String,
    pub parent_locators: Vec<ParentLocatorInfo>,
}

/// A non-empty locator slot and, for path kinds, the text it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParentLocatorInfo {
    pub slot: usize,
    pub platform_code: String,
    pub kind: LocatorKind,
    pub data_space: u32,
    pub data_length: u32,
    pub data_offset: u64,
    pub path: Option<String>,
}

fn tag(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

impl DiskImageInfo {
    fn from_footer(footer: &Footer) -> Self {
        Self {
            cookie: tag(&footer.cookie),
            features: footer.features,
            format_version: footer.format_version,
            data_offset: footer.data_offset,
            timestamp: footer.timestamp,
            created: footer.modified(),
            creator_app: tag(&footer.creator_app),
            creator_version: footer.creator_version,
            creator_host_os: tag(&footer.creator_host_os),
            original_size: footer.original_size,
            current_size: footer.current_size,
            geometry: footer.geometry,
            disk_type: footer.disk_type,
            checksum: footer.checksum,
            unique_id: footer.unique_id,
            saved_state: footer.saved_state != 0,
            dynamic_header: None,
        }
    }
}

impl DynamicHeaderInfo {
    fn from_header(header: &DynamicHeader) -> Self {
        Self {
            cookie: tag(&header.cookie),
            data_offset: header.data_offset,
            table_offset: header.table_offset,
            header_version: header.header_version,
            max_table_entries: header.max_table_entries,
            block_size: header.block_size,
            checksum: header.checksum,
            parent_unique_id: header.parent_unique_id,
            parent_timestamp: header.parent_timestamp,
            parent_modified: vhd_timestamp_to_system_time(header.parent_timestamp),
            parent_unicode_name: header.parent_unicode_name().to_string(),
            parent_locators: Vec::new(),
        }
    }
}

impl<B: StorageBackend> VhdImage<B> {
    /// Decoded metadata, including the text of every readable parent locator.
    ///
    /// A locator whose text cannot be read is listed without a path.
    pub fn info(&mut self) -> Result<DiskImageInfo> {
        let mut info = DiskImageInfo::from_footer(self.footer());
        let Some(header) = self.dynamic_header().cloned() else {
            return Ok(info);
        };

        let mut dynamic = DynamicHeaderInfo::from_header(&header);
        for (slot, locator) in header.parent_locators.iter().enumerate() {
            if locator.is_empty() {
                continue;
            }
            let path = match locator.read_path(self.backend_mut()) {
                Ok(path) => path,
                Err(err) => {
                    tracing::warn!("unreadable vhd parent locator in slot {slot}: {err}");
                    None
                }
            };
            dynamic.parent_locators.push(ParentLocatorInfo {
                slot,
                platform_code: locator.platform_code_str(),
                kind: locator.kind(),
                data_space: locator.platform_data_space,
                data_length: locator.platform_data_length,
                data_offset: locator.platform_data_offset,
                path,
            });
        }
        info.dynamic_header = Some(dynamic);
        Ok(info)
    }
}
