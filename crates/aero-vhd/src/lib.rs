//! VHD disk images: fixed, dynamic and differencing layers.
//!
//! Dynamic and differencing images allocate storage lazily, one block at a time, through a
//! block allocation table and per-block sector bitmaps. Differencing images store only what
//! diverges from a parent image and read everything else through it. This crate provides:
//!
//! - [`StorageBackend`]: byte-addressed image file access ([`MemBackend`], [`StdFileBackend`])
//! - [`VirtualDisk`]: the logical content stream of a layer or chain
//! - [`VhdImage`]: open/create a single image file and decode its metadata
//! - [`DynamicDisk`]: read/write content of one dynamic or differencing layer
//! - [`Disk`]: a whole differencing chain, with parents located through a [`FileLocator`]
//! - [`DynamicDiskBuilder`]: serialize any sparse [`VirtualDisk`] into a new dynamic image
//! - [`FileChecker`]: non-mutating structural validation
//!
//! Nothing here is internally synchronized; callers that share a layer across threads must
//! serialize access themselves.

mod backend;
pub mod bat;
mod builder;
mod chain;
mod checker;
mod cursor;
mod disk;
mod dynamic;
mod dynamic_header;
mod error;
mod footer;
mod geometry;
mod image;
mod info;
mod parent_locator;
mod range_set;
mod util;

pub use backend::{MemBackend, StdFileBackend, StorageBackend};
pub use bat::BlockAllocationTable;
pub use builder::{BuildSummary, DynamicDiskBuilder};
pub use chain::{Disk, FileLocator, LayerInfo, LocalFileLocator, MAX_CHAIN_DEPTH};
pub use checker::{CheckReport, FileChecker, Finding, Severity};
pub use cursor::DiskCursor;
pub use disk::{ParentDisk, RawDisk, VirtualDisk, ZeroDisk, SECTOR_SIZE};
pub use dynamic::{DynamicDisk, WriteOutcome};
pub use dynamic_header::{
    DynamicHeader, DEFAULT_BLOCK_SIZE, DYNAMIC_HEADER_COOKIE, DYNAMIC_HEADER_SIZE,
    PARENT_LOCATOR_COUNT,
};
pub use error::{DiskError, Result};
pub use footer::{
    system_time_to_vhd_timestamp, vhd_timestamp_to_system_time, DiskType, Footer, FOOTER_COOKIE,
    FOOTER_SIZE,
};
pub use geometry::Geometry;
pub use image::{
    DynamicDiskConfig, FixedDiskConfig, ParentLocation, ParentLocationKind, ParentLocations,
    VhdContent, VhdImage, MAX_HEADER_CHAIN,
};
pub use info::{DiskImageInfo, DynamicHeaderInfo, ParentLocatorInfo};
pub use parent_locator::{LocatorKind, ParentLocator};
pub use range_set::{ByteRange, RangeSet};

#[cfg(test)]
mod proptests;
