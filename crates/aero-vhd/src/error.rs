use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, DiskError>;

/// Unified error type for VHD image and content-stream operations.
///
/// Open-time failures (`InvalidFooter`, `InvalidDynamicHeader`, the chain variants) are fatal
/// for the image being opened; `OutOfBounds` and `CapacityExceeded` only fail the offending
/// call. Backend I/O failures are propagated unchanged through [`DiskError::Io`].
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("unaligned buffer length {len} (expected multiple of {alignment})")]
    UnalignedLength { len: usize, alignment: usize },

    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("invalid vhd footer: {0}")]
    InvalidFooter(&'static str),

    #[error("invalid vhd dynamic header: {0}")]
    InvalidDynamicHeader(&'static str),

    #[error("corrupt disk image: {0}")]
    CorruptImage(&'static str),

    /// The image found at a parent location is not the parent recorded by the child.
    #[error("invalid disk chain: expected parent {expected}, found {found} at {}", path.display())]
    ParentIdMismatch {
        path: PathBuf,
        expected: Uuid,
        found: Uuid,
    },

    /// None of the candidate parent locations exist.
    #[error("failed to find parent for disk '{child}' (tried {} locations)", candidates.len())]
    ParentNotFound {
        child: String,
        candidates: Vec<PathBuf>,
    },

    #[error("invalid disk chain: {0}")]
    BrokenChain(String),

    #[error("capacity cannot be changed: {0}")]
    CapacityExceeded(&'static str),

    #[error("attempt to write to a read-only disk")]
    ReadOnly,

    #[error("unsupported disk image feature: {0}")]
    Unsupported(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DiskError {
    /// Whether this error reports a broken differencing chain.
    pub fn is_chain_integrity(&self) -> bool {
        matches!(
            self,
            Self::ParentIdMismatch { .. } | Self::ParentNotFound { .. } | Self::BrokenChain(_)
        )
    }

    /// Whether this error reports a malformed footer or dynamic header.
    pub fn is_format(&self) -> bool {
        matches!(self, Self::InvalidFooter(_) | Self::InvalidDynamicHeader(_))
    }
}

impl From<DiskError> for std::io::Error {
    fn from(err: DiskError) -> Self {
        use std::io::{Error, ErrorKind};

        match err {
            DiskError::Io(inner) => inner,
            err @ (DiskError::UnalignedLength { .. }
            | DiskError::OffsetOverflow
            | DiskError::InvalidConfig(_)) => Error::new(ErrorKind::InvalidInput, err),
            err @ DiskError::OutOfBounds { .. } => Error::new(ErrorKind::UnexpectedEof, err),
            err @ DiskError::ReadOnly => Error::new(ErrorKind::PermissionDenied, err),
            err @ DiskError::ParentNotFound { .. } => Error::new(ErrorKind::NotFound, err),
            err @ (DiskError::CapacityExceeded(_) | DiskError::Unsupported(_)) => {
                Error::new(ErrorKind::Unsupported, err)
            }
            err @ (DiskError::InvalidFooter(_)
            | DiskError::InvalidDynamicHeader(_)
            | DiskError::CorruptImage(_)
            | DiskError::ParentIdMismatch { .. }
            | DiskError::BrokenChain(_)) => Error::new(ErrorKind::InvalidData, err),
        }
    }
}
