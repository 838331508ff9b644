//! Differencing chain resolution.
//!
//! A [`Disk`] is an ordered list of image layers, leaf first. Layer `i`'s parent is layer
//! `i + 1`; the last layer must not need a parent. Content is composed bottom-up: the root's
//! content stream becomes the owned parent of the layer above it, and so on up to the leaf,
//! which is the only layer ever written to.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use uuid::Uuid;

use crate::disk::ParentDisk;
use crate::dynamic::WriteOutcome;
use crate::footer::DiskType;
use crate::image::{
    DynamicDiskConfig, FixedDiskConfig, ParentLocation, ParentLocationKind, ParentLocations,
    VhdContent, VhdImage,
};
use crate::range_set::RangeSet;
use crate::{DiskError, Result, StdFileBackend, StorageBackend, VirtualDisk};

/// Upper bound on layers in one chain, guarding against parent cycles.
pub const MAX_CHAIN_DEPTH: usize = 256;

/// Finds and opens the files a differencing chain refers to.
pub trait FileLocator {
    type Backend: StorageBackend;

    fn exists(&self, path: &Path) -> bool;

    fn open(&self, path: &Path, writable: bool) -> Result<Self::Backend>;

    /// Turns a location stored in `child` into a path this locator can open.
    ///
    /// Absolute locations are used as-is; relative locations and display names are resolved
    /// against the directory containing `child`.
    fn resolve(&self, child: &Path, location: &ParentLocation) -> PathBuf {
        let stored = normalize_separators(&location.path);
        match location.kind {
            ParentLocationKind::Absolute => PathBuf::from(stored),
            ParentLocationKind::Relative | ParentLocationKind::DisplayName => child
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join(stored),
        }
    }
}

/// Locator over the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileLocator;

impl FileLocator for LocalFileLocator {
    type Backend = StdFileBackend;

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn open(&self, path: &Path, writable: bool) -> Result<StdFileBackend> {
        if writable {
            StdFileBackend::open_read_write(path)
        } else {
            StdFileBackend::open_read_only(path)
        }
    }
}

fn normalize_separators(path: &str) -> String {
    if cfg!(windows) {
        path.to_string()
    } else {
        path.replace('\\', "/")
    }
}

/// Path of `target` relative to the directory `base`, using `..` where needed.
fn relative_path(base: &Path, target: &Path) -> PathBuf {
    let base: Vec<Component<'_>> = base.components().collect();
    let target: Vec<Component<'_>> = target.components().collect();
    let common = base
        .iter()
        .zip(&target)
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..base.len() {
        out.push("..");
    }
    for c in &target[common..] {
        out.push(c.as_os_str());
    }
    out
}

/// Summary of one layer of a [`Disk`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerInfo {
    /// Where the layer was found; `None` for layers supplied already opened.
    pub path: Option<PathBuf>,
    pub disk_type: DiskType,
    pub capacity_bytes: u64,
    pub unique_id: Uuid,
    /// Recorded parent identity, for differencing layers.
    pub parent_unique_id: Option<Uuid>,
}

impl LayerInfo {
    fn of<B: StorageBackend>(path: Option<PathBuf>, image: &VhdImage<B>) -> Self {
        Self {
            path,
            disk_type: image.disk_type(),
            capacity_bytes: image.capacity_bytes(),
            unique_id: image.unique_id(),
            parent_unique_id: image.needs_parent().then(|| image.parent_unique_id()),
        }
    }
}

/// A complete, validated differencing chain exposed as one logical disk.
///
/// Writes go to the leaf layer only; parent layers are read through.
pub struct Disk<B: StorageBackend + 'static> {
    layers: Vec<LayerInfo>,
    content: VhdContent<'static, B>,
}

impl Disk<StdFileBackend> {
    /// Opens the image at `path` and every parent it refers to, on the local filesystem.
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        Self::open_with_locator(&LocalFileLocator, path.as_ref(), read_only)
    }

    pub fn create_fixed(path: impl AsRef<Path>, config: FixedDiskConfig) -> Result<Self> {
        let backend = StdFileBackend::create_new(path.as_ref())?;
        let image = VhdImage::create_fixed(backend, config)?;
        Self::compose(vec![(Some(path.as_ref().to_path_buf()), image)])
    }

    pub fn create_dynamic(path: impl AsRef<Path>, config: DynamicDiskConfig) -> Result<Self> {
        let backend = StdFileBackend::create_new(path.as_ref())?;
        let image = VhdImage::create_dynamic(backend, config)?;
        Self::compose(vec![(Some(path.as_ref().to_path_buf()), image)])
    }

    /// Creates a differencing disk at `path` on top of the image at `parent_path`, then opens
    /// the resulting chain read-write.
    pub fn create_differencing(
        path: impl AsRef<Path>,
        parent_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let parent_abs = std::fs::canonicalize(parent_path.as_ref())?;
        let parent = VhdImage::open(StdFileBackend::open_read_only(&parent_abs)?)?;
        let modified = std::fs::metadata(&parent_abs)?.modified()?;

        let child_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => std::fs::canonicalize(dir)?,
            _ => std::env::current_dir()?,
        };
        let locations = ParentLocations {
            absolute_path: parent_abs.to_string_lossy().into_owned(),
            relative_path: relative_path(&child_dir, &parent_abs)
                .to_string_lossy()
                .into_owned(),
            modified,
        };

        let backend = StdFileBackend::create_new(path)?;
        let child = VhdImage::create_differencing(backend, &parent, &locations)?;
        drop(child);
        drop(parent);

        Self::open(path, false)
    }
}

impl<B: StorageBackend + 'static> Disk<B> {
    /// Opens `path` through `locator` and follows parent locations until a layer that needs no
    /// parent is reached.
    ///
    /// Candidates are tried in stored order; the first that exists must carry the unique id
    /// the child recorded, otherwise the open fails without trying further candidates.
    pub fn open_with_locator<L>(locator: &L, path: &Path, read_only: bool) -> Result<Self>
    where
        L: FileLocator<Backend = B>,
    {
        let leaf = VhdImage::open(locator.open(path, !read_only)?)?;
        let mut layers = vec![(path.to_path_buf(), leaf)];

        loop {
            let depth = layers.len();
            let (child_path, child) = match layers.last_mut() {
                Some((p, img)) if img.needs_parent() => (p.clone(), img),
                _ => break,
            };
            if depth >= MAX_CHAIN_DEPTH {
                return Err(DiskError::BrokenChain(format!(
                    "differencing chain deeper than {MAX_CHAIN_DEPTH} layers"
                )));
            }

            let expected = child.parent_unique_id();
            let candidates = child.parent_locations()?;
            let mut tried = Vec::with_capacity(candidates.len());
            let mut found = None;
            for candidate in &candidates {
                let resolved = locator.resolve(&child_path, candidate);
                tracing::debug!(
                    child = %child_path.display(),
                    candidate = %resolved.display(),
                    kind = ?candidate.kind,
                    "probing vhd parent location"
                );
                if locator.exists(&resolved) {
                    found = Some(resolved);
                    break;
                }
                tried.push(resolved);
            }
            let Some(parent_path) = found else {
                return Err(DiskError::ParentNotFound {
                    child: child_path.display().to_string(),
                    candidates: tried,
                });
            };

            let parent = VhdImage::open(locator.open(&parent_path, false)?)?;
            if parent.unique_id() != expected {
                return Err(DiskError::ParentIdMismatch {
                    path: parent_path,
                    expected,
                    found: parent.unique_id(),
                });
            }
            layers.push((parent_path, parent));
        }

        Self::compose(
            layers
                .into_iter()
                .map(|(path, image)| (Some(path), image))
                .collect(),
        )
    }

    /// Builds a disk from already-opened images, leaf first.
    ///
    /// Every layer but the last must be a differencing disk whose recorded parent id matches
    /// the next layer; the last must need no parent.
    pub fn from_images(images: Vec<VhdImage<B>>) -> Result<Self> {
        Self::compose(images.into_iter().map(|image| (None, image)).collect())
    }

    fn compose(layers: Vec<(Option<PathBuf>, VhdImage<B>)>) -> Result<Self> {
        if layers.is_empty() {
            return Err(DiskError::BrokenChain("no layers".into()));
        }
        if layers.len() > MAX_CHAIN_DEPTH {
            return Err(DiskError::BrokenChain(format!(
                "differencing chain deeper than {MAX_CHAIN_DEPTH} layers"
            )));
        }

        let last = layers.len() - 1;
        for (i, (path, image)) in layers.iter().enumerate() {
            let label = || match path {
                Some(p) => p.display().to_string(),
                None => format!("layer {i}"),
            };
            if i < last && !image.needs_parent() {
                return Err(DiskError::BrokenChain(format!(
                    "{} does not take a parent but is followed by another layer",
                    label()
                )));
            }
            if i == last && image.needs_parent() {
                return Err(DiskError::BrokenChain(format!(
                    "{} needs a parent but is the last layer",
                    label()
                )));
            }
            if i < last {
                let (parent_path, parent) = &layers[i + 1];
                if parent.unique_id() != image.parent_unique_id() {
                    return Err(DiskError::ParentIdMismatch {
                        path: parent_path
                            .clone()
                            .unwrap_or_else(|| PathBuf::from(format!("layer {}", i + 1))),
                        expected: image.parent_unique_id(),
                        found: parent.unique_id(),
                    });
                }
            }
        }

        let infos = layers
            .iter()
            .map(|(path, image)| LayerInfo::of(path.clone(), image))
            .collect();

        let mut images = layers.into_iter().map(|(_, image)| image);
        let leaf = images
            .next()
            .ok_or_else(|| DiskError::BrokenChain("no layers".into()))?;
        let mut parent: Option<ParentDisk<'static>> = None;
        for image in images.rev() {
            let content = image.open_content(parent.take())?;
            parent = Some(ParentDisk::owned(content));
        }
        let content = leaf.open_content(parent)?;

        Ok(Self {
            layers: infos,
            content,
        })
    }

    /// Layers, leaf first.
    pub fn layers(&self) -> &[LayerInfo] {
        &self.layers
    }

    pub fn leaf(&self) -> &LayerInfo {
        &self.layers[0]
    }

    pub fn content_mut(&mut self) -> &mut VhdContent<'static, B> {
        &mut self.content
    }

    /// Like [`VirtualDisk::write_at`], reporting blocks allocated in the leaf layer.
    pub fn write_at_tracked(&mut self, offset: u64, buf: &[u8]) -> Result<WriteOutcome> {
        self.content.write_at_tracked(offset, buf)
    }

    pub fn set_auto_commit_footer(&mut self, enabled: bool) -> Result<()> {
        self.content.set_auto_commit_footer(enabled)
    }

    /// Commits the leaf footer and flushes; parent layers are released after the leaf.
    pub fn close(self) -> Result<()> {
        self.content.close()
    }
}

impl<B: StorageBackend + 'static> VirtualDisk for Disk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.content.capacity_bytes()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.content.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.content.write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.content.flush()
    }

    fn is_read_only(&self) -> bool {
        self.content.is_read_only()
    }

    fn extents_in_range(&mut self, offset: u64, len: u64) -> Result<RangeSet> {
        self.content.extents_in_range(offset, len)
    }
}

impl<B: StorageBackend + 'static> std::fmt::Debug for Disk<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disk")
            .field("layers", &self.layers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::SystemTime;

    use super::*;
    use crate::MemBackend;

    const MIB: u64 = 1024 * 1024;

    /// Files live in memory; every open hands out a private copy.
    #[derive(Default)]
    struct MemLocator {
        files: HashMap<PathBuf, Vec<u8>>,
    }

    impl FileLocator for MemLocator {
        type Backend = MemBackend;

        fn exists(&self, path: &Path) -> bool {
            self.files.contains_key(path)
        }

        fn open(&self, path: &Path, writable: bool) -> Result<MemBackend> {
            let data = self
                .files
                .get(path)
                .cloned()
                .ok_or_else(|| DiskError::Io(std::io::ErrorKind::NotFound.into()))?;
            Ok(MemBackend::from_vec(data).with_read_only(!writable))
        }
    }

    fn dynamic_image(fill: Option<(u64, u8)>) -> Vec<u8> {
        let mut backend = MemBackend::new();
        let image = VhdImage::create_dynamic(&mut backend, DynamicDiskConfig::new(4 * MIB)).unwrap();
        if let Some((offset, byte)) = fill {
            let mut content = image.open_content(None).unwrap();
            content.write_at(offset, &[byte; 512]).unwrap();
            content.close().unwrap();
        }
        backend.into_vec()
    }

    fn child_of(parent: &[u8], absolute: &str, relative: &str) -> Vec<u8> {
        let mut parent_backend = MemBackend::from_vec(parent.to_vec());
        let parent = VhdImage::open(&mut parent_backend).unwrap();
        let mut backend = MemBackend::new();
        VhdImage::create_differencing(
            &mut backend,
            &parent,
            &ParentLocations {
                absolute_path: absolute.into(),
                relative_path: relative.into(),
                modified: SystemTime::now(),
            },
        )
        .unwrap();
        backend.into_vec()
    }

    #[test]
    fn resolves_through_absolute_location() {
        let base = dynamic_image(Some((MIB, 0xaa)));
        let child = child_of(&base, "/vms/base.vhd", "base.vhd");
        let mut locator = MemLocator::default();
        locator.files.insert("/vms/base.vhd".into(), base);
        locator.files.insert("/vms/child.vhd".into(), child);

        let mut disk =
            Disk::open_with_locator(&locator, Path::new("/vms/child.vhd"), true).unwrap();
        assert_eq!(disk.layers().len(), 2);
        assert_eq!(disk.layers()[1].path.as_deref(), Some(Path::new("/vms/base.vhd")));
        assert!(disk.is_read_only());

        let mut buf = [0u8; 16];
        disk.read_at(MIB, &mut buf).unwrap();
        assert_eq!(buf, [0xaa; 16]);
    }

    #[test]
    fn falls_back_to_relative_location() {
        let base = dynamic_image(None);
        let child = child_of(&base, "/elsewhere/base.vhd", "sub\\base.vhd");
        let mut locator = MemLocator::default();
        locator.files.insert("/vms/sub/base.vhd".into(), base);
        locator.files.insert("/vms/child.vhd".into(), child);

        let disk = Disk::open_with_locator(&locator, Path::new("/vms/child.vhd"), true).unwrap();
        assert_eq!(
            disk.layers()[1].path.as_deref(),
            Some(Path::new("/vms/sub/base.vhd"))
        );
    }

    #[test]
    fn missing_parent_lists_candidates() {
        let base = dynamic_image(None);
        let child = child_of(&base, "/gone/base.vhd", "base.vhd");
        let mut locator = MemLocator::default();
        locator.files.insert("/vms/child.vhd".into(), child);

        match Disk::open_with_locator(&locator, Path::new("/vms/child.vhd"), true).unwrap_err() {
            DiskError::ParentNotFound { child, candidates } => {
                assert_eq!(child, "/vms/child.vhd");
                assert_eq!(
                    candidates,
                    vec![
                        PathBuf::from("/gone/base.vhd"),
                        PathBuf::from("/vms/base.vhd"),
                        PathBuf::from("/vms/base.vhd"),
                    ]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn replaced_parent_is_rejected() {
        let base = dynamic_image(None);
        let child = child_of(&base, "/vms/base.vhd", "base.vhd");
        let impostor = dynamic_image(None);
        let mut locator = MemLocator::default();
        locator.files.insert("/vms/base.vhd".into(), impostor);
        locator.files.insert("/vms/child.vhd".into(), child);

        let err = Disk::open_with_locator(&locator, Path::new("/vms/child.vhd"), true).unwrap_err();
        assert!(matches!(err, DiskError::ParentIdMismatch { .. }));
        assert!(err.is_chain_integrity());
    }

    #[test]
    fn from_images_validates_order_and_identity() {
        let base = dynamic_image(None);
        let child = child_of(&base, "/vms/base.vhd", "base.vhd");
        let open = |bytes: &[u8]| VhdImage::open(MemBackend::from_vec(bytes.to_vec())).unwrap();

        let disk = Disk::from_images(vec![open(&child), open(&base)]).unwrap();
        assert_eq!(disk.layers()[0].disk_type, DiskType::Differencing);
        assert_eq!(disk.layers()[1].parent_unique_id, None);

        let err = Disk::from_images(vec![open(&base), open(&child)]).unwrap_err();
        assert!(matches!(err, DiskError::BrokenChain(_)));

        let err = Disk::from_images(vec![open(&child)]).unwrap_err();
        assert!(matches!(err, DiskError::BrokenChain(_)));

        let other = dynamic_image(None);
        let err = Disk::from_images(vec![open(&child), open(&other)]).unwrap_err();
        assert!(matches!(err, DiskError::ParentIdMismatch { .. }));

        assert!(Disk::<MemBackend>::from_images(Vec::new()).is_err());
    }

    #[test]
    fn leaf_writes_do_not_reach_parent() {
        let base = dynamic_image(Some((0, 0xaa)));
        let child = child_of(&base, "/vms/base.vhd", "base.vhd");
        let open = |bytes: &[u8]| VhdImage::open(MemBackend::from_vec(bytes.to_vec())).unwrap();

        let mut disk = Disk::from_images(vec![open(&child), open(&base)]).unwrap();
        let outcome = disk.write_at_tracked(100, &[0xbb; 4]).unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Allocated {
                first_block: 0,
                count: 1
            }
        );

        let mut buf = [0u8; 8];
        disk.read_at(98, &mut buf).unwrap();
        assert_eq!(buf, [0xaa, 0xaa, 0xbb, 0xbb, 0xbb, 0xbb, 0xaa, 0xaa]);
        let extents = disk.extents().unwrap();
        assert_eq!(extents.total_len(), 512);
    }

    #[test]
    fn relative_path_between_directories() {
        assert_eq!(
            relative_path(Path::new("/a/b"), Path::new("/a/b/p.vhd")),
            PathBuf::from("p.vhd")
        );
        assert_eq!(
            relative_path(Path::new("/a/b"), Path::new("/a/c/p.vhd")),
            PathBuf::from("../c/p.vhd")
        );
    }
}
