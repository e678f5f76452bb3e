//! # Device Contracts
//!
//! Narrow interfaces to the collaborators that back the guest's virtio
//! devices. The core never looks inside them beyond what is listed here:
//!
//! - [`ContainerFs`]: stat-style lookup of container paths, plus `close`
//! - [`VirtioFsBackend`]: the virtio-fs device serving a container tree
//!   under a mount tag
//! - [`NetworkBackend`]: internet toggle plus `close`; packet processing
//!   and DNS serving stay opaque
//!
//! A [`DeviceTemplate`] pairs one backend with the guest architecture it
//! was prepared for and is attached to a machine at creation time.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::arch::CpuArchitecture;
use crate::constants::{GUEST_MAC, ROOTFS_TAG};
use crate::error::{Error, Result};

// =============================================================================
// Container Filesystem
// =============================================================================

/// Result of a successful lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub is_dir: bool,
    /// Permission bits (`0o7777`).
    pub mode: u32,
}

impl FileInfo {
    pub fn dir(mode: u32) -> Self {
        Self { is_dir: true, mode }
    }

    pub fn file(mode: u32) -> Self {
        Self {
            is_dir: false,
            mode,
        }
    }

    /// True for a regular file with at least one execute bit.
    pub fn is_executable(&self) -> bool {
        !self.is_dir && self.mode & 0o111 != 0
    }
}

/// Container root filesystem as seen from the host.
///
/// Paths are absolute within the container (`/bin/sh`).
pub trait ContainerFs: Send + Sync {
    /// Stats `path`, returning `None` if it does not exist.
    fn lookup(&self, path: &str) -> Result<Option<FileInfo>>;

    fn close(&self) -> Result<()>;
}

/// Normalises a container path: absolute, no `.`/`..`/empty segments.
///
/// `..` never climbs above `/`.
pub fn normalize_container_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// In-memory container tree.
#[derive(Debug, Default)]
pub struct MemoryFs {
    entries: RwLock<BTreeMap<String, FileInfo>>,
    closed: AtomicBool,
}

impl MemoryFs {
    pub fn new() -> Self {
        let fs = Self::default();
        if let Ok(mut entries) = fs.entries.write() {
            entries.insert("/".to_string(), FileInfo::dir(0o755));
        }
        fs
    }

    /// Adds a directory and any missing parents.
    pub fn with_dir(self, path: &str) -> Self {
        self.insert(path, FileInfo::dir(0o755));
        self
    }

    /// Adds a regular file and any missing parent directories.
    pub fn with_file(self, path: &str, mode: u32) -> Self {
        self.insert(path, FileInfo::file(mode));
        self
    }

    pub fn insert(&self, path: &str, info: FileInfo) {
        let path = normalize_container_path(path);
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        let mut parent = Path::new(&path).parent();
        while let Some(p) = parent {
            let key = p.to_string_lossy().into_owned();
            entries.entry(key).or_insert(FileInfo::dir(0o755));
            parent = p.parent();
        }
        entries.insert(path, info);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ContainerFs for MemoryFs {
    fn lookup(&self, path: &str) -> Result<Option<FileInfo>> {
        if self.is_closed() {
            return Err(Error::DeviceSetup {
                device: "memory-fs".to_string(),
                reason: "filesystem closed".to_string(),
            });
        }
        let entries = self
            .entries
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?;
        Ok(entries.get(&normalize_container_path(path)).copied())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Container tree backed by an unpacked rootfs directory on the host.
#[derive(Debug, Clone)]
pub struct HostDirFs {
    root: PathBuf,
}

impl HostDirFs {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::DeviceSetup {
                device: "rootfs".to_string(),
                reason: format!("{} is not a directory", root.display()),
            });
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, path: &str) -> PathBuf {
        let normalized = normalize_container_path(path);
        let mut out = self.root.clone();
        for comp in Path::new(&normalized).components() {
            if let Component::Normal(c) = comp {
                out.push(c);
            }
        }
        out
    }
}

impl ContainerFs for HostDirFs {
    fn lookup(&self, path: &str) -> Result<Option<FileInfo>> {
        let host = self.host_path(path);
        match std::fs::metadata(&host) {
            Ok(meta) => {
                #[cfg(unix)]
                let mode = {
                    use std::os::unix::fs::PermissionsExt;
                    meta.permissions().mode() & 0o7777
                };
                #[cfg(not(unix))]
                let mode = if meta.permissions().readonly() { 0o555 } else { 0o755 };
                Ok(Some(FileInfo {
                    is_dir: meta.is_dir(),
                    mode,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// virtio-fs
// =============================================================================

/// virtio-fs device backend serving a container tree under a tag.
pub struct VirtioFsBackend {
    tag: String,
    root: RwLock<Option<Arc<dyn ContainerFs>>>,
}

impl VirtioFsBackend {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            root: RwLock::new(None),
        }
    }

    /// Backend for the container root filesystem.
    pub fn rootfs() -> Self {
        Self::new(ROOTFS_TAG)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Sets the tree served to the guest.
    pub fn set_abstract_root(&self, root: Arc<dyn ContainerFs>) -> Result<()> {
        let mut slot = self
            .root
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?;
        *slot = Some(root);
        debug!(tag = %self.tag, "virtio-fs root attached");
        Ok(())
    }

    /// Stops serving the current tree and hands it back.
    pub fn detach_root(&self) -> Result<Option<Arc<dyn ContainerFs>>> {
        let mut slot = self
            .root
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?;
        let root = slot.take();
        if root.is_some() {
            debug!(tag = %self.tag, "virtio-fs root detached");
        }
        Ok(root)
    }

    pub fn abstract_root(&self) -> Option<Arc<dyn ContainerFs>> {
        self.root.read().ok().and_then(|slot| slot.clone())
    }
}

impl fmt::Debug for VirtioFsBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtioFsBackend")
            .field("tag", &self.tag)
            .field("has_root", &self.abstract_root().is_some())
            .finish()
    }
}

// =============================================================================
// Network
// =============================================================================

/// User-space network stack behind the guest's virtio-net device.
pub trait NetworkBackend: Send + Sync {
    fn set_internet_access_enabled(&self, enabled: bool);

    fn internet_access_enabled(&self) -> bool;

    fn close(&self) -> Result<()>;
}

/// Network backend with no uplink. Frames from the guest go nowhere.
#[derive(Debug, Default)]
pub struct IsolatedNetwork {
    internet: AtomicBool,
    closed: AtomicBool,
}

impl IsolatedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl NetworkBackend for IsolatedNetwork {
    fn set_internet_access_enabled(&self, enabled: bool) {
        self.internet.store(enabled, Ordering::SeqCst);
    }

    fn internet_access_enabled(&self) -> bool {
        self.internet.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Templates
// =============================================================================

/// One virtio device to attach at machine creation.
#[derive(Clone)]
pub enum DeviceTemplate {
    Fs {
        backend: Arc<VirtioFsBackend>,
        arch: CpuArchitecture,
    },
    Net {
        backend: Arc<dyn NetworkBackend>,
        mac: [u8; 6],
        arch: CpuArchitecture,
    },
}

impl DeviceTemplate {
    pub fn virtio_fs(backend: Arc<VirtioFsBackend>, arch: CpuArchitecture) -> Self {
        Self::Fs { backend, arch }
    }

    pub fn virtio_net(backend: Arc<dyn NetworkBackend>, arch: CpuArchitecture) -> Self {
        Self::Net {
            backend,
            mac: GUEST_MAC,
            arch,
        }
    }

    pub fn architecture(&self) -> CpuArchitecture {
        match self {
            Self::Fs { arch, .. } | Self::Net { arch, .. } => *arch,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fs { .. } => "virtio-fs",
            Self::Net { .. } => "virtio-net",
        }
    }
}

impl fmt::Debug for DeviceTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fs { backend, arch } => f
                .debug_struct("Fs")
                .field("tag", &backend.tag())
                .field("arch", arch)
                .finish(),
            Self::Net { mac, arch, .. } => f
                .debug_struct("Net")
                .field("mac", mac)
                .field("arch", arch)
                .finish(),
        }
    }
}
