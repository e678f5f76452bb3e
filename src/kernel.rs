//! # Kernel Resolution
//!
//! Produces a bootable kernel image for a guest architecture.
//!
//! ## Cache Layout
//!
//! [`DirectoryKernelLoader`] keeps one kernel per architecture:
//!
//! ```text
//! ~/.cache/guestinit/kernels/
//! ├── x86_64/
//! │   ├── vmlinux
//! │   └── vmlinux.sha256   (optional, hex digest)
//! └── arm64/
//!     └── vmlinux
//! ```
//!
//! When a digest file is present the image is verified with SHA-256 before
//! it is handed out. A mismatch is a definite boot-preparation error.
//! Fetching kernels over the network belongs to an external collaborator;
//! this loader only serves what has been installed.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::arch::CpuArchitecture;
use crate::error::{Error, Result};

const KERNEL_FILE: &str = "vmlinux";
const DIGEST_FILE: &str = "vmlinux.sha256";

/// Bootable kernel image for one architecture.
#[derive(Clone)]
pub struct KernelImage {
    arch: CpuArchitecture,
    data: Arc<[u8]>,
    digest: String,
}

impl KernelImage {
    pub fn new(arch: CpuArchitecture, data: impl Into<Arc<[u8]>>) -> Self {
        let data = data.into();
        let digest = hex::encode(Sha256::digest(&data));
        Self { arch, data, digest }
    }

    pub fn architecture(&self) -> CpuArchitecture {
        self.arch
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Hex SHA-256 of the image.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for KernelImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelImage")
            .field("arch", &self.arch)
            .field("len", &self.data.len())
            .field("digest", &self.digest)
            .finish()
    }
}

/// Source of kernel images.
#[async_trait]
pub trait KernelLoader: Send + Sync {
    async fn load_for_architecture(&self, arch: CpuArchitecture) -> Result<KernelImage>;

    /// Cache-aware variant. Loaders without a separate cache ignore
    /// `prefer_cache`.
    async fn load_cached(&self, arch: CpuArchitecture, prefer_cache: bool) -> Result<KernelImage> {
        let _ = prefer_cache;
        self.load_for_architecture(arch).await
    }
}

/// Loads kernels from a per-architecture directory cache.
#[derive(Debug, Clone)]
pub struct DirectoryKernelLoader {
    root: PathBuf,
}

impl DirectoryKernelLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Loader rooted at the platform cache directory.
    pub fn with_default_root() -> Self {
        Self::new(Self::default_root())
    }

    pub fn default_root() -> PathBuf {
        match dirs::cache_dir() {
            Some(cache) => cache.join("guestinit").join("kernels"),
            None => PathBuf::from(".guestinit").join("kernels"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn kernel_path(&self, arch: CpuArchitecture) -> PathBuf {
        self.root.join(arch.as_str()).join(KERNEL_FILE)
    }

    fn digest_path(&self, arch: CpuArchitecture) -> PathBuf {
        self.root.join(arch.as_str()).join(DIGEST_FILE)
    }

    pub fn has_kernel(&self, arch: CpuArchitecture) -> bool {
        self.kernel_path(arch).is_file()
    }

    /// Installs a kernel and its digest into the cache.
    ///
    /// Both files are written to a temporary name and renamed into place.
    pub async fn install(&self, arch: CpuArchitecture, data: &[u8]) -> Result<PathBuf> {
        let dir = self.root.join(arch.as_str());
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.kernel_path(arch);
        let digest = hex::encode(Sha256::digest(data));

        write_atomic(&path, data).await?;
        write_atomic(&self.digest_path(arch), format!("{digest}\n").as_bytes()).await?;

        info!(arch = %arch, path = %path.display(), "installed kernel image");
        Ok(path)
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
    tokio::fs::write(&temp, data).await?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Parses a digest file, accepting an optional `sha256:` prefix and
/// trailing `sha256sum`-style file name.
fn parse_digest_file(contents: &str) -> Option<String> {
    let token = contents.split_whitespace().next()?;
    let hash = token.strip_prefix("sha256:").unwrap_or(token);
    if hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(hash.to_ascii_lowercase())
    } else {
        None
    }
}

#[async_trait]
impl KernelLoader for DirectoryKernelLoader {
    async fn load_for_architecture(&self, arch: CpuArchitecture) -> Result<KernelImage> {
        let path = self.kernel_path(arch);
        debug!(arch = %arch, path = %path.display(), "loading kernel");

        let data = tokio::fs::read(&path).await.map_err(|e| Error::KernelLoad {
            arch,
            reason: format!("{}: {e}", path.display()),
        })?;
        if data.is_empty() {
            return Err(Error::KernelLoad {
                arch,
                reason: format!("{} is empty", path.display()),
            });
        }

        let image = KernelImage::new(arch, data);

        match tokio::fs::read_to_string(self.digest_path(arch)).await {
            Ok(contents) => {
                let expected = parse_digest_file(&contents).ok_or_else(|| Error::KernelLoad {
                    arch,
                    reason: format!("malformed digest file for {}", path.display()),
                })?;
                if expected != image.digest() {
                    return Err(Error::KernelDigestMismatch {
                        path,
                        expected,
                        actual: image.digest().to_string(),
                    });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(arch = %arch, "kernel has no digest file, skipping verification");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(image)
    }
}

/// Serves kernels held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKernelLoader {
    images: HashMap<CpuArchitecture, KernelImage>,
}

impl InMemoryKernelLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, image: KernelImage) -> Self {
        self.images.insert(image.architecture(), image);
        self
    }
}

#[async_trait]
impl KernelLoader for InMemoryKernelLoader {
    async fn load_for_architecture(&self, arch: CpuArchitecture) -> Result<KernelImage> {
        self.images.get(&arch).cloned().ok_or_else(|| Error::KernelLoad {
            arch,
            reason: "no kernel image registered".to_string(),
        })
    }
}
