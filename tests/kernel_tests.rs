//! Tests for kernel resolution.
//!
//! Uses a temporary cache directory per test.

use guestinit::kernel::{InMemoryKernelLoader, KernelLoader};
use guestinit::{CpuArchitecture, DirectoryKernelLoader, Error, KernelImage};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

fn loader() -> (TempDir, DirectoryKernelLoader) {
    let dir = TempDir::new().unwrap();
    let loader = DirectoryKernelLoader::new(dir.path());
    (dir, loader)
}

// =============================================================================
// Directory Cache Tests
// =============================================================================

#[tokio::test]
async fn test_install_then_load() {
    let (_dir, loader) = loader();
    let arch = CpuArchitecture::Arm64;
    assert!(!loader.has_kernel(arch));

    let path = loader.install(arch, b"arm64 kernel").await.unwrap();
    assert_eq!(path, loader.kernel_path(arch));
    assert!(loader.has_kernel(arch));
    assert!(!loader.has_kernel(CpuArchitecture::X86_64));

    let image = loader.load_for_architecture(arch).await.unwrap();
    assert_eq!(image.architecture(), arch);
    assert_eq!(image.data(), b"arm64 kernel");
    assert_eq!(image.digest(), hex::encode(Sha256::digest(b"arm64 kernel")));
}

#[tokio::test]
async fn test_cached_load_uses_same_files() {
    let (_dir, loader) = loader();
    let arch = CpuArchitecture::X86_64;
    loader.install(arch, b"bzImage").await.unwrap();

    let image = loader.load_cached(arch, true).await.unwrap();
    assert_eq!(image.len(), 7);
}

#[tokio::test]
async fn test_missing_kernel() {
    let (_dir, loader) = loader();
    let err = loader
        .load_for_architecture(CpuArchitecture::X86_64)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::KernelLoad {
            arch: CpuArchitecture::X86_64,
            ..
        }
    ));
    assert!(err.is_boot_preparation());
}

#[tokio::test]
async fn test_empty_kernel_rejected() {
    let (_dir, loader) = loader();
    let arch = CpuArchitecture::X86_64;
    let path = loader.kernel_path(arch);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"").unwrap();

    assert!(matches!(
        loader.load_for_architecture(arch).await,
        Err(Error::KernelLoad { .. })
    ));
}

#[tokio::test]
async fn test_digest_mismatch_detected() {
    let (_dir, loader) = loader();
    let arch = CpuArchitecture::X86_64;
    let path = loader.install(arch, b"original").await.unwrap();
    std::fs::write(&path, b"tampered").unwrap();

    let err = loader.load_for_architecture(arch).await.unwrap_err();
    match err {
        Error::KernelDigestMismatch {
            path: reported,
            actual,
            ..
        } => {
            assert_eq!(reported, path);
            assert_eq!(actual, hex::encode(Sha256::digest(b"tampered")));
        }
        other => panic!("expected digest mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sha256sum_style_digest_accepted() {
    let (_dir, loader) = loader();
    let arch = CpuArchitecture::Arm64;
    let path = loader.kernel_path(arch);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"kernel").unwrap();

    let digest = hex::encode(Sha256::digest(b"kernel"));
    let digest_file = path.with_file_name("vmlinux.sha256");
    std::fs::write(&digest_file, format!("sha256:{digest}  vmlinux\n")).unwrap();

    assert!(loader.load_for_architecture(arch).await.is_ok());

    std::fs::write(&digest_file, "not-a-digest\n").unwrap();
    assert!(matches!(
        loader.load_for_architecture(arch).await,
        Err(Error::KernelLoad { .. })
    ));
}

#[tokio::test]
async fn test_kernel_without_digest_loads() {
    let (_dir, loader) = loader();
    let arch = CpuArchitecture::X86_64;
    let path = loader.kernel_path(arch);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"unverified").unwrap();

    let image = loader.load_for_architecture(arch).await.unwrap();
    assert_eq!(image.data(), b"unverified");
}

#[test]
fn test_default_root_under_cache() {
    let root = DirectoryKernelLoader::default_root();
    assert!(root.ends_with("guestinit/kernels") || root.ends_with(".guestinit/kernels"));
}

// =============================================================================
// In-Memory Loader Tests
// =============================================================================

#[tokio::test]
async fn test_in_memory_loader_per_arch() {
    let loader = InMemoryKernelLoader::new()
        .with_image(KernelImage::new(CpuArchitecture::X86_64, b"x".to_vec()));

    assert!(loader.load_for_architecture(CpuArchitecture::X86_64).await.is_ok());
    assert!(matches!(
        loader.load_cached(CpuArchitecture::Arm64, true).await,
        Err(Error::KernelLoad { .. })
    ));
}
