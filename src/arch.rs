//! Guest CPU architecture and host detection.
//!
//! The architecture set is closed: every guest is either `x86_64` or
//! `arm64`. Parsing a platform identifier never falls back to a default;
//! an unknown string is an error.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// CPU architecture of the guest (and of the hypervisor it runs on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CpuArchitecture {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "arm64")]
    Arm64,
}

impl CpuArchitecture {
    /// Parses a platform identifier.
    ///
    /// Accepts `amd64`/`x86_64` and `arm64`/`aarch64`. Anything else is
    /// [`Error::UnsupportedArchitecture`].
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "amd64" | "x86_64" => Ok(Self::X86_64),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            other => Err(Error::UnsupportedArchitecture(other.to_string())),
        }
    }

    /// Returns the architecture of the host this binary was built for.
    pub fn native() -> Result<Self> {
        Self::parse(std::env::consts::ARCH)
    }

    /// Canonical name, as used in kernel cache paths and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Arm64 => "arm64",
        }
    }

    /// OCI platform architecture string (`amd64` / `arm64`).
    pub fn oci_name(&self) -> &'static str {
        match self {
            Self::X86_64 => "amd64",
            Self::Arm64 => "arm64",
        }
    }

    /// Kernel serial console device for this architecture.
    pub fn console_device(&self) -> &'static str {
        match self {
            Self::X86_64 => "ttyS0",
            Self::Arm64 => "ttyAMA0",
        }
    }
}

impl fmt::Display for CpuArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CpuArchitecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Returns true if hardware virtualization looks usable on this host.
///
/// This is a cheap probe used for diagnostics; opening the hypervisor is
/// still the authoritative check.
pub fn host_has_hypervisor() -> bool {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::MetadataExt;

        match std::fs::metadata("/dev/kvm") {
            Ok(meta) => meta.mode() & 0o666 != 0,
            Err(_) => false,
        }
    }

    #[cfg(target_os = "macos")]
    {
        // Hypervisor.framework is present on all supported macOS releases;
        // only Apple Silicon hosts run arm64 guests natively.
        cfg!(target_arch = "aarch64")
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_matches_target() {
        #[cfg(target_arch = "x86_64")]
        assert_eq!(CpuArchitecture::native().unwrap(), CpuArchitecture::X86_64);

        #[cfg(target_arch = "aarch64")]
        assert_eq!(CpuArchitecture::native().unwrap(), CpuArchitecture::Arm64);
    }

    #[test]
    fn test_display_roundtrips_through_parse() {
        for arch in [CpuArchitecture::X86_64, CpuArchitecture::Arm64] {
            assert_eq!(arch.to_string().parse::<CpuArchitecture>().unwrap(), arch);
        }
    }
}
