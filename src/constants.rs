//! # Boot Constants
//!
//! Timeouts, resource bounds and guest network defaults shared by the
//! builder, the execution engine and boot preparation. These constants are
//! the single source of truth for the values the guest bootstrap relies on.
//!
//! ## Cross-References
//!
//! - [`crate::init`]: guest network defaults, hostname, `TERM`
//! - [`crate::session`]: handshake and stop timeouts
//! - [`crate::engine`]: step budget
//! - [`crate::boot`]: vCPU / memory bounds, `PATH` fallback

use std::net::Ipv4Addr;
use std::time::Duration;

// =============================================================================
// Timeouts
// =============================================================================
//
// Every wait on the guest is bounded. A guest that never reaches the
// injection point, or never finishes, must not leave the caller hung.
// =============================================================================

/// Deadline for the handshake program (10 seconds).
///
/// The kernel must boot and the trampoline must accept its first instruction
/// within this window. Expiry is a definite boot failure and is not retried.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bounded wait used when tearing a running container down.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Extra time `Session::stop` allows for its own bookkeeping after the
/// caller-supplied timeout has elapsed.
pub const STOP_GRACE: Duration = Duration::from_millis(100);

// =============================================================================
// Execution Limits
// =============================================================================

/// Maximum host-side instructions interpreted per program run.
///
/// Bootstrap programs are straight-line code with a handful of branches;
/// a budget this large is only reached by a program that loops forever.
pub const DEFAULT_STEP_BUDGET: u64 = 1_000_000;

/// Size of the guest scratch arena strings and buffers are materialised into.
pub const GUEST_SCRATCH_SIZE: usize = 64 * 1024;

// =============================================================================
// Resource Limits
// =============================================================================

/// Default vCPUs for a container VM.
pub const DEFAULT_VCPUS: u32 = 1;

/// Maximum vCPUs for a container VM.
pub const MAX_VCPUS: u32 = 8;

/// Default guest memory (MiB).
pub const DEFAULT_VM_MEMORY_MIB: u64 = 1024;

/// Maximum guest memory (MiB).
pub const MAX_VM_MEMORY_MIB: u64 = 4096;

// =============================================================================
// Guest Identity and Network
// =============================================================================
//
// The user-space network stack serves the gateway and DNS from the same
// address; the guest gets a fixed /24 on its single interface.
// =============================================================================

/// Hostname assigned to the guest when none is configured.
pub const DEFAULT_HOSTNAME: &str = "guest";

/// Guest interface configured by the init program.
pub const DEFAULT_GUEST_INTERFACE: &str = "eth0";

/// Static guest address.
pub const DEFAULT_GUEST_IP: Ipv4Addr = Ipv4Addr::new(10, 42, 0, 2);

/// Guest netmask (/24).
pub const DEFAULT_GUEST_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Host-side gateway and DNS server address.
pub const DEFAULT_GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 42, 0, 1);

/// virtio-fs tag of the container root filesystem.
pub const ROOTFS_TAG: &str = "rootfs";

/// MAC address of the guest network device.
pub const GUEST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

// =============================================================================
// Environment
// =============================================================================

/// `TERM` value injected when the container environment lacks one.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Search path used when the container environment has no `PATH`.
pub const DEFAULT_PATH_ENV: &str = "/bin:/usr/bin";

/// Default working directory inside the container.
pub const DEFAULT_WORKDIR: &str = "/";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_inside_guest_subnet() {
        let ip = u32::from(DEFAULT_GUEST_IP);
        let gw = u32::from(DEFAULT_GATEWAY);
        let mask = u32::from(DEFAULT_GUEST_NETMASK);
        assert_eq!(ip & mask, gw & mask);
        assert_ne!(ip, gw);
    }

    #[test]
    fn test_resource_defaults_within_limits() {
        assert!(DEFAULT_VCPUS <= MAX_VCPUS);
        assert!(DEFAULT_VM_MEMORY_MIB <= MAX_VM_MEMORY_MIB);
    }
}
