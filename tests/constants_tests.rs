//! Tests for constants module.
//!
//! Validates that timeouts stay bounded, resource limits are consistent and
//! the guest network defaults describe a usable subnet.

use guestinit::*;
use std::time::Duration;

// =============================================================================
// Timeout Tests
// =============================================================================

#[test]
fn test_handshake_timeout_reasonable() {
    // A kernel with a trampoline boots in well under a second on KVM.
    assert!(
        HANDSHAKE_TIMEOUT >= Duration::from_secs(2),
        "handshake timeout too tight for slow hosts"
    );
    assert!(
        HANDSHAKE_TIMEOUT <= Duration::from_secs(60),
        "handshake timeout too permissive"
    );
}

#[test]
fn test_stop_grace_small() {
    assert!(STOP_GRACE < DEFAULT_STOP_TIMEOUT);
    assert!(STOP_GRACE <= Duration::from_secs(1));
}

// =============================================================================
// Resource Limit Tests
// =============================================================================

#[test]
fn test_resource_defaults_within_limits() {
    assert!(DEFAULT_VCPUS >= 1);
    assert!(DEFAULT_VCPUS <= MAX_VCPUS);
    assert!(DEFAULT_VM_MEMORY_MIB >= 64);
    assert!(DEFAULT_VM_MEMORY_MIB <= MAX_VM_MEMORY_MIB);
}

#[test]
fn test_step_budget_covers_init_program() {
    let cfg = ContainerInitConfig::new(CpuArchitecture::X86_64, ["/bin/sh"])
        .with_network(true)
        .with_exec(false);
    let program = build_container_init_program(&cfg).unwrap();
    let instrs = program.plan("main").unwrap().len() as u64;
    assert!(DEFAULT_STEP_BUDGET > instrs * 10);
}

#[test]
fn test_scratch_holds_environment() {
    // argv, envp and the network messages all live in scratch at once.
    assert!(GUEST_SCRATCH_SIZE >= 16 * 1024);
}

// =============================================================================
// Network Default Tests
// =============================================================================

#[test]
fn test_gateway_inside_guest_subnet() {
    let ip = u32::from(DEFAULT_GUEST_IP);
    let gw = u32::from(DEFAULT_GATEWAY);
    let mask = u32::from(DEFAULT_GUEST_NETMASK);
    assert_eq!(ip & mask, gw & mask, "gateway must be on-link");
    assert_ne!(ip, gw);
}

#[test]
fn test_guest_mac_locally_administered() {
    assert_eq!(GUEST_MAC[0] & 0x02, 0x02, "locally administered bit");
    assert_eq!(GUEST_MAC[0] & 0x01, 0x00, "must be unicast");
}

#[test]
fn test_interface_name_fits_ifreq() {
    assert!(DEFAULT_GUEST_INTERFACE.len() < 16);
    assert!(!DEFAULT_HOSTNAME.is_empty());
}

// =============================================================================
// Environment Tests
// =============================================================================

#[test]
fn test_path_fallback_absolute() {
    for entry in DEFAULT_PATH_ENV.split(':') {
        assert!(entry.starts_with('/'), "relative PATH entry {entry}");
    }
    assert!(DEFAULT_WORKDIR.starts_with('/'));
    assert!(!DEFAULT_TERM.is_empty());
    assert_eq!(ROOTFS_TAG, "rootfs");
}
