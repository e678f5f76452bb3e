//! Linux ABI constants used by bootstrap programs.
//!
//! The guest is always Linux, whatever the host is, so these are spelled
//! out here rather than taken from the host's `libc`. Values are identical
//! on x86_64 and arm64 unless noted.

// =============================================================================
// Filesystem
// =============================================================================

pub const AT_FDCWD: i64 = -100;
pub const AT_REMOVEDIR: i64 = 0x200;

pub const O_WRONLY: i64 = 0o1;
pub const O_CREAT: i64 = 0o100;
pub const O_TRUNC: i64 = 0o1000;
pub const O_CLOEXEC: i64 = 0o2000000;

pub const MNT_DETACH: i64 = 2;

// =============================================================================
// Process
// =============================================================================

pub const SIGCHLD: i64 = 17;

/// `WTERMSIG` mask of a wait status.
pub const WAIT_SIGNAL_MASK: i64 = 0x7f;

/// Exit code reported for a child terminated by a signal is `128 + signal`.
pub const SIGNAL_EXIT_BASE: i64 = 128;

// =============================================================================
// Reboot
// =============================================================================

pub const LINUX_REBOOT_MAGIC1: i64 = 0xfee1dead;
pub const LINUX_REBOOT_MAGIC2: i64 = 672274793;
pub const LINUX_REBOOT_CMD_RESTART: i64 = 0x01234567;
pub const LINUX_REBOOT_CMD_POWER_OFF: i64 = 0x4321fedc;

// =============================================================================
// Networking
// =============================================================================

pub const AF_INET: i64 = 2;
pub const AF_NETLINK: i64 = 16;
pub const SOCK_DGRAM: i64 = 2;
pub const SOCK_RAW: i64 = 3;
pub const NETLINK_ROUTE: i64 = 0;

pub const SIOCSIFFLAGS: i64 = 0x8914;
pub const SIOCSIFADDR: i64 = 0x8916;
pub const SIOCSIFNETMASK: i64 = 0x891c;

pub const IFF_UP: u16 = 0x1;
pub const IFF_RUNNING: u16 = 0x40;

/// `IFNAMSIZ`
pub const IFNAMSIZ: usize = 16;

/// `sizeof(struct ifreq)` on 64-bit Linux.
pub const IFREQ_SIZE: usize = 40;

pub const RTM_NEWROUTE: u16 = 24;
pub const NLM_F_REQUEST: u16 = 0x1;
pub const NLM_F_ACK: u16 = 0x4;
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;
pub const RT_TABLE_MAIN: u8 = 254;
pub const RTPROT_BOOT: u8 = 3;
pub const RT_SCOPE_UNIVERSE: u8 = 0;
pub const RTN_UNICAST: u8 = 1;
pub const RTA_GATEWAY: u16 = 5;

// =============================================================================
// Errno
// =============================================================================

pub const EPERM: i64 = 1;
pub const ENOENT: i64 = 2;
pub const EBADF: i64 = 9;
pub const ECHILD: i64 = 10;
pub const EACCES: i64 = 13;
pub const EBUSY: i64 = 16;
pub const EEXIST: i64 = 17;
pub const ENODEV: i64 = 19;
pub const ENOTDIR: i64 = 20;
pub const EINVAL: i64 = 22;
pub const ENOSYS: i64 = 38;
pub const ENOTEMPTY: i64 = 39;
pub const ENETUNREACH: i64 = 101;
