//! Abstract syscall set and per-architecture numbering.
//!
//! Programs name syscalls symbolically; numbers are only chosen when the
//! engine injects a call into a guest of a concrete architecture. x86_64
//! uses its legacy table, arm64 the asm-generic table.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::arch::CpuArchitecture;

/// Syscalls available to bootstrap programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Syscall {
    Read,
    Write,
    Openat,
    Close,
    Ioctl,
    Socket,
    Sendto,
    Clone,
    Execve,
    Exit,
    Wait4,
    Getpid,
    Mkdirat,
    Unlinkat,
    Chdir,
    Chroot,
    PivotRoot,
    Mount,
    Umount2,
    Reboot,
    Sethostname,
    Setuid,
    Setgid,
    Setgroups,
}

impl Syscall {
    /// Every syscall in the set, in declaration order.
    pub const ALL: &'static [Syscall] = &[
        Self::Read,
        Self::Write,
        Self::Openat,
        Self::Close,
        Self::Ioctl,
        Self::Socket,
        Self::Sendto,
        Self::Clone,
        Self::Execve,
        Self::Exit,
        Self::Wait4,
        Self::Getpid,
        Self::Mkdirat,
        Self::Unlinkat,
        Self::Chdir,
        Self::Chroot,
        Self::PivotRoot,
        Self::Mount,
        Self::Umount2,
        Self::Reboot,
        Self::Sethostname,
        Self::Setuid,
        Self::Setgid,
        Self::Setgroups,
    ];

    /// Kernel syscall number on `arch`.
    pub fn number(self, arch: CpuArchitecture) -> u64 {
        match arch {
            CpuArchitecture::X86_64 => self.x86_64_number(),
            CpuArchitecture::Arm64 => self.arm64_number(),
        }
    }

    /// Reverse lookup of a kernel syscall number on `arch`.
    pub fn from_number(arch: CpuArchitecture, nr: u64) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.number(arch) == nr)
    }

    fn x86_64_number(self) -> u64 {
        match self {
            Self::Read => 0,
            Self::Write => 1,
            Self::Close => 3,
            Self::Ioctl => 16,
            Self::Getpid => 39,
            Self::Socket => 41,
            Self::Sendto => 44,
            Self::Clone => 56,
            Self::Execve => 59,
            Self::Exit => 60,
            Self::Wait4 => 61,
            Self::Chdir => 80,
            Self::Setuid => 105,
            Self::Setgid => 106,
            Self::Setgroups => 116,
            Self::PivotRoot => 155,
            Self::Chroot => 161,
            Self::Mount => 165,
            Self::Umount2 => 166,
            Self::Reboot => 169,
            Self::Sethostname => 170,
            Self::Openat => 257,
            Self::Mkdirat => 258,
            Self::Unlinkat => 263,
        }
    }

    fn arm64_number(self) -> u64 {
        match self {
            Self::Ioctl => 29,
            Self::Mkdirat => 34,
            Self::Unlinkat => 35,
            Self::Umount2 => 39,
            Self::Mount => 40,
            Self::PivotRoot => 41,
            Self::Chdir => 49,
            Self::Chroot => 51,
            Self::Openat => 56,
            Self::Close => 57,
            Self::Read => 63,
            Self::Write => 64,
            Self::Exit => 93,
            Self::Reboot => 142,
            Self::Setgid => 144,
            Self::Setuid => 146,
            Self::Setgroups => 159,
            Self::Sethostname => 161,
            Self::Getpid => 172,
            Self::Socket => 198,
            Self::Sendto => 206,
            Self::Clone => 220,
            Self::Execve => 221,
            Self::Wait4 => 260,
        }
    }

    /// Lower-case kernel name of the syscall.
    pub fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Openat => "openat",
            Self::Close => "close",
            Self::Ioctl => "ioctl",
            Self::Socket => "socket",
            Self::Sendto => "sendto",
            Self::Clone => "clone",
            Self::Execve => "execve",
            Self::Exit => "exit",
            Self::Wait4 => "wait4",
            Self::Getpid => "getpid",
            Self::Mkdirat => "mkdirat",
            Self::Unlinkat => "unlinkat",
            Self::Chdir => "chdir",
            Self::Chroot => "chroot",
            Self::PivotRoot => "pivot_root",
            Self::Mount => "mount",
            Self::Umount2 => "umount2",
            Self::Reboot => "reboot",
            Self::Sethostname => "sethostname",
            Self::Setuid => "setuid",
            Self::Setgid => "setgid",
            Self::Setgroups => "setgroups",
        }
    }
}

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
