//! # Container Init Program
//!
//! Compiles a container's runtime configuration into the bootstrap
//! [`Program`] that turns a freshly booted kernel into the container
//! process. The program has a single method, `main`, built as a fixed
//! pipeline:
//!
//! ```text
//! kmsg "running container init"
//! mkdir /mnt /proc /sys                           (unchecked)
//! mount rootfs -> /mnt (virtiofs)                 (checked)
//! mkdir + mount proc, sysfs, devtmpfs, /dev/shm   (unchecked)
//! chdir /mnt                                      (checked)
//! pivot_root(".", "oldroot") || chroot(".")       (checked)
//!   pivot path: chdir /, umount2 /oldroot         (checked)
//! rmdir /oldroot                                  (checked)
//! chdir <workdir>                                 (unchecked)
//! mkdir + mount /dev/pts                          (unchecked)
//! sethostname                                     (checked)
//! [ifconfig, default route, resolv.conf]          (checked, network only)
//! exec | fork+exec+wait
//! return errno
//! fatal: printf errno; reboot                     (restart on x86_64,
//!                                                  power-off on arm64)
//! ```
//!
//! Every checked step writes the shared `init_errno` slot. The fatal
//! handler reports whatever the slot held last.

pub mod helpers;

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::arch::CpuArchitecture;
use crate::constants::{
    DEFAULT_GATEWAY, DEFAULT_GUEST_INTERFACE, DEFAULT_GUEST_IP, DEFAULT_GUEST_NETMASK,
    DEFAULT_HOSTNAME, DEFAULT_TERM, DEFAULT_WORKDIR, ROOTFS_TAG,
};
use crate::error::{Error, Result};
use crate::ir::linux::{AT_FDCWD, AT_REMOVEDIR, MNT_DETACH};
use crate::ir::{Expr, Fragment, Label, Method, Program, Syscall, Var};

use helpers::{LaunchSpec, checked, log_kmsg, mkdir, mount, mount_unchecked};

/// Name of the program's error slot.
pub const ERRNO_VAR: &str = "init_errno";

/// Label of the fatal error handler.
pub const FATAL_LABEL: &str = "fatal";

/// The error slot shared by every checked step.
pub fn errno_var() -> Var {
    Var::new(ERRNO_VAR)
}

/// Runtime configuration of one container boot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInitConfig {
    pub arch: CpuArchitecture,
    pub cmd: Vec<String>,
    /// `KEY=VALUE` entries, in order. Duplicates are kept.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub work_dir: String,
    #[serde(default)]
    pub enable_network: bool,
    /// Replace PID 1 with the command instead of fork/exec/wait.
    #[serde(default)]
    pub exec: bool,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub hostname: String,
    /// Gateway and DNS server address.
    #[serde(default)]
    pub dns: Option<Ipv4Addr>,
    #[serde(default)]
    pub guest_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub guest_mask: Option<Ipv4Addr>,
    #[serde(default)]
    pub guest_ifname: String,
}

impl ContainerInitConfig {
    pub fn new(arch: CpuArchitecture, cmd: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            arch,
            cmd: cmd.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            work_dir: String::new(),
            enable_network: false,
            exec: false,
            uid: None,
            gid: None,
            hostname: String::new(),
            dns: None,
            guest_ip: None,
            guest_mask: None,
            guest_ifname: String::new(),
        }
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env = env.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<String>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_network(mut self, enabled: bool) -> Self {
        self.enable_network = enabled;
        self
    }

    pub fn with_exec(mut self, exec: bool) -> Self {
        self.exec = exec;
        self
    }

    pub fn with_user(mut self, uid: Option<u32>, gid: Option<u32>) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Fills every unset field with its default and adds `TERM` if missing.
    pub fn apply_defaults(&mut self) {
        if self.hostname.is_empty() {
            self.hostname = DEFAULT_HOSTNAME.to_string();
        }
        if self.work_dir.is_empty() {
            self.work_dir = DEFAULT_WORKDIR.to_string();
        }
        if self.guest_ifname.is_empty() {
            self.guest_ifname = DEFAULT_GUEST_INTERFACE.to_string();
        }
        self.dns.get_or_insert(DEFAULT_GATEWAY);
        self.guest_ip.get_or_insert(DEFAULT_GUEST_IP);
        self.guest_mask.get_or_insert(DEFAULT_GUEST_NETMASK);
        ensure_term(&mut self.env);
    }

    fn validate(&self) -> Result<()> {
        match self.cmd.first() {
            None => Err(Error::InvalidConfig(
                "container init requires a command".to_string(),
            )),
            Some(argv0) if argv0.is_empty() => Err(Error::InvalidConfig(
                "container init requires a non-empty argv[0]".to_string(),
            )),
            Some(_) => Ok(()),
        }
    }
}

/// Appends `TERM=xterm-256color` unless a `TERM` entry already exists.
pub fn ensure_term(env: &mut Vec<String>) {
    if !env.iter().any(|e| e.starts_with("TERM=")) {
        env.push(format!("TERM={DEFAULT_TERM}"));
    }
}

/// Builds the container init program.
pub fn build_container_init_program(config: &ContainerInitConfig) -> Result<Program> {
    let mut cfg = config.clone();
    cfg.apply_defaults();
    cfg.validate()?;

    let errno = errno_var();
    let fatal = Label::new(FATAL_LABEL);
    let pivot = Var::new("pivot_result");

    let mut main = Method::new();

    main.extend([
        log_kmsg("guestinit: running container init program\n"),
        mkdir("/mnt", 0o755),
        mkdir("/proc", 0o755),
        mkdir("/sys", 0o755),
        checked(
            mount(ROOTFS_TAG, "/mnt", "virtiofs", ""),
            "failed to mount virtiofs",
            &errno,
            &fatal,
        ),
        mkdir("/mnt/proc", 0o755),
        mkdir("/mnt/sys", 0o755),
        mkdir("/mnt/dev", 0o755),
        mkdir("/mnt/tmp", 0o1777),
        mount_unchecked("proc", "/mnt/proc", "proc", ""),
        mount_unchecked("sysfs", "/mnt/sys", "sysfs", ""),
        mount_unchecked("devtmpfs", "/mnt/dev", "devtmpfs", ""),
        mkdir("/mnt/dev/shm", 0o1777),
        mount_unchecked("tmpfs", "/mnt/dev/shm", "tmpfs", "mode=1777"),
        log_kmsg("guestinit: mounted filesystems\n"),
    ]);

    // Switch root: pivot_root with chroot fallback.
    main.extend([
        checked(helpers::chdir("/mnt"), "failed to chdir to /mnt", &errno, &fatal),
        mkdir("oldroot", 0o755),
        Fragment::assign(
            &pivot,
            Expr::syscall(Syscall::PivotRoot, [".".into(), "oldroot".into()]),
        ),
        Fragment::assign(&errno, &pivot),
        Fragment::when(
            Expr::is_negative(&pivot),
            vec![checked(
                Expr::syscall(Syscall::Chroot, [".".into()]),
                "failed to chroot",
                &errno,
                &fatal,
            )],
        ),
        Fragment::when(
            Expr::is_greater_or_equal(&pivot, 0),
            vec![
                checked(
                    helpers::chdir("/"),
                    "failed to chdir to new root",
                    &errno,
                    &fatal,
                ),
                checked(
                    Expr::syscall(Syscall::Umount2, ["/oldroot".into(), Expr::int(MNT_DETACH)]),
                    "failed to unmount oldroot",
                    &errno,
                    &fatal,
                ),
            ],
        ),
        log_kmsg("guestinit: changed root to container\n"),
        checked(
            Expr::syscall(
                Syscall::Unlinkat,
                [
                    Expr::int(AT_FDCWD),
                    "/oldroot".into(),
                    Expr::int(AT_REMOVEDIR),
                ],
            ),
            "failed to remove oldroot",
            &errno,
            &fatal,
        ),
    ]);

    main.extend([
        Fragment::syscall(Syscall::Chdir, [cfg.work_dir.as_str().into()]),
        mkdir("/dev/pts", 0o755),
        mount_unchecked("devpts", "/dev/pts", "devpts", ""),
        log_kmsg("guestinit: mounted devpts\n"),
        helpers::set_hostname(&cfg.hostname, &errno, &fatal),
        log_kmsg("guestinit: set hostname\n"),
    ]);

    if cfg.enable_network {
        let dns = cfg.dns.unwrap_or(DEFAULT_GATEWAY);
        main.extend([
            helpers::configure_interface(
                &cfg.guest_ifname,
                cfg.guest_ip.unwrap_or(DEFAULT_GUEST_IP),
                cfg.guest_mask.unwrap_or(DEFAULT_GUEST_NETMASK),
                &errno,
                &fatal,
            ),
            helpers::add_default_route(dns, &errno, &fatal),
            helpers::set_resolv_conf(dns, &errno, &fatal),
            log_kmsg("guestinit: configured network interface\n"),
        ]);
    }

    let launch = LaunchSpec {
        path: &cfg.cmd[0],
        argv: &cfg.cmd,
        envp: &cfg.env,
        uid: cfg.uid,
        gid: cfg.gid,
    };
    main.push(log_kmsg(format!("guestinit: executing command {}\n", cfg.cmd[0])));
    if cfg.exec {
        main.push(helpers::exec(&launch, &errno, &fatal));
    } else {
        main.push(helpers::fork_exec_wait(&launch, &errno, &fatal));
    }

    main.push(Fragment::ret(&errno));
    main.push(Fragment::label(
        &fatal,
        vec![
            Fragment::printf(
                "guestinit: fatal error during boot: errno=0x%x\n",
                [Expr::from(&errno)],
            ),
            helpers::shutdown(cfg.arch == CpuArchitecture::X86_64),
        ],
    ));

    debug!(
        arch = %cfg.arch,
        command = %cfg.cmd[0],
        exec = cfg.exec,
        network = cfg.enable_network,
        fragments = main.len(),
        "built container init program"
    );

    Program::with_main(main)
}
