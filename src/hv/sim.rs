//! # Simulated Guest
//!
//! A deterministic, in-process stand-in for a booted Linux guest. It
//! implements the [`Hypervisor`] contract by decoding architecture syscall
//! numbers back to [`Syscall`] and applying them to a small model of the
//! kernel state a bootstrap program touches:
//!
//! - a path namespace with directories, mounts, `chdir`, `chroot` and
//!   `pivot_root` re-rooting
//! - the container tree, visible once the virtio-fs tag is mounted
//! - `/dev/kmsg`, regular files, `AF_INET` ioctls and a netlink route socket
//! - vfork-style `clone`, `execve`, `exit`, `wait4` and `reboot`
//!
//! Executables "run" by exiting with a configured code. Failures, boot
//! delays and hangs are scripted through [`SimConfig`]. Everything the guest
//! did is observable afterwards through a [`SimProbe`].

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::{
    Hypervisor, Machine, MachineControl, MachineSpec, ShutdownKind, SyscallArgs, Trap, VirtualCpu,
};
use crate::arch::CpuArchitecture;
use crate::constants::{DEFAULT_GUEST_INTERFACE, GUEST_SCRATCH_SIZE};
use crate::devices::{ContainerFs, DeviceTemplate, FileInfo, VirtioFsBackend, normalize_container_path};
use crate::engine::CancelToken;
use crate::error::{Error, Result};
use crate::ir::Syscall;
use crate::ir::linux::*;
use crate::vm::ConsoleOutput;

/// Guest address of the scratch arena.
const SCRATCH_BASE: u64 = 0x4000_0000;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Shared, ordered log of lifecycle events (`"vm.close"`, ...).
pub type EventLog = Arc<Mutex<Vec<String>>>;

fn push_event(log: &EventLog, event: &str) {
    if let Ok(mut events) = log.lock() {
        events.push(event.to_string());
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// A scripted syscall failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimFailure {
    pub syscall: Syscall,
    /// Raw path argument to match; `None` matches every call.
    pub path: Option<String>,
    pub errno: i64,
}

impl SimFailure {
    pub fn new(syscall: Syscall, errno: i64) -> Self {
        Self {
            syscall,
            path: None,
            errno,
        }
    }

    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Behaviour of the simulated guest.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub arch: CpuArchitecture,
    pub boot_delay: Duration,
    pub never_boots: bool,
    /// Exit code per container executable path. Unlisted programs exit 0.
    pub exit_codes: HashMap<String, i64>,
    /// Terminating signal per container executable path.
    pub signals: HashMap<String, i64>,
    pub failures: Vec<SimFailure>,
    /// Syscall that blocks until the machine is closed.
    pub hang_on: Option<Syscall>,
    /// Syscall that takes this long before the guest completes it.
    pub latency: Option<(Syscall, Duration)>,
    pub events: EventLog,
}

impl SimConfig {
    pub fn new(arch: CpuArchitecture) -> Self {
        Self {
            arch,
            boot_delay: Duration::ZERO,
            never_boots: false,
            exit_codes: HashMap::new(),
            signals: HashMap::new(),
            failures: Vec::new(),
            hang_on: None,
            latency: None,
            events: EventLog::default(),
        }
    }

    pub fn with_exit_code(mut self, path: impl Into<String>, code: i64) -> Self {
        self.exit_codes.insert(path.into(), code);
        self
    }

    pub fn with_signal(mut self, path: impl Into<String>, signal: i64) -> Self {
        self.signals.insert(path.into(), signal);
        self
    }

    pub fn with_failure(mut self, failure: SimFailure) -> Self {
        self.failures.push(failure);
        self
    }

    pub fn with_boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = delay;
        self
    }

    pub fn never_booting(mut self) -> Self {
        self.never_boots = true;
        self
    }

    pub fn hang_on(mut self, syscall: Syscall) -> Self {
        self.hang_on = Some(syscall);
        self
    }

    pub fn with_latency(mut self, syscall: Syscall, delay: Duration) -> Self {
        self.latency = Some((syscall, delay));
        self
    }

    pub fn with_event_log(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }
}

// =============================================================================
// Observable State
// =============================================================================

/// A mount in the simulated namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimMount {
    pub source: String,
    pub target: String,
    pub fstype: String,
}

/// Configuration applied to the guest's network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimInterface {
    pub address: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub flags: u16,
}

/// One `execve` that succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimExec {
    pub pid: i64,
    pub path: String,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// One injected syscall. `result` is `None` when the call did not return
/// to the trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimSyscall {
    pub syscall: Syscall,
    pub result: Option<i64>,
}

enum FdKind {
    Kmsg,
    File(String),
    Inet,
    Netlink,
}

struct SimState {
    config: SimConfig,
    booted: bool,
    syscalls: Vec<SimSyscall>,
    kmsg: Vec<String>,
    hostname: Option<String>,
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    mounts: Vec<SimMount>,
    root: String,
    cwd: String,
    rootfs: Option<(String, Arc<dyn ContainerFs>)>,
    fs_backends: Vec<Arc<VirtioFsBackend>>,
    has_net: bool,
    interface: SimInterface,
    gateways: Vec<Ipv4Addr>,
    fds: HashMap<i64, FdKind>,
    next_fd: i64,
    uid: Option<u32>,
    gid: Option<u32>,
    child: Option<i64>,
    exited: VecDeque<(i64, u32)>,
    next_pid: i64,
    execs: Vec<SimExec>,
    shutdown: Option<ShutdownKind>,
    in_flight: Option<Syscall>,
    console_input: Vec<u8>,
    console_size: Option<(u16, u16)>,
    console: Option<ConsoleOutput>,
    dmesg_logging: bool,
}

impl SimState {
    fn new(config: SimConfig) -> Self {
        let dirs = ["/", "/dev"].into_iter().map(String::from).collect();
        let mut files = BTreeMap::new();
        files.insert("/dev/kmsg".to_string(), Vec::new());
        Self {
            config,
            booted: false,
            syscalls: Vec::new(),
            kmsg: Vec::new(),
            hostname: None,
            dirs,
            files,
            mounts: Vec::new(),
            root: "/".to_string(),
            cwd: "/".to_string(),
            rootfs: None,
            fs_backends: Vec::new(),
            has_net: false,
            interface: SimInterface::default(),
            gateways: Vec::new(),
            fds: HashMap::new(),
            next_fd: 3,
            uid: None,
            gid: None,
            child: None,
            exited: VecDeque::new(),
            next_pid: 2,
            execs: Vec::new(),
            shutdown: None,
            in_flight: None,
            console_input: Vec::new(),
            console_size: None,
            console: None,
            dmesg_logging: false,
        }
    }

    /// Resolves a guest path against the current root and cwd.
    fn resolve(&self, path: &str) -> String {
        let joined = if path.starts_with('/') {
            format!("{}/{}", self.root, path)
        } else {
            format!("{}/{}", self.cwd, path)
        };
        let resolved = normalize_container_path(&joined);
        if is_under(&resolved, &self.root) {
            resolved
        } else {
            self.root.clone()
        }
    }

    fn lookup(&self, resolved: &str) -> Option<FileInfo> {
        if self.dirs.contains(resolved) {
            return Some(FileInfo::dir(0o755));
        }
        if self.files.contains_key(resolved) {
            return Some(FileInfo::file(0o644));
        }
        let (at, fs) = self.rootfs.as_ref()?;
        let rel = relative_to(resolved, at)?;
        fs.lookup(&rel).ok().flatten()
    }

    fn is_dir(&self, resolved: &str) -> bool {
        self.lookup(resolved).is_some_and(|i| i.is_dir)
    }

    fn parent_is_dir(&self, resolved: &str) -> bool {
        match resolved.rsplit_once('/') {
            Some(("", _)) => self.is_dir("/"),
            Some((parent, _)) => self.is_dir(parent),
            None => false,
        }
    }

    fn is_mount_point(&self, resolved: &str) -> bool {
        self.mounts.iter().any(|m| m.target == resolved)
    }

    fn is_kmsg(&self, resolved: &str) -> bool {
        if resolved == "/dev/kmsg" {
            return true;
        }
        resolved.rsplit_once('/').is_some_and(|(dir, name)| {
            name == "kmsg"
                && self
                    .mounts
                    .iter()
                    .any(|m| m.fstype == "devtmpfs" && m.target == dir)
        })
    }

    fn container_path(&self, resolved: &str) -> String {
        match &self.rootfs {
            Some((at, _)) => relative_to(resolved, at).unwrap_or_else(|| resolved.to_string()),
            None => resolved.to_string(),
        }
    }

    fn alloc_fd(&mut self, kind: FdKind) -> i64 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(fd, kind);
        fd
    }

    fn current_pid(&self) -> i64 {
        self.child.unwrap_or(1)
    }

    fn log_kmsg(&mut self, line: String) {
        if self.dmesg_logging
            && let Some(console) = &self.console
        {
            let _ = console.write_bytes(line.as_bytes());
        }
        debug!(target: "guestinit::kmsg", "{}", line.trim_end());
        self.kmsg.push(line);
    }
}

fn is_under(path: &str, root: &str) -> bool {
    root == "/" || path == root || path.starts_with(&format!("{root}/"))
}

fn relative_to(path: &str, base: &str) -> Option<String> {
    if base == "/" {
        return Some(path.to_string());
    }
    if path == base {
        return Some("/".to_string());
    }
    path.strip_prefix(base)
        .filter(|rest| rest.starts_with('/'))
        .map(String::from)
}

fn ret(value: i64) -> Result<Trap> {
    Ok(Trap::Returned(value))
}

fn err(errno: i64) -> Result<Trap> {
    Ok(Trap::Returned(-errno))
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Hypervisor
// =============================================================================

/// Hypervisor backed by the simulated guest. Creates at most one machine.
pub struct SimHypervisor {
    state: Arc<Mutex<SimState>>,
    closed: Arc<AtomicBool>,
    events: EventLog,
    created: bool,
    hv_closed: bool,
}

impl SimHypervisor {
    pub fn new(config: SimConfig) -> Self {
        let events = Arc::clone(&config.events);
        Self {
            state: Arc::new(Mutex::new(SimState::new(config))),
            closed: Arc::new(AtomicBool::new(false)),
            events,
            created: false,
            hv_closed: false,
        }
    }

    pub fn probe(&self) -> SimProbe {
        SimProbe {
            state: Arc::clone(&self.state),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl Hypervisor for SimHypervisor {
    fn architecture(&self) -> CpuArchitecture {
        lock(&self.state).config.arch
    }

    fn create_machine(&mut self, spec: MachineSpec) -> Result<Machine> {
        if self.hv_closed {
            return Err(Error::HypervisorUnavailable("hypervisor closed".to_string()));
        }
        if self.created {
            return Err(Error::Internal(
                "simulated hypervisor supports one machine".to_string(),
            ));
        }
        self.created = true;

        let arch = {
            let mut st = lock(&self.state);
            for device in &spec.devices {
                match device {
                    DeviceTemplate::Fs { backend, .. } => st.fs_backends.push(Arc::clone(backend)),
                    DeviceTemplate::Net { .. } => st.has_net = true,
                }
            }
            st.console = spec.console;
            st.dmesg_logging = spec.dmesg_logging;
            st.config.arch
        };

        debug!(
            arch = %arch,
            cpus = spec.cpus,
            memory_mib = spec.memory_mib,
            kernel = spec.kernel.digest(),
            "simulated machine created"
        );

        Ok(Machine {
            vcpu: Box::new(SimVcpu {
                arch,
                state: Arc::clone(&self.state),
                closed: Arc::clone(&self.closed),
                mem: vec![0; GUEST_SCRATCH_SIZE],
                cursor: 0,
            }),
            control: Arc::new(SimControl {
                state: Arc::clone(&self.state),
                closed: Arc::clone(&self.closed),
                events: Arc::clone(&self.events),
            }),
        })
    }

    fn close(&mut self) -> Result<()> {
        if !self.hv_closed {
            self.hv_closed = true;
            push_event(&self.events, "hypervisor.close");
        }
        Ok(())
    }
}

// =============================================================================
// Control
// =============================================================================

struct SimControl {
    state: Arc<Mutex<SimState>>,
    closed: Arc<AtomicBool>,
    events: EventLog,
}

impl MachineControl for SimControl {
    fn console_input(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::VmClosed);
        }
        lock(&self.state).console_input.extend_from_slice(bytes);
        Ok(())
    }

    fn set_console_size(&self, cols: u16, rows: u16) -> Result<()> {
        lock(&self.state).console_size = Some((cols, rows));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            push_event(&self.events, "vm.close");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// =============================================================================
// vCPU
// =============================================================================

struct SimVcpu {
    arch: CpuArchitecture,
    state: Arc<Mutex<SimState>>,
    closed: Arc<AtomicBool>,
    mem: Vec<u8>,
    cursor: usize,
}

impl SimVcpu {
    fn slice(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let off = addr
            .checked_sub(SCRATCH_BASE)
            .and_then(|o| usize::try_from(o).ok())
            .filter(|o| o.checked_add(len).is_some_and(|end| end <= self.mem.len()))
            .ok_or_else(|| {
                Error::GuestProtocol(format!("access outside scratch: {addr:#x}+{len}"))
            })?;
        Ok(&self.mem[off..off + len])
    }

    fn write_u32(&mut self, addr: u64, value: u32) -> Result<()> {
        self.slice(addr, 4)?;
        let off = (addr - SCRATCH_BASE) as usize;
        self.mem[off..off + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn read_cstr(&self, addr: u64) -> Result<String> {
        self.slice(addr, 0)?;
        let off = (addr - SCRATCH_BASE) as usize;
        let rest = &self.mem[off..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::GuestProtocol(format!("unterminated string at {addr:#x}")))?;
        Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
    }

    fn read_str_array(&self, addr: u64) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for i in 0..256u64 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(self.slice(addr + i * 8, 8)?);
            let ptr = u64::from_le_bytes(raw);
            if ptr == 0 {
                return Ok(out);
            }
            out.push(self.read_cstr(ptr)?);
        }
        Err(Error::GuestProtocol("string array too long".to_string()))
    }

    fn path_arg(&self, syscall: Syscall, args: &SyscallArgs) -> Option<String> {
        let addr = match syscall {
            Syscall::Chdir
            | Syscall::Chroot
            | Syscall::PivotRoot
            | Syscall::Umount2
            | Syscall::Execve => args[0],
            Syscall::Mkdirat | Syscall::Unlinkat | Syscall::Openat | Syscall::Mount => args[1],
            _ => return None,
        };
        self.read_cstr(addr).ok()
    }

    fn wait_until_closed(&self) -> Result<Trap> {
        while !self.closed.load(Ordering::SeqCst) {
            std::thread::sleep(POLL_INTERVAL);
        }
        Err(Error::VmClosed)
    }

    fn dispatch(&mut self, st: &mut SimState, syscall: Syscall, a: SyscallArgs) -> Result<Trap> {
        match syscall {
            Syscall::Read => ret(0),
            Syscall::Getpid => ret(st.current_pid()),

            Syscall::Mkdirat => {
                let path = st.resolve(&self.read_cstr(a[1])?);
                if st.lookup(&path).is_some() {
                    return err(EEXIST);
                }
                if !st.parent_is_dir(&path) {
                    return err(ENOENT);
                }
                st.dirs.insert(path);
                ret(0)
            }

            Syscall::Mount => {
                let source = self.read_cstr(a[0])?;
                let target = st.resolve(&self.read_cstr(a[1])?);
                let fstype = self.read_cstr(a[2])?;
                if !st.is_dir(&target) {
                    return err(ENOENT);
                }
                if fstype == "virtiofs" {
                    let root = st
                        .fs_backends
                        .iter()
                        .find(|b| b.tag() == source)
                        .and_then(|b| b.abstract_root());
                    match root {
                        Some(fs) => st.rootfs = Some((target.clone(), fs)),
                        None => return err(ENOENT),
                    }
                }
                st.mounts.push(SimMount {
                    source,
                    target,
                    fstype,
                });
                ret(0)
            }

            Syscall::Umount2 => {
                let target = st.resolve(&self.read_cstr(a[0])?);
                match st.mounts.iter().rposition(|m| m.target == target) {
                    Some(i) => {
                        st.mounts.remove(i);
                        ret(0)
                    }
                    None => err(EINVAL),
                }
            }

            Syscall::Chdir => {
                let path = st.resolve(&self.read_cstr(a[0])?);
                match st.lookup(&path) {
                    Some(info) if info.is_dir => {
                        st.cwd = path;
                        ret(0)
                    }
                    Some(_) => err(ENOTDIR),
                    None => err(ENOENT),
                }
            }

            Syscall::Chroot => {
                let path = st.resolve(&self.read_cstr(a[0])?);
                if !st.is_dir(&path) {
                    return err(ENOENT);
                }
                st.root = path;
                ret(0)
            }

            Syscall::PivotRoot => {
                let new_root = st.resolve(&self.read_cstr(a[0])?);
                let put_old = st.resolve(&self.read_cstr(a[1])?);
                if !st.is_mount_point(&new_root) {
                    return err(EINVAL);
                }
                if !st.is_dir(&put_old) {
                    return err(ENOENT);
                }
                if put_old == new_root || !is_under(&put_old, &new_root) {
                    return err(EINVAL);
                }
                st.mounts.push(SimMount {
                    source: "oldroot".to_string(),
                    target: put_old,
                    fstype: "pivot".to_string(),
                });
                st.root = new_root;
                ret(0)
            }

            Syscall::Unlinkat => {
                let path = st.resolve(&self.read_cstr(a[1])?);
                let remove_dir = a[2] as i64 & AT_REMOVEDIR != 0;
                if st.is_mount_point(&path) {
                    return err(EBUSY);
                }
                if remove_dir {
                    if !st.dirs.contains(&path) {
                        return err(ENOENT);
                    }
                    let prefix = format!("{path}/");
                    if st.dirs.iter().any(|d| d.starts_with(&prefix)) {
                        return err(ENOTEMPTY);
                    }
                    st.dirs.remove(&path);
                } else if st.files.remove(&path).is_none() {
                    return err(ENOENT);
                }
                ret(0)
            }

            Syscall::Openat => {
                let path = st.resolve(&self.read_cstr(a[1])?);
                let flags = a[2] as i64;
                if st.is_kmsg(&path) {
                    return ret(st.alloc_fd(FdKind::Kmsg));
                }
                if flags & O_CREAT != 0 {
                    if !st.parent_is_dir(&path) {
                        return err(ENOENT);
                    }
                    if st.is_dir(&path) {
                        return err(EINVAL);
                    }
                    let entry = st.files.entry(path.clone()).or_default();
                    if flags & O_TRUNC != 0 {
                        entry.clear();
                    }
                    return ret(st.alloc_fd(FdKind::File(path)));
                }
                match st.lookup(&path) {
                    Some(info) if !info.is_dir => ret(st.alloc_fd(FdKind::File(path))),
                    Some(_) => err(EINVAL),
                    None => err(ENOENT),
                }
            }

            Syscall::Write => {
                let fd = a[0] as i64;
                let len = a[2] as usize;
                let data = self.slice(a[1], len)?.to_vec();
                match st.fds.get(&fd) {
                    Some(FdKind::Kmsg) => {
                        st.log_kmsg(String::from_utf8_lossy(&data).into_owned());
                        ret(len as i64)
                    }
                    Some(FdKind::File(path)) => {
                        let path = path.clone();
                        st.files.entry(path).or_default().extend_from_slice(&data);
                        ret(len as i64)
                    }
                    Some(_) => err(EINVAL),
                    None => err(EBADF),
                }
            }

            Syscall::Close => match st.fds.remove(&(a[0] as i64)) {
                Some(_) => ret(0),
                None => err(EBADF),
            },

            Syscall::Sethostname => {
                let name = self.slice(a[0], a[1] as usize)?;
                st.hostname = Some(String::from_utf8_lossy(name).into_owned());
                ret(0)
            }

            Syscall::Socket => match (a[0] as i64, a[1] as i64) {
                (AF_INET, SOCK_DGRAM) => ret(st.alloc_fd(FdKind::Inet)),
                (AF_NETLINK, SOCK_RAW) => ret(st.alloc_fd(FdKind::Netlink)),
                _ => err(EINVAL),
            },

            Syscall::Ioctl => {
                if !matches!(st.fds.get(&(a[0] as i64)), Some(FdKind::Inet)) {
                    return err(EBADF);
                }
                let ifreq = self.slice(a[2], IFREQ_SIZE)?;
                let name_end = ifreq[..IFNAMSIZ].iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
                let name = String::from_utf8_lossy(&ifreq[..name_end]).into_owned();
                if !st.has_net || name != DEFAULT_GUEST_INTERFACE {
                    return err(ENODEV);
                }
                // sa_family for address requests, ifr_flags for SIOCSIFFLAGS.
                let head = u16::from_le_bytes([ifreq[16], ifreq[17]]);
                let addr = Ipv4Addr::new(ifreq[20], ifreq[21], ifreq[22], ifreq[23]);
                match a[1] as i64 {
                    SIOCSIFADDR if head == AF_INET as u16 => st.interface.address = Some(addr),
                    SIOCSIFNETMASK if head == AF_INET as u16 => st.interface.netmask = Some(addr),
                    SIOCSIFFLAGS => st.interface.flags = head,
                    _ => return err(EINVAL),
                }
                ret(0)
            }

            Syscall::Sendto => {
                if !matches!(st.fds.get(&(a[0] as i64)), Some(FdKind::Netlink)) {
                    return err(EBADF);
                }
                let len = a[2] as usize;
                let msg = self.slice(a[1], len)?;
                if len < 36 || u16::from_le_bytes([msg[4], msg[5]]) != RTM_NEWROUTE {
                    return err(EINVAL);
                }
                if !st.has_net || st.interface.flags & IFF_UP == 0 {
                    return err(ENETUNREACH);
                }
                if u16::from_le_bytes([msg[30], msg[31]]) != RTA_GATEWAY {
                    return err(EINVAL);
                }
                let gw = Ipv4Addr::new(msg[32], msg[33], msg[34], msg[35]);
                st.gateways.push(gw);
                ret(len as i64)
            }

            Syscall::Setuid => {
                st.uid = Some(a[0] as u32);
                ret(0)
            }
            Syscall::Setgid => {
                st.gid = Some(a[0] as u32);
                ret(0)
            }
            Syscall::Setgroups => ret(0),

            Syscall::Clone => {
                if st.child.is_some() {
                    return err(EINVAL);
                }
                let pid = st.next_pid;
                st.next_pid += 1;
                st.child = Some(pid);
                trace!(pid, "vfork child running");
                ret(0)
            }

            Syscall::Execve => {
                let path = st.resolve(&self.read_cstr(a[0])?);
                let info = match st.lookup(&path) {
                    Some(info) => info,
                    None => return err(ENOENT),
                };
                if !info.is_executable() {
                    return err(EACCES);
                }
                let argv = self.read_str_array(a[1])?;
                let envp = self.read_str_array(a[2])?;
                let container_path = st.container_path(&path);

                let status = match st.config.signals.get(&container_path) {
                    Some(sig) => (*sig & WAIT_SIGNAL_MASK) as u32,
                    None => {
                        let code = st.config.exit_codes.get(&container_path).copied().unwrap_or(0);
                        ((code & 0xff) << 8) as u32
                    }
                };

                let pid = st.current_pid();
                st.execs.push(SimExec {
                    pid,
                    path: container_path,
                    argv,
                    envp,
                    uid: st.uid,
                    gid: st.gid,
                });

                match st.child.take() {
                    Some(child) => {
                        st.exited.push_back((child, status));
                        Ok(Trap::ChildDetached { pid: child })
                    }
                    None => {
                        let exit_code = if status & 0x7f != 0 {
                            SIGNAL_EXIT_BASE + i64::from(status & 0x7f)
                        } else {
                            i64::from((status >> 8) & 0xff)
                        };
                        self.closed.store(true, Ordering::SeqCst);
                        Ok(Trap::HandedOff { exit_code })
                    }
                }
            }

            Syscall::Exit => match st.child.take() {
                Some(child) => {
                    st.exited.push_back((child, ((a[0] as u32) & 0xff) << 8));
                    Ok(Trap::ChildDetached { pid: child })
                }
                None => Err(Error::Vcpu("attempted to kill init".to_string())),
            },

            Syscall::Wait4 => {
                let want = a[0] as i64;
                let pos = st
                    .exited
                    .iter()
                    .position(|(pid, _)| want <= 0 || *pid == want);
                let Some((pid, status)) = pos.and_then(|i| st.exited.remove(i)) else {
                    return err(ECHILD);
                };
                if a[1] != 0 {
                    self.write_u32(a[1], status)?;
                }
                ret(pid)
            }

            Syscall::Reboot => {
                if a[0] as i64 != LINUX_REBOOT_MAGIC1 || a[1] as i64 != LINUX_REBOOT_MAGIC2 {
                    return err(EINVAL);
                }
                let kind = match a[2] as i64 {
                    LINUX_REBOOT_CMD_RESTART => ShutdownKind::Restart,
                    LINUX_REBOOT_CMD_POWER_OFF => ShutdownKind::PowerOff,
                    _ => return err(EINVAL),
                };
                st.shutdown = Some(kind);
                self.closed.store(true, Ordering::SeqCst);
                Ok(Trap::Shutdown(kind))
            }
        }
    }
}

impl VirtualCpu for SimVcpu {
    fn architecture(&self) -> CpuArchitecture {
        self.arch
    }

    fn wait_for_trampoline(&mut self, cancel: &CancelToken) -> Result<()> {
        let (delay, never) = {
            let st = lock(&self.state);
            (st.config.boot_delay, st.config.never_boots)
        };
        let ready_at = Instant::now() + delay;
        while never || Instant::now() < ready_at {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::VmClosed);
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        let mut st = lock(&self.state);
        if !st.booted {
            st.booted = true;
            let banner = format!("Linux version sim ({}) guestinit trampoline ready\n", self.arch);
            st.log_kmsg(banner);
        }
        Ok(())
    }

    fn reset_scratch(&mut self) -> Result<()> {
        self.mem[..self.cursor].fill(0);
        self.cursor = 0;
        Ok(())
    }

    fn materialize(&mut self, bytes: &[u8]) -> Result<u64> {
        let start = self.cursor.next_multiple_of(8);
        let end = start
            .checked_add(bytes.len())
            .filter(|&e| e <= self.mem.len())
            .ok_or_else(|| Error::GuestProtocol("guest scratch exhausted".to_string()))?;
        self.mem[start..end].copy_from_slice(bytes);
        self.cursor = end;
        Ok(SCRATCH_BASE + start as u64)
    }

    fn read_guest(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        buf.copy_from_slice(self.slice(addr, buf.len())?);
        Ok(())
    }

    fn syscall(&mut self, nr: u64, args: SyscallArgs) -> Result<Trap> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::VmClosed);
        }

        let Some(syscall) = Syscall::from_number(self.arch, nr) else {
            warn!(nr, arch = %self.arch, "unknown syscall number");
            return Ok(Trap::Returned(-ENOSYS));
        };

        let path = self.path_arg(syscall, &args);
        let (failure, hang, latency) = {
            let mut st = lock(&self.state);
            let failure = st
                .config
                .failures
                .iter()
                .find(|f| {
                    f.syscall == syscall
                        && f.path.as_deref().is_none_or(|p| Some(p) == path.as_deref())
                })
                .map(|f| f.errno);
            let latency = st
                .config
                .latency
                .and_then(|(s, delay)| (s == syscall).then_some(delay));
            if latency.is_some() {
                st.in_flight = Some(syscall);
            }
            (failure, st.config.hang_on == Some(syscall), latency)
        };

        if let Some(delay) = latency {
            std::thread::sleep(delay);
            lock(&self.state).in_flight = None;
        }

        if hang {
            lock(&self.state).syscalls.push(SimSyscall {
                syscall,
                result: None,
            });
            debug!(%syscall, "simulated guest hanging");
            return self.wait_until_closed();
        }

        let state = Arc::clone(&self.state);
        let mut st = lock(&state);
        let trap = match failure {
            Some(errno) => Trap::Returned(-errno),
            None => self.dispatch(&mut st, syscall, args)?,
        };

        st.syscalls.push(SimSyscall {
            syscall,
            result: match trap {
                Trap::Returned(v) => Some(v),
                _ => None,
            },
        });
        trace!(%syscall, ?path, ?trap, "simulated syscall");
        Ok(trap)
    }
}

// =============================================================================
// Probe
// =============================================================================

/// Read-only view of the simulated guest, for assertions and reports.
#[derive(Clone)]
pub struct SimProbe {
    state: Arc<Mutex<SimState>>,
    closed: Arc<AtomicBool>,
}

impl SimProbe {
    pub fn syscall_log(&self) -> Vec<SimSyscall> {
        lock(&self.state).syscalls.clone()
    }

    pub fn syscalls(&self) -> Vec<Syscall> {
        lock(&self.state).syscalls.iter().map(|s| s.syscall).collect()
    }

    pub fn count(&self, syscall: Syscall) -> usize {
        lock(&self.state)
            .syscalls
            .iter()
            .filter(|s| s.syscall == syscall)
            .count()
    }

    /// Syscall the guest is currently slowed down in, if any.
    pub fn in_flight(&self) -> Option<Syscall> {
        lock(&self.state).in_flight
    }

    pub fn last_syscall(&self) -> Option<Syscall> {
        lock(&self.state).syscalls.last().map(|s| s.syscall)
    }

    pub fn kmsg(&self) -> Vec<String> {
        lock(&self.state).kmsg.clone()
    }

    pub fn hostname(&self) -> Option<String> {
        lock(&self.state).hostname.clone()
    }

    /// Contents of a file, by path in the guest's original namespace.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.state).files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        lock(&self.state).dirs.contains(path)
    }

    pub fn mounts(&self) -> Vec<SimMount> {
        lock(&self.state).mounts.clone()
    }

    pub fn root(&self) -> String {
        lock(&self.state).root.clone()
    }

    pub fn cwd(&self) -> String {
        lock(&self.state).cwd.clone()
    }

    pub fn interface(&self) -> SimInterface {
        lock(&self.state).interface.clone()
    }

    pub fn gateways(&self) -> Vec<Ipv4Addr> {
        lock(&self.state).gateways.clone()
    }

    pub fn execs(&self) -> Vec<SimExec> {
        lock(&self.state).execs.clone()
    }

    pub fn shutdown(&self) -> Option<ShutdownKind> {
        lock(&self.state).shutdown
    }

    pub fn console_input(&self) -> Vec<u8> {
        lock(&self.state).console_input.clone()
    }

    pub fn console_size(&self) -> Option<(u16, u16)> {
        lock(&self.state).console_size
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<String> {
        let events = Arc::clone(&lock(&self.state).config.events);
        events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}
