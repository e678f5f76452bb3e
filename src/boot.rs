//! # Boot Preparation and Teardown
//!
//! Everything between "the user picked a container" and "a session is
//! driving its VM", and the way back.
//!
//! ## Preparation
//!
//! [`prepare_boot`] acquires, in order:
//!
//! 1. the resolved command (`argv[0]` searched through `PATH` in the
//!    container filesystem)
//! 2. the virtio-fs backend serving the container root
//! 3. the hypervisor (pre-opened handle or a fresh open)
//! 4. the kernel image
//! 5. the network backend
//!
//! Any failure releases what was already acquired in reverse order and
//! returns the error unchanged. No VM exists yet on this path.
//!
//! ## Teardown
//!
//! [`RunningContainer::shutdown`] releases a running container in a fixed
//! order: session stop (bounded) → console view → VM → container
//! filesystem → network backend → hypervisor. Every step runs even if an
//! earlier one failed.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::arch::CpuArchitecture;
use crate::constants::{
    DEFAULT_PATH_ENV, DEFAULT_VCPUS, DEFAULT_VM_MEMORY_MIB, DEFAULT_WORKDIR, MAX_VCPUS,
    MAX_VM_MEMORY_MIB,
};
use crate::devices::{ContainerFs, DeviceTemplate, NetworkBackend, VirtioFsBackend};
use crate::error::{Error, Result};
use crate::hv::{Hypervisor, HypervisorOpener, PreopenedHypervisor};
use crate::init::{ContainerInitConfig, build_container_init_program, ensure_term};
use crate::kernel::{KernelImage, KernelLoader};
use crate::session::{Session, SessionConfig, SessionState};
use crate::vm::{ConsoleOutput, StdinSource, VirtualMachine, VmHandle, VmOption};

// =============================================================================
// Command Resolution
// =============================================================================

/// Returns the `PATH` value from `env`, or the default search path.
pub fn initial_path(env: &[String]) -> &str {
    env.iter()
        .find_map(|e| e.strip_prefix("PATH="))
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_PATH_ENV)
}

/// Resolves `cmd[0]` to an executable inside the container.
///
/// A name containing `/` is returned unchanged. Otherwise each `PATH`
/// entry is tried in order: an empty entry means `work_dir`, a relative
/// entry is joined to it. Directories and files without any execute bit
/// are skipped.
pub fn resolve_command_path(
    fs: &dyn ContainerFs,
    cmd: &[String],
    path_env: &str,
    work_dir: &str,
) -> Result<Vec<String>> {
    let Some(file) = cmd.first() else {
        return Err(Error::CommandResolution {
            command: String::new(),
            reason: "empty command".to_string(),
        });
    };
    if file.is_empty() {
        return Err(Error::CommandResolution {
            command: String::new(),
            reason: "executable name is empty".to_string(),
        });
    }
    if file.contains('/') {
        return Ok(cmd.to_vec());
    }

    let path_env = if path_env.is_empty() {
        DEFAULT_PATH_ENV
    } else {
        path_env
    };
    let work_dir = if work_dir.is_empty() {
        DEFAULT_WORKDIR
    } else {
        work_dir
    };

    for entry in path_env.split(':') {
        let dir = if entry.is_empty() {
            work_dir.to_string()
        } else if entry.starts_with('/') {
            entry.to_string()
        } else {
            format!("{}/{entry}", work_dir.trim_end_matches('/'))
        };
        let candidate = format!("{}/{file}", dir.trim_end_matches('/'));

        match fs.lookup(&candidate) {
            Ok(Some(info)) if info.is_executable() => {
                debug!(command = %file, resolved = %candidate, "resolved command path");
                let mut resolved = cmd.to_vec();
                resolved[0] = candidate;
                return Ok(resolved);
            }
            Ok(_) => {}
            Err(e) => debug!(candidate = %candidate, error = %e, "lookup failed, skipping"),
        }
    }

    Err(Error::CommandResolution {
        command: file.clone(),
        reason: format!("executable not found in PATH ({path_env})"),
    })
}

// =============================================================================
// Configuration
// =============================================================================

/// VM and container settings of one boot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// Container command, `argv[0]` first.
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub work_dir: String,
    pub cpus: u32,
    pub memory_mib: u64,
    pub dmesg: bool,
    pub exec: bool,
    pub enable_network: bool,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub hostname: String,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            env: Vec::new(),
            work_dir: DEFAULT_WORKDIR.to_string(),
            cpus: DEFAULT_VCPUS,
            memory_mib: DEFAULT_VM_MEMORY_MIB,
            dmesg: false,
            exec: true,
            enable_network: true,
            uid: None,
            gid: None,
            hostname: String::new(),
        }
    }
}

impl BootConfig {
    pub fn new(command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env.extend(env.into_iter().map(Into::into));
        self
    }

    pub fn with_exec(mut self, exec: bool) -> Self {
        self.exec = exec;
        self
    }

    pub fn with_network(mut self, enabled: bool) -> Self {
        self.enable_network = enabled;
        self
    }

    pub fn with_resources(mut self, cpus: u32, memory_mib: u64) -> Self {
        self.cpus = cpus;
        self.memory_mib = memory_mib;
        self
    }

    /// Zero resources mean "use the default"; anything above the limits is
    /// rejected.
    pub fn validate(&mut self) -> Result<()> {
        if self.command.is_empty() {
            return Err(Error::InvalidConfig("no command specified".to_string()));
        }
        if self.cpus == 0 {
            self.cpus = DEFAULT_VCPUS;
        }
        if self.memory_mib == 0 {
            self.memory_mib = DEFAULT_VM_MEMORY_MIB;
        }
        if self.work_dir.is_empty() {
            self.work_dir = DEFAULT_WORKDIR.to_string();
        }
        if self.cpus > MAX_VCPUS {
            return Err(Error::InvalidConfig(format!(
                "{} vCPUs exceeds maximum of {MAX_VCPUS}",
                self.cpus
            )));
        }
        if self.memory_mib > MAX_VM_MEMORY_MIB {
            return Err(Error::InvalidConfig(format!(
                "{} MiB exceeds maximum of {MAX_VM_MEMORY_MIB} MiB",
                self.memory_mib
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Preparation
// =============================================================================

/// Where the boot attempt gets its hypervisor from.
pub enum HypervisorSource {
    Preopened(Box<dyn Hypervisor>),
    Open(Box<HypervisorOpener>),
}

impl HypervisorSource {
    /// Takes the pre-opened handle out of `slot`, falling back to `open`.
    pub fn from_slot(slot: &mut PreopenedHypervisor, open: Box<HypervisorOpener>) -> Self {
        match slot.take() {
            Some(hv) => Self::Preopened(hv),
            None => Self::Open(open),
        }
    }

    fn acquire(self) -> Result<Box<dyn Hypervisor>> {
        match self {
            Self::Preopened(hv) => {
                info!("using pre-opened hypervisor");
                Ok(hv)
            }
            Self::Open(open) => {
                info!("opening new hypervisor");
                open()
            }
        }
    }
}

/// Starts the user-space network stack.
pub type NetworkStarter = dyn FnOnce() -> Result<Arc<dyn NetworkBackend>> + Send;

/// External resources handed to [`prepare_boot`].
pub struct BootResources<'a> {
    pub arch: CpuArchitecture,
    /// Container root, owned by the boot attempt from here on.
    pub rootfs: Arc<dyn ContainerFs>,
    pub hypervisor: HypervisorSource,
    pub kernels: &'a dyn KernelLoader,
    pub network: Box<NetworkStarter>,
}

/// Everything acquired for one boot, not yet running.
pub struct BootPrep {
    pub arch: CpuArchitecture,
    pub config: BootConfig,
    pub rootfs: Arc<dyn ContainerFs>,
    pub fs_backend: Arc<VirtioFsBackend>,
    pub hypervisor: Box<dyn Hypervisor>,
    pub kernel: KernelImage,
    pub network: Arc<dyn NetworkBackend>,
}

impl BootPrep {
    /// Releases every resource in reverse acquisition order.
    pub fn release(mut self) {
        release_prepared(
            Some(&self.network),
            Some(self.hypervisor.as_mut()),
            Some(self.fs_backend.as_ref()),
            &self.rootfs,
        );
    }
}

impl std::fmt::Debug for BootPrep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootPrep")
            .field("arch", &self.arch)
            .field("config", &self.config)
            .field("fs_backend", &self.fs_backend)
            .field("kernel", &self.kernel.digest())
            .finish()
    }
}

/// Acquires everything a boot needs. See the module docs for ordering.
pub async fn prepare_boot(config: BootConfig, resources: BootResources<'_>) -> Result<BootPrep> {
    let BootResources {
        arch,
        rootfs,
        hypervisor,
        kernels,
        network,
    } = resources;

    info!(arch = %arch, command = ?config.command, "boot preparation started");

    let mut config = config;
    let resolved = config.validate().and_then(|()| {
        resolve_command_path(
            rootfs.as_ref(),
            &config.command,
            initial_path(&config.env),
            &config.work_dir,
        )
    });
    let command = match resolved {
        Ok(c) => c,
        Err(e) => {
            release_prepared(None, None, None, &rootfs);
            return Err(e);
        }
    };
    info!(exec = ?command, work_dir = %config.work_dir, "resolved container command");
    config.command = command;
    ensure_term(&mut config.env);

    let fs_backend = Arc::new(VirtioFsBackend::rootfs());
    if let Err(e) = fs_backend.set_abstract_root(Arc::clone(&rootfs)) {
        release_prepared(None, None, Some(fs_backend.as_ref()), &rootfs);
        return Err(e);
    }

    let mut hypervisor = match hypervisor.acquire() {
        Ok(hv) => hv,
        Err(e) => {
            release_prepared(None, None, Some(fs_backend.as_ref()), &rootfs);
            return Err(e);
        }
    };
    if hypervisor.architecture() != arch {
        let err = Error::ArchitectureMismatch {
            component: "hypervisor".to_string(),
            expected: arch,
            found: hypervisor.architecture(),
        };
        release_prepared(None, Some(hypervisor.as_mut()), Some(fs_backend.as_ref()), &rootfs);
        return Err(err);
    }

    let kernel = match kernels.load_cached(arch, true).await {
        Ok(k) => k,
        Err(e) => {
            release_prepared(None, Some(hypervisor.as_mut()), Some(fs_backend.as_ref()), &rootfs);
            return Err(e);
        }
    };
    debug!(digest = kernel.digest(), size = kernel.len(), "kernel ready");

    let network = match network() {
        Ok(n) => n,
        Err(e) => {
            release_prepared(None, Some(hypervisor.as_mut()), Some(fs_backend.as_ref()), &rootfs);
            return Err(e);
        }
    };
    network.set_internet_access_enabled(config.enable_network);

    info!(
        cpus = config.cpus,
        memory_mib = config.memory_mib,
        dmesg = config.dmesg,
        exec = config.exec,
        "boot preparation complete"
    );

    Ok(BootPrep {
        arch,
        config,
        rootfs,
        fs_backend,
        hypervisor,
        kernel,
        network,
    })
}

fn release(resource: &str, result: Result<()>) {
    match result {
        Ok(()) => debug!(resource, "released"),
        Err(e) => warn!(resource, "failed to release: {e}"),
    }
}

/// Releases prepared resources in reverse acquisition order.
fn release_prepared(
    network: Option<&Arc<dyn NetworkBackend>>,
    hypervisor: Option<&mut dyn Hypervisor>,
    fs_backend: Option<&VirtioFsBackend>,
    rootfs: &Arc<dyn ContainerFs>,
) {
    if let Some(net) = network {
        release("network backend", net.close());
    }
    if let Some(hv) = hypervisor {
        release("hypervisor", hv.close());
    }
    if let Some(backend) = fs_backend {
        release("virtio-fs root", backend.detach_root().map(drop));
    }
    release("container filesystem", rootfs.close());
}

// =============================================================================
// Running Container
// =============================================================================

/// Host-side view rendering the guest console, closed before its VM.
pub trait ConsoleView: Send {
    fn close(&mut self) -> Result<()>;
}

/// Console wiring for [`start_container`].
#[derive(Default)]
pub struct ConsoleAttachment {
    pub view: Option<Box<dyn ConsoleView>>,
    pub output: Option<ConsoleOutput>,
    pub stdin: Option<StdinSource>,
}

/// A booted container and every resource it owns.
pub struct RunningContainer {
    session: Session,
    view: Option<Box<dyn ConsoleView>>,
    vm: VmHandle,
    rootfs: Arc<dyn ContainerFs>,
    network: Arc<dyn NetworkBackend>,
    hypervisor: Box<dyn Hypervisor>,
}

/// Creates the VM, builds the init program and starts its session.
///
/// Must be called from within a tokio runtime. On failure every resource
/// in `prep` is released.
pub fn start_container(
    prep: BootPrep,
    console: ConsoleAttachment,
    session_config: SessionConfig,
) -> Result<RunningContainer> {
    let BootPrep {
        arch,
        config,
        rootfs,
        fs_backend,
        mut hypervisor,
        kernel,
        network,
    } = prep;
    let ConsoleAttachment {
        mut view,
        output,
        stdin,
    } = console;

    let mut options = vec![
        VmOption::with_device_template(DeviceTemplate::virtio_fs(Arc::clone(&fs_backend), arch)),
        VmOption::with_dmesg_logging(config.dmesg),
    ];
    if let Some(stdin) = stdin {
        options.push(VmOption::Stdin(stdin));
    }
    if let Some(output) = output {
        options.push(VmOption::with_console_output(output));
    }
    if config.enable_network {
        options.push(VmOption::with_device_template(DeviceTemplate::virtio_net(
            Arc::clone(&network),
            arch,
        )));
    }

    let init_config = ContainerInitConfig {
        env: config.env.clone(),
        work_dir: config.work_dir.clone(),
        enable_network: config.enable_network,
        exec: config.exec,
        uid: config.uid,
        gid: config.gid,
        hostname: config.hostname.clone(),
        ..ContainerInitConfig::new(arch, config.command.clone())
    };

    let started = VirtualMachine::new(
        hypervisor.as_mut(),
        config.cpus,
        config.memory_mib,
        kernel,
        options,
    )
    .and_then(|vm| {
        let handle = vm.handle();
        let built = build_container_init_program(&init_config).and_then(|program| {
            let mut session = Session::new(vm, session_config);
            session.start(Some(program))?;
            Ok(session)
        });
        match built {
            Ok(session) => Ok((session, handle)),
            Err(e) => {
                release("virtual machine", handle.close());
                Err(e)
            }
        }
    });

    match started {
        Ok((session, vm)) => {
            info!(session = %session.id(), "container session started");
            Ok(RunningContainer {
                session,
                view,
                vm,
                rootfs,
                network,
                hypervisor,
            })
        }
        Err(e) => {
            if let Some(view) = view.as_mut() {
                release("console view", view.close());
            }
            release_prepared(
                Some(&network),
                Some(hypervisor.as_mut()),
                Some(fs_backend.as_ref()),
                &rootfs,
            );
            Err(e)
        }
    }
}

impl RunningContainer {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn vm(&self) -> &VmHandle {
        &self.vm
    }

    /// Propagates a terminal resize to the guest console.
    pub fn set_console_size(&self, cols: u16, rows: u16) -> Result<()> {
        self.vm.set_console_size(cols, rows)
    }

    pub fn set_internet_access_enabled(&self, enabled: bool) {
        info!(enabled, "toggling guest internet access");
        self.network.set_internet_access_enabled(enabled);
    }

    /// Waits for the container to finish.
    pub async fn wait(&mut self) -> Result<()> {
        self.session.wait().await
    }

    /// Releases everything in teardown order.
    ///
    /// Returns the session outcome if it arrived within `stop_timeout`.
    pub async fn shutdown(mut self, stop_timeout: Duration) -> Option<Result<()>> {
        info!(session = %self.session.id(), "stopping container");

        self.session.stop(stop_timeout).await;

        if let Some(view) = self.view.as_mut() {
            release("console view", view.close());
        }
        release("virtual machine", self.vm.close());
        release("container filesystem", self.rootfs.close());
        release("network backend", self.network.close());
        release("hypervisor", self.hypervisor.close());

        info!(session = %self.session.id(), "container stopped");
        self.session.take_outcome()
    }
}

impl std::fmt::Debug for RunningContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningContainer")
            .field("session", &self.session)
            .field("vm", &self.vm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{FileInfo, MemoryFs};

    fn cmd(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_initial_path() {
        assert_eq!(initial_path(&[]), DEFAULT_PATH_ENV);
        assert_eq!(
            initial_path(&cmd(&["A=1", "PATH=/usr/local/bin:/bin"])),
            "/usr/local/bin:/bin"
        );
        assert_eq!(initial_path(&cmd(&["PATH="])), DEFAULT_PATH_ENV);
    }

    #[test]
    fn test_slash_command_kept() {
        let fs = MemoryFs::new();
        let resolved = resolve_command_path(&fs, &cmd(&["./run.sh", "-x"]), "", "/").unwrap();
        assert_eq!(resolved, cmd(&["./run.sh", "-x"]));
    }

    #[test]
    fn test_path_search_skips_non_executable() {
        let fs = MemoryFs::new()
            .with_file("/bin/tool", 0o644)
            .with_file("/usr/bin/tool", 0o755);
        fs.insert("/sbin/tool", FileInfo::dir(0o755));
        let resolved =
            resolve_command_path(&fs, &cmd(&["tool", "a"]), "/sbin:/bin:/usr/bin", "/").unwrap();
        assert_eq!(resolved, cmd(&["/usr/bin/tool", "a"]));
    }

    #[test]
    fn test_empty_and_relative_entries_use_work_dir() {
        let fs = MemoryFs::new()
            .with_file("/app/run", 0o700)
            .with_file("/app/scripts/go", 0o755);
        assert_eq!(
            resolve_command_path(&fs, &cmd(&["run"]), ":/bin", "/app").unwrap(),
            cmd(&["/app/run"])
        );
        assert_eq!(
            resolve_command_path(&fs, &cmd(&["go"]), "/bin:scripts", "/app").unwrap(),
            cmd(&["/app/scripts/go"])
        );
    }

    #[test]
    fn test_not_found() {
        let fs = MemoryFs::new();
        assert!(matches!(
            resolve_command_path(&fs, &cmd(&["missing"]), "", ""),
            Err(Error::CommandResolution { .. })
        ));
        assert!(resolve_command_path(&fs, &[], "", "").is_err());
    }

    #[test]
    fn test_boot_config_defaults() {
        let mut cfg: BootConfig = serde_json::from_str(r#"{"command":["sh"],"cpus":0}"#).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.cpus, DEFAULT_VCPUS);
        assert_eq!(cfg.memory_mib, DEFAULT_VM_MEMORY_MIB);
        assert!(cfg.exec);
        assert!(cfg.enable_network);

        let mut cfg = BootConfig::new(["sh"]).with_resources(MAX_VCPUS + 1, 512);
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_release_detaches_virtio_fs_before_closing_rootfs() {
        let fs = Arc::new(MemoryFs::new());
        let rootfs: Arc<dyn ContainerFs> = fs.clone();
        let backend = VirtioFsBackend::rootfs();
        backend.set_abstract_root(Arc::clone(&rootfs)).unwrap();

        release_prepared(None, None, Some(&backend), &rootfs);

        assert!(backend.abstract_root().is_none());
        assert!(fs.is_closed());
        // Only the caller's handles remain.
        assert_eq!(Arc::strong_count(&fs), 2);
    }
}
