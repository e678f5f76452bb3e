//! Boot preparation and teardown tests.
//!
//! Resources record their `close` calls in one shared event log so the
//! release order can be asserted across the filesystem, network backend,
//! hypervisor, console view and virtual machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use guestinit::devices::{FileInfo, MemoryFs};
use guestinit::hv::sim::{EventLog, SimConfig, SimHypervisor};
use guestinit::ir::Syscall;
use guestinit::kernel::InMemoryKernelLoader;
use guestinit::{
    BootConfig, BootResources, ConsoleAttachment, ConsoleView, ContainerFs, CpuArchitecture, Error,
    Hypervisor, HypervisorSource, KernelImage, NetworkBackend, PreopenedHypervisor, Result,
    SessionConfig, SessionState, prepare_boot, start_container,
};

// =============================================================================
// Test Resources
// =============================================================================

fn push(log: &EventLog, event: &str) {
    log.lock().unwrap().push(event.to_string());
}

fn events(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// In-memory rootfs that records its close.
struct LoggedFs {
    inner: MemoryFs,
    log: EventLog,
}

impl ContainerFs for LoggedFs {
    fn lookup(&self, path: &str) -> Result<Option<FileInfo>> {
        self.inner.lookup(path)
    }

    fn close(&self) -> Result<()> {
        push(&self.log, "rootfs.close");
        self.inner.close()
    }
}

#[derive(Default)]
struct LoggedNet {
    internet: AtomicBool,
    log: EventLog,
}

impl NetworkBackend for LoggedNet {
    fn set_internet_access_enabled(&self, enabled: bool) {
        self.internet.store(enabled, Ordering::SeqCst);
    }

    fn internet_access_enabled(&self) -> bool {
        self.internet.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<()> {
        push(&self.log, "network.close");
        Ok(())
    }
}

struct LoggedView {
    log: EventLog,
}

impl ConsoleView for LoggedView {
    fn close(&mut self) -> Result<()> {
        push(&self.log, "view.close");
        Ok(())
    }
}

const ARCH: CpuArchitecture = CpuArchitecture::X86_64;

fn rootfs(log: &EventLog) -> Arc<dyn ContainerFs> {
    Arc::new(LoggedFs {
        inner: MemoryFs::new()
            .with_dir("/etc")
            .with_file("/usr/bin/true", 0o755)
            .with_file("/bin/hang", 0o755),
        log: Arc::clone(log),
    })
}

fn kernels() -> InMemoryKernelLoader {
    InMemoryKernelLoader::new().with_image(KernelImage::new(ARCH, b"kernel".to_vec()))
}

fn sim_hypervisor(sim: SimConfig, log: &EventLog) -> Box<dyn Hypervisor> {
    Box::new(SimHypervisor::new(sim.with_event_log(Arc::clone(log))))
}

/// Network starter that hands out `net`.
fn starter(
    net: Arc<LoggedNet>,
) -> Box<dyn FnOnce() -> Result<Arc<dyn NetworkBackend>> + Send> {
    Box::new(move || Ok(net as Arc<dyn NetworkBackend>))
}

fn resources<'a>(
    log: &EventLog,
    hypervisor: HypervisorSource,
    kernels: &'a InMemoryKernelLoader,
    net: Arc<LoggedNet>,
) -> BootResources<'a> {
    BootResources {
        arch: ARCH,
        rootfs: rootfs(log),
        hypervisor,
        kernels,
        network: starter(net),
    }
}

fn logged_net(log: &EventLog) -> Arc<LoggedNet> {
    Arc::new(LoggedNet {
        log: Arc::clone(log),
        ..LoggedNet::default()
    })
}

// =============================================================================
// Preparation
// =============================================================================

#[tokio::test]
async fn test_prepare_resolves_command_and_uses_preopened() {
    let log = EventLog::default();
    let kernels = kernels();
    let net = logged_net(&log);

    let mut slot = PreopenedHypervisor::new(sim_hypervisor(SimConfig::new(ARCH), &log));
    let opened = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&opened);
    let source = HypervisorSource::from_slot(
        &mut slot,
        Box::new(move || {
            flag.store(true, Ordering::SeqCst);
            Err(Error::HypervisorUnavailable("unused".to_string()))
        }),
    );
    assert!(!slot.is_present(), "slot is emptied by the transfer");

    let config = BootConfig::new(["true", "-v"])
        .with_env(["PATH=/bin:/usr/bin"])
        .with_resources(0, 0);
    let prep = prepare_boot(config, resources(&log, source, &kernels, Arc::clone(&net)))
        .await
        .unwrap();

    assert!(!opened.load(Ordering::SeqCst));
    assert_eq!(prep.config.command, vec!["/usr/bin/true", "-v"]);
    assert!(prep.config.env.contains(&"TERM=xterm-256color".to_string()));
    assert_eq!(prep.config.cpus, 1);
    assert_eq!(prep.config.memory_mib, 1024);
    assert!(net.internet_access_enabled());
    assert!(events(&log).is_empty());

    let backend = Arc::clone(&prep.fs_backend);
    assert!(backend.abstract_root().is_some());
    prep.release();
    assert_eq!(
        events(&log),
        vec!["network.close", "hypervisor.close", "rootfs.close"]
    );
    assert!(backend.abstract_root().is_none(), "virtio-fs root detached");
}

#[tokio::test]
async fn test_prepare_opens_hypervisor_when_slot_empty() {
    let log = EventLog::default();
    let kernels = kernels();
    let mut slot = PreopenedHypervisor::empty();
    let hv_log = Arc::clone(&log);
    let source = HypervisorSource::from_slot(
        &mut slot,
        Box::new(move || Ok(sim_hypervisor(SimConfig::new(ARCH), &hv_log))),
    );

    let net = logged_net(&log);
    let config = BootConfig::new(["/usr/bin/true"]).with_network(false);
    let prep = prepare_boot(config, resources(&log, source, &kernels, Arc::clone(&net)))
        .await
        .unwrap();

    assert!(!net.internet_access_enabled());
    prep.release();
}

#[tokio::test]
async fn test_unresolvable_command_releases_rootfs_only() {
    let log = EventLog::default();
    let kernels = kernels();
    let opened = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&opened);
    let source = HypervisorSource::Open(Box::new(move || {
        flag.store(true, Ordering::SeqCst);
        Err(Error::HypervisorUnavailable("unused".to_string()))
    }));

    let config = BootConfig::new(["nope"]).with_env(["PATH=/bin"]);
    let err = prepare_boot(config, resources(&log, source, &kernels, logged_net(&log)))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::CommandResolution { .. }));
    assert!(err.is_boot_preparation());
    assert!(!opened.load(Ordering::SeqCst), "hypervisor must not be opened");
    assert_eq!(events(&log), vec!["rootfs.close"]);
}

#[tokio::test]
async fn test_empty_command_rejected() {
    let log = EventLog::default();
    let kernels = kernels();
    let source = HypervisorSource::Preopened(sim_hypervisor(SimConfig::new(ARCH), &log));

    let err = prepare_boot(
        BootConfig::default(),
        resources(&log, source, &kernels, logged_net(&log)),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::InvalidConfig(_)));
    assert_eq!(events(&log), vec!["rootfs.close"]);
}

#[tokio::test]
async fn test_excess_resources_rejected() {
    let log = EventLog::default();
    let kernels = kernels();
    let source = HypervisorSource::Preopened(sim_hypervisor(SimConfig::new(ARCH), &log));

    let config = BootConfig::new(["/usr/bin/true"]).with_resources(4096, 1024);
    let err = prepare_boot(config, resources(&log, source, &kernels, logged_net(&log)))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[tokio::test]
async fn test_hypervisor_open_failure_releases_rootfs() {
    let log = EventLog::default();
    let kernels = kernels();
    let source = HypervisorSource::Open(Box::new(|| {
        Err(Error::HypervisorUnavailable("no virtualization support".to_string()))
    }));

    let err = prepare_boot(
        BootConfig::new(["/usr/bin/true"]),
        resources(&log, source, &kernels, logged_net(&log)),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::HypervisorUnavailable(_)));
    assert_eq!(events(&log), vec!["rootfs.close"]);
}

#[tokio::test]
async fn test_architecture_mismatch_releases_in_reverse() {
    let log = EventLog::default();
    let kernels = kernels();
    let source = HypervisorSource::Preopened(sim_hypervisor(
        SimConfig::new(CpuArchitecture::Arm64),
        &log,
    ));

    let err = prepare_boot(
        BootConfig::new(["/usr/bin/true"]),
        resources(&log, source, &kernels, logged_net(&log)),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        Error::ArchitectureMismatch {
            expected: CpuArchitecture::X86_64,
            found: CpuArchitecture::Arm64,
            ..
        }
    ));
    assert_eq!(events(&log), vec!["hypervisor.close", "rootfs.close"]);
}

#[tokio::test]
async fn test_kernel_failure_releases_in_reverse() {
    let log = EventLog::default();
    let kernels = InMemoryKernelLoader::new();
    let source = HypervisorSource::Preopened(sim_hypervisor(SimConfig::new(ARCH), &log));

    let err = prepare_boot(
        BootConfig::new(["/usr/bin/true"]),
        resources(&log, source, &kernels, logged_net(&log)),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::KernelLoad { .. }));
    assert_eq!(events(&log), vec!["hypervisor.close", "rootfs.close"]);
}

#[tokio::test]
async fn test_network_failure_releases_in_reverse() {
    let log = EventLog::default();
    let kernels = kernels();
    let source = HypervisorSource::Preopened(sim_hypervisor(SimConfig::new(ARCH), &log));

    let resources = BootResources {
        arch: ARCH,
        rootfs: rootfs(&log),
        hypervisor: source,
        kernels: &kernels,
        network: Box::new(|| {
            Err(Error::DeviceSetup {
                device: "network".to_string(),
                reason: "stack failed to start".to_string(),
            })
        }),
    };
    let err = prepare_boot(BootConfig::new(["/usr/bin/true"]), resources)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::DeviceSetup { .. }));
    assert_eq!(events(&log), vec!["hypervisor.close", "rootfs.close"]);
}

// =============================================================================
// Running Containers
// =============================================================================

#[tokio::test]
async fn test_container_runs_to_completion() {
    let log = EventLog::default();
    let kernels = kernels();
    let source = HypervisorSource::Preopened(sim_hypervisor(SimConfig::new(ARCH), &log));

    let config = BootConfig::new(["true"]).with_env(["PATH=/usr/bin"]);
    let prep = prepare_boot(config, resources(&log, source, &kernels, logged_net(&log)))
        .await
        .unwrap();

    let mut container =
        start_container(prep, ConsoleAttachment::default(), SessionConfig::default()).unwrap();
    container.wait().await.unwrap();
    assert_eq!(container.state(), SessionState::Exited);

    // The outcome was consumed by wait().
    assert!(container.shutdown(Duration::from_millis(100)).await.is_none());
    assert_eq!(
        events(&log),
        vec!["rootfs.close", "network.close", "hypervisor.close"]
    );
}

#[tokio::test]
async fn test_shutdown_teardown_order() {
    let log = EventLog::default();
    let kernels = kernels();
    let sim = SimConfig::new(ARCH)
        .hang_on(Syscall::Sethostname)
        .with_event_log(Arc::clone(&log));
    let hv = SimHypervisor::new(sim);
    let probe = hv.probe();
    let source = HypervisorSource::Preopened(Box::new(hv));

    let prep = prepare_boot(
        BootConfig::new(["/bin/hang"]),
        resources(&log, source, &kernels, logged_net(&log)),
    )
    .await
    .unwrap();

    let console = ConsoleAttachment {
        view: Some(Box::new(LoggedView {
            log: Arc::clone(&log),
        })),
        ..ConsoleAttachment::default()
    };
    let container = start_container(prep, console, SessionConfig::default()).unwrap();
    container.set_console_size(120, 40).unwrap();
    container.set_internet_access_enabled(false);

    let deadline = Instant::now() + Duration::from_secs(5);
    while probe.count(Syscall::Sethostname) == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(container.state(), SessionState::Running);
    assert_eq!(probe.console_size(), Some((120, 40)));

    let outcome = container.shutdown(Duration::from_millis(50)).await;

    assert!(outcome.is_none(), "guest was still inside a syscall");
    assert_eq!(
        events(&log),
        vec![
            "view.close",
            "vm.close",
            "rootfs.close",
            "network.close",
            "hypervisor.close",
        ]
    );
}
