//! End-to-end session tests against the simulated guest.
//!
//! Every test boots a [`SimHypervisor`] machine with a small in-memory
//! container root and drives it through a [`Session`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use guestinit::devices::{IsolatedNetwork, MemoryFs};
use guestinit::hv::sim::{SimConfig, SimFailure, SimHypervisor, SimProbe};
use guestinit::ir::Syscall;
use guestinit::ir::linux::{EACCES, EBUSY, EINVAL, ENODEV, EPERM};
use guestinit::vm::ConsoleCapture;
use guestinit::{
    ContainerInitConfig, CpuArchitecture, DeviceTemplate, Error, Fragment, KernelImage, Method,
    Program, Session, SessionConfig, SessionState, ShutdownKind, VirtioFsBackend, VirtualMachine,
    VmOption, build_container_init_program,
};

fn rootfs() -> Arc<MemoryFs> {
    Arc::new(
        MemoryFs::new()
            .with_dir("/etc")
            .with_dir("/tmp")
            .with_file("/bin/true", 0o755)
            .with_file("/bin/app", 0o755),
    )
}

/// Creates a machine on `sim` with the test rootfs attached.
fn machine(sim: SimConfig, network: bool, extra: Vec<VmOption>) -> (VirtualMachine, SimProbe) {
    let arch = sim.arch;
    let mut hv = SimHypervisor::new(sim);
    let probe = hv.probe();

    let backend = Arc::new(VirtioFsBackend::rootfs());
    backend.set_abstract_root(rootfs()).unwrap();

    let mut options = vec![VmOption::with_device_template(DeviceTemplate::virtio_fs(
        backend, arch,
    ))];
    if network {
        options.push(VmOption::with_device_template(DeviceTemplate::virtio_net(
            Arc::new(IsolatedNetwork::new()),
            arch,
        )));
    }
    options.extend(extra);

    let kernel = KernelImage::new(arch, b"test kernel".to_vec());
    let vm = VirtualMachine::new(&mut hv, 1, 256, kernel, options).unwrap();
    (vm, probe)
}

fn init_program(cfg: ContainerInitConfig) -> Program {
    build_container_init_program(&cfg).unwrap()
}

/// `getpid(); return 0`
fn getpid_program() -> Program {
    Program::with_main(Method::from(vec![
        Fragment::syscall(Syscall::Getpid, []),
        Fragment::ret(0),
    ]))
    .unwrap()
}

// =============================================================================
// Container Init
// =============================================================================

#[tokio::test]
async fn test_exec_true_completes() {
    let arch = CpuArchitecture::X86_64;
    let (vm, probe) = machine(SimConfig::new(arch), false, vec![]);
    let mut session = Session::new(vm, SessionConfig::default());

    let cfg = ContainerInitConfig::new(arch, ["/bin/true"]).with_exec(true);
    session.start(Some(init_program(cfg))).unwrap();
    session.wait().await.unwrap();

    assert_eq!(session.state(), SessionState::Exited);
    assert_eq!(probe.root(), "/mnt");
    assert_eq!(probe.hostname().as_deref(), Some("guest"));
    assert_eq!(probe.count(Syscall::Reboot), 0);

    let execs = probe.execs();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].pid, 1);
    assert_eq!(execs[0].path, "/bin/true");
    assert!(execs[0].envp.contains(&"TERM=xterm-256color".to_string()));

    let kmsg = probe.kmsg().join("");
    assert!(kmsg.contains("guestinit: executing command /bin/true"));

    let report = session.report().unwrap();
    assert_eq!(report.outcome, "ok");
    assert_eq!(report.exit_code, Some(0));
    assert_eq!(report.state, SessionState::Exited);
}

#[tokio::test]
async fn test_mount_failure_shuts_guest_down() {
    let arch = CpuArchitecture::X86_64;
    let sim = SimConfig::new(arch).with_failure(SimFailure::new(Syscall::Mount, ENODEV).at("/mnt"));
    let capture = ConsoleCapture::new();
    let (vm, probe) = machine(
        sim,
        false,
        vec![VmOption::with_console_output(capture.output())],
    );
    let mut session = Session::new(vm, SessionConfig::default());

    session
        .start(Some(init_program(ContainerInitConfig::new(arch, ["/bin/true"]))))
        .unwrap();
    let err = session.wait().await.unwrap_err();

    match err {
        Error::GuestShutdown { kind, errno } => {
            assert_eq!(kind, ShutdownKind::Restart);
            assert_eq!(errno, Some(-ENODEV));
        }
        other => panic!("expected GuestShutdown, got {other:?}"),
    }
    assert_eq!(probe.count(Syscall::Reboot), 1);
    assert_eq!(probe.last_syscall(), Some(Syscall::Reboot));
    assert_eq!(probe.shutdown(), Some(ShutdownKind::Restart));
    assert!(probe.execs().is_empty(), "command must not run");
    let console = capture.text();
    assert!(console.contains("failed to mount virtiofs: errno=0x13"));
    assert!(console.contains("fatal error during boot: errno=0x-13"));
}

#[tokio::test]
async fn test_mount_failure_powers_off_on_arm64() {
    let arch = CpuArchitecture::Arm64;
    let sim = SimConfig::new(arch).with_failure(SimFailure::new(Syscall::Mount, ENODEV).at("/mnt"));
    let (vm, probe) = machine(sim, false, vec![]);
    let mut session = Session::new(vm, SessionConfig::default());

    session
        .start(Some(init_program(ContainerInitConfig::new(arch, ["/bin/true"]))))
        .unwrap();
    let err = session.wait().await.unwrap_err();

    assert!(matches!(
        err,
        Error::GuestShutdown {
            kind: ShutdownKind::PowerOff,
            ..
        }
    ));
    assert_eq!(probe.shutdown(), Some(ShutdownKind::PowerOff));
}

#[tokio::test]
async fn test_missing_command_reaches_fatal_handler() {
    let arch = CpuArchitecture::X86_64;
    let (vm, probe) = machine(SimConfig::new(arch), false, vec![]);
    let mut session = Session::new(vm, SessionConfig::default());

    let cfg = ContainerInitConfig::new(arch, ["/bin/missing"]).with_exec(true);
    session.start(Some(init_program(cfg))).unwrap();

    assert!(matches!(
        session.wait().await,
        Err(Error::GuestShutdown { errno: Some(-2), .. })
    ));
    assert_eq!(probe.count(Syscall::Reboot), 1);
}

// =============================================================================
// Switch Root Failures
// =============================================================================

/// Runs the default init program for `/bin/true` with scripted failures.
async fn run_init(
    arch: CpuArchitecture,
    failures: Vec<SimFailure>,
) -> (guestinit::Result<()>, SimProbe) {
    let sim = failures
        .into_iter()
        .fold(SimConfig::new(arch), SimConfig::with_failure);
    let (vm, probe) = machine(sim, false, vec![]);
    let mut session = Session::new(vm, SessionConfig::default());
    session
        .start(Some(init_program(ContainerInitConfig::new(arch, ["/bin/true"]))))
        .unwrap();
    (session.wait().await, probe)
}

/// The guest went through the fatal handler exactly once and stopped there.
fn assert_fatal(
    result: guestinit::Result<()>,
    probe: &SimProbe,
    expected_kind: ShutdownKind,
    expected_errno: i64,
) {
    match result {
        Err(Error::GuestShutdown { kind, errno }) => {
            assert_eq!(kind, expected_kind);
            assert_eq!(errno, Some(expected_errno));
        }
        other => panic!("expected GuestShutdown, got {other:?}"),
    }
    assert_eq!(probe.count(Syscall::Reboot), 1);
    assert_eq!(probe.last_syscall(), Some(Syscall::Reboot));
    assert!(probe.execs().is_empty(), "command must not run");
}

#[tokio::test]
async fn test_pivot_failure_falls_back_to_chroot() {
    let (result, probe) = run_init(
        CpuArchitecture::X86_64,
        vec![SimFailure::new(Syscall::PivotRoot, EINVAL)],
    )
    .await;

    result.unwrap();
    assert_eq!(probe.count(Syscall::Chroot), 1);
    assert_eq!(probe.count(Syscall::Umount2), 0, "no oldroot to detach");
    assert_eq!(probe.count(Syscall::Unlinkat), 1);
    assert_eq!(probe.count(Syscall::Reboot), 0);
    assert_eq!(probe.root(), "/mnt");
}

#[tokio::test]
async fn test_pivot_and_chroot_failure_is_fatal() {
    let (result, probe) = run_init(
        CpuArchitecture::X86_64,
        vec![
            SimFailure::new(Syscall::PivotRoot, EINVAL),
            SimFailure::new(Syscall::Chroot, EPERM),
        ],
    )
    .await;

    assert_fatal(result, &probe, ShutdownKind::Restart, -EPERM);
    assert_eq!(probe.count(Syscall::Chroot), 1);
    assert_eq!(probe.count(Syscall::Unlinkat), 0);
}

#[tokio::test]
async fn test_chdir_into_rootfs_failure_is_fatal() {
    let (result, probe) = run_init(
        CpuArchitecture::Arm64,
        vec![SimFailure::new(Syscall::Chdir, EACCES).at("/mnt")],
    )
    .await;

    assert_fatal(result, &probe, ShutdownKind::PowerOff, -EACCES);
    assert_eq!(probe.count(Syscall::PivotRoot), 0);
}

#[tokio::test]
async fn test_oldroot_unmount_failure_is_fatal() {
    let (result, probe) = run_init(
        CpuArchitecture::X86_64,
        vec![SimFailure::new(Syscall::Umount2, EINVAL).at("/oldroot")],
    )
    .await;

    assert_fatal(result, &probe, ShutdownKind::Restart, -EINVAL);
    assert_eq!(probe.count(Syscall::PivotRoot), 1);
    assert_eq!(probe.count(Syscall::Unlinkat), 0);
}

#[tokio::test]
async fn test_oldroot_removal_failure_is_fatal() {
    let (result, probe) = run_init(
        CpuArchitecture::X86_64,
        vec![SimFailure::new(Syscall::Unlinkat, EBUSY).at("/oldroot")],
    )
    .await;

    assert_fatal(result, &probe, ShutdownKind::Restart, -EBUSY);
    assert_eq!(probe.count(Syscall::Sethostname), 0);
}

#[tokio::test]
async fn test_network_configured() {
    let arch = CpuArchitecture::X86_64;
    let (vm, probe) = machine(SimConfig::new(arch), true, vec![]);
    let mut session = Session::new(vm, SessionConfig::default());

    let cfg = ContainerInitConfig::new(arch, ["/bin/true"]).with_network(true);
    session.start(Some(init_program(cfg))).unwrap();
    session.wait().await.unwrap();

    let iface = probe.interface();
    assert_eq!(iface.address, Some("10.42.0.2".parse().unwrap()));
    assert_eq!(iface.netmask, Some("255.255.255.0".parse().unwrap()));
    assert_eq!(probe.gateways(), vec!["10.42.0.1".parse::<std::net::Ipv4Addr>().unwrap()]);

    let resolv = probe.file("/mnt/etc/resolv.conf").unwrap();
    assert_eq!(String::from_utf8(resolv).unwrap(), "nameserver 10.42.0.1\n");
}

#[tokio::test]
async fn test_network_without_device_fails() {
    let arch = CpuArchitecture::X86_64;
    let (vm, probe) = machine(SimConfig::new(arch), false, vec![]);
    let mut session = Session::new(vm, SessionConfig::default());

    let cfg = ContainerInitConfig::new(arch, ["/bin/true"]).with_network(true);
    session.start(Some(init_program(cfg))).unwrap();

    assert!(matches!(
        session.wait().await,
        Err(Error::GuestShutdown { errno: Some(e), .. }) if e == -ENODEV
    ));
    assert!(probe.execs().is_empty());
}

// =============================================================================
// Fork Mode
// =============================================================================

#[tokio::test]
async fn test_fork_mode_reports_exit_code() {
    let arch = CpuArchitecture::Arm64;
    let sim = SimConfig::new(arch).with_exit_code("/bin/app", 3);
    let (vm, probe) = machine(sim, false, vec![]);
    let mut session = Session::new(vm, SessionConfig::default());

    let cfg = ContainerInitConfig::new(arch, ["/bin/app", "--flag"]).with_exec(false);
    session.start(Some(init_program(cfg))).unwrap();

    assert!(matches!(
        session.wait().await,
        Err(Error::ContainerExit { code: 3 })
    ));
    let execs = probe.execs();
    assert_eq!(execs.len(), 1);
    assert_ne!(execs[0].pid, 1, "command must run in a child");
    assert_eq!(execs[0].argv, vec!["/bin/app", "--flag"]);
    assert!(!probe.is_closed(), "init survives the child");
    assert_eq!(session.report().unwrap().exit_code, Some(3));
}

#[tokio::test]
async fn test_fork_mode_signal_exit() {
    let arch = CpuArchitecture::X86_64;
    let sim = SimConfig::new(arch).with_signal("/bin/app", 9);
    let (vm, _probe) = machine(sim, false, vec![]);
    let mut session = Session::new(vm, SessionConfig::default());

    let cfg = ContainerInitConfig::new(arch, ["/bin/app"]).with_exec(false);
    session.start(Some(init_program(cfg))).unwrap();

    assert!(matches!(
        session.wait().await,
        Err(Error::ContainerExit { code: 137 })
    ));
}

#[tokio::test]
async fn test_fork_mode_success() {
    let arch = CpuArchitecture::X86_64;
    let (vm, probe) = machine(SimConfig::new(arch), false, vec![]);
    let mut session = Session::new(vm, SessionConfig::default());

    let cfg = ContainerInitConfig::new(arch, ["/bin/true"])
        .with_exec(false)
        .with_user(Some(1000), Some(1000));
    session.start(Some(init_program(cfg))).unwrap();
    session.wait().await.unwrap();

    let exec = &probe.execs()[0];
    assert_eq!((exec.uid, exec.gid), (Some(1000), Some(1000)));
    assert_eq!(probe.count(Syscall::Wait4), 1);
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn test_handshake_timeout() {
    let arch = CpuArchitecture::X86_64;
    let (vm, probe) = machine(SimConfig::new(arch).never_booting(), false, vec![]);
    let config = SessionConfig::default().with_handshake_timeout(Duration::from_millis(50));
    let mut session = Session::new(vm, config);

    session.start(Some(getpid_program())).unwrap();
    let err = session.wait().await.unwrap_err();

    assert!(matches!(err, Error::GuestBootTimeout(d) if d == Duration::from_millis(50)));
    assert_eq!(session.state(), SessionState::Exited);
    assert!(probe.syscalls().is_empty(), "no syscall before the handshake");
}

#[tokio::test]
async fn test_boot_delay_within_timeout() {
    let arch = CpuArchitecture::Arm64;
    let sim = SimConfig::new(arch).with_boot_delay(Duration::from_millis(20));
    let (vm, probe) = machine(sim, false, vec![]);
    let mut session = Session::new(vm, SessionConfig::default());

    session.start(Some(getpid_program())).unwrap();
    session.wait().await.unwrap();

    assert_eq!(probe.syscalls(), vec![Syscall::Getpid]);
    assert!(probe.kmsg()[0].contains("trampoline ready"));
}

#[tokio::test]
async fn test_boot_only_session() {
    let arch = CpuArchitecture::X86_64;
    let (vm, probe) = machine(SimConfig::new(arch), false, vec![]);
    let booted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&booted);
    let config = SessionConfig::default().on_boot_complete(move || flag.store(true, Ordering::SeqCst));
    let mut session = Session::new(vm, config);

    session.start(None).unwrap();
    session.wait().await.unwrap();

    assert!(booted.load(Ordering::SeqCst));
    assert!(probe.syscalls().is_empty());
    assert_eq!(session.state(), SessionState::Exited);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_start_twice_rejected() {
    let arch = CpuArchitecture::X86_64;
    let (vm, _probe) = machine(SimConfig::new(arch), false, vec![]);
    let mut session = Session::new(vm, SessionConfig::default());

    session.start(None).unwrap();
    assert!(matches!(
        session.start(None),
        Err(Error::SessionAlreadyStarted)
    ));
    session.wait().await.unwrap();
}

#[tokio::test]
async fn test_state_transitions_in_order() {
    let arch = CpuArchitecture::X86_64;
    let (vm, _probe) = machine(SimConfig::new(arch), false, vec![]);
    let mut session = Session::new(vm, SessionConfig::default());
    assert_eq!(session.state(), SessionState::Unstarted);

    let mut rx = session.subscribe();
    let observer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while rx.changed().await.is_ok() {
            let state = *rx.borrow_and_update();
            seen.push(state);
            if state.is_terminal() {
                break;
            }
        }
        seen
    });

    session.start(Some(getpid_program())).unwrap();
    session.wait().await.unwrap();

    let seen = observer.await.unwrap();
    assert_eq!(seen.last(), Some(&SessionState::Exited));
    let order = [
        SessionState::Handshaking,
        SessionState::Running,
        SessionState::Exited,
    ];
    let ranks: Vec<usize> = seen
        .iter()
        .map(|s| order.iter().position(|o| o == s).unwrap())
        .collect();
    assert!(ranks.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
}

#[tokio::test]
async fn test_stop_is_bounded_and_forwards_stdin() {
    let arch = CpuArchitecture::X86_64;
    let sim = SimConfig::new(arch).hang_on(Syscall::Getpid);
    let stdin = std::io::Cursor::new(b"hello guest\n".to_vec());
    let (vm, probe) = machine(sim, false, vec![VmOption::with_stdin(stdin)]);
    let mut session = Session::new(vm, SessionConfig::default());
    let handle = session.handle();

    session.start(Some(getpid_program())).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while (probe.console_input().is_empty() || probe.count(Syscall::Getpid) == 0)
        && Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(probe.console_input(), b"hello guest\n");
    assert_eq!(session.state(), SessionState::Running);

    let timeout = Duration::from_millis(100);
    let started = Instant::now();
    session.stop(timeout).await;
    assert!(started.elapsed() < timeout + Duration::from_secs(1));
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(session.take_outcome().is_none());

    // Releases the guest blocked in its syscall.
    handle.close().unwrap();
    assert!(session.wait().await.is_err());
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn test_stop_after_exit_keeps_state() {
    let arch = CpuArchitecture::X86_64;
    let (vm, _probe) = machine(SimConfig::new(arch), false, vec![]);
    let mut session = Session::new(vm, SessionConfig::default());

    session.start(Some(getpid_program())).unwrap();
    session.wait().await.unwrap();
    session.stop(Duration::from_millis(50)).await;

    assert_eq!(session.state(), SessionState::Exited);
}

#[tokio::test]
async fn test_clean_exit_during_stop_reports_exited() {
    let arch = CpuArchitecture::X86_64;
    let sim = SimConfig::new(arch).with_latency(Syscall::Getpid, Duration::from_millis(300));
    let (vm, probe) = machine(sim, false, vec![]);
    let mut session = Session::new(vm, SessionConfig::default());

    session.start(Some(getpid_program())).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while probe.in_flight() != Some(Syscall::Getpid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(probe.in_flight(), Some(Syscall::Getpid));

    // Cancellation lands after the last syscall; the program still returns 0.
    session.stop(Duration::from_secs(5)).await;

    assert_eq!(session.state(), SessionState::Exited);
    assert!(matches!(session.take_outcome(), Some(Ok(()))));
    assert_eq!(session.report().unwrap().state, SessionState::Exited);
}

#[tokio::test]
async fn test_stop_collects_outcome() {
    let arch = CpuArchitecture::X86_64;
    let (vm, _probe) = machine(SimConfig::new(arch), false, vec![]);
    let mut session = Session::new(vm, SessionConfig::default());

    session.start(Some(getpid_program())).unwrap();
    session.stop(Duration::from_secs(5)).await;

    assert!(session.state().is_terminal());
    // Whichever way the race went, exactly one value was delivered.
    let outcome = session.wait().await;
    assert!(outcome.is_ok() || matches!(outcome, Err(Error::Cancelled)));
    assert!(matches!(session.wait().await, Err(Error::SessionLost)));
}

#[tokio::test]
async fn test_step_budget_enforced() {
    let arch = CpuArchitecture::X86_64;
    let (vm, _probe) = machine(SimConfig::new(arch), false, vec![]);
    let config = SessionConfig::default().with_step_budget(3);
    let mut session = Session::new(vm, config);

    session
        .start(Some(init_program(ContainerInitConfig::new(arch, ["/bin/true"]))))
        .unwrap();

    assert!(matches!(
        session.wait().await,
        Err(Error::StepLimitExceeded(3))
    ));
}
