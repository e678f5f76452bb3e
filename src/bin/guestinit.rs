//! guestinit - container init program tool
//!
//! Builds the bootstrap program for a container configuration and runs it
//! against the simulated guest.
//!
//! ## Usage
//!
//! ```sh
//! guestinit dump <config.json>
//! guestinit simulate <config.json> [--exit-code N] [--fail-mount] [--rootfs DIR]
//! guestinit arch [name]
//! ```
//!
//! `config.json` is a serialized `ContainerInitConfig`. `--rootfs` serves an
//! unpacked rootfs directory to the guest instead of a generated one.
//! Logging honours `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use guestinit::arch::host_has_hypervisor;
use guestinit::constants::{DEFAULT_STOP_TIMEOUT, ROOTFS_TAG};
use guestinit::devices::{ContainerFs, FileInfo, HostDirFs, IsolatedNetwork, MemoryFs};
use guestinit::hv::sim::{SimConfig, SimFailure, SimHypervisor};
use guestinit::ir::linux::ENODEV;
use guestinit::ir::Syscall;
use guestinit::{
    ConsoleOutput, ContainerInitConfig, CpuArchitecture, DeviceTemplate, Error, KernelImage,
    Session, SessionConfig, VirtioFsBackend, VirtualMachine, VmOption,
    build_container_init_program,
};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Dump {
        config: PathBuf,
    },
    Simulate {
        config: PathBuf,
        exit_code: i64,
        fail_mount: bool,
        rootfs: Option<PathBuf>,
    },
    Arch {
        name: Option<String>,
    },
    Version,
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "dump" => {
            let config = args.get(2).ok_or("dump requires <config.json>")?;
            Ok(Command::Dump {
                config: PathBuf::from(config),
            })
        }
        "simulate" => {
            let config = args.get(2).ok_or("simulate requires <config.json>")?;
            let mut exit_code = 0;
            let mut fail_mount = false;
            let mut rootfs = None;
            let mut i = 3;
            while i < args.len() {
                match args[i].as_str() {
                    "--exit-code" => {
                        let value = args.get(i + 1).ok_or("--exit-code requires a value")?;
                        exit_code = value
                            .parse()
                            .map_err(|e| format!("invalid exit code '{value}': {e}"))?;
                        i += 2;
                    }
                    "--fail-mount" => {
                        fail_mount = true;
                        i += 1;
                    }
                    "--rootfs" => {
                        let dir = args.get(i + 1).ok_or("--rootfs requires a directory")?;
                        rootfs = Some(PathBuf::from(dir));
                        i += 2;
                    }
                    other => return Err(format!("unknown option: {other}")),
                }
            }
            Ok(Command::Simulate {
                config: PathBuf::from(config),
                exit_code,
                fail_mount,
                rootfs,
            })
        }
        "arch" => Ok(Command::Arch {
            name: args.get(2).cloned(),
        }),
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        unknown => Err(format!("unknown command: {unknown}")),
    }
}

fn print_help() {
    println!(
        "guestinit {}

USAGE:
    guestinit dump <config.json>
    guestinit simulate <config.json> [--exit-code N] [--fail-mount] [--rootfs DIR]
    guestinit arch [name]
    guestinit version",
        env!("CARGO_PKG_VERSION")
    );
}

// =============================================================================
// Command Implementations
// =============================================================================

fn load_config(path: &PathBuf) -> Result<ContainerInitConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&content).map_err(|e| format!("invalid config: {e}"))
}

fn cmd_dump(config: PathBuf) -> Result<(), String> {
    let cfg = load_config(&config)?;
    let program = build_container_init_program(&cfg).map_err(|e| e.to_string())?;
    let json = program.to_json().map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}

fn cmd_arch(name: Option<String>) -> Result<(), String> {
    let native = name.is_none();
    let arch = match name {
        Some(name) => CpuArchitecture::parse(&name),
        None => CpuArchitecture::native(),
    }
    .map_err(|e| e.to_string())?;
    println!("architecture: {arch}");
    println!("oci platform: linux/{}", arch.oci_name());
    println!("console:      {}", arch.console_device());
    if native {
        let available = if host_has_hypervisor() { "available" } else { "unavailable" };
        println!("hypervisor:   {available}");
    }
    Ok(())
}

/// Rootfs holding the command binary and the directories the init
/// program expects inside the container.
fn simulated_rootfs(cfg: &ContainerInitConfig) -> Arc<MemoryFs> {
    let fs = MemoryFs::new().with_dir("/etc").with_dir("/tmp");
    if let Some(cmd) = cfg.cmd.first() {
        fs.insert(cmd, FileInfo::file(0o755));
    }
    if !cfg.work_dir.is_empty() {
        fs.insert(&cfg.work_dir, FileInfo::dir(0o755));
    }
    Arc::new(fs)
}

/// Host terminal size, if stdout is a terminal.
fn terminal_size() -> Option<(u16, u16)> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ only writes into the provided winsize.
    let rc = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) };
    (rc == 0 && ws.ws_col > 0).then_some((ws.ws_col, ws.ws_row))
}

async fn cmd_simulate(
    config: PathBuf,
    exit_code: i64,
    fail_mount: bool,
    rootfs_dir: Option<PathBuf>,
) -> Result<i64, String> {
    let cfg = load_config(&config)?;
    let arch = cfg.arch;
    let program = build_container_init_program(&cfg).map_err(|e| e.to_string())?;

    let command = cfg.cmd.first().cloned().unwrap_or_default();
    let mut sim = SimConfig::new(arch).with_exit_code(command, exit_code);
    if fail_mount {
        sim = sim.with_failure(SimFailure::new(Syscall::Mount, ENODEV).at("/mnt"));
    }
    let mut hv = SimHypervisor::new(sim);
    let probe = hv.probe();

    let rootfs: Arc<dyn ContainerFs> = match rootfs_dir {
        Some(dir) => Arc::new(HostDirFs::new(dir).map_err(|e| e.to_string())?),
        None => simulated_rootfs(&cfg),
    };
    let backend = Arc::new(VirtioFsBackend::new(ROOTFS_TAG));
    backend
        .set_abstract_root(rootfs)
        .map_err(|e| e.to_string())?;

    let mut options = vec![
        VmOption::with_device_template(DeviceTemplate::virtio_fs(backend, arch)),
        VmOption::with_console_output(ConsoleOutput::stdout()),
        VmOption::with_dmesg_logging(true),
    ];
    if cfg.enable_network {
        options.push(VmOption::with_device_template(DeviceTemplate::virtio_net(
            Arc::new(IsolatedNetwork::new()),
            arch,
        )));
    }

    let kernel = KernelImage::new(arch, b"simulated kernel".to_vec());
    let vm = VirtualMachine::new(&mut hv, 1, 256, kernel, options).map_err(|e| e.to_string())?;
    if let Some((cols, rows)) = terminal_size() {
        debug!(cols, rows, "propagating terminal size");
        vm.set_console_size(cols, rows).map_err(|e| e.to_string())?;
    }

    let mut session = Session::new(vm, SessionConfig::default());
    session.start(Some(program)).map_err(|e| e.to_string())?;
    let finished = tokio::select! {
        outcome = session.wait() => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };
    let outcome = match finished {
        Some(outcome) => outcome,
        None => {
            warn!("interrupted, stopping session");
            session.stop(DEFAULT_STOP_TIMEOUT).await;
            session.take_outcome().unwrap_or(Err(Error::Cancelled))
        }
    };

    info!(syscalls = probe.syscall_log().len(), "simulation finished");
    if let Some(report) = session.report() {
        let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
        println!("{json}");
    }

    match outcome {
        Ok(()) => Ok(0),
        Err(Error::ContainerExit { code }) => Ok(code),
        Err(e) => Err(e.to_string()),
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to set tracing subscriber");
    }

    let command = match parse_args() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            print_help();
            return ExitCode::from(2);
        }
    };

    let result = match command {
        Command::Dump { config } => cmd_dump(config).map(|()| 0),
        Command::Simulate {
            config,
            exit_code,
            fail_mount,
            rootfs,
        } => cmd_simulate(config, exit_code, fail_mount, rootfs).await,
        Command::Arch { name } => cmd_arch(name).map(|()| 0),
        Command::Version => {
            println!("guestinit {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
        Command::Help => {
            print_help();
            Ok(0)
        }
    };

    match result {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
