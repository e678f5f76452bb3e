//! # guestinit
//!
//! **Host-Driven Container Init for Micro-VMs**
//!
//! Boots an unmodified Linux kernel in a hardware-virtualized VM and turns
//! it into a running container process without shipping an init binary,
//! shell or any userspace tooling into the guest. The host describes the
//! bootstrap (mount table, root pivot, hostname, network, final launch) as
//! a small declarative [`Program`] and injects it into the guest one
//! syscall at a time.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            guestinit                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ContainerInitConfig ──► build_container_init_program ──► Program   │
//! │                                                              │      │
//! │  ┌───────────────────────────────────────────────────────────┼──┐   │
//! │  │                        Session                            ▼  │   │
//! │  │  Handshaking: wait_for_trampoline + Return(0)  (10s bound)   │   │
//! │  │  Running:     Engine ── one syscall per round-trip ──► vCPU  │   │
//! │  │  stdin pump ──► console         completion ──► Done          │   │
//! │  └──────────────────────────────────────────────────────────────┘   │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                   Hypervisor / Device Contract                      │
//! │  ┌──────────────┐  ┌────────────────┐  ┌─────────────────────┐      │
//! │  │  Hypervisor  │  │  VirtualCpu    │  │  virtio-fs / net    │      │
//! │  │  (open/close)│  │  (trap contract│  │  device templates   │      │
//! │  └──────────────┘  └────────────────┘  └─────────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Error Convention
//!
//! Syscall results follow Linux: a negative value is `-errno`. Every
//! checked step of the init program stores its result in one shared slot
//! and jumps to a single fatal handler, which logs the errno and shuts the
//! guest down (restart on x86_64, power-off on arm64). A fatal boot error
//! therefore always ends in a bounded VM exit, never a hung vCPU.
//!
//! # Example
//!
//! ```rust,ignore
//! use guestinit::{CpuArchitecture, ContainerInitConfig, build_container_init_program};
//!
//! let cfg = ContainerInitConfig::new(CpuArchitecture::native()?, ["/bin/sh"]).with_exec(true);
//! let program = build_container_init_program(&cfg)?;
//! println!("{}", program.to_json()?);
//! ```

pub mod arch;
pub mod boot;
pub mod constants;
pub mod devices;
pub mod engine;
pub mod error;
pub mod hv;
pub mod init;
pub mod ir;
pub mod kernel;
pub mod session;
pub mod vm;

// Re-exports
pub use arch::CpuArchitecture;
pub use boot::{
    BootConfig, BootPrep, BootResources, ConsoleAttachment, ConsoleView, HypervisorSource,
    RunningContainer, prepare_boot, resolve_command_path, start_container,
};
pub use constants::*;
pub use devices::{ContainerFs, DeviceTemplate, NetworkBackend, VirtioFsBackend};
pub use engine::{CancelToken, Engine, EngineConfig};
pub use error::{Error, Result};
pub use hv::{Hypervisor, PreopenedHypervisor, ShutdownKind, Trap, VirtualCpu};
pub use init::{ContainerInitConfig, build_container_init_program};
pub use ir::{Expr, Fragment, Label, Method, Op, Program, Var};
pub use kernel::{DirectoryKernelLoader, KernelImage, KernelLoader};
pub use session::{Session, SessionConfig, SessionReport, SessionState};
pub use vm::{ConsoleOutput, VirtualMachine, VmHandle, VmOption};
