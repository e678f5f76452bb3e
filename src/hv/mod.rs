//! # Hypervisor Contract
//!
//! The minimal surface the execution engine needs from a hypervisor
//! backend. A backend opens a platform handle ([`Hypervisor`]), creates
//! machines from a [`MachineSpec`], and hands back two halves:
//!
//! - a [`VirtualCpu`], moved onto the engine's blocking thread, which
//!   executes exactly one injected syscall per round-trip
//! - a [`MachineControl`], shared with the host, for console input,
//!   terminal resize and power-off
//!
//! ## Trap Contract
//!
//! Every [`VirtualCpu::syscall`] returns a [`Trap`]:
//!
//! | Trap                  | Meaning                                                  |
//! |-----------------------|----------------------------------------------------------|
//! | `Returned(v)`         | syscall ran; control is back at the trampoline           |
//! | `ChildDetached{pid}`  | a forked child left trampoline control (exec or exit)    |
//! | `HandedOff{code}`     | PID 1 exec'd the container; the VM ran to completion     |
//! | `Shutdown(kind)`      | guest powered off or restarted                           |
//!
//! `clone` follows vfork semantics: the first return is `0` in the child.
//! The engine records the fork point and, on `ChildDetached`, resumes the
//! parent continuation with the child's pid as the `clone` result.

pub mod sim;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::arch::CpuArchitecture;
use crate::devices::DeviceTemplate;
use crate::engine::CancelToken;
use crate::error::Result;
use crate::kernel::KernelImage;
use crate::vm::ConsoleOutput;

/// Guest-initiated power transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownKind {
    PowerOff,
    Restart,
}

impl fmt::Display for ShutdownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PowerOff => f.write_str("power-off"),
            Self::Restart => f.write_str("restart"),
        }
    }
}

/// How control came back from the guest after an injected syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Returned(i64),
    ChildDetached { pid: i64 },
    HandedOff { exit_code: i64 },
    Shutdown(ShutdownKind),
}

/// Register file of one injected syscall.
pub type SyscallArgs = [u64; 6];

/// Boot vCPU of a machine, driven from a single blocking thread.
pub trait VirtualCpu: Send {
    fn architecture(&self) -> CpuArchitecture;

    /// Runs the guest until the trampoline is ready for its first request.
    ///
    /// Implementations poll `cancel` while waiting and return
    /// [`crate::Error::Cancelled`] once it fires.
    fn wait_for_trampoline(&mut self, cancel: &CancelToken) -> Result<()>;

    /// Releases every materialised constant and buffer.
    fn reset_scratch(&mut self) -> Result<()>;

    /// Copies bytes into guest scratch memory, returning their guest address.
    fn materialize(&mut self, bytes: &[u8]) -> Result<u64>;

    /// Reads guest memory at `addr`.
    fn read_guest(&mut self, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Performs one kernel syscall in the guest and waits for the trap back.
    fn syscall(&mut self, nr: u64, args: SyscallArgs) -> Result<Trap>;
}

/// Host-side control of a running machine.
pub trait MachineControl: Send + Sync {
    /// Feeds bytes to the guest console as keyboard/serial input.
    fn console_input(&self, bytes: &[u8]) -> Result<()>;

    fn set_console_size(&self, cols: u16, rows: u16) -> Result<()>;

    /// Powers the machine off. Idempotent.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Everything a backend needs to create one machine.
pub struct MachineSpec {
    pub cpus: u32,
    pub memory_mib: u64,
    pub kernel: KernelImage,
    pub devices: Vec<DeviceTemplate>,
    pub console: Option<ConsoleOutput>,
    pub dmesg_logging: bool,
}

/// A created machine, split into its driving and control halves.
pub struct Machine {
    pub vcpu: Box<dyn VirtualCpu>,
    pub control: Arc<dyn MachineControl>,
}

/// Opened platform hypervisor handle.
pub trait Hypervisor: Send {
    fn architecture(&self) -> CpuArchitecture;

    fn create_machine(&mut self, spec: MachineSpec) -> Result<Machine>;

    fn close(&mut self) -> Result<()>;
}

/// Process-wide slot for a hypervisor opened eagerly at startup.
///
/// Opening early surfaces an unsupported host before any UI work. The
/// handle is later moved into exactly one boot attempt with
/// [`take`](Self::take), which empties the slot.
#[derive(Default)]
pub struct PreopenedHypervisor {
    slot: Option<Box<dyn Hypervisor>>,
}

impl PreopenedHypervisor {
    pub fn new(hv: Box<dyn Hypervisor>) -> Self {
        Self { slot: Some(hv) }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_present(&self) -> bool {
        self.slot.is_some()
    }

    /// Transfers ownership out of the slot.
    pub fn take(&mut self) -> Option<Box<dyn Hypervisor>> {
        let hv = self.slot.take();
        if hv.is_some() {
            tracing::debug!("pre-opened hypervisor transferred to boot attempt");
        }
        hv
    }

    /// Closes the handle if the slot still owns it.
    pub fn close(&mut self) -> Result<()> {
        match self.slot.take() {
            Some(mut hv) => hv.close(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for PreopenedHypervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreopenedHypervisor")
            .field("present", &self.slot.is_some())
            .finish()
    }
}

/// Opens a hypervisor for this host.
pub type HypervisorOpener = dyn FnOnce() -> Result<Box<dyn Hypervisor>> + Send;
