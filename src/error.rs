//! Error types for guest bootstrap, program execution and VM sessions.
//!
//! Variants are grouped by where in the boot pipeline they arise:
//!
//! | Category           | Raised by                         | Delivered through      |
//! |--------------------|-----------------------------------|------------------------|
//! | Boot preparation   | [`crate::boot::prepare_boot`]     | direct `Result`        |
//! | Program model      | [`crate::ir::Program::new`]       | direct `Result`        |
//! | Guest boot timeout | session handshake                 | [`crate::Session`]     |
//! | Guest runtime      | error-handler shutdown in guest   | [`crate::Session`]     |
//! | Post-handoff       | container exit status             | [`crate::Session`]     |

use std::path::PathBuf;
use std::time::Duration;

use crate::arch::CpuArchitecture;
use crate::hv::ShutdownKind;

/// Result type alias for guestinit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while preparing, booting or driving a guest.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Boot Preparation Errors
    // =========================================================================
    /// Platform identifier does not name a supported architecture.
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// Two components disagree about the guest architecture.
    #[error("architecture mismatch: {component} is {found}, expected {expected}")]
    ArchitectureMismatch {
        component: String,
        expected: CpuArchitecture,
        found: CpuArchitecture,
    },

    /// Container command could not be resolved to an executable.
    #[error("failed to resolve command '{command}': {reason}")]
    CommandResolution { command: String, reason: String },

    /// Hypervisor could not be opened on this host.
    #[error("hypervisor not available: {0}")]
    HypervisorUnavailable(String),

    /// Kernel image could not be produced for the requested architecture.
    #[error("failed to load kernel for {arch}: {reason}")]
    KernelLoad {
        arch: CpuArchitecture,
        reason: String,
    },

    /// Kernel image content did not match its recorded digest.
    #[error("kernel digest mismatch at {path}: expected {expected}, got {actual}")]
    KernelDigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// A device backend failed to initialise.
    #[error("device setup failed for {device}: {reason}")]
    DeviceSetup { device: String, reason: String },

    /// Boot or VM configuration is out of bounds.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Program Model Errors
    // =========================================================================
    /// Program entrypoint names a method that does not exist.
    #[error("entrypoint '{0}' is not a method of the program")]
    MissingEntrypoint(String),

    /// A `Goto` targets a label that is not declared in the same method.
    #[error("undefined label '{label}' in method '{method}'")]
    UndefinedLabel { method: String, label: String },

    /// A label is declared more than once in one method.
    #[error("duplicate label '{label}' in method '{method}'")]
    DuplicateLabel { method: String, label: String },

    /// A variable was read before any assignment reached it.
    #[error("variable '{0}' read before assignment")]
    UndefinedVar(String),

    /// Program is structurally invalid for the requested operation.
    #[error("invalid program: {0}")]
    InvalidProgram(String),

    // =========================================================================
    // Guest Boot Errors
    // =========================================================================
    /// Guest did not reach the injection point before the handshake deadline.
    #[error("guest did not complete boot handshake within {0:?}")]
    GuestBootTimeout(Duration),

    // =========================================================================
    // Guest Runtime Errors
    // =========================================================================
    /// Guest powered off or restarted before the program returned.
    ///
    /// `errno` carries the last value of the program's error slot when the
    /// shutdown was issued by the program's own error handler.
    #[error("guest {kind} during init program (errno={errno:?})")]
    GuestShutdown {
        kind: ShutdownKind,
        errno: Option<i64>,
    },

    /// Host-side interpreter exceeded its instruction budget.
    #[error("program exceeded step budget of {0} instructions")]
    StepLimitExceeded(u64),

    /// Backend reported a trap the engine cannot interpret in this position.
    #[error("guest protocol violation: {0}")]
    GuestProtocol(String),

    /// vCPU backend failed while running an injected syscall.
    #[error("vCPU error: {0}")]
    Vcpu(String),

    // =========================================================================
    // Post-Handoff Errors
    // =========================================================================
    /// Container process exited with a non-zero status.
    #[error("container exited with status {code}")]
    ContainerExit { code: i64 },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Session was cancelled before the program completed.
    #[error("session cancelled")]
    Cancelled,

    /// `start` was called on a session that already left `Unstarted`.
    #[error("session already started")]
    SessionAlreadyStarted,

    /// Operation on a VM that has already been closed.
    #[error("virtual machine is closed")]
    VmClosed,

    /// Session driver ended without delivering a completion value.
    #[error("session ended without a result")]
    SessionLost,

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for failures raised before any VM exists.
    pub fn is_boot_preparation(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedArchitecture(_)
                | Self::ArchitectureMismatch { .. }
                | Self::CommandResolution { .. }
                | Self::HypervisorUnavailable(_)
                | Self::KernelLoad { .. }
                | Self::KernelDigestMismatch { .. }
                | Self::DeviceSetup { .. }
                | Self::InvalidConfig(_)
        )
    }

    /// Returns the container exit status if this error reports one.
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            Self::ContainerExit { code } => Some(*code),
            _ => None,
        }
    }
}
