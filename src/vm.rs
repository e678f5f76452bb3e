//! # Virtual Machine
//!
//! Construction of a machine from a hypervisor handle, a kernel image and a
//! list of [`VmOption`]s, plus the console plumbing shared with the session.
//!
//! A [`VirtualMachine`] is owned by exactly one [`crate::Session`] once it
//! boots. The session moves the vCPU onto its driver thread; the host keeps
//! a cloneable [`VmHandle`] for resize and power-off.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::arch::CpuArchitecture;
use crate::constants::{MAX_VCPUS, MAX_VM_MEMORY_MIB};
use crate::devices::DeviceTemplate;
use crate::error::{Error, Result};
use crate::hv::{Hypervisor, MachineControl, MachineSpec, VirtualCpu};
use crate::kernel::KernelImage;

/// Source of bytes forwarded to the guest console.
pub type StdinSource = Box<dyn AsyncRead + Send + Unpin>;

// =============================================================================
// Console
// =============================================================================

/// Shared sink for guest console output and host-side diagnostics.
#[derive(Clone)]
pub struct ConsoleOutput {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ConsoleOutput {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut w = self
            .inner
            .lock()
            .map_err(|e| Error::Internal(format!("console lock poisoned: {e}")))?;
        w.write_all(bytes)?;
        w.flush()?;
        Ok(())
    }
}

impl fmt::Debug for ConsoleOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConsoleOutput")
    }
}

/// In-memory console, cloneable so a copy can be inspected after boot.
#[derive(Debug, Clone, Default)]
pub struct ConsoleCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl ConsoleCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    pub fn output(&self) -> ConsoleOutput {
        ConsoleOutput::new(self.clone())
    }
}

impl Write for ConsoleCapture {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut buf = self
            .buf
            .lock()
            .map_err(|_| std::io::Error::other("console capture poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Options
// =============================================================================

/// Machine construction option.
pub enum VmOption {
    DeviceTemplate(DeviceTemplate),
    Stdin(StdinSource),
    ConsoleOutput(ConsoleOutput),
    DmesgLogging(bool),
}

impl VmOption {
    pub fn with_device_template(template: DeviceTemplate) -> Self {
        Self::DeviceTemplate(template)
    }

    pub fn with_stdin(source: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Stdin(Box::new(source))
    }

    pub fn with_console_output(output: ConsoleOutput) -> Self {
        Self::ConsoleOutput(output)
    }

    pub fn with_dmesg_logging(enabled: bool) -> Self {
        Self::DmesgLogging(enabled)
    }
}

impl fmt::Debug for VmOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceTemplate(t) => f.debug_tuple("DeviceTemplate").field(t).finish(),
            Self::Stdin(_) => f.write_str("Stdin"),
            Self::ConsoleOutput(_) => f.write_str("ConsoleOutput"),
            Self::DmesgLogging(b) => f.debug_tuple("DmesgLogging").field(b).finish(),
        }
    }
}

// =============================================================================
// Machine
// =============================================================================

/// A created, not yet driven, machine.
pub struct VirtualMachine {
    arch: CpuArchitecture,
    cpus: u32,
    memory_mib: u64,
    dmesg_logging: bool,
    vcpu: Option<Box<dyn VirtualCpu>>,
    control: Arc<dyn MachineControl>,
    stdin: Option<StdinSource>,
    console: Option<ConsoleOutput>,
}

impl VirtualMachine {
    /// Creates a machine on `hv`.
    ///
    /// The kernel and every device template must target the hypervisor's
    /// architecture.
    pub fn new(
        hv: &mut dyn Hypervisor,
        cpus: u32,
        memory_mib: u64,
        kernel: KernelImage,
        options: Vec<VmOption>,
    ) -> Result<Self> {
        if cpus == 0 || cpus > MAX_VCPUS {
            return Err(Error::InvalidConfig(format!(
                "vCPU count {cpus} outside 1..={MAX_VCPUS}"
            )));
        }
        if memory_mib == 0 || memory_mib > MAX_VM_MEMORY_MIB {
            return Err(Error::InvalidConfig(format!(
                "memory {memory_mib} MiB outside 1..={MAX_VM_MEMORY_MIB}"
            )));
        }

        let arch = hv.architecture();
        if kernel.architecture() != arch {
            return Err(Error::ArchitectureMismatch {
                component: "kernel".to_string(),
                expected: arch,
                found: kernel.architecture(),
            });
        }

        let mut devices = Vec::new();
        let mut stdin = None;
        let mut console = None;
        let mut dmesg_logging = false;
        for option in options {
            match option {
                VmOption::DeviceTemplate(t) => {
                    if t.architecture() != arch {
                        return Err(Error::ArchitectureMismatch {
                            component: t.kind().to_string(),
                            expected: arch,
                            found: t.architecture(),
                        });
                    }
                    devices.push(t);
                }
                VmOption::Stdin(s) => stdin = Some(s),
                VmOption::ConsoleOutput(c) => console = Some(c),
                VmOption::DmesgLogging(b) => dmesg_logging = b,
            }
        }

        debug!(
            arch = %arch,
            cpus,
            memory_mib,
            devices = devices.len(),
            "creating virtual machine"
        );

        let machine = hv.create_machine(MachineSpec {
            cpus,
            memory_mib,
            kernel,
            devices,
            console: console.clone(),
            dmesg_logging,
        })?;

        info!(arch = %arch, cpus, memory_mib, "virtual machine created");

        Ok(Self {
            arch,
            cpus,
            memory_mib,
            dmesg_logging,
            vcpu: Some(machine.vcpu),
            control: machine.control,
            stdin,
            console,
        })
    }

    pub fn architecture(&self) -> CpuArchitecture {
        self.arch
    }

    pub fn cpus(&self) -> u32 {
        self.cpus
    }

    pub fn memory_mib(&self) -> u64 {
        self.memory_mib
    }

    pub fn dmesg_logging(&self) -> bool {
        self.dmesg_logging
    }

    pub fn console(&self) -> Option<&ConsoleOutput> {
        self.console.as_ref()
    }

    pub fn handle(&self) -> VmHandle {
        VmHandle {
            control: Arc::clone(&self.control),
        }
    }

    pub fn set_console_size(&self, cols: u16, rows: u16) -> Result<()> {
        self.control.set_console_size(cols, rows)
    }

    pub fn close(&self) -> Result<()> {
        self.control.close()
    }

    pub(crate) fn take_vcpu(&mut self) -> Option<Box<dyn VirtualCpu>> {
        self.vcpu.take()
    }

    pub(crate) fn take_stdin(&mut self) -> Option<StdinSource> {
        self.stdin.take()
    }
}

impl fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("arch", &self.arch)
            .field("cpus", &self.cpus)
            .field("memory_mib", &self.memory_mib)
            .field("dmesg_logging", &self.dmesg_logging)
            .field("closed", &self.control.is_closed())
            .finish()
    }
}

/// Cloneable host-side handle to a machine.
#[derive(Clone)]
pub struct VmHandle {
    control: Arc<dyn MachineControl>,
}

impl VmHandle {
    pub fn set_console_size(&self, cols: u16, rows: u16) -> Result<()> {
        if self.control.is_closed() {
            return Err(Error::VmClosed);
        }
        self.control.set_console_size(cols, rows)
    }

    pub fn console_input(&self, bytes: &[u8]) -> Result<()> {
        if self.control.is_closed() {
            return Err(Error::VmClosed);
        }
        self.control.console_input(bytes)
    }

    pub fn close(&self) -> Result<()> {
        self.control.close()
    }

    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }
}

impl fmt::Debug for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmHandle")
            .field("closed", &self.control.is_closed())
            .finish()
    }
}
