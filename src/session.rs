//! # VM Session
//!
//! One program execution against one [`VirtualMachine`].
//!
//! ## Lifecycle
//!
//! ```text
//! Unstarted --start--> Handshaking --handshake ok--> Running --> Exited
//!                           |                           |
//!                           +-------- stop() -----------+-----> Stopped
//! ```
//!
//! `start` spawns a driver task. The driver moves the vCPU onto a blocking
//! thread, waits for the trampoline and runs the handshake program
//! (`Return(0)`) under [`HANDSHAKE_TIMEOUT`]. Only then does it start the
//! stdin pump and run the real program. Exactly one value is delivered
//! through the completion channel, whichever path ends the run.
//!
//! ## Outcomes
//!
//! | Program result          | Completion value                     |
//! |-------------------------|--------------------------------------|
//! | `Return(0)`             | `Ok(())`                             |
//! | `Return(n)`, `n != 0`   | `Err(ContainerExit { code: n })`     |
//! | error-handler shutdown  | `Err(GuestShutdown { kind, errno })` |
//! | handshake deadline      | `Err(GuestBootTimeout(..))`          |
//! | `stop()` before return  | `Err(Cancelled)`                     |

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::constants::{DEFAULT_STEP_BUDGET, HANDSHAKE_TIMEOUT, STOP_GRACE};
use crate::engine::{CancelToken, Engine, EngineConfig};
use crate::error::{Error, Result};
use crate::hv::VirtualCpu;
use crate::ir::{Program, Var};
use crate::vm::{ConsoleOutput, StdinSource, VirtualMachine, VmHandle};

/// Callback run once the guest has accepted the handshake.
pub type BootCallback = Box<dyn FnOnce() + Send + 'static>;

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unstarted,
    Handshaking,
    Running,
    Exited,
    Stopped,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Stopped)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unstarted => "unstarted",
            Self::Handshaking => "handshaking",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Session settings.
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub step_budget: u64,
    /// Error slot reported when the program's handler shuts the guest down.
    pub errno_var: Option<Var>,
    pub on_boot_complete: Option<BootCallback>,
}

impl SessionConfig {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_step_budget(mut self, budget: u64) -> Self {
        self.step_budget = budget;
        self
    }

    pub fn on_boot_complete(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_boot_complete = Some(Box::new(callback));
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            step_budget: DEFAULT_STEP_BUDGET,
            errno_var: Some(crate::init::errno_var()),
            on_boot_complete: None,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("step_budget", &self.step_budget)
            .field("errno_var", &self.errno_var)
            .field("on_boot_complete", &self.on_boot_complete.is_some())
            .finish()
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: SessionState,
    /// `"ok"` or the error message.
    pub outcome: String,
    pub exit_code: Option<i64>,
}

impl SessionReport {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Drives one program against one virtual machine.
pub struct Session {
    id: Uuid,
    vm: Option<VirtualMachine>,
    handle: VmHandle,
    cancel: CancelToken,
    config: SessionConfig,
    state_tx: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    done: Option<oneshot::Receiver<Result<()>>>,
    outcome: Option<Result<()>>,
    driver: Option<JoinHandle<()>>,
    report: Arc<Mutex<Option<SessionReport>>>,
}

impl Session {
    /// Takes exclusive ownership of `vm`.
    pub fn new(vm: VirtualMachine, config: SessionConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Unstarted);
        let handle = vm.handle();
        let id = Uuid::now_v7();
        debug!(session = %id, vm = ?vm, "session created");
        Self {
            id,
            vm: Some(vm),
            handle,
            cancel: CancelToken::new(),
            config,
            state_tx: Arc::new(state_tx),
            state_rx,
            done: None,
            outcome: None,
            driver: None,
            report: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Receiver observing every state transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn handle(&self) -> VmHandle {
        self.handle.clone()
    }

    /// Report of the finished run, once the driver has completed.
    pub fn report(&self) -> Option<SessionReport> {
        self.report.lock().ok().and_then(|r| r.clone())
    }

    /// Boots the guest and runs `program`.
    ///
    /// With `None`, the session completes after the handshake. Must be
    /// called from within a tokio runtime.
    pub fn start(&mut self, program: Option<Program>) -> Result<()> {
        let mut vm = self.vm.take().ok_or(Error::SessionAlreadyStarted)?;
        let vcpu = vm
            .take_vcpu()
            .ok_or_else(|| Error::Internal("virtual machine has no vCPU".to_string()))?;

        let (done_tx, done_rx) = oneshot::channel();
        self.done = Some(done_rx);

        let driver = Driver {
            id: self.id,
            vcpu: Some(vcpu),
            stdin: vm.take_stdin(),
            console: vm.console().cloned(),
            handle: self.handle.clone(),
            cancel: self.cancel.clone(),
            handshake_timeout: self.config.handshake_timeout,
            engine_config: EngineConfig {
                step_budget: self.config.step_budget,
                errno_var: self.config.errno_var.clone(),
            },
            on_boot_complete: self.config.on_boot_complete.take(),
            state: Arc::clone(&self.state_tx),
            report: Arc::clone(&self.report),
        };

        info!(
            session = %self.id,
            boot_only = program.is_none(),
            "starting session"
        );
        self.driver = Some(tokio::spawn(async move {
            // Keeps the machine alive for the run; the host closes it through
            // its handle.
            let _vm = vm;
            let result = driver.run(program).await;
            if done_tx.send(result).is_err() {
                debug!("session completion receiver dropped");
            }
        }));
        Ok(())
    }

    /// Waits for the completion value.
    ///
    /// The value is delivered once; later calls return
    /// [`Error::SessionLost`].
    pub async fn wait(&mut self) -> Result<()> {
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        match self.done.take() {
            Some(rx) => rx.await.unwrap_or(Err(Error::SessionLost)),
            None => Err(Error::SessionLost),
        }
    }

    /// Completion value collected by [`stop`](Self::stop), if any.
    pub fn take_outcome(&mut self) -> Option<Result<()>> {
        self.outcome.take()
    }

    /// Hands the completion receiver to the caller.
    pub fn take_done(&mut self) -> Option<oneshot::Receiver<Result<()>>> {
        self.done.take()
    }

    /// Cancels the run and waits up to `timeout` for it to finish.
    ///
    /// Always returns within `timeout` plus [`STOP_GRACE`]. The session is in
    /// a terminal state afterwards. A completion value that arrives in time
    /// stays available through [`wait`](Self::wait).
    pub async fn stop(&mut self, timeout: Duration) {
        info!(session = %self.id, state = %self.state(), "stopping session");
        self.cancel.cancel();

        if let Some(mut rx) = self.done.take() {
            match tokio::time::timeout(timeout, &mut rx).await {
                Ok(value) => self.outcome = Some(value.unwrap_or(Err(Error::SessionLost))),
                Err(_) => {
                    warn!(
                        session = %self.id,
                        ?timeout,
                        "session did not finish before stop timeout"
                    );
                    self.done = Some(rx);
                }
            }
        }

        if transition(&self.state_tx, SessionState::Stopped) {
            debug!(session = %self.id, "session marked stopped");
        }

        // A driver still inside an injected syscall is left detached.
        if self.outcome.is_some()
            && let Some(driver) = self.driver.take()
        {
            let _ = tokio::time::timeout(STOP_GRACE, driver).await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("started", &self.vm.is_none())
            .finish()
    }
}

/// Moves the state forward unless it is already terminal.
fn transition(tx: &watch::Sender<SessionState>, next: SessionState) -> bool {
    tx.send_if_modified(|state| {
        if state.is_terminal() || *state == next {
            return false;
        }
        *state = next;
        true
    })
}

// =============================================================================
// Driver
// =============================================================================

struct Driver {
    id: Uuid,
    vcpu: Option<Box<dyn VirtualCpu>>,
    stdin: Option<StdinSource>,
    console: Option<ConsoleOutput>,
    handle: VmHandle,
    cancel: CancelToken,
    handshake_timeout: Duration,
    engine_config: EngineConfig,
    on_boot_complete: Option<BootCallback>,
    state: Arc<watch::Sender<SessionState>>,
    report: Arc<Mutex<Option<SessionReport>>>,
}

impl Driver {
    async fn run(mut self, program: Option<Program>) -> Result<()> {
        let started_at = Utc::now();
        let mut pump = None;

        let result = self.execute(program, &mut pump).await;

        if let Some(task) = pump {
            task.abort();
        }

        // A run that finished before observing cancellation still exited.
        let state = if matches!(result, Err(Error::Cancelled)) {
            SessionState::Stopped
        } else {
            SessionState::Exited
        };
        transition(&self.state, state);

        let report = SessionReport {
            id: self.id,
            started_at,
            finished_at: Utc::now(),
            state: *self.state.borrow(),
            outcome: match &result {
                Ok(()) => "ok".to_string(),
                Err(e) => e.to_string(),
            },
            exit_code: match &result {
                Ok(()) => Some(0),
                Err(e) => e.exit_code(),
            },
        };
        match &result {
            Ok(()) => info!(
                session = %report.id,
                state = %report.state,
                elapsed_ms = report.duration().num_milliseconds(),
                "session finished"
            ),
            Err(e) => warn!(
                session = %report.id,
                state = %report.state,
                elapsed_ms = report.duration().num_milliseconds(),
                error = %e,
                "session finished with error"
            ),
        }
        match self.report.lock() {
            Ok(mut slot) => *slot = Some(report),
            Err(e) => error!("session report lock poisoned: {e}"),
        }

        result
    }

    async fn execute(
        &mut self,
        program: Option<Program>,
        pump: &mut Option<JoinHandle<()>>,
    ) -> Result<()> {
        transition(&self.state, SessionState::Handshaking);
        self.handshake().await?;

        if let Some(stdin) = self.stdin.take() {
            *pump = Some(tokio::spawn(pump_stdin(stdin, self.handle.clone())));
        }

        if let Some(callback) = self.on_boot_complete.take() {
            callback();
        }

        if !transition(&self.state, SessionState::Running) {
            return Err(Error::Cancelled);
        }

        let Some(program) = program else {
            debug!(session = %self.id, "boot-only session complete");
            return Ok(());
        };

        let engine = Engine::new(self.engine_config.clone()).with_console(self.console.clone());
        let cancel = self.cancel.clone();
        let mut vcpu = self.take_vcpu()?;
        let value = tokio::task::spawn_blocking(move || {
            let value = engine.run(vcpu.as_mut(), &program, &cancel);
            (vcpu, value)
        })
        .await
        .map_err(|e| Error::Internal(format!("program task failed: {e}")))
        .map(|(vcpu, value)| {
            self.vcpu = Some(vcpu);
            value
        })??;

        if value == 0 {
            Ok(())
        } else {
            Err(Error::ContainerExit { code: value })
        }
    }

    /// Waits for the trampoline and runs `Return(0)` against it.
    async fn handshake(&mut self) -> Result<()> {
        let program = Program::handshake()?;
        let engine = Engine::default();
        let cancel = self.cancel.clone();
        let mut vcpu = self.take_vcpu()?;

        debug!(session = %self.id, timeout = ?self.handshake_timeout, "waiting for guest handshake");
        let task = tokio::task::spawn_blocking(move || {
            let result = vcpu
                .wait_for_trampoline(&cancel)
                .and_then(|()| engine.run(vcpu.as_mut(), &program, &cancel));
            (vcpu, result)
        });

        match tokio::time::timeout(self.handshake_timeout, task).await {
            Ok(Ok((vcpu, result))) => {
                self.vcpu = Some(vcpu);
                match result? {
                    0 => {
                        info!(session = %self.id, "guest handshake complete");
                        Ok(())
                    }
                    other => Err(Error::GuestProtocol(format!(
                        "handshake returned {other}, expected 0"
                    ))),
                }
            }
            Ok(Err(e)) => Err(Error::Internal(format!("handshake task failed: {e}"))),
            Err(_) => {
                self.cancel.cancel();
                error!(
                    session = %self.id,
                    timeout = ?self.handshake_timeout,
                    "guest did not complete handshake"
                );
                Err(Error::GuestBootTimeout(self.handshake_timeout))
            }
        }
    }

    fn take_vcpu(&mut self) -> Result<Box<dyn VirtualCpu>> {
        self.vcpu.take().ok_or(Error::VmClosed)
    }
}

/// Forwards input to the guest console until EOF or the VM closes.
async fn pump_stdin(mut stdin: StdinSource, handle: VmHandle) {
    let mut buf = [0u8; 1024];
    let mut forwarded = 0usize;
    loop {
        let n = match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("stdin read failed: {e}");
                break;
            }
        };
        if let Err(e) = handle.console_input(&buf[..n]) {
            debug!("stopping stdin pump: {e}");
            break;
        }
        forwarded += n;
    }
    debug!(bytes = forwarded, "stdin pump finished");
}
