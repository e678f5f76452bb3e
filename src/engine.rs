//! # Execution Engine
//!
//! Host-side interpreter that drives a [`VirtualCpu`] through a lowered
//! [`Program`], one injected syscall per round-trip.
//!
//! ```text
//!   host (engine thread)                      guest
//!   ────────────────────                      ─────
//!   eval args, materialise strings
//!   vcpu.syscall(nr, args) ──────────────────► trampoline: syscall
//!                          ◄────────────────── trap back with result
//!   store result, evaluate If/Goto/Assign
//!   ...
//!   Return(v) ⇒ program value
//! ```
//!
//! Only `Syscall` expressions cross into the guest. Every other
//! instruction is evaluated on the host between syscalls. Cancellation is
//! checked before each injection, never during one.
//!
//! ## Fork Points
//!
//! `clone` is vfork-like: the first trap returns `0` and the engine keeps
//! running the child's path. When the child leaves trampoline control the
//! backend reports [`Trap::ChildDetached`]; the engine restores the
//! variables captured at the fork and re-enters the instruction that
//! issued `clone`, this time yielding the child's pid.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::constants::DEFAULT_STEP_BUDGET;
use crate::error::{Error, Result};
use crate::hv::{SyscallArgs, Trap, VirtualCpu};
use crate::ir::{Expr, Instr, Program, Syscall, SyscallCall, Var};
use crate::vm::ConsoleOutput;

// =============================================================================
// Cancellation
// =============================================================================

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    deadline: OnceLock<(Instant, Duration)>,
}

/// Cancellation token with an optional deadline.
///
/// Clones share state. The engine observes it only at syscall boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(timeout: Duration) -> Self {
        let token = Self::new();
        token.arm_deadline(timeout);
        token
    }

    /// Sets the deadline relative to now. Only the first call takes effect.
    pub fn arm_deadline(&self, timeout: Duration) {
        let _ = self.state.deadline.set((Instant::now() + timeout, timeout));
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.state
            .deadline
            .get()
            .is_some_and(|(at, _)| Instant::now() >= *at)
    }

    /// Returns an error if the token was cancelled or its deadline passed.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some((at, timeout)) = self.state.deadline.get()
            && Instant::now() >= *at
        {
            return Err(Error::Timeout {
                operation: "guest program".to_string(),
                duration: *timeout,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Interpreter settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum instructions interpreted per run.
    pub step_budget: u64,
    /// Variable reported in [`Error::GuestShutdown`] when the guest shuts
    /// down mid-program.
    pub errno_var: Option<Var>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_budget: DEFAULT_STEP_BUDGET,
            errno_var: None,
        }
    }
}

/// Drives programs against a vCPU.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: EngineConfig,
    console: Option<ConsoleOutput>,
}

struct ForkPoint {
    pc: usize,
    vars: HashMap<Var, i64>,
}

enum Flow {
    Next,
    Jump(usize),
    Finish(i64),
    /// Child detached; resume the parent at the fork point.
    Rewind(i64),
}

enum Value {
    Int(i64),
    Escape(Escape),
}

/// Control left the current path of the program.
#[derive(Clone, Copy)]
enum Escape {
    /// A forked child detached with this pid.
    Detached(i64),
    /// PID 1 exec'd and the container exited with this code.
    HandedOff(i64),
}

impl From<Escape> for Flow {
    fn from(e: Escape) -> Self {
        match e {
            Escape::Detached(pid) => Flow::Rewind(pid),
            Escape::HandedOff(code) => Flow::Finish(code),
        }
    }
}

impl From<Escape> for Value {
    fn from(e: Escape) -> Self {
        Value::Escape(e)
    }
}

/// Unwraps an integer value or propagates an escape to the caller.
macro_rules! int_or_escape {
    ($value:expr) => {
        match $value {
            Value::Int(v) => v,
            Value::Escape(e) => return Ok(e.into()),
        }
    };
}

enum PrintfArg {
    Int(i64),
    Str(String),
}

/// Per-run interpreter state. Variables live here and die with the run.
struct Run<'a> {
    vcpu: &'a mut dyn VirtualCpu,
    cancel: &'a CancelToken,
    vars: HashMap<Var, i64>,
    fork: Option<ForkPoint>,
    clone_result: Option<i64>,
    pc: usize,
    syscalls: u64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            console: None,
        }
    }

    /// Routes `Printf` output to a console in addition to the log.
    pub fn with_console(mut self, console: Option<ConsoleOutput>) -> Self {
        self.console = console;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs `program` from its entrypoint to a `Return`.
    ///
    /// Returns the program value. A guest shutdown before `Return` is
    /// [`Error::GuestShutdown`]; a PID-1 handoff yields the container's exit
    /// code as the value.
    pub fn run(
        &self,
        vcpu: &mut dyn VirtualCpu,
        program: &Program,
        cancel: &CancelToken,
    ) -> Result<i64> {
        let entry = program.entrypoint();
        let plan = program.plan(entry).ok_or_else(|| {
            Error::InvalidProgram(format!("entrypoint '{entry}' has no lowered form"))
        })?;

        vcpu.reset_scratch()?;

        let mut run = Run {
            vcpu,
            cancel,
            vars: HashMap::new(),
            fork: None,
            clone_result: None,
            pc: 0,
            syscalls: 0,
        };
        let mut steps: u64 = 0;

        let result = loop {
            let Some(instr) = plan.instrs.get(run.pc) else {
                break Err(Error::InvalidProgram(format!(
                    "method '{entry}' ended without a return"
                )));
            };

            steps += 1;
            if steps > self.config.step_budget {
                break Err(Error::StepLimitExceeded(self.config.step_budget));
            }

            let flow = match self.step(&mut run, instr) {
                Ok(flow) => flow,
                Err(e) => break Err(e),
            };

            match flow {
                Flow::Next => run.pc += 1,
                Flow::Jump(target) => run.pc = target,
                Flow::Finish(v) => break Ok(v),
                Flow::Rewind(pid) => {
                    let Some(fork) = run.fork.take() else {
                        break Err(Error::GuestProtocol(
                            "child detached without a fork point".to_string(),
                        ));
                    };
                    debug!(pid, pc = fork.pc, "child detached, resuming parent");
                    run.vars = fork.vars;
                    run.pc = fork.pc;
                    run.clone_result = Some(pid);
                }
            }
        };

        match &result {
            Ok(v) => debug!(value = v, syscalls = run.syscalls, steps, "program returned"),
            Err(e) => debug!(error = %e, syscalls = run.syscalls, steps, "program failed"),
        }

        result.map_err(|e| match e {
            Error::GuestShutdown { kind, errno: None } => Error::GuestShutdown {
                kind,
                errno: self
                    .config
                    .errno_var
                    .as_ref()
                    .and_then(|v| run.vars.get(v).copied()),
            },
            other => other,
        })
    }

    fn step(&self, run: &mut Run<'_>, instr: &Instr) -> Result<Flow> {
        Ok(match instr {
            Instr::Eval(expr) => {
                int_or_escape!(run.eval(expr)?);
                Flow::Next
            }
            Instr::Assign(var, expr) => {
                let v = int_or_escape!(run.eval(expr)?);
                run.vars.insert(var.clone(), v);
                Flow::Next
            }
            Instr::JumpUnless(cond, target) => match int_or_escape!(run.eval(cond)?) {
                0 => Flow::Jump(*target),
                _ => Flow::Next,
            },
            Instr::Jump(target) => Flow::Jump(*target),
            Instr::Printf(format, args) => {
                let mut rendered = Vec::with_capacity(args.len());
                for arg in args {
                    rendered.push(match arg {
                        Expr::Str(s) => PrintfArg::Str(s.clone()),
                        other => PrintfArg::Int(int_or_escape!(run.eval(other)?)),
                    });
                }
                self.emit_printf(&format_printf(format, &rendered))?;
                Flow::Next
            }
            Instr::Return(expr) => Flow::Finish(int_or_escape!(run.eval(expr)?)),
        })
    }

    fn emit_printf(&self, line: &str) -> Result<()> {
        info!(target: "guestinit::guest", "{}", line.trim_end());
        if let Some(console) = &self.console {
            console.write_bytes(line.as_bytes())?;
        }
        Ok(())
    }
}

impl Run<'_> {
    fn eval(&mut self, expr: &Expr) -> Result<Value> {
        Ok(Value::Int(match expr {
            Expr::Int(v) => *v,
            Expr::Str(s) => {
                let mut bytes = Vec::with_capacity(s.len() + 1);
                bytes.extend_from_slice(s.as_bytes());
                bytes.push(0);
                self.vcpu.materialize(&bytes)? as i64
            }
            Expr::Bytes(b) => self.vcpu.materialize(b)? as i64,
            Expr::StrArray(items) => {
                let mut table = Vec::with_capacity((items.len() + 1) * 8);
                for item in items {
                    let mut bytes = Vec::with_capacity(item.len() + 1);
                    bytes.extend_from_slice(item.as_bytes());
                    bytes.push(0);
                    let addr = self.vcpu.materialize(&bytes)?;
                    table.extend_from_slice(&addr.to_le_bytes());
                }
                table.extend_from_slice(&0u64.to_le_bytes());
                self.vcpu.materialize(&table)? as i64
            }
            Expr::Buffer(size) => self.vcpu.materialize(&vec![0u8; *size])? as i64,
            Expr::Var(var) => *self
                .vars
                .get(var)
                .ok_or_else(|| Error::UndefinedVar(var.name().to_string()))?,
            Expr::Op(op, left, right) => {
                let l = int_or_escape!(self.eval(left)?);
                let r = int_or_escape!(self.eval(right)?);
                op.apply(l, r)
            }
            Expr::Load32(addr) => {
                let addr = int_or_escape!(self.eval(addr)?);
                let mut buf = [0u8; 4];
                self.vcpu.read_guest(addr as u64, &mut buf)?;
                i64::from(i32::from_le_bytes(buf))
            }
            Expr::Syscall(call) => return self.syscall(call),
        }))
    }

    fn syscall(&mut self, call: &SyscallCall) -> Result<Value> {
        if call.syscall == Syscall::Clone
            && let Some(pid) = self.clone_result.take()
        {
            return Ok(Value::Int(pid));
        }

        if call.args.len() > SyscallCall::MAX_ARGS {
            return Err(Error::InvalidProgram(format!(
                "{} called with {} arguments",
                call.syscall,
                call.args.len()
            )));
        }

        let mut args: SyscallArgs = [0; 6];
        for (slot, arg) in args.iter_mut().zip(&call.args) {
            *slot = int_or_escape!(self.eval(arg)?) as u64;
        }

        self.cancel.check()?;

        let arch = self.vcpu.architecture();
        let nr = call.syscall.number(arch);
        trace!(syscall = %call.syscall, nr, ?args, "injecting syscall");

        if call.syscall == Syscall::Clone {
            self.fork = Some(ForkPoint {
                pc: self.pc,
                vars: self.vars.clone(),
            });
        }

        self.syscalls += 1;
        match self.vcpu.syscall(nr, args)? {
            Trap::Returned(v) => {
                trace!(syscall = %call.syscall, result = v, "syscall returned");
                if call.syscall == Syscall::Clone && v != 0 {
                    // Failed or backend ran the child to completion already.
                    self.fork = None;
                }
                Ok(Value::Int(v))
            }
            Trap::ChildDetached { pid } => Ok(Value::Escape(Escape::Detached(pid))),
            Trap::HandedOff { exit_code } => {
                debug!(exit_code, "guest handed off to container process");
                Ok(Value::Escape(Escape::HandedOff(exit_code)))
            }
            Trap::Shutdown(kind) => {
                debug!(%kind, syscall = %call.syscall, "guest shut down");
                Err(Error::GuestShutdown { kind, errno: None })
            }
        }
    }
}

/// Formats a `Printf` line. Supports `%d`, `%x`, `%s` and `%%`.
fn format_printf(format: &str, args: &[PrintfArg]) -> String {
    let mut out = String::with_capacity(format.len());
    let mut args = args.iter();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(spec @ ('d' | 'x' | 's')) => match (spec, args.next()) {
                (_, None) => out.push_str("%!(MISSING)"),
                ('d', Some(PrintfArg::Int(v))) | ('s', Some(PrintfArg::Int(v))) => {
                    let _ = write!(out, "{v}");
                }
                ('x', Some(PrintfArg::Int(v))) => {
                    if *v < 0 {
                        let _ = write!(out, "-{:x}", v.unsigned_abs());
                    } else {
                        let _ = write!(out, "{v:x}");
                    }
                }
                (_, Some(PrintfArg::Str(s))) => out.push_str(s),
                _ => {}
            },
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}
