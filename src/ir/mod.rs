//! # Program Model
//!
//! A bootstrap program is a map of named [`Method`]s plus an entrypoint.
//! Each method is a flat, ordered sequence of [`Fragment`]s. Control flow is
//! unstructured: a [`Fragment::DeclareLabel`] is an inline marker, and a
//! [`Fragment::Goto`] resumes linear execution at that marker, falling
//! through whatever follows it.
//!
//! ```text
//! main:
//!   assign errno = mount("rootfs", "/mnt", "virtiofs", 0, "")
//!   if errno < 0 { printf(...); goto fatal }
//!   ...
//!   return errno
//! fatal:                     <- label, body inline
//!   printf("fatal: errno=%x", errno)
//!   reboot(...)
//! ```
//!
//! ## Variables
//!
//! A [`Var`] is a named 64-bit signed slot scoped to one program run.
//! Several checks may share one variable; only the latest assignment is
//! visible. The error handler therefore always reports the most recent
//! failing result.
//!
//! ## Errno Convention
//!
//! Syscall results follow Linux: a value below zero is `-errno`.
//! [`Expr::is_negative`] is the guard used by every checked operation.
//!
//! ## Lowering
//!
//! [`Program::new`] validates the program and lowers every method once into
//! an instruction arena with index-based jumps (see [`plan`]). Programs are
//! immutable after construction.

pub mod linux;
pub mod plan;
pub mod syscall;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{Error, Result};

pub use plan::{Instr, MethodPlan};
pub use syscall::Syscall;

// =============================================================================
// Names
// =============================================================================

/// Named mutable 64-bit slot, scoped to one program run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Var(String);

impl Var {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Jump target declared inline within a method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Label(String);

impl Label {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Expressions
// =============================================================================

/// Binary operator over two 64-bit values.
///
/// Comparisons evaluate to `1` (true) or `0` (false).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Add,
    Sub,
    And,
    Shr,
    Lt,
    Ge,
    Eq,
    Ne,
}

impl Op {
    /// Applies the operator with wrapping arithmetic.
    pub fn apply(self, left: i64, right: i64) -> i64 {
        match self {
            Self::Add => left.wrapping_add(right),
            Self::Sub => left.wrapping_sub(right),
            Self::And => left & right,
            Self::Shr => ((left as u64) >> (right as u64 & 63)) as i64,
            Self::Lt => i64::from(left < right),
            Self::Ge => i64::from(left >= right),
            Self::Eq => i64::from(left == right),
            Self::Ne => i64::from(left != right),
        }
    }
}

/// One syscall request: a symbolic number plus up to six arguments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyscallCall {
    pub syscall: Syscall,
    pub args: Vec<Expr>,
}

impl SyscallCall {
    /// Maximum arguments a Linux syscall takes.
    pub const MAX_ARGS: usize = 6;

    pub fn new<const N: usize>(syscall: Syscall, args: [Expr; N]) -> Self {
        Self {
            syscall,
            args: args.into(),
        }
    }
}

/// Value-producing expression.
///
/// String, byte and array constants are materialised into guest memory by
/// the engine; their value is the guest address of the copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// Literal integer.
    Int(i64),
    /// NUL-terminated string constant.
    Str(String),
    /// Raw byte blob.
    Bytes(Vec<u8>),
    /// NULL-terminated array of pointers to NUL-terminated strings.
    StrArray(Vec<String>),
    /// Zeroed scratch buffer of the given size.
    Buffer(usize),
    /// Variable read.
    Var(Var),
    /// Binary operation.
    Op(Op, Box<Expr>, Box<Expr>),
    /// 32-bit signed load from a guest address.
    Load32(Box<Expr>),
    /// Syscall result.
    Syscall(SyscallCall),
}

impl Expr {
    pub fn int(v: i64) -> Self {
        Self::Int(v)
    }

    pub fn op(op: Op, left: impl Into<Expr>, right: impl Into<Expr>) -> Self {
        Self::Op(op, Box::new(left.into()), Box::new(right.into()))
    }

    pub fn add(left: impl Into<Expr>, right: impl Into<Expr>) -> Self {
        Self::op(Op::Add, left, right)
    }

    pub fn sub(left: impl Into<Expr>, right: impl Into<Expr>) -> Self {
        Self::op(Op::Sub, left, right)
    }

    pub fn and(left: impl Into<Expr>, right: impl Into<Expr>) -> Self {
        Self::op(Op::And, left, right)
    }

    pub fn shr(left: impl Into<Expr>, right: impl Into<Expr>) -> Self {
        Self::op(Op::Shr, left, right)
    }

    /// `value < 0`: the errno guard.
    pub fn is_negative(value: impl Into<Expr>) -> Self {
        Self::op(Op::Lt, value, 0)
    }

    pub fn is_greater_or_equal(left: impl Into<Expr>, right: impl Into<Expr>) -> Self {
        Self::op(Op::Ge, left, right)
    }

    pub fn is_zero(value: impl Into<Expr>) -> Self {
        Self::op(Op::Eq, value, 0)
    }

    pub fn is_not_equal(left: impl Into<Expr>, right: impl Into<Expr>) -> Self {
        Self::op(Op::Ne, left, right)
    }

    /// Negates an errno-style result back into a positive errno.
    pub fn errno_of(value: impl Into<Expr>) -> Self {
        Self::sub(0, value)
    }

    pub fn load32(addr: impl Into<Expr>) -> Self {
        Self::Load32(Box::new(addr.into()))
    }

    pub fn syscall<const N: usize>(syscall: Syscall, args: [Expr; N]) -> Self {
        Self::Syscall(SyscallCall::new(syscall, args))
    }

    /// Calls `f` on this expression and every nested sub-expression, in
    /// evaluation order.
    pub fn visit(&self, f: &mut dyn FnMut(&Expr)) {
        match self {
            Self::Op(_, l, r) => {
                l.visit(f);
                r.visit(f);
            }
            Self::Load32(addr) => addr.visit(f),
            Self::Syscall(call) => {
                for arg in &call.args {
                    arg.visit(f);
                }
            }
            _ => {}
        }
        f(self);
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for Expr {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Expr {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<Var> for Expr {
    fn from(v: Var) -> Self {
        Self::Var(v)
    }
}

impl From<&Var> for Expr {
    fn from(v: &Var) -> Self {
        Self::Var(v.clone())
    }
}

impl From<SyscallCall> for Expr {
    fn from(call: SyscallCall) -> Self {
        Self::Syscall(call)
    }
}

// =============================================================================
// Fragments
// =============================================================================

/// One element of a method body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Fragment {
    /// Syscall whose result is discarded (unchecked).
    Syscall(SyscallCall),
    /// Store an expression's value into a variable.
    Assign(Var, Expr),
    /// Run `body` when the condition is non-zero.
    If(Expr, Vec<Fragment>),
    /// Resume execution at a label of the same method.
    Goto(Label),
    /// Inline label followed by its body; execution falls through into it.
    DeclareLabel(Label, Vec<Fragment>),
    /// Host-side formatted diagnostic.
    Printf(String, Vec<Expr>),
    /// Finish the program with a value.
    Return(Expr),
    /// Grouping that flattens into the enclosing sequence.
    Block(Vec<Fragment>),
}

impl Fragment {
    pub fn syscall<const N: usize>(syscall: Syscall, args: [Expr; N]) -> Self {
        Self::Syscall(SyscallCall::new(syscall, args))
    }

    pub fn assign(var: &Var, value: impl Into<Expr>) -> Self {
        Self::Assign(var.clone(), value.into())
    }

    pub fn when(cond: Expr, body: impl Into<Vec<Fragment>>) -> Self {
        Self::If(cond, body.into())
    }

    pub fn goto(label: &Label) -> Self {
        Self::Goto(label.clone())
    }

    pub fn label(label: &Label, body: impl Into<Vec<Fragment>>) -> Self {
        Self::DeclareLabel(label.clone(), body.into())
    }

    pub fn printf<const N: usize>(format: impl Into<String>, args: [Expr; N]) -> Self {
        Self::Printf(format.into(), args.into())
    }

    pub fn ret(value: impl Into<Expr>) -> Self {
        Self::Return(value.into())
    }

    pub fn block(fragments: impl Into<Vec<Fragment>>) -> Self {
        Self::Block(fragments.into())
    }

    /// Calls `f` on every syscall reachable from this fragment, in source
    /// order, including syscalls nested in expressions and bodies.
    pub fn visit_syscalls(&self, f: &mut dyn FnMut(&SyscallCall)) {
        let mut on_expr = |e: &Expr| {
            if let Expr::Syscall(call) = e {
                f(call);
            }
        };
        match self {
            Self::Syscall(call) => {
                for arg in &call.args {
                    arg.visit(&mut on_expr);
                }
                f(call);
            }
            Self::Assign(_, e) | Self::Return(e) => e.visit(&mut on_expr),
            Self::If(cond, body) => {
                cond.visit(&mut on_expr);
                for frag in body {
                    frag.visit_syscalls(f);
                }
            }
            Self::Printf(_, args) => {
                for arg in args {
                    arg.visit(&mut on_expr);
                }
            }
            Self::DeclareLabel(_, body) | Self::Block(body) => {
                for frag in body {
                    frag.visit_syscalls(f);
                }
            }
            Self::Goto(_) => {}
        }
    }
}

// =============================================================================
// Methods and Programs
// =============================================================================

/// Ordered, flat sequence of fragments.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Method(Vec<Fragment>);

impl Method {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: Fragment) {
        self.0.push(fragment);
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Syscalls in source order.
    pub fn syscalls(&self) -> Vec<Syscall> {
        let mut out = Vec::new();
        for frag in &self.0 {
            frag.visit_syscalls(&mut |call| out.push(call.syscall));
        }
        out
    }
}

impl From<Vec<Fragment>> for Method {
    fn from(fragments: Vec<Fragment>) -> Self {
        Self(fragments)
    }
}

impl Extend<Fragment> for Method {
    fn extend<T: IntoIterator<Item = Fragment>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

/// Validated bootstrap program.
#[derive(Debug, Clone, Serialize)]
pub struct Program {
    methods: BTreeMap<String, Method>,
    entrypoint: String,
    #[serde(skip)]
    plans: Arc<BTreeMap<String, MethodPlan>>,
}

impl Program {
    /// Name of the single method produced by the builders in this crate.
    pub const MAIN: &'static str = "main";

    /// Validates and lowers a program.
    ///
    /// Fails if the entrypoint is missing, a label is declared twice in one
    /// method, or a `Goto` does not resolve within its method.
    pub fn new(
        methods: impl IntoIterator<Item = (String, Method)>,
        entrypoint: impl Into<String>,
    ) -> Result<Self> {
        let methods: BTreeMap<String, Method> = methods.into_iter().collect();
        let entrypoint = entrypoint.into();

        if !methods.contains_key(&entrypoint) {
            return Err(Error::MissingEntrypoint(entrypoint));
        }

        let mut plans = BTreeMap::new();
        for (name, method) in &methods {
            plans.insert(name.clone(), plan::lower(name, method)?);
        }

        Ok(Self {
            methods,
            entrypoint,
            plans: Arc::new(plans),
        })
    }

    /// Program with a single `main` method.
    pub fn with_main(method: Method) -> Result<Self> {
        Self::new([(Self::MAIN.to_string(), method)], Self::MAIN)
    }

    /// The handshake placeholder: `return 0`.
    pub fn handshake() -> Result<Self> {
        Self::with_main(Method::from(vec![Fragment::ret(0)]))
    }

    pub fn entrypoint(&self) -> &str {
        &self.entrypoint
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = (&str, &Method)> {
        self.methods.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The entrypoint method.
    pub fn main(&self) -> &Method {
        // Presence is checked in `new`.
        &self.methods[&self.entrypoint]
    }

    /// Lowered form of a method.
    pub fn plan(&self, name: &str) -> Option<&MethodPlan> {
        self.plans.get(name)
    }

    /// Pretty JSON rendering for inspection.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
