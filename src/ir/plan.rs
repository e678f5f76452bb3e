//! Lowering of methods into a flat instruction arena.
//!
//! `Block`, `If` and `DeclareLabel` bodies are spliced inline. Every label
//! becomes an index into the arena, so a `Goto` resumes exactly where the
//! label sits and execution falls through whatever follows it, including
//! the end of a label body.

use std::collections::HashMap;

use serde::Serialize;

use super::{Expr, Fragment, Label, Method, Var};
use crate::error::{Error, Result};

/// One lowered instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Instr {
    /// Evaluate for side effects (an unchecked syscall).
    Eval(Expr),
    Assign(Var, Expr),
    /// Jump to the target when the condition evaluates to zero.
    JumpUnless(Expr, usize),
    Jump(usize),
    Printf(String, Vec<Expr>),
    Return(Expr),
}

/// Lowered method: instructions plus the resolved label table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MethodPlan {
    pub instrs: Vec<Instr>,
    pub labels: HashMap<Label, usize>,
}

impl MethodPlan {
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn label_index(&self, label: &Label) -> Option<usize> {
        self.labels.get(label).copied()
    }
}

enum Pending {
    Ready(Instr),
    Goto(Label),
}

struct Lowering<'a> {
    method: &'a str,
    out: Vec<Pending>,
    labels: HashMap<Label, usize>,
}

impl Lowering<'_> {
    fn emit(&mut self, fragments: &[Fragment]) -> Result<()> {
        for frag in fragments {
            match frag {
                Fragment::Syscall(call) => {
                    self.out.push(Pending::Ready(Instr::Eval(Expr::Syscall(call.clone()))));
                }
                Fragment::Assign(var, expr) => {
                    self.out
                        .push(Pending::Ready(Instr::Assign(var.clone(), expr.clone())));
                }
                Fragment::If(cond, body) => {
                    let at = self.out.len();
                    // Patched once the body length is known.
                    self.out
                        .push(Pending::Ready(Instr::JumpUnless(cond.clone(), usize::MAX)));
                    self.emit(body)?;
                    let end = self.out.len();
                    self.out[at] = Pending::Ready(Instr::JumpUnless(cond.clone(), end));
                }
                Fragment::Goto(label) => self.out.push(Pending::Goto(label.clone())),
                Fragment::DeclareLabel(label, body) => {
                    if self.labels.insert(label.clone(), self.out.len()).is_some() {
                        return Err(Error::DuplicateLabel {
                            method: self.method.to_string(),
                            label: label.name().to_string(),
                        });
                    }
                    self.emit(body)?;
                }
                Fragment::Printf(format, args) => {
                    self.out
                        .push(Pending::Ready(Instr::Printf(format.clone(), args.clone())));
                }
                Fragment::Return(expr) => {
                    self.out.push(Pending::Ready(Instr::Return(expr.clone())));
                }
                Fragment::Block(body) => self.emit(body)?,
            }
        }
        Ok(())
    }
}

/// Lowers one method, resolving every `Goto` against the labels it declares.
pub fn lower(name: &str, method: &Method) -> Result<MethodPlan> {
    let mut lowering = Lowering {
        method: name,
        out: Vec::with_capacity(method.len()),
        labels: HashMap::new(),
    };
    lowering.emit(method.fragments())?;

    let Lowering { out, labels, .. } = lowering;
    let mut instrs = Vec::with_capacity(out.len());
    for pending in out {
        instrs.push(match pending {
            Pending::Ready(instr) => instr,
            Pending::Goto(label) => match labels.get(&label) {
                Some(&target) => Instr::Jump(target),
                None => {
                    return Err(Error::UndefinedLabel {
                        method: name.to_string(),
                        label: label.name().to_string(),
                    });
                }
            },
        });
    }

    Ok(MethodPlan { instrs, labels })
}
