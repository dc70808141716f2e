//! The register rule table produced by interpreting CFA programs.
//!
//! Conceptually the CFI describes a huge table with one row per code
//! location and one column per register (plus the CFA column). We never
//! materialize more than the single row in effect at the PC we care about.

use alloc::vec::Vec;
use core::fmt;

use crate::error::Result;
use crate::frame::FrameRef;
use crate::unwind::RegisterValue;

/// A DWARF register number, after architecture adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Register(pub u16);

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A DWARF expression borrowed from the CFI section.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Expr<'a>(pub &'a [u8]);

impl fmt::Debug for Expr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr({:02x?})", self.0)
    }
}

/// An architecture supplied function computing a register's value in the
/// caller when no static rule can describe it.
#[derive(Clone, Copy)]
pub struct RegisterFn {
    pub name: &'static str,
    pub func: fn(frame: FrameRef<'_>, register: Register) -> Result<RegisterValue>,
}

impl fmt::Debug for RegisterFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegisterFn({})", self.name)
    }
}

impl PartialEq for RegisterFn {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for RegisterFn {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterRule<'a> {
    /// The CFI said nothing about this register.
    #[default]
    Unspecified,
    /// A register that has this rule has no recoverable value in the previous
    /// frame. (By convention, it is not preserved by a callee.)
    Undefined,
    /// The previous value of this register is saved at the address CFA+N where
    /// CFA is the current CFA value and N is a signed offset.
    SavedAtOffset(i64),
    /// The previous value of this register is stored in another register
    /// numbered R.
    SavedInRegister(Register),
    /// The previous value of this register is located at the address produced
    /// by executing the DWARF expression E.
    SavedByExpression(Expr<'a>),
    /// This register has not been modified from the previous frame.
    /// (By convention, it is preserved by the callee, but the callee has not
    /// modified it.)
    SameValue,
    /// The previous value of this register is the value CFA+N where CFA is the
    /// current CFA value and N is a signed offset.
    SavedValueAtOffset(i64),
    /// The previous value of this register is the value produced by executing
    /// the DWARF expression E.
    SavedValueByExpression(Expr<'a>),
    CallRegisteredFunction(RegisterFn),
    /// Whatever the return address column says. Only produced by `init_reg`
    /// hooks, resolved after interpretation.
    ReturnAddress,
    /// The return address plus N.
    ReturnAddressAtOffset(i64),
    /// The previous value is the CFA itself (typically the stack pointer).
    CfaValue,
    CfaValueAtOffset(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfaRule<'a> {
    RegisterAndOffset { register: Register, offset: i64 },
    Expression(Expr<'a>),
}

/// A single row of the table: one rule per register, plus the CFA.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row<'a> {
    rules: Vec<RegisterRule<'a>>,
    cfa: Option<CfaRule<'a>>,
}

impl<'a> Row<'a> {
    pub fn rule(&self, register: Register) -> RegisterRule<'a> {
        self.rules
            .get(usize::from(register.0))
            .copied()
            .unwrap_or_default()
    }

    pub fn cfa(&self) -> Option<CfaRule<'a>> {
        self.cfa
    }

    /// Columns past the end grow the row: the CFI is allowed to describe
    /// columns that are not machine registers.
    pub(crate) fn set_rule(&mut self, register: Register, rule: RegisterRule<'a>) {
        let idx = usize::from(register.0);
        if idx >= self.rules.len() {
            self.rules.resize(idx + 1, RegisterRule::Unspecified);
        }
        self.rules[idx] = rule;
    }

    /// Every register with a rule other than `Unspecified`.
    pub fn registers(&self) -> impl Iterator<Item = (Register, RegisterRule<'a>)> + '_ {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| **rule != RegisterRule::Unspecified)
            .map(|(i, rule)| (Register(i as u16), *rule))
    }

    pub(crate) fn rules_mut(&mut self) -> impl Iterator<Item = &mut RegisterRule<'a>> + '_ {
        self.rules.iter_mut()
    }
}

/// How deep `remember_state` may nest before the program is considered
/// broken.
pub const MAX_REMEMBERED_ROWS: usize = 64;

/// The row under construction plus the `remember_state` stack.
///
/// Snapshots are whole rows, so `restore_state` is just a pop.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuleTable<'a> {
    row: Row<'a>,
    stack: Vec<Row<'a>>,
}

impl<'a> RuleTable<'a> {
    /// A table with room for `num_regs` columns, all `Unspecified`.
    pub fn new(num_regs: u16) -> Self {
        Self {
            row: Row {
                rules: alloc::vec![RegisterRule::Unspecified; usize::from(num_regs)],
                cfa: None,
            },
            stack: Vec::new(),
        }
    }

    pub fn row(&self) -> &Row<'a> {
        &self.row
    }

    pub fn into_row(self) -> Row<'a> {
        self.row
    }

    pub fn rule(&self, register: Register) -> RegisterRule<'a> {
        self.row.rule(register)
    }

    pub fn set_rule(&mut self, register: Register, rule: RegisterRule<'a>) {
        self.row.set_rule(register, rule);
    }

    pub fn cfa(&self) -> Option<CfaRule<'a>> {
        self.row.cfa
    }

    pub fn set_cfa(&mut self, cfa: CfaRule<'a>) {
        self.row.cfa = Some(cfa);
    }

    /// Number of columns currently held.
    pub fn columns(&self) -> usize {
        self.row.rules.len()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Returns `false`, remembering nothing, once the stack holds
    /// [`MAX_REMEMBERED_ROWS`] rows.
    pub fn remember_state(&mut self) -> bool {
        if self.stack.len() >= MAX_REMEMBERED_ROWS {
            return false;
        }
        self.stack.push(self.row.clone());
        true
    }

    /// Returns `false` if there was nothing to restore.
    pub fn restore_state(&mut self) -> bool {
        match self.stack.pop() {
            Some(row) => {
                self.row = row;
                true
            }
            None => false,
        }
    }
}
