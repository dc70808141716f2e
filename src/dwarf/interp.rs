//! The CFA program interpreter.
//!
//! Runs the CIE's initial instructions and then the FDE's instructions,
//! building the row of the rule table in effect at a target PC. Rule-setting
//! instructions always execute; location-advancing instructions move our
//! location counter, and once that counter has moved past the target PC
//! nothing after it is executed.
//!
//! Interpretation is best effort: an instruction we cannot decode ends the
//! program, and the row built up to that point is returned together with the
//! error, marked as degraded.


use alloc::format;

use super::index::CfiEntry;
use super::instr::{Instruction, Instructions};
use super::parse::{Cursor, SectionKind};
use super::table::{CfaRule, Register, RegisterRule, Row, RuleTable, MAX_REMEMBERED_ROWS};
use crate::arch::Arch;
use crate::error::{Error, Result};

/// Columns the CFI may describe beyond the architecture's registers.
/// Anything further out is treated as garbage rather than grown into.
pub const EXTRA_COLUMNS: u16 = 128;

/// The outcome of interpreting the CFI for one PC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindRow<'a> {
    pub row: Row<'a>,
    /// The (adjusted) return address column.
    pub return_address_register: Register,
    /// Where the FDE starts, i.e. the function's entry point.
    pub function_start: u64,
    /// The CIE carried the `S` augmentation.
    pub signal_frame: bool,
    /// Set when interpretation stopped early; the row is only a prefix of
    /// what the CFI describes.
    pub degraded: Option<Error>,
}

impl<'a> UnwindRow<'a> {
    pub fn rule(&self, register: Register) -> RegisterRule<'a> {
        self.row.rule(register)
    }

    pub fn cfa(&self) -> Option<CfaRule<'a>> {
        self.row.cfa()
    }
}

struct Interpreter<'e, 'a> {
    arch: &'e Arch,
    entry: CfiEntry<'e, 'a>,
    target: u64,
    loc: u64,
    table: RuleTable<'a>,
    /// The rules after the CIE's initial instructions, for `DW_CFA_restore`.
    /// While running those instructions, the seeded rules.
    initial: Row<'a>,
}

impl<'e, 'a> Interpreter<'e, 'a> {
    fn register(&self, raw: u64) -> Result<Register> {
        let eh_frame = self.entry.kind == SectionKind::EhFrame;
        let adjusted = self.arch.adjust_regnum(raw, eh_frame);
        let limit = u64::from(self.arch.num_regs) + u64::from(EXTRA_COLUMNS);
        if adjusted >= limit {
            return Err(Error::malformed_fde(format!("register number {adjusted} out of range")));
        }
        u16::try_from(adjusted)
            .map(Register)
            .map_err(|_| Error::malformed_fde(format!("register number {adjusted} out of range")))
    }

    fn data_offset(&self, factored: i64) -> Result<i64> {
        factored
            .checked_mul(self.entry.cie.data_alignment_factor)
            .ok_or_else(|| Error::malformed_fde(format!("factored offset {factored} overflows")))
    }

    fn unsigned_data_offset(&self, factored: u64) -> Result<i64> {
        let factored = i64::try_from(factored)
            .map_err(|_| Error::malformed_fde(format!("factored offset {factored} overflows")))?;
        self.data_offset(factored)
    }

    fn advance(&mut self, delta: u64) {
        self.loc = delta
            .checked_mul(self.entry.cie.code_alignment_factor)
            .and_then(|delta| self.loc.checked_add(delta))
            .unwrap_or(u64::MAX);
    }

    fn run(&mut self, instructions: &'a [u8], offset: u64) -> Result<()> {
        let cursor = Cursor::new(instructions, offset, self.entry.endian);
        let mut program = Instructions::new(
            cursor,
            self.entry.cie.address_size,
            self.entry.cie.fde_encoding(),
            self.entry.bases,
        );

        while self.loc <= self.target {
            let Some(instruction) = program.next() else {
                break;
            };
            let instruction = instruction?;
            trace!(loc = self.loc, "{instruction:?}");
            self.execute(instruction)?;
        }
        Ok(())
    }

    fn execute(&mut self, instruction: Instruction<'a>) -> Result<()> {
        match instruction {
            Instruction::SetLoc(address) => {
                let loc = address.wrapping_add(self.entry.bias);
                if loc < self.loc {
                    warn!("DW_CFA_set_loc moves backwards from {:#x} to {loc:#x}", self.loc);
                }
                self.loc = loc;
            }
            Instruction::AdvanceLoc(delta) => self.advance(delta),

            Instruction::DefCfa { register, offset } => {
                let register = self.register(register)?;
                let offset = i64::try_from(offset)
                    .map_err(|_| Error::malformed_fde(format!("CFA offset {offset} overflows")))?;
                self.table.set_cfa(CfaRule::RegisterAndOffset { register, offset });
            }
            Instruction::DefCfaSf {
                register,
                factored_offset,
            } => {
                let register = self.register(register)?;
                let offset = self.data_offset(factored_offset)?;
                self.table.set_cfa(CfaRule::RegisterAndOffset { register, offset });
            }
            Instruction::DefCfaRegister(register) => {
                let register = self.register(register)?;
                match self.table.cfa() {
                    Some(CfaRule::RegisterAndOffset { offset, .. }) => {
                        self.table.set_cfa(CfaRule::RegisterAndOffset { register, offset });
                    }
                    Some(CfaRule::Expression(_)) | None => {
                        warn!("DW_CFA_def_cfa_register without a register CFA rule");
                        self.table.set_cfa(CfaRule::RegisterAndOffset { register, offset: 0 });
                    }
                }
            }
            Instruction::DefCfaOffset(offset) => {
                let offset = i64::try_from(offset)
                    .map_err(|_| Error::malformed_fde(format!("CFA offset {offset} overflows")))?;
                self.set_cfa_offset(offset);
            }
            Instruction::DefCfaOffsetSf(factored_offset) => {
                let offset = self.data_offset(factored_offset)?;
                self.set_cfa_offset(offset);
            }
            Instruction::DefCfaExpression(expr) => self.table.set_cfa(CfaRule::Expression(expr)),

            Instruction::Undefined(register) => {
                self.set_rule(register, RegisterRule::Undefined)?;
            }
            Instruction::SameValue(register) => {
                self.set_rule(register, RegisterRule::SameValue)?;
            }
            Instruction::Offset {
                register,
                factored_offset,
            } => {
                let offset = self.unsigned_data_offset(factored_offset)?;
                self.set_rule(register, RegisterRule::SavedAtOffset(offset))?;
            }
            Instruction::OffsetExtendedSf {
                register,
                factored_offset,
            } => {
                let offset = self.data_offset(factored_offset)?;
                self.set_rule(register, RegisterRule::SavedAtOffset(offset))?;
            }
            Instruction::GnuNegativeOffsetExtended {
                register,
                factored_offset,
            } => {
                let offset = self
                    .unsigned_data_offset(factored_offset)?
                    .checked_neg()
                    .ok_or_else(|| Error::malformed_fde(format!("factored offset {factored_offset} overflows")))?;
                self.set_rule(register, RegisterRule::SavedAtOffset(offset))?;
            }
            Instruction::ValOffset {
                register,
                factored_offset,
            } => {
                let offset = self.unsigned_data_offset(factored_offset)?;
                self.set_rule(register, RegisterRule::SavedValueAtOffset(offset))?;
            }
            Instruction::ValOffsetSf {
                register,
                factored_offset,
            } => {
                let offset = self.data_offset(factored_offset)?;
                self.set_rule(register, RegisterRule::SavedValueAtOffset(offset))?;
            }
            Instruction::Register { register, from } => {
                let from = self.register(from)?;
                self.set_rule(register, RegisterRule::SavedInRegister(from))?;
            }
            Instruction::Expression { register, expr } => {
                self.set_rule(register, RegisterRule::SavedByExpression(expr))?;
            }
            Instruction::ValExpression { register, expr } => {
                self.set_rule(register, RegisterRule::SavedValueByExpression(expr))?;
            }
            Instruction::Restore(register) => {
                let register = self.register(register)?;
                let rule = self.initial.rule(register);
                self.table.set_rule(register, rule);
            }

            Instruction::RememberState => {
                if !self.table.remember_state() {
                    return Err(Error::malformed_fde(format!(
                        "DW_CFA_remember_state nested deeper than {MAX_REMEMBERED_ROWS}"
                    )));
                }
            }
            Instruction::RestoreState => {
                if !self.table.restore_state() {
                    warn!("DW_CFA_restore_state without a matching DW_CFA_remember_state");
                }
            }

            Instruction::GnuWindowSave => self.window_save(),
            Instruction::Skipped(opcode) => trace!("skipped vendor opcode {opcode:#04x}"),
            Instruction::Nop => {}
        }
        Ok(())
    }

    fn set_rule(&mut self, register: u64, rule: RegisterRule<'a>) -> Result<()> {
        let register = self.register(register)?;
        self.table.set_rule(register, rule);
        Ok(())
    }

    fn set_cfa_offset(&mut self, offset: i64) {
        match self.table.cfa() {
            Some(CfaRule::RegisterAndOffset { register, .. }) => {
                self.table.set_cfa(CfaRule::RegisterAndOffset { register, offset });
            }
            Some(CfaRule::Expression(_)) | None => {
                warn!("DW_CFA_def_cfa_offset without a register CFA rule, ignored");
            }
        }
    }

    /// SPARC: the caller's `%o` registers are our `%i` registers, the
    /// caller's `%l` and `%i` registers were spilled at the CFA.
    fn window_save(&mut self) {
        if !self.arch.register_windows {
            trace!("DW_CFA_GNU_window_save ignored on {}", self.arch.name);
            return;
        }
        let size = i64::from(self.arch.address_size);
        for reg in 8..16 {
            self.table
                .set_rule(Register(reg), RegisterRule::SavedInRegister(Register(reg + 16)));
        }
        for reg in 16..32 {
            self.table
                .set_rule(Register(reg), RegisterRule::SavedAtOffset(i64::from(reg - 16) * size));
        }
    }
}

/// Interprets the CFI of `entry` up to (and including) `pc`.
///
/// `init_reg` provides the rule every register starts out with. The return
/// address column defaults to `SameValue` when `init_reg` has nothing to say
/// about it.
#[instrument(level = "debug", skip(entry, arch, init_reg), fields(fde = entry.fde.offset))]
pub fn execute<'a>(
    entry: &CfiEntry<'_, 'a>,
    arch: &Arch,
    mut init_reg: impl FnMut(Register) -> RegisterRule<'static>,
    pc: u64,
) -> UnwindRow<'a> {
    let cie = entry.cie;
    let function_start = entry.start();

    let mut interp = Interpreter {
        arch,
        entry: *entry,
        target: pc,
        loc: function_start,
        table: RuleTable::new(arch.num_regs),
        initial: Row::default(),
    };

    let mut degraded = None;
    let (return_address_register, last_column) = match interp.register(cie.return_address_register) {
        Ok(ra) => (ra, Some(ra.0.max(arch.num_regs.saturating_sub(1)))),
        Err(err) => {
            warn!("bad return address column: {err}");
            degraded = Some(err);
            (Register(u16::MAX), arch.num_regs.checked_sub(1))
        }
    };

    for reg in last_column.into_iter().flat_map(|last| 0..=last) {
        let register = Register(reg);
        let rule = match init_reg(register) {
            RegisterRule::Unspecified if register == return_address_register => RegisterRule::SameValue,
            rule => rule,
        };
        interp.table.set_rule(register, rule);
    }
    interp.initial = interp.table.row().clone();

    if degraded.is_none() {
        let result = interp
            .run(cie.initial_instructions, cie.initial_instructions_offset)
            .and_then(|()| {
                interp.initial = interp.table.row().clone();
                interp.run(entry.fde.instructions, entry.fde.instructions_offset)
            });
        if let Err(err) = result {
            warn!("CFA program of FDE at {:#x} stopped early: {err}", entry.fde.offset);
            degraded = Some(err);
        }
    }

    if interp.table.depth() != 0 {
        trace!("{} unmatched DW_CFA_remember_state", interp.table.depth());
    }

    UnwindRow {
        row: interp.table.into_row(),
        return_address_register,
        function_start,
        signal_frame: cie.is_signal_frame(),
        degraded,
    }
}
