//! Decoding of CFA programs into [`Instruction`]s.
//!
//! Opcodes, DWARF5 §6.4.2 and §7.24. The high two bits of an opcode byte
//! select one of three "primary" instructions that carry an operand in the
//! low six bits; everything else is an "extended" opcode in the low bits.
#![allow(non_upper_case_globals)]

use alloc::format;

use super::parse::{read_encoded, Cursor, Encoding, PointerBases};
use super::table::Expr;
use crate::error::{Error, ErrorKind, Result};

/// A decoded CFA instruction. Register numbers are raw (not yet adjusted for
/// the architecture) and offsets are not yet multiplied by the alignment
/// factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction<'a> {
    //-------- 6.4.2.1 Row Creation Instructions
    //
    /// Sets the location to an address, encoded like the FDE's addresses.
    SetLoc(u64),
    /// `DW_CFA_advance_loc{,1,2,4}` and `DW_CFA_MIPS_advance_loc8`: moves
    /// the location by delta * code_alignment_factor.
    AdvanceLoc(u64),
    //
    //-------- 6.4.2.2 CFA Definition Instructions
    //
    DefCfa { register: u64, offset: u64 },
    /// Like `DefCfa` with a signed, factored offset.
    DefCfaSf { register: u64, factored_offset: i64 },
    /// Keeps the offset, changes the register.
    DefCfaRegister(u64),
    /// Keeps the register, changes the (non-factored) offset.
    DefCfaOffset(u64),
    DefCfaOffsetSf(i64),
    DefCfaExpression(Expr<'a>),
    //
    //-------- 6.4.2.3 Register Rule Instructions
    //
    Undefined(u64),
    SameValue(u64),
    /// `DW_CFA_offset` and `DW_CFA_offset_extended`.
    Offset { register: u64, factored_offset: u64 },
    OffsetExtendedSf { register: u64, factored_offset: i64 },
    ValOffset { register: u64, factored_offset: u64 },
    ValOffsetSf { register: u64, factored_offset: i64 },
    Register { register: u64, from: u64 },
    Expression { register: u64, expr: Expr<'a> },
    ValExpression { register: u64, expr: Expr<'a> },
    /// `DW_CFA_restore` and `DW_CFA_restore_extended`.
    Restore(u64),
    //
    //-------- 6.4.2.4 Row State Instructions
    //
    RememberState,
    RestoreState,
    //
    //-------- GNU extensions
    //
    GnuWindowSave,
    GnuNegativeOffsetExtended { register: u64, factored_offset: u64 },
    /// A vendor opcode we know how to step over but that does not affect
    /// the rule table (e.g. `DW_CFA_GNU_args_size`).
    Skipped(u8),
    //
    //-------- 6.4.2.5 Padding Instruction
    //
    Nop,
}

const DW_CFA_advance_loc_hi: u8 = 0x01;
const DW_CFA_offset_hi: u8 = 0x02;
const DW_CFA_restore_hi: u8 = 0x03;

const DW_CFA_nop: u8 = 0;
const DW_CFA_set_loc: u8 = 0x01;
const DW_CFA_advance_loc1: u8 = 0x02;
const DW_CFA_advance_loc2: u8 = 0x03;
const DW_CFA_advance_loc4: u8 = 0x04;
const DW_CFA_offset_extended: u8 = 0x05;
const DW_CFA_restore_extended: u8 = 0x06;
const DW_CFA_undefined: u8 = 0x07;
const DW_CFA_same_value: u8 = 0x08;
const DW_CFA_register: u8 = 0x09;
const DW_CFA_remember_state: u8 = 0x0a;
const DW_CFA_restore_state: u8 = 0x0b;
const DW_CFA_def_cfa: u8 = 0x0c;
const DW_CFA_def_cfa_register: u8 = 0x0d;
const DW_CFA_def_cfa_offset: u8 = 0x0e;
const DW_CFA_def_cfa_expression: u8 = 0x0f;
const DW_CFA_expression: u8 = 0x10;
const DW_CFA_offset_extended_sf: u8 = 0x11;
const DW_CFA_def_cfa_sf: u8 = 0x12;
const DW_CFA_def_cfa_offset_sf: u8 = 0x13;
const DW_CFA_val_offset: u8 = 0x14;
const DW_CFA_val_offset_sf: u8 = 0x15;
const DW_CFA_val_expression: u8 = 0x16;
const DW_CFA_MIPS_advance_loc8: u8 = 0x1d;
const DW_CFA_GNU_window_save: u8 = 0x2d;
const DW_CFA_GNU_args_size: u8 = 0x2e;
const DW_CFA_GNU_negative_offset_extended: u8 = 0x2f;

#[derive(Debug, Clone, Copy)]
enum Operand {
    Uleb,
}

/// Vendor opcodes whose operands are known, so they can be skipped even
/// though they mean nothing to the rule table.
const SKIPPABLE: &[(u8, &[Operand])] = &[(DW_CFA_GNU_args_size, &[Operand::Uleb])];

/// Iterator over the instructions of one CFA program.
///
/// Yields an error and then stops when it meets an opcode it cannot decode
/// or an operand that runs past the end of the program.
pub(crate) struct Instructions<'a> {
    cursor: Cursor<'a>,
    address_size: u8,
    encoding: Encoding,
    bases: PointerBases,
}

impl<'a> Instructions<'a> {
    pub(crate) fn new(
        cursor: Cursor<'a>,
        address_size: u8,
        encoding: Encoding,
        bases: PointerBases,
    ) -> Self {
        Self {
            cursor,
            address_size,
            encoding,
            bases,
        }
    }

    fn uleb(&mut self) -> Result<u64> {
        self.cursor.read_uleb128()
    }

    fn sleb(&mut self) -> Result<i64> {
        self.cursor.read_sleb128()
    }

    fn expr(&mut self) -> Result<Expr<'a>> {
        self.cursor.read_block().map(Expr)
    }

    fn decode(&mut self) -> Result<Instruction<'a>> {
        let at = self.cursor.offset();
        let b = self.cursor.read_u8()?;
        let low_6 = b & 0x3f;
        Ok(match b >> 6 {
            DW_CFA_advance_loc_hi => Instruction::AdvanceLoc(u64::from(low_6)),
            DW_CFA_offset_hi => Instruction::Offset {
                register: u64::from(low_6),
                factored_offset: self.uleb()?,
            },
            DW_CFA_restore_hi => Instruction::Restore(u64::from(low_6)),
            _ => match b {
                DW_CFA_nop => Instruction::Nop,
                DW_CFA_set_loc => {
                    let address =
                        read_encoded(&mut self.cursor, self.encoding, self.address_size, &self.bases)?
                            .ok_or_else(|| Error::malformed_fde("DW_CFA_set_loc with omitted address"))?;
                    Instruction::SetLoc(address)
                }
                DW_CFA_advance_loc1 => Instruction::AdvanceLoc(u64::from(self.cursor.read_u8()?)),
                DW_CFA_advance_loc2 => Instruction::AdvanceLoc(u64::from(self.cursor.read_u16()?)),
                DW_CFA_advance_loc4 => Instruction::AdvanceLoc(u64::from(self.cursor.read_u32()?)),
                DW_CFA_MIPS_advance_loc8 => Instruction::AdvanceLoc(self.cursor.read_u64()?),
                DW_CFA_offset_extended => Instruction::Offset {
                    register: self.uleb()?,
                    factored_offset: self.uleb()?,
                },
                DW_CFA_restore_extended => Instruction::Restore(self.uleb()?),
                DW_CFA_undefined => Instruction::Undefined(self.uleb()?),
                DW_CFA_same_value => Instruction::SameValue(self.uleb()?),
                DW_CFA_register => Instruction::Register {
                    register: self.uleb()?,
                    from: self.uleb()?,
                },
                DW_CFA_remember_state => Instruction::RememberState,
                DW_CFA_restore_state => Instruction::RestoreState,
                DW_CFA_def_cfa => Instruction::DefCfa {
                    register: self.uleb()?,
                    offset: self.uleb()?,
                },
                DW_CFA_def_cfa_register => Instruction::DefCfaRegister(self.uleb()?),
                DW_CFA_def_cfa_offset => Instruction::DefCfaOffset(self.uleb()?),
                DW_CFA_def_cfa_expression => Instruction::DefCfaExpression(self.expr()?),
                DW_CFA_expression => Instruction::Expression {
                    register: self.uleb()?,
                    expr: self.expr()?,
                },
                DW_CFA_offset_extended_sf => Instruction::OffsetExtendedSf {
                    register: self.uleb()?,
                    factored_offset: self.sleb()?,
                },
                DW_CFA_def_cfa_sf => Instruction::DefCfaSf {
                    register: self.uleb()?,
                    factored_offset: self.sleb()?,
                },
                DW_CFA_def_cfa_offset_sf => Instruction::DefCfaOffsetSf(self.sleb()?),
                DW_CFA_val_offset => Instruction::ValOffset {
                    register: self.uleb()?,
                    factored_offset: self.uleb()?,
                },
                DW_CFA_val_offset_sf => Instruction::ValOffsetSf {
                    register: self.uleb()?,
                    factored_offset: self.sleb()?,
                },
                DW_CFA_val_expression => Instruction::ValExpression {
                    register: self.uleb()?,
                    expr: self.expr()?,
                },
                DW_CFA_GNU_window_save => Instruction::GnuWindowSave,
                DW_CFA_GNU_negative_offset_extended => Instruction::GnuNegativeOffsetExtended {
                    register: self.uleb()?,
                    factored_offset: self.uleb()?,
                },
                _ => match SKIPPABLE.iter().find(|(opcode, _)| *opcode == b) {
                    Some((_, operands)) => {
                        for operand in operands.iter() {
                            match operand {
                                Operand::Uleb => self.uleb()?,
                            };
                        }
                        Instruction::Skipped(b)
                    }
                    None => {
                        return Err(Error::new(
                            ErrorKind::UnknownOpcode,
                            format!("opcode {b:#04x} at offset {at:#x}"),
                        ))
                    }
                },
            },
        })
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.is_empty() {
            return None;
        }
        let result = self.decode();
        if result.is_err() {
            // Nothing after a bad instruction can be trusted.
            self.cursor = Cursor::new(&[], self.cursor.offset(), self.cursor.endian());
        }
        Some(result)
    }
}
