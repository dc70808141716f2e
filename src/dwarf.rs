//! DWARF call frame information: parsing, indexing and interpretation.
//!
//! # how it works
//! when a module is loaded, its `.eh_frame` and `.debug_frame` are scanned
//! once and every FDE is indexed by the PC range it covers ([`build_cfi_index`]).
//! to unwind a frame we look up the FDE covering its PC and run the CIE's and
//! the FDE's CFA programs up to that PC ([`execute`]). what comes out is one
//! row of the rule table: how to find the CFA and, relative to it, every
//! register of the caller.
//!
//! See https://dwarfstd.org/doc/DWARF5.pdf §6.4 if more information is desired.

mod index;
mod instr;
mod interp;
pub(crate) mod parse;
mod table;

#[cfg(test)]
pub(crate) mod testutil;

pub use index::{build_cfi_index, CfiEntry, CfiIndex, CfiTable, Module};
pub use instr::Instruction;
pub use interp::{execute, UnwindRow};
pub use parse::{AugmentationData, Cie, Encoding, Endian, Fde, Layout, Section, SectionKind};
pub use table::{CfaRule, Expr, Register, RegisterFn, RegisterRule, Row, RuleTable};
