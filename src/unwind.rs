//! The unwinder proper: what the debugger's frame machinery talks to.
//!
//! For a frame it answers whether it can unwind it at all, what the frame's
//! CFA is and what value each register had in the caller. The first real
//! question about a frame decodes its CFI into a [`FrameCache`] stored in the
//! frame's slot of the [`FrameChain`]; everything after that is answered from
//! the cache.
//!
//! # pc bias
//! For every frame but the innermost one the PC is a return address: it points
//! after the call instruction, possibly already into the next function (or
//! past the end of a function ending in a call to a `noreturn` function). So we
//! look up and interpret the CFI at pc-1. The exceptions are frames that did
//! not get where they are by a call: the innermost frame, frames interrupted
//! by a signal (the caller of a signal trampoline), and the signal trampolines
//! the architecture recognizes.


use alloc::format;
use core::cell::OnceCell;
use core::fmt;

use crate::arch::Arch;
use crate::config::{Config, UnknownOpcodePolicy};
use crate::dwarf::{execute, CfaRule, CfiEntry, CfiTable, Register, RegisterRule, Row};
use crate::error::{Error, ErrorKind, Result};
use crate::frame::{ExpressionEvaluator, FrameChain, FrameId, FrameRef, Inferior, Want};

/// The value a register had in the caller of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValue {
    /// The register was not changed by the callee: this is its value in the
    /// frame itself.
    Same(u64),
    /// The caller's value lives on in another register of the frame.
    InRegister { register: Register, value: u64 },
    /// The caller's value was saved to memory.
    InMemory { address: u64, value: u64 },
    /// The caller's value is computed, it is not stored anywhere.
    Value(u64),
    /// The CFI says the value can't be recovered.
    Undefined,
    /// The CFI says nothing about the register.
    Unspecified,
}

impl RegisterValue {
    /// The value, if there is one.
    pub fn value(&self) -> Option<u64> {
        match *self {
            Self::Same(value)
            | Self::InRegister { value, .. }
            | Self::InMemory { value, .. }
            | Self::Value(value) => Some(value),
            Self::Undefined | Self::Unspecified => None,
        }
    }

    pub fn is_same_value(&self) -> bool {
        matches!(self, Self::Same(_))
    }
}

/// Everything decoded for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameCache<'a> {
    /// The rules, with `ReturnAddress` rules already resolved.
    row: Row<'a>,
    /// How to find the return address, for `ReturnAddressAtOffset`.
    retaddr: RegisterRule<'a>,
    ra_column: Register,
    cfa: u64,
    function_start: u64,
    /// The PC the CFI was looked up and interpreted at.
    lookup_pc: u64,
    signal_frame: bool,
    /// The return address column is `Undefined`: this is the outermost frame.
    undefined_retaddr: bool,
    /// Interpretation stopped early, the rules are a best effort.
    degraded: Option<Error>,
}

impl<'a> FrameCache<'a> {
    pub fn row(&self) -> &Row<'a> {
        &self.row
    }

    pub fn cfa(&self) -> u64 {
        self.cfa
    }

    pub fn return_address_column(&self) -> Register {
        self.ra_column
    }

    pub fn function_start(&self) -> u64 {
        self.function_start
    }

    pub fn lookup_pc(&self) -> u64 {
        self.lookup_pc
    }

    pub fn is_signal_frame(&self) -> bool {
        self.signal_frame
    }

    pub fn degraded(&self) -> Option<&Error> {
        self.degraded.as_ref()
    }
}

/// Base addresses for the variable location expressions of a frame's
/// function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBase {
    pub this_base: u64,
    pub this_locals: u64,
    pub this_args: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Normal,
    SignalTrampoline,
}

/// The identity of a frame, stable while the frame is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameUnwindId {
    Frame { cfa: u64, function: u64 },
    /// There is no caller to unwind to.
    Outermost,
}

/// Why the frame's caller can't be unwound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Outermost,
    Error(Error),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outermost => write!(f, "unwinding stopped: outermost frame"),
            Self::Error(err) => write!(f, "unwinding stopped: {err}"),
        }
    }
}

/// The FDE for a frame, before interpretation.
struct Located<'i, 'a> {
    entry: CfiEntry<'i, 'a>,
    lookup_pc: u64,
    signal_frame: bool,
}

pub struct DwarfUnwinder<'u, 'a> {
    arch: &'u Arch,
    cfi: &'u CfiTable<'a>,
    frames: &'u FrameChain<'a>,
    inferior: &'u dyn Inferior,
    evaluator: &'u dyn ExpressionEvaluator,
    config: Config,
}

impl<'u, 'a> DwarfUnwinder<'u, 'a> {
    pub fn new(
        arch: &'u Arch,
        cfi: &'u CfiTable<'a>,
        frames: &'u FrameChain<'a>,
        inferior: &'u dyn Inferior,
        evaluator: &'u dyn ExpressionEvaluator,
    ) -> Self {
        Self {
            arch,
            cfi,
            frames,
            inferior,
            evaluator,
            config: Config::default(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn frame(&self, id: FrameId) -> FrameRef<'u> {
        FrameRef {
            id,
            arch: self.arch,
            inferior: self.inferior,
        }
    }

    /// Whether the frame's PC is an exact instruction address rather than a
    /// return address.
    fn pc_is_exact(&self, frame: FrameId, hook_signal_frame: bool) -> bool {
        if frame == FrameId::INNERMOST || hook_signal_frame {
            return true;
        }
        // The inner frame was interrupted by a signal, so we never made a
        // call from here.
        frame
            .inner()
            .and_then(|inner| self.cache(inner).ok())
            .is_some_and(|cache| cache.signal_frame)
    }

    fn locate(&self, frame: FrameId) -> Result<Located<'u, 'a>> {
        if !self.arch.dwarf_cfi {
            return Err(Error::new(
                ErrorKind::NoCfi,
                format!("DWARF CFI unwinding is disabled for {}", self.arch.name),
            ));
        }
        if !self.frames.contains(frame) {
            return Err(Error::new(
                ErrorKind::NoCfi,
                format!("no frame at level {}", frame.level()),
            ));
        }

        let this = self.frame(frame);
        let pc = this.pc()?;
        let hook_signal_frame = self.arch.is_signal_frame(this);
        let lookup_pc = if self.pc_is_exact(frame, hook_signal_frame) {
            pc
        } else {
            pc.wrapping_sub(1)
        };
        debug!(pc, lookup_pc, "looking up CFI");

        let entry = self.cfi.find(lookup_pc).ok_or_else(|| {
            Error::new(ErrorKind::NoCfi, format!("no FDE covers {lookup_pc:#x}"))
        })?;
        let signal_frame =
            hook_signal_frame || (self.config.signal_augmentation && entry.cie.is_signal_frame());

        Ok(Located {
            entry,
            lookup_pc,
            signal_frame,
        })
    }

    #[instrument(level = "debug", skip(self))]
    fn decode(&self, frame: FrameId) -> Result<FrameCache<'a>> {
        let Located {
            entry,
            lookup_pc,
            signal_frame,
        } = self.locate(frame)?;
        let this = self.frame(frame);

        let unwind_row = execute(&entry, self.arch, |reg| self.arch.init_reg(reg, this), lookup_pc);
        if let Some(err) = &unwind_row.degraded {
            // Other malformations keep the prefix regardless of the policy.
            if err.kind() == ErrorKind::UnknownOpcode
                && self.config.unknown_opcode == UnknownOpcodePolicy::FailFrame
            {
                return Err(err.clone());
            }
        }

        let mut row = unwind_row.row;
        let ra_column = unwind_row.return_address_register;
        let ra_rule = row.rule(ra_column);
        let undefined_retaddr = ra_rule == RegisterRule::Undefined;

        // Registers that are "whatever the return address is" take over the
        // return address column's rule. A column without a real rule means the
        // return address is still in that register.
        let retaddr = match ra_rule {
            RegisterRule::Unspecified
            | RegisterRule::SameValue
            | RegisterRule::ReturnAddress
            | RegisterRule::ReturnAddressAtOffset(_) => RegisterRule::SavedInRegister(ra_column),
            rule => rule,
        };
        for rule in row.rules_mut() {
            if *rule == RegisterRule::ReturnAddress {
                *rule = retaddr;
            }
        }

        let cfa = self.evaluate_cfa(this, row.cfa())?;
        let cache = FrameCache {
            row,
            retaddr,
            ra_column,
            cfa,
            function_start: unwind_row.function_start,
            lookup_pc,
            signal_frame,
            undefined_retaddr,
            degraded: unwind_row.degraded,
        };
        debug!(cfa = cache.cfa, signal_frame = cache.signal_frame, "decoded frame");
        Ok(cache)
    }

    fn evaluate_cfa(&self, this: FrameRef<'_>, rule: Option<CfaRule<'_>>) -> Result<u64> {
        match rule {
            Some(CfaRule::RegisterAndOffset { register, offset }) => {
                Ok(this.read_register(register)?.wrapping_add_signed(offset))
            }
            Some(CfaRule::Expression(expr)) => {
                self.evaluator.evaluate(expr, this, None, Want::Address)
            }
            None => Err(Error::new(
                ErrorKind::MissingCfa,
                format!("frame {} has no CFA rule", this.level()),
            )),
        }
    }

    /// The frame's cache, decoding it first if needed.
    ///
    /// Decoding may read registers of this frame, which for outer frames
    /// means unwinding inner frames. It must never come back to this frame.
    pub fn cache(&self, frame: FrameId) -> Result<&'u FrameCache<'a>> {
        let cell: &'u OnceCell<Result<FrameCache<'a>>> =
            self.frames.cache_cell(frame).ok_or_else(|| {
                Error::new(ErrorKind::NoCfi, format!("no frame at level {}", frame.level()))
            })?;
        cell.get_or_init(|| self.decode(frame)).as_ref().map_err(Clone::clone)
    }

    /// Whether there is CFI for the frame's PC. Does not decode anything.
    #[instrument(level = "debug", skip(self))]
    pub fn can_unwind(&self, frame: FrameId) -> bool {
        match self.locate(frame) {
            Ok(_) => true,
            Err(err) => {
                trace!("can't unwind: {err}");
                false
            }
        }
    }

    pub fn compute_cfa(&self, frame: FrameId) -> Result<u64> {
        self.cache(frame).map(|cache| cache.cfa)
    }

    /// The rule decoded for `register`, after return address resolution.
    pub fn rule(&self, frame: FrameId, register: Register) -> Result<RegisterRule<'a>> {
        self.cache(frame).map(|cache| cache.row.rule(register))
    }

    /// Whether the frame's CFI could only be interpreted in part.
    pub fn is_degraded(&self, frame: FrameId) -> bool {
        self.cache(frame).is_ok_and(|cache| cache.degraded.is_some())
    }

    /// The value `register` had in the caller of `frame`.
    #[instrument(level = "debug", skip(self))]
    pub fn recover_register(&self, frame: FrameId, register: Register) -> Result<RegisterValue> {
        let cache = self.cache(frame)?;
        let rule = cache.row.rule(register);
        trace!("{register} = {rule:?}");
        self.apply(cache, self.frame(frame), register, rule)
    }

    fn apply(
        &self,
        cache: &FrameCache<'a>,
        this: FrameRef<'_>,
        register: Register,
        rule: RegisterRule<'a>,
    ) -> Result<RegisterValue> {
        let cfa = cache.cfa;
        Ok(match rule {
            RegisterRule::Unspecified => RegisterValue::Unspecified,
            RegisterRule::Undefined => RegisterValue::Undefined,
            RegisterRule::SameValue => RegisterValue::Same(this.read_register(register)?),
            RegisterRule::SavedAtOffset(offset) => {
                let address = cfa.wrapping_add_signed(offset);
                RegisterValue::InMemory {
                    address,
                    value: this.read_address(address)?,
                }
            }
            RegisterRule::SavedInRegister(from) => RegisterValue::InRegister {
                register: from,
                value: this.read_register(from)?,
            },
            RegisterRule::SavedByExpression(expr) => {
                let address = self.evaluator.evaluate(expr, this, Some(cfa), Want::Address)?;
                RegisterValue::InMemory {
                    address,
                    value: this.read_address(address)?,
                }
            }
            RegisterRule::SavedValueAtOffset(offset) => {
                RegisterValue::Value(cfa.wrapping_add_signed(offset))
            }
            RegisterRule::SavedValueByExpression(expr) => {
                RegisterValue::Value(self.evaluator.evaluate(expr, this, Some(cfa), Want::Value)?)
            }
            RegisterRule::CallRegisteredFunction(func) => (func.func)(this, register)?,
            RegisterRule::ReturnAddress => self.apply(cache, this, cache.ra_column, cache.retaddr)?,
            RegisterRule::ReturnAddressAtOffset(offset) => {
                let ra = self.apply(cache, this, cache.ra_column, cache.retaddr)?;
                let ra = ra.value().ok_or_else(|| {
                    Error::new(
                        ErrorKind::UnreadableRegister,
                        format!("return address of frame {} is not available", this.level()),
                    )
                })?;
                RegisterValue::Value(ra.wrapping_add_signed(offset))
            }
            RegisterRule::CfaValue => RegisterValue::Value(cfa),
            RegisterRule::CfaValueAtOffset(offset) => RegisterValue::Value(cfa.wrapping_add_signed(offset)),
        })
    }

    /// Offers the CFA as the frame base, if it can be computed.
    pub fn frame_base_sniffer(&self, frame: FrameId) -> Option<FrameBase> {
        if !self.can_unwind(frame) {
            return None;
        }
        let cfa = self.compute_cfa(frame).ok()?;
        Some(FrameBase {
            this_base: cfa,
            this_locals: cfa,
            this_args: cfa,
        })
    }

    /// `None` when this unwinder does not apply to the frame.
    pub fn frame_kind(&self, frame: FrameId) -> Option<FrameKind> {
        let located = self.locate(frame).ok()?;
        Some(if located.signal_frame {
            FrameKind::SignalTrampoline
        } else {
            FrameKind::Normal
        })
    }

    pub fn frame_id(&self, frame: FrameId) -> Result<FrameUnwindId> {
        let cache = self.cache(frame)?;
        if cache.undefined_retaddr {
            return Ok(FrameUnwindId::Outermost);
        }
        Ok(FrameUnwindId::Frame {
            cfa: cache.cfa,
            function: cache.function_start,
        })
    }

    /// `None` if the caller of `frame` can be unwound.
    pub fn unwind_stop_reason(&self, frame: FrameId) -> Option<StopReason> {
        match self.cache(frame) {
            Ok(cache) if cache.undefined_retaddr => Some(StopReason::Outermost),
            Ok(_) => None,
            Err(err) => Some(StopReason::Error(err)),
        }
    }
}
