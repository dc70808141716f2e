//! Frames and the outside world.
//!
//! Frames live in an arena ([`FrameChain`]) and are addressed by
//! [`FrameId`]. Frame 0 is the innermost frame, every following frame is
//! the caller of the one before it. Each slot carries the frame's decoded
//! CFI, filled in on first use and dropped together with the frame.
//!
//! Reading registers and memory, and evaluating DWARF expressions, is not
//! our business: the debugger hands us an [`Inferior`] and an
//! [`ExpressionEvaluator`].

use alloc::vec::Vec;
use core::cell::OnceCell;

use crate::arch::Arch;
use crate::dwarf::{Expr, Register};
use crate::error::Result;
use crate::unwind::FrameCache;

/// Handle of a frame in a [`FrameChain`]. Equal to the frame's level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(usize);

impl FrameId {
    pub const INNERMOST: FrameId = FrameId(0);

    pub fn level(self) -> usize {
        self.0
    }

    /// The frame this one called, `None` for the innermost frame.
    pub fn inner(self) -> Option<FrameId> {
        self.0.checked_sub(1).map(FrameId)
    }
}

/// Access to the debugged program's state.
///
/// Every call may block on the live process and every call may fail; the
/// unwinder propagates failures and never retries.
pub trait Inferior {
    /// The value `register` has in `frame`. For the innermost frame that is
    /// the live register; for outer frames it is whatever unwinding the
    /// inner frame produced.
    fn read_register(&self, frame: FrameId, register: Register) -> Result<u64>;

    /// Fills `buf` with the memory at `address`.
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<()>;
}

/// What an expression result is used as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    /// A location that the caller will load from.
    Address,
    /// The final value.
    Value,
}

/// The DWARF location expression evaluator.
pub trait ExpressionEvaluator {
    /// Evaluates `expr` in the context of `frame`. `initial` is pushed on
    /// the stack before evaluation starts (the CFA, for register rules).
    fn evaluate(
        &self,
        expr: Expr<'_>,
        frame: FrameRef<'_>,
        initial: Option<u64>,
        want: Want,
    ) -> Result<u64>;
}

/// A frame together with the means to inspect it, handed to architecture
/// hooks and registered register functions.
#[derive(Clone, Copy)]
pub struct FrameRef<'f> {
    pub id: FrameId,
    pub arch: &'f Arch,
    pub inferior: &'f dyn Inferior,
}

impl FrameRef<'_> {
    pub fn level(&self) -> usize {
        self.id.level()
    }

    pub fn read_register(&self, register: Register) -> Result<u64> {
        self.inferior.read_register(self.id, register)
    }

    pub fn pc(&self) -> Result<u64> {
        self.read_register(self.arch.pc_regnum)
    }

    pub fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.inferior.read_memory(address, buf)
    }

    /// Reads an address sized value in the target's byte order.
    pub fn read_address(&self, address: u64) -> Result<u64> {
        self.arch.read_address(self.inferior, address)
    }
}

impl core::fmt::Debug for FrameRef<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameRef")
            .field("id", &self.id)
            .field("arch", &self.arch.name)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct FrameSlot<'a> {
    cache: OnceCell<Result<FrameCache<'a>>>,
}

/// The arena of frames of one stopped thread, innermost first.
///
/// `'a` is the lifetime of the CFI sections the cached rules borrow from.
pub struct FrameChain<'a> {
    frames: Vec<FrameSlot<'a>>,
}

impl Default for FrameChain<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> FrameChain<'a> {
    /// A chain holding just the innermost frame.
    pub fn new() -> Self {
        Self {
            frames: alloc::vec![FrameSlot::default()],
        }
    }

    pub fn innermost(&self) -> FrameId {
        FrameId::INNERMOST
    }

    pub fn outermost(&self) -> FrameId {
        FrameId(self.frames.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, frame: FrameId) -> bool {
        frame.0 < self.frames.len()
    }

    /// Appends the caller of the current outermost frame.
    pub fn push_caller(&mut self) -> FrameId {
        self.frames.push(FrameSlot::default());
        self.outermost()
    }

    /// Keeps the innermost `level` frames (at least one) and drops the rest
    /// together with their caches.
    pub fn truncate(&mut self, level: usize) {
        self.frames.truncate(level.max(1));
    }

    /// Forgets everything, e.g. after the inferior resumed.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.frames.push(FrameSlot::default());
    }

    pub(crate) fn cache_cell(&self, frame: FrameId) -> Option<&OnceCell<Result<FrameCache<'a>>>> {
        self.frames.get(frame.0).map(|slot| &slot.cache)
    }
}
