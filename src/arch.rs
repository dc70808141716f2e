//! Architecture descriptors.
//!
//! An [`Arch`] describes the DWARF register space of a target and carries the
//! three hooks through which an architecture bends the generic CFI rules:
//! default rules for registers the CFI does not mention, recognition of
//! signal trampolines, and renumbering of registers coming from the CFI.
//!
//! Hooks are installed while the descriptor is being set up (`&mut self`).
//! Once it is shared it can't change anymore, so no locking is needed to
//! read them.

use core::fmt;

use crate::dwarf::{Endian, Register, RegisterRule};
use crate::error::{Error, ErrorKind, Result};
use crate::frame::{FrameRef, Inferior};

/// Default rule for `register` before any CFI is interpreted.
pub type InitRegFn = fn(arch: &Arch, register: Register, frame: FrameRef<'_>) -> RegisterRule<'static>;

/// Whether `frame` is a signal trampoline.
pub type SignalFrameFn = fn(arch: &Arch, frame: FrameRef<'_>) -> bool;

/// Maps a register number found in the CFI to the architecture's DWARF
/// numbering. `eh_frame` tells whether it came from `.eh_frame`.
pub type AdjustRegnumFn = fn(arch: &Arch, regnum: u64, eh_frame: bool) -> u64;

#[derive(Clone, Copy, Default)]
struct Hooks {
    init_reg: Option<InitRegFn>,
    signal_frame_p: Option<SignalFrameFn>,
    adjust_regnum: Option<AdjustRegnumFn>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("init_reg", &self.init_reg.is_some())
            .field("signal_frame_p", &self.signal_frame_p.is_some())
            .field("adjust_regnum", &self.adjust_regnum.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Arch {
    pub name: &'static str,
    /// Size of an address (and of a saved register slot) in bytes.
    pub address_size: u8,
    pub endian: Endian,
    /// Number of DWARF register columns every rule table covers.
    pub num_regs: u16,
    pub pc_regnum: Register,
    pub sp_regnum: Register,
    /// Whether the DWARF CFI unwinder may be used for this architecture.
    pub dwarf_cfi: bool,
    /// SPARC style register windows: gives `DW_CFA_GNU_window_save` its
    /// meaning. On other targets the opcode is ignored.
    pub register_windows: bool,
    hooks: Hooks,
}

impl Arch {
    pub fn new(
        name: &'static str,
        address_size: u8,
        endian: Endian,
        num_regs: u16,
        pc_regnum: Register,
        sp_regnum: Register,
    ) -> Self {
        Self {
            name,
            address_size,
            endian,
            num_regs,
            pc_regnum,
            sp_regnum,
            dwarf_cfi: true,
            register_windows: false,
            hooks: Hooks::default(),
        }
    }

    pub fn set_init_reg(&mut self, init_reg: InitRegFn) {
        if self.hooks.init_reg.replace(init_reg).is_some() {
            warn!("init_reg hook of {} registered twice", self.name);
        }
    }

    pub fn set_signal_frame_p(&mut self, signal_frame_p: SignalFrameFn) {
        if self.hooks.signal_frame_p.replace(signal_frame_p).is_some() {
            warn!("signal_frame_p hook of {} registered twice", self.name);
        }
    }

    pub fn set_adjust_regnum(&mut self, adjust_regnum: AdjustRegnumFn) {
        if self.hooks.adjust_regnum.replace(adjust_regnum).is_some() {
            warn!("adjust_regnum hook of {} registered twice", self.name);
        }
    }

    pub fn init_reg(&self, register: Register, frame: FrameRef<'_>) -> RegisterRule<'static> {
        match self.hooks.init_reg {
            Some(init_reg) => init_reg(self, register, frame),
            None => RegisterRule::Unspecified,
        }
    }

    pub fn is_signal_frame(&self, frame: FrameRef<'_>) -> bool {
        self.hooks
            .signal_frame_p
            .is_some_and(|signal_frame_p| signal_frame_p(self, frame))
    }

    pub fn adjust_regnum(&self, regnum: u64, eh_frame: bool) -> u64 {
        match self.hooks.adjust_regnum {
            Some(adjust_regnum) => adjust_regnum(self, regnum, eh_frame),
            None => regnum,
        }
    }

    /// Reads an address sized value from memory in the target's byte order.
    pub fn read_address(&self, inferior: &dyn Inferior, address: u64) -> Result<u64> {
        let mut buf = [0; 8];
        let size = usize::from(self.address_size);
        let slot = buf.get_mut(..size).filter(|slot| !slot.is_empty()).ok_or_else(|| {
            Error::new(
                ErrorKind::UnreadableMemory,
                alloc::format!("unsupported address size {size}"),
            )
        })?;
        inferior.read_memory(address, slot)?;
        Ok(match self.endian {
            Endian::Little => u64::from_le_bytes(buf),
            Endian::Big => u64::from_be_bytes(buf) >> (8 * (8 - size)),
        })
    }
}

/// The program counter is recovered from the return address, the stack
/// pointer is the CFA. This is what virtually every ABI does.
fn default_init_reg(arch: &Arch, register: Register, _frame: FrameRef<'_>) -> RegisterRule<'static> {
    if register == arch.pc_regnum {
        RegisterRule::ReturnAddress
    } else if register == arch.sp_regnum {
        RegisterRule::CfaValue
    } else {
        RegisterRule::Unspecified
    }
}

pub mod amd64 {
    use super::*;

    pub const RBP: Register = Register(6);
    pub const RSP: Register = Register(7);
    /// The return address column, which stands in for `rip`.
    pub const RIP: Register = Register(16);
    /// General purpose registers plus the return address column.
    pub const NUM_REGS: u16 = 17;

    /// `__restore_rt`: `mov $SYS_rt_sigreturn, %rax; syscall`.
    const LINUX_SIGTRAMP_CODE: [u8; 9] = [0x48, 0xc7, 0xc0, 0x0f, 0x00, 0x00, 0x00, 0x0f, 0x05];
    /// Offset of the `syscall` within the trampoline.
    const LINUX_SIGTRAMP_SYSCALL: u64 = 7;

    fn linux_sigtramp_p(_arch: &Arch, frame: FrameRef<'_>) -> bool {
        let Ok(pc) = frame.pc() else {
            return false;
        };
        let matches_at = |start: u64| {
            let mut code = [0; LINUX_SIGTRAMP_CODE.len()];
            frame.read_memory(start, &mut code).is_ok() && code == LINUX_SIGTRAMP_CODE
        };
        matches_at(pc) || pc.checked_sub(LINUX_SIGTRAMP_SYSCALL).is_some_and(matches_at)
    }

    pub fn linux() -> Arch {
        let mut arch = Arch::new("amd64-linux", 8, Endian::Little, NUM_REGS, RIP, RSP);
        arch.set_init_reg(default_init_reg);
        arch.set_signal_frame_p(linux_sigtramp_p);
        arch
    }
}

pub mod i386 {
    use super::*;

    pub const ESP: Register = Register(4);
    pub const EBP: Register = Register(5);
    pub const EIP: Register = Register(8);
    pub const NUM_REGS: u16 = 9;

    /// Darwin's `.eh_frame` numbers `esp` and `ebp` the other way around than
    /// its `.debug_frame` does.
    fn darwin_adjust_regnum(_arch: &Arch, regnum: u64, eh_frame: bool) -> u64 {
        match (eh_frame, regnum) {
            (true, 4) => 5,
            (true, 5) => 4,
            _ => regnum,
        }
    }

    pub fn darwin() -> Arch {
        let mut arch = Arch::new("i386-darwin", 4, Endian::Little, NUM_REGS, EIP, ESP);
        arch.set_init_reg(default_init_reg);
        arch.set_adjust_regnum(darwin_adjust_regnum);
        arch
    }
}

pub fn amd64_linux() -> Arch {
    amd64::linux()
}

pub fn i386_darwin() -> Arch {
    i386::darwin()
}
