//! Unwinds a made up amd64 Linux process that was stopped inside a signal
//! handler. The handler interrupted `worker`, which was called by `main`.
//!
//! Run with `RUST_LOG=dwarfwind=trace` to watch the CFI being interpreted.

use std::collections::BTreeMap;

use dwarfwind::arch::amd64::{self, RBP, RIP, RSP};
use dwarfwind::dwarf::{CfiTable, Endian, Expr, Layout, Module, Register, Section, SectionKind};
use dwarfwind::{
    Arch, DwarfUnwinder, Error, ErrorKind, ExpressionEvaluator, FrameChain, FrameId, FrameRef,
    Inferior, RegisterValue, Result, Want,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// .eh_frame contents:
// 00000000 00000014 00000000 CIE
//   Version:               1
//   Augmentation:          "zR"
//   Code alignment factor: 1
//   Data alignment factor: -8
//   Return address column: 16
//   Augmentation data:     03
//   DW_CFA_def_cfa: RSP +8
//   DW_CFA_offset: RIP -8
//
// 00000018 00000010 0000001c FDE cie=00000000 pc=00401000...00401100
//   DW_CFA_undefined: RIP
//
// 0000002c 00000020 00000030 FDE cie=00000000 pc=00401100...00401200
//   DW_CFA_advance_loc: 1
//   DW_CFA_def_cfa_offset: +16
//   DW_CFA_offset: RBP -16
//   DW_CFA_advance_loc: 3
//   DW_CFA_def_cfa_register: RBP
//   DW_CFA_advance_loc1: 64
//   DW_CFA_remember_state:
//   DW_CFA_def_cfa: RSP +8
//   DW_CFA_advance_loc: 1
//   DW_CFA_restore_state:
//
// 00000050 00000020 00000000 CIE
//   Version:               1
//   Augmentation:          "zRS"
//   Code alignment factor: 1
//   Data alignment factor: -8
//   Return address column: 16
//   Augmentation data:     03
//   DW_CFA_def_cfa_expression: DW_OP_breg7 RSP+160, DW_OP_deref
//   DW_CFA_expression: RIP DW_OP_breg7 RSP+168
//   DW_CFA_expression: RBP DW_OP_breg7 RSP+120
//
// 00000074 00000010 00000028 FDE cie=00000050 pc=00401200...00401210
//
// 00000088 00000010 0000008c FDE cie=00000000 pc=00401300...00401400
//
// 0000009c ZERO terminator
#[rustfmt::skip]
const EH_FRAME: &[u8] = &[
    // CIE
    0x14, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x01, b'z', b'R', 0x00, 0x01, 0x78, 0x10, 0x01,
    0x03, 0x0c, 0x07, 0x08, 0x90, 0x01, 0x00, 0x00,
    // FDE main
    0x10, 0x00, 0x00, 0x00, 0x1c, 0x00, 0x00, 0x00,
    0x00, 0x10, 0x40, 0x00, 0x00, 0x01, 0x00, 0x00,
    0x00, 0x07, 0x10, 0x00,
    // FDE worker
    0x20, 0x00, 0x00, 0x00, 0x30, 0x00, 0x00, 0x00,
    0x00, 0x11, 0x40, 0x00, 0x00, 0x01, 0x00, 0x00,
    0x00, 0x41, 0x0e, 0x10, 0x86, 0x02, 0x43, 0x0d,
    0x06, 0x02, 0x40, 0x0a, 0x0c, 0x07, 0x08, 0x41,
    0x0b, 0x00, 0x00, 0x00,
    // CIE signal frames
    0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x01, b'z', b'R', b'S', 0x00, 0x01, 0x78, 0x10,
    0x01, 0x03, 0x0f, 0x04, 0x77, 0xa0, 0x01, 0x06,
    0x10, 0x10, 0x03, 0x77, 0xa8, 0x01, 0x10, 0x06,
    0x03, 0x77, 0xf8, 0x00,
    // FDE __restore_rt
    0x10, 0x00, 0x00, 0x00, 0x28, 0x00, 0x00, 0x00,
    0x00, 0x12, 0x40, 0x00, 0x10, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
    // FDE handler
    0x10, 0x00, 0x00, 0x00, 0x8c, 0x00, 0x00, 0x00,
    0x00, 0x13, 0x40, 0x00, 0x00, 0x01, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
    // terminator
    0x00, 0x00, 0x00, 0x00,
];

const SYMBOLS: &[(u64, &str)] = &[
    (0x401000, "main"),
    (0x401100, "worker"),
    (0x401200, "__restore_rt"),
    (0x401300, "handler"),
];

/// `mov $15, %rax; syscall`
const RESTORE_RT_CODE: [u8; 9] = [0x48, 0xc7, 0xc0, 0x0f, 0x00, 0x00, 0x00, 0x0f, 0x05];

/// The state of the stopped process.
struct Machine {
    registers: BTreeMap<Register, u64>,
    memory: BTreeMap<u64, u8>,
}

impl Machine {
    fn new() -> Self {
        let mut machine = Self {
            registers: BTreeMap::from([(RIP, 0x401305), (RSP, 0x7ff000), (RBP, 0x7ff500)]),
            memory: BTreeMap::new(),
        };
        machine.write(0x401200, &RESTORE_RT_CODE);

        // handler's return address: the kernel points it at __restore_rt
        machine.write_word(0x7ff000, 0x401200);

        // rt_sigframe at 0x7ff008: the interrupted registers in the ucontext
        machine.write_word(0x7ff008 + 120, 0x7ff210); // rbp
        machine.write_word(0x7ff008 + 160, 0x7ff200); // rsp
        machine.write_word(0x7ff008 + 168, 0x401146); // rip

        // worker's frame
        machine.write_word(0x7ff210, 0x7ff300); // saved rbp
        machine.write_word(0x7ff218, 0x401050); // return address into main
        machine
    }

    fn write(&mut self, address: u64, bytes: &[u8]) {
        for (address, byte) in (address..).zip(bytes) {
            self.memory.insert(address, *byte);
        }
    }

    fn write_word(&mut self, address: u64, value: u64) {
        self.write(address, &value.to_le_bytes());
    }
}

/// The inferior as seen from the frames: the innermost frame has the live
/// registers, every other frame gets them by unwinding the frame it called.
struct Process<'p, 'a> {
    machine: &'p Machine,
    arch: &'p Arch,
    cfi: &'p CfiTable<'a>,
    frames: &'p FrameChain<'a>,
}

impl<'a> Process<'_, 'a> {
    fn unwinder(&self) -> DwarfUnwinder<'_, 'a> {
        DwarfUnwinder::new(self.arch, self.cfi, self.frames, self, &Evaluator)
    }
}

impl Inferior for Process<'_, '_> {
    fn read_register(&self, frame: FrameId, register: Register) -> Result<u64> {
        let Some(inner) = frame.inner() else {
            return self.machine.registers.get(&register).copied().ok_or_else(|| {
                Error::new(ErrorKind::UnreadableRegister, format!("{register} is not live"))
            });
        };
        match self.unwinder().recover_register(inner, register)? {
            // What the CFI doesn't mention is assumed to be preserved.
            RegisterValue::Unspecified => self.read_register(inner, register),
            value => value.value().ok_or_else(|| {
                Error::new(
                    ErrorKind::UnreadableRegister,
                    format!("{register} is undefined in frame {}", frame.level()),
                )
            }),
        }
    }

    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        for (address, byte) in (address..).zip(buf.iter_mut()) {
            *byte = *self.machine.memory.get(&address).ok_or_else(|| {
                Error::new(ErrorKind::UnreadableMemory, format!("{address:#x}"))
            })?;
        }
        Ok(())
    }
}

/// Just enough of a DWARF expression evaluator for the CFI above.
struct Evaluator;

const DW_OP_DEREF: u8 = 0x06;
const DW_OP_PLUS_UCONST: u8 = 0x23;
const DW_OP_LIT0: u8 = 0x30;
const DW_OP_LIT31: u8 = 0x4f;
const DW_OP_BREG0: u8 = 0x70;
const DW_OP_BREG31: u8 = 0x8f;

fn leb128(bytes: &mut impl Iterator<Item = u8>, signed: bool) -> Result<u64> {
    let mut result = 0;
    let mut shift = 0;
    loop {
        let byte = bytes
            .next()
            .ok_or_else(|| Error::new(ErrorKind::BadExpression, "truncated LEB128"))?;
        if shift < 64 {
            result |= u64::from(byte & 0x7f) << shift;
        }
        shift += 7;
        if byte & 0x80 == 0 {
            if signed && shift < 64 && byte & 0x40 != 0 {
                result |= u64::MAX << shift;
            }
            return Ok(result);
        }
    }
}

impl ExpressionEvaluator for Evaluator {
    fn evaluate(
        &self,
        expr: Expr<'_>,
        frame: FrameRef<'_>,
        initial: Option<u64>,
        want: Want,
    ) -> Result<u64> {
        let mut stack = Vec::from_iter(initial);
        let mut bytes = expr.0.iter().copied();
        while let Some(op) = bytes.next() {
            match op {
                DW_OP_LIT0..=DW_OP_LIT31 => stack.push(u64::from(op - DW_OP_LIT0)),
                DW_OP_BREG0..=DW_OP_BREG31 => {
                    let base = frame.read_register(Register(u16::from(op - DW_OP_BREG0)))?;
                    let offset = leb128(&mut bytes, true)?;
                    stack.push(base.wrapping_add(offset));
                }
                DW_OP_PLUS_UCONST => {
                    let addend = leb128(&mut bytes, false)?;
                    let top = stack.last_mut().ok_or_else(|| {
                        Error::new(ErrorKind::BadExpression, "DW_OP_plus_uconst on empty stack")
                    })?;
                    *top = top.wrapping_add(addend);
                }
                DW_OP_DEREF => {
                    let address = stack.pop().ok_or_else(|| {
                        Error::new(ErrorKind::BadExpression, "DW_OP_deref on empty stack")
                    })?;
                    stack.push(frame.read_address(address)?);
                }
                op => {
                    return Err(Error::new(
                        ErrorKind::BadExpression,
                        format!("unsupported opcode {op:#x}"),
                    ))
                }
            }
        }
        let result = stack
            .pop()
            .ok_or_else(|| Error::new(ErrorKind::BadExpression, "empty stack"))?;
        tracing::debug!(?want, result, "evaluated expression");
        Ok(result)
    }
}

fn symbolize(pc: u64) -> &'static str {
    SYMBOLS
        .iter()
        .rev()
        .find(|(start, _)| *start <= pc)
        .map_or("??", |&(_, name)| name)
}

fn main() {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::INFO.into())
            .from_env()
            .unwrap(),
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    let machine = Machine::new();
    let arch = amd64::linux();
    let mut cfi = CfiTable::new();
    let index = cfi.load(&Module {
        name: "a.out",
        layout: Layout {
            endian: Endian::Little,
            address_size: 8,
            text_base: None,
            data_base: None,
        },
        bias: 0,
        eh_frame: Some(Section {
            kind: SectionKind::EhFrame,
            data: EH_FRAME,
            address: 0x402000,
        }),
        debug_frame: None,
    });
    info!(fdes = index.len(), dropped = index.dropped(), "loaded CFI");

    let mut frames = FrameChain::new();
    loop {
        let frame = frames.outermost();
        let process = Process {
            machine: &machine,
            arch: &arch,
            cfi: &cfi,
            frames: &frames,
        };
        let unwinder = process.unwinder();

        let pc = process.read_register(frame, RIP).unwrap();
        match (unwinder.frame_kind(frame), unwinder.compute_cfa(frame)) {
            (Some(kind), Ok(cfa)) => {
                info!("#{} {pc:#x} in {} cfa={cfa:#x} {kind:?}", frame.level(), symbolize(pc))
            }
            _ => info!("#{} {pc:#x} in {}", frame.level(), symbolize(pc)),
        }

        if let Some(reason) = unwinder.unwind_stop_reason(frame) {
            info!("{reason}");
            break;
        }
        frames.push_caller();
    }
}
