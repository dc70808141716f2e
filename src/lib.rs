//! A DWARF CFI frame unwinder for debuggers.
//!
//! Given the call frame information of the loaded modules and a way to read
//! the inferior's registers and memory, this recovers the registers of each
//! caller frame, one frame at a time. Walking the whole stack is left to the
//! debugger, which drives [`unwind::DwarfUnwinder`] frame by frame.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate tracing;

pub mod arch;
pub mod config;
pub mod dwarf;
pub mod error;
pub mod frame;
pub mod unwind;

pub use arch::Arch;
pub use config::{Config, UnknownOpcodePolicy};
pub use error::{Error, ErrorKind, Result};
pub use frame::{ExpressionEvaluator, FrameChain, FrameId, FrameRef, Inferior, Want};
pub use unwind::{DwarfUnwinder, FrameBase, FrameKind, FrameUnwindId, RegisterValue, StopReason};
