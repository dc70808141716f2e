//! Knobs for the unwinder that are not tied to a particular architecture.

/// What to do when a CFA program contains an opcode we cannot decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownOpcodePolicy {
    /// Keep the rules decoded before the bad opcode and carry on. The frame
    /// is marked as degraded.
    #[default]
    BestEffort,
    /// Refuse to unwind a frame whose CFA program hit an unknown opcode.
    FailFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub unknown_opcode: UnknownOpcodePolicy,
    /// Treat frames whose CIE carries the `S` augmentation as signal
    /// trampolines, in addition to what the architecture hook reports.
    pub signal_augmentation: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            unknown_opcode: UnknownOpcodePolicy::BestEffort,
            signal_augmentation: true,
        }
    }
}
