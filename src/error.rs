use alloc::borrow::Cow;
use core::fmt;

use thiserror::Error;

/// The kind of an [`Error`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A CIE had a bad length, version, augmentation or alignment factor.
    MalformedCie,
    /// An FDE had a bad length, CIE pointer or address encoding.
    MalformedFde,
    /// The CFA program contained an opcode whose operands we cannot skip.
    UnknownOpcode,
    /// The inferior could not provide a register value.
    UnreadableRegister,
    /// The inferior could not provide memory contents.
    UnreadableMemory,
    /// A DWARF expression could not be evaluated.
    BadExpression,
    /// There is no call frame information for the frame.
    NoCfi,
    /// The CFA program never defined a CFA rule.
    MissingCfa,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedCie => write!(f, "malformed CIE"),
            Self::MalformedFde => write!(f, "malformed FDE"),
            Self::UnknownOpcode => write!(f, "unknown CFA opcode"),
            Self::UnreadableRegister => write!(f, "unreadable register"),
            Self::UnreadableMemory => write!(f, "unreadable memory"),
            Self::BadExpression => write!(f, "bad DWARF expression"),
            Self::NoCfi => write!(f, "no call frame information"),
            Self::MissingCfa => write!(f, "no CFA rule"),
        }
    }
}

/// Something went wrong while parsing CFI or recovering a frame.
///
/// Errors are cheap to clone because frame caches hand out the failure that
/// stopped a frame's decoding every time the frame is queried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct Error {
    kind: ErrorKind,
    detail: Cow<'static, str>,
}

impl Error {
    pub fn new(kind: ErrorKind, detail: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub(crate) fn malformed_cie(detail: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::MalformedCie, detail)
    }

    pub(crate) fn malformed_fde(detail: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::MalformedFde, detail)
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
