//! Closed error taxonomy for the pickle opcode VM.
//!
//! Nothing is recovered locally: any error aborts the current `load` and is
//! surfaced to the caller. The one soft path (a persistent-id opcode with no
//! callback installed) never produces a `PickleError` — it logs and pushes
//! `None` instead, per the contract in `crate::vm`.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PickleError>;

/// Every way a pickle load can fail.
#[derive(Debug, Clone, PartialEq)]
pub enum PickleError {
    /// The underlying byte source was exhausted before a `STOP` opcode.
    Eof,
    /// A read crossed a frame boundary established by `FRAME`.
    FrameExhausted,
    /// `loadFrame` was called while a prior frame was not yet drained.
    UnexpectedFrameState,
    /// `PROTO` named a version outside `[0, 5]`.
    UnsupportedProtocol(u8),
    /// A persistent-id record was malformed (wrong tag, wrong arity, ...).
    UnsupportedPersistentId,
    /// A length operand was negative where nonnegative is required.
    NegativeByteCount,
    /// A length operand exceeded the host's representable size.
    ExceedsMaxSize,
    /// `GET`/`BINGET`/`LONG_BINGET` referenced an unset memo slot.
    MemoNotFound(i64),
    /// `PUT`/`BINPUT`/`LONG_BINPUT` received a negative index.
    NegativeArgument,
    /// `EXT1`/`EXT2`/`EXT4` referenced an unregistered extension code.
    UnregisteredExtension(i64),
    /// The instantiator registry could not produce an object for a reduction.
    ClassCouldNotBeInstantiated,
    /// Dispatch fell through: no handler for this opcode byte.
    UnknownOpcode(u8),
    /// Catch-all for format parse failures not covered by a dedicated variant.
    Malformed(String),
}

impl fmt::Display for PickleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => write!(f, "unexpected end of pickle stream"),
            Self::FrameExhausted => write!(f, "read crossed a frame boundary"),
            Self::UnexpectedFrameState => {
                write!(f, "FRAME opcode seen before prior frame was drained")
            }
            Self::UnsupportedProtocol(v) => write!(f, "unsupported pickle protocol: {}", v),
            Self::UnsupportedPersistentId => write!(f, "malformed persistent id record"),
            Self::NegativeByteCount => write!(f, "length operand must not be negative"),
            Self::ExceedsMaxSize => write!(f, "length operand exceeds host integer capacity"),
            Self::MemoNotFound(i) => write!(f, "memo value not found at index {}", i),
            Self::NegativeArgument => write!(f, "PUT-family index must not be negative"),
            Self::UnregisteredExtension(code) => {
                write!(f, "unregistered extension code {}", code)
            }
            Self::ClassCouldNotBeInstantiated => {
                write!(f, "instantiator registry could not construct the class")
            }
            Self::UnknownOpcode(b) => write!(f, "unknown opcode: 0x{:02x}", b),
            Self::Malformed(detail) => write!(f, "malformed pickle stream: {}", detail),
        }
    }
}

impl std::error::Error for PickleError {}
