//! Caller-facing configuration for a single `unpickle` call.
//!
//! Grounded on the teacher's `VmConfig`: plain public fields plus a
//! hand-written `Default`, no builder macro.

use crate::error::{PickleError, Result};
use crate::value::Value;

/// How the legacy 8-bit string opcodes (`STRING`, `SHORT_BINSTRING`, ...
/// from protocols 0–2) decode their raw bytes into a host string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringEncoding {
    /// Reject anything outside the 7-bit ASCII range.
    #[default]
    Ascii,
    /// The payload is itself ASCII hex digit pairs; hex-decode it into raw
    /// bytes, then map each decoded byte directly to the Unicode code
    /// point of the same value so arbitrary binary survives losslessly.
    BytesHex,
    /// Decode as UTF-8, failing on invalid sequences.
    Utf8,
}

impl StringEncoding {
    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            StringEncoding::Ascii => {
                if bytes.iter().any(|b| *b >= 0x80) {
                    return Err(PickleError::Malformed(
                        "non-ASCII byte in an ASCII-encoded string opcode".into(),
                    ));
                }
                Ok(bytes.iter().map(|b| *b as char).collect())
            }
            StringEncoding::BytesHex => {
                if !bytes.len().is_multiple_of(2) {
                    return Err(PickleError::Malformed(
                        "bytes-hex string operand has an odd number of hex digits".into(),
                    ));
                }
                let mut decoded = Vec::with_capacity(bytes.len() / 2);
                for pair in bytes.chunks(2) {
                    let hex = std::str::from_utf8(pair).map_err(|_| {
                        PickleError::Malformed("invalid bytes-hex string operand".into())
                    })?;
                    let byte = u8::from_str_radix(hex, 16).map_err(|_| {
                        PickleError::Malformed("invalid bytes-hex string operand".into())
                    })?;
                    decoded.push(byte);
                }
                Ok(decoded.iter().map(|b| *b as char).collect())
            }
            StringEncoding::Utf8 => String::from_utf8(bytes.to_vec())
                .map_err(|e| PickleError::Malformed(format!("invalid utf-8 string: {}", e))),
        }
    }
}

/// Options controlling a single `unpickle` call.
#[derive(Clone, Default)]
pub struct UnpicklerOptions {
    pub string_encoding: StringEncoding,
    /// Out-of-band buffers supplied by the caller, consumed in order by
    /// `NEXT_BUFFER` when `BUFFER_READONLY`/PEP 574 opcodes appear.
    pub oob_buffers: Vec<Value>,
}
