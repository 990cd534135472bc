//! A stack-based virtual machine for the Python pickle opcode format,
//! purpose-built to reconstruct PyTorch-style checkpoint archives (a ZIP
//! container holding a pickled object graph plus raw tensor-storage
//! blobs) into host values — without ever importing or executing
//! arbitrary Python code.
//!
//! The crate is organized the way the VM itself is: a byte source and
//! frame-aware reader (`byte_source`), the tagged value union every
//! opcode manipulates (`value`), the opcode table and dispatch loop
//! (`opcode`, `vm`), the registry that turns class references into host
//! objects (`registry`), the per-load memo table (`memo`), caller-facing
//! options (`config`), the closed error taxonomy (`error`), and a
//! reference ZIP-archive collaborator (`archive`) so the whole pipeline
//! is runnable end to end.

pub mod archive;
pub mod byte_source;
pub mod config;
pub mod error;
pub mod memo;
pub mod opcode;
pub mod registry;
pub mod value;
pub mod vm;

pub use config::{StringEncoding, UnpicklerOptions};
pub use error::{PickleError, Result};
pub use registry::InstantiatorRegistry;
pub use value::Value;
pub use vm::Unpickler;

use byte_source::SliceSource;

/// Load a pickle byte stream with the default registry (the three
/// built-in handlers) and default options, and no persistent-load
/// callback installed — any persistent id in the stream resolves to
/// `Value::None` with a one-time warning.
pub fn unpickle(bytes: &[u8]) -> Result<Value> {
    let mut vm = Unpickler::new(SliceSource::new(bytes));
    vm.run()
}

/// Load a pickle byte stream with caller-supplied options.
pub fn unpickle_with_options(bytes: &[u8], options: UnpicklerOptions) -> Result<Value> {
    let mut vm = Unpickler::with_options(SliceSource::new(bytes), options);
    vm.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_level_unpickle_runs_a_trivial_stream() {
        // PROTO 2, NONE, STOP
        assert_eq!(unpickle(&[0x80, 2, 0x4e, 0x2e]).unwrap(), Value::None);
    }
}
