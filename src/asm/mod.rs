//! Deferred code emission: buffer, labels, literal pool, assembler.
//!
//! The assembler is two-pass in the patching sense: instructions referencing
//! a not-yet-bound label are emitted with their offset field threaded into
//! the label's chain, and binding the label walks the chain and patches each
//! member once.

pub mod assembler;
pub mod codebuf;
pub mod encoding;
pub mod label;
pub mod literal;

pub use assembler::BinaryAssembler;
pub use codebuf::CodeBuffer;
pub use encoding::{AluOp, Cond, Reg};
pub use label::LabelId;
pub use literal::LiteralValue;

use std::fmt;

/// Errors surfaced by the emission layer. All of these abort the current
/// compilation; none of them are VM-visible.
#[derive(Debug, PartialEq, Eq)]
pub enum AsmError {
    /// The code buffer hit the configured size limit.
    CodeBufferFull,
    /// A label was bound a second time.
    LabelRebound,
    /// A patched reference could not reach its target. The proactive pool
    /// and trampoline flushing is supposed to make this unreachable.
    OutOfRange,
    /// A label was still unbound when the code was finished.
    UnboundLabel,
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsmError::CodeBufferFull => write!(f, "code buffer limit reached"),
            AsmError::LabelRebound => write!(f, "label bound twice"),
            AsmError::OutOfRange => write!(f, "reference out of addressing range"),
            AsmError::UnboundLabel => write!(f, "label never bound"),
        }
    }
}

impl std::error::Error for AsmError {}
