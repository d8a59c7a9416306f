//! The dynamic compiler: virtual stack frame, compilation queue, code
//! generation and installation.

pub mod codegen;
pub mod compiler;
pub mod frame;
pub mod memory;
pub mod queue;

pub use compiler::{compile_method, CompileError, CompiledMethod, Compiler, Progress};
pub use frame::VirtualStackFrame;
pub use memory::{ExecutableMemory, MemoryError};
