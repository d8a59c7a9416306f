//! A dynamic compiler for a small embedded virtual machine.
//!
//! The compiler translates pre-resolved bytecode events into position-
//! independent 32-bit machine words, one method at a time, under tight
//! memory and pause-time constraints: compilation runs in bounded slices
//! and can be suspended and resumed between any two bytecodes without
//! changing the emitted code.
//!
//! The crate splits into three layers:
//!
//! * [`vm`] — the boundary types shared with the rest of the virtual
//!   machine: bytecode events, runtime handles and the GC visibility
//!   contract.
//! * [`asm`] — deferred emission: code buffer, label chains, literal pool
//!   and branch trampolines.
//! * [`jit`] — the compiler proper: virtual stack frame, compilation
//!   queue, code generation and installation into executable memory.

pub mod asm;
pub mod config;
pub mod jit;
pub mod vm;

pub use config::JitConfig;
pub use jit::{CompileError, CompiledMethod, Compiler, Progress};
pub use vm::bytecode::Method;
