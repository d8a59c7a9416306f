//! Contracts between the compiler and the rest of the virtual machine.
//!
//! The compiler consumes pre-resolved bytecode events from the decoder and
//! opaque handles from the object manager; it never performs symbol
//! resolution or heap walks itself. Everything in this module is the shape
//! of that boundary, not an implementation of the VM.

pub mod bytecode;
pub mod refs;

pub use bytecode::{Condition, Event, Handler, Method, ResultKind};
pub use refs::{ClassHandle, ExceptionKind, MethodHandle, ObjRef, RawPointerScope, RuntimeRoutine, VisitReferences};
