//! Opaque runtime handles and the garbage-collector visibility contract.
//!
//! The compiler holds on to object references across allocation points
//! (captured frames, literal pool entries, queue elements). A collector may
//! run between any two suspend points, so every embedded reference must be
//! reachable through `VisitReferences` and may be updated in place when the
//! collector relocates the referent.

use serde::{Deserialize, Serialize};
use std::cell::Cell;

/// A handle to a heap object, as issued by the object manager.
///
/// The payload is opaque to the compiler; the collector may rewrite it
/// through `VisitReferences::visit_refs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjRef(pub u32);

/// A resolved class, e.g. the target of `checkcast`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassHandle(pub ObjRef);

/// A resolved method, e.g. the target of a static invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodHandle(pub ObjRef);

/// Exception kinds the compiler can raise through stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExceptionKind {
    NullPointer,
    Arithmetic,
    ClassCast,
    IndexOutOfBounds,
    ArrayStore,
}

impl ExceptionKind {
    /// Argument value passed to the throw routine.
    pub fn code(self) -> u32 {
        match self {
            ExceptionKind::NullPointer => 0,
            ExceptionKind::Arithmetic => 1,
            ExceptionKind::ClassCast => 2,
            ExceptionKind::IndexOutOfBounds => 3,
            ExceptionKind::ArrayStore => 4,
        }
    }
}

/// Runtime helpers the generated code may call. The embedder supplies their
/// addresses through a routine table at install time; compiled code reaches
/// them indirectly through the routine-table base register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RuntimeRoutine {
    ThrowException = 0,
    AllocateException = 1,
    CheckCast = 2,
    InstanceOf = 3,
    InvokeStatic = 4,
    InvokeVirtual = 5,
    StackOverflow = 6,
    TypeCheck = 17,
    TimerTick = 7,
    LongMul = 8,
    LongDiv = 9,
    LongRem = 10,
    LongShift = 11,
    LongMinMax = 12,
    LongNeg = 13,
    FloatOp = 14,
    DoubleOp = 15,
    Deoptimize = 16,
    /// `athrow` of an exception object already in hand.
    ThrowObject = 18,
}

impl RuntimeRoutine {
    pub fn index(self) -> u16 {
        self as u16
    }
}

/// Implemented by every compiler entity that embeds object references.
///
/// The callback sees each reference exactly once per owner and may rewrite
/// it (a moving collector does exactly that).
pub trait VisitReferences {
    fn visit_refs(&mut self, visit: &mut dyn FnMut(&mut ObjRef));
}

thread_local! {
    static RAW_POINTER_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Scoped "GC temporarily disabled" marker.
///
/// While any scope is alive on the current thread, raw pointers derived from
/// handles may be live and the collector must not run. Allocation paths
/// assert on this in debug builds.
pub struct RawPointerScope(());

impl RawPointerScope {
    pub fn enter() -> Self {
        RAW_POINTER_DEPTH.with(|d| d.set(d.get() + 1));
        RawPointerScope(())
    }

    /// True if any scope is active on this thread.
    pub fn active() -> bool {
        RAW_POINTER_DEPTH.with(|d| d.get() > 0)
    }
}

impl Drop for RawPointerScope {
    fn drop(&mut self) {
        RAW_POINTER_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// Debug-build check used by compiler-internal allocation sites: allocating
/// can trigger a collection, which is illegal inside a raw-pointer scope.
#[inline]
pub fn debug_assert_gc_allowed() {
    debug_assert!(
        !RawPointerScope::active(),
        "allocation inside a raw-pointer scope"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_pointer_scope_nesting() {
        assert!(!RawPointerScope::active());
        {
            let _outer = RawPointerScope::enter();
            assert!(RawPointerScope::active());
            {
                let _inner = RawPointerScope::enter();
                assert!(RawPointerScope::active());
            }
            assert!(RawPointerScope::active());
        }
        assert!(!RawPointerScope::active());
    }

    #[test]
    fn test_exception_codes_distinct() {
        let codes = [
            ExceptionKind::NullPointer.code(),
            ExceptionKind::Arithmetic.code(),
            ExceptionKind::ClassCast.code(),
        ];
        assert_eq!(codes.len(), 3);
        assert_ne!(codes[0], codes[1]);
        assert_ne!(codes[1], codes[2]);
    }
}
