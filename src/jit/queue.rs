//! Pending compilation work.
//!
//! A queue element is either a continuation (resumes bytecode-by-bytecode
//! translation from a captured frame and index) or a fixed-purpose stub
//! emitted out of line after the main code. The set of stub kinds is closed,
//! so elements are a tagged enum rather than a dispatch hierarchy, and they
//! live in an arena with generation-tagged indices: O(1) reuse without
//! intrusive pointers.

use crate::asm::LabelId;
use crate::vm::refs::{ClassHandle, ExceptionKind, ObjRef, VisitReferences};

use super::frame::VirtualStackFrame;

/// What a queue element does when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// Resume translating bytecodes at `bci`.
    Continuation,
    /// Raise an exception with no handler in this method.
    ThrowExceptionStub { kind: ExceptionKind },
    /// Array store compatibility check, slow path.
    TypeCheckStub,
    /// `checkcast` slow path.
    CheckCastStub { class: ClassHandle },
    /// `instanceof` slow path.
    InstanceOfStub { class: ClassHandle },
    /// On-stack-replacement entry: reload the frame from interpreter state
    /// and merge into already-compiled code.
    OsrStub { target: u16 },
    /// Method prologue slow path for the stack limit check.
    StackOverflowStub,
    /// Backward-branch slow path for the tick check.
    TimerTickStub,
    /// Raise an exception that has a handler in this method: set up the
    /// handler frame and jump to it.
    QuickCatchStub { kind: ExceptionKind, handler: u16 },
}

impl ElementKind {
    pub fn is_continuation(&self) -> bool {
        matches!(self, ElementKind::Continuation)
    }
}

/// One unit of pending work. Owns an independent clone of the frame.
pub struct QueueElement {
    pub kind: ElementKind,
    pub frame: VirtualStackFrame,
    pub bci: u16,
    /// Branch-in target; bound when the element's code is emitted.
    pub entry_label: LabelId,
    /// Where stub code returns to, when it returns at all.
    pub return_label: Option<LabelId>,
    /// Continuation only: set when the tick budget ran out mid-element.
    pub is_suspended: bool,
    /// Continuation only: this element was reached through a backward
    /// branch (drives loop peeling).
    pub from_backward_branch: bool,
}

impl VisitReferences for QueueElement {
    fn visit_refs(&mut self, visit: &mut dyn FnMut(&mut ObjRef)) {
        self.frame.visit_refs(visit);
        match &mut self.kind {
            ElementKind::CheckCastStub { class } | ElementKind::InstanceOfStub { class } => {
                visit(&mut class.0);
            }
            _ => {}
        }
    }
}

/// Handle to an arena slot. Stale handles (the slot was recycled) are
/// detected by the generation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementId {
    index: u32,
    generation: u32,
}

struct ArenaSlot {
    generation: u32,
    element: Option<QueueElement>,
}

/// Arena of queue elements with a free list.
pub struct ElementArena {
    slots: Vec<ArenaSlot>,
    free: Vec<u32>,
}

impl ElementArena {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }

    pub fn alloc(&mut self, element: QueueElement) -> ElementId {
        crate::vm::refs::debug_assert_gc_allowed();
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.element.is_none());
                slot.element = Some(element);
                ElementId { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(ArenaSlot { generation: 0, element: Some(element) });
                ElementId { index, generation: 0 }
            }
        }
    }

    pub fn get(&self, id: ElementId) -> Option<&QueueElement> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.element.as_ref()
    }

    pub fn get_mut(&mut self, id: ElementId) -> Option<&mut QueueElement> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.element.as_mut()
    }

    /// Take the element out for running, leaving the slot allocated so its
    /// id stays valid until `release` or `put_back`.
    pub fn take(&mut self, id: ElementId) -> Option<QueueElement> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.element.take()
    }

    pub fn put_back(&mut self, id: ElementId, element: QueueElement) {
        let slot = &mut self.slots[id.index as usize];
        debug_assert_eq!(slot.generation, id.generation);
        debug_assert!(slot.element.is_none());
        slot.element = Some(element);
    }

    /// Return a finished element's slot to the free list. The id (and any
    /// copy of it) goes stale immediately.
    pub fn release(&mut self, id: ElementId) {
        let slot = &mut self.slots[id.index as usize];
        debug_assert_eq!(slot.generation, id.generation);
        slot.element = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.element.is_some()).count()
    }
}

impl Default for ElementArena {
    fn default() -> Self {
        Self::new()
    }
}

impl VisitReferences for ElementArena {
    fn visit_refs(&mut self, visit: &mut dyn FnMut(&mut ObjRef)) {
        for slot in &mut self.slots {
            if let Some(e) = &mut slot.element {
                e.visit_refs(visit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(kind: ElementKind) -> QueueElement {
        QueueElement {
            kind,
            frame: VirtualStackFrame::new(0, 2),
            bci: 0,
            entry_label: crate::asm::label::LabelId(0),
            return_label: None,
            is_suspended: false,
            from_backward_branch: false,
        }
    }

    #[test]
    fn test_alloc_get_release() {
        let mut arena = ElementArena::new();
        let id = arena.alloc(element(ElementKind::Continuation));
        assert!(arena.get(id).is_some());
        assert_eq!(arena.live_count(), 1);
        arena.release(id);
        assert!(arena.get(id).is_none());
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn test_stale_id_detected_after_reuse() {
        let mut arena = ElementArena::new();
        let a = arena.alloc(element(ElementKind::Continuation));
        arena.release(a);
        let b = arena.alloc(element(ElementKind::StackOverflowStub));
        // same slot, new generation
        assert_ne!(a, b);
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b).unwrap().kind, ElementKind::StackOverflowStub);
    }

    #[test]
    fn test_take_and_put_back() {
        let mut arena = ElementArena::new();
        let id = arena.alloc(element(ElementKind::Continuation));
        let mut e = arena.take(id).unwrap();
        assert!(arena.get(id).is_none());
        e.is_suspended = true;
        arena.put_back(id, e);
        assert!(arena.get(id).unwrap().is_suspended);
    }

    #[test]
    fn test_free_list_reuses_slots() {
        let mut arena = ElementArena::new();
        let a = arena.alloc(element(ElementKind::Continuation));
        let b = arena.alloc(element(ElementKind::Continuation));
        arena.release(a);
        arena.release(b);
        arena.alloc(element(ElementKind::Continuation));
        arena.alloc(element(ElementKind::Continuation));
        // no growth beyond the two original slots
        assert_eq!(arena.slots.len(), 2);
    }
}
