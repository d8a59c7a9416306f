//! Deferred constants (the literal pool).
//!
//! Wide immediates and object references are not encodable inline; a load
//! referencing the pool is emitted instead and the value itself is written
//! out later, close enough to stay inside the load's addressing range. New
//! values are deduplicated against not-yet-written entries only: once an
//! entry's data word is out, a later use may be too far away from it.

use super::label::LabelId;
use crate::vm::refs::{ObjRef, VisitReferences};

/// A pool value: a raw word or an object reference plus a byte offset into
/// the referent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralValue {
    Raw(i32),
    Obj { handle: ObjRef, offset: i32 },
}

#[derive(Debug)]
pub struct LiteralPoolElement {
    pub value: LiteralValue,
    /// Loads referencing this element link through here.
    pub label: LabelId,
    /// Word position of the first referencing load, for distance pressure.
    pub first_use: usize,
    /// Set once the data word has been written to the code stream.
    pub written: bool,
    /// Word position of the data once written (object literals need it for
    /// install-time relocation).
    pub data_pos: Option<usize>,
}

/// The literal pool of one compilation.
pub struct LiteralPool {
    elements: Vec<LiteralPoolElement>,
}

impl LiteralPool {
    pub fn new() -> Self {
        Self { elements: Vec::new() }
    }

    /// Find an unwritten element with this value, for deduplication.
    pub fn find_pending(&self, value: &LiteralValue) -> Option<usize> {
        self.elements
            .iter()
            .position(|e| !e.written && e.value == *value)
    }

    pub fn push(&mut self, element: LiteralPoolElement) -> usize {
        self.elements.push(element);
        self.elements.len() - 1
    }

    pub fn get(&self, index: usize) -> &LiteralPoolElement {
        &self.elements[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut LiteralPoolElement {
        &mut self.elements[index]
    }

    /// Word position of the earliest use among unwritten entries.
    pub fn oldest_pending_use(&self) -> Option<usize> {
        self.elements
            .iter()
            .filter(|e| !e.written)
            .map(|e| e.first_use)
            .min()
    }

    pub fn has_pending(&self) -> bool {
        self.elements.iter().any(|e| !e.written)
    }

    /// Indices of unwritten entries, in insertion order.
    pub fn pending(&self) -> Vec<usize> {
        (0..self.elements.len())
            .filter(|&i| !self.elements[i].written)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LiteralPoolElement> {
        self.elements.iter()
    }
}

impl Default for LiteralPool {
    fn default() -> Self {
        Self::new()
    }
}

impl VisitReferences for LiteralPool {
    fn visit_refs(&mut self, visit: &mut dyn FnMut(&mut ObjRef)) {
        for e in &mut self.elements {
            if let LiteralValue::Obj { handle, .. } = &mut e.value {
                visit(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elem(value: LiteralValue, label: u32, first_use: usize) -> LiteralPoolElement {
        LiteralPoolElement {
            value,
            label: LabelId(label),
            first_use,
            written: false,
            data_pos: None,
        }
    }

    #[test]
    fn test_dedup_only_among_pending() {
        let mut pool = LiteralPool::new();
        let v = LiteralValue::Raw(0x1234_5678);
        let i = pool.push(elem(v, 0, 4));
        assert_eq!(pool.find_pending(&v), Some(i));

        pool.get_mut(i).written = true;
        assert_eq!(pool.find_pending(&v), None);

        // a new entry for the same value is legitimate after write-out
        let j = pool.push(elem(v, 1, 90));
        assert_eq!(pool.find_pending(&v), Some(j));
        assert_ne!(i, j);
    }

    #[test]
    fn test_obj_literals_distinguished_by_offset() {
        let mut pool = LiteralPool::new();
        let a = LiteralValue::Obj { handle: ObjRef(7), offset: 0 };
        let b = LiteralValue::Obj { handle: ObjRef(7), offset: 8 };
        pool.push(elem(a, 0, 0));
        assert_eq!(pool.find_pending(&b), None);
        assert!(pool.find_pending(&a).is_some());
    }

    #[test]
    fn test_oldest_pending_use() {
        let mut pool = LiteralPool::new();
        pool.push(elem(LiteralValue::Raw(1), 0, 40));
        pool.push(elem(LiteralValue::Raw(2), 1, 10));
        pool.push(elem(LiteralValue::Raw(3), 2, 25));
        assert_eq!(pool.oldest_pending_use(), Some(10));
        pool.get_mut(1).written = true;
        assert_eq!(pool.oldest_pending_use(), Some(25));
    }

    #[test]
    fn test_visit_refs_sees_object_handles() {
        let mut pool = LiteralPool::new();
        pool.push(elem(LiteralValue::Raw(1), 0, 0));
        pool.push(elem(LiteralValue::Obj { handle: ObjRef(3), offset: 0 }, 1, 0));
        let mut seen = Vec::new();
        pool.visit_refs(&mut |r| seen.push(*r));
        assert_eq!(seen, vec![ObjRef(3)]);
    }
}
