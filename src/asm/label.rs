//! Symbolic code positions.
//!
//! A label goes `Unused -> Linked -> Bound` (or straight to `Bound`). While
//! linked it records the head of a chain of unpatched instruction sites; the
//! chain itself is threaded through the instructions' own offset fields, so
//! the table stores one word per label no matter how many sites reference
//! it. Links are stored as `word position + 1` with 0 meaning end of chain.

/// Index of a label in the assembler's label table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelState {
    Unused,
    /// Head of the patch chain, as word position of the most recent
    /// referencing instruction.
    Linked(usize),
    /// Final word position in the code buffer.
    Bound(usize),
}

/// All labels of one compilation, arena style.
pub struct LabelTable {
    states: Vec<LabelState>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self { states: Vec::new() }
    }

    pub fn alloc(&mut self) -> LabelId {
        let id = LabelId(self.states.len() as u32);
        self.states.push(LabelState::Unused);
        id
    }

    pub fn state(&self, id: LabelId) -> LabelState {
        self.states[id.0 as usize]
    }

    pub fn set_state(&mut self, id: LabelId, state: LabelState) {
        self.states[id.0 as usize] = state;
    }

    pub fn is_bound(&self, id: LabelId) -> bool {
        matches!(self.state(id), LabelState::Bound(_))
    }

    pub fn bound_pos(&self, id: LabelId) -> Option<usize> {
        match self.state(id) {
            LabelState::Bound(pos) => Some(pos),
            _ => None,
        }
    }

    /// Any label still unbound means the compilation is incomplete.
    pub fn first_unbound(&self) -> Option<LabelId> {
        self.states.iter().position(|s| !matches!(s, LabelState::Bound(_) | LabelState::Unused))
            .map(|i| LabelId(i as u32))
    }
}

impl Default for LabelTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_lifecycle() {
        let mut t = LabelTable::new();
        let l = t.alloc();
        assert_eq!(t.state(l), LabelState::Unused);
        t.set_state(l, LabelState::Linked(12));
        assert!(!t.is_bound(l));
        assert_eq!(t.first_unbound(), Some(l));
        t.set_state(l, LabelState::Bound(20));
        assert_eq!(t.bound_pos(l), Some(20));
        assert_eq!(t.first_unbound(), None);
    }
}
