//! The binary assembler.
//!
//! One pseudo-instruction in, bytes out. On top of the raw encoding this
//! layer owns label binding and chain patching, the literal pool write-out
//! schedule, and long-branch trampolines for conditional branches whose
//! targets are (or may end up) outside the conditional branch radius.

use super::codebuf::CodeBuffer;
use super::encoding::{self, AluOp, Cond, Reg};
use super::label::{LabelId, LabelState, LabelTable};
use super::literal::{LiteralPool, LiteralPoolElement, LiteralValue};
use super::AsmError;
use crate::config::JitConfig;
use crate::vm::refs::{ObjRef, RuntimeRoutine, VisitReferences};

/// Safety margin (bytes) subtracted from addressing windows when deciding
/// whether to flush pools between bytecodes. Covers the worst-case growth
/// from translating a single bytecode.
const FLUSH_MARGIN_BYTES: usize = 1024;

/// A pending long-branch trampoline: a short conditional branch already
/// points at `site`; flushing emits an unconditional branch to `target`
/// there.
struct Trampoline {
    target: LabelId,
    site: LabelId,
    created_at: usize,
}

/// An object literal's position in the emitted code, for install-time
/// relocation by the runtime.
#[derive(Debug, Clone, Copy)]
pub struct ObjReloc {
    pub word_pos: usize,
    pub handle: ObjRef,
    pub offset: i32,
}

/// Finished machine code plus its side tables.
pub struct FinishedCode {
    pub words: Vec<u32>,
    pub comments: Vec<(usize, String)>,
    pub obj_relocs: Vec<ObjReloc>,
}

pub struct BinaryAssembler {
    buf: CodeBuffer,
    labels: LabelTable,
    pool: LiteralPool,
    trampolines: Vec<Trampoline>,
    comments: Vec<(usize, String)>,
    obj_relocs: Vec<ObjReloc>,
    literal_window_bytes: usize,
    branch_window_bytes: usize,
    long_branch_threshold: usize,
    emit_comments: bool,
}

impl BinaryAssembler {
    pub fn new(config: &JitConfig) -> Self {
        Self {
            buf: CodeBuffer::new(config.code_limit_bytes),
            labels: LabelTable::new(),
            pool: LiteralPool::new(),
            trampolines: Vec::new(),
            comments: Vec::new(),
            obj_relocs: Vec::new(),
            literal_window_bytes: config
                .literal_window_bytes
                .min(encoding::MAX_LITERAL_DISTANCE_BYTES),
            branch_window_bytes: config
                .branch_window_bytes
                .min(encoding::MAX_COND_BRANCH_BYTES),
            long_branch_threshold: config.long_branch_threshold,
            emit_comments: config.emit_comments,
        }
    }

    // ==================== positions and labels ====================

    /// Current position in words.
    pub fn pos(&self) -> usize {
        self.buf.len_words()
    }

    pub fn code_bytes(&self) -> usize {
        self.buf.len_bytes()
    }

    pub fn new_label(&mut self) -> LabelId {
        self.labels.alloc()
    }

    pub fn is_bound(&self, label: LabelId) -> bool {
        self.labels.is_bound(label)
    }

    pub fn label_pos(&self, label: LabelId) -> Option<usize> {
        self.labels.bound_pos(label)
    }

    /// Bind `label` to the current position, patching every chained site
    /// exactly once. Rebinding is an internal invariant violation.
    pub fn bind(&mut self, label: LabelId) -> Result<(), AsmError> {
        let target = self.buf.len_words();
        match self.labels.state(label) {
            LabelState::Bound(_) => {
                debug_assert!(false, "label bound twice");
                Err(AsmError::LabelRebound)
            }
            LabelState::Unused => {
                self.labels.set_state(label, LabelState::Bound(target));
                Ok(())
            }
            LabelState::Linked(head) => {
                let mut site = head;
                loop {
                    let word = self.buf.word_at(site);
                    let next = encoding::chain_link(word);
                    let patched =
                        encoding::patch(word, site, target).ok_or(AsmError::OutOfRange)?;
                    self.buf.set_word(site, patched);
                    if next == 0 {
                        break;
                    }
                    site = next as usize - 1;
                }
                self.labels.set_state(label, LabelState::Bound(target));
                Ok(())
            }
        }
    }

    /// Emit a patchable instruction referencing `label`: patched in place if
    /// the label is bound, otherwise threaded onto its chain.
    fn emit_linked(&mut self, template: u32, label: LabelId) -> Result<(), AsmError> {
        match self.labels.state(label) {
            LabelState::Bound(target) => {
                let site = self.buf.len_words();
                let word = encoding::patch(template, site, target).ok_or(AsmError::OutOfRange)?;
                self.buf.emit(word)?;
            }
            LabelState::Unused => {
                let site = self.buf.emit(encoding::with_chain_link(template, 0))?;
                self.labels.set_state(label, LabelState::Linked(site));
            }
            LabelState::Linked(head) => {
                let site = self
                    .buf
                    .emit(encoding::with_chain_link(template, head as u32 + 1))?;
                self.labels.set_state(label, LabelState::Linked(site));
            }
        }
        Ok(())
    }

    // ==================== instructions ====================

    pub fn alu_rr(&mut self, op: AluOp, rd: Reg, rn: Reg, rm: Reg) -> Result<(), AsmError> {
        self.buf.emit(encoding::alu_rr(op, rd, rn, rm))?;
        Ok(())
    }

    /// Emit an ALU op with an immediate operand. Returns `Ok(false)` without
    /// emitting when the immediate does not fit; the caller materializes.
    pub fn alu_imm(&mut self, op: AluOp, rd: Reg, rn: Reg, imm: i32) -> Result<bool, AsmError> {
        match encoding::alu_imm(op, rd, rn, imm) {
            Some(word) => {
                self.buf.emit(word)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Register-to-register move. Moves to self are dropped (peephole).
    pub fn mov_rr(&mut self, rd: Reg, rm: Reg) -> Result<(), AsmError> {
        if rd == rm {
            return Ok(());
        }
        self.alu_rr(AluOp::Mov, rd, rd, rm)
    }

    /// Load an arbitrary 32-bit immediate: short form when it fits, literal
    /// pool otherwise.
    pub fn mov_imm(&mut self, rd: Reg, imm: i32) -> Result<(), AsmError> {
        match encoding::mov_imm(rd, imm) {
            Some(word) => {
                self.buf.emit(word)?;
                Ok(())
            }
            None => self.load_literal(rd, LiteralValue::Raw(imm)),
        }
    }

    pub fn cmp_rr(&mut self, rn: Reg, rm: Reg) -> Result<(), AsmError> {
        self.alu_rr(AluOp::Cmp, Reg::Tmp, rn, rm)
    }

    /// Compare against an immediate, materializing through TMP when the
    /// immediate does not fit the field.
    pub fn cmp_imm(&mut self, rn: Reg, imm: i32) -> Result<(), AsmError> {
        if self.alu_imm(AluOp::Cmp, Reg::Tmp, rn, imm)? {
            return Ok(());
        }
        self.mov_imm(Reg::Tmp, imm)?;
        self.cmp_rr(rn, Reg::Tmp)
    }

    pub fn load_word(&mut self, rd: Reg, base: Reg, offset: i32) -> Result<(), AsmError> {
        self.buf.emit(encoding::ldw(rd, base, offset))?;
        Ok(())
    }

    pub fn store_word(&mut self, rs: Reg, base: Reg, offset: i32) -> Result<(), AsmError> {
        self.buf.emit(encoding::stw(rs, base, offset))?;
        Ok(())
    }

    /// Call a runtime routine through the routine table.
    pub fn call(&mut self, routine: RuntimeRoutine) -> Result<(), AsmError> {
        self.buf.emit(encoding::call(routine.index()))?;
        Ok(())
    }

    pub fn ret(&mut self) -> Result<(), AsmError> {
        self.buf.emit(encoding::ret())?;
        Ok(())
    }

    /// Unconditional branch. The full branch radius covers any legal code
    /// buffer, so no trampoline is ever needed here.
    pub fn branch(&mut self, label: LabelId) -> Result<(), AsmError> {
        self.emit_linked(encoding::b(0), label)
    }

    /// Conditional branch with the shortest-encoding-first policy.
    ///
    /// A bound in-range target patches directly. A bound out-of-range
    /// target, or an unbound target once the method has grown past the
    /// pessimism threshold, is routed through a trampoline.
    pub fn branch_cond(&mut self, cond: Cond, label: LabelId) -> Result<(), AsmError> {
        let reachable = match self.labels.state(label) {
            LabelState::Bound(target) => {
                let delta = target as i64 - self.buf.len_words() as i64;
                encoding::fits_simm(delta, encoding::COND_BRANCH_BITS)
                    && delta.unsigned_abs() as usize * 4 <= self.branch_window_bytes
            }
            _ => self.buf.len_bytes() < self.long_branch_threshold,
        };
        if reachable {
            return self.emit_linked(encoding::bc(cond, 0), label);
        }
        // Short branch to a trampoline that will hold the long branch.
        let site = self.labels.alloc();
        self.emit_linked(encoding::bc(cond, 0), site)?;
        self.trampolines.push(Trampoline {
            target: label,
            site,
            created_at: self.buf.len_words(),
        });
        Ok(())
    }

    // ==================== literals ====================

    /// Load a pool constant into `rd`, deduplicating against pending
    /// entries.
    pub fn load_literal(&mut self, rd: Reg, value: LiteralValue) -> Result<(), AsmError> {
        let index = match self.pool.find_pending(&value) {
            Some(i) => i,
            None => {
                let label = self.labels.alloc();
                self.pool.push(LiteralPoolElement {
                    value,
                    label,
                    first_use: self.buf.len_words(),
                    written: false,
                    data_pos: None,
                })
            }
        };
        let label = self.pool.get(index).label;
        self.emit_linked(encoding::ldw(rd, Reg::Pc, 0), label)
    }

    /// Write out every pending literal. `reachable` says whether execution
    /// can fall into this spot, in which case the data is skipped over.
    pub fn flush_literals(&mut self, reachable: bool) -> Result<(), AsmError> {
        if !self.pool.has_pending() {
            return Ok(());
        }
        let after = if reachable {
            let l = self.labels.alloc();
            self.branch(l)?;
            Some(l)
        } else {
            None
        };
        self.note("literal pool");
        for index in self.pool.pending() {
            let label = self.pool.get(index).label;
            self.bind(label)?;
            let pos = self.buf.len_words();
            let word = match self.pool.get(index).value {
                LiteralValue::Raw(v) => v as u32,
                LiteralValue::Obj { handle, offset } => {
                    self.obj_relocs.push(ObjReloc { word_pos: pos, handle, offset });
                    0
                }
            };
            self.buf.emit(word)?;
            let e = self.pool.get_mut(index);
            e.written = true;
            e.data_pos = Some(pos);
        }
        if let Some(l) = after {
            self.bind(l)?;
        }
        Ok(())
    }

    /// Materialize pending trampolines as long unconditional branches.
    pub fn flush_trampolines(&mut self, reachable: bool) -> Result<(), AsmError> {
        if self.trampolines.is_empty() {
            return Ok(());
        }
        let after = if reachable {
            let l = self.labels.alloc();
            self.branch(l)?;
            Some(l)
        } else {
            None
        };
        self.note("branch trampolines");
        for t in std::mem::take(&mut self.trampolines) {
            self.bind(t.site)?;
            self.branch(t.target)?;
        }
        if let Some(l) = after {
            self.bind(l)?;
        }
        Ok(())
    }

    /// Called between bytecodes: flush whichever side table is approaching
    /// its addressing window. When the margin is already gone this is the
    /// desperate case and the flush happens immediately rather than waiting
    /// for a natural point.
    pub fn check_pressure(&mut self) -> Result<(), AsmError> {
        if let Some(oldest) = self.pool.oldest_pending_use() {
            let distance = (self.buf.len_words() - oldest) * 4;
            if distance + FLUSH_MARGIN_BYTES >= self.literal_window_bytes {
                self.flush_literals(true)?;
            }
        }
        if let Some(first) = self.trampolines.first() {
            let distance = (self.buf.len_words() - first.created_at) * 4;
            if distance + FLUSH_MARGIN_BYTES >= self.branch_window_bytes {
                self.flush_trampolines(true)?;
            }
        }
        Ok(())
    }

    // ==================== side tables ====================

    /// Attach a comment to the next emitted word.
    pub fn note(&mut self, text: &str) {
        if self.emit_comments {
            self.comments.push((self.buf.len_words(), text.to_string()));
        }
    }

    // ==================== finish ====================

    /// Flush everything pending and hand out the code. Fails if any label
    /// never got bound (a queue element was lost, which is a compiler bug).
    pub fn finish(mut self) -> Result<FinishedCode, AsmError> {
        // Nothing falls through the end of a method; both flushes are at an
        // unreachable point.
        self.flush_trampolines(false)?;
        self.flush_literals(false)?;
        if self.labels.first_unbound().is_some() {
            debug_assert!(false, "unbound label at finish");
            return Err(AsmError::UnboundLabel);
        }
        Ok(FinishedCode {
            words: self.buf.words().to_vec(),
            comments: self.comments,
            obj_relocs: self.obj_relocs,
        })
    }

    /// Raw words emitted so far (tests and the shadow model use this).
    pub fn words(&self) -> &[u32] {
        self.buf.words()
    }
}

impl VisitReferences for BinaryAssembler {
    fn visit_refs(&mut self, visit: &mut dyn FnMut(&mut ObjRef)) {
        self.pool.visit_refs(visit);
        for r in &mut self.obj_relocs {
            visit(&mut r.handle);
        }
    }
}
