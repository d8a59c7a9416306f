//! The compile loop.
//!
//! A `Compiler` owns one method compilation from prologue to finished code.
//! Work lives in a queue of elements: the front element runs until it
//! finishes, merges into already-compiled code, or its tick budget runs out.
//! A suspended element stays at the front with its state captured, so an
//! interrupted compilation emits byte-identical code to an uninterrupted
//! one.
//!
//! Control-flow joins go through the entry table: the first continuation to
//! reach a multi-predecessor bytecode flushes its frame, binds a label and
//! registers the snapshot; later arrivals conform to the snapshot and
//! branch. A backward branch reaching a bytecode with exactly one entry may
//! instead register a second entry and keep translating: one peeled loop
//! iteration, with whatever constants the fall-in path established.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::asm::assembler::ObjReloc;
use crate::asm::encoding::{decode, Cond};
use crate::asm::{AluOp, AsmError, BinaryAssembler, LabelId, LiteralValue, Reg};
use crate::config::JitConfig;
use crate::vm::bytecode::{Event, Method, ResultKind, ValueType};
use crate::vm::refs::{ExceptionKind, ObjRef, RuntimeRoutine, VisitReferences};

use super::codegen::{GenContext, GenOut, Next, RT_STACK_LIMIT_OFFSET};
use super::frame::{emit_alu, VirtualStackFrame, FLAG_NONNULL};
use super::memory::{ExecutableMemory, MemoryError};
use super::queue::{ElementArena, ElementId, ElementKind, QueueElement};

/// Compilation failure.
#[derive(Debug)]
pub enum CompileError {
    /// The method outgrew the configured code buffer.
    OutOfCodeSpace,
    /// Another compiler is live on this thread.
    CompilerActive,
    /// The decoder handed over a method that fails validation.
    InvalidMethod(String),
    /// An assembler invariant broke; debug builds assert first.
    Internal(AsmError),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::OutOfCodeSpace => write!(f, "code buffer limit reached"),
            CompileError::CompilerActive => {
                write!(f, "a compiler is already active on this thread")
            }
            CompileError::InvalidMethod(msg) => write!(f, "invalid method: {}", msg),
            CompileError::Internal(e) => write!(f, "internal assembler error: {}", e),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<AsmError> for CompileError {
    fn from(e: AsmError) -> Self {
        match e {
            AsmError::CodeBufferFull => CompileError::OutOfCodeSpace,
            other => CompileError::Internal(other),
        }
    }
}

/// Outcome of one compilation slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The tick budget ran out with work remaining.
    Suspended,
    /// The queue drained; the compiled method is ready.
    Finished,
}

thread_local! {
    static COMPILER_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// At most one compiler per thread: compiled code positions, the literal
/// pool and the element arena are all per-compilation state that must not
/// interleave.
struct ActiveScope(());

impl ActiveScope {
    fn enter() -> Result<Self, CompileError> {
        COMPILER_ACTIVE.with(|active| {
            if active.get() {
                Err(CompileError::CompilerActive)
            } else {
                active.set(true);
                Ok(ActiveScope(()))
            }
        })
    }
}

impl Drop for ActiveScope {
    fn drop(&mut self) {
        COMPILER_ACTIVE.with(|active| active.set(false));
    }
}

/// A registered join point: arriving frames conform to `frame` and branch
/// to `label`.
struct Entry {
    bci: u16,
    frame: VirtualStackFrame,
    label: LabelId,
    /// Code size when the entry was created, for diagnostics.
    code_size: usize,
}

pub struct Compiler<'m> {
    method: &'m Method,
    config: JitConfig,
    asm: BinaryAssembler,
    arena: ElementArena,
    queue: VecDeque<ElementId>,
    entries: Vec<Entry>,
    shared_stubs: HashMap<(ExceptionKind, Option<u16>), LabelId>,
    pred_counts: Vec<u32>,
    loop_headers: Vec<bool>,
    osr_entries: Vec<(u16, usize)>,
    deopt_entries: Vec<(u16, usize)>,
    compiled: Option<CompiledMethod>,
    _active: ActiveScope,
}

impl<'m> Compiler<'m> {
    pub fn new(method: &'m Method, config: JitConfig) -> Result<Self, CompileError> {
        method.validate().map_err(CompileError::InvalidMethod)?;
        let active = ActiveScope::enter()?;

        let pred_counts = method.predecessor_counts();
        let mut loop_headers = vec![false; method.events.len()];
        for (bci, ev) in method.events.iter().enumerate() {
            if let Some(target) = ev.branch_target() {
                if target as usize <= bci {
                    loop_headers[target as usize] = true;
                }
            }
        }

        let mut compiler = Compiler {
            method,
            asm: BinaryAssembler::new(&config),
            config,
            arena: ElementArena::new(),
            queue: VecDeque::new(),
            entries: Vec::new(),
            shared_stubs: HashMap::new(),
            pred_counts,
            loop_headers,
            osr_entries: Vec::new(),
            deopt_entries: Vec::new(),
            compiled: None,
            _active: active,
        };
        compiler.emit_prologue()?;
        Ok(compiler)
    }

    fn fresh_frame(&self) -> VirtualStackFrame {
        VirtualStackFrame::new(self.method.locals as usize, self.method.max_stack as usize)
    }

    fn frame_bytes(&self) -> i32 {
        (self.method.frame_size() * 4) as i32
    }

    /// Stack limit check, then the first continuation. The overflow stub is
    /// queued immediately so it has a place in the emission order from the
    /// start.
    fn emit_prologue(&mut self) -> Result<(), CompileError> {
        self.asm.note("prologue");
        let overflow = self.asm.new_label();
        let frame_bytes = self.frame_bytes();
        self.asm.load_word(Reg::R0, Reg::Rt, RT_STACK_LIMIT_OFFSET)?;
        emit_alu(&mut self.asm, AluOp::Add, Reg::Tmp, Reg::Fp, None, frame_bytes)?;
        self.asm.cmp_rr(Reg::Tmp, Reg::R0)?;
        self.asm.branch_cond(Cond::Hs, overflow)?;

        let entry = self.asm.new_label();
        let main = self.arena.alloc(QueueElement {
            kind: ElementKind::Continuation,
            frame: self.fresh_frame(),
            bci: 0,
            entry_label: entry,
            return_label: None,
            is_suspended: false,
            from_backward_branch: false,
        });
        self.queue.push_back(main);
        let stub = self.arena.alloc(QueueElement {
            kind: ElementKind::StackOverflowStub,
            frame: self.fresh_frame(),
            bci: 0,
            entry_label: overflow,
            return_label: None,
            is_suspended: false,
            from_backward_branch: false,
        });
        self.queue.push_back(stub);
        Ok(())
    }

    /// Run one compilation slice of at most `budget_ticks` bytecodes (stub
    /// emissions count one tick each).
    pub fn step(&mut self, budget_ticks: u32) -> Result<Progress, CompileError> {
        if self.compiled.is_some() {
            return Ok(Progress::Finished);
        }
        let mut ticks = budget_ticks.max(1);
        while let Some(&id) = self.queue.front() {
            let mut elem = match self.arena.take(id) {
                Some(e) => e,
                None => {
                    debug_assert!(false, "queued element went stale");
                    self.queue.pop_front();
                    continue;
                }
            };
            let finished = if elem.kind.is_continuation() {
                self.run_continuation(&mut elem, &mut ticks)?
            } else {
                self.emit_stub(&mut elem)?;
                self.asm.check_pressure()?;
                ticks = ticks.saturating_sub(1);
                true
            };
            if finished {
                self.queue.pop_front();
                self.arena.release(id);
            } else {
                elem.is_suspended = true;
                self.arena.put_back(id, elem);
                return Ok(Progress::Suspended);
            }
            if ticks == 0 && !self.queue.is_empty() {
                return Ok(Progress::Suspended);
            }
        }
        self.finalize()?;
        Ok(Progress::Finished)
    }

    /// Drive compilation to the end and hand out the result.
    pub fn finish(mut self) -> Result<CompiledMethod, CompileError> {
        while self.compiled.is_none() {
            self.step(u32::MAX)?;
        }
        match self.compiled.take() {
            Some(c) => Ok(c),
            None => unreachable!("finalize always sets the compiled method"),
        }
    }

    /// Drop the compilation. Everything owned (code buffer, elements,
    /// entries) goes with it; the thread can start a new compiler.
    pub fn abort(self) {}

    fn run_continuation(
        &mut self,
        elem: &mut QueueElement,
        ticks: &mut u32,
    ) -> Result<bool, CompileError> {
        if elem.is_suspended {
            elem.is_suspended = false;
        } else {
            self.asm.bind(elem.entry_label)?;
        }
        loop {
            let bci = elem.bci as usize;
            if bci >= self.method.events.len() {
                // Flow past the last event terminates the method.
                if self.config.emit_comments {
                    self.asm.note("implicit return");
                }
                let mut out = GenOut::default();
                let mut cx = GenContext {
                    asm: &mut self.asm,
                    frame: &mut elem.frame,
                    method: self.method,
                    config: &self.config,
                    shared_stubs: &mut self.shared_stubs,
                    out: &mut out,
                    bci: elem.bci,
                };
                cx.translate(Event::Return)?;
                self.absorb(out);
                return Ok(true);
            }

            let mut entry_count = 0;
            let mut latest = usize::MAX;
            for (i, e) in self.entries.iter().enumerate() {
                if e.bci == elem.bci {
                    entry_count += 1;
                    latest = i;
                }
            }
            if entry_count > 0 {
                let peel = elem.from_backward_branch
                    && self.config.loop_peeling
                    && entry_count == 1;
                if !peel {
                    let target_frame = self.entries[latest].frame.clone();
                    let target_label = self.entries[latest].label;
                    if self.config.emit_comments {
                        self.asm.note(&format!("merge into bci {}", elem.bci));
                    }
                    elem.frame.conform_to(&target_frame, &mut self.asm)?;
                    self.asm.branch(target_label)?;
                    return Ok(true);
                }
            }
            elem.from_backward_branch = false;

            if self.pred_counts[bci] > 1 {
                // Joins merge through memory: the snapshot other paths
                // conform to must not carry register or constant state.
                elem.frame.flush(&mut self.asm)?;
                let label = self.asm.new_label();
                self.asm.bind(label)?;
                if self.config.emit_comments {
                    self.asm.note(&format!("bci {}: join", bci));
                }
                self.entries.push(Entry {
                    bci: elem.bci,
                    frame: elem.frame.clone(),
                    label,
                    code_size: self.asm.code_bytes(),
                });
                if entry_count == 0 && self.config.enable_osr && self.loop_headers[bci] {
                    let osr_entry = self.asm.new_label();
                    let id = self.arena.alloc(QueueElement {
                        kind: ElementKind::OsrStub { target: elem.bci },
                        frame: elem.frame.flushed_twin(),
                        bci: elem.bci,
                        entry_label: osr_entry,
                        return_label: None,
                        is_suspended: false,
                        from_backward_branch: false,
                    });
                    self.queue.push_back(id);
                }
            }

            let event = self.method.events[bci];
            if self.config.emit_comments {
                self.asm.note(&format!("bci {}: {:?}", bci, event));
            }
            let mut out = GenOut::default();
            let next = {
                let mut cx = GenContext {
                    asm: &mut self.asm,
                    frame: &mut elem.frame,
                    method: self.method,
                    config: &self.config,
                    shared_stubs: &mut self.shared_stubs,
                    out: &mut out,
                    bci: elem.bci,
                };
                cx.translate(event)?
            };
            self.asm.check_pressure()?;
            self.absorb(out);

            *ticks = ticks.saturating_sub(1);
            match next {
                Next::FallThrough => elem.bci += 1,
                Next::Jump(target) => {
                    elem.from_backward_branch = target <= elem.bci;
                    elem.bci = target;
                }
                Next::End => return Ok(true),
            }
            if *ticks == 0 {
                return Ok(false);
            }
        }
    }

    /// Turn one event's stub and branch requests into queue elements.
    fn absorb(&mut self, out: GenOut) {
        for s in out.stubs {
            let id = self.arena.alloc(QueueElement {
                kind: s.kind,
                frame: s.frame,
                bci: s.bci,
                entry_label: s.entry,
                return_label: s.ret,
                is_suspended: false,
                from_backward_branch: false,
            });
            self.queue.push_back(id);
        }
        for b in out.branches {
            let id = self.arena.alloc(QueueElement {
                kind: ElementKind::Continuation,
                frame: b.frame,
                bci: b.target,
                entry_label: b.entry,
                return_label: None,
                is_suspended: false,
                from_backward_branch: b.backward,
            });
            self.queue.push_back(id);
        }
        self.deopt_entries
            .extend(out.deopt.iter().map(|&(bci, pos)| (bci, pos * 4)));
    }

    fn emit_stub(&mut self, elem: &mut QueueElement) -> Result<(), CompileError> {
        self.asm.bind(elem.entry_label)?;
        match elem.kind {
            ElementKind::ThrowExceptionStub { kind } => {
                if self.config.emit_comments {
                    self.asm.note(&format!("throw {:?}", kind));
                }
                elem.frame.flush(&mut self.asm)?;
                self.asm.mov_imm(Reg::R0, kind.code() as i32)?;
                self.asm.call(RuntimeRoutine::ThrowException)?;
            }
            ElementKind::QuickCatchStub { kind, handler } => {
                if self.config.emit_comments {
                    self.asm
                        .note(&format!("catch {:?} at bci {}", kind, handler));
                }
                elem.frame.flush(&mut self.asm)?;
                self.asm.mov_imm(Reg::R0, kind.code() as i32)?;
                self.asm.call(RuntimeRoutine::AllocateException)?;
                let mut handler_frame = elem.frame.clone();
                handler_frame.clear_stack();
                handler_frame.push_register(ValueType::Object, Reg::R0, None, FLAG_NONNULL);
                let entry = self.asm.new_label();
                let id = self.arena.alloc(QueueElement {
                    kind: ElementKind::Continuation,
                    frame: handler_frame,
                    bci: handler,
                    entry_label: entry,
                    return_label: None,
                    is_suspended: false,
                    from_backward_branch: false,
                });
                self.queue.push_back(id);
                self.asm.branch(entry)?;
            }
            ElementKind::TypeCheckStub => {
                self.asm.note("array store check");
                let sp = elem.frame.sp();
                self.asm
                    .load_word(Reg::R0, Reg::Fp, VirtualStackFrame::slot_offset(sp - 3))?;
                self.asm
                    .load_word(Reg::R1, Reg::Fp, VirtualStackFrame::slot_offset(sp - 1))?;
                self.asm.call(RuntimeRoutine::TypeCheck)?;
                self.branch_to_return(elem)?;
            }
            ElementKind::CheckCastStub { class } => {
                self.asm.note("checkcast");
                let sp = elem.frame.sp();
                self.asm
                    .load_word(Reg::R0, Reg::Fp, VirtualStackFrame::slot_offset(sp - 1))?;
                self.asm
                    .load_literal(Reg::R1, LiteralValue::Obj { handle: class.0, offset: 0 })?;
                self.asm.call(RuntimeRoutine::CheckCast)?;
                self.branch_to_return(elem)?;
            }
            ElementKind::InstanceOfStub { class } => {
                self.asm.note("instanceof");
                let sp = elem.frame.sp();
                self.asm
                    .load_word(Reg::R0, Reg::Fp, VirtualStackFrame::slot_offset(sp - 1))?;
                self.asm
                    .load_literal(Reg::R1, LiteralValue::Obj { handle: class.0, offset: 0 })?;
                self.asm.call(RuntimeRoutine::InstanceOf)?;
                self.branch_to_return(elem)?;
            }
            ElementKind::OsrStub { target } => {
                let offset = self.asm.label_pos(elem.entry_label).unwrap_or(0) * 4;
                self.osr_entries.push((target, offset));
                if self.config.emit_comments {
                    self.asm.note(&format!("osr entry for bci {}", target));
                }
                let latest = self.entries.iter().rev().find(|e| e.bci == target);
                match latest {
                    Some(entry) => {
                        let frame = entry.frame.clone();
                        let label = entry.label;
                        elem.frame.conform_to(&frame, &mut self.asm)?;
                        self.asm.branch(label)?;
                    }
                    None => debug_assert!(false, "osr stub for an unregistered join"),
                }
            }
            ElementKind::StackOverflowStub => {
                self.asm.note("stack overflow");
                self.asm.mov_imm(Reg::R0, self.frame_bytes())?;
                self.asm.call(RuntimeRoutine::StackOverflow)?;
            }
            ElementKind::TimerTickStub => {
                self.asm.note("timer tick");
                // Stores below belong to the stub, not the main line: work
                // on a clone and reload the captured register state after
                // the call.
                let mut scratch = elem.frame.clone();
                scratch.flush(&mut self.asm)?;
                self.asm.call(RuntimeRoutine::TimerTick)?;
                for i in 0..elem.frame.sp() {
                    if let Some(reg) = elem.frame.raw_at(i).register() {
                        self.asm
                            .load_word(reg, Reg::Fp, VirtualStackFrame::slot_offset(i))?;
                    }
                }
                self.branch_to_return(elem)?;
            }
            ElementKind::Continuation => {
                debug_assert!(false, "continuation routed to stub emission");
            }
        }
        Ok(())
    }

    fn branch_to_return(&mut self, elem: &QueueElement) -> Result<(), CompileError> {
        match elem.return_label {
            Some(label) => {
                self.asm.branch(label)?;
                Ok(())
            }
            None => {
                debug_assert!(false, "returning stub without a return label");
                Ok(())
            }
        }
    }

    fn finalize(&mut self) -> Result<(), CompileError> {
        let asm = std::mem::replace(&mut self.asm, BinaryAssembler::new(&self.config));
        let code = asm.finish()?;
        self.compiled = Some(CompiledMethod {
            name: self.method.name.clone(),
            result: self.method.result,
            words: code.words,
            comments: code.comments,
            obj_relocs: code.obj_relocs,
            osr_entries: std::mem::take(&mut self.osr_entries),
            deopt_entries: std::mem::take(&mut self.deopt_entries),
        });
        Ok(())
    }
}

impl VisitReferences for Compiler<'_> {
    fn visit_refs(&mut self, visit: &mut dyn FnMut(&mut ObjRef)) {
        self.asm.visit_refs(visit);
        self.arena.visit_refs(visit);
    }
}

/// Run-to-completion convenience wrapper around [`Compiler`].
pub fn compile_method(method: &Method, config: JitConfig) -> Result<CompiledMethod, CompileError> {
    Compiler::new(method, config)?.finish()
}

/// Finished native code plus its side tables, ready to install.
pub struct CompiledMethod {
    name: String,
    result: ResultKind,
    words: Vec<u32>,
    comments: Vec<(usize, String)>,
    obj_relocs: Vec<ObjReloc>,
    osr_entries: Vec<(u16, usize)>,
    deopt_entries: Vec<(u16, usize)>,
}

impl CompiledMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn result(&self) -> ResultKind {
        self.result
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn code(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.words.len() * 4);
        for w in &self.words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        bytes
    }

    /// Native entry byte offset for a caller expecting `_kind`. All result
    /// kinds share the single prologue entry: results travel in r0/r1 and
    /// the caller knows what it asked for.
    pub fn entry_for(&self, _kind: ResultKind) -> usize {
        0
    }

    /// `(bci, byte offset)` of every on-stack-replacement entry.
    pub fn osr_entries(&self) -> &[(u16, usize)] {
        &self.osr_entries
    }

    /// Byte offset of the on-stack-replacement entry for a loop header.
    pub fn osr_entry(&self, bci: u16) -> Option<usize> {
        self.osr_entries
            .iter()
            .find(|&&(b, _)| b == bci)
            .map(|&(_, off)| off)
    }

    /// `(bci, byte offset)` of every call return site, oldest first.
    pub fn deopt_entries(&self) -> &[(u16, usize)] {
        &self.deopt_entries
    }

    /// Object literal slots the runtime must patch before execution.
    pub fn obj_relocs(&self) -> &[ObjReloc] {
        &self.obj_relocs
    }

    pub fn comments(&self) -> &[(usize, String)] {
        &self.comments
    }

    /// Annotated listing of the generated code.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let mut comments = self.comments.iter().peekable();
        for (pos, &word) in self.words.iter().enumerate() {
            while let Some(&&(cpos, ref text)) = comments.peek() {
                if cpos > pos {
                    break;
                }
                out.push_str("        ; ");
                out.push_str(text);
                out.push('\n');
                comments.next();
            }
            match decode(word) {
                Some(instr) => out.push_str(&format!("{:06x}: {}\n", pos * 4, instr)),
                None => out.push_str(&format!("{:06x}: .word 0x{:08x}\n", pos * 4, word)),
            }
        }
        out
    }

    /// Copy the code into fresh executable memory. The block comes back
    /// still writable: the embedder runs `apply_relocs` over `obj_relocs`
    /// and then calls `make_executable`.
    pub fn install(&self) -> Result<ExecutableMemory, MemoryError> {
        ExecutableMemory::load(&self.words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::encoding::Instr;
    use crate::vm::bytecode::{BinOp, Condition, Event, Handler};

    fn compile(method: &Method, config: JitConfig) -> CompiledMethod {
        Compiler::new(method, config).unwrap().finish().unwrap()
    }

    fn count_instr(words: &[u32], pred: impl Fn(&Instr) -> bool) -> usize {
        words
            .iter()
            .filter_map(|&w| decode(w))
            .filter(|i| pred(i))
            .count()
    }

    fn method(events: Vec<Event>, locals: u16, max_stack: u16, result: ResultKind) -> Method {
        Method {
            name: "t".into(),
            locals,
            max_stack,
            arg_words: 0,
            result,
            events,
            handlers: vec![],
        }
    }

    /// `if (5 > 3) return 5; else return 3;` with both constants known.
    fn constant_branch_method() -> Method {
        method(
            vec![
                Event::PushInt(5),
                Event::PushInt(3),
                Event::IfCompare { cond: Condition::Gt, target: 5 },
                Event::PushInt(3),
                Event::Return,
                Event::PushInt(5),
                Event::Return,
            ],
            0,
            2,
            ResultKind::Int,
        )
    }

    /// `local0 = 0; while (local0 < 10) local0 += 1;`
    fn counting_loop_method() -> Method {
        method(
            vec![
                Event::PushInt(0),
                Event::StoreLocal { index: 0, ty: ValueType::Int },
                Event::LoadLocal { index: 0, ty: ValueType::Int },
                Event::PushInt(10),
                Event::IfCompare { cond: Condition::Ge, target: 10 },
                Event::LoadLocal { index: 0, ty: ValueType::Int },
                Event::PushInt(1),
                Event::Binary { op: BinOp::Add, ty: ValueType::Int },
                Event::StoreLocal { index: 0, ty: ValueType::Int },
                Event::Goto { target: 2 },
                Event::Return,
            ],
            1,
            2,
            ResultKind::Void,
        )
    }

    fn two_call_method() -> Method {
        method(
            vec![
                Event::LoadLocal { index: 0, ty: ValueType::Object },
                Event::InvokeVirtual { vtable_index: 0, arg_words: 1, result: ResultKind::Void },
                Event::LoadLocal { index: 0, ty: ValueType::Object },
                Event::InvokeVirtual { vtable_index: 0, arg_words: 1, result: ResultKind::Void },
                Event::Return,
            ],
            1,
            1,
            ResultKind::Void,
        )
    }

    #[test]
    fn test_constant_branch_folds_to_straight_line() {
        let compiled = compile(&constant_branch_method(), JitConfig::default());
        let w = compiled.words();
        // the only conditional branch left is the prologue stack check
        assert_eq!(count_instr(w, |i| matches!(i, Instr::CondBranch { .. })), 1);
        assert_eq!(
            count_instr(w, |i| matches!(i, Instr::MovImm { rd: Reg::R0, imm: 5 })),
            1
        );
        // the dead arm was never compiled
        assert_eq!(
            count_instr(w, |i| matches!(i, Instr::MovImm { rd: Reg::R0, imm: 3 })),
            0
        );
    }

    #[test]
    fn test_suspension_is_transparent() {
        let m = counting_loop_method();
        let uninterrupted = compile(&m, JitConfig::default());

        let mut c = Compiler::new(&m, JitConfig::default()).unwrap();
        let mut slices = 0;
        while c.step(1).unwrap() == Progress::Suspended {
            slices += 1;
            assert!(slices < 10_000, "compilation does not terminate");
        }
        let interrupted = c.finish().unwrap();

        assert!(slices > 1, "budget of one bytecode per slice must suspend");
        assert_eq!(uninterrupted.words(), interrupted.words());
    }

    #[test]
    fn test_loop_peeling_registers_second_entry() {
        let m = counting_loop_method();

        let mut c = Compiler::new(&m, JitConfig::default()).unwrap();
        while c.step(u32::MAX).unwrap() == Progress::Suspended {}
        let header_entries: Vec<_> = c.entries.iter().filter(|e| e.bci == 2).collect();
        assert_eq!(header_entries.len(), 2);
        // the peeled iteration sits between the two registrations
        assert!(header_entries[1].code_size > header_entries[0].code_size);
        let peeled = c.finish().unwrap();

        let mut config = JitConfig::default();
        config.loop_peeling = false;
        let mut c = Compiler::new(&m, config).unwrap();
        while c.step(u32::MAX).unwrap() == Progress::Suspended {}
        assert_eq!(c.entries.iter().filter(|e| e.bci == 2).count(), 1);
        let flat = c.finish().unwrap();

        assert!(peeled.words().len() > flat.words().len());
    }

    #[test]
    fn test_shared_exception_stub_across_call_sites() {
        let m = two_call_method();
        let throw_idx = RuntimeRoutine::ThrowException.index();

        let shared = compile(&m, JitConfig::default());
        assert_eq!(
            count_instr(shared.words(), |i| matches!(i, Instr::Call { routine } if *routine == throw_idx)),
            1
        );

        let mut config = JitConfig::default();
        config.share_exception_stubs = false;
        let distinct = compile(&m, config);
        assert_eq!(
            count_instr(distinct.words(), |i| matches!(i, Instr::Call { routine } if *routine == throw_idx)),
            2
        );
    }

    #[test]
    fn test_quick_catch_enters_handler() {
        // calls at bci 1 and 3; the handler drops the exception and returns
        let mut m = method(
            vec![
                Event::LoadLocal { index: 0, ty: ValueType::Object },
                Event::InvokeVirtual { vtable_index: 0, arg_words: 1, result: ResultKind::Void },
                Event::LoadLocal { index: 0, ty: ValueType::Object },
                Event::InvokeVirtual { vtable_index: 0, arg_words: 1, result: ResultKind::Void },
                Event::Return,
                Event::Pop,
                Event::Return,
            ],
            1,
            1,
            ResultKind::Void,
        );
        m.handlers.push(Handler {
            start: 0,
            end: 4,
            handler: 5,
            kind: ExceptionKind::NullPointer,
        });
        let compiled = compile(&m, JitConfig::default());
        let alloc_idx = RuntimeRoutine::AllocateException.index();
        let throw_idx = RuntimeRoutine::ThrowException.index();
        // covered sites allocate and jump to the handler instead of
        // unwinding
        assert!(
            count_instr(compiled.words(), |i| matches!(i, Instr::Call { routine } if *routine == alloc_idx)) >= 1
        );
        assert_eq!(
            count_instr(compiled.words(), |i| matches!(i, Instr::Call { routine } if *routine == throw_idx)),
            0
        );
    }

    #[test]
    fn test_backward_branch_carries_tick_check() {
        let compiled = compile(&counting_loop_method(), JitConfig::default());
        let tick_idx = RuntimeRoutine::TimerTick.index();
        assert!(
            count_instr(compiled.words(), |i| matches!(i, Instr::Call { routine } if *routine == tick_idx)) >= 1
        );
    }

    #[test]
    fn test_prologue_checks_stack_limit() {
        let compiled = compile(&constant_branch_method(), JitConfig::default());
        let so_idx = RuntimeRoutine::StackOverflow.index();
        assert_eq!(
            count_instr(compiled.words(), |i| matches!(i, Instr::Call { routine } if *routine == so_idx)),
            1
        );
        assert!(matches!(
            decode(compiled.words()[0]),
            Some(Instr::Load { base: Reg::Rt, offset: RT_STACK_LIMIT_OFFSET, .. })
        ));
    }

    #[test]
    fn test_osr_entry_registered_for_loop_header() {
        let m = counting_loop_method();
        let compiled = compile(&m, JitConfig::default());
        assert!(compiled.osr_entry(2).is_some());

        let mut config = JitConfig::default();
        config.enable_osr = false;
        let compiled = compile(&m, config);
        assert!(compiled.osr_entry(2).is_none());
    }

    #[test]
    fn test_deopt_entries_after_calls() {
        let compiled = compile(&two_call_method(), JitConfig::default());
        let sites: Vec<u16> = compiled.deopt_entries().iter().map(|&(b, _)| b).collect();
        assert_eq!(sites, vec![1, 3]);
        for &(_, off) in compiled.deopt_entries() {
            // the word before each recorded offset is the call itself
            let word = compiled.words()[off / 4 - 1];
            assert!(matches!(decode(word), Some(Instr::Call { .. })));
        }
    }

    #[test]
    fn test_one_compiler_per_thread() {
        let m = constant_branch_method();
        let first = Compiler::new(&m, JitConfig::default()).unwrap();
        assert!(matches!(
            Compiler::new(&m, JitConfig::default()),
            Err(CompileError::CompilerActive)
        ));
        first.abort();
        // the guard is released with the compiler
        Compiler::new(&m, JitConfig::default()).unwrap();
    }

    #[test]
    fn test_invalid_method_rejected() {
        let m = method(vec![Event::Goto { target: 9 }], 0, 1, ResultKind::Void);
        assert!(matches!(
            Compiler::new(&m, JitConfig::default()),
            Err(CompileError::InvalidMethod(_))
        ));
    }

    #[test]
    fn test_understated_max_stack_rejected() {
        // two live pushes against max_stack 1 must fail validation, not
        // index past the frame's slots
        let m = method(
            vec![Event::PushInt(1), Event::PushInt(2), Event::Pop, Event::Pop],
            0,
            1,
            ResultKind::Void,
        );
        assert!(matches!(
            Compiler::new(&m, JitConfig::default()),
            Err(CompileError::InvalidMethod(_))
        ));
    }

    #[test]
    fn test_fall_off_end_emits_return() {
        let m = method(vec![Event::PushInt(1), Event::Pop], 0, 1, ResultKind::Void);
        assert!(m.validate().is_ok());
        let compiled = compile(&m, JitConfig::default());
        assert_eq!(count_instr(compiled.words(), |i| matches!(i, Instr::Ret)), 1);
    }

    #[test]
    fn test_fall_off_end_moves_result_to_r0() {
        let m = method(vec![Event::PushInt(7)], 0, 1, ResultKind::Int);
        let compiled = compile(&m, JitConfig::default());
        assert_eq!(
            count_instr(compiled.words(), |i| matches!(
                i,
                Instr::MovImm { rd: Reg::R0, imm: 7 }
            )),
            1
        );
        assert_eq!(count_instr(compiled.words(), |i| matches!(i, Instr::Ret)), 1);
    }

    #[test]
    fn test_disassembly_mentions_join_points() {
        let compiled = compile(&counting_loop_method(), JitConfig::default());
        let listing = compiled.disassemble();
        assert!(listing.contains("bci 2: join"));
        assert!(listing.contains("prologue"));
    }
}
