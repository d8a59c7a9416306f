//! Per-bytecode code generation.
//!
//! `translate` turns one decoded event into machine code against the current
//! virtual frame. Arithmetic on two known operands folds at compile time
//! (except division by zero, which must still trap), known comparisons
//! collapse to an unconditional continuation switch, and an immediate left
//! operand of a commutative operator (or a subtraction, via reverse-subtract)
//! swaps into the instruction's immediate field.
//!
//! Slow paths never sit inline: the generator emits a short branch and files
//! a stub request; the compile loop turns requests into queue elements and
//! emits them after the main code.

use std::collections::HashMap;

use crate::asm::encoding::Cond;
use crate::asm::{AluOp, AsmError, BinaryAssembler, LabelId, LiteralValue, Reg};
use crate::config::JitConfig;
use crate::vm::bytecode::{BinOp, Condition, Event, Method, ResultKind, ValueType};
use crate::vm::refs::{ExceptionKind, RuntimeRoutine};

use super::frame::{emit_alu, Location, Value, VirtualStackFrame, FLAG_NONNULL};
use super::queue::ElementKind;

/// Runtime state block layout, addressed off the state register.
pub const RT_STACK_LIMIT_OFFSET: i32 = 0;
pub const RT_TICK_COUNTER_OFFSET: i32 = 4;

/// Array object layout: length word, then elements.
const ARRAY_LENGTH_OFFSET: i32 = 0;
const ARRAY_ELEMENTS_OFFSET: i32 = 4;

/// Operation selector passed to the long/float helper routines.
fn op_selector(op: BinOp) -> i32 {
    match op {
        BinOp::Add => 0,
        BinOp::Sub => 1,
        BinOp::Mul => 2,
        BinOp::Div => 3,
        BinOp::Rem => 4,
        BinOp::And => 5,
        BinOp::Or => 6,
        BinOp::Xor => 7,
        BinOp::Shl => 8,
        BinOp::Shr => 9,
        BinOp::Ushr => 10,
        BinOp::Min => 11,
        BinOp::Max => 12,
    }
}

/// Selector for unary negate through the float/double helpers.
const NEG_SELECTOR: i32 = 13;

fn cond_code(cond: Condition) -> Cond {
    match cond {
        Condition::Eq => Cond::Eq,
        Condition::Ne => Cond::Ne,
        Condition::Lt => Cond::Lt,
        Condition::Ge => Cond::Ge,
        Condition::Gt => Cond::Gt,
        Condition::Le => Cond::Le,
    }
}

fn alu_of(op: BinOp) -> AluOp {
    match op {
        BinOp::Add => AluOp::Add,
        BinOp::Sub => AluOp::Sub,
        BinOp::Mul => AluOp::Mul,
        BinOp::Div => AluOp::Div,
        BinOp::Rem => AluOp::Rem,
        BinOp::And => AluOp::And,
        BinOp::Or => AluOp::Orr,
        BinOp::Xor => AluOp::Eor,
        BinOp::Shl => AluOp::Lsl,
        BinOp::Shr => AluOp::Asr,
        BinOp::Ushr => AluOp::Lsr,
        BinOp::Min => AluOp::Min,
        BinOp::Max => AluOp::Max,
    }
}

fn regs_of(value: &Value) -> Vec<Reg> {
    match value.loc {
        Location::Register(lo, hi) => {
            let mut v = vec![lo];
            v.extend(hi);
            v
        }
        _ => Vec::new(),
    }
}

/// What the compile loop does after the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Continue at the following bytecode.
    FallThrough,
    /// Continue inline at this bytecode index (taken branch or goto).
    Jump(u16),
    /// Control left the method; the continuation is finished.
    End,
}

/// A stub the compile loop must enqueue: entry label already branched to,
/// return label (if the stub returns) already bound at the resume point.
pub struct StubRequest {
    pub kind: ElementKind,
    pub frame: VirtualStackFrame,
    pub bci: u16,
    pub entry: LabelId,
    pub ret: Option<LabelId>,
}

/// A conditional edge out of the straight-line path: becomes a continuation
/// element starting at `target`.
pub struct BranchRequest {
    pub target: u16,
    pub frame: VirtualStackFrame,
    pub entry: LabelId,
    pub backward: bool,
}

/// Per-event output collected by the compile loop.
#[derive(Default)]
pub struct GenOut {
    pub stubs: Vec<StubRequest>,
    pub branches: Vec<BranchRequest>,
    /// Bytecode index and code word position of each call return site.
    pub deopt: Vec<(u16, usize)>,
}

/// Everything one event translation may touch. Borrowed piecewise from the
/// compiler so the frame and assembler stay independently mutable.
pub struct GenContext<'a> {
    pub asm: &'a mut BinaryAssembler,
    pub frame: &'a mut VirtualStackFrame,
    pub method: &'a Method,
    pub config: &'a JitConfig,
    /// Exception stub dedup, keyed by kind and covering handler.
    pub shared_stubs: &'a mut HashMap<(ExceptionKind, Option<u16>), LabelId>,
    pub out: &'a mut GenOut,
    pub bci: u16,
}

impl GenContext<'_> {
    pub fn translate(&mut self, event: Event) -> Result<Next, AsmError> {
        match event {
            Event::LoadLocal { index, ty } => {
                self.frame.load_local(index as usize, ty, self.asm)?;
                Ok(Next::FallThrough)
            }
            Event::StoreLocal { index, ty } => {
                self.frame.store_local(index as usize, ty, self.asm)?;
                Ok(Next::FallThrough)
            }
            Event::PushInt(v) => {
                self.frame.push_immediate(ValueType::Int, v as i64, 0);
                Ok(Next::FallThrough)
            }
            Event::PushLong(v) => {
                self.frame.push_immediate(ValueType::Long, v, 0);
                Ok(Next::FallThrough)
            }
            Event::PushFloat(v) => {
                self.frame
                    .push_immediate(ValueType::Float, v.to_bits() as i32 as i64, 0);
                Ok(Next::FallThrough)
            }
            Event::PushDouble(v) => {
                self.frame
                    .push_immediate(ValueType::Double, v.to_bits() as i64, 0);
                Ok(Next::FallThrough)
            }
            Event::PushNull => {
                self.frame.push_immediate(ValueType::Object, 0, 0);
                Ok(Next::FallThrough)
            }
            Event::PushObject(handle) => {
                let reg = self.frame.alloc_reg(self.asm, &[])?;
                self.asm
                    .load_literal(reg, LiteralValue::Obj { handle, offset: 0 })?;
                self.frame
                    .push_register(ValueType::Object, reg, None, FLAG_NONNULL);
                Ok(Next::FallThrough)
            }
            Event::Pop => {
                self.frame.pop();
                Ok(Next::FallThrough)
            }
            Event::Dup => {
                self.frame.dup(self.asm)?;
                Ok(Next::FallThrough)
            }
            Event::Binary { op, ty } => {
                match ty {
                    ValueType::Int => self.binary_int(op)?,
                    ValueType::Long => self.binary_long(op)?,
                    ValueType::Float | ValueType::Double => self.binary_float(op, ty)?,
                    _ => debug_assert!(false, "binary on {:?}", ty),
                }
                Ok(Next::FallThrough)
            }
            Event::Neg { ty } => {
                self.neg(ty)?;
                Ok(Next::FallThrough)
            }
            Event::IfCompare { cond, target } => self.if_compare(cond, target),
            Event::IfZero { cond, target } => self.if_zero(cond, target),
            Event::Goto { target } => {
                if target <= self.bci {
                    self.timer_check()?;
                }
                Ok(Next::Jump(target))
            }
            Event::Return => {
                self.emit_return()?;
                Ok(Next::End)
            }
            Event::GetField { offset, ty } => {
                self.get_field(offset as i32, ty)?;
                Ok(Next::FallThrough)
            }
            Event::PutField { offset, ty } => {
                self.put_field(offset as i32, ty)?;
                Ok(Next::FallThrough)
            }
            Event::ArrayLoad { ty } => {
                self.array_load(ty)?;
                Ok(Next::FallThrough)
            }
            Event::ArrayStore { ty } => {
                self.array_store(ty)?;
                Ok(Next::FallThrough)
            }
            Event::ArrayLength => {
                self.array_length()?;
                Ok(Next::FallThrough)
            }
            Event::InvokeStatic { target, arg_words, result } => {
                self.frame.flush(self.asm)?;
                let first_arg = self.frame.sp() - arg_words as usize;
                self.asm.load_literal(
                    Reg::R0,
                    LiteralValue::Obj { handle: target.0, offset: 0 },
                )?;
                emit_alu(
                    self.asm,
                    AluOp::Add,
                    Reg::R1,
                    Reg::Fp,
                    None,
                    VirtualStackFrame::slot_offset(first_arg),
                )?;
                self.asm.call(RuntimeRoutine::InvokeStatic)?;
                self.out.deopt.push((self.bci, self.asm.pos()));
                self.frame.pop_words(arg_words as usize);
                self.push_call_result(result);
                Ok(Next::FallThrough)
            }
            Event::InvokeVirtual { vtable_index, arg_words, result } => {
                // arg_words includes the receiver word
                self.frame.flush(self.asm)?;
                let recv = self.frame.sp() - arg_words as usize;
                let recv_nonnull = self.frame.raw_at(recv).flags & FLAG_NONNULL != 0;
                self.asm
                    .load_word(Reg::R0, Reg::Fp, VirtualStackFrame::slot_offset(recv))?;
                if !recv_nonnull {
                    let target = self.throw_target(ExceptionKind::NullPointer)?;
                    self.asm.cmp_imm(Reg::R0, 0)?;
                    self.asm.branch_cond(Cond::Eq, target)?;
                }
                self.asm.mov_imm(Reg::R1, vtable_index as i32)?;
                self.asm.call(RuntimeRoutine::InvokeVirtual)?;
                self.out.deopt.push((self.bci, self.asm.pos()));
                self.frame.pop_words(arg_words as usize);
                self.push_call_result(result);
                Ok(Next::FallThrough)
            }
            Event::CheckCast { class } => {
                let top = self.frame.value_at(self.frame.sp() - 1);
                if top.as_immediate() == Some(0) {
                    // null passes any cast
                    return Ok(Next::FallThrough);
                }
                self.frame.flush(self.asm)?;
                let entry = self.asm.new_label();
                let ret = self.asm.new_label();
                self.out.stubs.push(StubRequest {
                    kind: ElementKind::CheckCastStub { class },
                    frame: self.frame.clone(),
                    bci: self.bci,
                    entry,
                    ret: Some(ret),
                });
                self.asm.branch(entry)?;
                self.asm.bind(ret)?;
                Ok(Next::FallThrough)
            }
            Event::InstanceOf { class } => {
                let top = self.frame.value_at(self.frame.sp() - 1);
                if top.as_immediate() == Some(0) {
                    self.frame.pop();
                    self.frame.push_immediate(ValueType::Int, 0, 0);
                    return Ok(Next::FallThrough);
                }
                self.frame.flush(self.asm)?;
                let entry = self.asm.new_label();
                let ret = self.asm.new_label();
                self.out.stubs.push(StubRequest {
                    kind: ElementKind::InstanceOfStub { class },
                    frame: self.frame.clone(),
                    bci: self.bci,
                    entry,
                    ret: Some(ret),
                });
                self.asm.branch(entry)?;
                self.asm.bind(ret)?;
                self.frame.pop();
                self.frame.push_register(ValueType::Int, Reg::R0, None, 0);
                Ok(Next::FallThrough)
            }
            Event::Throw => {
                let top = self.frame.value_at(self.frame.sp() - 1);
                if top.as_immediate() == Some(0) {
                    let target = self.throw_target(ExceptionKind::NullPointer)?;
                    self.asm.branch(target)?;
                    return Ok(Next::End);
                }
                let nonnull = top.is_nonnull();
                self.frame.flush(self.asm)?;
                self.asm.load_word(
                    Reg::R0,
                    Reg::Fp,
                    VirtualStackFrame::slot_offset(self.frame.sp() - 1),
                )?;
                if !nonnull {
                    let target = self.throw_target(ExceptionKind::NullPointer)?;
                    self.asm.cmp_imm(Reg::R0, 0)?;
                    self.asm.branch_cond(Cond::Eq, target)?;
                }
                self.asm.call(RuntimeRoutine::ThrowObject)?;
                Ok(Next::End)
            }
        }
    }

    // ==================== arithmetic ====================

    fn binary_int(&mut self, op: BinOp) -> Result<(), AsmError> {
        let rhs = self.frame.pop();
        let lhs = self.frame.pop();
        if let (Some(a), Some(b)) = (lhs.as_immediate(), rhs.as_immediate()) {
            if let Some(v) = op.fold_int(a as i32, b as i32) {
                self.frame.push_immediate(ValueType::Int, v as i64, 0);
                return Ok(());
            }
            // division by a known zero: keep the trapping code path
        }
        // Immediate on the left: swap into the immediate field where the
        // operator allows it (reverse-subtract covers subtraction).
        if let Some(a) = lhs.as_immediate() {
            if !rhs.is_immediate() && (op.is_commutative() || op == BinOp::Sub) {
                let alu = if op == BinOp::Sub { AluOp::Rsb } else { alu_of(op) };
                let (r, _) = self.frame.materialize(rhs, self.asm, &[])?;
                emit_alu(self.asm, alu, r, r, None, a as i32)?;
                self.frame.push_register(ValueType::Int, r, None, 0);
                return Ok(());
            }
        }
        let (l, _) = self.frame.materialize(lhs, self.asm, &regs_of(&rhs))?;
        if matches!(op, BinOp::Div | BinOp::Rem) {
            match rhs.as_immediate() {
                Some(v) if v != 0 => {}
                _ => {
                    let (r, _) = self.frame.materialize(rhs, self.asm, &[l])?;
                    let target = self.throw_target(ExceptionKind::Arithmetic)?;
                    self.asm.cmp_imm(r, 0)?;
                    self.asm.branch_cond(Cond::Eq, target)?;
                    self.asm.alu_rr(alu_of(op), l, l, r)?;
                    self.frame.push_register(ValueType::Int, l, None, 0);
                    return Ok(());
                }
            }
        }
        match rhs.loc {
            Location::Register(r, _) => self.asm.alu_rr(alu_of(op), l, l, r)?,
            Location::Immediate(v) => emit_alu(self.asm, alu_of(op), l, l, None, v as i32)?,
            _ => {
                let (r, _) = self.frame.materialize(rhs, self.asm, &[l])?;
                self.asm.alu_rr(alu_of(op), l, l, r)?;
            }
        }
        self.frame.push_register(ValueType::Int, l, None, 0);
        Ok(())
    }

    fn binary_long(&mut self, op: BinOp) -> Result<(), AsmError> {
        let sp = self.frame.sp();
        let rhs = self.frame.value_at(sp - 2);
        let lhs = self.frame.value_at(sp - 4);
        if let (Some(a), Some(b)) = (lhs.as_immediate(), rhs.as_immediate()) {
            if let Some(v) = op.fold_long(a, b) {
                self.frame.pop();
                self.frame.pop();
                self.frame.push_immediate(ValueType::Long, v, 0);
                return Ok(());
            }
        }
        match op {
            BinOp::Add | BinOp::Sub | BinOp::And | BinOp::Or | BinOp::Xor => {
                let rhs = self.frame.pop();
                let lhs = self.frame.pop();
                let (l_lo, l_hi) = self.frame.materialize(lhs, self.asm, &regs_of(&rhs))?;
                let l_hi = l_hi.expect("long value without a high word");
                let (lo_op, hi_op) = match op {
                    BinOp::Add => (AluOp::Add, AluOp::Adc),
                    BinOp::Sub => (AluOp::Sub, AluOp::Sbc),
                    BinOp::And => (AluOp::And, AluOp::And),
                    BinOp::Or => (AluOp::Orr, AluOp::Orr),
                    _ => (AluOp::Eor, AluOp::Eor),
                };
                match rhs.loc {
                    Location::Immediate(bits) => {
                        emit_alu(self.asm, lo_op, l_lo, l_lo, None, bits as i32)?;
                        emit_alu(self.asm, hi_op, l_hi, l_hi, None, (bits >> 32) as i32)?;
                    }
                    _ => {
                        let (r_lo, r_hi) =
                            self.frame.materialize(rhs, self.asm, &[l_lo, l_hi])?;
                        let r_hi = r_hi.expect("long value without a high word");
                        self.asm.alu_rr(lo_op, l_lo, l_lo, r_lo)?;
                        self.asm.alu_rr(hi_op, l_hi, l_hi, r_hi)?;
                    }
                }
                self.frame.push_register(ValueType::Long, l_lo, Some(l_hi), 0);
                Ok(())
            }
            _ => {
                // Mul, Div, Rem, shifts, Min, Max go through the runtime.
                // The division helpers raise the arithmetic exception on a
                // zero divisor themselves.
                let routine = match op {
                    BinOp::Mul => RuntimeRoutine::LongMul,
                    BinOp::Div => RuntimeRoutine::LongDiv,
                    BinOp::Rem => RuntimeRoutine::LongRem,
                    BinOp::Shl | BinOp::Shr | BinOp::Ushr => RuntimeRoutine::LongShift,
                    _ => RuntimeRoutine::LongMinMax,
                };
                self.runtime_binary(routine, op, ValueType::Long)
            }
        }
    }

    fn binary_float(&mut self, op: BinOp, ty: ValueType) -> Result<(), AsmError> {
        let routine = if ty == ValueType::Double {
            RuntimeRoutine::DoubleOp
        } else {
            RuntimeRoutine::FloatOp
        };
        self.runtime_binary(routine, op, ty)
    }

    /// Call a two-operand helper: selector in r0, operand block address in
    /// r1, result back in r0 (and r1 for two-word results).
    fn runtime_binary(
        &mut self,
        routine: RuntimeRoutine,
        op: BinOp,
        ty: ValueType,
    ) -> Result<(), AsmError> {
        let words = ty.words();
        let lhs_slot = self.frame.sp() - 2 * words;
        self.frame.flush(self.asm)?;
        self.asm.mov_imm(Reg::R0, op_selector(op))?;
        emit_alu(
            self.asm,
            AluOp::Add,
            Reg::R1,
            Reg::Fp,
            None,
            VirtualStackFrame::slot_offset(lhs_slot),
        )?;
        self.asm.call(routine)?;
        self.frame.pop_words(2 * words);
        if words == 2 {
            self.frame.push_register(ty, Reg::R0, Some(Reg::R1), 0);
        } else {
            self.frame.push_register(ty, Reg::R0, None, 0);
        }
        Ok(())
    }

    fn neg(&mut self, ty: ValueType) -> Result<(), AsmError> {
        match ty {
            ValueType::Int => {
                let v = self.frame.pop();
                if let Some(a) = v.as_immediate() {
                    self.frame
                        .push_immediate(ValueType::Int, (a as i32).wrapping_neg() as i64, 0);
                    return Ok(());
                }
                let (r, _) = self.frame.materialize(v, self.asm, &[])?;
                emit_alu(self.asm, AluOp::Rsb, r, r, None, 0)?;
                self.frame.push_register(ValueType::Int, r, None, 0);
                Ok(())
            }
            ValueType::Long => {
                let top = self.frame.value_at(self.frame.sp() - 2);
                if let Some(a) = top.as_immediate() {
                    self.frame.pop();
                    self.frame.push_immediate(ValueType::Long, a.wrapping_neg(), 0);
                    return Ok(());
                }
                self.runtime_unary(RuntimeRoutine::LongNeg, ValueType::Long, None)
            }
            ValueType::Float => {
                self.runtime_unary(RuntimeRoutine::FloatOp, ValueType::Float, Some(NEG_SELECTOR))
            }
            ValueType::Double => self.runtime_unary(
                RuntimeRoutine::DoubleOp,
                ValueType::Double,
                Some(NEG_SELECTOR),
            ),
            _ => {
                debug_assert!(false, "neg on {:?}", ty);
                Ok(())
            }
        }
    }

    fn runtime_unary(
        &mut self,
        routine: RuntimeRoutine,
        ty: ValueType,
        selector: Option<i32>,
    ) -> Result<(), AsmError> {
        let words = ty.words();
        let slot = self.frame.sp() - words;
        self.frame.flush(self.asm)?;
        if let Some(sel) = selector {
            self.asm.mov_imm(Reg::R0, sel)?;
        }
        emit_alu(
            self.asm,
            AluOp::Add,
            Reg::R1,
            Reg::Fp,
            None,
            VirtualStackFrame::slot_offset(slot),
        )?;
        self.asm.call(routine)?;
        self.frame.pop_words(words);
        if words == 2 {
            self.frame.push_register(ty, Reg::R0, Some(Reg::R1), 0);
        } else {
            self.frame.push_register(ty, Reg::R0, None, 0);
        }
        Ok(())
    }

    // ==================== control flow ====================

    fn if_compare(&mut self, cond: Condition, target: u16) -> Result<Next, AsmError> {
        let sp = self.frame.sp();
        let rhs_v = self.frame.value_at(sp - 1);
        let lhs_v = self.frame.value_at(sp - 2);
        if let (Some(a), Some(b)) = (lhs_v.as_immediate(), rhs_v.as_immediate()) {
            self.frame.pop();
            self.frame.pop();
            return if cond.eval_i64(a, b) {
                if target <= self.bci {
                    self.timer_check()?;
                }
                Ok(Next::Jump(target))
            } else {
                Ok(Next::FallThrough)
            };
        }
        let backward = target <= self.bci;
        if backward {
            // Before the operands leave their slots: the tick stub restores
            // only slot-resident state.
            self.timer_check()?;
        }
        let rhs = self.frame.pop();
        let lhs = self.frame.pop();
        let (l, _) = self.frame.materialize(lhs, self.asm, &regs_of(&rhs))?;
        match rhs.loc {
            Location::Immediate(v) => self.asm.cmp_imm(l, v as i32)?,
            _ => {
                let (r, _) = self.frame.materialize(rhs, self.asm, &[l])?;
                self.asm.cmp_rr(l, r)?;
            }
        }
        self.finish_branch(cond, target, backward)
    }

    fn if_zero(&mut self, cond: Condition, target: u16) -> Result<Next, AsmError> {
        let top = self.frame.value_at(self.frame.sp() - 1);
        if let Some(a) = top.as_immediate() {
            self.frame.pop();
            return if cond.eval_i64(a, 0) {
                if target <= self.bci {
                    self.timer_check()?;
                }
                Ok(Next::Jump(target))
            } else {
                Ok(Next::FallThrough)
            };
        }
        let backward = target <= self.bci;
        if backward {
            self.timer_check()?;
        }
        let v = self.frame.pop();
        let (r, _) = self.frame.materialize(v, self.asm, &[])?;
        self.asm.cmp_imm(r, 0)?;
        self.finish_branch(cond, target, backward)
    }

    /// Emit the branch with the likely direction inline. A backward target
    /// is predicted taken: the test is negated, the fall-through path
    /// becomes the out-of-line element, and translation continues toward
    /// the target.
    fn finish_branch(&mut self, cond: Condition, target: u16, backward: bool) -> Result<Next, AsmError> {
        if backward && self.config.predict_backward_taken {
            let entry = self.asm.new_label();
            self.asm.branch_cond(cond_code(cond.negate()), entry)?;
            self.out.branches.push(BranchRequest {
                target: self.bci + 1,
                frame: self.frame.clone(),
                entry,
                backward: false,
            });
            Ok(Next::Jump(target))
        } else {
            let entry = self.asm.new_label();
            self.asm.branch_cond(cond_code(cond), entry)?;
            self.out.branches.push(BranchRequest {
                target,
                frame: self.frame.clone(),
                entry,
                backward,
            });
            Ok(Next::FallThrough)
        }
    }

    /// Decrement-and-test of the runtime tick counter; at or below zero the
    /// out-of-line stub calls the runtime and restores the frame.
    fn timer_check(&mut self) -> Result<(), AsmError> {
        let entry = self.asm.new_label();
        let ret = self.asm.new_label();
        self.asm
            .load_word(Reg::Tmp, Reg::Rt, RT_TICK_COUNTER_OFFSET)?;
        self.asm.cmp_imm(Reg::Tmp, 0)?;
        self.asm.branch_cond(Cond::Le, entry)?;
        self.out.stubs.push(StubRequest {
            kind: ElementKind::TimerTickStub,
            frame: self.frame.clone(),
            bci: self.bci,
            entry,
            ret: Some(ret),
        });
        self.asm.bind(ret)
    }

    fn emit_return(&mut self) -> Result<(), AsmError> {
        if self.method.result != ResultKind::Void {
            let v = self.frame.pop();
            match v.loc {
                Location::Immediate(bits) => {
                    self.asm.mov_imm(Reg::R0, bits as i32)?;
                    if v.ty.is_two_word() {
                        self.asm.mov_imm(Reg::R1, (bits >> 32) as i32)?;
                    }
                }
                Location::Register(lo, hi) => match hi {
                    Some(hi) if hi == Reg::R0 => {
                        // move the high word out of the way first
                        if lo == Reg::R1 {
                            self.asm.mov_rr(Reg::Tmp, hi)?;
                            self.asm.mov_rr(Reg::R0, lo)?;
                            self.asm.mov_rr(Reg::R1, Reg::Tmp)?;
                        } else {
                            self.asm.mov_rr(Reg::R1, hi)?;
                            self.asm.mov_rr(Reg::R0, lo)?;
                        }
                    }
                    _ => {
                        self.asm.mov_rr(Reg::R0, lo)?;
                        if let Some(hi) = hi {
                            self.asm.mov_rr(Reg::R1, hi)?;
                        }
                    }
                },
                Location::Memory(slot) => {
                    self.asm
                        .load_word(Reg::R0, Reg::Fp, VirtualStackFrame::slot_offset(slot))?;
                    if v.ty.is_two_word() {
                        self.asm.load_word(
                            Reg::R1,
                            Reg::Fp,
                            VirtualStackFrame::slot_offset(slot + 1),
                        )?;
                    }
                }
                Location::Absent => debug_assert!(false, "returning an absent value"),
            }
        }
        self.asm.ret()
    }

    // ==================== fields and arrays ====================

    fn get_field(&mut self, offset: i32, ty: ValueType) -> Result<(), AsmError> {
        let obj = self.frame.pop();
        let (r, _) = self.frame.materialize(obj, self.asm, &[])?;
        self.null_check(r, obj.flags)?;
        if ty.is_two_word() {
            let hi = self.frame.alloc_reg(self.asm, &[r])?;
            // high word first: the low load overwrites the base
            self.asm.load_word(hi, r, offset + 4)?;
            self.asm.load_word(r, r, offset)?;
            self.frame.push_register(ty, r, Some(hi), 0);
        } else {
            self.asm.load_word(r, r, offset)?;
            self.frame.push_register(ty, r, None, 0);
        }
        Ok(())
    }

    fn put_field(&mut self, offset: i32, ty: ValueType) -> Result<(), AsmError> {
        let value = self.frame.pop();
        let obj = self.frame.pop();
        let (r, _) = self.frame.materialize(obj, self.asm, &regs_of(&value))?;
        self.null_check(r, obj.flags)?;
        let (lo, hi) = self.frame.materialize(value, self.asm, &[r])?;
        self.asm.store_word(lo, r, offset)?;
        if let Some(hi) = hi {
            debug_assert!(ty.is_two_word());
            self.asm.store_word(hi, r, offset + 4)?;
        }
        Ok(())
    }

    fn array_load(&mut self, ty: ValueType) -> Result<(), AsmError> {
        let idx = self.frame.pop();
        let arr = self.frame.pop();
        let (a, _) = self.frame.materialize(arr, self.asm, &regs_of(&idx))?;
        self.null_check(a, arr.flags)?;
        let (i, _) = self.frame.materialize(idx, self.asm, &[a])?;
        self.bounds_check(a, i)?;
        let shift = if ty.is_two_word() { 3 } else { 2 };
        emit_alu(self.asm, AluOp::Lsl, Reg::Tmp, i, None, shift)?;
        self.asm.alu_rr(AluOp::Add, a, a, Reg::Tmp)?;
        if ty.is_two_word() {
            let hi = self.frame.alloc_reg(self.asm, &[a])?;
            self.asm.load_word(hi, a, ARRAY_ELEMENTS_OFFSET + 4)?;
            self.asm.load_word(a, a, ARRAY_ELEMENTS_OFFSET)?;
            self.frame.push_register(ty, a, Some(hi), 0);
        } else {
            self.asm.load_word(a, a, ARRAY_ELEMENTS_OFFSET)?;
            self.frame.push_register(ty, a, None, 0);
        }
        Ok(())
    }

    fn array_store(&mut self, ty: ValueType) -> Result<(), AsmError> {
        if ty == ValueType::Object {
            return self.array_store_object();
        }
        let value = self.frame.pop();
        let idx = self.frame.pop();
        let arr = self.frame.pop();
        let mut avoid = regs_of(&value);
        avoid.extend(regs_of(&idx));
        let (a, _) = self.frame.materialize(arr, self.asm, &avoid)?;
        self.null_check(a, arr.flags)?;
        let mut avoid = regs_of(&value);
        avoid.push(a);
        let (i, _) = self.frame.materialize(idx, self.asm, &avoid)?;
        self.bounds_check(a, i)?;
        let shift = if ty.is_two_word() { 3 } else { 2 };
        emit_alu(self.asm, AluOp::Lsl, Reg::Tmp, i, None, shift)?;
        self.asm.alu_rr(AluOp::Add, a, a, Reg::Tmp)?;
        let (lo, hi) = self.frame.materialize(value, self.asm, &[a, i])?;
        self.asm.store_word(lo, a, ARRAY_ELEMENTS_OFFSET)?;
        if let Some(hi) = hi {
            self.asm.store_word(hi, a, ARRAY_ELEMENTS_OFFSET + 4)?;
        }
        Ok(())
    }

    /// Object array stores run off a flushed frame: null and bounds checks
    /// read from memory, the store compatibility check is a runtime call in
    /// a stub, and the store itself reloads its operands afterwards.
    fn array_store_object(&mut self) -> Result<(), AsmError> {
        let sp = self.frame.sp();
        let val_off = VirtualStackFrame::slot_offset(sp - 1);
        let idx_off = VirtualStackFrame::slot_offset(sp - 2);
        let arr_off = VirtualStackFrame::slot_offset(sp - 3);
        let arr_nonnull = self.frame.raw_at(sp - 3).flags & FLAG_NONNULL != 0;
        let val_null = self.frame.value_at(sp - 1).as_immediate() == Some(0);
        self.frame.flush(self.asm)?;

        self.asm.load_word(Reg::R0, Reg::Fp, arr_off)?;
        if !arr_nonnull {
            let target = self.throw_target(ExceptionKind::NullPointer)?;
            self.asm.cmp_imm(Reg::R0, 0)?;
            self.asm.branch_cond(Cond::Eq, target)?;
        }
        self.asm.load_word(Reg::R1, Reg::Fp, idx_off)?;
        self.bounds_check(Reg::R0, Reg::R1)?;

        if !val_null {
            let entry = self.asm.new_label();
            let ret = self.asm.new_label();
            self.out.stubs.push(StubRequest {
                kind: ElementKind::TypeCheckStub,
                frame: self.frame.clone(),
                bci: self.bci,
                entry,
                ret: Some(ret),
            });
            self.asm.branch(entry)?;
            self.asm.bind(ret)?;
            // the call clobbered the scratch registers
            self.asm.load_word(Reg::R0, Reg::Fp, arr_off)?;
            self.asm.load_word(Reg::R1, Reg::Fp, idx_off)?;
        }
        emit_alu(self.asm, AluOp::Lsl, Reg::Tmp, Reg::R1, None, 2)?;
        self.asm.alu_rr(AluOp::Add, Reg::R0, Reg::R0, Reg::Tmp)?;
        self.asm.load_word(Reg::R1, Reg::Fp, val_off)?;
        self.asm.store_word(Reg::R1, Reg::R0, ARRAY_ELEMENTS_OFFSET)?;
        self.frame.pop_words(3);
        Ok(())
    }

    fn array_length(&mut self) -> Result<(), AsmError> {
        let arr = self.frame.pop();
        let (a, _) = self.frame.materialize(arr, self.asm, &[])?;
        self.null_check(a, arr.flags)?;
        self.asm.load_word(a, a, ARRAY_LENGTH_OFFSET)?;
        self.frame.push_register(ValueType::Int, a, None, 0);
        Ok(())
    }

    // ==================== checks ====================

    /// Null test against the throw (or quick-catch) stub for this site.
    /// Elided entirely when the value is statically non-null.
    fn null_check(&mut self, reg: Reg, flags: u8) -> Result<(), AsmError> {
        if flags & FLAG_NONNULL != 0 {
            return Ok(());
        }
        let target = self.throw_target(ExceptionKind::NullPointer)?;
        self.asm.cmp_imm(reg, 0)?;
        self.asm.branch_cond(Cond::Eq, target)
    }

    /// Unsigned compare of index against the length word; a negative index
    /// is a huge unsigned value and fails the same test.
    fn bounds_check(&mut self, arr: Reg, idx: Reg) -> Result<(), AsmError> {
        let target = self.throw_target(ExceptionKind::IndexOutOfBounds)?;
        self.asm.load_word(Reg::Tmp, arr, ARRAY_LENGTH_OFFSET)?;
        self.asm.cmp_rr(idx, Reg::Tmp)?;
        self.asm.branch_cond(Cond::Hs, target)
    }

    /// Entry label of the stub that raises `kind` at this site. Covered
    /// sites get a quick-catch stub that enters the handler directly.
    ///
    /// Stubs are shared between sites only when the frame is fully flushed:
    /// a shared stub's captured frame state must be valid for every site
    /// that branches to it, and a flushed frame is the one state they can
    /// all agree on.
    fn throw_target(&mut self, kind: ExceptionKind) -> Result<LabelId, AsmError> {
        let handler = self.method.handler_for(self.bci, kind).map(|h| h.handler);
        let key = (kind, handler);
        let shareable = self.config.share_exception_stubs && self.frame.is_fully_flushed();
        if shareable {
            if let Some(&label) = self.shared_stubs.get(&key) {
                return Ok(label);
            }
        }
        let entry = self.asm.new_label();
        let stub_kind = match handler {
            Some(handler) => ElementKind::QuickCatchStub { kind, handler },
            None => ElementKind::ThrowExceptionStub { kind },
        };
        self.out.stubs.push(StubRequest {
            kind: stub_kind,
            frame: self.frame.clone(),
            bci: self.bci,
            entry,
            ret: None,
        });
        if shareable {
            self.shared_stubs.insert(key, entry);
        }
        Ok(entry)
    }

    fn push_call_result(&mut self, result: ResultKind) {
        match result.value_type() {
            None => {}
            Some(ty) if ty.is_two_word() => {
                self.frame.push_register(ty, Reg::R0, Some(Reg::R1), 0)
            }
            Some(ty) => self.frame.push_register(ty, Reg::R0, None, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::encoding::{decode, Instr};

    struct Fixture {
        asm: BinaryAssembler,
        frame: VirtualStackFrame,
        method: Method,
        config: JitConfig,
        shared: HashMap<(ExceptionKind, Option<u16>), LabelId>,
        out: GenOut,
    }

    impl Fixture {
        fn new() -> Self {
            let config = JitConfig::default();
            Fixture {
                asm: BinaryAssembler::new(&config),
                frame: VirtualStackFrame::new(2, 8),
                method: Method {
                    name: "t".into(),
                    locals: 2,
                    max_stack: 8,
                    arg_words: 0,
                    result: ResultKind::Int,
                    events: vec![],
                    handlers: vec![],
                },
                config,
                shared: HashMap::new(),
                out: GenOut::default(),
            }
        }

        fn translate(&mut self, event: Event) -> Next {
            let mut cx = GenContext {
                asm: &mut self.asm,
                frame: &mut self.frame,
                method: &self.method,
                config: &self.config,
                shared_stubs: &mut self.shared,
                out: &mut self.out,
                bci: 0,
            };
            cx.translate(event).unwrap()
        }

        fn words(&self) -> &[u32] {
            self.asm.words()
        }
    }

    #[test]
    fn test_fold_leaves_no_code() {
        let mut fx = Fixture::new();
        fx.translate(Event::PushInt(5));
        fx.translate(Event::PushInt(3));
        fx.translate(Event::Binary { op: BinOp::Add, ty: ValueType::Int });
        assert!(fx.words().is_empty());
        let v = fx.frame.pop();
        assert_eq!(v.as_immediate(), Some(8));
    }

    #[test]
    fn test_division_by_known_zero_not_folded() {
        let mut fx = Fixture::new();
        fx.translate(Event::PushInt(7));
        fx.translate(Event::PushInt(0));
        fx.translate(Event::Binary { op: BinOp::Div, ty: ValueType::Int });
        // the trapping compare-and-branch must be present
        assert!(!fx.words().is_empty());
        assert_eq!(fx.out.stubs.len(), 1);
        assert!(matches!(
            fx.out.stubs[0].kind,
            ElementKind::ThrowExceptionStub { kind: ExceptionKind::Arithmetic }
        ));
    }

    #[test]
    fn test_immediate_left_subtraction_uses_rsb() {
        let mut fx = Fixture::new();
        // a register-resident right operand
        fx.frame.push_immediate(ValueType::Int, 9, 0);
        let v = fx.frame.pop();
        let (r, _) = fx.frame.materialize(v, &mut fx.asm, &[]).unwrap();
        fx.frame.push_immediate(ValueType::Int, 100, 0);
        fx.frame.push_register(ValueType::Int, r, None, 0);
        fx.translate(Event::Binary { op: BinOp::Sub, ty: ValueType::Int });
        let rsb = fx.words().iter().any(|&w| {
            matches!(decode(w), Some(Instr::AluImm { op: AluOp::Rsb, imm: 100, .. }))
        });
        assert!(rsb, "100 - r should emit a reverse-subtract immediate");
    }

    #[test]
    fn test_known_comparison_collapses() {
        let mut fx = Fixture::new();
        fx.translate(Event::PushInt(5));
        fx.translate(Event::PushInt(3));
        let next = fx.translate(Event::IfCompare { cond: Condition::Gt, target: 7 });
        assert_eq!(next, Next::Jump(7));
        assert!(fx.words().is_empty());
        assert!(fx.out.branches.is_empty());
    }

    #[test]
    fn test_forward_branch_spawns_element() {
        let mut fx = Fixture::new();
        fx.translate(Event::LoadLocal { index: 0, ty: ValueType::Int });
        let next = fx.translate(Event::IfZero { cond: Condition::Eq, target: 5 });
        assert_eq!(next, Next::FallThrough);
        assert_eq!(fx.out.branches.len(), 1);
        assert_eq!(fx.out.branches[0].target, 5);
        assert!(!fx.out.branches[0].backward);
    }

    #[test]
    fn test_null_check_elided_for_nonnull() {
        let mut fx = Fixture::new();
        fx.frame.set_nonnull(0);
        fx.translate(Event::LoadLocal { index: 0, ty: ValueType::Object });
        let before = fx.words().len();
        fx.translate(Event::GetField { offset: 8, ty: ValueType::Int });
        let emitted = &fx.words()[before..];
        assert!(
            !emitted.iter().any(|&w| matches!(decode(w), Some(Instr::CondBranch { .. }))),
            "known non-null receiver must not be re-checked"
        );
        assert!(fx.out.stubs.is_empty());
    }

    #[test]
    fn test_null_check_emitted_when_unknown() {
        let mut fx = Fixture::new();
        fx.translate(Event::LoadLocal { index: 0, ty: ValueType::Object });
        fx.translate(Event::GetField { offset: 8, ty: ValueType::Int });
        assert_eq!(fx.out.stubs.len(), 1);
        assert!(matches!(
            fx.out.stubs[0].kind,
            ElementKind::ThrowExceptionStub { kind: ExceptionKind::NullPointer }
        ));
    }

    #[test]
    fn test_checkcast_of_null_is_free() {
        let mut fx = Fixture::new();
        fx.translate(Event::PushNull);
        let class = crate::vm::refs::ClassHandle(crate::vm::refs::ObjRef(3));
        fx.translate(Event::CheckCast { class });
        assert!(fx.words().is_empty());
        assert!(fx.out.stubs.is_empty());
    }

    #[test]
    fn test_return_moves_immediate_to_result_register() {
        let mut fx = Fixture::new();
        fx.translate(Event::PushInt(42));
        let next = fx.translate(Event::Return);
        assert_eq!(next, Next::End);
        let w = fx.words();
        assert_eq!(decode(w[0]), Some(Instr::MovImm { rd: Reg::R0, imm: 42 }));
        assert!(matches!(decode(w[1]), Some(Instr::Ret)));
    }

    #[test]
    fn test_backward_branch_emits_tick_check() {
        let mut fx = Fixture::new();
        fx.translate(Event::LoadLocal { index: 0, ty: ValueType::Int });
        let mut cx = GenContext {
            asm: &mut fx.asm,
            frame: &mut fx.frame,
            method: &fx.method,
            config: &fx.config,
            shared_stubs: &mut fx.shared,
            out: &mut fx.out,
            bci: 6,
        };
        let next = cx.translate(Event::IfZero { cond: Condition::Ne, target: 2 }).unwrap();
        // predicted taken: translation continues at the target
        assert_eq!(next, Next::Jump(2));
        assert!(fx
            .out
            .stubs
            .iter()
            .any(|s| matches!(s.kind, ElementKind::TimerTickStub)));
        let tick_load = fx.words().iter().any(|&w| {
            matches!(
                decode(w),
                Some(Instr::Load { base: Reg::Rt, offset, .. }) if offset == RT_TICK_COUNTER_OFFSET
            )
        });
        assert!(tick_load, "tick counter load missing before the loop edge");
    }

    #[test]
    fn test_shared_stub_reused_when_flushed() {
        let mut fx = Fixture::new();
        {
            let mut cx = GenContext {
                asm: &mut fx.asm,
                frame: &mut fx.frame,
                method: &fx.method,
                config: &fx.config,
                shared_stubs: &mut fx.shared,
                out: &mut fx.out,
                bci: 0,
            };
            cx.frame.flush(cx.asm).unwrap();
            let a = cx.throw_target(ExceptionKind::NullPointer).unwrap();
            let b = cx.throw_target(ExceptionKind::NullPointer).unwrap();
            assert_eq!(a, b);
        }
        assert_eq!(fx.out.stubs.len(), 1);
    }
}
