//! Pre-resolved bytecode events.
//!
//! The decoder hands the compiler one `Event` per bytecode with every
//! symbolic operand already resolved: field accesses carry byte offsets,
//! invokes carry method handles or vtable indices, type tests carry class
//! handles. Branch targets are event indices (bci). The compiler never
//! consults a constant pool.

use serde::{Deserialize, Serialize};

use super::refs::{ClassHandle, ExceptionKind, MethodHandle, ObjRef};

/// Type of an abstract operand or slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Int,
    Long,
    Float,
    Double,
    Object,
    ReturnAddress,
}

impl ValueType {
    /// Number of 32-bit words a value of this type occupies.
    pub fn words(self) -> usize {
        match self {
            ValueType::Long | ValueType::Double => 2,
            _ => 1,
        }
    }

    pub fn is_two_word(self) -> bool {
        self.words() == 2
    }
}

/// Result type of a method, used to pick the native entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    Void,
    Int,
    Long,
    Float,
    Double,
    Object,
}

impl ResultKind {
    pub fn value_type(self) -> Option<ValueType> {
        match self {
            ResultKind::Void => None,
            ResultKind::Int => Some(ValueType::Int),
            ResultKind::Long => Some(ValueType::Long),
            ResultKind::Float => Some(ValueType::Float),
            ResultKind::Double => Some(ValueType::Double),
            ResultKind::Object => Some(ValueType::Object),
        }
    }
}

/// Comparison condition for conditional branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Condition {
    /// The condition that succeeds exactly when `self` fails.
    pub fn negate(self) -> Condition {
        match self {
            Condition::Eq => Condition::Ne,
            Condition::Ne => Condition::Eq,
            Condition::Lt => Condition::Ge,
            Condition::Ge => Condition::Lt,
            Condition::Gt => Condition::Le,
            Condition::Le => Condition::Gt,
        }
    }

    /// Evaluate against a known comparison (`a` vs `b`).
    pub fn eval_i64(self, a: i64, b: i64) -> bool {
        match self {
            Condition::Eq => a == b,
            Condition::Ne => a != b,
            Condition::Lt => a < b,
            Condition::Ge => a >= b,
            Condition::Gt => a > b,
            Condition::Le => a <= b,
        }
    }
}

/// Binary operator on int or long operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
    Min,
    Max,
}

impl BinOp {
    /// Operators for which `op(a, b) == op(b, a)`, so an immediate left
    /// operand can swap to the right without materializing a register.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Mul | BinOp::And | BinOp::Or | BinOp::Xor | BinOp::Min | BinOp::Max
        )
    }

    /// Fold two int immediates. Division and remainder by zero are never
    /// folded: the runtime trap must still happen.
    pub fn fold_int(self, a: i32, b: i32) -> Option<i32> {
        Some(match self {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div => {
                if b == 0 {
                    return None;
                }
                // i32::MIN / -1 == i32::MIN in two's complement
                a.wrapping_div(b)
            }
            BinOp::Rem => {
                if b == 0 {
                    return None;
                }
                // i32::MIN % -1 == 0
                a.wrapping_rem(b)
            }
            BinOp::And => a & b,
            BinOp::Or => a | b,
            BinOp::Xor => a ^ b,
            BinOp::Shl => a.wrapping_shl(b as u32 & 31),
            BinOp::Shr => a.wrapping_shr(b as u32 & 31),
            BinOp::Ushr => ((a as u32).wrapping_shr(b as u32 & 31)) as i32,
            BinOp::Min => a.min(b),
            BinOp::Max => a.max(b),
        })
    }

    /// Fold two long immediates, same zero-division rule as `fold_int`.
    /// Long shifts take their count from the low word of the right operand.
    pub fn fold_long(self, a: i64, b: i64) -> Option<i64> {
        Some(match self {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div => {
                if b == 0 {
                    return None;
                }
                a.wrapping_div(b)
            }
            BinOp::Rem => {
                if b == 0 {
                    return None;
                }
                a.wrapping_rem(b)
            }
            BinOp::And => a & b,
            BinOp::Or => a | b,
            BinOp::Xor => a ^ b,
            BinOp::Shl => a.wrapping_shl(b as u32 & 63),
            BinOp::Shr => a.wrapping_shr(b as u32 & 63),
            BinOp::Ushr => ((a as u64).wrapping_shr(b as u32 & 63)) as i64,
            BinOp::Min => a.min(b),
            BinOp::Max => a.max(b),
        })
    }
}

/// One decoded bytecode. `target` fields are event indices within the same
/// method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Event {
    LoadLocal { index: u16, ty: ValueType },
    StoreLocal { index: u16, ty: ValueType },
    PushInt(i32),
    PushLong(i64),
    PushFloat(f32),
    PushDouble(f64),
    PushNull,
    PushObject(ObjRef),
    Pop,
    Dup,
    Binary { op: BinOp, ty: ValueType },
    Neg { ty: ValueType },
    IfCompare { cond: Condition, target: u16 },
    IfZero { cond: Condition, target: u16 },
    Goto { target: u16 },
    Return,
    GetField { offset: u16, ty: ValueType },
    PutField { offset: u16, ty: ValueType },
    ArrayLoad { ty: ValueType },
    ArrayStore { ty: ValueType },
    ArrayLength,
    InvokeStatic { target: MethodHandle, arg_words: u16, result: ResultKind },
    InvokeVirtual { vtable_index: u16, arg_words: u16, result: ResultKind },
    CheckCast { class: ClassHandle },
    InstanceOf { class: ClassHandle },
    Throw,
}

impl Event {
    /// The explicit branch target, if this event has one.
    pub fn branch_target(&self) -> Option<u16> {
        match self {
            Event::IfCompare { target, .. }
            | Event::IfZero { target, .. }
            | Event::Goto { target } => Some(*target),
            _ => None,
        }
    }

    /// True if control never falls through to the next event.
    pub fn ends_flow(&self) -> bool {
        matches!(self, Event::Goto { .. } | Event::Return | Event::Throw)
    }
}

/// An exception handler range. `start..end` is the covered bci range
/// (half-open); `handler` is the bci execution resumes at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handler {
    pub start: u16,
    pub end: u16,
    pub handler: u16,
    pub kind: ExceptionKind,
}

impl Handler {
    pub fn covers(&self, bci: u16, kind: ExceptionKind) -> bool {
        self.kind == kind && bci >= self.start && bci < self.end
    }
}

/// A method as delivered by the decoder: sizes, result kind, events and the
/// handler table. `locals` includes the incoming arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    pub locals: u16,
    pub max_stack: u16,
    pub arg_words: u16,
    pub result: ResultKind,
    pub events: Vec<Event>,
    #[serde(default)]
    pub handlers: Vec<Handler>,
}

impl Method {
    /// Number of frame slots (locals + operand stack).
    pub fn frame_size(&self) -> usize {
        self.locals as usize + self.max_stack as usize
    }

    /// The first handler covering `bci` for `kind`, if any.
    pub fn handler_for(&self, bci: u16, kind: ExceptionKind) -> Option<&Handler> {
        self.handlers.iter().find(|h| h.covers(bci, kind))
    }

    /// Incoming-edge count per bci: fall-through from the predecessor (when
    /// it can fall through), explicit branch edges, and handler entries.
    /// Positions with more than one edge become merge points.
    pub fn predecessor_counts(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.events.len() + 1];
        if !self.events.is_empty() {
            counts[0] += 1; // method entry
        }
        for (bci, ev) in self.events.iter().enumerate() {
            if let Some(target) = ev.branch_target() {
                counts[target as usize] += 1;
            }
            if !ev.ends_flow() && bci + 1 < counts.len() {
                counts[bci + 1] += 1;
            }
        }
        for h in &self.handlers {
            counts[h.handler as usize] += 1;
        }
        counts
    }

    /// Sanity checks on targets, slot indices and operand-stack shape. The
    /// decoder is trusted in release builds; this is for tools and tests.
    pub fn validate(&self) -> Result<(), String> {
        let len = self.events.len();
        for (bci, ev) in self.events.iter().enumerate() {
            if let Some(target) = ev.branch_target() {
                if target as usize >= len {
                    return Err(format!("bci {}: branch target {} out of range", bci, target));
                }
            }
            if let Event::LoadLocal { index, ty } | Event::StoreLocal { index, ty } = ev {
                if *index as usize + ty.words() > self.locals as usize {
                    return Err(format!("bci {}: local {} out of range", bci, index));
                }
            }
        }
        for h in &self.handlers {
            if h.handler as usize >= len || h.end as usize > len || h.start > h.end {
                return Err(format!("bad handler range {}..{}", h.start, h.end));
            }
        }
        self.check_stack_shape()
    }

    /// Abstract interpretation of the operand stack along every path:
    /// underflow, `max_stack` violations, and paths that join at one bci
    /// with different depths are all rejected before compilation sees them.
    fn check_stack_shape(&self) -> Result<(), String> {
        let len = self.events.len();
        let mut seen: Vec<Option<usize>> = vec![None; len + 1];
        let mut work: Vec<(usize, Vec<ValueType>)> = vec![(0, Vec::new())];
        for h in &self.handlers {
            // handlers enter with the operand stack cleared and the
            // exception object pushed
            work.push((h.handler as usize, vec![ValueType::Object]));
        }
        while let Some((bci, mut stack)) = work.pop() {
            let depth: usize = stack.iter().map(|t| t.words()).sum();
            match seen[bci] {
                Some(prev) if prev != depth => {
                    return Err(format!(
                        "bci {}: paths join with stack depths {} and {}",
                        bci, prev, depth
                    ));
                }
                Some(_) => continue,
                None => seen[bci] = Some(depth),
            }
            if bci == len {
                // flow past the last event returns implicitly
                self.check_result_on_stack(&mut stack, "method end")?;
                continue;
            }
            let ev = self.events[bci];
            self.apply_stack_effect(bci, ev, &mut stack)?;
            if let Some(target) = ev.branch_target() {
                work.push((target as usize, stack.clone()));
            }
            if !ev.ends_flow() {
                work.push((bci + 1, stack));
            }
        }
        Ok(())
    }

    fn check_result_on_stack(&self, stack: &mut Vec<ValueType>, at: &str) -> Result<(), String> {
        let Some(ty) = self.result.value_type() else {
            return Ok(());
        };
        match stack.pop() {
            Some(top) if top.words() == ty.words() => Ok(()),
            Some(_) => Err(format!("{}: result width mismatch", at)),
            None => Err(format!("{}: no {:?} result on the stack", at, self.result)),
        }
    }

    fn apply_stack_effect(
        &self,
        bci: usize,
        ev: Event,
        stack: &mut Vec<ValueType>,
    ) -> Result<(), String> {
        let pop = |stack: &mut Vec<ValueType>| {
            stack
                .pop()
                .ok_or_else(|| format!("bci {}: operand stack underflow", bci))
        };
        let pop_sized = |stack: &mut Vec<ValueType>, ty: ValueType| {
            let v = pop(stack)?;
            if v.words() != ty.words() {
                return Err(format!("bci {}: operand width mismatch", bci));
            }
            Ok(())
        };
        let pop_word = |stack: &mut Vec<ValueType>| {
            let v = pop(stack)?;
            if v.is_two_word() {
                return Err(format!("bci {}: two-word operand where one word expected", bci));
            }
            Ok(())
        };
        match ev {
            Event::LoadLocal { ty, .. } => stack.push(ty),
            Event::StoreLocal { ty, .. } => pop_sized(stack, ty)?,
            Event::PushInt(_) => stack.push(ValueType::Int),
            Event::PushLong(_) => stack.push(ValueType::Long),
            Event::PushFloat(_) => stack.push(ValueType::Float),
            Event::PushDouble(_) => stack.push(ValueType::Double),
            Event::PushNull | Event::PushObject(_) => stack.push(ValueType::Object),
            Event::Pop => {
                pop(stack)?;
            }
            Event::Dup => match stack.last().copied() {
                Some(top) if top.is_two_word() => {
                    return Err(format!("bci {}: dup of a two-word value", bci));
                }
                Some(top) => stack.push(top),
                None => return Err(format!("bci {}: operand stack underflow", bci)),
            },
            Event::Binary { ty, .. } => {
                pop_sized(stack, ty)?;
                pop_sized(stack, ty)?;
                stack.push(ty);
            }
            Event::Neg { ty } => {
                pop_sized(stack, ty)?;
                stack.push(ty);
            }
            Event::IfCompare { .. } => {
                pop_word(stack)?;
                pop_word(stack)?;
            }
            Event::IfZero { .. } => pop_word(stack)?,
            Event::Goto { .. } => {}
            Event::Return => self.check_result_on_stack(stack, &format!("bci {}", bci))?,
            Event::GetField { ty, .. } => {
                pop_word(stack)?;
                stack.push(ty);
            }
            Event::PutField { ty, .. } => {
                pop_sized(stack, ty)?;
                pop_word(stack)?;
            }
            Event::ArrayLoad { ty } => {
                pop_word(stack)?;
                pop_word(stack)?;
                stack.push(ty);
            }
            Event::ArrayStore { ty } => {
                pop_sized(stack, ty)?;
                pop_word(stack)?;
                pop_word(stack)?;
            }
            Event::ArrayLength => {
                pop_word(stack)?;
                stack.push(ValueType::Int);
            }
            Event::InvokeStatic { arg_words, result, .. }
            | Event::InvokeVirtual { arg_words, result, .. } => {
                let mut remaining = arg_words as usize;
                while remaining > 0 {
                    let v = pop(stack)?;
                    if v.words() > remaining {
                        return Err(format!("bci {}: argument straddles the call boundary", bci));
                    }
                    remaining -= v.words();
                }
                if let Some(ty) = result.value_type() {
                    stack.push(ty);
                }
            }
            Event::CheckCast { .. } => {
                if stack.is_empty() {
                    return Err(format!("bci {}: operand stack underflow", bci));
                }
            }
            Event::InstanceOf { .. } => {
                pop_word(stack)?;
                stack.push(ValueType::Int);
            }
            Event::Throw => pop_word(stack)?,
        }
        let depth: usize = stack.iter().map(|t| t.words()).sum();
        if depth > self.max_stack as usize {
            return Err(format!(
                "bci {}: operand stack depth {} exceeds max_stack {}",
                bci, depth, self.max_stack
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_int_overflow_semantics() {
        assert_eq!(BinOp::Div.fold_int(i32::MIN, -1), Some(i32::MIN));
        assert_eq!(BinOp::Rem.fold_int(i32::MIN, -1), Some(0));
        assert_eq!(BinOp::Div.fold_int(7, 0), None);
        assert_eq!(BinOp::Rem.fold_int(7, 0), None);
        assert_eq!(BinOp::Add.fold_int(i32::MAX, 1), Some(i32::MIN));
        assert_eq!(BinOp::Mul.fold_int(1 << 30, 4), Some(0));
    }

    #[test]
    fn test_fold_long_overflow_semantics() {
        assert_eq!(BinOp::Div.fold_long(i64::MIN, -1), Some(i64::MIN));
        assert_eq!(BinOp::Rem.fold_long(i64::MIN, -1), Some(0));
        assert_eq!(BinOp::Div.fold_long(1, 0), None);
        assert_eq!(BinOp::Sub.fold_long(i64::MIN, 1), Some(i64::MAX));
        assert_eq!(BinOp::Ushr.fold_long(-1, 32), Some(0xFFFF_FFFF));
    }

    #[test]
    fn test_condition_negate_roundtrip() {
        for c in [
            Condition::Eq,
            Condition::Ne,
            Condition::Lt,
            Condition::Ge,
            Condition::Gt,
            Condition::Le,
        ] {
            assert_eq!(c.negate().negate(), c);
            assert_ne!(c.eval_i64(1, 2), c.negate().eval_i64(1, 2));
        }
    }

    #[test]
    fn test_predecessor_counts() {
        // 0: push, 1: if -> 3, 2: goto 4, 3: push, 4: return
        let m = Method {
            name: "t".into(),
            locals: 0,
            max_stack: 2,
            arg_words: 0,
            result: ResultKind::Void,
            events: vec![
                Event::PushInt(0),
                Event::IfZero { cond: Condition::Eq, target: 3 },
                Event::Goto { target: 4 },
                Event::PushInt(1),
                Event::Return,
            ],
            handlers: vec![],
        };
        let counts = m.predecessor_counts();
        assert_eq!(counts[0], 1);
        assert_eq!(counts[3], 1); // branch from 1 only; the goto at 2 cannot fall through
        assert_eq!(counts[4], 2); // goto from 2 plus fall-through from 3
    }

    #[test]
    fn test_validate_rejects_understated_max_stack() {
        let m = Method {
            name: "t".into(),
            locals: 0,
            max_stack: 1,
            arg_words: 0,
            result: ResultKind::Void,
            events: vec![
                Event::PushInt(1),
                Event::PushInt(2),
                Event::Pop,
                Event::Pop,
                Event::Return,
            ],
            handlers: vec![],
        };
        let err = m.validate().unwrap_err();
        assert!(err.contains("max_stack"), "{}", err);
    }

    #[test]
    fn test_validate_rejects_stack_underflow() {
        let m = Method {
            name: "t".into(),
            locals: 0,
            max_stack: 1,
            arg_words: 0,
            result: ResultKind::Void,
            events: vec![Event::Pop, Event::Return],
            handlers: vec![],
        };
        let err = m.validate().unwrap_err();
        assert!(err.contains("underflow"), "{}", err);
    }

    #[test]
    fn test_validate_rejects_mismatched_join_depths() {
        // 0: push, 1: ifzero -> 3, 2: push, 3: return
        // bci 3 sees depth 0 from the branch and depth 1 from fall-through
        let m = Method {
            name: "t".into(),
            locals: 0,
            max_stack: 2,
            arg_words: 0,
            result: ResultKind::Void,
            events: vec![
                Event::PushInt(0),
                Event::IfZero { cond: Condition::Eq, target: 3 },
                Event::PushInt(1),
                Event::Return,
            ],
            handlers: vec![],
        };
        let err = m.validate().unwrap_err();
        assert!(err.contains("join"), "{}", err);
    }

    #[test]
    fn test_validate_accepts_fall_off_end_with_result() {
        let m = Method {
            name: "t".into(),
            locals: 0,
            max_stack: 1,
            arg_words: 0,
            result: ResultKind::Int,
            events: vec![Event::PushInt(7)],
            handlers: vec![],
        };
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_result_at_method_end() {
        let m = Method {
            name: "t".into(),
            locals: 0,
            max_stack: 1,
            arg_words: 0,
            result: ResultKind::Int,
            events: vec![Event::PushInt(7), Event::Pop],
            handlers: vec![],
        };
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_target() {
        let m = Method {
            name: "t".into(),
            locals: 0,
            max_stack: 1,
            arg_words: 0,
            result: ResultKind::Void,
            events: vec![Event::Goto { target: 9 }],
            handlers: vec![],
        };
        assert!(m.validate().is_err());
    }
}
