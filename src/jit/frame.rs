//! The virtual stack frame.
//!
//! Every local and operand-stack slot of the method being compiled is
//! modeled abstractly: a slot's authoritative value may live in frame memory
//! (`[FP + 4*slot]`), in a register, or be a compile-time immediate. No
//! machine code moves a value until something forces it: a merge, a call, a
//! spill, or an operation that needs a register operand.
//!
//! `conform_to` is the merge algorithm run at every control-flow join: it
//! emits the minimal store/move sequence that makes this frame's layout
//! structurally identical to the join target's, after which a single
//! unconditional branch is valid.

use crate::asm::encoding::ALLOCATABLE;
use crate::asm::{AluOp, AsmError, BinaryAssembler, Reg};
use crate::vm::bytecode::ValueType;
use crate::vm::refs::{ObjRef, VisitReferences};

/// Value flag: statically known non-null (object slots only).
pub const FLAG_NONNULL: u8 = 0x01;
/// Slot flag: this is the high word of a two-word value.
pub const FLAG_HIGH_WORD: u8 = 0x02;

/// Where an abstract operand lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Cleared slot; no value.
    Absent,
    /// Compile-time constant (both words for two-word types).
    Immediate(i64),
    /// One or two physical registers (low, high).
    Register(Reg, Option<Reg>),
    /// Frame memory at the given slot index.
    Memory(usize),
}

/// An abstract operand as handed between the code generator and the frame.
#[derive(Debug, Clone, Copy)]
pub struct Value {
    pub ty: ValueType,
    pub loc: Location,
    pub flags: u8,
}

impl Value {
    pub fn is_immediate(&self) -> bool {
        matches!(self.loc, Location::Immediate(_))
    }

    pub fn as_immediate(&self) -> Option<i64> {
        match self.loc {
            Location::Immediate(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_nonnull(&self) -> bool {
        self.flags & FLAG_NONNULL != 0
    }
}

/// Coherence between a slot's register/immediate copy and its frame memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// Memory is authoritative; no live copy elsewhere.
    Flushed,
    /// Memory and the cached copy agree.
    Cached,
    /// The cached copy is newer than memory.
    Changed,
}

/// Which kind of cached copy a slot has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Nowhere,
    Immediate,
    Register,
}

/// The persisted per-slot state inside a frame. One word per slot; two-word
/// values use two consecutive slots, the second flagged `FLAG_HIGH_WORD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawLocation {
    pub status: SlotStatus,
    pub place: Place,
    /// Immediate word bits, or a register code.
    pub payload: u32,
    pub ty: ValueType,
    pub flags: u8,
}

impl RawLocation {
    fn vacant() -> Self {
        RawLocation {
            status: SlotStatus::Flushed,
            place: Place::Nowhere,
            payload: 0,
            ty: ValueType::Int,
            flags: 0,
        }
    }

    /// Memory holds a valid copy of the value.
    fn memory_valid(&self) -> bool {
        !matches!(self.status, SlotStatus::Changed)
    }

    pub(crate) fn register(&self) -> Option<Reg> {
        if self.place == Place::Register {
            Reg::from_code(self.payload as u8)
        } else {
            None
        }
    }
}

const NUM_REGS: usize = 16;

/// The abstract frame: `locals + max_stack` slots plus the virtual stack
/// pointer. Cloned per queue element; clones never alias.
#[derive(Clone)]
pub struct VirtualStackFrame {
    slots: Vec<RawLocation>,
    locals: usize,
    /// Index of the next free stack slot (>= locals).
    sp: usize,
    /// Bumped by every whole-frame flush; snapshots with different counts
    /// are not slot-for-slot comparable without re-flushing.
    flush_count: u32,
    /// Register code -> owning slot. At most one slot caches any register.
    reg_owner: [Option<u16>; NUM_REGS],
}

impl VirtualStackFrame {
    /// A fresh frame at method entry: every local is in memory (that is how
    /// the interpreter hands the frame over), the stack is empty.
    pub fn new(locals: usize, max_stack: usize) -> Self {
        VirtualStackFrame {
            slots: vec![RawLocation::vacant(); locals + max_stack],
            locals,
            sp: locals,
            flush_count: 0,
            reg_owner: [None; NUM_REGS],
        }
    }

    pub fn locals(&self) -> usize {
        self.locals
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn stack_depth(&self) -> usize {
        self.sp - self.locals
    }

    pub fn flush_count(&self) -> u32 {
        self.flush_count
    }

    pub fn raw_at(&self, index: usize) -> &RawLocation {
        &self.slots[index]
    }

    /// Byte offset of a slot in frame memory.
    pub fn slot_offset(index: usize) -> i32 {
        (index * 4) as i32
    }

    // ==================== ownership bookkeeping ====================

    fn claim_reg(&mut self, reg: Reg, slot: usize) {
        debug_assert!(self.reg_owner[reg.code() as usize].is_none(), "register double-cached");
        self.reg_owner[reg.code() as usize] = Some(slot as u16);
    }

    fn release_slot_regs(&mut self, index: usize) {
        if let Some(reg) = self.slots[index].register() {
            if self.reg_owner[reg.code() as usize] == Some(index as u16) {
                self.reg_owner[reg.code() as usize] = None;
            }
        }
    }

    fn rebuild_reg_owner(&mut self) {
        self.reg_owner = [None; NUM_REGS];
        for i in 0..self.sp {
            if let Some(reg) = self.slots[i].register() {
                self.reg_owner[reg.code() as usize] = Some(i as u16);
            }
        }
    }

    /// Allocate a free register, spilling the oldest register-resident value
    /// if none is free. `avoid` protects registers the caller is holding
    /// outside any slot (a just-popped operand).
    pub fn alloc_reg(&mut self, asm: &mut BinaryAssembler, avoid: &[Reg]) -> Result<Reg, AsmError> {
        for &reg in &ALLOCATABLE {
            if self.reg_owner[reg.code() as usize].is_none() && !avoid.contains(&reg) {
                return Ok(reg);
            }
        }
        // Spill the lowest-indexed owning slot: locals and deep stack values
        // are the least likely to be needed next.
        let victim = (0..self.sp)
            .find(|&i| {
                self.slots[i]
                    .register()
                    .map(|r| !avoid.contains(&r))
                    .unwrap_or(false)
            })
            .expect("no spillable slot with all registers taken");
        let reg = self.slots[victim].register().unwrap();
        self.spill_slot(victim, asm)?;
        // Spill the pair partner as a unit so two-word values stay uniform.
        if let Some(partner) = self.pair_partner(victim) {
            self.spill_slot(partner, asm)?;
        }
        Ok(reg)
    }

    fn pair_partner(&self, index: usize) -> Option<usize> {
        let slot = &self.slots[index];
        if !slot.ty.is_two_word() {
            return None;
        }
        if slot.flags & FLAG_HIGH_WORD != 0 {
            Some(index - 1)
        } else if index + 1 < self.sp && self.slots[index + 1].flags & FLAG_HIGH_WORD != 0 {
            Some(index + 1)
        } else {
            None
        }
    }

    /// Write a slot's cached copy back to memory and forget it; memory
    /// becomes the only holder.
    fn spill_slot(&mut self, index: usize, asm: &mut BinaryAssembler) -> Result<(), AsmError> {
        self.ensure_memory_valid(index, asm)?;
        self.release_slot_regs(index);
        let slot = &mut self.slots[index];
        slot.place = Place::Nowhere;
        slot.status = SlotStatus::Flushed;
        Ok(())
    }

    /// Make frame memory hold a valid copy of slot `index`.
    pub(crate) fn ensure_memory_valid(
        &mut self,
        index: usize,
        asm: &mut BinaryAssembler,
    ) -> Result<(), AsmError> {
        let slot = self.slots[index];
        if slot.memory_valid() {
            return Ok(());
        }
        match slot.place {
            Place::Register => {
                let reg = slot.register().unwrap();
                asm.store_word(reg, Reg::Fp, Self::slot_offset(index))?;
            }
            Place::Immediate => {
                asm.mov_imm(Reg::Tmp, slot.payload as i32)?;
                asm.store_word(Reg::Tmp, Reg::Fp, Self::slot_offset(index))?;
            }
            Place::Nowhere => {
                debug_assert!(false, "changed slot with no cached copy");
            }
        }
        self.slots[index].status = SlotStatus::Cached;
        Ok(())
    }

    /// Force the whole frame to memory and forget every cached copy. Used
    /// before calls (the runtime walks the frame) and to make snapshots
    /// comparable.
    pub fn flush(&mut self, asm: &mut BinaryAssembler) -> Result<(), AsmError> {
        for i in 0..self.sp {
            self.ensure_memory_valid(i, asm)?;
            self.release_slot_regs(i);
            let slot = &mut self.slots[i];
            slot.place = Place::Nowhere;
            slot.status = SlotStatus::Flushed;
        }
        self.flush_count += 1;
        Ok(())
    }

    // ==================== stack operations ====================

    fn push_raw(&mut self, raw: RawLocation) {
        debug_assert!(self.sp < self.slots.len(), "operand stack overflow");
        if let Some(reg) = raw.register() {
            self.claim_reg(reg, self.sp);
        }
        self.slots[self.sp] = raw;
        self.sp += 1;
    }

    /// Push a compile-time constant.
    pub fn push_immediate(&mut self, ty: ValueType, bits: i64, flags: u8) {
        let lo = RawLocation {
            status: SlotStatus::Changed,
            place: Place::Immediate,
            payload: bits as u32,
            ty,
            flags,
        };
        self.push_raw(lo);
        if ty.is_two_word() {
            self.push_raw(RawLocation {
                payload: (bits >> 32) as u32,
                flags: flags | FLAG_HIGH_WORD,
                ..lo
            });
        }
    }

    /// Push a register-resident value. The registers must be unowned.
    pub fn push_register(&mut self, ty: ValueType, lo: Reg, hi: Option<Reg>, flags: u8) {
        debug_assert_eq!(ty.is_two_word(), hi.is_some());
        self.push_raw(RawLocation {
            status: SlotStatus::Changed,
            place: Place::Register,
            payload: lo.code() as u32,
            ty,
            flags,
        });
        if let Some(hi) = hi {
            self.push_raw(RawLocation {
                status: SlotStatus::Changed,
                place: Place::Register,
                payload: hi.code() as u32,
                ty,
                flags: flags | FLAG_HIGH_WORD,
            });
        }
    }

    /// Pop the top value. Register ownership transfers to the caller (the
    /// registers become temporarily unowned; pass them in `avoid` lists
    /// until consumed).
    pub fn pop(&mut self) -> Value {
        debug_assert!(self.sp > self.locals, "operand stack underflow");
        let top = self.slots[self.sp - 1];
        let words = if top.flags & FLAG_HIGH_WORD != 0 { 2 } else { 1 };
        let base = self.sp - words;
        let lo = self.slots[base];
        let value = Value {
            ty: lo.ty,
            flags: lo.flags & !FLAG_HIGH_WORD,
            loc: match lo.place {
                Place::Immediate => {
                    if words == 2 {
                        Location::Immediate(
                            (lo.payload as u32 as i64) | ((top.payload as i64) << 32),
                        )
                    } else {
                        Location::Immediate(lo.payload as i32 as i64)
                    }
                }
                Place::Register => Location::Register(
                    lo.register().unwrap(),
                    if words == 2 { top.register() } else { None },
                ),
                Place::Nowhere => {
                    if lo.memory_valid() {
                        Location::Memory(base)
                    } else {
                        Location::Absent
                    }
                }
            },
        };
        for i in base..self.sp {
            self.release_slot_regs(i);
            self.slots[i] = RawLocation::vacant();
        }
        self.sp = base;
        value
    }

    /// The abstract operand at `index` without popping.
    pub fn value_at(&self, index: usize) -> Value {
        let lo = self.slots[index];
        let words = lo.ty.words();
        Value {
            ty: lo.ty,
            flags: lo.flags & !FLAG_HIGH_WORD,
            loc: match lo.place {
                Place::Immediate => {
                    if words == 2 {
                        Location::Immediate(
                            (lo.payload as u32 as i64)
                                | ((self.slots[index + 1].payload as i64) << 32),
                        )
                    } else {
                        Location::Immediate(lo.payload as i32 as i64)
                    }
                }
                Place::Register => Location::Register(
                    lo.register().unwrap(),
                    if words == 2 { self.slots[index + 1].register() } else { None },
                ),
                Place::Nowhere => {
                    if lo.memory_valid() {
                        Location::Memory(index)
                    } else {
                        Location::Absent
                    }
                }
            },
        }
    }

    /// Drop any cached copy and any value: the slot becomes dead.
    pub fn clear(&mut self, index: usize) {
        self.release_slot_regs(index);
        self.slots[index] = RawLocation::vacant();
    }

    /// Mark an object slot statically non-null (after an explicit check).
    pub fn set_nonnull(&mut self, index: usize) {
        self.slots[index].flags |= FLAG_NONNULL;
    }

    // ==================== locals ====================

    /// Push a copy of a local. The copy gets its own register when the
    /// local is register- or memory-resident (one slot per register).
    pub fn load_local(
        &mut self,
        index: usize,
        ty: ValueType,
        asm: &mut BinaryAssembler,
    ) -> Result<(), AsmError> {
        let slot = self.slots[index];
        let flags = slot.flags & FLAG_NONNULL;
        match slot.place {
            Place::Immediate => {
                let bits = if ty.is_two_word() {
                    (slot.payload as u32 as i64) | ((self.slots[index + 1].payload as i64) << 32)
                } else {
                    slot.payload as i32 as i64
                };
                self.push_immediate(ty, bits, flags);
            }
            _ => {
                let lo = self.copy_word_to_new_reg(index, asm)?;
                let hi = if ty.is_two_word() {
                    Some(self.copy_word_to_new_reg(index + 1, asm)?)
                } else {
                    None
                };
                self.push_register(ty, lo, hi, flags);
            }
        }
        Ok(())
    }

    fn copy_word_to_new_reg(
        &mut self,
        index: usize,
        asm: &mut BinaryAssembler,
    ) -> Result<Reg, AsmError> {
        let dst = self.alloc_reg(asm, &[])?;
        match self.slots[index].place {
            Place::Register => asm.mov_rr(dst, self.slots[index].register().unwrap())?,
            _ => {
                debug_assert!(self.slots[index].memory_valid());
                asm.load_word(dst, Reg::Fp, Self::slot_offset(index))?;
            }
        }
        Ok(dst)
    }

    /// Pop the stack top into a local.
    pub fn store_local(
        &mut self,
        index: usize,
        ty: ValueType,
        asm: &mut BinaryAssembler,
    ) -> Result<(), AsmError> {
        let value = self.pop();
        debug_assert_eq!(value.ty.words(), ty.words());
        for w in 0..ty.words() {
            self.release_slot_regs(index + w);
            self.slots[index + w] = RawLocation::vacant();
        }
        match value.loc {
            Location::Immediate(bits) => {
                self.slots[index] = RawLocation {
                    status: SlotStatus::Changed,
                    place: Place::Immediate,
                    payload: bits as u32,
                    ty,
                    flags: value.flags,
                };
                if ty.is_two_word() {
                    self.slots[index + 1] = RawLocation {
                        status: SlotStatus::Changed,
                        place: Place::Immediate,
                        payload: (bits >> 32) as u32,
                        ty,
                        flags: value.flags | FLAG_HIGH_WORD,
                    };
                }
            }
            Location::Register(lo, hi) => {
                self.slots[index] = RawLocation {
                    status: SlotStatus::Changed,
                    place: Place::Register,
                    payload: lo.code() as u32,
                    ty,
                    flags: value.flags,
                };
                self.claim_reg(lo, index);
                if let Some(hi) = hi {
                    self.slots[index + 1] = RawLocation {
                        status: SlotStatus::Changed,
                        place: Place::Register,
                        payload: hi.code() as u32,
                        ty,
                        flags: value.flags | FLAG_HIGH_WORD,
                    };
                    self.claim_reg(hi, index + 1);
                }
            }
            Location::Memory(src) => {
                // memory-to-memory copy through the scratch register
                for w in 0..ty.words() {
                    asm.load_word(Reg::Tmp, Reg::Fp, Self::slot_offset(src + w))?;
                    asm.store_word(Reg::Tmp, Reg::Fp, Self::slot_offset(index + w))?;
                    self.slots[index + w] = RawLocation {
                        status: SlotStatus::Flushed,
                        place: Place::Nowhere,
                        payload: 0,
                        ty,
                        flags: if w == 0 { value.flags } else { value.flags | FLAG_HIGH_WORD },
                    };
                }
            }
            Location::Absent => debug_assert!(false, "storing an absent value"),
        }
        Ok(())
    }

    /// Duplicate the stack top (one-word values).
    pub fn dup(&mut self, asm: &mut BinaryAssembler) -> Result<(), AsmError> {
        let top = self.sp - 1;
        debug_assert!(!self.slots[top].ty.is_two_word(), "dup of a two-word value");
        let slot = self.slots[top];
        match slot.place {
            Place::Immediate => {
                self.push_immediate(slot.ty, slot.payload as i32 as i64, slot.flags)
            }
            _ => {
                let reg = self.copy_word_to_new_reg(top, asm)?;
                self.push_register(slot.ty, reg, None, slot.flags & FLAG_NONNULL);
            }
        }
        Ok(())
    }

    /// Materialize a popped value into registers, allocating as needed.
    /// `avoid` lists registers that must not be clobbered by spills.
    pub fn materialize(
        &mut self,
        value: Value,
        asm: &mut BinaryAssembler,
        avoid: &[Reg],
    ) -> Result<(Reg, Option<Reg>), AsmError> {
        match value.loc {
            Location::Register(lo, hi) => Ok((lo, hi)),
            Location::Immediate(bits) => {
                let mut avoid = avoid.to_vec();
                let lo = self.alloc_reg(asm, &avoid)?;
                asm.mov_imm(lo, bits as i32)?;
                if value.ty.is_two_word() {
                    avoid.push(lo);
                    let hi = self.alloc_reg(asm, &avoid)?;
                    asm.mov_imm(hi, (bits >> 32) as i32)?;
                    Ok((lo, Some(hi)))
                } else {
                    Ok((lo, None))
                }
            }
            Location::Memory(slot) => {
                let mut avoid = avoid.to_vec();
                let lo = self.alloc_reg(asm, &avoid)?;
                asm.load_word(lo, Reg::Fp, Self::slot_offset(slot))?;
                if value.ty.is_two_word() {
                    avoid.push(lo);
                    let hi = self.alloc_reg(asm, &avoid)?;
                    asm.load_word(hi, Reg::Fp, Self::slot_offset(slot + 1))?;
                    Ok((lo, Some(hi)))
                } else {
                    Ok((lo, None))
                }
            }
            Location::Absent => {
                debug_assert!(false, "materializing an absent value");
                Err(AsmError::OutOfRange)
            }
        }
    }

    /// True when no slot has a cached copy: frame memory alone describes
    /// the state. This is what makes a site's exception stubs shareable.
    pub fn is_fully_flushed(&self) -> bool {
        self.slots[..self.sp]
            .iter()
            .all(|s| s.status == SlotStatus::Flushed && s.place == Place::Nowhere)
    }

    /// Drop `n` words off the stack without emitting code. Only legal when
    /// the dropped slots carry no unflushed state the caller still needs
    /// (used after calls, where the frame was flushed first).
    pub fn pop_words(&mut self, n: usize) {
        debug_assert!(self.sp >= self.locals + n);
        for _ in 0..n {
            self.sp -= 1;
            self.release_slot_regs(self.sp);
            self.slots[self.sp] = RawLocation::vacant();
        }
    }

    /// Empty the operand stack (exception handler entry).
    pub fn clear_stack(&mut self) {
        self.pop_words(self.sp - self.locals);
    }

    /// A copy of this frame with every slot memory-resident and no cached
    /// copies, as the interpreter would hand it over. Emits nothing: the
    /// values are assumed to already be in memory (OSR entry).
    pub fn flushed_twin(&self) -> VirtualStackFrame {
        let mut twin = self.clone();
        for i in 0..twin.sp {
            let slot = &mut twin.slots[i];
            slot.status = SlotStatus::Flushed;
            slot.place = Place::Nowhere;
            slot.payload = 0;
        }
        twin.reg_owner = [None; NUM_REGS];
        twin
    }

    // ==================== conformance ====================

    /// Emit the code that makes this frame's layout structurally identical
    /// to `target`, so a single branch to the target's label is valid.
    pub fn conform_to(
        &mut self,
        target: &VirtualStackFrame,
        asm: &mut BinaryAssembler,
    ) -> Result<(), AsmError> {
        debug_assert_eq!(self.slots.len(), target.slots.len(), "frame length differs");
        debug_assert_eq!(self.sp, target.sp, "stack depth differs at merge");

        // Snapshots taken across a whole-frame flush are not comparable;
        // re-flush to restore a common baseline.
        if self.flush_count != target.flush_count {
            self.flush(asm)?;
        }

        // Store phase: wherever the target trusts memory, memory must hold
        // the value. Already-flushed sources emit nothing.
        for i in 0..self.sp {
            if target.slots[i].memory_valid() && !self.slots[i].memory_valid() {
                self.ensure_memory_valid(i, asm)?;
            }
        }

        // Register phase: parallel-move resolution. Sources are distinct
        // (one slot per register on our side) and destinations are distinct
        // (same invariant on the target's side), so the register-to-register
        // part is a permutation; cycles break through the scratch register.
        enum Src {
            Reg(Reg),
            Mem(usize),
            Imm(i32),
        }
        struct Move {
            dst: Reg,
            src: Src,
        }
        let mut pending: Vec<Move> = Vec::new();
        for i in 0..self.sp {
            let Some(dst) = target.slots[i].register() else { continue };
            let src = self.slots[i];
            match src.place {
                Place::Register => {
                    let s = src.register().unwrap();
                    if s != dst {
                        pending.push(Move { dst, src: Src::Reg(s) });
                    }
                }
                Place::Immediate => {
                    pending.push(Move { dst, src: Src::Imm(src.payload as i32) })
                }
                Place::Nowhere => {
                    debug_assert!(src.memory_valid(), "merge source value lost");
                    pending.push(Move { dst, src: Src::Mem(i) });
                }
            }
        }
        while !pending.is_empty() {
            let emittable = pending.iter().position(|m| {
                !pending
                    .iter()
                    .any(|o| matches!(o.src, Src::Reg(s) if s == m.dst))
            });
            match emittable {
                Some(idx) => {
                    let m = pending.swap_remove(idx);
                    match m.src {
                        Src::Reg(s) => asm.mov_rr(m.dst, s)?,
                        Src::Mem(slot) => asm.load_word(m.dst, Reg::Fp, Self::slot_offset(slot))?,
                        Src::Imm(v) => asm.mov_imm(m.dst, v)?,
                    }
                }
                None => {
                    // True cycle: park the first destination's current value
                    // in the scratch register and retarget its readers.
                    let parked = pending[0].dst;
                    asm.mov_rr(Reg::Tmp, parked)?;
                    for m in pending.iter_mut() {
                        if matches!(m.src, Src::Reg(s) if s == parked) {
                            m.src = Src::Reg(Reg::Tmp);
                        }
                    }
                }
            }
        }

        // Immediate phase: bit-identical immediates need no code; anything
        // else here means the frames were never mergeable.
        for i in 0..self.sp {
            if target.slots[i].place == Place::Immediate {
                debug_assert!(
                    self.slots[i].place == Place::Immediate
                        && self.slots[i].payload == target.slots[i].payload,
                    "immediate mismatch at merge point"
                );
            }
        }

        // Adopt the target's layout wholesale.
        self.slots.copy_from_slice(&target.slots);
        self.sp = target.sp;
        self.flush_count = target.flush_count;
        self.rebuild_reg_owner();
        Ok(())
    }
}

impl VisitReferences for VirtualStackFrame {
    /// Object constants never sit in frame slots as raw bits; they are
    /// loaded through the literal pool, which owns the handles. The frame
    /// itself therefore has nothing to report, but the contract is kept so
    /// element iteration stays uniform.
    fn visit_refs(&mut self, _visit: &mut dyn FnMut(&mut ObjRef)) {}
}

/// Emit `alu` helpers shared by codegen (register/immediate operand forms).
pub fn emit_alu(
    asm: &mut BinaryAssembler,
    op: AluOp,
    dst: Reg,
    lhs: Reg,
    rhs_reg: Option<Reg>,
    rhs_imm: i32,
) -> Result<(), AsmError> {
    match rhs_reg {
        Some(r) => asm.alu_rr(op, dst, lhs, r),
        None => {
            if asm.alu_imm(op, dst, lhs, rhs_imm)? {
                Ok(())
            } else {
                asm.mov_imm(Reg::Tmp, rhs_imm)?;
                asm.alu_rr(op, dst, lhs, Reg::Tmp)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::encoding::{decode, Instr};
    use crate::config::JitConfig;

    fn asm() -> BinaryAssembler {
        BinaryAssembler::new(&JitConfig::default())
    }

    /// Shadow machine: replays emitted words against architectural state.
    struct Shadow {
        regs: [i64; NUM_REGS],
        mem: Vec<i64>,
    }

    impl Shadow {
        fn new(slots: usize) -> Self {
            Shadow { regs: [i64::MIN; NUM_REGS], mem: vec![i64::MIN; slots] }
        }

        fn replay(&mut self, words: &[u32]) {
            for &w in words {
                match decode(w).expect("conformance emitted an undecodable word") {
                    Instr::AluRr { op: AluOp::Mov, rd, rm, .. } => {
                        self.regs[rd.code() as usize] = self.regs[rm.code() as usize];
                    }
                    Instr::MovImm { rd, imm } => {
                        self.regs[rd.code() as usize] = imm as i64;
                    }
                    Instr::Load { rd, base: Reg::Fp, offset } => {
                        self.regs[rd.code() as usize] = self.mem[offset as usize / 4];
                    }
                    Instr::Store { rs, base: Reg::Fp, offset } => {
                        self.mem[offset as usize / 4] = self.regs[rs.code() as usize];
                    }
                    other => panic!("unexpected instruction in merge code: {}", other),
                }
            }
        }

        /// Load architectural state from a frame layout with known slot
        /// values.
        fn adopt(&mut self, frame: &VirtualStackFrame, values: &[i64]) {
            for i in 0..frame.sp() {
                let raw = frame.raw_at(i);
                if raw.memory_valid() {
                    self.mem[i] = values[i];
                }
                match raw.place {
                    Place::Register => {
                        self.regs[raw.register().unwrap().code() as usize] = values[i];
                    }
                    Place::Immediate => assert_eq!(raw.payload as i32 as i64, values[i]),
                    Place::Nowhere => {}
                }
            }
        }

        /// Check that state satisfies a frame layout with expected values.
        fn check(&self, frame: &VirtualStackFrame, values: &[i64]) {
            for i in 0..frame.sp() {
                let raw = frame.raw_at(i);
                if raw.memory_valid() {
                    assert_eq!(self.mem[i], values[i], "memory mismatch at slot {}", i);
                }
                if let Some(reg) = raw.register() {
                    assert_eq!(
                        self.regs[reg.code() as usize],
                        values[i],
                        "register mismatch at slot {}",
                        i
                    );
                }
            }
        }
    }

    /// Build a frame with three int stack values (10, 11, 12) in the given
    /// shapes, emitting the setup code into a throwaway assembler.
    fn frame_with(shapes: [&str; 3]) -> VirtualStackFrame {
        let mut setup = asm();
        let mut f = VirtualStackFrame::new(0, 8);
        for (i, &shape) in shapes.iter().enumerate() {
            f.push_immediate(ValueType::Int, 10 + i as i64, 0);
            match shape {
                "imm" => {}
                "reg" => {
                    let v = f.pop();
                    let (lo, _) = f.materialize(v, &mut setup, &[]).unwrap();
                    f.push_register(ValueType::Int, lo, None, 0);
                }
                "mem" => {
                    f.ensure_memory_valid(i, &mut setup).unwrap();
                    f.spill_slot(i, &mut setup).unwrap();
                }
                other => panic!("unknown shape {}", other),
            }
        }
        f
    }

    #[test]
    fn test_conform_shadow_model() {
        let values = [10i64, 11, 12];
        let src = frame_with(["reg", "imm", "mem"]);
        let dst = frame_with(["mem", "reg", "reg"]);

        let mut a = asm();
        let mut working = src.clone();
        working.conform_to(&dst, &mut a).unwrap();

        let mut shadow = Shadow::new(8);
        shadow.adopt(&src, &values);
        shadow.replay(a.words());
        shadow.check(&dst, &values);

        // structural equality after the merge
        for i in 0..dst.sp() {
            assert_eq!(working.raw_at(i), dst.raw_at(i), "slot {} layout differs", i);
        }
    }

    #[test]
    fn test_conform_identical_immediates_emit_nothing() {
        let src = frame_with(["imm", "imm", "imm"]);
        let dst = frame_with(["imm", "imm", "imm"]);
        let mut a = asm();
        let mut working = src.clone();
        working.conform_to(&dst, &mut a).unwrap();
        assert!(a.words().is_empty(), "identical immediates must merge silently");
    }

    #[test]
    fn test_conform_flushed_to_flushed_emits_nothing() {
        let src = frame_with(["mem", "mem", "mem"]);
        let dst = frame_with(["mem", "mem", "mem"]);
        let mut a = asm();
        let mut working = src.clone();
        working.conform_to(&dst, &mut a).unwrap();
        assert!(a.words().is_empty(), "flushed-to-flushed must merge silently");
    }

    #[test]
    fn test_conform_register_cycle_uses_scratch() {
        // src: slot0 in r0, slot1 in r1; dst: slot0 in r1, slot1 in r0
        let mut setup = asm();
        let mut src = VirtualStackFrame::new(0, 4);
        src.push_immediate(ValueType::Int, 1, 0);
        let v = src.pop();
        let (r_a, _) = src.materialize(v, &mut setup, &[]).unwrap();
        src.push_register(ValueType::Int, r_a, None, 0);
        src.push_immediate(ValueType::Int, 2, 0);
        let v = src.pop();
        let (r_b, _) = src.materialize(v, &mut setup, &[r_a]).unwrap();
        src.push_register(ValueType::Int, r_b, None, 0);

        let mut dst = src.clone();
        // swap the two registers by hand
        dst.release_slot_regs(0);
        dst.release_slot_regs(1);
        dst.slots[0].payload = r_b.code() as u32;
        dst.slots[1].payload = r_a.code() as u32;
        dst.rebuild_reg_owner();

        let mut a = asm();
        src.conform_to(&dst, &mut a).unwrap();

        let mut shadow = Shadow::new(4);
        shadow.regs[r_a.code() as usize] = 1;
        shadow.regs[r_b.code() as usize] = 2;
        shadow.replay(a.words());
        assert_eq!(shadow.regs[r_b.code() as usize], 1);
        assert_eq!(shadow.regs[r_a.code() as usize], 2);
    }

    #[test]
    fn test_flush_count_mismatch_forces_reflush() {
        let mut a = asm();
        let mut src = frame_with(["reg", "imm", "mem"]);
        let mut dst = src.clone();
        dst.flush(&mut asm()).unwrap();
        src.conform_to(&dst, &mut a).unwrap();
        assert_eq!(src.flush_count(), dst.flush_count());
        for i in 0..dst.sp() {
            assert_eq!(src.raw_at(i), dst.raw_at(i));
        }
    }

    #[test]
    fn test_push_pop_roundtrip_long() {
        let mut f = VirtualStackFrame::new(0, 4);
        f.push_immediate(ValueType::Long, -3_000_000_000, 0);
        assert_eq!(f.stack_depth(), 2);
        let v = f.pop();
        assert_eq!(v.ty, ValueType::Long);
        assert_eq!(v.as_immediate(), Some(-3_000_000_000));
        assert_eq!(f.stack_depth(), 0);
    }

    #[test]
    fn test_spill_when_registers_exhausted() {
        let mut a = asm();
        let mut f = VirtualStackFrame::new(0, 16);
        // fill every allocatable register
        for i in 0..ALLOCATABLE.len() {
            f.push_immediate(ValueType::Int, i as i64, 0);
            let v = f.pop();
            let (lo, _) = f.materialize(v, &mut a, &[]).unwrap();
            f.push_register(ValueType::Int, lo, None, 0);
        }
        let before = a.words().len();
        // the ninth register forces a spill: a store must appear
        f.push_immediate(ValueType::Int, 99, 0);
        let v = f.pop();
        let (_, _) = f.materialize(v, &mut a, &[]).unwrap();
        let emitted = &a.words()[before..];
        assert!(
            emitted.iter().any(|&w| matches!(decode(w), Some(Instr::Store { .. }))),
            "spill must write the victim back to frame memory"
        );
    }

    #[test]
    fn test_clear_releases_register() {
        let mut a = asm();
        let mut f = VirtualStackFrame::new(1, 4);
        f.load_local(0, ValueType::Int, &mut a).unwrap();
        let owned_before: usize = f.reg_owner.iter().flatten().count();
        assert_eq!(owned_before, 1);
        f.clear(f.sp() - 1);
        assert_eq!(f.reg_owner.iter().flatten().count(), 0);
    }
}
