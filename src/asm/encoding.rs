//! Instruction encoding for the portable 32-bit target.
//!
//! This module is the single place that knows how instructions are laid out
//! in bits. Everything above it (assembler, code generator, frames) speaks
//! in terms of registers, operands and labels. A port to a different target
//! replaces this module and the range constants it exports.
//!
//! All instructions are 32-bit words, little-endian in the code buffer.
//! Layout, top six bits are the opcode:
//!
//! - `ALU_RR`:  op[25:21] rd[20:17] rn[16:13] rm[12:9]
//! - `ALU_IMM`: op[25:21] rd[20:17] rn[16:13] simm13[12:0]
//! - `MOVW`:    rd[25:22] simm22[21:0]
//! - `LDW`:     rd[25:22] rn[21:18] simm18[17:0]   (byte offset; rn=PC is a
//!   literal load and is patchable)
//! - `STW`:     rs[25:22] rn[21:18] simm18[17:0]
//! - `BC`:      cond[25:22] simm19[18:0]           (word offset, patchable)
//! - `B`:       simm24[23:0]                       (word offset, patchable)
//! - `CALL`:    routine[15:0]                      (routine-table call)
//! - `RET`, `NOP`: no operands

use std::fmt;

/// General-purpose registers.
///
/// R0-R7 are allocatable. FP is the frame base (locals and operand stack
/// live at `[FP + 4*slot]`), TMP is the conformance/materialization scratch,
/// RT points at the runtime state block (stack limit, tick cell, routine
/// table), LR is the link register and PC is only legal as a literal-load
/// base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    R4 = 4,
    R5 = 5,
    R6 = 6,
    R7 = 7,
    Fp = 8,
    Tmp = 9,
    Rt = 10,
    Lr = 14,
    Pc = 15,
}

/// Registers the frame allocator may hand out.
pub const ALLOCATABLE: [Reg; 8] = [
    Reg::R0,
    Reg::R1,
    Reg::R2,
    Reg::R3,
    Reg::R4,
    Reg::R5,
    Reg::R6,
    Reg::R7,
];

impl Reg {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Reg> {
        Some(match code {
            0 => Reg::R0,
            1 => Reg::R1,
            2 => Reg::R2,
            3 => Reg::R3,
            4 => Reg::R4,
            5 => Reg::R5,
            6 => Reg::R6,
            7 => Reg::R7,
            8 => Reg::Fp,
            9 => Reg::Tmp,
            10 => Reg::Rt,
            14 => Reg::Lr,
            15 => Reg::Pc,
            _ => return None,
        })
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Fp => write!(f, "fp"),
            Reg::Tmp => write!(f, "tmp"),
            Reg::Rt => write!(f, "rt"),
            Reg::Lr => write!(f, "lr"),
            Reg::Pc => write!(f, "pc"),
            r => write!(f, "r{}", r.code()),
        }
    }
}

/// ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AluOp {
    Add = 0,
    Adc = 1,
    Sub = 2,
    Sbc = 3,
    /// Reverse subtract: `rd = operand - rn`. This is what makes
    /// immediate-left subtraction cheap.
    Rsb = 4,
    Mul = 5,
    Div = 6,
    Rem = 7,
    And = 8,
    Orr = 9,
    Eor = 10,
    Lsl = 11,
    Lsr = 12,
    Asr = 13,
    Min = 14,
    Max = 15,
    /// `rd = operand` (rn ignored).
    Mov = 16,
    /// Compare, sets flags only (rd ignored).
    Cmp = 17,
}

impl AluOp {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<AluOp> {
        Some(match code {
            0 => AluOp::Add,
            1 => AluOp::Adc,
            2 => AluOp::Sub,
            3 => AluOp::Sbc,
            4 => AluOp::Rsb,
            5 => AluOp::Mul,
            6 => AluOp::Div,
            7 => AluOp::Rem,
            8 => AluOp::And,
            9 => AluOp::Orr,
            10 => AluOp::Eor,
            11 => AluOp::Lsl,
            12 => AluOp::Lsr,
            13 => AluOp::Asr,
            14 => AluOp::Min,
            15 => AluOp::Max,
            16 => AluOp::Mov,
            17 => AluOp::Cmp,
            _ => return None,
        })
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Adc => "adc",
            AluOp::Sub => "sub",
            AluOp::Sbc => "sbc",
            AluOp::Rsb => "rsb",
            AluOp::Mul => "mul",
            AluOp::Div => "div",
            AluOp::Rem => "rem",
            AluOp::And => "and",
            AluOp::Orr => "orr",
            AluOp::Eor => "eor",
            AluOp::Lsl => "lsl",
            AluOp::Lsr => "lsr",
            AluOp::Asr => "asr",
            AluOp::Min => "min",
            AluOp::Max => "max",
            AluOp::Mov => "mov",
            AluOp::Cmp => "cmp",
        }
    }
}

/// Branch conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    Lt = 2,
    Ge = 3,
    Gt = 4,
    Le = 5,
    /// Unsigned lower.
    Lo = 6,
    /// Unsigned higher or same.
    Hs = 7,
    Al = 8,
}

impl Cond {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Cond> {
        Some(match code {
            0 => Cond::Eq,
            1 => Cond::Ne,
            2 => Cond::Lt,
            3 => Cond::Ge,
            4 => Cond::Gt,
            5 => Cond::Le,
            6 => Cond::Lo,
            7 => Cond::Hs,
            8 => Cond::Al,
            _ => return None,
        })
    }

    pub fn negate(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Lo => Cond::Hs,
            Cond::Hs => Cond::Lo,
            Cond::Al => Cond::Al,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Cond::Eq => "beq",
            Cond::Ne => "bne",
            Cond::Lt => "blt",
            Cond::Ge => "bge",
            Cond::Gt => "bgt",
            Cond::Le => "ble",
            Cond::Lo => "blo",
            Cond::Hs => "bhs",
            Cond::Al => "b",
        }
    }
}

// Opcodes (top six bits).
const OP_ALU_RR: u32 = 0x01;
const OP_ALU_IMM: u32 = 0x02;
const OP_MOVW: u32 = 0x03;
const OP_LDW: u32 = 0x04;
const OP_STW: u32 = 0x05;
const OP_BC: u32 = 0x06;
const OP_B: u32 = 0x07;
const OP_CALL: u32 = 0x08;
const OP_RET: u32 = 0x09;
const OP_NOP: u32 = 0x0A;

/// Addressing limits, in the units the fields use.
pub const ALU_IMM_BITS: u32 = 13;
pub const MOVW_IMM_BITS: u32 = 22;
pub const LOAD_OFFSET_BITS: u32 = 18;
pub const COND_BRANCH_BITS: u32 = 19;
pub const BRANCH_BITS: u32 = 24;

/// Maximum forward byte distance a literal load can reach.
pub const MAX_LITERAL_DISTANCE_BYTES: usize = (1 << (LOAD_OFFSET_BITS - 1)) - 4;
/// Maximum byte distance a conditional branch can span.
pub const MAX_COND_BRANCH_BYTES: usize = ((1 << (COND_BRANCH_BITS - 1)) - 1) * 4;
/// Maximum byte distance an unconditional branch can span.
pub const MAX_BRANCH_BYTES: usize = ((1 << (BRANCH_BITS - 1)) - 1) * 4;

/// True if `value` fits a signed field of `bits` bits.
pub fn fits_simm(value: i64, bits: u32) -> bool {
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    value >= min && value <= max
}

fn field(value: i32, bits: u32) -> u32 {
    (value as u32) & ((1u32 << bits) - 1)
}

fn sext(raw: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((raw << shift) as i32) >> shift
}

pub fn alu_rr(op: AluOp, rd: Reg, rn: Reg, rm: Reg) -> u32 {
    (OP_ALU_RR << 26)
        | ((op.code() as u32) << 21)
        | ((rd.code() as u32) << 17)
        | ((rn.code() as u32) << 13)
        | ((rm.code() as u32) << 9)
}

/// Returns `None` when the immediate does not fit the 13-bit field.
pub fn alu_imm(op: AluOp, rd: Reg, rn: Reg, imm: i32) -> Option<u32> {
    if !fits_simm(imm as i64, ALU_IMM_BITS) {
        return None;
    }
    Some(
        (OP_ALU_IMM << 26)
            | ((op.code() as u32) << 21)
            | ((rd.code() as u32) << 17)
            | ((rn.code() as u32) << 13)
            | field(imm, ALU_IMM_BITS),
    )
}

/// Returns `None` when the immediate does not fit 22 signed bits; the caller
/// falls back to a literal-pool load.
pub fn mov_imm(rd: Reg, imm: i32) -> Option<u32> {
    if !fits_simm(imm as i64, MOVW_IMM_BITS) {
        return None;
    }
    Some((OP_MOVW << 26) | ((rd.code() as u32) << 22) | field(imm, MOVW_IMM_BITS))
}

pub fn ldw(rd: Reg, base: Reg, offset: i32) -> u32 {
    debug_assert!(fits_simm(offset as i64, LOAD_OFFSET_BITS));
    (OP_LDW << 26)
        | ((rd.code() as u32) << 22)
        | ((base.code() as u32) << 18)
        | field(offset, LOAD_OFFSET_BITS)
}

pub fn stw(rs: Reg, base: Reg, offset: i32) -> u32 {
    debug_assert!(fits_simm(offset as i64, LOAD_OFFSET_BITS));
    (OP_STW << 26)
        | ((rs.code() as u32) << 22)
        | ((base.code() as u32) << 18)
        | field(offset, LOAD_OFFSET_BITS)
}

/// Conditional branch with a word offset (relative, in instruction words).
pub fn bc(cond: Cond, word_offset: i32) -> u32 {
    debug_assert!(fits_simm(word_offset as i64, COND_BRANCH_BITS));
    (OP_BC << 26) | ((cond.code() as u32) << 22) | field(word_offset, COND_BRANCH_BITS)
}

pub fn b(word_offset: i32) -> u32 {
    debug_assert!(fits_simm(word_offset as i64, BRANCH_BITS));
    (OP_B << 26) | field(word_offset, BRANCH_BITS)
}

pub fn call(routine: u16) -> u32 {
    (OP_CALL << 26) | routine as u32
}

pub fn ret() -> u32 {
    OP_RET << 26
}

pub fn nop() -> u32 {
    OP_NOP << 26
}

/// How an instruction waiting on a label gets patched once the label binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// Conditional branch: signed word delta in the 19-bit field.
    CondBranch,
    /// Unconditional branch: signed word delta in the 24-bit field.
    Branch,
    /// PC-relative load: signed byte delta in the 18-bit field.
    LoadOffset,
}

/// Classify a linked instruction word for patching. Returns `None` for
/// words that cannot legally sit on a label chain.
pub fn patch_kind(word: u32) -> Option<PatchKind> {
    match word >> 26 {
        OP_BC => Some(PatchKind::CondBranch),
        OP_B => Some(PatchKind::Branch),
        OP_LDW if (word >> 18) & 0xF == Reg::Pc.code() as u32 => Some(PatchKind::LoadOffset),
        _ => None,
    }
}

/// Read the raw chain-link field of a linked instruction.
pub fn chain_link(word: u32) -> u32 {
    match patch_kind(word) {
        Some(PatchKind::CondBranch) => word & ((1 << COND_BRANCH_BITS) - 1),
        Some(PatchKind::Branch) => word & ((1 << BRANCH_BITS) - 1),
        Some(PatchKind::LoadOffset) => word & ((1 << LOAD_OFFSET_BITS) - 1),
        None => 0,
    }
}

/// Write the raw chain-link field of a linked instruction.
pub fn with_chain_link(word: u32, link: u32) -> u32 {
    let (mask, val) = match patch_kind(word) {
        Some(PatchKind::CondBranch) => ((1u32 << COND_BRANCH_BITS) - 1, link),
        Some(PatchKind::Branch) => ((1u32 << BRANCH_BITS) - 1, link),
        Some(PatchKind::LoadOffset) => ((1u32 << LOAD_OFFSET_BITS) - 1, link),
        None => return word,
    };
    debug_assert!(val <= mask);
    (word & !mask) | val
}

/// Patch a chained instruction at word position `site` to target word
/// position `target`. Returns `None` when the distance exceeds the field.
pub fn patch(word: u32, site: usize, target: usize) -> Option<u32> {
    let delta_words = target as i64 - site as i64;
    let (mask, bits, value) = match patch_kind(word)? {
        PatchKind::CondBranch => (
            (1u32 << COND_BRANCH_BITS) - 1,
            COND_BRANCH_BITS,
            delta_words,
        ),
        PatchKind::Branch => ((1u32 << BRANCH_BITS) - 1, BRANCH_BITS, delta_words),
        PatchKind::LoadOffset => (
            (1u32 << LOAD_OFFSET_BITS) - 1,
            LOAD_OFFSET_BITS,
            delta_words * 4,
        ),
    };
    if !fits_simm(value, bits) {
        return None;
    }
    Some((word & !mask) | ((value as u32) & mask))
}

/// A decoded instruction, for tests and disassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    AluRr { op: AluOp, rd: Reg, rn: Reg, rm: Reg },
    AluImm { op: AluOp, rd: Reg, rn: Reg, imm: i32 },
    MovImm { rd: Reg, imm: i32 },
    Load { rd: Reg, base: Reg, offset: i32 },
    Store { rs: Reg, base: Reg, offset: i32 },
    CondBranch { cond: Cond, word_offset: i32 },
    Branch { word_offset: i32 },
    Call { routine: u16 },
    Ret,
    Nop,
}

pub fn decode(word: u32) -> Option<Instr> {
    let reg = |c: u32| Reg::from_code((c & 0xF) as u8);
    Some(match word >> 26 {
        OP_ALU_RR => Instr::AluRr {
            op: AluOp::from_code(((word >> 21) & 0x1F) as u8)?,
            rd: reg(word >> 17)?,
            rn: reg(word >> 13)?,
            rm: reg(word >> 9)?,
        },
        OP_ALU_IMM => Instr::AluImm {
            op: AluOp::from_code(((word >> 21) & 0x1F) as u8)?,
            rd: reg(word >> 17)?,
            rn: reg(word >> 13)?,
            imm: sext(word & 0x1FFF, ALU_IMM_BITS),
        },
        OP_MOVW => Instr::MovImm {
            rd: reg(word >> 22)?,
            imm: sext(word & 0x3F_FFFF, MOVW_IMM_BITS),
        },
        OP_LDW => Instr::Load {
            rd: reg(word >> 22)?,
            base: reg(word >> 18)?,
            offset: sext(word & 0x3_FFFF, LOAD_OFFSET_BITS),
        },
        OP_STW => Instr::Store {
            rs: reg(word >> 22)?,
            base: reg(word >> 18)?,
            offset: sext(word & 0x3_FFFF, LOAD_OFFSET_BITS),
        },
        OP_BC => Instr::CondBranch {
            cond: Cond::from_code(((word >> 22) & 0xF) as u8)?,
            word_offset: sext(word & 0x7_FFFF, COND_BRANCH_BITS),
        },
        OP_B => Instr::Branch {
            word_offset: sext(word & 0xFF_FFFF, BRANCH_BITS),
        },
        OP_CALL => Instr::Call {
            routine: (word & 0xFFFF) as u16,
        },
        OP_RET => Instr::Ret,
        OP_NOP => Instr::Nop,
        _ => return None,
    })
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::AluRr { op: AluOp::Mov, rd, rm, .. } => write!(f, "mov {}, {}", rd, rm),
            Instr::AluRr { op: AluOp::Cmp, rn, rm, .. } => write!(f, "cmp {}, {}", rn, rm),
            Instr::AluRr { op, rd, rn, rm } => {
                write!(f, "{} {}, {}, {}", op.mnemonic(), rd, rn, rm)
            }
            Instr::AluImm { op: AluOp::Mov, rd, imm, .. } => write!(f, "mov {}, #{}", rd, imm),
            Instr::AluImm { op: AluOp::Cmp, rn, imm, .. } => write!(f, "cmp {}, #{}", rn, imm),
            Instr::AluImm { op, rd, rn, imm } => {
                write!(f, "{} {}, {}, #{}", op.mnemonic(), rd, rn, imm)
            }
            Instr::MovImm { rd, imm } => write!(f, "movw {}, #{}", rd, imm),
            Instr::Load { rd, base, offset } => write!(f, "ldw {}, [{}, #{}]", rd, base, offset),
            Instr::Store { rs, base, offset } => write!(f, "stw {}, [{}, #{}]", rs, base, offset),
            Instr::CondBranch { cond, word_offset } => {
                write!(f, "{} .{:+}", cond.mnemonic(), word_offset)
            }
            Instr::Branch { word_offset } => write!(f, "b .{:+}", word_offset),
            Instr::Call { routine } => write!(f, "call rt[{}]", routine),
            Instr::Ret => write!(f, "ret"),
            Instr::Nop => write!(f, "nop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alu_roundtrip() {
        let w = alu_rr(AluOp::Add, Reg::R0, Reg::R1, Reg::R2);
        assert_eq!(
            decode(w),
            Some(Instr::AluRr { op: AluOp::Add, rd: Reg::R0, rn: Reg::R1, rm: Reg::R2 })
        );

        let w = alu_imm(AluOp::Sub, Reg::R3, Reg::R3, -7).unwrap();
        assert_eq!(
            decode(w),
            Some(Instr::AluImm { op: AluOp::Sub, rd: Reg::R3, rn: Reg::R3, imm: -7 })
        );
    }

    #[test]
    fn test_alu_imm_range() {
        assert!(alu_imm(AluOp::Add, Reg::R0, Reg::R0, 4095).is_some());
        assert!(alu_imm(AluOp::Add, Reg::R0, Reg::R0, 4096).is_none());
        assert!(alu_imm(AluOp::Add, Reg::R0, Reg::R0, -4096).is_some());
        assert!(alu_imm(AluOp::Add, Reg::R0, Reg::R0, -4097).is_none());
    }

    #[test]
    fn test_mov_imm_range() {
        assert!(mov_imm(Reg::R0, (1 << 21) - 1).is_some());
        assert!(mov_imm(Reg::R0, 1 << 21).is_none());
        let w = mov_imm(Reg::R5, -1234).unwrap();
        assert_eq!(decode(w), Some(Instr::MovImm { rd: Reg::R5, imm: -1234 }));
    }

    #[test]
    fn test_memory_roundtrip() {
        let w = ldw(Reg::R1, Reg::Fp, 36);
        assert_eq!(decode(w), Some(Instr::Load { rd: Reg::R1, base: Reg::Fp, offset: 36 }));
        let w = stw(Reg::R2, Reg::Fp, -8);
        assert_eq!(decode(w), Some(Instr::Store { rs: Reg::R2, base: Reg::Fp, offset: -8 }));
    }

    #[test]
    fn test_branch_roundtrip() {
        let w = bc(Cond::Ne, -5);
        assert_eq!(decode(w), Some(Instr::CondBranch { cond: Cond::Ne, word_offset: -5 }));
        let w = b(1000);
        assert_eq!(decode(w), Some(Instr::Branch { word_offset: 1000 }));
    }

    #[test]
    fn test_patch_kinds() {
        assert_eq!(patch_kind(bc(Cond::Eq, 0)), Some(PatchKind::CondBranch));
        assert_eq!(patch_kind(b(0)), Some(PatchKind::Branch));
        assert_eq!(patch_kind(ldw(Reg::R0, Reg::Pc, 0)), Some(PatchKind::LoadOffset));
        assert_eq!(patch_kind(ldw(Reg::R0, Reg::Fp, 0)), None);
        assert_eq!(patch_kind(ret()), None);
    }

    #[test]
    fn test_chain_link_threading() {
        let w = bc(Cond::Lt, 0);
        let linked = with_chain_link(w, 42);
        assert_eq!(chain_link(linked), 42);
        // the opcode and condition survive the link
        assert_eq!(patch_kind(linked), Some(PatchKind::CondBranch));
    }

    #[test]
    fn test_patch_in_and_out_of_range() {
        let w = bc(Cond::Eq, 0);
        let patched = patch(w, 10, 14).unwrap();
        assert_eq!(
            decode(patched),
            Some(Instr::CondBranch { cond: Cond::Eq, word_offset: 4 })
        );
        // out of range for the 19-bit field
        assert!(patch(w, 0, 1 << 20).is_none());

        let l = ldw(Reg::R3, Reg::Pc, 0);
        let patched = patch(l, 4, 10).unwrap();
        assert_eq!(
            decode(patched),
            Some(Instr::Load { rd: Reg::R3, base: Reg::Pc, offset: 24 })
        );
    }

    #[test]
    fn test_negate_cond() {
        assert_eq!(Cond::Eq.negate(), Cond::Ne);
        assert_eq!(Cond::Lt.negate(), Cond::Ge);
        assert_eq!(Cond::Lo.negate(), Cond::Hs);
    }
}
