//! Component C (opcode half): the instruction set.
//!
//! The source categories name roughly 540 individual width/operation pairs
//! (`add_i8`, `add_i16`, ..., `cmp_lt_f64`, ...). Spelling each out as its
//! own enum variant would be pure duplication, so each category is one
//! variant parameterized by a [`NumericWidth`]/op enum pair instead; the
//! `eval_arith`/`eval_cmp`/`eval_bitwise`/`eval_cast`/`eval_transcendental`
//! helpers in [`crate::executor`] turn each (op, width) pair back into
//! concrete behavior with an ordinary `match`, rather than hand-duplicating
//! a variant per pair.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// An index into a function's operand-value slot array (one slot per
/// alloca, then one per instruction result, in declaration order).
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[display("%{_0}")]
pub struct OperandIndex(pub u32);

/// An index into one of a function's side-tables (see [`crate::function`]).
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[display("#{_0}")]
pub struct SideTableIndex(pub u32);

/// An index of a basic block within a function, used by jump/branch/switch
/// terminators.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[display("bb{_0}")]
pub struct BlockIndex(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumericWidth {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl NumericWidth {
    pub fn is_float(self) -> bool {
        matches!(self, NumericWidth::F32 | NumericWidth::F64)
    }

    pub fn byte_size(self) -> u64 {
        match self {
            NumericWidth::I8 => 1,
            NumericWidth::I16 => 2,
            NumericWidth::I32 | NumericWidth::F32 => 4,
            NumericWidth::I64 | NumericWidth::F64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntWidth {
    I8,
    I16,
    I32,
    I64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitwiseOp {
    And,
    Or,
    Xor,
    Shl,
    ShrSigned,
    ShrUnsigned,
    PopCount,
    LeadingZeros,
    TrailingZeros,
    ByteSwap,
    BitReverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TranscendentalOp {
    Exp,
    Log,
    Sqrt,
    Cbrt,
    Sin,
    Cos,
    Tan,
    Sinh,
    Cosh,
    Tanh,
    Hypot,
}

/// Sign/size conversions between numeric widths. `IntToFloat`/`FloatToInt`
/// carry their own signedness since the bit pattern interpretation differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CastOp {
    ZeroExtend,
    SignExtend,
    Truncate,
    IntToFloatSigned,
    IntToFloatUnsigned,
    FloatToIntSigned,
    FloatToIntUnsigned,
    FloatExtend,
    FloatTruncate,
    Bitcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endianness {
    Little,
    Big,
}

/// One argument passed to a direct or indirect call, indexed into the
/// caller's operand-value slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operand(pub OperandIndex);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    // --- constants ---
    ConstI1 { dst: OperandIndex, value: bool },
    ConstI8 { dst: OperandIndex, value: u8 },
    ConstI16 { dst: OperandIndex, value: u16 },
    ConstI32 { dst: OperandIndex, value: u32 },
    ConstI64 { dst: OperandIndex, value: u64 },
    ConstF32 { dst: OperandIndex, value: f32 },
    ConstF64 { dst: OperandIndex, value: f64 },

    // --- memory access ---
    Load { dst: OperandIndex, addr: OperandIndex, width: NumericWidth, endianness: Endianness },
    Store { addr: OperandIndex, value: OperandIndex, width: NumericWidth, endianness: Endianness },

    // --- numeric ops, one variant per category, generic over width ---
    Arith { dst: OperandIndex, lhs: OperandIndex, rhs: OperandIndex, op: ArithOp, width: NumericWidth, signed: bool, checked: bool },
    Cmp { dst: OperandIndex, lhs: OperandIndex, rhs: OperandIndex, op: CmpOp, width: NumericWidth, signed: bool },
    Bitwise { dst: OperandIndex, lhs: OperandIndex, rhs: Option<OperandIndex>, op: BitwiseOp, width: IntWidth },
    Cast { dst: OperandIndex, src: OperandIndex, op: CastOp, from: NumericWidth, to: NumericWidth },
    Transcendental { dst: OperandIndex, src: OperandIndex, op: TranscendentalOp, width: NumericWidth, checked: bool },

    // --- address formation ---
    Gep { dst: OperandIndex, base: OperandIndex, member_index: u32, side_table: SideTableIndex },
    ArrayGep { dst: OperandIndex, base: OperandIndex, index: OperandIndex, index_signed: bool, side_table: SideTableIndex },
    PointerAdd { dst: OperandIndex, base: OperandIndex, count: OperandIndex, count_signed: bool, side_table: SideTableIndex },
    PointerDiff { dst: OperandIndex, lhs: OperandIndex, rhs: OperandIndex, side_table: SideTableIndex },
    PointerCmp { dst: OperandIndex, lhs: OperandIndex, rhs: OperandIndex, op: CmpOp },

    // --- bulk memory ---
    MemCopy { dst: OperandIndex, src: OperandIndex, len_bytes: u64 },
    MemSetZero { dst: OperandIndex, len_bytes: u64 },
    CopyValues { dst: OperandIndex, src: OperandIndex, side_table: SideTableIndex },

    // --- aggregates ---
    ExtractValue { dst: OperandIndex, aggregate: OperandIndex, member_index: u32 },
    InsertValue { dst: OperandIndex, aggregate: OperandIndex, member_index: u32, value: OperandIndex },

    // --- lifetime ---
    LifetimeStart { alloca: OperandIndex },
    LifetimeEnd { alloca: OperandIndex },

    // --- heap ---
    Malloc { dst: OperandIndex, elem_size: u64, count: OperandIndex },
    Free { addr: OperandIndex },

    // --- runtime checks ---
    CheckArrayBounds { index: OperandIndex, index_signed: bool, side_table: SideTableIndex },
    CheckOptionalGet { discriminant: OperandIndex, side_table: SideTableIndex },
    CheckSliceConstruction { addr: OperandIndex, len: OperandIndex, side_table: SideTableIndex },
    CheckStringConstruction { addr: OperandIndex, len: OperandIndex, side_table: SideTableIndex },
    CheckFloatOrdering { lhs: OperandIndex, rhs: OperandIndex, side_table: SideTableIndex },

    // --- control flow ---
    Call { dst: Option<OperandIndex>, function: crate::common::Id, args: SideTableIndex },
    CallIndirect { dst: Option<OperandIndex>, target: OperandIndex, args: SideTableIndex },
    Jump { target: BlockIndex },
    Branch { cond: OperandIndex, if_true: BlockIndex, if_false: BlockIndex },
    SwitchInt { value: OperandIndex, side_table: SideTableIndex, default: BlockIndex },
    SwitchStr { value: OperandIndex, side_table: SideTableIndex, default: BlockIndex },
    Return { value: Option<OperandIndex> },
    Unreachable,

    // --- diagnostics ---
    Error { side_table: SideTableIndex },
    Print { value: OperandIndex },
    DiagnosticStr { message: OperandIndex, side_table: SideTableIndex },
    IsOptionSet { dst: OperandIndex, option_name: crate::common::Id },
}

impl Instruction {
    /// Terminators end a basic block; every other instruction falls
    /// through to the next one in sequence.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Jump { .. }
                | Instruction::Branch { .. }
                | Instruction::SwitchInt { .. }
                | Instruction::SwitchStr { .. }
                | Instruction::Return { .. }
                | Instruction::Unreachable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_control_flow_variants_are_terminators() {
        let ret = Instruction::Return { value: None };
        let add = Instruction::Arith {
            dst: OperandIndex(0),
            lhs: OperandIndex(1),
            rhs: OperandIndex(2),
            op: ArithOp::Add,
            width: NumericWidth::I32,
            signed: true,
            checked: false,
        };
        assert!(ret.is_terminator());
        assert!(!add.is_terminator());
    }
}
