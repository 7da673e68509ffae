//! Instruction definitions.
//!
//! One [`Instr`] record covers scalar and vector code. Generic arithmetic
//! ([`Op::Binary`], [`Op::Unary`], [`Op::Convert`]) becomes a vector
//! operation simply by carrying a [`VecShape`]; operations that only exist
//! in SIMD form (replicate, reduce, halving add, SAD, ...) have their own
//! variants. This keeps the sequential and vector synthesis paths on a
//! single rewrite routine.

use smallvec::SmallVec;

use super::arena::Id;
use super::graph::BlockId;
use super::types::DataType;

/// Instruction identifier.
pub type InstrId = Id<Instr>;

/// Operand list. Three inline slots cover everything but calls and phis
/// with many predecessors.
pub type Inputs = SmallVec<[InstrId; 3]>;

// =============================================================================
// Operator Kinds
// =============================================================================

/// Two-operand arithmetic and logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
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
    UShr,
    Min,
    Max,
}

impl BinOp {
    #[inline]
    pub const fn is_commutative(self) -> bool {
        matches!(
            self,
            BinOp::Add
                | BinOp::Mul
                | BinOp::And
                | BinOp::Or
                | BinOp::Xor
                | BinOp::Min
                | BinOp::Max
        )
    }

    #[inline]
    pub const fn is_shift(self) -> bool {
        matches!(self, BinOp::Shl | BinOp::Shr | BinOp::UShr)
    }

    /// Division and remainder trap on a zero divisor.
    #[inline]
    pub const fn can_throw(self) -> bool {
        matches!(self, BinOp::Div | BinOp::Rem)
    }
}

/// One-operand arithmetic and logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    Not,
    BoolNot,
    Abs,
}

/// Comparison predicates. Always signed on integral operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// Predicate for `!(a op b)`.
    pub const fn inverse(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
        }
    }

    /// Predicate for `b op' a` equivalent to `a op b`.
    pub const fn swap(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::Ne => CmpOp::Ne,
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
        }
    }

    pub fn eval<T: PartialOrd>(self, a: T, b: T) -> bool {
        match self {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        }
    }
}

/// Horizontal reduction performed by [`Op::VecReduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReductionKind {
    Sum,
    Min,
    Max,
}

// =============================================================================
// Vector Shape and Alignment
// =============================================================================

/// Lane layout of a vector value: `lanes` elements of `packed` type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VecShape {
    pub packed: DataType,
    pub lanes: u32,
}

impl VecShape {
    pub const fn new(packed: DataType, lanes: u32) -> Self {
        VecShape { packed, lanes }
    }

    /// Register width in bytes.
    pub const fn bytes(self) -> u32 {
        self.packed.size() * self.lanes
    }
}

/// Known alignment of a vector memory access: the address is
/// `base * k + offset` for some integer `k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Alignment {
    base: u32,
    offset: u32,
}

impl Alignment {
    pub fn new(base: u32, offset: u32) -> Self {
        debug_assert!(base.is_power_of_two());
        debug_assert!(offset < base);
        Alignment { base, offset }
    }

    #[inline]
    pub const fn base(self) -> u32 {
        self.base
    }

    #[inline]
    pub const fn offset(self) -> u32 {
        self.offset
    }

    /// True if every address with this alignment is a multiple of `n`.
    pub fn is_aligned_at(self, n: u32) -> bool {
        self.offset % n == 0 && self.base % n == 0
    }
}

// =============================================================================
// Operators
// =============================================================================

/// Instruction operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// Method parameter by position.
    Param(u32),
    /// Integral constant (normalized to the instruction type).
    Const(i64),
    /// Floating point constant, stored as `f64` bits.
    FloatConst(u64),
    /// SSA merge. Input `k` flows in from predecessor `k` of the block.
    Phi,
    Binary(BinOp),
    Unary(UnOp),
    /// Conversion from the operand type to the instruction type.
    Convert,
    /// Produces a `Bool`.
    Compare(CmpOp),
    /// `cond ? if_true : if_false`.
    Select,
    /// `array[index]`; strings are read through the same operator.
    ArrayGet { string_char_at: bool },
    /// `array[index] = value`.
    ArraySet { component: DataType },
    ArrayLength,
    /// Opaque call with arbitrary side effects.
    Call,
    /// Monitor enter/exit; never duplicated.
    Monitor,

    /// Two-way branch on input 0: successor 0 when true, 1 when false.
    If,
    Goto,
    Return,

    /// Broadcast a scalar into every lane.
    VecReplicateScalar,
    /// Scalar into lane 0, zero elsewhere.
    VecSetScalars,
    /// Lane 0 of a vector.
    VecExtractScalar,
    /// Horizontal reduction; the result stays in lane 0 of a vector.
    VecReduce(ReductionKind),
    /// Lane-wise `array[index + lane]`.
    VecLoad {
        string_char_at: bool,
        alignment: Alignment,
    },
    /// Lane-wise `array[index + lane] = value`.
    VecStore { alignment: Alignment },
    /// `(a + b [+ 1]) >> 1` computed without overflow in the packed type.
    VecHalvingAdd { rounded: bool },
    VecSaturationAdd,
    VecSaturationSub,
    /// `acc + |a - b|`, narrow lanes folded into the wider accumulator lanes.
    VecSadAccumulate,
    /// `acc + a * b`, narrow lanes folded into the wider accumulator lanes.
    VecDotProd { unsigned: bool },
}

bitflags::bitflags! {
    /// Effect summary of an operator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Effects: u8 {
        const READS_MEMORY = 1 << 0;
        const WRITES_MEMORY = 1 << 1;
        const CAN_THROW = 1 << 2;
        const CONTROL = 1 << 3;
        /// Must not be duplicated by loop cloning.
        const NOT_CLONABLE = 1 << 4;
    }
}

impl Op {
    pub fn effects(&self) -> Effects {
        match self {
            Op::Binary(op) if op.can_throw() => Effects::CAN_THROW,
            Op::ArrayGet { .. } | Op::ArrayLength | Op::VecLoad { .. } => Effects::READS_MEMORY,
            Op::ArraySet { .. } | Op::VecStore { .. } => Effects::WRITES_MEMORY,
            Op::Call => Effects::READS_MEMORY | Effects::WRITES_MEMORY | Effects::CAN_THROW,
            Op::Monitor => {
                Effects::READS_MEMORY
                    | Effects::WRITES_MEMORY
                    | Effects::CAN_THROW
                    | Effects::NOT_CLONABLE
            }
            Op::If | Op::Goto | Op::Return => Effects::CONTROL,
            _ => Effects::empty(),
        }
    }

    #[inline]
    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::If | Op::Goto | Op::Return)
    }

    /// True for operators that only exist in SIMD form.
    pub fn is_vector_only(&self) -> bool {
        matches!(
            self,
            Op::VecReplicateScalar
                | Op::VecSetScalars
                | Op::VecExtractScalar
                | Op::VecReduce(_)
                | Op::VecLoad { .. }
                | Op::VecStore { .. }
                | Op::VecHalvingAdd { .. }
                | Op::VecSaturationAdd
                | Op::VecSaturationSub
                | Op::VecSadAccumulate
                | Op::VecDotProd { .. }
        )
    }
}

// =============================================================================
// Instruction
// =============================================================================

/// An instruction record.
#[derive(Debug, Clone)]
pub struct Instr {
    pub op: Op,
    /// Result type; `Void` for stores and control.
    pub ty: DataType,
    pub inputs: Inputs,
    /// Lane layout when the instruction yields or consumes a SIMD value.
    pub vec: Option<VecShape>,
    /// Containing block; `None` once detached or removed.
    pub block: Option<BlockId>,
}

impl Instr {
    pub fn new(op: Op, ty: DataType, inputs: &[InstrId]) -> Self {
        Instr {
            op,
            ty,
            inputs: inputs.iter().copied().collect(),
            vec: None,
            block: None,
        }
    }

    #[inline]
    pub fn input(&self, index: usize) -> InstrId {
        self.inputs[index]
    }

    #[inline]
    pub fn is_phi(&self) -> bool {
        matches!(self.op, Op::Phi)
    }

    /// Integral constant value, if this is one.
    #[inline]
    pub fn as_const(&self) -> Option<i64> {
        match self.op {
            Op::Const(v) => Some(v),
            _ => None,
        }
    }

    #[inline]
    pub fn is_const(&self, value: i64) -> bool {
        self.as_const() == Some(value)
    }

    pub fn binary_op(&self) -> Option<BinOp> {
        match self.op {
            Op::Binary(op) => Some(op),
            _ => None,
        }
    }

    /// Anything observable besides the produced value.
    pub fn has_side_effects(&self) -> bool {
        self.op
            .effects()
            .intersects(Effects::WRITES_MEMORY | Effects::CAN_THROW | Effects::CONTROL)
    }

    /// May be deleted once it has no uses.
    #[inline]
    pub fn is_removable(&self) -> bool {
        !self.has_side_effects()
    }

    #[inline]
    pub fn is_clonable(&self) -> bool {
        !self.op.effects().contains(Effects::NOT_CLONABLE)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmp_inverse_and_swap() {
        for op in [CmpOp::Eq, CmpOp::Ne, CmpOp::Lt, CmpOp::Le, CmpOp::Gt, CmpOp::Ge] {
            for (a, b) in [(1, 2), (2, 2), (3, 2)] {
                assert_eq!(op.inverse().eval(a, b), !op.eval(a, b));
                assert_eq!(op.swap().eval(b, a), op.eval(a, b));
            }
        }
    }

    #[test]
    fn test_effects() {
        assert!(Instr::new(Op::ArraySet { component: DataType::Int32 }, DataType::Void, &[])
            .has_side_effects());
        assert!(Instr::new(Op::Binary(BinOp::Div), DataType::Int32, &[]).has_side_effects());
        assert!(Instr::new(Op::Binary(BinOp::Add), DataType::Int32, &[]).is_removable());
        assert!(Instr::new(Op::ArrayGet { string_char_at: false }, DataType::Int8, &[])
            .is_removable());
        assert!(!Instr::new(Op::Monitor, DataType::Void, &[]).is_clonable());
    }

    #[test]
    fn test_alignment() {
        let a = Alignment::new(16, 0);
        assert!(a.is_aligned_at(16));
        assert!(a.is_aligned_at(8));
        let b = Alignment::new(8, 4);
        assert!(!b.is_aligned_at(8));
        assert!(b.is_aligned_at(4));
        assert_eq!(VecShape::new(DataType::Int16, 8).bytes(), 16);
    }
}
