//! Vector capability restrictions.
//!
//! A [`VectorRestrictions`] mask names the operations the chosen vector
//! type cannot express. The mask starts from the target's table entry for
//! the element type and only ever grows while a loop body is analyzed:
//! narrow operands add [`VectorRestrictions::NO_HI_BITS`], stores of
//! compressed strings add nothing, and so on. An operation is vectorizable
//! only if none of the bits it depends on are set.

bitflags::bitflags! {
    /// Disabled vector capabilities for one candidate element type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VectorRestrictions: u32 {
        const NO_MUL = 1 << 0;
        const NO_DIV = 1 << 1;
        const NO_SHIFT = 1 << 2;
        /// Arithmetic shift right.
        const NO_SHR = 1 << 3;
        /// The operation needs the high-order bits of a value that is
        /// stored in a narrower lane.
        const NO_HI_BITS = 1 << 4;
        const NO_SIGNED_HADD = 1 << 5;
        const NO_UNROUNDED_HADD = 1 << 6;
        const NO_ABS = 1 << 7;
        /// Reads of string characters.
        const NO_STRING_CHAR_AT = 1 << 8;
        const NO_REDUCTION = 1 << 9;
        /// Sum of absolute differences.
        const NO_SAD = 1 << 10;
        /// SAD whose operands are narrower than the accumulator.
        const NO_WIDE_SAD = 1 << 11;
        const NO_DOT_PROD = 1 << 12;
        const NO_MIN_MAX = 1 << 13;
        const NO_SATURATION = 1 << 14;
    }
}

impl VectorRestrictions {
    /// True if any of `bits` is disabled.
    #[inline]
    pub fn has_any(self, bits: VectorRestrictions) -> bool {
        self.intersects(bits)
    }
}
