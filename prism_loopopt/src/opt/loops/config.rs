//! Loop optimization configuration.

use super::target::{TargetIsa, DEFAULT_OBJECT_ALIGNMENT};

/// Configuration for the loop optimization pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOptConfig {
    /// Instruction set whose vector facts drive vectorization.
    pub isa: TargetIsa,

    /// Remove dead inductions and fold trivial blocks.
    pub enable_simplify: bool,

    /// Peel for invariant exits and unroll small loops.
    pub enable_peeling_unrolling: bool,

    /// Vectorize innermost loops.
    pub enable_vectorization: bool,

    /// Alignment of heap objects in bytes.
    pub object_alignment: u32,

    /// Code must stay debuggable; disables vectorization.
    pub debuggable: bool,
}

impl Default for LoopOptConfig {
    fn default() -> Self {
        Self {
            isa: TargetIsa::Arm64Neon,
            enable_simplify: true,
            enable_peeling_unrolling: true,
            enable_vectorization: true,
            object_alignment: DEFAULT_OBJECT_ALIGNMENT,
            debuggable: false,
        }
    }
}

impl LoopOptConfig {
    /// Everything but vectorization.
    pub fn no_vectorize() -> Self {
        Self {
            enable_vectorization: false,
            ..Self::default()
        }
    }

    /// Only induction and block simplification.
    pub fn scalar_only() -> Self {
        Self {
            isa: TargetIsa::None,
            enable_peeling_unrolling: false,
            enable_vectorization: false,
            ..Self::default()
        }
    }

    /// Widest vectors available.
    pub fn aggressive() -> Self {
        Self {
            isa: TargetIsa::X86Avx2,
            ..Self::default()
        }
    }

    /// Same settings for another ISA.
    pub fn with_isa(mut self, isa: TargetIsa) -> Self {
        self.isa = isa;
        self
    }

    /// Vectorization is requested and possible.
    pub fn vectorization_enabled(&self) -> bool {
        self.enable_vectorization && !self.debuggable && self.isa.vector_bytes() > 0
    }
}
