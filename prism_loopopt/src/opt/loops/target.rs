//! Target facts consumed by the loop optimizer.
//!
//! - **ISA table**: per element type, the lane count of a full vector
//!   register and the operations that register cannot perform
//! - **Runtime layout**: where array and string payloads start relative to
//!   an object, needed to reason about vector alignment
//! - **Arch loop helpers**: per-ISA heuristics for scalar peeling and
//!   unrolling and for unrolling the vector loop

use crate::ir::types::DataType;

use super::analysis::LoopAnalysisInfo;
use super::vectorize::restrictions::VectorRestrictions as R;

// =============================================================================
// Target ISA
// =============================================================================

/// Instruction set the code is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetIsa {
    /// No SIMD, no scalar loop heuristics.
    None,
    /// 8-byte NEON D registers.
    Arm32Neon,
    /// 16-byte NEON Q registers.
    Arm64Neon,
    /// 16-byte XMM registers.
    X86Sse41,
    /// 32-byte YMM registers.
    X86Avx2,
}

impl TargetIsa {
    /// Width of a vector register in bytes; zero without SIMD.
    pub const fn vector_bytes(self) -> u32 {
        match self {
            TargetIsa::None => 0,
            TargetIsa::Arm32Neon => 8,
            TargetIsa::Arm64Neon | TargetIsa::X86Sse41 => 16,
            TargetIsa::X86Avx2 => 32,
        }
    }

    pub const fn is_64bit(self) -> bool {
        !matches!(self, TargetIsa::Arm32Neon)
    }

    /// Lane count and base restrictions for vectors of `ty`, or `None`
    /// when the element type cannot be vectorized at all.
    pub fn vector_support(self, ty: DataType) -> Option<(u32, R)> {
        let bytes = self.vector_bytes();
        if bytes == 0 || ty.size() == 0 || ty == DataType::Reference {
            return None;
        }
        let lanes = bytes / ty.size();
        let restrictions = match self {
            TargetIsa::None => return None,
            TargetIsa::Arm32Neon => match ty {
                DataType::Bool | DataType::Uint8 | DataType::Int8 => {
                    R::NO_DIV | R::NO_REDUCTION | R::NO_SAD | R::NO_DOT_PROD
                }
                DataType::Uint16 | DataType::Int16 => {
                    R::NO_DIV | R::NO_STRING_CHAR_AT | R::NO_REDUCTION | R::NO_SAD | R::NO_DOT_PROD
                }
                DataType::Int32 => R::NO_DIV | R::NO_WIDE_SAD | R::NO_DOT_PROD,
                _ => return None,
            },
            TargetIsa::Arm64Neon => match ty {
                DataType::Bool | DataType::Uint8 | DataType::Int8 => R::NO_DIV,
                DataType::Uint16 | DataType::Int16 => R::NO_DIV,
                DataType::Int32 => R::NO_DIV | R::NO_DOT_PROD,
                DataType::Int64 => R::NO_DIV | R::NO_MUL | R::NO_DOT_PROD,
                DataType::Float32 | DataType::Float64 => R::NO_REDUCTION | R::NO_SATURATION,
                _ => return None,
            },
            TargetIsa::X86Sse41 | TargetIsa::X86Avx2 => match ty {
                DataType::Bool | DataType::Uint8 | DataType::Int8 => {
                    R::NO_MUL
                        | R::NO_DIV
                        | R::NO_SHIFT
                        | R::NO_ABS
                        | R::NO_SIGNED_HADD
                        | R::NO_UNROUNDED_HADD
                        | R::NO_SAD
                        | R::NO_DOT_PROD
                }
                DataType::Uint16 | DataType::Int16 => {
                    R::NO_DIV
                        | R::NO_SIGNED_HADD
                        | R::NO_UNROUNDED_HADD
                        | R::NO_SAD
                        | R::NO_WIDE_SAD
                }
                DataType::Int32 => R::NO_DIV | R::NO_SAD | R::NO_DOT_PROD,
                DataType::Int64 => {
                    R::NO_MUL | R::NO_DIV | R::NO_SHR | R::NO_ABS | R::NO_MIN_MAX | R::NO_SAD
                }
                DataType::Float32 | DataType::Float64 => {
                    R::NO_REDUCTION | R::NO_MIN_MAX | R::NO_SATURATION
                }
                _ => return None,
            },
        };
        Some((lanes, restrictions))
    }
}

// =============================================================================
// Runtime Layout
// =============================================================================

/// Offset of `value[0]` inside a string object.
pub const STRING_VALUE_OFFSET: u32 = 16;

/// Default alignment of heap objects.
pub const DEFAULT_OBJECT_ALIGNMENT: u32 = 8;

/// Offset of element 0 inside an array of `component`.
pub const fn array_data_offset(component: DataType) -> u32 {
    if component.size() == 8 {
        16
    } else {
        12
    }
}

// =============================================================================
// Arch Loop Helpers
// =============================================================================

/// Instruction-count ceiling for scalar peeling and unrolling.
pub const SCALAR_MAX_INSTRUCTIONS: usize = 17;
/// Block-count ceiling for scalar peeling and unrolling.
pub const SCALAR_MAX_BLOCKS: usize = 6;
/// `trip_count * instructions` ceiling for full unrolling.
pub const FULL_UNROLL_MAX_INSTRUCTIONS: i64 = 35;
/// Partial unrolling factor.
pub const SCALAR_UNROLL_FACTOR: u32 = 2;
/// Vector loop bodies at or above this size are not unrolled.
pub const SIMD_MAX_BODY_INSTRUCTIONS: u32 = 50;
pub const SIMD_MAX_UNROLL_FACTOR: u32 = 8;

/// Per-architecture loop heuristics.
///
/// The provided methods describe a target that wants no loop
/// restructuring at all.
pub trait ArchLoopHelper {
    /// True if peeling or unrolling this loop is not worth it.
    fn is_loop_non_beneficial_for_scalar_opts(&self, _info: &LoopAnalysisInfo) -> bool {
        true
    }

    /// Partial unrolling factor; 1 means no unrolling.
    fn scalar_unrolling_factor(&self, _info: &LoopAnalysisInfo) -> u32 {
        1
    }

    fn is_loop_peeling_enabled(&self) -> bool {
        false
    }

    /// Whether fully unrolling a loop with a known trip count pays off.
    fn is_full_unrolling_beneficial(&self, info: &LoopAnalysisInfo) -> bool {
        match info.trip_count {
            Some(tc) => tc.saturating_mul(info.instruction_count as i64) < FULL_UNROLL_MAX_INSTRUCTIONS,
            None => false,
        }
    }

    /// Unrolling factor of a vector loop; 1 means no unrolling.
    fn simd_unrolling_factor(
        &self,
        _body_instructions: u32,
        _trip_count: i64,
        _max_peel: u32,
        _vector_length: u32,
    ) -> u32 {
        1
    }
}

/// Helper for targets without loop heuristics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOptsLoopHelper;

impl ArchLoopHelper for NoOptsLoopHelper {}

/// Scalar heuristics shared by every optimizing target.
#[derive(Debug, Clone, Copy)]
pub struct DefaultLoopHelper {
    /// 64-bit arithmetic expands to several instructions.
    pub wide_ops_expensive: bool,
}

impl ArchLoopHelper for DefaultLoopHelper {
    fn is_loop_non_beneficial_for_scalar_opts(&self, info: &LoopAnalysisInfo) -> bool {
        (self.wide_ops_expensive && info.has_long_type_instructions)
            || info.instruction_count > SCALAR_MAX_INSTRUCTIONS
            || info.block_count > SCALAR_MAX_BLOCKS
    }

    fn scalar_unrolling_factor(&self, info: &LoopAnalysisInfo) -> u32 {
        scalar_factor(info)
    }

    fn is_loop_peeling_enabled(&self) -> bool {
        true
    }
}

/// ARM64 additionally unrolls vector loops.
#[derive(Debug, Clone, Copy, Default)]
pub struct Arm64LoopHelper;

impl ArchLoopHelper for Arm64LoopHelper {
    fn is_loop_non_beneficial_for_scalar_opts(&self, info: &LoopAnalysisInfo) -> bool {
        info.instruction_count > SCALAR_MAX_INSTRUCTIONS || info.block_count > SCALAR_MAX_BLOCKS
    }

    fn scalar_unrolling_factor(&self, info: &LoopAnalysisInfo) -> u32 {
        scalar_factor(info)
    }

    fn is_loop_peeling_enabled(&self) -> bool {
        true
    }

    fn simd_unrolling_factor(
        &self,
        body_instructions: u32,
        trip_count: i64,
        max_peel: u32,
        vector_length: u32,
    ) -> u32 {
        if trip_count < 2 * vector_length as i64 + max_peel as i64 {
            return 1;
        }
        if body_instructions == 0 || body_instructions >= SIMD_MAX_BODY_INSTRUCTIONS {
            return 1;
        }
        let by_size = SIMD_MAX_BODY_INSTRUCTIONS / body_instructions;
        let by_trips = ((trip_count - max_peel as i64) / vector_length as i64).min(u32::MAX as i64) as u32;
        trunc_to_power_of_two(by_size.min(by_trips).min(SIMD_MAX_UNROLL_FACTOR)).max(1)
    }
}

fn scalar_factor(info: &LoopAnalysisInfo) -> u32 {
    match info.trip_count {
        Some(tc) if tc >= SCALAR_UNROLL_FACTOR as i64 && tc % SCALAR_UNROLL_FACTOR as i64 == 0 => {
            SCALAR_UNROLL_FACTOR
        }
        _ => 1,
    }
}

/// Largest power of two not above `x` (0 for 0).
pub fn trunc_to_power_of_two(x: u32) -> u32 {
    if x == 0 {
        0
    } else {
        1 << (31 - x.leading_zeros())
    }
}

/// Pick the helper for an ISA.
pub fn loop_helper(isa: TargetIsa) -> Box<dyn ArchLoopHelper> {
    match isa {
        TargetIsa::None => Box::new(NoOptsLoopHelper),
        TargetIsa::Arm64Neon => Box::new(Arm64LoopHelper),
        TargetIsa::Arm32Neon => Box::new(DefaultLoopHelper {
            wide_ops_expensive: true,
        }),
        TargetIsa::X86Sse41 | TargetIsa::X86Avx2 => Box::new(DefaultLoopHelper {
            wide_ops_expensive: false,
        }),
    }
}

// =============================================================================
// Tests
// =============================================================================
