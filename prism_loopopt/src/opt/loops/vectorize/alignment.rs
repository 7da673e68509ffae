//! Alignment of vector memory accesses and the peeling strategy.
//!
//! The runtime guarantees a base alignment for every object and places
//! array data at a fixed offset inside it. A reference `a[i + c]` with
//! constant `c` therefore has a known misalignment, and peeling a few
//! scalar iterations can make it fully aligned inside the vector loop:
//!
//! - **Static peeling**: the most popular peel count among references with
//!   known misalignment, fixed at compile time
//! - **Dynamic peeling**: when no reference has a known misalignment, the
//!   peel count is computed at runtime from the address of one candidate
//!   reference

use crate::ir::instr::Alignment;
use crate::ir::types::DataType;
use crate::opt::loops::induction::IndexOffset;
use crate::opt::loops::target::{array_data_offset, STRING_VALUE_OFFSET};
use crate::opt::loops::LoopOptimization;

use super::ArrayReference;

/// Bytes between the object start and element 0.
pub fn hidden_offset(ty: DataType, string_char_at: bool) -> u32 {
    if string_char_at {
        STRING_VALUE_OFFSET
    } else {
        array_data_offset(ty)
    }
}

impl LoopOptimization {
    /// Alignment of `base[i + offset]` after `peeling` scalar iterations,
    /// assuming `i` starts at zero.
    pub(super) fn compute_alignment(
        &self,
        offset: IndexOffset,
        ty: DataType,
        string_char_at: bool,
        peeling: u32,
    ) -> Alignment {
        match offset {
            IndexOffset::Const(value) => {
                let base = self.config.object_alignment;
                let start = hidden_offset(ty, string_char_at) as i64
                    + value.wrapping_add(peeling as i64).wrapping_mul(ty.size() as i64);
                Alignment::new(base, start.rem_euclid(base as i64) as u32)
            }
            // Only natural alignment is known.
            IndexOffset::Value(_) => Alignment::new(ty.size(), 0),
        }
    }

    /// Take the peel count with the most votes; without any vote, fall
    /// back to dynamic peeling on `candidate`.
    pub(super) fn set_alignment_strategy(&mut self, votes: &[u32], candidate: Option<ArrayReference>) {
        let mut max_vote = 0;
        for (factor, &vote) in votes.iter().enumerate() {
            if vote > max_vote {
                max_vote = vote;
                self.vector.static_peeling_factor = factor as u32;
            }
        }
        if max_vote == 0 {
            self.vector.dynamic_peeling_candidate = candidate;
        }
    }

    /// Upper bound on the iterations the peeling loop executes.
    pub(super) fn max_number_peeled(&self) -> u32 {
        if self.vector.dynamic_peeling_candidate.is_some() {
            self.vector.length.saturating_sub(1)
        } else {
            self.vector.static_peeling_factor
        }
    }

    /// A vector type was found and, when the trip count is known, enough
    /// iterations remain after peeling for one vector iteration.
    pub(super) fn is_vectorization_profitable(&self, trip_count: Option<i64>) -> bool {
        if self.vector.length == 0 {
            return false;
        }
        match trip_count {
            None => true,
            Some(tc) => tc >= self.vector.length as i64 + self.max_number_peeled() as i64,
        }
    }
}
