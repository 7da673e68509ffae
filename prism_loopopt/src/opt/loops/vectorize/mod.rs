//! SIMD vectorization of innermost loops.
//!
//! A candidate is a finite loop whose body is a single block, controlled
//! by one unit-stride induction, optionally carrying reductions. The work
//! splits in two phases that share the same rewrite rules:
//!
//! - **Analysis** (`generate = false`): walk every definition of the body
//!   and the right-hand-side tree below it, picking a vector type and
//!   length, accumulating [`VectorRestrictions`], collecting array
//!   references for the dependence test and alignment votes
//! - **Synthesis** (`generate = true`): emit an optional alignment peeling
//!   loop, the vector loop and an optional cleanup loop, then retire the
//!   original loop
//!
//! # Modules
//!
//! - `restrictions.rs`: capability bit set
//! - `array_ref.rs`: collected array references
//! - `analyze.rs`: per-instruction legality and rewrite rules
//! - `idioms.rs`: halving add, saturation, SAD and dot product
//! - `alignment.rs`: peeling votes, static and dynamic peeling
//! - `synthesize.rs`: new loops, value maps and reductions

pub mod alignment;
pub mod analyze;
pub mod array_ref;
pub mod idioms;
pub mod restrictions;
pub mod synthesize;

pub use array_ref::ArrayReference;
pub use restrictions::VectorRestrictions;

use std::collections::BTreeSet;

use log::{debug, trace};
use rustc_hash::FxHashMap;

use crate::ir::cfg::LoopInfo;
use crate::ir::graph::{BlockId, Graph};
use crate::ir::instr::InstrId;
use crate::ir::types::DataType;
use crate::opt::OptError;

use super::induction::LoopInductions;
use super::LoopOptimization;

// =============================================================================
// State
// =============================================================================

/// What the rewrite rules emit during synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VectorMode {
    /// One scalar instruction per original instruction.
    #[default]
    Sequential,
    /// One vector instruction per original instruction.
    Vector,
}

/// The new loop currently being filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopCursor {
    pub preheader: BlockId,
    pub header: BlockId,
    pub body: BlockId,
    /// Iteration counter, advanced by every unrolled copy.
    pub index: InstrId,
}

/// Vectorizer bookkeeping for the candidate loop.
#[derive(Debug, Default)]
pub struct VectorState {
    /// Lanes per vector; zero until a vector type is chosen.
    length: u32,
    refs: BTreeSet<ArrayReference>,
    static_peeling_factor: u32,
    dynamic_peeling_candidate: Option<ArrayReference>,
    /// The pair of arrays whose disjointness is tested at runtime.
    runtime_test: Option<(InstrId, InstrId)>,
    /// Union of the restrictions seen per candidate element type.
    restrictions_seen: FxHashMap<DataType, VectorRestrictions>,

    mode: VectorMode,
    cursor: Option<LoopCursor>,
    /// Which unrolled copy of the body is being generated.
    unrolled_copy: u32,
    /// Original instruction to its counterpart in the current unrolled copy.
    map: FxHashMap<InstrId, InstrId>,
    /// Mappings kept across unrolled copies of one new loop: invariant
    /// broadcasts and the reduction chain.
    permanent_map: FxHashMap<InstrId, InstrId>,
}

impl VectorState {
    /// Forget everything about the previous candidate.
    pub fn reset(&mut self) {
        *self = VectorState::default();
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn static_peeling_factor(&self) -> u32 {
        self.static_peeling_factor
    }

    pub fn dynamic_peeling_candidate(&self) -> Option<&ArrayReference> {
        self.dynamic_peeling_candidate.as_ref()
    }

    pub fn runtime_test(&self) -> Option<(InstrId, InstrId)> {
        self.runtime_test
    }

    pub fn restrictions_seen(&self) -> &FxHashMap<DataType, VectorRestrictions> {
        &self.restrictions_seen
    }

    fn lookup(&self, id: InstrId) -> Result<InstrId, OptError> {
        self.map.get(&id).copied().ok_or(OptError::MissingVectorValue(id))
    }

    fn cursor(&self) -> Result<LoopCursor, OptError> {
        self.cursor.ok_or(OptError::NoTargetLoop)
    }

    fn is_generating_sequential(&self, generate: bool) -> bool {
        generate && self.mode == VectorMode::Sequential
    }
}

/// The loop being vectorized, as seen by the rewrite rules.
#[derive(Clone, Copy)]
pub struct Candidate<'a> {
    pub info: &'a LoopInfo,
    pub facts: &'a LoopInductions,
}

impl Candidate<'_> {
    fn is_invariant(&self, graph: &Graph, id: InstrId) -> bool {
        super::induction::is_invariant(graph, self.info, id)
    }
}

// =============================================================================
// Entry Points
// =============================================================================

impl LoopOptimization {
    /// Decide whether the single-block `body` can and should be
    /// vectorized. Leaves the chosen length, alignment strategy and
    /// runtime test in the vector state.
    pub(super) fn should_vectorize(
        &mut self,
        graph: &mut Graph,
        info: &LoopInfo,
        facts: &LoopInductions,
        body: BlockId,
        trip_count: Option<i64>,
    ) -> Result<bool, OptError> {
        self.vector.reset();
        let header = info.header;
        if !graph.block(body).phis.is_empty() {
            return Ok(false);
        }

        let ctx = Candidate { info, facts };
        let instrs = graph.block(body).instrs.clone();
        for id in instrs {
            if !self.vectorize_def(graph, ctx, id, false)? {
                debug!("loop {}: {} cannot be vectorized", header, id);
                return Ok(false);
            }
        }

        // Pairs of same-typed references with at least one write. Distinct
        // arrays either coincide or are disjoint; partial overlap is not
        // possible.
        let desired_alignment = self.config.isa.vector_bytes();
        let mut peeling_votes = vec![0u32; desired_alignment as usize];
        let mut max_num_same_alignment = 0;
        let mut peeling_candidate: Option<ArrayReference> = None;
        let refs: Vec<ArrayReference> = self.vector.refs.iter().copied().collect();
        for (i, r) in refs.iter().enumerate() {
            let mut num_same_alignment = 0;
            for s in &refs[i + 1..] {
                if !r.may_conflict(s) {
                    continue;
                }
                if r.base == s.base {
                    // a[i+x] vs a[i+y]: only x == y is a loop-independent dependence.
                    if r.offset != s.offset {
                        debug!("loop {}: loop-carried dependence on {}", header, r.base);
                        return Ok(false);
                    }
                    num_same_alignment += 1;
                } else if r.offset != s.offset {
                    // a[i+x] vs b[i+y]: needs a != b at runtime; one such test at most.
                    match self.vector.runtime_test {
                        None => self.vector.runtime_test = Some((r.base, s.base)),
                        Some((a, b)) if (a, b) == (r.base, s.base) || (a, b) == (s.base, r.base) => {}
                        Some(_) => {
                            debug!("loop {}: needs a second runtime test", header);
                            return Ok(false);
                        }
                    }
                }
            }

            let alignment = self.compute_alignment(r.offset, r.ty, r.string_char_at, 0);
            if alignment.base() >= desired_alignment {
                let offset = alignment.offset() & (desired_alignment - 1);
                let vote = if offset == 0 {
                    0
                } else {
                    (desired_alignment - offset) >> r.ty.size_shift()
                };
                peeling_votes[vote as usize] += 1;
            } else if self.config.object_alignment >= desired_alignment
                && num_same_alignment > max_num_same_alignment
            {
                max_num_same_alignment = num_same_alignment;
                peeling_candidate = Some(*r);
            }
        }
        trace!("loop {}: peeling votes {:?}", header, peeling_votes);
        self.set_alignment_strategy(&peeling_votes, peeling_candidate);

        if !self.is_vectorization_profitable(trip_count) {
            debug!(
                "loop {}: not profitable (length {}, trip count {:?})",
                header, self.vector.length, trip_count
            );
            return Ok(false);
        }
        Ok(true)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests;
