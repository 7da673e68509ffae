//! Scalar loop restructuring: peeling and unrolling.
//!
//! Each transformation first runs as a dry run (`generate_code = false`)
//! so the pass can decide whether any of them applies before paying for
//! the clonability check. Peeling for invariant exits may be followed by
//! one of full or partial unrolling.

use log::debug;

use crate::ir::cfg::{DominatorTree, LoopInfo};
use crate::ir::graph::Graph;
use crate::ir::instr::Op;
use crate::ir::types::DataType;

use super::analysis::LoopAnalysisInfo;
use super::clone::{fold_loop_test, is_loop_clonable, peel_first_iteration, unroll_once, CloneMaps};
use super::hierarchy::LoopNodeId;
use super::induction::{is_invariant, LoopInductions};
use super::target::SCALAR_UNROLL_FACTOR;
use super::LoopOptimization;

impl LoopOptimization {
    /// Try the scalar restructurings on an innermost loop.
    pub(super) fn try_peeling_and_unrolling(&mut self, graph: &mut Graph, node: LoopNodeId) -> bool {
        if !self.config.enable_peeling_unrolling {
            return false;
        }
        let info = self.forest.node(node).info.clone();
        let analysis = self.scalar_analysis(graph, &info);
        if analysis.has_instructions_preventing_scalar_opts()
            || self.helper.is_loop_non_beneficial_for_scalar_opts(&analysis)
        {
            return false;
        }
        let facts = LoopInductions::compute(graph, &info);
        if !self.try_full_unrolling(graph, node, &analysis, &facts, false)
            && !self.try_peeling_for_loop_invariant_exits(graph, node, &analysis, false)
            && !self.try_unrolling_for_branch_penalty_reduction(graph, node, &analysis, &facts, false)
        {
            return false;
        }
        // Most expensive check last.
        if !is_loop_clonable(graph, &info) {
            return false;
        }

        let peeled = self.try_peeling_for_loop_invariant_exits(graph, node, &analysis, true);
        if peeled {
            self.refresh_loop_chain(graph, node);
        }
        let info = self.forest.node(node).info.clone();
        let analysis = self.scalar_analysis(graph, &info);
        let facts = LoopInductions::compute(graph, &info);
        let unrolled = self.try_full_unrolling(graph, node, &analysis, &facts, true)
            || self.try_unrolling_for_branch_penalty_reduction(graph, node, &analysis, &facts, true);
        peeled || unrolled
    }

    fn scalar_analysis(&self, graph: &Graph, info: &LoopInfo) -> LoopAnalysisInfo {
        let facts = LoopInductions::compute(graph, info);
        LoopAnalysisInfo::compute(graph, info, facts.constant_trip_count())
    }

    // =========================================================================
    // Peeling
    // =========================================================================

    /// Peel one iteration so exits on loop-invariant conditions are
    /// decided once, in the peeled copy.
    fn try_peeling_for_loop_invariant_exits(
        &mut self,
        graph: &mut Graph,
        node: LoopNodeId,
        analysis: &LoopAnalysisInfo,
        generate_code: bool,
    ) -> bool {
        if !self.helper.is_loop_peeling_enabled() || analysis.invariant_exit_count == 0 {
            return false;
        }
        if !generate_code {
            return true;
        }
        let info = self.forest.node(node).info.clone();
        let Some(maps) = peel_first_iteration(graph, &info) else {
            return false;
        };
        evaluate_invariant_tests(graph, &info, &maps);
        debug!("loop {}: peeled for {} invariant exits", info.header, analysis.invariant_exit_count);
        self.stats.loops_peeled += 1;
        true
    }

    // =========================================================================
    // Unrolling
    // =========================================================================

    /// Replace a loop with a small constant trip count by straight-line
    /// copies of its body.
    fn try_full_unrolling(
        &mut self,
        graph: &mut Graph,
        node: LoopNodeId,
        analysis: &LoopAnalysisInfo,
        facts: &LoopInductions,
        generate_code: bool,
    ) -> bool {
        let Some(trip_count) = analysis.trip_count else {
            return false;
        };
        if trip_count < 0
            || facts.control.is_none()
            || !self.helper.is_full_unrolling_beneficial(analysis)
        {
            return false;
        }
        if !generate_code {
            return true;
        }

        let info = self.forest.node(node).info.clone();
        let header = info.header;
        for _ in 0..trip_count {
            let Some(maps) = peel_first_iteration(graph, &info) else {
                return false;
            };
            fold_loop_test(graph, &info, maps.block(header), header, true);
        }
        // The residual loop never runs its body.
        fold_loop_test(graph, &info, header, header, false);
        for block in info.block_ids().filter(|&b| b != header) {
            graph.remove_block(block);
        }
        for phi in graph.block(header).phis.clone() {
            let value = graph.instr(phi).input(0);
            graph.replace_all_uses(phi, value);
            graph.remove_instr(phi);
        }

        debug!("loop {}: fully unrolled {} times", header, trip_count);
        let outer = self.forest.node(node).outer;
        self.forest.remove_loop(node);
        if let Some(outer) = outer {
            self.refresh_loop_chain(graph, outer);
        }
        self.stats.loops_fully_unrolled += 1;
        true
    }

    /// Chain a second body copy into the loop and drop the copy's exit
    /// test. Requires a trip count divisible by the factor and the header
    /// test as the only exit.
    fn try_unrolling_for_branch_penalty_reduction(
        &mut self,
        graph: &mut Graph,
        node: LoopNodeId,
        analysis: &LoopAnalysisInfo,
        facts: &LoopInductions,
        generate_code: bool,
    ) -> bool {
        let factor = self.helper.scalar_unrolling_factor(analysis);
        if factor != SCALAR_UNROLL_FACTOR || analysis.exit_count != 1 || facts.control.is_none() {
            return false;
        }
        if !generate_code {
            return true;
        }

        let info = self.forest.node(node).info.clone();
        let Some(maps) = unroll_once(graph, &info) else {
            return false;
        };
        let header = info.header;
        fold_loop_test(graph, &info, maps.block(header), header, true);
        debug!("loop {}: unrolled by {}", header, factor);
        self.refresh_loop_chain(graph, node);
        self.stats.loops_unrolled += 1;
        true
    }
}

/// In the peeled copy, an `If` on an invariant condition decides that
/// condition for every use it dominates in the remaining loop.
fn evaluate_invariant_tests(graph: &mut Graph, info: &LoopInfo, maps: &CloneMaps) {
    let dom = DominatorTree::build(graph);
    let mut copies: Vec<_> = maps.blocks.values().copied().collect();
    copies.sort_unstable();
    for copy in copies {
        let Some(term) = graph.terminator(copy) else {
            continue;
        };
        if !matches!(graph.instr(term).op, Op::If) {
            continue;
        }
        let cond = graph.instr(term).input(0);
        let defined_in_copy = graph
            .block_of(cond)
            .is_some_and(|b| maps.blocks.values().any(|&c| c == b));
        if defined_in_copy || !is_invariant(graph, info, cond) || graph.instr(cond).as_const().is_some() {
            continue;
        }
        let succs = graph.block(copy).succs.clone();
        if succs[0] == succs[1] {
            continue;
        }
        for (succ, value) in [(succs[0], 1), (succs[1], 0)] {
            let users: Vec<_> = graph
                .uses(cond)
                .iter()
                .copied()
                .filter(|&user| {
                    graph
                        .block_of(user)
                        .is_some_and(|b| info.contains(b) && dom.dominates(succ, b))
                })
                .collect();
            if users.is_empty() {
                continue;
            }
            let decided = graph.const_int(DataType::Bool, value);
            for user in users {
                graph.replace_uses_where(cond, decided, |u| u == user);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
