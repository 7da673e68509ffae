//! Scalar simplification inside a loop.
//!
//! - **Induction simplification**: an induction cycle used only after the
//!   loop has those uses replaced by its last value, after which the cycle
//!   itself is dead and deleted as a unit
//! - **Block simplification**: dead instructions are swept, straight-line
//!   block pairs are merged and empty diamonds are collapsed
//!
//! The helpers that classify uses and assign last values are shared with
//! the finite-loop optimizations and the vectorizer.

use log::{debug, trace};

use crate::ir::cfg::LoopInfo;
use crate::ir::graph::{BlockId, Graph};
use crate::ir::instr::{InstrId, Op};

use super::hierarchy::LoopNodeId;
use super::induction::LoopInductions;
use super::LoopOptimization;

impl LoopOptimization {
    // =========================================================================
    // Induction Simplification
    // =========================================================================

    /// Remove induction cycles whose value is only needed after the loop.
    pub(super) fn simplify_induction(&mut self, graph: &mut Graph, node: LoopNodeId) {
        let info = self.forest.node(node).info.clone();
        let facts = LoopInductions::compute(graph, &info);
        let Some(preheader) = facts.preheader else {
            return;
        };
        for phi in graph.block(info.header).phis.clone() {
            if graph.block_of(phi).is_none() {
                continue;
            }
            self.iset.clear();
            if self.try_set_phi_induction(graph, &facts, phi, true)
                && self.try_assign_last_value(graph, &info, &facts, phi, preheader, false)
                && self.can_remove_cycle(graph)
            {
                debug!("loop {}: removing dead induction {}", info.header, phi);
                self.simplified = true;
                self.stats.inductions_simplified += 1;
                let mut members: Vec<InstrId> = self.iset.iter().copied().collect();
                members.sort_unstable();
                for member in members {
                    if graph.block_of(member).is_some() {
                        graph.remove_instr(member);
                    }
                }
            }
        }
        self.iset.clear();
    }

    /// Collect the induction cycle of `phi` into the instruction set.
    ///
    /// Every member must be removable. With `restrict_uses`, members other
    /// than the phi may only be used inside the cycle.
    pub(super) fn try_set_phi_induction(
        &mut self,
        graph: &Graph,
        facts: &LoopInductions,
        phi: InstrId,
        restrict_uses: bool,
    ) -> bool {
        let Some(cycle) = facts.lookup_cycle(phi) else {
            return false;
        };
        for &member in cycle {
            if graph.block_of(member).is_none() {
                continue;
            }
            if !graph.instr(member).is_removable() {
                return false;
            }
            if member != phi
                && restrict_uses
                && graph.uses(member).iter().any(|u| !cycle.contains(u))
            {
                return false;
            }
            self.iset.insert(member);
        }
        true
    }

    /// Classify the uses of `id` that are outside the instruction set.
    ///
    /// Uses after the loop are counted. Uses inside the loop are added to
    /// the set with `collect_loop_uses`, and reject the value otherwise.
    pub(super) fn is_only_used_after_loop(
        &mut self,
        graph: &Graph,
        info: &LoopInfo,
        id: InstrId,
        collect_loop_uses: bool,
        use_count: &mut usize,
    ) -> bool {
        for &user in graph.uses(id) {
            if self.iset.contains(&user) {
                continue;
            }
            let inside = graph.block_of(user).is_some_and(|b| info.contains(b));
            if inside {
                if collect_loop_uses {
                    self.iset.insert(user);
                    continue;
                }
                return false;
            }
            *use_count += 1;
        }
        true
    }

    /// Point every use outside the instruction set at the last value.
    pub(super) fn try_replace_with_last_value(
        &mut self,
        graph: &mut Graph,
        facts: &LoopInductions,
        id: InstrId,
        block: BlockId,
    ) -> bool {
        if !facts.can_generate_last_value(id) {
            return false;
        }
        let Some(replacement) = facts.generate_last_value(graph, id, block) else {
            return false;
        };
        let iset = &self.iset;
        graph.replace_uses_where(id, replacement, |user| !iset.contains(&user));
        trace!("replaced uses of {} after the loop by {}", id, replacement);
        true
    }

    /// Succeeds if `id` has no uses after the loop, or if they can all be
    /// replaced by the last value of a loop without early exits.
    pub(super) fn try_assign_last_value(
        &mut self,
        graph: &mut Graph,
        info: &LoopInfo,
        facts: &LoopInductions,
        id: InstrId,
        block: BlockId,
        collect_loop_uses: bool,
    ) -> bool {
        let mut use_count = 0;
        self.is_only_used_after_loop(graph, info, id, collect_loop_uses, &mut use_count)
            && (use_count == 0
                || (!is_early_exit(graph, info)
                    && self.try_replace_with_last_value(graph, facts, id, block)))
    }

    /// The instruction set is closed: nothing outside it uses a member.
    pub(super) fn can_remove_cycle(&self, graph: &Graph) -> bool {
        self.iset.iter().all(|&member| {
            graph.block_of(member).is_none()
                || (graph.instr(member).is_removable()
                    && graph.uses(member).iter().all(|u| self.iset.contains(u)))
        })
    }

    // =========================================================================
    // Block Simplification
    // =========================================================================

    /// Sweep dead code and trivial control flow from the loop body.
    pub(super) fn simplify_blocks(&mut self, graph: &mut Graph, node: LoopNodeId) {
        let blocks: Vec<BlockId> = self.forest.node(node).info.block_ids().collect();
        for block in blocks {
            if graph.block(block).removed {
                continue;
            }
            let phis = graph.block(block).phis.clone();
            self.remove_dead_instructions(graph, &phis);
            let instrs = graph.block(block).instrs.clone();
            self.remove_dead_instructions(graph, &instrs);

            let bb = graph.block(block);
            if bb.preds.len() == 1
                && bb.succs.len() == 1
                && graph.block(bb.succs[0]).preds.len() == 1
                && bb.succs[0] != block
            {
                let succ = bb.succs[0];
                trace!("merging block {} into {}", succ, block);
                graph.merge_with_successor(block);
                self.forget_block(succ, Some(block));
                self.simplified = true;
                self.stats.blocks_simplified += 1;
            } else if bb.succs.len() == 2 {
                let (succ0, succ1) = (bb.succs[0], bb.succs[1]);
                let meet0 = goto_target(graph, succ0);
                let meet1 = goto_target(graph, succ1);
                if succ0 != succ1
                    && meet0.is_some()
                    && meet0 == meet1
                    && meet0 != Some(block)
                    && meet0.is_some_and(|m| graph.block(m).phis.is_empty())
                {
                    trace!("bypassing empty diamond arm {} of {}", succ0, block);
                    graph.fold_branch(block, false);
                    graph.remove_block(succ0);
                    self.forget_block(succ0, None);
                    self.simplified = true;
                    self.stats.blocks_simplified += 1;
                }
            }
        }
    }

    /// Delete instructions of `list`, last to first, that are unused and
    /// free of side effects.
    pub(super) fn remove_dead_instructions(&mut self, graph: &mut Graph, list: &[InstrId]) {
        for &id in list.iter().rev() {
            if graph.block_of(id).is_none() {
                continue;
            }
            let instr = graph.instr(id);
            if instr.is_removable() && !matches!(instr.op, Op::Param(_)) && !graph.has_uses(id) {
                graph.remove_instr(id);
                self.simplified = true;
            }
        }
    }

    /// Drop a deleted block from every loop of the forest; a merged block
    /// hands its back edges to the block that absorbed it.
    pub(super) fn forget_block(&mut self, block: BlockId, merged_into: Option<BlockId>) {
        for id in self.forest.preorder() {
            let info = &mut self.forest.node_mut(id).info;
            info.remove_block(block);
            for edge in info.back_edges.iter_mut() {
                if *edge == block {
                    if let Some(into) = merged_into {
                        *edge = into;
                    }
                }
            }
            if merged_into.is_none() {
                info.back_edges.retain(|&b| b != block);
            }
        }
    }
}

/// Exits leaving from a block other than the header.
pub(super) fn is_early_exit(graph: &Graph, info: &LoopInfo) -> bool {
    info.block_ids()
        .filter(|&b| b != info.header)
        .any(|b| graph.block(b).succs.iter().any(|&s| !info.contains(s)))
}

/// Target of a block holding nothing but a jump.
fn goto_target(graph: &Graph, block: BlockId) -> Option<BlockId> {
    let bb = graph.block(block);
    let only_goto = bb.phis.is_empty()
        && bb.instrs.len() == 1
        && matches!(graph.instr(bb.instrs[0]).op, Op::Goto);
    only_goto.then(|| bb.succs[0])
}

// =============================================================================
// Tests
// =============================================================================
