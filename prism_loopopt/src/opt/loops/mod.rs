//! Loop optimization pass.
//!
//! Builds the loop forest once per run and walks it inner to outer. For
//! every loop it repeats scalar simplification until nothing changes; for
//! every innermost loop it then tries, in order:
//!
//! 1. **Finite-loop cleanup**: remove empty loops and loops running once
//! 2. **Vectorization**: rewrite the loop with SIMD operations plus
//!    sequential peeling and cleanup loops
//! 3. **Peeling and unrolling**: peel for invariant exits, then fully or
//!    partially unroll
//!
//! # Architecture
//!
//! - `hierarchy.rs`: loop forest and try/catch classification
//! - `induction.rs`: linear inductions, trip counts, last values
//! - `simplify.rs`: dead induction cycles and trivial blocks
//! - `analysis.rs`, `clone.rs`, `restructure.rs`: scalar peeling/unrolling
//! - `target.rs`: ISA vector facts and per-architecture heuristics
//! - `vectorize/`: legality, idioms, alignment and code synthesis
//!
//! All per-run state (forest, instruction set, reduction map, vector
//! maps) lives in the pass and is cleared when the run ends.

pub mod analysis;
pub mod clone;
pub mod config;
pub mod hierarchy;
pub mod induction;
pub mod restructure;
pub mod simplify;
pub mod target;
pub mod vectorize;

pub use config::LoopOptConfig;
pub use hierarchy::{LoopForest, LoopNode, LoopNodeId, TryCatchKind};
pub use target::TargetIsa;

use log::{debug, error, trace};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::cfg::{DominatorTree, LoopAnalysis, LoopInfo};
use crate::ir::graph::{BlockId, Graph};
use crate::ir::instr::{BinOp, InstrId, Op};
use crate::opt::{OptError, OptStats, OptimizationPass};

use induction::LoopInductions;
use target::ArchLoopHelper;
use vectorize::VectorState;

// =============================================================================
// Pass
// =============================================================================

/// The loop optimization pass.
pub struct LoopOptimization {
    config: LoopOptConfig,
    helper: Box<dyn ArchLoopHelper>,
    stats: OptStats,

    /// Loop forest of the current run.
    forest: LoopForest,
    /// Instructions of the loop currently being analyzed: induction cycle,
    /// loop control and, when collected, in-loop uses of the main phi.
    iset: FxHashSet<InstrId>,
    /// Reduction step to its phi, and phi to its current feed value.
    reductions: FxHashMap<InstrId, InstrId>,
    /// Set by any simplification; drives the repeat-until-stable loop.
    simplified: bool,
    /// Vectorizer state of the current candidate loop.
    vector: VectorState,
}

impl LoopOptimization {
    pub fn new() -> Self {
        Self::with_config(LoopOptConfig::default())
    }

    pub fn with_config(config: LoopOptConfig) -> Self {
        let helper = target::loop_helper(config.isa);
        Self {
            config,
            helper,
            stats: OptStats::default(),
            forest: LoopForest::new(),
            iset: FxHashSet::default(),
            reductions: FxHashMap::default(),
            simplified: false,
            vector: VectorState::default(),
        }
    }

    pub fn config(&self) -> &LoopOptConfig {
        &self.config
    }

    /// Statistics of the last run.
    pub fn stats(&self) -> &OptStats {
        &self.stats
    }

    /// Run the pass, surfacing internal-consistency failures.
    pub fn try_run(&mut self, graph: &mut Graph) -> Result<bool, OptError> {
        self.stats = OptStats::default();
        let dom = DominatorTree::build(graph);
        let loops = LoopAnalysis::compute(graph, &dom);
        if loops.loops.is_empty() || loops.irreducible {
            trace!("no reducible loops");
            return Ok(false);
        }

        self.forest = LoopForest::from_analysis(&loops);
        self.forest.verify()?;
        let top = self.forest.top();
        let result = self.traverse_loops_inner_to_outer(graph, top);

        // Phase-local state does not outlive the run.
        self.forest = LoopForest::new();
        self.iset.clear();
        self.reductions.clear();
        self.vector = VectorState::default();

        let changed = result?;
        if changed {
            graph.verify()?;
        }
        Ok(changed)
    }

    // =========================================================================
    // Traversal
    // =========================================================================

    /// Visit `first` and its siblings, children before parents. Returns
    /// true if any visited loop changed.
    fn traverse_loops_inner_to_outer(
        &mut self,
        graph: &mut Graph,
        first: Option<LoopNodeId>,
    ) -> Result<bool, OptError> {
        let mut changed = false;
        let mut cursor = first;
        while let Some(node) = cursor {
            // Optimizing may unlink the node; remember where to go next.
            let next = self.forest.node(node).next;
            let inner = self.forest.node(node).inner;
            if self.traverse_loops_inner_to_outer(graph, inner)? {
                // Inner loops changed shape: rediscover this loop's blocks.
                self.refresh_loop_info(graph, node);
                changed = true;
            }

            if self.forest.resolve_try_catch_kind(graph, node) == TryCatchKind::HasTryCatch {
                debug!("loop {}: has try/catch, skipped", self.forest.node(node).info.header);
                cursor = next;
                continue;
            }
            self.stats.loops_analyzed += 1;

            if self.config.enable_simplify {
                loop {
                    self.simplified = false;
                    self.simplify_induction(graph, node);
                    self.simplify_blocks(graph, node);
                    changed = self.simplified || changed;
                    if !self.simplified {
                        break;
                    }
                }
            }

            if self.forest.node(node).inner.is_none() {
                changed = self.optimize_inner_loop(graph, node)? || changed;
            }
            cursor = next;
        }
        Ok(changed)
    }

    /// Recompute the detected facts of a loop whose header survived.
    fn refresh_loop_info(&mut self, graph: &Graph, node: LoopNodeId) {
        let header = self.forest.node(node).info.header;
        self.refresh_loop_info_at(graph, node, header);
    }

    /// Point `node` at the loop now headed by `header`.
    fn refresh_loop_info_at(&mut self, graph: &Graph, node: LoopNodeId, header: BlockId) {
        let dom = DominatorTree::build(graph);
        let loops = LoopAnalysis::compute(graph, &dom);
        if let Some(info) = loops.loops.into_iter().find(|l| l.header == header) {
            self.forest.node_mut(node).info = info;
        }
    }

    /// Refresh `node` and every loop enclosing it.
    fn refresh_loop_chain(&mut self, graph: &Graph, node: LoopNodeId) {
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            self.refresh_loop_info(graph, id);
            cursor = self.forest.node(id).outer;
        }
    }

    // =========================================================================
    // Innermost Loops
    // =========================================================================

    fn optimize_inner_loop(&mut self, graph: &mut Graph, node: LoopNodeId) -> Result<bool, OptError> {
        Ok(self.try_optimize_inner_loop_finite(graph, node)?
            || self.try_peeling_and_unrolling(graph, node))
    }

    /// Remove empty or single-trip loops, else try to vectorize.
    fn try_optimize_inner_loop_finite(
        &mut self,
        graph: &mut Graph,
        node: LoopNodeId,
    ) -> Result<bool, OptError> {
        let info = self.forest.node(node).info.clone();
        let header = info.header;
        let facts = LoopInductions::compute(graph, &info);
        let Some(preheader) = facts.preheader else {
            return Ok(false);
        };
        if !facts.is_finite() {
            return Ok(false);
        }
        let others: Vec<BlockId> = info.block_ids().filter(|&b| b != header).collect();
        let [body] = others.as_slice() else {
            return Ok(false);
        };
        let body = *body;
        let succs = graph.block(header).succs.clone();
        if succs.len() != 2 {
            return Ok(false);
        }
        let exit = if succs[0] == body { succs[1] } else { succs[0] };
        if graph.block(exit).preds.len() != 1 {
            return Ok(false);
        }
        let trip_count = facts.constant_trip_count();

        let Some(main_phi) = self.try_set_simple_loop_header(graph, &info, &facts) else {
            return Ok(false);
        };
        let is_empty = self.is_empty_body(graph, body);
        if self.reductions.is_empty()
            && (is_empty || trip_count == Some(1))
            && self.try_assign_last_value(graph, &info, &facts, main_phi, preheader, true)
        {
            if !is_empty {
                // The single iteration sees the initial index value.
                let init = facts
                    .induction(main_phi)
                    .map(|i| i.init)
                    .ok_or(OptError::BrokenForest { header })?;
                graph.replace_all_uses(main_phi, init);
                let moved: Vec<InstrId> = graph.block(body).instrs.clone();
                for id in moved {
                    if !graph.instr(id).op.is_terminator() {
                        graph.move_before_terminator(id, preheader);
                    }
                }
            }
            debug!(
                "loop {}: removed ({})",
                header,
                if is_empty { "empty body" } else { "single trip" }
            );
            let outer = self.forest.node(node).outer;
            remove_loop_blocks(graph, preheader, header, body, exit);
            self.forest.remove_loop(node);
            if let Some(outer) = outer {
                self.refresh_loop_chain(graph, outer);
            }
            self.stats.empty_loops_removed += 1;
            return Ok(true);
        }

        if self.config.vectorization_enabled()
            && self.should_vectorize(graph, &info, &facts, body, trip_count)?
            && self.try_assign_last_value(graph, &info, &facts, main_phi, preheader, true)
        {
            debug!("loop {}: vectorizing", header);
            self.vectorize(graph, node, &info, &facts, main_phi, body, exit, trip_count)?;
            self.stats.loops_vectorized += 1;
            return Ok(true);
        }
        Ok(false)
    }

    /// Detect reductions plus exactly one main induction phi controlling
    /// a header made of a single-use compare and its branch.
    fn try_set_simple_loop_header(
        &mut self,
        graph: &Graph,
        info: &LoopInfo,
        facts: &LoopInductions,
    ) -> Option<InstrId> {
        self.iset.clear();
        self.reductions.clear();
        let header = info.header;
        let mut main = None;
        for &phi in &graph.block(header).phis {
            if self.try_set_phi_reduction(graph, info, facts, phi) {
                continue;
            }
            if main.is_some() {
                return None;
            }
            main = Some(phi);
        }
        let phi = main?;
        if !self.try_set_phi_induction(graph, facts, phi, false) {
            return None;
        }
        let control = facts.control.as_ref()?;
        let instrs = &graph.block(header).instrs;
        if control.phi != phi
            || instrs.as_slice() != [control.cond, control.branch]
            || graph.uses(control.cond).len() != 1
        {
            return None;
        }
        self.iset.insert(control.cond);
        Some(phi)
    }

    /// Accept `x = x op ...` where the phi and its update only see each
    /// other inside the loop.
    fn try_set_phi_reduction(
        &mut self,
        graph: &Graph,
        info: &LoopInfo,
        facts: &LoopInductions,
        phi: InstrId,
    ) -> bool {
        if facts.induction(phi).is_some() {
            return false;
        }
        let Some(preheader) = facts.preheader else {
            return false;
        };
        let instr = graph.instr(phi);
        if instr.inputs.len() != 2 {
            return false;
        }
        let Some(pre_index) = graph.predecessor_index(info.header, preheader) else {
            return false;
        };
        let reduction = instr.input(1 - pre_index);
        if !has_reduction_format(graph, reduction, phi) {
            return false;
        }
        let mut use_count = 0;
        let single_use_inside_loop = graph.uses(reduction) == [phi]
            && self.is_only_used_after_loop(graph, info, phi, true, &mut use_count)
            && self.iset.len() == 1;
        self.iset.clear();
        if single_use_inside_loop {
            self.reductions.insert(reduction, phi);
            self.reductions.insert(phi, instr.input(pre_index));
        }
        single_use_inside_loop
    }

    /// Body holds nothing but loop bookkeeping.
    fn is_empty_body(&self, graph: &Graph, body: BlockId) -> bool {
        let bb = graph.block(body);
        bb.phis.is_empty()
            && bb
                .instrs
                .iter()
                .all(|id| matches!(graph.instr(*id).op, Op::Goto) || self.iset.contains(id))
    }
}

/// `phi = phi + x`, `x + phi`, `phi - x`, `min/max(phi, x)`.
fn has_reduction_format(graph: &Graph, reduction: InstrId, phi: InstrId) -> bool {
    let instr = graph.instr(reduction);
    let Some(op) = instr.binary_op() else {
        return false;
    };
    let (a, b) = (instr.input(0), instr.input(1));
    match op {
        BinOp::Add | BinOp::Min | BinOp::Max => (a == phi) != (b == phi),
        BinOp::Sub => a == phi && b != phi,
        _ => false,
    }
}

/// Unlink a removed loop: the preheader jumps straight to the exit.
fn remove_loop_blocks(graph: &mut Graph, preheader: BlockId, header: BlockId, body: BlockId, exit: BlockId) {
    graph.remove_edge(preheader, header);
    graph.move_edge_source(header, exit, preheader);
    graph.remove_block(body);
    graph.remove_block(header);
}

impl Default for LoopOptimization {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopOptimization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopOptimization")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl OptimizationPass for LoopOptimization {
    fn name(&self) -> &'static str {
        "LoopOptimization"
    }

    fn run(&mut self, graph: &mut Graph) -> bool {
        match self.try_run(graph) {
            Ok(changed) => changed,
            Err(err) => {
                error!("loop optimization aborted: {err}");
                debug_assert!(false, "loop optimization aborted: {err}");
                false
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
