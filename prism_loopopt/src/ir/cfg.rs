//! Control flow analyses over the block graph.
//!
//! - **Reverse postorder** of the reachable blocks
//! - **Dominator tree** (Cooper-Harvey-Kennedy iterative algorithm)
//! - **Natural loop detection**: back edges are edges whose target
//!   dominates their source; a loop body is everything that reaches a back
//!   edge without passing through the header. Retreating edges that are not
//!   back edges mark the graph irreducible.

use super::arena::{BitSet, SecondaryMap};
use super::graph::{Block, BlockId, Graph};

// =============================================================================
// Dominator Tree
// =============================================================================

/// Immediate dominators plus the reverse postorder they were computed on.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    idom: SecondaryMap<Block, Option<BlockId>>,
    rpo_number: SecondaryMap<Block, Option<u32>>,
    rpo: Vec<BlockId>,
}

impl DominatorTree {
    /// Build the dominator tree of the blocks reachable from the entry.
    pub fn build(graph: &Graph) -> Self {
        let rpo = reverse_postorder(graph);
        let mut rpo_number = SecondaryMap::with_capacity(graph.block_capacity());
        for (i, &block) in rpo.iter().enumerate() {
            rpo_number.set(block, Some(i as u32));
        }

        let mut dom = DominatorTree {
            idom: SecondaryMap::with_capacity(graph.block_capacity()),
            rpo_number,
            rpo,
        };
        let entry = graph.entry();
        dom.idom.set(entry, Some(entry));

        let mut changed = true;
        while changed {
            changed = false;
            for &block in dom.rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &pred in &graph.block(block).preds {
                    if dom.idom.get(pred).copied().flatten().is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => dom.intersect(pred, current),
                    });
                }
                if new_idom.is_some() && dom.idom.get(block).copied().flatten() != new_idom {
                    dom.idom.set(block, new_idom);
                    changed = true;
                }
            }
        }
        dom
    }

    fn number(&self, block: BlockId) -> u32 {
        self.rpo_number.get(block).copied().flatten().unwrap_or(u32::MAX)
    }

    fn intersect(&self, mut b1: BlockId, mut b2: BlockId) -> BlockId {
        while b1 != b2 {
            while self.number(b1) > self.number(b2) {
                match self.idom.get(b1).copied().flatten() {
                    Some(up) => b1 = up,
                    None => return b2,
                }
            }
            while self.number(b2) > self.number(b1) {
                match self.idom.get(b2).copied().flatten() {
                    Some(up) => b2 = up,
                    None => return b1,
                }
            }
        }
        b1
    }

    /// Reachable blocks in reverse postorder.
    pub fn rpo(&self) -> &[BlockId] {
        &self.rpo
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.rpo_number.get(block).copied().flatten().is_some()
    }

    /// Immediate dominator; `None` for the entry and unreachable blocks.
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom
            .get(block)
            .copied()
            .flatten()
            .filter(|&idom| idom != block)
    }

    /// Check if `a` dominates `b` (reflexive).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        let mut current = b;
        while let Some(idom) = self.idom(current) {
            if idom == a {
                return true;
            }
            current = idom;
        }
        false
    }
}

/// Reverse postorder of blocks reachable from the entry.
pub fn reverse_postorder(graph: &Graph) -> Vec<BlockId> {
    let mut visited = BitSet::with_capacity(graph.block_capacity());
    let mut postorder = Vec::new();
    // Explicit stack of (block, next successor index).
    let mut stack: Vec<(BlockId, usize)> = vec![(graph.entry(), 0)];
    visited.insert(graph.entry().as_usize());

    while let Some(top) = stack.last_mut() {
        let block = top.0;
        let succs = &graph.block(block).succs;
        if top.1 < succs.len() {
            let succ = succs[top.1];
            top.1 += 1;
            if !visited.contains(succ.as_usize()) {
                visited.insert(succ.as_usize());
                stack.push((succ, 0));
            }
        } else {
            postorder.push(block);
            stack.pop();
        }
    }
    postorder.reverse();
    postorder
}

// =============================================================================
// Loop Detection
// =============================================================================

/// Facts about one natural loop.
#[derive(Debug, Clone)]
pub struct LoopInfo {
    pub header: BlockId,
    /// Header plus every block of the body, nested loops included.
    pub blocks: BitSet,
    /// Sources of the edges jumping back to the header.
    pub back_edges: Vec<BlockId>,
}

impl LoopInfo {
    #[inline]
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains(block.as_usize())
    }

    /// True if `self` is nested in (or equal to) `other`.
    pub fn is_in(&self, other: &LoopInfo) -> bool {
        other.contains(self.header)
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().map(|i| BlockId::new(i as u32))
    }

    pub fn add_block(&mut self, block: BlockId) {
        self.blocks.insert(block.as_usize());
    }

    pub fn remove_block(&mut self, block: BlockId) {
        self.blocks.remove(block.as_usize());
    }

    /// The single outside predecessor of the header.
    pub fn preheader(&self, graph: &Graph) -> Option<BlockId> {
        let mut outside = graph
            .block(self.header)
            .preds
            .iter()
            .copied()
            .filter(|&p| !self.contains(p));
        let first = outside.next()?;
        match outside.next() {
            None => Some(first),
            Some(_) => None,
        }
    }

    /// The single back edge source, if there is exactly one.
    pub fn latch(&self) -> Option<BlockId> {
        match self.back_edges.as_slice() {
            [single] => Some(*single),
            _ => None,
        }
    }
}

/// All natural loops of a graph.
#[derive(Debug, Clone, Default)]
pub struct LoopAnalysis {
    /// Loops ordered by header position in reverse postorder, so an
    /// enclosing loop always precedes the loops nested in it.
    pub loops: Vec<LoopInfo>,
    /// A retreating edge that is not a back edge was seen.
    pub irreducible: bool,
}

impl LoopAnalysis {
    pub fn compute(graph: &Graph, dom: &DominatorTree) -> Self {
        let mut analysis = LoopAnalysis::default();
        let mut header_index: Vec<(BlockId, usize)> = Vec::new();
        let position: SecondaryMap<Block, usize> = {
            let mut map = SecondaryMap::with_capacity(graph.block_capacity());
            for (i, &b) in dom.rpo().iter().enumerate() {
                map.set(b, i);
            }
            map
        };

        for &block in dom.rpo() {
            for &succ in &graph.block(block).succs {
                let retreating = position.get(succ).copied().unwrap_or(0)
                    <= position.get(block).copied().unwrap_or(0);
                if dom.dominates(succ, block) {
                    let slot = header_index.iter().find(|(h, _)| *h == succ).map(|&(_, i)| i);
                    match slot {
                        Some(i) => {
                            let info = &mut analysis.loops[i];
                            if !info.back_edges.contains(&block) {
                                info.back_edges.push(block);
                            }
                            collect_body(graph, dom, succ, block, &mut info.blocks);
                        }
                        None => {
                            let mut blocks = BitSet::with_capacity(graph.block_capacity());
                            blocks.insert(succ.as_usize());
                            collect_body(graph, dom, succ, block, &mut blocks);
                            header_index.push((succ, analysis.loops.len()));
                            analysis.loops.push(LoopInfo {
                                header: succ,
                                blocks,
                                back_edges: vec![block],
                            });
                        }
                    }
                } else if retreating {
                    analysis.irreducible = true;
                }
            }
        }

        analysis
            .loops
            .sort_by_key(|info| position.get(info.header).copied().unwrap_or(usize::MAX));
        analysis
    }
}

/// Add every block reaching `latch` without passing `header` to `body`.
fn collect_body(
    graph: &Graph,
    dom: &DominatorTree,
    header: BlockId,
    latch: BlockId,
    body: &mut BitSet,
) {
    let mut worklist = vec![latch];
    while let Some(block) = worklist.pop() {
        if block == header || body.contains(block.as_usize()) || !dom.is_reachable(block) {
            continue;
        }
        body.insert(block.as_usize());
        worklist.extend(graph.block(block).preds.iter().copied());
    }
}

// =============================================================================
// Tests
// =============================================================================
