//! Loop forest.
//!
//! The forest mirrors the loop nesting found by loop detection. Nodes live
//! in an [`Arena`] and link to each other through IDs:
//!
//! ```text
//!   top ── A ───────── D          outer:    parent (None at top level)
//!          │           │          inner:    first child
//!          B ── C      E          previous: sibling before
//!                                 next:     sibling after
//! ```
//!
//! The forest is not kept in sync with the graph automatically. The pass
//! adds and removes nodes as it creates and eliminates loops.

use crate::ir::arena::{Arena, Id};
use crate::ir::cfg::{LoopAnalysis, LoopInfo};
use crate::ir::graph::{BlockId, Graph};
use crate::opt::OptError;

/// Loop node identifier.
pub type LoopNodeId = Id<LoopNode>;

// =============================================================================
// Loop Node
// =============================================================================

/// Exception-handling classification of a loop, settled on first query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryCatchKind {
    Unknown,
    HasTryCatch,
    NoTryCatch,
}

/// One loop of the forest.
#[derive(Debug, Clone)]
pub struct LoopNode {
    pub info: LoopInfo,
    pub outer: Option<LoopNodeId>,
    pub inner: Option<LoopNodeId>,
    pub previous: Option<LoopNodeId>,
    pub next: Option<LoopNodeId>,
    pub try_catch_kind: TryCatchKind,
    /// Unlinked by [`LoopForest::remove_loop`].
    pub removed: bool,
}

impl LoopNode {
    fn new(info: LoopInfo) -> Self {
        LoopNode {
            info,
            outer: None,
            inner: None,
            previous: None,
            next: None,
            try_catch_kind: TryCatchKind::Unknown,
            removed: false,
        }
    }
}

// =============================================================================
// Loop Forest
// =============================================================================

/// All loops of one method, arena-allocated for the duration of a pass run.
#[derive(Debug, Clone)]
pub struct LoopForest {
    nodes: Arena<LoopNode>,
    top: Option<LoopNodeId>,
}

impl LoopForest {
    pub fn new() -> Self {
        LoopForest {
            nodes: Arena::new(),
            top: None,
        }
    }

    /// Build the forest from detected loops.
    pub fn from_analysis(analysis: &LoopAnalysis) -> Self {
        let mut forest = LoopForest::new();
        for info in &analysis.loops {
            forest.add_loop(info.clone());
        }
        forest
    }

    /// First top-level loop.
    #[inline]
    pub fn top(&self) -> Option<LoopNodeId> {
        self.top
    }

    #[inline]
    pub fn node(&self, id: LoopNodeId) -> &LoopNode {
        &self.nodes[id]
    }

    #[inline]
    pub fn node_mut(&mut self, id: LoopNodeId) -> &mut LoopNode {
        &mut self.nodes[id]
    }

    /// Number of linked nodes.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|(_, n)| !n.removed).count()
    }

    pub fn is_empty(&self) -> bool {
        self.top.is_none()
    }

    /// Direct children of `parent` (top-level loops for `None`) in order.
    pub fn children(&self, parent: Option<LoopNodeId>) -> Vec<LoopNodeId> {
        let mut out = Vec::new();
        let mut it = match parent {
            Some(p) => self.nodes[p].inner,
            None => self.top,
        };
        while let Some(id) = it {
            out.push(id);
            it = self.nodes[id].next;
        }
        out
    }

    /// Every linked node, parents before children.
    pub fn preorder(&self) -> Vec<LoopNodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<LoopNodeId> = self.children(None).into_iter().rev().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(Some(id)).into_iter().rev());
        }
        out
    }

    // =========================================================================
    // Insertion and Removal
    // =========================================================================

    /// Insert a loop below the innermost existing loop containing it.
    ///
    /// Existing loops nested in the new one at that level become its
    /// children; the new node goes last among its siblings.
    pub fn add_loop(&mut self, info: LoopInfo) -> LoopNodeId {
        let mut parent = None;
        loop {
            let found = self
                .children(parent)
                .into_iter()
                .find(|&n| info.is_in(&self.nodes[n].info));
            match found {
                Some(n) => parent = Some(n),
                None => break,
            }
        }

        let id = self.nodes.alloc(LoopNode::new(info));
        for sibling in self.children(parent) {
            if self.nodes[sibling].info.is_in(&self.nodes[id].info) {
                self.unlink(sibling);
                self.append_child(Some(id), sibling);
            }
        }
        self.append_child(parent, id);
        id
    }

    /// Unlink a node. Its children take its place in the sibling chain.
    pub fn remove_loop(&mut self, id: LoopNodeId) {
        let children = self.children(Some(id));
        let LoopNode {
            outer,
            previous,
            next,
            ..
        } = self.nodes[id];

        match (children.first(), children.last()) {
            (Some(&first), Some(&last)) => {
                for &child in &children {
                    self.nodes[child].outer = outer;
                }
                self.nodes[first].previous = previous;
                self.nodes[last].next = next;
                self.set_link_to(previous, outer, Some(first));
                if let Some(n) = next {
                    self.nodes[n].previous = Some(last);
                }
            }
            _ => self.unlink(id),
        }

        let node = &mut self.nodes[id];
        node.outer = None;
        node.inner = None;
        node.previous = None;
        node.next = None;
        node.removed = true;
    }

    /// Point whatever precedes a sibling slot (previous sibling, parent, or
    /// the top pointer) at `target`.
    fn set_link_to(
        &mut self,
        previous: Option<LoopNodeId>,
        outer: Option<LoopNodeId>,
        target: Option<LoopNodeId>,
    ) {
        match (previous, outer) {
            (Some(p), _) => self.nodes[p].next = target,
            (None, Some(o)) => self.nodes[o].inner = target,
            (None, None) => self.top = target,
        }
    }

    fn unlink(&mut self, id: LoopNodeId) {
        let LoopNode {
            outer,
            previous,
            next,
            ..
        } = self.nodes[id];
        self.set_link_to(previous, outer, next);
        if let Some(n) = next {
            self.nodes[n].previous = previous;
        }
        let node = &mut self.nodes[id];
        node.outer = None;
        node.previous = None;
        node.next = None;
    }

    fn append_child(&mut self, parent: Option<LoopNodeId>, id: LoopNodeId) {
        let last = self.children(parent).last().copied();
        self.nodes[id].outer = parent;
        self.nodes[id].previous = last;
        self.nodes[id].next = None;
        match last {
            Some(l) => self.nodes[l].next = Some(id),
            None => self.set_link_to(None, parent, Some(id)),
        }
    }

    // =========================================================================
    // Try/Catch Classification
    // =========================================================================

    /// Classify a loop once and cache the answer.
    ///
    /// A loop has try/catch if one of its blocks is covered by a handler,
    /// if an inner loop was found to have one, or if an enclosing loop
    /// has one, so a loop is never `NoTryCatch` inside a `HasTryCatch`
    /// loop.
    pub fn resolve_try_catch_kind(&mut self, graph: &Graph, id: LoopNodeId) -> TryCatchKind {
        let current = self.nodes[id].try_catch_kind;
        if current != TryCatchKind::Unknown {
            return current;
        }
        let has = self
            .children(Some(id))
            .iter()
            .any(|&c| self.nodes[c].try_catch_kind == TryCatchKind::HasTryCatch)
            || self.covers_try(graph, id)
            || self.ancestors(id).any(|a| {
                self.nodes[a].try_catch_kind == TryCatchKind::HasTryCatch || self.covers_try(graph, a)
            });
        let kind = if has {
            TryCatchKind::HasTryCatch
        } else {
            TryCatchKind::NoTryCatch
        };
        self.nodes[id].try_catch_kind = kind;
        kind
    }

    fn covers_try(&self, graph: &Graph, id: LoopNodeId) -> bool {
        self.nodes[id]
            .info
            .block_ids()
            .any(|b| graph.block(b).in_try)
    }

    fn ancestors(&self, id: LoopNodeId) -> impl Iterator<Item = LoopNodeId> + '_ {
        std::iter::successors(self.nodes[id].outer, move |&n| self.nodes[n].outer)
    }

    // =========================================================================
    // Integrity
    // =========================================================================

    /// Check that every link is mirrored, that parents contain their
    /// children, and that each live node is reached exactly once.
    pub fn verify(&self) -> Result<(), OptError> {
        let mut seen = crate::ir::arena::BitSet::new();
        let mut stack: Vec<Option<LoopNodeId>> = vec![None];
        let mut visited = 0;
        while let Some(parent) = stack.pop() {
            let mut previous = None;
            let mut it = match parent {
                Some(p) => self.nodes[p].inner,
                None => self.top,
            };
            while let Some(id) = it {
                let node = &self.nodes[id];
                let broken = OptError::BrokenForest {
                    header: node.info.header,
                };
                if seen.contains(id.as_usize())
                    || node.removed
                    || node.outer != parent
                    || node.previous != previous
                {
                    return Err(broken);
                }
                if let Some(p) = parent {
                    if !node.info.is_in(&self.nodes[p].info) {
                        return Err(broken);
                    }
                }
                seen.insert(id.as_usize());
                visited += 1;
                stack.push(Some(id));
                previous = Some(id);
                it = node.next;
            }
        }
        if visited != self.len() {
            let header = self
                .nodes
                .iter()
                .find(|(id, n)| !n.removed && !seen.contains(id.as_usize()))
                .map_or(BlockId::new(0), |(_, n)| n.info.header);
            return Err(OptError::BrokenForest { header });
        }
        Ok(())
    }
}

impl Default for LoopForest {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::arena::BitSet;
    use proptest::prelude::*;

    /// Loop facts over abstract block numbers: header plus body range.
    fn facts(header: u32, last: u32) -> LoopInfo {
        let mut blocks = BitSet::new();
        for b in header..=last {
            blocks.insert(b as usize);
        }
        LoopInfo {
            header: BlockId::new(header),
            blocks,
            back_edges: vec![BlockId::new(last)],
        }
    }

    #[test]
    fn test_nested_insertion_links() {
        let mut forest = LoopForest::new();
        let a = forest.add_loop(facts(1, 10));
        let b = forest.add_loop(facts(2, 4));
        let c = forest.add_loop(facts(5, 8));
        let d = forest.add_loop(facts(20, 30));

        assert_eq!(forest.top(), Some(a));
        assert_eq!(forest.children(None), vec![a, d]);
        assert_eq!(forest.children(Some(a)), vec![b, c]);
        assert_eq!(forest.node(c).previous, Some(b));
        assert_eq!(forest.node(b).outer, Some(a));
        assert_eq!(forest.preorder(), vec![a, b, c, d]);
        assert_eq!(forest.verify(), Ok(()));
    }

    #[test]
    fn test_inner_first_insertion_reparents() {
        let mut forest = LoopForest::new();
        let b = forest.add_loop(facts(2, 4));
        let c = forest.add_loop(facts(5, 8));
        let a = forest.add_loop(facts(1, 10));
        assert_eq!(forest.children(None), vec![a]);
        assert_eq!(forest.children(Some(a)), vec![b, c]);
        assert_eq!(forest.verify(), Ok(()));
    }

    #[test]
    fn test_remove_splices_children() {
        let mut forest = LoopForest::new();
        let a = forest.add_loop(facts(1, 10));
        let b = forest.add_loop(facts(2, 6));
        let c = forest.add_loop(facts(3, 4));
        let d = forest.add_loop(facts(8, 9));

        forest.remove_loop(b);
        assert!(forest.node(b).removed);
        assert_eq!(forest.children(Some(a)), vec![c, d]);
        assert_eq!(forest.node(c).outer, Some(a));
        assert_eq!(forest.verify(), Ok(()));

        forest.remove_loop(a);
        assert_eq!(forest.children(None), vec![c, d]);
        assert_eq!(forest.verify(), Ok(()));
    }

    #[test]
    fn test_try_catch_kind_inherited() {
        let mut g = Graph::new();
        for _ in 0..12 {
            g.add_block();
        }
        g.set_in_try(BlockId::new(9), true);

        let mut forest = LoopForest::new();
        let outer = forest.add_loop(facts(1, 10));
        let inner = forest.add_loop(facts(2, 4));
        let other = forest.add_loop(facts(11, 12));

        assert_eq!(forest.resolve_try_catch_kind(&g, inner), TryCatchKind::HasTryCatch);
        assert_eq!(forest.resolve_try_catch_kind(&g, outer), TryCatchKind::HasTryCatch);
        assert_eq!(forest.resolve_try_catch_kind(&g, other), TryCatchKind::NoTryCatch);

        // Settled: flipping the flag later does not change the answer.
        g.set_in_try(BlockId::new(12), true);
        assert_eq!(forest.resolve_try_catch_kind(&g, other), TryCatchKind::NoTryCatch);
    }

    /// Random well-nested intervals over 0..64.
    fn arb_intervals() -> impl Strategy<Value = Vec<(u32, u32)>> {
        prop::collection::vec((0u32..60, 1u32..16), 1..12).prop_map(|raw| {
            let mut out: Vec<(u32, u32)> = Vec::new();
            for (start, len) in raw {
                let cand = (start, (start + len).min(63));
                let nests = out.iter().all(|&(s, e)| {
                    let disjoint = cand.1 < s || e < cand.0;
                    let inside = s < cand.0 && cand.1 <= e;
                    let outside = cand.0 < s && e <= cand.1;
                    disjoint || inside || outside
                });
                if nests && out.iter().all(|&(s, _)| s != cand.0) {
                    out.push(cand);
                }
            }
            out
        })
    }

    /// Innermost interval strictly containing `header` in `live`.
    fn expected_outer(live: &[(u32, u32)], (s, e): (u32, u32)) -> Option<u32> {
        live.iter()
            .filter(|&&(os, oe)| os < s && e <= oe)
            .max_by_key(|&&(os, _)| os)
            .map(|&(os, _)| os)
    }

    proptest! {
        #[test]
        fn test_forest_integrity_under_add_remove(
            intervals in arb_intervals(),
            removals in prop::collection::vec(any::<prop::sample::Index>(), 0..6),
        ) {
            let mut forest = LoopForest::new();
            let mut live: Vec<((u32, u32), LoopNodeId)> = Vec::new();
            for &(s, e) in &intervals {
                let id = forest.add_loop(facts(s, e));
                live.push(((s, e), id));
            }
            prop_assert_eq!(forest.verify(), Ok(()));

            for index in removals {
                if live.is_empty() {
                    break;
                }
                let (_, id) = live.remove(index.index(live.len()));
                forest.remove_loop(id);
                prop_assert_eq!(forest.verify(), Ok(()));
            }

            let spans: Vec<(u32, u32)> = live.iter().map(|&(span, _)| span).collect();
            for &(span, id) in &live {
                let outer = forest.node(id).outer.map(|o| forest.node(o).info.header.index());
                prop_assert_eq!(outer, expected_outer(&spans, span));
            }
            prop_assert_eq!(forest.preorder().len(), live.len());
        }

        #[test]
        fn test_try_catch_never_clears_under_try_ancestor(
            intervals in arb_intervals(),
            protected in prop::collection::vec(0u32..64, 0..4),
        ) {
            let mut g = Graph::new();
            for _ in 0..64 {
                g.add_block();
            }
            for &b in &protected {
                g.set_in_try(BlockId::new(b), true);
            }
            let mut forest = LoopForest::new();
            for &(s, e) in &intervals {
                forest.add_loop(facts(s, e));
            }
            let order = forest.preorder();
            let first: Vec<_> = order.iter().map(|&n| forest.resolve_try_catch_kind(&g, n)).collect();
            let again: Vec<_> = order.iter().map(|&n| forest.resolve_try_catch_kind(&g, n)).collect();
            prop_assert_eq!(&first, &again);
            for &n in &order {
                if let Some(o) = forest.node(n).outer {
                    if forest.node(o).try_catch_kind == TryCatchKind::HasTryCatch {
                        prop_assert_eq!(forest.node(n).try_catch_kind, TryCatchKind::HasTryCatch);
                    }
                }
            }
        }
    }
}
