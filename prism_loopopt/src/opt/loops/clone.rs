//! Loop body replication for peeling and unrolling.
//!
//! A copy duplicates every block of a loop together with its phis and
//! instructions. Values flowing out of the loop are first gathered into
//! phis of the single exit block, so every outside use is reached along
//! an edge and a copy only has to extend those phis.
//!
//! # Shapes
//!
//! ```text
//!   peel:    preheader -> copy(header..latch) -> header .. latch -> header
//!   unroll:  header .. latch -> copy(header..latch) -> header
//! ```

use log::trace;
use rustc_hash::FxHashMap;

use crate::ir::cfg::LoopInfo;
use crate::ir::graph::{BlockId, Graph};
use crate::ir::instr::{InstrId, Op};

// =============================================================================
// Clone Maps
// =============================================================================

/// Original to copied blocks and values of one replication.
#[derive(Debug, Clone, Default)]
pub struct CloneMaps {
    pub blocks: FxHashMap<BlockId, BlockId>,
    pub values: FxHashMap<InstrId, InstrId>,
}

impl CloneMaps {
    /// Copy of `id`, or `id` itself when it lives outside the loop.
    pub fn value(&self, id: InstrId) -> InstrId {
        self.values.get(&id).copied().unwrap_or(id)
    }

    pub fn block(&self, id: BlockId) -> BlockId {
        self.blocks.get(&id).copied().unwrap_or(id)
    }
}

// =============================================================================
// Clonability
// =============================================================================

/// Values defined in the loop and used outside it other than along an
/// exit edge.
fn live_outs(graph: &Graph, info: &LoopInfo) -> Vec<InstrId> {
    let mut result = Vec::new();
    for block in info.block_ids() {
        let bb = graph.block(block);
        for &id in bb.phis.iter().chain(&bb.instrs) {
            let escapes = graph.uses(id).iter().any(|&user| {
                let Some(user_block) = graph.block_of(user) else {
                    return false;
                };
                if info.contains(user_block) {
                    return false;
                }
                !is_edge_use(graph, info, user, id)
            });
            if escapes {
                result.push(id);
            }
        }
    }
    result
}

/// `user` is an exit phi that only reads `value` along edges leaving the loop.
fn is_edge_use(graph: &Graph, info: &LoopInfo, user: InstrId, value: InstrId) -> bool {
    let instr = graph.instr(user);
    let Some(block) = instr.block.filter(|_| instr.is_phi()) else {
        return false;
    };
    let preds = &graph.block(block).preds;
    instr
        .inputs
        .iter()
        .enumerate()
        .filter(|(_, &input)| input == value)
        .all(|(slot, _)| preds.get(slot).is_some_and(|&p| info.contains(p)))
}

fn exit_blocks(graph: &Graph, info: &LoopInfo) -> Vec<BlockId> {
    let mut exits = Vec::new();
    for block in info.block_ids() {
        for &succ in &graph.block(block).succs {
            if !info.contains(succ) && !exits.contains(&succ) {
                exits.push(succ);
            }
        }
    }
    exits
}

/// Whether the loop can be replicated by [`peel_first_iteration`] and
/// [`unroll_once`].
pub fn is_loop_clonable(graph: &Graph, info: &LoopInfo) -> bool {
    let header = info.header;
    if info.preheader(graph).is_none()
        || info.latch().is_none()
        || graph.block(header).preds.len() != 2
    {
        return false;
    }
    for block in info.block_ids() {
        let bb = graph.block(block);
        if bb.in_try {
            return false;
        }
        if bb.instrs.iter().any(|&id| !graph.instr(id).is_clonable()) {
            return false;
        }
    }
    if live_outs(graph, info).is_empty() {
        return true;
    }
    // Escaping values need one exit block to gather them in.
    match exit_blocks(graph, info).as_slice() {
        [exit] => graph.block(*exit).preds.iter().all(|&p| info.contains(p)),
        _ => false,
    }
}

/// Route every escaping value through a phi in the single exit block.
fn close_loop_ssa(graph: &mut Graph, info: &LoopInfo) {
    let escaping = live_outs(graph, info);
    let exits = exit_blocks(graph, info);
    let [exit] = exits.as_slice() else {
        return;
    };
    let exit = *exit;
    for value in escaping {
        let phi = graph.add_phi(exit, graph.ty(value));
        for _ in 0..graph.block(exit).preds.len() {
            graph.add_input(phi, value);
        }
        let users: Vec<InstrId> = graph.uses(value).to_vec();
        for user in users {
            if user == phi || graph.block_of(user).map_or(true, |b| info.contains(b)) {
                continue;
            }
            if is_edge_use(graph, info, user, value) {
                continue;
            }
            graph.replace_uses_where(value, phi, |u| u == user);
        }
        trace!("gathered live-out {} into exit phi {}", value, phi);
    }
}

// =============================================================================
// Replication
// =============================================================================

/// Copy all loop blocks. Header phis are not copied: `header_values`
/// gives what they stand for in the copy. The copied back edge jumps to
/// the original header without a phi input; the caller supplies it.
fn copy_loop_blocks(
    graph: &mut Graph,
    info: &LoopInfo,
    header_values: &FxHashMap<InstrId, InstrId>,
) -> CloneMaps {
    let header = info.header;
    let mut maps = CloneMaps {
        blocks: FxHashMap::default(),
        values: header_values.clone(),
    };
    let blocks: Vec<BlockId> = info.block_ids().collect();
    for &block in &blocks {
        let copy = graph.add_block();
        maps.blocks.insert(block, copy);
    }

    // Create first, remap once every copy exists.
    let mut created = Vec::new();
    for &block in &blocks {
        let bb = graph.block(block);
        let phis = if block == header { Vec::new() } else { bb.phis.clone() };
        let originals: Vec<InstrId> = phis.into_iter().chain(bb.instrs.iter().copied()).collect();
        for id in originals {
            let instr = graph.instr(id);
            let (op, ty, inputs, shape) = (instr.op, instr.ty, instr.inputs.to_vec(), instr.vec);
            let copy = graph.create(op, ty, &inputs);
            graph.set_vec_shape(copy, shape);
            graph.append(maps.blocks[&block], copy);
            maps.values.insert(id, copy);
            created.push(copy);
        }
    }
    for &copy in &created {
        for index in 0..graph.instr(copy).inputs.len() {
            let input = graph.instr(copy).input(index);
            let mapped = maps.value(input);
            graph.replace_input(copy, index, mapped);
        }
    }

    for &block in &blocks {
        let from = maps.blocks[&block];
        let succs = graph.block(block).succs.clone();
        for (position, &succ) in succs.iter().enumerate() {
            if succ == header {
                graph.add_edge(from, header);
            } else if info.contains(succ) {
                graph.add_edge(from, maps.blocks[&succ]);
            } else {
                // Exit edge: the new predecessor reads the copied value.
                let nth = succs[..position].iter().filter(|&&s| s == succ).count();
                let slot = nth_position(&graph.block(succ).preds, block, nth);
                graph.add_edge(from, succ);
                if let Some(slot) = slot {
                    for phi in graph.block(succ).phis.clone() {
                        let value = maps.value(graph.instr(phi).input(slot));
                        graph.add_input(phi, value);
                    }
                }
            }
        }
    }

    // Predecessor order of copied blocks follows edge creation order.
    for &block in &blocks {
        if block == header {
            continue;
        }
        let copy = maps.blocks[&block];
        let old_preds = graph.block(block).preds.clone();
        let new_preds = graph.block(copy).preds.clone();
        for phi in graph.block(block).phis.clone() {
            let phi_copy = maps.value(phi);
            for (slot, &pred_copy) in new_preds.iter().enumerate() {
                let pred = maps
                    .blocks
                    .iter()
                    .find(|(_, &c)| c == pred_copy)
                    .map_or(pred_copy, |(&orig, _)| orig);
                let nth = new_preds[..slot].iter().filter(|&&p| p == pred_copy).count();
                if let Some(old_slot) = nth_position(&old_preds, pred, nth) {
                    let value = maps.value(graph.instr(phi).input(old_slot));
                    graph.replace_input(phi_copy, slot, value);
                }
            }
        }
    }
    maps
}

fn nth_position(list: &[BlockId], item: BlockId, nth: usize) -> Option<usize> {
    list.iter()
        .enumerate()
        .filter(|(_, &b)| b == item)
        .nth(nth)
        .map(|(i, _)| i)
}

/// Slots of the preheader and latch edges in the header.
fn header_slots(graph: &Graph, info: &LoopInfo) -> Option<(BlockId, BlockId, usize, usize)> {
    let preheader = info.preheader(graph)?;
    let latch = info.latch()?;
    let pre_slot = graph.predecessor_index(info.header, preheader)?;
    let latch_slot = graph.predecessor_index(info.header, latch)?;
    Some((preheader, latch, pre_slot, latch_slot))
}

/// Execute the first iteration in a copy placed before the loop. The
/// copy's latch becomes the loop's new preheader.
pub fn peel_first_iteration(graph: &mut Graph, info: &LoopInfo) -> Option<CloneMaps> {
    close_loop_ssa(graph, info);
    let header = info.header;
    let (preheader, _, pre_slot, latch_slot) = header_slots(graph, info)?;
    let phis = graph.block(header).phis.clone();
    let header_values: FxHashMap<InstrId, InstrId> = phis
        .iter()
        .map(|&phi| (phi, graph.instr(phi).input(pre_slot)))
        .collect();

    let maps = copy_loop_blocks(graph, info, &header_values);
    for &phi in &phis {
        let value = maps.value(graph.instr(phi).input(latch_slot));
        graph.add_input(phi, value);
    }
    graph.replace_successor(preheader, header, maps.block(header));
    Some(maps)
}

/// Chain a second copy of the body behind the first. The original latch
/// enters the copy, whose latch closes the loop.
pub fn unroll_once(graph: &mut Graph, info: &LoopInfo) -> Option<CloneMaps> {
    close_loop_ssa(graph, info);
    let header = info.header;
    let (_, latch, _, latch_slot) = header_slots(graph, info)?;
    let phis = graph.block(header).phis.clone();
    let header_values: FxHashMap<InstrId, InstrId> = phis
        .iter()
        .map(|&phi| (phi, graph.instr(phi).input(latch_slot)))
        .collect();

    let maps = copy_loop_blocks(graph, info, &header_values);
    let carried: Vec<InstrId> = phis
        .iter()
        .map(|&phi| maps.value(graph.instr(phi).input(latch_slot)))
        .collect();
    for (&phi, value) in phis.iter().zip(carried) {
        graph.add_input(phi, value);
    }
    graph.replace_successor(latch, header, maps.block(header));
    Some(maps)
}

/// Turn the loop test in `block` into a jump to its in-loop successor
/// (`stay`) or its exit, dropping the test when it becomes dead.
pub fn fold_loop_test(graph: &mut Graph, info: &LoopInfo, block: BlockId, original: BlockId, stay: bool) {
    let Some(term) = graph.terminator(block) else {
        return;
    };
    if !matches!(graph.instr(term).op, Op::If) {
        return;
    }
    let cond = graph.instr(term).input(0);
    let first_in_loop = graph
        .block(original)
        .succs
        .first()
        .is_some_and(|&s| info.contains(s));
    graph.fold_branch(block, first_in_loop == stay);
    if !graph.has_uses(cond) && graph.block_of(cond).is_some_and(|b| info.contains(b) || b == block) {
        graph.remove_instr(cond);
    }
}

// =============================================================================
// Tests
// =============================================================================
