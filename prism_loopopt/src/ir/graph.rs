//! Block-structured SSA graph.
//!
//! The graph provides:
//! - **Arena storage** for instructions and blocks, addressed by typed IDs
//! - **Def-use chains** kept in sync by every input mutation
//! - **Explicit basic blocks** with phis, an ordered instruction list whose
//!   last element is the terminator, and predecessor/successor lists
//! - **Interned constants** living at the top of the entry block
//!
//! # Invariants
//!
//! - Input `k` of every phi in a block flows in from predecessor `k`.
//! - Edges are symmetric: `b` is in `s.preds` exactly as often as `s` is in
//!   `b.succs`.
//! - An `If` terminator has two successors (true first), a `Goto` one, a
//!   `Return` none.

use rustc_hash::FxHashMap;
use thiserror::Error;

use super::arena::{Arena, Id, SecondaryMap};
use super::instr::{BinOp, CmpOp, Instr, InstrId, Op, VecShape};
use super::types::DataType;

/// Block identifier.
pub type BlockId = Id<Block>;

// =============================================================================
// Basic Block
// =============================================================================

/// A basic block.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub phis: Vec<InstrId>,
    /// Non-phi instructions; the last one is the terminator once built.
    pub instrs: Vec<InstrId>,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    /// Covered by an exception handler.
    pub in_try: bool,
    pub removed: bool,
}

// =============================================================================
// Errors
// =============================================================================

/// Structural inconsistency found by [`Graph::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("edge {from} -> {to} is not mirrored in the predecessor list")]
    AsymmetricEdge { from: BlockId, to: BlockId },
    #[error("phi {phi} in block {block} has {inputs} inputs for {preds} predecessors")]
    PhiArity {
        phi: InstrId,
        block: BlockId,
        inputs: usize,
        preds: usize,
    },
    #[error("block {block} does not end in a terminator")]
    MissingTerminator { block: BlockId },
    #[error("terminator of block {block} expects {expected} successors, found {found}")]
    SuccessorCount {
        block: BlockId,
        expected: usize,
        found: usize,
    },
    #[error("instruction {instr} uses detached instruction {input}")]
    DanglingInput { instr: InstrId, input: InstrId },
    #[error("use list of {instr} is out of sync with its users")]
    UseListMismatch { instr: InstrId },
    #[error("instruction {instr} is listed in block {block} but records another block")]
    BlockMismatch { instr: InstrId, block: BlockId },
}

// =============================================================================
// Graph
// =============================================================================

/// A method body in SSA form.
#[derive(Debug, Clone)]
pub struct Graph {
    instrs: Arena<Instr>,
    blocks: Arena<Block>,
    uses: SecondaryMap<Instr, Vec<InstrId>>,
    entry: BlockId,
    constants: FxHashMap<(DataType, i64), InstrId>,
}

impl Graph {
    /// Create a graph holding only an empty entry block.
    pub fn new() -> Self {
        let mut blocks = Arena::new();
        let entry = blocks.alloc(Block::default());
        Graph {
            instrs: Arena::new(),
            blocks,
            uses: SecondaryMap::new(),
            entry,
            constants: FxHashMap::default(),
        }
    }

    #[inline]
    pub fn entry(&self) -> BlockId {
        self.entry
    }

    // =========================================================================
    // Access
    // =========================================================================

    #[inline]
    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id]
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    /// Type of an instruction's result.
    #[inline]
    pub fn ty(&self, id: InstrId) -> DataType {
        self.instrs[id].ty
    }

    /// Containing block, `None` for detached instructions.
    #[inline]
    pub fn block_of(&self, id: InstrId) -> Option<BlockId> {
        self.instrs[id].block
    }

    #[inline]
    pub fn uses(&self, id: InstrId) -> &[InstrId] {
        self.uses.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    #[inline]
    pub fn has_uses(&self, id: InstrId) -> bool {
        !self.uses(id).is_empty()
    }

    /// Live blocks in allocation order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks
            .iter()
            .filter(|(_, b)| !b.removed)
            .map(|(id, _)| id)
    }

    /// Total number of block slots, including removed ones.
    pub fn block_capacity(&self) -> usize {
        self.blocks.len()
    }

    /// Terminator of a block, if it has one.
    pub fn terminator(&self, block: BlockId) -> Option<InstrId> {
        self.blocks[block]
            .instrs
            .last()
            .copied()
            .filter(|&i| self.instrs[i].op.is_terminator())
    }

    pub fn set_in_try(&mut self, block: BlockId, in_try: bool) {
        self.blocks[block].in_try = in_try;
    }

    /// Number of live non-phi instructions in all blocks.
    pub fn instruction_count(&self) -> usize {
        self.blocks()
            .map(|b| self.blocks[b].instrs.len())
            .sum()
    }

    // =========================================================================
    // Instruction Creation
    // =========================================================================

    /// Create a detached instruction and register its uses.
    pub fn create(&mut self, op: Op, ty: DataType, inputs: &[InstrId]) -> InstrId {
        let id = self.instrs.alloc(Instr::new(op, ty, inputs));
        for &input in inputs {
            self.uses.entry(input).push(id);
        }
        id
    }

    /// Create a detached vector instruction.
    pub fn create_vec(
        &mut self,
        op: Op,
        ty: DataType,
        inputs: &[InstrId],
        shape: VecShape,
    ) -> InstrId {
        let id = self.create(op, ty, inputs);
        self.instrs[id].vec = Some(shape);
        id
    }

    /// Set the lane layout of an instruction.
    pub fn set_vec_shape(&mut self, id: InstrId, shape: Option<VecShape>) {
        self.instrs[id].vec = shape;
    }

    /// Create an instruction and place it before the block terminator
    /// (or at the end if the block is still open).
    pub fn emit(&mut self, block: BlockId, op: Op, ty: DataType, inputs: &[InstrId]) -> InstrId {
        let id = self.create(op, ty, inputs);
        self.insert_before_terminator(block, id);
        id
    }

    /// Interned integral constant, kept at the top of the entry block.
    pub fn const_int(&mut self, ty: DataType, value: i64) -> InstrId {
        let value = ty.normalize(value);
        if let Some(&id) = self.constants.get(&(ty, value)) {
            return id;
        }
        let id = self.create(Op::Const(value), ty, &[]);
        let entry = self.entry;
        self.blocks[entry].instrs.insert(0, id);
        self.instrs[id].block = Some(entry);
        self.constants.insert((ty, value), id);
        id
    }

    /// Floating point constant, kept at the top of the entry block.
    pub fn const_float(&mut self, ty: DataType, value: f64) -> InstrId {
        let id = self.create(Op::FloatConst(value.to_bits()), ty, &[]);
        let entry = self.entry;
        self.blocks[entry].instrs.insert(0, id);
        self.instrs[id].block = Some(entry);
        id
    }

    /// Method parameter, defined in the entry block.
    pub fn param(&mut self, index: u32, ty: DataType) -> InstrId {
        let entry = self.entry;
        self.emit(entry, Op::Param(index), ty, &[])
    }

    pub fn binary(
        &mut self,
        block: BlockId,
        op: BinOp,
        ty: DataType,
        lhs: InstrId,
        rhs: InstrId,
    ) -> InstrId {
        self.emit(block, Op::Binary(op), ty, &[lhs, rhs])
    }

    pub fn compare(&mut self, block: BlockId, op: CmpOp, lhs: InstrId, rhs: InstrId) -> InstrId {
        self.emit(block, Op::Compare(op), DataType::Bool, &[lhs, rhs])
    }

    /// Create an input-less phi at the end of the block's phi list.
    pub fn add_phi(&mut self, block: BlockId, ty: DataType) -> InstrId {
        let id = self.create(Op::Phi, ty, &[]);
        self.blocks[block].phis.push(id);
        self.instrs[id].block = Some(block);
        id
    }

    // =========================================================================
    // Terminators
    // =========================================================================

    /// End `block` with a jump to `target`.
    pub fn goto(&mut self, block: BlockId, target: BlockId) {
        let id = self.create(Op::Goto, DataType::Void, &[]);
        self.append(block, id);
        self.add_edge(block, target);
    }

    /// End `block` with a branch: `if_true` is successor 0, `if_false` 1.
    pub fn branch(&mut self, block: BlockId, cond: InstrId, if_true: BlockId, if_false: BlockId) {
        let id = self.create(Op::If, DataType::Void, &[cond]);
        self.append(block, id);
        self.add_edge(block, if_true);
        self.add_edge(block, if_false);
    }

    pub fn ret(&mut self, block: BlockId, value: Option<InstrId>) {
        let inputs: Vec<InstrId> = value.into_iter().collect();
        let id = self.create(Op::Return, DataType::Void, &inputs);
        self.append(block, id);
    }

    /// Replace an `If` whose outcome is known by a `Goto` to the taken
    /// successor, dropping the other edge.
    pub fn fold_branch(&mut self, block: BlockId, taken: bool) {
        let Some(term) = self.terminator(block) else {
            return;
        };
        if !matches!(self.instrs[term].op, Op::If) {
            return;
        }
        let succs = self.blocks[block].succs.clone();
        let (keep, drop) = if taken {
            (succs[0], succs[1])
        } else {
            (succs[1], succs[0])
        };
        self.remove_instr(term);
        self.remove_edge(block, drop);
        let goto = self.create(Op::Goto, DataType::Void, &[]);
        self.append(block, goto);
        debug_assert_eq!(self.blocks[block].succs, vec![keep]);
    }

    // =========================================================================
    // Placement
    // =========================================================================

    /// Append at the end of a block (phis go to the phi list).
    pub fn append(&mut self, block: BlockId, id: InstrId) {
        debug_assert!(self.instrs[id].block.is_none());
        if self.instrs[id].is_phi() {
            self.blocks[block].phis.push(id);
        } else {
            self.blocks[block].instrs.push(id);
        }
        self.instrs[id].block = Some(block);
    }

    pub fn insert_before_terminator(&mut self, block: BlockId, id: InstrId) {
        if self.instrs[id].is_phi() {
            return self.append(block, id);
        }
        let pos = match self.terminator(block) {
            Some(_) => self.blocks[block].instrs.len() - 1,
            None => self.blocks[block].instrs.len(),
        };
        self.blocks[block].instrs.insert(pos, id);
        self.instrs[id].block = Some(block);
    }

    /// Insert as the first non-phi instruction of a block.
    pub fn insert_at_start(&mut self, block: BlockId, id: InstrId) {
        self.blocks[block].instrs.insert(0, id);
        self.instrs[id].block = Some(block);
    }

    /// Insert right after `anchor` in the anchor's block.
    pub fn insert_after(&mut self, anchor: InstrId, id: InstrId) {
        let Some(block) = self.instrs[anchor].block else {
            return;
        };
        let list = &mut self.blocks[block].instrs;
        let pos = list.iter().position(|&i| i == anchor).map_or(list.len(), |p| p + 1);
        list.insert(pos, id);
        self.instrs[id].block = Some(block);
    }

    // =========================================================================
    // Def-Use Mutation
    // =========================================================================

    fn remove_use(&mut self, def: InstrId, user: InstrId) {
        let list = self.uses.entry(def);
        if let Some(pos) = list.iter().position(|&u| u == user) {
            list.swap_remove(pos);
        }
    }

    /// Append an input (phis only in practice).
    pub fn add_input(&mut self, id: InstrId, value: InstrId) {
        self.instrs[id].inputs.push(value);
        self.uses.entry(value).push(id);
    }

    pub fn replace_input(&mut self, id: InstrId, index: usize, new_input: InstrId) {
        let old = self.instrs[id].inputs[index];
        if old == new_input {
            return;
        }
        self.remove_use(old, id);
        self.instrs[id].inputs[index] = new_input;
        self.uses.entry(new_input).push(id);
    }

    fn remove_input(&mut self, id: InstrId, index: usize) {
        let old = self.instrs[id].inputs.remove(index);
        self.remove_use(old, id);
    }

    /// Redirect every use of `old` to `new`.
    pub fn replace_all_uses(&mut self, old: InstrId, new: InstrId) {
        self.replace_uses_where(old, new, |_| true);
    }

    /// Redirect the uses of `old` whose user satisfies `filter`.
    pub fn replace_uses_where<F>(&mut self, old: InstrId, new: InstrId, mut filter: F)
    where
        F: FnMut(InstrId) -> bool,
    {
        if old == new {
            return;
        }
        let mut users: Vec<InstrId> = self.uses(old).to_vec();
        users.sort_unstable();
        users.dedup();
        for user in users {
            if user == new || !filter(user) {
                continue;
            }
            for index in 0..self.instrs[user].inputs.len() {
                if self.instrs[user].inputs[index] == old {
                    self.replace_input(user, index, new);
                }
            }
        }
    }

    /// Detach an instruction from its block and drop its inputs.
    ///
    /// Remaining uses are the caller's business; removing both halves of
    /// an induction cycle leaves no dangling use behind.
    pub fn remove_instr(&mut self, id: InstrId) {
        if let Some(block) = self.instrs[id].block.take() {
            let list = if self.instrs[id].is_phi() {
                &mut self.blocks[block].phis
            } else {
                &mut self.blocks[block].instrs
            };
            if let Some(pos) = list.iter().position(|&i| i == id) {
                list.remove(pos);
            }
        }
        while !self.instrs[id].inputs.is_empty() {
            let last = self.instrs[id].inputs.len() - 1;
            self.remove_input(id, last);
        }
        if let Op::Const(value) = self.instrs[id].op {
            let key = (self.instrs[id].ty, value);
            if self.constants.get(&key) == Some(&id) {
                self.constants.remove(&key);
            }
        }
    }

    /// Move a live instruction to the end of another block (before its
    /// terminator).
    pub fn move_before_terminator(&mut self, id: InstrId, block: BlockId) {
        if let Some(from) = self.instrs[id].block.take() {
            let list = &mut self.blocks[from].instrs;
            if let Some(pos) = list.iter().position(|&i| i == id) {
                list.remove(pos);
            }
        }
        self.insert_before_terminator(block, id);
    }

    // =========================================================================
    // Control Flow Mutation
    // =========================================================================

    pub fn add_block(&mut self) -> BlockId {
        self.blocks.alloc(Block::default())
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from].succs.push(to);
        self.blocks[to].preds.push(from);
    }

    /// Remove one `from -> to` edge, dropping the matching phi inputs in `to`.
    pub fn remove_edge(&mut self, from: BlockId, to: BlockId) {
        if let Some(pos) = self.blocks[from].succs.iter().position(|&s| s == to) {
            self.blocks[from].succs.remove(pos);
        }
        if let Some(pos) = self.blocks[to].preds.iter().position(|&p| p == from) {
            self.blocks[to].preds.remove(pos);
            for phi in self.blocks[to].phis.clone() {
                self.remove_input(phi, pos);
            }
        }
    }

    /// Retarget the `block -> old` edge to `block -> new`, keeping the
    /// successor slot. `new` receives `block` as its last predecessor; phis
    /// in `new` are left for the caller to extend.
    pub fn replace_successor(&mut self, block: BlockId, old: BlockId, new: BlockId) {
        if let Some(pos) = self.blocks[block].succs.iter().position(|&s| s == old) {
            self.blocks[block].succs[pos] = new;
        }
        if let Some(pos) = self.blocks[old].preds.iter().position(|&p| p == block) {
            self.blocks[old].preds.remove(pos);
            for phi in self.blocks[old].phis.clone() {
                self.remove_input(phi, pos);
            }
        }
        self.blocks[new].preds.push(block);
    }

    /// Rename predecessor `old` of `block` to `new`, keeping the slot and
    /// therefore the phi inputs flowing along it. The caller fixes the
    /// successor list of `new`.
    pub fn replace_predecessor(&mut self, block: BlockId, old: BlockId, new: BlockId) {
        if let Some(pos) = self.blocks[block].preds.iter().position(|&p| p == old) {
            self.blocks[block].preds[pos] = new;
        }
    }

    /// Hand the `old_from -> to` edge over to `new_from`. The predecessor
    /// slot of `to`, and with it the phi inputs along the edge, is kept.
    pub fn move_edge_source(&mut self, old_from: BlockId, to: BlockId, new_from: BlockId) {
        if let Some(pos) = self.blocks[old_from].succs.iter().position(|&s| s == to) {
            self.blocks[old_from].succs.remove(pos);
        }
        self.replace_predecessor(to, old_from, new_from);
        self.blocks[new_from].succs.push(to);
    }

    /// Position of `pred` in the predecessor list of `block`.
    pub fn predecessor_index(&self, block: BlockId, pred: BlockId) -> Option<usize> {
        self.blocks[block].preds.iter().position(|&p| p == pred)
    }

    /// Unlink a block from the CFG and drop all its instructions.
    pub fn remove_block(&mut self, block: BlockId) {
        for succ in self.blocks[block].succs.clone() {
            self.remove_edge(block, succ);
        }
        for pred in self.blocks[block].preds.clone() {
            self.remove_edge(pred, block);
        }
        for id in self.blocks[block].phis.clone() {
            self.remove_instr(id);
        }
        for id in self.blocks[block].instrs.clone() {
            self.remove_instr(id);
        }
        self.blocks[block].removed = true;
    }

    /// Merge the single successor of `block` into it. The successor must
    /// have `block` as its only predecessor.
    pub fn merge_with_successor(&mut self, block: BlockId) {
        let succ = self.blocks[block].succs[0];
        debug_assert_eq!(self.blocks[block].succs.len(), 1);
        debug_assert_eq!(self.blocks[succ].preds, vec![block]);

        for phi in self.blocks[succ].phis.clone() {
            let value = self.instrs[phi].inputs[0];
            self.replace_all_uses(phi, value);
            self.remove_instr(phi);
        }
        if let Some(term) = self.terminator(block) {
            self.remove_instr(term);
        }
        let moved = std::mem::take(&mut self.blocks[succ].instrs);
        for &id in &moved {
            self.instrs[id].block = Some(block);
        }
        self.blocks[block].instrs.extend(moved);

        let next = std::mem::take(&mut self.blocks[succ].succs);
        self.blocks[block].succs = next.clone();
        for s in next {
            self.replace_predecessor(s, succ, block);
        }
        self.blocks[succ].preds.clear();
        self.blocks[succ].removed = true;
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Check the structural invariants listed in the module docs.
    pub fn verify(&self) -> Result<(), GraphError> {
        for block in self.blocks() {
            let bb = &self.blocks[block];
            for &succ in &bb.succs {
                let forward = bb.succs.iter().filter(|&&s| s == succ).count();
                let backward = self.blocks[succ]
                    .preds
                    .iter()
                    .filter(|&&p| p == block)
                    .count();
                if forward != backward || self.blocks[succ].removed {
                    return Err(GraphError::AsymmetricEdge {
                        from: block,
                        to: succ,
                    });
                }
            }
            for &phi in &bb.phis {
                let inputs = self.instrs[phi].inputs.len();
                if inputs != bb.preds.len() {
                    return Err(GraphError::PhiArity {
                        phi,
                        block,
                        inputs,
                        preds: bb.preds.len(),
                    });
                }
            }
            let Some(term) = self.terminator(block) else {
                return Err(GraphError::MissingTerminator { block });
            };
            let expected = match self.instrs[term].op {
                Op::If => 2,
                Op::Goto => 1,
                _ => 0,
            };
            if bb.succs.len() != expected {
                return Err(GraphError::SuccessorCount {
                    block,
                    expected,
                    found: bb.succs.len(),
                });
            }
            for &id in bb.phis.iter().chain(&bb.instrs) {
                if self.instrs[id].block != Some(block) {
                    return Err(GraphError::BlockMismatch { instr: id, block });
                }
                for &input in &self.instrs[id].inputs {
                    if self.instrs[input].block.is_none() {
                        return Err(GraphError::DanglingInput { instr: id, input });
                    }
                    let listed = self.uses(input).iter().filter(|&&u| u == id).count();
                    let actual = self.instrs[id].inputs.iter().filter(|&&i| i == input).count();
                    if listed != actual {
                        return Err(GraphError::UseListMismatch { instr: input });
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
