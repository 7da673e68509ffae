//! Basic loop properties for the scalar peeling and unrolling heuristics.

use crate::ir::cfg::LoopInfo;
use crate::ir::graph::{BlockId, Graph};
use crate::ir::instr::Op;
use crate::ir::types::DataType;

use super::induction::is_invariant;

/// Size and shape facts of one loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopAnalysisInfo {
    pub header: BlockId,
    pub trip_count: Option<i64>,
    /// Non-phi instructions of every loop block, terminators included.
    pub instruction_count: usize,
    pub block_count: usize,
    /// Edges leaving the loop.
    pub exit_count: usize,
    /// Exits taken on a condition defined outside the loop.
    pub invariant_exit_count: usize,
    /// 64-bit arithmetic, expensive on 32-bit targets.
    pub has_long_type_instructions: bool,
    pub has_non_clonable_instructions: bool,
}

impl LoopAnalysisInfo {
    pub fn compute(graph: &Graph, info: &LoopInfo, trip_count: Option<i64>) -> Self {
        let mut result = LoopAnalysisInfo {
            header: info.header,
            trip_count,
            instruction_count: 0,
            block_count: 0,
            exit_count: 0,
            invariant_exit_count: 0,
            has_long_type_instructions: false,
            has_non_clonable_instructions: false,
        };

        for block in info.block_ids() {
            let bb = graph.block(block);
            result.block_count += 1;
            for &id in &bb.instrs {
                let instr = graph.instr(id);
                result.instruction_count += 1;
                if matches!(instr.op, Op::Binary(_) | Op::Unary(_)) && instr.ty == DataType::Int64 {
                    result.has_long_type_instructions = true;
                }
                if !instr.is_clonable() {
                    result.has_non_clonable_instructions = true;
                }
            }

            let exits = bb.succs.iter().filter(|&&s| !info.contains(s)).count();
            result.exit_count += exits;
            if exits > 0 {
                let invariant_test = graph.terminator(block).is_some_and(|term| {
                    let instr = graph.instr(term);
                    matches!(instr.op, Op::If) && is_invariant(graph, info, instr.input(0))
                });
                if invariant_test {
                    result.invariant_exit_count += exits;
                }
            }
        }
        result
    }

    /// Instructions the scalar transformations cannot replicate.
    pub fn has_instructions_preventing_scalar_opts(&self) -> bool {
        self.has_non_clonable_instructions
    }
}

// =============================================================================
// Tests
// =============================================================================
