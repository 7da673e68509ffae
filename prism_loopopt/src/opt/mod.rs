//! Optimization passes.
//!
//! Every pass implements [`OptimizationPass`]. A pass mutates the graph in
//! place and reports whether it changed anything so the driver can decide
//! which analyses to recompute.

pub mod loops;

use thiserror::Error;

use crate::ir::graph::{BlockId, GraphError};
use crate::ir::types::DataType;

pub use loops::{LoopOptConfig, LoopOptimization};

// =============================================================================
// Pass Trait
// =============================================================================

/// A graph-to-graph transformation.
pub trait OptimizationPass {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Run the pass; returns true if the graph changed.
    fn run(&mut self, graph: &mut crate::ir::graph::Graph) -> bool;
}

// =============================================================================
// Errors
// =============================================================================

/// Internal-consistency violations detected while optimizing.
///
/// These are compiler defects, never legality or profitability outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptError {
    #[error("vector length {lanes} x {ty} does not fill a {register_bytes}-byte register")]
    VectorWidthMismatch {
        ty: DataType,
        lanes: u32,
        register_bytes: u32,
    },
    #[error("loop forest link broken at loop headed by {header}")]
    BrokenForest { header: BlockId },
    #[error("no synthesized value for instruction {0}")]
    MissingVectorValue(crate::ir::instr::InstrId),
    #[error("vector code requested outside a generated loop")]
    NoTargetLoop,
    #[error("loop headed by {0} has no computable trip count")]
    MissingTripCount(BlockId),
    #[error("loop headed by {0} lost its preheader")]
    MissingPreheader(BlockId),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters reported by the loop optimization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptStats {
    pub loops_analyzed: usize,
    pub loops_vectorized: usize,
    pub idioms_vectorized: usize,
    pub loops_peeled: usize,
    pub loops_unrolled: usize,
    pub loops_fully_unrolled: usize,
    pub empty_loops_removed: usize,
    pub inductions_simplified: usize,
    pub blocks_simplified: usize,
}

impl OptStats {
    /// Total number of loop transformations applied.
    pub fn loops_transformed(&self) -> usize {
        self.loops_vectorized
            + self.loops_peeled
            + self.loops_unrolled
            + self.loops_fully_unrolled
            + self.empty_loops_removed
    }
}
