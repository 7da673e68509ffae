//! Intermediate representation consumed by the loop optimizer.

pub mod arena;
pub mod cfg;
pub mod graph;
pub mod instr;
pub mod interp;
pub mod types;

pub use graph::{Block, BlockId, Graph, GraphError};
pub use instr::{Alignment, BinOp, CmpOp, Instr, InstrId, Op, ReductionKind, UnOp, VecShape};
pub use types::DataType;
