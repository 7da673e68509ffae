//! Loop optimization pass for the Prism method compiler.
//!
//! Works on a block-structured SSA graph and provides:
//! - Loop forest construction and inner-to-outer traversal
//! - Induction simplification and dead-loop removal
//! - Peeling, partial unrolling and full unrolling
//! - SIMD vectorization of innermost loops, including saturation,
//!   halving-add, SAD and dot-product idioms
//! - Alignment peeling and runtime disjointness tests
pub mod ir;
pub mod opt;

#[cfg(test)]
mod testing;
