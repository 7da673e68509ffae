//! Induction facts for one loop.
//!
//! Recognizes *linear* header phis
//!
//! ```text
//!   i = phi(init, i ± c1 ± c2 ...)      init loop-invariant, c constants
//! ```
//!
//! and the header test that controls the loop. From those it derives the
//! trip count, emits it (guarded by the taken test) when it is symbolic,
//! and produces last values `init + tc * stride` for values that are only
//! used after the loop.
//!
//! Facts are recomputed on demand. They are cheap to rebuild and the
//! pass rewrites loops often enough that caching would only go stale.

use crate::ir::cfg::LoopInfo;
use crate::ir::graph::{BlockId, Graph};
use crate::ir::instr::{BinOp, CmpOp, InstrId, Op};
use crate::ir::types::DataType;

/// Longest add/sub chain followed from a phi's update back to the phi.
const MAX_CHAIN: usize = 8;

// =============================================================================
// Facts
// =============================================================================

/// A phi stepping by a constant amount every iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearInduction {
    pub phi: InstrId,
    pub init: InstrId,
    pub update: InstrId,
    pub stride: i64,
    /// The phi followed by every instruction of its update chain.
    pub cycle: Vec<InstrId>,
}

/// The header test `if (phi stay bound)` keeping control in the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopControl {
    pub cond: InstrId,
    pub branch: InstrId,
    pub phi: InstrId,
    pub bound: InstrId,
    /// Predicate under which the loop continues, with the phi on the left.
    pub stay: CmpOp,
    /// Header successor that stays in the loop.
    pub body_successor: usize,
}

/// How many times the body runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripCount {
    Constant(i64),
    /// `init < bound ? bound - init : 0` (or the mirrored form for a
    /// decreasing unit stride).
    Symbolic,
}

/// Where the subscript of a unit-stride access starts, relative to an
/// iteration counter running from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexOffset {
    Const(i64),
    Value(InstrId),
}

/// Induction facts of one loop.
#[derive(Debug, Clone, Default)]
pub struct LoopInductions {
    pub preheader: Option<BlockId>,
    pub inductions: Vec<LinearInduction>,
    pub control: Option<LoopControl>,
    pub trip: Option<TripCount>,
}

/// Defined outside the loop (constants and parameters included).
pub fn is_invariant(graph: &Graph, info: &LoopInfo, id: InstrId) -> bool {
    graph.block_of(id).is_some_and(|b| !info.contains(b))
}

impl LoopInductions {
    /// Analyze the loop. Loops without a preheader or with several back
    /// edges have no facts.
    pub fn compute(graph: &Graph, info: &LoopInfo) -> Self {
        let mut facts = LoopInductions::default();
        let (Some(preheader), Some(latch)) = (info.preheader(graph), info.latch()) else {
            return facts;
        };
        facts.preheader = Some(preheader);
        let header = info.header;
        if graph.block(header).preds.len() != 2 {
            return facts;
        }
        let (Some(pre_index), Some(latch_index)) = (
            graph.predecessor_index(header, preheader),
            graph.predecessor_index(header, latch),
        ) else {
            return facts;
        };

        for &phi in &graph.block(header).phis {
            let init = graph.instr(phi).input(pre_index);
            let update = graph.instr(phi).input(latch_index);
            if let Some(induction) = linear_induction(graph, info, phi, init, update) {
                facts.inductions.push(induction);
            }
        }
        facts.control = loop_control(graph, info, &facts.inductions);
        facts.trip = facts.control.as_ref().and_then(|c| facts.trip_count_of(graph, c));
        facts
    }

    pub fn induction(&self, phi: InstrId) -> Option<&LinearInduction> {
        self.inductions.iter().find(|i| i.phi == phi)
    }

    /// The instructions forming the induction cycle of `phi`.
    pub fn lookup_cycle(&self, phi: InstrId) -> Option<&[InstrId]> {
        self.induction(phi).map(|i| i.cycle.as_slice())
    }

    /// The loop provably terminates after a computable number of trips.
    pub fn is_finite(&self) -> bool {
        self.trip.is_some()
    }

    pub fn constant_trip_count(&self) -> Option<i64> {
        match self.trip {
            Some(TripCount::Constant(tc)) => Some(tc),
            _ => None,
        }
    }

    fn trip_count_of(&self, graph: &Graph, control: &LoopControl) -> Option<TripCount> {
        let ind = self.induction(control.phi)?;
        let ty = graph.ty(ind.phi);
        let s = ind.stride;
        let init = graph.instr(ind.init).as_const();
        let bound = graph.instr(control.bound).as_const();

        if let (Some(lo), Some(hi)) = (init, bound) {
            let (lo, hi, s) = (lo as i128, hi as i128, s as i128);
            let tc = match control.stay {
                CmpOp::Lt if s > 0 => ceil_div((hi - lo).max(0), s),
                CmpOp::Le if s > 0 => ceil_div((hi - lo + 1).max(0), s),
                CmpOp::Gt if s < 0 => ceil_div((lo - hi).max(0), -s),
                CmpOp::Ge if s < 0 => ceil_div((lo - hi + 1).max(0), -s),
                CmpOp::Ne if (hi - lo) % s == 0 && (hi - lo) / s >= 0 => (hi - lo) / s,
                _ => return None,
            };
            // Every value the phi takes, the final one included, must be
            // representable or the test would see a wrapped value.
            let last = lo + tc * s;
            if !ty.fits(i64::try_from(last).ok()?) {
                return None;
            }
            return Some(TripCount::Constant(i64::try_from(tc).ok()?));
        }

        // Symbolic trip counts need a unit stride, a strict test and a
        // difference `bound - init` that cannot overflow when taken.
        let safe = match (control.stay, s) {
            (CmpOp::Lt, 1) => init.is_some_and(|v| v >= 0),
            (CmpOp::Gt, -1) => bound.is_some_and(|v| v >= 0),
            _ => false,
        };
        if safe && matches!(ty, DataType::Int32 | DataType::Int64) {
            Some(TripCount::Symbolic)
        } else {
            None
        }
    }

    // =========================================================================
    // Code Generation
    // =========================================================================

    /// Emit the trip count (zero when the loop is not entered) before the
    /// terminator of `block`.
    pub fn generate_trip_count(&self, graph: &mut Graph, block: BlockId) -> Option<InstrId> {
        let control = self.control.as_ref()?;
        let ind = self.induction(control.phi)?;
        let ty = graph.ty(ind.phi);
        match self.trip? {
            TripCount::Constant(tc) => Some(graph.const_int(ty, tc)),
            TripCount::Symbolic => {
                let (lhs, rhs, op) = if ind.stride > 0 {
                    (control.bound, ind.init, CmpOp::Lt)
                } else {
                    (ind.init, control.bound, CmpOp::Gt)
                };
                let diff = graph.binary(block, BinOp::Sub, ty, lhs, rhs);
                let taken = graph.compare(block, op, ind.init, control.bound);
                let zero = graph.const_int(ty, 0);
                Some(graph.emit(block, Op::Select, ty, &[taken, diff, zero]))
            }
        }
    }

    /// Whether [`generate_last_value`](Self::generate_last_value) can
    /// handle `id`.
    pub fn can_generate_last_value(&self, id: InstrId) -> bool {
        self.is_finite() && self.induction(id).is_some()
    }

    /// Emit `init + tc * stride`, the value of induction `phi` once the
    /// loop exits through its header.
    pub fn generate_last_value(
        &self,
        graph: &mut Graph,
        phi: InstrId,
        block: BlockId,
    ) -> Option<InstrId> {
        let ind = self.induction(phi)?.clone();
        let ty = graph.ty(phi);
        if let (Some(tc), Some(init)) = (self.constant_trip_count(), graph.instr(ind.init).as_const()) {
            return Some(graph.const_int(ty, init.wrapping_add(tc.wrapping_mul(ind.stride))));
        }
        let tc = self.generate_trip_count(graph, block)?;
        Some(match ind.stride {
            1 => graph.binary(block, BinOp::Add, ty, ind.init, tc),
            -1 => graph.binary(block, BinOp::Sub, ty, ind.init, tc),
            s => {
                let stride = graph.const_int(ty, s);
                let step = graph.binary(block, BinOp::Mul, ty, tc, stride);
                graph.binary(block, BinOp::Add, ty, ind.init, step)
            }
        })
    }

    // =========================================================================
    // Subscripts
    // =========================================================================

    /// If `index` is `i + b` for the loop-control induction `i` with unit
    /// stride and invariant `b`, the offset `init + b` of the subscript
    /// relative to an iteration counter. Offsets that would need new code
    /// to combine are rejected.
    pub fn is_unit_stride(&self, graph: &Graph, info: &LoopInfo, index: InstrId) -> Option<IndexOffset> {
        let control = self.control.as_ref()?;
        let ind = self.induction(control.phi)?;
        if ind.stride != 1 {
            return None;
        }
        let phi = ind.phi;
        let instr = graph.instr(index);
        let b: Option<InstrId> = if index == phi {
            None
        } else {
            match instr.op {
                Op::Binary(BinOp::Add) if instr.input(0) == phi => Some(instr.input(1)),
                Op::Binary(BinOp::Add) if instr.input(1) == phi => Some(instr.input(0)),
                Op::Binary(BinOp::Sub) if instr.input(0) == phi => {
                    let c = graph.instr(instr.input(1)).as_const()?;
                    return offset_of(graph, ind.init, IndexOffset::Const(c.checked_neg()?));
                }
                _ => return None,
            }
        };
        match b {
            None => offset_of(graph, ind.init, IndexOffset::Const(0)),
            Some(b) if is_invariant(graph, info, b) => {
                let part = match graph.instr(b).as_const() {
                    Some(c) => IndexOffset::Const(c),
                    None => IndexOffset::Value(b),
                };
                offset_of(graph, ind.init, part)
            }
            Some(_) => None,
        }
    }
}

/// Combine the induction start with the invariant part of a subscript.
fn offset_of(graph: &Graph, init: InstrId, part: IndexOffset) -> Option<IndexOffset> {
    match (graph.instr(init).as_const(), part) {
        (Some(ci), IndexOffset::Const(cb)) => Some(IndexOffset::Const(ci.checked_add(cb)?)),
        (Some(0), IndexOffset::Value(v)) => Some(IndexOffset::Value(v)),
        (None, IndexOffset::Const(0)) => Some(IndexOffset::Value(init)),
        _ => None,
    }
}

/// Ceiling division for a non-negative dividend and positive divisor.
fn ceil_div(n: i128, d: i128) -> i128 {
    (n + d - 1) / d
}

fn linear_induction(
    graph: &Graph,
    info: &LoopInfo,
    phi: InstrId,
    init: InstrId,
    update: InstrId,
) -> Option<LinearInduction> {
    let ty = graph.ty(phi);
    if !matches!(ty, DataType::Int32 | DataType::Int64) || !is_invariant(graph, info, init) {
        return None;
    }
    let mut cycle = vec![phi];
    let mut stride: i64 = 0;
    let mut current = update;
    while current != phi {
        if cycle.len() > MAX_CHAIN || !graph.block_of(current).is_some_and(|b| info.contains(b)) {
            return None;
        }
        let instr = graph.instr(current);
        if instr.ty != ty {
            return None;
        }
        let constant = |i: usize| graph.instr(instr.input(i)).as_const();
        let (step, next) = match instr.op {
            Op::Binary(BinOp::Add) => match (constant(0), constant(1)) {
                (_, Some(c)) => (c, instr.input(0)),
                (Some(c), None) => (c, instr.input(1)),
                _ => return None,
            },
            Op::Binary(BinOp::Sub) => (constant(1)?.checked_neg()?, instr.input(0)),
            _ => return None,
        };
        stride = stride.checked_add(step)?;
        cycle.push(current);
        current = next;
    }
    if stride == 0 {
        return None;
    }
    Some(LinearInduction {
        phi,
        init,
        update,
        stride,
        cycle,
    })
}

fn loop_control(
    graph: &Graph,
    info: &LoopInfo,
    inductions: &[LinearInduction],
) -> Option<LoopControl> {
    let header = info.header;
    let branch = graph.terminator(header)?;
    if !matches!(graph.instr(branch).op, Op::If) {
        return None;
    }
    let succs = &graph.block(header).succs;
    if succs.len() != 2 {
        return None;
    }
    let body_successor = match (info.contains(succs[0]), info.contains(succs[1])) {
        (true, false) => 0,
        (false, true) => 1,
        _ => return None,
    };
    let cond = graph.instr(branch).input(0);
    let Op::Compare(op) = graph.instr(cond).op else {
        return None;
    };
    let (a, b) = (graph.instr(cond).input(0), graph.instr(cond).input(1));
    let (phi, bound, op) = if inductions.iter().any(|i| i.phi == a) {
        (a, b, op)
    } else if inductions.iter().any(|i| i.phi == b) {
        (b, a, op.swap())
    } else {
        return None;
    };
    if !is_invariant(graph, info, bound) {
        return None;
    }
    let stay = if body_successor == 0 { op } else { op.inverse() };
    Some(LoopControl {
        cond,
        branch,
        phi,
        bound,
        stay,
        body_successor,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::interp::{Heap, Interpreter, Value};
    use crate::testing::{build_loop, loop_info};

    #[test]
    fn test_constant_trip_counts() {
        for (init, bound, op, stride, expected) in [
            (0, 10, CmpOp::Lt, 1, Some(10)),
            (0, 10, CmpOp::Le, 1, Some(11)),
            (0, 10, CmpOp::Lt, 3, Some(4)),
            (10, 0, CmpOp::Gt, -1, Some(10)),
            (10, 0, CmpOp::Ge, -2, Some(6)),
            (0, 8, CmpOp::Ne, 2, Some(4)),
            (0, 7, CmpOp::Ne, 2, None),
            (5, 0, CmpOp::Lt, 1, Some(0)),
            (0, 10, CmpOp::Lt, -1, None),
            (0, i32::MAX as i64, CmpOp::Le, 1, None),
        ] {
            let mut g = Graph::new();
            let lo = g.const_int(DataType::Int32, init);
            let hi = g.const_int(DataType::Int32, bound);
            let l = build_loop(&mut g, lo, hi, op, stride);
            g.ret(l.exit, None);
            let facts = LoopInductions::compute(&g, &loop_info(&g, l.header));
            assert_eq!(
                facts.constant_trip_count(),
                expected,
                "{init} {op:?} {bound} by {stride}"
            );
            assert_eq!(facts.is_finite(), expected.is_some());
        }
    }

    #[test]
    fn test_cycle_and_control() {
        let mut g = Graph::new();
        let zero = g.const_int(DataType::Int32, 0);
        let n = g.param(0, DataType::Int32);
        let l = build_loop(&mut g, zero, n, CmpOp::Lt, 1);
        g.ret(l.exit, None);
        let facts = LoopInductions::compute(&g, &loop_info(&g, l.header));

        assert_eq!(facts.lookup_cycle(l.phi), Some(&[l.phi, l.update][..]));
        let control = facts.control.as_ref().unwrap();
        assert_eq!(control.cond, l.cond);
        assert_eq!(control.stay, CmpOp::Lt);
        assert_eq!(facts.trip, Some(TripCount::Symbolic));
    }

    #[test]
    fn test_symbolic_trip_count_needs_safe_start() {
        let mut g = Graph::new();
        let lo = g.param(0, DataType::Int32);
        let hi = g.param(1, DataType::Int32);
        let l = build_loop(&mut g, lo, hi, CmpOp::Lt, 1);
        g.ret(l.exit, None);
        let facts = LoopInductions::compute(&g, &loop_info(&g, l.header));
        assert!(facts.control.is_some());
        assert!(!facts.is_finite());
    }

    #[test]
    fn test_generated_last_value_matches_execution() {
        for n in [-3i64, 0, 1, 7] {
            let mut g = Graph::new();
            let zero = g.const_int(DataType::Int32, 0);
            let bound = g.param(0, DataType::Int32);
            let l = build_loop(&mut g, zero, bound, CmpOp::Lt, 1);
            g.ret(l.exit, Some(l.phi));
            let info = loop_info(&g, l.header);
            let facts = LoopInductions::compute(&g, &info);

            let mut heap = Heap::new();
            let expected = Interpreter::new(&g)
                .run(&[Value::Int(n)], &mut heap)
                .unwrap()
                .result;

            let last = facts.generate_last_value(&mut g, l.phi, l.pre).unwrap();
            let ret = g.terminator(l.exit).unwrap();
            g.replace_input(ret, 0, last);
            assert_eq!(g.verify(), Ok(()));
            let actual = Interpreter::new(&g)
                .run(&[Value::Int(n)], &mut heap)
                .unwrap()
                .result;
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn test_unit_stride_offsets() {
        let mut g = Graph::new();
        let one = g.const_int(DataType::Int32, 1);
        let two = g.const_int(DataType::Int32, 2);
        let n = g.param(0, DataType::Int32);
        let k = g.param(1, DataType::Int32);
        let l = build_loop(&mut g, one, n, CmpOp::Lt, 1);
        let plus_two = g.binary(l.body, BinOp::Add, DataType::Int32, two, l.phi);
        let minus_one = g.binary(l.body, BinOp::Sub, DataType::Int32, l.phi, one);
        let plus_k = g.binary(l.body, BinOp::Add, DataType::Int32, l.phi, k);
        let twice = g.binary(l.body, BinOp::Mul, DataType::Int32, l.phi, two);
        g.ret(l.exit, None);
        let info = loop_info(&g, l.header);
        let facts = LoopInductions::compute(&g, &info);

        assert_eq!(facts.is_unit_stride(&g, &info, l.phi), Some(IndexOffset::Const(1)));
        assert_eq!(facts.is_unit_stride(&g, &info, plus_two), Some(IndexOffset::Const(3)));
        assert_eq!(facts.is_unit_stride(&g, &info, minus_one), Some(IndexOffset::Const(0)));
        // init 1 plus a fetched k would need an extra add.
        assert_eq!(facts.is_unit_stride(&g, &info, plus_k), None);
        assert_eq!(facts.is_unit_stride(&g, &info, twice), None);
    }
}
