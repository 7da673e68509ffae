//! Idiom recognition.
//!
//! Scalar code computes narrow arithmetic in 32 or 64 bits and narrows the
//! result when storing it. Some of those patterns map to a single vector
//! instruction working on the narrow lanes directly:
//!
//! ```text
//!   (a + b + 1) >> 1             -> VecHalvingAdd { rounded: true }
//!   min(max(a + b, lo), hi)      -> VecSaturationAdd
//!   acc += abs(a - b)            -> VecSadAccumulate
//!   acc += a * b                 -> VecDotProd
//! ```
//!
//! Every idiom needs its operands to be *narrower operands*: values that
//! are provably sign- or zero-extended from the narrow type.

use crate::ir::graph::Graph;
use crate::ir::instr::{BinOp, InstrId, Op, UnOp, VecShape};
use crate::ir::types::DataType;
use crate::opt::loops::LoopOptimization;
use crate::opt::OptError;

use super::restrictions::VectorRestrictions as R;
use super::Candidate;

// =============================================================================
// Narrower Operands
// =============================================================================

/// The narrow value behind `id` if `id` is a sign extension from `ty`.
fn sign_extension_of(graph: &Graph, id: InstrId, ty: DataType) -> Option<InstrId> {
    let instr = graph.instr(id);
    if let Some(value) = instr.as_const() {
        let fits = match ty {
            DataType::Uint8 | DataType::Int8 => DataType::Int8.fits(value),
            DataType::Uint16 | DataType::Int16 => DataType::Int16.fits(value),
            DataType::Int32 => DataType::Int32.fits(value),
            _ => false,
        };
        return fits.then_some(id);
    }
    // Narrow signed values are held sign-extended already.
    if instr.ty == ty && matches!(ty, DataType::Int8 | DataType::Int16) {
        return Some(id);
    }
    if matches!(instr.op, Op::Convert) && matches!(instr.ty, DataType::Int32 | DataType::Int64) {
        let conv = instr.input(0);
        let from = graph.ty(conv);
        if from == ty && matches!(from, DataType::Int8 | DataType::Int16 | DataType::Int32) {
            return Some(conv);
        }
    }
    None
}

/// The narrow value behind `id` if `id` is a zero extension from `ty`.
fn zero_extension_of(graph: &Graph, id: InstrId, ty: DataType) -> Option<InstrId> {
    let instr = graph.instr(id);
    if let Some(value) = instr.as_const() {
        let fits = match ty {
            DataType::Uint8 | DataType::Int8 => DataType::Uint8.fits(value),
            DataType::Uint16 | DataType::Int16 => DataType::Uint16.fits(value),
            DataType::Int32 => (0..=u32::MAX as i64).contains(&value),
            _ => false,
        };
        return fits.then_some(id);
    }
    if instr.ty == ty && matches!(ty, DataType::Uint8 | DataType::Uint16) {
        return Some(id);
    }
    // x & 0xff and x & 0xffff keep only the low bits of a narrow value.
    if instr.binary_op() == Some(BinOp::And) {
        let (a, b) = (instr.input(0), instr.input(1));
        let (mask, other) = match (graph.instr(a).as_const(), graph.instr(b).as_const()) {
            (_, Some(mask)) => (mask, a),
            (Some(mask), None) => (mask, b),
            (None, None) => return None,
        };
        let operand = sign_extension_of(graph, other, ty.to_signed())
            .or_else(|| zero_extension_of(graph, other, ty.to_unsigned()))?;
        let expected = match graph.ty(operand) {
            DataType::Uint8 | DataType::Int8 => 0xff,
            DataType::Uint16 | DataType::Int16 => 0xffff,
            _ => return None,
        };
        return (mask == expected).then_some(operand);
    }
    if matches!(instr.op, Op::Convert) && matches!(instr.ty, DataType::Int32 | DataType::Int64) {
        let conv = instr.input(0);
        let from = graph.ty(conv);
        if from == ty && matches!(from, DataType::Uint8 | DataType::Uint16) {
            return Some(conv);
        }
    }
    None
}

/// Narrow value behind `id` and whether it is zero-extended.
pub(super) fn is_narrower_operand(graph: &Graph, id: InstrId, ty: DataType) -> Option<(InstrId, bool)> {
    if let Some(r) = sign_extension_of(graph, id, ty.to_signed()) {
        return Some((r, false));
    }
    zero_extension_of(graph, id, ty.to_unsigned()).map(|r| (r, true))
}

/// Both operands extended the same way from `ty`.
pub(super) fn is_narrower_operands(
    graph: &Graph,
    a: InstrId,
    b: InstrId,
    ty: DataType,
) -> Option<(InstrId, InstrId, bool)> {
    let signed = ty.to_signed();
    if let (Some(r), Some(s)) = (sign_extension_of(graph, a, signed), sign_extension_of(graph, b, signed)) {
        return Some((r, s, false));
    }
    let unsigned = ty.to_unsigned();
    match (zero_extension_of(graph, a, unsigned), zero_extension_of(graph, b, unsigned)) {
        (Some(r), Some(s)) => Some((r, s, true)),
        _ => None,
    }
}

/// Narrowest type the two operands were widened from.
fn narrower_type(graph: &Graph, a: InstrId, b: InstrId) -> DataType {
    let source = |id: InstrId| {
        let instr = graph.instr(id);
        if matches!(instr.op, Op::Convert) {
            let from = graph.ty(instr.input(0));
            if from.is_integral() && from.size() < instr.ty.size() {
                return from;
            }
        }
        instr.ty
    };
    let (ta, tb) = (source(a), source(b));
    if ta.size() >= tb.size() {
        ta
    } else {
        tb
    }
}

// =============================================================================
// Pattern Shapes
// =============================================================================

/// `a + b + c` or `a + b - c` with constant `c`; plain `a + b` gives `c == 0`.
fn add_const2(graph: &Graph, id: InstrId) -> Option<(InstrId, InstrId, i64)> {
    let instr = graph.instr(id);
    let plain_add = |id: InstrId| {
        let i = graph.instr(id);
        (i.binary_op() == Some(BinOp::Add)).then(|| (i.input(0), i.input(1)))
    };
    match instr.binary_op()? {
        BinOp::Add => {
            let (x, y) = (instr.input(0), instr.input(1));
            if let (Some(c), Some((a, b))) = (graph.instr(y).as_const(), plain_add(x)) {
                return Some((a, b, c));
            }
            if let (Some(c), Some((a, b))) = (graph.instr(x).as_const(), plain_add(y)) {
                return Some((a, b, c));
            }
            Some((x, y, 0))
        }
        BinOp::Sub => {
            let c = graph.instr(instr.input(1)).as_const()?;
            let (a, b) = plain_add(instr.input(0))?;
            Some((a, b, c.checked_neg()?))
        }
        _ => None,
    }
}

/// Strip constant `min` and `max` clipping: the clipped value and the
/// tightest bounds applied to it.
fn find_clippee(graph: &Graph, id: InstrId) -> (InstrId, i64, i64) {
    let (mut lo, mut hi) = (i64::MIN, i64::MAX);
    let mut current = id;
    loop {
        let instr = graph.instr(current);
        let op = match instr.binary_op() {
            Some(op @ (BinOp::Min | BinOp::Max)) => op,
            _ => break,
        };
        let (a, b) = (instr.input(0), instr.input(1));
        let (bound, rest) = match (graph.instr(b).as_const(), graph.instr(a).as_const()) {
            (Some(v), _) => (v, a),
            (None, Some(v)) => (v, b),
            (None, None) => break,
        };
        if op == BinOp::Min {
            hi = hi.min(bound);
        } else {
            lo = lo.max(bound);
        }
        current = rest;
    }
    (current, lo, hi)
}

/// `a + b` clipped exactly to the range of the narrow type.
fn saturated_add(graph: &Graph, clippee: InstrId, ty: DataType, lo: i64, hi: i64) -> Option<(InstrId, InstrId, bool)> {
    if graph.instr(clippee).binary_op() != Some(BinOp::Add) {
        return None;
    }
    let (a, b, c) = add_const2(graph, clippee)?;
    if c != 0 {
        return None;
    }
    let (r, s, is_unsigned) = is_narrower_operands(graph, a, b, ty)?;
    let (min, max) = ty.to_proper(is_unsigned).range();
    let exact = if is_unsigned {
        lo <= 0 && hi == max
    } else {
        lo == min && hi == max
    };
    exact.then_some((r, s, is_unsigned))
}

/// `a - b` clipped exactly to the range of the narrow type.
fn saturated_sub(graph: &Graph, clippee: InstrId, ty: DataType, lo: i64, hi: i64) -> Option<(InstrId, InstrId, bool)> {
    let instr = graph.instr(clippee);
    if instr.binary_op() != Some(BinOp::Sub) {
        return None;
    }
    let (r, s, is_unsigned) = is_narrower_operands(graph, instr.input(0), instr.input(1), ty)?;
    let (min, max) = ty.to_proper(is_unsigned).range();
    let exact = if is_unsigned {
        lo == 0 && hi >= max
    } else {
        lo == min && hi == max
    };
    exact.then_some((r, s, is_unsigned))
}

/// Lanes of a `wide` vector holding as many bytes as `vl` lanes of `narrow`.
fn other_vector_length(wide: DataType, narrow: DataType, vl: u32) -> u32 {
    vl * narrow.size() / wide.size()
}

// =============================================================================
// Idioms
// =============================================================================

impl LoopOptimization {
    /// `(a + b [+ 1]) >> 1` on narrower operands.
    pub(super) fn vectorize_halving_add_idiom(
        &mut self,
        graph: &mut Graph,
        ctx: Candidate<'_>,
        id: InstrId,
        generate: bool,
        ty: DataType,
        restrictions: R,
    ) -> Result<bool, OptError> {
        if self.vector.is_generating_sequential(generate) {
            return Ok(false);
        }
        let instr = graph.instr(id);
        if !matches!(instr.binary_op(), Some(BinOp::Shr | BinOp::UShr)) || !graph.instr(instr.input(1)).is_const(1) {
            return Ok(false);
        }
        let Some((a, b, c)) = add_const2(graph, instr.input(0)) else {
            return Ok(false);
        };
        let rounded = match c {
            0 => false,
            1 => true,
            _ => return Ok(false),
        };
        let Some((r, s, is_unsigned)) = is_narrower_operands(graph, a, b, ty) else {
            return Ok(false);
        };
        if (!is_unsigned && restrictions.has_any(R::NO_SIGNED_HADD))
            || (!rounded && restrictions.has_any(R::NO_UNROUNDED_HADD))
        {
            return Ok(false);
        }
        if !(self.vectorize_use(graph, ctx, r, generate, ty, restrictions)?
            && self.vectorize_use(graph, ctx, s, generate, ty, restrictions)?)
        {
            return Ok(false);
        }
        if generate {
            let shape = VecShape::new(ty.to_proper(is_unsigned), self.vector.length);
            let operands = [self.vector.lookup(r)?, self.vector.lookup(s)?];
            let hadd = graph.create_vec(Op::VecHalvingAdd { rounded }, shape.packed, &operands, shape);
            self.vector.map.insert(id, hadd);
            self.record_idiom();
        }
        Ok(true)
    }

    /// `min(max(a +/- b, lo), hi)` where the clipping is exactly the
    /// narrow type's range.
    pub(super) fn vectorize_saturation_idiom(
        &mut self,
        graph: &mut Graph,
        ctx: Candidate<'_>,
        id: InstrId,
        generate: bool,
        ty: DataType,
        restrictions: R,
    ) -> Result<bool, OptError> {
        if self.vector.is_generating_sequential(generate)
            || restrictions.has_any(R::NO_SATURATION)
            || !matches!(graph.ty(id), DataType::Int32 | DataType::Int64)
        {
            return Ok(false);
        }
        let (clippee, lo, hi) = find_clippee(graph, id);
        if clippee == id {
            return Ok(false);
        }
        let recognized = saturated_add(graph, clippee, ty, lo, hi)
            .map(|(r, s, u)| (r, s, u, true))
            .or_else(|| saturated_sub(graph, clippee, ty, lo, hi).map(|(r, s, u)| (r, s, u, false)));
        let Some((r, s, is_unsigned, is_add)) = recognized else {
            return Ok(false);
        };
        if !(self.vectorize_use(graph, ctx, r, generate, ty, restrictions)?
            && self.vectorize_use(graph, ctx, s, generate, ty, restrictions)?)
        {
            return Ok(false);
        }
        if generate {
            let op = if is_add {
                Op::VecSaturationAdd
            } else {
                Op::VecSaturationSub
            };
            let shape = VecShape::new(ty.to_proper(is_unsigned), self.vector.length);
            let operands = [self.vector.lookup(r)?, self.vector.lookup(s)?];
            let sat = graph.create_vec(op, shape.packed, &operands, shape);
            self.vector.map.insert(id, sat);
            self.record_idiom();
        }
        Ok(true)
    }

    /// `acc += abs(a - b)` with a 32 or 64 bit accumulator over narrower
    /// signed operands.
    pub(super) fn vectorize_sad_idiom(
        &mut self,
        graph: &mut Graph,
        ctx: Candidate<'_>,
        id: InstrId,
        generate: bool,
        reduction_type: DataType,
        restrictions: R,
    ) -> Result<bool, OptError> {
        if !matches!(reduction_type, DataType::Int32 | DataType::Int64) {
            return Ok(false);
        }
        let Some((acc, term)) = self.accumulator_and_term(graph, id) else {
            return Ok(false);
        };
        let abs = graph.instr(term);
        if !matches!(abs.op, Op::Unary(UnOp::Abs)) || abs.ty != reduction_type {
            return Ok(false);
        }
        let sub = graph.instr(abs.input(0));
        if sub.binary_op() != Some(BinOp::Sub) || sub.ty != reduction_type {
            return Ok(false);
        }
        let (a, b) = (sub.input(0), sub.input(1));
        let sub_type = narrower_type(graph, a, b);
        // The scalar subtraction wraps at the accumulator width; only
        // narrower operands keep it exact.
        if sub_type.size() >= reduction_type.size() {
            return Ok(false);
        }
        let Some((r, s, false)) = is_narrower_operands(graph, a, b, sub_type) else {
            return Ok(false);
        };

        let mut restrictions = restrictions;
        if !self.try_set_vector_type(sub_type, &mut restrictions)?
            || restrictions.has_any(R::NO_SAD | R::NO_WIDE_SAD)
        {
            return Ok(false);
        }
        if !(self.vectorize_use(graph, ctx, acc, generate, sub_type, restrictions)?
            && self.vectorize_use(graph, ctx, r, generate, sub_type, restrictions)?
            && self.vectorize_use(graph, ctx, s, generate, sub_type, restrictions)?)
        {
            return Ok(false);
        }
        if generate {
            let lanes = other_vector_length(reduction_type, sub_type, self.vector.length);
            let shape = VecShape::new(reduction_type, lanes);
            let operands = [
                self.vector.lookup(acc)?,
                self.vector.lookup(r)?,
                self.vector.lookup(s)?,
            ];
            let sad = graph.create_vec(Op::VecSadAccumulate, reduction_type, &operands, shape);
            self.vector.map.insert(id, sad);
            self.record_idiom();
        }
        Ok(true)
    }

    /// `acc += a * b` with an `Int32` accumulator over narrower operands.
    pub(super) fn vectorize_dot_prod_idiom(
        &mut self,
        graph: &mut Graph,
        ctx: Candidate<'_>,
        id: InstrId,
        generate: bool,
        reduction_type: DataType,
        restrictions: R,
    ) -> Result<bool, OptError> {
        if reduction_type != DataType::Int32 {
            return Ok(false);
        }
        let Some((acc, term)) = self.accumulator_and_term(graph, id) else {
            return Ok(false);
        };
        let mul = graph.instr(term);
        if mul.binary_op() != Some(BinOp::Mul) || mul.ty != reduction_type {
            return Ok(false);
        }
        let (a, b) = (mul.input(0), mul.input(1));
        let narrow = narrower_type(graph, a, b);
        let Some((r, s, is_unsigned)) = is_narrower_operands(graph, a, b, narrow) else {
            return Ok(false);
        };
        let op_type = narrow.to_proper(is_unsigned);

        let mut restrictions = restrictions;
        if !self.try_set_vector_type(op_type, &mut restrictions)? || restrictions.has_any(R::NO_DOT_PROD) {
            return Ok(false);
        }
        if !(self.vectorize_use(graph, ctx, acc, generate, op_type, restrictions)?
            && self.vectorize_use(graph, ctx, r, generate, op_type, restrictions)?
            && self.vectorize_use(graph, ctx, s, generate, op_type, restrictions)?)
        {
            return Ok(false);
        }
        if generate {
            let lanes = other_vector_length(reduction_type, op_type, self.vector.length);
            let shape = VecShape::new(reduction_type, lanes);
            let operands = [
                self.vector.lookup(acc)?,
                self.vector.lookup(r)?,
                self.vector.lookup(s)?,
            ];
            let dot = graph.create_vec(
                Op::VecDotProd {
                    unsigned: is_unsigned,
                },
                reduction_type,
                &operands,
                shape,
            );
            self.vector.map.insert(id, dot);
            self.record_idiom();
        }
        Ok(true)
    }

    /// Idioms count once per loop, not once per unrolled copy.
    fn record_idiom(&mut self) {
        if self.vector.unrolled_copy == 0 {
            self.stats.idioms_vectorized += 1;
        }
    }

    /// Split a reduction step `phi + term` (either order) into its parts.
    fn accumulator_and_term(&self, graph: &Graph, id: InstrId) -> Option<(InstrId, InstrId)> {
        let phi = *self.reductions.get(&id)?;
        let instr = graph.instr(id);
        if instr.binary_op() != Some(BinOp::Add) {
            return None;
        }
        match (instr.input(0), instr.input(1)) {
            (a, term) if a == phi => Some((phi, term)),
            (term, b) if b == phi => Some((phi, term)),
            _ => None,
        }
    }
}
