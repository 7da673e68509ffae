//! Per-instruction vectorization rules.
//!
//! [`vectorize_def`](LoopOptimization::vectorize_def) handles the
//! left-hand sides of the body (stores and reductions) and starts a
//! right-hand-side walk through
//! [`vectorize_use`](LoopOptimization::vectorize_use), which passes the
//! vector type and the accumulated restrictions down the expression tree.
//!
//! The same rules run during analysis and synthesis. In vector mode they
//! emit the operation chosen during analysis; in sequential mode every
//! accepted instruction is cloned as is.

use crate::ir::graph::Graph;
use crate::ir::instr::{BinOp, Effects, InstrId, Op, UnOp};
use crate::ir::types::DataType;
use crate::opt::loops::LoopOptimization;
use crate::opt::OptError;

use super::idioms::{is_narrower_operand, is_narrower_operands};
use super::restrictions::VectorRestrictions as R;
use super::{ArrayReference, Candidate};

impl LoopOptimization {
    // =========================================================================
    // Definitions
    // =========================================================================

    /// Accept a body instruction as a whole: an array store, a reduction
    /// step, or an expression with no effect outside the body.
    pub(super) fn vectorize_def(
        &mut self,
        graph: &mut Graph,
        ctx: Candidate<'_>,
        id: InstrId,
        generate: bool,
    ) -> Result<bool, OptError> {
        let instr = graph.instr(id).clone();
        let mut restrictions = R::empty();

        // Float division does not trap.
        if instr.op.effects().contains(Effects::CAN_THROW) && !instr.ty.is_floating_point() {
            return Ok(false);
        }

        if let Op::ArraySet { component } = instr.op {
            let (base, index, value) = (instr.input(0), instr.input(1), instr.input(2));
            // Narrow stores drop the high-order bits of the value anyway.
            if component.size() <= 2 {
                restrictions |= R::NO_HI_BITS;
            }
            if !self.try_set_vector_type(component, &mut restrictions)? || !ctx.is_invariant(graph, base) {
                return Ok(false);
            }
            let Some(offset) = ctx.facts.is_unit_stride(graph, ctx.info, index) else {
                return Ok(false);
            };
            if !self.vectorize_use(graph, ctx, value, generate, component, restrictions)? {
                return Ok(false);
            }
            if generate {
                self.generate_vec_sub(graph, index, offset)?;
                let subscript = self.vector.lookup(index)?;
                let stored = self.vector.lookup(value)?;
                self.generate_vec_mem(graph, id, subscript, Some(stored), offset, component)?;
            } else {
                self.vector
                    .refs
                    .insert(ArrayReference::new(base, offset, component, true, false));
            }
            return Ok(true);
        }

        if let Some(&phi) = self.reductions.get(&id) {
            let ty = instr.ty;
            let accepted = if self.vector.is_generating_sequential(generate) {
                self.vectorize_use(graph, ctx, id, generate, ty, restrictions)?
            } else {
                self.vectorize_sad_idiom(graph, ctx, id, generate, ty, restrictions)?
                    || self.vectorize_dot_prod_idiom(graph, ctx, id, generate, ty, restrictions)?
                    || (self.try_set_vector_type(ty, &mut restrictions)?
                        && self.vectorize_use(graph, ctx, id, generate, ty, restrictions)?)
            };
            if accepted && generate {
                // Chain the step of this copy to the accumulator it reads, so
                // the next unrolled copy reads this step.
                let new_red = self.vector.lookup(id)?;
                let feed = self.vector.lookup(phi)?;
                self.vector.permanent_map.insert(new_red, feed);
                self.vector.permanent_map.insert(phi, new_red);
            }
            return Ok(accepted);
        }

        if matches!(instr.op, Op::Goto) {
            return Ok(true);
        }
        // Everything else must stay inside the body; actual uses are
        // inspected by the right-hand-side walk.
        Ok(!is_used_outside_loop(graph, ctx, id) && !instr.op.effects().contains(Effects::WRITES_MEMORY))
    }

    // =========================================================================
    // Uses
    // =========================================================================

    /// Accept `id` as an operand of a vector operation of type `ty` under
    /// `restrictions`.
    pub(super) fn vectorize_use(
        &mut self,
        graph: &mut Graph,
        ctx: Candidate<'_>,
        id: InstrId,
        generate: bool,
        ty: DataType,
        restrictions: R,
    ) -> Result<bool, OptError> {
        if generate && self.vector.map.contains_key(&id) {
            return Ok(true);
        }
        if ctx.is_invariant(graph, id) {
            if generate {
                self.generate_vec_inv(graph, id, ty)?;
            }
            return Ok(true);
        }
        if self.vector.is_generating_sequential(generate) {
            return self.generate_scalar_use(graph, ctx, id);
        }

        let instr = graph.instr(id).clone();
        match instr.op {
            Op::ArrayGet { string_char_at } => {
                if string_char_at && restrictions.has_any(R::NO_STRING_CHAR_AT) {
                    return Ok(false);
                }
                // Signed and unsigned flavors of one width load the same bits.
                let (base, index) = (instr.input(0), instr.input(1));
                if ty.to_signed() != instr.ty.to_signed() || !ctx.is_invariant(graph, base) {
                    return Ok(false);
                }
                let Some(offset) = ctx.facts.is_unit_stride(graph, ctx.info, index) else {
                    return Ok(false);
                };
                if generate {
                    self.generate_vec_sub(graph, index, offset)?;
                    let subscript = self.vector.lookup(index)?;
                    self.generate_vec_mem(graph, id, subscript, None, offset, ty)?;
                } else {
                    self.vector
                        .refs
                        .insert(ArrayReference::new(base, offset, ty, false, string_char_at));
                }
                Ok(true)
            }

            Op::Phi => {
                if !self.reductions.contains_key(&id) || restrictions.has_any(R::NO_REDUCTION) {
                    return Ok(false);
                }
                if generate {
                    self.generate_vec_reduction_phi(graph, id)?;
                }
                Ok(true)
            }

            Op::Convert => {
                let opa = instr.input(0);
                let (from, to) = (graph.ty(opa), instr.ty);
                if from.is_integral() && to.is_integral() {
                    let (size_vec, size_from, size_to) = (ty.size(), from.size(), to.size());
                    // Narrowing into the vector type, where wider operations
                    // cannot bring in high-order bits, or widening from at
                    // least the vector type.
                    let accepted = (size_to < size_from
                        && size_to == size_vec
                        && self.vectorize_use(graph, ctx, opa, generate, ty, restrictions | R::NO_HI_BITS)?)
                        || (size_to >= size_from
                            && size_from >= size_vec
                            && self.vectorize_use(graph, ctx, opa, generate, ty, restrictions)?);
                    if accepted && generate {
                        // Lanes already hold the converted bits.
                        let lanes = self.vector.lookup(opa)?;
                        self.vector.map.insert(id, lanes);
                    }
                    return Ok(accepted);
                }
                if from == DataType::Int32 && to == DataType::Float32 {
                    let mut from_restrictions = restrictions;
                    if self.try_set_vector_type(from, &mut from_restrictions)?
                        && self.vectorize_use(graph, ctx, opa, generate, from, from_restrictions)?
                    {
                        if generate {
                            let operand = self.vector.lookup(opa)?;
                            self.generate_vec_op(graph, id, &[operand], ty)?;
                        }
                        return Ok(true);
                    }
                }
                Ok(false)
            }

            Op::Unary(UnOp::Neg | UnOp::Not | UnOp::BoolNot) => {
                let opa = instr.input(0);
                if !self.vectorize_use(graph, ctx, opa, generate, ty, restrictions)? {
                    return Ok(false);
                }
                if generate {
                    let operand = self.vector.lookup(opa)?;
                    self.generate_vec_op(graph, id, &[operand], ty)?;
                }
                Ok(true)
            }

            Op::Unary(UnOp::Abs) => {
                if restrictions.has_any(R::NO_ABS) {
                    return Ok(false);
                }
                let opa = instr.input(0);
                let mut r = opa;
                if restrictions.has_any(R::NO_HI_BITS) {
                    // Only a sign-extended narrower operand keeps its sign bit.
                    match is_narrower_operand(graph, opa, ty) {
                        Some((narrow, false)) => r = narrow,
                        _ => return Ok(false),
                    }
                }
                if !self.vectorize_use(graph, ctx, r, generate, ty, restrictions)? {
                    return Ok(false);
                }
                if generate {
                    let operand = self.vector.lookup(r)?;
                    self.generate_vec_op(graph, id, &[operand], ty.to_signed())?;
                }
                Ok(true)
            }

            Op::Binary(
                op @ (BinOp::Add
                | BinOp::Sub
                | BinOp::Mul
                | BinOp::Div
                | BinOp::And
                | BinOp::Or
                | BinOp::Xor),
            ) => {
                if (op == BinOp::Mul && restrictions.has_any(R::NO_MUL))
                    || (op == BinOp::Div && restrictions.has_any(R::NO_DIV))
                {
                    return Ok(false);
                }
                let (opa, opb) = (instr.input(0), instr.input(1));
                if !(self.vectorize_use(graph, ctx, opa, generate, ty, restrictions)?
                    && self.vectorize_use(graph, ctx, opb, generate, ty, restrictions)?)
                {
                    return Ok(false);
                }
                if generate {
                    let operands = [self.vector.lookup(opa)?, self.vector.lookup(opb)?];
                    self.generate_vec_op(graph, id, &operands, ty)?;
                }
                Ok(true)
            }

            Op::Binary(op @ (BinOp::Shl | BinOp::Shr | BinOp::UShr)) => {
                if self.vectorize_halving_add_idiom(graph, ctx, id, generate, ty, restrictions)? {
                    return Ok(true);
                }
                if restrictions.has_any(R::NO_SHIFT) || (op == BinOp::Shr && restrictions.has_any(R::NO_SHR)) {
                    return Ok(false);
                }
                let (opa, opb) = (instr.input(0), instr.input(1));
                let mut r = opa;
                if restrictions.has_any(R::NO_HI_BITS) {
                    // Right shifts pull high-order bits into the narrow lanes;
                    // only a matching extension of a narrower operand is safe.
                    match (op, is_narrower_operand(graph, opa, ty)) {
                        (BinOp::Shl, _) => {}
                        (BinOp::Shr, Some((narrow, false))) | (BinOp::UShr, Some((narrow, true))) => r = narrow,
                        _ => return Ok(false),
                    }
                }
                let Some(distance) = graph.instr(opb).as_const() else {
                    return Ok(false);
                };
                if !(0..ty.bit_width() as i64).contains(&distance) {
                    return Ok(false);
                }
                if !self.vectorize_use(graph, ctx, r, generate, ty, restrictions)? {
                    return Ok(false);
                }
                if generate {
                    let operand = self.vector.lookup(r)?;
                    self.generate_vec_op(graph, id, &[operand, opb], ty)?;
                }
                Ok(true)
            }

            Op::Binary(BinOp::Min | BinOp::Max) => {
                if self.vectorize_saturation_idiom(graph, ctx, id, generate, ty, restrictions)? {
                    return Ok(true);
                }
                if restrictions.has_any(R::NO_MIN_MAX) {
                    return Ok(false);
                }
                let (opa, opb) = (instr.input(0), instr.input(1));
                let (mut r, mut s, mut is_unsigned) = (opa, opb, false);
                if restrictions.has_any(R::NO_HI_BITS) {
                    match is_narrower_operands(graph, opa, opb, ty) {
                        Some((a, b, unsigned)) => (r, s, is_unsigned) = (a, b, unsigned),
                        None => return Ok(false),
                    }
                }
                if !(self.vectorize_use(graph, ctx, r, generate, ty, restrictions)?
                    && self.vectorize_use(graph, ctx, s, generate, ty, restrictions)?)
                {
                    return Ok(false);
                }
                if generate {
                    let operands = [self.vector.lookup(r)?, self.vector.lookup(s)?];
                    self.generate_vec_op(graph, id, &operands, ty.to_proper(is_unsigned))?;
                }
                Ok(true)
            }

            _ => Ok(false),
        }
    }

    /// Sequential synthesis: clone an accepted instruction with its
    /// operands remapped.
    fn generate_scalar_use(&mut self, graph: &mut Graph, ctx: Candidate<'_>, id: InstrId) -> Result<bool, OptError> {
        let instr = graph.instr(id).clone();
        match instr.op {
            Op::ArrayGet { .. } => {
                let index = instr.input(1);
                let Some(offset) = ctx.facts.is_unit_stride(graph, ctx.info, index) else {
                    return Ok(false);
                };
                self.generate_vec_sub(graph, index, offset)?;
                let subscript = self.vector.lookup(index)?;
                self.generate_vec_mem(graph, id, subscript, None, offset, instr.ty)?;
                Ok(true)
            }
            Op::Phi => {
                if !self.reductions.contains_key(&id) {
                    return Ok(false);
                }
                self.generate_vec_reduction_phi(graph, id)?;
                Ok(true)
            }
            Op::Binary(_) | Op::Unary(_) | Op::Convert | Op::Compare(_) | Op::Select => {
                let mut operands = Vec::with_capacity(instr.inputs.len());
                for &input in &instr.inputs {
                    let input_ty = graph.ty(input);
                    if !self.vectorize_use(graph, ctx, input, true, input_ty, R::empty())? {
                        return Ok(false);
                    }
                    operands.push(self.vector.lookup(input)?);
                }
                self.generate_vec_op(graph, id, &operands, instr.ty)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // =========================================================================
    // Vector Type and Length
    // =========================================================================

    /// Pick `ty` as a vector element type: add the target's restrictions
    /// for it and check its lane count against the loop's vector length.
    pub(super) fn try_set_vector_type(&mut self, ty: DataType, restrictions: &mut R) -> Result<bool, OptError> {
        let Some((lanes, base)) = self.config.isa.vector_support(ty) else {
            return Ok(false);
        };
        *restrictions |= base;
        *self.vector.restrictions_seen.entry(ty).or_default() |= *restrictions;
        self.try_set_vector_length(ty, lanes)
    }

    /// All element types of one body must agree on the lane count, so the
    /// vector loop walks one uniform iteration space.
    pub(super) fn try_set_vector_length(&mut self, ty: DataType, lanes: u32) -> Result<bool, OptError> {
        let register_bytes = self.config.isa.vector_bytes();
        if lanes < 2 || !lanes.is_power_of_two() || lanes * ty.size() != register_bytes {
            return Err(OptError::VectorWidthMismatch {
                ty,
                lanes,
                register_bytes,
            });
        }
        if self.vector.length == 0 {
            self.vector.length = lanes;
        }
        Ok(self.vector.length == lanes)
    }
}

/// Some user sits outside the loop.
fn is_used_outside_loop(graph: &Graph, ctx: Candidate<'_>, id: InstrId) -> bool {
    graph
        .uses(id)
        .iter()
        .any(|&user| graph.block_of(user).map_or(true, |b| !ctx.info.contains(b)))
}
