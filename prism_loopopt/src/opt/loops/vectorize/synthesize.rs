//! Code generation for a vectorized loop.
//!
//! The original loop is replaced by up to three new loops sharing one
//! iteration counter `i`:
//!
//! ```text
//!   stc = trip count
//!   ptc = peel count          (static, or computed from an address)
//!   vtc = stc - (stc - ptc) % (vl * unroll)
//!
//!   for (i = 0; i < ptc; i += 1)          scalar body, aligns one access
//!   for (     ; i < vtc; i += vl)         vector body, unrolled
//!   for (     ; i < stc; i += 1)          scalar body, remaining iterations
//! ```
//!
//! Each new loop is spliced between the previous loop and the original
//! exit. The original header survives as a straight-line block.

use log::{debug, trace};

use crate::ir::cfg::LoopInfo;
use crate::ir::graph::{BlockId, Graph};
use crate::ir::instr::{Alignment, BinOp, CmpOp, InstrId, Op, ReductionKind, VecShape};
use crate::ir::types::DataType;
use crate::opt::loops::induction::{IndexOffset, LoopInductions};
use crate::opt::loops::{LoopNodeId, LoopOptimization};
use crate::opt::OptError;

use super::alignment::hidden_offset;
use super::{Candidate, LoopCursor, VectorMode};

impl LoopOptimization {
    // =========================================================================
    // Driver
    // =========================================================================

    /// Replace the analyzed loop by its peeling, vector and cleanup loops.
    #[allow(clippy::too_many_arguments)]
    pub(in crate::opt::loops) fn vectorize(
        &mut self,
        graph: &mut Graph,
        node: LoopNodeId,
        info: &LoopInfo,
        facts: &LoopInductions,
        main_phi: InstrId,
        body: BlockId,
        exit: BlockId,
        trip_count: Option<i64>,
    ) -> Result<(), OptError> {
        let header = info.header;
        let preheader = facts.preheader.ok_or(OptError::MissingPreheader(header))?;
        let ctx = Candidate { info, facts };
        let vl = self.vector.length;
        let static_peel = self.vector.static_peeling_factor;

        let body_size = graph.block(body).instrs.len() as u32;
        let unroll = self
            .helper
            .simd_unrolling_factor(body_size, trip_count.unwrap_or(0), self.max_number_peeled(), vl)
            .max(1);
        let chunk = vl * unroll;
        let mut needs_cleanup = trip_count.map_or(true, |tc| (tc - static_peel as i64) % chunk as i64 != 0);

        // The exit gets a new predecessor; its single-input phis go away.
        for phi in graph.block(exit).phis.clone() {
            if let Some(&value) = graph.instr(phi).inputs.first() {
                graph.replace_all_uses(phi, value);
            }
            graph.remove_instr(phi);
        }

        let index_ty = graph.ty(main_phi);
        let zero = graph.const_int(index_ty, 0);

        let mut ptc = None;
        if static_peel > 0 {
            ptc = Some(graph.const_int(index_ty, static_peel as i64));
        } else if let Some(candidate) = self.vector.dynamic_peeling_candidate {
            // Objects are aligned to the vector width here; peel until
            // element `i + offset` of the candidate starts a register.
            let shift = candidate.ty.size_shift();
            let align = (self.config.isa.vector_bytes() >> shift) as i64;
            let hidden = (hidden_offset(candidate.ty, candidate.string_char_at) >> shift) as i64;
            let start = match candidate.offset {
                IndexOffset::Const(c) => graph.const_int(index_ty, c + hidden),
                IndexOffset::Value(v) => {
                    let hidden = graph.const_int(index_ty, hidden);
                    graph.binary(preheader, BinOp::Add, index_ty, v, hidden)
                }
            };
            let mask = graph.const_int(index_ty, align - 1);
            let rem = graph.binary(preheader, BinOp::And, index_ty, start, mask);
            let aligned = graph.compare(preheader, CmpOp::Eq, rem, zero);
            let full = graph.const_int(index_ty, align);
            let missing = graph.binary(preheader, BinOp::Sub, index_ty, full, rem);
            ptc = Some(graph.emit(preheader, Op::Select, index_ty, &[aligned, zero, missing]));
            needs_cleanup = true;
        }

        let stc = facts
            .generate_trip_count(graph, preheader)
            .ok_or(OptError::MissingTripCount(header))?;
        let mut vtc = stc;
        if needs_cleanup {
            let mut diff = stc;
            if let Some(mut peel) = ptc {
                if trip_count.is_none() {
                    // Never peel past the end.
                    let enough = graph.compare(preheader, CmpOp::Ge, stc, peel);
                    peel = graph.emit(preheader, Op::Select, index_ty, &[enough, peel, stc]);
                    ptc = Some(peel);
                }
                diff = graph.binary(preheader, BinOp::Sub, index_ty, stc, peel);
            }
            let mask = graph.const_int(index_ty, chunk as i64 - 1);
            let rem = graph.binary(preheader, BinOp::And, index_ty, diff, mask);
            vtc = graph.binary(preheader, BinOp::Sub, index_ty, stc, rem);
        }
        if let Some((a, b)) = self.vector.runtime_test {
            // Aliasing arrays skip the vector loop entirely.
            let disjoint = graph.compare(preheader, CmpOp::Ne, a, b);
            vtc = graph.emit(preheader, Op::Select, index_ty, &[disjoint, vtc, zero]);
            needs_cleanup = true;
        }
        debug!(
            "loop {}: vector length {}, unroll {}, peel {}, cleanup {}",
            header,
            vl,
            unroll,
            if self.vector.dynamic_peeling_candidate.is_some() {
                "dynamic".to_string()
            } else {
                static_peel.to_string()
            },
            needs_cleanup
        );

        let (tail, index) = match ptc {
            Some(peel) => {
                self.vector.mode = VectorMode::Sequential;
                let peeling = self.generate_new_loop(graph, ctx, body, header, exit, zero, peel, 1, 1)?;
                (peeling.header, peeling.index)
            }
            None => (header, zero),
        };
        self.vector.mode = VectorMode::Vector;
        let vector_loop = self.generate_new_loop(graph, ctx, body, tail, exit, index, vtc, vl, unroll)?;
        if needs_cleanup {
            self.vector.mode = VectorMode::Sequential;
            let (tail, index) = (vector_loop.header, vector_loop.index);
            self.generate_new_loop(graph, ctx, body, tail, exit, index, stc, 1, 1)?;
        }

        // Code after the loop reads the last loop's reduction values.
        let mut replacements = Vec::new();
        for &phi in &graph.block(header).phis {
            if let Some(&feed) = self.reductions.get(&phi) {
                replacements.push((phi, feed));
            }
        }
        for (phi, feed) in &mut replacements {
            *feed = self.reduce_and_extract_if_needed(graph, *feed)?;
            trace!("reduction {} leaves the loop as {}", phi, feed);
        }

        graph.remove_block(body);
        for id in graph.block(header).instrs.clone().into_iter().rev() {
            graph.remove_instr(id);
        }
        for (phi, value) in replacements {
            graph.replace_all_uses(phi, value);
        }
        for phi in graph.block(header).phis.clone() {
            graph.remove_instr(phi);
        }
        let goto = graph.create(Op::Goto, DataType::Void, &[]);
        graph.append(header, goto);

        self.vector.cursor = None;
        self.refresh_loop_info_at(graph, node, vector_loop.header);
        if let Some(outer) = self.forest.node(node).outer {
            self.refresh_loop_chain(graph, outer);
        }
        Ok(())
    }

    /// Build `for (i = lo; i < hi; i += step)` between `tail` and `exit`
    /// and fill it with `unroll` copies of the original body.
    #[allow(clippy::too_many_arguments)]
    fn generate_new_loop(
        &mut self,
        graph: &mut Graph,
        ctx: Candidate<'_>,
        body: BlockId,
        tail: BlockId,
        exit: BlockId,
        lo: InstrId,
        hi: InstrId,
        step: u32,
        unroll: u32,
    ) -> Result<LoopCursor, OptError> {
        let index_ty = graph.ty(lo);
        let preheader = graph.add_block();
        let header = graph.add_block();
        let new_body = graph.add_block();
        graph.replace_successor(tail, exit, preheader);
        graph.goto(preheader, header);
        let phi = graph.add_phi(header, index_ty);
        let cond = graph.compare(header, CmpOp::Lt, phi, hi);
        graph.branch(header, cond, new_body, exit);
        graph.goto(new_body, header);

        self.vector.cursor = Some(LoopCursor {
            preheader,
            header,
            body: new_body,
            index: phi,
        });
        self.vector.permanent_map.clear();
        let step = graph.const_int(index_ty, step as i64);
        let instrs = graph.block(body).instrs.clone();
        for copy in 0..unroll {
            self.vector.unrolled_copy = copy;
            self.vector.map.clear();
            for &id in &instrs {
                if !self.vectorize_def(graph, ctx, id, true)? {
                    return Err(OptError::MissingVectorValue(id));
                }
            }
            // Original program order.
            for &id in &instrs {
                if let Some(&new) = self.vector.map.get(&id) {
                    if graph.block_of(new).is_none() {
                        graph.insert_before_terminator(new_body, new);
                    }
                }
            }
            let index = self.vector.cursor()?.index;
            let next = graph.binary(new_body, BinOp::Add, index_ty, index, step);
            if let Some(cursor) = self.vector.cursor.as_mut() {
                cursor.index = next;
            }
        }

        let mut steps: Vec<(InstrId, InstrId)> = self
            .reductions
            .iter()
            .filter(|&(&from, _)| !graph.instr(from).is_phi())
            .map(|(&step, &phi)| (phi, step))
            .collect();
        steps.sort();
        for (red_phi, red_step) in steps {
            self.generate_vec_reduction_phi_inputs(graph, red_phi, red_step)?;
        }

        let last = self.vector.cursor()?.index;
        graph.add_input(phi, lo);
        graph.add_input(phi, last);
        trace!("new loop {} over {} to {} ({:?})", header, lo, hi, self.vector.mode);
        Ok(LoopCursor {
            preheader,
            header,
            body: new_body,
            index: phi,
        })
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Counterpart of an invariant: the value itself for scalar code, a
    /// broadcast in the preheader for vector code.
    pub(super) fn generate_vec_inv(&mut self, graph: &mut Graph, org: InstrId, ty: DataType) -> Result<(), OptError> {
        if let Some(&known) = self.vector.permanent_map.get(&org) {
            self.vector.map.insert(org, known);
            return Ok(());
        }
        let value = match self.vector.mode {
            VectorMode::Sequential => org,
            VectorMode::Vector => {
                let cursor = self.vector.cursor()?;
                let mut input = org;
                let input_ty = graph.ty(org);
                if ty != input_ty && (ty == DataType::Int64 || input_ty == DataType::Int64) {
                    input = graph.emit(cursor.preheader, Op::Convert, ty, &[org]);
                }
                let shape = VecShape::new(ty, self.vector.length);
                let broadcast = graph.create_vec(Op::VecReplicateScalar, ty, &[input], shape);
                graph.insert_before_terminator(cursor.preheader, broadcast);
                broadcast
            }
        };
        self.vector.permanent_map.insert(org, value);
        self.vector.map.insert(org, value);
        Ok(())
    }

    /// Subscript of the new loop for the original subscript `org`.
    pub(super) fn generate_vec_sub(&mut self, graph: &mut Graph, org: InstrId, offset: IndexOffset) -> Result<(), OptError> {
        if self.vector.map.contains_key(&org) {
            return Ok(());
        }
        let cursor = self.vector.cursor()?;
        let index_ty = graph.ty(cursor.index);
        let subscript = match offset {
            IndexOffset::Const(0) => cursor.index,
            IndexOffset::Const(c) => {
                let c = graph.const_int(index_ty, c);
                graph.create(Op::Binary(BinOp::Add), index_ty, &[cursor.index, c])
            }
            IndexOffset::Value(v) => graph.create(Op::Binary(BinOp::Add), index_ty, &[cursor.index, v]),
        };
        // Header phis are not visited in program order.
        if graph.instr(org).is_phi() && graph.block_of(subscript).is_none() {
            graph.insert_before_terminator(cursor.body, subscript);
        }
        self.vector.map.insert(org, subscript);
        Ok(())
    }

    /// Array load (`value == None`) or store of the new loop.
    pub(super) fn generate_vec_mem(
        &mut self,
        graph: &mut Graph,
        org: InstrId,
        subscript: InstrId,
        value: Option<InstrId>,
        offset: IndexOffset,
        ty: DataType,
    ) -> Result<(), OptError> {
        let instr = graph.instr(org).clone();
        let base = instr.input(0);
        let access = match self.vector.mode {
            VectorMode::Vector => {
                let string_char_at = matches!(instr.op, Op::ArrayGet { string_char_at: true });
                let alignment = self.access_alignment(base, offset, ty, string_char_at);
                let shape = VecShape::new(ty, self.vector.length);
                match value {
                    Some(value) => graph.create_vec(
                        Op::VecStore { alignment },
                        DataType::Void,
                        &[base, subscript, value],
                        shape,
                    ),
                    None => graph.create_vec(
                        Op::VecLoad {
                            string_char_at,
                            alignment,
                        },
                        ty,
                        &[base, subscript],
                        shape,
                    ),
                }
            }
            VectorMode::Sequential => match value {
                Some(value) => graph.create(instr.op, instr.ty, &[base, subscript, value]),
                None => graph.create(instr.op, instr.ty, &[base, subscript]),
            },
        };
        self.vector.map.insert(org, access);
        Ok(())
    }

    /// Known alignment of a vector access inside the vector loop.
    fn access_alignment(&self, base: InstrId, offset: IndexOffset, ty: DataType, string_char_at: bool) -> Alignment {
        match self.vector.dynamic_peeling_candidate {
            Some(c)
                if c.base == base
                    && c.offset == offset
                    && c.ty.size() == ty.size()
                    && c.string_char_at == string_char_at =>
            {
                Alignment::new(self.config.isa.vector_bytes(), 0)
            }
            Some(_) => Alignment::new(ty.size(), 0),
            None => self.compute_alignment(offset, ty, string_char_at, self.vector.static_peeling_factor),
        }
    }

    /// Clone `org` onto new operands: as a vector operation of packed type
    /// `ty`, or as a scalar copy.
    pub(super) fn generate_vec_op(
        &mut self,
        graph: &mut Graph,
        org: InstrId,
        operands: &[InstrId],
        ty: DataType,
    ) -> Result<(), OptError> {
        let instr = graph.instr(org);
        let (op, org_ty) = (instr.op, instr.ty);
        let new = match self.vector.mode {
            VectorMode::Vector => graph.create_vec(op, ty, operands, VecShape::new(ty, self.vector.length)),
            VectorMode::Sequential => graph.create(op, org_ty, operands),
        };
        self.vector.map.insert(org, new);
        Ok(())
    }

    // =========================================================================
    // Reductions
    // =========================================================================

    /// Accumulator of the new loop for reduction phi `phi`: the result of
    /// the previous unrolled copy, or a fresh phi.
    pub(super) fn generate_vec_reduction_phi(&mut self, graph: &mut Graph, phi: InstrId) -> Result<(), OptError> {
        let accumulator = match self.vector.permanent_map.get(&phi) {
            Some(&previous) => previous,
            None => {
                let cursor = self.vector.cursor()?;
                graph.add_phi(cursor.header, graph.ty(phi))
            }
        };
        self.vector.map.insert(phi, accumulator);
        Ok(())
    }

    /// Close the accumulator cycle of one reduction and make the new phi
    /// the feed of the next loop.
    fn generate_vec_reduction_phi_inputs(&mut self, graph: &mut Graph, phi: InstrId, step: InstrId) -> Result<(), OptError> {
        let new_red = self.vector.lookup(step)?;
        let mut new_phi = self.vector.lookup(phi)?;
        while !graph.instr(new_phi).is_phi() {
            new_phi = *self
                .vector
                .permanent_map
                .get(&new_phi)
                .ok_or(OptError::MissingVectorValue(new_phi))?;
        }
        let feed = *self.reductions.get(&phi).ok_or(OptError::MissingVectorValue(phi))?;

        let init = match self.vector.mode {
            VectorMode::Vector => {
                let red = graph.instr(new_red);
                let shape = red.vec.ok_or(OptError::MissingVectorValue(step))?;
                let kind = reduction_kind(red.op).ok_or(OptError::MissingVectorValue(step))?;
                // Sums start from [init, 0, .., 0]; min and max from [init, .., init].
                let op = match kind {
                    ReductionKind::Sum => Op::VecSetScalars,
                    ReductionKind::Min | ReductionKind::Max => Op::VecReplicateScalar,
                };
                let cursor = self.vector.cursor()?;
                let init = graph.create_vec(op, shape.packed, &[feed], shape);
                graph.insert_before_terminator(cursor.preheader, init);
                graph.set_vec_shape(new_phi, Some(shape));
                init
            }
            VectorMode::Sequential => self.reduce_and_extract_if_needed(graph, feed)?,
        };
        graph.add_input(new_phi, init);
        graph.add_input(new_phi, new_red);
        self.reductions.insert(phi, new_phi);
        Ok(())
    }

    /// Scalar value of a reduction phi once its loop exits: the phi itself,
    /// or for a vector accumulator its horizontal reduction, computed at
    /// the top of the loop's exit block.
    fn reduce_and_extract_if_needed(&mut self, graph: &mut Graph, value: InstrId) -> Result<InstrId, OptError> {
        let instr = graph.instr(value);
        let (Some(block), Some(&update)) = (instr.block, instr.inputs.get(1)) else {
            return Ok(value);
        };
        if !instr.is_phi() {
            return Ok(value);
        }
        let Some(shape) = graph.instr(update).vec else {
            return Ok(value);
        };
        let kind = reduction_kind(graph.instr(update).op).ok_or(OptError::MissingVectorValue(update))?;
        let exit = *graph.block(block).succs.get(1).ok_or(OptError::NoTargetLoop)?;
        let scalar_ty = graph.ty(value);

        let reduce = graph.create_vec(Op::VecReduce(kind), shape.packed, &[value], shape);
        graph.insert_at_start(exit, reduce);
        let extract = graph.create_vec(Op::VecExtractScalar, scalar_ty, &[reduce], shape);
        graph.insert_after(reduce, extract);
        Ok(extract)
    }
}

/// How the lanes of a vector accumulator combine into one value.
fn reduction_kind(op: Op) -> Option<ReductionKind> {
    match op {
        Op::VecSadAccumulate | Op::VecDotProd { .. } | Op::Binary(BinOp::Add | BinOp::Sub) => Some(ReductionKind::Sum),
        Op::Binary(BinOp::Min) => Some(ReductionKind::Min),
        Op::Binary(BinOp::Max) => Some(ReductionKind::Max),
        _ => None,
    }
}
