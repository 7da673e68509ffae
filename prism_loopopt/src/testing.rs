//! Graph builders shared by the unit tests.

use crate::ir::cfg::{DominatorTree, LoopAnalysis, LoopInfo};
use crate::ir::graph::{BlockId, Graph};
use crate::ir::instr::{BinOp, CmpOp, InstrId, Op};
use crate::ir::types::DataType;

/// Blocks and values of a loop made by [`build_loop`].
#[derive(Debug, Clone, Copy)]
pub struct SimpleLoop {
    pub pre: BlockId,
    pub header: BlockId,
    pub body: BlockId,
    pub exit: BlockId,
    pub phi: InstrId,
    pub update: InstrId,
    pub cond: InstrId,
}

/// `for (i = init; i op bound; i += stride) {}` entered from the entry
/// block. The body ends in a jump back to the header, so instructions
/// emitted into it land before that jump. The exit block is left open.
pub fn build_loop(g: &mut Graph, init: InstrId, bound: InstrId, op: CmpOp, stride: i64) -> SimpleLoop {
    let entry = g.entry();
    build_loop_from(g, entry, init, bound, op, stride)
}

/// Same as [`build_loop`], entered from `from`, which gets a jump to the
/// new preheader.
pub fn build_loop_from(
    g: &mut Graph,
    from: BlockId,
    init: InstrId,
    bound: InstrId,
    op: CmpOp,
    stride: i64,
) -> SimpleLoop {
    let ty = g.ty(init);
    let pre = g.add_block();
    let header = g.add_block();
    let body = g.add_block();
    let exit = g.add_block();
    g.goto(from, pre);
    g.goto(pre, header);

    let phi = g.add_phi(header, ty);
    let cond = g.compare(header, op, phi, bound);
    g.branch(header, cond, body, exit);

    let step = g.const_int(ty, stride);
    let update = g.binary(body, BinOp::Add, ty, phi, step);
    g.goto(body, header);
    g.add_input(phi, init);
    g.add_input(phi, update);

    SimpleLoop {
        pre,
        header,
        body,
        exit,
        phi,
        update,
        cond,
    }
}

/// Detected loop facts for the loop headed by `header`.
pub fn loop_info(g: &Graph, header: BlockId) -> LoopInfo {
    let dom = DominatorTree::build(g);
    LoopAnalysis::compute(g, &dom)
        .loops
        .into_iter()
        .find(|l| l.header == header)
        .expect("no loop at header")
}

/// Read `array[index]` in `block`.
pub fn load(g: &mut Graph, block: BlockId, ty: DataType, array: InstrId, index: InstrId) -> InstrId {
    g.emit(block, Op::ArrayGet { string_char_at: false }, ty, &[array, index])
}

/// Write `array[index] = value` in `block`.
pub fn store(
    g: &mut Graph,
    block: BlockId,
    component: DataType,
    array: InstrId,
    index: InstrId,
    value: InstrId,
) -> InstrId {
    g.emit(block, Op::ArraySet { component }, DataType::Void, &[array, index, value])
}

/// `for (i = 0; i < n; i++) c[i] = a[i] op b[i]` over arrays of `ty`,
/// computed in `Int32` for narrow types. Parameters are `(a, b, c, n)`.
pub fn elementwise_loop(ty: DataType, op: BinOp) -> (Graph, SimpleLoop) {
    let mut g = Graph::new();
    let a = g.param(0, DataType::Reference);
    let b = g.param(1, DataType::Reference);
    let c = g.param(2, DataType::Reference);
    let n = g.param(3, DataType::Int32);
    let zero = g.const_int(DataType::Int32, 0);
    let l = build_loop(&mut g, zero, n, CmpOp::Lt, 1);
    let x = load(&mut g, l.body, ty, a, l.phi);
    let y = load(&mut g, l.body, ty, b, l.phi);
    let wide = if ty.size() < 4 { DataType::Int32 } else { ty };
    let r = g.binary(l.body, op, wide, x, y);
    let narrowed = if wide != ty {
        g.emit(l.body, Op::Convert, ty, &[r])
    } else {
        r
    };
    store(&mut g, l.body, ty, c, l.phi, narrowed);
    g.ret(l.exit, None);
    (g, l)
}
