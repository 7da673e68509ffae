use proptest::prelude::*;
use rustc_hash::FxHashMap;

use crate::ir::cfg::{DominatorTree, LoopAnalysis};
use crate::ir::graph::{BlockId, Graph};
use crate::ir::instr::{BinOp, CmpOp, InstrId, Op, UnOp};
use crate::ir::interp::{Heap, Interpreter, Outcome, Value};
use crate::ir::types::DataType;
use crate::opt::loops::induction::LoopInductions;
use crate::opt::loops::{LoopOptConfig, LoopOptimization, TargetIsa};
use crate::opt::OptimizationPass;
use crate::testing::{build_loop, elementwise_loop, load, loop_info, store, SimpleLoop};

use super::VectorRestrictions as R;

// =============================================================================
// Helpers
// =============================================================================

fn loop_count(g: &Graph) -> usize {
    let dom = DominatorTree::build(g);
    LoopAnalysis::compute(g, &dom).loops.len()
}

/// Run `g` on fresh arrays followed by integer parameters. Returns the
/// outcome and the final contents of every array.
fn execute(g: &Graph, arrays: &[(DataType, Vec<i64>)], ints: &[i64]) -> (Outcome, Vec<Vec<i64>>) {
    let mut heap = Heap::new();
    let mut params: Vec<Value> = arrays
        .iter()
        .map(|(ty, values)| heap.alloc_ints(*ty, values))
        .collect();
    let refs = params.clone();
    params.extend(ints.iter().map(|&v| Value::Int(v)));
    let outcome = Interpreter::new(g).with_fuel(100_000).run(&params, &mut heap).unwrap();
    let contents = refs.iter().map(|r| heap.ints(r)).collect();
    (outcome, contents)
}

/// Check `optimized` computes what `reference` computes.
fn assert_same_behavior(reference: &Graph, optimized: &Graph, arrays: &[(DataType, Vec<i64>)], ints: &[i64]) -> Outcome {
    let (expected, expected_arrays) = execute(reference, arrays, ints);
    let (actual, actual_arrays) = execute(optimized, arrays, ints);
    assert_eq!(actual.result, expected.result);
    assert_eq!(actual_arrays, expected_arrays);
    actual
}

fn vectorizer(isa: TargetIsa) -> LoopOptimization {
    LoopOptimization::with_config(LoopOptConfig::default().with_isa(isa))
}

fn ramp(len: usize, scale: i64, bias: i64) -> Vec<i64> {
    (0..len as i64).map(|i| i * scale + bias).collect()
}

/// `s = 0; for (i = 0; i < n; i++) s += term(a[i], b[i]); return s` with
/// `Int32` accumulation. Parameters are `(a, b, n)`.
fn reduction_loop<F>(elem: DataType, term: F) -> Graph
where
    F: FnOnce(&mut Graph, BlockId, InstrId, InstrId) -> InstrId,
{
    let mut g = Graph::new();
    let a = g.param(0, DataType::Reference);
    let b = g.param(1, DataType::Reference);
    let n = g.param(2, DataType::Int32);
    let zero = g.const_int(DataType::Int32, 0);
    let l = build_loop(&mut g, zero, n, CmpOp::Lt, 1);
    let s = g.add_phi(l.header, DataType::Int32);
    let x = load(&mut g, l.body, elem, a, l.phi);
    let y = load(&mut g, l.body, elem, b, l.phi);
    let t = term(&mut g, l.body, x, y);
    let next = g.binary(l.body, BinOp::Add, DataType::Int32, s, t);
    g.add_input(s, zero);
    g.add_input(s, next);
    g.ret(l.exit, Some(s));
    g
}

// =============================================================================
// Element-wise Loops
// =============================================================================

#[test]
fn test_known_trip_count_runs_one_vector_iteration() {
    let build = || {
        let mut g = Graph::new();
        let a = g.param(0, DataType::Reference);
        let b = g.param(1, DataType::Reference);
        let c = g.param(2, DataType::Reference);
        let zero = g.const_int(DataType::Int32, 0);
        let eight = g.const_int(DataType::Int32, 8);
        let l = build_loop(&mut g, zero, eight, CmpOp::Lt, 1);
        let x = load(&mut g, l.body, DataType::Int16, a, l.phi);
        let y = load(&mut g, l.body, DataType::Int16, b, l.phi);
        let sum = g.binary(l.body, BinOp::Add, DataType::Int32, x, y);
        let narrowed = g.emit(l.body, Op::Convert, DataType::Int16, &[sum]);
        store(&mut g, l.body, DataType::Int16, c, l.phi, narrowed);
        g.ret(l.exit, None);
        g
    };
    let reference = build();
    let mut g = build();
    let mut pass = vectorizer(TargetIsa::Arm64Neon);
    assert!(pass.run(&mut g));
    assert_eq!(pass.stats().loops_vectorized, 1);
    // Eight lanes cover all iterations: no peeling and no cleanup loop.
    assert_eq!(loop_count(&g), 1);

    let arrays = [
        (DataType::Int16, vec![1, 2, 3, 32767, -5, 6, 7, -32768]),
        (DataType::Int16, vec![10, 20, 30, 1, 50, 60, 70, -1]),
        (DataType::Int16, vec![0; 8]),
    ];
    let outcome = assert_same_behavior(&reference, &g, &arrays, &[]);
    // Two loads, the add and the store, once.
    assert_eq!(outcome.vector_ops, 4);
}

#[test]
fn test_unknown_trip_count_gets_cleanup_loop() {
    let (reference, _) = elementwise_loop(DataType::Int16, BinOp::Add);
    let (mut g, _) = elementwise_loop(DataType::Int16, BinOp::Add);
    let mut pass = vectorizer(TargetIsa::Arm64Neon);
    assert!(pass.run(&mut g));
    assert_eq!(pass.stats().loops_vectorized, 1);
    assert_eq!(loop_count(&g), 2);

    for n in [0, 3, 8, 21] {
        let arrays = [
            (DataType::Int16, ramp(24, 1000, -12000)),
            (DataType::Int16, ramp(24, -77, 300)),
            (DataType::Int16, vec![0; 24]),
        ];
        let outcome = assert_same_behavior(&reference, &g, &arrays, &[n]);
        if n < 8 {
            assert_eq!(outcome.vector_ops, 0);
        } else {
            assert!(outcome.vector_ops > 0);
        }
    }
}

#[test]
fn test_float_loop_is_vectorized() {
    let (reference, _) = elementwise_loop(DataType::Float32, BinOp::Mul);
    let (mut g, _) = elementwise_loop(DataType::Float32, BinOp::Mul);
    let mut pass = vectorizer(TargetIsa::Arm64Neon);
    assert!(pass.run(&mut g));
    assert_eq!(pass.stats().loops_vectorized, 1);

    let run = |graph: &Graph| {
        let mut heap = Heap::new();
        let a = heap.alloc_floats(DataType::Float32, &[0.5, 1.5, -2.0, 3.0, 4.5, 8.0, -0.25, 2.0, 1.0, 6.0, 0.75]);
        let b = heap.alloc_floats(DataType::Float32, &[2.0, -4.0, 0.5, 1.0, 2.0, 0.125, 8.0, 3.0, -1.0, 0.5, 4.0]);
        let c = heap.alloc_floats(DataType::Float32, &[0.0; 11]);
        Interpreter::new(graph)
            .run(&[a, b, c.clone(), Value::Int(11)], &mut heap)
            .unwrap();
        heap.floats(&c)
    };
    assert_eq!(run(&g), run(&reference));
}

#[test]
fn test_invariant_float_operand_is_broadcast() {
    // c[i] = a[i] * 2.5
    let build = || {
        let mut g = Graph::new();
        let a = g.param(0, DataType::Reference);
        let c = g.param(1, DataType::Reference);
        let n = g.param(2, DataType::Int32);
        let zero = g.const_int(DataType::Int32, 0);
        let scale = g.const_float(DataType::Float32, 2.5);
        let l = build_loop(&mut g, zero, n, CmpOp::Lt, 1);
        let x = load(&mut g, l.body, DataType::Float32, a, l.phi);
        let y = g.binary(l.body, BinOp::Mul, DataType::Float32, x, scale);
        store(&mut g, l.body, DataType::Float32, c, l.phi, y);
        g.ret(l.exit, None);
        g
    };
    let reference = build();
    let mut g = build();
    let mut pass = vectorizer(TargetIsa::Arm64Neon);
    assert!(pass.run(&mut g));
    assert_eq!(pass.stats().loops_vectorized, 1);

    let run = |graph: &Graph| {
        let mut heap = Heap::new();
        let a = heap.alloc_floats(DataType::Float32, &[1.0, -2.0, 0.5, 4.0, 8.0, -0.25, 3.0]);
        let c = heap.alloc_floats(DataType::Float32, &[0.0; 7]);
        Interpreter::new(graph)
            .run(&[a, c.clone(), Value::Int(7)], &mut heap)
            .unwrap();
        heap.floats(&c)
    };
    assert_eq!(run(&g), run(&reference));
    assert_eq!(run(&g)[3], 10.0);
}

#[test]
fn test_string_chars_are_vectorized() {
    // c[i] = s.charAt(i)
    let build = || {
        let mut g = Graph::new();
        let s = g.param(0, DataType::Reference);
        let c = g.param(1, DataType::Reference);
        let n = g.param(2, DataType::Int32);
        let zero = g.const_int(DataType::Int32, 0);
        let l = build_loop(&mut g, zero, n, CmpOp::Lt, 1);
        let ch = g.emit(l.body, Op::ArrayGet { string_char_at: true }, DataType::Uint16, &[s, l.phi]);
        store(&mut g, l.body, DataType::Uint16, c, l.phi, ch);
        g.ret(l.exit, None);
        g
    };
    let reference = build();
    let mut g = build();
    let mut pass = vectorizer(TargetIsa::Arm64Neon);
    assert!(pass.run(&mut g));
    assert_eq!(pass.stats().loops_vectorized, 1);

    let text = "vectorized strings!";
    let run = |graph: &Graph| {
        let mut heap = Heap::new();
        let s = heap.alloc_string(text);
        let c = heap.alloc_ints(DataType::Uint16, &[0; 19]);
        Interpreter::new(graph)
            .run(&[s, c.clone(), Value::Int(19)], &mut heap)
            .unwrap();
        heap.ints(&c)
    };
    let expected: Vec<i64> = text.encode_utf16().map(i64::from).collect();
    assert_eq!(run(&reference), expected);
    assert_eq!(run(&g), expected);
}

#[test]
fn test_string_chars_rejected_without_capability() {
    // 32-bit ARM cannot load string characters into vectors.
    let mut g = Graph::new();
    let s = g.param(0, DataType::Reference);
    let c = g.param(1, DataType::Reference);
    let n = g.param(2, DataType::Int32);
    let zero = g.const_int(DataType::Int32, 0);
    let l = build_loop(&mut g, zero, n, CmpOp::Lt, 1);
    let ch = g.emit(l.body, Op::ArrayGet { string_char_at: true }, DataType::Uint16, &[s, l.phi]);
    store(&mut g, l.body, DataType::Uint16, c, l.phi, ch);
    g.ret(l.exit, None);
    let mut pass = vectorizer(TargetIsa::Arm32Neon);
    pass.run(&mut g);
    assert_eq!(pass.stats().loops_vectorized, 0);
}

#[test]
fn test_debuggable_code_is_not_vectorized() {
    let (mut g, _) = elementwise_loop(DataType::Int32, BinOp::Add);
    let mut pass = LoopOptimization::with_config(LoopOptConfig {
        debuggable: true,
        ..LoopOptConfig::default()
    });
    pass.run(&mut g);
    assert_eq!(pass.stats().loops_vectorized, 0);
}

#[test]
fn test_unsupported_operation_is_rejected() {
    // No vector multiply for 64-bit lanes.
    let (reference, _) = elementwise_loop(DataType::Int64, BinOp::Mul);
    let (mut g, _) = elementwise_loop(DataType::Int64, BinOp::Mul);
    let mut pass = vectorizer(TargetIsa::Arm64Neon);
    pass.run(&mut g);
    assert_eq!(pass.stats().loops_vectorized, 0);
    let arrays = [
        (DataType::Int64, ramp(9, 3, 1)),
        (DataType::Int64, ramp(9, -5, 2)),
        (DataType::Int64, vec![0; 9]),
    ];
    assert_same_behavior(&reference, &g, &arrays, &[9]);
}

// =============================================================================
// Dependences
// =============================================================================

/// `for (i = 0; i < n; i++) b[i + 1] = a[i] + 1`. Parameters are `(a, b, n)`.
fn shifted_copy() -> Graph {
    let mut g = Graph::new();
    let a = g.param(0, DataType::Reference);
    let b = g.param(1, DataType::Reference);
    let n = g.param(2, DataType::Int32);
    let zero = g.const_int(DataType::Int32, 0);
    let one = g.const_int(DataType::Int32, 1);
    let l = build_loop(&mut g, zero, n, CmpOp::Lt, 1);
    let x = load(&mut g, l.body, DataType::Int32, a, l.phi);
    let y = g.binary(l.body, BinOp::Add, DataType::Int32, x, one);
    let next = g.binary(l.body, BinOp::Add, DataType::Int32, l.phi, one);
    store(&mut g, l.body, DataType::Int32, b, next, y);
    g.ret(l.exit, None);
    g
}

#[test]
fn test_loop_carried_dependence_is_rejected() {
    // a[i + 1] = a[i] + 1 on one array.
    let build = || {
        let mut g = Graph::new();
        let a = g.param(0, DataType::Reference);
        let n = g.param(1, DataType::Int32);
        let zero = g.const_int(DataType::Int32, 0);
        let one = g.const_int(DataType::Int32, 1);
        let l = build_loop(&mut g, zero, n, CmpOp::Lt, 1);
        let x = load(&mut g, l.body, DataType::Int32, a, l.phi);
        let y = g.binary(l.body, BinOp::Add, DataType::Int32, x, one);
        let next = g.binary(l.body, BinOp::Add, DataType::Int32, l.phi, one);
        store(&mut g, l.body, DataType::Int32, a, next, y);
        g.ret(l.exit, None);
        g
    };
    let reference = build();
    let mut g = build();
    let mut pass = vectorizer(TargetIsa::Arm64Neon);
    pass.run(&mut g);
    assert_eq!(pass.stats().loops_vectorized, 0);
    assert_same_behavior(&reference, &g, &[(DataType::Int32, ramp(13, 2, 5))], &[12]);
}

#[test]
fn test_runtime_disjointness_test() {
    let reference = shifted_copy();
    let mut g = shifted_copy();
    let mut pass = vectorizer(TargetIsa::Arm64Neon);
    assert!(pass.run(&mut g));
    assert_eq!(pass.stats().loops_vectorized, 1);

    // Distinct arrays take the vector path.
    let arrays = [(DataType::Int32, ramp(17, 3, -4)), (DataType::Int32, vec![0; 17])];
    let distinct = assert_same_behavior(&reference, &g, &arrays, &[16]);
    assert!(distinct.vector_ops > 0);

    // The same array twice must run every iteration sequentially.
    let aliased_run = |graph: &Graph| {
        let mut heap = Heap::new();
        let a = heap.alloc_ints(DataType::Int32, &ramp(17, 3, -4));
        let outcome = Interpreter::new(graph)
            .run(&[a.clone(), a.clone(), Value::Int(16)], &mut heap)
            .unwrap();
        (outcome, heap.ints(&a))
    };
    let (_, expected) = aliased_run(&reference);
    let (aliased, actual) = aliased_run(&g);
    assert_eq!(actual, expected);
    assert_eq!(expected, ramp(17, 1, -4));
    assert!(aliased.vector_ops < distinct.vector_ops);
}

// =============================================================================
// Reductions and Idioms
// =============================================================================

#[test]
fn test_sum_reduction() {
    let build = || reduction_loop(DataType::Int32, |g, body, x, y| g.binary(body, BinOp::Add, DataType::Int32, x, y));
    let reference = build();
    let mut g = build();
    let mut pass = vectorizer(TargetIsa::Arm64Neon);
    assert!(pass.run(&mut g));
    assert_eq!(pass.stats().loops_vectorized, 1);

    for n in [0, 3, 4, 17] {
        let arrays = [(DataType::Int32, ramp(20, 7, -30)), (DataType::Int32, vec![0; 20])];
        assert_same_behavior(&reference, &g, &arrays, &[n]);
    }
    let (outcome, _) = execute(&g, &[(DataType::Int32, vec![1; 20]), (DataType::Int32, vec![0; 20])], &[17]);
    assert_eq!(outcome.result, Some(Value::Int(17)));
}

#[test]
fn test_sad_idiom() {
    let build = || {
        reduction_loop(DataType::Int16, |g, body, x, y| {
            let d = g.binary(body, BinOp::Sub, DataType::Int32, x, y);
            g.emit(body, Op::Unary(UnOp::Abs), DataType::Int32, &[d])
        })
    };
    let reference = build();
    let mut g = build();
    let mut pass = vectorizer(TargetIsa::Arm64Neon);
    assert!(pass.run(&mut g));
    assert_eq!(pass.stats().loops_vectorized, 1);
    assert_eq!(pass.stats().idioms_vectorized, 1);

    let arrays = [
        (DataType::Int16, vec![32767, -32768, 5, 0, 100, -100, 7, 8, 9, 10, -11, 12, 13, 14, 15, 16, 17, 18, 19]),
        (DataType::Int16, vec![-32768, 32767, -5, 0, -100, 100, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]),
    ];
    for n in [0, 8, 19] {
        assert_same_behavior(&reference, &g, &arrays, &[n]);
    }
}

#[test]
fn test_dot_product_idiom() {
    let build = || {
        reduction_loop(DataType::Int8, |g, body, x, y| g.binary(body, BinOp::Mul, DataType::Int32, x, y))
    };
    let reference = build();
    let mut g = build();
    let mut pass = vectorizer(TargetIsa::Arm64Neon);
    assert!(pass.run(&mut g));
    assert_eq!(pass.stats().idioms_vectorized, 1);

    let arrays = [
        (DataType::Int8, ramp(35, 7, -120)),
        (DataType::Int8, ramp(35, -3, 100)),
    ];
    for n in [5, 16, 35] {
        assert_same_behavior(&reference, &g, &arrays, &[n]);
    }
}

#[test]
fn test_sad_on_accumulator_width_stays_scalar_exact() {
    // abs(a[i] - b[i]) wraps in 32 bits before the absolute value.
    let build = || {
        reduction_loop(DataType::Int32, |g, body, x, y| {
            let d = g.binary(body, BinOp::Sub, DataType::Int32, x, y);
            g.emit(body, Op::Unary(UnOp::Abs), DataType::Int32, &[d])
        })
    };
    let reference = build();
    let mut g = build();
    let mut pass = vectorizer(TargetIsa::Arm64Neon);
    pass.run(&mut g);
    assert_eq!(pass.stats().idioms_vectorized, 0);

    let mut a = vec![0; 8];
    let mut b = vec![0; 8];
    a[0] = i32::MAX as i64;
    b[0] = i32::MIN as i64;
    let arrays = [(DataType::Int32, a), (DataType::Int32, b)];
    let outcome = assert_same_behavior(&reference, &g, &arrays, &[8]);
    assert_eq!(outcome.result, Some(Value::Int(1)));
}

/// `c[i] = (a[i] + b[i] [+ 1]) >> 1` over 16-bit arrays, computed in
/// `Int32`. Parameters are `(a, b, c, n)`; a constant `bound` replaces `n`.
fn halving_add_loop(ty: DataType, shift: BinOp, rounded: bool, bound: Option<i64>) -> Graph {
    let mut g = Graph::new();
    let a = g.param(0, DataType::Reference);
    let b = g.param(1, DataType::Reference);
    let c = g.param(2, DataType::Reference);
    let n = g.param(3, DataType::Int32);
    let n = bound.map_or(n, |v| g.const_int(DataType::Int32, v));
    let zero = g.const_int(DataType::Int32, 0);
    let one = g.const_int(DataType::Int32, 1);
    let l = build_loop(&mut g, zero, n, CmpOp::Lt, 1);
    let x = load(&mut g, l.body, ty, a, l.phi);
    let y = load(&mut g, l.body, ty, b, l.phi);
    let mut sum = g.binary(l.body, BinOp::Add, DataType::Int32, x, y);
    if rounded {
        sum = g.binary(l.body, BinOp::Add, DataType::Int32, sum, one);
    }
    let half = g.binary(l.body, shift, DataType::Int32, sum, one);
    let narrowed = g.emit(l.body, Op::Convert, ty, &[half]);
    store(&mut g, l.body, ty, c, l.phi, narrowed);
    g.ret(l.exit, None);
    g
}

#[test]
fn test_rounded_halving_add_idiom() {
    let build = || halving_add_loop(DataType::Int16, BinOp::Shr, true, None);
    let reference = build();
    let mut g = build();
    let mut pass = vectorizer(TargetIsa::Arm64Neon);
    assert!(pass.run(&mut g));
    assert_eq!(pass.stats().idioms_vectorized, 1);

    let arrays = [
        (DataType::Int16, vec![32767, -32768, 32767, -1, 3, 4, -5, 6, 7, 8, 9, 10, 11]),
        (DataType::Int16, vec![32767, -32768, -32768, 0, 4, -4, -6, 7, 8, 9, 10, 11, 12]),
        (DataType::Int16, vec![0; 13]),
    ];
    assert_same_behavior(&reference, &g, &arrays, &[13]);
}

#[test]
fn test_unsigned_halving_add_extremes() {
    for (shift, rounded) in [(BinOp::Shr, false), (BinOp::Shr, true), (BinOp::UShr, false), (BinOp::UShr, true)] {
        let reference = halving_add_loop(DataType::Uint16, shift, rounded, None);
        let mut g = halving_add_loop(DataType::Uint16, shift, rounded, None);
        let mut pass = vectorizer(TargetIsa::Arm64Neon);
        assert!(pass.run(&mut g));
        assert_eq!(pass.stats().idioms_vectorized, 1);

        let arrays = [
            (DataType::Uint16, vec![65535, 65535, 0, 0, 1, 65534, 32768, 32767, 3]),
            (DataType::Uint16, vec![65535, 0, 0, 1, 1, 65535, 32768, 32768, 4]),
            (DataType::Uint16, vec![0; 9]),
        ];
        let (_, contents) = execute(&g, &arrays, &[9]);
        let expected: Vec<i64> = arrays[0]
            .1
            .iter()
            .zip(&arrays[1].1)
            .map(|(x, y)| (x + y + rounded as i64) >> 1)
            .collect();
        assert_eq!(contents[2], expected);
        assert_same_behavior(&reference, &g, &arrays, &[9]);
    }
}

#[test]
fn test_unrolled_idiom_counted_once() {
    // 64 iterations of 8 lanes unroll the vector body.
    let build = || halving_add_loop(DataType::Int16, BinOp::Shr, true, Some(64));
    let reference = build();
    let mut g = build();
    let mut pass = vectorizer(TargetIsa::Arm64Neon);
    assert!(pass.run(&mut g));
    assert_eq!(pass.stats().loops_vectorized, 1);
    assert_eq!(pass.stats().idioms_vectorized, 1);
    let hadds = g
        .blocks()
        .flat_map(|b| g.block(b).instrs.clone())
        .filter(|&id| matches!(g.instr(id).op, Op::VecHalvingAdd { .. }))
        .count();
    assert!(hadds > 1);

    let arrays = [
        (DataType::Int16, ramp(64, 997, -32000)),
        (DataType::Int16, ramp(64, -1000, 31000)),
        (DataType::Int16, vec![0; 64]),
    ];
    assert_same_behavior(&reference, &g, &arrays, &[0]);
}

/// `c[i] = clip(a[i] +/- b[i])` to the range of `ty`, computed in `Int32`.
/// Parameters are `(a, b, c, n)`.
fn saturation_loop(ty: DataType, op: BinOp) -> Graph {
    let mut g = Graph::new();
    let a = g.param(0, DataType::Reference);
    let b = g.param(1, DataType::Reference);
    let c = g.param(2, DataType::Reference);
    let n = g.param(3, DataType::Int32);
    let zero = g.const_int(DataType::Int32, 0);
    let (min, max) = ty.range();
    let lo = g.const_int(DataType::Int32, min);
    let hi = g.const_int(DataType::Int32, max);
    let l = build_loop(&mut g, zero, n, CmpOp::Lt, 1);
    let x = load(&mut g, l.body, ty, a, l.phi);
    let y = load(&mut g, l.body, ty, b, l.phi);
    let r = g.binary(l.body, op, DataType::Int32, x, y);
    let floor = g.binary(l.body, BinOp::Max, DataType::Int32, r, lo);
    let clipped = g.binary(l.body, BinOp::Min, DataType::Int32, floor, hi);
    let narrowed = g.emit(l.body, Op::Convert, ty, &[clipped]);
    store(&mut g, l.body, ty, c, l.phi, narrowed);
    g.ret(l.exit, None);
    g
}

#[test]
fn test_saturation_idioms() {
    for ty in [DataType::Int8, DataType::Uint8] {
        for op in [BinOp::Add, BinOp::Sub] {
            let reference = saturation_loop(ty, op);
            let mut g = saturation_loop(ty, op);
            let mut pass = vectorizer(TargetIsa::Arm64Neon);
            assert!(pass.run(&mut g));
            assert_eq!(pass.stats().idioms_vectorized, 1);
            assert!(g
                .blocks()
                .flat_map(|b| g.block(b).instrs.clone())
                .any(|id| matches!(g.instr(id).op, Op::VecSaturationAdd | Op::VecSaturationSub)));

            let (min, max) = ty.range();
            let a: Vec<i64> = (0..40).map(|i| if i % 3 == 0 { max } else { min + i * 5 }).collect();
            let b: Vec<i64> = (0..40).map(|i| if i % 2 == 0 { max - i } else { min + i }).collect();
            // Zero, two full vectors, and two vectors plus a remainder.
            for n in [0, 32, 37] {
                let arrays = [(ty, a.clone()), (ty, b.clone()), (ty, vec![0; 40])];
                let outcome = assert_same_behavior(&reference, &g, &arrays, &[n]);
                assert_eq!(outcome.vector_ops > 0, n > 0);
            }
        }
    }
}

// =============================================================================
// Alignment
// =============================================================================

#[test]
fn test_static_peeling_aligns_vector_accesses() {
    let (reference, _) = elementwise_loop(DataType::Int32, BinOp::Add);
    let (mut g, _) = elementwise_loop(DataType::Int32, BinOp::Add);
    let mut pass = LoopOptimization::with_config(LoopOptConfig {
        object_alignment: 16,
        ..LoopOptConfig::default()
    });
    assert!(pass.run(&mut g));
    assert_eq!(pass.stats().loops_vectorized, 1);
    // Peeling, vector and cleanup loops.
    assert_eq!(loop_count(&g), 3);

    let alignments: Vec<_> = g
        .blocks()
        .flat_map(|b| g.block(b).instrs.clone())
        .filter_map(|id| match g.instr(id).op {
            Op::VecLoad { alignment, .. } | Op::VecStore { alignment } => Some(alignment),
            _ => None,
        })
        .collect();
    assert_eq!(alignments.len(), 3);
    assert!(alignments.iter().all(|a| a.is_aligned_at(16)));

    for n in [0, 1, 2, 5, 13] {
        let arrays = [
            (DataType::Int32, ramp(16, 11, 2)),
            (DataType::Int32, ramp(16, -9, 40)),
            (DataType::Int32, vec![0; 16]),
        ];
        assert_same_behavior(&reference, &g, &arrays, &[n]);
    }
}

#[test]
fn test_dynamic_peeling_keeps_semantics() {
    // a[i + k] = a[i + k] * 2 over an unknown offset `k`.
    let build = || {
        let mut g = Graph::new();
        let a = g.param(0, DataType::Reference);
        let n = g.param(1, DataType::Int32);
        let k = g.param(2, DataType::Int32);
        let zero = g.const_int(DataType::Int32, 0);
        let l = build_loop(&mut g, zero, n, CmpOp::Lt, 1);
        let index = g.binary(l.body, BinOp::Add, DataType::Int32, l.phi, k);
        let x = load(&mut g, l.body, DataType::Int32, a, index);
        let y = g.binary(l.body, BinOp::Add, DataType::Int32, x, x);
        store(&mut g, l.body, DataType::Int32, a, index, y);
        g.ret(l.exit, None);
        g
    };
    let reference = build();
    let mut g = build();
    let mut pass = LoopOptimization::with_config(LoopOptConfig {
        object_alignment: 16,
        ..LoopOptConfig::default()
    });
    assert!(pass.run(&mut g));
    assert_eq!(pass.stats().loops_vectorized, 1);
    assert_eq!(loop_count(&g), 3);

    for k in [0, 1, 2, 3] {
        for n in [0, 2, 7, 16] {
            assert_same_behavior(&reference, &g, &[(DataType::Int32, ramp(20, 5, -8))], &[n, k]);
        }
    }
}

// =============================================================================
// Analysis
// =============================================================================

/// Analyze the elementwise loop without rewriting it.
fn analyze(isa: TargetIsa, ty: DataType, op: BinOp) -> (LoopOptimization, bool) {
    let (mut g, l) = elementwise_loop(ty, op);
    let mut opt = vectorizer(isa);
    let info = loop_info(&g, l.header);
    let facts = LoopInductions::compute(&g, &info);
    assert!(opt.try_set_simple_loop_header(&g, &info, &facts).is_some());
    let accepted = opt.should_vectorize(&mut g, &info, &facts, l.body, None).unwrap();
    (opt, accepted)
}

#[test]
fn test_restrictions_accumulate_per_type() {
    let (opt, accepted) = analyze(TargetIsa::Arm64Neon, DataType::Int16, BinOp::Mul);
    assert!(accepted);
    assert_eq!(opt.vector.length(), 8);
    let seen = opt.vector.restrictions_seen()[&DataType::Int16];
    assert!(seen.contains(R::NO_DIV | R::NO_HI_BITS));
    assert!(opt.vector.runtime_test().is_none());
}

#[test]
fn test_missing_capability_rejects_loop() {
    let (opt, accepted) = analyze(TargetIsa::X86Sse41, DataType::Int8, BinOp::Mul);
    assert!(!accepted);
    assert!(opt.vector.restrictions_seen()[&DataType::Int8].contains(R::NO_MUL));
}

#[test]
fn test_no_vector_unit_rejects_loop() {
    let (opt, accepted) = analyze(TargetIsa::None, DataType::Int32, BinOp::Add);
    assert!(!accepted);
    assert_eq!(opt.vector.length(), 0);
}

// =============================================================================
// Properties
// =============================================================================

/// Reinterpret a 16-bit sample as a value of `ty`.
fn fit(ty: DataType, v: i16) -> i64 {
    match ty {
        DataType::Int8 => v as i8 as i64,
        DataType::Uint8 => v as u8 as i64,
        DataType::Uint16 => v as u16 as i64,
        _ => v as i64,
    }
}

/// One `c_k[i] = a_k[i] op_k b_k[i]` statement per entry, in order.
/// Parameters are `(a_0, b_0, c_0, a_1, ..., n)`.
fn multi_store_loop(statements: &[(DataType, BinOp)]) -> (Graph, SimpleLoop) {
    let mut g = Graph::new();
    let mut arrays = Vec::new();
    for k in 0..statements.len() as u32 {
        let a = g.param(3 * k, DataType::Reference);
        let b = g.param(3 * k + 1, DataType::Reference);
        let c = g.param(3 * k + 2, DataType::Reference);
        arrays.push((a, b, c));
    }
    let n = g.param(3 * statements.len() as u32, DataType::Int32);
    let zero = g.const_int(DataType::Int32, 0);
    let l = build_loop(&mut g, zero, n, CmpOp::Lt, 1);
    for (&(ty, op), &(a, b, c)) in statements.iter().zip(&arrays) {
        let x = load(&mut g, l.body, ty, a, l.phi);
        let y = load(&mut g, l.body, ty, b, l.phi);
        let wide = if ty.size() < 4 { DataType::Int32 } else { ty };
        let r = g.binary(l.body, op, wide, x, y);
        let narrowed = if wide != ty { g.emit(l.body, Op::Convert, ty, &[r]) } else { r };
        store(&mut g, l.body, ty, c, l.phi, narrowed);
    }
    g.ret(l.exit, None);
    (g, l)
}

fn restrictions_after_analysis(isa: TargetIsa, statements: &[(DataType, BinOp)]) -> Vec<(DataType, R)> {
    let (mut g, l) = multi_store_loop(statements);
    let mut opt = vectorizer(isa);
    let info = loop_info(&g, l.header);
    let facts = LoopInductions::compute(&g, &info);
    assert!(opt.try_set_simple_loop_header(&g, &info, &facts).is_some());
    opt.should_vectorize(&mut g, &info, &facts, l.body, None).unwrap();
    opt.vector.restrictions_seen().iter().map(|(&ty, &r)| (ty, r)).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_vector_loop_matches_scalar_loop(
        ty in prop::sample::select(vec![
            DataType::Int8,
            DataType::Uint8,
            DataType::Int16,
            DataType::Uint16,
            DataType::Int32,
            DataType::Int64,
        ]),
        op in prop::sample::select(vec![
            BinOp::Add,
            BinOp::Sub,
            BinOp::Mul,
            BinOp::And,
            BinOp::Or,
            BinOp::Xor,
            BinOp::Min,
            BinOp::Max,
        ]),
        isa in prop::sample::select(vec![
            TargetIsa::Arm32Neon,
            TargetIsa::Arm64Neon,
            TargetIsa::X86Sse41,
            TargetIsa::X86Avx2,
        ]),
        a in prop::collection::vec(any::<i16>(), 40),
        b in prop::collection::vec(any::<i16>(), 40),
        n in 0i64..40,
    ) {
        let (reference, _) = elementwise_loop(ty, op);
        let (mut g, _) = elementwise_loop(ty, op);
        let mut pass = vectorizer(isa);
        pass.run(&mut g);
        prop_assert!(g.verify().is_ok());

        let arrays = [
            (ty, a.iter().map(|&v| fit(ty, v)).collect()),
            (ty, b.iter().map(|&v| fit(ty, v)).collect()),
            (ty, vec![0; 40]),
        ];
        let (expected, expected_arrays) = execute(&reference, &arrays, &[n]);
        let (actual, actual_arrays) = execute(&g, &arrays, &[n]);
        prop_assert_eq!(actual.result, expected.result);
        prop_assert_eq!(actual_arrays, expected_arrays);
    }

    #[test]
    fn prop_restrictions_grow_with_body(
        statements in prop::collection::vec(
            (
                prop::sample::select(vec![
                    DataType::Int8,
                    DataType::Uint8,
                    DataType::Int16,
                    DataType::Uint16,
                    DataType::Int32,
                    DataType::Int64,
                ]),
                prop::sample::select(vec![
                    BinOp::Add,
                    BinOp::Sub,
                    BinOp::Mul,
                    BinOp::Div,
                    BinOp::And,
                    BinOp::Min,
                    BinOp::Max,
                ]),
            ),
            1..5,
        ),
        keep in 0usize..5,
        isa in prop::sample::select(vec![
            TargetIsa::Arm32Neon,
            TargetIsa::Arm64Neon,
            TargetIsa::X86Sse41,
            TargetIsa::X86Avx2,
        ]),
    ) {
        let prefix = &statements[..keep.min(statements.len())];
        let smaller = restrictions_after_analysis(isa, prefix);
        let larger: FxHashMap<DataType, R> = restrictions_after_analysis(isa, &statements).into_iter().collect();
        for (ty, seen) in smaller {
            let grown = larger.get(&ty).copied();
            prop_assert!(grown.map_or(false, |r| r.contains(seen)), "{:?}: {:?} not within {:?}", ty, seen, grown);
        }
    }

    #[test]
    fn prop_halving_add_matches_scalar(
        ty in prop::sample::select(vec![DataType::Int16, DataType::Uint16]),
        shift in prop::sample::select(vec![BinOp::Shr, BinOp::UShr]),
        rounded in any::<bool>(),
        a in prop::collection::vec(any::<i16>(), 40),
        b in prop::collection::vec(any::<i16>(), 40),
        n in 0i64..40,
    ) {
        let reference = halving_add_loop(ty, shift, rounded, None);
        let mut g = halving_add_loop(ty, shift, rounded, None);
        let mut pass = vectorizer(TargetIsa::Arm64Neon);
        prop_assert!(pass.run(&mut g));
        prop_assert_eq!(pass.stats().idioms_vectorized, 1);

        let arrays = [
            (ty, a.iter().map(|&v| fit(ty, v)).collect()),
            (ty, b.iter().map(|&v| fit(ty, v)).collect()),
            (ty, vec![0; 40]),
        ];
        let (expected, expected_arrays) = execute(&reference, &arrays, &[n]);
        let (actual, actual_arrays) = execute(&g, &arrays, &[n]);
        prop_assert_eq!(actual.result, expected.result);
        prop_assert_eq!(actual_arrays, expected_arrays);
    }
}
