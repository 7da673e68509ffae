//! Reference interpreter for the loop IR.
//!
//! Executes a [`Graph`] block by block against a small [`Heap`] of typed
//! arrays. Every vector operator has an exact lane-level meaning here, which
//! is what lets the test suite compare a loop before and after
//! transformation on concrete inputs.
//!
//! Lane values are always renormalized to the packed type of the operator
//! reading them, so a `VecLoad` of an `Int8` array followed by an unsigned
//! `Min` sees the same bits as unsigned bytes.

use rustc_hash::FxHashMap;
use thiserror::Error;

use super::graph::{BlockId, Graph};
use super::instr::{BinOp, InstrId, Op, ReductionKind, UnOp, VecShape};
use super::types::DataType;

// =============================================================================
// Values
// =============================================================================

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    /// Index into the [`Heap`].
    Ref(usize),
    Vector(Vec<Value>),
    Void,
}

impl Value {
    fn as_int(&self) -> Result<i64, InterpError> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::Ref(r) => Ok(*r as i64),
            other => Err(InterpError::BadOperand(format!("{other:?} is not an integer"))),
        }
    }

    fn as_float(&self) -> Result<f64, InterpError> {
        match self {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            other => Err(InterpError::BadOperand(format!("{other:?} is not a float"))),
        }
    }

    fn as_ref(&self) -> Result<usize, InterpError> {
        match self {
            Value::Ref(r) => Ok(*r),
            other => Err(InterpError::BadOperand(format!("{other:?} is not a reference"))),
        }
    }

    fn lanes(&self) -> Result<&[Value], InterpError> {
        match self {
            Value::Vector(lanes) => Ok(lanes),
            other => Err(InterpError::BadOperand(format!("{other:?} is not a vector"))),
        }
    }
}

static VOID: Value = Value::Void;

/// Errors raised while executing a graph.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InterpError {
    #[error("index {index} out of bounds for array of length {len}")]
    OutOfBounds { index: i64, len: usize },
    #[error("division by zero")]
    DivisionByZero,
    #[error("step budget exhausted")]
    FuelExhausted,
    #[error("missing parameter {0}")]
    MissingParam(u32),
    #[error("bad operand: {0}")]
    BadOperand(String),
    #[error("control fell off block {0}")]
    NoTerminator(BlockId),
}

// =============================================================================
// Heap
// =============================================================================

/// A typed array (strings are `Uint16` arrays).
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayObject {
    pub component: DataType,
    pub data: Vec<Value>,
}

/// All arrays reachable by the interpreted method.
#[derive(Debug, Clone, Default)]
pub struct Heap {
    pub arrays: Vec<ArrayObject>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an integral array; values are normalized to `component`.
    pub fn alloc_ints(&mut self, component: DataType, values: &[i64]) -> Value {
        let data = values
            .iter()
            .map(|&v| Value::Int(component.normalize(v)))
            .collect();
        self.arrays.push(ArrayObject { component, data });
        Value::Ref(self.arrays.len() - 1)
    }

    pub fn alloc_floats(&mut self, component: DataType, values: &[f64]) -> Value {
        let data = values
            .iter()
            .map(|&v| Value::Float(round_float(component, v)))
            .collect();
        self.arrays.push(ArrayObject { component, data });
        Value::Ref(self.arrays.len() - 1)
    }

    /// Allocate a string as an array of UTF-16 code units.
    pub fn alloc_string(&mut self, text: &str) -> Value {
        let units: Vec<i64> = text.encode_utf16().map(i64::from).collect();
        self.alloc_ints(DataType::Uint16, &units)
    }

    /// Integral contents of an array.
    pub fn ints(&self, array: &Value) -> Vec<i64> {
        match array {
            Value::Ref(r) => self.arrays[*r]
                .data
                .iter()
                .map(|v| match v {
                    Value::Int(i) => *i,
                    Value::Float(f) => *f as i64,
                    _ => 0,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn floats(&self, array: &Value) -> Vec<f64> {
        match array {
            Value::Ref(r) => self.arrays[*r]
                .data
                .iter()
                .map(|v| match v {
                    Value::Float(f) => *f,
                    Value::Int(i) => *i as f64,
                    _ => 0.0,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn slot(&self, array: usize, index: i64) -> Result<usize, InterpError> {
        let len = self.arrays[array].data.len();
        if index < 0 || index as usize >= len {
            return Err(InterpError::OutOfBounds { index, len });
        }
        Ok(index as usize)
    }
}

fn round_float(ty: DataType, value: f64) -> f64 {
    if ty == DataType::Float32 {
        value as f32 as f64
    } else {
        value
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Result of a completed execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub result: Option<Value>,
    /// Number of `Call` instructions executed.
    pub calls: usize,
    /// Number of executed vector instructions.
    pub vector_ops: usize,
    /// Number of executed blocks, a rough iteration count.
    pub blocks_executed: usize,
}

// =============================================================================
// Interpreter
// =============================================================================

/// Executes a graph.
pub struct Interpreter<'g> {
    graph: &'g Graph,
    fuel: usize,
}

impl<'g> Interpreter<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Interpreter {
            graph,
            fuel: 1_000_000,
        }
    }

    /// Limit the number of executed instructions.
    pub fn with_fuel(mut self, fuel: usize) -> Self {
        self.fuel = fuel;
        self
    }

    /// Run from the entry block.
    pub fn run(&self, params: &[Value], heap: &mut Heap) -> Result<Outcome, InterpError> {
        let g = self.graph;
        let mut env: FxHashMap<InstrId, Value> = FxHashMap::default();
        let mut outcome = Outcome {
            result: None,
            calls: 0,
            vector_ops: 0,
            blocks_executed: 0,
        };
        let mut fuel = self.fuel;
        let mut pred: Option<BlockId> = None;
        let mut block = g.entry();

        loop {
            outcome.blocks_executed += 1;
            let bb = g.block(block);
            if let Some(from) = pred {
                let index = g
                    .predecessor_index(block, from)
                    .ok_or(InterpError::NoTerminator(from))?;
                // Phis read their inputs in parallel.
                let incoming: Vec<(InstrId, Value)> = bb
                    .phis
                    .iter()
                    .map(|&phi| {
                        let input = g.instr(phi).input(index);
                        (phi, env.get(&input).cloned().unwrap_or(Value::Void))
                    })
                    .collect();
                env.extend(incoming);
            }

            let mut next: Option<BlockId> = None;
            for &id in &bb.instrs {
                fuel = fuel.checked_sub(1).ok_or(InterpError::FuelExhausted)?;
                let instr = g.instr(id);
                match instr.op {
                    Op::If => {
                        let cond = env[&instr.input(0)].as_int()?;
                        next = Some(if cond != 0 { bb.succs[0] } else { bb.succs[1] });
                    }
                    Op::Goto => next = Some(bb.succs[0]),
                    Op::Return => {
                        outcome.result = instr.inputs.first().map(|v| env[v].clone());
                        return Ok(outcome);
                    }
                    Op::Call => {
                        outcome.calls += 1;
                        env.insert(id, Value::Int(0));
                    }
                    _ => {
                        if instr.vec.is_some() || instr.op.is_vector_only() {
                            outcome.vector_ops += 1;
                        }
                        let value = self.eval(id, params, &env, heap)?;
                        env.insert(id, value);
                    }
                }
            }
            match next {
                Some(target) => {
                    pred = Some(block);
                    block = target;
                }
                None => return Err(InterpError::NoTerminator(block)),
            }
        }
    }

    fn eval(
        &self,
        id: InstrId,
        params: &[Value],
        env: &FxHashMap<InstrId, Value>,
        heap: &mut Heap,
    ) -> Result<Value, InterpError> {
        let g = self.graph;
        let instr = g.instr(id);
        let arg = |i: usize| env.get(&instr.input(i)).unwrap_or(&VOID);
        let ty = instr.ty;

        if let Some(shape) = instr.vec {
            return self.eval_vector(id, shape, env, heap);
        }

        Ok(match instr.op {
            Op::Param(index) => params
                .get(index as usize)
                .cloned()
                .ok_or(InterpError::MissingParam(index))?,
            Op::Const(v) => Value::Int(v),
            Op::FloatConst(bits) => Value::Float(f64::from_bits(bits)),
            Op::Phi => Value::Void,
            Op::Binary(op) => scalar_binary(op, ty, arg(0), arg(1))?,
            Op::Unary(op) => scalar_unary(op, ty, arg(0))?,
            Op::Convert => convert(g.ty(instr.input(0)), ty, arg(0))?,
            Op::Compare(op) => {
                let lhs_ty = g.ty(instr.input(0));
                let result = if lhs_ty.is_floating_point() {
                    op.eval(arg(0).as_float()?, arg(1).as_float()?)
                } else {
                    op.eval(arg(0).as_int()?, arg(1).as_int()?)
                };
                Value::Int(result as i64)
            }
            Op::Select => {
                if arg(0).as_int()? != 0 {
                    arg(1).clone()
                } else {
                    arg(2).clone()
                }
            }
            Op::ArrayGet { .. } => {
                let array = arg(0).as_ref()?;
                let slot = heap.slot(array, arg(1).as_int()?)?;
                normalize_value(ty, &heap.arrays[array].data[slot])
            }
            Op::ArraySet { component } => {
                let array = arg(0).as_ref()?;
                let slot = heap.slot(array, arg(1).as_int()?)?;
                heap.arrays[array].data[slot] = normalize_value(component, arg(2));
                Value::Void
            }
            Op::ArrayLength => Value::Int(heap.arrays[arg(0).as_ref()?].data.len() as i64),
            Op::Monitor => Value::Void,
            _ => {
                return Err(InterpError::BadOperand(format!(
                    "{:?} needs a vector shape",
                    instr.op
                )))
            }
        })
    }

    fn eval_vector(
        &self,
        id: InstrId,
        shape: VecShape,
        env: &FxHashMap<InstrId, Value>,
        heap: &mut Heap,
    ) -> Result<Value, InterpError> {
        let g = self.graph;
        let instr = g.instr(id);
        let arg = |i: usize| env.get(&instr.input(i)).unwrap_or(&VOID);
        let packed = shape.packed;
        let lanes = shape.lanes as usize;
        let input_packed = |i: usize| g.instr(instr.input(i)).vec.map(|s| s.packed);

        Ok(match instr.op {
            Op::Phi => Value::Void,
            Op::Binary(op) => {
                let a = arg(0).lanes()?;
                let out = if op.is_shift() {
                    let distance = arg(1).as_int()?;
                    a.iter()
                        .map(|x| vector_shift(op, packed, x, distance))
                        .collect::<Result<Vec<_>, _>>()?
                } else {
                    let b = arg(1).lanes()?;
                    a.iter()
                        .zip(b)
                        .map(|(x, y)| {
                            scalar_binary(
                                op,
                                packed,
                                &normalize_value(packed, x),
                                &normalize_value(packed, y),
                            )
                        })
                        .collect::<Result<Vec<_>, _>>()?
                };
                Value::Vector(out)
            }
            Op::Unary(op) => Value::Vector(
                arg(0)
                    .lanes()?
                    .iter()
                    .map(|x| scalar_unary(op, packed, &normalize_value(packed, x)))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Op::Convert => {
                let from = input_packed(0).unwrap_or(DataType::Int32);
                Value::Vector(
                    arg(0)
                        .lanes()?
                        .iter()
                        .map(|x| convert(from, packed, x))
                        .collect::<Result<Vec<_>, _>>()?,
                )
            }
            Op::VecReplicateScalar => Value::Vector(vec![normalize_value(packed, arg(0)); lanes]),
            Op::VecSetScalars => {
                let mut out = vec![zero_of(packed); lanes];
                out[0] = normalize_value(packed, arg(0));
                Value::Vector(out)
            }
            Op::VecExtractScalar => arg(0).lanes()?[0].clone(),
            Op::VecReduce(kind) => {
                let values: Vec<Value> = arg(0)
                    .lanes()?
                    .iter()
                    .map(|x| normalize_value(packed, x))
                    .collect();
                let mut acc = values[0].clone();
                for v in &values[1..] {
                    let op = match kind {
                        ReductionKind::Sum => BinOp::Add,
                        ReductionKind::Min => BinOp::Min,
                        ReductionKind::Max => BinOp::Max,
                    };
                    acc = scalar_binary(op, packed, &acc, v)?;
                }
                let mut out = vec![zero_of(packed); lanes];
                out[0] = acc;
                Value::Vector(out)
            }
            Op::VecLoad { .. } => {
                let array = arg(0).as_ref()?;
                let start = arg(1).as_int()?;
                let mut out = Vec::with_capacity(lanes);
                for lane in 0..lanes as i64 {
                    let slot = heap.slot(array, start + lane)?;
                    out.push(normalize_value(packed, &heap.arrays[array].data[slot]));
                }
                Value::Vector(out)
            }
            Op::VecStore { .. } => {
                let array = arg(0).as_ref()?;
                let start = arg(1).as_int()?;
                let values = arg(2).lanes()?.to_vec();
                let component = heap.arrays[array].component;
                for (lane, v) in values.iter().enumerate() {
                    let slot = heap.slot(array, start + lane as i64)?;
                    heap.arrays[array].data[slot] = normalize_value(component, v);
                }
                Value::Void
            }
            Op::VecHalvingAdd { rounded } => {
                let (a, b) = (arg(0).lanes()?, arg(1).lanes()?);
                let mut out = Vec::with_capacity(lanes);
                for (x, y) in a.iter().zip(b) {
                    let x = packed.normalize(x.as_int()?);
                    let y = packed.normalize(y.as_int()?);
                    let sum = x + y + rounded as i64;
                    out.push(Value::Int(packed.normalize(sum >> 1)));
                }
                Value::Vector(out)
            }
            Op::VecSaturationAdd | Op::VecSaturationSub => {
                let (a, b) = (arg(0).lanes()?, arg(1).lanes()?);
                let (lo, hi) = packed.range();
                let mut out = Vec::with_capacity(lanes);
                for (x, y) in a.iter().zip(b) {
                    let x = packed.normalize(x.as_int()?);
                    let y = packed.normalize(y.as_int()?);
                    let raw = if matches!(instr.op, Op::VecSaturationAdd) {
                        x + y
                    } else {
                        x - y
                    };
                    out.push(Value::Int(raw.clamp(lo, hi)));
                }
                Value::Vector(out)
            }
            Op::VecSadAccumulate | Op::VecDotProd { .. } => {
                let mut acc: Vec<i64> = arg(0)
                    .lanes()?
                    .iter()
                    .map(Value::as_int)
                    .collect::<Result<_, _>>()?;
                let mut operand_ty = input_packed(1).unwrap_or(packed);
                if let Op::VecDotProd { unsigned } = instr.op {
                    operand_ty = operand_ty.to_proper(unsigned);
                }
                let (a, b) = (arg(1).lanes()?, arg(2).lanes()?);
                for (j, (x, y)) in a.iter().zip(b).enumerate() {
                    let x = operand_ty.normalize(x.as_int()?);
                    let y = operand_ty.normalize(y.as_int()?);
                    let term = if matches!(instr.op, Op::VecSadAccumulate) {
                        (x - y).abs()
                    } else {
                        x * y
                    };
                    let slot = j % acc.len();
                    acc[slot] = packed.normalize(acc[slot].wrapping_add(term));
                }
                Value::Vector(acc.into_iter().map(Value::Int).collect())
            }
            _ => {
                return Err(InterpError::BadOperand(format!(
                    "{:?} has no vector form",
                    instr.op
                )))
            }
        })
    }
}

// =============================================================================
// Scalar Semantics
// =============================================================================

fn zero_of(ty: DataType) -> Value {
    if ty.is_floating_point() {
        Value::Float(0.0)
    } else {
        Value::Int(0)
    }
}

fn normalize_value(ty: DataType, value: &Value) -> Value {
    match value {
        Value::Int(v) if ty.is_integral() => Value::Int(ty.normalize(*v)),
        Value::Float(f) if ty.is_floating_point() => Value::Float(round_float(ty, *f)),
        other => other.clone(),
    }
}

/// Mask of the low `ty` bits.
fn width_mask(ty: DataType) -> u64 {
    match ty.bit_width() {
        64 => u64::MAX,
        bits => (1u64 << bits) - 1,
    }
}

fn scalar_binary(op: BinOp, ty: DataType, a: &Value, b: &Value) -> Result<Value, InterpError> {
    if ty.is_floating_point() {
        let (x, y) = (a.as_float()?, b.as_float()?);
        let r = match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => x / y,
            BinOp::Rem => x % y,
            BinOp::Min => x.min(y),
            BinOp::Max => x.max(y),
            _ => return Err(InterpError::BadOperand(format!("{op:?} on {ty}"))),
        };
        return Ok(Value::Float(round_float(ty, r)));
    }
    let (x, y) = (a.as_int()?, b.as_int()?);
    let bits = ty.bit_width().max(32) as i64;
    let r = match op {
        BinOp::Add => x.wrapping_add(y),
        BinOp::Sub => x.wrapping_sub(y),
        BinOp::Mul => x.wrapping_mul(y),
        BinOp::Div | BinOp::Rem if y == 0 => return Err(InterpError::DivisionByZero),
        BinOp::Div => ty.normalize(x).wrapping_div(ty.normalize(y)),
        BinOp::Rem => ty.normalize(x).wrapping_rem(ty.normalize(y)),
        BinOp::And => x & y,
        BinOp::Or => x | y,
        BinOp::Xor => x ^ y,
        BinOp::Shl => x.wrapping_shl((y & (bits - 1)) as u32),
        BinOp::Shr => ty.normalize(x) >> (y & (bits - 1)),
        BinOp::UShr => ((x as u64 & width_mask(ty)) >> (y & (bits - 1))) as i64,
        BinOp::Min => ty.normalize(x).min(ty.normalize(y)),
        BinOp::Max => ty.normalize(x).max(ty.normalize(y)),
    };
    Ok(Value::Int(ty.normalize(r)))
}

/// Lane shift by a scalar distance below the packed width.
fn vector_shift(op: BinOp, packed: DataType, x: &Value, distance: i64) -> Result<Value, InterpError> {
    let x = x.as_int()?;
    let d = distance as u32;
    let r = match op {
        BinOp::Shl => x.wrapping_shl(d),
        BinOp::Shr => packed.to_signed().normalize(x) >> d,
        _ => ((x as u64 & width_mask(packed)) >> d) as i64,
    };
    Ok(Value::Int(packed.normalize(r)))
}

fn scalar_unary(op: UnOp, ty: DataType, a: &Value) -> Result<Value, InterpError> {
    if ty.is_floating_point() {
        let x = a.as_float()?;
        let r = match op {
            UnOp::Neg => -x,
            UnOp::Abs => x.abs(),
            _ => return Err(InterpError::BadOperand(format!("{op:?} on {ty}"))),
        };
        return Ok(Value::Float(round_float(ty, r)));
    }
    let x = ty.normalize(a.as_int()?);
    let r = match op {
        UnOp::Neg => x.wrapping_neg(),
        UnOp::Not => !x,
        UnOp::BoolNot => (x == 0) as i64,
        UnOp::Abs => x.wrapping_abs(),
    };
    Ok(Value::Int(ty.normalize(r)))
}

fn convert(from: DataType, to: DataType, value: &Value) -> Result<Value, InterpError> {
    Ok(match (from.is_floating_point(), to.is_floating_point()) {
        (false, false) => Value::Int(to.normalize(value.as_int()?)),
        (false, true) => Value::Float(round_float(to, value.as_int()? as f64)),
        (true, true) => Value::Float(round_float(to, value.as_float()?)),
        (true, false) => {
            let f = value.as_float()?;
            let v = match to {
                DataType::Int64 => f as i64,
                _ => f as i32 as i64,
            };
            Value::Int(to.normalize(v))
        }
    })
}

// =============================================================================
// Tests
// =============================================================================
