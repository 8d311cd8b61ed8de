//! Reference evaluator.
//!
//! A straightforward value-semantics interpreter for the kernel IR. Kernels
//! are evaluated one logical thread at a time, except explicit `Kernel`s,
//! which run statement by statement across all threads so that a
//! `GroupReduce` sees every thread of its group. Memory annotations are
//! ignored and `Alloc` yields an opaque token.
//!
//! The evaluator is the semantic yardstick for the simplifier and for
//! allocation expansion: both must leave the results of `eval_fun`
//! unchanged.

use std::collections::HashMap;

use crate::error::Result;
use crate::ir::{
    BinOp, Body, CmpOp, Exp, FunDef, KernelBody, KernelOp, KernelResult, KernelStm, Lambda, MapKernel, Pattern,
    PrimType, PrimValue, Prog, Space, StreamOrd, SubExp, Type, VName, WhichThreads,
};
use crate::{bail_eval, err_eval};

// =============================================================================
// Values
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Prim(PrimValue),
    Array(ArrayValue),
    /// Token for an allocated block.
    Mem { size: i64, space: Space },
}

/// A regular array in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    pub elem: PrimType,
    pub shape: Vec<usize>,
    pub data: Vec<PrimValue>,
}

impl Value {
    pub fn i64(n: i64) -> Self {
        Value::Prim(PrimValue::I64(n))
    }

    pub fn bool(b: bool) -> Self {
        Value::Prim(PrimValue::Bool(b))
    }

    pub fn i64_array(xs: &[i64]) -> Self {
        Value::Array(ArrayValue {
            elem: PrimType::I64,
            shape: vec![xs.len()],
            data: xs.iter().map(|&x| PrimValue::I64(x)).collect(),
        })
    }

    pub fn f32_array(xs: &[f32]) -> Self {
        Value::Array(ArrayValue {
            elem: PrimType::F32,
            shape: vec![xs.len()],
            data: xs.iter().map(|&x| PrimValue::F32(x)).collect(),
        })
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            Value::Array(a) => a.shape.clone(),
            _ => Vec::new(),
        }
    }

    pub fn as_prim(&self) -> Option<PrimValue> {
        match self {
            Value::Prim(p) => Some(*p),
            _ => None,
        }
    }

    /// Elements of a one-dimensional integral array.
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        match self {
            Value::Array(a) if a.shape.len() == 1 => a.data.iter().map(|p| p.as_i64()).collect(),
            _ => None,
        }
    }
}

impl ArrayValue {
    fn row_len(&self) -> usize {
        self.shape[1..].iter().product()
    }

    fn num_rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    fn row(&self, i: usize) -> Value {
        let len = self.row_len();
        let data = &self.data[i * len..(i + 1) * len];
        if self.shape.len() == 1 {
            Value::Prim(data[0])
        } else {
            Value::Array(ArrayValue {
                elem: self.elem,
                shape: self.shape[1..].to_vec(),
                data: data.to_vec(),
            })
        }
    }

    /// Stack `rows` of shape `row_shape` into one array.
    fn from_rows(elem: PrimType, row_shape: &[usize], rows: Vec<Value>) -> Result<ArrayValue> {
        let mut shape = vec![rows.len()];
        shape.extend_from_slice(row_shape);
        let mut data = Vec::with_capacity(rows.len() * row_shape.iter().product::<usize>());
        for row in rows {
            match row {
                Value::Prim(p) if row_shape.is_empty() => data.push(p),
                Value::Array(a) if a.shape == row_shape => data.extend(a.data),
                other => bail_eval!("irregular array: expected rows of shape {:?}, got {:?}", row_shape, other.shape()),
            }
        }
        Ok(ArrayValue { elem, shape, data })
    }

    /// The rows at `positions`, in that order.
    fn select_rows(&self, positions: &[usize]) -> ArrayValue {
        let len = self.row_len();
        let mut data = Vec::with_capacity(positions.len() * len);
        for &i in positions {
            data.extend_from_slice(&self.data[i * len..(i + 1) * len]);
        }
        let mut shape = self.shape.clone();
        shape[0] = positions.len();
        ArrayValue {
            elem: self.elem,
            shape,
            data,
        }
    }

    /// Flat offset and length of the element or sub-array at `indices`.
    fn locate(&self, indices: &[i64]) -> Result<(usize, usize)> {
        if indices.len() > self.shape.len() {
            bail_eval!("too many indices ({}) for array of rank {}", indices.len(), self.shape.len());
        }
        let mut offset = 0usize;
        for (&i, &d) in indices.iter().zip(&self.shape) {
            if i < 0 || i as usize >= d {
                bail_eval!("index {} out of bounds for dimension of size {}", i, d);
            }
            offset = offset * d + i as usize;
        }
        let len: usize = self.shape[indices.len()..].iter().product();
        Ok((offset * len, len))
    }

    fn index(&self, indices: &[i64]) -> Result<Value> {
        let (start, len) = self.locate(indices)?;
        let data = &self.data[start..start + len];
        if indices.len() == self.shape.len() {
            Ok(Value::Prim(data[0]))
        } else {
            Ok(Value::Array(ArrayValue {
                elem: self.elem,
                shape: self.shape[indices.len()..].to_vec(),
                data: data.to_vec(),
            }))
        }
    }

    fn rearrange(&self, perm: &[usize]) -> Result<ArrayValue> {
        let rank = self.shape.len();
        let mut sorted = perm.to_vec();
        sorted.sort_unstable();
        if sorted != (0..rank).collect::<Vec<_>>() {
            bail_eval!("{:?} is not a permutation of rank {}", perm, rank);
        }
        let shape: Vec<usize> = perm.iter().map(|&p| self.shape[p]).collect();
        let mut strides = vec![1usize; rank];
        for i in (0..rank.saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.shape[i + 1];
        }
        let total: usize = shape.iter().product();
        let mut data = Vec::with_capacity(total);
        let mut idx = vec![0usize; rank];
        for _ in 0..total {
            let src: usize = idx.iter().enumerate().map(|(i, &x)| x * strides[perm[i]]).sum();
            data.push(self.data[src]);
            for d in (0..rank).rev() {
                idx[d] += 1;
                if idx[d] < shape[d] {
                    break;
                }
                idx[d] = 0;
            }
        }
        Ok(ArrayValue {
            elem: self.elem,
            shape,
            data,
        })
    }
}

// =============================================================================
// Environments
// =============================================================================

/// Variable bindings; a child environment sees every binding of its
/// parents.
#[derive(Debug, Default)]
pub struct Env<'a> {
    vars: HashMap<VName, Value>,
    parent: Option<&'a Env<'a>>,
}

impl<'a> Env<'a> {
    pub fn new() -> Self {
        Env {
            vars: HashMap::new(),
            parent: None,
        }
    }

    pub fn child(&self) -> Env<'_> {
        Env {
            vars: HashMap::new(),
            parent: Some(self),
        }
    }

    pub fn bind(&mut self, name: VName, value: Value) {
        self.vars.insert(name, value);
    }

    pub fn lookup(&self, name: &VName) -> Result<&Value> {
        let mut env = Some(self);
        while let Some(e) = env {
            if let Some(v) = e.vars.get(name) {
                return Ok(v);
            }
            env = e.parent;
        }
        Err(err_eval!("unbound variable {}", name))
    }
}

// =============================================================================
// Entry points
// =============================================================================

/// Evaluate function `name` of `prog` on `args`.
pub fn eval_fun(prog: &Prog, name: &str, args: Vec<Value>) -> Result<Vec<Value>> {
    let fun: &FunDef = prog
        .funs
        .iter()
        .find(|f| f.name == name)
        .ok_or_else(|| err_eval!("no function named {}", name))?;
    if fun.params.len() != args.len() {
        bail_eval!("{} expects {} arguments, got {}", name, fun.params.len(), args.len());
    }
    let mut env = Env::new();
    for (p, v) in fun.params.iter().zip(args) {
        env.bind(p.name.clone(), v);
    }
    eval_body(&fun.body, &env)
}

/// Evaluate `body` in a child of `env`.
pub fn eval_body(body: &Body, env: &Env<'_>) -> Result<Vec<Value>> {
    let mut local = env.child();
    for stm in &body.stms {
        let values = eval_exp(&stm.exp, &local)?;
        bind_pattern(&mut local, &stm.pat, values)?;
    }
    body.result.iter().map(|se| eval_subexp(se, &local)).collect()
}

fn eval_lambda(lambda: &Lambda, args: Vec<Value>, env: &Env<'_>) -> Result<Vec<Value>> {
    if lambda.params.len() != args.len() {
        bail_eval!("lambda expects {} arguments, got {}", lambda.params.len(), args.len());
    }
    let mut local = env.child();
    for (p, v) in lambda.params.iter().zip(args) {
        local.bind(p.name.clone(), v);
    }
    eval_body(&lambda.body, &local)
}

/// Bind `values` to all elements of `pat`, or to its value elements only
/// when the context is not supplied.
fn bind_pattern(env: &mut Env<'_>, pat: &Pattern, values: Vec<Value>) -> Result<()> {
    let n_all = pat.context.len() + pat.values.len();
    if values.len() == n_all {
        for (pe, v) in pat.elems().zip(values) {
            env.bind(pe.name.clone(), v);
        }
    } else if values.len() == pat.values.len() {
        for (pe, v) in pat.values.iter().zip(values) {
            env.bind(pe.name.clone(), v);
        }
    } else {
        bail_eval!("pattern of {} elements bound to {} values", n_all, values.len());
    }
    Ok(())
}

fn eval_subexp(se: &SubExp, env: &Env<'_>) -> Result<Value> {
    match se {
        SubExp::Const(c) => Ok(Value::Prim(*c)),
        SubExp::Var(v) => env.lookup(v).cloned(),
    }
}

fn eval_i64(se: &SubExp, env: &Env<'_>) -> Result<i64> {
    match eval_subexp(se, env)? {
        Value::Prim(p) => p.as_i64().ok_or_else(|| err_eval!("{} is not an integer", se)),
        _ => Err(err_eval!("{} is not a scalar", se)),
    }
}

fn eval_size(se: &SubExp, env: &Env<'_>) -> Result<usize> {
    let n = eval_i64(se, env)?;
    usize::try_from(n).map_err(|_| err_eval!("negative size {} for {}", n, se))
}

fn eval_array(v: &VName, env: &Env<'_>) -> Result<ArrayValue> {
    match env.lookup(v)? {
        Value::Array(a) => Ok(a.clone()),
        _ => Err(err_eval!("{} is not an array", v)),
    }
}

fn shape_of(ty: &Type, env: &Env<'_>) -> Result<Vec<usize>> {
    ty.shape().iter().map(|d| eval_size(d, env)).collect()
}

/// Zero value of `ty`, for threads that do not compute a result.
fn blank(ty: &Type, env: &Env<'_>) -> Result<Value> {
    match ty {
        Type::Prim(p) => Ok(Value::Prim(PrimValue::blank(*p))),
        Type::Array { elem, shape, .. } => {
            let shape: Vec<usize> = shape.iter().map(|d| eval_size(d, env)).collect::<Result<_>>()?;
            let len = shape.iter().product();
            Ok(Value::Array(ArrayValue {
                elem: *elem,
                shape,
                data: vec![PrimValue::blank(*elem); len],
            }))
        }
        Type::Mem { size, space } => Ok(Value::Mem {
            size: eval_i64(size, env)?,
            space: *space,
        }),
    }
}

// =============================================================================
// Expressions
// =============================================================================

fn eval_exp(exp: &Exp, env: &Env<'_>) -> Result<Vec<Value>> {
    let value = match exp {
        Exp::SubExp(se) => eval_subexp(se, env)?,
        Exp::BinOp { op, x, y } => {
            let (x, y) = (prim(x, env)?, prim(y, env)?);
            Value::Prim(eval_binop(*op, x, y)?)
        }
        Exp::CmpOp { op, x, y } => {
            let (x, y) = (prim(x, env)?, prim(y, env)?);
            Value::bool(eval_cmpop(*op, x, y)?)
        }
        Exp::Index { arr, indices } => {
            let a = eval_array(arr, env)?;
            let indices = indices.iter().map(|i| eval_i64(i, env)).collect::<Result<Vec<_>>>()?;
            a.index(&indices)?
        }
        Exp::Update { arr, indices, value } => {
            let mut a = eval_array(arr, env)?;
            let indices = indices.iter().map(|i| eval_i64(i, env)).collect::<Result<Vec<_>>>()?;
            let (start, len) = a.locate(&indices)?;
            match eval_subexp(value, env)? {
                Value::Prim(p) if len == 1 && indices.len() == a.shape.len() => a.data[start] = p,
                Value::Array(v) if v.data.len() == len && v.shape == a.shape[indices.len()..] => {
                    a.data[start..start + len].copy_from_slice(&v.data)
                }
                _ => bail_eval!("update of {} with a value of the wrong shape", arr),
            }
            Value::Array(a)
        }
        Exp::Iota { n, start, stride } => {
            let n = eval_size(n, env)?;
            let (start, stride) = (eval_i64(start, env)?, eval_i64(stride, env)?);
            let xs: Vec<i64> = (0..n as i64).map(|i| start.wrapping_add(i.wrapping_mul(stride))).collect();
            Value::i64_array(&xs)
        }
        Exp::Replicate { shape, value } => {
            let outer: Vec<usize> = shape.iter().map(|d| eval_size(d, env)).collect::<Result<_>>()?;
            let v = eval_subexp(value, env)?;
            let count: usize = outer.iter().product();
            let (elem, inner_shape, inner) = match v {
                Value::Prim(p) => (p.prim_type(), Vec::new(), vec![p]),
                Value::Array(a) => (a.elem, a.shape, a.data),
                Value::Mem { .. } => bail_eval!("cannot replicate a memory block"),
            };
            let mut full_shape = outer;
            full_shape.extend(inner_shape);
            let mut data = Vec::with_capacity(count * inner.len());
            for _ in 0..count {
                data.extend_from_slice(&inner);
            }
            Value::Array(ArrayValue {
                elem,
                shape: full_shape,
                data,
            })
        }
        Exp::Reshape { shape, arr } => {
            let a = eval_array(arr, env)?;
            let shape: Vec<usize> = shape.iter().map(|d| eval_size(d, env)).collect::<Result<_>>()?;
            if shape.iter().product::<usize>() != a.data.len() || shape.is_empty() {
                bail_eval!("cannot reshape {} of shape {:?} to {:?}", arr, a.shape, shape);
            }
            Value::Array(ArrayValue { shape, ..a })
        }
        Exp::Rearrange { perm, arr } => Value::Array(eval_array(arr, env)?.rearrange(perm)?),
        Exp::Copy(arr) => env.lookup(arr)?.clone(),
        Exp::Alloc { size, space } => Value::Mem {
            size: eval_i64(size, env)?,
            space: *space,
        },
        Exp::If {
            cond,
            then_body,
            else_body,
            ..
        } => {
            return match prim(cond, env)? {
                PrimValue::Bool(true) => eval_body(then_body, env),
                PrimValue::Bool(false) => eval_body(else_body, env),
                other => Err(err_eval!("branch condition {} is not a boolean", other)),
            };
        }
        Exp::DoLoop {
            ctx_merge,
            val_merge,
            index,
            bound,
            body,
        } => {
            let merge: Vec<_> = ctx_merge.iter().chain(val_merge.iter()).collect();
            let mut values = merge
                .iter()
                .map(|(_, init)| eval_subexp(init, env))
                .collect::<Result<Vec<_>>>()?;
            let bound = eval_i64(bound, env)?;
            for i in 0..bound {
                let mut local = env.child();
                local.bind(index.clone(), Value::i64(i));
                for ((p, _), v) in merge.iter().zip(values) {
                    local.bind(p.name.clone(), v);
                }
                values = eval_body(body, &local)?;
                if values.len() != merge.len() {
                    bail_eval!("loop body returned {} values for {} merge parameters", values.len(), merge.len());
                }
            }
            return Ok(values);
        }
        Exp::Op(op) => return eval_kernel_op(op, env),
    };
    Ok(vec![value])
}

fn prim(se: &SubExp, env: &Env<'_>) -> Result<PrimValue> {
    eval_subexp(se, env)?
        .as_prim()
        .ok_or_else(|| err_eval!("{} is not a scalar", se))
}

fn int_binop(op: BinOp, x: i64, y: i64) -> Result<i64> {
    Ok(match op {
        BinOp::Add => x.wrapping_add(y),
        BinOp::Sub => x.wrapping_sub(y),
        BinOp::Mul => x.wrapping_mul(y),
        BinOp::Div => x.checked_div_euclid(y).ok_or_else(|| err_eval!("division by zero"))?,
        BinOp::Mod => x.checked_rem_euclid(y).ok_or_else(|| err_eval!("division by zero"))?,
        BinOp::Min => x.min(y),
        BinOp::Max => x.max(y),
        BinOp::And => x & y,
        BinOp::Or => x | y,
    })
}

fn float_binop(op: BinOp, x: f64, y: f64) -> Result<f64> {
    Ok(match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => x / y,
        BinOp::Mod => x % y,
        BinOp::Min => x.min(y),
        BinOp::Max => x.max(y),
        BinOp::And | BinOp::Or => bail_eval!("{:?} is not defined on floats", op),
    })
}

fn eval_binop(op: BinOp, x: PrimValue, y: PrimValue) -> Result<PrimValue> {
    Ok(match (x, y) {
        (PrimValue::I64(a), PrimValue::I64(b)) => PrimValue::I64(int_binop(op, a, b)?),
        (PrimValue::I32(a), PrimValue::I32(b)) => PrimValue::I32(int_binop(op, a as i64, b as i64)? as i32),
        (PrimValue::F64(a), PrimValue::F64(b)) => PrimValue::F64(float_binop(op, a, b)?),
        (PrimValue::F32(a), PrimValue::F32(b)) => PrimValue::F32(float_binop(op, a as f64, b as f64)? as f32),
        (PrimValue::Bool(a), PrimValue::Bool(b)) => match op {
            BinOp::And => PrimValue::Bool(a && b),
            BinOp::Or => PrimValue::Bool(a || b),
            _ => bail_eval!("{:?} is not defined on booleans", op),
        },
        (x, y) => bail_eval!("operands {} and {} of {:?} have different types", x, y, op),
    })
}

fn eval_cmpop(op: CmpOp, x: PrimValue, y: PrimValue) -> Result<bool> {
    let ord = match (x, y) {
        (PrimValue::I64(a), PrimValue::I64(b)) => a.partial_cmp(&b),
        (PrimValue::I32(a), PrimValue::I32(b)) => a.partial_cmp(&b),
        (PrimValue::F64(a), PrimValue::F64(b)) => a.partial_cmp(&b),
        (PrimValue::F32(a), PrimValue::F32(b)) => a.partial_cmp(&b),
        (PrimValue::Bool(a), PrimValue::Bool(b)) => a.partial_cmp(&b),
        (x, y) => bail_eval!("operands {} and {} of {:?} have different types", x, y, op),
    };
    Ok(match (op, ord) {
        (_, None) => false,
        (CmpOp::Eq, Some(o)) => o.is_eq(),
        (CmpOp::Lt, Some(o)) => o.is_lt(),
        (CmpOp::Le, Some(o)) => o.is_le(),
    })
}

// =============================================================================
// Kernels
// =============================================================================

/// Rows of a `width`-row array handed to thread `t`.
fn thread_rows(ordering: StreamOrd, t: usize, num_threads: usize, per_thread: usize, width: usize) -> Vec<usize> {
    match ordering {
        StreamOrd::InOrder => {
            let start = t.saturating_mul(per_thread).min(width);
            let end = start.saturating_add(per_thread).min(width);
            (start..end).collect()
        }
        StreamOrd::Disorder => (t..width).step_by(num_threads.max(1)).collect(),
    }
}

/// Scatter per-thread chunks into one array of `width` rows.
fn concat_chunks(
    elem: PrimType,
    row_shape: &[usize],
    width: usize,
    chunks: Vec<(Vec<usize>, Value)>,
) -> Result<Value> {
    let mut rows: Vec<Option<Value>> = vec![None; width];
    for (positions, chunk) in chunks {
        let chunk = match chunk {
            Value::Array(a) => a,
            _ => bail_eval!("per-thread chunk is not an array"),
        };
        if chunk.num_rows() != positions.len() {
            bail_eval!("chunk of {} rows for {} positions", chunk.num_rows(), positions.len());
        }
        for (j, &pos) in positions.iter().enumerate() {
            rows[pos] = Some(chunk.row(j));
        }
    }
    let rows = rows
        .into_iter()
        .enumerate()
        .map(|(i, r)| r.ok_or_else(|| err_eval!("row {} of concatenated result not produced", i)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Value::Array(ArrayValue::from_rows(elem, row_shape, rows)?))
}

fn elem_of(ty: &Type) -> Result<PrimType> {
    ty.elem_type().ok_or_else(|| err_eval!("kernel returns a memory block"))
}

fn eval_kernel_op(op: &KernelOp, env: &Env<'_>) -> Result<Vec<Value>> {
    match op {
        KernelOp::MapKernel(k) => eval_map_kernel(k, env),
        KernelOp::ScanKernel(k) => {
            let width = eval_size(&k.width, env)?;
            let arrays = k.arrays.iter().map(|a| eval_array(a, env)).collect::<Result<Vec<_>>>()?;
            let mut accs = k.nes.iter().map(|ne| eval_subexp(ne, env)).collect::<Result<Vec<_>>>()?;
            let mut outs: Vec<Vec<Value>> = vec![Vec::with_capacity(width); accs.len()];
            for i in 0..width {
                let mut args = vec![Value::i64(i as i64)];
                args.extend(accs);
                args.extend(arrays.iter().map(|a| a.row(i)));
                accs = eval_lambda(&k.fold_lambda, args, env)?;
                if accs.len() != outs.len() {
                    bail_eval!("scan operator returned {} values for {} accumulators", accs.len(), outs.len());
                }
                for (out, acc) in outs.iter_mut().zip(&accs) {
                    out.push(acc.clone());
                }
            }
            outs.into_iter()
                .zip(&k.nes)
                .map(|(rows, ne)| {
                    let ne = eval_subexp(ne, env)?;
                    let elem = match &ne {
                        Value::Prim(p) => p.prim_type(),
                        Value::Array(a) => a.elem,
                        Value::Mem { .. } => bail_eval!("scan over memory blocks"),
                    };
                    Ok(Value::Array(ArrayValue::from_rows(elem, &ne.shape(), rows)?))
                })
                .collect()
        }
        KernelOp::ChunkedMapKernel(k) => {
            let width = eval_size(&k.width, env)?;
            let num_threads = eval_size(&k.size.num_threads, env)?;
            let thread_chunk = eval_size(&k.size.thread_chunk, env)?;
            let arrays = k.arrays.iter().map(|a| eval_array(a, env)).collect::<Result<Vec<_>>>()?;
            let mut chunks: Vec<Vec<(Vec<usize>, Value)>> = vec![Vec::new(); k.lambda.ret.len()];
            for t in 0..num_threads {
                let positions = thread_rows(k.ordering, t, num_threads, thread_chunk, width);
                let mut args = vec![Value::i64(t as i64), Value::i64(positions.len() as i64)];
                args.extend(arrays.iter().map(|a| Value::Array(a.select_rows(&positions))));
                let results = eval_lambda(&k.lambda, args, env)?;
                for (out, r) in chunks.iter_mut().zip(results) {
                    out.push((positions.clone(), r));
                }
            }
            chunks
                .into_iter()
                .zip(&k.lambda.ret)
                .map(|(chunks, ty)| {
                    let row_shape = match chunks.iter().find_map(|(_, c)| match c {
                        Value::Array(a) if a.num_rows() > 0 => Some(a.shape[1..].to_vec()),
                        _ => None,
                    }) {
                        Some(s) => s,
                        None => shape_of(&ty.row_type(), env).unwrap_or_default(),
                    };
                    concat_chunks(elem_of(ty)?, &row_shape, width, chunks)
                })
                .collect()
        }
        KernelOp::WriteKernel(k) => {
            let width = eval_size(&k.width, env)?;
            let arrays = k.arrays.iter().map(|a| eval_array(a, env)).collect::<Result<Vec<_>>>()?;
            let mut dests = k
                .dests
                .iter()
                .map(|(_, arr)| eval_array(arr, env))
                .collect::<Result<Vec<_>>>()?;
            let n = dests.len();
            for i in 0..width {
                let mut args = vec![Value::i64(i as i64)];
                args.extend(arrays.iter().map(|a| a.row(i)));
                let results = eval_lambda(&k.lambda, args, env)?;
                if results.len() != 2 * n {
                    bail_eval!("write operator returned {} values for {} destinations", results.len(), n);
                }
                for (j, dest) in dests.iter_mut().enumerate() {
                    let idx = match &results[j] {
                        Value::Prim(p) => p.as_i64().ok_or_else(|| err_eval!("write index is not an integer"))?,
                        _ => bail_eval!("write index is not a scalar"),
                    };
                    // Out-of-bounds writes are ignored.
                    if idx < 0 || idx as usize >= dest.num_rows() {
                        continue;
                    }
                    let (start, len) = dest.locate(&[idx])?;
                    match &results[n + j] {
                        Value::Prim(p) if len == 1 => dest.data[start] = *p,
                        Value::Array(a) if a.data.len() == len => dest.data[start..start + len].copy_from_slice(&a.data),
                        _ => bail_eval!("write value has the wrong shape"),
                    }
                }
            }
            Ok(dests.into_iter().map(Value::Array).collect())
        }
        KernelOp::Kernel(k) => {
            let num_threads = eval_size(&k.size.num_threads, env)?;
            let group_size = eval_size(&k.size.group_size, env)?.max(1);
            let mut threads: Vec<Env<'_>> = (0..num_threads)
                .map(|t| {
                    let mut e = env.child();
                    e.bind(k.space.global_tid.clone(), Value::i64(t as i64));
                    e.bind(k.space.local_tid.clone(), Value::i64((t % group_size) as i64));
                    e.bind(k.space.group_id.clone(), Value::i64((t / group_size) as i64));
                    e
                })
                .collect();
            run_kernel_stms(&k.body, &mut threads, num_threads, group_size)?;
            kernel_results(&k.body, &k.returns, &threads, num_threads, env)
        }
        KernelOp::NumGroups | KernelOp::GroupSize => {
            bail_eval!("{} has no value outside a running kernel", op.name())
        }
    }
}

fn eval_map_kernel(k: &MapKernel, env: &Env<'_>) -> Result<Vec<Value>> {
    let width = eval_size(&k.width, env)?;
    let dims: Vec<usize> = k.ispace.iter().map(|(_, d)| eval_size(d, env)).collect::<Result<_>>()?;
    let mut rows: Vec<Vec<Value>> = vec![Vec::with_capacity(width); k.returns.len()];
    for t in 0..width {
        let mut local = env.child();
        local.bind(k.thread_index.clone(), Value::i64(t as i64));
        let mut rest = t;
        for ((v, _), &d) in k.ispace.iter().zip(&dims).rev() {
            let d = d.max(1);
            local.bind(v.clone(), Value::i64((rest % d) as i64));
            rest /= d;
        }
        for inp in &k.inputs {
            let a = eval_array(&inp.array, &local)?;
            let indices = inp.indices.iter().map(|i| eval_i64(i, &local)).collect::<Result<Vec<_>>>()?;
            let v = a.index(&indices)?;
            local.bind(inp.param.name.clone(), v);
        }
        let results = eval_body(&k.body, &local)?;
        if results.len() != rows.len() {
            bail_eval!("kernel body returned {} values for {} outputs", results.len(), rows.len());
        }
        for (out, r) in rows.iter_mut().zip(results) {
            out.push(r);
        }
    }

    let space_shape = if dims.is_empty() { vec![width] } else { dims };
    rows.into_iter()
        .zip(&k.returns)
        .map(|(rows, (ty, perm))| {
            let row_shape = shape_of(ty, env)?;
            let flat = ArrayValue::from_rows(elem_of(ty)?, &row_shape, rows)?;
            let mut shape = space_shape.clone();
            shape.extend(row_shape);
            if shape.iter().product::<usize>() != flat.data.len() {
                bail_eval!("kernel width does not match its index space {:?}", space_shape);
            }
            let out = ArrayValue { shape, ..flat };
            let identity = perm.iter().enumerate().all(|(i, &p)| i == p);
            Ok(Value::Array(if identity { out } else { out.rearrange(perm)? }))
        })
        .collect()
}

fn run_kernel_stms(
    kbody: &KernelBody,
    threads: &mut [Env<'_>],
    num_threads: usize,
    group_size: usize,
) -> Result<()> {
    for kstm in &kbody.stms {
        match kstm {
            KernelStm::SplitArray {
                size,
                chunks,
                ordering,
                width,
                elems_per_thread,
                arrays,
            } => {
                for (t, thread) in threads.iter_mut().enumerate() {
                    let width = eval_size(width, thread)?;
                    let per_thread = eval_size(elems_per_thread, thread)?;
                    let positions = thread_rows(*ordering, t, num_threads, per_thread, width);
                    let mut bound = vec![(size.name.clone(), Value::i64(positions.len() as i64))];
                    for (pe, arr) in chunks.iter().zip(arrays) {
                        let a = eval_array(arr, thread)?;
                        bound.push((pe.name.clone(), Value::Array(a.select_rows(&positions))));
                    }
                    for (name, v) in bound {
                        thread.bind(name, v);
                    }
                }
            }
            KernelStm::Thread { pat, threads: which, body } => {
                for (t, thread) in threads.iter_mut().enumerate() {
                    let active = match which {
                        WhichThreads::AllThreads => true,
                        WhichThreads::OneThreadPerGroup(who) => eval_size(who, thread)? == t % group_size,
                    };
                    let values = if active {
                        eval_body(body, thread)?
                    } else {
                        pat.values.iter().map(|pe| blank(&pe.ty, thread)).collect::<Result<_>>()?
                    };
                    bind_pattern(thread, pat, values)?;
                }
            }
            KernelStm::GroupReduce {
                pat,
                width,
                lambda,
                input,
            } => {
                let num_groups = num_threads.div_ceil(group_size);
                let mut reduced = Vec::with_capacity(num_groups);
                for g in 0..num_groups {
                    let first = g * group_size;
                    let last = (first + group_size).min(num_threads);
                    let participants = eval_size(width, &threads[first])?.min(last - first);
                    let mut accs = input
                        .iter()
                        .map(|(ne, _)| eval_subexp(ne, &threads[first]))
                        .collect::<Result<Vec<_>>>()?;
                    for l in 0..participants {
                        let thread = &threads[first + l];
                        let mut args = vec![Value::i64(l as i64)];
                        args.extend(accs);
                        for (_, v) in input {
                            args.push(thread.lookup(v)?.clone());
                        }
                        accs = eval_lambda(lambda, args, thread)?;
                    }
                    reduced.push(accs);
                }
                for (t, thread) in threads.iter_mut().enumerate() {
                    bind_pattern(thread, pat, reduced[t / group_size].clone())?;
                }
            }
        }
    }
    Ok(())
}

fn kernel_results(
    kbody: &KernelBody,
    returns: &[Type],
    threads: &[Env<'_>],
    num_threads: usize,
    env: &Env<'_>,
) -> Result<Vec<Value>> {
    if kbody.result.len() != returns.len() {
        bail_eval!("kernel has {} results but {} return types", kbody.result.len(), returns.len());
    }
    kbody
        .result
        .iter()
        .zip(returns)
        .map(|(res, ty)| match res {
            KernelResult::AllThreadsReturn(se) => {
                let rows = threads.iter().map(|t| eval_subexp(se, t)).collect::<Result<Vec<_>>>()?;
                let row_shape = match rows.first() {
                    Some(r) => r.shape(),
                    None => shape_of(&ty.row_type(), env).unwrap_or_default(),
                };
                Ok(Value::Array(ArrayValue::from_rows(elem_of(ty)?, &row_shape, rows)?))
            }
            KernelResult::ThisThreadReturns { index, value } => {
                let mut out = match blank(ty, env)? {
                    Value::Array(a) => a,
                    _ => bail_eval!("per-thread result must be written to an array"),
                };
                for thread in threads {
                    let i = eval_i64(index, thread)?;
                    if i < 0 || i as usize >= out.num_rows() {
                        continue;
                    }
                    let (start, len) = out.locate(&[i])?;
                    match eval_subexp(value, thread)? {
                        Value::Prim(p) if len == 1 => out.data[start] = p,
                        Value::Array(a) if a.data.len() == len => out.data[start..start + len].copy_from_slice(&a.data),
                        _ => bail_eval!("per-thread result has the wrong shape"),
                    }
                }
                Ok(Value::Array(out))
            }
            KernelResult::ConcatReturns {
                ordering,
                width,
                per_thread_elems,
                array,
            } => {
                let width = eval_size(width, env)?;
                let per_thread = eval_size(per_thread_elems, env)?;
                let mut chunks = Vec::with_capacity(threads.len());
                let mut row_shape = None;
                for (t, thread) in threads.iter().enumerate() {
                    let positions = thread_rows(*ordering, t, num_threads, per_thread, width);
                    let mut chunk = eval_array(array, thread)?;
                    // Threads may hold more rows than they contribute.
                    if chunk.num_rows() > positions.len() {
                        chunk = chunk.select_rows(&(0..positions.len()).collect::<Vec<_>>());
                    }
                    if row_shape.is_none() {
                        row_shape = Some(chunk.shape[1..].to_vec());
                    }
                    chunks.push((positions, Value::Array(chunk)));
                }
                let row_shape = match row_shape {
                    Some(s) => s,
                    None => shape_of(&ty.row_type(), env).unwrap_or_default(),
                };
                concat_chunks(elem_of(ty)?, &row_shape, width, chunks)
            }
        })
        .collect()
}
