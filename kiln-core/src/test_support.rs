//! Shared helpers for building kernel IR in tests.

use crate::eval::{eval_fun, Value};
use crate::ir::{
    BinOp, Body, Certs, Exp, FunDef, KernelInput, KernelOp, KernelSize, Lambda, MapKernel, Param, PrimType, Prog,
    Stm, SubExp, Type, VName,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// =============================================================================
// Types and operands
// =============================================================================

pub fn i64_t() -> Type {
    Type::Prim(PrimType::I64)
}

pub fn i64_array(n: SubExp) -> Type {
    Type::array(PrimType::I64, vec![n])
}

pub fn c(n: i64) -> SubExp {
    SubExp::i64(n)
}

pub fn var(v: &VName) -> SubExp {
    SubExp::var(v)
}

pub fn binop(op: BinOp, x: SubExp, y: SubExp) -> Exp {
    Exp::BinOp { op, x, y }
}

pub fn let_i64(name: &VName, exp: Exp) -> Stm {
    Stm::single(name.clone(), i64_t(), exp)
}

pub fn param(name: &VName, ty: Type) -> Param {
    Param::new(name.clone(), ty)
}

pub fn lambda(params: Vec<Param>, body: Body, ret: Vec<Type>) -> Lambda {
    Lambda { params, body, ret }
}

pub fn input(param: &VName, ty: Type, array: &VName, indices: Vec<SubExp>) -> KernelInput {
    KernelInput {
        param: Param::new(param.clone(), ty),
        array: array.clone(),
        indices,
    }
}

/// A one-dimensional map kernel over `0..width`, bound to index `i`.
pub fn map_1d(width: SubExp, tid: &VName, i: &VName, inputs: Vec<KernelInput>, returns: Vec<Type>, body: Body) -> Exp {
    Exp::Op(KernelOp::MapKernel(MapKernel {
        certs: Certs::none(),
        width: width.clone(),
        thread_index: tid.clone(),
        ispace: vec![(i.clone(), width)],
        inputs,
        returns: returns
            .into_iter()
            .map(|t| {
                let perm = (0..=t.rank()).collect();
                (t, perm)
            })
            .collect(),
        body,
    }))
}

/// Launch geometry with one group of `num_threads` threads.
pub fn kernel_size(num_threads: SubExp, thread_chunk: SubExp) -> KernelSize {
    KernelSize {
        num_groups: c(1),
        group_size: num_threads.clone(),
        thread_chunk,
        num_elements: c(0),
        offset_multiple: c(1),
        num_threads,
    }
}

// =============================================================================
// Programs
// =============================================================================

/// A program with a single function named `main`.
pub fn main_prog(params: Vec<Param>, ret: Vec<Type>, body: Body) -> Prog {
    Prog {
        funs: vec![FunDef {
            name: "main".to_string(),
            params,
            ret,
            body,
        }],
    }
}

pub fn main_body(prog: &Prog) -> &Body {
    &prog.funs[0].body
}

pub fn run(prog: &Prog, args: Vec<Value>) -> Vec<Value> {
    eval_fun(prog, "main", args).expect("evaluation failed")
}

/// Kernel operations bound at the top level of `body`, in order.
pub fn kernels(body: &Body) -> Vec<&KernelOp> {
    body.stms
        .iter()
        .filter_map(|stm| match &stm.exp {
            Exp::Op(op) => Some(op),
            _ => None,
        })
        .collect()
}
