//! Free-variable, bound-name and consumption analyses.
//!
//! These are structural traversals with no knowledge of the surrounding
//! program. Memory annotations count as uses: an array placed in a block
//! keeps the block (and the sizes in its index function) alive.

use super::{
    Body, Certs, Exp, IxFun, KernelBody, KernelOp, KernelResult, KernelSize, KernelStm, Lambda, MemBind,
    NameSet, Param, PatElem, Pattern, Stm, SubExp, Type, VName, WhichThreads,
};

/// Types that mention variables.
pub trait FreeIn {
    fn free_in(&self, acc: &mut NameSet);
}

/// Collect the free variables of `x`.
pub fn free_in<T: FreeIn + ?Sized>(x: &T) -> NameSet {
    let mut acc = NameSet::new();
    x.free_in(&mut acc);
    acc
}

impl<T: FreeIn> FreeIn for [T] {
    fn free_in(&self, acc: &mut NameSet) {
        self.iter().for_each(|x| x.free_in(acc));
    }
}

impl<T: FreeIn> FreeIn for Vec<T> {
    fn free_in(&self, acc: &mut NameSet) {
        self.as_slice().free_in(acc);
    }
}

impl<T: FreeIn> FreeIn for Option<T> {
    fn free_in(&self, acc: &mut NameSet) {
        if let Some(x) = self {
            x.free_in(acc);
        }
    }
}

impl FreeIn for VName {
    fn free_in(&self, acc: &mut NameSet) {
        acc.insert(self.clone());
    }
}

impl FreeIn for SubExp {
    fn free_in(&self, acc: &mut NameSet) {
        if let SubExp::Var(v) = self {
            acc.insert(v.clone());
        }
    }
}

impl FreeIn for Type {
    fn free_in(&self, acc: &mut NameSet) {
        match self {
            Type::Prim(_) => {}
            Type::Array { shape, .. } => shape.free_in(acc),
            Type::Mem { size, .. } => size.free_in(acc),
        }
    }
}

impl FreeIn for IxFun {
    fn free_in(&self, acc: &mut NameSet) {
        self.free_vars(acc);
    }
}

impl FreeIn for MemBind {
    fn free_in(&self, acc: &mut NameSet) {
        acc.insert(self.mem.clone());
        self.ixfun.free_in(acc);
    }
}

/// Annotations only; the bound name itself is not a use.
impl FreeIn for PatElem {
    fn free_in(&self, acc: &mut NameSet) {
        self.ty.free_in(acc);
        self.mem.free_in(acc);
    }
}

/// Annotations only; the bound name itself is not a use.
impl FreeIn for Param {
    fn free_in(&self, acc: &mut NameSet) {
        self.ty.free_in(acc);
        self.mem.free_in(acc);
    }
}

impl FreeIn for Certs {
    fn free_in(&self, acc: &mut NameSet) {
        self.0.free_in(acc);
    }
}

impl FreeIn for KernelSize {
    fn free_in(&self, acc: &mut NameSet) {
        for se in self.subexps() {
            se.free_in(acc);
        }
    }
}

/// Annotations of the pattern, minus names the pattern binds itself
/// (value types may refer to context elements).
impl FreeIn for Pattern {
    fn free_in(&self, acc: &mut NameSet) {
        let mut local = NameSet::new();
        for pe in self.elems() {
            pe.free_in(&mut local);
        }
        for name in self.names() {
            local.shift_remove(name);
        }
        acc.extend(local);
    }
}

impl FreeIn for Stm {
    fn free_in(&self, acc: &mut NameSet) {
        self.pat.free_in(acc);
        self.certs.free_in(acc);
        self.exp.free_in(acc);
    }
}

impl FreeIn for Body {
    fn free_in(&self, acc: &mut NameSet) {
        let mut free = free_in(&self.result);
        for stm in self.stms.iter().rev() {
            for name in stm.pat.names() {
                free.shift_remove(name);
            }
            stm.free_in(&mut free);
        }
        acc.extend(free);
    }
}

impl FreeIn for Lambda {
    fn free_in(&self, acc: &mut NameSet) {
        let mut free = free_in(&self.body);
        self.ret.free_in(&mut free);
        for p in &self.params {
            free.shift_remove(&p.name);
        }
        // Parameter annotations may only mention enclosing names.
        self.params.free_in(&mut free);
        acc.extend(free);
    }
}

impl FreeIn for Exp {
    fn free_in(&self, acc: &mut NameSet) {
        match self {
            Exp::SubExp(se) => se.free_in(acc),
            Exp::BinOp { x, y, .. } | Exp::CmpOp { x, y, .. } => {
                x.free_in(acc);
                y.free_in(acc);
            }
            Exp::Index { arr, indices } => {
                acc.insert(arr.clone());
                indices.free_in(acc);
            }
            Exp::Update { arr, indices, value } => {
                acc.insert(arr.clone());
                indices.free_in(acc);
                value.free_in(acc);
            }
            Exp::Iota { n, start, stride } => {
                n.free_in(acc);
                start.free_in(acc);
                stride.free_in(acc);
            }
            Exp::Replicate { shape, value } => {
                shape.free_in(acc);
                value.free_in(acc);
            }
            Exp::Reshape { shape, arr } => {
                shape.free_in(acc);
                acc.insert(arr.clone());
            }
            Exp::Rearrange { arr, .. } | Exp::Copy(arr) => {
                acc.insert(arr.clone());
            }
            Exp::Alloc { size, .. } => size.free_in(acc),
            Exp::If {
                cond,
                then_body,
                else_body,
                ret,
            } => {
                cond.free_in(acc);
                then_body.free_in(acc);
                else_body.free_in(acc);
                ret.free_in(acc);
            }
            Exp::DoLoop {
                ctx_merge,
                val_merge,
                index,
                bound,
                body,
            } => {
                let merge = ctx_merge.iter().chain(val_merge.iter());
                let mut inner = free_in(body);
                for (p, _) in merge.clone() {
                    p.free_in(&mut inner);
                }
                for (p, _) in merge.clone() {
                    inner.shift_remove(&p.name);
                }
                inner.shift_remove(index);
                acc.extend(inner);
                for (_, init) in merge {
                    init.free_in(acc);
                }
                bound.free_in(acc);
            }
            Exp::Op(op) => op.free_in(acc),
        }
    }
}

impl FreeIn for KernelOp {
    fn free_in(&self, acc: &mut NameSet) {
        match self {
            KernelOp::MapKernel(k) => {
                k.certs.free_in(acc);
                k.width.free_in(acc);
                for (_, d) in &k.ispace {
                    d.free_in(acc);
                }
                let mut inner = free_in(&k.body);
                for inp in &k.inputs {
                    inner.insert(inp.array.clone());
                    inp.indices.free_in(&mut inner);
                    inp.param.free_in(&mut inner);
                }
                for (ty, _) in &k.returns {
                    ty.free_in(&mut inner);
                }
                for name in k.bound_names() {
                    inner.shift_remove(&name);
                }
                acc.extend(inner);
            }
            KernelOp::ScanKernel(k) => {
                k.certs.free_in(acc);
                k.width.free_in(acc);
                k.size.free_in(acc);
                k.lambda.free_in(acc);
                k.fold_lambda.free_in(acc);
                k.nes.free_in(acc);
                k.arrays.free_in(acc);
            }
            KernelOp::ChunkedMapKernel(k) => {
                k.certs.free_in(acc);
                k.width.free_in(acc);
                k.size.free_in(acc);
                k.lambda.free_in(acc);
                k.arrays.free_in(acc);
            }
            KernelOp::WriteKernel(k) => {
                k.certs.free_in(acc);
                k.width.free_in(acc);
                k.lambda.free_in(acc);
                k.arrays.free_in(acc);
                for (size, arr) in &k.dests {
                    size.free_in(acc);
                    acc.insert(arr.clone());
                }
            }
            KernelOp::Kernel(k) => {
                k.certs.free_in(acc);
                k.size.free_in(acc);
                k.returns.free_in(acc);
                let mut inner = free_in(&k.body);
                for name in k.space.names() {
                    inner.shift_remove(name);
                }
                acc.extend(inner);
            }
            KernelOp::NumGroups | KernelOp::GroupSize => {}
        }
    }
}

impl FreeIn for KernelStm {
    fn free_in(&self, acc: &mut NameSet) {
        match self {
            KernelStm::SplitArray {
                size,
                chunks,
                width,
                elems_per_thread,
                arrays,
                ..
            } => {
                size.free_in(acc);
                chunks.free_in(acc);
                width.free_in(acc);
                elems_per_thread.free_in(acc);
                arrays.free_in(acc);
            }
            KernelStm::Thread { pat, threads, body } => {
                pat.free_in(acc);
                if let WhichThreads::OneThreadPerGroup(who) = threads {
                    who.free_in(acc);
                }
                body.free_in(acc);
            }
            KernelStm::GroupReduce {
                pat,
                width,
                lambda,
                input,
            } => {
                pat.free_in(acc);
                width.free_in(acc);
                lambda.free_in(acc);
                for (ne, v) in input {
                    ne.free_in(acc);
                    acc.insert(v.clone());
                }
            }
        }
    }
}

impl FreeIn for KernelResult {
    fn free_in(&self, acc: &mut NameSet) {
        match self {
            KernelResult::AllThreadsReturn(se) => se.free_in(acc),
            KernelResult::ThisThreadReturns { index, value } => {
                index.free_in(acc);
                value.free_in(acc);
            }
            KernelResult::ConcatReturns {
                width,
                per_thread_elems,
                array,
                ..
            } => {
                width.free_in(acc);
                per_thread_elems.free_in(acc);
                acc.insert(array.clone());
            }
        }
    }
}

impl FreeIn for KernelBody {
    fn free_in(&self, acc: &mut NameSet) {
        let mut free = free_in(&self.result);
        for stm in self.stms.iter().rev() {
            for name in stm.bound_names() {
                free.shift_remove(&name);
            }
            stm.free_in(&mut free);
        }
        acc.extend(free);
    }
}

// =============================================================================
// Bound names
// =============================================================================

/// Every name bound anywhere inside `body`, including parameters and
/// statements of nested bodies.
pub fn bound_in_body(body: &Body) -> NameSet {
    let mut acc = NameSet::new();
    collect_bound_body(body, &mut acc);
    acc
}

/// Every name bound anywhere inside a kernel body.
pub fn bound_in_kernel_body(kbody: &KernelBody) -> NameSet {
    let mut acc = NameSet::new();
    for stm in &kbody.stms {
        acc.extend(stm.bound_names());
        match stm {
            KernelStm::SplitArray { .. } => {}
            KernelStm::Thread { body, .. } => collect_bound_body(body, &mut acc),
            KernelStm::GroupReduce { lambda, .. } => collect_bound_lambda(lambda, &mut acc),
        }
    }
    acc
}

fn collect_bound_body(body: &Body, acc: &mut NameSet) {
    for stm in &body.stms {
        acc.extend(stm.pat.names().cloned());
        collect_bound_exp(&stm.exp, acc);
    }
}

fn collect_bound_lambda(lambda: &Lambda, acc: &mut NameSet) {
    acc.extend(lambda.params.iter().map(|p| p.name.clone()));
    collect_bound_body(&lambda.body, acc);
}

fn collect_bound_exp(exp: &Exp, acc: &mut NameSet) {
    match exp {
        Exp::If {
            then_body, else_body, ..
        } => {
            collect_bound_body(then_body, acc);
            collect_bound_body(else_body, acc);
        }
        Exp::DoLoop {
            ctx_merge,
            val_merge,
            index,
            body,
            ..
        } => {
            acc.extend(ctx_merge.iter().chain(val_merge.iter()).map(|(p, _)| p.name.clone()));
            acc.insert(index.clone());
            collect_bound_body(body, acc);
        }
        Exp::Op(op) => match op {
            KernelOp::MapKernel(k) => {
                acc.extend(k.bound_names());
                collect_bound_body(&k.body, acc);
            }
            KernelOp::ScanKernel(k) => {
                collect_bound_lambda(&k.lambda, acc);
                collect_bound_lambda(&k.fold_lambda, acc);
            }
            KernelOp::ChunkedMapKernel(k) => collect_bound_lambda(&k.lambda, acc),
            KernelOp::WriteKernel(k) => collect_bound_lambda(&k.lambda, acc),
            KernelOp::Kernel(k) => {
                acc.extend(k.space.names().into_iter().cloned());
                acc.extend(bound_in_kernel_body(&k.body));
            }
            KernelOp::NumGroups | KernelOp::GroupSize => {}
        },
        _ => {}
    }
}

// =============================================================================
// Consumption
// =============================================================================

/// Names consumed (updated in place) by evaluating `exp`.
pub fn consumed_in_exp(exp: &Exp) -> NameSet {
    let mut acc = NameSet::new();
    match exp {
        Exp::Update { arr, .. } => {
            acc.insert(arr.clone());
        }
        Exp::If {
            then_body, else_body, ..
        } => {
            acc.extend(consumed_in_body(then_body));
            acc.extend(consumed_in_body(else_body));
        }
        Exp::DoLoop {
            ctx_merge,
            val_merge,
            index,
            body,
            ..
        } => {
            let inner = consumed_in_body(body);
            for (p, init) in ctx_merge.iter().chain(val_merge.iter()) {
                if inner.contains(&p.name) {
                    if let SubExp::Var(v) = init {
                        acc.insert(v.clone());
                    }
                }
            }
            let mut bound = bound_in_body(body);
            bound.extend(ctx_merge.iter().chain(val_merge.iter()).map(|(p, _)| p.name.clone()));
            bound.insert(index.clone());
            acc.extend(inner.into_iter().filter(|v| !bound.contains(v)));
        }
        Exp::Op(op) => acc.extend(consumed_in_op(op)),
        _ => {}
    }
    acc
}

/// Names consumed anywhere in `body`, including names bound inside it.
pub fn consumed_in_body(body: &Body) -> NameSet {
    let mut acc = NameSet::new();
    for stm in &body.stms {
        acc.extend(consumed_in_exp(&stm.exp));
    }
    acc
}

fn consumed_in_lambda(lambda: &Lambda, params_to_arrays: &[(usize, &VName)]) -> NameSet {
    let inner = consumed_in_body(&lambda.body);
    let bound = bound_in_body(&lambda.body);
    let mut acc = NameSet::new();
    for (i, arr) in params_to_arrays {
        if let Some(p) = lambda.params.get(*i) {
            if inner.contains(&p.name) {
                acc.insert((*arr).clone());
            }
        }
    }
    acc.extend(
        inner
            .into_iter()
            .filter(|v| !bound.contains(v) && !lambda.params.iter().any(|p| &p.name == v)),
    );
    acc
}

fn consumed_in_op(op: &KernelOp) -> NameSet {
    match op {
        KernelOp::MapKernel(k) => {
            let inner = consumed_in_body(&k.body);
            let bound = bound_in_body(&k.body);
            let mut acc = NameSet::new();
            for inp in &k.inputs {
                if inner.contains(&inp.param.name) {
                    acc.insert(inp.array.clone());
                }
            }
            let kernel_names = k.bound_names();
            acc.extend(
                inner
                    .into_iter()
                    .filter(|v| !bound.contains(v) && !kernel_names.contains(v)),
            );
            acc
        }
        KernelOp::ScanKernel(k) => {
            let offset = 1 + k.nes.len();
            let arrays: Vec<(usize, &VName)> =
                k.arrays.iter().enumerate().map(|(i, a)| (offset + i, a)).collect();
            let mut acc = consumed_in_lambda(&k.fold_lambda, &arrays);
            acc.extend(consumed_in_lambda(&k.lambda, &[]));
            acc
        }
        KernelOp::ChunkedMapKernel(k) => {
            let arrays: Vec<(usize, &VName)> = k.arrays.iter().enumerate().map(|(i, a)| (2 + i, a)).collect();
            consumed_in_lambda(&k.lambda, &arrays)
        }
        KernelOp::WriteKernel(k) => {
            let arrays: Vec<(usize, &VName)> = k.arrays.iter().enumerate().map(|(i, a)| (1 + i, a)).collect();
            let mut acc = consumed_in_lambda(&k.lambda, &arrays);
            acc.extend(k.dests.iter().map(|(_, arr)| arr.clone()));
            acc
        }
        KernelOp::Kernel(k) => {
            let bound = bound_in_kernel_body(&k.body);
            let mut acc = NameSet::new();
            for stm in &k.body.stms {
                if let KernelStm::Thread { body, .. } = stm {
                    acc.extend(consumed_in_body(body).into_iter().filter(|v| !bound.contains(v)));
                }
            }
            acc
        }
        KernelOp::NumGroups | KernelOp::GroupSize => NameSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, NameSource, PrimType};

    #[test]
    fn test_free_in_body_excludes_local_bindings() {
        let mut names = NameSource::new();
        let a = names.fresh("a");
        let x = names.fresh("x");
        let y = names.fresh("y");
        let body = Body::new(
            vec![
                Stm::single(x.clone(), PrimType::I64, Exp::SubExp(SubExp::var(&a))),
                Stm::single(
                    y.clone(),
                    PrimType::I64,
                    Exp::BinOp {
                        op: BinOp::Add,
                        x: SubExp::var(&x),
                        y: SubExp::var(&a),
                    },
                ),
            ],
            vec![SubExp::var(&y)],
        );
        let free = free_in(&body);
        assert_eq!(free.len(), 1);
        assert!(free.contains(&a));
    }

    #[test]
    fn test_update_consumes_array() {
        let mut names = NameSource::new();
        let arr = names.fresh("arr");
        let exp = Exp::Update {
            arr: arr.clone(),
            indices: vec![SubExp::i64(0)],
            value: SubExp::i64(1),
        };
        let consumed = consumed_in_exp(&exp);
        assert!(consumed.contains(&arr));
    }
}
