//! Structural simplification of kernel operations.
//!
//! Every operand is simplified in the enclosing scope. Per-thread bodies and
//! lambdas are simplified in a scope extended with the thread index and the
//! per-thread inputs; statements that hoist out of them are returned to the
//! caller, which places them directly before the kernel.

use super::engine::{Engine, HoistBlocker};
use super::kernel_body::simplify_kernel_body;
use super::symbol_table::{Entry, SymbolTable};
use crate::error::Result;
use crate::ir::{
    ChunkedMapKernel, Kernel, KernelInput, KernelOp, KernelSize, MapKernel, ScanKernel, Stm, SubExp, WriteKernel,
};

pub fn simplify_kernel_op(engine: &mut Engine<'_>, scope: &SymbolTable, op: KernelOp) -> Result<(Vec<Stm>, KernelOp)> {
    match op {
        KernelOp::MapKernel(k) => {
            let (hoisted, k) = simplify_map_kernel(engine, scope, k)?;
            Ok((hoisted, KernelOp::MapKernel(k)))
        }
        KernelOp::ScanKernel(k) => {
            let (mut hoisted, lambda) = engine.simplify_lambda(scope, k.lambda)?;
            let (fold_hoisted, fold_lambda) = engine.simplify_lambda(scope, k.fold_lambda)?;
            hoisted.extend(fold_hoisted);
            let k = ScanKernel {
                certs: engine.simplify_certs(scope, &k.certs),
                width: engine.simplify_subexp(scope, &k.width),
                size: simplify_size(engine, scope, &k.size),
                lambda,
                fold_lambda,
                nes: engine.simplify_subexps(scope, &k.nes),
                arrays: k.arrays.iter().map(|a| engine.simplify_var(scope, a)).collect(),
            };
            Ok((hoisted, KernelOp::ScanKernel(k)))
        }
        KernelOp::ChunkedMapKernel(k) => {
            let (hoisted, lambda) = engine.simplify_lambda(scope, k.lambda)?;
            let k = ChunkedMapKernel {
                certs: engine.simplify_certs(scope, &k.certs),
                width: engine.simplify_subexp(scope, &k.width),
                size: simplify_size(engine, scope, &k.size),
                ordering: k.ordering,
                lambda,
                arrays: k.arrays.iter().map(|a| engine.simplify_var(scope, a)).collect(),
            };
            Ok((hoisted, KernelOp::ChunkedMapKernel(k)))
        }
        KernelOp::WriteKernel(k) => {
            let (hoisted, lambda) = engine.simplify_lambda(scope, k.lambda)?;
            let k = WriteKernel {
                certs: engine.simplify_certs(scope, &k.certs),
                width: engine.simplify_subexp(scope, &k.width),
                lambda,
                arrays: k.arrays.iter().map(|a| engine.simplify_var(scope, a)).collect(),
                dests: k
                    .dests
                    .iter()
                    .map(|(size, arr)| (engine.simplify_subexp(scope, size), engine.simplify_var(scope, arr)))
                    .collect(),
            };
            Ok((hoisted, KernelOp::WriteKernel(k)))
        }
        KernelOp::Kernel(k) => {
            let size = simplify_size(engine, scope, &k.size);
            let inner = scope
                .with_index(k.space.global_tid.clone(), &size.num_threads)
                .with_index(k.space.local_tid.clone(), &size.group_size)
                .with_index(k.space.group_id.clone(), &size.num_groups);
            let bound = k.space.names().into_iter().cloned();
            let (hoisted, body) = simplify_kernel_body(engine, &inner, bound, k.body)?;
            let k = Kernel {
                certs: engine.simplify_certs(scope, &k.certs),
                size,
                space: k.space,
                returns: k.returns.into_iter().map(|t| engine.simplify_type(scope, t)).collect(),
                body,
            };
            Ok((hoisted, KernelOp::Kernel(k)))
        }
        KernelOp::NumGroups => Ok((Vec::new(), KernelOp::NumGroups)),
        KernelOp::GroupSize => Ok((Vec::new(), KernelOp::GroupSize)),
    }
}

fn simplify_map_kernel(engine: &mut Engine<'_>, scope: &SymbolTable, k: MapKernel) -> Result<(Vec<Stm>, MapKernel)> {
    let width = engine.simplify_subexp(scope, &k.width);
    let ispace: Vec<(_, SubExp)> = k
        .ispace
        .iter()
        .map(|(v, d)| (v.clone(), engine.simplify_subexp(scope, d)))
        .collect();
    let inputs: Vec<KernelInput> = k
        .inputs
        .into_iter()
        .map(|inp| KernelInput {
            param: engine.simplify_param(scope, inp.param),
            array: engine.simplify_var(scope, &inp.array),
            indices: engine.simplify_subexps(scope, &inp.indices),
        })
        .collect();

    let mut inner = scope.with_index(k.thread_index.clone(), &width);
    for (v, d) in &ispace {
        inner = inner.with_index(v.clone(), d);
    }
    let inner = inner.extend(inputs.iter().map(|inp| {
        let mut aliases = scope.aliases(&inp.array);
        aliases.insert(inp.array.clone());
        let entry = Entry::of_type(inp.param.ty.clone())
            .with_aliases(if inp.param.ty.is_array() { aliases } else { Default::default() });
        (inp.param.name.clone(), entry)
    }));

    let mut k = MapKernel {
        certs: engine.simplify_certs(scope, &k.certs),
        width,
        thread_index: k.thread_index,
        ispace,
        inputs,
        returns: k
            .returns
            .into_iter()
            .map(|(t, perm)| (engine.simplify_type(scope, t), perm))
            .collect(),
        body: k.body,
    };
    let blocker = HoistBlocker::free_in(k.bound_names())
        .or(HoistBlocker::Consumed)
        .or(engine.parallel_blocker().clone());
    let body = std::mem::take(&mut k.body);
    let (hoisted, body) = engine.simplify_body(&inner, &blocker, body)?;
    k.body = body;
    Ok((hoisted, k))
}

fn simplify_size(engine: &Engine<'_>, scope: &SymbolTable, size: &KernelSize) -> KernelSize {
    KernelSize {
        num_groups: engine.simplify_subexp(scope, &size.num_groups),
        group_size: engine.simplify_subexp(scope, &size.group_size),
        thread_chunk: engine.simplify_subexp(scope, &size.thread_chunk),
        num_elements: engine.simplify_subexp(scope, &size.num_elements),
        offset_multiple: engine.simplify_subexp(scope, &size.offset_multiple),
        num_threads: engine.simplify_subexp(scope, &size.num_threads),
    }
}
