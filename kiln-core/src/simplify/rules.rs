//! Kernel rewrite rules.
//!
//! A rule inspects one statement under the current tables and either emits
//! a replacement sequence into the builder or declines with
//! `NotApplicable`. Rules hold no state; the engine tries them in order and
//! drives the whole set to a fixpoint.

use log::debug;

use super::symbol_table::{SymbolTable, UsageTable};
use crate::ir::analysis::{bound_in_body, consumed_in_body, free_in};
use crate::ir::{
    BinOp, Body, Builder, ChunkedMapKernel, Exp, KernelInput, KernelOp, Lambda, MapKernel, Param, Pattern, PrimType,
    ScanKernel, Stm, StreamOrd, SubExp, Type, VName, WriteKernel,
};

/// A rule did not match. Never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotApplicable;

pub type RuleResult = Result<(), NotApplicable>;

pub type TopDownRule = fn(&mut Builder<'_>, &SymbolTable, &Stm) -> RuleResult;
pub type BottomUpRule = fn(&mut Builder<'_>, &SymbolTable, &UsageTable, &Stm) -> RuleResult;

/// Named rules in the order they are tried.
pub struct RuleBook {
    pub top_down: Vec<(&'static str, TopDownRule)>,
    pub bottom_up: Vec<(&'static str, BottomUpRule)>,
}

impl RuleBook {
    /// No rules: the engine then only propagates copies, hoists and removes
    /// dead code.
    pub fn empty() -> Self {
        RuleBook {
            top_down: Vec::new(),
            bottom_up: Vec::new(),
        }
    }

    pub fn standard() -> Self {
        RuleBook {
            top_down: vec![
                ("remove_unused_kernel_inputs", remove_unused_kernel_inputs as TopDownRule),
                ("simplify_kernel_inputs", simplify_kernel_inputs),
                ("remove_invariant_kernel_outputs", remove_invariant_kernel_outputs),
                ("fuse_chunked_map_iota", fuse_chunked_map_iota),
                ("fuse_scan_iota", fuse_scan_iota),
                ("fuse_write_iota", fuse_write_iota),
            ],
            bottom_up: vec![("remove_dead_kernel_outputs", remove_dead_kernel_outputs as BottomUpRule)],
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn map_kernel(stm: &Stm) -> Result<&MapKernel, NotApplicable> {
    match &stm.exp {
        Exp::Op(KernelOp::MapKernel(k)) => Ok(k),
        _ => Err(NotApplicable),
    }
}

/// `stm` with its expression replaced by `op`.
fn with_op(stm: &Stm, op: KernelOp) -> Stm {
    Stm {
        pat: stm.pat.clone(),
        certs: stm.certs.clone(),
        exp: Exp::Op(op),
    }
}

fn i64_binding(name: VName, exp: Exp) -> Stm {
    Stm::single(name, PrimType::I64, exp)
}

fn add(x: SubExp, y: SubExp) -> Exp {
    Exp::BinOp { op: BinOp::Add, x, y }
}

/// The kernel's pattern, return types and body results have one entry per
/// output.
fn outputs_line_up(stm: &Stm, k: &MapKernel) -> bool {
    stm.pat.context.is_empty() && stm.pat.values.len() == k.returns.len() && k.body.result.len() == k.returns.len()
}

/// Start of `arr` if it is bound to a unit-stride iota.
fn unit_iota_start(vtable: &SymbolTable, arr: &VName) -> Option<SubExp> {
    match vtable.lookup_exp(arr)? {
        Exp::Iota { start, stride, .. } if stride.as_i64() == Some(1) => Some(start.clone()),
        _ => None,
    }
}

/// `lambda` with the parameters at `removed` dropped and `prelude`
/// prepended to its body.
fn rebuild_lambda(lambda: &Lambda, removed: &[usize], prelude: Vec<Stm>) -> Lambda {
    let params: Vec<Param> = lambda
        .params
        .iter()
        .enumerate()
        .filter(|(i, _)| !removed.contains(i))
        .map(|(_, p)| p.clone())
        .collect();
    let mut stms = prelude;
    stms.extend(lambda.body.stms.iter().cloned());
    Lambda {
        params,
        body: Body::new(stms, lambda.body.result.clone()),
        ret: lambda.ret.clone(),
    }
}

// =============================================================================
// Top-down rules
// =============================================================================

/// Drop `MapKernel` inputs whose parameter the body never mentions.
pub fn remove_unused_kernel_inputs(b: &mut Builder<'_>, _vtable: &SymbolTable, stm: &Stm) -> RuleResult {
    let k = map_kernel(stm)?;
    let used = free_in(&k.body);
    let (kept, dropped): (Vec<KernelInput>, Vec<KernelInput>) =
        k.inputs.iter().cloned().partition(|inp| used.contains(&inp.param.name));
    if dropped.is_empty() {
        return Err(NotApplicable);
    }
    debug!(
        "dropping {} unused kernel input(s): {:?}",
        dropped.len(),
        dropped.iter().map(|inp| inp.param.name.to_string()).collect::<Vec<_>>()
    );
    b.add_stm(with_op(
        stm,
        KernelOp::MapKernel(MapKernel {
            inputs: kept,
            ..k.clone()
        }),
    ));
    Ok(())
}

/// Replace inputs whose array is itself an index, a copy, an iota or a
/// replicate by a binding at the top of the kernel body.
pub fn simplify_kernel_inputs(b: &mut Builder<'_>, vtable: &SymbolTable, stm: &Stm) -> RuleResult {
    let k = map_kernel(stm)?;
    let consumed = consumed_in_body(&k.body);
    let mut prelude = Vec::new();
    let mut inputs = Vec::new();
    for inp in &k.inputs {
        match fuse_input(b, vtable, inp, consumed.contains(&inp.param.name)) {
            Some(stms) => prelude.extend(stms),
            None => inputs.push(inp.clone()),
        }
    }
    if prelude.is_empty() {
        return Err(NotApplicable);
    }
    let mut body = k.body.clone();
    prelude.append(&mut body.stms);
    body.stms = prelude;
    b.add_stm(with_op(
        stm,
        KernelOp::MapKernel(MapKernel {
            inputs,
            body,
            ..k.clone()
        }),
    ));
    Ok(())
}

/// Per-thread bindings computing `inp.param` directly, if the input's array
/// has a definition that can be indexed symbolically.
fn fuse_input(b: &mut Builder<'_>, vtable: &SymbolTable, inp: &KernelInput, consumed: bool) -> Option<Vec<Stm>> {
    let param = &inp.param;
    let bind = |exp: Exp| Stm::single(param.name.clone(), param.ty.clone(), exp);
    match vtable.lookup_exp(&inp.array)? {
        // Consuming the parameter would consume the outer array through the
        // fused index.
        Exp::Index { arr, indices } if !consumed => {
            let mut all = indices.clone();
            all.extend(inp.indices.iter().cloned());
            Some(vec![bind(Exp::Index {
                arr: arr.clone(),
                indices: all,
            })])
        }
        Exp::SubExp(SubExp::Var(arr)) if !consumed => Some(vec![bind(Exp::Index {
            arr: arr.clone(),
            indices: inp.indices.clone(),
        })]),
        Exp::Iota { start, stride, .. } if inp.indices.len() == 1 => {
            let offset = b.fresh("iota_offset");
            let scaled = Exp::BinOp {
                op: BinOp::Mul,
                x: inp.indices[0].clone(),
                y: stride.clone(),
            };
            Some(vec![
                i64_binding(offset.clone(), scaled),
                bind(add(start.clone(), SubExp::Var(offset))),
            ])
        }
        Exp::Replicate { shape, value } if inp.indices.len() == shape.len() => match value {
            SubExp::Var(v) if consumed && vtable.lookup_type(v).is_some_and(Type::is_array) => None,
            _ => Some(vec![bind(Exp::SubExp(value.clone()))]),
        },
        Exp::Replicate { shape, value } if inp.indices.len() < shape.len() => Some(vec![bind(Exp::Replicate {
            shape: shape[inp.indices.len()..].to_vec(),
            value: value.clone(),
        })]),
        _ => None,
    }
}

/// Replace `MapKernel` outputs that are the same for every thread by a
/// replicate outside the kernel.
pub fn remove_invariant_kernel_outputs(b: &mut Builder<'_>, vtable: &SymbolTable, stm: &Stm) -> RuleResult {
    let k = map_kernel(stm)?;
    if !outputs_line_up(stm, k) {
        return Err(NotApplicable);
    }
    let mut local = bound_in_body(&k.body);
    local.extend(k.bound_names());

    let mut invariant = Vec::new();
    let mut variant = Vec::new();
    for (i, res) in k.body.result.iter().enumerate() {
        let is_invariant = match res {
            SubExp::Const(_) => true,
            SubExp::Var(v) => vtable.contains(v) && !local.contains(v),
        };
        if is_invariant {
            invariant.push(i);
        } else {
            variant.push(i);
        }
    }
    if invariant.is_empty() {
        return Err(NotApplicable);
    }
    // Permuted invariant outputs are left alone.
    if invariant.iter().any(|&i| !is_sorted(&k.returns[i].1)) {
        return Err(NotApplicable);
    }

    let space_shape = k.space_shape();
    for &i in &invariant {
        let pe = &stm.pat.values[i];
        let (ty, _) = &k.returns[i];
        let flat = b.fresh(&format!("{}_flat", pe.name.base));
        let mut replicate = Stm::single(
            flat.clone(),
            ty.array_of(&[k.width.clone()]),
            Exp::Replicate {
                shape: vec![k.width.clone()],
                value: k.body.result[i].clone(),
            },
        );
        replicate.certs = stm.certs.clone();
        b.add_stm(replicate);
        let mut shape = space_shape.clone();
        shape.extend(ty.shape().iter().cloned());
        let mut reshape = Stm::new(Pattern::new(vec![pe.clone()]), Exp::Reshape { shape, arr: flat });
        reshape.certs = stm.certs.clone();
        b.add_stm(reshape);
    }
    debug!("hoisted {} invariant kernel output(s)", invariant.len());

    if !variant.is_empty() {
        let mut kernel = k.clone();
        kernel.returns = variant.iter().map(|&i| k.returns[i].clone()).collect();
        kernel.body.result = variant.iter().map(|&i| k.body.result[i].clone()).collect();
        let mut rest = with_op(stm, KernelOp::MapKernel(kernel));
        rest.pat.values = variant.iter().map(|&i| stm.pat.values[i].clone()).collect();
        b.add_stm(rest);
    }
    Ok(())
}

fn is_sorted(perm: &[usize]) -> bool {
    perm.windows(2).all(|w| w[0] <= w[1])
}

/// Synthesize per-thread chunks of unit-stride iota inputs instead of
/// reading them from memory.
pub fn fuse_chunked_map_iota(b: &mut Builder<'_>, vtable: &SymbolTable, stm: &Stm) -> RuleResult {
    let k = match &stm.exp {
        Exp::Op(KernelOp::ChunkedMapKernel(k)) => k,
        _ => return Err(NotApplicable),
    };
    let lambda = &k.lambda;
    if lambda.params.len() != 2 + k.arrays.len() {
        return Err(NotApplicable);
    }
    let thread_index = SubExp::var(&lambda.params[0].name);
    let chunk_size = SubExp::var(&lambda.params[1].name);

    let mut prelude = Vec::new();
    let mut removed = Vec::new();
    let mut arrays = Vec::new();
    for (i, arr) in k.arrays.iter().enumerate() {
        let Some(x) = unit_iota_start(vtable, arr) else {
            arrays.push(arr.clone());
            continue;
        };
        let param = &lambda.params[2 + i];
        let start = b.fresh("iota_start");
        let chunk = match k.ordering {
            StreamOrd::Disorder => {
                prelude.push(i64_binding(start.clone(), add(thread_index.clone(), x)));
                Exp::Iota {
                    n: chunk_size.clone(),
                    start: SubExp::Var(start),
                    stride: k.size.num_threads.clone(),
                }
            }
            StreamOrd::InOrder => {
                let offset = b.fresh("iota_offset");
                prelude.push(i64_binding(
                    offset.clone(),
                    Exp::BinOp {
                        op: BinOp::Mul,
                        x: thread_index.clone(),
                        y: k.size.thread_chunk.clone(),
                    },
                ));
                prelude.push(i64_binding(start.clone(), add(SubExp::Var(offset), x)));
                Exp::Iota {
                    n: chunk_size.clone(),
                    start: SubExp::Var(start),
                    stride: SubExp::i64(1),
                }
            }
        };
        prelude.push(Stm::single(param.name.clone(), param.ty.clone(), chunk));
        removed.push(2 + i);
    }
    if removed.is_empty() {
        return Err(NotApplicable);
    }
    debug!("fused {} iota input(s) into chunked map kernel", removed.len());
    let kernel = ChunkedMapKernel {
        lambda: rebuild_lambda(lambda, &removed, prelude),
        arrays,
        ..k.clone()
    };
    b.add_stm(with_op(stm, KernelOp::ChunkedMapKernel(kernel)));
    Ok(())
}

/// As `fuse_chunked_map_iota`, for the per-element fold of a scan.
pub fn fuse_scan_iota(b: &mut Builder<'_>, vtable: &SymbolTable, stm: &Stm) -> RuleResult {
    let k = match &stm.exp {
        Exp::Op(KernelOp::ScanKernel(k)) => k,
        _ => return Err(NotApplicable),
    };
    let fold = &k.fold_lambda;
    let first_elem = 1 + k.nes.len();
    if fold.params.len() != first_elem + k.arrays.len() {
        return Err(NotApplicable);
    }
    let index = SubExp::var(&fold.params[0].name);

    let mut prelude = Vec::new();
    let mut removed = Vec::new();
    let mut arrays = Vec::new();
    for (i, arr) in k.arrays.iter().enumerate() {
        match unit_iota_start(vtable, arr) {
            Some(x) => {
                let param = &fold.params[first_elem + i];
                prelude.push(i64_binding(param.name.clone(), add(index.clone(), x)));
                removed.push(first_elem + i);
            }
            None => arrays.push(arr.clone()),
        }
    }
    if removed.is_empty() {
        return Err(NotApplicable);
    }
    debug!("fused {} iota input(s) into scan kernel", removed.len());
    let kernel = ScanKernel {
        fold_lambda: rebuild_lambda(fold, &removed, prelude),
        arrays,
        ..k.clone()
    };
    b.add_stm(with_op(stm, KernelOp::ScanKernel(kernel)));
    Ok(())
}

/// As `fuse_chunked_map_iota`, for the elements of a scatter.
pub fn fuse_write_iota(b: &mut Builder<'_>, vtable: &SymbolTable, stm: &Stm) -> RuleResult {
    let k = match &stm.exp {
        Exp::Op(KernelOp::WriteKernel(k)) => k,
        _ => return Err(NotApplicable),
    };
    let lambda = &k.lambda;
    if lambda.params.len() != 1 + k.arrays.len() {
        return Err(NotApplicable);
    }
    let thread_index = SubExp::var(&lambda.params[0].name);

    let mut prelude = Vec::new();
    let mut removed = Vec::new();
    let mut arrays = Vec::new();
    for (i, arr) in k.arrays.iter().enumerate() {
        match unit_iota_start(vtable, arr) {
            Some(x) => {
                let param = &lambda.params[1 + i];
                prelude.push(i64_binding(param.name.clone(), add(thread_index.clone(), x)));
                removed.push(1 + i);
            }
            None => arrays.push(arr.clone()),
        }
    }
    if removed.is_empty() {
        return Err(NotApplicable);
    }
    debug!("fused {} iota input(s) into write kernel", removed.len());
    let kernel = WriteKernel {
        lambda: rebuild_lambda(lambda, &removed, prelude),
        arrays,
        ..k.clone()
    };
    b.add_stm(with_op(stm, KernelOp::WriteKernel(kernel)));
    Ok(())
}

// =============================================================================
// Bottom-up rules
// =============================================================================

/// Drop `MapKernel` outputs nothing downstream refers to.
pub fn remove_dead_kernel_outputs(
    b: &mut Builder<'_>,
    _vtable: &SymbolTable,
    usage: &UsageTable,
    stm: &Stm,
) -> RuleResult {
    let k = map_kernel(stm)?;
    if !outputs_line_up(stm, k) {
        return Err(NotApplicable);
    }
    let live: Vec<usize> = stm
        .pat
        .values
        .iter()
        .enumerate()
        .filter(|(_, pe)| usage.is_used(&pe.name))
        .map(|(i, _)| i)
        .collect();
    if live.len() == stm.pat.values.len() {
        return Err(NotApplicable);
    }
    debug!("dropping {} dead kernel output(s)", stm.pat.values.len() - live.len());
    if live.is_empty() {
        return Ok(());
    }
    let mut kernel = k.clone();
    kernel.returns = live.iter().map(|&i| k.returns[i].clone()).collect();
    kernel.body.result = live.iter().map(|&i| k.body.result[i].clone()).collect();
    let mut rest = with_op(stm, KernelOp::MapKernel(kernel));
    rest.pat.values = live.iter().map(|&i| stm.pat.values[i].clone()).collect();
    b.add_stm(rest);
    Ok(())
}
