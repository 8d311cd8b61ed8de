//! Allocation expansion.
//!
//! Allocations bound inside a kernel are per-thread. This pass moves every
//! allocation whose size does not depend on the thread out in front of the
//! kernel, enlarged to hold one copy per thread, and rebases every array
//! placed in it so that thread `t` addresses its own slice:
//!
//! ```text
//! // Before:
//! map_kernel (tid < T) {
//!     mem = alloc(size)
//!     xs @ mem -> iota([n])
//! }
//!
//! // After:
//! total = T * size
//! mem = alloc(total)
//! map_kernel (tid < T) {
//!     xs @ mem -> slice(permute(iota([n, T]), [1, 0]), [tid, 0:n])
//! }
//! ```
//!
//! Element `i` of thread `t` lands at `i * T + t`, so threads interleave
//! and consecutive threads touch consecutive addresses.

use std::fmt;

use indexmap::IndexMap;
use log::{debug, warn};

use crate::error::{CompilerError, Result};
use crate::ir::analysis::{bound_in_body, bound_in_kernel_body};
use crate::ir::{
    BinOp, Body, DimSlice, Exp, FunDef, IxFun, KernelOp, KernelStm, Lambda, NameSet, NameSource, Param, PatElem,
    Pattern, PrimExp, PrimType, Prog, Space, Stm, SubExp, Type, VName,
};
use crate::{bail_expand, err_expand};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpandConfig {
    /// Treat an allocation with a thread-variant size as an error instead of
    /// leaving it in the kernel.
    pub strict_invariance: bool,
}

/// An allocation that could not be expanded because its size is computed
/// inside the kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationDiagnostic {
    /// The thread-variant size variable.
    pub size: VName,
    /// The memory block bound by the allocation.
    pub mem: PatElem,
}

impl fmt::Display for AllocationDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "allocation of {} has size {}, which is not invariant to the kernel",
            self.mem.name, self.size
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    pub prog: Prog,
    pub diagnostics: Vec<AllocationDiagnostic>,
}

// =============================================================================
// Rebasing
// =============================================================================

/// Rebase of a per-thread array onto a block shared by `num_threads`
/// threads, as seen from `thread`.
#[derive(Debug, Clone, PartialEq)]
pub struct Rebase {
    pub thread: PrimExp,
    pub num_threads: PrimExp,
}

impl Rebase {
    /// Layout of a per-thread array of shape `old_shape` in the expanded
    /// block: the thread dimension is innermost in memory.
    pub fn new_base(&self, old_shape: &[PrimExp]) -> IxFun {
        let r = old_shape.len();
        let mut shape = old_shape.to_vec();
        shape.push(self.num_threads.clone());
        let perm = std::iter::once(r).chain(0..r).collect();
        let mut slice = vec![DimSlice::Fix(self.thread.clone())];
        slice.extend(old_shape.iter().cloned().map(DimSlice::full));
        IxFun::iota(shape).permute(perm).slice(slice)
    }

    pub fn apply(&self, ixfun: &IxFun) -> IxFun {
        ixfun.rebase(&self.new_base(ixfun.base_shape()))
    }
}

/// Memory blocks expanded for one kernel, and how arrays in them move.
pub type RebaseMap = IndexMap<VName, Rebase>;

// =============================================================================
// Pass
// =============================================================================

/// Expand the thread-invariant allocations of every kernel in `prog`.
pub fn expand_prog(prog: Prog, config: &ExpandConfig, names: &mut NameSource) -> Result<Expansion> {
    let mut expander = Expander {
        config,
        names,
        diagnostics: Vec::new(),
    };
    let funs = prog
        .funs
        .into_iter()
        .map(|f| expander.expand_fun(f))
        .collect::<Result<Vec<_>>>()?;
    Ok(Expansion {
        prog: Prog { funs },
        diagnostics: expander.diagnostics,
    })
}

struct Expander<'a> {
    config: &'a ExpandConfig,
    names: &'a mut NameSource,
    diagnostics: Vec<AllocationDiagnostic>,
}

/// An allocation lifted out of a kernel body.
struct Allocation {
    mem: PatElem,
    size: SubExp,
    space: Space,
}

#[derive(Default)]
struct Extracted {
    allocs: Vec<Allocation>,
    variant: Vec<AllocationDiagnostic>,
}

impl Expander<'_> {
    fn expand_fun(&mut self, fun: FunDef) -> Result<FunDef> {
        let name = fun.name.clone();
        let body = self.expand_host_body(fun.body).map_err(|e| match e {
            CompilerError::ExpandError(msg) => err_expand!("in function {}: {}", name, msg),
            other => other,
        })?;
        Ok(FunDef { body, ..fun })
    }

    /// Walk host-level code, expanding each kernel in place.
    fn expand_host_body(&mut self, body: Body) -> Result<Body> {
        let mut stms = Vec::with_capacity(body.stms.len());
        for stm in body.stms {
            let Stm { pat, certs, exp } = stm;
            let exp = match exp {
                Exp::Op(op) => {
                    let (prelude, op) = self.expand_kernel(op)?;
                    stms.extend(prelude);
                    Exp::Op(op)
                }
                Exp::If {
                    cond,
                    then_body,
                    else_body,
                    ret,
                } => Exp::If {
                    cond,
                    then_body: self.expand_host_body(then_body)?,
                    else_body: self.expand_host_body(else_body)?,
                    ret,
                },
                Exp::DoLoop {
                    ctx_merge,
                    val_merge,
                    index,
                    bound,
                    body,
                } => Exp::DoLoop {
                    ctx_merge,
                    val_merge,
                    index,
                    bound,
                    body: self.expand_host_body(body)?,
                },
                other => other,
            };
            stms.push(Stm { pat, certs, exp });
        }
        Ok(Body::new(stms, body.result))
    }

    fn expand_kernel(&mut self, op: KernelOp) -> Result<(Vec<Stm>, KernelOp)> {
        match op {
            KernelOp::MapKernel(mut k) => {
                let mut local = bound_in_body(&k.body);
                local.extend(k.bound_names());
                let mut extracted = Extracted::default();
                let body = extract_body(std::mem::take(&mut k.body), &local, &mut extracted);
                let rebase = rebase_for(&k.thread_index, &k.width)?;
                let (prelude, map) = self.hoist(extracted, &k.width, rebase, "map_kernel")?;
                k.body = rebase_body(body, &map)?;
                for inp in &mut k.inputs {
                    rebase_param(&mut inp.param, &map);
                }
                Ok((prelude, KernelOp::MapKernel(k)))
            }
            KernelOp::ChunkedMapKernel(mut k) => {
                let num_threads = k.size.num_threads.clone();
                let (prelude, lambda) = self.expand_lambda(k.lambda, &num_threads, "chunked_map_kernel")?;
                k.lambda = lambda;
                Ok((prelude, KernelOp::ChunkedMapKernel(k)))
            }
            KernelOp::ScanKernel(mut k) => {
                let num_threads = k.size.num_threads.clone();
                let (mut prelude, lambda) = self.expand_lambda(k.lambda, &num_threads, "scan_kernel")?;
                let (fold_prelude, fold_lambda) = self.expand_lambda(k.fold_lambda, &num_threads, "scan_kernel")?;
                prelude.extend(fold_prelude);
                k.lambda = lambda;
                k.fold_lambda = fold_lambda;
                Ok((prelude, KernelOp::ScanKernel(k)))
            }
            KernelOp::Kernel(mut k) => {
                let mut local = bound_in_kernel_body(&k.body);
                local.extend(k.space.names().into_iter().cloned());
                let mut extracted = Extracted::default();
                let stms: Vec<KernelStm> = std::mem::take(&mut k.body.stms)
                    .into_iter()
                    .map(|kstm| extract_kernel_stm(kstm, &local, &mut extracted))
                    .collect();
                let num_threads = k.size.num_threads.clone();
                let rebase = rebase_for(&k.space.global_tid, &num_threads)?;
                let (prelude, map) = self.hoist(extracted, &num_threads, rebase, "kernel")?;
                k.body.stms = stms
                    .into_iter()
                    .map(|kstm| rebase_kernel_stm(kstm, &map))
                    .collect::<Result<Vec<_>>>()?;
                Ok((prelude, KernelOp::Kernel(k)))
            }
            // Scatter kernels have no per-thread storage worth expanding.
            op @ (KernelOp::WriteKernel(_) | KernelOp::NumGroups | KernelOp::GroupSize) => Ok((Vec::new(), op)),
        }
    }

    /// Expand allocations in a lambda whose first parameter is the thread
    /// index.
    fn expand_lambda(&mut self, lambda: Lambda, num_threads: &SubExp, kernel: &str) -> Result<(Vec<Stm>, Lambda)> {
        let Some(thread) = lambda.params.first().map(|p| p.name.clone()) else {
            return Ok((Vec::new(), lambda));
        };
        let mut local = bound_in_body(&lambda.body);
        local.extend(lambda.params.iter().map(|p| p.name.clone()));
        let mut extracted = Extracted::default();
        let body = extract_body(lambda.body, &local, &mut extracted);
        let rebase = rebase_for(&thread, num_threads)?;
        let (prelude, map) = self.hoist(extracted, num_threads, rebase, kernel)?;
        let mut params = lambda.params;
        for p in &mut params {
            rebase_param(p, &map);
        }
        let lambda = Lambda {
            params,
            body: rebase_body(body, &map)?,
            ret: lambda.ret,
        };
        Ok((prelude, lambda))
    }

    /// Report the allocations left behind and bind the expanded ones.
    fn hoist(
        &mut self,
        extracted: Extracted,
        num_threads: &SubExp,
        rebase: Rebase,
        kernel: &str,
    ) -> Result<(Vec<Stm>, RebaseMap)> {
        for diag in extracted.variant {
            if self.config.strict_invariance {
                bail_expand!("{}: {}", kernel, diag);
            }
            warn!("{}: {}; leaving it in the kernel", kernel, diag);
            self.diagnostics.push(diag);
        }

        let mut prelude = Vec::with_capacity(2 * extracted.allocs.len());
        let mut map = RebaseMap::new();
        for alloc in extracted.allocs {
            let total = self.names.fresh(&format!("{}_total", alloc.mem.name.base));
            prelude.push(Stm::single(
                total.clone(),
                PrimType::I64,
                Exp::BinOp {
                    op: BinOp::Mul,
                    x: num_threads.clone(),
                    y: alloc.size,
                },
            ));
            let mem = PatElem {
                ty: Type::mem(SubExp::Var(total.clone()), alloc.space),
                ..alloc.mem
            };
            map.insert(mem.name.clone(), rebase.clone());
            prelude.push(Stm::new(
                Pattern::new(vec![mem]),
                Exp::Alloc {
                    size: SubExp::Var(total),
                    space: alloc.space,
                },
            ));
        }
        if !map.is_empty() {
            debug!(
                "{}: expanded allocation(s) {:?}",
                kernel,
                map.keys().map(|m| m.to_string()).collect::<Vec<_>>()
            );
        }
        Ok((prelude, map))
    }
}

fn rebase_for(thread: &VName, num_threads: &SubExp) -> Result<Rebase> {
    let num_threads = PrimExp::from_subexp(num_threads)
        .ok_or_else(|| err_expand!("thread count {} is not an integer", num_threads))?;
    Ok(Rebase {
        thread: PrimExp::var(thread),
        num_threads,
    })
}

// =============================================================================
// Extraction
// =============================================================================

/// Remove the thread-invariant allocations of `body` (including nested
/// branches and loops) into `out`. `local` holds every name bound inside the
/// kernel.
fn extract_body(body: Body, local: &NameSet, out: &mut Extracted) -> Body {
    let mut stms = Vec::with_capacity(body.stms.len());
    for stm in body.stms {
        let alloc = match &stm.exp {
            Exp::Alloc { size, space } if stm.pat.single_name().is_some() => Some((size.clone(), *space)),
            _ => None,
        };
        if let Some((size, space)) = alloc {
            let mem = stm.pat.values[0].clone();
            match size.as_var().filter(|v| local.contains(*v)).cloned() {
                Some(v) => {
                    out.variant.push(AllocationDiagnostic { size: v, mem });
                    stms.push(stm);
                }
                None => out.allocs.push(Allocation { mem, size, space }),
            }
            continue;
        }

        let Stm { pat, certs, exp } = stm;
        let exp = match exp {
            Exp::If {
                cond,
                then_body,
                else_body,
                ret,
            } => Exp::If {
                cond,
                then_body: extract_body(then_body, local, out),
                else_body: extract_body(else_body, local, out),
                ret,
            },
            Exp::DoLoop {
                ctx_merge,
                val_merge,
                index,
                bound,
                body,
            } => Exp::DoLoop {
                ctx_merge,
                val_merge,
                index,
                bound,
                body: extract_body(body, local, out),
            },
            other => other,
        };
        stms.push(Stm { pat, certs, exp });
    }
    Body::new(stms, body.result)
}

fn extract_kernel_stm(kstm: KernelStm, local: &NameSet, out: &mut Extracted) -> KernelStm {
    match kstm {
        KernelStm::Thread { pat, threads, body } => KernelStm::Thread {
            pat,
            threads,
            body: extract_body(body, local, out),
        },
        KernelStm::GroupReduce {
            pat,
            width,
            lambda,
            input,
        } => KernelStm::GroupReduce {
            pat,
            width,
            lambda: Lambda {
                body: extract_body(lambda.body, local, out),
                ..lambda
            },
            input,
        },
        split @ KernelStm::SplitArray { .. } => split,
    }
}

// =============================================================================
// Rebase
// =============================================================================

fn rebase_pat_elem(pe: &mut PatElem, map: &RebaseMap) {
    if let Some(mb) = &mut pe.mem {
        if let Some(rebase) = map.get(&mb.mem) {
            mb.ixfun = rebase.apply(&mb.ixfun);
        }
    }
}

fn rebase_param(p: &mut Param, map: &RebaseMap) {
    if let Some(mb) = &mut p.mem {
        if let Some(rebase) = map.get(&mb.mem) {
            mb.ixfun = rebase.apply(&mb.ixfun);
        }
    }
}

fn rebase_pattern(mut pat: Pattern, map: &RebaseMap) -> Result<Pattern> {
    if let Some(pe) = pat.context.iter().find(|pe| pe.ty.is_mem()) {
        bail_expand!("cannot rebase existential memory block {}", pe.name);
    }
    for pe in pat.context.iter_mut().chain(pat.values.iter_mut()) {
        rebase_pat_elem(pe, map);
    }
    Ok(pat)
}

fn rebase_body(body: Body, map: &RebaseMap) -> Result<Body> {
    if map.is_empty() {
        return Ok(body);
    }
    let stms = body
        .stms
        .into_iter()
        .map(|stm| rebase_stm(stm, map))
        .collect::<Result<Vec<_>>>()?;
    Ok(Body::new(stms, body.result))
}

fn rebase_stm(stm: Stm, map: &RebaseMap) -> Result<Stm> {
    let pat = rebase_pattern(stm.pat, map)?;
    let exp = match stm.exp {
        Exp::If {
            cond,
            then_body,
            else_body,
            ret,
        } => Exp::If {
            cond,
            then_body: rebase_body(then_body, map)?,
            else_body: rebase_body(else_body, map)?,
            ret,
        },
        Exp::DoLoop {
            mut ctx_merge,
            mut val_merge,
            index,
            bound,
            body,
        } => {
            for (p, _) in ctx_merge.iter_mut().chain(val_merge.iter_mut()) {
                rebase_param(p, map);
            }
            Exp::DoLoop {
                ctx_merge,
                val_merge,
                index,
                bound,
                body: rebase_body(body, map)?,
            }
        }
        other => other,
    };
    Ok(Stm {
        pat,
        certs: stm.certs,
        exp,
    })
}

fn rebase_kernel_stm(kstm: KernelStm, map: &RebaseMap) -> Result<KernelStm> {
    if map.is_empty() {
        return Ok(kstm);
    }
    Ok(match kstm {
        KernelStm::SplitArray {
            mut size,
            mut chunks,
            ordering,
            width,
            elems_per_thread,
            arrays,
        } => {
            rebase_pat_elem(&mut size, map);
            chunks.iter_mut().for_each(|pe| rebase_pat_elem(pe, map));
            KernelStm::SplitArray {
                size,
                chunks,
                ordering,
                width,
                elems_per_thread,
                arrays,
            }
        }
        KernelStm::Thread { pat, threads, body } => KernelStm::Thread {
            pat: rebase_pattern(pat, map)?,
            threads,
            body: rebase_body(body, map)?,
        },
        KernelStm::GroupReduce {
            pat,
            width,
            lambda,
            input,
        } => {
            let mut params = lambda.params;
            params.iter_mut().for_each(|p| rebase_param(p, map));
            KernelStm::GroupReduce {
                pat: rebase_pattern(pat, map)?,
                width,
                lambda: Lambda {
                    params,
                    body: rebase_body(lambda.body, map)?,
                    ret: lambda.ret,
                },
                input,
            }
        }
    })
}
