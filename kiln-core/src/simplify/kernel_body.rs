//! Simplification of explicit kernel bodies.
//!
//! Kernel statements run in order, each under the scope of everything bound
//! before it. Thread sub-bodies may hoist statements out of the kernel, but
//! never statements mentioning a name bound by the kernel itself.

use log::trace;

use super::engine::{Engine, HoistBlocker};
use super::symbol_table::{Entry, Range, SymbolTable};
use crate::bail_internal;
use crate::error::Result;
use crate::ir::analysis::{free_in, FreeIn};
use crate::ir::{KernelBody, KernelResult, KernelStm, NameSet, Stm, SubExp, VName, WhichThreads};

/// Simplify `kbody` under `scope`. `bound` are the names the kernel binds
/// before its first statement (its thread identity).
pub fn simplify_kernel_body(
    engine: &mut Engine<'_>,
    scope: &SymbolTable,
    bound: impl IntoIterator<Item = VName>,
    kbody: KernelBody,
) -> Result<(Vec<Stm>, KernelBody)> {
    let (hoisted, stms, scope) = simplify_kernel_stms(engine, scope, bound, kbody.stms)?;
    let result: Vec<KernelResult> = kbody
        .result
        .into_iter()
        .map(|r| simplify_kernel_result(engine, &scope, r))
        .collect();
    let stms = remove_dead_kernel_stms(stms, &result);
    Ok((hoisted, KernelBody { stms, result }))
}

/// The scope the results of `kbody` are simplified under.
#[cfg(test)]
pub(crate) fn kernel_body_scope(
    engine: &mut Engine<'_>,
    scope: &SymbolTable,
    bound: impl IntoIterator<Item = VName>,
    kbody: KernelBody,
) -> Result<SymbolTable> {
    simplify_kernel_stms(engine, scope, bound, kbody.stms).map(|(_, _, scope)| scope)
}

fn simplify_kernel_stms(
    engine: &mut Engine<'_>,
    scope: &SymbolTable,
    bound: impl IntoIterator<Item = VName>,
    kstms: Vec<KernelStm>,
) -> Result<(Vec<Stm>, Vec<KernelStm>, SymbolTable)> {
    let mut scope = scope.clone();
    let mut bound: NameSet = bound.into_iter().collect();
    let mut hoisted = Vec::new();
    let mut stms = Vec::with_capacity(kstms.len());

    for kstm in kstms {
        let (stm_hoisted, kstm, next_scope) = simplify_kernel_stm(engine, &scope, &bound, kstm)?;
        hoisted.extend(stm_hoisted);
        bound.extend(kstm.bound_names());
        scope = next_scope;
        stms.push(kstm);
    }
    Ok((hoisted, stms, scope))
}

fn simplify_kernel_stm(
    engine: &mut Engine<'_>,
    scope: &SymbolTable,
    bound: &NameSet,
    kstm: KernelStm,
) -> Result<(Vec<Stm>, KernelStm, SymbolTable)> {
    match kstm {
        KernelStm::SplitArray {
            size,
            chunks,
            ordering,
            width,
            elems_per_thread,
            arrays,
        } => {
            let width = engine.simplify_subexp(scope, &width);
            let elems_per_thread = engine.simplify_subexp(scope, &elems_per_thread);
            let arrays: Vec<VName> = arrays.iter().map(|a| engine.simplify_var(scope, a)).collect();
            let size = engine.simplify_pat_elem(scope, size);
            let chunks: Vec<_> = chunks.into_iter().map(|pe| engine.simplify_pat_elem(scope, pe)).collect();

            let size_entry = Entry::of_type(size.ty.clone())
                .with_range(Range::between(SubExp::i64(0), elems_per_thread.clone()));
            let mut entries = vec![(size.name.clone(), size_entry)];
            for (pe, arr) in chunks.iter().zip(&arrays) {
                let mut aliases = scope.aliases(arr);
                aliases.insert(arr.clone());
                let entry = Entry::of_type(pe.ty.clone())
                    .with_aliases(aliases)
                    .with_range(Range::between(SubExp::var(arr), SubExp::var(arr)));
                entries.push((pe.name.clone(), entry));
            }
            let next = scope.extend(entries);
            let kstm = KernelStm::SplitArray {
                size,
                chunks,
                ordering,
                width,
                elems_per_thread,
                arrays,
            };
            Ok((Vec::new(), kstm, next))
        }
        KernelStm::Thread { pat, threads, body } => {
            let threads = match threads {
                WhichThreads::AllThreads => WhichThreads::AllThreads,
                WhichThreads::OneThreadPerGroup(who) => {
                    WhichThreads::OneThreadPerGroup(engine.simplify_subexp(scope, &who))
                }
            };
            let pat = engine.simplify_pattern(scope, pat);
            let blocker = HoistBlocker::FreeIn(bound.clone())
                .or(HoistBlocker::Consumed)
                .or(engine.parallel_blocker().clone());
            let (hoisted, body) = engine.simplify_body(scope, &blocker, body)?;

            // Facts about the thread's results, restricted to names that
            // outlive the sub-body.
            let inner = body.stms.iter().fold(scope.clone(), |t, s| t.with_stm(s));
            let visible = |se: &SubExp| se.as_var().map_or(true, |v| scope.contains(v) || bound.contains(v));
            let mut entries = Vec::new();
            for (pe, res) in pat.values.iter().zip(&body.result) {
                let mut entry = Entry::of_type(pe.ty.clone());
                if let SubExp::Var(v) = res {
                    let mut aliases: NameSet = inner
                        .aliases(v)
                        .into_iter()
                        .filter(|a| scope.contains(a) || bound.contains(a))
                        .collect();
                    if scope.contains(v) && pe.ty.is_array() {
                        aliases.insert(v.clone());
                    }
                    entry.aliases = aliases;
                    let range = inner.range(v);
                    if range.lower.as_ref().map_or(true, &visible) && range.upper.as_ref().map_or(true, &visible) {
                        entry.range = range;
                    }
                }
                entries.push((pe.name.clone(), entry));
            }
            entries.extend(pat.context.iter().map(|pe| (pe.name.clone(), Entry::of_type(pe.ty.clone()))));
            let next = scope.extend(entries);
            Ok((hoisted, KernelStm::Thread { pat, threads, body }, next))
        }
        KernelStm::GroupReduce {
            pat,
            width,
            lambda,
            input,
        } => {
            let width = engine.simplify_subexp(scope, &width);
            let input: Vec<(SubExp, VName)> = input
                .iter()
                .map(|(ne, v)| (engine.simplify_subexp(scope, ne), engine.simplify_var(scope, v)))
                .collect();
            let (hoisted, lambda) = engine.simplify_lambda_with(scope, &HoistBlocker::Always, lambda)?;
            if !hoisted.is_empty() {
                bail_internal!("statements hoisted out of a group reduction operator");
            }
            let pat = engine.simplify_pattern(scope, pat);
            let next = scope.extend(pat.elems().map(|pe| (pe.name.clone(), Entry::of_type(pe.ty.clone()))));
            Ok((
                Vec::new(),
                KernelStm::GroupReduce {
                    pat,
                    width,
                    lambda,
                    input,
                },
                next,
            ))
        }
    }
}

fn simplify_kernel_result(engine: &Engine<'_>, scope: &SymbolTable, r: KernelResult) -> KernelResult {
    match r {
        KernelResult::AllThreadsReturn(se) => KernelResult::AllThreadsReturn(engine.simplify_subexp(scope, &se)),
        KernelResult::ThisThreadReturns { index, value } => KernelResult::ThisThreadReturns {
            index: engine.simplify_subexp(scope, &index),
            value: engine.simplify_subexp(scope, &value),
        },
        KernelResult::ConcatReturns {
            ordering,
            width,
            per_thread_elems,
            array,
        } => KernelResult::ConcatReturns {
            ordering,
            width: engine.simplify_subexp(scope, &width),
            per_thread_elems: engine.simplify_subexp(scope, &per_thread_elems),
            array: engine.simplify_var(scope, &array),
        },
    }
}

/// Drop kernel statements none of whose bound names are referenced later.
fn remove_dead_kernel_stms(stms: Vec<KernelStm>, result: &[KernelResult]) -> Vec<KernelStm> {
    let mut used = free_in(result);
    let mut kept = Vec::with_capacity(stms.len());
    for kstm in stms.into_iter().rev() {
        let names = kstm.bound_names();
        if !names.iter().any(|n| used.contains(n)) {
            trace!("removing dead kernel statement binding {:?}", names);
            continue;
        }
        kstm.free_in(&mut used);
        kept.push(kstm);
    }
    kept.reverse();
    kept
}
