//! The rewrite engine.
//!
//! `simplify_body` makes two sweeps over a body:
//!
//! 1. Top-down: copy propagation of bound aliases, top-down rules (whose
//!    replacements are re-processed), recursion into nested bodies, and
//!    hoisting of statements out of the body where the hoist-blocker allows.
//! 2. Bottom-up: dead-code removal and bottom-up rules, driven by a usage
//!    table built from the end of the body backwards.
//!
//! Statements hoisted out of a nested body are re-examined at the enclosing
//! level, so a statement can move out of several levels in one sweep.

use std::collections::VecDeque;

use log::{debug, trace};

use super::kernel_op::simplify_kernel_op;
use super::rules::RuleBook;
use super::symbol_table::{SymbolTable, UsageTable};
use super::SimplifyConfig;
use crate::error::Result;
use crate::ir::analysis::{consumed_in_body, consumed_in_exp, free_in};
use crate::ir::{Body, Builder, Certs, Exp, Lambda, NameSet, NameSource, Param, PatElem, Pattern, Stm, SubExp, Type, VName};

// =============================================================================
// Hoist blockers
// =============================================================================

/// Predicate deciding whether a statement must stay in the body it is bound
/// in.
#[derive(Debug, Clone, PartialEq)]
pub enum HoistBlocker {
    Never,
    Always,
    /// Blocks statements that mention any of these names.
    FreeIn(NameSet),
    /// Blocks statements that consume an array.
    Consumed,
    /// Blocks statements whose evaluation may fail.
    NotSafe,
    /// Blocks kernel operations.
    IsKernel,
    /// Blocks allocations. Per-thread memory must stay in the thread's body.
    IsAlloc,
    Or(Box<HoistBlocker>, Box<HoistBlocker>),
}

impl HoistBlocker {
    pub fn free_in(names: impl IntoIterator<Item = VName>) -> Self {
        HoistBlocker::FreeIn(names.into_iter().collect())
    }

    pub fn or(self, other: HoistBlocker) -> HoistBlocker {
        match (self, other) {
            (HoistBlocker::Never, b) | (b, HoistBlocker::Never) => b,
            (HoistBlocker::Always, _) | (_, HoistBlocker::Always) => HoistBlocker::Always,
            (a, b) => HoistBlocker::Or(Box::new(a), Box::new(b)),
        }
    }

    /// `free` must be the free variables of `stm`.
    pub fn blocks(&self, stm: &Stm, free: &NameSet) -> bool {
        match self {
            HoistBlocker::Never => false,
            HoistBlocker::Always => true,
            HoistBlocker::FreeIn(names) => free.iter().any(|v| names.contains(v)),
            HoistBlocker::Consumed => !consumed_in_exp(&stm.exp).is_empty(),
            HoistBlocker::NotSafe => !stm.exp.is_safe(),
            HoistBlocker::IsKernel => stm.exp.is_kernel(),
            HoistBlocker::IsAlloc => matches!(stm.exp, Exp::Alloc { .. }),
            HoistBlocker::Or(a, b) => a.blocks(stm, free) || b.blocks(stm, free),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct Engine<'a> {
    names: &'a mut NameSource,
    rules: &'a RuleBook,
    parallel_blocker: HoistBlocker,
}

/// Statements of the body currently being swept.
#[derive(Default)]
struct Level {
    kept: Vec<Stm>,
    hoisted: Vec<Stm>,
    bound_here: NameSet,
    /// Names consumed in the body, plus everything they alias. Their
    /// defining statements must be re-evaluated wherever the body is.
    consumed: NameSet,
}

impl<'a> Engine<'a> {
    pub fn new(names: &'a mut NameSource, rules: &'a RuleBook, config: &SimplifyConfig) -> Self {
        let parallel_blocker = HoistBlocker::IsKernel.or(HoistBlocker::IsAlloc);
        let parallel_blocker = if config.block_unsafe_hoisting {
            parallel_blocker.or(HoistBlocker::NotSafe)
        } else {
            parallel_blocker
        };
        Engine {
            names,
            rules,
            parallel_blocker,
        }
    }

    pub fn names(&mut self) -> &mut NameSource {
        &mut *self.names
    }

    /// The blocker every per-thread body is simplified under, in addition to
    /// its own bound names.
    pub fn parallel_blocker(&self) -> &HoistBlocker {
        &self.parallel_blocker
    }

    // -------------------------------------------------------------------------
    // Values
    // -------------------------------------------------------------------------

    /// Follow variable-to-variable bindings, and replace variables bound to
    /// a scalar constant by the constant.
    pub fn simplify_subexp(&self, scope: &SymbolTable, se: &SubExp) -> SubExp {
        match se {
            SubExp::Const(_) => se.clone(),
            SubExp::Var(v) => match scope.lookup_exp(v) {
                Some(Exp::SubExp(SubExp::Var(w))) => self.simplify_subexp(scope, &SubExp::Var(w.clone())),
                Some(Exp::SubExp(c @ SubExp::Const(_))) => c.clone(),
                _ => se.clone(),
            },
        }
    }

    pub fn simplify_var(&self, scope: &SymbolTable, v: &VName) -> VName {
        match scope.lookup_exp(v) {
            Some(Exp::SubExp(SubExp::Var(w))) => self.simplify_var(scope, w),
            _ => v.clone(),
        }
    }

    pub fn simplify_subexps(&self, scope: &SymbolTable, ses: &[SubExp]) -> Vec<SubExp> {
        ses.iter().map(|se| self.simplify_subexp(scope, se)).collect()
    }

    pub fn simplify_certs(&self, scope: &SymbolTable, certs: &Certs) -> Certs {
        let mut seen = NameSet::new();
        for c in &certs.0 {
            seen.insert(self.simplify_var(scope, c));
        }
        Certs(seen.into_iter().collect())
    }

    pub fn simplify_type(&self, scope: &SymbolTable, ty: Type) -> Type {
        match ty {
            Type::Array { elem, shape, unique } => Type::Array {
                elem,
                shape: self.simplify_subexps(scope, &shape),
                unique,
            },
            Type::Mem { size, space } => Type::Mem {
                size: self.simplify_subexp(scope, &size),
                space,
            },
            prim => prim,
        }
    }

    pub fn simplify_param(&self, scope: &SymbolTable, p: Param) -> Param {
        Param {
            ty: self.simplify_type(scope, p.ty),
            ..p
        }
    }

    pub fn simplify_pat_elem(&self, scope: &SymbolTable, pe: PatElem) -> PatElem {
        PatElem {
            ty: self.simplify_type(scope, pe.ty),
            ..pe
        }
    }

    pub fn simplify_pattern(&self, scope: &SymbolTable, pat: Pattern) -> Pattern {
        Pattern {
            context: pat.context.into_iter().map(|pe| self.simplify_pat_elem(scope, pe)).collect(),
            values: pat.values.into_iter().map(|pe| self.simplify_pat_elem(scope, pe)).collect(),
        }
    }

    // -------------------------------------------------------------------------
    // Bodies
    // -------------------------------------------------------------------------

    /// Simplify `body` under `scope`. Returns the statements hoisted out of
    /// the body (in order) and the simplified body.
    pub fn simplify_body(
        &mut self,
        scope: &SymbolTable,
        blocker: &HoistBlocker,
        body: Body,
    ) -> Result<(Vec<Stm>, Body)> {
        let mut level = Level {
            consumed: consumed_with_aliases(&body),
            ..Level::default()
        };
        let mut queue: VecDeque<Stm> = body.stms.into();
        let mut scope = scope.clone();

        while let Some(stm) = queue.pop_front() {
            if let Some(replacement) = self.apply_top_down(&scope, &stm) {
                for s in replacement.into_iter().rev() {
                    queue.push_front(s);
                }
                continue;
            }
            let (nested, stm) = self.simplify_stm(&scope, stm)?;
            for s in nested.into_iter().chain(std::iter::once(stm)) {
                scope = scope.with_stm(&s);
                place(blocker, s, &mut level);
            }
        }

        let result = self.simplify_subexps(&scope, &body.result);
        let stms = self.bottom_up(&scope, level.kept, &result);
        Ok((level.hoisted, Body::new(stms, result)))
    }

    /// Simplify a lambda under the parallelism blocker.
    pub fn simplify_lambda(&mut self, scope: &SymbolTable, lambda: Lambda) -> Result<(Vec<Stm>, Lambda)> {
        let blocker = self.parallel_blocker.clone();
        self.simplify_lambda_with(scope, &blocker, lambda)
    }

    /// Simplify a lambda. Nothing mentioning a parameter or consuming an
    /// array is hoisted; `blocker` may forbid more.
    pub fn simplify_lambda_with(
        &mut self,
        scope: &SymbolTable,
        blocker: &HoistBlocker,
        lambda: Lambda,
    ) -> Result<(Vec<Stm>, Lambda)> {
        let params: Vec<Param> = lambda.params.into_iter().map(|p| self.simplify_param(scope, p)).collect();
        let blocker = HoistBlocker::free_in(params.iter().map(|p| p.name.clone()))
            .or(HoistBlocker::Consumed)
            .or(blocker.clone());
        let inner = scope.with_params(&params);
        let (hoisted, body) = self.simplify_body(&inner, &blocker, lambda.body)?;
        let ret = lambda.ret.into_iter().map(|t| self.simplify_type(scope, t)).collect();
        Ok((hoisted, Lambda { params, body, ret }))
    }

    fn simplify_stm(&mut self, scope: &SymbolTable, stm: Stm) -> Result<(Vec<Stm>, Stm)> {
        let certs = self.simplify_certs(scope, &stm.certs);
        let pat = self.simplify_pattern(scope, stm.pat);
        let (hoisted, exp) = self.simplify_exp(scope, stm.exp)?;
        Ok((hoisted, Stm { pat, certs, exp }))
    }

    fn simplify_exp(&mut self, scope: &SymbolTable, exp: Exp) -> Result<(Vec<Stm>, Exp)> {
        let exp = match exp {
            Exp::SubExp(se) => Exp::SubExp(self.simplify_subexp(scope, &se)),
            Exp::BinOp { op, x, y } => Exp::BinOp {
                op,
                x: self.simplify_subexp(scope, &x),
                y: self.simplify_subexp(scope, &y),
            },
            Exp::CmpOp { op, x, y } => Exp::CmpOp {
                op,
                x: self.simplify_subexp(scope, &x),
                y: self.simplify_subexp(scope, &y),
            },
            Exp::Index { arr, indices } => Exp::Index {
                arr: self.simplify_var(scope, &arr),
                indices: self.simplify_subexps(scope, &indices),
            },
            Exp::Update { arr, indices, value } => Exp::Update {
                arr: self.simplify_var(scope, &arr),
                indices: self.simplify_subexps(scope, &indices),
                value: self.simplify_subexp(scope, &value),
            },
            Exp::Iota { n, start, stride } => Exp::Iota {
                n: self.simplify_subexp(scope, &n),
                start: self.simplify_subexp(scope, &start),
                stride: self.simplify_subexp(scope, &stride),
            },
            Exp::Replicate { shape, value } => Exp::Replicate {
                shape: self.simplify_subexps(scope, &shape),
                value: self.simplify_subexp(scope, &value),
            },
            Exp::Reshape { shape, arr } => Exp::Reshape {
                shape: self.simplify_subexps(scope, &shape),
                arr: self.simplify_var(scope, &arr),
            },
            Exp::Rearrange { perm, arr } => Exp::Rearrange {
                perm,
                arr: self.simplify_var(scope, &arr),
            },
            Exp::Copy(arr) => Exp::Copy(self.simplify_var(scope, &arr)),
            Exp::Alloc { size, space } => Exp::Alloc {
                size: self.simplify_subexp(scope, &size),
                space,
            },
            Exp::If {
                cond,
                then_body,
                else_body,
                ret,
            } => {
                let blocker = HoistBlocker::Consumed
                    .or(HoistBlocker::NotSafe)
                    .or(self.parallel_blocker.clone());
                let (mut hoisted, then_body) = self.simplify_body(scope, &blocker, then_body)?;
                let (else_hoisted, else_body) = self.simplify_body(scope, &blocker, else_body)?;
                hoisted.extend(else_hoisted);
                let exp = Exp::If {
                    cond: self.simplify_subexp(scope, &cond),
                    then_body,
                    else_body,
                    ret: ret.into_iter().map(|t| self.simplify_type(scope, t)).collect(),
                };
                return Ok((hoisted, exp));
            }
            Exp::DoLoop {
                ctx_merge,
                val_merge,
                index,
                bound,
                body,
            } => {
                let ctx_merge = self.simplify_merge(scope, ctx_merge);
                let val_merge = self.simplify_merge(scope, val_merge);
                let bound = self.simplify_subexp(scope, &bound);
                let params: Vec<Param> = ctx_merge.iter().chain(val_merge.iter()).map(|(p, _)| p.clone()).collect();
                let mut loop_names: NameSet = params.iter().map(|p| p.name.clone()).collect();
                loop_names.insert(index.clone());
                let blocker = HoistBlocker::FreeIn(loop_names)
                    .or(HoistBlocker::Consumed)
                    .or(self.parallel_blocker.clone());
                let inner = scope.with_params(&params).with_index(index.clone(), &bound);
                let (hoisted, body) = self.simplify_body(&inner, &blocker, body)?;
                let exp = Exp::DoLoop {
                    ctx_merge,
                    val_merge,
                    index,
                    bound,
                    body,
                };
                return Ok((hoisted, exp));
            }
            Exp::Op(op) => {
                let (hoisted, op) = simplify_kernel_op(self, scope, op)?;
                return Ok((hoisted, Exp::Op(op)));
            }
        };
        Ok((Vec::new(), exp))
    }

    fn simplify_merge(&self, scope: &SymbolTable, merge: Vec<(Param, SubExp)>) -> Vec<(Param, SubExp)> {
        merge
            .into_iter()
            .map(|(p, init)| (self.simplify_param(scope, p), self.simplify_subexp(scope, &init)))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Rules
    // -------------------------------------------------------------------------

    fn apply_top_down(&mut self, scope: &SymbolTable, stm: &Stm) -> Option<Vec<Stm>> {
        let rules = self.rules;
        for (name, rule) in &rules.top_down {
            let mut b = Builder::new(&mut *self.names);
            if rule(&mut b, scope, stm).is_ok() {
                debug!("rule {} fired on {}", name, pattern_names(&stm.pat));
                return Some(b.into_stms());
            }
        }
        None
    }

    fn apply_bottom_up(&mut self, scope: &SymbolTable, usage: &UsageTable, stm: &Stm) -> Option<Vec<Stm>> {
        let rules = self.rules;
        for (name, rule) in &rules.bottom_up {
            let mut b = Builder::new(&mut *self.names);
            if rule(&mut b, scope, usage, stm).is_ok() {
                debug!("rule {} fired on {}", name, pattern_names(&stm.pat));
                return Some(b.into_stms());
            }
        }
        None
    }

    /// Dead-code removal and bottom-up rules, walking backwards from the
    /// body result.
    fn bottom_up(&mut self, scope: &SymbolTable, stms: Vec<Stm>, result: &[SubExp]) -> Vec<Stm> {
        let mut usage = UsageTable::from_result(result);
        let mut out = Vec::with_capacity(stms.len());
        for stm in stms.into_iter().rev() {
            if !stm.pat.names().any(|n| usage.is_used(n)) {
                trace!("removing dead binding of {}", pattern_names(&stm.pat));
                continue;
            }
            let emitted = match self.apply_bottom_up(scope, &usage, &stm) {
                Some(replacement) => replacement,
                None => vec![stm],
            };
            for s in emitted.into_iter().rev() {
                usage.add_stm(&s);
                out.push(s);
            }
        }
        out.reverse();
        out
    }
}

/// Keep `stm` at the current level or hoist it out.
fn place(blocker: &HoistBlocker, stm: Stm, level: &mut Level) {
    let free = free_in(&stm);
    let depends_on_level = free.iter().any(|v| level.bound_here.contains(v));
    let consumed_later = stm.pat.names().any(|n| level.consumed.contains(n));
    if depends_on_level || consumed_later || blocker.blocks(&stm, &free) {
        level.bound_here.extend(stm.pat.names().cloned());
        level.kept.push(stm);
    } else {
        trace!("hoisting {}", pattern_names(&stm.pat));
        level.hoisted.push(stm);
    }
}

/// Names consumed in `body`, closed under the aliasing statements of the
/// body (a consumed `b = a` also consumes `a`).
fn consumed_with_aliases(body: &Body) -> NameSet {
    let mut consumed = consumed_in_body(body);
    for stm in body.stms.iter().rev() {
        if !stm.pat.names().any(|n| consumed.contains(n)) {
            continue;
        }
        match &stm.exp {
            Exp::SubExp(SubExp::Var(src))
            | Exp::Index { arr: src, .. }
            | Exp::Reshape { arr: src, .. }
            | Exp::Rearrange { arr: src, .. } => {
                consumed.insert(src.clone());
            }
            _ => {}
        }
    }
    consumed
}

fn pattern_names(pat: &Pattern) -> String {
    pat.names().map(|n| n.to_string()).collect::<Vec<_>>().join(", ")
}
