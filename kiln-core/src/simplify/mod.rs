//! Kernel-aware simplification.
//!
//! The driver repeats engine sweeps over every function until the function
//! stops changing. Each sweep runs the kernel rule set (`rules`) and recurses
//! into kernel operations (`kernel_op`) and explicit kernel bodies
//! (`kernel_body`).

pub mod engine;
pub mod kernel_body;
pub mod kernel_op;
pub mod rules;
pub mod symbol_table;


use log::{debug, warn};

use crate::bail_internal;
use crate::error::Result;
use crate::ir::{FunDef, NameSource, Prog};

pub use engine::{Engine, HoistBlocker};
pub use rules::{NotApplicable, RuleBook};
pub use symbol_table::{Entry, Range, SymbolTable, UsageTable};

#[derive(Debug, Clone, PartialEq)]
pub struct SimplifyConfig {
    /// Upper bound on sweeps per function.
    pub max_passes: usize,
    /// Never hoist operations that may fail (indexing, division,
    /// allocation, reshape, control flow) out of the body they are bound in.
    pub block_unsafe_hoisting: bool,
}

impl Default for SimplifyConfig {
    fn default() -> Self {
        SimplifyConfig {
            max_passes: 64,
            block_unsafe_hoisting: true,
        }
    }
}

/// Simplify every function of `prog` with the standard rule set.
pub fn simplify_prog(prog: Prog, config: &SimplifyConfig, names: &mut NameSource) -> Result<Prog> {
    let rules = RuleBook::standard();
    let funs = prog
        .funs
        .into_iter()
        .map(|f| simplify_fun(f, &rules, config, names))
        .collect::<Result<Vec<_>>>()?;
    Ok(Prog { funs })
}

/// Sweep `fun` until it reaches a fixpoint or `max_passes` is exhausted.
pub fn simplify_fun(fun: FunDef, rules: &RuleBook, config: &SimplifyConfig, names: &mut NameSource) -> Result<FunDef> {
    let mut current = fun;
    for pass in 0..config.max_passes {
        let next = sweep_fun(current.clone(), rules, config, names)?;
        if next == current {
            debug!("{}: fixpoint after {} passes", current.name, pass + 1);
            return Ok(next);
        }
        current = next;
    }
    warn!(
        "{}: simplification did not converge within {} passes",
        current.name, config.max_passes
    );
    Ok(current)
}

fn sweep_fun(fun: FunDef, rules: &RuleBook, config: &SimplifyConfig, names: &mut NameSource) -> Result<FunDef> {
    let mut engine = Engine::new(names, rules, config);
    let scope = SymbolTable::new().with_params(&fun.params);
    let (hoisted, body) = engine.simplify_body(&scope, &HoistBlocker::Always, fun.body)?;
    if !hoisted.is_empty() {
        bail_internal!("{}: statements hoisted out of a function body", fun.name);
    }
    Ok(FunDef { body, ..fun })
}
