pub mod error;
pub mod eval;
pub mod expand_allocations;
pub mod ir;
pub mod simplify;

#[cfg(test)]
mod expand_allocations_tests;
#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod test_support;

use error::Result;
use expand_allocations::{AllocationDiagnostic, ExpandConfig};
use ir::{NameSource, Prog};
use simplify::SimplifyConfig;

// =============================================================================
// Pipeline
// =============================================================================
//
// The passes run in a fixed order. Each stage owns the program and the name
// source, so fresh names stay unique across passes.

/// Entry point for the kernel passes. Use `Pipeline::new()` to start.
pub struct Pipeline {
    pub prog: Prog,
    pub names: NameSource,
}

impl Pipeline {
    /// `names` must not hand out tags already used in `prog`.
    pub fn new(prog: Prog, names: NameSource) -> Self {
        Pipeline { prog, names }
    }

    /// Simplify every function to a fixpoint.
    pub fn simplify(mut self, config: &SimplifyConfig) -> Result<Simplified> {
        let prog = simplify::simplify_prog(self.prog, config, &mut self.names)?;
        Ok(Simplified {
            prog,
            names: self.names,
        })
    }
}

/// Program has been simplified
pub struct Simplified {
    pub prog: Prog,
    pub names: NameSource,
}

impl Simplified {
    /// Move per-thread allocations out of kernels.
    pub fn expand_allocations(mut self, config: &ExpandConfig) -> Result<Expanded> {
        let expansion = expand_allocations::expand_prog(self.prog, config, &mut self.names)?;
        Ok(Expanded {
            prog: expansion.prog,
            diagnostics: expansion.diagnostics,
            names: self.names,
        })
    }
}

/// Allocations have been expanded out of kernels
pub struct Expanded {
    pub prog: Prog,
    /// Allocations left inside kernels because their size varies per thread.
    pub diagnostics: Vec<AllocationDiagnostic>,
    pub names: NameSource,
}

impl Expanded {
    pub fn has_diagnostics(&self) -> bool {
        !self.diagnostics.is_empty()
    }
}
