//! Fresh names and binding builders.
//!
//! Rewrites never invent names by hand: they draw from a `NameSource` that
//! is threaded explicitly through a pass, and they collect the statements
//! they emit in a `Builder` so the emitted sequence can be inspected.

use super::{Exp, Pattern, Stm, SubExp, Type, VName};

/// Monotonic source of unique names.
#[derive(Debug, Clone, Default)]
pub struct NameSource {
    next_tag: u32,
}

impl NameSource {
    pub fn new() -> Self {
        NameSource::default()
    }

    /// Start handing out tags at `tag`. Use this when the input program
    /// already contains names tagged below `tag`.
    pub fn starting_at(tag: u32) -> Self {
        NameSource { next_tag: tag }
    }

    /// Allocate a fresh name with the given base.
    pub fn fresh(&mut self, base: &str) -> VName {
        let v = VName::new(base, self.next_tag);
        self.next_tag += 1;
        v
    }

    /// Allocate a fresh name sharing the base of `v`.
    pub fn fresh_like(&mut self, v: &VName) -> VName {
        let base = v.base.clone();
        self.fresh(&base)
    }
}

/// Collects an ordered sequence of statements.
pub struct Builder<'a> {
    names: &'a mut NameSource,
    stms: Vec<Stm>,
}

impl<'a> Builder<'a> {
    pub fn new(names: &'a mut NameSource) -> Self {
        Builder {
            names,
            stms: Vec::new(),
        }
    }

    pub fn fresh(&mut self, base: &str) -> VName {
        self.names.fresh(base)
    }

    pub fn names(&mut self) -> &mut NameSource {
        &mut *self.names
    }

    pub fn add_stm(&mut self, stm: Stm) {
        self.stms.push(stm);
    }

    /// Bind `exp` to a fresh single-element pattern and return its name.
    pub fn let_exp(&mut self, base: &str, ty: impl Into<Type>, exp: Exp) -> VName {
        let name = self.fresh(base);
        self.stms.push(Stm::new(Pattern::single(name.clone(), ty), exp));
        name
    }

    /// As `let_exp`, returning the name as a sub-expression.
    pub fn let_subexp(&mut self, base: &str, ty: impl Into<Type>, exp: Exp) -> SubExp {
        SubExp::Var(self.let_exp(base, ty, exp))
    }

    pub fn stms(&self) -> &[Stm] {
        &self.stms
    }

    pub fn is_empty(&self) -> bool {
        self.stms.is_empty()
    }

    pub fn into_stms(self) -> Vec<Stm> {
        self.stms
    }
}
