//! Symbolic index arithmetic.
//!
//! Index functions are built from `PrimExp`s so that rebase chains stay
//! inspectable. The smart constructors fold constants the same way symbolic
//! sizes do, which keeps the common `0 + x` / `1 * x` noise out of rebased
//! index functions.

use std::collections::HashMap;
use std::fmt;

use super::{NameSet, SubExp, VName};

/// An i64 expression over variables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PrimExp {
    Const(i64),
    Var(VName),
    Add(Box<PrimExp>, Box<PrimExp>),
    Sub(Box<PrimExp>, Box<PrimExp>),
    Mul(Box<PrimExp>, Box<PrimExp>),
    /// Floor division.
    Div(Box<PrimExp>, Box<PrimExp>),
    /// Euclidean remainder.
    Mod(Box<PrimExp>, Box<PrimExp>),
}

impl PrimExp {
    pub fn constant(n: i64) -> Self {
        PrimExp::Const(n)
    }

    pub fn var(v: &VName) -> Self {
        PrimExp::Var(v.clone())
    }

    /// Convert an integral sub-expression. Non-integral constants have no
    /// index interpretation.
    pub fn from_subexp(se: &SubExp) -> Option<Self> {
        match se {
            SubExp::Var(v) => Some(PrimExp::Var(v.clone())),
            SubExp::Const(c) => c.as_i64().map(PrimExp::Const),
        }
    }

    pub fn as_const(&self) -> Option<i64> {
        match self {
            PrimExp::Const(n) => Some(*n),
            _ => None,
        }
    }

    pub fn add(self, other: PrimExp) -> Self {
        match (&self, &other) {
            (PrimExp::Const(a), PrimExp::Const(b)) => PrimExp::Const(a.wrapping_add(*b)),
            (PrimExp::Const(0), _) => other,
            (_, PrimExp::Const(0)) => self,
            _ => PrimExp::Add(Box::new(self), Box::new(other)),
        }
    }

    pub fn sub(self, other: PrimExp) -> Self {
        match (&self, &other) {
            (PrimExp::Const(a), PrimExp::Const(b)) => PrimExp::Const(a.wrapping_sub(*b)),
            (_, PrimExp::Const(0)) => self,
            _ => PrimExp::Sub(Box::new(self), Box::new(other)),
        }
    }

    pub fn mul(self, other: PrimExp) -> Self {
        match (&self, &other) {
            (PrimExp::Const(a), PrimExp::Const(b)) => PrimExp::Const(a.wrapping_mul(*b)),
            (PrimExp::Const(0), _) | (_, PrimExp::Const(0)) => PrimExp::Const(0),
            (PrimExp::Const(1), _) => other,
            (_, PrimExp::Const(1)) => self,
            _ => PrimExp::Mul(Box::new(self), Box::new(other)),
        }
    }

    pub fn div(self, other: PrimExp) -> Self {
        match (&self, &other) {
            (PrimExp::Const(a), PrimExp::Const(b)) if *b != 0 => PrimExp::Const(a.div_euclid(*b)),
            (_, PrimExp::Const(1)) => self,
            _ => PrimExp::Div(Box::new(self), Box::new(other)),
        }
    }

    pub fn rem(self, other: PrimExp) -> Self {
        match (&self, &other) {
            (PrimExp::Const(a), PrimExp::Const(b)) if *b != 0 => PrimExp::Const(a.rem_euclid(*b)),
            (_, PrimExp::Const(1)) => PrimExp::Const(0),
            _ => PrimExp::Mod(Box::new(self), Box::new(other)),
        }
    }

    /// Product of a list of factors; the empty product is 1.
    pub fn product<'a>(factors: impl IntoIterator<Item = &'a PrimExp>) -> Self {
        factors
            .into_iter()
            .fold(PrimExp::Const(1), |acc, f| acc.mul(f.clone()))
    }

    /// Evaluate under an environment. Returns `None` on unbound variables,
    /// overflow, or division by zero.
    pub fn eval(&self, env: &HashMap<VName, i64>) -> Option<i64> {
        match self {
            PrimExp::Const(n) => Some(*n),
            PrimExp::Var(v) => env.get(v).copied(),
            PrimExp::Add(a, b) => a.eval(env)?.checked_add(b.eval(env)?),
            PrimExp::Sub(a, b) => a.eval(env)?.checked_sub(b.eval(env)?),
            PrimExp::Mul(a, b) => a.eval(env)?.checked_mul(b.eval(env)?),
            PrimExp::Div(a, b) => {
                let d = b.eval(env)?;
                if d == 0 { None } else { a.eval(env)?.checked_div_euclid(d) }
            }
            PrimExp::Mod(a, b) => {
                let d = b.eval(env)?;
                if d == 0 { None } else { a.eval(env)?.checked_rem_euclid(d) }
            }
        }
    }

    pub fn free_vars(&self, acc: &mut NameSet) {
        match self {
            PrimExp::Const(_) => {}
            PrimExp::Var(v) => {
                acc.insert(v.clone());
            }
            PrimExp::Add(a, b)
            | PrimExp::Sub(a, b)
            | PrimExp::Mul(a, b)
            | PrimExp::Div(a, b)
            | PrimExp::Mod(a, b) => {
                a.free_vars(acc);
                b.free_vars(acc);
            }
        }
    }
}

impl fmt::Display for PrimExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimExp::Const(n) => write!(f, "{}", n),
            PrimExp::Var(v) => write!(f, "{}", v),
            PrimExp::Add(a, b) => write!(f, "({} + {})", a, b),
            PrimExp::Sub(a, b) => write!(f, "({} - {})", a, b),
            PrimExp::Mul(a, b) => write!(f, "({} * {})", a, b),
            PrimExp::Div(a, b) => write!(f, "({} / {})", a, b),
            PrimExp::Mod(a, b) => write!(f, "({} % {})", a, b),
        }
    }
}
