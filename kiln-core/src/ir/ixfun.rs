//! Index functions.
//!
//! An index function maps a logical multi-dimensional index of an array to
//! an element offset in the memory block that holds it. It is a chain of
//! transformations on top of a row-major `Direct` base:
//!
//! ```text
//! slice(permute(iota([n, m, t]), [2, 0, 1]), [fix(tid), 0:n, 0:m])
//! ```
//!
//! Rebasing replaces the `Direct` base at the bottom of the chain while
//! keeping every transformation above it.

use std::collections::HashMap;
use std::fmt;

use super::{NameSet, PrimExp, VName};

/// One dimension of a slice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DimSlice {
    /// Fix the dimension to one index; the dimension disappears.
    Fix(PrimExp),
    /// Keep `len` elements starting at `start` with step `stride`.
    Range {
        start: PrimExp,
        len: PrimExp,
        stride: PrimExp,
    },
}

impl DimSlice {
    /// The whole of a dimension of size `d`.
    pub fn full(d: PrimExp) -> Self {
        DimSlice::Range {
            start: PrimExp::Const(0),
            len: d,
            stride: PrimExp::Const(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IxFun {
    /// Row-major layout of the given shape.
    Direct(Vec<PrimExp>),
    /// Dimension `i` of the result is dimension `perm[i]` of the base.
    Permute(Box<IxFun>, Vec<usize>),
    /// Reinterpret the (row-major) index space with a new shape.
    Reshape(Box<IxFun>, Vec<PrimExp>),
    /// One `DimSlice` per base dimension.
    Slice(Box<IxFun>, Vec<DimSlice>),
}

impl IxFun {
    pub fn iota(shape: Vec<PrimExp>) -> Self {
        IxFun::Direct(shape)
    }

    pub fn permute(self, perm: Vec<usize>) -> Self {
        if perm.iter().enumerate().all(|(i, &p)| i == p) {
            self
        } else {
            IxFun::Permute(Box::new(self), perm)
        }
    }

    pub fn reshape(self, shape: Vec<PrimExp>) -> Self {
        IxFun::Reshape(Box::new(self), shape)
    }

    pub fn slice(self, slice: Vec<DimSlice>) -> Self {
        IxFun::Slice(Box::new(self), slice)
    }

    /// Logical shape of the indexed array.
    pub fn shape(&self) -> Vec<PrimExp> {
        match self {
            IxFun::Direct(shape) => shape.clone(),
            IxFun::Permute(base, perm) => {
                let base_shape = base.shape();
                perm.iter().map(|&p| base_shape[p].clone()).collect()
            }
            IxFun::Reshape(_, shape) => shape.clone(),
            IxFun::Slice(_, slice) => slice
                .iter()
                .filter_map(|ds| match ds {
                    DimSlice::Fix(_) => None,
                    DimSlice::Range { len, .. } => Some(len.clone()),
                })
                .collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    /// Shape of the `Direct` layout at the bottom of the chain.
    pub fn base_shape(&self) -> &[PrimExp] {
        match self {
            IxFun::Direct(shape) => shape,
            IxFun::Permute(base, _) | IxFun::Reshape(base, _) | IxFun::Slice(base, _) => base.base_shape(),
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, IxFun::Direct(_))
    }

    /// Element offset of a logical index, as a symbolic expression.
    ///
    /// `idx` must have one entry per dimension of `shape()`.
    pub fn apply(&self, idx: &[PrimExp]) -> PrimExp {
        match self {
            IxFun::Direct(shape) => row_major_offset(shape, idx),
            IxFun::Permute(base, perm) => {
                let mut base_idx = vec![PrimExp::Const(0); perm.len()];
                for (i, &p) in perm.iter().enumerate() {
                    base_idx[p] = idx[i].clone();
                }
                base.apply(&base_idx)
            }
            IxFun::Reshape(base, shape) => {
                let flat = row_major_offset(shape, idx);
                let base_idx = unflatten(flat, &base.shape());
                base.apply(&base_idx)
            }
            IxFun::Slice(base, slice) => {
                let mut rest = idx.iter();
                let base_idx: Vec<PrimExp> = slice
                    .iter()
                    .map(|ds| match ds {
                        DimSlice::Fix(i) => i.clone(),
                        DimSlice::Range { start, stride, .. } => {
                            let i = rest.next().cloned().unwrap_or(PrimExp::Const(0));
                            start.clone().add(i.mul(stride.clone()))
                        }
                    })
                    .collect();
                base.apply(&base_idx)
            }
        }
    }

    /// Evaluate the element offset of a concrete index.
    pub fn offset(&self, idx: &[i64], env: &HashMap<VName, i64>) -> Option<i64> {
        let idx: Vec<PrimExp> = idx.iter().map(|&i| PrimExp::Const(i)).collect();
        self.apply(&idx).eval(env)
    }

    /// Replace the `Direct` base of this index function with `new_base`.
    ///
    /// `new_base` must have the same logical shape as the replaced base.
    pub fn rebase(&self, new_base: &IxFun) -> IxFun {
        match self {
            IxFun::Direct(_) => new_base.clone(),
            IxFun::Permute(base, perm) => IxFun::Permute(Box::new(base.rebase(new_base)), perm.clone()),
            IxFun::Reshape(base, shape) => IxFun::Reshape(Box::new(base.rebase(new_base)), shape.clone()),
            IxFun::Slice(base, slice) => IxFun::Slice(Box::new(base.rebase(new_base)), slice.clone()),
        }
    }

    pub fn free_vars(&self, acc: &mut NameSet) {
        match self {
            IxFun::Direct(shape) => shape.iter().for_each(|d| d.free_vars(acc)),
            IxFun::Permute(base, _) => base.free_vars(acc),
            IxFun::Reshape(base, shape) => {
                base.free_vars(acc);
                shape.iter().for_each(|d| d.free_vars(acc));
            }
            IxFun::Slice(base, slice) => {
                base.free_vars(acc);
                for ds in slice {
                    match ds {
                        DimSlice::Fix(i) => i.free_vars(acc),
                        DimSlice::Range { start, len, stride } => {
                            start.free_vars(acc);
                            len.free_vars(acc);
                            stride.free_vars(acc);
                        }
                    }
                }
            }
        }
    }
}

fn row_major_offset(shape: &[PrimExp], idx: &[PrimExp]) -> PrimExp {
    let mut dims = shape.iter().zip(idx.iter());
    match dims.next() {
        None => PrimExp::Const(0),
        Some((_, first)) => dims.fold(first.clone(), |acc, (d, i)| acc.mul(d.clone()).add(i.clone())),
    }
}

fn unflatten(flat: PrimExp, shape: &[PrimExp]) -> Vec<PrimExp> {
    if shape.is_empty() {
        return Vec::new();
    }
    let mut idx = Vec::with_capacity(shape.len());
    let mut rest = flat;
    for d in shape[1..].iter().rev() {
        idx.push(rest.clone().rem(d.clone()));
        rest = rest.div(d.clone());
    }
    idx.push(rest);
    idx.reverse();
    idx
}

impl fmt::Display for IxFun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |es: &[PrimExp]| es.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", ");
        match self {
            IxFun::Direct(shape) => write!(f, "iota([{}])", join(shape)),
            IxFun::Permute(base, perm) => write!(f, "permute({}, {:?})", base, perm),
            IxFun::Reshape(base, shape) => write!(f, "reshape({}, [{}])", base, join(shape)),
            IxFun::Slice(base, slice) => {
                let dims: Vec<String> = slice
                    .iter()
                    .map(|ds| match ds {
                        DimSlice::Fix(i) => format!("{}", i),
                        DimSlice::Range { start, len, stride } => format!("{}:+{}*{}", start, len, stride),
                    })
                    .collect();
                write!(f, "slice({}, [{}])", base, dims.join(", "))
            }
        }
    }
}
