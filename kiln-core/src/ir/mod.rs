//! Kernel IR
//!
//! A first-order, ANF-style IR for the parallel middle end. A function body
//! is a sequence of let-bindings (`Stm`) followed by a result list. Kernel
//! operations (`KernelOp`) embed per-thread bodies or lambdas that are
//! executed once per logical thread.
//!
//! Key properties:
//! - Names (`VName`) are globally unique within a compilation unit
//! - Statements are in def-before-use order
//! - Array-typed bindings may carry a memory annotation (`MemBind`) that
//!   places them in an allocation through an index function

pub mod analysis;
pub mod builder;
pub mod ixfun;
pub mod kernel;
pub mod primexp;

use std::fmt;

use indexmap::IndexSet;

pub use builder::{Builder, NameSource};
pub use ixfun::{DimSlice, IxFun};
pub use kernel::{
    ChunkedMapKernel, Kernel, KernelBody, KernelInput, KernelOp, KernelResult, KernelSize, KernelSpace,
    KernelStm, MapKernel, ScanKernel, StreamOrd, WhichThreads, WriteKernel,
};
pub use primexp::PrimExp;

/// Deterministically ordered set of names.
pub type NameSet = IndexSet<VName>;

// =============================================================================
// Names
// =============================================================================

/// A variable name: a human-readable base plus a tag that makes it unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VName {
    pub base: String,
    pub tag: u32,
}

impl VName {
    pub fn new(base: impl Into<String>, tag: u32) -> Self {
        VName {
            base: base.into(),
            tag,
        }
    }
}

impl fmt::Display for VName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.base, self.tag)
    }
}

// =============================================================================
// Primitive types and values
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimType {
    Bool,
    I32,
    I64,
    F32,
    F64,
}

impl PrimType {
    /// Size of one element in bytes.
    pub fn byte_size(self) -> i64 {
        match self {
            PrimType::Bool => 1,
            PrimType::I32 | PrimType::F32 => 4,
            PrimType::I64 | PrimType::F64 => 8,
        }
    }

    pub fn is_integral(self) -> bool {
        matches!(self, PrimType::I32 | PrimType::I64)
    }
}

impl fmt::Display for PrimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimType::Bool => write!(f, "bool"),
            PrimType::I32 => write!(f, "i32"),
            PrimType::I64 => write!(f, "i64"),
            PrimType::F32 => write!(f, "f32"),
            PrimType::F64 => write!(f, "f64"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrimValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl PrimValue {
    pub fn prim_type(&self) -> PrimType {
        match self {
            PrimValue::Bool(_) => PrimType::Bool,
            PrimValue::I32(_) => PrimType::I32,
            PrimValue::I64(_) => PrimType::I64,
            PrimValue::F32(_) => PrimType::F32,
            PrimValue::F64(_) => PrimType::F64,
        }
    }

    /// Integral value widened to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PrimValue::I32(n) => Some(*n as i64),
            PrimValue::I64(n) => Some(*n),
            _ => None,
        }
    }

    /// The zero value of a primitive type; used for blank per-thread results.
    pub fn blank(ty: PrimType) -> Self {
        match ty {
            PrimType::Bool => PrimValue::Bool(false),
            PrimType::I32 => PrimValue::I32(0),
            PrimType::I64 => PrimValue::I64(0),
            PrimType::F32 => PrimValue::F32(0.0),
            PrimType::F64 => PrimValue::F64(0.0),
        }
    }
}

impl fmt::Display for PrimValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimValue::Bool(b) => write!(f, "{}", b),
            PrimValue::I32(n) => write!(f, "{}i32", n),
            PrimValue::I64(n) => write!(f, "{}i64", n),
            PrimValue::F32(x) => write!(f, "{}f32", x),
            PrimValue::F64(x) => write!(f, "{}f64", x),
        }
    }
}

/// An atomic operand: a constant or a variable.
#[derive(Debug, Clone, PartialEq)]
pub enum SubExp {
    Const(PrimValue),
    Var(VName),
}

impl SubExp {
    pub fn i64(n: i64) -> Self {
        SubExp::Const(PrimValue::I64(n))
    }

    pub fn var(v: &VName) -> Self {
        SubExp::Var(v.clone())
    }

    pub fn as_var(&self) -> Option<&VName> {
        match self {
            SubExp::Var(v) => Some(v),
            SubExp::Const(_) => None,
        }
    }

    pub fn as_const(&self) -> Option<&PrimValue> {
        match self {
            SubExp::Const(c) => Some(c),
            SubExp::Var(_) => None,
        }
    }

    /// Constant integral value, if this is one.
    pub fn as_i64(&self) -> Option<i64> {
        self.as_const().and_then(|c| c.as_i64())
    }
}

impl fmt::Display for SubExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubExp::Const(c) => write!(f, "{}", c),
            SubExp::Var(v) => write!(f, "{}", v),
        }
    }
}

// =============================================================================
// Types
// =============================================================================

/// Address space of a memory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    Default,
    Local,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Prim(PrimType),
    Array {
        elem: PrimType,
        shape: Vec<SubExp>,
        unique: bool,
    },
    /// A memory block of `size` bytes.
    Mem {
        size: SubExp,
        space: Space,
    },
}

impl Type {
    pub fn array(elem: PrimType, shape: Vec<SubExp>) -> Self {
        if shape.is_empty() {
            Type::Prim(elem)
        } else {
            Type::Array {
                elem,
                shape,
                unique: false,
            }
        }
    }

    pub fn mem(size: SubExp, space: Space) -> Self {
        Type::Mem { size, space }
    }

    pub fn shape(&self) -> &[SubExp] {
        match self {
            Type::Array { shape, .. } => shape,
            _ => &[],
        }
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    pub fn elem_type(&self) -> Option<PrimType> {
        match self {
            Type::Prim(p) => Some(*p),
            Type::Array { elem, .. } => Some(*elem),
            Type::Mem { .. } => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array { .. })
    }

    pub fn is_mem(&self) -> bool {
        matches!(self, Type::Mem { .. })
    }

    pub fn is_unique(&self) -> bool {
        matches!(self, Type::Array { unique: true, .. })
    }

    pub fn with_unique(self, unique: bool) -> Self {
        match self {
            Type::Array { elem, shape, .. } => Type::Array { elem, shape, unique },
            other => other,
        }
    }

    /// Prepend outer dimensions. Memory types are returned unchanged.
    pub fn array_of(&self, outer: &[SubExp]) -> Type {
        match self {
            Type::Prim(p) => Type::array(*p, outer.to_vec()),
            Type::Array { elem, shape, unique } => {
                let mut new_shape = outer.to_vec();
                new_shape.extend(shape.iter().cloned());
                Type::Array {
                    elem: *elem,
                    shape: new_shape,
                    unique: *unique,
                }
            }
            Type::Mem { .. } => self.clone(),
        }
    }

    /// Strip the `n` outermost dimensions.
    pub fn strip_dims(&self, n: usize) -> Type {
        match self {
            Type::Array { elem, shape, unique } => {
                if n >= shape.len() {
                    Type::Prim(*elem)
                } else {
                    Type::Array {
                        elem: *elem,
                        shape: shape[n..].to_vec(),
                        unique: *unique,
                    }
                }
            }
            other => other.clone(),
        }
    }

    pub fn row_type(&self) -> Type {
        self.strip_dims(1)
    }
}

impl From<PrimType> for Type {
    fn from(p: PrimType) -> Self {
        Type::Prim(p)
    }
}

// =============================================================================
// Bindings
// =============================================================================

/// Placement of an array in a memory block.
#[derive(Debug, Clone, PartialEq)]
pub struct MemBind {
    pub mem: VName,
    pub ixfun: IxFun,
}

/// A function, lambda, loop or kernel parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: VName,
    pub ty: Type,
    pub mem: Option<MemBind>,
}

impl Param {
    pub fn new(name: VName, ty: impl Into<Type>) -> Self {
        Param {
            name,
            ty: ty.into(),
            mem: None,
        }
    }

    pub fn in_mem(mut self, mem: VName, ixfun: IxFun) -> Self {
        self.mem = Some(MemBind { mem, ixfun });
        self
    }
}

/// A single element of a binding pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct PatElem {
    pub name: VName,
    pub ty: Type,
    pub mem: Option<MemBind>,
}

impl PatElem {
    pub fn new(name: VName, ty: impl Into<Type>) -> Self {
        PatElem {
            name,
            ty: ty.into(),
            mem: None,
        }
    }

    pub fn in_mem(mut self, mem: VName, ixfun: IxFun) -> Self {
        self.mem = Some(MemBind { mem, ixfun });
        self
    }
}

/// A binding pattern. Context elements are existential sizes or memory
/// blocks that the value elements depend on.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pattern {
    pub context: Vec<PatElem>,
    pub values: Vec<PatElem>,
}

impl Pattern {
    pub fn new(values: Vec<PatElem>) -> Self {
        Pattern {
            context: Vec::new(),
            values,
        }
    }

    pub fn single(name: VName, ty: impl Into<Type>) -> Self {
        Pattern::new(vec![PatElem::new(name, ty)])
    }

    /// All elements, context first.
    pub fn elems(&self) -> impl Iterator<Item = &PatElem> {
        self.context.iter().chain(self.values.iter())
    }

    pub fn names(&self) -> impl Iterator<Item = &VName> {
        self.elems().map(|pe| &pe.name)
    }

    pub fn value_names(&self) -> Vec<VName> {
        self.values.iter().map(|pe| pe.name.clone()).collect()
    }

    /// The single bound name, if this pattern binds exactly one value.
    pub fn single_name(&self) -> Option<&VName> {
        if self.context.is_empty() && self.values.len() == 1 {
            Some(&self.values[0].name)
        } else {
            None
        }
    }
}

/// Certificates: names of proofs the computation depends on.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Certs(pub Vec<VName>);

impl Certs {
    pub fn none() -> Self {
        Certs(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A statement: binds a pattern to the result of an expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Stm {
    pub pat: Pattern,
    pub certs: Certs,
    pub exp: Exp,
}

impl Stm {
    pub fn new(pat: Pattern, exp: Exp) -> Self {
        Stm {
            pat,
            certs: Certs::none(),
            exp,
        }
    }

    pub fn single(name: VName, ty: impl Into<Type>, exp: Exp) -> Self {
        Stm::new(Pattern::single(name, ty), exp)
    }
}

/// A sequence of statements producing result values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Body {
    pub stms: Vec<Stm>,
    pub result: Vec<SubExp>,
}

impl Body {
    pub fn new(stms: Vec<Stm>, result: Vec<SubExp>) -> Self {
        Body { stms, result }
    }

    /// A body with no statements.
    pub fn just(result: Vec<SubExp>) -> Self {
        Body {
            stms: Vec::new(),
            result,
        }
    }
}

/// An anonymous function embedded in a kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub params: Vec<Param>,
    pub body: Body,
    pub ret: Vec<Type>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunDef {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Vec<Type>,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Prog {
    pub funs: Vec<FunDef>,
}

// =============================================================================
// Expressions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Exp {
    SubExp(SubExp),
    BinOp {
        op: BinOp,
        x: SubExp,
        y: SubExp,
    },
    CmpOp {
        op: CmpOp,
        x: SubExp,
        y: SubExp,
    },
    /// Index a prefix of the dimensions of `arr`.
    Index {
        arr: VName,
        indices: Vec<SubExp>,
    },
    /// In-place update; consumes `arr`.
    Update {
        arr: VName,
        indices: Vec<SubExp>,
        value: SubExp,
    },
    /// `[start, start+stride, ..., start+(n-1)*stride]` of type `[n]i64`.
    Iota {
        n: SubExp,
        start: SubExp,
        stride: SubExp,
    },
    Replicate {
        shape: Vec<SubExp>,
        value: SubExp,
    },
    Reshape {
        shape: Vec<SubExp>,
        arr: VName,
    },
    Rearrange {
        perm: Vec<usize>,
        arr: VName,
    },
    Copy(VName),
    /// Allocate `size` bytes in `space`.
    Alloc {
        size: SubExp,
        space: Space,
    },
    If {
        cond: SubExp,
        then_body: Body,
        else_body: Body,
        ret: Vec<Type>,
    },
    /// `loop (ctx_merge, val_merge) for index < bound do body`.
    ///
    /// The body result lists the new context values followed by the new
    /// value-merge values.
    DoLoop {
        ctx_merge: Vec<(Param, SubExp)>,
        val_merge: Vec<(Param, SubExp)>,
        index: VName,
        bound: SubExp,
        body: Body,
    },
    Op(KernelOp),
}

impl Exp {
    /// True if evaluating this expression can never fail, so it may be moved
    /// to a scope where it is evaluated speculatively.
    pub fn is_safe(&self) -> bool {
        match self {
            Exp::SubExp(_) | Exp::CmpOp { .. } => true,
            Exp::BinOp { op, .. } => !matches!(op, BinOp::Div | BinOp::Mod),
            Exp::Iota { .. } | Exp::Replicate { .. } | Exp::Rearrange { .. } | Exp::Copy(_) => true,
            Exp::Index { .. }
            | Exp::Update { .. }
            | Exp::Reshape { .. }
            | Exp::Alloc { .. }
            | Exp::If { .. }
            | Exp::DoLoop { .. }
            | Exp::Op(_) => false,
        }
    }

    pub fn is_kernel(&self) -> bool {
        matches!(self, Exp::Op(_))
    }
}
