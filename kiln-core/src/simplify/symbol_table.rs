//! Scoped analysis tables consulted by the simplifier and its rules.
//!
//! `SymbolTable` is persistent: extending it returns a new table and leaves
//! the original untouched, so a nested body can be simplified under an
//! extended scope without affecting its parent. Frames are shared through
//! `Rc`, which keeps extension cheap.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::ir::analysis::{consumed_in_exp, free_in};
use crate::ir::{Exp, NameSet, Param, PrimType, Stm, SubExp, Type, VName};

/// Best-effort bounds of a value. For arrays the bounds describe the
/// elements.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Range {
    pub lower: Option<SubExp>,
    pub upper: Option<SubExp>,
}

impl Range {
    pub fn unknown() -> Self {
        Range::default()
    }

    pub fn between(lower: SubExp, upper: SubExp) -> Self {
        Range {
            lower: Some(lower),
            upper: Some(upper),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub ty: Type,
    /// Defining expression, when the name is the only value bound by its
    /// statement.
    pub def: Option<Exp>,
    /// Names whose storage this value may share.
    pub aliases: NameSet,
    pub range: Range,
}

impl Entry {
    pub fn of_type(ty: Type) -> Self {
        Entry {
            ty,
            def: None,
            aliases: NameSet::new(),
            range: Range::unknown(),
        }
    }

    pub fn with_range(mut self, range: Range) -> Self {
        self.range = range;
        self
    }

    pub fn with_aliases(mut self, aliases: NameSet) -> Self {
        self.aliases = aliases;
        self
    }
}

#[derive(Debug)]
struct Frame {
    entries: HashMap<VName, Entry>,
    parent: Option<Rc<Frame>>,
}

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    top: Option<Rc<Frame>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    /// A new table with `entries` in scope on top of this one.
    pub fn extend(&self, entries: impl IntoIterator<Item = (VName, Entry)>) -> Self {
        let entries: HashMap<VName, Entry> = entries.into_iter().collect();
        if entries.is_empty() {
            return self.clone();
        }
        SymbolTable {
            top: Some(Rc::new(Frame {
                entries,
                parent: self.top.clone(),
            })),
        }
    }

    pub fn with_entry(&self, name: VName, entry: Entry) -> Self {
        self.extend(std::iter::once((name, entry)))
    }

    pub fn with_name(&self, name: VName, ty: impl Into<Type>) -> Self {
        self.with_entry(name, Entry::of_type(ty.into()))
    }

    pub fn with_params(&self, params: &[Param]) -> Self {
        self.extend(params.iter().map(|p| (p.name.clone(), Entry::of_type(p.ty.clone()))))
    }

    /// Bring the names bound by `stm` into scope.
    pub fn with_stm(&self, stm: &Stm) -> Self {
        let single = stm.pat.single_name().is_some();
        let aliases = self.exp_aliases(&stm.exp);
        self.extend(stm.pat.elems().map(|pe| {
            let mut entry = Entry::of_type(pe.ty.clone());
            if single {
                entry.def = Some(stm.exp.clone());
                if pe.ty.is_array() {
                    entry.aliases = aliases.clone();
                }
            }
            (pe.name.clone(), entry)
        }))
    }

    /// A loop or thread index ranging over `[0, bound)`.
    pub fn with_index(&self, name: VName, bound: &SubExp) -> Self {
        self.with_entry(
            name,
            Entry::of_type(Type::Prim(PrimType::I64)).with_range(Range::between(SubExp::i64(0), bound.clone())),
        )
    }

    pub fn lookup(&self, name: &VName) -> Option<&Entry> {
        let mut frame = self.top.as_deref();
        while let Some(f) = frame {
            if let Some(entry) = f.entries.get(name) {
                return Some(entry);
            }
            frame = f.parent.as_deref();
        }
        None
    }

    pub fn contains(&self, name: &VName) -> bool {
        self.lookup(name).is_some()
    }

    pub fn lookup_exp(&self, name: &VName) -> Option<&Exp> {
        self.lookup(name).and_then(|e| e.def.as_ref())
    }

    pub fn lookup_type(&self, name: &VName) -> Option<&Type> {
        self.lookup(name).map(|e| &e.ty)
    }

    pub fn aliases(&self, name: &VName) -> NameSet {
        self.lookup(name).map(|e| e.aliases.clone()).unwrap_or_default()
    }

    pub fn range(&self, name: &VName) -> Range {
        self.lookup(name).map(|e| e.range.clone()).unwrap_or_default()
    }

    fn exp_aliases(&self, exp: &Exp) -> NameSet {
        let source = match exp {
            Exp::SubExp(SubExp::Var(v)) => v,
            Exp::Index { arr, .. } | Exp::Reshape { arr, .. } | Exp::Rearrange { arr, .. } => arr,
            _ => return NameSet::new(),
        };
        let mut aliases = self.aliases(source);
        aliases.insert(source.clone());
        aliases
    }
}

/// Which names are referenced (and which consumed) by the statements that
/// follow a given point.
#[derive(Debug, Clone, Default)]
pub struct UsageTable {
    used: HashSet<VName>,
    consumed: HashSet<VName>,
}

impl UsageTable {
    pub fn new() -> Self {
        UsageTable::default()
    }

    /// Usage of a body result list.
    pub fn from_result(result: &[SubExp]) -> Self {
        let mut usage = UsageTable::new();
        usage.used.extend(free_in(result));
        usage
    }

    pub fn is_used(&self, name: &VName) -> bool {
        self.used.contains(name)
    }

    pub fn is_consumed(&self, name: &VName) -> bool {
        self.consumed.contains(name)
    }

    pub fn use_names(&mut self, names: impl IntoIterator<Item = VName>) {
        self.used.extend(names);
    }

    /// Record the uses and consumptions of a statement that precedes the
    /// current point.
    pub fn add_stm(&mut self, stm: &Stm) {
        self.used.extend(free_in(stm));
        self.consumed.extend(consumed_in_exp(&stm.exp));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::NameSource;

    #[test]
    fn test_extension_does_not_affect_parent() {
        let mut names = NameSource::new();
        let x = names.fresh("x");
        let y = names.fresh("y");
        let outer = SymbolTable::new().with_name(x.clone(), PrimType::I64);
        let inner = outer.with_name(y.clone(), PrimType::I64);
        assert!(inner.contains(&x));
        assert!(inner.contains(&y));
        assert!(!outer.contains(&y));
    }

    #[test]
    fn test_index_records_alias() {
        let mut names = NameSource::new();
        let arr = names.fresh("arr");
        let row = names.fresh("row");
        let n = SubExp::i64(4);
        let table = SymbolTable::new().with_name(arr.clone(), Type::array(PrimType::F32, vec![n.clone(), n.clone()]));
        let stm = Stm::single(
            row.clone(),
            Type::array(PrimType::F32, vec![n]),
            Exp::Index {
                arr: arr.clone(),
                indices: vec![SubExp::i64(0)],
            },
        );
        let table = table.with_stm(&stm);
        assert!(table.aliases(&row).contains(&arr));
        assert!(matches!(table.lookup_exp(&row), Some(Exp::Index { .. })));
    }

    #[test]
    fn test_usage_tracks_consumption() {
        let mut names = NameSource::new();
        let arr = names.fresh("arr");
        let out = names.fresh("out");
        let stm = Stm::single(
            out,
            Type::array(PrimType::I64, vec![SubExp::i64(3)]),
            Exp::Update {
                arr: arr.clone(),
                indices: vec![SubExp::i64(0)],
                value: SubExp::i64(7),
            },
        );
        let mut usage = UsageTable::new();
        usage.add_stm(&stm);
        assert!(usage.is_used(&arr));
        assert!(usage.is_consumed(&arr));
    }
}
