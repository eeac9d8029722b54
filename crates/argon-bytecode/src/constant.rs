//! Static values referenced by `LoadConst` and the interning pool that
//! deduplicates them across compilation units.

use crate::code::Code;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Constant value in a code object's static table.
#[derive(Debug, Clone)]
pub enum Constant {
    Int(i64),
    Float(f64),
    String(Rc<str>),
    Code(Rc<Code>),
}

impl Constant {
    /// The nested code object, if this constant holds one.
    pub fn as_code(&self) -> Option<&Rc<Code>> {
        match self {
            Constant::Code(code) => Some(code),
            _ => None,
        }
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::Int(a), Constant::Int(b)) => a == b,
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (Constant::String(a), Constant::String(b)) => a == b,
            (Constant::Code(a), Constant::Code(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Int(v) => write!(f, "{}", v),
            Constant::Float(v) => write!(f, "{:?}", v),
            Constant::String(s) => write!(f, "{:?}", s),
            Constant::Code(code) => write!(f, "<code {}>", code.qualname),
        }
    }
}

/// Hashable identity of a dedupable constant. Floats compare by bit pattern
/// so `0.0` and `-0.0` stay distinct and NaN interns to itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstantKey {
    Int(i64),
    Float(u64),
    String(Rc<str>),
}

/// Pool of interned constants and identifier names.
///
/// Identical scalars and strings resolve to the same `Rc`, so two code
/// objects that load the literal `"x"` share one allocation. Code constants
/// are never deduplicated.
#[derive(Debug, Default)]
pub struct Interner {
    statics: FxHashMap<ConstantKey, Rc<Constant>>,
    names: FxHashSet<Rc<str>>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared instance of `value`, inserting it on first use.
    pub fn constant(&mut self, value: Constant) -> Rc<Constant> {
        let key = match &value {
            Constant::Int(v) => ConstantKey::Int(*v),
            Constant::Float(v) => ConstantKey::Float(v.to_bits()),
            Constant::String(s) => ConstantKey::String(s.clone()),
            Constant::Code(_) => return Rc::new(value),
        };
        self.statics
            .entry(key)
            .or_insert_with(|| Rc::new(value))
            .clone()
    }

    pub fn int(&mut self, value: i64) -> Rc<Constant> {
        self.constant(Constant::Int(value))
    }

    pub fn float(&mut self, value: f64) -> Rc<Constant> {
        self.constant(Constant::Float(value))
    }

    pub fn string(&mut self, value: &str) -> Rc<Constant> {
        let key = ConstantKey::String(Rc::from(value));
        if let Some(existing) = self.statics.get(&key) {
            return existing.clone();
        }
        self.constant(Constant::String(Rc::from(value)))
    }

    /// Intern an identifier name.
    pub fn name(&mut self, name: &str) -> Rc<str> {
        if let Some(existing) = self.names.get(name) {
            return existing.clone();
        }
        let interned: Rc<str> = Rc::from(name);
        self.names.insert(interned.clone());
        interned
    }

    #[cfg(test)]
    fn constant_count(&self) -> usize {
        self.statics.len()
    }

    #[cfg(test)]
    fn name_count(&self) -> usize {
        self.names.len()
    }
}

thread_local! {
    static SHARED: SharedInterner = SharedInterner::default();
}

/// Reference-counted handle to an [`Interner`] shared by several compilers.
#[derive(Debug, Clone, Default)]
pub struct SharedInterner(Rc<RefCell<Interner>>);

impl SharedInterner {
    pub fn new(interner: Interner) -> Self {
        Self(Rc::new(RefCell::new(interner)))
    }

    /// The pool shared by every compiler on this thread that was not given
    /// its own.
    pub fn global() -> Self {
        SHARED.with(|shared| shared.clone())
    }

    pub fn constant(&self, value: Constant) -> Rc<Constant> {
        self.0.borrow_mut().constant(value)
    }

    pub fn int(&self, value: i64) -> Rc<Constant> {
        self.0.borrow_mut().int(value)
    }

    pub fn float(&self, value: f64) -> Rc<Constant> {
        self.0.borrow_mut().float(value)
    }

    pub fn string(&self, value: &str) -> Rc<Constant> {
        self.0.borrow_mut().string(value)
    }

    pub fn name(&self, name: &str) -> Rc<str> {
        self.0.borrow_mut().name(name)
    }

    /// Whether both handles point at the same pool.
    pub fn same_pool(&self, other: &SharedInterner) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
