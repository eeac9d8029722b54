//! Symbol table for tracking identifier scopes during compilation.
//!
//! Each translation unit owns one table. The table's root scope holds the
//! unit's own declarations; transient sub-scopes (if and loop bodies) are
//! pushed on top of it and shadow outer entries until they are exited.
//! Lookups that miss here continue in the enclosing unit's table, which is
//! the compiler's job.

use rustc_hash::FxHashMap;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// What a symbol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Referenced before any declaration was seen.
    Unknown,
    Constant,
    Variable,
    Function,
    Struct,
    Trait,
    Label,
    Generator,
}

impl SymbolKind {
    /// Whether assignments to a symbol of this kind are allowed.
    pub fn is_assignable(self) -> bool {
        matches!(self, SymbolKind::Unknown | SymbolKind::Variable)
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SymbolKind::Unknown => "unknown",
            SymbolKind::Constant => "constant",
            SymbolKind::Variable => "variable",
            SymbolKind::Function => "function",
            SymbolKind::Struct => "struct",
            SymbolKind::Trait => "trait",
            SymbolKind::Label => "label",
            SymbolKind::Generator => "generator",
        };
        write!(f, "{}", s)
    }
}

/// A symbol representing an identifier in a scope.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: Rc<str>,
    pub kind: SymbolKind,
    /// Sub-scope depth the symbol was created at (0 is the table root).
    pub nested: usize,
    /// Storage id, unique within the owning table.
    pub id: usize,
    /// Set once a declaration for the symbol has been compiled.
    pub declared: bool,
    /// Set when a nested function captures the symbol.
    pub free: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolError {
    #[error("'{name}' already declared as {previous}")]
    Redeclared { name: String, previous: SymbolKind },

    #[error("no sub-scope to exit")]
    NoSubScope,
}

/// Symbol table for one translation unit.
#[derive(Debug)]
pub struct SymbolTable {
    /// All symbols ever created, indexed by id.
    symbols: Vec<Symbol>,
    /// Active scopes, root first. Each maps a name to a symbol id.
    scopes: Vec<FxHashMap<Rc<str>, usize>>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    /// Create a table with an empty root scope.
    pub fn new() -> Self {
        Self {
            symbols: Vec::new(),
            scopes: vec![FxHashMap::default()],
        }
    }

    /// Current sub-scope depth; 0 when only the root scope is active.
    pub fn nesting(&self) -> usize {
        self.scopes.len() - 1
    }

    /// Declare `name` with `kind` in the innermost scope.
    ///
    /// A symbol that exists only as a forward reference is upgraded in
    /// place. Redeclaring a variable as a variable returns the existing
    /// symbol; any other redeclaration in the same scope is an error.
    pub fn insert(&mut self, name: Rc<str>, kind: SymbolKind) -> Result<&Symbol, SymbolError> {
        let nested = self.nesting();
        let scope = self
            .scopes
            .last_mut()
            .ok_or(SymbolError::NoSubScope)?;

        if let Some(&id) = scope.get(&name) {
            let symbol = &mut self.symbols[id];
            if !symbol.declared {
                symbol.kind = kind;
                symbol.declared = true;
            } else if !(symbol.kind == SymbolKind::Variable && kind == SymbolKind::Variable) {
                return Err(SymbolError::Redeclared {
                    name: name.to_string(),
                    previous: symbol.kind,
                });
            }
            return Ok(&self.symbols[id]);
        }

        let id = self.symbols.len();
        scope.insert(name.clone(), id);
        self.symbols.push(Symbol {
            name,
            kind,
            nested,
            id,
            declared: true,
            free: false,
        });
        Ok(&self.symbols[id])
    }

    /// Record a forward reference to `name` in the root scope, returning the
    /// existing root symbol if there is one.
    pub fn reference(&mut self, name: Rc<str>) -> &Symbol {
        if let Some(&id) = self.scopes[0].get(&name) {
            return &self.symbols[id];
        }
        let id = self.symbols.len();
        self.scopes[0].insert(name.clone(), id);
        self.symbols.push(Symbol {
            name,
            kind: SymbolKind::Unknown,
            nested: 0,
            id,
            declared: false,
            free: false,
        });
        &self.symbols[id]
    }

    /// Find `name`, searching sub-scopes innermost first.
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .map(|&id| &self.symbols[id])
    }

    /// Flag a symbol as captured by a nested function.
    pub fn mark_free(&mut self, id: usize) {
        if let Some(symbol) = self.symbols.get_mut(id) {
            symbol.free = true;
        }
    }

    pub fn enter_sub_scope(&mut self) {
        self.scopes.push(FxHashMap::default());
    }

    pub fn exit_sub_scope(&mut self) -> Result<(), SymbolError> {
        if self.scopes.len() <= 1 {
            return Err(SymbolError::NoSubScope);
        }
        self.scopes.pop();
        Ok(())
    }
}
