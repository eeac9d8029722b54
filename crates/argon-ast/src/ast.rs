//! AST node types for Argon programs.
//!
//! The tree is produced by the parser and is read-only for the compiler.
//! Dispatch is over closed enums so every consumer matches exhaustively.

use crate::token::{Position, TokenKind};
use std::fmt;
use std::rc::Rc;

/// Base trait for all AST nodes.
pub trait Node {
    fn pos(&self) -> Position;
}

/// A parsed source module.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub name: String,
    pub stmts: Vec<Stmt>,
}

// ============================================================================
// Expressions
// ============================================================================

/// Expression node enumeration.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Nil(Position),
    Bool(BoolLit),
    Int(IntLit),
    Float(FloatLit),
    String(StringLit),
    Ident(Ident),
    Unary(Box<UnaryExpr>),
    Binary(Box<BinaryExpr>),
    Ternary(Box<TernaryExpr>),
    Selector(Box<Selector>),
    Index(Box<IndexExpr>),
    Slice(Box<SliceExpr>),
    Call(Box<CallExpr>),
    Spread(Box<SpreadExpr>),
    List(SequenceLit),
    Tuple(SequenceLit),
    Set(SequenceLit),
    Map(MapLit),
    Func(Rc<FuncDecl>),
    Init(Box<InitExpr>),
    Yield(Box<YieldExpr>),
}

impl Expr {
    /// Short node-kind name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Expr::Nil(_) => "nil",
            Expr::Bool(_) => "bool literal",
            Expr::Int(_) => "int literal",
            Expr::Float(_) => "float literal",
            Expr::String(_) => "string literal",
            Expr::Ident(_) => "identifier",
            Expr::Unary(_) => "unary expression",
            Expr::Binary(_) => "binary expression",
            Expr::Ternary(_) => "ternary expression",
            Expr::Selector(_) => "selector",
            Expr::Index(_) => "index expression",
            Expr::Slice(_) => "slice expression",
            Expr::Call(_) => "call",
            Expr::Spread(_) => "spread expression",
            Expr::List(_) => "list literal",
            Expr::Tuple(_) => "tuple literal",
            Expr::Set(_) => "set literal",
            Expr::Map(_) => "map literal",
            Expr::Func(_) => "function literal",
            Expr::Init(_) => "initializer",
            Expr::Yield(_) => "yield expression",
        }
    }
}

impl Node for Expr {
    fn pos(&self) -> Position {
        match self {
            Expr::Nil(pos) => *pos,
            Expr::Bool(e) => e.position,
            Expr::Int(e) => e.position,
            Expr::Float(e) => e.position,
            Expr::String(e) => e.position,
            Expr::Ident(e) => e.position,
            Expr::Unary(e) => e.position,
            Expr::Binary(e) => e.left.pos(),
            Expr::Ternary(e) => e.cond.pos(),
            Expr::Selector(e) => e.left.pos(),
            Expr::Index(e) => e.object.pos(),
            Expr::Slice(e) => e.object.pos(),
            Expr::Call(e) => e.callee.pos(),
            Expr::Spread(e) => e.position,
            Expr::List(e) | Expr::Tuple(e) | Expr::Set(e) => e.position,
            Expr::Map(e) => e.position,
            Expr::Func(e) => e.position,
            Expr::Init(e) => e.target.pos(),
            Expr::Yield(e) => e.position,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Nil(_) => write!(f, "nil"),
            Expr::Bool(e) => write!(f, "{}", e.value),
            Expr::Int(e) => write!(f, "{}", e.value),
            Expr::Float(e) => write!(f, "{}", e.value),
            Expr::String(e) => write!(f, "{:?}", e.value),
            Expr::Ident(e) => write!(f, "{}", e.name),
            Expr::Unary(e) => write!(f, "({}{})", e.op, e.operand),
            Expr::Binary(e) => write!(f, "({} {} {})", e.left, e.op, e.right),
            Expr::Ternary(e) => write!(f, "({} ? {} : {})", e.cond, e.then, e.otherwise),
            Expr::Selector(e) => write!(f, "{}{}{}", e.left, e.kind, e.name.name),
            Expr::Index(e) => write!(f, "{}[{}]", e.object, e.index),
            Expr::Slice(e) => {
                write!(f, "{}[", e.object)?;
                if let Some(low) = &e.low {
                    write!(f, "{}", low)?;
                }
                write!(f, ":")?;
                if let Some(high) = &e.high {
                    write!(f, "{}", high)?;
                }
                if let Some(step) = &e.step {
                    write!(f, ":{}", step)?;
                }
                write!(f, "]")
            }
            Expr::Call(e) => {
                let mut args: Vec<String> = e.args.iter().map(|a| a.to_string()).collect();
                args.extend(e.kwargs.iter().map(|k| format!("{}={}", k.name.name, k.value)));
                write!(f, "{}({})", e.callee, args.join(", "))
            }
            Expr::Spread(e) => write!(f, "...{}", e.value),
            Expr::List(e) => write!(f, "[{}]", join(&e.items)),
            Expr::Tuple(e) => write!(f, "({})", join(&e.items)),
            Expr::Set(e) => write!(f, "{{{}}}", join(&e.items)),
            Expr::Map(e) => {
                let pairs: Vec<String> = e
                    .entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v))
                    .collect();
                write!(f, "{{{}}}", pairs.join(", "))
            }
            Expr::Func(e) => match &e.name {
                Some(name) => write!(f, "func {}(...)", name.name),
                None => write!(f, "func(...)"),
            },
            Expr::Init(e) => write!(f, "{}{{...}}", e.target),
            Expr::Yield(e) => match &e.value {
                Some(v) => write!(f, "yield {}", v),
                None => write!(f, "yield"),
            },
        }
    }
}

fn join(items: &[Expr]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoolLit {
    pub position: Position,
    pub value: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntLit {
    pub position: Position,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FloatLit {
    pub position: Position,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringLit {
    pub position: Position,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub position: Position,
    pub name: String,
}

impl Ident {
    /// Whether this is the blank identifier `_`.
    pub fn is_blank(&self) -> bool {
        self.name == "_"
    }
}

impl Node for Ident {
    fn pos(&self) -> Position {
        self.position
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnaryExpr {
    pub position: Position,
    pub op: TokenKind,
    pub operand: Expr,
}

/// Binary operation. Covers arithmetic, comparison and the short-circuit
/// operators (`&&`, `||`, `?:`, `??`).
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub left: Expr,
    pub op: TokenKind,
    pub op_pos: Position,
    pub right: Expr,
}

/// `cond ? then : otherwise`
#[derive(Debug, Clone, PartialEq)]
pub struct TernaryExpr {
    pub cond: Expr,
    pub then: Expr,
    pub otherwise: Expr,
}

/// How a selector reaches its member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorKind {
    /// `a.b`
    Dot,
    /// `a::b`
    Scope,
    /// `a?.b`
    SafeDot,
}

impl fmt::Display for SelectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorKind::Dot => write!(f, "."),
            SelectorKind::Scope => write!(f, "::"),
            SelectorKind::SafeDot => write!(f, "?."),
        }
    }
}

/// Member access. Chains are left-recursive: `a.b.c` is `(a.b).c`.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    pub left: Expr,
    pub kind: SelectorKind,
    pub name: Ident,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexExpr {
    pub object: Expr,
    pub index: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SliceExpr {
    pub object: Expr,
    pub low: Option<Expr>,
    pub high: Option<Expr>,
    pub step: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeywordArg {
    pub name: Ident,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    pub callee: Expr,
    pub args: Vec<Expr>,
    pub kwargs: Vec<KeywordArg>,
}

/// `...value`, valid as a call argument or list item.
#[derive(Debug, Clone, PartialEq)]
pub struct SpreadExpr {
    pub position: Position,
    pub value: Expr,
}

/// List, tuple or set literal.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceLit {
    pub position: Position,
    pub items: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapLit {
    pub position: Position,
    pub entries: Vec<(Expr, Expr)>,
}

/// Function declaration or literal.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncDecl {
    pub position: Position,
    pub name: Option<Ident>,
    pub params: Vec<Ident>,
    /// `...rest` collects surplus positional arguments.
    pub rest: Option<Ident>,
    /// `&kwargs` collects keyword arguments.
    pub kwargs: Option<Ident>,
    pub body: Block,
    pub public: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitField {
    pub name: Option<Ident>,
    pub value: Expr,
}

/// Struct initialisation: `Point{1, 2}` or `Point{x: 1, y: 2}`.
#[derive(Debug, Clone, PartialEq)]
pub struct InitExpr {
    pub target: Expr,
    pub fields: Vec<InitField>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct YieldExpr {
    pub position: Position,
    pub value: Option<Expr>,
}

// ============================================================================
// Statements
// ============================================================================

/// Statement node enumeration.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Var(VarDecl),
    Assign(AssignStmt),
    Func(Rc<FuncDecl>),
    Struct(TypeDecl),
    Trait(TypeDecl),
    Block(Block),
    If(IfStmt),
    Loop(LoopStmt),
    For(ForStmt),
    ForEach(ForEachStmt),
    Switch(SwitchStmt),
    Labeled(LabeledStmt),
    Break(BranchStmt),
    Continue(BranchStmt),
    Fallthrough(Position),
    Return(ReturnStmt),
    Defer(DeferStmt),
    Spawn(DeferStmt),
    Panic(PanicStmt),
}

impl Stmt {
    /// Short node-kind name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Stmt::Expr(_) => "expression",
            Stmt::Var(d) if d.constant => "let",
            Stmt::Var(_) => "var",
            Stmt::Assign(_) => "assignment",
            Stmt::Func(_) => "func",
            Stmt::Struct(_) => "struct",
            Stmt::Trait(_) => "trait",
            Stmt::Block(_) => "block",
            Stmt::If(_) => "if",
            Stmt::Loop(_) => "loop",
            Stmt::For(_) | Stmt::ForEach(_) => "for",
            Stmt::Switch(_) => "switch",
            Stmt::Labeled(_) => "labeled",
            Stmt::Break(_) => "break",
            Stmt::Continue(_) => "continue",
            Stmt::Fallthrough(_) => "fallthrough",
            Stmt::Return(_) => "return",
            Stmt::Defer(_) => "defer",
            Stmt::Spawn(_) => "spawn",
            Stmt::Panic(_) => "panic",
        }
    }
}

impl Node for Stmt {
    fn pos(&self) -> Position {
        match self {
            Stmt::Expr(e) => e.pos(),
            Stmt::Var(s) => s.position,
            Stmt::Assign(s) => s.position,
            Stmt::Func(s) => s.position,
            Stmt::Struct(s) | Stmt::Trait(s) => s.position,
            Stmt::Block(s) => s.position,
            Stmt::If(s) => s.position,
            Stmt::Loop(s) => s.position,
            Stmt::For(s) => s.position,
            Stmt::ForEach(s) => s.position,
            Stmt::Switch(s) => s.position,
            Stmt::Labeled(s) => s.label.position,
            Stmt::Break(s) | Stmt::Continue(s) => s.position,
            Stmt::Fallthrough(pos) => *pos,
            Stmt::Return(s) => s.position,
            Stmt::Defer(s) | Stmt::Spawn(s) => s.position,
            Stmt::Panic(s) => s.position,
        }
    }
}

/// `var a = 1`, `let b = 2`, `pub var a, b = pair`.
#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub position: Position,
    pub constant: bool,
    pub public: bool,
    pub names: Vec<Ident>,
    pub value: Option<Expr>,
}

/// `target op value`; more than one target unpacks the value.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignStmt {
    pub position: Position,
    pub targets: Vec<Expr>,
    pub op: TokenKind,
    pub value: Expr,
}

/// `struct` or `trait` declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDecl {
    pub position: Position,
    pub name: Ident,
    pub impls: Vec<Expr>,
    pub body: Vec<Stmt>,
    pub public: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub position: Position,
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfStmt {
    pub position: Position,
    pub cond: Expr,
    pub then: Block,
    /// Either another `If` (elif) or a `Block` (else).
    pub orelse: Option<Box<Stmt>>,
}

/// `loop { }` or `loop cond { }`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopStmt {
    pub position: Position,
    pub cond: Option<Expr>,
    pub body: Block,
}

/// `for init; cond; post { }`.
#[derive(Debug, Clone, PartialEq)]
pub struct ForStmt {
    pub position: Position,
    pub init: Option<Box<Stmt>>,
    pub cond: Option<Expr>,
    pub post: Option<Box<Stmt>>,
    pub body: Block,
}

/// `for a, b in iterable { }`.
#[derive(Debug, Clone, PartialEq)]
pub struct ForEachStmt {
    pub position: Position,
    pub targets: Vec<Ident>,
    pub iter: Expr,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchStmt {
    pub position: Position,
    pub tag: Option<Expr>,
    pub cases: Vec<SwitchCase>,
}

/// One `case` arm. No conditions marks the `default` arm.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    pub position: Position,
    pub conditions: Vec<Expr>,
    pub body: Vec<Stmt>,
}

impl SwitchCase {
    pub fn is_default(&self) -> bool {
        self.conditions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledStmt {
    pub label: Ident,
    pub stmt: Box<Stmt>,
}

/// `break` / `continue` with an optional label.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchStmt {
    pub position: Position,
    pub label: Option<Ident>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnStmt {
    pub position: Position,
    pub value: Option<Expr>,
}

/// `defer call` / `spawn call`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferStmt {
    pub position: Position,
    pub call: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PanicStmt {
    pub position: Position,
    pub value: Expr,
}
