//! Constructor helpers for building ASTs programmatically.
//!
//! Every node is placed at the default position; use [`at`] or
//! [`stmt_at`] to move a node to a specific line.

use crate::ast::*;
use crate::token::{Position, TokenKind};
use std::rc::Rc;

fn p() -> Position {
    Position::default()
}

// ============================================================================
// Expressions
// ============================================================================

pub fn nil() -> Expr {
    Expr::Nil(p())
}

pub fn boolean(value: bool) -> Expr {
    Expr::Bool(BoolLit {
        position: p(),
        value,
    })
}

pub fn int(value: i64) -> Expr {
    Expr::Int(IntLit {
        position: p(),
        value,
    })
}

pub fn float(value: f64) -> Expr {
    Expr::Float(FloatLit {
        position: p(),
        value,
    })
}

pub fn string(value: &str) -> Expr {
    Expr::String(StringLit {
        position: p(),
        value: value.to_string(),
    })
}

pub fn name(name: &str) -> Ident {
    Ident {
        position: p(),
        name: name.to_string(),
    }
}

pub fn ident(name_: &str) -> Expr {
    Expr::Ident(name(name_))
}

pub fn unary(op: TokenKind, operand: Expr) -> Expr {
    Expr::Unary(Box::new(UnaryExpr {
        position: p(),
        op,
        operand,
    }))
}

pub fn binary(left: Expr, op: TokenKind, right: Expr) -> Expr {
    Expr::Binary(Box::new(BinaryExpr {
        left,
        op,
        op_pos: p(),
        right,
    }))
}

pub fn ternary(cond: Expr, then: Expr, otherwise: Expr) -> Expr {
    Expr::Ternary(Box::new(TernaryExpr {
        cond,
        then,
        otherwise,
    }))
}

fn selector(left: Expr, kind: SelectorKind, member: &str) -> Expr {
    Expr::Selector(Box::new(Selector {
        left,
        kind,
        name: name(member),
    }))
}

/// `left.member`
pub fn attr(left: Expr, member: &str) -> Expr {
    selector(left, SelectorKind::Dot, member)
}

/// `left::member`
pub fn scope(left: Expr, member: &str) -> Expr {
    selector(left, SelectorKind::Scope, member)
}

/// `left?.member`
pub fn safe_attr(left: Expr, member: &str) -> Expr {
    selector(left, SelectorKind::SafeDot, member)
}

pub fn index(object: Expr, index: Expr) -> Expr {
    Expr::Index(Box::new(IndexExpr { object, index }))
}

pub fn slice(object: Expr, low: Option<Expr>, high: Option<Expr>, step: Option<Expr>) -> Expr {
    Expr::Slice(Box::new(SliceExpr {
        object,
        low,
        high,
        step,
    }))
}

pub fn call(callee: Expr, args: Vec<Expr>) -> Expr {
    call_kw(callee, args, vec![])
}

pub fn call_kw(callee: Expr, args: Vec<Expr>, kwargs: Vec<(&str, Expr)>) -> Expr {
    Expr::Call(Box::new(CallExpr {
        callee,
        args,
        kwargs: kwargs
            .into_iter()
            .map(|(k, value)| KeywordArg {
                name: name(k),
                value,
            })
            .collect(),
    }))
}

pub fn spread(value: Expr) -> Expr {
    Expr::Spread(Box::new(SpreadExpr {
        position: p(),
        value,
    }))
}

pub fn list(items: Vec<Expr>) -> Expr {
    Expr::List(SequenceLit {
        position: p(),
        items,
    })
}

pub fn tuple(items: Vec<Expr>) -> Expr {
    Expr::Tuple(SequenceLit {
        position: p(),
        items,
    })
}

pub fn set(items: Vec<Expr>) -> Expr {
    Expr::Set(SequenceLit {
        position: p(),
        items,
    })
}

pub fn map(entries: Vec<(Expr, Expr)>) -> Expr {
    Expr::Map(MapLit {
        position: p(),
        entries,
    })
}

/// Function declaration node with positional parameters.
pub fn func(func_name: Option<&str>, params: &[&str], body: Vec<Stmt>) -> Rc<FuncDecl> {
    Rc::new(FuncDecl {
        position: p(),
        name: func_name.map(name),
        params: params.iter().map(|n| name(n)).collect(),
        rest: None,
        kwargs: None,
        body: block(body),
        public: false,
    })
}

/// Anonymous function expression.
pub fn lambda(params: &[&str], body: Vec<Stmt>) -> Expr {
    Expr::Func(func(None, params, body))
}

pub fn init(target: Expr, values: Vec<Expr>) -> Expr {
    Expr::Init(Box::new(InitExpr {
        target,
        fields: values
            .into_iter()
            .map(|value| InitField { name: None, value })
            .collect(),
    }))
}

pub fn init_named(target: Expr, fields: Vec<(&str, Expr)>) -> Expr {
    Expr::Init(Box::new(InitExpr {
        target,
        fields: fields
            .into_iter()
            .map(|(k, value)| InitField {
                name: Some(name(k)),
                value,
            })
            .collect(),
    }))
}

pub fn yield_(value: Option<Expr>) -> Expr {
    Expr::Yield(Box::new(YieldExpr {
        position: p(),
        value,
    }))
}

/// Move an expression leaf to `line` (0-indexed). Composite nodes take
/// their position from their leftmost child.
pub fn at(line: usize, expr: Expr) -> Expr {
    let pos = Position::at_line(line);
    match expr {
        Expr::Nil(_) => Expr::Nil(pos),
        Expr::Bool(e) => Expr::Bool(BoolLit { position: pos, ..e }),
        Expr::Int(e) => Expr::Int(IntLit { position: pos, ..e }),
        Expr::Float(e) => Expr::Float(FloatLit { position: pos, ..e }),
        Expr::String(e) => Expr::String(StringLit { position: pos, ..e }),
        Expr::Ident(e) => Expr::Ident(Ident { position: pos, ..e }),
        other => other,
    }
}

// ============================================================================
// Statements
// ============================================================================

pub fn expr_stmt(expr: Expr) -> Stmt {
    Stmt::Expr(expr)
}

fn decl(constant: bool, names: &[&str], value: Option<Expr>) -> Stmt {
    Stmt::Var(VarDecl {
        position: p(),
        constant,
        public: false,
        names: names.iter().map(|n| name(n)).collect(),
        value,
    })
}

pub fn var(var_name: &str, value: Expr) -> Stmt {
    decl(false, &[var_name], Some(value))
}

/// `var name` without an initializer.
pub fn var_uninit(var_name: &str) -> Stmt {
    decl(false, &[var_name], None)
}

pub fn var_many(names: &[&str], value: Expr) -> Stmt {
    decl(false, names, Some(value))
}

pub fn let_(var_name: &str, value: Expr) -> Stmt {
    decl(true, &[var_name], Some(value))
}

pub fn pub_var(var_name: &str, value: Expr) -> Stmt {
    Stmt::Var(VarDecl {
        position: p(),
        constant: false,
        public: true,
        names: vec![name(var_name)],
        value: Some(value),
    })
}

pub fn assign(target: Expr, value: Expr) -> Stmt {
    assign_op(target, TokenKind::Assign, value)
}

pub fn assign_op(target: Expr, op: TokenKind, value: Expr) -> Stmt {
    Stmt::Assign(AssignStmt {
        position: p(),
        targets: vec![target],
        op,
        value,
    })
}

pub fn assign_many(targets: Vec<Expr>, value: Expr) -> Stmt {
    Stmt::Assign(AssignStmt {
        position: p(),
        targets,
        op: TokenKind::Assign,
        value,
    })
}

pub fn func_decl(func_name: &str, params: &[&str], body: Vec<Stmt>) -> Stmt {
    Stmt::Func(func(Some(func_name), params, body))
}

fn type_decl(type_name: &str, impls: Vec<Expr>, body: Vec<Stmt>) -> TypeDecl {
    TypeDecl {
        position: p(),
        name: name(type_name),
        impls,
        body,
        public: false,
    }
}

pub fn struct_decl(type_name: &str, impls: Vec<Expr>, body: Vec<Stmt>) -> Stmt {
    Stmt::Struct(type_decl(type_name, impls, body))
}

pub fn trait_decl(type_name: &str, impls: Vec<Expr>, body: Vec<Stmt>) -> Stmt {
    Stmt::Trait(type_decl(type_name, impls, body))
}

pub fn block(stmts: Vec<Stmt>) -> Block {
    Block {
        position: p(),
        stmts,
    }
}

pub fn block_stmt(stmts: Vec<Stmt>) -> Stmt {
    Stmt::Block(block(stmts))
}

pub fn if_(cond: Expr, then: Vec<Stmt>, orelse: Option<Stmt>) -> Stmt {
    Stmt::If(IfStmt {
        position: p(),
        cond,
        then: block(then),
        orelse: orelse.map(Box::new),
    })
}

/// Bare `loop { }`.
pub fn loop_(body: Vec<Stmt>) -> Stmt {
    Stmt::Loop(LoopStmt {
        position: p(),
        cond: None,
        body: block(body),
    })
}

/// `loop cond { }`.
pub fn loop_while(cond: Expr, body: Vec<Stmt>) -> Stmt {
    Stmt::Loop(LoopStmt {
        position: p(),
        cond: Some(cond),
        body: block(body),
    })
}

pub fn for_(init: Option<Stmt>, cond: Option<Expr>, post: Option<Stmt>, body: Vec<Stmt>) -> Stmt {
    Stmt::For(ForStmt {
        position: p(),
        init: init.map(Box::new),
        cond,
        post: post.map(Box::new),
        body: block(body),
    })
}

pub fn for_each(targets: &[&str], iter: Expr, body: Vec<Stmt>) -> Stmt {
    Stmt::ForEach(ForEachStmt {
        position: p(),
        targets: targets.iter().map(|n| name(n)).collect(),
        iter,
        body: block(body),
    })
}

pub fn switch(tag: Option<Expr>, cases: Vec<SwitchCase>) -> Stmt {
    Stmt::Switch(SwitchStmt {
        position: p(),
        tag,
        cases,
    })
}

pub fn case(conditions: Vec<Expr>, body: Vec<Stmt>) -> SwitchCase {
    SwitchCase {
        position: p(),
        conditions,
        body,
    }
}

pub fn default_case(body: Vec<Stmt>) -> SwitchCase {
    case(vec![], body)
}

pub fn labeled(label: &str, stmt: Stmt) -> Stmt {
    Stmt::Labeled(LabeledStmt {
        label: name(label),
        stmt: Box::new(stmt),
    })
}

pub fn break_() -> Stmt {
    Stmt::Break(BranchStmt {
        position: p(),
        label: None,
    })
}

pub fn break_to(label: &str) -> Stmt {
    Stmt::Break(BranchStmt {
        position: p(),
        label: Some(name(label)),
    })
}

pub fn continue_() -> Stmt {
    Stmt::Continue(BranchStmt {
        position: p(),
        label: None,
    })
}

pub fn continue_to(label: &str) -> Stmt {
    Stmt::Continue(BranchStmt {
        position: p(),
        label: Some(name(label)),
    })
}

pub fn fallthrough() -> Stmt {
    Stmt::Fallthrough(p())
}

pub fn ret(value: Expr) -> Stmt {
    Stmt::Return(ReturnStmt {
        position: p(),
        value: Some(value),
    })
}

pub fn ret_void() -> Stmt {
    Stmt::Return(ReturnStmt {
        position: p(),
        value: None,
    })
}

pub fn defer(call: Expr) -> Stmt {
    Stmt::Defer(DeferStmt {
        position: p(),
        call,
    })
}

pub fn spawn(call: Expr) -> Stmt {
    Stmt::Spawn(DeferStmt {
        position: p(),
        call,
    })
}

pub fn panic(value: Expr) -> Stmt {
    Stmt::Panic(PanicStmt {
        position: p(),
        value,
    })
}

/// Move a statement to `line` (0-indexed).
pub fn stmt_at(line: usize, stmt: Stmt) -> Stmt {
    let pos = Position::at_line(line);
    match stmt {
        Stmt::Expr(e) => Stmt::Expr(at(line, e)),
        Stmt::Var(d) => Stmt::Var(VarDecl { position: pos, ..d }),
        Stmt::Assign(a) => Stmt::Assign(AssignStmt { position: pos, ..a }),
        Stmt::Return(r) => Stmt::Return(ReturnStmt { position: pos, ..r }),
        Stmt::Break(b) => Stmt::Break(BranchStmt { position: pos, ..b }),
        Stmt::Continue(b) => Stmt::Continue(BranchStmt { position: pos, ..b }),
        Stmt::Panic(s) => Stmt::Panic(PanicStmt { position: pos, ..s }),
        other => other,
    }
}

pub fn module(stmts: Vec<Stmt>) -> Module {
    Module {
        name: "main".to_string(),
        stmts,
    }
}
