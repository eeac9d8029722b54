//! Source positions and operator tokens carried by AST nodes.

use std::fmt;

/// Operator and punctuation tokens that appear inside AST nodes.
///
/// The parser records the token it saw for every operator position; the
/// compiler decides whether the token is valid where it appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenKind {
    // Arithmetic
    Plus,
    Minus,
    Asterisk,
    Slash,
    SlashSlash,
    Percent,

    // Bitwise
    Ampersand,
    Pipe,
    Caret,
    Tilde,
    Shl,
    Shr,

    // Comparison
    Equal,
    NotEqual,
    Less,
    LessEq,
    Greater,
    GreaterEq,

    // Logical
    Exclamation,
    AndAnd,
    OrOr,
    Elvis,
    NullCoalesce,
    Question,

    // Assignment
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    IDivAssign,
    ModAssign,
    AndAssign,
    OrAssign,
    XorAssign,
    ShlAssign,
    ShrAssign,

    // Punctuation
    Dot,
    QuestionDot,
    Scope,
    Ellipsis,
    Arrow,
    Comma,
    Colon,
    Semicolon,
}

impl TokenKind {
    /// The arithmetic operator an augmented assignment applies, if any.
    pub fn compound_operator(self) -> Option<TokenKind> {
        match self {
            TokenKind::AddAssign => Some(TokenKind::Plus),
            TokenKind::SubAssign => Some(TokenKind::Minus),
            TokenKind::MulAssign => Some(TokenKind::Asterisk),
            TokenKind::DivAssign => Some(TokenKind::Slash),
            TokenKind::IDivAssign => Some(TokenKind::SlashSlash),
            TokenKind::ModAssign => Some(TokenKind::Percent),
            TokenKind::AndAssign => Some(TokenKind::Ampersand),
            TokenKind::OrAssign => Some(TokenKind::Pipe),
            TokenKind::XorAssign => Some(TokenKind::Caret),
            TokenKind::ShlAssign => Some(TokenKind::Shl),
            TokenKind::ShrAssign => Some(TokenKind::Shr),
            _ => None,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Asterisk => "*",
            TokenKind::Slash => "/",
            TokenKind::SlashSlash => "//",
            TokenKind::Percent => "%",
            TokenKind::Ampersand => "&",
            TokenKind::Pipe => "|",
            TokenKind::Caret => "^",
            TokenKind::Tilde => "~",
            TokenKind::Shl => "<<",
            TokenKind::Shr => ">>",
            TokenKind::Equal => "==",
            TokenKind::NotEqual => "!=",
            TokenKind::Less => "<",
            TokenKind::LessEq => "<=",
            TokenKind::Greater => ">",
            TokenKind::GreaterEq => ">=",
            TokenKind::Exclamation => "!",
            TokenKind::AndAnd => "&&",
            TokenKind::OrOr => "||",
            TokenKind::Elvis => "?:",
            TokenKind::NullCoalesce => "??",
            TokenKind::Question => "?",
            TokenKind::Assign => "=",
            TokenKind::AddAssign => "+=",
            TokenKind::SubAssign => "-=",
            TokenKind::MulAssign => "*=",
            TokenKind::DivAssign => "/=",
            TokenKind::IDivAssign => "//=",
            TokenKind::ModAssign => "%=",
            TokenKind::AndAssign => "&=",
            TokenKind::OrAssign => "|=",
            TokenKind::XorAssign => "^=",
            TokenKind::ShlAssign => "<<=",
            TokenKind::ShrAssign => ">>=",
            TokenKind::Dot => ".",
            TokenKind::QuestionDot => "?.",
            TokenKind::Scope => "::",
            TokenKind::Ellipsis => "...",
            TokenKind::Arrow => "=>",
            TokenKind::Comma => ",",
            TokenKind::Colon => ":",
            TokenKind::Semicolon => ";",
        };
        write!(f, "{}", s)
    }
}

/// Position in source code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    /// Byte offset within the file.
    pub offset: usize,
    /// 0-indexed line number.
    pub line: usize,
    /// 0-indexed column number.
    pub column: usize,
}

impl Position {
    /// Create a new Position.
    pub fn new(offset: usize, line: usize, column: usize) -> Self {
        Self {
            offset,
            line,
            column,
        }
    }

    /// Position at the start of a 0-indexed line.
    pub fn at_line(line: usize) -> Self {
        Self {
            offset: 0,
            line,
            column: 0,
        }
    }

    /// Returns the 1-indexed line number.
    pub fn line_number(&self) -> usize {
        self.line + 1
    }

    /// Returns the 1-indexed column number.
    pub fn column_number(&self) -> usize {
        self.column + 1
    }
}
