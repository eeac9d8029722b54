//! Compilation errors.

use argon_ast::Position;
use argon_bytecode::BytecodeError;
use thiserror::Error;

/// Compilation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompilerError {
    /// Structural or semantic problem in the input tree.
    #[error("{message} at line {line}, column {column}")]
    Compile {
        message: String,
        line: usize,
        column: usize,
    },

    /// A name was declared twice in one scope with incompatible kinds.
    #[error("'{name}' redeclared at line {line}, column {column}")]
    Redeclaration {
        name: String,
        line: usize,
        column: usize,
    },

    /// A table or operand outgrew what the instruction encoding can address.
    #[error("capacity exceeded: {message}")]
    Capacity { message: String },

    /// Compiler invariant violated; always a bug in the compiler.
    #[error("internal compiler error: {message}")]
    Internal { message: String },
}

impl CompilerError {
    pub(crate) fn new(message: impl Into<String>, pos: Position) -> Self {
        Self::Compile {
            message: message.into(),
            line: pos.line_number(),
            column: pos.column_number(),
        }
    }

    pub(crate) fn redeclaration(name: &str, pos: Position) -> Self {
        Self::Redeclaration {
            name: name.to_string(),
            line: pos.line_number(),
            column: pos.column_number(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The 1-indexed source line, for errors tied to a node.
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::Compile { line, .. } | Self::Redeclaration { line, .. } => Some(*line),
            _ => None,
        }
    }
}

impl From<BytecodeError> for CompilerError {
    fn from(err: BytecodeError) -> Self {
        match err {
            BytecodeError::OperandOverflow { .. } => Self::Capacity {
                message: err.to_string(),
            },
            _ => Self::internal(err.to_string()),
        }
    }
}
