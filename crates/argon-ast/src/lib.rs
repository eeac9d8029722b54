//! Argon AST - the syntax tree consumed by the Argon compiler.
//!
//! This crate defines the read-only tree the parser hands to the compiler,
//! plus [`build`] helpers for constructing trees directly.

pub mod ast;
pub mod build;
pub mod token;

pub use ast::*;
pub use token::{Position, TokenKind};
