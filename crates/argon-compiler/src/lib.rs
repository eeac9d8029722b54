//! Argon compiler - AST to bytecode compilation.
//!
//! This crate lowers a parsed Argon module into [`argon_bytecode::Code`]
//! objects: one for the module and one for every function nested in it.

pub mod basic_block;
pub mod compiler;
pub mod error;
pub mod symbol_table;
pub mod unit;

pub use basic_block::{BasicBlock, BlockChain, BlockId, Instr};
pub use compiler::{Compiler, CompilerConfig, compile};
pub use error::CompilerError;
pub use symbol_table::{Symbol, SymbolError, SymbolKind, SymbolTable};
pub use unit::{JBlock, JBlockKind, LoopTarget, StackDepth, TranslationUnit, UnitKind};
