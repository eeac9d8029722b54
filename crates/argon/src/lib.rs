//! Argon - bytecode compiler core for the Argon scripting language.
//!
//! Argon lowers a parsed module into stack-machine bytecode: one [`Code`]
//! object for the module plus one for every function nested in it.
//!
//! # Example
//!
//! ```
//! use argon::ast::build::*;
//! use argon::ast::TokenKind;
//!
//! let tree = module(vec![var("x", binary(int(1), TokenKind::Plus, int(2)))]);
//! let code = argon::compile_checked(&tree).unwrap();
//! assert_eq!(&*code.name, "main");
//! ```

use std::rc::Rc;

pub use argon_ast as ast;
pub use argon_bytecode as bytecode;
pub use argon_compiler as compiler;

// Re-export commonly used types
pub use argon_ast::{Expr, Module, Position, Stmt, TokenKind};
pub use argon_bytecode::{Code, Constant, Interner, Op, SharedInterner, VerifyError, verify};
pub use argon_compiler::{Compiler, CompilerConfig, CompilerError};

/// Error type for [`compile_checked`].
#[derive(Debug)]
pub enum CheckError {
    Compile(CompilerError),
    /// The compiler produced bytecode that fails verification.
    Verify { qualname: String, error: VerifyError },
}

impl std::fmt::Display for CheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckError::Compile(e) => write!(f, "compile error: {}", e),
            CheckError::Verify { qualname, error } => {
                write!(f, "verification of {} failed: {}", qualname, error)
            }
        }
    }
}

impl std::error::Error for CheckError {}

/// Compile a module with the default configuration.
pub fn compile(module: &Module) -> Result<Rc<Code>, CompilerError> {
    argon_compiler::compile(module, CompilerConfig::default())
}

/// Compile a module and verify the stack discipline of every code object
/// it produced.
pub fn compile_checked(module: &Module) -> Result<Rc<Code>, CheckError> {
    let code = compile(module).map_err(CheckError::Compile)?;
    verify_tree(&code)?;
    Ok(code)
}

fn verify_tree(code: &Code) -> Result<(), CheckError> {
    verify(code).map_err(|error| CheckError::Verify {
        qualname: code.qualname.to_string(),
        error,
    })?;
    code.children().try_for_each(|child| verify_tree(child))
}
