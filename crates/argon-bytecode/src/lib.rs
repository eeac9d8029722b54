//! Argon bytecode - instruction set and code objects for the Argon VM.
//!
//! This crate defines the encoded instruction format, the immutable
//! [`Code`] objects the compiler produces, the constant interning pool and
//! a stack verifier for compiled code.

pub mod code;
pub mod constant;
pub mod opcode;
pub mod verify;

pub use code::{BytecodeError, Code, CodeFlags, Decoder, Instruction, LineEntry, encode};
pub use constant::{Constant, Interner, SharedInterner};
pub use opcode::{
    BinaryOpType, CallFlags, CompareOpType, DeclFlags, Op, pack_call, pack_decl, unpack_call,
    unpack_decl,
};
pub use verify::{StackProfile, VerifyError, verify};
