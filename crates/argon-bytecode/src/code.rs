//! Compiled bytecode container.

use crate::constant::Constant;
use crate::opcode::{BinaryOpType, CompareOpType, Op, unpack_call, unpack_decl};
use bitflags::bitflags;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

bitflags! {
    /// Properties of a compiled function.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CodeFlags: u8 {
        /// The body contains `yield`.
        const GENERATOR = 1 << 0;
        /// Extra positional arguments are collected into a rest parameter.
        const VARIADIC = 1 << 1;
        /// Keyword arguments are collected into a map parameter.
        const KWARGS = 1 << 2;
        /// The function is a struct or trait method taking `self`.
        const METHOD = 1 << 3;
    }
}

/// Errors raised while encoding or decoding an instruction stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BytecodeError {
    #[error("unknown opcode {byte:#04x} at offset {offset}")]
    UnknownOpcode { offset: usize, byte: u8 },

    #[error("truncated {op} instruction at offset {offset}")]
    Truncated { offset: usize, op: Op },

    #[error("operand {arg} does not fit in {op} (max {max})")]
    OperandOverflow { op: Op, arg: u32, max: u32 },
}

/// Maps the first instruction offset of a run to its source line
/// (0-indexed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub offset: u32,
    pub line: u32,
}

/// A single decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub offset: usize,
    pub op: Op,
    pub arg: u32,
}

impl Instruction {
    /// Offset of the following instruction.
    pub fn next_offset(&self) -> usize {
        self.offset + self.op.width()
    }
}

/// Append the encoding of `op arg` to `out`.
///
/// Byte 0 is the opcode; the operand follows in little-endian order using
/// the remaining `width - 1` bytes.
pub fn encode(op: Op, arg: u32, out: &mut Vec<u8>) -> Result<(), BytecodeError> {
    let max = op.max_operand();
    if arg > max {
        return Err(BytecodeError::OperandOverflow { op, arg, max });
    }
    out.push(op as u8);
    let bytes = arg.to_le_bytes();
    out.extend_from_slice(&bytes[..op.width() - 1]);
    Ok(())
}

/// Iterator over the instructions of an encoded stream.
pub struct Decoder<'a> {
    bytes: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            offset: 0,
            failed: false,
        }
    }
}

impl Iterator for Decoder<'_> {
    type Item = Result<Instruction, BytecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.bytes.len() {
            return None;
        }
        let offset = self.offset;
        let byte = self.bytes[offset];
        let Some(op) = Op::from_u8(byte) else {
            self.failed = true;
            return Some(Err(BytecodeError::UnknownOpcode { offset, byte }));
        };
        let end = offset + op.width();
        if end > self.bytes.len() {
            self.failed = true;
            return Some(Err(BytecodeError::Truncated { offset, op }));
        }
        let mut arg = [0u8; 4];
        arg[..op.width() - 1].copy_from_slice(&self.bytes[offset + 1..end]);
        self.offset = end;
        Some(Ok(Instruction {
            offset,
            op,
            arg: u32::from_le_bytes(arg),
        }))
    }
}

/// Immutable compiled bytecode for a module, function or type body.
#[derive(Debug, Clone)]
pub struct Code {
    /// Short name (`main`, `add`, `<lambda>`).
    pub name: Rc<str>,
    /// Dotted path from the module (`main.Point.norm`).
    pub qualname: Rc<str>,
    /// Source filename, when known.
    pub filename: Option<Rc<str>>,
    /// Encoded instruction stream.
    pub instructions: Vec<u8>,
    /// Static values referenced by `LoadConst`.
    pub statics: Vec<Rc<Constant>>,
    /// Names referenced by global, attribute and scope instructions.
    pub names: Vec<Rc<str>>,
    /// Local slot names.
    pub locals: Vec<Rc<str>>,
    /// Captured variable names, in cell order.
    pub enclosed: Vec<Rc<str>>,
    /// Maximum operand stack depth.
    pub stack_size: usize,
    /// Number of declared positional parameters.
    pub arity: u16,
    pub flags: CodeFlags,
    /// Line table, sorted by offset.
    pub lines: Vec<LineEntry>,
}

impl Code {
    /// Decode the instruction stream.
    pub fn decode(&self) -> Decoder<'_> {
        Decoder::new(&self.instructions)
    }

    /// Source line (0-indexed) of the instruction at `offset`.
    pub fn line_at(&self, offset: usize) -> Option<u32> {
        let idx = self
            .lines
            .partition_point(|entry| entry.offset as usize <= offset);
        idx.checked_sub(1).map(|i| self.lines[i].line)
    }

    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR)
    }

    /// Nested code objects in static table order.
    pub fn children(&self) -> impl Iterator<Item = &Rc<Code>> {
        self.statics.iter().filter_map(|c| c.as_code())
    }

    fn describe_operand(&self, instr: &Instruction) -> Option<String> {
        let idx = instr.arg as usize;
        let text = match instr.op {
            Op::LoadConst => self.statics.get(idx)?.to_string(),
            Op::LoadGlobal
            | Op::StoreGlobal
            | Op::LoadAttr
            | Op::LoadScope
            | Op::LoadMethod
            | Op::StoreAttr
            | Op::StoreScope => self.names.get(idx)?.to_string(),
            Op::DeclareGlobal => {
                let (name, flags) = unpack_decl(instr.arg);
                let name = self.names.get(name as usize)?;
                if flags.is_empty() {
                    name.to_string()
                } else {
                    format!("{} {:?}", name, flags)
                }
            }
            Op::LoadLocal | Op::StoreLocal | Op::MakeCell => self.locals.get(idx)?.to_string(),
            Op::LoadEnclosed | Op::StoreEnclosed | Op::LoadEnclosedCell => {
                self.enclosed.get(idx)?.to_string()
            }
            Op::BinaryOp => BinaryOpType::from_operand(instr.arg)?.to_string(),
            Op::CompareOp => CompareOpType::from_operand(instr.arg)?.to_string(),
            Op::Call | Op::Defer | Op::Spawn | Op::Init => {
                let (count, flags) = unpack_call(instr.arg);
                if flags.is_empty() {
                    return None;
                }
                format!("argc={} {:?}", count, flags)
            }
            _ => return None,
        };
        Some(text)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "code {} ({}) arity={} stack={} flags={:?}",
            self.qualname,
            self.filename.as_deref().unwrap_or("<unknown>"),
            self.arity,
            self.stack_size,
            self.flags,
        )?;
        let mut last_line = None;
        for instr in self.decode() {
            let instr = instr.map_err(|_| fmt::Error)?;
            let line = self.line_at(instr.offset);
            if line != last_line {
                match line {
                    Some(line) => write!(f, "{:>5} ", line + 1)?,
                    None => write!(f, "      ")?,
                }
                last_line = line;
            } else {
                write!(f, "      ")?;
            }
            write!(f, "{:>6} {:<18}", instr.offset, instr.op.to_string())?;
            if instr.op.width() > 1 {
                write!(f, " {}", instr.arg)?;
            }
            if let Some(desc) = self.describe_operand(&instr) {
                write!(f, " ({})", desc)?;
            }
            writeln!(f)?;
        }
        for child in self.children() {
            writeln!(f)?;
            write!(f, "{}", child)?;
        }
        Ok(())
    }
}
