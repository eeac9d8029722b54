//! Argon bytecode opcode definitions.
//!
//! Opcodes are organized by category for clarity. Every opcode has a fixed
//! encoded width of 1, 2 or 4 bytes: the opcode byte followed by a
//! little-endian operand of 0, 8 or 24 bits.

use bitflags::bitflags;
use std::fmt;

/// Bytecode opcodes for the Argon VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    // =========================================================================
    // Execution Control (1-9)
    // =========================================================================
    /// Return from function with the value on top of the stack.
    Ret = 1,
    /// Suspend a generator, yielding TOS; resumes with the sent value.
    YieldValue = 2,
    /// Raise TOS as a panic.
    Panic = 3,
    /// Call function. Operand packs the argument slot count and [`CallFlags`].
    Call = 4,
    /// Defer a call until the frame returns.
    Defer = 5,
    /// Run a call on a new fiber.
    Spawn = 6,
    /// Initialise a struct instance. Operand packs the field count and
    /// `CallFlags::KWARGS` for named fields.
    Init = 7,

    // =========================================================================
    // Jumps (10-19), operand is an absolute byte offset
    // =========================================================================
    /// Unconditional jump.
    Jump = 10,
    /// Pop and jump if false.
    JumpIfFalse = 11,
    /// Pop and jump if true.
    JumpIfTrue = 12,
    /// Jump keeping TOS if false, otherwise pop.
    JumpFalseOrPop = 13,
    /// Jump keeping TOS if true, otherwise pop.
    JumpTrueOrPop = 14,
    /// Jump keeping TOS if not nil, otherwise pop.
    JumpNotNilOrPop = 15,
    /// Jump keeping TOS if nil.
    JumpIfNil = 16,
    /// Push the next value from the iterator at TOS, or jump when exhausted.
    ForIter = 17,

    // =========================================================================
    // Load Operations (20-39)
    // =========================================================================
    /// Load static (constant) value.
    LoadConst = 20,
    /// Load global variable by name.
    LoadGlobal = 21,
    /// Load local variable.
    LoadLocal = 22,
    /// Load enclosed variable (closure cell).
    LoadEnclosed = 23,
    /// Load object attribute.
    LoadAttr = 24,
    /// Load member of a namespace (`a::b`).
    LoadScope = 25,
    /// Replace TOS with `method, self`.
    LoadMethod = 26,
    /// Push nil.
    Nil = 27,
    /// Push true.
    True = 28,
    /// Push false.
    False = 29,
    /// Push the generator stop signal.
    Stop = 30,

    // =========================================================================
    // Store Operations (40-49)
    // =========================================================================
    /// Declare a new global. Operand packs the name index and [`DeclFlags`].
    DeclareGlobal = 40,
    /// Store to global variable.
    StoreGlobal = 41,
    /// Store to local variable.
    StoreLocal = 42,
    /// Store to enclosed variable (closure cell).
    StoreEnclosed = 43,
    /// Store attribute: `obj, value`.
    StoreAttr = 44,
    /// Store namespace member: `obj, value`.
    StoreScope = 45,
    /// Store subscript: `obj, index, value`.
    StoreSubscr = 46,

    // =========================================================================
    // Operators (50-59)
    // =========================================================================
    /// Binary operation.
    BinaryOp = 50,
    /// Comparison operation.
    CompareOp = 51,
    /// Negate number.
    UnaryNegative = 52,
    /// Unary plus.
    UnaryPositive = 53,
    /// Logical NOT.
    UnaryNot = 54,
    /// Bitwise inversion.
    UnaryInvert = 55,
    /// Index access.
    BinarySubscr = 56,
    /// Build slice bounds from `low, high, step`.
    MakeBounds = 57,

    // =========================================================================
    // Container Building (60-69)
    // =========================================================================
    /// Build list from N items.
    BuildList = 60,
    /// Build tuple from N items.
    BuildTuple = 61,
    /// Build set from N items.
    BuildSet = 62,
    /// Build map from N key/value pairs.
    BuildMap = 63,
    /// Append TOS to the list below it.
    ListAppend = 64,
    /// Extend the list below TOS with iterable TOS.
    ListExtend = 65,
    /// Unpack TOS into N values, first item on top.
    Unpack = 66,

    // =========================================================================
    // Stack Manipulation (70-79)
    // =========================================================================
    /// Discard top of stack.
    PopTop = 70,
    /// Duplicate the top N items.
    Dup = 71,
    /// Replace TOS with an iterator over it.
    GetIter = 72,

    // =========================================================================
    // Functions and Types (80-89)
    // =========================================================================
    /// Make a function from a code object.
    MakeFunction = 80,
    /// Make a function from a code object and a tuple of cells.
    MakeClosure = 81,
    /// Push the cell backing a local slot.
    MakeCell = 82,
    /// Push an enclosed cell as-is, to forward it to a nested closure.
    LoadEnclosedCell = 83,
    /// Build a struct from `name, members, impls`.
    MakeStruct = 84,
    /// Build a trait from `name, members, impls`.
    MakeTrait = 85,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

bitflags! {
    /// Argument packing mode for [`Op::Call`], [`Op::Defer`], [`Op::Spawn`]
    /// and [`Op::Init`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CallFlags: u8 {
        /// Positional arguments were collected into a single list.
        const REST = 1 << 0;
        /// The last argument slot is a map of keyword arguments.
        const KWARGS = 1 << 1;
    }
}

bitflags! {
    /// Attributes of a global declaration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeclFlags: u8 {
        const CONSTANT = 1 << 0;
        const PUBLIC = 1 << 1;
    }
}

/// Pack an argument count and mode into a call operand.
pub fn pack_call(count: u16, flags: CallFlags) -> u32 {
    (count as u32) | ((flags.bits() as u32) << 16)
}

/// Split a call operand into its argument count and mode.
pub fn unpack_call(arg: u32) -> (u16, CallFlags) {
    (
        (arg & 0xFFFF) as u16,
        CallFlags::from_bits_truncate((arg >> 16) as u8),
    )
}

/// Pack a name index and declaration flags into a `DeclareGlobal` operand.
pub fn pack_decl(index: u16, flags: DeclFlags) -> u32 {
    (index as u32) | ((flags.bits() as u32) << 16)
}

/// Split a `DeclareGlobal` operand into its name index and flags.
pub fn unpack_decl(arg: u32) -> (u16, DeclFlags) {
    (
        (arg & 0xFFFF) as u16,
        DeclFlags::from_bits_truncate((arg >> 16) as u8),
    )
}

impl Op {
    /// Decode an opcode byte.
    pub fn from_u8(byte: u8) -> Option<Op> {
        let op = match byte {
            1 => Op::Ret,
            2 => Op::YieldValue,
            3 => Op::Panic,
            4 => Op::Call,
            5 => Op::Defer,
            6 => Op::Spawn,
            7 => Op::Init,
            10 => Op::Jump,
            11 => Op::JumpIfFalse,
            12 => Op::JumpIfTrue,
            13 => Op::JumpFalseOrPop,
            14 => Op::JumpTrueOrPop,
            15 => Op::JumpNotNilOrPop,
            16 => Op::JumpIfNil,
            17 => Op::ForIter,
            20 => Op::LoadConst,
            21 => Op::LoadGlobal,
            22 => Op::LoadLocal,
            23 => Op::LoadEnclosed,
            24 => Op::LoadAttr,
            25 => Op::LoadScope,
            26 => Op::LoadMethod,
            27 => Op::Nil,
            28 => Op::True,
            29 => Op::False,
            30 => Op::Stop,
            40 => Op::DeclareGlobal,
            41 => Op::StoreGlobal,
            42 => Op::StoreLocal,
            43 => Op::StoreEnclosed,
            44 => Op::StoreAttr,
            45 => Op::StoreScope,
            46 => Op::StoreSubscr,
            50 => Op::BinaryOp,
            51 => Op::CompareOp,
            52 => Op::UnaryNegative,
            53 => Op::UnaryPositive,
            54 => Op::UnaryNot,
            55 => Op::UnaryInvert,
            56 => Op::BinarySubscr,
            57 => Op::MakeBounds,
            60 => Op::BuildList,
            61 => Op::BuildTuple,
            62 => Op::BuildSet,
            63 => Op::BuildMap,
            64 => Op::ListAppend,
            65 => Op::ListExtend,
            66 => Op::Unpack,
            70 => Op::PopTop,
            71 => Op::Dup,
            72 => Op::GetIter,
            80 => Op::MakeFunction,
            81 => Op::MakeClosure,
            82 => Op::MakeCell,
            83 => Op::LoadEnclosedCell,
            84 => Op::MakeStruct,
            85 => Op::MakeTrait,
            _ => return None,
        };
        Some(op)
    }

    /// Encoded width in bytes: 1 (no operand), 2 (8-bit) or 4 (24-bit).
    pub fn width(self) -> usize {
        match self {
            Op::Ret
            | Op::YieldValue
            | Op::Panic
            | Op::Nil
            | Op::True
            | Op::False
            | Op::Stop
            | Op::StoreSubscr
            | Op::UnaryNegative
            | Op::UnaryPositive
            | Op::UnaryNot
            | Op::UnaryInvert
            | Op::BinarySubscr
            | Op::MakeBounds
            | Op::ListAppend
            | Op::ListExtend
            | Op::PopTop
            | Op::GetIter
            | Op::MakeFunction
            | Op::MakeClosure
            | Op::MakeStruct
            | Op::MakeTrait => 1,

            Op::LoadLocal
            | Op::LoadEnclosed
            | Op::StoreLocal
            | Op::StoreEnclosed
            | Op::BinaryOp
            | Op::CompareOp
            | Op::Unpack
            | Op::Dup
            | Op::MakeCell
            | Op::LoadEnclosedCell => 2,

            Op::Call
            | Op::Defer
            | Op::Spawn
            | Op::Init
            | Op::Jump
            | Op::JumpIfFalse
            | Op::JumpIfTrue
            | Op::JumpFalseOrPop
            | Op::JumpTrueOrPop
            | Op::JumpNotNilOrPop
            | Op::JumpIfNil
            | Op::ForIter
            | Op::LoadConst
            | Op::LoadGlobal
            | Op::LoadAttr
            | Op::LoadScope
            | Op::LoadMethod
            | Op::DeclareGlobal
            | Op::StoreGlobal
            | Op::StoreAttr
            | Op::StoreScope
            | Op::BuildList
            | Op::BuildTuple
            | Op::BuildSet
            | Op::BuildMap => 4,
        }
    }

    /// Largest operand the encoding can carry.
    pub fn max_operand(self) -> u32 {
        match self.width() {
            1 => 0,
            2 => 0xFF,
            _ => 0x00FF_FFFF,
        }
    }

    /// Net stack effect when execution falls through to the next
    /// instruction. Variable-count opcodes derive it from the operand.
    pub fn stack_effect(self, arg: u32) -> i32 {
        let n = arg as i32;
        match self {
            Op::Ret | Op::Panic => -1,
            Op::YieldValue => 0,
            Op::Call => -(unpack_call(arg).0 as i32),
            Op::Defer | Op::Spawn => -(unpack_call(arg).0 as i32) - 1,
            Op::Init => {
                let (count, flags) = unpack_call(arg);
                if flags.contains(CallFlags::KWARGS) {
                    -2 * count as i32
                } else {
                    -(count as i32)
                }
            }

            Op::Jump | Op::JumpIfNil => 0,
            Op::JumpIfFalse
            | Op::JumpIfTrue
            | Op::JumpFalseOrPop
            | Op::JumpTrueOrPop
            | Op::JumpNotNilOrPop => -1,
            Op::ForIter => 1,

            Op::LoadConst
            | Op::LoadGlobal
            | Op::LoadLocal
            | Op::LoadEnclosed
            | Op::LoadMethod
            | Op::Nil
            | Op::True
            | Op::False
            | Op::Stop => 1,
            Op::LoadAttr | Op::LoadScope => 0,

            Op::DeclareGlobal | Op::StoreGlobal | Op::StoreLocal | Op::StoreEnclosed => -1,
            Op::StoreAttr | Op::StoreScope => -2,
            Op::StoreSubscr => -3,

            Op::BinaryOp | Op::CompareOp | Op::BinarySubscr => -1,
            Op::UnaryNegative | Op::UnaryPositive | Op::UnaryNot | Op::UnaryInvert => 0,
            Op::MakeBounds => -2,

            Op::BuildList | Op::BuildTuple | Op::BuildSet => 1 - n,
            Op::BuildMap => 1 - 2 * n,
            Op::ListAppend | Op::ListExtend => -1,
            Op::Unpack => n - 1,

            Op::PopTop => -1,
            Op::Dup => n,
            Op::GetIter => 0,

            Op::MakeFunction => 0,
            Op::MakeClosure => -1,
            Op::MakeCell | Op::LoadEnclosedCell => 1,
            Op::MakeStruct | Op::MakeTrait => -2,
        }
    }

    /// Net stack effect on the taken branch of a jump, `None` for
    /// non-jumping opcodes.
    pub fn branch_effect(self) -> Option<i32> {
        match self {
            Op::Jump => Some(0),
            Op::JumpIfFalse | Op::JumpIfTrue => Some(-1),
            Op::JumpFalseOrPop | Op::JumpTrueOrPop | Op::JumpNotNilOrPop | Op::JumpIfNil => Some(0),
            Op::ForIter => Some(0),
            _ => None,
        }
    }

    /// Whether the operand is a jump target offset.
    pub fn is_jump(self) -> bool {
        self.branch_effect().is_some()
    }

    /// Whether execution never continues to the next instruction.
    pub fn is_terminator(self) -> bool {
        matches!(self, Op::Ret | Op::Panic | Op::Jump)
    }
}

/// Binary operation types for BinaryOp instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BinaryOpType {
    Add = 0,
    Subtract = 1,
    Multiply = 2,
    Divide = 3,
    IntDivide = 4,
    Modulo = 5,
    LShift = 6,
    RShift = 7,
    BitwiseAnd = 8,
    BitwiseOr = 9,
    Xor = 10,
}

impl BinaryOpType {
    pub fn from_operand(arg: u32) -> Option<Self> {
        let op = match arg {
            0 => BinaryOpType::Add,
            1 => BinaryOpType::Subtract,
            2 => BinaryOpType::Multiply,
            3 => BinaryOpType::Divide,
            4 => BinaryOpType::IntDivide,
            5 => BinaryOpType::Modulo,
            6 => BinaryOpType::LShift,
            7 => BinaryOpType::RShift,
            8 => BinaryOpType::BitwiseAnd,
            9 => BinaryOpType::BitwiseOr,
            10 => BinaryOpType::Xor,
            _ => return None,
        };
        Some(op)
    }
}

impl fmt::Display for BinaryOpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOpType::Add => "+",
            BinaryOpType::Subtract => "-",
            BinaryOpType::Multiply => "*",
            BinaryOpType::Divide => "/",
            BinaryOpType::IntDivide => "//",
            BinaryOpType::Modulo => "%",
            BinaryOpType::LShift => "<<",
            BinaryOpType::RShift => ">>",
            BinaryOpType::BitwiseAnd => "&",
            BinaryOpType::BitwiseOr => "|",
            BinaryOpType::Xor => "^",
        };
        write!(f, "{}", s)
    }
}

/// Comparison operation types for CompareOp instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompareOpType {
    Lt = 0,
    LtEquals = 1,
    Eq = 2,
    NotEq = 3,
    Gt = 4,
    GtEquals = 5,
}

impl CompareOpType {
    pub fn from_operand(arg: u32) -> Option<Self> {
        let op = match arg {
            0 => CompareOpType::Lt,
            1 => CompareOpType::LtEquals,
            2 => CompareOpType::Eq,
            3 => CompareOpType::NotEq,
            4 => CompareOpType::Gt,
            5 => CompareOpType::GtEquals,
            _ => return None,
        };
        Some(op)
    }
}

impl fmt::Display for CompareOpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOpType::Lt => "<",
            CompareOpType::LtEquals => "<=",
            CompareOpType::Eq => "==",
            CompareOpType::NotEq => "!=",
            CompareOpType::Gt => ">",
            CompareOpType::GtEquals => ">=",
        };
        write!(f, "{}", s)
    }
}
