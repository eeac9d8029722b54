//! Translation units: one scope frame per module, function, struct or trait
//! body.
//!
//! A unit owns its symbol table, its block chain, the four tables that end
//! up in [`Code`], the operand stack accounting and the stack of active
//! break/continue targets. Struct and trait units are overlays: they own a
//! symbol table for their members but emit into the enclosing frame.

use crate::basic_block::{BlockChain, BlockId, ChainError, ChainMark};
use crate::error::CompilerError;
use crate::symbol_table::{SymbolKind, SymbolTable};
use argon_bytecode::{Code, CodeFlags, Constant, LineEntry, Op, encode};
use log::{debug, trace};
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// What kind of body a unit compiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Module,
    Function,
    Struct,
    Trait,
}

impl UnitKind {
    /// Struct and trait bodies emit into the enclosing frame.
    pub fn is_overlay(self) -> bool {
        matches!(self, UnitKind::Struct | UnitKind::Trait)
    }
}

/// Running and maximum operand stack depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackDepth {
    pub current: usize,
    pub required: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JBlockKind {
    Loop,
    Switch,
    /// A labeled statement that is not itself a loop or switch.
    Block,
}

/// An active break/continue target.
#[derive(Debug, Clone)]
pub struct JBlock {
    pub label: Option<Rc<str>>,
    /// Continue destination; `None` for switches and labeled blocks.
    pub start: Option<BlockId>,
    /// Break destination.
    pub end: BlockId,
    /// Symbol table nesting when the target was pushed; a labeled target
    /// matches only the label symbol declared at this nesting.
    pub nested: usize,
    /// Values the construct keeps on the stack while its body runs.
    pub pops: usize,
    pub kind: JBlockKind,
}

/// Where a `break` or `continue` goes and what it has to clean up first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTarget {
    pub block: BlockId,
    /// Values held by constructs nested inside the target.
    pub pops: usize,
}

/// Snapshot of a unit taken before compiling a construct.
#[derive(Debug, Clone, Copy)]
pub struct Mark {
    chain: ChainMark,
    jblocks: usize,
    stack: StackDepth,
    nesting: usize,
}

/// A value table that hands out stable indices.
#[derive(Debug)]
struct Table<K> {
    items: Vec<Rc<str>>,
    index: FxHashMap<K, u32>,
}

impl<K> Default for Table<K> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            index: FxHashMap::default(),
        }
    }
}

impl<K: std::hash::Hash + Eq> Table<K> {
    fn get_or_insert(&mut self, key: K, name: &Rc<str>) -> u32 {
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let idx = self.items.len() as u32;
        self.items.push(name.clone());
        self.index.insert(key, idx);
        idx
    }
}

/// Compiler-internal scope frame.
#[derive(Debug)]
pub struct TranslationUnit {
    pub kind: UnitKind,
    pub name: Rc<str>,
    pub qualname: Rc<str>,
    pub symbols: SymbolTable,
    pub chain: BlockChain,
    statics: Vec<Rc<Constant>>,
    statics_index: FxHashMap<*const Constant, u32>,
    names: Table<Rc<str>>,
    locals: Table<usize>,
    enclosed: Table<Rc<str>>,
    pub stack: StackDepth,
    jblocks: Vec<JBlock>,
    pending_label: Option<(Rc<str>, usize)>,
    pub flags: CodeFlags,
    pub arity: u16,
    line: u32,
}

impl TranslationUnit {
    pub fn new(kind: UnitKind, name: Rc<str>, qualname: Rc<str>) -> Self {
        debug!("enter {:?} unit {}", kind, qualname);
        Self {
            kind,
            symbols: SymbolTable::new(),
            name,
            qualname,
            chain: BlockChain::new(),
            statics: Vec::new(),
            statics_index: FxHashMap::default(),
            names: Table::default(),
            locals: Table::default(),
            enclosed: Table::default(),
            stack: StackDepth::default(),
            jblocks: Vec::new(),
            pending_label: None,
            flags: CodeFlags::empty(),
            arity: 0,
            line: 0,
        }
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    /// Allocate a new linked block and make it current.
    pub fn block_new(&mut self) -> BlockId {
        let id = self.chain.new_block();
        trace!("{}: new block {:?}", self.qualname, id);
        id
    }

    /// Allocate an unlinked block to serve as a jump destination.
    pub fn block_alloc(&mut self) -> BlockId {
        self.chain.alloc()
    }

    /// Link a block allocated with [`block_alloc`](Self::block_alloc) and
    /// make it current.
    pub fn block_append(&mut self, id: BlockId) -> Result<(), CompilerError> {
        trace!("{}: append block {:?}", self.qualname, id);
        self.chain.append(id).map_err(|err| match err {
            ChainError::AlreadyLinked(id) => {
                CompilerError::internal(format!("block {:?} linked twice", id))
            }
            ChainError::UnknownBlock(id) => {
                CompilerError::internal(format!("block {:?} does not exist", id))
            }
        })
    }

    /// Whether the last instruction of the current block is a return.
    pub fn ends_with_return(&self) -> bool {
        self.chain
            .current()
            .last()
            .is_some_and(|instr| instr.op == Op::Ret)
    }

    // =========================================================================
    // Emission
    // =========================================================================

    pub fn set_line(&mut self, line: usize) {
        self.line = line as u32;
    }

    /// Append an instruction to the current block, applying its stack
    /// effect.
    pub fn emit(&mut self, op: Op, arg: u32) -> Result<(), CompilerError> {
        self.emit_instr(op, arg, None)
    }

    /// Append a jump to `target`.
    pub fn emit_jump(&mut self, op: Op, target: BlockId) -> Result<(), CompilerError> {
        if !op.is_jump() {
            return Err(CompilerError::internal(format!("{} is not a jump", op)));
        }
        self.emit_instr(op, 0, Some(target))
    }

    fn emit_instr(&mut self, op: Op, arg: u32, target: Option<BlockId>) -> Result<(), CompilerError> {
        let effect = op.stack_effect(arg);
        let next = self.stack.current as i64 + effect as i64;
        if next < 0 {
            return Err(CompilerError::internal(format!(
                "stack underflow emitting {} in {}",
                op, self.qualname
            )));
        }
        self.stack.current = next as usize;
        self.stack.required = self.stack.required.max(self.stack.current);
        let line = self.line;
        self.chain.current_mut().add_instr(op, arg, target, line);
        Ok(())
    }

    /// Account for values a merging control path brings back onto the
    /// stack.
    pub fn increment_stack(&mut self, n: usize) {
        self.stack.current += n;
        self.stack.required = self.stack.required.max(self.stack.current);
    }

    /// Account for values that only one of two merging paths pushed.
    pub fn decrement_stack(&mut self, n: usize) -> Result<(), CompilerError> {
        self.stack.current = self.stack.current.checked_sub(n).ok_or_else(|| {
            CompilerError::internal(format!("stack underflow in {}", self.qualname))
        })?;
        Ok(())
    }

    // =========================================================================
    // Tables
    // =========================================================================

    /// Slot of `value` in this unit's static table.
    pub fn add_static(&mut self, value: Rc<Constant>) -> u32 {
        let key = Rc::as_ptr(&value);
        if let Some(&idx) = self.statics_index.get(&key) {
            return idx;
        }
        let idx = self.statics.len() as u32;
        self.statics.push(value);
        self.statics_index.insert(key, idx);
        idx
    }

    /// Slot of `name` in this unit's names table.
    pub fn add_name(&mut self, name: &Rc<str>) -> u32 {
        self.names.get_or_insert(name.clone(), name)
    }

    /// Local slot backing the symbol with id `symbol`.
    pub fn local_slot(&mut self, symbol: usize, name: &Rc<str>) -> u32 {
        self.locals.get_or_insert(symbol, name)
    }

    /// Existing local slot of a symbol, if one was assigned.
    pub fn find_local(&self, symbol: usize) -> Option<u32> {
        self.locals.index.get(&symbol).copied()
    }

    /// Slot of a captured name in this unit's enclosed table.
    pub fn add_enclosed(&mut self, name: &Rc<str>) -> u32 {
        self.enclosed.get_or_insert(name.clone(), name)
    }

    pub fn find_enclosed(&self, name: &str) -> Option<u32> {
        self.enclosed.index.get(name).copied()
    }

    /// Captured names in cell order.
    pub fn enclosed_names(&self) -> &[Rc<str>] {
        &self.enclosed.items
    }

    // =========================================================================
    // Loop targets
    // =========================================================================

    /// Remember `label` for the loop or switch about to be pushed at the
    /// current nesting.
    pub fn set_pending_label(&mut self, label: Rc<str>) {
        self.pending_label = Some((label, self.symbols.nesting()));
    }

    /// Push a break/continue target, adopting a pending label declared at
    /// the same nesting.
    pub fn push_loop_target(
        &mut self,
        kind: JBlockKind,
        start: Option<BlockId>,
        end: BlockId,
        pops: usize,
    ) {
        let nested = self.symbols.nesting();
        let label = match self.pending_label.take() {
            Some((label, at)) if at == nested => Some(label),
            _ => None,
        };
        self.jblocks.push(JBlock {
            label,
            start,
            end,
            nested,
            pops,
            kind,
        });
    }

    /// Push a labeled non-loop target.
    pub fn push_label_target(&mut self, label: Rc<str>, end: BlockId) {
        self.pending_label = None;
        self.jblocks.push(JBlock {
            label: Some(label),
            start: None,
            end,
            nested: self.symbols.nesting(),
            pops: 0,
            kind: JBlockKind::Block,
        });
    }

    pub fn pop_loop_target(&mut self) -> Option<JBlock> {
        self.jblocks.pop()
    }

    /// Values every active construct keeps on the stack. A `return` pops
    /// them before loading its result.
    pub fn held_values(&self) -> usize {
        self.jblocks.iter().map(|jb| jb.pops).sum()
    }

    /// Resolve a `break` (or `continue`) with an optional label.
    ///
    /// Unlabeled breaks go to the innermost loop or switch and unlabeled
    /// continues to the innermost loop. Labeled jumps match by name and by
    /// the nesting of the visible label symbol, so an outer label stays
    /// reachable from unlabeled inner loops and a shadowed label does not.
    pub fn find_loop_target(
        &self,
        label: Option<&str>,
        is_continue: bool,
    ) -> Result<LoopTarget, String> {
        let label_nesting = label.and_then(|name| {
            self.symbols
                .lookup(name)
                .filter(|sym| sym.kind == SymbolKind::Label)
                .map(|sym| sym.nested)
        });
        let mut pops = 0;
        for jb in self.jblocks.iter().rev() {
            let matched = match label {
                Some(label) => {
                    jb.label.as_deref() == Some(label) && Some(jb.nested) == label_nesting
                }
                None if is_continue => jb.kind == JBlockKind::Loop,
                None => jb.kind != JBlockKind::Block,
            };
            if matched {
                let block = if is_continue {
                    jb.start.ok_or_else(|| match label {
                        Some(label) => format!("cannot continue to non-loop label '{}'", label),
                        None => "continue outside loop".to_string(),
                    })?
                } else {
                    jb.end
                };
                return Ok(LoopTarget { block, pops });
            }
            pops += jb.pops;
        }
        Err(match (label, is_continue) {
            (Some(label), _) => format!("unknown label '{}'", label),
            (None, true) => "continue outside loop".to_string(),
            (None, false) => "break outside loop or switch".to_string(),
        })
    }

    // =========================================================================
    // Rollback
    // =========================================================================

    pub fn mark(&self) -> Mark {
        Mark {
            chain: self.chain.mark(),
            jblocks: self.jblocks.len(),
            stack: self.stack,
            nesting: self.symbols.nesting(),
        }
    }

    /// Discard everything a failed construct added since `mark`.
    pub fn rollback(&mut self, mark: Mark) {
        trace!(
            "{}: rollback to {} blocks, {} jblocks",
            self.qualname,
            self.chain.order().len(),
            mark.jblocks
        );
        self.chain.rollback(mark.chain);
        self.jblocks.truncate(mark.jblocks);
        self.stack = mark.stack;
        self.pending_label = None;
        while self.symbols.nesting() > mark.nesting {
            if self.symbols.exit_sub_scope().is_err() {
                break;
            }
        }
    }

    // =========================================================================
    // Assembly
    // =========================================================================

    /// Lay out the block chain and encode it into an immutable [`Code`].
    ///
    /// The first pass assigns every linked block its byte offset; the second
    /// encodes each instruction, replacing jump targets with those offsets.
    pub fn assemble(mut self, filename: Option<Rc<str>>) -> Result<Code, CompilerError> {
        if self.kind.is_overlay() {
            return Err(CompilerError::internal(format!(
                "{} is an overlay and has no code of its own",
                self.qualname
            )));
        }
        if self.stack.current != 0 {
            return Err(CompilerError::internal(format!(
                "unbalanced stack in {}: {} values left",
                self.qualname, self.stack.current
            )));
        }
        if !self.jblocks.is_empty() {
            return Err(CompilerError::internal(format!(
                "{} loop targets still open in {}",
                self.jblocks.len(),
                self.qualname
            )));
        }

        let order: Vec<BlockId> = self.chain.order().to_vec();
        let mut offset = 0;
        for &id in &order {
            if let Some(block) = self.chain.get_mut(id) {
                block.offset = offset;
                offset += block.size;
            }
        }

        let mut instructions = Vec::with_capacity(offset);
        let mut lines: Vec<LineEntry> = Vec::new();
        for &id in &order {
            let Some(block) = self.chain.get(id) else {
                continue;
            };
            for instr in &block.instrs {
                let arg = match instr.target {
                    Some(target) => {
                        let dest = self
                            .chain
                            .get(target)
                            .filter(|b| b.is_linked())
                            .ok_or_else(|| {
                                CompilerError::internal(format!(
                                    "{} in {} jumps to unlinked block {:?}",
                                    instr.op, self.qualname, target
                                ))
                            })?;
                        dest.offset as u32
                    }
                    None => instr.arg,
                };
                if lines.last().is_none_or(|entry| entry.line != instr.line) {
                    lines.push(LineEntry {
                        offset: instructions.len() as u32,
                        line: instr.line,
                    });
                }
                encode(instr.op, arg, &mut instructions)?;
            }
        }

        debug!(
            "assembled {}: {} blocks, {} bytes, stack {}",
            self.qualname,
            order.len(),
            instructions.len(),
            self.stack.required
        );

        Ok(Code {
            name: self.name,
            qualname: self.qualname,
            filename,
            instructions,
            statics: self.statics,
            names: self.names.items,
            locals: self.locals.items,
            enclosed: self.enclosed.items,
            stack_size: self.stack.required,
            arity: self.arity,
            flags: self.flags,
            lines,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon_bytecode::{Interner, verify};

    fn unit() -> TranslationUnit {
        TranslationUnit::new(UnitKind::Function, Rc::from("f"), Rc::from("main.f"))
    }

    #[test]
    fn test_emit_tracks_stack() {
        let mut u = unit();
        u.emit(Op::Nil, 0).unwrap();
        u.emit(Op::Nil, 0).unwrap();
        u.emit(Op::BuildList, 2).unwrap();
        assert_eq!(u.stack, StackDepth { current: 1, required: 2 });
        u.emit(Op::PopTop, 0).unwrap();
        assert!(matches!(
            u.emit(Op::PopTop, 0),
            Err(CompilerError::Internal { .. })
        ));
    }

    #[test]
    fn test_assemble_resolves_jumps() {
        let mut u = unit();
        let end = u.block_alloc();
        u.emit(Op::True, 0).unwrap();
        u.emit_jump(Op::JumpIfFalse, end).unwrap();
        let body = u.block_new();
        u.emit(Op::Nil, 0).unwrap();
        u.emit(Op::PopTop, 0).unwrap();
        u.block_append(end).unwrap();
        u.emit(Op::Nil, 0).unwrap();
        u.emit(Op::Ret, 0).unwrap();
        assert_ne!(body, end);

        let code = u.assemble(None).unwrap();
        let instrs: Vec<_> = code.decode().collect::<Result<_, _>>().unwrap();
        // True(0) JumpIfFalse(1) Nil(5) PopTop(6) Nil(7) Ret(8)
        assert_eq!(instrs[1].op, Op::JumpIfFalse);
        assert_eq!(instrs[1].arg, 7);
        assert_eq!(instrs[4].offset, 7);
        assert_eq!(code.stack_size, 1);
        assert!(verify(&code).is_ok());
    }

    #[test]
    fn test_assemble_rejects_unlinked_target() {
        let mut u = unit();
        let nowhere = u.block_alloc();
        u.emit_jump(Op::Jump, nowhere).unwrap();
        let err = u.assemble(None).unwrap_err();
        assert!(matches!(err, CompilerError::Internal { .. }));
    }

    #[test]
    fn test_assemble_rejects_unbalanced_stack() {
        let mut u = unit();
        u.emit(Op::Nil, 0).unwrap();
        assert!(matches!(
            u.assemble(None),
            Err(CompilerError::Internal { .. })
        ));
    }

    #[test]
    fn test_assemble_operand_overflow_is_capacity() {
        let mut u = unit();
        u.emit(Op::LoadLocal, 300).unwrap();
        u.emit(Op::Ret, 0).unwrap();
        assert!(matches!(
            u.assemble(None),
            Err(CompilerError::Capacity { .. })
        ));
    }

    #[test]
    fn test_empty_unit_assembles() {
        let code = unit().assemble(None).unwrap();
        assert!(code.instructions.is_empty());
        assert_eq!(code.stack_size, 0);
    }

    #[test]
    fn test_line_table() {
        let mut u = unit();
        u.set_line(0);
        u.emit(Op::Nil, 0).unwrap();
        u.emit(Op::PopTop, 0).unwrap();
        u.set_line(3);
        u.emit(Op::Nil, 0).unwrap();
        u.emit(Op::Ret, 0).unwrap();
        let code = u.assemble(None).unwrap();
        assert_eq!(
            code.lines,
            vec![
                LineEntry { offset: 0, line: 0 },
                LineEntry { offset: 2, line: 3 }
            ]
        );
    }

    #[test]
    fn test_tables_deduplicate() {
        let mut interner = Interner::new();
        let mut u = unit();
        let one = interner.int(1);
        assert_eq!(u.add_static(one.clone()), 0);
        assert_eq!(u.add_static(interner.int(2)), 1);
        assert_eq!(u.add_static(one), 0);

        let x: Rc<str> = Rc::from("x");
        assert_eq!(u.add_name(&x), 0);
        assert_eq!(u.add_name(&x), 0);

        assert_eq!(u.local_slot(4, &x), 0);
        assert_eq!(u.local_slot(7, &x), 1);
        assert_eq!(u.find_local(4), Some(0));
        assert_eq!(u.find_local(5), None);

        assert_eq!(u.add_enclosed(&x), 0);
        assert_eq!(u.find_enclosed("x"), Some(0));
        assert_eq!(u.enclosed_names().len(), 1);
    }

    #[test]
    fn test_loop_targets() {
        let mut u = unit();
        let outer_start = u.block_new();
        let outer_end = u.block_alloc();
        u.symbols.insert(Rc::from("outer"), SymbolKind::Label).unwrap();
        u.set_pending_label(Rc::from("outer"));
        u.push_loop_target(JBlockKind::Loop, Some(outer_start), outer_end, 1);

        u.symbols.enter_sub_scope();
        let switch_end = u.block_alloc();
        u.push_loop_target(JBlockKind::Switch, None, switch_end, 1);

        let inner_start = u.block_new();
        let inner_end = u.block_alloc();
        u.push_loop_target(JBlockKind::Loop, Some(inner_start), inner_end, 0);

        assert_eq!(
            u.find_loop_target(None, false),
            Ok(LoopTarget { block: inner_end, pops: 0 })
        );
        assert_eq!(
            u.find_loop_target(Some("outer"), true),
            Ok(LoopTarget { block: outer_start, pops: 1 })
        );
        assert_eq!(
            u.find_loop_target(Some("outer"), false),
            Ok(LoopTarget { block: outer_end, pops: 1 })
        );
        assert!(u.find_loop_target(Some("nope"), false).is_err());
        assert_eq!(u.held_values(), 2);

        u.pop_loop_target();
        assert_eq!(
            u.find_loop_target(None, false),
            Ok(LoopTarget { block: switch_end, pops: 0 })
        );
        assert_eq!(
            u.find_loop_target(None, true),
            Ok(LoopTarget { block: outer_start, pops: 1 })
        );
    }

    #[test]
    fn test_pending_label_requires_same_nesting() {
        let mut u = unit();
        u.symbols.insert(Rc::from("l"), SymbolKind::Label).unwrap();
        u.set_pending_label(Rc::from("l"));
        u.symbols.enter_sub_scope();
        let end = u.block_alloc();
        u.push_loop_target(JBlockKind::Loop, None, end, 0);
        assert!(u.find_loop_target(Some("l"), false).is_err());
    }

    #[test]
    fn test_labeled_block_target() {
        let mut u = unit();
        let end = u.block_alloc();
        u.symbols.insert(Rc::from("done"), SymbolKind::Label).unwrap();
        u.push_label_target(Rc::from("done"), end);
        assert_eq!(
            u.find_loop_target(Some("done"), false),
            Ok(LoopTarget { block: end, pops: 0 })
        );
        assert!(u.find_loop_target(Some("done"), true).is_err());
        assert!(u.find_loop_target(None, false).is_err());
    }

    #[test]
    fn test_label_matches_symbol_nesting() {
        let mut u = unit();
        u.symbols.insert(Rc::from("l"), SymbolKind::Label).unwrap();
        u.symbols.enter_sub_scope();
        let end = u.block_alloc();
        u.push_label_target(Rc::from("l"), end);
        assert_eq!(
            u.find_loop_target(Some("l"), false),
            Err("unknown label 'l'".to_string())
        );

        u.symbols.insert(Rc::from("l"), SymbolKind::Label).unwrap();
        assert_eq!(
            u.find_loop_target(Some("l"), false),
            Ok(LoopTarget { block: end, pops: 0 })
        );

        u.symbols.insert(Rc::from("v"), SymbolKind::Variable).unwrap();
        u.push_label_target(Rc::from("v"), end);
        assert!(u.find_loop_target(Some("v"), false).is_err());
    }

    #[test]
    fn test_rollback() {
        let mut u = unit();
        u.emit(Op::Nil, 0).unwrap();
        let mark = u.mark();

        u.symbols.enter_sub_scope();
        let end = u.block_alloc();
        u.push_loop_target(JBlockKind::Loop, None, end, 0);
        u.emit(Op::Nil, 0).unwrap();
        u.block_new();

        u.rollback(mark);
        assert_eq!(u.stack.current, 1);
        assert_eq!(u.symbols.nesting(), 0);
        assert_eq!(u.chain.order().len(), 1);
        assert_eq!(u.chain.allocated(), 1);
        assert!(u.pop_loop_target().is_none());
    }
}
