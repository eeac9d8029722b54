//! Basic blocks and the per-unit block chain.
//!
//! Blocks live in an arena owned by the chain and are referred to by
//! [`BlockId`]. A block is either linked (part of the emission order) or
//! unlinked (allocated ahead of time as a jump destination). Only linked
//! blocks are assembled.

use argon_bytecode::Op;

/// Index of a block in its chain's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One instruction awaiting assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub op: Op,
    pub arg: u32,
    /// Jump destination, resolved to a byte offset during assembly.
    pub target: Option<BlockId>,
    /// 0-indexed source line.
    pub line: u32,
}

/// A straight-line run of instructions.
#[derive(Debug, Default)]
pub struct BasicBlock {
    pub instrs: Vec<Instr>,
    /// Encoded size in bytes.
    pub size: usize,
    /// Byte offset, valid after assembly.
    pub offset: usize,
    linked: bool,
}

impl BasicBlock {
    pub fn add_instr(&mut self, op: Op, arg: u32, target: Option<BlockId>, line: u32) {
        self.size += op.width();
        self.instrs.push(Instr {
            op,
            arg,
            target,
            line,
        });
    }

    pub fn last(&self) -> Option<&Instr> {
        self.instrs.last()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    fn truncate(&mut self, len: usize) {
        for instr in self.instrs.drain(len.min(self.instrs.len())..) {
            self.size -= instr.op.width();
        }
    }
}

/// Snapshot of a chain, used to discard a construct's partial output.
#[derive(Debug, Clone, Copy)]
pub struct ChainMark {
    blocks: usize,
    order: usize,
    current: BlockId,
    instrs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    AlreadyLinked(BlockId),
    UnknownBlock(BlockId),
}

/// Block arena plus the order blocks were linked in.
#[derive(Debug)]
pub struct BlockChain {
    blocks: Vec<BasicBlock>,
    order: Vec<BlockId>,
    current: BlockId,
}

impl Default for BlockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockChain {
    /// Create a chain holding one linked, current block.
    pub fn new() -> Self {
        let entry = BasicBlock {
            linked: true,
            ..BasicBlock::default()
        };
        Self {
            blocks: vec![entry],
            order: vec![BlockId(0)],
            current: BlockId(0),
        }
    }

    /// Allocate a block without linking it.
    pub fn alloc(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::default());
        id
    }

    /// Link a previously allocated block at the end of the chain and make
    /// it current.
    pub fn append(&mut self, id: BlockId) -> Result<(), ChainError> {
        let block = self
            .blocks
            .get_mut(id.index())
            .ok_or(ChainError::UnknownBlock(id))?;
        if block.linked {
            return Err(ChainError::AlreadyLinked(id));
        }
        block.linked = true;
        self.order.push(id);
        self.current = id;
        Ok(())
    }

    /// Allocate, link and switch to a new block.
    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock {
            linked: true,
            ..BasicBlock::default()
        });
        self.order.push(id);
        self.current = id;
        id
    }

    pub fn current_id(&self) -> BlockId {
        self.current
    }

    pub fn current(&self) -> &BasicBlock {
        &self.blocks[self.current.index()]
    }

    pub fn current_mut(&mut self) -> &mut BasicBlock {
        &mut self.blocks[self.current.index()]
    }

    pub fn get(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.index())
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(id.index())
    }

    /// Linked blocks in emission order.
    pub fn order(&self) -> &[BlockId] {
        &self.order
    }

    /// Number of blocks in the arena, linked or not.
    pub fn allocated(&self) -> usize {
        self.blocks.len()
    }

    pub fn mark(&self) -> ChainMark {
        ChainMark {
            blocks: self.blocks.len(),
            order: self.order.len(),
            current: self.current,
            instrs: self.current().instrs.len(),
        }
    }

    /// Restore the chain to `mark`: blocks linked since are unlinked, blocks
    /// allocated since are dropped and the marked block loses any
    /// instructions added after the mark.
    pub fn rollback(&mut self, mark: ChainMark) {
        for id in self.order.drain(mark.order.min(self.order.len())..) {
            if let Some(block) = self.blocks.get_mut(id.index()) {
                block.linked = false;
            }
        }
        self.blocks.truncate(mark.blocks);
        self.current = mark.current;
        if let Some(block) = self.blocks.get_mut(mark.current.index()) {
            block.truncate(mark.instrs);
        }
    }
}
