//! Bytecode compiler for Argon.
//!
//! The compiler walks a [`Module`] and lowers each node into the current
//! translation unit, opening a nested unit for every function, struct and
//! trait body. Statements leave the operand stack as they found it;
//! expressions leave exactly one value on it. Function units are assembled
//! into [`Code`] objects as soon as their body is finished and embedded in
//! the enclosing unit's static table.

use crate::basic_block::BlockId;
use crate::error::CompilerError;
use crate::symbol_table::{SymbolError, SymbolKind};
use crate::unit::{JBlockKind, TranslationUnit, UnitKind};
use argon_ast::*;
use argon_bytecode::{
    BinaryOpType, CallFlags, Code, CodeFlags, CompareOpType, Constant, DeclFlags, Op,
    SharedInterner, pack_call, pack_decl,
};
use log::{debug, warn};
use rustc_hash::FxHashMap;
use std::rc::Rc;

type Result<T> = std::result::Result<T, CompilerError>;

/// Compiler configuration.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Name of the module code object when the tree does not carry one.
    pub module_name: String,
    /// Source filename, recorded in every code object.
    pub filename: String,
    /// Names provided by the runtime. They resolve as module constants.
    pub builtins: Vec<String>,
    /// Interning pool for constants and names. Compilers without one share
    /// the pool of the current thread.
    pub interner: Option<SharedInterner>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            module_name: "main".to_string(),
            filename: String::new(),
            builtins: Vec::new(),
            interner: None,
        }
    }
}

/// Storage class chosen for one identifier reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Storage {
    Local(u32),
    Enclosed(u32),
    Global(u32),
}

/// Bytecode compiler for Argon.
pub struct Compiler {
    /// Open translation units, module first.
    units: Vec<TranslationUnit>,
    interner: SharedInterner,
    filename: Option<Rc<str>>,
    module_name: String,
    builtins: Vec<String>,
    /// First store to each module name made before it was declared.
    forward_stores: FxHashMap<Rc<str>, Position>,
}

impl Compiler {
    /// Create a new compiler.
    pub fn new(config: CompilerConfig) -> Self {
        let interner = config.interner.unwrap_or_else(SharedInterner::global);
        let filename = if config.filename.is_empty() {
            None
        } else {
            Some(Rc::from(config.filename.as_str()))
        };
        Self {
            units: Vec::new(),
            interner,
            filename,
            module_name: config.module_name,
            builtins: config.builtins,
            forward_stores: FxHashMap::default(),
        }
    }

    /// Compile a module to bytecode.
    pub fn compile(mut self, module: &Module) -> Result<Rc<Code>> {
        let result = self.compile_module(module);
        if result.is_err() && !self.units.is_empty() {
            warn!(
                "compilation aborted with {} open translation units",
                self.units.len()
            );
            self.units.clear();
        }
        result
    }

    fn compile_module(&mut self, module: &Module) -> Result<Rc<Code>> {
        let name = if module.name.is_empty() {
            self.interner.name(&self.module_name)
        } else {
            self.interner.name(&module.name)
        };
        debug!("compiling module {} ({} statements)", name, module.stmts.len());

        let mut unit = TranslationUnit::new(UnitKind::Module, name.clone(), name);
        for builtin in &self.builtins {
            let builtin = self.interner.name(builtin);
            unit.symbols
                .insert(builtin.clone(), SymbolKind::Constant)
                .map_err(|_| CompilerError::redeclaration(&builtin, Position::default()))?;
        }
        self.units.push(unit);

        for stmt in &module.stmts {
            self.compile_stmt(stmt)?;
        }
        self.emit_implicit_return()?;

        let unit = self.pop_unit()?;
        Ok(Rc::new(unit.assemble(self.filename.clone())?))
    }

    // ===========================================================================
    // Unit access
    // ===========================================================================

    fn unit(&self) -> Result<&TranslationUnit> {
        self.units
            .last()
            .ok_or_else(|| CompilerError::internal("no open translation unit"))
    }

    fn unit_mut(&mut self) -> Result<&mut TranslationUnit> {
        self.units
            .last_mut()
            .ok_or_else(|| CompilerError::internal("no open translation unit"))
    }

    /// Index of the innermost unit that owns a block chain.
    fn frame_index(&self) -> Result<usize> {
        self.units
            .iter()
            .rposition(|unit| !unit.kind.is_overlay())
            .ok_or_else(|| CompilerError::internal("no open translation unit"))
    }

    fn frame(&self) -> Result<&TranslationUnit> {
        let idx = self.frame_index()?;
        Ok(&self.units[idx])
    }

    fn frame_mut(&mut self) -> Result<&mut TranslationUnit> {
        let idx = self.frame_index()?;
        Ok(&mut self.units[idx])
    }

    fn pop_unit(&mut self) -> Result<TranslationUnit> {
        self.units
            .pop()
            .ok_or_else(|| CompilerError::internal("no open translation unit"))
    }

    /// Run `f`, discarding everything it added to the current frame if it
    /// fails.
    fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let depth = self.units.len();
        let frame = self.frame_index()?;
        let mark = self.units[frame].mark();
        let result = f(self);
        if result.is_err() {
            self.units.truncate(depth);
            if let Some(unit) = self.units.get_mut(frame) {
                unit.rollback(mark);
            }
        }
        result
    }

    // ===========================================================================
    // Emission helpers
    // ===========================================================================

    fn emit(&mut self, op: Op, arg: u32) -> Result<()> {
        self.frame_mut()?.emit(op, arg)
    }

    /// Emit a jump and start a fresh block after it.
    fn jump(&mut self, op: Op, target: BlockId) -> Result<()> {
        let frame = self.frame_mut()?;
        frame.emit_jump(op, target)?;
        frame.block_new();
        Ok(())
    }

    fn block_alloc(&mut self) -> Result<BlockId> {
        Ok(self.frame_mut()?.block_alloc())
    }

    fn block_append(&mut self, id: BlockId) -> Result<()> {
        self.frame_mut()?.block_append(id)
    }

    fn set_line(&mut self, pos: Position) -> Result<()> {
        self.frame_mut()?.set_line(pos.line);
        Ok(())
    }

    fn load_const(&mut self, value: Rc<Constant>) -> Result<()> {
        let frame = self.frame_mut()?;
        let idx = frame.add_static(value);
        frame.emit(Op::LoadConst, idx)
    }

    fn load_string(&mut self, value: &str) -> Result<()> {
        let value = self.interner.string(value);
        self.load_const(value)
    }

    fn name_index(&mut self, name: &str) -> Result<u32> {
        let name = self.interner.name(name);
        Ok(self.frame_mut()?.add_name(&name))
    }

    fn enter_sub_scope(&mut self) -> Result<()> {
        self.frame_mut()?.symbols.enter_sub_scope();
        Ok(())
    }

    fn exit_sub_scope(&mut self) -> Result<()> {
        self.frame_mut()?
            .symbols
            .exit_sub_scope()
            .map_err(|err| CompilerError::internal(err.to_string()))
    }

    fn emit_implicit_return(&mut self) -> Result<()> {
        let frame = self.frame_mut()?;
        if frame.ends_with_return() {
            return Ok(());
        }
        if frame.flags.contains(CodeFlags::GENERATOR) {
            frame.emit(Op::Stop, 0)?;
        } else {
            frame.emit(Op::Nil, 0)?;
        }
        frame.emit(Op::Ret, 0)
    }

    // ===========================================================================
    // Symbols
    // ===========================================================================

    /// Declare `ident` in the innermost unit, returning the symbol id and
    /// nesting.
    ///
    /// A module-level declaration that cannot be assigned fails if code
    /// compiled earlier already stores to the name.
    fn declare(&mut self, ident: &Ident, kind: SymbolKind) -> Result<(usize, usize)> {
        let name = self.interner.name(&ident.name);
        let at_module = self.units.len() == 1;
        let unit = self.unit_mut()?;
        let (id, nested) = match unit.symbols.insert(name.clone(), kind) {
            Ok(symbol) => (symbol.id, symbol.nested),
            Err(SymbolError::Redeclared { .. }) => {
                return Err(CompilerError::redeclaration(&ident.name, ident.position));
            }
            Err(err) => return Err(CompilerError::internal(err.to_string())),
        };
        if at_module && nested == 0 && !kind.is_assignable() {
            if let Some(&position) = self.forward_stores.get(&name) {
                return Err(CompilerError::new(
                    format!("cannot assign to {} '{}'", kind, ident.name),
                    position,
                ));
            }
        }
        Ok((id, nested))
    }

    /// Store TOS into a freshly declared symbol.
    fn store_declaration(
        &mut self,
        ident: &Ident,
        id: usize,
        nested: usize,
        flags: DeclFlags,
    ) -> Result<()> {
        let name = self.interner.name(&ident.name);
        let frame = self.frame_mut()?;
        if frame.kind == UnitKind::Module && nested == 0 {
            let idx = frame.add_name(&name);
            let idx = u16::try_from(idx).map_err(|_| CompilerError::Capacity {
                message: format!("too many global names in {}", frame.qualname),
            })?;
            frame.emit(Op::DeclareGlobal, pack_decl(idx, flags))
        } else {
            let slot = frame.local_slot(id, &name);
            frame.emit(Op::StoreLocal, slot)
        }
    }

    /// Decide where a reference to `ident` reads and writes.
    ///
    /// Units are searched innermost first, skipping struct and trait
    /// overlays. Module-level symbols are globals, symbols of the current
    /// frame are locals and symbols of an enclosing function become closure
    /// cells threaded through every function in between. Unknown names are
    /// globals.
    fn resolve(&mut self, ident: &Ident) -> Result<(Storage, SymbolKind)> {
        let name = self.interner.name(&ident.name);
        let frame = self.frame_index()?;

        let found = self
            .units
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, unit)| !unit.kind.is_overlay())
            .find_map(|(i, unit)| {
                unit.symbols
                    .lookup(&name)
                    .map(|sym| (i, sym.id, sym.nested, sym.kind))
            });

        let Some((owner, id, nested, kind)) = found else {
            let module = self
                .units
                .first_mut()
                .ok_or_else(|| CompilerError::internal("no module unit"))?;
            module.symbols.reference(name.clone());
            let idx = self.units[frame].add_name(&name);
            return Ok((Storage::Global(idx), SymbolKind::Unknown));
        };

        if kind == SymbolKind::Label {
            return Err(CompilerError::new(
                format!("label '{}' used as a value", ident.name),
                ident.position,
            ));
        }

        let storage = if self.units[owner].kind == UnitKind::Module && nested == 0 {
            Storage::Global(self.units[frame].add_name(&name))
        } else if owner == frame {
            Storage::Local(self.units[frame].local_slot(id, &name))
        } else {
            self.units[owner].symbols.mark_free(id);
            let mut idx = 0;
            for unit in &mut self.units[owner + 1..] {
                if unit.kind == UnitKind::Function {
                    idx = unit.add_enclosed(&name);
                }
            }
            Storage::Enclosed(idx)
        };
        Ok((storage, kind))
    }

    fn compile_load(&mut self, ident: &Ident) -> Result<()> {
        if ident.is_blank() {
            return Err(CompilerError::new("cannot use '_' as a value", ident.position));
        }
        match self.resolve(ident)?.0 {
            Storage::Local(slot) => self.emit(Op::LoadLocal, slot),
            Storage::Enclosed(idx) => self.emit(Op::LoadEnclosed, idx),
            Storage::Global(idx) => self.emit(Op::LoadGlobal, idx),
        }
    }

    /// Store TOS into an existing binding of `ident`.
    fn compile_store_ident(&mut self, ident: &Ident) -> Result<()> {
        if ident.is_blank() {
            return self.emit(Op::PopTop, 0);
        }
        let (storage, kind) = self.resolve(ident)?;
        if !kind.is_assignable() {
            return Err(CompilerError::new(
                format!("cannot assign to {} '{}'", kind, ident.name),
                ident.position,
            ));
        }
        if kind == SymbolKind::Unknown {
            let name = self.interner.name(&ident.name);
            self.forward_stores.entry(name).or_insert(ident.position);
        }
        match storage {
            Storage::Local(slot) => self.emit(Op::StoreLocal, slot),
            Storage::Enclosed(idx) => self.emit(Op::StoreEnclosed, idx),
            Storage::Global(idx) => self.emit(Op::StoreGlobal, idx),
        }
    }

    // ===========================================================================
    // Statement Compilation
    // ===========================================================================

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        self.set_line(stmt.pos())?;
        match stmt {
            Stmt::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::PopTop, 0)
            }
            Stmt::Var(decl) => self.compile_var(decl),
            Stmt::Assign(assign) => self.compile_assign(assign),
            Stmt::Func(func) => self.guarded(|c| c.compile_func_decl(func)),
            Stmt::Struct(decl) => self.guarded(|c| c.compile_type_decl(decl, false)),
            Stmt::Trait(decl) => self.guarded(|c| c.compile_type_decl(decl, true)),
            Stmt::Block(block) => self.compile_block(block),
            Stmt::If(stmt) => self.guarded(|c| c.compile_if(stmt)),
            Stmt::Loop(stmt) => self.guarded(|c| c.compile_loop(stmt)),
            Stmt::For(stmt) => self.guarded(|c| c.compile_for(stmt)),
            Stmt::ForEach(stmt) => self.guarded(|c| c.compile_for_each(stmt)),
            Stmt::Switch(stmt) => self.guarded(|c| c.compile_switch(stmt)),
            Stmt::Labeled(stmt) => self.guarded(|c| c.compile_labeled(stmt)),
            Stmt::Break(branch) => self.compile_branch(branch, false),
            Stmt::Continue(branch) => self.compile_branch(branch, true),
            Stmt::Fallthrough(pos) => Err(CompilerError::new(
                "fallthrough statement out of place",
                *pos,
            )),
            Stmt::Return(ret) => self.compile_return(ret),
            Stmt::Defer(stmt) => self.compile_deferred(stmt, Op::Defer),
            Stmt::Spawn(stmt) => self.compile_deferred(stmt, Op::Spawn),
            Stmt::Panic(stmt) => {
                self.compile_expr(&stmt.value)?;
                self.emit(Op::Panic, 0)
            }
        }
    }

    fn compile_block(&mut self, block: &Block) -> Result<()> {
        self.enter_sub_scope()?;
        for stmt in &block.stmts {
            self.compile_stmt(stmt)?;
        }
        self.exit_sub_scope()
    }

    fn compile_var(&mut self, decl: &VarDecl) -> Result<()> {
        if decl.names.is_empty() {
            return Err(CompilerError::new("declaration without names", decl.position));
        }
        match &decl.value {
            Some(value) => self.compile_expr(value)?,
            None if decl.names.len() > 1 => {
                return Err(CompilerError::new(
                    "declaring several names requires a value to unpack",
                    decl.position,
                ));
            }
            None => self.emit(Op::Nil, 0)?,
        }
        if decl.names.len() > 1 {
            self.emit(Op::Unpack, decl.names.len() as u32)?;
        }

        let kind = if decl.constant {
            SymbolKind::Constant
        } else {
            SymbolKind::Variable
        };
        let mut flags = DeclFlags::empty();
        if decl.constant {
            flags |= DeclFlags::CONSTANT;
        }
        if decl.public {
            flags |= DeclFlags::PUBLIC;
        }

        for ident in &decl.names {
            if ident.is_blank() {
                self.emit(Op::PopTop, 0)?;
                continue;
            }
            let (id, nested) = self.declare(ident, kind)?;
            self.store_declaration(ident, id, nested, flags)?;
        }
        Ok(())
    }

    fn compile_assign(&mut self, assign: &AssignStmt) -> Result<()> {
        if assign.targets.len() > 1 {
            if assign.op != TokenKind::Assign {
                return Err(CompilerError::new(
                    format!("'{}' requires a single assignment target", assign.op),
                    assign.position,
                ));
            }
            self.compile_expr(&assign.value)?;
            self.emit(Op::Unpack, assign.targets.len() as u32)?;
            for target in &assign.targets {
                match target {
                    Expr::Ident(ident) => self.compile_store_ident(ident)?,
                    other => {
                        return Err(CompilerError::new(
                            format!("cannot unpack into {}", other.kind()),
                            other.pos(),
                        ));
                    }
                }
            }
            return Ok(());
        }

        let Some(target) = assign.targets.first() else {
            return Err(CompilerError::new("assignment without a target", assign.position));
        };
        if assign.op == TokenKind::Assign {
            return self.compile_store(target, &assign.value);
        }
        let binop = assign
            .op
            .compound_operator()
            .and_then(binary_op_type)
            .ok_or_else(|| {
                CompilerError::new(
                    format!("invalid assignment operator '{}'", assign.op),
                    assign.position,
                )
            })?;
        self.compile_compound_assign(target, binop, &assign.value)
    }

    fn compile_store(&mut self, target: &Expr, value: &Expr) -> Result<()> {
        match target {
            Expr::Ident(ident) => {
                self.compile_expr(value)?;
                self.compile_store_ident(ident)
            }
            Expr::Selector(sel) => {
                if has_safe_navigation(sel) {
                    return Err(CompilerError::new("cannot assign through '?.'", sel.name.position));
                }
                self.compile_selector(sel, false, false)?;
                self.compile_expr(value)?;
                self.store_member(sel)
            }
            Expr::Index(expr) => {
                self.compile_expr(&expr.object)?;
                self.compile_expr(&expr.index)?;
                self.compile_expr(value)?;
                self.emit(Op::StoreSubscr, 0)
            }
            Expr::Slice(expr) => {
                self.compile_expr(&expr.object)?;
                self.compile_bounds(expr)?;
                self.compile_expr(value)?;
                self.emit(Op::StoreSubscr, 0)
            }
            other => Err(CompilerError::new(
                format!("cannot assign to {}", other.kind()),
                other.pos(),
            )),
        }
    }

    fn compile_compound_assign(&mut self, target: &Expr, op: BinaryOpType, value: &Expr) -> Result<()> {
        match target {
            Expr::Ident(ident) => {
                self.compile_load(ident)?;
                self.compile_expr(value)?;
                self.emit(Op::BinaryOp, op as u32)?;
                self.compile_store_ident(ident)
            }
            Expr::Selector(sel) => {
                if has_safe_navigation(sel) {
                    return Err(CompilerError::new("cannot assign through '?.'", sel.name.position));
                }
                self.compile_selector(sel, true, true)?;
                self.compile_expr(value)?;
                self.emit(Op::BinaryOp, op as u32)?;
                self.store_member(sel)
            }
            Expr::Index(expr) => {
                self.compile_expr(&expr.object)?;
                self.compile_expr(&expr.index)?;
                self.emit(Op::Dup, 2)?;
                self.emit(Op::BinarySubscr, 0)?;
                self.compile_expr(value)?;
                self.emit(Op::BinaryOp, op as u32)?;
                self.emit(Op::StoreSubscr, 0)
            }
            Expr::Slice(expr) => {
                self.compile_expr(&expr.object)?;
                self.compile_bounds(expr)?;
                self.emit(Op::Dup, 2)?;
                self.emit(Op::BinarySubscr, 0)?;
                self.compile_expr(value)?;
                self.emit(Op::BinaryOp, op as u32)?;
                self.emit(Op::StoreSubscr, 0)
            }
            other => Err(CompilerError::new(
                format!("cannot assign to {}", other.kind()),
                other.pos(),
            )),
        }
    }

    fn store_member(&mut self, sel: &Selector) -> Result<()> {
        let idx = self.name_index(&sel.name.name)?;
        let op = match sel.kind {
            SelectorKind::Scope => Op::StoreScope,
            _ => Op::StoreAttr,
        };
        self.emit(op, idx)
    }

    fn compile_func_decl(&mut self, func: &FuncDecl) -> Result<()> {
        let Some(ident) = &func.name else {
            return Err(CompilerError::new(
                "function declaration without a name",
                func.position,
            ));
        };
        let kind = if stmts_yield(&func.body.stmts) {
            SymbolKind::Generator
        } else {
            SymbolKind::Function
        };
        let (id, nested) = self.declare(ident, kind)?;
        let name = self.interner.name(&ident.name);
        self.compile_function(func, name, false)?;

        let mut flags = DeclFlags::CONSTANT;
        if func.public {
            flags |= DeclFlags::PUBLIC;
        }
        self.store_declaration(ident, id, nested, flags)
    }

    fn compile_type_decl(&mut self, decl: &TypeDecl, is_trait: bool) -> Result<()> {
        let (kind, unit_kind, what) = if is_trait {
            (SymbolKind::Trait, UnitKind::Trait, "trait")
        } else {
            (SymbolKind::Struct, UnitKind::Struct, "struct")
        };
        let (id, nested) = self.declare(&decl.name, kind)?;
        self.load_string(&decl.name.name)?;

        let name = self.interner.name(&decl.name.name);
        let qualname = self
            .interner
            .name(&format!("{}.{}", self.unit()?.qualname, name));
        self.units.push(TranslationUnit::new(unit_kind, name, qualname));

        let mut members = 0u32;
        for stmt in &decl.body {
            self.set_line(stmt.pos())?;
            match stmt {
                Stmt::Var(var) if !is_trait => {
                    let [ident] = var.names.as_slice() else {
                        return Err(CompilerError::new(
                            "struct members must be declared one at a time",
                            var.position,
                        ));
                    };
                    let kind = if var.constant {
                        SymbolKind::Constant
                    } else {
                        SymbolKind::Variable
                    };
                    self.declare(ident, kind)?;
                    self.load_string(&ident.name)?;
                    match &var.value {
                        Some(value) => self.compile_expr(value)?,
                        None => self.emit(Op::Nil, 0)?,
                    }
                }
                Stmt::Func(func) => {
                    let Some(ident) = &func.name else {
                        return Err(CompilerError::new("method without a name", func.position));
                    };
                    self.declare(ident, SymbolKind::Function)?;
                    self.load_string(&ident.name)?;
                    let method = self.interner.name(&ident.name);
                    self.compile_function(func, method, true)?;
                }
                other => {
                    return Err(CompilerError::new(
                        format!("unexpected {} statement in {} body", other.kind(), what),
                        other.pos(),
                    ));
                }
            }
            members += 1;
        }

        self.pop_unit()?;
        self.emit(Op::BuildMap, members)?;
        for imp in &decl.impls {
            self.compile_expr(imp)?;
        }
        self.emit(Op::BuildTuple, decl.impls.len() as u32)?;
        self.emit(if is_trait { Op::MakeTrait } else { Op::MakeStruct }, 0)?;

        let mut flags = DeclFlags::CONSTANT;
        if decl.public {
            flags |= DeclFlags::PUBLIC;
        }
        self.store_declaration(&decl.name, id, nested, flags)
    }

    fn compile_if(&mut self, stmt: &IfStmt) -> Result<()> {
        self.compile_expr(&stmt.cond)?;
        let orelse_block = self.block_alloc()?;
        self.jump(Op::JumpIfFalse, orelse_block)?;
        self.compile_block(&stmt.then)?;

        let Some(orelse) = &stmt.orelse else {
            return self.block_append(orelse_block);
        };
        let end = self.block_alloc()?;
        self.jump(Op::Jump, end)?;
        self.block_append(orelse_block)?;
        match orelse.as_ref() {
            Stmt::If(elif) => {
                self.set_line(elif.position)?;
                self.compile_if(elif)?;
            }
            Stmt::Block(block) => self.compile_block(block)?,
            other => {
                return Err(CompilerError::new(
                    format!("unexpected {} statement in else branch", other.kind()),
                    other.pos(),
                ));
            }
        }
        self.block_append(end)
    }

    fn compile_loop(&mut self, stmt: &LoopStmt) -> Result<()> {
        let header = self.frame_mut()?.block_new();
        let end = self.block_alloc()?;
        if let Some(cond) = &stmt.cond {
            self.compile_expr(cond)?;
            self.jump(Op::JumpIfFalse, end)?;
        }
        self.frame_mut()?
            .push_loop_target(JBlockKind::Loop, Some(header), end, 0);
        self.compile_block(&stmt.body)?;
        self.jump(Op::Jump, header)?;
        self.frame_mut()?.pop_loop_target();
        self.block_append(end)
    }

    fn compile_for(&mut self, stmt: &ForStmt) -> Result<()> {
        let post = self.block_alloc()?;
        let end = self.block_alloc()?;
        self.frame_mut()?
            .push_loop_target(JBlockKind::Loop, Some(post), end, 0);
        self.enter_sub_scope()?;

        if let Some(init) = &stmt.init {
            self.compile_stmt(init)?;
        }
        let header = self.frame_mut()?.block_new();
        if let Some(cond) = &stmt.cond {
            self.set_line(cond.pos())?;
            self.compile_expr(cond)?;
            self.jump(Op::JumpIfFalse, end)?;
        }
        self.compile_block(&stmt.body)?;

        self.block_append(post)?;
        if let Some(step) = &stmt.post {
            self.compile_stmt(step)?;
        }
        self.jump(Op::Jump, header)?;

        self.exit_sub_scope()?;
        self.frame_mut()?.pop_loop_target();
        self.block_append(end)
    }

    fn compile_for_each(&mut self, stmt: &ForEachStmt) -> Result<()> {
        if stmt.targets.is_empty() {
            return Err(CompilerError::new("for loop without targets", stmt.position));
        }
        let header = self.block_alloc()?;
        let end = self.block_alloc()?;
        self.frame_mut()?
            .push_loop_target(JBlockKind::Loop, Some(header), end, 1);
        self.enter_sub_scope()?;

        self.compile_expr(&stmt.iter)?;
        self.emit(Op::GetIter, 0)?;
        self.block_append(header)?;
        self.jump(Op::ForIter, end)?;

        if stmt.targets.len() > 1 {
            self.emit(Op::Unpack, stmt.targets.len() as u32)?;
        }
        for ident in &stmt.targets {
            if ident.is_blank() {
                self.emit(Op::PopTop, 0)?;
                continue;
            }
            let (id, nested) = self.declare(ident, SymbolKind::Variable)?;
            self.store_declaration(ident, id, nested, DeclFlags::empty())?;
        }
        self.compile_block(&stmt.body)?;
        self.jump(Op::Jump, header)?;

        self.exit_sub_scope()?;
        self.frame_mut()?.pop_loop_target();
        self.block_append(end)?;
        self.emit(Op::PopTop, 0)
    }

    fn compile_switch(&mut self, stmt: &SwitchStmt) -> Result<()> {
        let has_tag = stmt.tag.is_some();
        if let Some(tag) = &stmt.tag {
            self.compile_expr(tag)?;
        }
        let end = self.block_alloc()?;
        self.frame_mut()?
            .push_loop_target(JBlockKind::Switch, None, end, usize::from(has_tag));

        let mut bodies = Vec::with_capacity(stmt.cases.len());
        for _ in &stmt.cases {
            bodies.push(self.block_alloc()?);
        }

        let mut default = None;
        for (case, &body) in stmt.cases.iter().zip(&bodies) {
            if case.is_default() {
                if default.is_some() {
                    return Err(CompilerError::new(
                        "multiple defaults in switch",
                        case.position,
                    ));
                }
                default = Some(body);
                continue;
            }
            for cond in &case.conditions {
                self.set_line(cond.pos())?;
                if has_tag {
                    self.emit(Op::Dup, 1)?;
                    self.compile_expr(cond)?;
                    self.emit(Op::CompareOp, CompareOpType::Eq as u32)?;
                } else {
                    self.compile_expr(cond)?;
                }
                self.jump(Op::JumpIfTrue, body)?;
            }
        }
        self.jump(Op::Jump, default.unwrap_or(end))?;

        for (i, case) in stmt.cases.iter().enumerate() {
            self.block_append(bodies[i])?;
            self.enter_sub_scope()?;
            let mut fell_through = false;
            for (j, body_stmt) in case.body.iter().enumerate() {
                let Stmt::Fallthrough(pos) = body_stmt else {
                    self.compile_stmt(body_stmt)?;
                    continue;
                };
                if j + 1 != case.body.len() {
                    return Err(CompilerError::new(
                        "fallthrough must be the last statement in a case",
                        *pos,
                    ));
                }
                let Some(&next) = bodies.get(i + 1) else {
                    return Err(CompilerError::new("cannot fallthrough final case", *pos));
                };
                self.set_line(*pos)?;
                self.jump(Op::Jump, next)?;
                fell_through = true;
            }
            self.exit_sub_scope()?;
            if !fell_through {
                self.jump(Op::Jump, end)?;
            }
        }

        self.frame_mut()?.pop_loop_target();
        self.block_append(end)?;
        if has_tag {
            self.emit(Op::PopTop, 0)?;
        }
        Ok(())
    }

    fn compile_labeled(&mut self, stmt: &LabeledStmt) -> Result<()> {
        self.enter_sub_scope()?;
        self.declare(&stmt.label, SymbolKind::Label)?;
        let label = self.interner.name(&stmt.label.name);
        match stmt.stmt.as_ref() {
            Stmt::Loop(_) | Stmt::For(_) | Stmt::ForEach(_) | Stmt::Switch(_) => {
                self.frame_mut()?.set_pending_label(label);
                self.compile_stmt(&stmt.stmt)?;
            }
            other => {
                let end = self.block_alloc()?;
                self.frame_mut()?.push_label_target(label, end);
                self.compile_stmt(other)?;
                self.frame_mut()?.pop_loop_target();
                self.block_append(end)?;
            }
        }
        self.exit_sub_scope()
    }

    fn compile_branch(&mut self, branch: &BranchStmt, is_continue: bool) -> Result<()> {
        let label = branch.label.as_ref().map(|l| l.name.as_str());
        let frame = self.frame_mut()?;
        let target = frame
            .find_loop_target(label, is_continue)
            .map_err(|message| CompilerError::new(message, branch.position))?;
        for _ in 0..target.pops {
            frame.emit(Op::PopTop, 0)?;
        }
        frame.emit_jump(Op::Jump, target.block)?;
        frame.increment_stack(target.pops);
        frame.block_new();
        Ok(())
    }

    /// Iterators and switch subjects held by enclosing constructs are
    /// popped first so the result is the only value left for `Ret`.
    fn compile_return(&mut self, ret: &ReturnStmt) -> Result<()> {
        let held = self.frame()?.held_values();
        for _ in 0..held {
            self.emit(Op::PopTop, 0)?;
        }
        match &ret.value {
            Some(value) => self.compile_expr(value)?,
            None => self.emit(Op::Nil, 0)?,
        }
        self.emit(Op::Ret, 0)?;
        self.frame_mut()?.increment_stack(held);
        Ok(())
    }

    fn compile_deferred(&mut self, stmt: &DeferStmt, op: Op) -> Result<()> {
        let Expr::Call(call) = &stmt.call else {
            let what = if op == Op::Spawn { "spawn" } else { "defer" };
            return Err(CompilerError::new(
                format!("{} requires a function call, found {}", what, stmt.call.kind()),
                stmt.call.pos(),
            ));
        };
        self.compile_call(call, op)
    }

    // ===========================================================================
    // Functions
    // ===========================================================================

    /// Compile a function body into its own unit and leave the function
    /// value on the enclosing frame's stack.
    fn compile_function(&mut self, func: &FuncDecl, name: Rc<str>, is_method: bool) -> Result<()> {
        let qualname = self
            .interner
            .name(&format!("{}.{}", self.unit()?.qualname, name));
        let mut unit = TranslationUnit::new(UnitKind::Function, name, qualname);
        unit.set_line(func.position.line);
        self.units.push(unit);

        self.compile_function_body(func, is_method)?;

        let unit = self.pop_unit()?;
        let code = unit.assemble(self.filename.clone())?;
        let enclosed = code.enclosed.clone();
        let code = self.interner.constant(Constant::Code(Rc::new(code)));
        self.set_line(func.position)?;
        self.load_const(code)?;

        if enclosed.is_empty() {
            return self.emit(Op::MakeFunction, 0);
        }
        for name in &enclosed {
            self.load_cell(name)?;
        }
        self.emit(Op::BuildTuple, enclosed.len() as u32)?;
        self.emit(Op::MakeClosure, 0)
    }

    fn compile_function_body(&mut self, func: &FuncDecl, is_method: bool) -> Result<()> {
        let receiver = Ident {
            position: func.position,
            name: "self".to_string(),
        };
        let params: Vec<&Ident> = is_method
            .then_some(&receiver)
            .into_iter()
            .chain(&func.params)
            .collect();

        let mut flags = CodeFlags::empty();
        if is_method {
            flags |= CodeFlags::METHOD;
        }
        if stmts_yield(&func.body.stmts) {
            flags |= CodeFlags::GENERATOR;
        }
        let arity = u16::try_from(params.len()).map_err(|_| CompilerError::Capacity {
            message: "too many parameters".to_string(),
        })?;

        let extra = [
            (func.rest.as_ref(), CodeFlags::VARIADIC),
            (func.kwargs.as_ref(), CodeFlags::KWARGS),
        ];
        for param in params
            .iter()
            .copied()
            .chain(extra.iter().filter_map(|(p, _)| *p))
        {
            self.declare_param(param)?;
        }
        for (param, flag) in extra {
            if param.is_some() {
                flags |= flag;
            }
        }

        let unit = self.unit_mut()?;
        unit.flags = flags;
        unit.arity = arity;

        for stmt in &func.body.stmts {
            self.compile_stmt(stmt)?;
        }
        self.emit_implicit_return()
    }

    fn declare_param(&mut self, param: &Ident) -> Result<()> {
        if self.unit()?.symbols.lookup(&param.name).is_some() {
            return Err(CompilerError::new(
                format!("duplicate parameter '{}'", param.name),
                param.position,
            ));
        }
        let (id, _) = self.declare(param, SymbolKind::Variable)?;
        let name = self.interner.name(&param.name);
        self.unit_mut()?.local_slot(id, &name);
        Ok(())
    }

    /// Push the cell a new closure captures for `name`: a local of the
    /// current frame, or a cell the frame itself captured.
    fn load_cell(&mut self, name: &Rc<str>) -> Result<()> {
        let frame = self.frame_mut()?;
        let local = frame
            .symbols
            .lookup(name)
            .filter(|sym| !(frame.kind == UnitKind::Module && sym.nested == 0))
            .map(|sym| (sym.id, sym.free));
        if let Some((id, free)) = local {
            debug_assert!(free, "cell for '{}' made from an uncaptured local", name);
            let slot = frame.local_slot(id, name);
            return frame.emit(Op::MakeCell, slot);
        }
        match frame.find_enclosed(name) {
            Some(idx) => frame.emit(Op::LoadEnclosedCell, idx),
            None => Err(CompilerError::internal(format!(
                "captured name '{}' not found in {}",
                name, frame.qualname
            ))),
        }
    }

    // ===========================================================================
    // Expression Compilation
    // ===========================================================================

    fn compile_expr(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Nil(_) => self.emit(Op::Nil, 0),
            Expr::Bool(lit) => self.emit(if lit.value { Op::True } else { Op::False }, 0),
            Expr::Int(lit) => {
                let value = self.interner.int(lit.value);
                self.load_const(value)
            }
            Expr::Float(lit) => {
                let value = self.interner.float(lit.value);
                self.load_const(value)
            }
            Expr::String(lit) => self.load_string(&lit.value),
            Expr::Ident(ident) => self.compile_load(ident),
            Expr::Unary(unary) => self.compile_unary(unary),
            Expr::Binary(binary) => self.compile_binary(binary),
            Expr::Ternary(ternary) => self.compile_ternary(ternary),
            Expr::Selector(sel) => {
                if let Some(exit) = self.compile_selector(sel, false, true)? {
                    self.block_append(exit)?;
                }
                Ok(())
            }
            Expr::Index(expr) => {
                self.compile_expr(&expr.object)?;
                self.compile_expr(&expr.index)?;
                self.emit(Op::BinarySubscr, 0)
            }
            Expr::Slice(expr) => {
                self.compile_expr(&expr.object)?;
                self.compile_bounds(expr)?;
                self.emit(Op::BinarySubscr, 0)
            }
            Expr::Call(call) => self.compile_call(call, Op::Call),
            Expr::Spread(spread) => Err(CompilerError::new("unexpected spread", spread.position)),
            Expr::List(seq) => self.compile_sequence(seq, Op::BuildList),
            Expr::Tuple(seq) => self.compile_sequence(seq, Op::BuildTuple),
            Expr::Set(seq) => self.compile_sequence(seq, Op::BuildSet),
            Expr::Map(map) => {
                for (key, value) in &map.entries {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                }
                self.emit(Op::BuildMap, map.entries.len() as u32)
            }
            Expr::Func(func) => {
                let name = match &func.name {
                    Some(ident) => self.interner.name(&ident.name),
                    None => self.interner.name("<lambda>"),
                };
                self.guarded(|c| c.compile_function(func, name, false))
            }
            Expr::Init(init) => self.compile_init(init),
            Expr::Yield(expr) => self.compile_yield(expr),
        }
    }

    fn compile_sequence(&mut self, seq: &SequenceLit, op: Op) -> Result<()> {
        for item in &seq.items {
            self.compile_expr(item)?;
        }
        self.emit(op, seq.items.len() as u32)
    }

    fn compile_unary(&mut self, unary: &UnaryExpr) -> Result<()> {
        let op = match unary.op {
            TokenKind::Minus => Op::UnaryNegative,
            TokenKind::Plus => Op::UnaryPositive,
            TokenKind::Exclamation => Op::UnaryNot,
            TokenKind::Tilde => Op::UnaryInvert,
            other => {
                return Err(CompilerError::new(
                    format!("invalid unary operator '{}'", other),
                    unary.position,
                ));
            }
        };
        self.compile_expr(&unary.operand)?;
        self.emit(op, 0)
    }

    fn compile_binary(&mut self, binary: &BinaryExpr) -> Result<()> {
        match binary.op {
            TokenKind::AndAnd => return self.compile_short_circuit(binary, Op::JumpFalseOrPop),
            TokenKind::OrOr | TokenKind::Elvis => {
                return self.compile_short_circuit(binary, Op::JumpTrueOrPop);
            }
            TokenKind::NullCoalesce => {
                return self.compile_short_circuit(binary, Op::JumpNotNilOrPop);
            }
            _ => {}
        }
        let (op, arg) = if let Some(op) = binary_op_type(binary.op) {
            (Op::BinaryOp, op as u32)
        } else if let Some(op) = compare_op_type(binary.op) {
            (Op::CompareOp, op as u32)
        } else {
            return Err(CompilerError::new(
                format!("invalid binary operator '{}'", binary.op),
                binary.op_pos,
            ));
        };
        self.compile_expr(&binary.left)?;
        self.compile_expr(&binary.right)?;
        self.emit(op, arg)
    }

    /// Lower a run of one short-circuit operator to a single exit block.
    ///
    /// `a && b && c` parses as `(a && b) && c`; the left spine is flattened
    /// so every operand jumps to the same exit. A different operator on the
    /// spine starts its own chain.
    fn compile_short_circuit(&mut self, binary: &BinaryExpr, jump: Op) -> Result<()> {
        let mut operands = vec![&binary.right];
        let mut left = &binary.left;
        while let Expr::Binary(inner) = left {
            if inner.op != binary.op {
                break;
            }
            operands.push(&inner.right);
            left = &inner.left;
        }
        operands.push(left);
        operands.reverse();

        let exit = self.block_alloc()?;
        let mut operands = operands.into_iter();
        if let Some(first) = operands.next() {
            self.compile_expr(first)?;
        }
        for operand in operands {
            self.jump(jump, exit)?;
            self.compile_expr(operand)?;
        }
        self.block_append(exit)
    }

    fn compile_ternary(&mut self, ternary: &TernaryExpr) -> Result<()> {
        let otherwise = self.block_alloc()?;
        let end = self.block_alloc()?;
        self.compile_expr(&ternary.cond)?;
        self.jump(Op::JumpIfFalse, otherwise)?;
        self.compile_expr(&ternary.then)?;
        self.jump(Op::Jump, end)?;
        self.frame_mut()?.decrement_stack(1)?;
        self.block_append(otherwise)?;
        self.compile_expr(&ternary.otherwise)?;
        self.block_append(end)
    }

    /// Compile a selector chain such as `a.b::c`.
    ///
    /// The leftmost non-selector expression is compiled first, then each
    /// member is loaded left to right. With `load_last` unset the final
    /// member is not loaded, leaving its receiver on the stack; with `dup`
    /// set the receiver is duplicated before the final load. Returns the
    /// block `?.` links jump to on nil, which the caller must append once
    /// the value of the whole expression is on the stack.
    fn compile_selector(
        &mut self,
        sel: &Selector,
        dup: bool,
        load_last: bool,
    ) -> Result<Option<BlockId>> {
        let mut chain = vec![sel];
        let mut base = &sel.left;
        while let Expr::Selector(inner) = base {
            chain.push(inner.as_ref());
            base = &inner.left;
        }
        chain.reverse();

        self.compile_expr(base)?;
        let mut exit = None;
        let last = chain.len() - 1;
        for (i, link) in chain.iter().enumerate() {
            self.set_line(link.name.position)?;
            if link.kind == SelectorKind::SafeDot {
                let target = match exit {
                    Some(block) => block,
                    None => {
                        let block = self.block_alloc()?;
                        exit = Some(block);
                        block
                    }
                };
                self.jump(Op::JumpIfNil, target)?;
            }
            if i == last {
                if !load_last {
                    break;
                }
                if dup {
                    self.emit(Op::Dup, 1)?;
                }
            }
            let idx = self.name_index(&link.name.name)?;
            let op = match link.kind {
                SelectorKind::Scope => Op::LoadScope,
                _ => Op::LoadAttr,
            };
            self.emit(op, idx)?;
        }
        Ok(exit)
    }

    fn compile_bounds(&mut self, slice: &SliceExpr) -> Result<()> {
        for bound in [&slice.low, &slice.high, &slice.step] {
            match bound {
                Some(expr) => self.compile_expr(expr)?,
                None => self.emit(Op::Nil, 0)?,
            }
        }
        self.emit(Op::MakeBounds, 0)
    }

    /// Compile a call with `op` (`Call`, `Defer` or `Spawn`).
    ///
    /// Calls through `.` or `?.` load the receiver and then the method, so
    /// the receiver travels as the first argument.
    fn compile_call(&mut self, call: &CallExpr, op: Op) -> Result<()> {
        let (receiver, exit) = match &call.callee {
            Expr::Selector(sel) if sel.kind != SelectorKind::Scope => {
                if op != Op::Call && has_safe_navigation(sel) {
                    return Err(CompilerError::new(
                        "cannot defer or spawn a call through '?.'",
                        sel.name.position,
                    ));
                }
                let exit = self.compile_selector(sel, false, false)?;
                let idx = self.name_index(&sel.name.name)?;
                self.emit(Op::LoadMethod, idx)?;
                (1, exit)
            }
            callee => {
                self.compile_expr(callee)?;
                (0, None)
            }
        };

        let (slots, flags) = self.compile_args(&call.args, &call.kwargs)?;
        let count = u16::try_from(slots + receiver).map_err(|_| CompilerError::Capacity {
            message: "too many call arguments".to_string(),
        })?;
        self.emit(op, pack_call(count, flags))?;
        if let Some(exit) = exit {
            self.block_append(exit)?;
        }
        Ok(())
    }

    /// Push call arguments, returning the number of stack slots used and
    /// the packing mode.
    ///
    /// Arguments are separate slots until the first spread; from there on
    /// they are collected into one list.
    fn compile_args(&mut self, args: &[Expr], kwargs: &[KeywordArg]) -> Result<(usize, CallFlags)> {
        let mut slots = 0;
        let mut flags = CallFlags::empty();
        for arg in args {
            match arg {
                Expr::Spread(spread) => {
                    if !flags.contains(CallFlags::REST) {
                        self.emit(Op::BuildList, 0)?;
                        flags |= CallFlags::REST;
                        slots += 1;
                    }
                    self.compile_expr(&spread.value)?;
                    self.emit(Op::ListExtend, 0)?;
                }
                other if flags.contains(CallFlags::REST) => {
                    self.compile_expr(other)?;
                    self.emit(Op::ListAppend, 0)?;
                }
                other => {
                    self.compile_expr(other)?;
                    slots += 1;
                }
            }
        }
        if !kwargs.is_empty() {
            for kwarg in kwargs {
                self.load_string(&kwarg.name.name)?;
                self.compile_expr(&kwarg.value)?;
            }
            self.emit(Op::BuildMap, kwargs.len() as u32)?;
            flags |= CallFlags::KWARGS;
            slots += 1;
        }
        Ok((slots, flags))
    }

    fn compile_init(&mut self, init: &InitExpr) -> Result<()> {
        let named = init.fields.iter().filter(|f| f.name.is_some()).count();
        if named != 0 && named != init.fields.len() {
            return Err(CompilerError::new(
                "cannot mix named and positional fields in initializer",
                init.target.pos(),
            ));
        }
        self.compile_expr(&init.target)?;
        for field in &init.fields {
            if let Some(name) = &field.name {
                self.load_string(&name.name)?;
            }
            self.compile_expr(&field.value)?;
        }
        let count = u16::try_from(init.fields.len()).map_err(|_| CompilerError::Capacity {
            message: "too many fields in initializer".to_string(),
        })?;
        let flags = if named > 0 {
            CallFlags::KWARGS
        } else {
            CallFlags::empty()
        };
        self.emit(Op::Init, pack_call(count, flags))
    }

    fn compile_yield(&mut self, expr: &YieldExpr) -> Result<()> {
        if self.frame()?.kind != UnitKind::Function {
            return Err(CompilerError::new("'yield' outside function", expr.position));
        }
        match &expr.value {
            Some(value) => self.compile_expr(value)?,
            None => self.emit(Op::Nil, 0)?,
        }
        let frame = self.frame_mut()?;
        frame.flags |= CodeFlags::GENERATOR;
        frame.emit(Op::YieldValue, 0)
    }
}

/// Compile a module with the given configuration.
pub fn compile(module: &Module, config: CompilerConfig) -> Result<Rc<Code>> {
    Compiler::new(config).compile(module)
}

fn binary_op_type(token: TokenKind) -> Option<BinaryOpType> {
    let op = match token {
        TokenKind::Plus => BinaryOpType::Add,
        TokenKind::Minus => BinaryOpType::Subtract,
        TokenKind::Asterisk => BinaryOpType::Multiply,
        TokenKind::Slash => BinaryOpType::Divide,
        TokenKind::SlashSlash => BinaryOpType::IntDivide,
        TokenKind::Percent => BinaryOpType::Modulo,
        TokenKind::Shl => BinaryOpType::LShift,
        TokenKind::Shr => BinaryOpType::RShift,
        TokenKind::Ampersand => BinaryOpType::BitwiseAnd,
        TokenKind::Pipe => BinaryOpType::BitwiseOr,
        TokenKind::Caret => BinaryOpType::Xor,
        _ => return None,
    };
    Some(op)
}

fn compare_op_type(token: TokenKind) -> Option<CompareOpType> {
    let op = match token {
        TokenKind::Less => CompareOpType::Lt,
        TokenKind::LessEq => CompareOpType::LtEquals,
        TokenKind::Equal => CompareOpType::Eq,
        TokenKind::NotEqual => CompareOpType::NotEq,
        TokenKind::Greater => CompareOpType::Gt,
        TokenKind::GreaterEq => CompareOpType::GtEquals,
        _ => return None,
    };
    Some(op)
}

fn has_safe_navigation(sel: &Selector) -> bool {
    let mut current = sel;
    loop {
        if current.kind == SelectorKind::SafeDot {
            return true;
        }
        match &current.left {
            Expr::Selector(inner) => current = inner.as_ref(),
            _ => return false,
        }
    }
}

// Generator detection. Nested function bodies are not searched: a `yield`
// there makes the nested function the generator.

fn stmts_yield(stmts: &[Stmt]) -> bool {
    stmts.iter().any(stmt_yields)
}

fn stmt_yields(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Expr(expr) => expr_yields(expr),
        Stmt::Var(decl) => decl.value.as_ref().is_some_and(expr_yields),
        Stmt::Assign(assign) => assign.targets.iter().any(expr_yields) || expr_yields(&assign.value),
        Stmt::Func(_) | Stmt::Struct(_) | Stmt::Trait(_) => false,
        Stmt::Block(block) => stmts_yield(&block.stmts),
        Stmt::If(stmt) => {
            expr_yields(&stmt.cond)
                || stmts_yield(&stmt.then.stmts)
                || stmt.orelse.as_deref().is_some_and(stmt_yields)
        }
        Stmt::Loop(stmt) => {
            stmt.cond.as_ref().is_some_and(expr_yields) || stmts_yield(&stmt.body.stmts)
        }
        Stmt::For(stmt) => {
            stmt.init.as_deref().is_some_and(stmt_yields)
                || stmt.cond.as_ref().is_some_and(expr_yields)
                || stmt.post.as_deref().is_some_and(stmt_yields)
                || stmts_yield(&stmt.body.stmts)
        }
        Stmt::ForEach(stmt) => expr_yields(&stmt.iter) || stmts_yield(&stmt.body.stmts),
        Stmt::Switch(stmt) => {
            stmt.tag.as_ref().is_some_and(expr_yields)
                || stmt
                    .cases
                    .iter()
                    .any(|case| case.conditions.iter().any(expr_yields) || stmts_yield(&case.body))
        }
        Stmt::Labeled(stmt) => stmt_yields(&stmt.stmt),
        Stmt::Return(ret) => ret.value.as_ref().is_some_and(expr_yields),
        Stmt::Defer(stmt) | Stmt::Spawn(stmt) => expr_yields(&stmt.call),
        Stmt::Panic(stmt) => expr_yields(&stmt.value),
        Stmt::Break(_) | Stmt::Continue(_) | Stmt::Fallthrough(_) => false,
    }
}

fn expr_yields(expr: &Expr) -> bool {
    match expr {
        Expr::Yield(_) => true,
        Expr::Nil(_)
        | Expr::Bool(_)
        | Expr::Int(_)
        | Expr::Float(_)
        | Expr::String(_)
        | Expr::Ident(_)
        | Expr::Func(_) => false,
        Expr::Unary(e) => expr_yields(&e.operand),
        Expr::Binary(e) => expr_yields(&e.left) || expr_yields(&e.right),
        Expr::Ternary(e) => expr_yields(&e.cond) || expr_yields(&e.then) || expr_yields(&e.otherwise),
        Expr::Selector(e) => expr_yields(&e.left),
        Expr::Index(e) => expr_yields(&e.object) || expr_yields(&e.index),
        Expr::Slice(e) => {
            expr_yields(&e.object)
                || [&e.low, &e.high, &e.step]
                    .into_iter()
                    .any(|bound| bound.as_ref().is_some_and(expr_yields))
        }
        Expr::Call(e) => {
            expr_yields(&e.callee)
                || e.args.iter().any(expr_yields)
                || e.kwargs.iter().any(|kw| expr_yields(&kw.value))
        }
        Expr::Spread(e) => expr_yields(&e.value),
        Expr::List(seq) | Expr::Tuple(seq) | Expr::Set(seq) => seq.items.iter().any(expr_yields),
        Expr::Map(map) => map
            .entries
            .iter()
            .any(|(k, v)| expr_yields(k) || expr_yields(v)),
        Expr::Init(e) => expr_yields(&e.target) || e.fields.iter().any(|f| expr_yields(&f.value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon_ast::build::*;
    use argon_bytecode::{Instruction, Interner, VerifyError, verify};

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config() -> CompilerConfig {
        CompilerConfig {
            interner: Some(SharedInterner::new(Interner::new())),
            ..CompilerConfig::default()
        }
    }

    fn compile_stmts(stmts: Vec<Stmt>) -> Rc<Code> {
        init_logger();
        compile(&module(stmts), config()).expect("compilation failed")
    }

    fn compile_err(stmts: Vec<Stmt>) -> CompilerError {
        init_logger();
        compile(&module(stmts), config()).expect_err("compilation should fail")
    }

    fn message(err: &CompilerError) -> String {
        match err {
            CompilerError::Compile { message, .. } => message.clone(),
            other => panic!("expected a compile error, got {:?}", other),
        }
    }

    fn instrs(code: &Code) -> Vec<Instruction> {
        code.decode()
            .collect::<std::result::Result<_, _>>()
            .expect("decode failed")
    }

    fn ops(code: &Code) -> Vec<(Op, u32)> {
        instrs(code).iter().map(|i| (i.op, i.arg)).collect()
    }

    fn child(code: &Code, name: &str) -> Rc<Code> {
        code.children()
            .find(|c| &*c.name == name)
            .cloned()
            .unwrap_or_else(|| panic!("no child code named {}", name))
    }

    fn names(table: &[Rc<str>]) -> Vec<&str> {
        table.iter().map(|n| n.as_ref()).collect()
    }

    fn verify_all(code: &Code) {
        let profile = verify(code).unwrap_or_else(|err| panic!("{}: {}", code.qualname, err));
        assert!(profile.max_depth <= code.stack_size, "{}", code.qualname);
        for child in code.children() {
            verify_all(child);
        }
    }

    #[test]
    fn test_function_returning_sum() {
        let code = compile_stmts(vec![func_decl(
            "f",
            &[],
            vec![ret(binary(int(1), TokenKind::Plus, int(2)))],
        )]);
        assert_eq!(
            ops(&code),
            vec![
                (Op::LoadConst, 0),
                (Op::MakeFunction, 0),
                (Op::DeclareGlobal, pack_decl(0, DeclFlags::CONSTANT)),
                (Op::Nil, 0),
                (Op::Ret, 0),
            ]
        );

        let f = child(&code, "f");
        assert_eq!(&*f.qualname, "main.f");
        assert_eq!(
            ops(&f),
            vec![
                (Op::LoadConst, 0),
                (Op::LoadConst, 1),
                (Op::BinaryOp, BinaryOpType::Add as u32),
                (Op::Ret, 0),
            ]
        );
        assert_eq!(f.stack_size, 2);
        assert_eq!(*f.statics[0], Constant::Int(1));
        assert_eq!(*f.statics[1], Constant::Int(2));
        verify_all(&code);
    }

    #[test]
    fn test_conditional_loop_layout() {
        let code = compile_stmts(vec![
            var("x", int(1)),
            loop_while(
                binary(ident("x"), TokenKind::Less, int(3)),
                vec![assign(
                    ident("x"),
                    binary(ident("x"), TokenKind::Plus, int(1)),
                )],
            ),
        ]);
        let is = instrs(&code);
        let header = is[2].offset;
        let end = is[11].offset;
        assert_eq!(
            ops(&code),
            vec![
                (Op::LoadConst, 0),
                (Op::DeclareGlobal, pack_decl(0, DeclFlags::empty())),
                (Op::LoadGlobal, 0),
                (Op::LoadConst, 1),
                (Op::CompareOp, CompareOpType::Lt as u32),
                (Op::JumpIfFalse, end as u32),
                (Op::LoadGlobal, 0),
                (Op::LoadConst, 0),
                (Op::BinaryOp, BinaryOpType::Add as u32),
                (Op::StoreGlobal, 0),
                (Op::Jump, header as u32),
                (Op::Nil, 0),
                (Op::Ret, 0),
            ]
        );
        assert_eq!(names(&code.names), vec!["x"]);
        assert_eq!(code.statics.len(), 2);
        verify_all(&code);
    }

    #[test]
    fn test_closure_capture() {
        let code = compile_stmts(vec![func_decl(
            "outer",
            &[],
            vec![
                var("x", int(1)),
                ret(lambda(&[], vec![ret(ident("x"))])),
            ],
        )]);
        let outer = child(&code, "outer");
        assert_eq!(
            ops(&outer),
            vec![
                (Op::LoadConst, 0),
                (Op::StoreLocal, 0),
                (Op::LoadConst, 1),
                (Op::MakeCell, 0),
                (Op::BuildTuple, 1),
                (Op::MakeClosure, 0),
                (Op::Ret, 0),
            ]
        );
        assert_eq!(names(&outer.locals), vec!["x"]);

        let inner = child(&outer, "<lambda>");
        assert_eq!(&*inner.qualname, "main.outer.<lambda>");
        assert_eq!(names(&inner.enclosed), vec!["x"]);
        assert_eq!(ops(&inner), vec![(Op::LoadEnclosed, 0), (Op::Ret, 0)]);
        verify_all(&code);
    }

    #[test]
    fn test_capture_through_intermediate_function() {
        let code = compile_stmts(vec![func_decl(
            "a",
            &[],
            vec![
                var("x", int(1)),
                func_decl("b", &[], vec![
                    func_decl("c", &[], vec![ret(ident("x"))]),
                    ret(ident("c")),
                ]),
                ret(ident("b")),
            ],
        )]);
        let a = child(&code, "a");
        let b = child(&a, "b");
        let c = child(&b, "c");
        assert_eq!(names(&b.enclosed), vec!["x"]);
        assert_eq!(names(&c.enclosed), vec!["x"]);
        assert!(ops(&a).contains(&(Op::MakeCell, 0)));
        assert!(ops(&b).contains(&(Op::LoadEnclosedCell, 0)));
        assert_eq!(ops(&c), vec![(Op::LoadEnclosed, 0), (Op::Ret, 0)]);
        verify_all(&code);
    }

    #[test]
    fn test_parameters_are_locals() {
        let code = compile_stmts(vec![func_decl(
            "add",
            &["a", "b"],
            vec![ret(binary(ident("a"), TokenKind::Plus, ident("b")))],
        )]);
        let add = child(&code, "add");
        assert_eq!(add.arity, 2);
        assert_eq!(names(&add.locals), vec!["a", "b"]);
        assert_eq!(
            ops(&add),
            vec![
                (Op::LoadLocal, 0),
                (Op::LoadLocal, 1),
                (Op::BinaryOp, BinaryOpType::Add as u32),
                (Op::Ret, 0),
            ]
        );

        let err = compile_err(vec![func_decl("f", &["a", "a"], vec![])]);
        assert_eq!(message(&err), "duplicate parameter 'a'");
    }

    #[test]
    fn test_blank_identifier() {
        let err = compile_err(vec![expr_stmt(ident("_"))]);
        assert_eq!(message(&err), "cannot use '_' as a value");

        let code = compile_stmts(vec![assign(ident("_"), call(ident("f"), vec![]))]);
        assert_eq!(
            ops(&code),
            vec![
                (Op::LoadGlobal, 0),
                (Op::Call, pack_call(0, CallFlags::empty())),
                (Op::PopTop, 0),
                (Op::Nil, 0),
                (Op::Ret, 0),
            ]
        );

        let code = compile_stmts(vec![var_many(&["_", "y"], ident("pair"))]);
        assert_eq!(
            ops(&code),
            vec![
                (Op::LoadGlobal, 0),
                (Op::Unpack, 2),
                (Op::PopTop, 0),
                (Op::DeclareGlobal, pack_decl(1, DeclFlags::empty())),
                (Op::Nil, 0),
                (Op::Ret, 0),
            ]
        );
    }

    #[test]
    fn test_implicit_returns() {
        let code = compile_stmts(vec![
            func_decl("f", &[], vec![]),
            func_decl("g", &[], vec![expr_stmt(yield_(Some(int(1))))]),
        ]);
        let f = child(&code, "f");
        assert_eq!(ops(&f), vec![(Op::Nil, 0), (Op::Ret, 0)]);
        assert!(!f.is_generator());

        let g = child(&code, "g");
        assert!(g.is_generator());
        assert_eq!(
            ops(&g),
            vec![
                (Op::LoadConst, 0),
                (Op::YieldValue, 0),
                (Op::PopTop, 0),
                (Op::Stop, 0),
                (Op::Ret, 0),
            ]
        );
        verify_all(&code);
    }

    #[test]
    fn test_constants_shared_across_functions() {
        let code = compile_stmts(vec![
            func_decl("f", &[], vec![ret(int(7))]),
            func_decl("g", &[], vec![ret(int(7)), ret(string("seven"))]),
        ]);
        let f = child(&code, "f");
        let g = child(&code, "g");
        assert!(Rc::ptr_eq(&f.statics[0], &g.statics[0]));
        assert_eq!(g.statics.len(), 2);
    }

    #[test]
    fn test_short_circuit_single_exit() {
        let and = binary(
            binary(ident("a"), TokenKind::AndAnd, ident("b")),
            TokenKind::AndAnd,
            ident("c"),
        );
        let code = compile_stmts(vec![expr_stmt(and)]);
        let is = instrs(&code);
        let exit = is[5].offset as u32;
        assert_eq!(
            ops(&code),
            vec![
                (Op::LoadGlobal, 0),
                (Op::JumpFalseOrPop, exit),
                (Op::LoadGlobal, 1),
                (Op::JumpFalseOrPop, exit),
                (Op::LoadGlobal, 2),
                (Op::PopTop, 0),
                (Op::Nil, 0),
                (Op::Ret, 0),
            ]
        );
        verify_all(&code);
    }

    #[test]
    fn test_null_coalesce_and_ternary() {
        let code = compile_stmts(vec![
            var(
                "v",
                binary(ident("a"), TokenKind::NullCoalesce, int(0)),
            ),
            var("w", ternary(ident("v"), string("yes"), string("no"))),
        ]);
        let ops = ops(&code);
        assert!(ops.iter().any(|(op, _)| *op == Op::JumpNotNilOrPop));
        assert!(ops.iter().any(|(op, _)| *op == Op::JumpIfFalse));
        verify_all(&code);
    }

    #[test]
    fn test_safe_navigation() {
        let code = compile_stmts(vec![expr_stmt(attr(
            safe_attr(ident("a"), "b"),
            "c",
        ))]);
        let is = instrs(&code);
        let exit = is[4].offset as u32;
        assert_eq!(
            ops(&code),
            vec![
                (Op::LoadGlobal, 0),
                (Op::JumpIfNil, exit),
                (Op::LoadAttr, 1),
                (Op::LoadAttr, 2),
                (Op::PopTop, 0),
                (Op::Nil, 0),
                (Op::Ret, 0),
            ]
        );
        assert_eq!(names(&code.names), vec!["a", "b", "c"]);
        verify_all(&code);

        let err = compile_err(vec![assign(safe_attr(ident("a"), "b"), int(1))]);
        assert_eq!(message(&err), "cannot assign through '?.'");
    }

    #[test]
    fn test_method_call() {
        let code = compile_stmts(vec![expr_stmt(call(
            attr(ident("obj"), "m"),
            vec![int(1)],
        ))]);
        assert_eq!(
            &ops(&code)[..4],
            &[
                (Op::LoadGlobal, 0),
                (Op::LoadMethod, 1),
                (Op::LoadConst, 0),
                (Op::Call, pack_call(2, CallFlags::empty())),
            ]
        );
        verify_all(&code);
    }

    #[test]
    fn test_call_packing() {
        let code = compile_stmts(vec![expr_stmt(call(
            ident("f"),
            vec![int(1), spread(ident("xs")), int(2)],
        ))]);
        assert_eq!(
            &ops(&code)[..8],
            &[
                (Op::LoadGlobal, 0),
                (Op::LoadConst, 0),
                (Op::BuildList, 0),
                (Op::LoadGlobal, 1),
                (Op::ListExtend, 0),
                (Op::LoadConst, 1),
                (Op::ListAppend, 0),
                (Op::Call, pack_call(2, CallFlags::REST)),
            ]
        );
        verify_all(&code);

        let code = compile_stmts(vec![expr_stmt(call_kw(
            ident("f"),
            vec![int(1)],
            vec![("k", int(2))],
        ))]);
        assert_eq!(
            &ops(&code)[..6],
            &[
                (Op::LoadGlobal, 0),
                (Op::LoadConst, 0),
                (Op::LoadConst, 1),
                (Op::LoadConst, 2),
                (Op::BuildMap, 1),
                (Op::Call, pack_call(2, CallFlags::KWARGS)),
            ]
        );
        verify_all(&code);

        let err = compile_err(vec![expr_stmt(list(vec![spread(ident("xs"))]))]);
        assert_eq!(message(&err), "unexpected spread");
    }

    #[test]
    fn test_for_each_with_break() {
        let code = compile_stmts(vec![func_decl(
            "first",
            &["xs"],
            vec![
                for_each(
                    &["x"],
                    ident("xs"),
                    vec![
                        if_(ident("x"), vec![break_()], None),
                        expr_stmt(call(ident("log"), vec![ident("x")])),
                    ],
                ),
                for_each(&["k", "v"], ident("xs"), vec![ret(ident("v"))]),
            ],
        )]);
        let first = child(&code, "first");
        assert_eq!(names(&first.locals), vec!["xs", "x", "k", "v"]);
        let ops = ops(&first);
        assert_eq!(ops.iter().filter(|(op, _)| *op == Op::GetIter).count(), 2);
        assert!(ops.contains(&(Op::Unpack, 2)));
        verify_all(&code);
    }

    #[test]
    fn test_labeled_continue_pops_inner_iterator() {
        let code = compile_stmts(vec![labeled(
            "outer",
            for_each(
                &["x"],
                ident("xs"),
                vec![for_each(&["y"], ident("ys"), vec![continue_to("outer")])],
            ),
        )]);
        let is = instrs(&code);
        let outer_header = is
            .iter()
            .find(|i| i.op == Op::ForIter)
            .map(|i| i.offset as u32);
        let pos = is
            .iter()
            .position(|i| i.op == Op::Jump && Some(i.arg) == outer_header)
            .expect("continue jumps to the outer header");
        assert_eq!(is[pos - 1].op, Op::PopTop);
        verify_all(&code);
    }

    #[test]
    fn test_labeled_block_break() {
        let code = compile_stmts(vec![labeled(
            "done",
            block_stmt(vec![
                if_(ident("a"), vec![break_to("done")], None),
                expr_stmt(call(ident("f"), vec![])),
            ]),
        )]);
        verify_all(&code);

        let err = compile_err(vec![labeled(
            "done",
            block_stmt(vec![continue_to("done")]),
        )]);
        assert_eq!(message(&err), "cannot continue to non-loop label 'done'");
    }

    #[test]
    fn test_for_loop_continue_runs_post() {
        let code = compile_stmts(vec![for_(
            Some(var("i", int(0))),
            Some(binary(ident("i"), TokenKind::Less, int(10))),
            Some(assign_op(ident("i"), TokenKind::AddAssign, int(1))),
            vec![continue_()],
        )]);
        let is = instrs(&code);
        let jumps: Vec<&Instruction> = is.iter().filter(|i| i.op == Op::Jump).collect();
        // continue targets the post block, which starts with `i += 1`
        let post = is
            .iter()
            .find(|i| i.offset as u32 == jumps[0].arg)
            .expect("continue target");
        assert_eq!(post.op, Op::LoadLocal);
        verify_all(&code);
    }

    #[test]
    fn test_switch() {
        let code = compile_stmts(vec![switch(
            Some(ident("v")),
            vec![
                case(
                    vec![int(1)],
                    vec![expr_stmt(call(ident("f"), vec![])), fallthrough()],
                ),
                case(vec![int(2), int(3)], vec![break_()]),
                default_case(vec![expr_stmt(ident("v"))]),
            ],
        )]);
        let ops = ops(&code);
        assert_eq!(ops.iter().filter(|o| **o == (Op::Dup, 1)).count(), 3);
        assert!(ops.contains(&(Op::CompareOp, CompareOpType::Eq as u32)));
        assert_eq!(&ops[ops.len() - 3..], &[(Op::PopTop, 0), (Op::Nil, 0), (Op::Ret, 0)]);
        verify_all(&code);

        let err = compile_err(vec![switch(
            None,
            vec![case(vec![ident("a")], vec![fallthrough()])],
        )]);
        assert_eq!(message(&err), "cannot fallthrough final case");

        let err = compile_err(vec![switch(
            None,
            vec![default_case(vec![]), default_case(vec![])],
        )]);
        assert_eq!(message(&err), "multiple defaults in switch");
    }

    #[test]
    fn test_struct_declaration() {
        let code = compile_stmts(vec![struct_decl(
            "Point",
            vec![],
            vec![
                var("x", int(0)),
                func_decl("norm", &[], vec![ret(attr(ident("self"), "x"))]),
            ],
        )]);
        let module_ops: Vec<Op> = ops(&code).into_iter().map(|(op, _)| op).collect();
        assert_eq!(
            module_ops,
            vec![
                Op::LoadConst,
                Op::LoadConst,
                Op::LoadConst,
                Op::LoadConst,
                Op::LoadConst,
                Op::MakeFunction,
                Op::BuildMap,
                Op::BuildTuple,
                Op::MakeStruct,
                Op::DeclareGlobal,
                Op::Nil,
                Op::Ret,
            ]
        );

        let norm = child(&code, "norm");
        assert_eq!(&*norm.qualname, "main.Point.norm");
        assert!(norm.flags.contains(CodeFlags::METHOD));
        assert_eq!(norm.arity, 1);
        assert_eq!(names(&norm.locals), vec!["self"]);
        assert_eq!(
            ops(&norm),
            vec![(Op::LoadLocal, 0), (Op::LoadAttr, 0), (Op::Ret, 0)]
        );
        verify_all(&code);

        let err = compile_err(vec![trait_decl("T", vec![], vec![var("x", int(0))])]);
        assert_eq!(message(&err), "unexpected var statement in trait body");
    }

    #[test]
    fn test_compound_assignment() {
        let code = compile_stmts(vec![
            assign_op(index(ident("xs"), ident("i")), TokenKind::AddAssign, int(1)),
            assign_op(attr(ident("p"), "n"), TokenKind::MulAssign, int(2)),
        ]);
        let ops = ops(&code);
        assert_eq!(
            &ops[..7],
            &[
                (Op::LoadGlobal, 0),
                (Op::LoadGlobal, 1),
                (Op::Dup, 2),
                (Op::BinarySubscr, 0),
                (Op::LoadConst, 0),
                (Op::BinaryOp, BinaryOpType::Add as u32),
                (Op::StoreSubscr, 0),
            ]
        );
        assert_eq!(
            &ops[7..13],
            &[
                (Op::LoadGlobal, 2),
                (Op::Dup, 1),
                (Op::LoadAttr, 3),
                (Op::LoadConst, 1),
                (Op::BinaryOp, BinaryOpType::Multiply as u32),
                (Op::StoreAttr, 3),
            ]
        );
        verify_all(&code);
    }

    #[test]
    fn test_init_expressions() {
        let code = compile_stmts(vec![
            expr_stmt(init(ident("P"), vec![int(1), int(2)])),
            expr_stmt(init_named(ident("P"), vec![("x", int(1))])),
        ]);
        let ops = ops(&code);
        assert!(ops.contains(&(Op::Init, pack_call(2, CallFlags::empty()))));
        assert!(ops.contains(&(Op::Init, pack_call(1, CallFlags::KWARGS))));
        verify_all(&code);

        let mixed = Expr::Init(Box::new(InitExpr {
            target: ident("P"),
            fields: vec![
                InitField {
                    name: Some(name("x")),
                    value: int(1),
                },
                InitField {
                    name: None,
                    value: int(2),
                },
            ],
        }));
        let err = compile_err(vec![expr_stmt(mixed)]);
        assert_eq!(
            message(&err),
            "cannot mix named and positional fields in initializer"
        );
    }

    #[test]
    fn test_defer_and_spawn() {
        let code = compile_stmts(vec![func_decl(
            "f",
            &[],
            vec![
                defer(call(ident("close"), vec![ident("h")])),
                spawn(call(attr(ident("w"), "run"), vec![])),
            ],
        )]);
        let f = child(&code, "f");
        let ops = ops(&f);
        assert!(ops.contains(&(Op::Defer, pack_call(1, CallFlags::empty()))));
        assert!(ops.contains(&(Op::Spawn, pack_call(1, CallFlags::empty()))));
        verify_all(&code);

        let err = compile_err(vec![defer(int(1))]);
        assert_eq!(message(&err), "defer requires a function call, found int literal");
    }

    #[test]
    fn test_errors() {
        let err = compile_err(vec![expr_stmt(yield_(None))]);
        assert_eq!(message(&err), "'yield' outside function");

        let err = compile_err(vec![loop_(vec![break_to("outer")])]);
        assert_eq!(message(&err), "unknown label 'outer'");

        let err = compile_err(vec![break_()]);
        assert_eq!(message(&err), "break outside loop or switch");

        let err = compile_err(vec![let_("k", int(1)), assign(ident("k"), int(2))]);
        assert_eq!(message(&err), "cannot assign to constant 'k'");

        let err = compile_err(vec![let_("k", int(1)), var("k", int(2))]);
        assert!(matches!(err, CompilerError::Redeclaration { ref name, .. } if name == "k"));

        let err = compile_err(vec![labeled("l", loop_(vec![expr_stmt(ident("l"))]))]);
        assert_eq!(message(&err), "label 'l' used as a value");

        let err = compile_err(vec![fallthrough()]);
        assert_eq!(message(&err), "fallthrough statement out of place");
    }

    #[test]
    fn test_error_inside_nested_function() {
        let err = compile_err(vec![func_decl(
            "f",
            &[],
            vec![if_(ident("a"), vec![continue_()], None)],
        )]);
        assert_eq!(message(&err), "continue outside loop");
    }

    #[test]
    fn test_error_position() {
        let err = compile_err(vec![
            var("x", int(1)),
            stmt_at(4, ret(binary(int(1), TokenKind::AndAnd, at(4, ident("_"))))),
        ]);
        assert_eq!(err.line(), Some(5));
    }

    #[test]
    fn test_builtins() {
        init_logger();
        let config = CompilerConfig {
            builtins: vec!["print".to_string()],
            ..config()
        };
        let code = compile(
            &module(vec![expr_stmt(call(ident("print"), vec![]))]),
            config.clone(),
        )
        .unwrap();
        assert_eq!(ops(&code)[0], (Op::LoadGlobal, 0));

        let err = compile(&module(vec![assign(ident("print"), int(1))]), config).unwrap_err();
        assert_eq!(message(&err), "cannot assign to constant 'print'");
    }

    #[test]
    fn test_line_table() {
        let code = compile_stmts(vec![
            stmt_at(0, var("a", int(1))),
            stmt_at(2, var("b", int(2))),
        ]);
        let is = instrs(&code);
        assert_eq!(code.line_at(is[0].offset), Some(0));
        assert_eq!(code.line_at(is[2].offset), Some(2));
    }

    #[test]
    fn test_module_naming() {
        init_logger();
        let config = CompilerConfig {
            filename: "demo.ar".to_string(),
            ..config()
        };
        let tree = Module {
            name: String::new(),
            stmts: vec![func_decl("f", &[], vec![])],
        };
        let code = compile(&tree, config).unwrap();
        assert_eq!(&*code.name, "main");
        assert_eq!(code.filename.as_deref(), Some("demo.ar"));
        assert_eq!(child(&code, "f").filename.as_deref(), Some("demo.ar"));

        let code = compile_stmts(vec![]);
        assert_eq!(code.filename, None);
        assert_eq!(ops(&code), vec![(Op::Nil, 0), (Op::Ret, 0)]);
    }

    fn return_depths(code: &Code) -> Vec<usize> {
        let profile = verify(code).unwrap_or_else(|err| panic!("{}: {}", code.qualname, err));
        profile.returns.iter().map(|(_, depth)| *depth).collect()
    }

    #[test]
    fn test_return_pops_held_values() {
        let code = compile_stmts(vec![
            func_decl(
                "f",
                &["xs"],
                vec![for_each(&["x"], ident("xs"), vec![ret(ident("x"))])],
            ),
            func_decl(
                "g",
                &["v"],
                vec![switch(Some(ident("v")), vec![case(vec![int(1)], vec![ret(int(2))])])],
            ),
            func_decl(
                "h",
                &["xs"],
                vec![for_each(&["a"], ident("xs"), vec![for_each(
                    &["b"],
                    ident("a"),
                    vec![switch(Some(ident("b")), vec![case(
                        vec![int(0)],
                        vec![ret(ident("b"))],
                    )])],
                )])],
            ),
        ]);

        let f = child(&code, "f");
        let is = instrs(&f);
        let header = is[2].offset as u32;
        let end = is[8].offset as u32;
        assert_eq!(
            ops(&f),
            vec![
                (Op::LoadLocal, 0),
                (Op::GetIter, 0),
                (Op::ForIter, end),
                (Op::StoreLocal, 1),
                (Op::PopTop, 0),
                (Op::LoadLocal, 1),
                (Op::Ret, 0),
                (Op::Jump, header),
                (Op::PopTop, 0),
                (Op::Nil, 0),
                (Op::Ret, 0),
            ]
        );
        assert_eq!(return_depths(&f), vec![1, 1]);

        let g = child(&code, "g");
        assert!(
            ops(&g)
                .windows(3)
                .any(|w| w == [(Op::PopTop, 0), (Op::LoadConst, 1), (Op::Ret, 0)])
        );
        assert_eq!(return_depths(&g), vec![1, 1]);

        let h = child(&code, "h");
        let pops = ops(&h)
            .windows(5)
            .filter(|w| {
                w[..3].iter().all(|&(op, _)| op == Op::PopTop)
                    && w[3].0 == Op::LoadLocal
                    && w[4].0 == Op::Ret
            })
            .count();
        assert_eq!(pops, 1);
        assert!(return_depths(&h).iter().all(|&depth| depth == 1));
        verify_all(&code);
    }

    #[test]
    fn test_conditional_loop_branches() {
        let code = compile_stmts(vec![
            var("x", int(1)),
            loop_while(
                binary(ident("x"), TokenKind::Less, int(3)),
                vec![
                    if_(binary(ident("x"), TokenKind::Equal, int(2)), vec![break_()], None),
                    assign(ident("x"), binary(ident("x"), TokenKind::Plus, int(1))),
                    continue_(),
                ],
            ),
        ]);
        let is = instrs(&code);
        let header = is[2].offset as u32;
        let orelse = is[11].offset as u32;
        let end = is[17].offset as u32;
        assert_eq!(
            ops(&code),
            vec![
                (Op::LoadConst, 0),
                (Op::DeclareGlobal, pack_decl(0, DeclFlags::empty())),
                (Op::LoadGlobal, 0),
                (Op::LoadConst, 1),
                (Op::CompareOp, CompareOpType::Lt as u32),
                (Op::JumpIfFalse, end),
                (Op::LoadGlobal, 0),
                (Op::LoadConst, 2),
                (Op::CompareOp, CompareOpType::Eq as u32),
                (Op::JumpIfFalse, orelse),
                (Op::Jump, end),
                (Op::LoadGlobal, 0),
                (Op::LoadConst, 0),
                (Op::BinaryOp, BinaryOpType::Add as u32),
                (Op::StoreGlobal, 0),
                (Op::Jump, header),
                (Op::Jump, header),
                (Op::Nil, 0),
                (Op::Ret, 0),
            ]
        );
        verify_all(&code);
    }

    #[test]
    fn test_mixed_short_circuit_chains() {
        let and_or = binary(
            binary(ident("a"), TokenKind::AndAnd, ident("b")),
            TokenKind::OrOr,
            ident("c"),
        );
        let code = compile_stmts(vec![expr_stmt(and_or)]);
        let is = instrs(&code);
        let inner_exit = is[3].offset as u32;
        let exit = is[5].offset as u32;
        assert_eq!(
            ops(&code),
            vec![
                (Op::LoadGlobal, 0),
                (Op::JumpFalseOrPop, inner_exit),
                (Op::LoadGlobal, 1),
                (Op::JumpTrueOrPop, exit),
                (Op::LoadGlobal, 2),
                (Op::PopTop, 0),
                (Op::Nil, 0),
                (Op::Ret, 0),
            ]
        );
        verify_all(&code);

        let or_and = binary(
            ident("a"),
            TokenKind::OrOr,
            binary(ident("b"), TokenKind::AndAnd, ident("c")),
        );
        let code = compile_stmts(vec![expr_stmt(or_and)]);
        let is = instrs(&code);
        let exit = is[5].offset as u32;
        assert_eq!(
            ops(&code)[..6],
            [
                (Op::LoadGlobal, 0),
                (Op::JumpTrueOrPop, exit),
                (Op::LoadGlobal, 1),
                (Op::JumpFalseOrPop, exit),
                (Op::LoadGlobal, 2),
                (Op::PopTop, 0),
            ]
        );
        verify_all(&code);
    }

    #[test]
    fn test_trait_with_methods() {
        let code = compile_stmts(vec![trait_decl(
            "Shape",
            vec![ident("Base")],
            vec![
                func_decl("area", &[], vec![ret(int(0))]),
                func_decl("describe", &["prefix"], vec![ret(ident("prefix"))]),
            ],
        )]);
        let module_ops: Vec<(Op, u32)> = ops(&code);
        assert_eq!(
            module_ops[..12],
            [
                (Op::LoadConst, 0),
                (Op::LoadConst, 1),
                (Op::LoadConst, 2),
                (Op::MakeFunction, 0),
                (Op::LoadConst, 3),
                (Op::LoadConst, 4),
                (Op::MakeFunction, 0),
                (Op::BuildMap, 2),
                (Op::LoadGlobal, 0),
                (Op::BuildTuple, 1),
                (Op::MakeTrait, 0),
                (Op::DeclareGlobal, pack_decl(1, DeclFlags::CONSTANT)),
            ]
        );
        assert_eq!(names(&code.names), vec!["Base", "Shape"]);

        let describe = child(&code, "describe");
        assert_eq!(&*describe.qualname, "main.Shape.describe");
        assert!(describe.flags.contains(CodeFlags::METHOD));
        assert_eq!(describe.arity, 2);
        assert_eq!(names(&describe.locals), vec!["self", "prefix"]);
        assert_eq!(ops(&describe), vec![(Op::LoadLocal, 1), (Op::Ret, 0)]);
        assert_eq!(child(&code, "area").arity, 1);
        verify_all(&code);
    }

    #[test]
    fn test_struct_inside_function() {
        let code = compile_stmts(vec![func_decl(
            "make",
            &["v"],
            vec![
                struct_decl(
                    "Box",
                    vec![],
                    vec![
                        var("value", ident("v")),
                        func_decl("get", &[], vec![ret(ident("v"))]),
                    ],
                ),
                ret(ident("Box")),
            ],
        )]);
        let make = child(&code, "make");
        assert_eq!(
            ops(&make),
            vec![
                (Op::LoadConst, 0),
                (Op::LoadConst, 1),
                (Op::LoadLocal, 0),
                (Op::LoadConst, 2),
                (Op::LoadConst, 3),
                (Op::MakeCell, 0),
                (Op::BuildTuple, 1),
                (Op::MakeClosure, 0),
                (Op::BuildMap, 2),
                (Op::BuildTuple, 0),
                (Op::MakeStruct, 0),
                (Op::StoreLocal, 1),
                (Op::LoadLocal, 1),
                (Op::Ret, 0),
            ]
        );
        assert_eq!(names(&make.locals), vec!["v", "Box"]);

        let get = child(&make, "get");
        assert_eq!(&*get.qualname, "main.make.Box.get");
        assert_eq!(names(&get.locals), vec!["self"]);
        assert_eq!(names(&get.enclosed), vec!["v"]);
        assert_eq!(ops(&get), vec![(Op::LoadEnclosed, 0), (Op::Ret, 0)]);
        verify_all(&code);
    }

    #[test]
    fn test_store_before_constant_declaration() {
        let err = compile_err(vec![
            func_decl("g", &[], vec![assign(at(2, ident("k")), int(2))]),
            let_("k", int(1)),
        ]);
        assert_eq!(message(&err), "cannot assign to constant 'k'");
        assert_eq!(err.line(), Some(3));

        let err = compile_err(vec![
            func_decl("g", &[], vec![assign(ident("f"), int(2))]),
            func_decl("f", &[], vec![]),
        ]);
        assert_eq!(message(&err), "cannot assign to function 'f'");

        let code = compile_stmts(vec![
            func_decl("g", &[], vec![assign(ident("k"), int(2))]),
            var("k", int(1)),
        ]);
        assert!(ops(&child(&code, "g")).contains(&(Op::StoreGlobal, 0)));
    }
}
