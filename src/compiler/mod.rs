//! Single-pass bytecode compiler: walks the labeled AST once and emits stack
//! code for the top-level script and every nested function.

pub mod scope;

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::ast::*;
use crate::bytecode::*;
use scope::{DeclareError, Scope};

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct CompileError {
    pub span: Span,
    pub message: String,
}

type Result<T> = std::result::Result<T, CompileError>;

fn error(span: Span, message: impl Into<String>) -> CompileError {
    CompileError { span, message: message.into() }
}

/// Callable without a binding, each with a fixed argument count.
const BUILTINS: &[(&str, u8, Op)] = &[
    ("len", 1, Op::Len),
    ("hasattr", 2, Op::HasAttr),
    ("getattr", 2, Op::GetAttrDyn),
    ("setattr", 3, Op::SetAttrDyn),
];

const MAX_UPVALUES: usize = 256;

const SCRIPT_NAME: &str = "<script>";

#[derive(Debug, Clone, Copy)]
enum Resolved {
    Local(u8),
    Upvalue(u8),
    Global(u16),
    /// The running closure, named inside its own body.
    Callee,
}

struct LoopContext {
    label: Option<String>,
    /// Scope depth outside the loop body; deeper locals are dropped on `break`/`continue`.
    depth: usize,
    /// Known up front for `while`; a `for` patches its continues before the advancement.
    continue_target: Option<usize>,
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

struct FunctionState {
    name: String,
    arity: u8,
    chunk: Chunk,
    scope: Scope,
    upvalues: Vec<UpvalueDesc>,
    loops: Vec<LoopContext>,
    /// Name that reads as the running closure rather than the slot it was declared into.
    callee: Option<String>,
}

impl FunctionState {
    fn new(name: &str, arity: u8) -> Self {
        FunctionState {
            name: name.to_string(),
            arity,
            chunk: Chunk::new(),
            scope: Scope::new(),
            upvalues: Vec::new(),
            loops: Vec::new(),
            callee: None,
        }
    }

    fn into_proto(self, origin: Rc<Origin>) -> FunctionProto {
        FunctionProto {
            name: self.name,
            arity: self.arity,
            chunk: self.chunk,
            upvalues: self.upvalues,
            origin,
        }
    }
}

pub struct Compiler<'m> {
    current: FunctionState,
    enclosing: Vec<FunctionState>,
    /// Every global name resolvable at this point, with its static arity if known.
    globals: HashMap<String, Option<u8>>,
    /// Top-level names this module declares itself, in declaration order.
    declared: Vec<String>,
    blueprints: HashMap<String, Rc<Blueprint>>,
    own_blueprints: Vec<Rc<Blueprint>>,
    /// Already compiled dependencies, keyed by the path written in `use`.
    modules: &'m HashMap<String, Rc<CompiledUnit>>,
    imports: Vec<Rc<CompiledUnit>>,
    origin: Rc<Origin>,
}

impl<'m> Compiler<'m> {
    pub fn new(origin: Rc<Origin>, modules: &'m HashMap<String, Rc<CompiledUnit>>) -> Self {
        Compiler {
            current: FunctionState::new(SCRIPT_NAME, 0),
            enclosing: Vec::new(),
            globals: HashMap::new(),
            declared: Vec::new(),
            blueprints: HashMap::new(),
            own_blueprints: Vec::new(),
            modules,
            imports: Vec::new(),
            origin,
        }
    }

    pub fn compile(mut self, program: &Program) -> Result<CompiledUnit> {
        for stmt in &program.statements {
            self.statement(stmt)?;
        }
        let end = program
            .statements
            .last()
            .map(|s| Span { start: s.span.end, end: s.span.end })
            .unwrap_or(Span::UNKNOWN);
        self.emit(Op::Halt, end);

        let exports = Exports {
            globals: self
                .declared
                .iter()
                .map(|name| (name.clone(), self.globals.get(name).copied().flatten()))
                .collect(),
            blueprints: self.own_blueprints,
        };
        let main = Rc::new(self.current.into_proto(self.origin.clone()));
        Ok(CompiledUnit { path: self.origin.path.clone(), main, imports: self.imports, exports })
    }

    // ── Emission helpers ─────────────────────────────────────────────

    fn emit(&mut self, op: Op, span: Span) -> usize {
        self.current.chunk.emit(op, span)
    }

    fn constant(&mut self, value: Constant, span: Span) -> Result<u16> {
        if self.current.chunk.constants.len() > u16::MAX as usize {
            return Err(error(span, "Too many constants in one chunk."));
        }
        Ok(self.current.chunk.add_const(value))
    }

    fn name_const(&mut self, name: &str, span: Span) -> Result<u16> {
        self.constant(Constant::Str(Rc::from(name)), span)
    }

    fn emit_jump(&mut self, op: Op, span: Span) -> usize {
        self.emit(op, span)
    }

    fn patch_jump(&mut self, pos: usize) {
        self.current.chunk.patch_jump(pos);
    }

    fn emit_loop(&mut self, target: usize, span: Span) {
        let offset = self.current.chunk.offset_to(target);
        self.emit(Op::Jump(offset), span);
    }

    /// One instruction per dropped slot, innermost first.
    fn emit_pops(&mut self, captured: &[bool], span: Span) {
        for &c in captured {
            self.emit(if c { Op::CloseUpvalue } else { Op::Pop }, span);
        }
    }

    fn emit_get(&mut self, var: Resolved, span: Span) {
        let op = match var {
            Resolved::Local(slot) => Op::GetLocal(slot),
            Resolved::Upvalue(i) => Op::GetUpvalue(i),
            Resolved::Global(k) => Op::GetGlobal(k),
            Resolved::Callee => Op::GetCallee,
        };
        self.emit(op, span);
    }

    fn emit_set(&mut self, var: Resolved, span: Span) -> Result<()> {
        let op = match var {
            Resolved::Local(slot) => Op::SetLocal(slot),
            Resolved::Upvalue(i) => Op::SetUpvalue(i),
            Resolved::Global(k) => Op::SetGlobal(k),
            Resolved::Callee => return Err(error(span, "Invalid assignment.")),
        };
        self.emit(op, span);
        Ok(())
    }

    fn emit_binary(&mut self, op: BinOp, span: Span) {
        let ops: &[Op] = match op {
            BinOp::Add => &[Op::Add],
            BinOp::Subtract => &[Op::Sub],
            BinOp::Multiply => &[Op::Mul],
            BinOp::Divide => &[Op::Div],
            BinOp::Modulo => &[Op::Mod],
            BinOp::Concat => &[Op::Concat],
            BinOp::BitAnd => &[Op::BitAnd],
            BinOp::BitOr => &[Op::BitOr],
            BinOp::BitXor => &[Op::BitXor],
            BinOp::ShiftLeft => &[Op::Shl],
            BinOp::ShiftRight => &[Op::Shr],
            BinOp::Equals => &[Op::Eq],
            BinOp::NotEquals => &[Op::Eq, Op::Not],
            BinOp::LessThan => &[Op::Lt],
            BinOp::LessOrEqual => &[Op::Gt, Op::Not],
            BinOp::GreaterThan => &[Op::Gt],
            BinOp::GreaterOrEqual => &[Op::Lt, Op::Not],
            // short-circuit forms are compiled by `logical`
            BinOp::And | BinOp::Or => &[],
        };
        for &op in ops {
            self.emit(op, span);
        }
    }

    // ── Name resolution ──────────────────────────────────────────────

    fn is_global_scope(&self) -> bool {
        self.enclosing.is_empty() && self.current.scope.depth == 0
    }

    /// Function state at `level`, counting the outermost script as 0.
    fn level_mut(&mut self, level: usize) -> &mut FunctionState {
        if level == self.enclosing.len() { &mut self.current } else { &mut self.enclosing[level] }
    }

    /// Resolves `name` for reading. Inside a local function's own body its
    /// name is the running closure, so the function never captures itself.
    fn resolve(&mut self, name: &str, span: Span) -> Result<Option<Resolved>> {
        self.lookup(name, span, true)
    }

    /// Resolves `name` to the storage it was declared into, for assignment and `&`.
    fn resolve_slot(&mut self, name: &str, span: Span) -> Result<Resolved> {
        self.lookup(name, span, false)?
            .ok_or_else(|| error(span, format!("Variable '{}' is not defined.", name)))
    }

    fn lookup(&mut self, name: &str, span: Span, callee: bool) -> Result<Option<Resolved>> {
        if let Some(slot) = self.current.scope.resolve(name) {
            return Ok(Some(Resolved::Local(slot)));
        }
        if callee && self.current.callee.as_deref() == Some(name) {
            return Ok(Some(Resolved::Callee));
        }
        if let Some(index) = self.resolve_upvalue(self.enclosing.len(), name, span, callee)? {
            return Ok(Some(Resolved::Upvalue(index)));
        }
        if self.globals.contains_key(name) {
            return Ok(Some(Resolved::Global(self.name_const(name, span)?)));
        }
        Ok(None)
    }

    fn resolve_or_err(&mut self, name: &str, span: Span) -> Result<Resolved> {
        self.resolve(name, span)?
            .ok_or_else(|| error(span, format!("Variable '{}' is not defined.", name)))
    }

    fn resolve_upvalue(&mut self, level: usize, name: &str, span: Span, callee: bool) -> Result<Option<u8>> {
        if level == 0 {
            return Ok(None);
        }
        let parent = level - 1;
        if let Some(slot) = self.level_mut(parent).scope.resolve(name) {
            self.level_mut(parent).scope.mark_captured(slot);
            return self.add_upvalue(level, UpvalueDesc::Local(slot), span).map(Some);
        }
        if callee && self.level_mut(parent).callee.as_deref() == Some(name) {
            return self.add_upvalue(level, UpvalueDesc::Callee, span).map(Some);
        }
        match self.resolve_upvalue(parent, name, span, callee)? {
            Some(index) => {
                let desc = UpvalueDesc::Enclosing(index);
                self.add_upvalue(level, desc, span).map(Some)
            }
            None => Ok(None),
        }
    }

    fn add_upvalue(&mut self, level: usize, desc: UpvalueDesc, span: Span) -> Result<u8> {
        let func = self.level_mut(level);
        if let Some(i) = func.upvalues.iter().position(|u| *u == desc) {
            return Ok(i as u8);
        }
        if func.upvalues.len() >= MAX_UPVALUES {
            return Err(error(span, "Maximum 256 closure variables."));
        }
        func.upvalues.push(desc);
        Ok((func.upvalues.len() - 1) as u8)
    }

    /// Static arity of whatever `name` currently resolves to.
    fn arity_of(&self, name: &str) -> Option<u8> {
        for func in std::iter::once(&self.current).chain(self.enclosing.iter().rev()) {
            if let Some(slot) = func.scope.resolve(name) {
                return func.scope.locals[slot as usize].arity;
            }
        }
        self.globals.get(name).copied().flatten()
    }

    fn forget_arity(&mut self, name: &str) {
        for func in std::iter::once(&mut self.current).chain(self.enclosing.iter_mut().rev()) {
            if let Some(slot) = func.scope.resolve(name) {
                func.scope.set_arity(slot, None);
                return;
            }
        }
        if let Some(arity) = self.globals.get_mut(name) {
            *arity = None;
        }
    }

    fn check_arity(&self, name: &str, argc: u8, span: Span) -> Result<()> {
        match self.arity_of(name) {
            Some(n) if n != argc => {
                Err(error(span, format!("Function '{}' requires {} arguments.", name, n)))
            }
            _ => Ok(()),
        }
    }

    fn declare_local(&mut self, name: &str, span: Span) -> Result<u8> {
        self.current.scope.declare(name).map_err(|e| match e {
            DeclareError::Duplicate => {
                error(span, format!("Variable '{}' is already declared in this scope.", name))
            }
            DeclareError::TooMany => error(span, "Maximum 256 locals."),
        })
    }

    fn declare_global(&mut self, name: &str, arity: Option<u8>) {
        self.globals.insert(name.to_string(), arity);
        if !self.declared.iter().any(|n| n == name) {
            self.declared.push(name.to_string());
        }
    }

    // ── Statements ───────────────────────────────────────────────────

    fn statement(&mut self, stmt: &Stmt) -> Result<()> {
        let span = stmt.span;
        match &stmt.node {
            StmtKind::Let { name, value } => {
                self.expression(value)?;
                if self.is_global_scope() {
                    let k = self.name_const(name, span)?;
                    self.emit(Op::DefineGlobal(k), span);
                    self.declare_global(name, None);
                } else {
                    self.declare_local(name, span)?;
                }
            }
            StmtKind::Expr(expr) => {
                self.expression(expr)?;
                self.emit(Op::Pop, span);
            }
            StmtKind::Print(expr) => {
                self.expression(expr)?;
                self.emit(Op::Print, span);
            }
            StmtKind::Assert(expr) => {
                self.expression(expr)?;
                self.emit(Op::Assert, span);
            }
            StmtKind::Return(value) => {
                if self.enclosing.is_empty() {
                    return Err(error(span, "Can't return from top-level code."));
                }
                match value {
                    Some(v) => self.expression(v)?,
                    None => {
                        self.emit(Op::Null, span);
                    }
                }
                self.emit(Op::Return, span);
            }
            StmtKind::Break { label } => self.loop_exit(label, true, span)?,
            StmtKind::Continue { label } => self.loop_exit(label, false, span)?,
            StmtKind::Block(body) => self.block(body, span)?,
            StmtKind::If { condition, then_branch, else_branch } => {
                self.expression(condition)?;
                let else_jump = self.emit_jump(Op::JumpIfFalse(0), condition.span);
                self.block(then_branch, span)?;
                match else_branch {
                    Some(branch) => {
                        let end = self.emit_jump(Op::Jump(0), span);
                        self.patch_jump(else_jump);
                        self.block(branch, span)?;
                        self.patch_jump(end);
                    }
                    None => self.patch_jump(else_jump),
                }
            }
            StmtKind::While { label, condition, body } => {
                let start = self.current.chunk.code.len();
                self.expression(condition)?;
                let exit = self.emit_jump(Op::JumpIfFalse(0), condition.span);
                self.begin_loop(label, Some(start));
                self.block(body, span)?;
                self.emit_loop(start, span);
                self.patch_jump(exit);
                self.end_loop();
            }
            StmtKind::For { label, init, condition, advance, body } => {
                self.current.scope.begin_scope();
                self.statement(init)?;
                let start = self.current.chunk.code.len();
                self.expression(condition)?;
                let exit = self.emit_jump(Op::JumpIfFalse(0), condition.span);
                self.begin_loop(label, None);
                self.block(body, span)?;
                self.patch_continues();
                self.expression(advance)?;
                self.emit(Op::Pop, advance.span);
                self.emit_loop(start, span);
                self.patch_jump(exit);
                self.end_loop();
                let popped = self.current.scope.end_scope();
                self.emit_pops(&popped, span);
            }
            StmtKind::Fn(decl) => self.fn_declaration(decl, true, span)?,
            StmtKind::Decorated { decorator, func } => self.decorated(decorator, func, span)?,
            StmtKind::Struct { name, properties } => self.struct_declaration(name, properties, span)?,
            StmtKind::Impl { name, methods } => self.impl_block(name, methods, span)?,
            StmtKind::Use { path } => self.use_module(path, span)?,
        }
        Ok(())
    }

    fn block(&mut self, body: &[Stmt], span: Span) -> Result<()> {
        self.current.scope.begin_scope();
        for stmt in body {
            self.statement(stmt)?;
        }
        let popped = self.current.scope.end_scope();
        let end = Span { start: span.end, end: span.end };
        self.emit_pops(&popped, end);
        Ok(())
    }

    // ── Loops ────────────────────────────────────────────────────────

    fn begin_loop(&mut self, label: &Option<String>, continue_target: Option<usize>) {
        let depth = self.current.scope.depth;
        self.current.loops.push(LoopContext {
            label: label.clone(),
            depth,
            continue_target,
            breaks: Vec::new(),
            continues: Vec::new(),
        });
    }

    fn patch_continues(&mut self) {
        let pending = match self.current.loops.last_mut() {
            Some(ctx) => std::mem::take(&mut ctx.continues),
            None => return,
        };
        for pos in pending {
            self.patch_jump(pos);
        }
    }

    fn end_loop(&mut self) {
        if let Some(ctx) = self.current.loops.pop() {
            for pos in ctx.breaks {
                self.patch_jump(pos);
            }
        }
    }

    /// `break` or `continue`: drop the locals the jump leaves behind, then jump.
    fn loop_exit(&mut self, label: &Option<String>, is_break: bool, span: Span) -> Result<()> {
        let keyword = if is_break { "break" } else { "continue" };
        let found = match label {
            Some(l) => self.current.loops.iter().rposition(|ctx| ctx.label.as_ref() == Some(l)),
            None => self.current.loops.len().checked_sub(1),
        };
        let idx = found
            .ok_or_else(|| error(span, format!("'{}' statement outside the loop", keyword)))?;

        let pops = self.current.scope.locals_above(self.current.loops[idx].depth);
        self.emit_pops(&pops, span);
        if is_break {
            let jump = self.emit_jump(Op::Jump(0), span);
            self.current.loops[idx].breaks.push(jump);
        } else if let Some(target) = self.current.loops[idx].continue_target {
            self.emit_loop(target, span);
        } else {
            let jump = self.emit_jump(Op::Jump(0), span);
            self.current.loops[idx].continues.push(jump);
        }
        Ok(())
    }

    // ── Functions ────────────────────────────────────────────────────

    fn param_count(decl: &FnDecl, span: Span) -> Result<u8> {
        u8::try_from(decl.params.len()).map_err(|_| error(span, "Maximum 255 parameters."))
    }

    /// Binds a named function. The name is visible inside its own body.
    fn fn_declaration(&mut self, decl: &FnDecl, static_arity: bool, span: Span) -> Result<()> {
        let arity = Self::param_count(decl, span)?;
        let arity = static_arity.then_some(arity);
        if self.is_global_scope() {
            self.declare_global(&decl.name, arity);
            self.function(decl, None, span)?;
            let k = self.name_const(&decl.name, span)?;
            self.emit(Op::DefineGlobal(k), span);
        } else {
            let slot = self.declare_local(&decl.name, span)?;
            self.current.scope.set_arity(slot, arity);
            // a decorated name must keep meaning the rebound slot inside the body
            let callee = static_arity.then_some(decl.name.as_str());
            self.function(decl, callee, span)?;
        }
        Ok(())
    }

    /// `@deco fn f() {}` is `fn f() {}` followed by `f = deco(f);`.
    fn decorated(&mut self, decorator: &str, decl: &FnDecl, span: Span) -> Result<()> {
        self.fn_declaration(decl, false, span)?;
        let deco = self.resolve_or_err(decorator, span)?;
        self.check_arity(decorator, 1, span)?;
        self.emit_get(deco, span);
        let func = self.resolve_slot(&decl.name, span)?;
        self.emit_get(func, span);
        self.emit(Op::Call(1), span);
        self.emit_set(func, span)?;
        self.emit(Op::Pop, span);
        Ok(())
    }

    /// Compiles `decl` as a nested prototype and emits the `Closure` that instantiates it.
    fn function(&mut self, decl: &FnDecl, callee: Option<&str>, span: Span) -> Result<()> {
        let arity = Self::param_count(decl, span)?;
        let mut state = FunctionState::new(&decl.name, arity);
        state.callee = callee.map(str::to_string);
        let outer = std::mem::replace(&mut self.current, state);
        self.enclosing.push(outer);
        let body = self.function_body(decl, span);
        let finished = match self.enclosing.pop() {
            Some(outer) => std::mem::replace(&mut self.current, outer),
            None => return Err(error(span, "function nesting underflow")),
        };
        body?;

        let proto = Rc::new(finished.into_proto(self.origin.clone()));
        let k = self.constant(Constant::Function(proto), span)?;
        self.emit(Op::Closure(k), span);
        Ok(())
    }

    fn function_body(&mut self, decl: &FnDecl, span: Span) -> Result<()> {
        self.current.scope.begin_scope();
        for param in &decl.params {
            self.declare_local(param, span)?;
        }
        // the body is its own block so it may shadow parameters
        self.current.scope.begin_scope();
        for stmt in &decl.body {
            self.statement(stmt)?;
        }
        let end = Span { start: span.end, end: span.end };
        self.emit(Op::Null, end);
        self.emit(Op::Return, end);
        Ok(())
    }

    // ── Structs and modules ──────────────────────────────────────────

    fn struct_declaration(&mut self, name: &str, properties: &[String], span: Span) -> Result<()> {
        let mut seen = HashSet::new();
        for prop in properties {
            if !seen.insert(prop.as_str()) {
                return Err(error(span, format!("struct '{}' has duplicate property '{}'", name, prop)));
            }
        }
        let blueprint = Rc::new(Blueprint { name: name.to_string(), properties: properties.to_vec() });
        self.blueprints.insert(name.to_string(), blueprint.clone());
        if self.is_global_scope() {
            self.own_blueprints.retain(|b| b.name != name);
            self.own_blueprints.push(blueprint);
        }
        Ok(())
    }

    fn impl_block(&mut self, name: &str, methods: &[FnDecl], span: Span) -> Result<()> {
        let blueprint = self
            .blueprints
            .get(name)
            .cloned()
            .ok_or_else(|| error(span, format!("struct '{}' is not defined.", name)))?;
        let bk = self.constant(Constant::Blueprint(blueprint), span)?;
        for method in methods {
            if method.params.is_empty() {
                return Err(error(
                    span,
                    format!("Method '{}' must take 'self' as its first parameter.", method.name),
                ));
            }
            self.function(method, None, span)?;
            let nk = self.name_const(&method.name, span)?;
            self.emit(Op::Method(bk, nk), span);
        }
        Ok(())
    }

    fn use_module(&mut self, path: &str, span: Span) -> Result<()> {
        if !self.is_global_scope() {
            return Err(error(span, "'use' is only allowed at the top level."));
        }
        let unit = self
            .modules
            .get(path)
            .cloned()
            .ok_or_else(|| error(span, format!("Module '{}' was not loaded.", path)))?;
        let idx = u16::try_from(self.imports.len()).map_err(|_| error(span, "Too many imports."))?;
        for (name, arity) in &unit.exports.globals {
            self.globals.insert(name.clone(), *arity);
        }
        for bp in &unit.exports.blueprints {
            self.blueprints.insert(bp.name.clone(), bp.clone());
        }
        self.imports.push(unit);
        self.emit(Op::Import(idx), span);
        Ok(())
    }

    // ── Expressions ──────────────────────────────────────────────────

    fn expression(&mut self, expr: &Expr) -> Result<()> {
        let span = expr.span;
        match &expr.node {
            ExprKind::Number(n) => {
                let k = self.constant(Constant::Number(*n), span)?;
                self.emit(Op::Const(k), span);
            }
            ExprKind::Str(s) => {
                let k = self.constant(Constant::Str(Rc::from(s.as_str())), span)?;
                self.emit(Op::Const(k), span);
            }
            ExprKind::Bool(b) => {
                self.emit(if *b { Op::True } else { Op::False }, span);
            }
            ExprKind::Null => {
                self.emit(Op::Null, span);
            }
            ExprKind::Variable(name) => {
                let var = self.resolve_or_err(name, span)?;
                self.emit_get(var, span);
            }
            ExprKind::Unary { op, operand } => {
                let code = match op {
                    UnaryOp::Negate => Op::Neg,
                    UnaryOp::Not => Op::Not,
                    UnaryOp::BitNot => Op::BitNot,
                    UnaryOp::Deref => Op::Deref,
                    UnaryOp::AddressOf => return self.address_of(operand, span),
                };
                self.expression(operand)?;
                self.emit(code, span);
            }
            ExprKind::Binary { op: op @ (BinOp::And | BinOp::Or), left, right } => {
                self.logical(*op, left, right, span)?;
            }
            ExprKind::Binary { op, left, right } => {
                self.expression(left)?;
                self.expression(right)?;
                self.emit_binary(*op, span);
            }
            ExprKind::Call { callee, args } => self.call(callee, args, span)?,
            ExprKind::Get { object, op, property } => {
                self.member_object(object, *op)?;
                let k = self.name_const(property, span)?;
                self.emit(Op::GetAttr(k), span);
            }
            ExprKind::Index { object, index } => {
                self.expression(object)?;
                self.expression(index)?;
                self.emit(Op::Index, span);
            }
            ExprKind::Assign { op, target, value } => self.assignment(*op, target, value, span)?,
            ExprKind::StructLiteral { name, fields } => self.struct_literal(name, fields, span)?,
            ExprKind::Array(elements) => {
                let count = u16::try_from(elements.len())
                    .map_err(|_| error(span, "Too many elements in array literal."))?;
                for element in elements {
                    self.expression(element)?;
                }
                self.emit(Op::Array(count), span);
            }
        }
        Ok(())
    }

    /// `a && b` leaves `false` without evaluating `b` when `a` is false;
    /// `a || b` leaves `true` without evaluating `b` when `a` is true.
    fn logical(&mut self, op: BinOp, left: &Expr, right: &Expr, span: Span) -> Result<()> {
        self.expression(left)?;
        let short = self.emit_jump(Op::JumpIfFalse(0), span);
        if op == BinOp::And {
            self.expression(right)?;
            let end = self.emit_jump(Op::Jump(0), span);
            self.patch_jump(short);
            self.emit(Op::False, span);
            self.patch_jump(end);
        } else {
            self.emit(Op::True, span);
            let end = self.emit_jump(Op::Jump(0), span);
            self.patch_jump(short);
            self.expression(right)?;
            self.patch_jump(end);
        }
        Ok(())
    }

    /// Pushes the struct a member access reads from, chasing the pointer for `->`.
    fn member_object(&mut self, object: &Expr, op: MemberOp) -> Result<()> {
        self.expression(object)?;
        if op == MemberOp::Arrow {
            self.emit(Op::Deref, object.span);
        }
        Ok(())
    }

    fn call(&mut self, callee: &Expr, args: &[Expr], span: Span) -> Result<()> {
        let argc = u8::try_from(args.len())
            .map_err(|_| error(span, "Can't have more than 255 arguments."))?;
        match &callee.node {
            ExprKind::Variable(name) => match self.resolve(name, callee.span)? {
                Some(var) => {
                    self.check_arity(name, argc, span)?;
                    self.emit_get(var, callee.span);
                }
                None => return self.builtin_call(name, args, span),
            },
            ExprKind::Get { object, op, property } => {
                self.member_object(object, *op)?;
                for arg in args {
                    self.expression(arg)?;
                }
                let k = self.name_const(property, span)?;
                self.emit(Op::CallMethod(k, argc), span);
                return Ok(());
            }
            _ => self.expression(callee)?,
        }
        for arg in args {
            self.expression(arg)?;
        }
        self.emit(Op::Call(argc), span);
        Ok(())
    }

    fn builtin_call(&mut self, name: &str, args: &[Expr], span: Span) -> Result<()> {
        let Some(&(_, arity, op)) = BUILTINS.iter().find(|(b, _, _)| *b == name) else {
            return Err(error(span, format!("Variable '{}' is not defined.", name)));
        };
        if args.len() != arity as usize {
            return Err(error(span, format!("Function '{}' requires {} arguments.", name, arity)));
        }
        for arg in args {
            self.expression(arg)?;
        }
        self.emit(op, span);
        Ok(())
    }

    /// Compound forms read the target, apply the operator, then store the result.
    fn assignment(&mut self, op: AssignOp, target: &Expr, value: &Expr, span: Span) -> Result<()> {
        let compound = match op {
            AssignOp::Plain => None,
            AssignOp::Compound(bin) => Some(bin),
        };
        match &target.node {
            ExprKind::Variable(name) => {
                let var = self.resolve_slot(name, target.span)?;
                if compound.is_some() {
                    self.emit_get(var, target.span);
                }
                self.assigned_value(compound, value, span)?;
                self.emit_set(var, span)?;
                self.forget_arity(name);
            }
            ExprKind::Get { object, op: member, property } => {
                self.member_object(object, *member)?;
                let k = self.name_const(property, target.span)?;
                if compound.is_some() {
                    self.emit(Op::Dup, target.span);
                    self.emit(Op::GetAttr(k), target.span);
                }
                self.assigned_value(compound, value, span)?;
                self.emit(Op::SetAttr(k), span);
            }
            ExprKind::Unary { op: UnaryOp::Deref, operand } => {
                self.expression(operand)?;
                if compound.is_some() {
                    self.emit(Op::Dup, target.span);
                    self.emit(Op::Deref, target.span);
                }
                self.assigned_value(compound, value, span)?;
                self.emit(Op::DerefSet, span);
            }
            ExprKind::Index { object, index } => {
                self.expression(object)?;
                self.expression(index)?;
                if compound.is_some() {
                    self.emit(Op::Dup2, target.span);
                    self.emit(Op::Index, target.span);
                }
                self.assigned_value(compound, value, span)?;
                self.emit(Op::SetIndex, span);
            }
            _ => return Err(error(target.span, "Invalid assignment.")),
        }
        Ok(())
    }

    fn assigned_value(&mut self, compound: Option<BinOp>, value: &Expr, span: Span) -> Result<()> {
        self.expression(value)?;
        if let Some(op) = compound {
            self.emit_binary(op, span);
        }
        Ok(())
    }

    /// `&x`, `&s.p`, `&p->q`; `&*p` is just `p`.
    fn address_of(&mut self, operand: &Expr, span: Span) -> Result<()> {
        match &operand.node {
            ExprKind::Variable(name) => {
                let op = match self.resolve_slot(name, operand.span)? {
                    Resolved::Local(slot) => {
                        self.current.scope.mark_captured(slot);
                        Op::LocalPtr(slot)
                    }
                    Resolved::Upvalue(i) => Op::UpvaluePtr(i),
                    Resolved::Global(k) => Op::GlobalPtr(k),
                    Resolved::Callee => {
                        return Err(error(span, "Cannot take the address of this expression."));
                    }
                };
                self.emit(op, span);
            }
            ExprKind::Get { object, op, property } => {
                self.member_object(object, *op)?;
                let k = self.name_const(property, span)?;
                self.emit(Op::AttrPtr(k), span);
            }
            ExprKind::Unary { op: UnaryOp::Deref, operand: pointer } => self.expression(pointer)?,
            _ => return Err(error(operand.span, "Cannot take the address of this expression.")),
        }
        Ok(())
    }

    fn struct_literal(&mut self, name: &str, fields: &[(String, Expr)], span: Span) -> Result<()> {
        let blueprint = self
            .blueprints
            .get(name)
            .cloned()
            .ok_or_else(|| error(span, format!("struct '{}' is not defined.", name)))?;

        let mut seen = HashSet::new();
        for (prop, value) in fields {
            if blueprint.index_of(prop).is_none() {
                return Err(error(value.span, format!("struct '{}' has no property '{}'", name, prop)));
            }
            if !seen.insert(prop.as_str()) {
                return Err(error(value.span, format!("struct '{}' has duplicate property '{}'", name, prop)));
            }
        }
        let missing: Vec<&str> = blueprint
            .properties
            .iter()
            .map(String::as_str)
            .filter(|p| !seen.contains(p))
            .collect();
        if !missing.is_empty() {
            return Err(error(
                span,
                format!("struct '{}' is missing properties: {}", name, missing.join(", ")),
            ));
        }

        let k = self.constant(Constant::Blueprint(blueprint), span)?;
        self.emit(Op::Struct(k), span);
        for (prop, value) in fields {
            self.expression(value)?;
            let pk = self.name_const(prop, value.span)?;
            self.emit(Op::InitProperty(pk), value.span);
        }
        Ok(())
    }
}

/// Compiles one labeled module. `modules` maps each `use` path in it to its compiled unit.
pub fn compile_program(
    program: &Program,
    origin: Rc<Origin>,
    modules: &HashMap<String, Rc<CompiledUnit>>,
) -> Result<CompiledUnit> {
    Compiler::new(origin, modules).compile(program)
}
