use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

use crate::ast::Span;
use crate::bytecode::{Blueprint, CompiledUnit, Constant, FunctionProto, Op, Origin, UpvalueDesc};
use crate::value::{Closure, Pointer, StructInstance, Upvalue, Value, release};

/// Deepest call nesting before the VM gives up.
pub const MAX_FRAMES: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("cannot '{op}' objects of types: '{left}' and '{right}'")]
    BinaryType { op: &'static str, left: &'static str, right: &'static str },
    #[error("cannot '{op}' objects of type: '{ty}'")]
    UnaryType { op: &'static str, ty: &'static str },
    #[error("expected a boolean condition, got '{0}'")]
    Condition(&'static str),
    #[error("assertion failed")]
    AssertionFailed,
    #[error("struct '{name}' has no property '{property}'")]
    NoProperty { name: String, property: String },
    #[error("method '{method}' is not defined on struct '{name}'.")]
    NoMethod { name: String, method: String },
    #[error("Function '{name}' requires {arity} arguments.")]
    Arity { name: String, arity: u8 },
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: f64, len: usize },
    #[error("Variable '{0}' is not defined.")]
    UndefinedGlobal(String),
    #[error("stack overflow")]
    StackOverflow,
    #[error("cannot compare values nested deeper than {} levels", crate::value::MAX_COMPARE_DEPTH)]
    CompareDepth,
    #[error("malformed bytecode: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type VmResult<T> = Result<T, VmError>;

/// A runtime failure located at the instruction that raised it.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RuntimeError {
    pub error: VmError,
    pub span: Span,
    pub origin: Option<Rc<Origin>>,
}

#[derive(Debug)]
pub struct RunResult {
    /// Operand stack left when the root module halted.
    pub final_stack: Vec<Value>,
}

struct CallFrame<'a> {
    closure: Rc<Closure>,
    ip: usize,
    /// Stack index of slot 0; the callee itself sits just below.
    base: usize,
    /// Set for module bodies, whose `Import` operands index this unit's imports.
    unit: Option<&'a CompiledUnit>,
}

enum Flow {
    Continue,
    Halt(Vec<Value>),
}

pub struct VM<'a> {
    stack: Vec<Value>,
    frames: Vec<CallFrame<'a>>,
    globals: HashMap<Rc<str>, Value>,
    /// Upvalues still pointing into the stack.
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    /// Methods by struct name, then method name.
    methods: HashMap<String, HashMap<Rc<str>, Rc<Closure>>>,
    executed: HashSet<PathBuf>,
    out: &'a mut dyn Write,
}

impl Drop for VM<'_> {
    fn drop(&mut self) {
        let mut roots = std::mem::take(&mut self.stack);
        roots.extend(self.globals.drain().map(|(_, value)| value));
        roots.extend(self.frames.drain(..).map(|frame| Value::Closure(frame.closure)));
        for methods in self.methods.drain().map(|(_, methods)| methods) {
            roots.extend(methods.into_values().map(Value::Closure));
        }
        release(roots);
    }
}

impl<'a> VM<'a> {
    pub fn new(out: &'a mut dyn Write) -> Self {
        VM {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            globals: HashMap::new(),
            open_upvalues: Vec::new(),
            methods: HashMap::new(),
            executed: HashSet::new(),
            out,
        }
    }

    pub fn run(&mut self, unit: &'a CompiledUnit) -> Result<RunResult, RuntimeError> {
        self.executed.insert(unit.path.clone());
        self.enter_module(unit);
        let result = self.execute();
        if let Ok(run) = &result {
            tracing::debug!(depth = run.final_stack.len(), "execution finished");
        }
        result
    }

    fn enter_module(&mut self, unit: &'a CompiledUnit) {
        let closure = Rc::new(Closure { proto: unit.main.clone(), upvalues: Vec::new() });
        self.stack.push(Value::Closure(closure.clone()));
        let base = self.stack.len();
        self.frames.push(CallFrame { closure, ip: 0, base, unit: Some(unit) });
    }

    fn execute(&mut self) -> Result<RunResult, RuntimeError> {
        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Err(self.locate(VmError::Malformed("no active frame")));
            };
            let Some(&op) = frame.closure.proto.chunk.code.get(frame.ip) else {
                return Err(self.locate(VmError::Malformed("ran past the end of a chunk")));
            };
            frame.ip += 1;
            tracing::trace!(ip = frame.ip - 1, ?op, depth = self.stack.len(), "dispatch");

            match self.step(op) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Halt(final_stack)) => return Ok(RunResult { final_stack }),
                Err(error) => return Err(self.locate(error)),
            }
        }
    }

    /// Attach the span of the instruction that just ran.
    fn locate(&self, error: VmError) -> RuntimeError {
        match self.frames.last() {
            Some(frame) => {
                let proto = &frame.closure.proto;
                let span = frame
                    .ip
                    .checked_sub(1)
                    .and_then(|i| proto.chunk.spans.get(i).copied())
                    .unwrap_or(Span::UNKNOWN);
                RuntimeError { error, span, origin: Some(proto.origin.clone()) }
            }
            None => RuntimeError { error, span: Span::UNKNOWN, origin: None },
        }
    }

    // ── Stack and frame access ───────────────────────────────────────

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(VmError::Malformed("stack underflow"))
    }

    fn peek(&self, distance: usize) -> VmResult<&Value> {
        self.stack
            .len()
            .checked_sub(distance + 1)
            .and_then(|i| self.stack.get(i))
            .ok_or(VmError::Malformed("stack underflow"))
    }

    fn frame(&self) -> VmResult<&CallFrame<'a>> {
        self.frames.last().ok_or(VmError::Malformed("no active frame"))
    }

    fn proto(&self) -> VmResult<&FunctionProto> {
        Ok(&self.frame()?.closure.proto)
    }

    fn constant(&self, k: u16) -> VmResult<&Constant> {
        self.proto()?.chunk.constants.get(k as usize).ok_or(VmError::Malformed("bad constant index"))
    }

    fn name(&self, k: u16) -> VmResult<Rc<str>> {
        match self.constant(k)? {
            Constant::Str(s) => Ok(s.clone()),
            _ => Err(VmError::Malformed("expected a name constant")),
        }
    }

    fn blueprint(&self, k: u16) -> VmResult<Rc<Blueprint>> {
        match self.constant(k)? {
            Constant::Blueprint(bp) => Ok(bp.clone()),
            _ => Err(VmError::Malformed("expected a struct constant")),
        }
    }

    /// The closure running in the current frame, which sits just below its slots.
    fn callee(&self) -> VmResult<Value> {
        let base = self.frame()?.base;
        base.checked_sub(1)
            .and_then(|i| self.stack.get(i))
            .cloned()
            .ok_or(VmError::Malformed("frame without a callee"))
    }

    fn slot(&self, slot: u8) -> VmResult<usize> {
        Ok(self.frame()?.base + slot as usize)
    }

    fn jump(&mut self, offset: i32) -> VmResult<()> {
        let frame = self.frames.last_mut().ok_or(VmError::Malformed("no active frame"))?;
        frame.ip = frame
            .ip
            .checked_add_signed(offset as isize)
            .ok_or(VmError::Malformed("jump before the start of a chunk"))?;
        Ok(())
    }

    // ── Upvalues and pointers ────────────────────────────────────────

    /// Reuses the open upvalue for `index` so every closure and pointer over
    /// one slot shares a single cell.
    fn capture_upvalue(&mut self, index: usize) -> Rc<RefCell<Upvalue>> {
        let existing = self
            .open_upvalues
            .iter()
            .find(|cell| matches!(*cell.borrow(), Upvalue::Open(slot) if slot == index));
        if let Some(cell) = existing {
            return cell.clone();
        }
        let cell = Rc::new(RefCell::new(Upvalue::Open(index)));
        self.open_upvalues.push(cell.clone());
        cell
    }

    /// Move every open upvalue at or above `from` off the stack.
    fn close_upvalues(&mut self, from: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|cell| {
            let mut upvalue = cell.borrow_mut();
            match *upvalue {
                Upvalue::Open(slot) if slot >= from => {
                    *upvalue = Upvalue::Closed(stack.get(slot).cloned().unwrap_or(Value::Null));
                    false
                }
                _ => true,
            }
        });
    }

    fn read_cell(&self, cell: &RefCell<Upvalue>) -> Value {
        match &*cell.borrow() {
            Upvalue::Open(slot) => self.stack.get(*slot).cloned().unwrap_or(Value::Null),
            Upvalue::Closed(value) => value.clone(),
        }
    }

    fn write_cell(&mut self, cell: &RefCell<Upvalue>, value: Value) {
        match &mut *cell.borrow_mut() {
            Upvalue::Open(slot) => {
                if let Some(target) = self.stack.get_mut(*slot) {
                    *target = value;
                }
            }
            Upvalue::Closed(stored) => *stored = value,
        }
    }

    fn upvalue(&self, index: u8) -> VmResult<Rc<RefCell<Upvalue>>> {
        self.frame()?
            .closure
            .upvalues
            .get(index as usize)
            .cloned()
            .ok_or(VmError::Malformed("bad upvalue index"))
    }

    fn read_pointer(&self, pointer: &Pointer) -> VmResult<Value> {
        match pointer {
            Pointer::Cell(cell) => Ok(self.read_cell(cell)),
            Pointer::Global(name) => self
                .globals
                .get(name)
                .cloned()
                .ok_or_else(|| VmError::UndefinedGlobal(name.to_string())),
            Pointer::Property(instance, i) => instance
                .borrow()
                .fields
                .get(*i)
                .cloned()
                .ok_or(VmError::Malformed("bad property pointer")),
        }
    }

    fn write_pointer(&mut self, pointer: &Pointer, value: Value) -> VmResult<()> {
        match pointer {
            Pointer::Cell(cell) => self.write_cell(cell, value),
            Pointer::Global(name) => match self.globals.get_mut(name) {
                Some(slot) => *slot = value,
                None => return Err(VmError::UndefinedGlobal(name.to_string())),
            },
            Pointer::Property(instance, i) => match instance.borrow_mut().fields.get_mut(*i) {
                Some(slot) => *slot = value,
                None => return Err(VmError::Malformed("bad property pointer")),
            },
        }
        Ok(())
    }

    // ── Calls ────────────────────────────────────────────────────────

    fn call_value(&mut self, callee: Value, argc: u8) -> VmResult<()> {
        match callee {
            Value::Closure(closure) => self.call_closure(closure, argc),
            other => Err(VmError::UnaryType { op: "call", ty: other.type_name() }),
        }
    }

    /// The callee and its `argc` arguments are already on the stack.
    fn call_closure(&mut self, closure: Rc<Closure>, argc: u8) -> VmResult<()> {
        if argc != closure.proto.arity {
            return Err(VmError::Arity { name: closure.proto.name.clone(), arity: closure.proto.arity });
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(VmError::StackOverflow);
        }
        let base = self.stack.len() - argc as usize;
        self.frames.push(CallFrame { closure, ip: 0, base, unit: None });
        Ok(())
    }

    /// `receiver args... -> result`. A property holding a function is called
    /// as-is; otherwise the struct's method is called with the receiver as `self`.
    fn call_method(&mut self, name: Rc<str>, argc: u8) -> VmResult<()> {
        let receiver_at = self
            .stack
            .len()
            .checked_sub(argc as usize + 1)
            .ok_or(VmError::Malformed("stack underflow"))?;
        let Value::Struct(instance) = &self.stack[receiver_at] else {
            return Err(VmError::UnaryType { op: ".", ty: self.stack[receiver_at].type_name() });
        };
        let instance = instance.clone();
        let property = instance.borrow().get(&name).cloned();
        if let Some(callee) = property {
            self.stack[receiver_at] = callee.clone();
            return self.call_value(callee, argc);
        }

        let struct_name = instance.borrow().blueprint.name.clone();
        let method = self
            .methods
            .get(&struct_name)
            .and_then(|table| table.get(&name))
            .cloned()
            .ok_or_else(|| VmError::NoMethod { name: struct_name, method: name.to_string() })?;
        self.stack.insert(receiver_at, Value::Closure(method.clone()));
        self.call_closure(method, argc + 1)
    }

    // ── Operators ────────────────────────────────────────────────────

    fn arithmetic(&mut self, op: &'static str, f: impl Fn(f64, f64) -> Value) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(f(*x, *y));
                Ok(())
            }
            _ => Err(VmError::BinaryType { op, left: a.type_name(), right: b.type_name() }),
        }
    }

    /// Operands are truncated to unsigned 64-bit integers; negatives saturate to 0.
    fn bitwise(&mut self, op: &'static str, f: fn(u64, u64) -> u64) -> VmResult<()> {
        self.arithmetic(op, move |a, b| Value::Number(f(a as u64, b as u64) as f64))
    }

    fn compare(&mut self, op: &'static str, greater: bool) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let ordering = match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
            (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
            _ => return Err(VmError::BinaryType { op, left: a.type_name(), right: b.type_name() }),
        };
        let result = match ordering {
            Some(std::cmp::Ordering::Greater) => greater,
            Some(std::cmp::Ordering::Less) => !greater,
            _ => false,
        };
        self.push(Value::Bool(result));
        Ok(())
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    fn step(&mut self, op: Op) -> VmResult<Flow> {
        match op {
            Op::Const(k) => {
                let value = match self.constant(k)? {
                    Constant::Number(n) => Value::Number(*n),
                    Constant::Str(s) => Value::Str(s.clone()),
                    _ => return Err(VmError::Malformed("constant is not a value")),
                };
                self.push(value);
            }
            Op::True => self.push(Value::Bool(true)),
            Op::False => self.push(Value::Bool(false)),
            Op::Null => self.push(Value::Null),
            Op::Pop => {
                self.pop()?;
            }
            Op::Dup => {
                let top = self.peek(0)?.clone();
                self.push(top);
            }
            Op::Dup2 => {
                let below = self.peek(1)?.clone();
                let top = self.peek(0)?.clone();
                self.push(below);
                self.push(top);
            }
            Op::Print => {
                let value = self.pop()?;
                writeln!(self.out, "dbg print :: {}", value)?;
            }

            Op::Add => self.arithmetic("+", |a, b| Value::Number(a + b))?,
            Op::Sub => self.arithmetic("-", |a, b| Value::Number(a - b))?,
            Op::Mul => self.arithmetic("*", |a, b| Value::Number(a * b))?,
            Op::Div => self.arithmetic("/", |a, b| Value::Number(a / b))?,
            Op::Mod => self.arithmetic("%", |a, b| Value::Number(a % b))?,
            Op::Concat => {
                let b = self.pop()?;
                let a = self.pop()?;
                match (&a, &b) {
                    (Value::Str(x), Value::Str(y)) => {
                        let joined: String = [x.as_ref(), y.as_ref()].concat();
                        self.push(Value::string(&joined));
                    }
                    _ => {
                        return Err(VmError::BinaryType { op: "++", left: a.type_name(), right: b.type_name() });
                    }
                }
            }
            Op::BitAnd => self.bitwise("&", |a, b| a & b)?,
            Op::BitOr => self.bitwise("|", |a, b| a | b)?,
            Op::BitXor => self.bitwise("^", |a, b| a ^ b)?,
            Op::Shl => self.bitwise("<<", |a, b| if b < 64 { a << b } else { 0 })?,
            Op::Shr => self.bitwise(">>", |a, b| if b < 64 { a >> b } else { 0 })?,
            Op::BitNot => match self.pop()? {
                Value::Number(n) => self.push(Value::Number(!(n as u64) as f64)),
                other => return Err(VmError::UnaryType { op: "~", ty: other.type_name() }),
            },
            Op::Eq => {
                let b = self.pop()?;
                let a = self.pop()?;
                let equal = a.structural_eq(&b).ok_or(VmError::CompareDepth)?;
                self.push(Value::Bool(equal));
            }
            Op::Gt => self.compare(">", true)?,
            Op::Lt => self.compare("<", false)?,
            Op::Not => match self.pop()? {
                Value::Bool(b) => self.push(Value::Bool(!b)),
                other => return Err(VmError::UnaryType { op: "!", ty: other.type_name() }),
            },
            Op::Neg => match self.pop()? {
                Value::Number(n) => self.push(Value::Number(-n)),
                other => return Err(VmError::UnaryType { op: "-", ty: other.type_name() }),
            },

            Op::Jump(offset) => self.jump(offset)?,
            Op::JumpIfFalse(offset) => match self.pop()? {
                Value::Bool(false) => self.jump(offset)?,
                Value::Bool(true) => {}
                other => return Err(VmError::Condition(other.type_name())),
            },

            Op::DefineGlobal(k) => {
                let name = self.name(k)?;
                let value = self.pop()?;
                self.globals.insert(name, value);
            }
            Op::GetGlobal(k) => {
                let name = self.name(k)?;
                let value = self
                    .globals
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| VmError::UndefinedGlobal(name.to_string()))?;
                self.push(value);
            }
            Op::SetGlobal(k) => {
                let name = self.name(k)?;
                let value = self.peek(0)?.clone();
                self.write_pointer(&Pointer::Global(name), value)?;
            }
            Op::GlobalPtr(k) => {
                let name = self.name(k)?;
                if !self.globals.contains_key(&name) {
                    return Err(VmError::UndefinedGlobal(name.to_string()));
                }
                self.push(Value::Pointer(Pointer::Global(name)));
            }
            Op::GetLocal(slot) => {
                let index = self.slot(slot)?;
                let value = self.stack.get(index).cloned().ok_or(VmError::Malformed("bad local slot"))?;
                self.push(value);
            }
            Op::SetLocal(slot) => {
                let index = self.slot(slot)?;
                let value = self.peek(0)?.clone();
                let target = self.stack.get_mut(index).ok_or(VmError::Malformed("bad local slot"))?;
                *target = value;
            }
            Op::LocalPtr(slot) => {
                let index = self.slot(slot)?;
                let cell = self.capture_upvalue(index);
                self.push(Value::Pointer(Pointer::Cell(cell)));
            }
            Op::GetUpvalue(i) => {
                let cell = self.upvalue(i)?;
                let value = self.read_cell(&cell);
                self.push(value);
            }
            Op::SetUpvalue(i) => {
                let cell = self.upvalue(i)?;
                let value = self.peek(0)?.clone();
                self.write_cell(&cell, value);
            }
            Op::UpvaluePtr(i) => {
                let cell = self.upvalue(i)?;
                self.push(Value::Pointer(Pointer::Cell(cell)));
            }
            Op::CloseUpvalue => {
                let top = self.stack.len().checked_sub(1).ok_or(VmError::Malformed("stack underflow"))?;
                self.close_upvalues(top);
                self.pop()?;
            }

            Op::Struct(k) => {
                let blueprint = self.blueprint(k)?;
                let instance = StructInstance::new(blueprint);
                self.push(Value::Struct(Rc::new(RefCell::new(instance))));
            }
            Op::InitProperty(k) => {
                let name = self.name(k)?;
                let value = self.pop()?;
                let Value::Struct(instance) = self.peek(0)? else {
                    return Err(VmError::Malformed("property initializer without a struct"));
                };
                set_property(instance, &name, value)?;
            }
            Op::GetAttr(k) => {
                let name = self.name(k)?;
                let object = self.pop()?;
                let value = get_property(&object, ".", &name)?;
                self.push(value);
            }
            Op::SetAttr(k) => {
                let name = self.name(k)?;
                let value = self.pop()?;
                match self.pop()? {
                    Value::Struct(instance) => set_property(&instance, &name, value.clone())?,
                    other => return Err(VmError::UnaryType { op: ".", ty: other.type_name() }),
                }
                self.push(value);
            }
            Op::AttrPtr(k) => {
                let name = self.name(k)?;
                match self.pop()? {
                    Value::Struct(instance) => {
                        let index = property_index(&instance, &name)?;
                        self.push(Value::Pointer(Pointer::Property(instance, index)));
                    }
                    other => return Err(VmError::UnaryType { op: "&", ty: other.type_name() }),
                }
            }
            Op::Deref => match self.pop()? {
                Value::Pointer(pointer) => {
                    let value = self.read_pointer(&pointer)?;
                    self.push(value);
                }
                other => return Err(VmError::UnaryType { op: "*", ty: other.type_name() }),
            },
            Op::DerefSet => {
                let value = self.pop()?;
                match self.pop()? {
                    Value::Pointer(pointer) => self.write_pointer(&pointer, value.clone())?,
                    other => return Err(VmError::UnaryType { op: "*", ty: other.type_name() }),
                }
                self.push(value);
            }
            Op::Array(count) => {
                let start = self
                    .stack
                    .len()
                    .checked_sub(count as usize)
                    .ok_or(VmError::Malformed("stack underflow"))?;
                let items = self.stack.split_off(start);
                self.push(Value::array(items));
            }
            Op::Index => {
                let index = self.pop()?;
                let object = self.pop()?;
                let value = match (&object, &index) {
                    (Value::Array(items), Value::Number(n)) => {
                        let items = items.borrow();
                        items[element_index(*n, items.len())?].clone()
                    }
                    (Value::Str(s), Value::Number(n)) => {
                        let len = s.chars().count();
                        let c = s.chars().nth(element_index(*n, len)?).unwrap_or_default();
                        Value::string(c.encode_utf8(&mut [0; 4]))
                    }
                    _ => {
                        return Err(VmError::BinaryType {
                            op: "[]",
                            left: object.type_name(),
                            right: index.type_name(),
                        });
                    }
                };
                self.push(value);
            }
            Op::SetIndex => {
                let value = self.pop()?;
                let index = self.pop()?;
                let object = self.pop()?;
                match (&object, &index) {
                    (Value::Array(items), Value::Number(n)) => {
                        let mut items = items.borrow_mut();
                        let i = element_index(*n, items.len())?;
                        items[i] = value.clone();
                    }
                    _ => {
                        return Err(VmError::BinaryType {
                            op: "[]=",
                            left: object.type_name(),
                            right: index.type_name(),
                        });
                    }
                }
                self.push(value);
            }

            Op::GetCallee => {
                let callee = self.callee()?;
                self.push(callee);
            }
            Op::Closure(k) => {
                let Constant::Function(proto) = self.constant(k)? else {
                    return Err(VmError::Malformed("expected a function constant"));
                };
                let proto = proto.clone();
                let base = self.frame()?.base;
                let mut upvalues = Vec::with_capacity(proto.upvalues.len());
                for desc in &proto.upvalues {
                    let cell = match *desc {
                        UpvalueDesc::Local(slot) => self.capture_upvalue(base + slot as usize),
                        UpvalueDesc::Enclosing(index) => self.upvalue(index)?,
                        UpvalueDesc::Callee => Rc::new(RefCell::new(Upvalue::Closed(self.callee()?))),
                    };
                    upvalues.push(cell);
                }
                self.push(Value::Closure(Rc::new(Closure { proto, upvalues })));
            }
            Op::Call(argc) => {
                let callee = self.peek(argc as usize)?.clone();
                self.call_value(callee, argc)?;
            }
            Op::CallMethod(k, argc) => {
                let name = self.name(k)?;
                self.call_method(name, argc)?;
            }
            Op::Method(bk, nk) => {
                let blueprint = self.blueprint(bk)?;
                let name = self.name(nk)?;
                let Value::Closure(method) = self.pop()? else {
                    return Err(VmError::Malformed("method is not a function"));
                };
                self.methods.entry(blueprint.name.clone()).or_default().insert(name, method);
            }
            Op::Return => {
                let result = self.pop()?;
                let frame = self.frames.pop().ok_or(VmError::Malformed("no active frame"))?;
                self.close_upvalues(frame.base);
                self.stack.truncate(frame.base.saturating_sub(1));
                self.push(result);
            }

            Op::Len => {
                let value = self.pop()?;
                let len = match &value {
                    Value::Str(s) => s.chars().count(),
                    Value::Array(items) => items.borrow().len(),
                    other => return Err(VmError::UnaryType { op: "len()", ty: other.type_name() }),
                };
                self.push(Value::Number(len as f64));
            }
            Op::HasAttr => {
                let name = self.pop()?;
                let object = self.pop()?;
                let (instance, name) = dynamic_target("hasattr()", &object, &name)?;
                let found = instance.borrow().blueprint.index_of(name).is_some();
                self.push(Value::Bool(found));
            }
            Op::GetAttrDyn => {
                let name = self.pop()?;
                let object = self.pop()?;
                let (_, name) = dynamic_target("getattr()", &object, &name)?;
                let value = get_property(&object, "getattr()", name)?;
                self.push(value);
            }
            Op::SetAttrDyn => {
                let value = self.pop()?;
                let name = self.pop()?;
                let object = self.pop()?;
                let (instance, name) = dynamic_target("setattr()", &object, &name)?;
                set_property(instance, name, value.clone())?;
                self.push(value);
            }
            Op::Assert => match self.pop()? {
                Value::Bool(true) => {}
                Value::Bool(false) => return Err(VmError::AssertionFailed),
                other => return Err(VmError::UnaryType { op: "assert()", ty: other.type_name() }),
            },

            Op::Import(idx) => {
                let unit = self.frame()?.unit.ok_or(VmError::Malformed("import outside a module body"))?;
                let import = unit.imports.get(idx as usize).ok_or(VmError::Malformed("bad import index"))?;
                if self.executed.insert(import.path.clone()) {
                    tracing::debug!(path = %import.path.display(), "running module body");
                    self.enter_module(import);
                }
            }
            Op::Halt => {
                let frame = self.frames.pop().ok_or(VmError::Malformed("no active frame"))?;
                self.close_upvalues(frame.base);
                if self.frames.is_empty() {
                    let final_stack = self.stack.split_off(frame.base.min(self.stack.len()));
                    return Ok(Flow::Halt(final_stack));
                }
                self.stack.truncate(frame.base.saturating_sub(1));
            }
        }
        Ok(Flow::Continue)
    }
}

fn element_index(n: f64, len: usize) -> VmResult<usize> {
    if n >= 0.0 && n.fract() == 0.0 && (n as usize) < len {
        Ok(n as usize)
    } else {
        Err(VmError::IndexOutOfBounds { index: n, len })
    }
}

fn property_index(instance: &RefCell<StructInstance>, name: &str) -> VmResult<usize> {
    let instance = instance.borrow();
    instance.blueprint.index_of(name).ok_or_else(|| VmError::NoProperty {
        name: instance.blueprint.name.clone(),
        property: name.to_string(),
    })
}

fn get_property(object: &Value, op: &'static str, name: &str) -> VmResult<Value> {
    let Value::Struct(instance) = object else {
        return Err(VmError::UnaryType { op, ty: object.type_name() });
    };
    let index = property_index(instance, name)?;
    Ok(instance.borrow().fields[index].clone())
}

fn set_property(instance: &RefCell<StructInstance>, name: &str, value: Value) -> VmResult<()> {
    let index = property_index(instance, name)?;
    instance.borrow_mut().fields[index] = value;
    Ok(())
}

/// Operands of `hasattr`/`getattr`/`setattr`: a struct and a property name string.
fn dynamic_target<'v>(
    op: &'static str,
    object: &'v Value,
    name: &'v Value,
) -> VmResult<(&'v Rc<RefCell<StructInstance>>, &'v str)> {
    match (object, name) {
        (Value::Struct(instance), Value::Str(name)) => Ok((instance, &**name)),
        (Value::Struct(_), other) | (other, _) => Err(VmError::UnaryType { op, ty: other.type_name() }),
    }
}

/// Runs a compiled root module, writing `print` output to `out`.
pub fn run(unit: &CompiledUnit, out: &mut dyn Write) -> Result<RunResult, RuntimeError> {
    VM::new(out).run(unit)
}
