use std::fmt::Write as _;
use std::path::PathBuf;
use std::rc::Rc;

use crate::ast::Span;

// ── Opcodes ──────────────────────────────────────────────────────────
//
// Stack machine. Operands index the chunk's constant pool (u16), a local
// slot of the current frame (u8), or an upvalue of the running closure (u8).
// Jump offsets are relative to the instruction after the jump.

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    Const(u16),
    True,
    False,
    Null,
    Pop,
    Dup,
    /// Duplicate the top two values, preserving order.
    Dup2,
    Print,

    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Shl,
    Shr,
    Eq,
    Gt,
    Lt,
    Not,
    Neg,

    Jump(i32),
    /// Pops the condition.
    JumpIfFalse(i32),

    /// Pops the value into a new or existing global.
    DefineGlobal(u16),
    GetGlobal(u16),
    /// Stores the top of stack without popping it.
    SetGlobal(u16),
    GlobalPtr(u16),
    GetLocal(u8),
    SetLocal(u8),
    LocalPtr(u8),
    GetUpvalue(u8),
    SetUpvalue(u8),
    UpvaluePtr(u8),
    /// Pushes the closure of the running frame.
    GetCallee,
    /// Closes any upvalue over the top slot, then pops it.
    CloseUpvalue,

    /// Pushes a fresh instance of the blueprint constant, every property `null`.
    Struct(u16),
    /// Pops a value into a property of the instance below it, leaving the instance.
    InitProperty(u16),
    GetAttr(u16),
    /// `object value -> value`
    SetAttr(u16),
    AttrPtr(u16),
    Deref,
    /// `pointer value -> value`
    DerefSet,
    Array(u16),
    Index,
    /// `array index value -> value`
    SetIndex,

    Closure(u16),
    Call(u8),
    /// Method name constant and argument count (the receiver is not counted).
    CallMethod(u16, u8),
    /// Pops a closure and attaches it to the blueprint constant under the name constant.
    Method(u16, u16),
    Return,

    Len,
    HasAttr,
    GetAttrDyn,
    SetAttrDyn,
    Assert,

    /// Runs the body of the unit's nth import the first time it is reached.
    Import(u16),
    /// Ends a module body; execution stops when the root module ends.
    Halt,
}

// ── Constant pool ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Constant {
    Number(f64),
    Str(Rc<str>),
    Function(Rc<FunctionProto>),
    Blueprint(Rc<Blueprint>),
}

// ── Chunk ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<Op>,
    /// Source span per instruction, parallel to `code`.
    pub spans: Vec<Span>,
    pub constants: Vec<Constant>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Numbers and strings are interned; functions and blueprints always get a new slot.
    pub fn add_const(&mut self, val: Constant) -> u16 {
        for (i, c) in self.constants.iter().enumerate() {
            match (c, &val) {
                (Constant::Number(a), Constant::Number(b)) if a.to_bits() == b.to_bits() => return i as u16,
                (Constant::Str(a), Constant::Str(b)) if a == b => return i as u16,
                _ => {}
            }
        }
        let idx = self.constants.len() as u16;
        self.constants.push(val);
        idx
    }

    pub fn emit(&mut self, op: Op, span: Span) -> usize {
        let idx = self.code.len();
        self.code.push(op);
        self.spans.push(span);
        idx
    }

    /// Point the jump at `jump_pos` to the next instruction to be emitted.
    pub fn patch_jump(&mut self, jump_pos: usize) {
        let offset = (self.code.len() as i32) - (jump_pos as i32) - 1;
        match &mut self.code[jump_pos] {
            Op::Jump(o) | Op::JumpIfFalse(o) => *o = offset,
            _ => {}
        }
    }

    /// Offset for a jump emitted next that lands on `target`.
    pub fn offset_to(&self, target: usize) -> i32 {
        (target as i32) - (self.code.len() as i32) - 1
    }

    pub fn str_const(&self, idx: u16) -> Option<&Rc<str>> {
        match self.constants.get(idx as usize) {
            Some(Constant::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn disassemble(&self, name: &str) -> String {
        let mut out = format!("== {} ==\n", name);
        for (i, op) in self.code.iter().enumerate() {
            let _ = write!(out, "{:04} {:?}", i, op);
            let annotation = match *op {
                Op::Const(k) | Op::DefineGlobal(k) | Op::GetGlobal(k) | Op::SetGlobal(k)
                | Op::GlobalPtr(k) | Op::Struct(k) | Op::InitProperty(k) | Op::GetAttr(k)
                | Op::SetAttr(k) | Op::AttrPtr(k) | Op::Closure(k) | Op::CallMethod(k, _) => {
                    self.constants.get(k as usize).map(describe)
                }
                Op::Jump(o) | Op::JumpIfFalse(o) => Some(format!("-> {:04}", i as i64 + 1 + o as i64)),
                _ => None,
            };
            if let Some(note) = annotation {
                let _ = write!(out, "    ; {}", note);
            }
            out.push('\n');
        }
        for c in &self.constants {
            if let Constant::Function(proto) = c {
                out.push('\n');
                out.push_str(&proto.chunk.disassemble(&proto.name));
            }
        }
        out
    }
}

fn describe(c: &Constant) -> String {
    match c {
        Constant::Number(n) => n.to_string(),
        Constant::Str(s) => format!("{:?}", s),
        Constant::Function(f) => format!("<fn {}/{}>", f.name, f.arity),
        Constant::Blueprint(b) => format!("<struct {}>", b.name),
    }
}

// ── Functions and structs ────────────────────────────────────────────

/// Where a closure finds a captured variable when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalueDesc {
    /// A slot of the enclosing frame.
    Local(u8),
    /// An upvalue of the enclosing closure.
    Enclosing(u8),
    /// The enclosing closure itself.
    Callee,
}

/// Source text a prototype was compiled from, for runtime diagnostics.
#[derive(Debug)]
pub struct Origin {
    pub path: PathBuf,
    pub source: String,
}

#[derive(Debug)]
pub struct FunctionProto {
    pub name: String,
    pub arity: u8,
    pub chunk: Chunk,
    pub upvalues: Vec<UpvalueDesc>,
    pub origin: Rc<Origin>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Blueprint {
    pub name: String,
    pub properties: Vec<String>,
}

impl Blueprint {
    pub fn index_of(&self, property: &str) -> Option<usize> {
        self.properties.iter().position(|p| p == property)
    }
}

// ── Compiled unit ────────────────────────────────────────────────────

/// Names a module makes visible to the modules that import it.
#[derive(Debug, Clone, Default)]
pub struct Exports {
    /// Top-level names, with the arity of those bound to a plain `fn`.
    pub globals: Vec<(String, Option<u8>)>,
    pub blueprints: Vec<Rc<Blueprint>>,
}

#[derive(Debug)]
pub struct CompiledUnit {
    pub path: PathBuf,
    /// Top-level code, compiled as a zero-argument function ending in `Halt`.
    pub main: Rc<FunctionProto>,
    pub imports: Vec<Rc<CompiledUnit>>,
    pub exports: Exports,
}

impl CompiledUnit {
    pub fn disassemble(&self) -> String {
        self.main.chunk.disassemble(&format!("<module {}>", self.path.display()))
    }
}
