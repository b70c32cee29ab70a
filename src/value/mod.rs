use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use crate::bytecode::{Blueprint, FunctionProto};

/// Nesting depth past which rendering prints `...` instead of recursing.
const MAX_RENDER_DEPTH: usize = 32;
/// Nesting depth past which `==` gives up.
pub const MAX_COMPARE_DEPTH: usize = 1024;

// ── Heap objects ─────────────────────────────────────────────────────

#[derive(Debug)]
pub struct StructInstance {
    pub blueprint: Rc<Blueprint>,
    /// One value per blueprint property, in declaration order.
    pub fields: Vec<Value>,
}

impl StructInstance {
    pub fn new(blueprint: Rc<Blueprint>) -> Self {
        let fields = vec![Value::Null; blueprint.properties.len()];
        StructInstance { blueprint, fields }
    }

    pub fn get(&self, property: &str) -> Option<&Value> {
        self.blueprint.index_of(property).map(|i| &self.fields[i])
    }
}

/// Nested instances are released through a worklist so that dropping a long
/// chain does not recurse once per link.
impl Drop for StructInstance {
    fn drop(&mut self) {
        release(std::mem::take(&mut self.fields));
    }
}

/// Drops `values`, unlinking any struct, array or closed-over value that
/// becomes unreferenced instead of letting its destructor recurse.
pub fn release(mut pending: Vec<Value>) {
    while let Some(value) = pending.pop() {
        match value {
            Value::Struct(instance) => {
                if let Ok(cell) = Rc::try_unwrap(instance) {
                    let mut instance = cell.into_inner();
                    pending.append(&mut instance.fields);
                }
            }
            Value::Array(items) => {
                if let Ok(cell) = Rc::try_unwrap(items) {
                    pending.extend(cell.into_inner());
                }
            }
            Value::Closure(closure) => {
                if let Ok(closure) = Rc::try_unwrap(closure) {
                    for cell in closure.upvalues {
                        if let Ok(cell) = Rc::try_unwrap(cell) {
                            if let Upvalue::Closed(value) = cell.into_inner() {
                                pending.push(value);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

/// A captured variable. Open while the owning frame still holds the slot,
/// closed (owning the value) once that slot goes away.
#[derive(Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct Closure {
    pub proto: Rc<FunctionProto>,
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

/// Refers to a storage slot, never to a value.
#[derive(Debug, Clone)]
pub enum Pointer {
    /// A local or captured variable, shared with closures over the same slot.
    Cell(Rc<RefCell<Upvalue>>),
    Global(Rc<str>),
    Property(Rc<RefCell<StructInstance>>, usize),
}

impl PartialEq for Pointer {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Pointer::Cell(a), Pointer::Cell(b)) => Rc::ptr_eq(a, b),
            (Pointer::Global(a), Pointer::Global(b)) => a == b,
            (Pointer::Property(a, i), Pointer::Property(b, j)) => Rc::ptr_eq(a, b) && i == j,
            _ => false,
        }
    }
}

// ── Value ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Null,
    Str(Rc<str>),
    Array(Rc<RefCell<Vec<Value>>>),
    Struct(Rc<RefCell<StructInstance>>),
    Closure(Rc<Closure>),
    Pointer(Pointer),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Bool(_) => "boolean",
            Value::Null => "null",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            Value::Closure(_) => "function",
            Value::Pointer(_) => "pointer",
        }
    }

    pub fn string(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        if depth > MAX_RENDER_DEPTH {
            return write!(f, "...");
        }
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Null => write!(f, "null"),
            Value::Str(s) => write!(f, "{}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.render(f, depth + 1)?;
                }
                write!(f, "]")
            }
            Value::Struct(instance) => {
                let instance = instance.borrow();
                write!(f, "{} {{ ", instance.blueprint.name)?;
                for (i, (name, value)) in
                    instance.blueprint.properties.iter().zip(&instance.fields).enumerate()
                {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: ", name)?;
                    value.render(f, depth + 1)?;
                }
                write!(f, " }}")
            }
            Value::Closure(c) => write!(f, "<fn {}>", c.proto.name),
            Value::Pointer(_) => write!(f, "PTR"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, 0)
    }
}

/// Structural equality. Values of different kinds are never equal.
/// Comparisons nested past [`MAX_COMPARE_DEPTH`] count as unequal; the VM
/// reports them through [`Value::structural_eq`] instead.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.structural_eq(other).unwrap_or(false)
    }
}

impl Value {
    /// `None` when the values nest deeper than [`MAX_COMPARE_DEPTH`]. A pair of
    /// instances already being compared further up counts as equal, so cyclic
    /// values compare in finite time.
    pub fn structural_eq(&self, other: &Value) -> Option<bool> {
        values_eq(self, other, 0, &mut HashSet::new())
    }
}

fn values_eq(a: &Value, b: &Value, depth: usize, active: &mut HashSet<(usize, usize)>) -> Option<bool> {
    if depth > MAX_COMPARE_DEPTH {
        return None;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Some(x == y),
        (Value::Bool(x), Value::Bool(y)) => Some(x == y),
        (Value::Null, Value::Null) => Some(true),
        (Value::Str(x), Value::Str(y)) => Some(x == y),
        (Value::Array(x), Value::Array(y)) => {
            let pair = (Rc::as_ptr(x) as usize, Rc::as_ptr(y) as usize);
            if Rc::ptr_eq(x, y) || !active.insert(pair) {
                return Some(true);
            }
            let (xs, ys) = (x.borrow(), y.borrow());
            let equal = xs.len() == ys.len() && all_eq(xs.iter().zip(ys.iter()), depth, active)?;
            active.remove(&pair);
            Some(equal)
        }
        (Value::Struct(x), Value::Struct(y)) => {
            let pair = (Rc::as_ptr(x) as usize, Rc::as_ptr(y) as usize);
            if Rc::ptr_eq(x, y) || !active.insert(pair) {
                return Some(true);
            }
            let (xs, ys) = (x.borrow(), y.borrow());
            let equal = xs.blueprint.name == ys.blueprint.name
                && xs.fields.len() == ys.fields.len()
                && all_eq(xs.fields.iter().zip(&ys.fields), depth, active)?;
            active.remove(&pair);
            Some(equal)
        }
        (Value::Closure(x), Value::Closure(y)) => Some(Rc::ptr_eq(x, y)),
        (Value::Pointer(x), Value::Pointer(y)) => Some(x == y),
        _ => Some(false),
    }
}

fn all_eq<'v>(
    pairs: impl Iterator<Item = (&'v Value, &'v Value)>,
    depth: usize,
    active: &mut HashSet<(usize, usize)>,
) -> Option<bool> {
    for (x, y) in pairs {
        if !values_eq(x, y, depth + 1, active)? {
            return Some(false);
        }
    }
    Some(true)
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(name: &str, x: f64, y: f64) -> Value {
        let bp = Rc::new(Blueprint { name: name.into(), properties: vec!["x".into(), "y".into()] });
        let mut inst = StructInstance::new(bp);
        inst.fields = vec![Value::Number(x), Value::Number(y)];
        Value::Struct(Rc::new(RefCell::new(inst)))
    }

    #[test]
    fn render_scalars() {
        assert_eq!(Value::Number(4.0).to_string(), "4");
        assert_eq!(Value::Number(0.1 + 0.2).to_string(), "0.30000000000000004");
        assert_eq!(Value::Number(-2.5).to_string(), "-2.5");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::string("hi there").to_string(), "hi there");
    }

    #[test]
    fn render_struct_in_declaration_order() {
        assert_eq!(point("Point", 1.0, 2.0).to_string(), "Point { x: 1, y: 2 }");
    }

    #[test]
    fn render_array_and_pointer() {
        let arr = Value::array(vec![Value::Number(1.0), Value::string("a")]);
        assert_eq!(arr.to_string(), "[1, a]");
        let ptr = Value::Pointer(Pointer::Global("x".into()));
        assert_eq!(ptr.to_string(), "PTR");
    }

    #[test]
    fn render_self_containing_array_terminates() {
        let arr = Value::array(vec![]);
        if let Value::Array(items) = &arr {
            items.borrow_mut().push(arr.clone());
        }
        assert!(arr.to_string().contains("..."));
    }

    #[test]
    fn struct_equality_is_structural() {
        let a = point("Point", 1.0, 2.0);
        assert_eq!(a, a.clone());
        assert_eq!(a, point("Point", 1.0, 2.0));
        assert_ne!(a, point("Point", 1.0, 3.0));
        assert_ne!(a, point("Vec2", 1.0, 2.0));
    }

    #[test]
    fn cross_kind_comparisons_are_false() {
        assert_ne!(point("Point", 1.0, 2.0), Value::Number(1.0));
        assert_ne!(Value::Null, Value::Bool(false));
        assert_ne!(Value::Number(0.0), Value::string("0"));
    }

    #[test]
    fn pointer_equality_is_slot_identity() {
        let cell = Rc::new(RefCell::new(Upvalue::Open(3)));
        let a = Value::Pointer(Pointer::Cell(cell.clone()));
        let b = Value::Pointer(Pointer::Cell(cell));
        let c = Value::Pointer(Pointer::Cell(Rc::new(RefCell::new(Upvalue::Open(3)))));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let Value::Struct(inst) = point("Point", 0.0, 0.0) else { unreachable!() };
        let px = Value::Pointer(Pointer::Property(inst.clone(), 0));
        let py = Value::Pointer(Pointer::Property(inst, 1));
        assert_ne!(px, py);
    }

    #[test]
    fn self_containing_arrays_compare_equal() {
        let (a, b) = (Value::array(vec![]), Value::array(vec![]));
        for v in [&a, &b] {
            if let Value::Array(items) = v {
                items.borrow_mut().push(v.clone());
            }
        }
        assert_eq!(a.structural_eq(&b), Some(true));
        assert_ne!(a, Value::array(vec![Value::Null]));
    }

    #[test]
    fn deep_nesting_has_no_comparison_result() {
        let (mut a, mut b) = (Value::Null, Value::Null);
        for _ in 0..=MAX_COMPARE_DEPTH {
            a = Value::array(vec![a]);
            b = Value::array(vec![b]);
        }
        assert_eq!(a.structural_eq(&b), None);
        assert_ne!(a, b);
    }

    #[test]
    fn release_frees_nested_values() {
        let inner = Value::array(vec![Value::Number(1.0)]);
        let Value::Array(rc) = &inner else { unreachable!() };
        let weak = Rc::downgrade(rc);
        let outer = point("Point", 0.0, 0.0);
        if let Value::Struct(inst) = &outer {
            inst.borrow_mut().fields[0] = inner.clone();
        }
        drop(inner);
        release(vec![outer]);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn type_names() {
        assert_eq!(Value::Number(1.0).type_name(), "number");
        assert_eq!(Value::Bool(true).type_name(), "boolean");
        assert_eq!(point("P", 0.0, 0.0).type_name(), "struct");
        assert_eq!(Value::array(vec![]).type_name(), "array");
    }
}
