use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::Proto;

/// Fields of a struct are keyed by int or string; lookup uses value
/// equality, insertion order is preserved, and removal closes the order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKey {
    Int(i64),
    Str(Rc<str>),
}

impl FieldKey {
    pub fn from_value(value: &Value) -> Option<FieldKey> {
        match value {
            Value::Int(v) => Some(FieldKey::Int(*v)),
            Value::Str(s) => Some(FieldKey::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            FieldKey::Int(v) => Value::Int(*v),
            FieldKey::Str(s) => Value::Str(s.clone()),
        }
    }
}

pub type StructMap = IndexMap<FieldKey, Value>;

/// A captured enclosing local. Open while the enclosing frame is live (the
/// cell names the absolute stack slot), closed afterwards (the cell owns
/// the value). All closures capturing the same local share one cell.
#[derive(Debug)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct Upvalue {
    pub state: RefCell<UpvalueState>,
}

impl Upvalue {
    pub fn open(slot: usize) -> Rc<Upvalue> {
        Rc::new(Upvalue {
            state: RefCell::new(UpvalueState::Open(slot)),
        })
    }

    pub fn close(&self, value: Value) {
        *self.state.borrow_mut() = UpvalueState::Closed(value);
    }
}

#[derive(Debug)]
pub struct ClosureObj {
    pub proto: Rc<Proto>,
    pub upvalues: Vec<Rc<Upvalue>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Trace,
}

/// Hidden state behind a `foreach` loop. Array iteration re-reads the live
/// length each step; struct iteration walks a key list snapshotted when the
/// iterator was created, skipping keys deleted since.
#[derive(Debug)]
pub enum IterState {
    Array {
        array: Rc<RefCell<Vec<Value>>>,
        index: usize,
    },
    Struct {
        map: Rc<RefCell<StructMap>>,
        keys: Vec<FieldKey>,
        index: usize,
    },
}

#[derive(Debug, Clone)]
pub enum Value {
    /// Sentinel for "absent": reading a missing struct key, the result of
    /// `trace`. Distinct from null and rejected by almost every operation.
    Void,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Array(Rc<RefCell<Vec<Value>>>),
    Struct(Rc<RefCell<StructMap>>),
    Closure(Rc<ClosureObj>),
    Builtin(Builtin),
    /// VM-internal; lives only in a hidden foreach register and is never
    /// observable from the language.
    Iter(Rc<RefCell<IterState>>),
}

impl Value {
    pub fn new_array(elements: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(elements)))
    }

    pub fn new_struct() -> Value {
        Value::Struct(Rc::new(RefCell::new(StructMap::new())))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            Value::Closure(_) | Value::Builtin(_) => "closure",
            Value::Iter(_) => "iterator",
        }
    }

    /// `None` for void, which has no truth value.
    pub fn truthiness(&self) -> Option<bool> {
        let truthy = match self {
            Value::Void => return None,
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => !s.is_empty(),
            _ => true,
        };
        Some(truthy)
    }

    /// The `trace` rendering: strings quoted and escaped, containers in
    /// literal-like syntax, `...` marking self-reference.
    pub fn display_string(&self) -> String {
        let mut out = String::new();
        let mut active = Vec::new();
        fmt_value(self, &mut out, &mut active);
        out
    }

    /// The `str(x)` rendering: like `display_string` except a string
    /// converts to itself, unquoted.
    pub fn cast_str(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            other => other.display_string(),
        }
    }
}

/// Equality as exposed by `==`: scalars by value (int and float compare
/// numerically with each other), heap objects by identity.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Void, Value::Void) => true,
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => Rc::ptr_eq(x, y),
        (Value::Struct(x), Value::Struct(y)) => Rc::ptr_eq(x, y),
        (Value::Closure(x), Value::Closure(y)) => Rc::ptr_eq(x, y),
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        _ => false,
    }
}

pub fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        // keep the float-ness visible in output
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

fn fmt_value(value: &Value, out: &mut String, active: &mut Vec<usize>) {
    match value {
        Value::Void => {}
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(v) => out.push_str(&v.to_string()),
        Value::Float(v) => out.push_str(&format_float(*v)),
        Value::Str(s) => out.push_str(&quote_str(s)),
        Value::Array(array) => {
            let id = Rc::as_ptr(array) as usize;
            if active.contains(&id) {
                out.push_str("...");
                return;
            }
            active.push(id);
            out.push_str("[] {");
            for (i, element) in array.borrow().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                fmt_value(element, out, active);
            }
            out.push('}');
            active.pop();
        }
        Value::Struct(map) => {
            let id = Rc::as_ptr(map) as usize;
            if active.contains(&id) {
                out.push_str("...");
                return;
            }
            active.push(id);
            out.push_str("struct {");
            for (i, (key, field)) in map.borrow().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push('[');
                match key {
                    FieldKey::Int(v) => out.push_str(&v.to_string()),
                    FieldKey::Str(s) => out.push_str(&quote_str(s)),
                }
                out.push_str("] = ");
                fmt_value(field, out, active);
            }
            out.push('}');
            active.pop();
        }
        Value::Closure(_) | Value::Builtin(_) => out.push_str("closure"),
        Value::Iter(_) => out.push_str("<iterator>"),
    }
}

fn quote_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
