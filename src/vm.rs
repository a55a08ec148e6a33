use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::bytecode::{Constant, OpCode, Program, Proto, UpvalueDesc, BUILTIN_TRACE};
use crate::compiler;
use crate::error::{RuntimeError, RuntimeErrorKind, TraceFrame};
use crate::host::Host;
use crate::token::SourceLocation;
use crate::value::{
    values_equal, Builtin, ClosureObj, FieldKey, IterState, Upvalue, UpvalueState, Value,
};

/// Total value-stack budget across all frames. Deep recursion exhausts this
/// and surfaces as a "stack overflow" runtime error.
const MAX_STACK_SLOTS: usize = 64 * 1024;

struct Frame {
    proto: Rc<Proto>,
    upvalues: Vec<Rc<Upvalue>>,
    ip: usize,
    base: usize,
    ret_slot: usize,
    /// Script frames (the top level and every `require`) own an entry on
    /// the script-dir and loading stacks.
    is_script: bool,
}

pub struct Vm<'h> {
    host: &'h mut dyn Host,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    /// Live capture cells keyed by the absolute stack slot they alias, so
    /// one enclosing local maps to exactly one cell.
    open_upvalues: Vec<(usize, Rc<Upvalue>)>,
    script_dirs: Vec<PathBuf>,
    loading: Vec<PathBuf>,
}

impl<'h> Vm<'h> {
    pub fn new(host: &'h mut dyn Host) -> Self {
        Self {
            host,
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            script_dirs: Vec::new(),
            loading: Vec::new(),
        }
    }

    /// Executes a compiled script with the given `argv` values and returns
    /// its top-level `return` value (null when it falls off the end).
    pub fn run(&mut self, program: &Program, argv: Vec<Value>) -> Result<Value, RuntimeError> {
        let script_path = PathBuf::from(&**program.path());
        let dir = script_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default();

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.script_dirs.push(dir);
        self.loading.push(script_path);

        let proto = program.proto.clone();
        self.stack.resize(proto.num_registers.max(1), Value::Null);
        self.stack[0] = Value::new_array(argv);
        self.frames.push(Frame {
            proto,
            upvalues: Vec::new(),
            ip: 0,
            base: 0,
            ret_slot: 0,
            is_script: true,
        });

        let result = self.dispatch();
        if result.is_err() {
            self.script_dirs.clear();
            self.loading.clear();
            self.frames.clear();
            self.stack.clear();
            self.open_upvalues.clear();
        }
        result
    }

    fn dispatch(&mut self) -> Result<Value, RuntimeError> {
        loop {
            let (op, a, b, c, loc) = {
                let frame = self.frames.last_mut().expect("active frame");
                let instr = frame.proto.code[frame.ip];
                frame.ip += 1;
                (instr.op, instr.a, instr.b, instr.c, instr.loc)
            };

            match op {
                OpCode::LoadVoid => self.set_reg(a, Value::Void),
                OpCode::LoadNull => self.set_reg(a, Value::Null),
                OpCode::LoadBool => self.set_reg(a, Value::Bool(b != 0)),
                OpCode::LoadInt => self.set_reg(a, Value::Int(b as i64)),
                OpCode::LoadConst => {
                    let value = {
                        let frame = self.frames.last().expect("active frame");
                        match &frame.proto.constants[b as usize] {
                            Constant::Int(v) => Value::Int(*v),
                            Constant::Float(v) => Value::Float(*v),
                            Constant::Str(s) => Value::Str(s.clone()),
                        }
                    };
                    self.set_reg(a, value);
                }
                OpCode::LoadBuiltin => {
                    debug_assert_eq!(b, BUILTIN_TRACE);
                    self.set_reg(a, Value::Builtin(Builtin::Trace));
                }
                OpCode::Move => {
                    let value = self.reg(b);
                    if matches!(value, Value::Void) {
                        return Err(self.type_error(loc, &[&value]));
                    }
                    self.set_reg(a, value);
                }

                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::Shl
                | OpCode::Shr
                | OpCode::BitAnd
                | OpCode::BitOr
                | OpCode::BitXor => {
                    let l = self.reg(b);
                    let r = self.reg(c);
                    let value = arith(op, &l, &r).map_err(|kind| self.error(loc, kind))?;
                    self.set_reg(a, value);
                }

                OpCode::Eq => {
                    let l = self.reg(b);
                    let r = self.reg(c);
                    self.set_reg(a, Value::Bool(values_equal(&l, &r)));
                }
                OpCode::Ne => {
                    let l = self.reg(b);
                    let r = self.reg(c);
                    self.set_reg(a, Value::Bool(!values_equal(&l, &r)));
                }
                OpCode::Lt | OpCode::Le | OpCode::Gt | OpCode::Ge => {
                    let l = self.reg(b);
                    let r = self.reg(c);
                    let value = compare(op, &l, &r).map_err(|kind| self.error(loc, kind))?;
                    self.set_reg(a, value);
                }

                OpCode::Neg => {
                    let v = self.reg(b);
                    let value = match v {
                        Value::Int(x) => Value::Int(x.wrapping_neg()),
                        Value::Float(x) => Value::Float(-x),
                        other => return Err(self.type_error(loc, &[&other])),
                    };
                    self.set_reg(a, value);
                }
                OpCode::Not => {
                    let v = self.reg(b);
                    let Some(t) = v.truthiness() else {
                        return Err(self.type_error(loc, &[&v]));
                    };
                    self.set_reg(a, Value::Bool(!t));
                }
                OpCode::BitNot => {
                    let v = self.reg(b);
                    let Value::Int(x) = &v else {
                        return Err(self.type_error(loc, &[&v]));
                    };
                    let value = Value::Int(!*x);
                    self.set_reg(a, value);
                }
                OpCode::ToBool | OpCode::CastBool => {
                    let v = self.reg(b);
                    let Some(t) = v.truthiness() else {
                        return Err(self.type_error(loc, &[&v]));
                    };
                    self.set_reg(a, Value::Bool(t));
                }

                OpCode::CastInt => {
                    let v = self.reg(b);
                    let value = match &v {
                        Value::Int(x) => Value::Int(*x),
                        Value::Float(x) => Value::Int(x.trunc() as i64),
                        Value::Str(s) => {
                            let parsed = s.trim().parse::<i64>().map_err(|_| {
                                self.error(loc, RuntimeErrorKind::IntParse(s.to_string()))
                            })?;
                            Value::Int(parsed)
                        }
                        other => return Err(self.type_error(loc, &[other])),
                    };
                    self.set_reg(a, value);
                }
                OpCode::CastFloat => {
                    let v = self.reg(b);
                    let value = match &v {
                        Value::Float(x) => Value::Float(*x),
                        Value::Int(x) => Value::Float(*x as f64),
                        Value::Str(s) => {
                            let parsed = s.trim().parse::<f64>().map_err(|_| {
                                self.error(loc, RuntimeErrorKind::FloatParse(s.to_string()))
                            })?;
                            Value::Float(parsed)
                        }
                        other => return Err(self.type_error(loc, &[other])),
                    };
                    self.set_reg(a, value);
                }
                OpCode::CastStr => {
                    let v = self.reg(b);
                    if matches!(v, Value::Void) {
                        return Err(self.type_error(loc, &[&v]));
                    }
                    self.set_reg(a, Value::Str(Rc::from(v.cast_str())));
                }
                OpCode::TypeOf => {
                    let v = self.reg(b);
                    self.set_reg(a, Value::Str(Rc::from(v.type_name())));
                }
                OpCode::Len => {
                    let v = self.reg(b);
                    let len = match &v {
                        Value::Str(s) => s.len(),
                        Value::Array(arr) => arr.borrow().len(),
                        Value::Struct(map) => map.borrow().len(),
                        other => return Err(self.type_error(loc, &[other])),
                    };
                    self.set_reg(a, Value::Int(len as i64));
                }

                OpCode::NewArray => self.set_reg(a, Value::new_array(Vec::new())),
                OpCode::NewStruct => self.set_reg(a, Value::new_struct()),
                OpCode::IdxGet => {
                    let cont = self.reg(b);
                    let key = self.reg(c);
                    let value = self
                        .index_get(&cont, &key)
                        .map_err(|kind| self.error(loc, kind))?;
                    self.set_reg(a, value);
                }
                OpCode::IdxSet => {
                    let cont = self.reg(a);
                    let key = self.reg(b);
                    let value = self.reg(c);
                    self.index_set(&cont, &key, value)
                        .map_err(|kind| self.error(loc, kind))?;
                }
                OpCode::FieldGet => {
                    let cont = self.reg(b);
                    let key = self.constant_key(c);
                    let value = self
                        .index_get(&cont, &key)
                        .map_err(|kind| self.error(loc, kind))?;
                    self.set_reg(a, value);
                }
                OpCode::FieldSet => {
                    let cont = self.reg(a);
                    let key = self.constant_key(b);
                    let value = self.reg(c);
                    self.index_set(&cont, &key, value)
                        .map_err(|kind| self.error(loc, kind))?;
                }
                OpCode::DelSlot => {
                    let cont = self.reg(a);
                    let key = self.reg(b);
                    self.delete_slot(&cont, &key)
                        .map_err(|kind| self.error(loc, kind))?;
                }

                OpCode::Jmp => self.jump(b),
                OpCode::JmpIfFalse | OpCode::JmpIfTrue => {
                    let v = self.reg(a);
                    let Some(t) = v.truthiness() else {
                        return Err(self.type_error(loc, &[&v]));
                    };
                    if t == (op == OpCode::JmpIfTrue) {
                        self.jump(b);
                    }
                }

                OpCode::CloseFn => {
                    let proto = {
                        let frame = self.frames.last().expect("active frame");
                        frame.proto.protos[b as usize].clone()
                    };
                    let base = self.frames.last().expect("active frame").base;
                    let mut upvalues = Vec::with_capacity(proto.upvalues.len());
                    for desc in &proto.upvalues {
                        let cell = match desc {
                            UpvalueDesc::ParentLocal(reg) => self.find_or_open(base + reg),
                            UpvalueDesc::ParentUpvalue(idx) => {
                                self.frames.last().expect("active frame").upvalues[*idx].clone()
                            }
                        };
                        upvalues.push(cell);
                    }
                    self.set_reg(a, Value::Closure(Rc::new(ClosureObj { proto, upvalues })));
                }
                OpCode::UpGet => {
                    let cell = self.frames.last().expect("active frame").upvalues[b as usize]
                        .clone();
                    let value = match &*cell.state.borrow() {
                        UpvalueState::Open(slot) => self.stack[*slot].clone(),
                        UpvalueState::Closed(v) => v.clone(),
                    };
                    if matches!(value, Value::Void) {
                        return Err(self.type_error(loc, &[&value]));
                    }
                    self.set_reg(a, value);
                }
                OpCode::UpSet => {
                    let value = self.reg(b);
                    if matches!(value, Value::Void) {
                        return Err(self.type_error(loc, &[&value]));
                    }
                    let cell = self.frames.last().expect("active frame").upvalues[a as usize]
                        .clone();
                    let mut state = cell.state.borrow_mut();
                    match &mut *state {
                        UpvalueState::Open(slot) => self.stack[*slot] = value,
                        UpvalueState::Closed(v) => *v = value,
                    }
                }
                OpCode::CloseUp => {
                    let min = self.frames.last().expect("active frame").base + a as usize;
                    self.close_upvalues(min);
                }

                OpCode::Call => {
                    let callee_slot = self.slot(b);
                    let ret_slot = self.slot(a);
                    let argc = c as usize;
                    let callee = self.stack[callee_slot].clone();

                    for i in 0..argc {
                        let arg = &self.stack[callee_slot + 1 + i];
                        if matches!(arg, Value::Void) {
                            return Err(self.error(
                                loc,
                                RuntimeErrorKind::IncompatibleTypes("void".to_string()),
                            ));
                        }
                    }

                    match callee {
                        Value::Closure(closure) => {
                            self.push_call(closure, callee_slot + 1, argc, ret_slot, loc)?;
                        }
                        Value::Builtin(Builtin::Trace) => {
                            let line = (0..argc)
                                .map(|i| self.stack[callee_slot + 1 + i].display_string())
                                .collect::<Vec<_>>()
                                .join(" ");
                            self.host.write_line(&line);
                            self.stack[ret_slot] = Value::Void;
                        }
                        other => {
                            return Err(
                                self.error(loc, RuntimeErrorKind::NotCallable(other.type_name()))
                            )
                        }
                    }
                }
                OpCode::Require => self.require(a, b, c, loc)?,

                OpCode::Return | OpCode::ReturnVoid => {
                    let value = if op == OpCode::Return {
                        self.reg(a)
                    } else {
                        Value::Null
                    };
                    if let Some(result) = self.pop_frame(value) {
                        return Ok(result);
                    }
                }

                OpCode::IterInit => {
                    let cont = self.reg(b);
                    let state = match &cont {
                        Value::Array(array) => IterState::Array {
                            array: array.clone(),
                            index: 0,
                        },
                        Value::Struct(map) => IterState::Struct {
                            map: map.clone(),
                            keys: map.borrow().keys().cloned().collect(),
                            index: 0,
                        },
                        other => return Err(self.type_error(loc, &[other])),
                    };
                    self.set_reg(a, Value::Iter(Rc::new(RefCell::new(state))));
                }
                OpCode::IterNext => {
                    let iter = self.reg(a);
                    let Value::Iter(state) = &iter else {
                        return Err(self.type_error(loc, &[&iter]));
                    };
                    let next = advance_iterator(&mut state.borrow_mut());
                    if let Some((key, value)) = next {
                        self.set_reg(b, key);
                        self.set_reg(c, value);
                        // skip the exit jump that follows
                        self.frames.last_mut().expect("active frame").ip += 1;
                    }
                }
            }
        }
    }

    // ----------------- call / return -----------------

    fn push_call(
        &mut self,
        closure: Rc<ClosureObj>,
        base: usize,
        argc: usize,
        ret_slot: usize,
        loc: SourceLocation,
    ) -> Result<(), RuntimeError> {
        let proto = closure.proto.clone();
        let needed = base + proto.num_registers.max(argc).max(1);
        if needed > MAX_STACK_SLOTS {
            return Err(self.error(loc, RuntimeErrorKind::StackOverflow));
        }
        if needed > self.stack.len() {
            self.stack.resize(needed, Value::Null);
        }
        // missing arguments become null; extras land past the declared
        // parameters and are never read
        for i in argc..proto.arity {
            self.stack[base + i] = Value::Null;
        }

        self.frames.push(Frame {
            upvalues: closure.upvalues.clone(),
            proto,
            ip: 0,
            base,
            ret_slot,
            is_script: false,
        });
        Ok(())
    }

    /// Pops the current frame, closing its upvalues and delivering the
    /// return value. Returns the final result when the last frame exits.
    fn pop_frame(&mut self, value: Value) -> Option<Value> {
        let frame = self.frames.pop().expect("active frame");
        self.close_upvalues(frame.base);
        if frame.is_script {
            self.script_dirs.pop();
            self.loading.pop();
        }

        match self.frames.last() {
            Some(caller) => {
                let top = caller.base + caller.proto.num_registers;
                self.stack.resize(top.max(frame.base), Value::Null);
                self.stack[frame.ret_slot] = value;
                None
            }
            None => {
                self.stack.clear();
                Some(value)
            }
        }
    }

    fn require(
        &mut self,
        a: i32,
        b: i32,
        c: i32,
        loc: SourceLocation,
    ) -> Result<(), RuntimeError> {
        let path_slot = self.slot(b);
        let ret_slot = self.slot(a);
        let argc = c as usize;

        let Value::Str(path_str) = self.stack[path_slot].clone() else {
            let got = self.stack[path_slot].type_name();
            return Err(self.error(
                loc,
                RuntimeErrorKind::Require(format!("file path must be a string, got {}", got)),
            ));
        };

        let mut args = Vec::with_capacity(argc);
        for i in 0..argc {
            let arg = self.stack[path_slot + 1 + i].clone();
            if matches!(arg, Value::Void) {
                return Err(
                    self.error(loc, RuntimeErrorKind::IncompatibleTypes("void".to_string()))
                );
            }
            args.push(arg);
        }

        let requested = Path::new(&*path_str);
        let resolved = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.script_dirs
                .last()
                .cloned()
                .unwrap_or_default()
                .join(requested)
        };

        if self.loading.iter().any(|p| p == &resolved) {
            return Err(self.error(
                loc,
                RuntimeErrorKind::CircularRequire(resolved.display().to_string()),
            ));
        }

        let source = self
            .host
            .load(&resolved)
            .map_err(|e| self.error(loc, RuntimeErrorKind::Require(e)))?;
        // every require reloads and recompiles; there is no module cache
        let program = compiler::compile(&resolved.to_string_lossy(), &source)
            .map_err(|e| self.error(loc, RuntimeErrorKind::Require(e.to_string())))?;

        let proto = program.proto.clone();
        let base = path_slot + 1;
        let needed = base + proto.num_registers.max(1);
        if needed > MAX_STACK_SLOTS {
            return Err(self.error(loc, RuntimeErrorKind::StackOverflow));
        }
        if needed > self.stack.len() {
            self.stack.resize(needed, Value::Null);
        }
        self.stack[base] = Value::new_array(args);

        self.script_dirs.push(
            resolved
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_default(),
        );
        self.loading.push(resolved);
        self.frames.push(Frame {
            proto,
            upvalues: Vec::new(),
            ip: 0,
            base,
            ret_slot,
            is_script: true,
        });
        Ok(())
    }

    // ----------------- containers -----------------

    fn index_get(&self, cont: &Value, key: &Value) -> Result<Value, RuntimeErrorKind> {
        match cont {
            Value::Array(array) => match key {
                Value::Int(i) if *i >= 0 => {
                    let array = array.borrow();
                    Ok(array.get(*i as usize).cloned().unwrap_or(Value::Void))
                }
                Value::Int(_) => Err(RuntimeErrorKind::BadArrayIndex),
                other => Err(RuntimeErrorKind::IncompatibleTypes(
                    other.type_name().to_string(),
                )),
            },
            Value::Struct(map) => {
                let key = FieldKey::from_value(key)
                    .ok_or(RuntimeErrorKind::BadFieldKey(key.type_name()))?;
                Ok(map.borrow().get(&key).cloned().unwrap_or(Value::Void))
            }
            other => Err(RuntimeErrorKind::NotIndexable(other.type_name())),
        }
    }

    fn index_set(
        &self,
        cont: &Value,
        key: &Value,
        value: Value,
    ) -> Result<(), RuntimeErrorKind> {
        if matches!(value, Value::Void) {
            return Err(RuntimeErrorKind::IncompatibleTypes("void".to_string()));
        }
        match cont {
            Value::Array(array) => {
                let Value::Int(i) = key else {
                    return Err(RuntimeErrorKind::IncompatibleTypes(
                        key.type_name().to_string(),
                    ));
                };
                if *i < 0 {
                    return Err(RuntimeErrorKind::BadArrayIndex);
                }
                let i = *i as usize;
                let mut array = array.borrow_mut();
                if i < array.len() {
                    array[i] = value;
                } else {
                    // writing past the end extends, null-filling any gap
                    while array.len() < i {
                        array.push(Value::Null);
                    }
                    array.push(value);
                }
                Ok(())
            }
            Value::Struct(map) => {
                let key = FieldKey::from_value(key)
                    .ok_or(RuntimeErrorKind::BadFieldKey(key.type_name()))?;
                map.borrow_mut().insert(key, value);
                Ok(())
            }
            other => Err(RuntimeErrorKind::NotIndexable(other.type_name())),
        }
    }

    fn delete_slot(&self, cont: &Value, key: &Value) -> Result<(), RuntimeErrorKind> {
        match cont {
            Value::Array(array) => {
                let Value::Int(i) = key else {
                    return Err(RuntimeErrorKind::IncompatibleTypes(
                        key.type_name().to_string(),
                    ));
                };
                if *i < 0 {
                    return Err(RuntimeErrorKind::BadArrayIndex);
                }
                let mut array = array.borrow_mut();
                if *i as usize > array.len() {
                    return Err(RuntimeErrorKind::IndexOutOfRange);
                }
                // deleting an element discards it and everything after it
                array.truncate(*i as usize);
                Ok(())
            }
            Value::Struct(map) => {
                let key = FieldKey::from_value(key)
                    .ok_or(RuntimeErrorKind::BadFieldKey(key.type_name()))?;
                map.borrow_mut().shift_remove(&key);
                Ok(())
            }
            other => Err(RuntimeErrorKind::NotIndexable(other.type_name())),
        }
    }

    // ----------------- upvalues -----------------

    fn find_or_open(&mut self, slot: usize) -> Rc<Upvalue> {
        for (s, cell) in &self.open_upvalues {
            if *s == slot {
                return cell.clone();
            }
        }
        let cell = Upvalue::open(slot);
        self.open_upvalues.push((slot, cell.clone()));
        cell
    }

    /// Closes every open upvalue at or above `min_slot`, transferring the
    /// captured value into its cell.
    fn close_upvalues(&mut self, min_slot: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            if self.open_upvalues[i].0 >= min_slot {
                let (slot, cell) = self.open_upvalues.swap_remove(i);
                cell.close(self.stack[slot].clone());
            } else {
                i += 1;
            }
        }
    }

    // ----------------- small helpers -----------------

    fn slot(&self, reg: i32) -> usize {
        self.frames.last().expect("active frame").base + reg as usize
    }

    fn reg(&self, reg: i32) -> Value {
        self.stack[self.slot(reg)].clone()
    }

    fn set_reg(&mut self, reg: i32, value: Value) {
        let slot = self.slot(reg);
        self.stack[slot] = value;
    }

    fn jump(&mut self, offset: i32) {
        let frame = self.frames.last_mut().expect("active frame");
        frame.ip = (frame.ip as i64 + offset as i64) as usize;
    }

    fn constant_key(&self, id: i32) -> Value {
        let frame = self.frames.last().expect("active frame");
        match &frame.proto.constants[id as usize] {
            Constant::Str(s) => Value::Str(s.clone()),
            Constant::Int(v) => Value::Int(*v),
            Constant::Float(v) => Value::Float(*v),
        }
    }

    fn error(&self, loc: SourceLocation, kind: RuntimeErrorKind) -> RuntimeError {
        let trace = self
            .frames
            .iter()
            .map(|f| TraceFrame {
                path: f.proto.path.clone(),
                location: f.proto.code[f.ip.saturating_sub(1)].loc,
            })
            .collect();
        let path = self
            .frames
            .last()
            .map(|f| f.proto.path.clone())
            .unwrap_or_else(|| Rc::from("<vm>"));
        RuntimeError {
            path,
            location: loc,
            kind,
            trace,
        }
    }

    fn type_error(&self, loc: SourceLocation, values: &[&Value]) -> RuntimeError {
        let names = values
            .iter()
            .map(|v| v.type_name())
            .collect::<Vec<_>>()
            .join(", ");
        self.error(loc, RuntimeErrorKind::IncompatibleTypes(names))
    }
}

// ----------------- operator semantics -----------------

enum NumPair {
    Ints(i64, i64),
    Floats(f64, f64),
}

fn numeric(l: &Value, r: &Value) -> Option<NumPair> {
    match (l, r) {
        (Value::Int(x), Value::Int(y)) => Some(NumPair::Ints(*x, *y)),
        (Value::Float(x), Value::Float(y)) => Some(NumPair::Floats(*x, *y)),
        (Value::Int(x), Value::Float(y)) => Some(NumPair::Floats(*x as f64, *y)),
        (Value::Float(x), Value::Int(y)) => Some(NumPair::Floats(*x, *y as f64)),
        _ => None,
    }
}

fn incompatible(l: &Value, r: &Value) -> RuntimeErrorKind {
    RuntimeErrorKind::IncompatibleTypes(format!("{}, {}", l.type_name(), r.type_name()))
}

/// Arithmetic and bitwise dispatch: int×int stays int (two's-complement
/// wrap), any float operand promotes to float, `+` concatenates strings,
/// int division by zero is an error while float division follows IEEE.
fn arith(op: OpCode, l: &Value, r: &Value) -> Result<Value, RuntimeErrorKind> {
    if op == OpCode::Add {
        if let (Value::Str(x), Value::Str(y)) = (l, r) {
            let mut s = String::with_capacity(x.len() + y.len());
            s.push_str(x);
            s.push_str(y);
            return Ok(Value::Str(Rc::from(s)));
        }
    }

    match op {
        OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod => {
            match numeric(l, r).ok_or_else(|| incompatible(l, r))? {
                NumPair::Ints(x, y) => {
                    let v = match op {
                        OpCode::Add => x.wrapping_add(y),
                        OpCode::Sub => x.wrapping_sub(y),
                        OpCode::Mul => x.wrapping_mul(y),
                        OpCode::Div | OpCode::Mod => {
                            if y == 0 {
                                return Err(RuntimeErrorKind::DivideByZero);
                            }
                            if op == OpCode::Div {
                                x.wrapping_div(y)
                            } else {
                                x.wrapping_rem(y)
                            }
                        }
                        _ => unreachable!(),
                    };
                    Ok(Value::Int(v))
                }
                NumPair::Floats(x, y) => {
                    let v = match op {
                        OpCode::Add => x + y,
                        OpCode::Sub => x - y,
                        OpCode::Mul => x * y,
                        OpCode::Div => x / y,
                        OpCode::Mod => x % y,
                        _ => unreachable!(),
                    };
                    Ok(Value::Float(v))
                }
            }
        }
        OpCode::Shl | OpCode::Shr | OpCode::BitAnd | OpCode::BitOr | OpCode::BitXor => {
            let (Value::Int(x), Value::Int(y)) = (l, r) else {
                return Err(incompatible(l, r));
            };
            let v = match op {
                OpCode::Shl => x.wrapping_shl((*y as u64 & 63) as u32),
                OpCode::Shr => x.wrapping_shr((*y as u64 & 63) as u32),
                OpCode::BitAnd => x & y,
                OpCode::BitOr => x | y,
                OpCode::BitXor => x ^ y,
                _ => unreachable!(),
            };
            Ok(Value::Int(v))
        }
        _ => unreachable!("not an arithmetic opcode"),
    }
}

fn compare(op: OpCode, l: &Value, r: &Value) -> Result<Value, RuntimeErrorKind> {
    if let (Value::Str(x), Value::Str(y)) = (l, r) {
        let v = match op {
            OpCode::Lt => x < y,
            OpCode::Le => x <= y,
            OpCode::Gt => x > y,
            OpCode::Ge => x >= y,
            _ => unreachable!(),
        };
        return Ok(Value::Bool(v));
    }

    let v = match numeric(l, r).ok_or_else(|| incompatible(l, r))? {
        NumPair::Ints(x, y) => match op {
            OpCode::Lt => x < y,
            OpCode::Le => x <= y,
            OpCode::Gt => x > y,
            OpCode::Ge => x >= y,
            _ => unreachable!(),
        },
        NumPair::Floats(x, y) => match op {
            OpCode::Lt => x < y,
            OpCode::Le => x <= y,
            OpCode::Gt => x > y,
            OpCode::Ge => x >= y,
            _ => unreachable!(),
        },
    };
    Ok(Value::Bool(v))
}

fn advance_iterator(state: &mut IterState) -> Option<(Value, Value)> {
    match state {
        IterState::Array { array, index } => {
            // the live length is consulted each step, so elements appended
            // during iteration are visited
            let array = array.borrow();
            if *index < array.len() {
                let kv = (Value::Int(*index as i64), array[*index].clone());
                *index += 1;
                Some(kv)
            } else {
                None
            }
        }
        IterState::Struct { map, keys, index } => {
            let map = map.borrow();
            loop {
                if *index >= keys.len() {
                    return None;
                }
                let key = keys[*index].clone();
                *index += 1;
                if let Some(value) = map.get(&key) {
                    return Some((key.to_value(), value.clone()));
                }
                // key removed since the snapshot was taken
            }
        }
    }
}
