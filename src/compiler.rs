use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{
    ArrayItem, AutoVar, BinOp, CastOp, Expr, ExprKind, FunctionLiteral, Stmt, StmtKind,
    SwitchClause, UnOp,
};
use crate::bytecode::{Constant, Instruction, OpCode, Program, Proto, UpvalueDesc, BUILTIN_TRACE};
use crate::error::{CompileError, CompileErrorKind};
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::token::SourceLocation;

/// Register window size per function. Expressions allocate temporaries past
/// the named locals in LIFO order; the high-water mark becomes the
/// prototype's register count.
const REGISTER_POOL_SIZE: usize = 256;

/// Lex, parse, and lower one script into a program.
pub fn compile(path: &str, source: &str) -> Result<Program, CompileError> {
    let path: Rc<str> = Rc::from(path);
    let tokens = Lexer::new(path.clone(), source).tokenize()?;
    let script = Parser::new(path.clone(), tokens).parse_script()?;
    Compiler::new(path).compile_script(&script)
}

/// An expression result: the register holding the value, and whether that
/// register is a temporary this expression owns (freed LIFO) or an existing
/// local.
#[derive(Debug, Clone, Copy)]
struct R {
    reg: usize,
    temp: bool,
}

#[derive(Debug)]
enum LValue {
    Local(usize),
    Up(usize),
    Slot { cont: R, key: R },
    Field { cont: R, kid: usize },
}

#[derive(Debug)]
enum Resolved {
    Local(usize),
    Upvalue(usize),
    Builtin(i32),
}

#[derive(Debug, PartialEq, Eq, Hash)]
enum ConstKey {
    Int(i64),
    Float(u64),
    Str(String),
}

struct Scope {
    start_reg: usize,
    names: Vec<(String, usize)>,
    has_captures: bool,
}

struct LoopCtx {
    breaks: Vec<usize>,
    continues: Vec<usize>,
    allow_continue: bool,
}

struct FuncState {
    arity: usize,
    code: Vec<Instruction>,
    constants: Vec<Constant>,
    constant_ids: HashMap<ConstKey, usize>,
    protos: Vec<Rc<Proto>>,
    scopes: Vec<Scope>,
    next_reg: usize,
    high_water: usize,
    upvalues: Vec<(String, UpvalueDesc)>,
    loops: Vec<LoopCtx>,
}

impl FuncState {
    fn new(arity: usize) -> Self {
        Self {
            arity,
            code: Vec::new(),
            constants: Vec::new(),
            constant_ids: HashMap::new(),
            protos: Vec::new(),
            scopes: Vec::new(),
            next_reg: 0,
            high_water: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
        }
    }
}

pub struct Compiler {
    path: Rc<str>,
    funcs: Vec<FuncState>,
}

impl Compiler {
    pub fn new(path: Rc<str>) -> Self {
        Self {
            path,
            funcs: Vec::new(),
        }
    }

    pub fn compile_script(mut self, script: &FunctionLiteral) -> Result<Program, CompileError> {
        let proto = self.compile_function(script)?;
        Ok(Program { proto })
    }

    fn compile_function(&mut self, fl: &FunctionLiteral) -> Result<Rc<Proto>, CompileError> {
        self.funcs.push(FuncState::new(fl.params.len()));
        self.enter_scope();

        for param in &fl.params {
            self.declare_local(&param.name, param.loc)?;
        }
        for stmt in &fl.body {
            self.stmt(stmt)?;
        }

        self.exit_scope(fl.loc);
        self.emit(OpCode::ReturnVoid, 0, 0, 0, fl.loc);

        let f = self.funcs.pop().expect("function state");
        Ok(Rc::new(Proto {
            arity: f.arity,
            num_registers: f.high_water.max(1),
            constants: f.constants,
            code: f.code,
            upvalues: f.upvalues.into_iter().map(|(_, desc)| desc).collect(),
            protos: f.protos,
            path: self.path.clone(),
        }))
    }

    // ----------------- statements -----------------

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        let loc = stmt.loc;
        match &stmt.kind {
            StmtKind::Empty => {}
            StmtKind::Block(stmts) => {
                self.enter_scope();
                for s in stmts {
                    self.stmt(s)?;
                }
                self.exit_scope(loc);
            }
            StmtKind::Auto(vars) => self.auto_vars(vars)?,
            StmtKind::Expr(expr) => {
                let r = self.expr(expr)?;
                self.free(r);
            }
            StmtKind::Return(value) => match value {
                Some(expr) => {
                    let r = self.expr(expr)?;
                    self.emit(OpCode::Return, r.reg as i32, 0, 0, loc);
                    self.free(r);
                }
                None => {
                    self.emit(OpCode::ReturnVoid, 0, 0, 0, loc);
                }
            },
            StmtKind::Delete { target, key } => {
                let rc = self.expr(target)?;
                let rk = self.expr(key)?;
                self.emit(OpCode::DelSlot, rc.reg as i32, rk.reg as i32, 0, loc);
                self.free(rk);
                self.free(rc);
            }
            StmtKind::If {
                init,
                cond,
                then,
                els,
            } => {
                let scoped = init.is_some();
                if let Some(vars) = init {
                    self.enter_scope();
                    self.auto_vars(vars)?;
                }

                let c = self.expr(cond)?;
                self.free(c);
                let jf = self.emit_jump(OpCode::JmpIfFalse, c.reg as i32, loc);

                self.stmt(then)?;

                if let Some(els) = els {
                    let j = self.emit_jump(OpCode::Jmp, 0, loc);
                    self.patch_jump(jf);
                    self.stmt(els)?;
                    self.patch_jump(j);
                } else {
                    self.patch_jump(jf);
                }

                if scoped {
                    self.exit_scope(loc);
                }
            }
            StmtKind::Switch {
                init,
                expr,
                clauses,
            } => self.switch_stmt(init, expr, clauses, loc)?,
            StmtKind::While { init, cond, body } => {
                let scoped = init.is_some();
                if let Some(vars) = init {
                    self.enter_scope();
                    self.auto_vars(vars)?;
                }

                self.push_loop(true);
                let start = self.here();
                let c = self.expr(cond)?;
                self.free(c);
                let jf = self.emit_jump(OpCode::JmpIfFalse, c.reg as i32, loc);
                self.loop_mut().breaks.push(jf);

                self.stmt(body)?;
                self.emit_loop(start, loc);
                self.pop_loop_patch(Some(start));

                if scoped {
                    self.exit_scope(loc);
                }
            }
            StmtKind::DoWhile { body, init, cond } => {
                let scoped = init.is_some();
                if let Some(vars) = init {
                    self.enter_scope();
                    self.auto_vars(vars)?;
                }

                self.push_loop(true);
                let start = self.here();
                self.stmt(body)?;

                let cond_at = self.here();
                let c = self.expr(cond)?;
                self.free(c);
                let jf = self.emit_jump(OpCode::JmpIfFalse, c.reg as i32, loc);
                self.loop_mut().breaks.push(jf);
                self.emit_loop(start, loc);
                self.pop_loop_patch(Some(cond_at));

                if scoped {
                    self.exit_scope(loc);
                }
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                self.enter_scope();
                if let Some(init) = init {
                    self.stmt(init)?;
                }

                self.push_loop(true);
                let start = self.here();
                if let Some(cond) = cond {
                    let c = self.expr(cond)?;
                    self.free(c);
                    let jf = self.emit_jump(OpCode::JmpIfFalse, c.reg as i32, loc);
                    self.loop_mut().breaks.push(jf);
                }

                self.stmt(body)?;

                let step_at = self.here();
                if let Some(step) = step {
                    let r = self.expr(step)?;
                    self.free(r);
                }
                self.emit_loop(start, loc);
                self.pop_loop_patch(Some(step_at));
                self.exit_scope(loc);
            }
            StmtKind::Foreach {
                key,
                value,
                container,
                body,
            } => {
                self.enter_scope();
                let k_reg = self.declare_local(&key.name, key.loc)?;
                let v_reg = match value {
                    Some(param) => self.declare_local(&param.name, param.loc)?,
                    None => self.alloc(loc)?,
                };

                let rc = self.expr(container)?;
                self.free(rc);
                let iter = self.alloc(loc)?;
                self.emit(OpCode::IterInit, iter as i32, rc.reg as i32, 0, loc);

                self.push_loop(true);
                let start = self.here();
                self.emit(
                    OpCode::IterNext,
                    iter as i32,
                    k_reg as i32,
                    v_reg as i32,
                    loc,
                );
                let exit = self.emit_jump(OpCode::Jmp, 0, loc);
                self.loop_mut().breaks.push(exit);

                self.stmt(body)?;
                self.emit_loop(start, loc);
                self.pop_loop_patch(Some(start));
                self.exit_scope(loc);
            }
            StmtKind::Break => {
                if self.f().loops.is_empty() {
                    return Err(self.error(loc, CompileErrorKind::BreakOutsideLoop));
                }
                let at = self.emit_jump(OpCode::Jmp, 0, loc);
                self.loop_mut().breaks.push(at);
            }
            StmtKind::Continue => {
                if !self.f().loops.iter().any(|c| c.allow_continue) {
                    return Err(self.error(loc, CompileErrorKind::ContinueOutsideLoop));
                }
                let at = self.emit_jump(OpCode::Jmp, 0, loc);
                let ctx = self
                    .f()
                    .loops
                    .iter_mut()
                    .rev()
                    .find(|c| c.allow_continue)
                    .expect("loop context");
                ctx.continues.push(at);
            }
        }
        Ok(())
    }

    fn auto_vars(&mut self, vars: &[AutoVar]) -> Result<(), CompileError> {
        for var in vars {
            match &var.init {
                None => {
                    // an uninitialized variable holds the void sentinel
                    // until its first assignment
                    let reg = self.declare_local(&var.name, var.loc)?;
                    self.emit(OpCode::LoadVoid, reg as i32, 0, 0, var.loc);
                }
                Some(init) => {
                    let r = self.expr(init)?;
                    if r.temp {
                        // the new local takes over the result register
                        self.free(r);
                        let reg = self.declare_local(&var.name, var.loc)?;
                        if reg != r.reg {
                            self.emit(OpCode::Move, reg as i32, r.reg as i32, 0, var.loc);
                        }
                    } else {
                        let reg = self.declare_local(&var.name, var.loc)?;
                        self.emit(OpCode::Move, reg as i32, r.reg as i32, 0, var.loc);
                    }
                }
            }
        }
        Ok(())
    }

    fn switch_stmt(
        &mut self,
        init: &Option<Vec<AutoVar>>,
        expr: &Expr,
        clauses: &[SwitchClause],
        loc: SourceLocation,
    ) -> Result<(), CompileError> {
        let scoped = init.is_some();
        if let Some(vars) = init {
            self.enter_scope();
            self.auto_vars(vars)?;
        }

        let subject = self.expr(expr)?;
        self.push_loop(false);

        // Case bodies run in source order; a body that does not `break`
        // falls through into the next body, skipping its label test.
        let mut fallthrough: Option<usize> = None;
        for clause in clauses {
            match &clause.label {
                Some(label) => {
                    let l = self.expr(label)?;
                    self.free(l);
                    let t = self.alloc(clause.loc)?;
                    self.emit(
                        OpCode::Eq,
                        t as i32,
                        subject.reg as i32,
                        l.reg as i32,
                        clause.loc,
                    );
                    self.free(R { reg: t, temp: true });
                    let jf = self.emit_jump(OpCode::JmpIfFalse, t as i32, clause.loc);

                    if let Some(at) = fallthrough.take() {
                        self.patch_jump(at);
                    }
                    for s in &clause.stmts {
                        self.stmt(s)?;
                    }
                    fallthrough = Some(self.emit_jump(OpCode::Jmp, 0, clause.loc));
                    self.patch_jump(jf);
                }
                None => {
                    if let Some(at) = fallthrough.take() {
                        self.patch_jump(at);
                    }
                    for s in &clause.stmts {
                        self.stmt(s)?;
                    }
                }
            }
        }
        if let Some(at) = fallthrough.take() {
            self.patch_jump(at);
        }

        self.pop_loop_patch(None);
        self.free(subject);
        if scoped {
            self.exit_scope(loc);
        }
        Ok(())
    }

    // ----------------- expressions -----------------

    fn expr(&mut self, expr: &Expr) -> Result<R, CompileError> {
        let loc = expr.loc;
        match &expr.kind {
            ExprKind::Null => {
                let d = self.alloc(loc)?;
                self.emit(OpCode::LoadNull, d as i32, 0, 0, loc);
                Ok(R { reg: d, temp: true })
            }
            ExprKind::Bool(v) => {
                let d = self.alloc(loc)?;
                self.emit(OpCode::LoadBool, d as i32, *v as i32, 0, loc);
                Ok(R { reg: d, temp: true })
            }
            ExprKind::Int(v) => {
                let d = self.alloc(loc)?;
                self.emit_load_int(d, *v, loc);
                Ok(R { reg: d, temp: true })
            }
            ExprKind::Float(v) => {
                let d = self.alloc(loc)?;
                let id = self.const_id(Constant::Float(*v));
                self.emit(OpCode::LoadConst, d as i32, id as i32, 0, loc);
                Ok(R { reg: d, temp: true })
            }
            ExprKind::Str(s) => {
                let d = self.alloc(loc)?;
                let id = self.const_id(Constant::Str(Rc::from(s.as_str())));
                self.emit(OpCode::LoadConst, d as i32, id as i32, 0, loc);
                Ok(R { reg: d, temp: true })
            }
            ExprKind::Ident(name) => match self.resolve(name, loc)? {
                Resolved::Local(reg) => Ok(R { reg, temp: false }),
                Resolved::Upvalue(idx) => {
                    let d = self.alloc(loc)?;
                    self.emit(OpCode::UpGet, d as i32, idx as i32, 0, loc);
                    Ok(R { reg: d, temp: true })
                }
                Resolved::Builtin(id) => {
                    let d = self.alloc(loc)?;
                    self.emit(OpCode::LoadBuiltin, d as i32, id, 0, loc);
                    Ok(R { reg: d, temp: true })
                }
            },
            ExprKind::Array(items) => self.array_literal(items, loc),
            ExprKind::StructLit(fields) => self.struct_literal(fields, loc),
            ExprKind::Closure(fl) => {
                let proto = self.compile_function(fl)?;
                let f = self.f();
                let idx = f.protos.len();
                f.protos.push(proto);
                let d = self.alloc(loc)?;
                self.emit(OpCode::CloseFn, d as i32, idx as i32, 0, loc);
                Ok(R { reg: d, temp: true })
            }
            ExprKind::Require(args) => {
                let mut regs = Vec::with_capacity(args.len());
                for arg in args {
                    let r = self.expr(arg)?;
                    let r = self.ensure_temp(r, arg.loc)?;
                    regs.push(r);
                }
                let base = regs[0].reg;
                for r in regs.iter().rev() {
                    self.free(*r);
                }
                let d = self.alloc(loc)?;
                self.emit(
                    OpCode::Require,
                    d as i32,
                    base as i32,
                    (args.len() - 1) as i32,
                    loc,
                );
                Ok(R { reg: d, temp: true })
            }
            ExprKind::Unary { op, operand } => {
                let opcode = match op {
                    UnOp::Plus => return self.expr(operand),
                    UnOp::Neg => OpCode::Neg,
                    UnOp::Not => OpCode::Not,
                    UnOp::BitNot => OpCode::BitNot,
                };
                let r = self.expr(operand)?;
                self.free(r);
                let d = self.alloc(loc)?;
                self.emit(opcode, d as i32, r.reg as i32, 0, loc);
                Ok(R { reg: d, temp: true })
            }
            ExprKind::Cast { op, operand } => {
                let opcode = match op {
                    CastOp::Bool => OpCode::CastBool,
                    CastOp::Int => OpCode::CastInt,
                    CastOp::Float => OpCode::CastFloat,
                    CastOp::Str => OpCode::CastStr,
                    CastOp::Sizeof => OpCode::Len,
                    CastOp::Typeof => OpCode::TypeOf,
                };
                let r = self.expr(operand)?;
                self.free(r);
                let d = self.alloc(loc)?;
                self.emit(opcode, d as i32, r.reg as i32, 0, loc);
                Ok(R { reg: d, temp: true })
            }
            ExprKind::Binary { op, lhs, rhs } => match op {
                BinOp::And | BinOp::Or => self.short_circuit(*op, lhs, rhs, loc),
                _ => {
                    let opcode = Self::binary_opcode(*op);
                    let l = self.expr(lhs)?;
                    let r = self.expr(rhs)?;
                    self.free(r);
                    self.free(l);
                    let d = self.alloc(loc)?;
                    self.emit(opcode, d as i32, l.reg as i32, r.reg as i32, loc);
                    Ok(R { reg: d, temp: true })
                }
            },
            ExprKind::Ternary { cond, then, els } => {
                let c = self.expr(cond)?;
                self.free(c);
                let jf = self.emit_jump(OpCode::JmpIfFalse, c.reg as i32, loc);

                let t1 = self.expr(then)?;
                let t1 = self.ensure_temp(t1, loc)?;
                let j = self.emit_jump(OpCode::Jmp, 0, loc);

                self.patch_jump(jf);
                self.free(t1);
                let t2 = self.expr(els)?;
                let t2 = self.ensure_temp(t2, loc)?;
                debug_assert_eq!(t1.reg, t2.reg);
                self.patch_jump(j);
                Ok(t2)
            }
            ExprKind::Comma { lhs, rhs } => {
                let l = self.expr(lhs)?;
                self.free(l);
                self.expr(rhs)
            }
            ExprKind::Index { target, key } => {
                if let ExprKind::Str(name) = &key.kind {
                    let kid = self.const_id(Constant::Str(Rc::from(name.as_str())));
                    let rc = self.expr(target)?;
                    self.free(rc);
                    let d = self.alloc(loc)?;
                    self.emit(OpCode::FieldGet, d as i32, rc.reg as i32, kid as i32, loc);
                    Ok(R { reg: d, temp: true })
                } else {
                    let rc = self.expr(target)?;
                    let rk = self.expr(key)?;
                    self.free(rk);
                    self.free(rc);
                    let d = self.alloc(loc)?;
                    self.emit(OpCode::IdxGet, d as i32, rc.reg as i32, rk.reg as i32, loc);
                    Ok(R { reg: d, temp: true })
                }
            }
            ExprKind::Call { callee, args } => {
                let cr = self.expr(callee)?;
                let cr = self.ensure_temp(cr, loc)?;

                let mut arg_regs = Vec::with_capacity(args.len());
                for arg in args {
                    let r = self.expr(arg)?;
                    let r = self.ensure_temp(r, arg.loc)?;
                    arg_regs.push(r);
                }
                for r in arg_regs.iter().rev() {
                    self.free(*r);
                }
                self.free(cr);

                let d = self.alloc(loc)?;
                debug_assert_eq!(d, cr.reg);
                self.emit(
                    OpCode::Call,
                    d as i32,
                    cr.reg as i32,
                    args.len() as i32,
                    loc,
                );
                Ok(R { reg: d, temp: true })
            }
            ExprKind::Assign { op, target, value } => self.assign(op, target, value, loc),
            ExprKind::IncDec {
                increment,
                postfix,
                target,
            } => self.inc_dec(*increment, *postfix, target, loc),
        }
    }

    fn binary_opcode(op: BinOp) -> OpCode {
        match op {
            BinOp::Add => OpCode::Add,
            BinOp::Sub => OpCode::Sub,
            BinOp::Mul => OpCode::Mul,
            BinOp::Div => OpCode::Div,
            BinOp::Mod => OpCode::Mod,
            BinOp::Shl => OpCode::Shl,
            BinOp::Shr => OpCode::Shr,
            BinOp::BitAnd => OpCode::BitAnd,
            BinOp::BitOr => OpCode::BitOr,
            BinOp::BitXor => OpCode::BitXor,
            BinOp::Eq => OpCode::Eq,
            BinOp::Ne => OpCode::Ne,
            BinOp::Lt => OpCode::Lt,
            BinOp::Le => OpCode::Le,
            BinOp::Gt => OpCode::Gt,
            BinOp::Ge => OpCode::Ge,
            BinOp::And | BinOp::Or => unreachable!("short-circuit ops lower to jumps"),
        }
    }

    /// `&&` / `||`: evaluate the left side, coerce it to bool, and skip the
    /// right side when it already decides the answer. Both arms write the
    /// same destination register.
    fn short_circuit(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        loc: SourceLocation,
    ) -> Result<R, CompileError> {
        let l = self.expr(lhs)?;
        let l = self.ensure_temp(l, loc)?;
        self.emit(OpCode::ToBool, l.reg as i32, l.reg as i32, 0, loc);

        let jump_op = if op == BinOp::And {
            OpCode::JmpIfFalse
        } else {
            OpCode::JmpIfTrue
        };
        let j = self.emit_jump(jump_op, l.reg as i32, loc);

        self.free(l);
        let r = self.expr(rhs)?;
        let r = self.ensure_temp(r, loc)?;
        debug_assert_eq!(l.reg, r.reg);
        self.emit(OpCode::ToBool, r.reg as i32, r.reg as i32, 0, loc);

        self.patch_jump(j);
        Ok(r)
    }

    fn array_literal(
        &mut self,
        items: &[ArrayItem],
        loc: SourceLocation,
    ) -> Result<R, CompileError> {
        let d = self.alloc(loc)?;
        self.emit(OpCode::NewArray, d as i32, 0, 0, loc);

        let mut implicit: i64 = 0;
        for item in items {
            match &item.index {
                None => {
                    let k = self.alloc(item.value.loc)?;
                    self.emit_load_int(k, implicit, item.value.loc);
                    implicit += 1;

                    let v = self.expr(&item.value)?;
                    self.emit(
                        OpCode::IdxSet,
                        d as i32,
                        k as i32,
                        v.reg as i32,
                        item.value.loc,
                    );
                    self.free(v);
                    self.free(R { reg: k, temp: true });
                }
                Some(index) => {
                    let k = self.expr(index)?;
                    let v = self.expr(&item.value)?;
                    self.emit(OpCode::IdxSet, d as i32, k.reg as i32, v.reg as i32, index.loc);
                    self.free(v);
                    self.free(k);

                    // a constant explicit index advances the implicit cursor
                    if let ExprKind::Int(n) = index.kind {
                        implicit = implicit.max(n.saturating_add(1));
                    }
                }
            }
        }

        Ok(R { reg: d, temp: true })
    }

    fn struct_literal(
        &mut self,
        fields: &[(Expr, Expr)],
        loc: SourceLocation,
    ) -> Result<R, CompileError> {
        let d = self.alloc(loc)?;
        self.emit(OpCode::NewStruct, d as i32, 0, 0, loc);

        for (key, value) in fields {
            if let ExprKind::Str(name) = &key.kind {
                let kid = self.const_id(Constant::Str(Rc::from(name.as_str())));
                let v = self.expr(value)?;
                self.emit(OpCode::FieldSet, d as i32, kid as i32, v.reg as i32, key.loc);
                self.free(v);
            } else {
                let k = self.expr(key)?;
                let v = self.expr(value)?;
                self.emit(OpCode::IdxSet, d as i32, k.reg as i32, v.reg as i32, key.loc);
                self.free(v);
                self.free(k);
            }
        }

        Ok(R { reg: d, temp: true })
    }

    // ----------------- assignment -----------------

    fn lvalue(&mut self, target: &Expr) -> Result<LValue, CompileError> {
        match &target.kind {
            ExprKind::Ident(name) => match self.resolve(name, target.loc)? {
                Resolved::Local(reg) => Ok(LValue::Local(reg)),
                Resolved::Upvalue(idx) => Ok(LValue::Up(idx)),
                Resolved::Builtin(_) => {
                    Err(self.error(target.loc, CompileErrorKind::NotAssignable))
                }
            },
            ExprKind::Index { target: t, key } => {
                if let ExprKind::Str(name) = &key.kind {
                    let kid = self.const_id(Constant::Str(Rc::from(name.as_str())));
                    let cont = self.expr(t)?;
                    Ok(LValue::Field { cont, kid })
                } else {
                    let cont = self.expr(t)?;
                    let key = self.expr(key)?;
                    Ok(LValue::Slot { cont, key })
                }
            }
            _ => Err(self.error(target.loc, CompileErrorKind::NotAssignable)),
        }
    }

    fn lvalue_read(&mut self, lv: &LValue, loc: SourceLocation) -> Result<R, CompileError> {
        match lv {
            LValue::Local(reg) => Ok(R {
                reg: *reg,
                temp: false,
            }),
            LValue::Up(idx) => {
                let d = self.alloc(loc)?;
                self.emit(OpCode::UpGet, d as i32, *idx as i32, 0, loc);
                Ok(R { reg: d, temp: true })
            }
            LValue::Slot { cont, key } => {
                let d = self.alloc(loc)?;
                self.emit(
                    OpCode::IdxGet,
                    d as i32,
                    cont.reg as i32,
                    key.reg as i32,
                    loc,
                );
                Ok(R { reg: d, temp: true })
            }
            LValue::Field { cont, kid } => {
                let d = self.alloc(loc)?;
                self.emit(
                    OpCode::FieldGet,
                    d as i32,
                    cont.reg as i32,
                    *kid as i32,
                    loc,
                );
                Ok(R { reg: d, temp: true })
            }
        }
    }

    fn lvalue_write(&mut self, lv: &LValue, value: usize, loc: SourceLocation) {
        match lv {
            LValue::Local(reg) => {
                if *reg != value {
                    self.emit(OpCode::Move, *reg as i32, value as i32, 0, loc);
                }
            }
            LValue::Up(idx) => {
                self.emit(OpCode::UpSet, *idx as i32, value as i32, 0, loc);
            }
            LValue::Slot { cont, key } => {
                self.emit(
                    OpCode::IdxSet,
                    cont.reg as i32,
                    key.reg as i32,
                    value as i32,
                    loc,
                );
            }
            LValue::Field { cont, kid } => {
                self.emit(
                    OpCode::FieldSet,
                    cont.reg as i32,
                    *kid as i32,
                    value as i32,
                    loc,
                );
            }
        }
    }

    /// Frees a Slot/Field lvalue's temporaries and re-materializes the
    /// result register on top of them so the surrounding expression sees a
    /// normally-stacked temporary.
    fn settle_slot(
        &mut self,
        lv: LValue,
        result: R,
        loc: SourceLocation,
    ) -> Result<R, CompileError> {
        let (cont, key) = match lv {
            LValue::Slot { cont, key } => (cont, Some(key)),
            LValue::Field { cont, .. } => (cont, None),
            _ => unreachable!("settle_slot on a register lvalue"),
        };

        if !result.temp {
            if let Some(k) = key {
                self.free(k);
            }
            self.free(cont);
            return Ok(result);
        }

        self.free(result);
        if let Some(k) = key {
            self.free(k);
        }
        self.free(cont);
        let d = self.alloc(loc)?;
        if d != result.reg {
            self.emit(OpCode::Move, d as i32, result.reg as i32, 0, loc);
        }
        Ok(R { reg: d, temp: true })
    }

    fn assign(
        &mut self,
        op: &Option<BinOp>,
        target: &Expr,
        value: &Expr,
        loc: SourceLocation,
    ) -> Result<R, CompileError> {
        let lv = self.lvalue(target)?;

        match op {
            None => {
                let v = self.expr(value)?;
                match lv {
                    LValue::Local(reg) => {
                        if reg != v.reg {
                            self.emit(OpCode::Move, reg as i32, v.reg as i32, 0, loc);
                        }
                        self.free(v);
                        Ok(R { reg, temp: false })
                    }
                    LValue::Up(idx) => {
                        self.emit(OpCode::UpSet, idx as i32, v.reg as i32, 0, loc);
                        Ok(v)
                    }
                    lv => {
                        self.lvalue_write(&lv, v.reg, loc);
                        self.settle_slot(lv, v, loc)
                    }
                }
            }
            Some(op) => {
                let opcode = Self::binary_opcode(*op);
                let cur = self.lvalue_read(&lv, loc)?;
                let v = self.expr(value)?;
                self.free(v);
                self.emit(
                    opcode,
                    cur.reg as i32,
                    cur.reg as i32,
                    v.reg as i32,
                    loc,
                );
                match lv {
                    LValue::Local(reg) => Ok(R { reg, temp: false }),
                    LValue::Up(idx) => {
                        self.emit(OpCode::UpSet, idx as i32, cur.reg as i32, 0, loc);
                        Ok(cur)
                    }
                    lv => {
                        self.lvalue_write(&lv, cur.reg, loc);
                        self.settle_slot(lv, cur, loc)
                    }
                }
            }
        }
    }

    fn inc_dec(
        &mut self,
        increment: bool,
        postfix: bool,
        target: &Expr,
        loc: SourceLocation,
    ) -> Result<R, CompileError> {
        let opcode = if increment { OpCode::Add } else { OpCode::Sub };
        let lv = self.lvalue(target)?;
        let cur = self.lvalue_read(&lv, loc)?;

        if postfix {
            // keep the old value as the result
            let cur = self.ensure_temp(cur, loc)?;
            let new = self.alloc(loc)?;
            self.emit(OpCode::LoadInt, new as i32, 1, 0, loc);
            self.emit(opcode, new as i32, cur.reg as i32, new as i32, loc);
            self.lvalue_write(&lv, new, loc);
            self.free(R {
                reg: new,
                temp: true,
            });
            match lv {
                LValue::Local(_) | LValue::Up(_) => Ok(cur),
                lv => self.settle_slot(lv, cur, loc),
            }
        } else {
            let one = self.alloc(loc)?;
            self.emit(OpCode::LoadInt, one as i32, 1, 0, loc);
            self.emit(opcode, cur.reg as i32, cur.reg as i32, one as i32, loc);
            self.free(R {
                reg: one,
                temp: true,
            });
            self.lvalue_write(&lv, cur.reg, loc);
            match lv {
                LValue::Local(reg) => Ok(R { reg, temp: false }),
                LValue::Up(_) => Ok(cur),
                lv => self.settle_slot(lv, cur, loc),
            }
        }
    }

    // ----------------- scopes, registers, names -----------------

    fn f(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("function state")
    }

    fn enter_scope(&mut self) {
        let start = self.f().next_reg;
        self.f().scopes.push(Scope {
            start_reg: start,
            names: Vec::new(),
            has_captures: false,
        });
    }

    fn exit_scope(&mut self, loc: SourceLocation) {
        let scope = self.f().scopes.pop().expect("scope");
        if scope.has_captures {
            self.emit(OpCode::CloseUp, scope.start_reg as i32, 0, 0, loc);
        }
        self.f().next_reg = scope.start_reg;
    }

    fn alloc(&mut self, loc: SourceLocation) -> Result<usize, CompileError> {
        let f = self.f();
        let reg = f.next_reg;
        if reg >= REGISTER_POOL_SIZE {
            return Err(self.error(loc, CompileErrorKind::RegisterOverflow));
        }
        let f = self.f();
        f.next_reg += 1;
        if f.next_reg > f.high_water {
            f.high_water = f.next_reg;
        }
        Ok(reg)
    }

    fn free(&mut self, r: R) {
        if r.temp {
            let f = self.f();
            debug_assert_eq!(r.reg + 1, f.next_reg);
            f.next_reg = r.reg;
        }
    }

    fn ensure_temp(&mut self, r: R, loc: SourceLocation) -> Result<R, CompileError> {
        if r.temp {
            return Ok(r);
        }
        let d = self.alloc(loc)?;
        self.emit(OpCode::Move, d as i32, r.reg as i32, 0, loc);
        Ok(R { reg: d, temp: true })
    }

    fn declare_local(&mut self, name: &str, loc: SourceLocation) -> Result<usize, CompileError> {
        let exists = self
            .f()
            .scopes
            .last()
            .expect("scope")
            .names
            .iter()
            .any(|(n, _)| n == name);
        if exists {
            return Err(self.error(loc, CompileErrorKind::Redeclaration(name.to_string())));
        }
        let reg = self.alloc(loc)?;
        self.f()
            .scopes
            .last_mut()
            .expect("scope")
            .names
            .push((name.to_string(), reg));
        Ok(reg)
    }

    fn resolve(&mut self, name: &str, loc: SourceLocation) -> Result<Resolved, CompileError> {
        let fi = self.funcs.len() - 1;
        if let Some(reg) = self.find_local(fi, name) {
            return Ok(Resolved::Local(reg));
        }
        if let Some(idx) = self.find_upvalue(fi, name) {
            return Ok(Resolved::Upvalue(idx));
        }
        if let Some(idx) = self.capture(fi, name) {
            return Ok(Resolved::Upvalue(idx));
        }
        if name == "trace" {
            return Ok(Resolved::Builtin(BUILTIN_TRACE));
        }
        Err(self.error(loc, CompileErrorKind::UndefinedName(name.to_string())))
    }

    fn find_local(&self, fi: usize, name: &str) -> Option<usize> {
        for scope in self.funcs[fi].scopes.iter().rev() {
            for (n, reg) in scope.names.iter().rev() {
                if n == name {
                    return Some(*reg);
                }
            }
        }
        None
    }

    fn find_upvalue(&self, fi: usize, name: &str) -> Option<usize> {
        self.funcs[fi].upvalues.iter().position(|(n, _)| n == name)
    }

    /// Resolves `name` against enclosing functions, threading an upvalue
    /// descriptor through every intermediate prototype so nested closures
    /// can chain the capture.
    fn capture(&mut self, fi: usize, name: &str) -> Option<usize> {
        if fi == 0 {
            return None;
        }
        let parent = fi - 1;

        if let Some(reg) = self.find_local(parent, name) {
            self.mark_captured(parent, reg);
            return Some(self.add_upvalue(fi, name, UpvalueDesc::ParentLocal(reg)));
        }
        if let Some(idx) = self.find_upvalue(parent, name) {
            return Some(self.add_upvalue(fi, name, UpvalueDesc::ParentUpvalue(idx)));
        }
        if let Some(idx) = self.capture(parent, name) {
            return Some(self.add_upvalue(fi, name, UpvalueDesc::ParentUpvalue(idx)));
        }
        None
    }

    fn add_upvalue(&mut self, fi: usize, name: &str, desc: UpvalueDesc) -> usize {
        let upvalues = &mut self.funcs[fi].upvalues;
        upvalues.push((name.to_string(), desc));
        upvalues.len() - 1
    }

    fn mark_captured(&mut self, fi: usize, reg: usize) {
        for scope in self.funcs[fi].scopes.iter_mut().rev() {
            if scope.names.iter().any(|(_, r)| *r == reg) {
                scope.has_captures = true;
                return;
            }
        }
    }

    // ----------------- loops -----------------

    fn push_loop(&mut self, allow_continue: bool) {
        self.f().loops.push(LoopCtx {
            breaks: Vec::new(),
            continues: Vec::new(),
            allow_continue,
        });
    }

    fn loop_mut(&mut self) -> &mut LoopCtx {
        self.f().loops.last_mut().expect("loop context")
    }

    /// Pops the innermost loop/switch context. Breaks are patched to the
    /// current position; continues to `continue_target` when given.
    fn pop_loop_patch(&mut self, continue_target: Option<usize>) {
        let ctx = self.f().loops.pop().expect("loop context");
        for at in ctx.breaks {
            self.patch_jump(at);
        }
        if let Some(target) = continue_target {
            for at in ctx.continues {
                self.patch_jump_to(at, target);
            }
        } else {
            debug_assert!(ctx.continues.is_empty());
        }
    }

    // ----------------- emission -----------------

    fn here(&self) -> usize {
        self.funcs.last().expect("function state").code.len()
    }

    fn emit(&mut self, op: OpCode, a: i32, b: i32, c: i32, loc: SourceLocation) -> usize {
        let f = self.f();
        f.code.push(Instruction { op, a, b, c, loc });
        f.code.len() - 1
    }

    fn emit_load_int(&mut self, reg: usize, value: i64, loc: SourceLocation) {
        if value >= i32::MIN as i64 && value <= i32::MAX as i64 {
            self.emit(OpCode::LoadInt, reg as i32, value as i32, 0, loc);
        } else {
            let id = self.const_id(Constant::Int(value));
            self.emit(OpCode::LoadConst, reg as i32, id as i32, 0, loc);
        }
    }

    fn emit_jump(&mut self, op: OpCode, a: i32, loc: SourceLocation) -> usize {
        self.emit(op, a, 0, 0, loc)
    }

    /// Unconditional backward jump to `target`.
    fn emit_loop(&mut self, target: usize, loc: SourceLocation) {
        let at = self.emit(OpCode::Jmp, 0, 0, 0, loc);
        self.patch_jump_to(at, target);
    }

    /// Points the jump at `at` to the current position.
    fn patch_jump(&mut self, at: usize) {
        let target = self.here();
        self.patch_jump_to(at, target);
    }

    fn patch_jump_to(&mut self, at: usize, target: usize) {
        // offsets are relative to the following instruction
        self.f().code[at].b = target as i32 - (at as i32 + 1);
    }

    fn const_id(&mut self, constant: Constant) -> usize {
        let key = match &constant {
            Constant::Int(v) => ConstKey::Int(*v),
            Constant::Float(v) => ConstKey::Float(v.to_bits()),
            Constant::Str(s) => ConstKey::Str(s.to_string()),
        };
        let f = self.f();
        if let Some(&id) = f.constant_ids.get(&key) {
            return id;
        }
        let id = f.constants.len();
        f.constants.push(constant);
        f.constant_ids.insert(key, id);
        id
    }

    fn error(&self, loc: SourceLocation, kind: CompileErrorKind) -> CompileError {
        CompileError::new(self.path.clone(), loc, kind)
    }
}
