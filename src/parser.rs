use std::rc::Rc;

use crate::ast::{
    ArrayItem, AutoVar, BinOp, CastOp, Expr, ExprKind, FunctionLiteral, Param, Stmt, StmtKind,
    SwitchClause, UnOp,
};
use crate::error::{CompileError, CompileErrorKind};
use crate::token::{Kw, SourceLocation, Sym, Token, TokenKind};

pub struct Parser {
    path: Rc<str>,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(path: Rc<str>, tokens: Vec<Token>) -> Self {
        Self {
            path,
            tokens,
            pos: 0,
        }
    }

    /// Parses a whole script as an anonymous function taking `argv`.
    pub fn parse_script(mut self) -> Result<FunctionLiteral, CompileError> {
        let loc = self.peek().loc;
        let mut body = Vec::new();

        while !self.at_eof() {
            body.push(self.statement(true)?);
        }

        Ok(FunctionLiteral {
            params: vec![Param {
                name: "argv".to_string(),
                loc,
            }],
            body,
            loc,
        })
    }

    // ----------------- statements -----------------

    fn statement(&mut self, auto_allowed: bool) -> Result<Stmt, CompileError> {
        let loc = self.peek().loc;

        let kind = match &self.peek().kind {
            TokenKind::Sym(Sym::Semi) => {
                self.advance();
                StmtKind::Empty
            }
            TokenKind::Sym(Sym::LBrace) => {
                self.advance();
                let mut stmts = Vec::new();
                while !self.eat_sym(Sym::RBrace) {
                    stmts.push(self.statement(true)?);
                }
                StmtKind::Block(stmts)
            }
            TokenKind::Kw(Kw::Return) => {
                self.advance();
                if self.eat_sym(Sym::Semi) {
                    StmtKind::Return(None)
                } else {
                    let expr = self.expression()?;
                    self.expect_sym(Sym::Semi)?;
                    StmtKind::Return(Some(expr))
                }
            }
            TokenKind::Kw(Kw::Delete) => {
                self.advance();
                let target = self.postfix()?;
                self.expect_sym(Sym::Semi)?;
                match target.kind {
                    ExprKind::Index { target, key } => StmtKind::Delete {
                        target: *target,
                        key: *key,
                    },
                    _ => {
                        return Err(self.error_at(loc, CompileErrorKind::BadDeleteTarget));
                    }
                }
            }
            TokenKind::Kw(Kw::If) => self.if_stmt()?,
            TokenKind::Kw(Kw::Switch) => self.switch_stmt()?,
            TokenKind::Kw(Kw::While) => self.while_stmt()?,
            TokenKind::Kw(Kw::Do) => self.do_while_stmt()?,
            TokenKind::Kw(Kw::For) => self.for_stmt()?,
            TokenKind::Kw(Kw::Foreach) => self.foreach_stmt()?,
            TokenKind::Kw(Kw::Break) => {
                self.advance();
                self.expect_sym(Sym::Semi)?;
                StmtKind::Break
            }
            TokenKind::Kw(Kw::Continue) => {
                self.advance();
                self.expect_sym(Sym::Semi)?;
                StmtKind::Continue
            }
            TokenKind::Kw(Kw::Auto) if auto_allowed => {
                self.advance();
                StmtKind::Auto(self.auto_vars()?)
            }
            _ => {
                let expr = self.expression()?;
                self.expect_sym(Sym::Semi)?;
                StmtKind::Expr(expr)
            }
        };

        Ok(Stmt { kind, loc })
    }

    /// `name [= expr] (, name [= expr])* ;` — the `auto` keyword has already
    /// been consumed; the terminating semicolon is consumed here, which is
    /// what lets `if (auto x = f(); x > 0)` read naturally.
    fn auto_vars(&mut self) -> Result<Vec<AutoVar>, CompileError> {
        let mut vars = Vec::new();

        loop {
            let (name, loc) = self.expect_ident()?;
            let init = if self.eat_sym(Sym::Assign) {
                Some(self.assignment()?)
            } else {
                None
            };
            vars.push(AutoVar { name, loc, init });

            if self.eat_sym(Sym::Comma) {
                continue;
            }
            self.expect_sym(Sym::Semi)?;
            return Ok(vars);
        }
    }

    fn construct_init(&mut self) -> Result<Option<Vec<AutoVar>>, CompileError> {
        if self.eat_kw(Kw::Auto) {
            Ok(Some(self.auto_vars()?))
        } else {
            Ok(None)
        }
    }

    fn if_stmt(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        self.expect_sym(Sym::LParen)?;
        let init = self.construct_init()?;
        let cond = self.expression()?;
        self.expect_sym(Sym::RParen)?;
        let then = Box::new(self.statement(false)?);
        let els = if self.eat_kw(Kw::Else) {
            Some(Box::new(self.statement(false)?))
        } else {
            None
        };
        Ok(StmtKind::If {
            init,
            cond,
            then,
            els,
        })
    }

    fn switch_stmt(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        self.expect_sym(Sym::LParen)?;
        let init = self.construct_init()?;
        let expr = self.expression()?;
        self.expect_sym(Sym::RParen)?;
        self.expect_sym(Sym::LBrace)?;

        let mut clauses: Vec<SwitchClause> = Vec::new();
        while !self.eat_sym(Sym::RBrace) {
            let loc = self.peek().loc;
            if clauses.iter().any(|c| c.label.is_none()) {
                return Err(self.error_at(loc, CompileErrorKind::DefaultNotLast));
            }

            let label = if self.eat_kw(Kw::Case) {
                let label = self.expression()?;
                self.expect_sym(Sym::Colon)?;
                Some(label)
            } else if self.eat_kw(Kw::Default) {
                self.expect_sym(Sym::Colon)?;
                None
            } else {
                return Err(self.error_expected("`case` or `default`"));
            };

            let mut stmts = Vec::new();
            loop {
                match &self.peek().kind {
                    TokenKind::Kw(Kw::Case) | TokenKind::Kw(Kw::Default) => break,
                    TokenKind::Sym(Sym::RBrace) => break,
                    _ => stmts.push(self.statement(false)?),
                }
            }

            clauses.push(SwitchClause { label, stmts, loc });
        }

        Ok(StmtKind::Switch {
            init,
            expr,
            clauses,
        })
    }

    fn while_stmt(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        self.expect_sym(Sym::LParen)?;
        let init = self.construct_init()?;
        let cond = self.expression()?;
        self.expect_sym(Sym::RParen)?;
        let body = Box::new(self.statement(false)?);
        Ok(StmtKind::While { init, cond, body })
    }

    fn do_while_stmt(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        let body = Box::new(self.statement(false)?);
        self.expect_kw(Kw::While)?;
        self.expect_sym(Sym::LParen)?;
        let init = self.construct_init()?;
        let cond = self.expression()?;
        self.expect_sym(Sym::RParen)?;
        self.expect_sym(Sym::Semi)?;
        Ok(StmtKind::DoWhile { body, init, cond })
    }

    fn for_stmt(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        self.expect_sym(Sym::LParen)?;

        let init = if self.eat_sym(Sym::Semi) {
            None
        } else if self.eat_kw(Kw::Auto) {
            let loc = self.peek().loc;
            Some(Box::new(Stmt {
                kind: StmtKind::Auto(self.auto_vars()?),
                loc,
            }))
        } else {
            let loc = self.peek().loc;
            let expr = self.expression()?;
            self.expect_sym(Sym::Semi)?;
            Some(Box::new(Stmt {
                kind: StmtKind::Expr(expr),
                loc,
            }))
        };

        let cond = if self.eat_sym(Sym::Semi) {
            None
        } else {
            let cond = self.expression()?;
            self.expect_sym(Sym::Semi)?;
            Some(cond)
        };

        let step = if self.eat_sym(Sym::RParen) {
            None
        } else {
            let step = self.expression()?;
            self.expect_sym(Sym::RParen)?;
            Some(step)
        };

        let body = Box::new(self.statement(false)?);
        Ok(StmtKind::For {
            init,
            cond,
            step,
            body,
        })
    }

    fn foreach_stmt(&mut self) -> Result<StmtKind, CompileError> {
        self.advance();
        self.expect_sym(Sym::LParen)?;
        self.expect_kw(Kw::Auto)?;

        let (name, loc) = self.expect_ident()?;
        let key = Param { name, loc };

        let value = if self.eat_sym(Sym::Comma) {
            let (name, loc) = self.expect_ident()?;
            self.expect_sym(Sym::Colon)?;
            Some(Param { name, loc })
        } else {
            self.expect_sym(Sym::Colon)?;
            None
        };

        let container = self.expression()?;
        self.expect_sym(Sym::RParen)?;
        let body = Box::new(self.statement(false)?);

        Ok(StmtKind::Foreach {
            key,
            value,
            container,
            body,
        })
    }

    // ----------------- expressions -----------------

    /// Lowest level: the comma operator.
    fn expression(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.assignment()?;

        while self.at_sym(Sym::Comma) {
            let loc = self.peek().loc;
            self.advance();
            let rhs = self.assignment()?;
            expr = Expr {
                kind: ExprKind::Comma {
                    lhs: Box::new(expr),
                    rhs: Box::new(rhs),
                },
                loc,
            };
        }

        Ok(expr)
    }

    fn assignment(&mut self) -> Result<Expr, CompileError> {
        let expr = self.ternary()?;

        let op = match &self.peek().kind {
            TokenKind::Sym(Sym::Assign) => None,
            TokenKind::Sym(Sym::PlusAssign) => Some(BinOp::Add),
            TokenKind::Sym(Sym::MinusAssign) => Some(BinOp::Sub),
            TokenKind::Sym(Sym::StarAssign) => Some(BinOp::Mul),
            TokenKind::Sym(Sym::SlashAssign) => Some(BinOp::Div),
            TokenKind::Sym(Sym::PercentAssign) => Some(BinOp::Mod),
            TokenKind::Sym(Sym::ShlAssign) => Some(BinOp::Shl),
            TokenKind::Sym(Sym::ShrAssign) => Some(BinOp::Shr),
            TokenKind::Sym(Sym::AmpAssign) => Some(BinOp::BitAnd),
            TokenKind::Sym(Sym::PipeAssign) => Some(BinOp::BitOr),
            TokenKind::Sym(Sym::CaretAssign) => Some(BinOp::BitXor),
            _ => return Ok(expr),
        };

        let loc = self.peek().loc;
        self.advance();
        let value = self.assignment()?; // right-associative
        Ok(Expr {
            kind: ExprKind::Assign {
                op,
                target: Box::new(expr),
                value: Box::new(value),
            },
            loc,
        })
    }

    fn ternary(&mut self) -> Result<Expr, CompileError> {
        let expr = self.binary(1)?;

        if !self.at_sym(Sym::Question) {
            return Ok(expr);
        }

        let loc = self.peek().loc;
        self.advance();
        let then = self.ternary()?;
        self.expect_sym(Sym::Colon)?;
        let els = self.ternary()?;
        Ok(Expr {
            kind: ExprKind::Ternary {
                cond: Box::new(expr),
                then: Box::new(then),
                els: Box::new(els),
            },
            loc,
        })
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr, CompileError> {
        let mut expr = self.unary()?;

        loop {
            let Some((prec, op)) = self.binary_op() else {
                break;
            };
            if prec < min_prec {
                break;
            }

            let loc = self.peek().loc;
            self.advance();
            let rhs = self.binary(prec + 1)?;
            expr = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(expr),
                    rhs: Box::new(rhs),
                },
                loc,
            };
        }

        Ok(expr)
    }

    fn binary_op(&self) -> Option<(u8, BinOp)> {
        let TokenKind::Sym(sym) = self.peek().kind else {
            return None;
        };

        let entry = match sym {
            Sym::OrOr => (1, BinOp::Or),
            Sym::AndAnd => (2, BinOp::And),
            Sym::Pipe => (3, BinOp::BitOr),
            Sym::Caret => (4, BinOp::BitXor),
            Sym::Amp => (5, BinOp::BitAnd),
            Sym::EqEq => (6, BinOp::Eq),
            Sym::BangEq => (6, BinOp::Ne),
            Sym::Lt => (7, BinOp::Lt),
            Sym::Le => (7, BinOp::Le),
            Sym::Gt => (7, BinOp::Gt),
            Sym::Ge => (7, BinOp::Ge),
            Sym::Shl => (8, BinOp::Shl),
            Sym::Shr => (8, BinOp::Shr),
            Sym::Plus => (9, BinOp::Add),
            Sym::Minus => (9, BinOp::Sub),
            Sym::Star => (10, BinOp::Mul),
            Sym::Slash => (10, BinOp::Div),
            Sym::Percent => (10, BinOp::Mod),
            _ => return None,
        };
        Some(entry)
    }

    fn unary(&mut self) -> Result<Expr, CompileError> {
        let loc = self.peek().loc;

        let cast = match &self.peek().kind {
            TokenKind::Kw(Kw::Bool) => Some(CastOp::Bool),
            TokenKind::Kw(Kw::Int) => Some(CastOp::Int),
            TokenKind::Kw(Kw::Float) => Some(CastOp::Float),
            TokenKind::Kw(Kw::Str) => Some(CastOp::Str),
            TokenKind::Kw(Kw::Sizeof) => Some(CastOp::Sizeof),
            TokenKind::Kw(Kw::Typeof) => Some(CastOp::Typeof),
            _ => None,
        };
        if let Some(op) = cast {
            self.advance();
            self.expect_sym(Sym::LParen)?;
            let operand = self.assignment()?;
            self.expect_sym(Sym::RParen)?;
            return Ok(Expr {
                kind: ExprKind::Cast {
                    op,
                    operand: Box::new(operand),
                },
                loc,
            });
        }

        let incdec = match &self.peek().kind {
            TokenKind::Sym(Sym::PlusPlus) => Some(true),
            TokenKind::Sym(Sym::MinusMinus) => Some(false),
            _ => None,
        };
        if let Some(increment) = incdec {
            self.advance();
            let target = self.unary()?;
            return Ok(Expr {
                kind: ExprKind::IncDec {
                    increment,
                    postfix: false,
                    target: Box::new(target),
                },
                loc,
            });
        }

        let prefix = match &self.peek().kind {
            TokenKind::Sym(Sym::Plus) => Some(UnOp::Plus),
            TokenKind::Sym(Sym::Minus) => Some(UnOp::Neg),
            TokenKind::Sym(Sym::Bang) => Some(UnOp::Not),
            TokenKind::Sym(Sym::Tilde) => Some(UnOp::BitNot),
            _ => None,
        };
        if let Some(op) = prefix {
            self.advance();
            let operand = self.unary()?;

            // fold a negated number literal
            if op == UnOp::Neg {
                match operand.kind {
                    ExprKind::Int(v) => {
                        return Ok(Expr {
                            kind: ExprKind::Int(v.wrapping_neg()),
                            loc,
                        })
                    }
                    ExprKind::Float(v) => {
                        return Ok(Expr {
                            kind: ExprKind::Float(-v),
                            loc,
                        })
                    }
                    _ => {}
                }
            }

            return Ok(Expr {
                kind: ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                loc,
            });
        }

        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.primary()?;

        loop {
            let loc = self.peek().loc;
            match &self.peek().kind {
                TokenKind::Sym(Sym::PlusPlus) | TokenKind::Sym(Sym::MinusMinus) => {
                    let increment = self.peek().kind == TokenKind::Sym(Sym::PlusPlus);
                    self.advance();
                    expr = Expr {
                        kind: ExprKind::IncDec {
                            increment,
                            postfix: true,
                            target: Box::new(expr),
                        },
                        loc,
                    };
                }
                TokenKind::Sym(Sym::Dot) => {
                    self.advance();
                    let (name, name_loc) = self.expect_ident()?;
                    expr = Expr {
                        kind: ExprKind::Index {
                            target: Box::new(expr),
                            key: Box::new(Expr {
                                kind: ExprKind::Str(name),
                                loc: name_loc,
                            }),
                        },
                        loc,
                    };
                }
                TokenKind::Sym(Sym::LBracket) => {
                    self.advance();
                    let key = self.expression()?;
                    self.expect_sym(Sym::RBracket)?;
                    expr = Expr {
                        kind: ExprKind::Index {
                            target: Box::new(expr),
                            key: Box::new(key),
                        },
                        loc,
                    };
                }
                TokenKind::Sym(Sym::LParen) => {
                    self.advance();
                    let args = self.call_args()?;
                    expr = Expr {
                        kind: ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        loc,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Arguments up to and including the closing paren; the opening paren is
    /// already consumed.
    fn call_args(&mut self) -> Result<Vec<Expr>, CompileError> {
        let mut args = Vec::new();

        loop {
            if self.eat_sym(Sym::RParen) {
                return Ok(args);
            }
            args.push(self.assignment()?);
            if self.eat_sym(Sym::Comma) {
                continue;
            }
            self.expect_sym(Sym::RParen)?;
            return Ok(args);
        }
    }

    fn primary(&mut self) -> Result<Expr, CompileError> {
        let loc = self.peek().loc;

        let kind = match self.peek().kind.clone() {
            TokenKind::Sym(Sym::LParen) => {
                // `(auto ...) { ... }` and `() { ... }` are closures, anything
                // else is a parenthesized expression.
                let is_closure = matches!(
                    self.peek_at(1).map(|t| &t.kind),
                    Some(TokenKind::Kw(Kw::Auto)) | Some(TokenKind::Sym(Sym::RParen))
                );
                if is_closure {
                    ExprKind::Closure(Box::new(self.function_literal()?))
                } else {
                    self.advance();
                    let expr = self.expression()?;
                    self.expect_sym(Sym::RParen)?;
                    return Ok(expr);
                }
            }
            TokenKind::Kw(Kw::Null) => {
                self.advance();
                ExprKind::Null
            }
            TokenKind::Kw(Kw::True) => {
                self.advance();
                ExprKind::Bool(true)
            }
            TokenKind::Kw(Kw::False) => {
                self.advance();
                ExprKind::Bool(false)
            }
            TokenKind::IntLit(v) => {
                self.advance();
                ExprKind::Int(v)
            }
            TokenKind::FloatLit(v) => {
                self.advance();
                ExprKind::Float(v)
            }
            TokenKind::StrLit(s) => {
                self.advance();
                // adjacent string literals concatenate
                let mut value = s;
                while let TokenKind::StrLit(next) = &self.peek().kind {
                    value.push_str(next);
                    self.advance();
                }
                ExprKind::Str(value)
            }
            TokenKind::Ident(name) => {
                self.advance();
                ExprKind::Ident(name)
            }
            TokenKind::Sym(Sym::LBracket) => self.array_literal()?,
            TokenKind::Kw(Kw::Struct) => self.struct_literal()?,
            TokenKind::Kw(Kw::Require) => {
                self.advance();
                self.expect_sym(Sym::LParen)?;
                let args = self.call_args()?;
                if args.is_empty() {
                    return Err(self.error_at(
                        loc,
                        CompileErrorKind::UnexpectedToken {
                            found: "`)`".to_string(),
                            expected: "a file path argument".to_string(),
                        },
                    ));
                }
                ExprKind::Require(args)
            }
            _ => return Err(self.error_expected("expression")),
        };

        Ok(Expr { kind, loc })
    }

    fn array_literal(&mut self) -> Result<ExprKind, CompileError> {
        self.expect_sym(Sym::LBracket)?;
        self.expect_sym(Sym::RBracket)?;
        self.expect_sym(Sym::LBrace)?;

        let mut items = Vec::new();
        loop {
            if self.eat_sym(Sym::RBrace) {
                return Ok(ExprKind::Array(items));
            }

            let index = if self.eat_sym(Sym::LBracket) {
                let index = self.expression()?;
                self.expect_sym(Sym::RBracket)?;
                self.expect_sym(Sym::Assign)?;
                Some(index)
            } else {
                None
            };
            let value = self.assignment()?;
            items.push(ArrayItem { index, value });

            if self.eat_sym(Sym::Comma) {
                continue;
            }
            self.expect_sym(Sym::RBrace)?;
            return Ok(ExprKind::Array(items));
        }
    }

    fn struct_literal(&mut self) -> Result<ExprKind, CompileError> {
        self.expect_kw(Kw::Struct)?;
        self.expect_sym(Sym::LBrace)?;

        let mut fields = Vec::new();
        loop {
            if self.eat_sym(Sym::RBrace) {
                return Ok(ExprKind::StructLit(fields));
            }

            let key = if self.eat_sym(Sym::Dot) {
                let (name, loc) = self.expect_ident()?;
                Expr {
                    kind: ExprKind::Str(name),
                    loc,
                }
            } else if self.eat_sym(Sym::LBracket) {
                let key = self.expression()?;
                self.expect_sym(Sym::RBracket)?;
                key
            } else {
                let (name, loc) = self.expect_ident()?;
                Expr {
                    kind: ExprKind::Str(name),
                    loc,
                }
            };

            self.expect_sym(Sym::Assign)?;
            let value = self.assignment()?;
            fields.push((key, value));

            if self.eat_sym(Sym::Comma) {
                continue;
            }
            self.expect_sym(Sym::RBrace)?;
            return Ok(ExprKind::StructLit(fields));
        }
    }

    fn function_literal(&mut self) -> Result<FunctionLiteral, CompileError> {
        let loc = self.peek().loc;
        self.expect_sym(Sym::LParen)?;

        let mut params = Vec::new();
        loop {
            if self.eat_sym(Sym::RParen) {
                break;
            }
            self.expect_kw(Kw::Auto)?;
            let (name, loc) = self.expect_ident()?;
            params.push(Param { name, loc });

            if self.eat_sym(Sym::Comma) {
                continue;
            }
            self.expect_sym(Sym::RParen)?;
            break;
        }

        self.expect_sym(Sym::LBrace)?;
        let mut body = Vec::new();
        while !self.eat_sym(Sym::RBrace) {
            body.push(self.statement(true)?);
        }

        Ok(FunctionLiteral { params, body, loc })
    }

    // ----------------- helpers -----------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn advance(&mut self) {
        if !self.at_eof() {
            self.pos += 1;
        }
    }

    fn at_sym(&self, sym: Sym) -> bool {
        matches!(&self.peek().kind, TokenKind::Sym(s) if *s == sym)
    }

    fn eat_sym(&mut self, sym: Sym) -> bool {
        if self.at_sym(sym) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: Sym) -> Result<SourceLocation, CompileError> {
        let loc = self.peek().loc;
        if self.eat_sym(sym) {
            Ok(loc)
        } else {
            Err(self.error_expected(&format!("`{}`", sym.as_str())))
        }
    }

    fn eat_kw(&mut self, kw: Kw) -> bool {
        if matches!(&self.peek().kind, TokenKind::Kw(k) if *k == kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: Kw) -> Result<(), CompileError> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.error_expected(&format!("`{}`", kw.as_str())))
        }
    }

    fn expect_ident(&mut self) -> Result<(String, SourceLocation), CompileError> {
        let loc = self.peek().loc;
        match self.peek().kind.clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok((name, loc))
            }
            _ => Err(self.error_expected("identifier")),
        }
    }

    fn error_expected(&self, expected: &str) -> CompileError {
        let token = self.peek();
        let kind = if matches!(token.kind, TokenKind::Eof) {
            CompileErrorKind::UnexpectedEof
        } else {
            CompileErrorKind::UnexpectedToken {
                found: token.kind.to_string(),
                expected: expected.to_string(),
            }
        };
        CompileError::new(self.path.clone(), token.loc, kind)
    }

    fn error_at(&self, loc: SourceLocation, kind: CompileErrorKind) -> CompileError {
        CompileError::new(self.path.clone(), loc, kind)
    }
}
