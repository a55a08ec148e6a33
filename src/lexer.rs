use std::rc::Rc;

use crate::error::{CompileError, CompileErrorKind};
use crate::token::{Kw, SourceLocation, Sym, Token, TokenKind};

pub struct Lexer {
    path: Rc<str>,
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
}

impl Lexer {
    pub fn new(path: Rc<str>, source: &str) -> Self {
        Self {
            path,
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, CompileError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_trivia()?;
            let loc = self.loc();

            let Some(c) = self.peek(0) else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    loc,
                });
                return Ok(tokens);
            };

            let kind = if c.is_ascii_digit() {
                self.number()?
            } else if c == '.' && self.peek(1).is_some_and(|d| d.is_ascii_digit()) {
                self.number()?
            } else if c == '"' {
                self.string()?
            } else if c == '_' || c.is_ascii_alphabetic() {
                self.name()
            } else {
                self.symbol()?
            };

            tokens.push(Token { kind, loc });
        }
    }

    fn skip_trivia(&mut self) -> Result<(), CompileError> {
        loop {
            match self.peek(0) {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek(1) == Some('/') => {
                    while let Some(c) = self.peek(0) {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek(1) == Some('*') => {
                    let start = self.loc();
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek(0) {
                            Some('*') if self.peek(1) == Some('/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            Some(_) => {
                                self.bump();
                            }
                            None => {
                                return Err(self.error_at(
                                    start,
                                    CompileErrorKind::UnterminatedComment,
                                ))
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn number(&mut self) -> Result<TokenKind, CompileError> {
        let start = self.loc();

        if self.peek(0) == Some('0') && matches!(self.peek(1), Some('x') | Some('X')) {
            self.bump();
            self.bump();
            let mut digits = String::new();
            while let Some(c) = self.peek(0) {
                if !c.is_ascii_hexdigit() {
                    break;
                }
                digits.push(c);
                self.bump();
            }
            if digits.is_empty() {
                return Err(self.error_at(start, CompileErrorKind::MalformedNumber));
            }
            let value = u64::from_str_radix(&digits, 16)
                .map_err(|_| self.error_at(start, CompileErrorKind::IntegerOutOfRange))?;
            return Ok(TokenKind::IntLit(value as i64));
        }

        let mut text = String::new();
        let mut is_float = false;

        while let Some(c) = self.peek(0) {
            if !c.is_ascii_digit() {
                break;
            }
            text.push(c);
            self.bump();
        }

        if self.peek(0) == Some('.') && self.peek(1) != Some('.') {
            is_float = true;
            text.push('.');
            self.bump();
            if text == "." && !self.peek(0).is_some_and(|c| c.is_ascii_digit()) {
                return Err(self.error_at(start, CompileErrorKind::MalformedNumber));
            }
            while let Some(c) = self.peek(0) {
                if !c.is_ascii_digit() {
                    break;
                }
                text.push(c);
                self.bump();
            }
        }

        if matches!(self.peek(0), Some('e') | Some('E')) {
            is_float = true;
            text.push('e');
            self.bump();
            if matches!(self.peek(0), Some('+') | Some('-')) {
                text.push(self.peek(0).unwrap());
                self.bump();
            }
            if !self.peek(0).is_some_and(|c| c.is_ascii_digit()) {
                return Err(self.error_at(start, CompileErrorKind::MalformedNumber));
            }
            while let Some(c) = self.peek(0) {
                if !c.is_ascii_digit() {
                    break;
                }
                text.push(c);
                self.bump();
            }
        }

        if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|_| self.error_at(start, CompileErrorKind::MalformedNumber))?;
            Ok(TokenKind::FloatLit(value))
        } else {
            // Out-of-range decimals are rejected; in-range values wrap into
            // the i64 two's-complement space.
            let value = text
                .parse::<u64>()
                .map_err(|_| self.error_at(start, CompileErrorKind::IntegerOutOfRange))?;
            Ok(TokenKind::IntLit(value as i64))
        }
    }

    fn string(&mut self) -> Result<TokenKind, CompileError> {
        let start = self.loc();
        self.bump(); // opening quote
        let mut value = String::new();

        loop {
            match self.peek(0) {
                None | Some('\n') => {
                    return Err(self.error_at(start, CompileErrorKind::UnterminatedString))
                }
                Some('"') => {
                    self.bump();
                    return Ok(TokenKind::StrLit(value));
                }
                Some('\\') => {
                    self.bump();
                    value.push(self.escape(start)?);
                }
                Some(c) => {
                    value.push(c);
                    self.bump();
                }
            }
        }
    }

    fn escape(&mut self, start: SourceLocation) -> Result<char, CompileError> {
        let Some(c) = self.peek(0) else {
            return Err(self.error_at(start, CompileErrorKind::UnterminatedString));
        };

        let simple = match c {
            'a' => Some('\x07'),
            'b' => Some('\x08'),
            'f' => Some('\x0c'),
            'n' => Some('\n'),
            'r' => Some('\r'),
            't' => Some('\t'),
            'v' => Some('\x0b'),
            '\\' => Some('\\'),
            '\'' => Some('\''),
            '"' => Some('"'),
            '?' => Some('?'),
            _ => None,
        };
        if let Some(ch) = simple {
            self.bump();
            return Ok(ch);
        }

        if c.is_digit(8) {
            // one to three octal digits; covers the plain `\0`
            let mut code = 0u32;
            for _ in 0..3 {
                match self.peek(0) {
                    Some(d) if d.is_digit(8) => {
                        code = code * 8 + d.to_digit(8).unwrap();
                        self.bump();
                    }
                    _ => break,
                }
            }
            return char::from_u32(code & 0xff)
                .ok_or_else(|| self.error(CompileErrorKind::InvalidEscape));
        }

        if c == 'x' || c == 'X' {
            self.bump();
            let mut code = 0u32;
            for _ in 0..2 {
                match self.peek(0) {
                    Some(d) if d.is_ascii_hexdigit() => {
                        code = code * 16 + d.to_digit(16).unwrap();
                        self.bump();
                    }
                    _ => return Err(self.error(CompileErrorKind::InvalidEscape)),
                }
            }
            return char::from_u32(code).ok_or_else(|| self.error(CompileErrorKind::InvalidEscape));
        }

        Err(self.error(CompileErrorKind::InvalidEscape))
    }

    fn name(&mut self) -> TokenKind {
        let mut text = String::new();
        while let Some(c) = self.peek(0) {
            if c == '_' || c.is_ascii_alphanumeric() {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }

        match Kw::from_ident(&text) {
            Some(kw) => TokenKind::Kw(kw),
            None => TokenKind::Ident(text),
        }
    }

    fn symbol(&mut self) -> Result<TokenKind, CompileError> {
        let c = self.peek(0).unwrap();
        let c1 = self.peek(1);
        let c2 = self.peek(2);

        let (sym, len) = match c {
            '<' => match (c1, c2) {
                (Some('<'), Some('=')) => (Sym::ShlAssign, 3),
                (Some('<'), _) => (Sym::Shl, 2),
                (Some('='), _) => (Sym::Le, 2),
                _ => (Sym::Lt, 1),
            },
            '>' => match (c1, c2) {
                (Some('>'), Some('=')) => (Sym::ShrAssign, 3),
                (Some('>'), _) => (Sym::Shr, 2),
                (Some('='), _) => (Sym::Ge, 2),
                _ => (Sym::Gt, 1),
            },
            '+' => match c1 {
                Some('+') => (Sym::PlusPlus, 2),
                Some('=') => (Sym::PlusAssign, 2),
                _ => (Sym::Plus, 1),
            },
            '-' => match c1 {
                Some('-') => (Sym::MinusMinus, 2),
                Some('=') => (Sym::MinusAssign, 2),
                _ => (Sym::Minus, 1),
            },
            '&' => match c1 {
                Some('&') => (Sym::AndAnd, 2),
                Some('=') => (Sym::AmpAssign, 2),
                _ => (Sym::Amp, 1),
            },
            '|' => match c1 {
                Some('|') => (Sym::OrOr, 2),
                Some('=') => (Sym::PipeAssign, 2),
                _ => (Sym::Pipe, 1),
            },
            '*' => match c1 {
                Some('=') => (Sym::StarAssign, 2),
                _ => (Sym::Star, 1),
            },
            '/' => match c1 {
                Some('=') => (Sym::SlashAssign, 2),
                _ => (Sym::Slash, 1),
            },
            '%' => match c1 {
                Some('=') => (Sym::PercentAssign, 2),
                _ => (Sym::Percent, 1),
            },
            '^' => match c1 {
                Some('=') => (Sym::CaretAssign, 2),
                _ => (Sym::Caret, 1),
            },
            '=' => match c1 {
                Some('=') => (Sym::EqEq, 2),
                _ => (Sym::Assign, 1),
            },
            '!' => match c1 {
                Some('=') => (Sym::BangEq, 2),
                _ => (Sym::Bang, 1),
            },
            '.' => match c1 {
                Some('.') => (Sym::DotDot, 2),
                _ => (Sym::Dot, 1),
            },
            '~' => (Sym::Tilde, 1),
            '?' => (Sym::Question, 1),
            ':' => (Sym::Colon, 1),
            ',' => (Sym::Comma, 1),
            ';' => (Sym::Semi, 1),
            '(' => (Sym::LParen, 1),
            ')' => (Sym::RParen, 1),
            '[' => (Sym::LBracket, 1),
            ']' => (Sym::RBracket, 1),
            '{' => (Sym::LBrace, 1),
            '}' => (Sym::RBrace, 1),
            other => return Err(self.error(CompileErrorKind::UnexpectedChar(other))),
        };

        for _ in 0..len {
            self.bump();
        }
        Ok(TokenKind::Sym(sym))
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn loc(&self) -> SourceLocation {
        SourceLocation::new(self.line, self.column)
    }

    fn error(&self, kind: CompileErrorKind) -> CompileError {
        self.error_at(self.loc(), kind)
    }

    fn error_at(&self, loc: SourceLocation, kind: CompileErrorKind) -> CompileError {
        CompileError::new(self.path.clone(), loc, kind)
    }
}
