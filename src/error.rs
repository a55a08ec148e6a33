use std::rc::Rc;

use thiserror::Error;

use crate::token::SourceLocation;

/// Error raised while turning source text into a program: lexical, syntax,
/// and semantic errors all surface through this one type so the CLI and
/// `require` can report them uniformly.
#[derive(Debug, Clone, Error)]
#[error("{path}:{location}: {kind}")]
pub struct CompileError {
    pub path: Rc<str>,
    pub location: SourceLocation,
    pub kind: CompileErrorKind,
}

impl CompileError {
    pub fn new(path: Rc<str>, location: SourceLocation, kind: CompileErrorKind) -> Self {
        Self {
            path,
            location,
            kind,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CompileErrorKind {
    // lexical
    #[error("unexpected character {0:?}")]
    UnexpectedChar(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unterminated block comment")]
    UnterminatedComment,
    #[error("invalid escape sequence")]
    InvalidEscape,
    #[error("integer literal out of range")]
    IntegerOutOfRange,
    #[error("malformed number literal")]
    MalformedNumber,

    // syntax
    #[error("unexpected {found}, expected {expected}")]
    UnexpectedToken { found: String, expected: String },
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("`default` must be the last switch clause")]
    DefaultNotLast,

    // semantic
    #[error("local variable `{0}` already declared in this scope")]
    Redeclaration(String),
    #[error("variable `{0}` not found")]
    UndefinedName(String),
    #[error("target is not assignable")]
    NotAssignable,
    #[error("`delete` target must be an array element or struct field")]
    BadDeleteTarget,
    #[error("`break` outside of a loop or switch")]
    BreakOutsideLoop,
    #[error("`continue` outside of a loop")]
    ContinueOutsideLoop,
    #[error("function needs too many registers")]
    RegisterOverflow,
}

/// A single entry in the call chain surfaced with a runtime error: the
/// script it happened in plus the instruction's source position.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub path: Rc<str>,
    pub location: SourceLocation,
}

/// Runtime failure. Aborts the whole VM run; the language offers no way to
/// catch it. `trace` holds the frame chain innermost-last.
#[derive(Debug, Clone, Error)]
#[error("{}runtime error: {}:{}: {}", format_trace(.trace), .path, .location, .kind)]
pub struct RuntimeError {
    pub path: Rc<str>,
    pub location: SourceLocation,
    pub kind: RuntimeErrorKind,
    pub trace: Vec<TraceFrame>,
}

fn format_trace(trace: &[TraceFrame]) -> String {
    if trace.is_empty() {
        return String::new();
    }
    let mut out = String::from("stack trace:\n");
    for frame in trace.iter().rev() {
        out.push_str(&format!("\tat {}:{}\n", frame.path, frame.location));
    }
    out
}

#[derive(Debug, Clone, Error)]
pub enum RuntimeErrorKind {
    // type errors
    #[error("incompatible operand type(s): {0}")]
    IncompatibleTypes(String),
    #[error("called value of type {0} is not callable")]
    NotCallable(&'static str),
    #[error("cannot index a value of type {0}")]
    NotIndexable(&'static str),
    #[error("struct keys must be int or str, got {0}")]
    BadFieldKey(&'static str),

    // value errors
    #[error("array index must be a non-negative int")]
    BadArrayIndex,
    #[error("index out of range")]
    IndexOutOfRange,
    #[error("divide by zero")]
    DivideByZero,
    #[error("int() cannot parse {0:?}")]
    IntParse(String),
    #[error("float() cannot parse {0:?}")]
    FloatParse(String),

    // resource errors
    #[error("stack overflow")]
    StackOverflow,

    // require errors
    #[error("require() failed: {0}")]
    Require(String),
    #[error("require() failed: circular dependency on {0:?}")]
    CircularRequire(String),
}

/// Top-level error for library entry points: either the script failed to
/// compile or it failed while running.
#[derive(Debug, Error)]
pub enum Error {
    #[error("compilation error: {0}")]
    Compile(#[from] CompileError),
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
    #[error("{0}")]
    Load(String),
}
