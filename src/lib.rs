pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod host;
pub mod lexer;
pub mod parser;
pub mod token;
pub mod value;
pub mod vm;

use std::path::Path;
use std::rc::Rc;

pub use bytecode::{disassemble, Program};
pub use compiler::compile;
pub use error::{CompileError, Error, RuntimeError};
pub use host::{FsHost, Host};
pub use value::Value;
pub use vm::Vm;

/// Loads, compiles, and runs one script. `args` become the elements of the
/// script's `argv` array; the result is the script's top-level return value.
pub fn run_script(host: &mut dyn Host, path: &Path, args: &[String]) -> Result<Value, Error> {
    let source = host.load(path).map_err(Error::Load)?;
    let program = compile(&path.to_string_lossy(), &source)?;
    let argv = args
        .iter()
        .map(|s| Value::Str(Rc::from(s.as_str())))
        .collect();
    let mut vm = Vm::new(host);
    Ok(vm.run(&program, argv)?)
}
