use std::env;
use std::path::Path;

use oyc::{compile, disassemble, run_script, Error, FsHost, Host, Value};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || (args[1] == "-d" && args.len() < 3) {
        print_usage(args.first().map(String::as_str).unwrap_or("oyc"));
        std::process::exit(2);
    }

    let mut host = FsHost;

    if args[1] == "-d" {
        if let Err(code) = dump_bytecode(&mut host, &args[2]) {
            std::process::exit(code);
        }
        return;
    }

    let path = &args[1];
    match run_script(&mut host, Path::new(path), &args[2..]) {
        // an int return value becomes the exit code; null/void mean success
        Ok(Value::Int(code)) => std::process::exit(code as i32),
        Ok(Value::Null) | Ok(Value::Void) => {}
        Ok(_) => std::process::exit(1),
        Err(err) => {
            let message = match &err {
                Error::Load(msg) => msg.clone(),
                other => other.to_string(),
            };
            host.stderr_line(&message);
            std::process::exit(1);
        }
    }
}

fn dump_bytecode(host: &mut FsHost, path: &str) -> Result<(), i32> {
    let source = host.load(Path::new(path)).map_err(|e| {
        host.stderr_line(&e);
        1
    })?;
    match compile(path, &source) {
        Ok(program) => {
            print!("{}", disassemble(&program));
            Ok(())
        }
        Err(err) => {
            host.stderr_line(&format!("compilation error: {}", err));
            Err(1)
        }
    }
}

fn print_usage(argv0: &str) {
    eprintln!("usage: {} [-d] <script> [arg] ...", argv0);
    eprintln!("options:");
    eprintln!("     -d dump byte codes");
}
