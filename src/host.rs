use std::path::Path;

/// Everything the compiler/VM core needs from the outside world: reading
/// script sources and two output sinks. The CLI uses [`FsHost`]; tests plug
/// in capturing hosts.
pub trait Host {
    fn load(&mut self, path: &Path) -> Result<String, String>;
    fn write_line(&mut self, text: &str);
    fn stderr_line(&mut self, text: &str);
}

/// The standard host: filesystem sources, stdout for `trace`, stderr for
/// diagnostics.
pub struct FsHost;

impl Host for FsHost {
    fn load(&mut self, path: &Path) -> Result<String, String> {
        std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))
    }

    fn write_line(&mut self, text: &str) {
        println!("{}", text);
    }

    fn stderr_line(&mut self, text: &str) {
        eprintln!("{}", text);
    }
}
