use std::fs;
use std::path::{Path, PathBuf};

use oyc::{compile, Host, Value, Vm};

/// Reads scripts from the real filesystem (so `require` exercises relative
/// path resolution) while capturing `trace` output for comparison.
struct GoldenHost {
    out: String,
}

impl Host for GoldenHost {
    fn load(&mut self, path: &Path) -> Result<String, String> {
        fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))
    }

    fn write_line(&mut self, text: &str) {
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn stderr_line(&mut self, _text: &str) {}
}

fn normalize(s: &str) -> String {
    s.replace("\r\n", "\n").trim_end().to_string()
}

fn collect_scripts(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), String> {
    for entry in fs::read_dir(dir).map_err(|e| e.to_string())? {
        let path = entry.map_err(|e| e.to_string())?.path();
        if path.is_dir() {
            collect_scripts(&path, out)?;
            continue;
        }
        if path.extension().map(|e| e == "oyc").unwrap_or(false) {
            out.push(path);
        }
    }
    Ok(())
}

fn script_key(scripts_dir: &Path, path: &Path) -> Result<String, String> {
    let rel = path.strip_prefix(scripts_dir).map_err(|e| e.to_string())?;
    let mut key = rel.to_string_lossy().replace('\\', "_").replace('/', "_");
    if key.ends_with(".oyc") {
        key.truncate(key.len() - 4);
    }
    Ok(key)
}

#[test]
fn golden_scripts() -> Result<(), String> {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let scripts_dir = root.join("tests").join("scripts");
    let expected_dir = root.join("tests").join("expected");
    let argv_dir = root.join("tests").join("argv");

    let mut entries = Vec::new();
    collect_scripts(&scripts_dir, &mut entries)?;
    entries.sort();

    for script_path in entries {
        let key = script_key(&scripts_dir, &script_path)?;
        let expected_path = expected_dir.join(format!("{}.out", key));
        let expected = normalize(
            &fs::read_to_string(&expected_path)
                .map_err(|e| format!("missing expected output for {}: {}", key, e))?,
        );

        let argv_path = argv_dir.join(format!("{}.args", key));
        let args: Vec<String> = if argv_path.exists() {
            fs::read_to_string(&argv_path)
                .map_err(|e| e.to_string())?
                .split_whitespace()
                .map(|s| s.to_string())
                .collect()
        } else {
            Vec::new()
        };

        let mut host = GoldenHost { out: String::new() };
        let source = host.load(&script_path)?;
        let program =
            compile(&script_path.to_string_lossy(), &source).map_err(|e| format!("{}", e))?;
        let argv = args
            .iter()
            .map(|s| Value::Str(s.as_str().into()))
            .collect();

        let mut vm = Vm::new(&mut host);
        vm.run(&program, argv).map_err(|e| format!("{}", e))?;

        let got = normalize(&host.out);
        if got != expected {
            return Err(format!(
                "output mismatch for {}: expected '{}' got '{}'",
                key, expected, got
            ));
        }
    }
    Ok(())
}
