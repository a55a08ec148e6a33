use std::collections::HashMap;
use std::path::{Path, PathBuf};

use oyc::{compile, Host, Value, Vm};

/// In-memory host: script sources come from a map keyed by resolved path,
/// `trace` output accumulates in a string.
struct MemoryHost {
    files: HashMap<PathBuf, String>,
    out: String,
}

impl Host for MemoryHost {
    fn load(&mut self, path: &Path) -> Result<String, String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| format!("cannot read {}", path.display()))
    }

    fn write_line(&mut self, text: &str) {
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn stderr_line(&mut self, _text: &str) {}
}

fn run_with(
    source: &str,
    args: &[&str],
    files: HashMap<PathBuf, String>,
) -> Result<(Value, String), String> {
    let program = compile("main.oyc", source).map_err(|e| e.to_string())?;
    let mut host = MemoryHost {
        files,
        out: String::new(),
    };
    let argv = args.iter().map(|s| Value::Str((*s).into())).collect();
    let mut vm = Vm::new(&mut host);
    let value = vm.run(&program, argv).map_err(|e| e.to_string())?;
    Ok((value, host.out))
}

fn run(source: &str) -> Result<(Value, String), String> {
    run_with(source, &[], HashMap::new())
}

fn run_value(source: &str) -> Value {
    run(source).expect("script should succeed").0
}

fn run_output(source: &str) -> String {
    run(source).expect("script should succeed").1
}

fn run_error(source: &str) -> String {
    match run(source) {
        Ok((value, _)) => panic!("expected an error, got {:?}", value),
        Err(message) => message,
    }
}

fn as_int(value: Value) -> i64 {
    match value {
        Value::Int(v) => v,
        other => panic!("expected int, got {:?}", other),
    }
}

// ----------------- arithmetic and casts -----------------

#[test]
fn int_arithmetic_wraps_at_64_bits() {
    assert_eq!(as_int(run_value("return 9223372036854775807 + 1;")), i64::MIN);
    assert_eq!(as_int(run_value("return -9223372036854775808;")), i64::MIN);
    assert_eq!(as_int(run_value("return 7 / 2;")), 3);
    assert_eq!(as_int(run_value("return -7 / 2;")), -3);
    assert_eq!(as_int(run_value("return 7 % 3;")), 1);
    assert_eq!(as_int(run_value("return 1 << 4;")), 16);
    assert_eq!(as_int(run_value("return 0xff & 0x0f;")), 0x0f);
}

#[test]
fn mixed_numeric_operands_promote_to_float() {
    match run_value("return 1 + 0.5;") {
        Value::Float(v) => assert_eq!(v, 1.5),
        other => panic!("expected float, got {:?}", other),
    }
    match run_value("return 1.0 / 0;") {
        Value::Float(v) => assert!(v.is_infinite()),
        other => panic!("expected float, got {:?}", other),
    }
}

#[test]
fn int_division_by_zero_is_an_error() {
    let message = run_error("return 1 / 0;");
    assert!(message.contains("divide by zero"), "{}", message);
    let message = run_error("return 1 % 0;");
    assert!(message.contains("divide by zero"), "{}", message);
}

#[test]
fn string_concatenation_requires_two_strings() {
    match run_value("return \"foo\" + \"bar\";") {
        Value::Str(s) => assert_eq!(&*s, "foobar"),
        other => panic!("expected str, got {:?}", other),
    }
    let message = run_error("return \"foo\" + 1;");
    assert!(message.contains("incompatible"), "{}", message);
}

#[test]
fn casts_follow_the_documented_table() {
    assert_eq!(as_int(run_value("return int(1.9);")), 1);
    assert_eq!(as_int(run_value("return int(-1.9);")), -1);
    assert_eq!(as_int(run_value("return int(\" 42 \");")), 42);
    match run_value("return float(str(1.25));") {
        Value::Float(v) => assert_eq!(v, 1.25),
        other => panic!("expected float, got {:?}", other),
    }
    match run_value("return str(int(\"100\"));") {
        Value::Str(s) => assert_eq!(&*s, "100"),
        other => panic!("expected str, got {:?}", other),
    }

    let message = run_error("return int(\"abc\");");
    assert!(message.contains("cannot parse"), "{}", message);
    let message = run_error("return float(\"abc\");");
    assert!(message.contains("cannot parse"), "{}", message);
}

#[test]
fn bool_cast_truthiness() {
    let out = run_output(
        "trace(bool(null), bool(0), bool(0.0), bool(\"\"), bool(\"x\"), bool([] {}), bool(struct {}));",
    );
    assert_eq!(out, "false false false false true true true\n");
}

#[test]
fn typeof_names_cover_all_value_kinds() {
    let out = run_output(
        "auto st = struct {};\n\
         trace(typeof(null), typeof(true), typeof(1), typeof(1.0), typeof(\"s\"));\n\
         trace(typeof([] {}), typeof(st), typeof(() {}), typeof(st.missing));",
    );
    assert_eq!(
        out,
        "\"null\" \"bool\" \"int\" \"float\" \"str\"\n\"array\" \"struct\" \"closure\" \"void\"\n"
    );
}

// ----------------- arrays -----------------

#[test]
fn array_writes_extend_and_null_fill() {
    let (value, _) = run("auto a = [] {}; a[0] = 1; a[3] = 9; return a;").unwrap();
    assert_eq!(value.display_string(), "[] {1, null, null, 9}");
}

#[test]
fn array_append_law() {
    let (value, _) = run(
        "auto a = [] {1, 2};\n\
         a[sizeof(a)] = 3;\n\
         return sizeof(a) * 100 + int(a[2]);",
    )
    .unwrap();
    assert_eq!(as_int(value), 303);
}

#[test]
fn array_delete_truncates_the_tail() {
    let (value, _) = run("auto a = [] {0, 1, 2, 3, 4, 5}; delete a[3]; return a;").unwrap();
    assert_eq!(value.display_string(), "[] {0, 1, 2}");
}

#[test]
fn array_out_of_range_read_is_void() {
    let out = run_output("auto a = [] {1}; trace(typeof(a[7]));");
    assert_eq!(out, "\"void\"\n");
}

#[test]
fn negative_array_index_is_an_error() {
    let message = run_error("auto a = [] {1}; return a[0 - 1];");
    assert!(message.contains("non-negative"), "{}", message);
}

#[test]
fn strings_are_not_indexable() {
    let message = run_error("return \"abc\"[0];");
    assert!(message.contains("cannot index"), "{}", message);
}

// ----------------- structs -----------------

#[test]
fn struct_insertion_order_survives_overwrite() {
    let (value, _) = run(
        "auto s = struct {.a = 1, .b = 2};\n\
         s.a = 10;\n\
         s.c = 3;\n\
         return s;",
    )
    .unwrap();
    assert_eq!(
        value.display_string(),
        "struct {[\"a\"] = 10, [\"b\"] = 2, [\"c\"] = 3}"
    );
}

#[test]
fn struct_delete_closes_the_order() {
    let (value, _) = run("auto s = struct {.a = 1, .b = 2, .c = 3}; delete s.b; return s;")
        .unwrap();
    assert_eq!(value.display_string(), "struct {[\"a\"] = 1, [\"c\"] = 3}");
}

#[test]
fn int_and_string_keys_are_distinct() {
    let (value, _) = run(
        "auto s = struct {};\n\
         s[1] = \"int key\";\n\
         s[\"1\"] = \"str key\";\n\
         return s;",
    )
    .unwrap();
    assert_eq!(
        value.display_string(),
        "struct {[1] = \"int key\", [\"1\"] = \"str key\"}"
    );
}

#[test]
fn missing_key_reads_void_and_void_compares_equal() {
    let out = run_output("auto s = struct {.a = null}; trace(typeof(s.a), typeof(s.b));");
    assert_eq!(out, "\"null\" \"void\"\n");

    // both sides absent: void == void
    let (value, _) = run("auto s = struct {}; return s.a == s.b;").unwrap();
    assert!(matches!(value, Value::Bool(true)));
}

#[test]
fn storing_void_is_a_type_error() {
    let message = run_error("auto s = struct {}; auto a = [] {}; a[0] = s.missing;");
    assert!(message.contains("incompatible"), "{}", message);
}

// ----------------- closures and upvalues -----------------

#[test]
fn closures_share_upvalue_cells() {
    let (value, _) = run(
        "auto make = () {\n\
             auto n = 0;\n\
             return [] {\n\
                 () { n += 1; return n; },\n\
                 () { return n; }\n\
             };\n\
         };\n\
         auto pair = make();\n\
         pair[0]();\n\
         pair[0]();\n\
         return pair[1]();",
    )
    .unwrap();
    assert_eq!(as_int(value), 2);
}

#[test]
fn each_call_creates_distinct_closures() {
    let out = run_output(
        "auto mk = () { return () { return 0; }; };\n\
         auto a = mk();\n\
         auto b = mk();\n\
         trace(a == b, a == a);",
    );
    assert_eq!(out, "false true\n");
}

#[test]
fn block_locals_get_fresh_cells_each_iteration() {
    let (value, _) = run(
        "auto fns = [] {};\n\
         for (auto i = 0; i < 3; i++) {\n\
             auto x = i * 10;\n\
             fns[i] = () { return x; };\n\
         }\n\
         return fns[0]() + fns[1]() + fns[2]();",
    )
    .unwrap();
    assert_eq!(as_int(value), 30);
}

#[test]
fn missing_arguments_are_null_and_extras_are_dropped() {
    let out = run_output(
        "auto f = (auto x, auto y) { return typeof(y); };\n\
         trace(f(1), f(1, 2, 3));",
    );
    assert_eq!(out, "\"null\" \"int\"\n");
}

#[test]
fn calling_a_non_closure_is_a_type_error() {
    let message = run_error("auto x = 3; return x();");
    assert!(message.contains("not callable"), "{}", message);
}

#[test]
fn deep_recursion_overflows_the_stack() {
    let message = run_error("auto f = (auto g) { return g(g); }; return f(f);");
    assert!(message.contains("stack overflow"), "{}", message);
}

// ----------------- statements -----------------

#[test]
fn increment_decrement_semantics() {
    let (value, _) = run("auto i = 1; auto j = i++ + ++i; return j * 10 + i;").unwrap();
    // i++ yields 1 (i becomes 2), ++i yields 3; j = 4, i = 3
    assert_eq!(as_int(value), 43);
}

#[test]
fn comma_and_ternary() {
    assert_eq!(as_int(run_value("return (1, 2);")), 2);
    assert_eq!(as_int(run_value("return 0 ? 1 : 2;")), 2);
    assert_eq!(as_int(run_value("auto x = 5; return x > 3 ? x : 0;")), 5);
}

#[test]
fn compound_assignment_on_container_slots() {
    let (value, _) = run(
        "auto a = [] {1, 2};\n\
         a[0] += 10;\n\
         auto s = struct {.n = 5};\n\
         s.n *= 3;\n\
         return a[0] * 100 + s.n;",
    )
    .unwrap();
    assert_eq!(as_int(value), 1115);
}

#[test]
fn foreach_over_struct_snapshots_keys() {
    let (value, _) = run(
        "auto st = struct {.a = 1, .b = 2, .c = 3};\n\
         auto keys = [] {};\n\
         foreach (auto k, v : st) {\n\
             keys[sizeof(keys)] = k;\n\
             delete st.b;\n\
         }\n\
         return keys;",
    )
    .unwrap();
    // b is deleted during the first step, so the snapshot skips it
    assert_eq!(value.display_string(), "[] {\"a\", \"c\"}");
}

#[test]
fn foreach_over_array_sees_live_growth() {
    let (value, _) = run(
        "auto a = [] {1, 2};\n\
         auto n = 0;\n\
         foreach (auto i, v : a) {\n\
             n += 1;\n\
             if (i == 0)\n\
                 a[2] = 3;\n\
         }\n\
         return n;",
    )
    .unwrap();
    assert_eq!(as_int(value), 3);
}

#[test]
fn switch_matches_with_value_equality() {
    let out = run_output(
        "switch (\"b\") {\n\
         case \"a\":\n\
             trace(\"a\");\n\
             break;\n\
         case \"b\":\n\
             trace(\"b\");\n\
             break;\n\
         default:\n\
             trace(\"d\");\n\
         }",
    );
    assert_eq!(out, "\"b\"\n");
}

#[test]
fn if_init_scope_covers_the_construct() {
    let out = run_output("if (auto n = 2; n > 1) trace(n); else trace(0);");
    assert_eq!(out, "2\n");

    let message = run_error("if (auto n = 2; n > 1) trace(n); trace(n);");
    assert!(message.contains("not found"), "{}", message);
}

// ----------------- compile errors -----------------

#[test]
fn redeclaration_in_same_scope_is_rejected() {
    let message = run_error("auto x = 1; auto x = 2;");
    assert!(message.contains("already declared"), "{}", message);
}

#[test]
fn shadowing_in_a_nested_block_is_allowed() {
    let out = run_output("auto x = 1; { auto x = 2; trace(x); } trace(x);");
    assert_eq!(out, "2\n1\n");
}

#[test]
fn undefined_names_are_compile_errors() {
    let message = run_error("return nope;");
    assert!(message.contains("not found"), "{}", message);
}

#[test]
fn break_and_continue_need_an_enclosing_construct() {
    assert!(run_error("break;").contains("outside"));
    assert!(run_error("continue;").contains("outside"));
    // break is legal in a switch, continue is not
    assert!(run_error("switch (1) { case 1: continue; }").contains("outside"));
}

#[test]
fn assignment_needs_an_lvalue() {
    assert!(run_error("1 = 2;").contains("not assignable"));
    assert!(run_error("trace = 2;").contains("not assignable"));
}

#[test]
fn lexer_rejects_bad_input() {
    assert!(run_error("auto s = \"unterminated;").contains("unterminated"));
    assert!(run_error("auto x = 1 @ 2;").contains("unexpected character"));
    assert!(run_error("/* never closed").contains("unterminated block comment"));
}

#[test]
fn string_escapes_and_adjacent_literal_concatenation() {
    // `\x41` is 'A'; adjacent literals concatenate before compilation
    let out = run_output("trace(\"a\\tb\" \"\\x41\\0\");");
    assert_eq!(out, "\"a\\tbA\\0\"\n");
}

// ----------------- require -----------------

fn lib_files(entries: &[(&str, &str)]) -> HashMap<PathBuf, String> {
    entries
        .iter()
        .map(|(path, src)| (PathBuf::from(path), src.to_string()))
        .collect()
}

#[test]
fn require_runs_in_the_same_vm_and_returns_the_script_result() {
    let files = lib_files(&[("lib.oyc", "return argv[0] * 2;")]);
    let (value, _) = run_with("return require(\"lib.oyc\", 21);", &[], files).unwrap();
    assert_eq!(as_int(value), 42);
}

#[test]
fn require_without_a_return_yields_null() {
    let files = lib_files(&[("lib.oyc", "auto unused = 1;")]);
    let (value, _) = run_with("return typeof(require(\"lib.oyc\"));", &[], files).unwrap();
    match value {
        Value::Str(s) => assert_eq!(&*s, "null"),
        other => panic!("expected str, got {:?}", other),
    }
}

#[test]
fn require_resolves_relative_to_the_requiring_script() {
    let files = lib_files(&[
        ("sub/inner.oyc", "return require(\"peer.oyc\") + 1;"),
        ("sub/peer.oyc", "return 10;"),
    ]);
    let (value, _) = run_with("return require(\"sub/inner.oyc\");", &[], files).unwrap();
    assert_eq!(as_int(value), 11);
}

#[test]
fn require_recompiles_every_time() {
    let files = lib_files(&[("lib.oyc", "return 7;")]);
    let (value, _) = run_with(
        "return require(\"lib.oyc\") + require(\"lib.oyc\");",
        &[],
        files,
    )
    .unwrap();
    assert_eq!(as_int(value), 14);
}

#[test]
fn circular_require_is_detected() {
    let files = lib_files(&[("lib.oyc", "return require(\"main.oyc\");")]);
    let message = match run_with("return require(\"lib.oyc\");", &[], files) {
        Ok(_) => panic!("expected circular require error"),
        Err(message) => message,
    };
    assert!(message.contains("circular"), "{}", message);
}

#[test]
fn errors_in_required_scripts_propagate() {
    let files = lib_files(&[("lib.oyc", "return 1 / 0;")]);
    let message = match run_with("return require(\"lib.oyc\");", &[], files) {
        Ok(_) => panic!("expected propagated error"),
        Err(message) => message,
    };
    assert!(message.contains("divide by zero"), "{}", message);
    assert!(message.contains("lib.oyc"), "{}", message);
}

#[test]
fn host_argv_reaches_the_top_level_script() {
    let (value, _) = run_with("return argv[0] + argv[1];", &["ab", "cd"], HashMap::new())
        .unwrap();
    match value {
        Value::Str(s) => assert_eq!(&*s, "abcd"),
        other => panic!("expected str, got {:?}", other),
    }
}

#[test]
fn trace_result_is_void() {
    let out = run_output("auto x = trace(\"hi\"); trace(typeof(x));");
    assert_eq!(out, "\"hi\"\n\"void\"\n");
}

#[test]
fn uninitialized_locals_hold_void_until_assigned() {
    let out = run_output("auto x; trace(typeof(x)); x = 5; trace(typeof(x), x);");
    assert_eq!(out, "\"void\"\n\"int\" 5\n");

    // a declaration list may mix initialized and bare names
    let out = run_output("auto a = 1, b; trace(a, typeof(b));");
    assert_eq!(out, "1 \"void\"\n");
}

#[test]
fn reading_an_unassigned_local_is_a_type_error() {
    let message = run_error("auto x; auto y = x;");
    assert!(message.contains("incompatible"), "{}", message);
}
