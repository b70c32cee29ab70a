use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

fn fang() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_fang"));
    cmd.env("RUST_LOG", "info");
    cmd
}

fn run_stdin(args: &[&str], source: &str) -> Output {
    let mut child = fang()
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to run fang");
    child.stdin.take().unwrap().write_all(source.as_bytes()).unwrap();
    child.wait_with_output().expect("failed to wait for fang")
}

fn run_file(path: &Path, args: &[&str]) -> Output {
    fang().args(args).arg(path).output().expect("failed to run fang")
}

fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, text).unwrap();
    path
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

// --- Scenarios ---

#[test]
fn print_addition() {
    let out = run_stdin(&[], "print 2 + 2;");
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "dbg print :: 4\n");
}

#[test]
fn while_loop_prints_each_iteration() {
    let out = run_stdin(&[], "let i = 0; while (i < 3) { print i; i += 1; }");
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "dbg print :: 0\ndbg print :: 1\ndbg print :: 2\n");
}

#[test]
fn dash_reads_stdin() {
    let out = run_stdin(&["-"], "print \"hi\";");
    assert_eq!(stdout(&out), "dbg print :: hi\n");
}

#[test]
fn import_cycle_fails_before_running() {
    let dir = tempfile::tempdir().unwrap();
    let a = write(dir.path(), "a.fang", "print 1; use \"b.fang\";");
    write(dir.path(), "b.fang", "use \"a.fang\"; print 2;");

    let out = run_file(&a, &[]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stdout(&out).is_empty(), "unexpected output: {}", stdout(&out));
    assert!(stderr(&out).contains("compiler: Cycle."), "stderr: {}", stderr(&out));
}

#[test]
fn arity_mismatch_is_a_compile_error() {
    let out = run_stdin(&[], "fn add(a, b) { return a + b; } print add(1);");
    assert_eq!(out.status.code(), Some(1));
    assert!(stdout(&out).is_empty());
    assert!(stderr(&out).contains("compiler: Function 'add' requires 2 arguments."), "stderr: {}", stderr(&out));
}

#[test]
fn break_outside_loop_is_a_labeler_error() {
    let out = run_stdin(&[], "break;");
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("loop_labeler: 'break' statement outside the loop"), "stderr: {}", stderr(&out));
}

#[test]
fn parse_error_reports_parser_component() {
    let out = run_stdin(&[], "print 1");
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("parser: Expected ';' after 'print' statement."), "stderr: {}", stderr(&out));
}

#[test]
fn runtime_error_exits_255_after_earlier_output() {
    let out = run_stdin(&[], "print 1;\nprint 1 + \"a\";");
    assert_eq!(out.status.code(), Some(255));
    assert_eq!(stdout(&out), "dbg print :: 1\n");
    let err = stderr(&out);
    assert!(err.contains("vm: cannot '+' objects of types: 'number' and 'string'"), "stderr: {err}");
    assert!(err.contains(":2:7"), "expected a location on line 2: {err}");
}

#[test]
fn failed_assertion() {
    let out = run_stdin(&[], "assert 1 == 2;");
    assert_eq!(out.status.code(), Some(255));
    assert!(stderr(&out).contains("vm: assertion failed"));
}

// --- Modules ---

#[test]
fn repeated_import_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "lib.fang", "let base = 40; print \"lib loaded\";");
    write(dir.path(), "mid.fang", "use \"lib.fang\"; let two = 2;");
    let main = write(dir.path(), "main.fang", "use \"lib.fang\"; use \"mid.fang\"; print base + two;");

    let out = run_file(&main, &[]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "dbg print :: lib loaded\ndbg print :: 42\n");
    let err = stderr(&out);
    assert_eq!(err.matches("using cached import for:").count(), 1, "stderr: {err}");
    assert!(err.contains("lib.fang"), "stderr: {err}");
}

#[test]
fn diamond_import_runs_shared_module_once() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "shared.fang", "let count = 0; fn bump() { count += 1; return count; } print \"shared\";");
    write(dir.path(), "left.fang", "use \"shared.fang\"; let l = bump();");
    write(dir.path(), "right.fang", "use \"shared.fang\"; let r = bump();");
    let main = write(dir.path(), "main.fang", "use \"left.fang\"; use \"right.fang\"; print l; print r;");

    let out = run_file(&main, &[]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "dbg print :: shared\ndbg print :: 1\ndbg print :: 2\n");
}

#[test]
fn error_in_imported_module_points_at_that_file() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "lib.fang", "let x = missing;");
    let main = write(dir.path(), "main.fang", "use \"lib.fang\"; print x;");

    let out = run_file(&main, &[]);
    assert_eq!(out.status.code(), Some(1));
    let err = stderr(&out);
    assert!(err.contains("compiler: Variable 'missing' is not defined."), "stderr: {err}");
    assert!(err.contains("lib.fang:1:9"), "stderr: {err}");
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let out = run_file(&dir.path().join("nope.fang"), &[]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).starts_with("io: cannot read"), "stderr: {}", stderr(&out));
}

// --- Language ---

#[test]
fn structs_pointers_and_methods() {
    let src = "struct Point { x; y; }
        impl Point { fn norm1(self) { return self.x + self.y; } }
        let p = Point { x: 1, y: 2 };
        let px = &p.x;
        *px = 10;
        print p;
        print p.norm1();
        print p == Point { x: 10, y: 2 };";
    let out = run_stdin(&[], src);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "dbg print :: Point { x: 10, y: 2 }\ndbg print :: 12\ndbg print :: true\n");
}

#[test]
fn decorators_and_closures() {
    let src = "fn twice(f) { fn run(x) { return f(f(x)); } return run; }
        @twice fn inc(x) { return x + 1; }
        print inc(5);";
    let out = run_stdin(&[], src);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "dbg print :: 7\n");
}

// --- Flags ---

#[test]
fn json_diagnostics() {
    let out = run_stdin(&["--json"], "print nope;");
    assert_eq!(out.status.code(), Some(1));
    let line = stderr(&out);
    let line = line.lines().last().unwrap();
    let v: serde_json::Value = serde_json::from_str(line).expect("valid JSON diagnostic");
    assert_eq!(v["component"], "compiler");
    assert_eq!(v["message"], "Variable 'nope' is not defined.");
    assert_eq!(v["span"]["line"], 1);
}

#[test]
fn ast_flag_prints_labeled_tree() {
    let out = run_stdin(&["--ast"], "while (true) { break; }");
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let v: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("AST JSON");
    let text = v.to_string();
    assert!(text.contains("While"), "got: {text}");
    assert!(text.contains("Break"), "got: {text}");
}

#[test]
fn tokens_flag_lists_tokens() {
    let out = run_stdin(&["--tokens"], "let x = 1;");
    assert!(out.status.success());
    assert!(stdout(&out).contains("Let"));
    assert!(stdout(&out).contains("Ident(\"x\")"));
}

#[test]
fn disassemble_then_run() {
    let out = run_stdin(&["--disassemble"], "fn f() { return 1; } print f();");
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let text = stdout(&out);
    assert!(text.contains("== <module <stdin>> =="), "got: {text}");
    assert!(text.contains("== f =="), "got: {text}");
    assert!(text.ends_with("dbg print :: 1\n"), "got: {text}");
}

#[test]
fn dump_stack_after_run() {
    let src = "let x = 1; x + 2; fn f(a) { a * 2; return a; } f(3); while (x < 3) { x += 1; }";
    let out = run_stdin(&["--dump-stack"], src);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "final stack: []\n");
}
