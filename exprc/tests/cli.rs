use std::path::PathBuf;
use std::process::Command;

fn run_exprc(args: &[&str]) -> (i32, String, String) {
    let exe = env!("CARGO_BIN_EXE_exprc");
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("..");
    let output = Command::new(exe)
        .current_dir(root)
        .env("NO_COLOR", "1")
        .args(args)
        .output()
        .expect("run exprc");
    let code = output.status.code().unwrap_or(-1);
    (
        code,
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    )
}

#[test]
fn check_accepts_a_valid_lambda() {
    let (code, stdout, _stderr) = run_exprc(&["check", "tests/programs/add.json"]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "ok");
}

#[test]
fn run_prints_the_result() {
    let (code, stdout, stderr) = run_exprc(&["run", "tests/programs/add.json", "--args", "[41]"]);
    assert_eq!(code, 0, "stderr was: {stderr}");
    assert_eq!(stdout.trim(), "42");
}

#[test]
fn run_lifted_addition_with_null() {
    let (code, stdout, _stderr) = run_exprc(&[
        "run",
        "tests/programs/lifted_add.json",
        "--args",
        "[null, 2]",
    ]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "null");

    let (code, stdout, _stderr) = run_exprc(&[
        "run",
        "tests/programs/lifted_add.json",
        "--args",
        "[3, 4]",
    ]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "7");
}

#[test]
fn run_rejects_wrong_argument_count() {
    let (code, _stdout, stderr) = run_exprc(&["run", "tests/programs/add.json", "--args", "[1, 2]"]);
    assert_ne!(code, 0);
    assert!(stderr.contains("expected 1 arguments, got 2"), "stderr was: {stderr:?}");
}

#[test]
fn disasm_prints_the_entry_function() {
    let (code, stdout, _stderr) = run_exprc(&["disasm", "tests/programs/add.json"]);
    assert_eq!(code, 0);
    assert!(stdout.contains(".function inc(i32) -> i32"), "stdout was: {stdout:?}");
    assert!(stdout.contains("ldarg 0"));
}

#[test]
fn tail_calls_flag_marks_calls_in_tail_position() {
    let (code, stdout, _stderr) = run_exprc(&["disasm", "tests/programs/max.json"]);
    assert_eq!(code, 0);
    assert!(!stdout.contains("tail."), "stdout was: {stdout:?}");

    let (code, stdout, _stderr) = run_exprc(&[
        "--tail-calls",
        "always",
        "disasm",
        "tests/programs/max.json",
    ]);
    assert_eq!(code, 0);
    assert!(stdout.contains("tail.call"), "stdout was: {stdout:?}");
}

#[test]
fn check_reports_unknown_members() {
    let (code, _stdout, stderr) = run_exprc(&["check", "tests/programs/unknown_method.json"]);
    assert_ne!(code, 0);
    assert!(stderr.contains("unknown method `Math.Nope`"), "stderr was: {stderr:?}");
}

#[test]
fn check_reports_malformed_input() {
    let (code, _stdout, stderr) = run_exprc(&["check", "tests/programs/malformed.json"]);
    assert_ne!(code, 0);
    assert!(stderr.contains("failed to parse"), "stderr was: {stderr:?}");
}
