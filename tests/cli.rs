use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};

use tempfile::tempdir;

mod common;

fn snakebox() -> Command {
  Command::new(env!("CARGO_BIN_EXE_snakebox"))
}

#[test]
fn it_should_report_json_when_piped() {
  common::setup();

  let dir = tempdir().unwrap();
  let source = dir.path().join("main.py");
  fs::write(&source, "def f(n):\n a=0\n for i in range(n): a+=i\n print(a)\nf(5)\n").unwrap();

  let output = snakebox()
    .env("LOG_DIR", dir.path())
    .arg("--time")
    .arg("10")
    .arg("run")
    .arg(&source)
    .output()
    .unwrap();

  assert!(output.status.success());
  let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(json["status"], "success");
  assert_eq!(json["stdout"], "10");
  assert_eq!(json["memory_limit_enforced"], true);
}

#[test]
fn it_should_grade_against_expected_file() {
  common::setup();

  let dir = tempdir().unwrap();
  let source = dir.path().join("main.py");
  let expected = dir.path().join("main.ans");
  fs::write(&source, "print(sum([1, 2, 3]))\n").unwrap();
  fs::write(&expected, "6\n").unwrap();

  let output = snakebox()
    .env("LOG_DIR", dir.path())
    .args(["--json", "--time", "10", "run"])
    .arg(&source)
    .arg("--expected")
    .arg(&expected)
    .output()
    .unwrap();

  assert!(output.status.success());
  let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(json["verdict"], "pass");
}

#[test]
fn it_should_read_submission_from_stdin() {
  common::setup();

  let dir = tempdir().unwrap();
  let mut child = snakebox()
    .env("LOG_DIR", dir.path())
    .args(["--time", "10", "run", "-"])
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .spawn()
    .unwrap();
  child
    .stdin
    .take()
    .unwrap()
    .write_all(b"print(sum(range(4)))\nprint(max(3, 9))\n")
    .unwrap();
  let output = child.wait_with_output().unwrap();

  assert!(output.status.success());
  let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(json["status"], "success");
  assert_eq!(json["stdout"], "6\n9");
}

#[test]
fn it_should_reject_out_of_range_time_limit() {
  common::setup();

  let dir = tempdir().unwrap();
  let source = dir.path().join("main.py");
  fs::write(&source, "print(1)\n").unwrap();

  let output = snakebox()
    .env("LOG_DIR", dir.path())
    .args(["--time", "1e19", "run"])
    .arg(&source)
    .output()
    .unwrap();

  assert!(!output.status.success());
  let text = String::from_utf8_lossy(&output.stderr);
  assert!(text.contains("SnakeBox Config Error"), "{}", text);
}

#[test]
fn it_should_check_policy_only() {
  common::setup();

  let dir = tempdir().unwrap();
  let source = dir.path().join("main.py");
  fs::write(&source, "import os\n").unwrap();

  let output = snakebox()
    .env("LOG_DIR", dir.path())
    .args(["check"])
    .arg(&source)
    .output()
    .unwrap();

  assert!(output.status.success());
  let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(json["status"], "security_violation");
  assert_eq!(json["reason"], "Forbidden term detected: 'import'");
}

#[test]
fn it_should_fail_on_missing_file() {
  common::setup();

  let dir = tempdir().unwrap();
  let output = snakebox()
    .env("LOG_DIR", dir.path())
    .args(["run", "/definitely/not/here.py"])
    .output()
    .unwrap();

  assert!(!output.status.success());
  let text = String::from_utf8_lossy(&output.stderr);
  assert!(text.contains("SnakeBox CLI Error"), "{}", text);
}
