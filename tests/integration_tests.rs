mod common;

use assert_fs::prelude::*;
use assert_fs::TempDir;
use common::{assert_contains_all, mtime_of, write_with_mtime};
use predicates::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

/// Integration tests for treemirror CLI commands
/// These tests run the actual binary and verify its behavior

const QUIET_CONFIG: &str = r#"
logging:
  level: "info"
  color: false
display:
  console_progress: false
transfer:
  retry_delay: "10ms"
"#;

struct CliFixture {
    temp_dir: TempDir,
    config: PathBuf,
    log_file: PathBuf,
}

impl CliFixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = temp_dir.child("config.yml");
        config.write_str(QUIET_CONFIG).unwrap();
        let log_file = temp_dir.path().join("logs/sync.log");

        Self {
            config: config.path().to_path_buf(),
            log_file,
            temp_dir,
        }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.temp_dir.path().join(relative)
    }

    fn command(&self) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_treemirror"));
        command
            .arg("--config")
            .arg(&self.config)
            .arg("--log-file")
            .arg(&self.log_file);
        command
    }

    fn run(&self, args: &[&str]) -> Output {
        self.command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .expect("Failed to execute command")
    }

    fn log(&self) -> String {
        std::fs::read_to_string(&self.log_file).unwrap_or_default()
    }
}

fn path_arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_cli_help() {
    let output = Command::new(env!("CARGO_BIN_EXE_treemirror"))
        .arg("--help")
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains_all(&stdout, &["run", "doctor"]);
}

#[test]
fn test_cli_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_treemirror"))
        .arg("--version")
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("treemirror"));
}

#[test]
fn test_invalid_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_treemirror"))
        .arg("nonexistent-command")
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error") || stderr.contains("unrecognized"));
}

#[test]
fn test_run_mirrors_tree_without_watching() {
    let fixture = CliFixture::new();
    let source = fixture.path("source");
    let dest = fixture.path("dest");
    write_with_mtime(&source.join("a/b.txt"), "hello", 1_500_000_000);
    write_with_mtime(&source.join("build/skip.o"), "obj", 1_500_000_000);

    let output = fixture.run(&[
        "run",
        "--source",
        path_arg(&source),
        "--destination",
        path_arg(&dest),
        "--initial-sync",
        "--no-watch",
    ]);

    assert!(
        output.status.success(),
        "run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    fixture.temp_dir.child("dest/a/b.txt").assert("hello");
    fixture.temp_dir.child("dest/build").assert(predicate::path::missing());
    assert_eq!(mtime_of(&dest.join("a/b.txt")), 1_500_000_000);

    let log = fixture.log();
    assert_contains_all(&log, &["Initial sync completed", "exiting without monitoring"]);
    assert!(!log.contains("\u{1b}["), "log file must not contain ANSI escapes");
}

#[test]
fn test_resource_alias_and_log_is_appended() {
    let fixture = CliFixture::new();
    let source = fixture.path("share");
    let dest = fixture.path("local");
    write_with_mtime(&source.join("one.txt"), "1", 1_000);

    for _ in 0..2 {
        let output = fixture.run(&[
            "run",
            "--resource",
            path_arg(&source),
            "--destination",
            path_arg(&dest),
            "--initial-sync",
            "--no-watch",
        ]);
        assert!(output.status.success());
    }

    fixture.temp_dir.child("local/one.txt").assert("1");
    assert_eq!(fixture.log().matches("Initial sync completed").count(), 2);
}

#[test]
fn test_prompt_yes_skips_populated_destination() {
    let fixture = CliFixture::new();
    let source = fixture.path("source");
    let dest = fixture.path("dest");
    write_with_mtime(&source.join("fresh.txt"), "new", 1_000);
    write_with_mtime(&dest.join("kept.txt"), "old", 1_000);

    let mut child = fixture
        .command()
        .args([
            "run",
            "--source",
            path_arg(&source),
            "--destination",
            path_arg(&dest),
            "--no-watch",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn command");
    child.stdin.take().unwrap().write_all(b"y\n").unwrap();
    let output = child.wait_with_output().unwrap();

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Skip initial sync? (y/n)"));
    fixture.temp_dir.child("dest/fresh.txt").assert(predicate::path::missing());
    fixture.temp_dir.child("dest/kept.txt").assert("old");
}

#[test]
fn test_unreachable_source_exits_with_error() {
    let fixture = CliFixture::new();

    let output = fixture.run(&[
        "run",
        "--source",
        path_arg(&fixture.path("missing")),
        "--destination",
        path_arg(&fixture.path("dest")),
        "--initial-sync",
        "--no-watch",
    ]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not accessible"));
}

#[test]
fn test_doctor_command() {
    let fixture = CliFixture::new();
    fixture.temp_dir.child("source").create_dir_all().unwrap();

    let output = fixture.run(&[
        "doctor",
        "--source",
        path_arg(&fixture.path("source")),
        "--destination",
        path_arg(&fixture.path("dest")),
    ]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains_all(
        &stdout,
        &["System Diagnostics", "Source Directory", "Log File", "All checks passed"],
    );
}

#[test]
fn test_doctor_reports_missing_source() {
    let fixture = CliFixture::new();

    let output = fixture.run(&[
        "doctor",
        "--source",
        path_arg(&fixture.path("absent")),
        "--destination",
        path_arg(&fixture.path("dest")),
    ]);

    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains_all(&stdout, &["Source not accessible", "Some checks failed"]);
}

#[test]
fn test_error_handling_invalid_config() {
    let fixture = CliFixture::new();
    std::fs::write(&fixture.config, "invalid: yaml: content: [").unwrap();

    let output = fixture.run(&[
        "doctor",
        "--source",
        path_arg(&fixture.path("source")),
        "--destination",
        path_arg(&fixture.path("dest")),
    ]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("parse") || stderr.contains("config"));
}
