use assert_cmd::Command;
use predicates::prelude::*;

fn droidrpc() -> Command {
    let mut cmd = Command::cargo_bin("droidrpc").unwrap();
    // Keep the user's config out of the tests.
    cmd.env("DROIDRPC_CONFIG", std::env::temp_dir().join("droidrpc-cli-test-missing.json"));
    cmd
}

#[test]
fn test_help_exits_zero() {
    droidrpc()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("droidrpc"))
        .stdout(predicate::str::contains("--iterations"));
}

#[test]
fn test_missing_ports_is_usage_error() {
    droidrpc().arg("10.0.0.5").assert().failure().code(2);
}

#[test]
fn test_all_invalid_ports_is_usage_error() {
    droidrpc()
        .args(["10.0.0.5", "abc", "99999"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("at least one valid port"));
}

#[test]
fn test_missing_library_is_engine_error() {
    droidrpc()
        .args(["--library", "/nonexistent/libmytrpc.so", "10.0.0.5", "7101"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Failed to load engine library"));
}

#[test]
fn test_dry_run_reports_each_device() {
    droidrpc()
        .args(["--dry-run", "--iterations", "0", "10.0.0.5", "7101", "nope", "7102"])
        .assert()
        .success()
        .stdout(predicate::str::contains("10.0.0.5:7101: completed 0 iterations"))
        .stdout(predicate::str::contains("10.0.0.5:7102: completed 0 iterations"));
}

#[test]
fn test_dry_run_json_reports() {
    let assert = droidrpc()
        .args(["--dry-run", "--json", "-n", "0", "10.0.0.5", "7101"])
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let report: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(report["key"]["port"], 7101);
    assert_eq!(report["outcome"]["status"], "completed");
}
