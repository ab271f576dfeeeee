//! CLI integration tests

use std::process::Command;

fn fleetctl() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_fleetctl"));
    command.env_remove("FLEET_API_URL");
    command
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = fleetctl()
        .arg("--help")
        .output()
        .expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("Fleet Agent"), "Should show app name");
    assert!(stdout.contains("status"), "Should show status command");
    assert!(stdout.contains("update"), "Should show update command");
    assert!(stdout.contains("download"), "Should show download command");
    assert!(stdout.contains("containers"), "Should show containers command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = fleetctl()
        .arg("--version")
        .output()
        .expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("fleetctl"), "Should show binary name");
}

#[test]
fn test_update_help_lists_selectors() {
    let output = fleetctl()
        .args(["update", "--help"])
        .output()
        .expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Update help should succeed");
    assert!(stdout.contains("--images"), "Should show images option");
    assert!(stdout.contains("--names"), "Should show names option");
}

/// An unreachable agent is reported as a failure, not a panic
#[test]
fn test_unreachable_agent_fails_cleanly() {
    let output = fleetctl()
        .args(["--api-url", "http://127.0.0.1:9", "containers"])
        .output()
        .expect("Failed to execute command");

    let stderr = String::from_utf8_lossy(&output.stderr);

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr.contains("Failed to send request"), "stderr: {stderr}");
}
