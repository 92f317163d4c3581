// ABOUTME: Command-line behaviour of the mpr-exchange binary
// ABOUTME: Argument validation and config loading, all of which fail before any connection is made

use std::process::{Command, Output};
use tempfile::tempdir;

fn exchange(args: &[&str]) -> Output {
    let bin_path = env!("CARGO_BIN_EXE_mpr-exchange");
    Command::new(bin_path)
        .args(args)
        .env_remove("MPR_EXCHANGE_SOURCE")
        .env_remove("MPR_EXCHANGE_DESTINATION")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute command")
}

#[test]
fn test_missing_connection_strings_print_usage() {
    let output = exchange(&[]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("the --source connection string is required"));
    assert!(stderr.contains("Usage: mpr-exchange"));
    assert!(stderr.contains("--destination"));
    // stdout is reserved for JSON events.
    assert!(output.stdout.is_empty());
}

#[test]
fn test_missing_destination_prints_usage() {
    let output = exchange(&["--source", "postgresql://localhost/source"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("the --destination connection string is required"));
}

#[test]
fn test_blank_source_is_rejected() {
    let output = exchange(&[
        "--source",
        "   ",
        "--destination",
        "postgresql://localhost/destination",
    ]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_malformed_connection_string_is_rejected() {
    let output = exchange(&[
        "--source",
        "postgresql://localhost:notaport/source",
        "--destination",
        "postgresql://localhost/destination",
    ]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid --source connection string"));
}

#[test]
fn test_missing_config_file_fails_before_connecting() {
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("exchange.toml");
    let output = exchange(&[
        "--source",
        "postgresql://localhost/source",
        "--destination",
        "postgresql://localhost/destination",
        "--config",
        config_path.to_str().unwrap(),
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"));
}

#[test]
fn test_invalid_config_file_is_reported() {
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("exchange.toml");
    std::fs::write(&config_path, "[destination]\nschema = \"\"\n").unwrap();
    let output = exchange(&[
        "--source",
        "postgresql://localhost/source",
        "--destination",
        "postgresql://localhost/destination",
        "--config",
        config_path.to_str().unwrap(),
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Invalid config file"));
}

#[test]
fn test_help_lists_options() {
    let output = exchange(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--source"));
    assert!(stdout.contains("--destination"));
    assert!(stdout.contains("--event-format"));
}

#[test]
fn test_unknown_event_format_is_rejected() {
    let output = exchange(&["--event-format", "xml"]);
    assert_eq!(output.status.code(), Some(2));
}
