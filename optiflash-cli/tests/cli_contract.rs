//! Integration tests for core CLI contract behavior.

use {
    predicates::prelude::*,
    sha2::{Digest, Sha256},
    std::{fs, path::Path},
    tempfile::tempdir,
};

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::cargo::cargo_bin_cmd!("optiflash")
}

/// Command isolated from the user's configuration files.
fn isolated_cmd(dir: &Path) -> assert_cmd::Command {
    let config = dir.join("empty.toml");
    fs::write(&config, "").unwrap();

    let mut cmd = cli_cmd();
    cmd.current_dir(dir)
        .env_remove("OPTIFLASH_PORT")
        .env_remove("OPTIFLASH_BAUD")
        .env_remove("OPTIFLASH_TARGET")
        .arg("--config")
        .arg(config);
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("optiflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("optiflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn help_lists_subcommands() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("read"))
        .stdout(predicate::str::contains("write"))
        .stdout(predicate::str::contains("verify"))
        .stdout(predicate::str::contains("hash"));
}

#[test]
fn unknown_subcommand_exits_two() {
    cli_cmd().arg("frobnicate").assert().code(2);
}

#[test]
fn completions_bash_exits_zero() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("optiflash"));
}

#[test]
fn list_ports_json_returns_valid_json() {
    let output = cli_cmd()
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(value["ok"], serde_json::Value::Bool(true));
    assert!(value["data"]["ports"].is_array());
}

#[test]
fn hash_prints_sha256_of_decoded_image() {
    let dir = tempdir().unwrap();
    let hex = dir.path().join("app.hex");
    fs::write(&hex, ":020020000A0BC9\n:00000001FF\n").unwrap();

    let mut flash = vec![0xFF_u8; 0x10000];
    flash[0x20] = 0x0A;
    flash[0x21] = 0x0B;
    let expected: String = Sha256::digest(&flash)
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect();

    isolated_cmd(dir.path())
        .args(["-q", "hash"])
        .arg(&hex)
        .assert()
        .success()
        .stdout(format!("{expected}\n"));
}

#[test]
fn hash_of_malformed_hex_exits_one() {
    let dir = tempdir().unwrap();
    let hex = dir.path().join("bad.hex");
    fs::write(&hex, ":04000000AABBCCDD00\n").unwrap();

    isolated_cmd(dir.path())
        .arg("hash")
        .arg(&hex)
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("checksum"));
}

#[test]
fn hash_of_missing_file_exits_one() {
    let dir = tempdir().unwrap();

    isolated_cmd(dir.path())
        .args(["hash", "does-not-exist.hex"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("does-not-exist.hex"));
}

#[test]
fn invalid_config_file_exits_two() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("broken.toml");
    fs::write(&config, "[connection\nport = 1").unwrap();
    let hex = dir.path().join("app.hex");
    fs::write(&hex, ":00000001FF\n").unwrap();

    cli_cmd()
        .current_dir(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("hash")
        .arg(&hex)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid config"));
}

#[test]
fn missing_config_file_exits_two() {
    let dir = tempdir().unwrap();

    cli_cmd()
        .current_dir(dir.path())
        .args(["--config", "nope.toml", "hash", "app.hex"])
        .assert()
        .code(2);
}

#[test]
fn unknown_target_exits_two() {
    let dir = tempdir().unwrap();
    let hex = dir.path().join("app.hex");
    fs::write(&hex, ":00000001FF\n").unwrap();

    isolated_cmd(dir.path())
        .args(["--target", "atmega328p", "hash"])
        .arg(&hex)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown target"));
}

#[test]
fn custom_target_from_config_is_used() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("optiflash.toml");
    fs::write(
        &config,
        "[target]\nname = \"avr32db32\"\nsignature = \"1E9533\"\nflash_size = 32768\npage_size = 512\n",
    )
    .unwrap();
    let hex = dir.path().join("app.hex");
    fs::write(&hex, ":00000001FF\n").unwrap();

    let expected: String = Sha256::digest(vec![0xFF_u8; 0x8000])
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect();

    cli_cmd()
        .current_dir(dir.path())
        .env_remove("OPTIFLASH_TARGET")
        .arg("--config")
        .arg(&config)
        .args(["-q", "hash"])
        .arg(&hex)
        .assert()
        .success()
        .stdout(format!("{expected}\n"));
}

#[test]
fn write_to_missing_port_fails_before_programming() {
    let dir = tempdir().unwrap();
    let hex = dir.path().join("app.hex");
    fs::write(&hex, ":020200000A0BE7\n:00000001FF\n").unwrap();

    isolated_cmd(dir.path())
        .args(["--non-interactive", "-p", "/nonexistent/optiflash-tty", "write", "--yes"])
        .arg(&hex)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("/nonexistent/optiflash-tty"));
}
