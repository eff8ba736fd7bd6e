//! Binary tests for the paths that never touch host networking.

use std::error::Error;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const CNI_ENV: &[&str] = &[
    "CNI_COMMAND",
    "CNI_CONTAINERID",
    "CNI_NETNS",
    "CNI_IFNAME",
    "CNI_ARGS",
    "CNI_PATH",
];

fn plugin(root: &TempDir) -> Result<Command, Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("hitch-cni")?;
    for var in CNI_ENV {
        cmd.env_remove(var);
    }
    cmd.arg("--root").arg(root.path());
    Ok(cmd)
}

#[test]
fn version_command_lists_supported_versions() -> Result<(), Box<dyn Error>> {
    let root = TempDir::new()?;
    plugin(&root)?
        .env("CNI_COMMAND", "VERSION")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""supportedVersions":["0.3.0","0.3.1","0.4.0"]"#));
    Ok(())
}

#[test]
fn missing_command_is_a_cni_error() -> Result<(), Box<dyn Error>> {
    let root = TempDir::new()?;
    plugin(&root)?
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""code":7"#))
        .stdout(predicate::str::contains("CNI_COMMAND is not set"));
    Ok(())
}

#[test]
fn nameless_network_is_rejected() -> Result<(), Box<dyn Error>> {
    let root = TempDir::new()?;
    plugin(&root)?
        .env("CNI_COMMAND", "ADD")
        .env("CNI_CONTAINERID", "1a2b3c4d5e6f")
        .env("CNI_IFNAME", "eth0")
        .write_stdin(r#"{"cniVersion":"0.4.0","type":"hitch-cni"}"#)
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""cniVersion":"0.4.0""#))
        .stdout(predicate::str::contains("missing network name"));

    assert!(root.path().join("log/hitch-cni.log").exists());
    Ok(())
}

#[test]
fn malformed_cni_args_are_rejected() -> Result<(), Box<dyn Error>> {
    let root = TempDir::new()?;
    plugin(&root)?
        .env("CNI_COMMAND", "DEL")
        .env("CNI_CONTAINERID", "1a2b3c4d5e6f")
        .env("CNI_ARGS", "not-a-pair")
        .write_stdin(r#"{"name":"n1"}"#)
        .assert()
        .failure()
        .stdout(predicate::str::contains("invalid CNI_ARGS pair"));
    Ok(())
}

#[test]
fn monitor_help_names_flags() -> Result<(), Box<dyn Error>> {
    Command::cargo_bin("hitch-netmon")?
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--monitor-all-chains"))
        .stdout(predicate::str::contains("--interval"));
    Ok(())
}
