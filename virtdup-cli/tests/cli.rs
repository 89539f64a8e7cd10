use assert_cmd::Command;
use predicates::prelude::*;

fn virt_dup() -> Command {
    Command::cargo_bin("virt-dup").unwrap()
}

#[test]
fn test_help_shows_examples_and_flags() {
    virt_dup()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("VM_NAME"))
        .stdout(predicate::str::contains("examples:"))
        .stdout(predicate::str::contains("--set-ip"))
        .stdout(predicate::str::contains("--change-ip"));
}

#[test]
fn test_missing_vm_name_is_usage_error() {
    virt_dup()
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_verbose_alone_is_usage_error() {
    virt_dup()
        .arg("-v")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("VM_NAME"));
}

#[test]
fn test_whitespace_in_name_is_rejected() {
    virt_dup()
        .arg("bad name")
        .assert()
        .failure()
        .stderr(predicate::str::contains("whitespace"));
}

#[test]
fn test_conflicting_ip_flags_are_rejected() {
    virt_dup()
        .args(["--set-ip", "10.0.0.1", "--change-ip", "a:b", "vmx"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("mutually exclusive"));
}

#[test]
fn test_invalid_set_ip_is_rejected() {
    virt_dup()
        .args(["--set-ip", "not-an-address", "vmx"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid IPv4 address"));
}
