//! CLI surface checks.

use assert_cmd::Command;

#[test]
fn help_lists_subcommands() {
    let output = Command::cargo_bin("sortinghat")
        .expect("binary builds")
        .arg("--help")
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).into_owned();
    assert!(stdout.contains("analyze"));
    assert!(stdout.contains("models"));
    assert!(stdout.contains("health"));
}

#[test]
fn analyze_requires_root_argument() {
    Command::cargo_bin("sortinghat")
        .expect("binary builds")
        .arg("analyze")
        .assert()
        .failure();
}

#[test]
fn unknown_kind_is_rejected() {
    Command::cargo_bin("sortinghat")
        .expect("binary builds")
        .args(["analyze", "--root", ".", "--kinds", "mind-reading"])
        .assert()
        .failure();
}
