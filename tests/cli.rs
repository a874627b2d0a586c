use assert_cmd::prelude::*;
use predicates::str::contains;
use std::process::Command;

#[test]
fn reference_mode_prints_simulation_summary() {
    let mut cmd = Command::cargo_bin("glimmer-runtime").expect("binary exists");
    cmd.args(["--reference", "--particles", "500", "--frames", "59"]);
    cmd.assert()
        .success()
        .stdout(contains(
            "Simulating 500 particles for 59 frames (reference mode)",
        ))
        .stdout(contains("over 59 frames"));
}

#[test]
fn reference_mode_is_deterministic() {
    let run = || {
        let mut cmd = Command::cargo_bin("glimmer-runtime").expect("binary exists");
        cmd.args(["--reference", "--particles", "1000", "--frames", "120"]);
        cmd.output().expect("run binary")
    };
    let first = run();
    let second = run();
    assert!(first.status.success());
    assert_eq!(first.stdout, second.stdout);
}

#[test]
fn unknown_argument_is_rejected() {
    let mut cmd = Command::cargo_bin("glimmer-runtime").expect("binary exists");
    cmd.arg("--bogus");
    cmd.assert()
        .failure()
        .stderr(contains("Unknown argument: --bogus"));
}

#[test]
fn flag_values_are_validated() {
    let mut cmd = Command::cargo_bin("glimmer-runtime").expect("binary exists");
    cmd.args(["--reference", "--particles", "many"]);
    cmd.assert()
        .failure()
        .stderr(contains("invalid value for --particles"));
}
