use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn demo_help_lists_scenarios() {
    let mut cmd = cargo_bin_cmd!("strandctl");
    let output = cmd
        .arg("demo")
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    for scenario in [
        "cache-then-network",
        "retry-then-success",
        "exhausted",
        "non-retryable",
        "supersede",
        "timeout",
    ] {
        assert!(text.contains(scenario), "demo help missing '{scenario}'");
    }
    assert!(text.contains("--latency"), "demo help missing --latency");
    assert!(text.contains("--json"), "demo help missing --json");
}

#[test]
fn config_show_is_documented() {
    let mut cmd = cargo_bin_cmd!("strandctl");
    cmd.arg("config")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("show"));
}

#[test]
fn unknown_scenario_is_rejected() {
    let mut cmd = cargo_bin_cmd!("strandctl");
    cmd.arg("demo")
        .arg("stampede")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}
