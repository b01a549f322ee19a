//! Flag handling that needs no cluster

use std::process::Command;

use super::helpers::AGENT_BIN;

#[test]
fn crd_flag_prints_the_thing_manifest() {
    let output = Command::new(AGENT_BIN)
        .arg("--crd")
        .output()
        .expect("failed to run api-syncagent");
    assert!(output.status.success());

    let manifest: serde_yaml::Value =
        serde_yaml::from_slice(&output.stdout).expect("valid YAML");
    assert_eq!(manifest["kind"], "CustomResourceDefinition");
    assert_eq!(manifest["metadata"]["name"], "things.dummy.kcp.io");
    assert_eq!(manifest["spec"]["scope"], "Cluster");
}

#[test]
fn missing_agent_name_exits_non_zero() {
    let status = Command::new(AGENT_BIN)
        .args(["--apiexport-ref", "things.dummy.kcp.io"])
        .status()
        .expect("failed to run api-syncagent");
    assert!(!status.success());
}

#[test]
fn unknown_drift_policy_exits_non_zero() {
    let status = Command::new(AGENT_BIN)
        .args([
            "--agent-name",
            "a",
            "--apiexport-ref",
            "x",
            "--spec-drift-policy",
            "sometimes",
        ])
        .status()
        .expect("failed to run api-syncagent");
    assert!(!status.success());
}

#[test]
fn agent_name_too_long_for_the_finalizer_exits_one() {
    let name = "a".repeat(56);
    let status = Command::new(AGENT_BIN)
        .args(["--agent-name", name.as_str(), "--apiexport-ref", "x"])
        .status()
        .expect("failed to run api-syncagent");
    assert_eq!(status.code(), Some(1));
}
