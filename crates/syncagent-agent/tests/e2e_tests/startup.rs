//! Startup configuration errors
//!
//! The agent must refuse to run, with a non-zero exit, when it cannot reach
//! its clusters or the APIExport it was pointed at does not exist.

use std::time::Duration;

use super::helpers::{connect, AgentProcess, E2eEnv};

#[tokio::test]
#[ignore = "requires kcp and a downstream cluster - see tests/e2e.rs"]
async fn missing_apiexport_exits_non_zero() {
    let env = E2eEnv::from_env();
    let _ = connect(&env).await;

    let mut agent = AgentProcess::spawn(&[
        "--agent-name",
        "e2e-missing-export",
        "--apiexport-ref",
        "does-not-exist.example.com",
        "--enable-leader-election=false",
        "--kubeconfig",
        env.kubeconfig.to_str().unwrap(),
        "--kcp-kubeconfig",
        env.kcp_kubeconfig.to_str().unwrap(),
    ]);
    let status = agent.wait_exit(Duration::from_secs(60)).await;
    assert!(!status.success());
}

#[tokio::test]
#[ignore = "requires kcp and a downstream cluster - see tests/e2e.rs"]
async fn unreadable_kubeconfig_exits_non_zero() {
    let env = E2eEnv::from_env();

    let mut agent = AgentProcess::spawn(&[
        "--agent-name",
        "e2e-bad-kubeconfig",
        "--apiexport-ref",
        &env.apiexport,
        "--enable-leader-election=false",
        "--kubeconfig",
        "/nonexistent/kubeconfig",
        "--kcp-kubeconfig",
        env.kcp_kubeconfig.to_str().unwrap(),
    ]);
    let status = agent.wait_exit(Duration::from_secs(30)).await;
    assert!(!status.success());
}
