//! Stories about a Thing travelling between kcp and the downstream cluster

use std::time::Duration;

use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use serde_json::json;
use syncagent_common::crd::{Thing, ThingSpec};

use super::helpers::{connect, mirror_name, wait_for, AgentProcess, E2eEnv};

const TIMEOUT: Duration = Duration::from_secs(60);

fn thing(name: &str, kink: &str) -> Thing {
    Thing::new(
        name,
        ThingSpec {
            username: "e2e".to_string(),
            kink: kink.to_string(),
            address: None,
        },
    )
}

async fn cleanup(api: &Api<Thing>, name: &str) {
    let _ = api.delete(name, &DeleteParams::default()).await;
}

/// Story: a Thing created in kcp shows up downstream, its downstream status
/// flows back up, edits follow, and deletion removes the mirror before the
/// upstream object goes away
#[tokio::test]
#[ignore = "requires kcp and a downstream cluster - see tests/e2e.rs"]
async fn story_thing_round_trip() {
    let env = E2eEnv::from_env();
    let clusters = connect(&env).await;
    let agent_name = "e2e-round-trip";
    let name = "round-trip";

    let upstream: Api<Thing> = Api::all(clusters.kcp.clone());
    let downstream: Api<Thing> = Api::all(clusters.downstream.clone());
    cleanup(&upstream, name).await;

    let agent = AgentProcess::start(&env, agent_name);

    upstream
        .create(&PostParams::default(), &thing(name, "x"))
        .await
        .expect("create upstream Thing");

    let mirror = mirror_name(agent_name, &clusters.workspace, name);
    let synced = wait_for("downstream mirror", TIMEOUT, || {
        let downstream = downstream.clone();
        let mirror = mirror.clone();
        async move { downstream.get_opt(&mirror).await.ok().flatten() }
    })
    .await;
    assert_eq!(synced.spec.kink, "x");
    assert_eq!(
        synced.labels().get("syncagent.kcp.io/agent").map(String::as_str),
        Some(agent_name)
    );

    // The downstream side reports progress
    downstream
        .patch_status(
            &mirror,
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": { "phase": "Ready" } })),
        )
        .await
        .expect("set downstream status");
    wait_for("status back-propagation", TIMEOUT, || {
        let upstream = upstream.clone();
        async move {
            let u = upstream.get(name).await.ok()?;
            (u.status?.phase.as_deref() == Some("Ready")).then_some(())
        }
    })
    .await;

    // An upstream edit follows
    upstream
        .patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "spec": { "kink": "y" } })),
        )
        .await
        .expect("edit upstream spec");
    wait_for("spec update", TIMEOUT, || {
        let downstream = downstream.clone();
        let mirror = mirror.clone();
        async move {
            let d = downstream.get(&mirror).await.ok()?;
            (d.spec.kink == "y").then_some(())
        }
    })
    .await;

    // Deletion: the mirror goes first, then the upstream finalizer is released
    upstream
        .delete(name, &DeleteParams::default())
        .await
        .expect("delete upstream Thing");
    wait_for("upstream deletion", TIMEOUT, || {
        let upstream = upstream.clone();
        async move { upstream.get_opt(name).await.ok()?.is_none().then_some(()) }
    })
    .await;
    assert!(downstream.get_opt(&mirror).await.unwrap().is_none());

    let status = agent.terminate(Duration::from_secs(45)).await;
    assert!(status.success(), "agent should exit cleanly on SIGTERM");
}

/// Story: a downstream edit made behind the agent's back is reverted
#[tokio::test]
#[ignore = "requires kcp and a downstream cluster - see tests/e2e.rs"]
async fn story_downstream_drift_is_reverted() {
    let env = E2eEnv::from_env();
    let clusters = connect(&env).await;
    let agent_name = "e2e-drift";
    let name = "drift";

    let upstream: Api<Thing> = Api::all(clusters.kcp.clone());
    let downstream: Api<Thing> = Api::all(clusters.downstream.clone());
    cleanup(&upstream, name).await;

    let agent = AgentProcess::start(&env, agent_name);
    upstream
        .create(&PostParams::default(), &thing(name, "x"))
        .await
        .expect("create upstream Thing");

    let mirror = mirror_name(agent_name, &clusters.workspace, name);
    wait_for("downstream mirror", TIMEOUT, || {
        let downstream = downstream.clone();
        let mirror = mirror.clone();
        async move { downstream.get_opt(&mirror).await.ok().flatten() }
    })
    .await;

    downstream
        .patch(
            &mirror,
            &PatchParams::default(),
            &Patch::Merge(json!({ "spec": { "kink": "tampered" } })),
        )
        .await
        .expect("tamper with mirror");
    wait_for("drift revert", TIMEOUT, || {
        let downstream = downstream.clone();
        let mirror = mirror.clone();
        async move {
            let d = downstream.get(&mirror).await.ok()?;
            (d.spec.kink == "x").then_some(())
        }
    })
    .await;

    cleanup(&upstream, name).await;
    wait_for("cleanup", TIMEOUT, || {
        let downstream = downstream.clone();
        let mirror = mirror.clone();
        async move { downstream.get_opt(&mirror).await.ok()?.is_none().then_some(()) }
    })
    .await;
    agent.terminate(Duration::from_secs(45)).await;

    let leftovers = downstream
        .list(&ListParams::default().labels(&format!("syncagent.kcp.io/agent={agent_name}")))
        .await
        .expect("list mirrors");
    assert!(leftovers.items.is_empty());
}
