//! Test helpers for end-to-end tests
//!
//! Provides the environment lookup, client construction and a handle on a
//! running agent process.

use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use syncagent_common::crd::Thing;
use syncagent_common::kube_utils::{create_client, workspace_from_server_url};
use syncagent_sync::{IdentityMapper, ObjectName, ResourceType, UpstreamKey};
use tokio::time::sleep;

/// Path of the binary under test
pub const AGENT_BIN: &str = env!("CARGO_BIN_EXE_api-syncagent");

/// kcp kubeconfig (workspace holding the APIExport and its binding)
pub const KCP_KUBECONFIG_ENV: &str = "SYNCAGENT_E2E_KCP_KUBECONFIG";
/// Downstream cluster kubeconfig
pub const KUBECONFIG_ENV: &str = "SYNCAGENT_E2E_KUBECONFIG";
/// APIExport name
pub const APIEXPORT_ENV: &str = "SYNCAGENT_E2E_APIEXPORT";

/// Poll interval while waiting on cluster state
const POLL: Duration = Duration::from_millis(500);

/// Settings read from the environment
pub struct E2eEnv {
    /// kcp kubeconfig
    pub kcp_kubeconfig: PathBuf,
    /// Downstream kubeconfig
    pub kubeconfig: PathBuf,
    /// APIExport name
    pub apiexport: String,
}

impl E2eEnv {
    /// Read settings, panicking with a hint when one is missing
    pub fn from_env() -> Self {
        let var = |name: &str| {
            std::env::var(name).unwrap_or_else(|_| panic!("{name} must be set for e2e tests"))
        };
        Self {
            kcp_kubeconfig: var(KCP_KUBECONFIG_ENV).into(),
            kubeconfig: var(KUBECONFIG_ENV).into(),
            apiexport: var(APIEXPORT_ENV),
        }
    }
}

/// Clients for both sides plus the workspace kcp addresses
pub struct Clusters {
    /// Client for the kcp workspace
    pub kcp: Client,
    /// Client for the downstream cluster
    pub downstream: Client,
    /// Workspace path of the kcp client
    pub workspace: String,
}

/// Connect to both clusters and make sure the Thing CRD exists downstream
pub async fn connect(env: &E2eEnv) -> Clusters {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let kcp_config = syncagent_common::kube_utils::load_config(Some(&env.kcp_kubeconfig))
        .await
        .expect("load kcp kubeconfig");
    let workspace = workspace_from_server_url(&kcp_config.cluster_url.to_string())
        .expect("kcp kubeconfig must address a workspace");
    let kcp = Client::try_from(kcp_config).expect("kcp client");
    let downstream = create_client(Some(&env.kubeconfig))
        .await
        .expect("downstream client");

    install_thing_crd(&downstream).await;
    Clusters {
        kcp,
        downstream,
        workspace,
    }
}

/// Apply the Thing CRD downstream
pub async fn install_thing_crd(client: &Client) {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd = Thing::crd();
    let name = crd.metadata.name.clone().expect("crd name");
    crds.patch(
        &name,
        &PatchParams::apply("syncagent-e2e").force(),
        &Patch::Apply(&crd),
    )
    .await
    .expect("install Thing CRD");
    // Wait for CRD to be established
    sleep(Duration::from_secs(2)).await;
}

/// Resource descriptor for Things
pub fn things() -> ResourceType {
    ResourceType {
        group: "dummy.kcp.io".to_string(),
        version: "v1alpha1".to_string(),
        kind: "Thing".to_string(),
        plural: "things".to_string(),
        namespaced: false,
        has_status: true,
    }
}

/// Downstream name of an upstream Thing
pub fn mirror_name(agent: &str, workspace: &str, name: &str) -> String {
    let resource = things();
    let mapper = IdentityMapper::new(agent, &resource.gvr(), &[workspace.to_string()])
        .expect("mapper");
    mapper
        .to_downstream(&UpstreamKey {
            workspace: workspace.to_string(),
            gvr: resource.gvr(),
            object: ObjectName::cluster(name),
        })
        .expect("mappable name")
        .object
        .name
}

/// Poll `check` until it yields a value or `timeout` passes
pub async fn wait_for<T, F, Fut>(what: &str, timeout: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        sleep(POLL).await;
    }
}

/// A running agent process, terminated on drop
pub struct AgentProcess {
    child: Child,
}

impl AgentProcess {
    /// Launch the agent the way a deployment would, without leader election
    pub fn start(env: &E2eEnv, agent: &str) -> Self {
        Self::spawn(&[
            "--agent-name",
            agent,
            "--apiexport-ref",
            &env.apiexport,
            "--enable-leader-election=false",
            "--kubeconfig",
            env.kubeconfig.to_str().expect("utf-8 path"),
            "--kcp-kubeconfig",
            env.kcp_kubeconfig.to_str().expect("utf-8 path"),
            "--namespace",
            "kube-system",
        ])
    }

    /// Launch the agent with arbitrary flags
    pub fn spawn(args: &[&str]) -> Self {
        println!("Running {AGENT_BIN} {}", args.join(" "));
        let child = Command::new(AGENT_BIN)
            .args(args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .expect("failed to start api-syncagent");
        Self { child }
    }

    /// Wait for the process to exit on its own
    pub async fn wait_exit(&mut self, timeout: Duration) -> ExitStatus {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait().expect("poll agent") {
                return status;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "agent did not exit within {timeout:?}"
            );
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Ask the agent to shut down gracefully and wait for it
    pub async fn terminate(mut self, timeout: Duration) -> ExitStatus {
        let pid = self.child.id().to_string();
        let sent = Command::new("kill")
            .args(["-TERM", &pid])
            .status()
            .expect("failed to run kill");
        assert!(sent.success(), "failed to signal agent");
        self.wait_exit(timeout).await
    }
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
