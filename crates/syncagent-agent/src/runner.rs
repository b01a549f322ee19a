//! Leader-gated engine supervision
//!
//! A [`Supervisor`] owns one [`Binding`] per synchronized resource type. While
//! this instance leads, it runs an [`Engine`] for every binding under the
//! current fencing term. When the lease is lost the engines are stopped,
//! drained within the shutdown budget, and the instance returns to standby.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use kube::Client;
use syncagent_common::kube_utils::{
    client_from_config, config_for_workspace, create_client, load_config,
    workspace_from_server_url,
};
use syncagent_common::leader_election::{
    ElectionConfig, Fence, KubeLeaseLock, LeaderElectionError, LeaderElector, LeaseLock,
};
use syncagent_common::Error;
use syncagent_sync::state::AGENT_LABEL;
use syncagent_sync::{Engine, EngineConfig, IdentityMapper, KubeStore, ObjectStore, ResourceType};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::binding;
use crate::config::{election_identity, AgentConfig, OsPodEnv};

/// One resource type wired to its upstream and downstream stores
pub struct Binding {
    resource: ResourceType,
    mapper: Arc<IdentityMapper>,
    upstreams: HashMap<String, Arc<dyn ObjectStore>>,
    downstream: Arc<dyn ObjectStore>,
}

impl Binding {
    /// Bind `resource` across the given workspace stores
    ///
    /// Fails if two workspaces collide on their downstream prefix.
    pub fn new(
        resource: ResourceType,
        agent_name: &str,
        upstreams: HashMap<String, Arc<dyn ObjectStore>>,
        downstream: Arc<dyn ObjectStore>,
    ) -> syncagent_common::Result<Self> {
        let mut workspaces: Vec<String> = upstreams.keys().cloned().collect();
        workspaces.sort();
        let mapper = IdentityMapper::new(agent_name, &resource.gvr(), &workspaces)?;
        Ok(Self {
            resource,
            mapper: Arc::new(mapper),
            upstreams,
            downstream,
        })
    }

    /// The bound resource type
    pub fn resource(&self) -> &ResourceType {
        &self.resource
    }

    fn engine(&self, fence: Fence, agent_name: &str, config: &EngineConfig) -> Engine {
        Engine::new(
            self.resource.clone(),
            self.upstreams.clone(),
            self.downstream.clone(),
            self.mapper.clone(),
            fence,
            agent_name,
            config.clone(),
        )
    }
}

/// How the supervisor decides it may write
pub enum Leadership {
    /// Single instance; runs with a permanent fence
    Disabled,
    /// Compete for a lease and only run while holding it
    Elected {
        /// Lease backend
        lock: Arc<dyn LeaseLock>,
        /// Lease timing
        config: ElectionConfig,
    },
}

/// Runs the engines for all bindings while this instance leads
pub struct Supervisor {
    agent_name: String,
    identity: String,
    bindings: Vec<Binding>,
    engine: EngineConfig,
    leadership: Leadership,
    shutdown_timeout: Duration,
}

impl Supervisor {
    /// Create a supervisor
    pub fn new(
        agent_name: impl Into<String>,
        identity: impl Into<String>,
        bindings: Vec<Binding>,
        engine: EngineConfig,
        leadership: Leadership,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            identity: identity.into(),
            bindings,
            engine,
            leadership,
            shutdown_timeout,
        }
    }

    /// Run until `shutdown` fires
    ///
    /// With leader election the lease is released on the way out so a peer
    /// can take over without waiting for expiry.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        match &self.leadership {
            Leadership::Disabled => {
                info!(identity = %self.identity, "Leader election disabled, running as sole writer");
                self.run_engines(Fence::always_leader(&self.identity), shutdown)
                    .await;
                Ok(())
            }
            Leadership::Elected { lock, config } => {
                let elector = Arc::new(LeaderElector::new(
                    lock.clone(),
                    &self.identity,
                    config.clone(),
                ));
                self.run_elected(elector, shutdown).await
            }
        }
    }

    async fn run_elected(
        &self,
        elector: Arc<LeaderElector>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let fence = elector.fence();
        loop {
            let guard = match elector.clone().acquire(&shutdown).await {
                Ok(guard) => guard,
                Err(LeaderElectionError::Cancelled) => return Ok(()),
                Err(e) => return Err(e).context("leader election failed"),
            };
            info!(identity = %self.identity, term = guard.term(), "Starting engines as leader");

            self.run_engines(fence.clone(), guard.lost_token()).await;

            if shutdown.is_cancelled() {
                if let Err(e) = guard.release().await {
                    warn!(identity = %self.identity, error = %e, "Failed to release lease");
                }
                return Ok(());
            }
            warn!(identity = %self.identity, "Leadership lost, returning to standby");
            drop(guard);
        }
    }

    /// Run every binding's engine until `stop` fires, then drain
    async fn run_engines(&self, fence: Fence, stop: CancellationToken) {
        let mut engines = JoinSet::new();
        for binding in &self.bindings {
            let engine = binding.engine(fence.clone(), &self.agent_name, &self.engine);
            engines.spawn(engine.run(stop.clone()));
        }

        stop.cancelled().await;
        info!(
            timeout_secs = self.shutdown_timeout.as_secs(),
            "Stopping engines, draining in-flight work"
        );

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(joined) = engines.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Engine task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("Engines did not drain in time, aborting");
            engines.abort_all();
        }
    }
}

/// Connect to both clusters and build a ready-to-run supervisor
///
/// Every failure here is a configuration problem: unreadable kubeconfig,
/// missing APIExport, unresolvable schema or colliding workspaces.
pub async fn connect(config: &AgentConfig) -> anyhow::Result<Supervisor> {
    let downstream = create_client(config.kubeconfig.as_deref()).await?;
    let kcp_config = load_config(config.kcp_kubeconfig.as_deref()).await?;
    let kcp = client_from_config(kcp_config.clone())?;

    let workspaces = if config.workspaces.is_empty() {
        let url = kcp_config.cluster_url.to_string();
        vec![workspace_from_server_url(&url).ok_or_else(|| {
            Error::config(format!(
                "kcp kubeconfig server {url} does not address a workspace; pass --workspace"
            ))
        })?]
    } else {
        config.workspaces.clone()
    };

    let mut upstream_clients: BTreeMap<String, Client> = BTreeMap::new();
    for workspace in &workspaces {
        let client = client_from_config(config_for_workspace(&kcp_config, workspace)?)?;
        upstream_clients.insert(workspace.clone(), client);
    }
    let discovery_client = upstream_clients
        .values()
        .next()
        .ok_or_else(|| Error::config("no upstream workspace configured"))?;

    let resources = binding::resolve(&kcp, discovery_client, &config.apiexport_ref).await?;

    let agent = &config.agent_name;
    let ownership = BTreeMap::from([(AGENT_LABEL.to_string(), agent.clone())]);
    let mut bindings = Vec::with_capacity(resources.len());
    for resource in resources {
        let upstreams: HashMap<String, Arc<dyn ObjectStore>> = upstream_clients
            .iter()
            .map(|(workspace, client)| {
                let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(
                    client.clone(),
                    resource.clone(),
                    format!("kcp {workspace}"),
                ));
                (workspace.clone(), store)
            })
            .collect();
        let store = KubeStore::new(downstream.clone(), resource.clone(), "downstream")
            .with_label_selector(format!("{AGENT_LABEL}={agent}"))
            .with_namespace_labels(ownership.clone());
        bindings.push(Binding::new(resource, agent, upstreams, Arc::new(store))?);
    }

    let leadership = if config.enable_leader_election {
        Leadership::Elected {
            lock: Arc::new(KubeLeaseLock::new(
                downstream,
                &config.namespace,
                &config.lease_name(),
            )),
            config: config.election.clone(),
        }
    } else {
        Leadership::Disabled
    };

    let identity = election_identity(&OsPodEnv, agent);
    info!(
        agent = %agent,
        identity = %identity,
        workspaces = ?workspaces,
        bindings = bindings.len(),
        leader_election = config.enable_leader_election,
        "Agent configured"
    );

    Ok(Supervisor::new(
        agent.clone(),
        identity,
        bindings,
        config.engine.clone(),
        leadership,
        config.shutdown_timeout,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::DynamicObject;
    use serde_json::json;
    use syncagent_common::leader_election::MemoryLeaseLock;
    use syncagent_common::retry::RetryConfig;
    use syncagent_sync::MemoryStore;
    use tokio::task::JoinHandle;

    const AGENT: &str = "runner-agent";
    const WS: &str = "root:org";

    fn things() -> ResourceType {
        ResourceType {
            group: "dummy.kcp.io".to_string(),
            version: "v1alpha1".to_string(),
            kind: "Thing".to_string(),
            plural: "things".to_string(),
            namespaced: false,
            has_status: true,
        }
    }

    fn engine_config() -> EngineConfig {
        EngineConfig {
            workers: 2,
            resync_period: Duration::ZERO,
            max_backoff: Duration::from_secs(1),
            relist_backoff: RetryConfig::capped_at(Duration::from_millis(200)),
            ..Default::default()
        }
    }

    fn election() -> ElectionConfig {
        ElectionConfig {
            lease_duration: Duration::from_secs(2),
            renew_deadline: Duration::from_secs(1),
            retry_period: Duration::from_millis(100),
        }
    }

    fn binding(up: &MemoryStore, down: &MemoryStore) -> Binding {
        let upstream: Arc<dyn ObjectStore> = Arc::new(up.clone());
        Binding::new(
            things(),
            AGENT,
            HashMap::from([(WS.to_string(), upstream)]),
            Arc::new(down.clone()),
        )
        .unwrap()
    }

    async fn create(up: &MemoryStore, name: &str) {
        let obj = DynamicObject::new(name, &things().api_resource())
            .data(json!({ "spec": { "username": name, "kink": "x" } }));
        up.create(&obj).await.unwrap();
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !check() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn start(supervisor: Supervisor) -> (CancellationToken, JoinHandle<anyhow::Result<()>>) {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(shutdown.clone()));
        (shutdown, task)
    }

    async fn stop(shutdown: CancellationToken, task: JoinHandle<anyhow::Result<()>>) {
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("supervisor exits")
            .expect("supervisor task")
            .expect("clean shutdown");
    }

    mod bindings {
        use super::*;

        #[test]
        fn mapper_knows_every_workspace() {
            let up = MemoryStore::cluster_scoped("kcp");
            let down = MemoryStore::cluster_scoped("downstream");
            let a: Arc<dyn ObjectStore> = Arc::new(up.clone());
            let b: Arc<dyn ObjectStore> = Arc::new(up);
            let binding = Binding::new(
                things(),
                AGENT,
                HashMap::from([("root:a".to_string(), a), ("root:b".to_string(), b)]),
                Arc::new(down),
            )
            .unwrap();
            let mut known: Vec<&str> = binding.mapper.workspaces().collect();
            known.sort();
            assert_eq!(known, vec!["root:a", "root:b"]);
            assert_eq!(binding.mapper.cluster(), AGENT);
            assert_eq!(binding.resource().plural, "things");
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn disabled_election_syncs_until_shutdown() {
            let up = MemoryStore::cluster_scoped("kcp");
            let down = MemoryStore::cluster_scoped("downstream");
            create(&up, "a").await;

            let supervisor = Supervisor::new(
                AGENT,
                "solo",
                vec![binding(&up, &down)],
                engine_config(),
                Leadership::Disabled,
                Duration::from_secs(2),
            );
            let (shutdown, task) = start(supervisor);

            eventually("mirror", || down.len() == 1).await;
            stop(shutdown, task).await;
        }

        /// Story: a standby waits out a peer's lease, leads, then loses the
        /// lease to the peer and stops writing
        #[tokio::test(start_paused = true)]
        async fn story_standby_takeover_and_loss() {
            let up = MemoryStore::cluster_scoped("kcp");
            let down = MemoryStore::cluster_scoped("downstream");
            let lock = MemoryLeaseLock::new();
            lock.steal("peer", Duration::from_secs(2));
            create(&up, "a").await;

            let supervisor = Supervisor::new(
                AGENT,
                "replica-1",
                vec![binding(&up, &down)],
                engine_config(),
                Leadership::Elected {
                    lock: Arc::new(lock.clone()),
                    config: election(),
                },
                Duration::from_secs(2),
            );
            let (shutdown, task) = start(supervisor);

            tokio::time::sleep(Duration::from_millis(500)).await;
            assert!(down.is_empty(), "standby must not write");

            eventually("takeover", || lock.holder().as_deref() == Some("replica-1")).await;
            eventually("mirror", || down.len() == 1).await;

            lock.steal("peer", Duration::from_secs(60));
            tokio::time::sleep(Duration::from_secs(1)).await;
            let writes = down.writes();
            create(&up, "b").await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            assert_eq!(down.writes(), writes, "demoted instance kept writing");
            assert_eq!(down.len(), 1);

            stop(shutdown, task).await;
            assert_eq!(lock.holder().as_deref(), Some("peer"));
        }

        #[tokio::test(start_paused = true)]
        async fn lease_is_released_on_shutdown() {
            let up = MemoryStore::cluster_scoped("kcp");
            let down = MemoryStore::cluster_scoped("downstream");
            let lock = MemoryLeaseLock::new();

            let supervisor = Supervisor::new(
                AGENT,
                "replica-1",
                vec![binding(&up, &down)],
                engine_config(),
                Leadership::Elected {
                    lock: Arc::new(lock.clone()),
                    config: election(),
                },
                Duration::from_secs(2),
            );
            let (shutdown, task) = start(supervisor);

            eventually("leadership", || lock.holder().is_some()).await;
            stop(shutdown, task).await;
            assert_eq!(lock.holder(), None);
        }

        #[tokio::test(start_paused = true)]
        async fn shutdown_while_standby_returns_cleanly() {
            let lock = MemoryLeaseLock::new();
            lock.steal("peer", Duration::from_secs(600));
            let up = MemoryStore::cluster_scoped("kcp");
            let down = MemoryStore::cluster_scoped("downstream");

            let supervisor = Supervisor::new(
                AGENT,
                "replica-2",
                vec![binding(&up, &down)],
                engine_config(),
                Leadership::Elected {
                    lock: Arc::new(lock.clone()),
                    config: election(),
                },
                Duration::from_secs(2),
            );
            let (shutdown, task) = start(supervisor);
            tokio::time::sleep(Duration::from_secs(1)).await;
            stop(shutdown, task).await;
            assert_eq!(lock.holder().as_deref(), Some("peer"));
            assert!(down.is_empty());
        }
    }
}
