//! Command line and process configuration
//!
//! The CLI is parsed with clap and validated into an [`AgentConfig`] before
//! any cluster is contacted, so flag mistakes exit early with a clear error.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use rand::Rng;
use syncagent_common::leader_election::ElectionConfig;
use syncagent_common::{Error, Result, DEFAULT_NAMESPACE};
use syncagent_sync::finalizer::MAX_AGENT_NAME_LEN;
use syncagent_sync::{EngineConfig, SpecDriftPolicy};

/// Longest value Kubernetes accepts for a label

/// api-syncagent - keeps kcp workspace objects and their downstream mirrors in sync
#[derive(Parser, Debug)]
#[command(name = "api-syncagent", version, about, long_about = None)]
pub struct Cli {
    /// Print the Thing CRD manifest and exit
    #[arg(long)]
    pub crd: bool,

    /// Identity of this agent; stamped on every downstream object it owns
    #[arg(long)]
    pub agent_name: Option<String>,

    /// Name of the APIExport whose resource schemas are synchronized
    #[arg(long)]
    pub apiexport_ref: Option<String>,

    /// Only run the sync engine while holding the leader lease
    #[arg(
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = true,
        default_missing_value = "true"
    )]
    pub enable_leader_election: bool,

    /// Kubeconfig for the downstream cluster (in-cluster config when omitted)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig for kcp; its server URL addresses the APIExport workspace
    #[arg(long)]
    pub kcp_kubeconfig: Option<PathBuf>,

    /// Operating namespace of the agent; holds the leader lease
    ///
    /// Synchronized objects are not placed here. Their downstream namespaces
    /// follow the workspace-prefixed mapping.
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Upstream workspace to synchronize (repeatable)
    ///
    /// Defaults to the workspace addressed by the kcp kubeconfig.
    #[arg(long = "workspace")]
    pub workspaces: Vec<String>,

    /// Concurrent reconcile workers per resource type
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Full resync interval in seconds (0 disables)
    #[arg(long, default_value_t = 600)]
    pub resync_period_secs: u64,

    /// What to do when a downstream spec was edited outside the agent
    #[arg(long, default_value = "upstream-wins")]
    pub spec_drift_policy: SpecDriftPolicy,

    /// Time allowed for in-flight work to drain on shutdown or lease loss
    #[arg(long, default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// Leader lease validity in seconds
    #[arg(long, default_value_t = 30)]
    pub lease_duration_secs: u64,

    /// Seconds a leader may go without renewing before stepping down
    #[arg(long, default_value_t = 15)]
    pub renew_deadline_secs: u64,

    /// Seconds between lease acquire attempts and renewals
    #[arg(long, default_value_t = 5)]
    pub retry_period_secs: u64,

    /// Upper bound for per-object retry backoff in seconds
    #[arg(long, default_value_t = 300)]
    pub max_backoff_secs: u64,
}

/// Validated process configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Agent identity used for ownership labels and the lease name
    pub agent_name: String,
    /// APIExport to consume
    pub apiexport_ref: String,
    /// Whether to gate the engine on the leader lease
    pub enable_leader_election: bool,
    /// Downstream kubeconfig
    pub kubeconfig: Option<PathBuf>,
    /// kcp kubeconfig
    pub kcp_kubeconfig: Option<PathBuf>,
    /// Operating namespace; only the leader lease lives here
    pub namespace: String,
    /// Explicit upstream workspaces; empty means "the kubeconfig's workspace"
    pub workspaces: Vec<String>,
    /// Engine tuning
    pub engine: EngineConfig,
    /// Lease timing
    pub election: ElectionConfig,
    /// Drain budget on shutdown and lease loss
    pub shutdown_timeout: Duration,
}

impl Cli {
    /// Validate the flags
    pub fn into_config(self) -> Result<AgentConfig> {
        let agent_name = self
            .agent_name
            .ok_or_else(|| Error::config("--agent-name is required"))?;
        validate_agent_name(&agent_name)?;

        let apiexport_ref = self
            .apiexport_ref
            .filter(|r| !r.is_empty())
            .ok_or_else(|| Error::config("--apiexport-ref is required"))?;

        if self.namespace.is_empty() {
            return Err(Error::config("--namespace must not be empty"));
        }
        if self.workers == 0 {
            return Err(Error::config("--workers must be at least 1"));
        }
        if let Some(ws) = self.workspaces.iter().find(|ws| ws.is_empty()) {
            return Err(Error::config(format!("invalid --workspace {ws:?}")));
        }

        let election = ElectionConfig {
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            renew_deadline: Duration::from_secs(self.renew_deadline_secs),
            retry_period: Duration::from_secs(self.retry_period_secs),
        };
        if election.retry_period.is_zero() {
            return Err(Error::config("--retry-period-secs must be positive"));
        }
        if election.renew_deadline >= election.lease_duration {
            return Err(Error::config(
                "--renew-deadline-secs must be shorter than --lease-duration-secs",
            ));
        }

        let engine = EngineConfig {
            workers: self.workers,
            resync_period: Duration::from_secs(self.resync_period_secs),
            policy: self.spec_drift_policy,
            max_backoff: Duration::from_secs(self.max_backoff_secs.max(1)),
            ..EngineConfig::default()
        };

        Ok(AgentConfig {
            agent_name,
            apiexport_ref,
            enable_leader_election: self.enable_leader_election,
            kubeconfig: self.kubeconfig,
            kcp_kubeconfig: self.kcp_kubeconfig,
            namespace: self.namespace,
            workspaces: self.workspaces,
            engine,
            election,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        })
    }
}

impl AgentConfig {
    /// Name of the coordination Lease this agent competes for
    pub fn lease_name(&self) -> String {
        format!("api-syncagent-{}", self.agent_name)
    }
}

/// The agent name doubles as a label value, so it must be one
fn validate_agent_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    let valid_ends = name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric());

    // Bounded by the finalizer name, which is tighter than the label value limit
    if name.is_empty() || name.len() > MAX_AGENT_NAME_LEN || !valid_chars || !valid_ends {
        return Err(Error::config(format!(
            "invalid --agent-name {name:?}: must be 1-{MAX_AGENT_NAME_LEN} alphanumeric \
             characters, '-', '_' or '.', starting and ending with an alphanumeric"
        )));
    }
    Ok(())
}

/// Trait for reading the pod environment
///
/// Abstracts the downward-API variables so identity selection can be tested
/// without touching process-global state.
#[cfg_attr(test, mockall::automock)]
pub trait PodEnvConfig: Send + Sync {
    /// Pod name, when running in a pod with the downward API wired up
    fn pod_name(&self) -> Option<String>;
}

/// Default implementation that reads from environment variables
#[derive(Clone, Default)]
pub struct OsPodEnv;

impl PodEnvConfig for OsPodEnv {
    fn pod_name(&self) -> Option<String> {
        std::env::var("POD_NAME").ok().filter(|n| !n.is_empty())
    }
}

/// Leader election identity for this process
///
/// The pod name when known, so operators can see which replica leads;
/// otherwise the agent name with a random suffix.
pub fn election_identity(env: &dyn PodEnvConfig, agent_name: &str) -> String {
    match env.pod_name() {
        Some(pod) => pod,
        None => {
            let suffix: u32 = rand::thread_rng().gen();
            format!("{agent_name}-{suffix:08x}")
        }
    }
}
