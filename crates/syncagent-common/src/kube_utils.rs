//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction for both sides of the sync (the downstream cluster and
//! kcp workspaces), kcp workspace URL handling, and the stable hash used for
//! persisted sync state.

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients (must exceed the watch timeout)
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Path segment kcp uses to address a logical cluster on its front proxy
const KCP_CLUSTERS_SEGMENT: &str = "/clusters/";

/// Load a client config from an optional kubeconfig path with default timeouts
///
/// `None` infers the config (in-cluster service account or `$KUBECONFIG`).
pub async fn load_config(kubeconfig: Option<&Path>) -> Result<Config, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::config(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::config(format!(
                        "failed to load kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::config(format!("failed to infer kube config: {}", e)))?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(config)
}

/// Create a kube client from a loaded config
pub fn client_from_config(config: Config) -> Result<Client, Error> {
    Client::try_from(config)
        .map_err(|e| Error::config(format!("failed to create kube client: {}", e)))
}

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    client_from_config(load_config(kubeconfig).await?)
}

/// Extract the kcp workspace path from a server URL
///
/// `https://kcp:6443/clusters/root:org:team` yields `root:org:team`.
/// Returns `None` when the URL does not address a logical cluster.
pub fn workspace_from_server_url(url: &str) -> Option<String> {
    let (_, rest) = url.split_once(KCP_CLUSTERS_SEGMENT)?;
    let path = rest.split('/').next().unwrap_or_default();
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

/// Rewrite a kcp server URL so it addresses the given workspace path
///
/// Any existing `/clusters/<path>` suffix is replaced.
pub fn workspace_server_url(url: &str, workspace: &str) -> String {
    let base = match url.split_once(KCP_CLUSTERS_SEGMENT) {
        Some((base, _)) => base,
        None => url.trim_end_matches('/'),
    };
    format!("{}{}{}", base, KCP_CLUSTERS_SEGMENT, workspace)
}

/// Derive a config addressing `workspace` from a kcp base config
pub fn config_for_workspace(base: &Config, workspace: &str) -> Result<Config, Error> {
    let mut config = base.clone();
    let url = workspace_server_url(&base.cluster_url.to_string(), workspace);
    config.cluster_url = url
        .parse()
        .map_err(|e| Error::config(format!("invalid workspace URL {}: {}", url, e)))?;
    Ok(config)
}

/// Ensure a namespace exists, creating it with the given labels if missing
pub async fn ensure_namespace(
    client: &Client,
    name: &str,
    labels: std::collections::BTreeMap<String, String>,
) -> Result<(), Error> {
    let api: Api<Namespace> = Api::all(client.clone());

    match api.get_opt(name).await? {
        Some(_) => {
            debug!(namespace = %name, "namespace already exists");
            Ok(())
        }
        None => {
            let ns = Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    labels: Some(labels),
                    ..Default::default()
                },
                ..Default::default()
            };
            match api.create(&PostParams::default(), &ns).await {
                Ok(_) => {
                    info!(namespace = %name, "namespace created");
                    Ok(())
                }
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    }
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 for stability across Rust toolchain versions.
/// `DefaultHasher` is NOT guaranteed stable across Rust releases, so this
/// function is used whenever the hash is persisted (e.g., K8s annotations).
pub fn deterministic_hash(input: &str) -> String {
    hex_digest(input, 8)
}

/// Hex SHA-256 digest truncated to `bytes` bytes (at most 32)
pub fn hex_digest(input: &str, bytes: usize) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    let take = bytes.min(hash.as_ref().len());
    hash.as_ref()[..take]
        .iter()
        .fold(String::with_capacity(take * 2), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// True if the kube error is a 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True if the kube error is a 409
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}
