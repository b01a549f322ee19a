//! api-syncagent - synchronizes kcp APIExport objects into a downstream cluster

use clap::Parser;
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use syncagent_agent::{connect, Cli};
use syncagent_common::crd::Thing;
use syncagent_common::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    // Both cluster connections are TLS; nothing works without it.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install FIPS-validated crypto provider: {:?}. \
             The agent cannot reach kcp or the downstream cluster without a working \
             TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Thing::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    if let Err(e) = init_telemetry(TelemetryConfig {
        agent_name: cli.agent_name.clone(),
        ..Default::default()
    }) {
        eprintln!("Failed to initialize telemetry: {e}");
        std::process::exit(1);
    }

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    let supervisor = match connect(&config).await {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(error = %e, "Startup failed");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    supervisor.run(shutdown).await?;
    info!("api-syncagent stopped");
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }

    token.cancel();
}
