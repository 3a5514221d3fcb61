//! runguard - Main entry point.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use runguard::{
    audit::TracingAuditSink,
    config::Config,
    orchestrator::{ApiState, RunApi, RunOrchestrator},
    platform::DockerPlatform,
    policy::{CosignVerifier, PolicyEnforcer},
};

/// How long shutdown waits for pending sandbox cleanups.
const CLEANUP_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "runguard")]
#[command(about = "Control plane for policy-gated, short-lived sandboxed runs")]
#[command(version)]
struct Args {
    /// Emit logs as JSON lines
    #[arg(long, env = "RUNNER_JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("runguard=info,tower_http=info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if args.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }

    let config = Config::from_env()?;
    tracing::info!(
        namespace = %config.runner.namespace,
        runtime_class = %config.runner.runtime_class,
        require_signature = config.policy.require_signature,
        registries = ?config.policy.allowlisted_registries,
        "Loaded configuration"
    );

    let platform = Arc::new(DockerPlatform::new());
    let verifier = Arc::new(CosignVerifier::new(config.policy.cosign_binary.clone()));
    let enforcer = PolicyEnforcer::new(config.policy.clone(), verifier);
    let orchestrator = Arc::new(RunOrchestrator::new(
        config.runner.clone(),
        enforcer,
        platform.clone(),
        Arc::new(TracingAuditSink),
    )?);

    let listener = tokio::net::TcpListener::bind(config.runner.addr).await?;
    let state = ApiState {
        orchestrator: Arc::clone(&orchestrator),
        request_timeout: config.runner.request_timeout(),
    };
    RunApi::serve(listener, state, shutdown_signal()).await?;

    tracing::info!("Server stopped, flushing sandbox cleanup");
    orchestrator.shutdown(CLEANUP_GRACE).await;
    platform.shutdown().await;

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
