//! Daemon bootstrap: wire the core from config, serve until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use servcur_core::metrics::METRICS;
use servcur_core::{
    ContainerRuntime, DockerRuntime, GitFetcher, LogMux, Orchestrator, OrchestratorParts,
    ProcessLauncher, ProjectService, ResourceProxy,
};
use servcur_state::{FsJobArchive, JsonProjectStore, MemoryJobRegistry};
use tokio::task::JoinHandle;

use crate::api::{create_router, AppState};
use crate::config::DaemonConfig;

/// Build the gateway state against the local Docker daemon.
///
/// Fails when Docker does not answer a ping, so a misconfigured host is
/// reported at startup rather than on the first request.
pub async fn build_state(config: &DaemonConfig) -> Result<AppState> {
    let docker = DockerRuntime::connect().context("could not create Docker client")?;
    match tokio::time::timeout(config.docker_timeout(), docker.ping()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => bail!("could not reach the Docker daemon (is Docker running?): {e}"),
        Err(_) => bail!(
            "Docker daemon did not answer within {}s (is Docker running?)",
            config.docker_timeout_secs
        ),
    }
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);
    let proxy = Arc::new(ResourceProxy::new(runtime, config.docker_timeout()));

    let store = JsonProjectStore::open(&config.data_dir)
        .with_context(|| format!("could not open project store in {}", config.data_dir.display()))?;
    let archive = FsJobArchive::new(&config.data_dir)
        .with_context(|| format!("could not open build archive in {}", config.data_dir.display()))?;
    let registry = Arc::new(MemoryJobRegistry::new());

    let projects = Arc::new(ProjectService::new(
        Arc::new(store),
        registry.clone(),
        Arc::new(GitFetcher::new()),
        config.data_dir.clone(),
    ));
    let orchestrator = Orchestrator::new(
        OrchestratorParts {
            projects,
            registry,
            archive: Arc::new(archive),
            proxy: proxy.clone(),
            launcher: Arc::new(ProcessLauncher::new()),
            mux: Arc::new(LogMux::new(config.log_retention())),
        },
        config.orchestrator(),
    );

    Ok(AppState {
        proxy,
        orchestrator,
        retry: config.retry_policy(),
    })
}

/// Periodically drop streams of jobs that finished long ago.
pub fn spawn_purge(mux: Arc<LogMux>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let purged = mux.purge();
            if purged > 0 {
                tracing::debug!(purged, remaining = mux.len(), "finished streams purged");
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

/// Serve the gateway until Ctrl-C.
pub async fn run(config: DaemonConfig) -> Result<()> {
    let state = build_state(&config).await?;
    let purge = spawn_purge(state.orchestrator.mux().clone(), config.purge_interval());

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("could not bind {}", config.listen))?;
    tracing::info!(
        listen = %config.listen,
        data_dir = %config.data_dir.display(),
        "servcurd listening"
    );

    let served = axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;
    purge.abort();
    METRICS.flush();
    served.context("server error")
}
