// Stratum mining proxy
//
// Polls the node for block templates, hands miners disjoint nonce ranges and
// validates their shares before forwarding blocks back to the node.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::EnvFilter;

use mining_proxy::blockchain::{RpcClient, TemplateManager};
use mining_proxy::config::Config;
use mining_proxy::jobs::JobBook;
use mining_proxy::metrics::prometheus as metrics;
use mining_proxy::shares::{LogPublisher, RedisPublisher, SharePublisher, ShareValidator, StructuralVerifier};
use mining_proxy::stratum::{ProxyServer, SessionContext, SessionPolicy, SessionRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cfg = Config::load()?;
    let server_id = cfg.server_id()?;
    tracing::info!(
        listen = %cfg.listen,
        rpc = %cfg.rpc_url,
        testnet = cfg.testnet,
        share_difficulty = cfg.share_difficulty,
        "Starting {} v{}",
        cfg.server_name,
        env!("CARGO_PKG_VERSION")
    );

    let shutdown = CancellationToken::new();

    let rpc = Arc::new(RpcClient::new(cfg.rpc_url.clone(), cfg.rpc_timeout()));
    let registry = Arc::new(SessionRegistry::new());
    let jobs = Arc::new(JobBook::new(cfg.job_cache_limit));

    let mut publisher_task = None;
    let publisher: Arc<dyn SharePublisher> = if cfg.redis_url.is_empty() {
        tracing::info!("No redis_url configured, shares are logged only");
        Arc::new(LogPublisher)
    } else {
        let (publisher, task) = RedisPublisher::spawn(&cfg.redis_url, shutdown.clone())?;
        publisher_task = Some(task);
        tracing::info!("Publishing shares to Redis");
        Arc::new(publisher)
    };

    let templates = Arc::new(TemplateManager::new(
        rpc.clone(),
        jobs.clone(),
        registry.clone(),
        cfg.notify_interval(),
    ));
    // The node may still be starting; the poll loop keeps retrying.
    if let Err(e) = templates.force_update().await {
        tracing::warn!("Initial block template unavailable: {}", e);
    }

    let ctx = Arc::new(SessionContext {
        registry,
        jobs,
        validator: Arc::new(ShareValidator::new(Arc::new(StructuralVerifier))),
        publisher,
        rpc,
        refresh: templates.refresh_signal(),
        tasks: TaskTracker::new(),
        policy: SessionPolicy::from_config(&cfg),
    });

    let listener = ProxyServer::bind(&cfg.listen).context("binding stratum listener")?;
    let server = Arc::new(ProxyServer::new(ctx, server_id, shutdown.clone()));

    let template_task = tokio::spawn(templates.run(shutdown.clone()));
    let server_task = tokio::spawn(server.serve(listener));

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    let served = server_task.await.context("server task panicked")?;
    shutdown.cancel();

    let _ = template_task.await;
    if let Some(task) = publisher_task {
        let _ = task.await;
    }

    tracing::debug!("Final metrics:\n{}", metrics::render());
    served.context("stratum server failed")?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
