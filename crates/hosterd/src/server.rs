//! Daemon assembly and lifecycle.
//!
//! Startup order: store → runtimes → pool → deployer → workers →
//! listeners. Shutdown runs the same chain backwards: listeners drain,
//! workers stop, the pool closes, the store closes. Past the configured
//! timeout, whatever is still in flight is abandoned.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use hoster_api::ApiState;
use hoster_core::{Config, SecretCipher};
use hoster_deployer::Deployer;
use hoster_docker::LocalRuntime;
use hoster_nodes::NodePool;
use hoster_proxy::{proxy_router, ProxyState};
use hoster_store::Store;
use hoster_workers::{
    BillingReporter, BillingSink, DnsVerifier, HealthChecker, HttpBillingSink, NoopBillingSink,
    Provisioner, WorkerHandle,
};

/// Daemon-level failures, keyed to the process exit codes.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("initialization failed: {0}")]
    Init(String),

    #[error("database error: {0}")]
    Database(#[from] hoster_store::StoreError),

    #[error("http server error: {0}")]
    Http(#[from] std::io::Error),
}

pub async fn run(config: Config) -> Result<(), RunError> {
    info!("hoster control plane starting");

    // ── Storage ────────────────────────────────────────────────────

    std::fs::create_dir_all(config.database.configs_dir())
        .map_err(|e| RunError::Init(format!("data dir: {e}")))?;
    let store = Store::open(&config.database.db_path()).await?;
    info!(path = ?config.database.db_path(), "store opened");

    // ── Runtimes & node pool ───────────────────────────────────────

    let local = Arc::new(
        LocalRuntime::connect().map_err(|e| RunError::Init(format!("local daemon: {e}")))?,
    );
    info!("local container runtime ready");

    let cipher = match &config.nodes.encryption_key {
        Some(key) => Some(
            SecretCipher::new(key.as_bytes())
                .map_err(|e| RunError::Init(format!("encryption key: {e}")))?,
        ),
        None => None,
    };
    let pool = Arc::new(
        NodePool::new(
            config.nodes.minion_binary_path.clone(),
            Duration::from_secs(config.nodes.ssh_timeout_secs),
        )
        .map_err(|e| RunError::Init(format!("node pool: {e}")))?,
    );
    if cipher.is_some() {
        info!("remote-node features enabled");
    } else {
        info!("remote-node features disabled (no encryption key)");
    }

    let mut deployer = Deployer::new(
        store.clone(),
        local.clone(),
        (config.proxy.port_range_start, config.proxy.port_range_end),
    );
    if let Some(cipher) = &cipher {
        deployer = deployer.with_remote(pool.clone(), cipher.clone());
    }
    let deployer = Arc::new(deployer);

    // ── Workers ────────────────────────────────────────────────────

    let mut workers: Vec<WorkerHandle> = Vec::new();
    if let Some(cipher) = &cipher {
        workers.push(
            HealthChecker::new(
                store.clone(),
                pool.clone(),
                cipher.clone(),
                Duration::from_secs(config.workers.health_interval_secs),
                config.workers.health_max_concurrent,
                Duration::from_secs(config.workers.health_check_timeout_secs),
            )
            .start(),
        );
        workers.push(
            Provisioner::new(
                store.clone(),
                cipher.clone(),
                Duration::from_secs(config.workers.provision_interval_secs),
                config.workers.provision_max_concurrent,
            )
            .start(),
        );
    }
    workers.push(
        DnsVerifier::new(
            store.clone(),
            Duration::from_secs(config.workers.dns_interval_secs),
            Duration::from_secs(config.workers.dns_startup_delay_secs),
            config.workers.dns_max_concurrent,
        )
        .start(),
    );
    let sink: Arc<dyn BillingSink> = match &config.workers.billing_endpoint {
        Some(endpoint) => Arc::new(HttpBillingSink::new(
            endpoint.clone(),
            config.workers.billing_token.clone(),
        )),
        None => Arc::new(NoopBillingSink),
    };
    workers.push(
        BillingReporter::new(
            store.clone(),
            sink,
            Duration::from_secs(config.workers.billing_interval_secs),
            config.workers.billing_batch_size,
        )
        .start(),
    );
    info!(count = workers.len(), "workers started");

    // ── Listeners ──────────────────────────────────────────────────

    let api = hoster_api::build_router(ApiState {
        store: store.clone(),
        deployer,
        cipher: cipher.clone(),
        base_domain: config.server.base_domain.clone(),
        gateway_secret: config.gateway.shared_secret.clone(),
    });
    let proxy = proxy_router(ProxyState::new(
        store.clone(),
        config.server.base_domain.clone(),
    ));

    let api_listener = tokio::net::TcpListener::bind(config.server.api_address()).await?;
    let proxy_listener = tokio::net::TcpListener::bind(config.server.proxy_address()).await?;
    info!(api = %config.server.api_address(), proxy = %config.server.proxy_address(), "listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(wait_for_signal(shutdown_tx));

    let mut api_shutdown = shutdown_rx.clone();
    let api_server = axum::serve(
        api_listener,
        api.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = api_shutdown.changed().await;
    });
    let mut proxy_shutdown = shutdown_rx.clone();
    let proxy_server = axum::serve(
        proxy_listener,
        proxy.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = proxy_shutdown.changed().await;
    });

    let (api_result, proxy_result) = tokio::join!(api_server, proxy_server);
    api_result?;
    proxy_result?;

    // ── Shutdown chain ─────────────────────────────────────────────

    let budget = Duration::from_secs(config.server.shutdown_timeout_secs);
    let teardown = async {
        for worker in &mut workers {
            worker.stop().await;
        }
        pool.close_all().await;
        store.close().await;
    };
    if tokio::time::timeout(budget, teardown).await.is_err() {
        warn!(secs = budget.as_secs(), "shutdown timeout exceeded, abandoning in-flight work");
    }

    info!("hoster control plane stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = ctrl_c.await;
                let _ = shutdown_tx.send(true);
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!("SIGINT received"),
            _ = term.recv() => info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("shutdown signal received");
    }
    let _ = shutdown_tx.send(true);
}
