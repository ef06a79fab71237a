use anyhow::{Context, Result};
use edge_worker::{
    api,
    connectivity::Connectivity,
    fetch::HttpFetcher,
    store::{FileStore, MemoryStore, ResponseStore},
    InterceptorSettings, RequestInterceptor, WorkerConfig, WorkerState,
};
use std::sync::Arc;
use telemetry::LogConfig;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = telemetry::init_structured_logging(
        LogConfig::new("edge-worker").with_version(common::VERSION),
    );

    let config = WorkerConfig::from_env()?;
    let bind_addr = config.bind_addr;

    let store: Arc<dyn ResponseStore> = match &config.store_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "using file response store");
            Arc::new(
                FileStore::open(dir)
                    .await
                    .with_context(|| format!("failed to open store at {}", dir.display()))?,
            )
        }
        None => {
            info!("using in-memory response store");
            Arc::new(MemoryStore::new())
        }
    };

    let connectivity = Connectivity::default();
    if let Some(probe_url) = config.probe_url.clone() {
        info!(url = %probe_url, interval_ms = config.probe_interval.as_millis() as u64, "connectivity probe enabled");
        connectivity.spawn_probe(probe_url, config.probe_interval)?;
    }

    let fetcher = Arc::new(HttpFetcher::new().context("failed to build http client")?);
    let interceptor = Arc::new(RequestInterceptor::new(
        InterceptorSettings::from(&config),
        store,
        fetcher,
        connectivity,
    ));
    interceptor.install().await;

    if let Some(handshake) = config.bootstrap.clone() {
        interceptor
            .configure(handshake)
            .await
            .context("invalid EDGE_APP_NAME bootstrap configuration")?;
    } else if interceptor.current().await.is_none() {
        info!("waiting for configuration handshake");
    }

    let app = api::router(WorkerState::new(interceptor));
    let listener = TcpListener::bind(bind_addr).await?;

    info!(
        addr = %bind_addr,
        mode = config.rewrite_mode.as_str(),
        "edge worker listening"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            let _ = sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
