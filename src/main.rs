use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use sandbox_engine::api::{self, AppState};
use sandbox_engine::config::Config;
use sandbox_engine::filestore::{DiskStore, FileStore, MemoryStore};
use sandbox_engine::metrics::MetricsRegistry;
use sandbox_engine::worker::{Worker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env());
    init_tracing(&config);
    tracing::info!(?config, "config loaded");

    let store: Arc<dyn FileStore> = match &config.work_dir {
        Some(dir) => Arc::new(DiskStore::new(dir.clone()).context("open file store")?),
        None => Arc::new(MemoryStore::new()),
    };
    let metrics = Arc::new(MetricsRegistry::new());
    let worker = Worker::new(
        WorkerConfig {
            parallelism: config.parallelism,
            container_root: config.container_root(),
            cgroup_prefix: config.cgroup_prefix.clone(),
            enable_cpu_rate: config.enable_cpu_rate,
            cpu_cfs_period_us: config.cpu_cfs_period_us,
            tick_interval: config.time_limit_checker_interval,
            extra_memory_limit: config.extra_memory_limit,
            defaults: config.exec_defaults(),
        },
        store,
        metrics.clone(),
    );

    if config.pre_fork > 0 {
        tracing::info!(count = config.pre_fork, "preforking containers");
        worker
            .prefork(config.pre_fork)
            .await
            .context("prefork containers")?;
    }

    let app = api::routes(AppState {
        config: config.clone(),
        worker: worker.clone(),
        metrics,
    });
    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("bind {}", config.http_addr))?;
    tracing::info!(addr = %config.http_addr, parallelism = config.parallelism, "sandbox execution engine ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    worker.shutdown().await;
    tracing::info!("worker shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}

fn init_tracing(config: &Config) {
    if config.silent {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    if config.release {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}
