//! Kiln API Server

use anyhow::Context;
use clap::{Parser, Subcommand};
use kiln_api::{AppState, routes};
use kiln_config::{
    ExecutorBackend, LogFormat, ServerSettings, StorageBackend, SystemConfig, load_system_config,
};
use kiln_core::executor::Executor;
use kiln_db::{
    FileJobStore, FileLogStore, JobStore, LiveLogs, LogStore, PgJobStore, PgLogStore, create_pool,
    run_migrations,
};
use kiln_executor::{KubernetesExecutor, LocalDockerExecutor};
use kiln_scheduler::{Service, ServiceConfig};
use sqlx::PgPool;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kiln-server")]
#[command(about = "Kiln job execution service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server
    Run {
        /// Path to the KDL configuration file
        #[arg(env = "KILN_CONFIG", default_value = "kiln.kdl")]
        config: PathBuf,
        /// Override the listen address from the configuration
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Validate a configuration file and exit
    Check {
        #[arg(env = "KILN_CONFIG", default_value = "kiln.kdl")]
        config: PathBuf,
    },
}

fn load(path: &Path) -> anyhow::Result<SystemConfig> {
    load_system_config(path).with_context(|| format!("failed to load {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Run { config, listen } => serve(load(&config)?, listen).await,
        Command::Check { config } => {
            load(&config)?;
            println!("{} is valid", config.display());
            Ok(())
        }
    }
}

fn init_tracing(settings: &ServerSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match settings.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn serve(config: SystemConfig, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    init_tracing(&config.server);

    let mut pools = Pools::default();
    let live = LiveLogs::new();
    let job_store = job_store(&config.storage.jobs, &mut pools).await?;
    let log_store = log_store(&config.storage.logs, &mut pools, live).await?;
    let executor = executor(&config).await?;
    let cutter = config.cutter.build()?;

    let service_config = ServiceConfig {
        max_duration: config.jobs.max_duration,
        cancel_grace: config.jobs.cancel_grace,
        subscriber_buffer: config.jobs.subscriber_buffer,
        retry: config.retry.clone(),
        ..ServiceConfig::default()
    };
    let (service, report) =
        Service::start(service_config, job_store, log_store, executor, cutter).await?;
    if !report.is_empty() {
        warn!(
            interrupted = report.interrupted.len(),
            lost = report.lost.len(),
            orphans = report.orphans_stopped.len(),
            "Resolved work left behind by a previous run"
        );
    }

    let app = routes::router(AppState::new(service.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr = listen.unwrap_or(config.server.listen);
    info!("Starting server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await;
    Ok(())
}

/// Connection pools by database URL, so both stores can share one.
#[derive(Default)]
struct Pools(HashMap<String, PgPool>);

impl Pools {
    async fn get(&mut self, url: &str) -> anyhow::Result<PgPool> {
        if let Some(pool) = self.0.get(url) {
            return Ok(pool.clone());
        }
        info!("Connecting to database...");
        let pool = create_pool(url).await?;
        run_migrations(&pool).await?;
        info!("Database connected");
        self.0.insert(url.to_string(), pool.clone());
        Ok(pool)
    }
}

async fn job_store(
    backend: &StorageBackend,
    pools: &mut Pools,
) -> anyhow::Result<Arc<dyn JobStore>> {
    let store: Arc<dyn JobStore> = match backend {
        StorageBackend::File { path } => Arc::new(FileJobStore::open(path).await?),
        StorageBackend::Postgres { url } => Arc::new(PgJobStore::new(pools.get(url).await?)),
    };
    Ok(store)
}

async fn log_store(
    backend: &StorageBackend,
    pools: &mut Pools,
    live: Arc<LiveLogs>,
) -> anyhow::Result<Arc<dyn LogStore>> {
    let store: Arc<dyn LogStore> = match backend {
        StorageBackend::File { path } => Arc::new(FileLogStore::open(path, live).await?),
        StorageBackend::Postgres { url } => Arc::new(PgLogStore::new(pools.get(url).await?, live)),
    };
    Ok(store)
}

async fn executor(config: &SystemConfig) -> anyhow::Result<Arc<dyn Executor>> {
    let profiles = config.executor.profiles.clone();
    let retry = config.retry.clone();
    let executor: Arc<dyn Executor> = match &config.executor.backend {
        ExecutorBackend::Kubernetes {
            namespace,
            kubeconfig,
        } => {
            let executor = match kubeconfig {
                Some(path) => KubernetesExecutor::from_kubeconfig(path, namespace.clone()).await?,
                None => KubernetesExecutor::new(namespace.clone()).await?,
            };
            info!(namespace = executor.namespace(), "Using Kubernetes executor");
            Arc::new(executor.with_profiles(profiles).with_retry(retry))
        }
        ExecutorBackend::Docker => {
            info!("Using local Docker executor");
            Arc::new(
                LocalDockerExecutor::new()?
                    .with_profiles(profiles)
                    .with_retry(retry),
            )
        }
    };
    Ok(executor)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
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
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
