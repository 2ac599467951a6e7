use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use registry_core::{
    load_config, validate_config, Config, MessageQueue, ProcessManager, RegistryStore,
    ServiceTaskManagers, SqliteMessageQueue, SqliteRegistryStore, Wiper,
};
use registry_server::api::create_router;
use registry_server::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "registry", version, about = "Drive scheduled publication retrievals")]
struct Cli {
    /// Configuration file. Defaults to $REGISTRY_CONFIG, then config.toml.
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan due jobs and advance incomplete jobs once
    Process {
        /// Only process this collection
        #[arg(long)]
        collection: Option<i64>,
    },
    /// Wipe temporary data of completed jobs once
    Cleanup,
    /// Delete old jobs of every collection, keeping the active job and a backup
    DeleteJobs {
        /// Only log what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
    /// Wipe and delete one job
    DeleteJob {
        /// Job ID
        id: i64,
    },
    /// Consume export-wipe messages until interrupted
    Wiper,
    /// Run the process and cleanup loops with the HTTP status surface
    Serve,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(|| std::env::var("REGISTRY_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_tracing(config.logging.json);
    info!(version = VERSION, "Loaded configuration from {:?}", config_path);

    validate_config(&config).context("Configuration validation failed")?;
    info!("Database path: {:?}", config.database.path);

    let store: Arc<dyn RegistryStore> = Arc::new(
        SqliteRegistryStore::new(&config.database.path)
            .context("Failed to open registry store")?,
    );
    let queue: Arc<dyn MessageQueue> = Arc::new(
        SqliteMessageQueue::new(&config.database.path).context("Failed to open message queue")?,
    );

    let managers = ServiceTaskManagers::from_config(&config, Arc::clone(&queue))
        .context("Failed to create task managers")?;
    let manager = Arc::new(ProcessManager::new(
        config.orchestrator.clone(),
        Arc::clone(&store),
        Arc::new(managers),
    ));

    match cli.command {
        Command::Process { collection: Some(id) } => {
            let report = manager
                .process_collection(id)
                .await
                .with_context(|| format!("Failed to process collection {}", id))?;
            info!(
                planned = ?report.planned_job,
                advanced = report.jobs_advanced,
                succeeded = report.jobs_succeeded,
                failed = report.jobs_failed,
                "Processed collection {}",
                id
            );
        }
        Command::Process { collection: None } => {
            manager.process_all().await.context("Processing failed")?;
        }
        Command::Cleanup => {
            let summary = manager.cleanup().await.context("Cleanup failed")?;
            info!(
                archived = summary.archived,
                failed = summary.failed,
                "Cleanup finished"
            );
        }
        Command::DeleteJobs { dry_run } => {
            let collections = store.list_collections().context("Failed to list collections")?;
            let mut total = 0;
            for collection in &collections {
                match manager.delete_older_jobs(collection, dry_run).await {
                    Ok(ids) => total += ids.len(),
                    Err(e) => error!("Publication {}: Unable to delete old jobs: {}", collection, e),
                }
            }
            if dry_run {
                info!("{} jobs would be deleted", total);
            } else {
                info!("Deleted {} jobs", total);
            }
        }
        Command::DeleteJob { id } => {
            manager
                .delete_job(id)
                .await
                .with_context(|| format!("Failed to delete job {}", id))?;
        }
        Command::Wiper => run_wiper(&config, queue).await?,
        Command::Serve => serve(config, manager, queue).await?,
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run_wiper(config: &Config, queue: Arc<dyn MessageQueue>) -> Result<()> {
    let wiper = Wiper::new(queue, config.exporter.export_dir.clone())
        .with_poll_interval(Duration::from_millis(config.queue.poll_interval_ms))
        .with_visibility_timeout(Duration::from_secs(config.queue.visibility_timeout_secs))
        .with_acked_retention(Duration::from_secs(config.queue.acked_retention_secs));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    wiper.run(shutdown_rx).await;
    Ok(())
}

async fn serve(
    config: Config,
    manager: Arc<ProcessManager>,
    queue: Arc<dyn MessageQueue>,
) -> Result<()> {
    manager.start();

    let addr = SocketAddr::new(config.server.host, config.server.port);
    let state = Arc::new(AppState::new(config, Arc::clone(&manager), queue));
    let app = create_router(state);

    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Stopping process manager...");
    manager.stop().await;
    info!("Server shut down");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
}
