//! trainbench-server — HTTP API for the experiment console.

mod routes;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use trainbench_core::{AppConfig, ExperimentStore, RunSupervisor, model};

#[derive(Parser, Debug)]
#[command(name = "trainbench-server", about = "Experiment console API server")]
struct Args {
    /// Path to the service configuration file.
    #[arg(long, default_value = "configs/trainbench.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        )
        .init();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;
    tracing::info!("Configs loaded from {}", args.config.display());

    tracing::info!("Seeding numeric backend with {}", config.seed);
    model::seed_backend(config.seed);

    let store = Arc::new(ExperimentStore::new(&config)?);
    let supervisor = Arc::new(RunSupervisor::new());
    let app = routes::router(routes::AppState { store, supervisor });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server is listening at {addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
