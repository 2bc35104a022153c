//! shelfdb server binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shelfdb_engine::{
    recover, AppConfig, AppState, EmbeddingClient, FileStorage, StorageBackend, VectorDbService,
};

#[derive(Parser)]
#[command(name = "shelfdb", about = "shelfdb vector database server")]
struct Cli {
    /// Directory for durable storage (overrides SHELFDB_DATA_DIR)
    #[arg(short, long)]
    data_dir: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Bind host
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Bind port (overrides SHELFDB_API_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env().context("invalid configuration")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir.into();
    }

    match cli.cmd {
        Commands::Serve { host, port } => {
            if let Some(port) = port {
                config.api_port = port;
            }
            serve(config, host).await
        }
    }
}

async fn serve(config: AppConfig, host: String) -> Result<()> {
    let data_path = config.data_path();
    info!(data_path = %data_path.display(), "opening storage");
    let storage: Arc<dyn StorageBackend> = Arc::new(
        FileStorage::open(&data_path)
            .await
            .context("failed to open storage")?,
    );

    let embedder = match EmbeddingClient::new(config.embedding.clone()) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            error!(error = %e, "embedding client unavailable");
            None
        }
    };
    let state = AppState::new(embedder);

    // Bind before recovery so early requests get a clean 503 instead of a
    // connection refusal.
    let addr = format!("{host}:{}", config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "listening; recovery in progress");

    let app = shelfdb_engine::router(state.clone());
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let store = recover(&storage).await.context("recovery failed")?;
    let n_libraries = store.len();
    state.set_service(Arc::new(VectorDbService::with_store(store, storage)));
    info!(n_libraries, "recovery complete; serving");

    server
        .await
        .context("server task panicked")?
        .context("server failed")?;
    Ok(())
}
