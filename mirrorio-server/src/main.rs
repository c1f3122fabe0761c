mod config;
mod server;

use clap::{Parser, Subcommand};
use config::Config;
use mirrorio_core::{Loader, build_registry};
use server::run_server;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "mirrorio")]
#[command(about = "Synchronous quorum replication over blob storage backends")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mirrorio=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting Mirrorio server with config: {}", config);

            let cfg = match Config::from_file(&config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            let registry = match build_registry(&cfg.definitions()) {
                Ok(registry) => registry,
                Err(e) => {
                    tracing::error!("Failed to build storage topology: {}", e);
                    std::process::exit(1);
                }
            };

            let root = match registry.resolve(&cfg.serve) {
                Ok(root) => root,
                Err(e) => {
                    tracing::error!("Failed to resolve serve store: {}", e);
                    std::process::exit(1);
                }
            };

            tracing::info!(
                "Serving '{}' over {} configured stores",
                cfg.serve,
                cfg.stores.len()
            );

            if let Err(e) = run_server(cfg, root).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
    }
}
