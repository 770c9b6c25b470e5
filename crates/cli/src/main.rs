//! Murmur CLI — the main entry point.
//!
//! Commands:
//! - `serve`  — Start the WebSocket gateway
//! - `config` — Print the effective configuration

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "murmur",
    about = "Murmur — a voice assistant gateway",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WebSocket gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the effective configuration (secrets redacted)
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve { port } => {
            let mut config = murmur_config::AppConfig::load()?;
            if let Some(port) = port {
                config.gateway.port = port;
            }
            murmur_gateway::start(config).await?;
        }
        Commands::Config => {
            let config = murmur_config::AppConfig::load()?;
            println!("{config:#?}");
            println!(
                "\nConfig file: {}",
                murmur_config::AppConfig::config_dir()
                    .join("config.toml")
                    .display()
            );
        }
    }

    Ok(())
}
