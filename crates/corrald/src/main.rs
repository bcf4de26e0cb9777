//! corrald — the Corral cluster controller.
//!
//! # Usage
//!
//! ```text
//! corrald run --config /etc/corral/corral.toml
//! corrald run --config corral.toml --data-dir /tmp/corral --port 9470 --node-id ctl-b
//! corrald check-config --config corral.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use corral_core::ControllerConfig;

#[derive(Parser)]
#[command(name = "corrald", about = "Corral cluster controller")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller until Ctrl-C.
    Run {
        /// Path to corral.toml.
        #[arg(long)]
        config: PathBuf,

        /// Override `controller.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Override `controller.api_port`.
        #[arg(long)]
        port: Option<u16>,

        /// Override `controller.node_id`.
        #[arg(long)]
        node_id: Option<String>,
    },
    /// Validate a config file and print the role graph.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,corrald=debug,corral=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            port,
            node_id,
        } => {
            let mut config = ControllerConfig::from_file(&config)?;
            if let Some(dir) = data_dir {
                config.controller.data_dir = dir;
            }
            if let Some(port) = port {
                config.controller.api_port = port;
            }
            if let Some(id) = node_id {
                config.controller.node_id = id;
            }
            corrald::run(config).await
        }
        Command::CheckConfig { config } => {
            let path = config;
            let config = ControllerConfig::from_file(&path)?;
            print!("{}", corrald::describe(&config)?);
            info!(path = %path.display(), "config ok");
            Ok(())
        }
    }
}
