use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::load_config::load_config;
use crate::server::start_server;

/// CLI for doxygen-service: turn uploaded source tarballs into HTML documentation.
#[derive(Parser)]
#[clap(
    name = "doxygen-service",
    version,
    about = "HTTP service that runs doxygen over an uploaded source tarball and returns the HTML"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP API until the process is stopped
    Serve {
        /// Path to the YAML config file; built-in defaults when omitted
        #[clap(long)]
        config: Option<PathBuf>,
        /// Address to listen on, overriding the config file
        #[clap(long)]
        listen: Option<String>,
    },
}

/// Async CLI entrypoint shared by main() and the integration tests.
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Serve { config, listen } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            config.trace_loaded();
            start_server(&config).await
        }
    }
}
