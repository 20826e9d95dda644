use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use gatekeep::comms::local_api;
use gatekeep::config::Config;
use gatekeep::utils::logging;

#[derive(Parser)]
#[command(name = "gatekeep", version, about = "Request governance gateway")]
struct AppCli {
    /// Config file path
    #[arg(short, long, default_value = "config.json", global = true)]
    config: String,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Overrides server.port from the config file
        #[arg(long)]
        port: Option<u16>,
    },
    /// Load and validate the config file, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = AppCli::parse();
    logging::init(&args.log_level);

    let config = Config::from_file(&args.config)?;
    match args.command {
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.server.port);
            info!(version = gatekeep::VERSION, port, "starting gatekeep");
            local_api::serve(config, port).await?;
        }
        Commands::CheckConfig => {
            info!(path = %args.config, "config is valid");
        }
    }

    Ok(())
}
