mod cli;
mod config;
mod logging;
mod loopback;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Command};
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config())?;

    let config = Config::from_env()?;
    tracing::debug!(
        ice_servers = config.engine.ice_servers.len(),
        poll_attempts = config.engine.offer_poll_attempts,
        "configuration loaded"
    );

    match cli.command {
        Command::Loopback(args) => loopback::run(config, args).await,
    }
}
