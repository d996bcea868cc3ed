use std::path::PathBuf;

use clap::Parser;
use n0_snafu::Result;
use scrape_bridge::{config::Config, server::run_with_config_until_ctrl_c};
use tracing::debug;
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Cli {
    /// Path to config file
    #[clap(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Cli::parse();

    let config = if let Some(path) = args.config {
        debug!("loading config from {:?}", path);
        Config::load(path).await?
    } else {
        debug!("using default config");
        Config::default()
    };
    let config = config.apply_env()?;

    run_with_config_until_ctrl_c(config).await?;
    Ok(())
}
