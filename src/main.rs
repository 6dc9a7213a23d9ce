use clap::Parser;
use tracing::info;
use tracing_subscriber::filter::{Directive, EnvFilter};

use modelgate::cli::{self, Cli};
use modelgate::error::{Error, Result};

fn init_logging(level: &str) -> Result<()> {
    let directive = format!("modelgate={}", level)
        .parse::<Directive>()
        .map_err(|e| Error::Logging(format!("bad log directive: {}", e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config_path, config) = cli::load_config(&cli)?;

    let level = if cli.debug { "debug" } else { config.logging.level.as_str() };
    init_logging(level)?;
    info!("Starting modelgate {} with config {:?}", env!("CARGO_PKG_VERSION"), config_path);

    cli::run(cli, config).await
}
