//! lightsailctl entry point
//!
//! Amazon Lightsail plugin for the AWS CLI.

use clap::Parser;
use lightsailctl::cli::{default_log_filter, plugin, Cli};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("{}", lightsailctl::VERSION);
        return Ok(());
    }

    if !cli.plugin {
        let prog = std::env::args()
            .next()
            .unwrap_or_else(|| lightsailctl::APP_NAME.to_string());
        anyhow::bail!("{} can't be used directly, it is meant to be invoked by AWS CLI", prog);
    }

    let input = plugin::read_input(&cli.input)?;

    // Progress and diagnostics share stderr; stdout is reserved for results
    let default_filter = default_log_filter(input.configuration.debug);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    plugin::execute(input).await
}
