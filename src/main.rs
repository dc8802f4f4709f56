use anyhow::{Context, Result};
use clap::Parser;
use fzsync::cli::{Cli, OutputFormat};
use fzsync::demo;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber; info and above unless --debug is set
fn init_tracing(debug: bool) {
    let level = if debug {
        tracing::Level::TRACE
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    let config = args.pair_config().context("Failed to load configuration")?;
    config.validate()?;

    let report = demo::run_demo(config, args.window, args.seed)?;

    match args.format {
        OutputFormat::Text => print!("{}", report),
        OutputFormat::Json => println!("{}", report.to_json()?),
    }

    Ok(())
}
