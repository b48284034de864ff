use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ringcap::config::{CliArgs, Command, Config};
use ringcap::stats::CaptureMetrics;
use ringcap::{attach, bench};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    config.validate()?;
    let metrics = CaptureMetrics::new();

    match cli.command {
        Command::Bench { .. } => {
            let report = tokio::task::block_in_place(|| bench::run(&config, &metrics))?;
            if config.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report);
            }
        }
        Command::Attach { .. } => {
            let summary = attach::run(&config, &metrics).await?;
            if config.json {
                println!("{}", serde_json::to_string(&summary)?);
            } else {
                println!("{}", summary);
            }
        }
    }

    if let Some(path) = &config.metrics_path {
        metrics.write_to(path)?;
    }

    Ok(())
}
