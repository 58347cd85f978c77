use anyhow::Result;
use clap::Parser;

mod attention;
mod cli;
mod config;
mod constants;
mod dataset;
mod error;
mod layers;
mod metrics;
mod model;
mod scheduler;
mod tokenizer;
mod train;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("wikigpt=info")),
        )
        .init();

    cli::Cli::parse().run()
}
