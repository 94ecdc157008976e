#![warn(missing_docs)]

//! `cvault` entry point.

use anyhow::Result;
use chunkvault_repo::cli::Cli;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    Cli::parse().run()
}
