//! Entry point for the `git-cascade` executable.

#![warn(clippy::all, clippy::as_conversions, clippy::dbg_macro)]

mod commands;
mod opts;

use clap::Parser;
use eyre::eyre;
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::fmt as tracing_fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn install_tracing() -> eyre::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .parse(std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_|
            // Limit to first-party logs by default in case third-party
            // packages log spuriously.
            "git_cascade=warn,cascade=warn".to_string()))?;
    let fmt_layer = tracing_fmt::layer().with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .try_init()
        .map_err(|err| eyre!("installing tracing subscriber: {err}"))?;
    Ok(())
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    install_tracing()?;
    let opts = opts::Opts::parse();
    let exit_code = commands::dispatch(opts)?;
    std::process::exit(exit_code.into_i32_or_default());
}
