use std::env::var;

use clap::Parser;
use eyre::Result as EyreResult;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, EnvFilter};

mod cli;
mod defaults;

use cli::RootCommand;

/// Used when `RUST_LOG` is unset or blank.
const LOG_DIRECTIVES: &str = "stratad=info,strata_transfer=info,strata_utils_sync=warn";

#[tokio::main]
async fn main() -> EyreResult<()> {
    init_reporting()?;

    RootCommand::parse().run().await
}

fn init_reporting() -> EyreResult<()> {
    let directives = var("RUST_LOG")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| LOG_DIRECTIVES.to_owned());

    registry()
        .with(EnvFilter::builder().parse(directives)?)
        .with(layer().with_target(false))
        .init();

    color_eyre::install()
}
