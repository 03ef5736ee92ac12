use std::env::var;

use clap::Parser;
use eyre::Result as EyreResult;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, EnvFilter};

mod cli;

use cli::RootCommand;

// The engine's own scheduler is fully synchronous (spec §5: one
// cooperative `execute()` tick, no async collaborators) so this binary
// has no use for an async runtime, unlike the teacher's `merod::main`.
fn main() -> EyreResult<()> {
    setup()?;
    RootCommand::parse().run()
}

fn setup() -> EyreResult<()> {
    let directives = match var("RUST_LOG") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => "cbe=info,cbe_core=info".to_owned(),
    };

    registry()
        .with(EnvFilter::builder().parse(directives)?)
        .with(layer())
        .init();

    color_eyre::install()?;
    Ok(())
}
