mod commands;
mod config;
mod router;

use std::io::{self, Write};

use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use volstore_s3::S3Connector;

use config::Config;
use router::Router;

fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries command output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let config = Config::parse();
    let context = config.execution_context();
    let storage = config.storage_config();

    let router = match storage.validate()? {
        Some((volume, mount_path)) => {
            debug!(volume, mount_path = %mount_path.display(), ?context, "using remote volume");
            let connector = S3Connector::from_config(&config.s3)?;
            Router::open(&storage, &connector, context)?
        }
        None => Router::local(context),
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    commands::run(&config.command, &router, &mut io::stdin().lock(), &mut out)?;
    out.flush()?;
    Ok(())
}
