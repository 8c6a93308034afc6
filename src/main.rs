//! jobwire agent
//!
//! Serves the built-in `shell` and `forward` jobs. Settings come from the
//! `JOBWIRE_CONFIG` env var; TLS material from `TLS_CERT`, `TLS_KEY` and
//! `TLS_CA` when `--tls` is given.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use jobwire::config::Config;
use jobwire::jobs::{ForwardJob, ShellJob};
use jobwire::tls::TlsConfig;
use jobwire::{Agent, Client, Registry};

#[derive(Parser, Debug)]
#[command(name = "jobwire-agent")]
#[command(about = "Agent that runs jobs for remote clients")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8814")]
    addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Require mutual TLS using TLS_CERT, TLS_KEY and TLS_CA
    #[arg(long)]
    tls: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    let tls = if args.tls {
        Some(TlsConfig::from_env().context("Failed to load TLS configuration")?)
    } else {
        None
    };

    let mut client = Client::new(config.conn.clone());
    if let Some(tls) = &tls {
        client = client.with_tls(tls.clone());
    }

    let registry = Arc::new(Registry::new());
    registry.add_steps(ShellJob::default());
    registry.add(ForwardJob::new(client));
    info!(jobs = ?registry.types(), tls = args.tls, "Starting agent");

    let mut builder = Agent::builder(registry).config(config);
    if let Some(tls) = tls {
        builder = builder.tls(tls);
    }
    builder
        .build()
        .start(&args.addr)
        .await
        .with_context(|| format!("Agent on {} failed", args.addr))?;

    Ok(())
}
