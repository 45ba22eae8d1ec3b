//! # podprof
//!
//! Fetch one pprof profile from one pod and write it to a file.
//!
//! ## Sequence
//!
//! 1. **Configuration** - config file or environment, then flag overrides
//! 2. **Tunnel** - start the port-forward in the background
//! 3. **Download** - wait for the tunnel, fetch, stream into the output file
//! 4. **Teardown** - cancel the stop token so the tunnel task exits
//!
//! Ctrl+C cancels the same stop token, which aborts an in-flight download.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use podprof::cli::Cli;
use podprof_downloader::Downloader;
use podprof_tunnel::PodTarget;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli
        .downloader_config()
        .context("Failed to load configuration")?;
    let target = PodTarget::new(config.namespace.as_str(), cli.pod.as_str())
        .with_context(|| format!("Invalid pod reference {}/{}", config.namespace, cli.pod))?;

    if cli.seconds.is_some() && !cli.profile.supports_duration() {
        warn!(profile = %cli.profile, "--seconds only bounds cpu and trace profiles");
    }

    let stop = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(stop.clone()));

    let downloader = Downloader::connect(&config, target, stop.clone())
        .context("Failed to start port-forward tunnel")?;

    let output_path = cli.output_path();
    let mut output = tokio::fs::File::create(&output_path)
        .await
        .with_context(|| format!("Failed to create {}", output_path.display()))?;

    let start = Instant::now();
    let result = downloader
        .download(cli.profile, &mut output, &cli.download_options())
        .await;
    stop.cancel();

    let written =
        result.with_context(|| format!("Failed to download {} profile from {}", cli.profile, cli.pod))?;
    info!(
        output = %output_path.display(),
        bytes = written,
        "Saved {} profile in {:?}",
        cli.profile,
        start.elapsed()
    );

    Ok(())
}

/// Initialize tracing subscriber.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn cancel_on_ctrl_c(stop: CancellationToken) {
    tokio::select! {
        () = stop.cancelled() => {}
        signal = signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    info!("Received Ctrl+C, stopping tunnel");
                    stop.cancel();
                }
                Err(err) => error!("Failed to listen for shutdown signal: {}", err),
            }
        }
    }
}
