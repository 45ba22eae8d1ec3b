//! CLI definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use podprof_downloader::{DownloadOption, DownloaderConfig, ProfileType, Result};

/// podprof - pprof profiles from pods
#[derive(Parser, Debug)]
#[command(name = "podprof")]
#[command(version)]
#[command(about = "Download a pprof profile from a pod through an ephemeral port-forward tunnel")]
#[command(
    long_about = "podprof opens a port-forward tunnel to one pod, fetches one profile from its /debug/pprof/ endpoint, and writes it to a file. Press Ctrl+C to abort; the tunnel is torn down and an in-flight download is cancelled."
)]
pub struct Cli {
    /// Pod to profile
    #[arg(short, long)]
    pub pod: String,

    /// Namespace of the pod (defaults to the configured namespace)
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Cluster API server URL (defaults to a local `kubectl proxy`)
    #[arg(long)]
    pub api_server: Option<String>,

    /// Configuration file (TOML, or JSON by extension)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Profile kind (heap, cpu, block, trace, mem-allocs, mutex, goroutine, thread-create)
    #[arg(long)]
    pub profile: ProfileType,

    /// Sampling window in seconds for cpu and trace profiles
    #[arg(short, long)]
    pub seconds: Option<u64>,

    /// Text rendering level (0-2)
    #[arg(long)]
    pub debug: Option<u8>,

    /// Run a garbage collection before taking a heap sample
    #[arg(long, default_value_t = false)]
    pub gc: bool,

    /// Port of the pprof server inside the pod
    #[arg(long)]
    pub remote_port: Option<u16>,

    /// Local port for the tunnel (0 picks an ephemeral port)
    #[arg(long)]
    pub local_port: Option<u16>,

    /// File to write the profile to (defaults to `<pod>-<profile>.<ext>`)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl Cli {
    /// Resolve the downloader configuration.
    ///
    /// Starts from the config file when given, otherwise from the
    /// environment, then applies command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be read or parsed.
    pub fn downloader_config(&self) -> Result<DownloaderConfig> {
        let mut config = match &self.config {
            Some(path) => DownloaderConfig::from_file(path)?,
            None => DownloaderConfig::from_env(),
        };

        if let Some(namespace) = &self.namespace {
            config.namespace.clone_from(namespace);
        }
        if let Some(api_server) = &self.api_server {
            config.api_server.clone_from(api_server);
        }
        if let Some(port) = self.remote_port {
            config.remote_port = port;
        }
        if let Some(port) = self.local_port {
            config.local_port = port;
        }

        Ok(config)
    }

    /// Where the profile is written.
    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            PathBuf::from(format!(
                "{}-{}.{}",
                self.pod,
                self.profile,
                self.profile.file_extension()
            ))
        })
    }

    /// Request options in the order they are applied.
    pub fn download_options(&self) -> Vec<DownloadOption> {
        let duration = self
            .seconds
            .map(|secs| DownloadOption::Duration(Duration::from_secs(secs)));
        let debug = self.debug.map(DownloadOption::Debug);
        let gc = self.gc.then_some(DownloadOption::GarbageCollect);

        [duration, debug, gc].into_iter().flatten().collect()
    }
}
