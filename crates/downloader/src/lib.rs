#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # podprof-downloader
//!
//! Fetch pprof profiles from pods that are not directly reachable.
//!
//! A [`Downloader`] owns one tunnel to one pod. Each
//! [`download`](Downloader::download) waits for the tunnel, issues
//! `GET /debug/pprof/<kind>` against the local end, and streams the body into
//! a caller-supplied sink. If the tunnel dies mid-request the call fails with
//! [`Error::Cancelled`] instead of hanging.
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use podprof_downloader::{DownloadOption, Downloader, DownloaderConfig, ProfileType};
//! use podprof_tunnel::PodTarget;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = DownloaderConfig::from_env();
//! let target = PodTarget::new(&config.namespace, "activator-5979f56548-w59cm")?;
//! let stop = CancellationToken::new();
//! let downloader = Downloader::connect(&config, target, stop.clone())?;
//!
//! let mut file = tokio::fs::File::create("activator.pprof").await?;
//! downloader
//!     .download(
//!         ProfileType::Cpu,
//!         &mut file,
//!         &[DownloadOption::Duration(Duration::from_secs(30))],
//!     )
//!     .await?;
//! stop.cancel();
//! ```

pub mod config;
pub mod downloader;
pub mod error;
pub mod options;
pub mod profile;

// Re-export commonly used items
pub use config::{DEFAULT_API_SERVER, DEFAULT_NAMESPACE, DownloaderConfig};
pub use downloader::{Downloader, ProfileDownloader, ProfileSink};
pub use error::{Error, ErrorKind, Result};
pub use options::{DownloadOption, MAX_DEBUG_LEVEL, apply_options};
pub use profile::{PPROF_PATH_PREFIX, ProfileType};
