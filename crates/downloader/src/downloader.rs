//! Profile retrieval over a pod tunnel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use podprof_tunnel::{PodTarget, PortForwarder, TunnelError, TunnelHandle, WebSocketForwarder};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::config::DownloaderConfig;
use crate::error::{Error, Result};
use crate::options::{DownloadOption, apply_options};
use crate::profile::ProfileType;

/// Byte sink receiving a downloaded profile.
pub type ProfileSink<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);

/// Anything that can fetch a profile into a sink.
#[async_trait]
pub trait ProfileDownloader: Send + Sync {
    /// Fetch `profile` into `sink`, returning the number of bytes written.
    async fn download(
        &self,
        profile: ProfileType,
        sink: ProfileSink<'_>,
        options: &[DownloadOption],
    ) -> Result<u64>;
}

/// Downloads profiles from one pod through a tunnel it owns.
///
/// The tunnel starts connecting when the downloader is built and lives until
/// the stop token given at construction is cancelled. Calls to
/// [`download`](Self::download) on one downloader are served one at a time,
/// in arrival order; a call made while another is in flight waits for it.
#[derive(Debug)]
pub struct Downloader {
    tunnel: TunnelHandle,
    http_client: reqwest::Client,
    in_flight: Mutex<()>,
}

impl Downloader {
    /// Start a tunnel to `target` through `forwarder`.
    ///
    /// # Errors
    ///
    /// Fails only when the tunnel cannot even be started (no runtime, or an
    /// endpoint the forwarder rejects) or the HTTP client cannot be built.
    /// Dial failures surface from [`download`](Self::download).
    pub fn new(
        forwarder: Arc<dyn PortForwarder>,
        target: PodTarget,
        config: &DownloaderConfig,
        stop: CancellationToken,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder().no_proxy();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http_client = builder.build()?;

        let tunnel = podprof_tunnel::connect(forwarder, target, config.tunnel_config(), stop)?;

        Ok(Self {
            tunnel,
            http_client,
            in_flight: Mutex::new(()),
        })
    }

    /// Start a tunnel through the cluster API server named in `config`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unparseable API server, otherwise
    /// the same errors as [`Downloader::new`].
    pub fn connect(
        config: &DownloaderConfig,
        target: PodTarget,
        stop: CancellationToken,
    ) -> Result<Self> {
        let forwarder = config
            .headers
            .iter()
            .fold(
                WebSocketForwarder::new(config.api_server_url()?),
                |forwarder, (name, value)| forwarder.with_header(name, value),
            );
        Self::new(Arc::new(forwarder), target, config, stop)
    }

    /// The tunnel this downloader fetches through.
    pub const fn tunnel(&self) -> &TunnelHandle {
        &self.tunnel
    }

    /// Fetch `profile` into `sink`.
    ///
    /// Waits for the tunnel, applies `options` in order, and streams a 2xx
    /// body into `sink`. If the tunnel terminates while the request is in
    /// flight the request is dropped and the call fails with
    /// [`Error::Cancelled`]. Bytes already written to `sink` before a failure
    /// are not rolled back.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedProfile`] for [`ProfileType::Unknown`], before
    ///   touching the tunnel.
    /// - [`Error::Tunnel`] or [`Error::TunnelUnavailable`] if the tunnel
    ///   terminated before it was usable for this call.
    /// - [`Error::InvalidOption`] from the first failing option.
    /// - [`Error::Remote`] for a non-success status; nothing is written.
    /// - [`Error::Http`] or [`Error::Io`] while streaming.
    pub async fn download(
        &self,
        profile: ProfileType,
        sink: ProfileSink<'_>,
        options: &[DownloadOption],
    ) -> Result<u64> {
        let path = profile.path()?;

        let _exclusive = self.in_flight.lock().await;
        let local = self.wait_ready().await?;

        let mut url = profile_url(local, &path)?;
        apply_options(&mut url, options)?;

        let start = Instant::now();
        let written = tokio::select! {
            biased;
            cause = self.tunnel.terminated() => {
                return Err(Error::cancelled(cause.as_ref()));
            }
            result = self.fetch(url, sink) => result?,
        };

        info!(
            pod = %self.tunnel.target(),
            %profile,
            bytes = written,
            duration_ms = start.elapsed().as_millis(),
            "Profile downloaded"
        );
        Ok(written)
    }

    async fn wait_ready(&self) -> Result<SocketAddr> {
        match self.tunnel.ready().await {
            Ok(local) => Ok(local),
            Err(TunnelError::Closed) => Err(Error::TunnelUnavailable),
            Err(e) => Err(Error::Tunnel(e)),
        }
    }

    async fn fetch(&self, url: Url, sink: ProfileSink<'_>) -> Result<u64> {
        debug!(%url, "Requesting profile");
        let mut response = self.http_client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(Error::remote(status.as_u16(), body));
        }

        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            sink.write_all(&chunk).await?;
            written = written.saturating_add(chunk.len() as u64);
        }
        sink.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl ProfileDownloader for Downloader {
    async fn download(
        &self,
        profile: ProfileType,
        sink: ProfileSink<'_>,
        options: &[DownloadOption],
    ) -> Result<u64> {
        Self::download(self, profile, sink, options).await
    }
}

fn profile_url(local: SocketAddr, path: &str) -> Result<Url> {
    let mut url = Url::parse(&format!("http://{local}"))
        .map_err(|e| Error::config_error(format!("invalid tunnel address {local}: {e}")))?;
    url.set_path(path);
    Ok(url)
}
