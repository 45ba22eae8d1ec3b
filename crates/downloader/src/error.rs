//! Error types for profile downloads.

use podprof_tunnel::TunnelError;
use thiserror::Error;

use crate::profile::ProfileType;

/// Result type for download operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classes of download failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller mistake detected before any I/O.
    Configuration,
    /// The tunnel could not be established or was lost before the request.
    Tunnel,
    /// The tunnel terminated while a download was in flight.
    Cancelled,
    /// The remote server answered with a non-success status.
    Remote,
    /// Reading the response or writing the sink failed.
    Io,
}

/// Errors that can occur while downloading a profile.
#[derive(Error, Debug)]
pub enum Error {
    /// The profile type has no endpoint.
    #[error("unsupported profiling type {profile:?}")]
    UnsupportedProfile { profile: ProfileType },

    /// A download option rejected the request.
    #[error("invalid download option '{option}': {reason}")]
    InvalidOption { option: String, reason: String },

    /// Configuration error.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// The tunnel failed before the request was issued.
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// The tunnel was stopped cleanly before the request was issued.
    #[error("tunnel unavailable: stopped before the download started")]
    TunnelUnavailable,

    /// The tunnel terminated while the request was in flight.
    #[error("download cancelled: {reason}")]
    Cancelled { reason: String },

    /// Non-success response from the profiling endpoint.
    #[error("download error: {body}, code {status}")]
    Remote { status: u16, body: String },

    /// HTTP error from reqwest.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error writing the sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an invalid option error.
    pub fn invalid_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Create a config error.
    pub fn config_error(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a cancellation error from the tunnel's terminal outcome.
    pub fn cancelled(cause: Option<&TunnelError>) -> Self {
        let reason = cause.map_or_else(
            || "tunnel closed while the request was in flight".to_string(),
            |err| format!("tunnel terminated while the request was in flight: {err}"),
        );
        Self::Cancelled { reason }
    }

    /// Create a remote error.
    pub fn remote(status: u16, body: impl Into<String>) -> Self {
        Self::Remote {
            status,
            body: body.into(),
        }
    }

    /// Classify this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedProfile { .. } | Self::InvalidOption { .. } | Self::Config { .. } => {
                ErrorKind::Configuration
            }
            Self::Tunnel(_) | Self::TunnelUnavailable => ErrorKind::Tunnel,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::Http(_) | Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Check if retrying the whole download may succeed.
    ///
    /// Nothing in this crate retries; this only advises callers.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Remote { status, .. } => *status >= 500,
            _ => matches!(self.kind(), ErrorKind::Tunnel | ErrorKind::Cancelled | ErrorKind::Io),
        }
    }
}
