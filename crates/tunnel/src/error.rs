//! Error types for tunnel establishment and forwarding.

use thiserror::Error;

/// Result type for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors that can occur while opening or running a tunnel.
///
/// Reasons are carried as strings so that a single terminal error can be
/// handed to every observer of the tunnel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// The remote target reference is malformed.
    #[error("invalid target: {reason}")]
    InvalidTarget { reason: String },

    /// The upgrade endpoint could not be built from the transport configuration.
    #[error("invalid port-forward endpoint: {reason}")]
    Endpoint { reason: String },

    /// Dial or protocol-upgrade handshake failed.
    #[error("dial failed: {reason}")]
    Dial { reason: String },

    /// The local listener could not be bound.
    #[error("failed to listen on 127.0.0.1:{port}: {reason}")]
    Bind { port: u16, reason: String },

    /// Accepting a local connection failed.
    #[error("failed to accept local connection: {reason}")]
    Accept { reason: String },

    /// A logical stream to the remote port could not be opened or broke.
    #[error("stream error: {reason}")]
    Stream { reason: String },

    /// The remote side reported a forwarding error.
    #[error("remote forwarding error on port {port}: {message}")]
    Remote { port: u16, message: String },

    /// The background task ended without recording an outcome.
    #[error("tunnel task exited unexpectedly")]
    TaskExited,

    /// [`connect`](crate::connect) was called outside of a tokio runtime.
    #[error("no async runtime available: {reason}")]
    NoRuntime { reason: String },

    /// The tunnel was stopped by its owner.
    #[error("tunnel closed")]
    Closed,
}

impl TunnelError {
    /// Create an invalid target error.
    pub fn invalid_target(reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            reason: reason.into(),
        }
    }

    /// Create an endpoint error.
    pub fn endpoint(reason: impl Into<String>) -> Self {
        Self::Endpoint {
            reason: reason.into(),
        }
    }

    /// Create a dial error.
    pub fn dial(reason: impl Into<String>) -> Self {
        Self::Dial {
            reason: reason.into(),
        }
    }

    /// Create a bind error.
    pub fn bind(port: u16, reason: impl Into<String>) -> Self {
        Self::Bind {
            port,
            reason: reason.into(),
        }
    }

    /// Create an accept error.
    pub fn accept(reason: impl Into<String>) -> Self {
        Self::Accept {
            reason: reason.into(),
        }
    }

    /// Create a stream error.
    pub fn stream(reason: impl Into<String>) -> Self {
        Self::Stream {
            reason: reason.into(),
        }
    }

    /// Create a remote forwarding error.
    pub fn remote(port: u16, message: impl Into<String>) -> Self {
        Self::Remote {
            port,
            message: message.into(),
        }
    }

    /// True when the tunnel could never have become usable.
    pub const fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidTarget { .. }
                | Self::Endpoint { .. }
                | Self::Dial { .. }
                | Self::Bind { .. }
                | Self::NoRuntime { .. }
        )
    }
}
