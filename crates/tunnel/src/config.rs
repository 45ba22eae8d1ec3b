//! Port mapping for a tunnel.

/// Default port of the remote profiling HTTP server.
pub const DEFAULT_REMOTE_PORT: u16 = 8008;

/// Local and remote ports of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Local port to listen on; 0 picks an ephemeral port.
    pub local_port: u16,
    /// Port of the remote process.
    pub remote_port: u16,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            remote_port: DEFAULT_REMOTE_PORT,
        }
    }
}

impl TunnelConfig {
    /// Set the local port.
    #[must_use]
    pub const fn local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    /// Set the remote port.
    #[must_use]
    pub const fn remote_port(mut self, port: u16) -> Self {
        self.remote_port = port;
        self
    }
}
