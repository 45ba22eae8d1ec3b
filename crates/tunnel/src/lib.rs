#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # podprof-tunnel
//!
//! Ephemeral local-to-pod tunnels.
//!
//! [`connect`] starts a background task that dials the remote target through
//! a [`PortForwarder`], listens on `127.0.0.1`, and forwards every accepted
//! connection over its own logical stream. The returned [`TunnelHandle`]
//! exposes a one-shot readiness signal ([`TunnelHandle::ready`]) and a
//! terminal signal ([`TunnelHandle::terminated`]) carrying the causing
//! error, or `None` when the caller's stop token ended the tunnel.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use podprof_tunnel::{PodTarget, TunnelConfig, WebSocketForwarder, connect};
//! use tokio_util::sync::CancellationToken;
//!
//! let forwarder = Arc::new(WebSocketForwarder::new("http://127.0.0.1:8001".parse()?));
//! let target = PodTarget::new("knative-serving", "activator-5979f56548-w59cm")?;
//! let stop = CancellationToken::new();
//!
//! let tunnel = connect(forwarder, target, TunnelConfig::default(), stop.clone())?;
//! let local = tunnel.ready().await?;
//! println!("pprof reachable at http://{local}/debug/pprof/");
//! stop.cancel();
//! ```

pub mod config;
pub mod error;
pub mod forwarder;
pub mod target;
pub mod tunnel;
pub mod websocket;

pub use config::{DEFAULT_REMOTE_PORT, TunnelConfig};
pub use error::{Result, TunnelError};
pub use forwarder::{BoxedStream, DirectForwarder, ForwardSession, PortForwarder, TunnelStream};
pub use target::PodTarget;
pub use tunnel::{FaultReporter, TunnelHandle, TunnelState, connect};
pub use websocket::{PORT_FORWARD_PROTOCOL, WebSocketForwarder};
