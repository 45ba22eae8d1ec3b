#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # podprof
//!
//! Download pprof profiles from pods through an ephemeral port-forward tunnel.
//!
//! This library re-exports the workspace crates for convenience.

pub mod cli;

// Re-export all crates
pub use podprof_downloader;
pub use podprof_tunnel;
