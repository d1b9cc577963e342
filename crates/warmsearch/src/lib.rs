//! Browser-backed web search worker.
//!
//! A long-lived daemon keeps one browser warm behind a Unix socket, so repeated searches
//! skip launch cost and carry a stable browsing profile. Clients send one JSON line and
//! read one JSON reply; a missing daemon is started on demand and exits on its own once
//! idle.

pub mod admission;
pub mod browser;
pub mod cache;
pub mod challenge;
pub mod client;
pub mod config;
pub mod context;
pub mod daemon;
pub mod hints;
pub mod lifecycle;
pub mod logging;
#[cfg(feature = "stdio")]
pub mod mcp;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod readiness;
pub mod server;

#[cfg(test)]
mod testing;

pub use client::{ClientError, DaemonClient};
pub use config::{ClientConfig, DaemonConfig, Escalation};
pub use context::DaemonContext;
pub use pipeline::RetrievalError;
pub use protocol::{Reply, SearchFailure, SearchSuccess, StatusReport};
