//! TRELLIS Server
//!
//! Worker process hosting an engine: accepts forked sub-graphs over TCP,
//! hot-swaps snapshots and reports queue and pool statistics.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod service;

pub use config::{ConfigError, ServerConfig};
pub use service::{Service, ServiceError, ServiceResult, tcp_connector};
