//! Lint Daemon - Rust Implementation
//!
//! A long-running process that owns a code analysis engine and exposes it to
//! editor clients over JSON-RPC. Clients register a storage, refresh it from
//! a rule server, then analyze files and receive issues as a stream.
//!
//! # Architecture
//!
//! 1. **Engine Layer** (`engine`) - Engine contracts and the built-in connected engine
//! 2. **Daemon Layer** (`daemon`) - Engine lifecycle, translation, log and issue relays
//! 3. **RPC Layer** (`rpc`) - Protocol, dispatch and the TCP transport
//! 4. **HTTP Layer** (`http`) - The same dispatch over HTTP and server-sent events

pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod http;
pub mod metrics;
pub mod rpc;

pub use error::{Error, Result};

/// Daemon version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User agent sent to rule servers.
pub const USER_AGENT: &str = concat!("lint-daemon/", env!("CARGO_PKG_VERSION"));

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8050;
