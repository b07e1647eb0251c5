//! The daemon facade over the analysis engine.
//!
//! # Architecture
//!
//! - `translate` - Wire message ⇄ engine value conversions
//! - `log_relay` - Single-slot forwarding of engine log lines
//! - `diagnostics` - Per-call forwarding of analysis issues
//! - `controller` - Ownership and replacement of the engine instance
//! - `service` - One operation per remote method

pub mod controller;
pub mod diagnostics;
pub mod log_relay;
pub mod service;
pub mod translate;

#[cfg(test)]
pub(crate) mod test_support;

pub use controller::{EngineController, EngineLease};
pub use diagnostics::DiagnosticRelay;
pub use log_relay::{LogRelay, LogSubscription};
pub use service::ConnectedDaemon;
pub use translate::RegistrationDefaults;
