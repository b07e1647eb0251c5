//! JSON-RPC surface of the daemon.
//!
//! - `protocol` - Envelope, method names and wire messages
//! - `server` - Request dispatch onto the daemon
//! - `transport` - Newline-delimited JSON over TCP

pub mod protocol;
pub mod server;
pub mod transport;

pub use server::{CallSink, RpcServer};
pub use transport::{Message, TcpTransport, Transport};
