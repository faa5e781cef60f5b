//! # Daemon client connection subsystem
//!
//! The client side of a build-daemon launcher: opens a duplex connection to
//! a long-lived build daemon, exchanges framed protocol messages, detects
//! and recovers from stale registry entries, and reports diagnostics when a
//! connection fails outright.

pub mod cli;
pub mod connection;
pub mod connector;
pub mod daemon;
pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod pump;
pub mod registry;
pub mod spawner;
pub mod stale;
pub mod transport;

pub use connector::{BuildRequest, Connector, ExecutionResult};
pub use daemon::{DaemonId, DaemonInfo, DaemonParameters};
pub use error::{ConnectError, ConnectionError, Interrupted, StaleAddress};
pub use protocol::Message;

/// The current version of this client.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
