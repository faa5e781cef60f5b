//! Immutable descriptors for a remote build daemon and its configuration.

use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for a daemon, stable for its lifetime in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DaemonId(pub Uuid);

impl DaemonId {
    pub fn new() -> Self {
        DaemonId(Uuid::new_v4())
    }
}

impl Default for DaemonId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DaemonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a daemon can be reached. The core treats both variants uniformly
/// through [`crate::transport::connect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonAddress {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for DaemonAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonAddress::Tcp(addr) => write!(f, "tcp://{addr}"),
            DaemonAddress::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Lifecycle state of a registered daemon, as last observed by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonState {
    Idle,
    Busy,
    Stopping,
}

/// Read-only metadata about a remote daemon. A `Connection` never mutates
/// this; it is used only for diagnostics and for the registry to locate the
/// daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub id: DaemonId,
    pub pid: u32,
    pub address: DaemonAddress,
    pub protocol_version: u32,
    pub locale: String,
    pub working_dir: PathBuf,
    pub registered_at: DateTime<Utc>,
    pub state: DaemonState,
}

/// The protocol version this client speaks. A daemon registered under a
/// different version is not a candidate for connection.
pub const PROTOCOL_VERSION: u32 = 1;

/// Immutable configuration governing liveness detection and connect
/// behaviour. See `DaemonParameters::from_env` for the ambient environment
/// variables this loads from outside the core.
#[derive(Debug, Clone)]
pub struct DaemonParameters {
    /// Expected interval between liveness signals from the daemon.
    pub keep_alive: Duration,
    /// Allowed multiple of `keep_alive` before declaring the daemon dead.
    pub max_lost_keep_alive: NonZeroU32,
    /// Timeout for establishing the initial transport connection.
    pub connect_timeout: Duration,
    /// Directory containing per-daemon diagnostic log files.
    pub log_dir: PathBuf,
}

impl DaemonParameters {
    /// Derived liveness window: `keep_alive * max_lost_keep_alive`.
    pub fn max_keep_alive(&self) -> Duration {
        self.keep_alive * self.max_lost_keep_alive.get()
    }

    /// Load parameters from environment variables, falling back to
    /// [`DaemonParameters::default`] for anything unset. Malformed values
    /// produce a descriptive error rather than silently falling back.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut params = DaemonParameters::default();

        if let Ok(v) = std::env::var("MVND_KEEP_ALIVE_MS") {
            params.keep_alive = Duration::from_millis(parse_env_u64("MVND_KEEP_ALIVE_MS", &v)?);
        }
        if let Ok(v) = std::env::var("MVND_MAX_LOST_KEEP_ALIVE") {
            let n: u32 = v
                .parse()
                .map_err(|_| anyhow::anyhow!("MVND_MAX_LOST_KEEP_ALIVE must be a positive integer, got {v:?}"))?;
            params.max_lost_keep_alive = NonZeroU32::new(n)
                .ok_or_else(|| anyhow::anyhow!("MVND_MAX_LOST_KEEP_ALIVE must be > 0"))?;
        }
        if let Ok(v) = std::env::var("MVND_CONNECT_TIMEOUT_MS") {
            params.connect_timeout =
                Duration::from_millis(parse_env_u64("MVND_CONNECT_TIMEOUT_MS", &v)?);
        }
        if let Ok(v) = std::env::var("MVND_DAEMON_LOG_DIR") {
            params.log_dir = PathBuf::from(v);
        }

        Ok(params)
    }
}

fn parse_env_u64(name: &str, value: &str) -> anyhow::Result<u64> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("{name} must be an integer number of milliseconds, got {value:?}"))
}

impl Default for DaemonParameters {
    fn default() -> Self {
        DaemonParameters {
            keep_alive: Duration::from_secs(10),
            max_lost_keep_alive: NonZeroU32::new(3).unwrap(),
            connect_timeout: Duration::from_secs(10),
            log_dir: std::env::temp_dir().join("mvnd-daemon-logs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_keep_alive_is_keep_alive_times_max_lost() {
        let params = DaemonParameters {
            keep_alive: Duration::from_secs(1),
            max_lost_keep_alive: NonZeroU32::new(3).unwrap(),
            ..DaemonParameters::default()
        };
        assert_eq!(params.max_keep_alive(), Duration::from_secs(3));
    }

    #[test]
    fn from_env_rejects_malformed_values() {
        std::env::set_var("MVND_MAX_LOST_KEEP_ALIVE", "not-a-number");
        let err = DaemonParameters::from_env().unwrap_err();
        assert!(err.to_string().contains("MVND_MAX_LOST_KEEP_ALIVE"));
        std::env::remove_var("MVND_MAX_LOST_KEEP_ALIVE");
    }
}
