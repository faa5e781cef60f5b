//! Stale-address detection (§4.5): decides whether an I/O failure means the
//! registry's endpoint for a daemon no longer points at anything alive.

use std::io;

/// Strategy invoked on I/O failures. Kept as a trait object so tests can
/// inject any answer and so a future transport (e.g. named pipes on
/// Windows) can plug in a different heuristic.
pub trait StaleAddressDetector: Send + Sync {
    fn is_stale(&self, err: &io::Error) -> bool;
}

/// The default detector: inspects the OS error kind for the signatures of
/// "nothing is listening here anymore".
pub struct IoErrorDetector;

impl StaleAddressDetector for IoErrorDetector {
    fn is_stale(&self, err: &io::Error) -> bool {
        use io::ErrorKind::*;
        match err.kind() {
            ConnectionRefused | ConnectionReset | BrokenPipe | NotConnected => true,
            _ => is_enotconn(err),
        }
    }
}

#[cfg(unix)]
fn is_enotconn(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOTCONN)
}

#[cfg(not(unix))]
fn is_enotconn(_err: &io::Error) -> bool {
    false
}

/// A detector with a fixed answer, for tests.
pub struct FixedDetector(pub bool);

impl StaleAddressDetector for FixedDetector {
    fn is_stale(&self, _err: &io::Error) -> bool {
        self.0
    }
}
