//! Daemon spawning (§6, consumed collaborator): starts a fresh daemon
//! process when the registry has no compatible candidate. Out of scope for
//! the core proper, but implemented minimally so `Connector` is runnable
//! end to end, grounded in the spawn-and-poll pattern of a process
//! coordinator rather than a stub.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::Utc;
use tracing::debug;

use crate::daemon::{DaemonAddress, DaemonInfo, DaemonParameters, DaemonState, PROTOCOL_VERSION};

/// Blocking until the child is listening, per §6.
pub trait DaemonSpawner: Send + Sync {
    fn spawn(&self, params: &DaemonParameters) -> Result<DaemonInfo>;
}

/// Spawns `program` as a child process and waits for it to start listening
/// on a locally-bound TCP port that the child reports back over its stdout
/// as a single line `LISTENING <port>\n`.
pub struct ProcessSpawner {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub poll_timeout: Duration,
}

impl DaemonSpawner for ProcessSpawner {
    fn spawn(&self, params: &DaemonParameters) -> Result<DaemonInfo> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        debug!(program = %self.program.display(), "spawning build daemon");
        let mut child = command.spawn()?;
        let pid = child.id();

        let port = read_listening_port(&mut child, self.poll_timeout)?;
        let address = DaemonAddress::Tcp(SocketAddr::from(([127, 0, 0, 1], port)));
        let _ = params; // reserved for future spawn-time configuration (e.g. JVM args)

        Ok(DaemonInfo {
            id: crate::daemon::DaemonId::new(),
            pid,
            address,
            protocol_version: PROTOCOL_VERSION,
            locale: std::env::var("LANG").unwrap_or_else(|_| "C".to_string()),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            registered_at: Utc::now(),
            state: DaemonState::Idle,
        })
    }
}

fn read_listening_port(
    child: &mut std::process::Child,
    timeout: Duration,
) -> Result<u16> {
    use std::io::{BufRead, BufReader};

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("daemon child has no stdout pipe"))?;
    let mut lines = BufReader::new(stdout).lines();

    let deadline = Instant::now() + timeout;
    loop {
        if Instant::now() > deadline {
            return Err(anyhow!("daemon did not report a listening port within {:?}", timeout));
        }
        match lines.next() {
            Some(Ok(line)) => {
                if let Some(port_str) = line.strip_prefix("LISTENING ") {
                    return port_str
                        .trim()
                        .parse()
                        .map_err(|_| anyhow!("malformed listening announcement: {line:?}"));
                }
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(anyhow!("daemon exited before reporting a listening port")),
        }
    }
}
