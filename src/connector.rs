//! Connector / Retry Driver (§4.7): the outer loop gluing registry, spawner,
//! transport and `Connection` together into one build request/response cycle.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::daemon::{DaemonInfo, DaemonParameters, DaemonState, PROTOCOL_VERSION};
use crate::error::ConnectionError;
use crate::protocol::Message;
use crate::registry::DaemonRegistry;
use crate::spawner::DaemonSpawner;
use crate::stale::{IoErrorDetector, StaleAddressDetector};
use crate::transport::Transport;

/// A build request as sent to a daemon's `BuildRequest` message.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub working_dir: String,
    pub args: Vec<String>,
}

/// Outcome of driving one build to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: i32,
}

impl ExecutionResult {
    pub fn assert_success(self) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(anyhow!("build failed with exit code {}", self.exit_code))
        }
    }

    pub fn assert_failure(self) -> Result<()> {
        if self.success {
            Err(anyhow!("expected build to fail but it exited 0"))
        } else {
            Ok(())
        }
    }
}

/// Default bound on stale-address eviction-and-retry cycles, mirroring the
/// teacher's `max_connections`-style defaulting of small integer knobs.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub struct Connector {
    registry: Arc<dyn DaemonRegistry>,
    spawner: Arc<dyn DaemonSpawner>,
    params: DaemonParameters,
    detector: Arc<dyn StaleAddressDetector>,
    max_retries: u32,
}

impl Connector {
    pub fn new(
        registry: Arc<dyn DaemonRegistry>,
        spawner: Arc<dyn DaemonSpawner>,
        params: DaemonParameters,
    ) -> Self {
        Connector {
            registry,
            spawner,
            params,
            detector: Arc::new(IoErrorDetector),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Drive one build to completion, evicting and retrying against a
    /// different daemon on `StaleAddress` up to `max_retries` times.
    /// `on_message` is invoked for every message received before
    /// `BuildFinished`, including `BuildFinished` itself.
    pub fn run(&self, request: BuildRequest, mut on_message: impl FnMut(&Message)) -> Result<ExecutionResult> {
        let mut attempt = 0;
        loop {
            match self.run_once(&request, &mut on_message) {
                Ok(result) => return Ok(result),
                Err(ConnectionError::Stale(stale)) => {
                    attempt += 1;
                    warn!(daemon_id = %stale.daemon_id, attempt, "daemon at a stale address, evicting and retrying");
                    self.registry.remove(stale.daemon_id)?;
                    if attempt > self.max_retries {
                        return Err(anyhow!(
                            "exhausted {} retries against stale daemons: {}",
                            self.max_retries,
                            stale
                        ));
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn run_once(
        &self,
        request: &BuildRequest,
        on_message: &mut dyn FnMut(&Message),
    ) -> Result<ExecutionResult, ConnectionError> {
        let (daemon, new_daemon) = self.acquire_daemon().map_err(|e| {
            crate::error::ConnectError::bare(format!("failed to acquire a daemon: {e}"))
        })?;

        let transport = Transport::connect(&daemon.address, self.params.connect_timeout).map_err(|e| {
            // Same classification rule dispatch() uses: no message has been
            // received yet, so a refusal/reset here means the registry's
            // endpoint is dead, not merely that this particular attempt
            // failed.
            if self.detector.is_stale(&e) {
                ConnectionError::from(crate::error::StaleAddress {
                    daemon_id: daemon.id,
                    diagnostics: crate::diagnostics::render(&daemon, &self.params, self.registry.as_ref()),
                })
            } else {
                crate::error::ConnectError::bare(format!(
                    "failed to connect to daemon {}: {e}",
                    daemon.id
                ))
                .into()
            }
        })?;

        let connection = Connection::new(
            transport,
            daemon.clone(),
            Arc::clone(&self.detector),
            new_daemon,
            self.params.clone(),
            Arc::clone(&self.registry),
        )
        .map_err(|e| {
            crate::error::ConnectError::bare(format!("failed to start connection to {}: {e}", daemon.id))
        })?;

        let result = self.drive(&connection, request, on_message);
        connection.close();
        result
    }

    fn drive(
        &self,
        connection: &Connection,
        request: &BuildRequest,
        on_message: &mut dyn FnMut(&Message),
    ) -> Result<ExecutionResult, ConnectionError> {
        connection.dispatch(&Message::BuildRequest {
            working_dir: request.working_dir.clone(),
            args: request.args.clone(),
        })?;

        loop {
            let batch = connection.receive()?;
            for message in batch {
                on_message(&message);
                if let Message::BuildFinished { exit_code } = message {
                    return Ok(ExecutionResult {
                        success: exit_code == 0,
                        exit_code,
                    });
                }
            }
        }
    }

    /// Step 1 of §4.7: find a protocol-compatible, non-stopping daemon in
    /// the registry, or spawn a fresh one. Returns whether the daemon is
    /// newly spawned (affects `Connection`'s failure classification).
    fn acquire_daemon(&self) -> Result<(DaemonInfo, bool)> {
        let candidates = self.registry.list()?;
        if let Some(daemon) = candidates
            .into_iter()
            .find(|d| d.protocol_version == PROTOCOL_VERSION && d.state != DaemonState::Stopping)
        {
            debug!(daemon_id = %daemon.id, "reusing registered daemon");
            return Ok((daemon, false));
        }

        info!("no compatible daemon registered, spawning one");
        let daemon = self.spawner.spawn(&self.params)?;
        self.registry.register(daemon.clone())?;
        Ok((daemon, true))
    }
}
