//! The Connection (§4.4): the pivot of the subsystem. Serialises outbound
//! dispatch, consumes the inbound queue with a keep-alive timeout, injects
//! local control messages, and classifies failures into the taxonomy of
//! [`crate::error`].
//!
//! # Invariants (see §3)
//!
//! 1. `queue` is fed only by the receive pump and by `dispatch`'s local echo
//!    of `CancelBuild`.
//! 2. `terminal_error` is set at most once; never cleared once set.
//! 3. `running` transitions `true -> false` exactly once.
//! 4. `has_received` transitions `false -> true` exactly once.
//! 5. The transport's write half is only touched while `transport`'s mutex
//!    (playing the role of the spec's `dispatchLock`) is held; the read half
//!    is only touched by the pump thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::daemon::{DaemonInfo, DaemonParameters};
use crate::diagnostics::{self, Diagnostics};
use crate::error::{ConnectError, ConnectionError, Interrupted, MessageIoError, StaleAddress};
use crate::protocol::Message;
use crate::pump::spawn_pump;
use crate::registry::DaemonRegistry;
use crate::stale::StaleAddressDetector;
use crate::transport::Transport;

/// Fixed bounded-queue capacity (§3); a slow caller backpressures the
/// daemon via the transport's own OS buffers, which is the point.
const QUEUE_CAPACITY: usize = 16;

pub struct Connection {
    transport: Mutex<Transport>,
    daemon: DaemonInfo,
    detector: Arc<dyn StaleAddressDetector>,
    new_daemon: bool,
    has_received: AtomicBool,
    queue_tx: Sender<Message>,
    /// `None` once `close()` has run. Dropping the last `Receiver` is what
    /// unblocks a pump thread blocked sending into a full queue; shutting
    /// down the transport alone only unblocks a pump blocked on a *read*.
    queue_rx: Mutex<Option<Receiver<Message>>>,
    pump_handle: StdMutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    terminal_error: Arc<StdMutex<Option<MessageIoError>>>,
    max_keep_alive: Duration,
    params: DaemonParameters,
    registry: Arc<dyn DaemonRegistry>,
}

impl Connection {
    /// Wraps `transport`, starting the receive pump. `new_daemon` must be
    /// true iff this is the first client to attach to a freshly spawned
    /// daemon (it affects failure classification: see [`Connection::receive`]).
    pub fn new(
        transport: Transport,
        daemon: DaemonInfo,
        detector: Arc<dyn StaleAddressDetector>,
        new_daemon: bool,
        params: DaemonParameters,
        registry: Arc<dyn DaemonRegistry>,
    ) -> std::io::Result<Connection> {
        let (transport, reader) = transport.split()?;
        let running = Arc::new(AtomicBool::new(true));
        let terminal_error = Arc::new(StdMutex::new(None));
        let (queue_tx, queue_rx) = crossbeam::channel::bounded(QUEUE_CAPACITY);

        let pump_handle = spawn_pump(
            reader,
            Arc::clone(&running),
            queue_tx.clone(),
            Arc::clone(&terminal_error),
        );

        Ok(Connection {
            transport: Mutex::new(transport),
            max_keep_alive: params.max_keep_alive(),
            daemon,
            detector,
            new_daemon,
            has_received: AtomicBool::new(false),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            pump_handle: StdMutex::new(Some(pump_handle)),
            running,
            terminal_error,
            params,
            registry,
        })
    }

    pub fn daemon(&self) -> &DaemonInfo {
        &self.daemon
    }

    /// Write one frame and flush it. If `message` is `CancelBuild`, it is
    /// additionally enqueued locally (after the flush succeeds) so the
    /// caller's next `receive()` observes the cancellation promptly even if
    /// the daemon is hung and never echoes it back.
    pub fn dispatch(&self, message: &Message) -> Result<(), ConnectionError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ConnectError::bare("connection is closed").into());
        }

        let write_result: Result<(), MessageIoError> = {
            let mut transport = self.transport.lock();
            transport.dispatch(message).and_then(|()| transport.flush())
        };

        if let Err(err) = write_result {
            let is_stale = match &err {
                MessageIoError::Io(io_err) => self.detector.is_stale(io_err),
                MessageIoError::Protocol(_) => false,
            };
            let diagnostics = self.render_diagnostics();
            return if !self.has_received.load(Ordering::SeqCst) && is_stale {
                Err(StaleAddress {
                    daemon_id: self.daemon.id,
                    diagnostics,
                }
                .into())
            } else {
                Err(ConnectError::new(format!("failed to dispatch message: {err}"), diagnostics).into())
            };
        }

        if message.is_cancel_build() {
            self.queue_tx.send(message.clone()).map_err(|_| {
                Interrupted("cancellation echo could not be enqueued: connection is closing".to_string())
            })?;
        }
        Ok(())
    }

    /// Wait for at least one message, then drain everything currently
    /// queued and return it as one batch (ordering preserved). See §4.4 for
    /// the exact six-step algorithm this implements.
    pub fn receive(&self) -> Result<Vec<Message>, ConnectionError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ConnectError::bare("connection is closed").into());
        }

        let rx = match self.queue_rx.lock().clone() {
            Some(rx) => rx,
            None => return Err(ConnectError::bare("connection is closed").into()),
        };
        let poll_result = rx.recv_timeout(self.max_keep_alive);

        // Step 2: the terminal error takes precedence regardless of whether
        // the poll itself succeeded or timed out.
        if let Some(err) = self.take_terminal_error() {
            return Err(self.classify_receive_failure(err.to_string(), io_error_of(&err)));
        }

        match poll_result {
            Ok(first) => {
                let mut batch = vec![first];
                while let Ok(next) = rx.try_recv() {
                    batch.push(next);
                }
                // Step 5: re-check; a failure discovered here discards the
                // batch just collected: the caller learns the connection
                // failed, not that it received a partial batch.
                if let Some(err) = self.take_terminal_error() {
                    return Err(self.classify_receive_failure(err.to_string(), io_error_of(&err)));
                }
                self.has_received.store(true, Ordering::SeqCst);
                Ok(batch)
            }
            Err(RecvTimeoutError::Timeout) => {
                let millis = self.max_keep_alive.as_millis();
                let detail = format!("no message received within {millis}ms, daemon may have crashed");
                Err(self.classify_receive_failure(detail, None))
            }
            Err(RecvTimeoutError::Disconnected) => {
                // The pump exited without recording a terminal error; it
                // can only have done that after `close()` already flipped
                // `running`, which we already checked above; treat it the
                // same as an already-closed connection.
                Err(ConnectError::bare("connection is closed").into())
            }
        }
    }

    /// Classify a receive-path failure per §4.4.
    ///
    /// The distilled spec's "otherwise retry the poll" branch is not
    /// implemented: as flagged in the design notes, looping there risks a
    /// busy spin once the pump has already stored a terminal error, so a
    /// second unclassifiable failure surfaces a generic `ConnectError`
    /// instead of retrying indefinitely.
    fn classify_receive_failure(
        &self,
        detail: String,
        io_err: Option<&std::io::Error>,
    ) -> ConnectionError {
        let had_received_before = self.has_received.load(Ordering::SeqCst);
        let fresh_daemon_never_spoke = !had_received_before && self.new_daemon;
        let diagnostics = self.render_diagnostics();

        let outcome: ConnectionError = if fresh_daemon_never_spoke {
            ConnectError::new(
                format!("daemon never sent a message before failing: {detail}"),
                diagnostics,
            )
            .into()
        } else if io_err.is_some_and(|e| self.detector.is_stale(e)) {
            StaleAddress {
                daemon_id: self.daemon.id,
                diagnostics,
            }
            .into()
        } else {
            ConnectError::new(detail, diagnostics).into()
        };

        // "finally" contract (§4.4, invariant 4 of §3): has_received flips
        // to true here regardless of outcome, so a second consecutive
        // failure can never again be classified as "fresh daemon never
        // spoke".
        self.has_received.store(true, Ordering::SeqCst);
        outcome
    }

    /// Inject a locally synthesised message (e.g. a user's answer to a
    /// `Prompt`) into the inbound queue, via the same ordering channel as
    /// real inbound messages.
    ///
    /// Reproduces the source behaviour noted in the design notes as
    /// possibly-buggy but intentionally preserved: interruption here is a
    /// programming error, not a recoverable `Interrupted` failure: the
    /// queue should only ever be disconnected after `close()`, and a caller
    /// enqueueing into a connection it just closed is a bug in the caller.
    pub fn enqueue(&self, message: Message) {
        self.queue_tx.send(message).expect(
            "enqueue called after the connection's queue was torn down by close()",
        );
    }

    /// Flips `running` false, closes the transport (which unblocks the
    /// pump's concurrent blocking read), drops the inbound queue's receiver
    /// (which unblocks a pump concurrently blocked sending into a full
    /// queue), and joins the pump thread. Idempotent and safe to call from
    /// any thread, including concurrently with an in-flight
    /// `dispatch`/`receive` (those fail with `ConnectError` once `running`
    /// observes false).
    pub fn close(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.transport.lock().close();
            self.queue_rx.lock().take();
            if let Some(handle) = self.pump_handle.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }

    fn take_terminal_error(&self) -> Option<MessageIoError> {
        self.terminal_error.lock().unwrap().take()
    }

    fn render_diagnostics(&self) -> Diagnostics {
        diagnostics::render(&self.daemon, &self.params, self.registry.as_ref())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn io_error_of(err: &MessageIoError) -> Option<&std::io::Error> {
    match err {
        MessageIoError::Io(io_err) => Some(io_err),
        MessageIoError::Protocol(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{DaemonAddress, DaemonId, DaemonState, PROTOCOL_VERSION};
    use crate::registry::InMemoryRegistry;
    use crate::stale::FixedDetector;
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::num::NonZeroU32;
    use std::os::unix::net::UnixStream;
    use std::path::PathBuf;

    fn sample_daemon() -> DaemonInfo {
        DaemonInfo {
            id: DaemonId::new(),
            pid: 999,
            address: DaemonAddress::Tcp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)),
            protocol_version: PROTOCOL_VERSION,
            locale: "en_US".to_string(),
            working_dir: PathBuf::from("/tmp"),
            registered_at: Utc::now(),
            state: DaemonState::Idle,
        }
    }

    fn test_params(keep_alive: Duration) -> DaemonParameters {
        DaemonParameters {
            keep_alive,
            max_lost_keep_alive: NonZeroU32::new(1).unwrap(),
            connect_timeout: Duration::from_secs(1),
            log_dir: std::env::temp_dir(),
        }
    }

    fn make_connection(
        keep_alive: Duration,
        new_daemon: bool,
        detector_answer: bool,
    ) -> (Connection, UnixStream) {
        let (client, server) = UnixStream::pair().unwrap();
        let server_transport = Transport::connect_for_test(server);
        let connection = Connection::new(
            server_transport,
            sample_daemon(),
            Arc::new(FixedDetector(detector_answer)),
            new_daemon,
            test_params(keep_alive),
            Arc::new(InMemoryRegistry::default()),
        )
        .unwrap();
        (connection, client)
    }

    #[test]
    fn happy_path_batches_messages_in_order() {
        let (connection, mut client) = make_connection(Duration::from_secs(5), true, false);

        let mut buf = Vec::new();
        crate::protocol::codec::encode(&mut buf, &Message::BuildStarted { daemon_pid: 1 }).unwrap();
        crate::protocol::codec::encode(
            &mut buf,
            &Message::LogLine {
                text: "compile".to_string(),
            },
        )
        .unwrap();
        crate::protocol::codec::encode(&mut buf, &Message::BuildFinished { exit_code: 0 }).unwrap();
        use std::io::Write;
        client.write_all(&buf).unwrap();
        client.flush().unwrap();

        std::thread::sleep(Duration::from_millis(50));
        let batch = connection.receive().unwrap();
        assert_eq!(
            batch,
            vec![
                Message::BuildStarted { daemon_pid: 1 },
                Message::LogLine {
                    text: "compile".to_string()
                },
                Message::BuildFinished { exit_code: 0 },
            ]
        );
    }

    #[test]
    fn keep_alive_timeout_raises_connect_error_when_fresh_daemon_never_spoke() {
        let (connection, _client) = make_connection(Duration::from_millis(50), true, false);
        let err = connection.receive().unwrap_err();
        match err {
            ConnectionError::Connect(e) => assert!(e.message.contains("no message received within")),
            other => panic!("expected ConnectError, got {other:?}"),
        }
    }

    #[test]
    fn cancel_build_echo_is_observed_even_without_wire_traffic() {
        let (connection, _client) = make_connection(Duration::from_secs(5), true, false);
        connection.dispatch(&Message::CancelBuild).unwrap();
        let batch = connection.receive().unwrap();
        assert_eq!(batch.first(), Some(&Message::CancelBuild));
    }

    #[test]
    fn dispatch_before_any_receive_with_stale_detector_raises_stale_address() {
        let (connection, client) = make_connection(Duration::from_secs(5), true, true);
        drop(client); // forces the next write to fail
        connection.dispatch(&Message::KeepAlive).ok(); // first write may still succeed on some platforms' socket buffers
        let err = connection.dispatch(&Message::KeepAlive);
        if let Err(ConnectionError::Stale(stale)) = err {
            assert_eq!(stale.daemon_id, connection.daemon().id);
        }
        // If the OS buffered both writes before noticing the close, this
        // assertion is skipped; the important contract is exercised by
        // `mid_build_failure_after_successful_start_raises_stale_address`.
    }

    #[test]
    fn mid_build_failure_after_successful_start_raises_stale_address() {
        let (connection, mut client) = make_connection(Duration::from_secs(5), false, true);

        let mut buf = Vec::new();
        crate::protocol::codec::encode(&mut buf, &Message::BuildStarted { daemon_pid: 7 }).unwrap();
        use std::io::Write;
        client.write_all(&buf).unwrap();
        client.flush().unwrap();
        let batch = connection.receive().unwrap();
        assert_eq!(batch, vec![Message::BuildStarted { daemon_pid: 7 }]);

        drop(client);
        let err = connection.receive().unwrap_err();
        match err {
            ConnectionError::Stale(stale) => assert_eq!(stale.daemon_id, connection.daemon().id),
            ConnectionError::Connect(e) => {
                // A clean EOF after the daemon already spoke is also a
                // legitimate outcome on some platforms (no OS error to
                // classify as stale); accept either terminal failure.
                assert!(!e.message.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn enqueue_delivers_a_locally_synthesised_message_to_receive() {
        let (connection, _client) = make_connection(Duration::from_secs(5), true, false);
        connection.enqueue(Message::PromptResponse {
            text: "yes".to_string(),
        });
        let batch = connection.receive().unwrap();
        assert_eq!(
            batch,
            vec![Message::PromptResponse {
                text: "yes".to_string()
            }]
        );
    }

    #[test]
    fn enqueue_interleaves_with_wire_traffic_in_send_order() {
        let (connection, mut client) = make_connection(Duration::from_secs(5), true, false);

        let mut buf = Vec::new();
        crate::protocol::codec::encode(&mut buf, &Message::BuildStarted { daemon_pid: 1 }).unwrap();
        use std::io::Write;
        client.write_all(&buf).unwrap();
        client.flush().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        connection.enqueue(Message::CancelBuild);
        std::thread::sleep(Duration::from_millis(50));

        let batch = connection.receive().unwrap();
        assert_eq!(
            batch,
            vec![Message::BuildStarted { daemon_pid: 1 }, Message::CancelBuild]
        );
    }

    #[test]
    #[should_panic(expected = "enqueue called after the connection's queue was torn down")]
    fn enqueue_after_close_panics() {
        let (connection, _client) = make_connection(Duration::from_secs(5), true, false);
        connection.close();
        connection.enqueue(Message::CancelBuild);
    }

    #[test]
    fn close_is_idempotent_and_unblocks_receive() {
        let (connection, _client) = make_connection(Duration::from_secs(5), true, false);
        connection.close();
        connection.close();
        connection.close();
        let err = connection.receive().unwrap_err();
        assert!(matches!(err, ConnectionError::Connect(_)));
    }

    #[test]
    fn close_races_a_pump_blocked_on_a_full_queue() {
        let (connection, mut client) = make_connection(Duration::from_secs(5), true, false);

        // Fill the queue to capacity plus a few more so the pump blocks on
        // its next send.
        let mut buf = Vec::new();
        for i in 0..(QUEUE_CAPACITY as i32 + 4) {
            crate::protocol::codec::encode(&mut buf, &Message::BuildFinished { exit_code: i }).unwrap();
        }
        use std::io::Write;
        client.write_all(&buf).unwrap();
        client.flush().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let start = std::time::Instant::now();
        connection.close();
        assert!(start.elapsed() < Duration::from_secs(2));

        let err = connection.receive().unwrap_err();
        assert!(matches!(err, ConnectionError::Connect(_)));
    }
}
