//! Blocking duplex byte channel to one daemon endpoint (§4.2).
//!
//! A `Transport` is split at construction into the half retained by
//! [`crate::connection::Connection`] for `dispatch`/`flush`/`close`, and a
//! [`TransportReader`] handed to the [`crate::pump`] thread. Both halves
//! share the same underlying OS socket (via `try_clone`), so `close` on
//! either one's `shutdown` call unblocks a concurrent blocking read on the
//! other; this is what lets `Connection::close` interrupt the pump.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::daemon::DaemonAddress;
use crate::error::MessageIoError;
use crate::protocol::{codec, Message};

/// One end of a duplex OS stream, abstracting over TCP and (on Unix) domain
/// sockets so the rest of the crate deals in a single concrete `Transport`
/// type regardless of which the Connector picked.
enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn try_clone(&self) -> io::Result<Stream> {
        match self {
            Stream::Tcp(s) => s.try_clone().map(Stream::Tcp),
            #[cfg(unix)]
            Stream::Unix(s) => s.try_clone().map(Stream::Unix),
        }
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.shutdown(how),
            #[cfg(unix)]
            Stream::Unix(s) => s.shutdown(how),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
        }
    }
}

/// The write/control half, owned by `Connection`.
pub struct Transport {
    stream: Stream,
}

/// The read half, owned exclusively by the receive pump thread.
pub struct TransportReader {
    stream: Stream,
}

#[cfg(all(test, unix))]
impl Transport {
    /// Test-only constructor wrapping an already-connected Unix socket,
    /// used by other modules' tests to build a `Transport` without going
    /// through `connect`.
    pub fn connect_for_test(stream: std::os::unix::net::UnixStream) -> Transport {
        Transport {
            stream: Stream::Unix(stream),
        }
    }
}

impl Transport {
    /// Open a connection to `address`, bounded by `timeout`.
    ///
    /// TCP gets a genuine connect-with-timeout via `socket2`. Unix domain
    /// sockets have no standard connect-timeout primitive in `std`; a plain
    /// blocking `connect` is used (documented limitation, not a silent gap:
    /// a hung `connect(2)` on a local socket is exceedingly rare in
    /// practice, unlike a routed TCP connection).
    pub fn connect(address: &DaemonAddress, timeout: Duration) -> io::Result<Transport> {
        let stream = match address {
            DaemonAddress::Tcp(addr) => Stream::Tcp(connect_tcp_with_timeout(*addr, timeout)?),
            #[cfg(unix)]
            DaemonAddress::Unix(path) => Stream::Unix(connect_unix(path)?),
            #[cfg(not(unix))]
            DaemonAddress::Unix(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix domain socket addresses are not supported on this platform",
                ))
            }
        };
        Ok(Transport { stream })
    }

    /// Split into the retained write/control half and a [`TransportReader`]
    /// for the pump thread. Both halves share the same kernel socket.
    pub fn split(self) -> io::Result<(Transport, TransportReader)> {
        let reader_stream = self.stream.try_clone()?;
        Ok((self, TransportReader { stream: reader_stream }))
    }

    /// Encode and write one frame. Does not flush.
    pub fn dispatch(&mut self, message: &Message) -> Result<(), MessageIoError> {
        codec::encode(&mut self.stream, message)?;
        Ok(())
    }

    /// Force buffered bytes to the OS.
    pub fn flush(&mut self) -> Result<(), MessageIoError> {
        self.stream.flush()?;
        Ok(())
    }

    /// Idempotent; shuts down both halves of the underlying socket, which
    /// unblocks a concurrent blocking read in the pump.
    pub fn close(&mut self) {
        // ENOTCONN etc. here just mean the peer beat us to it; either way
        // the socket ends up closed, which is all `close` promises.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl TransportReader {
    /// Read and decode one frame. `Ok(None)` on clean EOF.
    pub fn receive(&mut self) -> Result<Option<Message>, MessageIoError> {
        Ok(codec::decode(&mut self.stream)?)
    }
}

fn connect_tcp_with_timeout(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.connect_timeout(&addr.into(), timeout)?;
    socket.set_nodelay(true)?;
    Ok(socket.into())
}

#[cfg(unix)]
fn connect_unix(path: &Path) -> io::Result<UnixStream> {
    UnixStream::connect(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use std::os::unix::net::UnixStream as StdUnixStream;

    #[cfg(unix)]
    #[test]
    fn dispatch_then_receive_round_trips_over_a_socket_pair() {
        let (client, server) = StdUnixStream::pair().unwrap();
        let mut client_transport = Transport {
            stream: Stream::Unix(client),
        };
        let server_transport = Transport {
            stream: Stream::Unix(server),
        };

        client_transport
            .dispatch(&Message::BuildFinished { exit_code: 3 })
            .unwrap();
        client_transport.flush().unwrap();

        let (_control, mut reader) = server_transport.split().unwrap();
        let received = reader.receive().unwrap().unwrap();
        assert_eq!(received, Message::BuildFinished { exit_code: 3 });
    }

    #[cfg(unix)]
    #[test]
    fn close_unblocks_a_concurrent_blocking_read() {
        let (client, server) = StdUnixStream::pair().unwrap();
        let mut client_transport = Transport {
            stream: Stream::Unix(client),
        };
        let (mut control, mut reader) = Transport {
            stream: Stream::Unix(server),
        }
        .split()
        .unwrap();

        let handle = std::thread::spawn(move || reader.receive());

        std::thread::sleep(Duration::from_millis(20));
        control.close();
        client_transport.close();

        let result = handle.join().unwrap();
        // Either a clean EOF or an I/O error is acceptable; the important
        // property is that the blocking read returns at all.
        let _ = result;
    }
}
