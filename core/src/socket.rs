//! TCP connector for the native transport whose sockets can be shut down
//! from the pump.
//!
//! # Design
//! `ureq` owns its sockets and blocks inside them while waiting for a
//! response. To make an abort interrupt that wait, agents are built with
//! [`AbortableConnector`] in place of ureq's plain TCP connector. Every
//! socket it opens is shared (`Arc<TcpStream>`) with the hand-off block of
//! the exchange running on the current worker thread, registered through
//! [`bind_worker`]. `Handoff::request_abort` then shuts the socket down and
//! the blocked read or write returns at once.
//!
//! Registration happens on every read and write rather than at connect
//! time, so a pooled connection picked up by a later exchange is attached
//! to that exchange.

use std::cell::RefCell;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use ureq::unversioned::transport::{
    Buffers, ConnectionDetails, Connector, Either, LazyBuffers, NextTimeout, Transport,
};
use ureq::Timeout;

use crate::handoff::Handoff;

thread_local! {
    static WORKER_HANDOFF: RefCell<Option<Arc<Handoff>>> = const { RefCell::new(None) };
}

/// Attach sockets used on this thread to `handoff` until the guard drops.
pub(crate) fn bind_worker(handoff: Arc<Handoff>) -> WorkerBinding {
    WORKER_HANDOFF.with(|slot| *slot.borrow_mut() = Some(handoff));
    WorkerBinding(())
}

pub(crate) struct WorkerBinding(());

impl Drop for WorkerBinding {
    fn drop(&mut self) {
        WORKER_HANDOFF.with(|slot| slot.borrow_mut().take());
    }
}

fn register(stream: &Arc<TcpStream>) {
    WORKER_HANDOFF.with(|slot| {
        if let Some(handoff) = slot.borrow().as_ref() {
            handoff.attach_socket(stream);
        }
    });
}

/// Opens plain TCP connections. TLS is layered on top by the next
/// connector in the chain.
#[derive(Debug, Default)]
pub(crate) struct AbortableConnector;

impl<In: Transport> Connector<In> for AbortableConnector {
    type Out = Either<In, SocketTransport>;

    fn connect(
        &self,
        details: &ConnectionDetails,
        chained: Option<In>,
    ) -> Result<Option<Self::Out>, ureq::Error> {
        if chained.is_some() {
            return Ok(chained.map(Either::A));
        }

        let config = details.config;
        let limit = details.timeout.not_zero().map(|d| *d);
        let mut last_error = None;
        for addr in &details.addrs {
            let attempt = match limit {
                Some(limit) => TcpStream::connect_timeout(addr, limit),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    if config.no_delay() {
                        stream.set_nodelay(true)?;
                    }
                    let buffers =
                        LazyBuffers::new(config.input_buffer_size(), config.output_buffer_size());
                    return Ok(Some(Either::B(SocketTransport::new(stream, buffers))));
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) if is_timeout(&e) => ureq::Error::Timeout(Timeout::Connect),
            Some(e) => ureq::Error::Io(e),
            None => ureq::Error::ConnectionFailed,
        })
    }
}

pub(crate) struct SocketTransport {
    stream: Arc<TcpStream>,
    buffers: LazyBuffers,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl SocketTransport {
    fn new(stream: TcpStream, buffers: LazyBuffers) -> Self {
        Self {
            stream: Arc::new(stream),
            buffers,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

fn io_error(e: io::Error, timeout: NextTimeout) -> ureq::Error {
    if is_timeout(&e) {
        ureq::Error::Timeout(timeout.reason)
    } else {
        ureq::Error::Io(e)
    }
}

/// Only touch the socket option when the deadline changed.
fn update_timeout(
    previous: &mut Option<Duration>,
    timeout: NextTimeout,
    apply: impl FnOnce(Option<Duration>) -> io::Result<()>,
) -> io::Result<()> {
    let next = timeout.not_zero().map(|d| *d);
    if next != *previous {
        apply(next)?;
        *previous = next;
    }
    Ok(())
}

impl Transport for SocketTransport {
    fn buffers(&mut self) -> &mut dyn Buffers {
        &mut self.buffers
    }

    fn transmit_output(&mut self, amount: usize, timeout: NextTimeout) -> Result<(), ureq::Error> {
        register(&self.stream);
        let stream = &*self.stream;
        update_timeout(&mut self.write_timeout, timeout, |t| stream.set_write_timeout(t))?;
        let output = &self.buffers.output()[..amount];
        (&*self.stream)
            .write_all(output)
            .map_err(|e| io_error(e, timeout))
    }

    fn await_input(&mut self, timeout: NextTimeout) -> Result<bool, ureq::Error> {
        register(&self.stream);
        let stream = &*self.stream;
        update_timeout(&mut self.read_timeout, timeout, |t| stream.set_read_timeout(t))?;
        let input = self.buffers.input_append_buf();
        let n = (&*self.stream)
            .read(input)
            .map_err(|e| io_error(e, timeout))?;
        self.buffers.input_appended(n);
        Ok(n > 0)
    }

    fn is_open(&mut self) -> bool {
        let mut stream = &*self.stream;
        if stream.set_nonblocking(true).is_err() {
            return false;
        }
        // Nothing may be waiting on an idle connection; EOF or stray bytes
        // mean it cannot be reused.
        let open = matches!(
            stream.read(&mut [0u8; 1]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock
        );
        open && stream.set_nonblocking(false).is_ok()
    }
}

impl fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketTransport")
            .field("peer", &self.stream.peer_addr().ok())
            .finish()
    }
}

/// Shut a shared socket down in both directions, waking blocked I/O.
pub(crate) fn shutdown(stream: &TcpStream) {
    // Already closed by the peer is fine.
    let _ = stream.shutdown(Shutdown::Both);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn sockets_attach_only_while_bound() {
        let (client, _server) = connected_pair();
        let stream = Arc::new(client);
        let handoff = Arc::new(Handoff::new(8));

        register(&stream);
        assert!(!handoff.has_socket());

        let binding = bind_worker(Arc::clone(&handoff));
        register(&stream);
        assert!(handoff.has_socket());
        drop(binding);

        let other = Arc::new(Handoff::new(8));
        register(&stream);
        assert!(!other.has_socket());
    }

    #[test]
    fn abort_wakes_a_blocked_read() {
        let (client, _server) = connected_pair();
        let stream = Arc::new(client);
        let handoff = Arc::new(Handoff::new(8));
        handoff.attach_socket(&stream);

        let reader = {
            let stream = Arc::clone(&stream);
            thread::spawn(move || (&*stream).read(&mut [0u8; 16]))
        };
        thread::sleep(Duration::from_millis(50));
        handoff.request_abort();
        // EOF or an error, but no longer blocked.
        assert!(!matches!(reader.join().unwrap(), Ok(n) if n > 0));
    }

    #[test]
    fn attaching_after_abort_shuts_down_at_once() {
        let (client, _server) = connected_pair();
        let stream = Arc::new(client);
        let handoff = Handoff::new(8);
        handoff.request_abort();
        handoff.attach_socket(&stream);
        assert_eq!((&*stream).read(&mut [0u8; 4]).unwrap_or(0), 0);
    }

    #[test]
    fn close_and_reset_release_the_socket() {
        let (client, _server) = connected_pair();
        let stream = Arc::new(client);
        let handoff = Handoff::new(8);
        handoff.attach_socket(&stream);
        handoff.close();
        assert!(!handoff.has_socket());
        assert_eq!(Arc::strong_count(&stream), 1);

        handoff.attach_socket(&stream);
        handoff.reset();
        assert!(!handoff.has_socket());
    }

    #[test]
    fn idle_connection_is_open_until_peer_closes() {
        let (client, server) = connected_pair();
        let mut transport = SocketTransport::new(client, LazyBuffers::new(64, 64));
        assert!(transport.is_open());
        drop(server);
        thread::sleep(Duration::from_millis(50));
        assert!(!transport.is_open());
    }
}
