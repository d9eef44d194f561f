//! Buffered connection stream and the per-process connection registry.
//!
//! `Connection` is the stream collaborator consumed by protocols: queued
//! non-blocking writes with an optional post-write action, and one-shot
//! delimiter reads with a completion callback. Connections are owned by
//! the reactor thread; other threads refer to them only through the
//! plain [`ConnId`] handle and the response dispatcher.

use crate::reactor::{Reactor, Readiness};
use bytes::{Buf, BytesMut};
use slab::Slab;
use socket2::Socket;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

/// Handle to a live connection. A bare slab index, so it can cross
/// threads even though the connection itself never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub(crate) usize);

/// Action performed once a queued write has fully flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostWrite {
    Close,
}

struct PendingRead {
    delimiter: Vec<u8>,
    done: Box<dyn FnOnce(&Rc<Connection>, BytesMut)>,
}

struct OutChunk {
    data: BytesMut,
    post: Option<PostWrite>,
}

/// Cap on buffered, undelimited input. A peer that sends this much
/// without ever producing the awaited delimiter is disconnected.
const DEFAULT_READ_LIMIT: usize = 1024 * 1024;

struct StreamState {
    read_buf: BytesMut,
    pending_read: Option<PendingRead>,
    out: VecDeque<OutChunk>,
    interest: Readiness,
    read_limit: usize,
}

/// An accepted socket wrapped for reactor-driven use.
pub struct Connection {
    id: ConnId,
    fd: RawFd,
    socket: RefCell<Socket>,
    reactor: Rc<dyn Reactor>,
    registry: Weak<RefCell<ConnectionRegistry>>,
    state: RefCell<StreamState>,
    handler: RefCell<Option<crate::reactor::Callback>>,
    closed: Cell<bool>,
}

impl Connection {
    /// Wrap an accepted socket, insert it into the registry, and register
    /// it with the reactor for read readiness.
    pub(crate) fn attach(
        socket: Socket,
        reactor: Rc<dyn Reactor>,
        registry: &Rc<RefCell<ConnectionRegistry>>,
    ) -> io::Result<Rc<Connection>> {
        let fd = socket.as_raw_fd();
        let id = ConnId(registry.borrow().conns.vacant_key());

        let conn = Rc::new(Connection {
            id,
            fd,
            socket: RefCell::new(socket),
            reactor,
            registry: Rc::downgrade(registry),
            state: RefCell::new(StreamState {
                read_buf: BytesMut::with_capacity(4096),
                pending_read: None,
                out: VecDeque::new(),
                interest: Readiness::READABLE,
                read_limit: DEFAULT_READ_LIMIT,
            }),
            handler: RefCell::new(None),
            closed: Cell::new(false),
        });

        let key = registry.borrow_mut().conns.insert(Rc::clone(&conn));
        debug_assert_eq!(key, id.0);

        let cb = {
            let conn = Rc::clone(&conn);
            crate::reactor::callback(move |_fd, ready| conn.on_ready(ready))
        };
        *conn.handler.borrow_mut() = Some(Rc::clone(&cb));

        if let Err(e) = conn.reactor.register(fd, Readiness::READABLE, cb) {
            registry.borrow_mut().remove(id);
            *conn.handler.borrow_mut() = None;
            return Err(e);
        }

        Ok(conn)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Change the cap on buffered input awaiting a delimiter.
    pub fn set_read_limit(&self, limit: usize) {
        self.state.borrow_mut().read_limit = limit.max(1);
    }

    /// Queue `payload` for writing. Flushes as much as the socket accepts
    /// right away; the remainder goes out on write readiness. The
    /// post-write action runs once the payload has fully flushed.
    pub fn write(self: &Rc<Self>, payload: &[u8], post: Option<PostWrite>) -> io::Result<()> {
        if self.closed.get() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        self.state.borrow_mut().out.push_back(OutChunk {
            data: BytesMut::from(payload),
            post,
        });
        self.flush_out()
    }

    /// Read until `delimiter` appears, then invoke `done` with everything
    /// up to and including the delimiter. One-shot: re-arm from the
    /// callback to keep reading.
    pub fn read_until(
        self: &Rc<Self>,
        delimiter: &[u8],
        done: impl FnOnce(&Rc<Connection>, BytesMut) + 'static,
    ) -> io::Result<()> {
        if self.closed.get() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        debug_assert!(!delimiter.is_empty());
        {
            let mut state = self.state.borrow_mut();
            if state.pending_read.is_some() {
                debug!(conn = self.id.0, "replacing pending read");
            }
            state.pending_read = Some(PendingRead {
                delimiter: delimiter.to_vec(),
                done: Box::new(done),
            });
        }
        // The delimiter may already be buffered from an earlier read.
        self.try_complete_read();
        Ok(())
    }

    /// Close the connection: deregister from the reactor, drop out of the
    /// registry, discard pending reads and writes. Idempotent.
    pub fn close(self: &Rc<Self>) {
        if self.closed.replace(true) {
            return;
        }
        debug!(conn = self.id.0, "closing connection");

        let _ = self.reactor.unregister(self.fd);
        if let Some(registry) = self.registry.upgrade() {
            registry.borrow_mut().remove(self.id);
        }
        // Break the cycle between the connection and its own callback.
        *self.handler.borrow_mut() = None;
        {
            let mut state = self.state.borrow_mut();
            state.pending_read = None;
            state.out.clear();
        }
        let _ = self.socket.borrow().shutdown(std::net::Shutdown::Both);
    }

    pub(crate) fn on_ready(self: &Rc<Self>, ready: Readiness) {
        if ready.is_readable() && !self.closed.get() {
            self.on_readable();
        }
        if ready.is_writable() && !self.closed.get() {
            if let Err(e) = self.flush_out() {
                warn!(conn = self.id.0, error = %e, "write failed, closing connection");
                self.close();
            }
        }
    }

    fn on_readable(self: &Rc<Self>) {
        let mut eof = false;
        loop {
            let mut buf = [0u8; 4096];
            let n = match self.socket.borrow_mut().read(&mut buf) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn = self.id.0, error = %e, "read failed");
                    eof = true;
                    break;
                }
            };
            let mut state = self.state.borrow_mut();
            state.read_buf.extend_from_slice(&buf[..n]);
            if state.read_buf.len() > state.read_limit {
                drop(state);
                warn!(conn = self.id.0, "input exceeded buffer limit, closing connection");
                self.close();
                return;
            }
        }

        self.try_complete_read();
        if eof {
            self.close();
        }
    }

    fn try_complete_read(self: &Rc<Self>) {
        let completed = {
            let mut state = self.state.borrow_mut();
            let found = state
                .pending_read
                .as_ref()
                .and_then(|p| find_delimiter(&state.read_buf, &p.delimiter));
            match found {
                Some(end) => {
                    let data = state.read_buf.split_to(end);
                    state.pending_read.take().map(|p| (p.done, data))
                }
                None => None,
            }
        };

        if let Some((done, data)) = completed {
            done(self, data);
        }
    }

    fn flush_out(self: &Rc<Self>) -> io::Result<()> {
        loop {
            let mut state = self.state.borrow_mut();
            let Some(chunk) = state.out.front_mut() else {
                drop(state);
                return self.set_interest(Readiness::READABLE);
            };

            let n = match self.socket.borrow_mut().write(&chunk.data) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    drop(state);
                    return self.set_interest(Readiness::READABLE | Readiness::WRITABLE);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            chunk.data.advance(n);

            if chunk.data.is_empty() {
                let post = state.out.pop_front().and_then(|c| c.post);
                drop(state);
                if post == Some(PostWrite::Close) {
                    self.close();
                    return Ok(());
                }
            }
        }
    }

    fn set_interest(self: &Rc<Self>, want: Readiness) -> io::Result<()> {
        {
            let mut state = self.state.borrow_mut();
            if state.interest == want {
                return Ok(());
            }
            state.interest = want;
        }
        let handler = self.handler.borrow().clone();
        match handler {
            Some(handler) => self.reactor.register(self.fd, want, handler),
            None => Ok(()),
        }
    }
}

/// End offset of the first occurrence of `delimiter` in `haystack`.
fn find_delimiter(haystack: &[u8], delimiter: &[u8]) -> Option<usize> {
    if delimiter.is_empty() || haystack.len() < delimiter.len() {
        return None;
    }
    haystack
        .windows(delimiter.len())
        .position(|w| w == delimiter)
        .map(|pos| pos + delimiter.len())
}

/// Registry of live connections, one per process. Slab-allocated so the
/// [`ConnId`] handles stay dense and O(1).
pub struct ConnectionRegistry {
    conns: Slab<Rc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry { conns: Slab::new() }
    }

    pub fn get(&self, id: ConnId) -> Option<Rc<Connection>> {
        self.conns.get(id.0).cloned()
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.conns.contains(id.0)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Snapshot of every live connection, for shutdown-time closing
    /// without holding the registry borrow.
    pub(crate) fn all(&self) -> Vec<Rc<Connection>> {
        self.conns.iter().map(|(_, c)| Rc::clone(c)).collect()
    }

    fn remove(&mut self, id: ConnId) -> Option<Rc<Connection>> {
        if self.conns.contains(id.0) {
            Some(self.conns.remove(id.0))
        } else {
            None
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::MioReactor;
    use std::net::{TcpListener, TcpStream};

    fn connected_pair() -> (Rc<Connection>, TcpStream, Rc<RefCell<ConnectionRegistry>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let socket = Socket::from(server_side);
        socket.set_nonblocking(true).unwrap();

        let reactor: Rc<dyn Reactor> = Rc::new(MioReactor::new().unwrap());
        let registry = Rc::new(RefCell::new(ConnectionRegistry::new()));
        let conn = Connection::attach(socket, reactor, &registry).unwrap();
        (conn, client, registry)
    }

    #[test]
    fn test_find_delimiter() {
        assert_eq!(find_delimiter(b"ping\r\nrest", b"\r\n"), Some(6));
        assert_eq!(find_delimiter(b"no terminator", b"\r\n"), None);
        assert_eq!(find_delimiter(b"", b"\r\n"), None);
    }

    #[test]
    fn test_read_until_delivers_line_and_keeps_remainder() {
        use std::io::Write as _;

        let (conn, mut client, _registry) = connected_pair();

        let got: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&got);
        conn.read_until(b"\r\n", move |_conn, line| {
            sink.borrow_mut().push(line.to_vec());
        })
        .unwrap();

        client.write_all(b"one\r\ntwo\r\n").unwrap();
        client.flush().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        conn.on_ready(Readiness::READABLE);

        assert_eq!(got.borrow().as_slice(), &[b"one\r\n".to_vec()]);

        // The second line is already buffered; a fresh read_until
        // completes without any new readiness event.
        let sink = Rc::clone(&got);
        conn.read_until(b"\r\n", move |_conn, line| {
            sink.borrow_mut().push(line.to_vec());
        })
        .unwrap();

        assert_eq!(
            got.borrow().as_slice(),
            &[b"one\r\n".to_vec(), b"two\r\n".to_vec()]
        );
    }

    #[test]
    fn test_write_with_close_action_removes_connection() {
        use std::io::Read as _;

        let (conn, mut client, registry) = connected_pair();
        assert_eq!(registry.borrow().len(), 1);

        conn.write(b"Goodbye!\r\n", Some(PostWrite::Close)).unwrap();
        assert!(conn.is_closed());
        assert!(registry.borrow().is_empty());

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"Goodbye!\r\n");
    }

    #[test]
    fn test_write_after_close_is_rejected() {
        let (conn, _client, _registry) = connected_pair();
        conn.close();
        conn.close(); // idempotent

        let err = conn.write(b"late", None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(conn.read_until(b"\r\n", |_, _| {}).is_err());
    }

    #[test]
    fn test_input_past_read_limit_closes_connection() {
        use std::io::Write as _;

        let (conn, mut client, registry) = connected_pair();
        conn.set_read_limit(64);

        // No delimiter anywhere in sight; the buffer must not grow
        // past the cap.
        client.write_all(&[b'x'; 256]).unwrap();
        client.flush().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        conn.on_ready(Readiness::READABLE);

        assert!(conn.is_closed());
        assert!(registry.borrow().is_empty());
    }

    #[test]
    fn test_eof_closes_connection() {
        let (conn, client, registry) = connected_pair();
        drop(client);
        std::thread::sleep(std::time::Duration::from_millis(50));
        conn.on_ready(Readiness::READABLE);
        assert!(conn.is_closed());
        assert!(registry.borrow().is_empty());
    }
}
