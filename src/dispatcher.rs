//! Cross-thread response hand-off.
//!
//! Any thread may enqueue a (connection, payload) pair; the reactor
//! thread that owns the connection performs the actual write. The queue
//! is FIFO per dispatcher; enqueuing signals the wake so the reactor
//! drains promptly.

use crate::stream::{ConnId, ConnectionRegistry, PostWrite};
use crate::wake::WakeSignal;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// One queued response: consumed exactly once, in enqueue order.
struct QueuedResponse {
    conn: ConnId,
    payload: Vec<u8>,
    post: Option<PostWrite>,
}

struct Inner {
    queue: Mutex<VecDeque<QueuedResponse>>,
    wake: WakeSignal,
}

/// Thread-safe FIFO of responses plus the wake that announces them.
#[derive(Clone)]
pub struct ResponseDispatcher {
    inner: Arc<Inner>,
}

impl ResponseDispatcher {
    pub fn new() -> io::Result<Self> {
        Ok(ResponseDispatcher {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                wake: WakeSignal::new()?,
            }),
        })
    }

    /// Queue `payload` for delivery to `conn` and wake the owning
    /// reactor thread. Non-blocking; safe from any thread.
    pub fn enqueue(&self, conn: ConnId, payload: impl Into<Vec<u8>>, post: Option<PostWrite>) {
        let entry = QueuedResponse {
            conn,
            payload: payload.into(),
            post,
        };
        match self.inner.queue.lock() {
            Ok(mut queue) => queue.push_back(entry),
            Err(poisoned) => poisoned.into_inner().push_back(entry),
        }
        self.inner.wake.set();
    }

    /// The fd the reactor registers to learn about queued responses.
    pub fn wake_fd(&self) -> RawFd {
        self.inner.wake.fd()
    }

    /// Drain every entry queued so far. Runs on the reactor thread only.
    ///
    /// Entries aimed at a connection that has since closed are dropped
    /// silently; a failed write is logged and does not stop the drain.
    /// Only the entries present at the start are taken, so a fast
    /// producer cannot pin the reactor here.
    pub(crate) fn drain(&self, registry: &Rc<RefCell<ConnectionRegistry>>) {
        self.inner.wake.clear();

        let batch: Vec<QueuedResponse> = {
            match self.inner.queue.lock() {
                Ok(mut queue) => queue.drain(..).collect(),
                Err(poisoned) => poisoned.into_inner().drain(..).collect(),
            }
        };

        for entry in batch {
            // Clone the connection out so the write may re-borrow the
            // registry (a post-write close removes itself from it).
            let conn = { registry.borrow().get(entry.conn) };
            match conn {
                None => {
                    debug!(conn = entry.conn.0, "dropping response for closed connection");
                }
                Some(conn) if conn.is_closed() => {
                    debug!(conn = entry.conn.0, "dropping response for closed connection");
                }
                Some(conn) => {
                    if let Err(e) = conn.write(&entry.payload, entry.post) {
                        warn!(conn = entry.conn.0, error = %e, "failed to deliver queued response");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{MioReactor, Reactor};
    use crate::stream::Connection;
    use socket2::Socket;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};

    fn attached_connection() -> (
        Rc<Connection>,
        TcpStream,
        Rc<RefCell<ConnectionRegistry>>,
    ) {
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
    fn test_drain_preserves_enqueue_order() {
        let (conn, mut client, registry) = attached_connection();
        let dispatcher = ResponseDispatcher::new().unwrap();

        dispatcher.enqueue(conn.id(), b"first ".to_vec(), None);
        dispatcher.enqueue(conn.id(), b"second ".to_vec(), None);
        dispatcher.enqueue(conn.id(), b"third".to_vec(), None);
        assert!(dispatcher.inner.wake.is_set());

        dispatcher.drain(&registry);
        assert!(!dispatcher.inner.wake.is_set());

        conn.close();
        let mut got = String::new();
        client.read_to_string(&mut got).unwrap();
        assert_eq!(got, "first second third");
    }

    #[test]
    fn test_entry_for_closed_connection_is_dropped() {
        let (conn, _client, registry) = attached_connection();
        let dispatcher = ResponseDispatcher::new().unwrap();

        let id = conn.id();
        conn.close();

        dispatcher.enqueue(id, b"never delivered".to_vec(), None);
        // Must not error and must not panic on the missing connection.
        dispatcher.drain(&registry);
    }

    #[test]
    fn test_post_write_close_runs_after_delivery() {
        let (conn, mut client, registry) = attached_connection();
        let dispatcher = ResponseDispatcher::new().unwrap();

        dispatcher.enqueue(conn.id(), b"bye", Some(PostWrite::Close));
        dispatcher.drain(&registry);

        assert!(conn.is_closed());
        let mut got = Vec::new();
        client.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"bye");
    }

    #[test]
    fn test_enqueue_from_other_threads_keeps_fifo_per_thread() {
        let (conn, mut client, registry) = attached_connection();
        let dispatcher = ResponseDispatcher::new().unwrap();

        let id = conn.id();
        let remote = dispatcher.clone();
        std::thread::spawn(move || {
            for i in 0..5u8 {
                remote.enqueue(id, vec![b'0' + i], None);
            }
        })
        .join()
        .unwrap();

        dispatcher.drain(&registry);
        conn.close();

        let mut got = String::new();
        client.read_to_string(&mut got).unwrap();
        assert_eq!(got, "01234");
    }
}
