//! Protocol lifecycle contract and the shared accept dispatch.
//!
//! A protocol moves through `created → started → stopped`; `accept` fires
//! any number of times while started. `start` and `stop` default to
//! no-ops; `accept` is the one override every protocol must provide.

use crate::dispatcher::ResponseDispatcher;
use crate::reactor::Reactor;
use crate::stream::{Connection, ConnectionRegistry};
use socket2::Socket;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use tracing::debug;

/// Lifecycle of a protocol instance. One instance per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Started,
    Stopped,
}

/// What the server hands a protocol in its hooks: the dispatcher for
/// cross-thread responses and the free-form options from configuration.
pub struct ProtocolContext<'a> {
    pub dispatcher: &'a ResponseDispatcher,
    pub options: &'a HashMap<String, String>,
}

/// The lifecycle a connection handler must satisfy.
pub trait Protocol {
    /// Invoked once per process, before the accept callback is
    /// registered. A failure here aborts startup.
    fn start(&mut self, _ctx: &ProtocolContext<'_>) -> io::Result<()> {
        Ok(())
    }

    /// Invoked once during shutdown. Must tolerate a `start` that never
    /// ran to completion.
    fn stop(&mut self) {}

    /// Invoked once per successfully accepted connection.
    fn accept(&mut self, ctx: &ProtocolContext<'_>, conn: &Rc<Connection>);
}

/// Accept-dispatch shared by all protocols: drain the listener until the
/// OS reports "would block", wrapping each accepted socket and invoking
/// the protocol's `accept` hook.
///
/// "Would block" is a benign race (another worker won, or a spurious
/// wake) and never reaches the protocol; any other accept failure is
/// fatal and propagates.
pub(crate) fn dispatch_accept(
    listener: &Socket,
    tcp: bool,
    reactor: &Rc<dyn Reactor>,
    registry: &Rc<RefCell<ConnectionRegistry>>,
    protocol: &mut dyn Protocol,
    ctx: &ProtocolContext<'_>,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((socket, peer)) => {
                socket.set_nonblocking(true)?;
                if tcp {
                    // Connection-level default; the listener never carries it.
                    socket.set_nodelay(true)?;
                }

                let conn = Connection::attach(socket, Rc::clone(reactor), registry)?;
                debug!(
                    conn = conn.id().0,
                    peer = ?peer.as_socket(),
                    "accepted connection"
                );
                protocol.accept(ctx, &conn);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::MioReactor;
    use crate::socket::{create, BindTarget};

    struct CountingProtocol {
        accepted: usize,
    }

    impl Protocol for CountingProtocol {
        fn accept(&mut self, _ctx: &ProtocolContext<'_>, _conn: &Rc<Connection>) {
            self.accepted += 1;
        }
    }

    fn listening_socket() -> Socket {
        let spec = create(&BindTarget::Tcp {
            host: "127.0.0.1".to_string(),
            port: 0,
        })
        .unwrap();
        spec.socket.bind(&spec.addr).unwrap();
        spec.socket.listen(16).unwrap();
        spec.socket
    }

    #[test]
    fn test_would_block_never_reaches_accept_hook() {
        let listener = listening_socket();
        let reactor: Rc<dyn Reactor> = Rc::new(MioReactor::new().unwrap());
        let registry = Rc::new(RefCell::new(ConnectionRegistry::new()));
        let dispatcher = ResponseDispatcher::new().unwrap();
        let options = HashMap::new();
        let ctx = ProtocolContext {
            dispatcher: &dispatcher,
            options: &options,
        };

        let mut protocol = CountingProtocol { accepted: 0 };
        dispatch_accept(&listener, true, &reactor, &registry, &mut protocol, &ctx).unwrap();
        assert_eq!(protocol.accepted, 0);
    }

    #[test]
    fn test_accept_hook_fires_once_per_connection() {
        let listener = listening_socket();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();

        let c1 = std::net::TcpStream::connect(addr).unwrap();
        let c2 = std::net::TcpStream::connect(addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        let reactor: Rc<dyn Reactor> = Rc::new(MioReactor::new().unwrap());
        let registry = Rc::new(RefCell::new(ConnectionRegistry::new()));
        let dispatcher = ResponseDispatcher::new().unwrap();
        let options = HashMap::new();
        let ctx = ProtocolContext {
            dispatcher: &dispatcher,
            options: &options,
        };

        let mut protocol = CountingProtocol { accepted: 0 };
        dispatch_accept(&listener, true, &reactor, &registry, &mut protocol, &ctx).unwrap();

        assert_eq!(protocol.accepted, 2);
        assert_eq!(registry.borrow().len(), 2);
        drop((c1, c2));
    }
}
