//! Reactor boundary and the mio-backed reference implementation.
//!
//! The server core only needs the four operations of the [`Reactor`]
//! trait: register a readiness callback for an fd, unregister it, run the
//! dispatch loop, and stop it. Callbacks run on the reactor's own thread,
//! one at a time; nothing here assumes a particular polling strategy.
//!
//! [`MioReactor`] is the bundled implementation: epoll on Linux, kqueue
//! on macOS, driven through `mio::Poll` and raw-fd sources.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;
use tracing::trace;

/// Readiness kinds a callback can be registered for, and the kind(s)
/// that actually triggered when it is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness(u8);

impl Readiness {
    pub const READABLE: Readiness = Readiness(0b01);
    pub const WRITABLE: Readiness = Readiness(0b10);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }
}

impl BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

/// A readiness callback. Shared ownership because the connection that
/// registered it may need to re-register with a different interest.
pub type Callback = Rc<RefCell<dyn FnMut(RawFd, Readiness)>>;

/// Convenience constructor for [`Callback`] values.
pub fn callback(f: impl FnMut(RawFd, Readiness) + 'static) -> Callback {
    Rc::new(RefCell::new(f))
}

/// The contract the server core requires from an event loop.
///
/// Dispatch is single-threaded and cooperative: no two callbacks for the
/// same reactor ever run concurrently.
pub trait Reactor {
    /// Register `callback` to be invoked when `fd` becomes ready for
    /// `interest`. Registering an fd that is already registered updates
    /// its interest and replaces its callback.
    fn register(&self, fd: RawFd, interest: Readiness, callback: Callback) -> io::Result<()>;

    /// Remove the registration for `fd`, if any.
    fn unregister(&self, fd: RawFd) -> io::Result<()>;

    /// Run the dispatch loop until [`Reactor::stop`] is called.
    fn run(&self) -> io::Result<()>;

    /// Ask the loop to exit after the current dispatch round.
    fn stop(&self);
}

/// Poll tick, so a `stop()` issued outside a callback is noticed promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Reference reactor backed by `mio::Poll` (epoll/kqueue).
pub struct MioReactor {
    poll: RefCell<Poll>,
    handlers: RefCell<HashMap<RawFd, Callback>>,
    running: Cell<bool>,
    events_capacity: usize,
}

impl MioReactor {
    pub fn new() -> io::Result<Self> {
        Ok(MioReactor {
            poll: RefCell::new(Poll::new()?),
            handlers: RefCell::new(HashMap::new()),
            running: Cell::new(false),
            events_capacity: 1024,
        })
    }
}

impl Reactor for MioReactor {
    fn register(&self, fd: RawFd, interest: Readiness, callback: Callback) -> io::Result<()> {
        let mut source = SourceFd(&fd);
        let poll = self.poll.borrow();
        let mut handlers = self.handlers.borrow_mut();

        let interest = to_mio_interest(interest);
        if handlers.contains_key(&fd) {
            poll.registry()
                .reregister(&mut source, Token(fd as usize), interest)?;
        } else {
            poll.registry()
                .register(&mut source, Token(fd as usize), interest)?;
        }
        handlers.insert(fd, callback);
        Ok(())
    }

    fn unregister(&self, fd: RawFd) -> io::Result<()> {
        if self.handlers.borrow_mut().remove(&fd).is_none() {
            return Ok(());
        }
        let mut source = SourceFd(&fd);
        self.poll.borrow().registry().deregister(&mut source)
    }

    fn run(&self) -> io::Result<()> {
        self.running.set(true);
        let mut events = Events::with_capacity(self.events_capacity);

        while self.running.get() {
            match self
                .poll
                .borrow_mut()
                .poll(&mut events, Some(POLL_INTERVAL))
            {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                let fd = event.token().0 as RawFd;
                trace!(fd, "readiness event");

                // Clone the handler out so callbacks can freely
                // register/unregister while running.
                let handler = self.handlers.borrow().get(&fd).cloned();
                if let Some(handler) = handler {
                    (handler.borrow_mut())(fd, event_readiness(event));
                }

                if !self.running.get() {
                    break;
                }
            }
        }

        Ok(())
    }

    fn stop(&self) {
        self.running.set(false);
    }
}

fn to_mio_interest(readiness: Readiness) -> Interest {
    match (readiness.is_readable(), readiness.is_writable()) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (_, true) => Interest::WRITABLE,
        _ => Interest::READABLE,
    }
}

fn event_readiness(event: &mio::event::Event) -> Readiness {
    let mut bits = 0u8;
    // Hangup and error conditions surface as readable so the handler
    // discovers them through its next syscall.
    if event.is_readable() || event.is_read_closed() || event.is_error() {
        bits |= Readiness::READABLE.0;
    }
    if event.is_writable() || event.is_write_closed() {
        bits |= Readiness::WRITABLE.0;
    }
    if bits == 0 {
        bits = Readiness::READABLE.0;
    }
    Readiness(bits)
}
