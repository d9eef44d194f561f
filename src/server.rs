//! Server: listening-socket ownership, worker orchestration, and the
//! exactly-once graceful shutdown path.
//!
//! A server binds and listens before any fork, so every worker inherits
//! the same listening socket. Each process then builds its own reactor,
//! response dispatcher, and shutdown wake (fd-backed state is never
//! shared across forks), registers the shared accept dispatch, and runs
//! the reactor until an interrupt or an explicit stop request.

use crate::config::ServerConfig;
use crate::dispatcher::ResponseDispatcher;
use crate::protocol::{dispatch_accept, Lifecycle, Protocol, ProtocolContext};
use crate::reactor::{self, MioReactor, Reactor, Readiness};
use crate::socket;
use crate::stream::ConnectionRegistry;
use crate::supervisor::{self, ForkOutcome};
use crate::wake::WakeSignal;
use socket2::{SockAddr, Socket};
use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{error, info};

type Hook = Rc<dyn Fn(&Server)>;
type ReactorFactory = Box<dyn Fn() -> io::Result<Rc<dyn Reactor>>>;

/// Cloneable, thread-safe handle that asks a serving worker to begin its
/// graceful shutdown. Interrupt signals and this handle converge on the
/// same stop path.
#[derive(Clone)]
pub struct ShutdownHandle {
    wake: Arc<WakeSignal>,
}

impl ShutdownHandle {
    pub fn request_stop(&self) {
        self.wake.set();
    }
}

/// A multi-process socket server. All mutable state lives on the
/// instance; two servers constructed side by side share nothing.
pub struct Server {
    config: ServerConfig,
    protocol: RefCell<Box<dyn Protocol>>,
    registry: Rc<RefCell<ConnectionRegistry>>,
    listener: RefCell<Option<Socket>>,
    bound_addr: RefCell<Option<SockAddr>>,
    // Per-process, created after fork: reactor, dispatcher, shutdown wake.
    reactor: RefCell<Option<Rc<dyn Reactor>>>,
    reactor_factory: RefCell<Option<ReactorFactory>>,
    dispatcher: RefCell<Option<ResponseDispatcher>>,
    shutdown_wake: RefCell<Option<Arc<WakeSignal>>>,
    start_hooks: RefCell<Vec<Hook>>,
    stop_hooks: RefCell<Vec<Hook>>,
    state: Cell<Lifecycle>,
    run_error: RefCell<Option<io::Error>>,
}

impl Server {
    pub fn new(config: ServerConfig, protocol: Box<dyn Protocol>) -> Rc<Server> {
        Rc::new(Server {
            config,
            protocol: RefCell::new(protocol),
            registry: Rc::new(RefCell::new(ConnectionRegistry::new())),
            listener: RefCell::new(None),
            bound_addr: RefCell::new(None),
            reactor: RefCell::new(None),
            reactor_factory: RefCell::new(None),
            dispatcher: RefCell::new(None),
            shutdown_wake: RefCell::new(None),
            start_hooks: RefCell::new(Vec::new()),
            stop_hooks: RefCell::new(Vec::new()),
            state: Cell::new(Lifecycle::Created),
            run_error: RefCell::new(None),
        })
    }

    /// Replace the bundled mio reactor. The factory runs once per worker
    /// process, after any fork.
    pub fn set_reactor_factory(
        &self,
        factory: impl Fn() -> io::Result<Rc<dyn Reactor>> + 'static,
    ) {
        *self.reactor_factory.borrow_mut() = Some(Box::new(factory));
    }

    /// Run `hook` once per process after the protocol has started.
    pub fn on_start(&self, hook: impl Fn(&Server) + 'static) {
        self.start_hooks.borrow_mut().push(Rc::new(hook));
    }

    /// Run `hook` once per process during graceful shutdown.
    pub fn on_stop(&self, hook: impl Fn(&Server) + 'static) {
        self.stop_hooks.borrow_mut().push(Rc::new(hook));
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> Lifecycle {
        self.state.get()
    }

    /// The bound address, available once `start` has bound the listener.
    /// `None` for unix-domain sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr.borrow().as_ref().and_then(|a| a.as_socket())
    }

    /// Handle for stopping a serving worker from another thread.
    /// Available once the worker path has set up its wake, e.g. from a
    /// start hook.
    pub fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        self.shutdown_wake
            .borrow()
            .as_ref()
            .map(|wake| ShutdownHandle {
                wake: Arc::clone(wake),
            })
    }

    /// The per-process response dispatcher, available while serving.
    pub fn dispatcher(&self) -> Option<ResponseDispatcher> {
        self.dispatcher.borrow().clone()
    }

    /// Bind, listen, fork the configured number of workers, and serve
    /// until interrupted or stopped.
    ///
    /// Returns in every process: workers return when their run loop
    /// ends, the master returns once all workers have been reaped.
    pub fn start(self: &Rc<Self>) -> io::Result<()> {
        if self.state.get() != Lifecycle::Created {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "server already started",
            ));
        }

        // Bind and listen before forking, so workers share the socket.
        let spec = socket::create(&self.config.bind_target())?;
        spec.socket.bind(&spec.addr)?;
        spec.socket.listen(self.config.backlog)?;
        let bound = spec.socket.local_addr()?;
        info!(
            pid = std::process::id(),
            host = %self.config.host,
            port = ?self.config.port,
            addr = ?bound.as_socket(),
            "listening"
        );
        *self.bound_addr.borrow_mut() = Some(bound);
        *self.listener.borrow_mut() = Some(spec.socket);

        let workers = supervisor::resolve_workers(self.config.fork);
        if workers == 1 {
            return self.run_worker();
        }

        info!(workers, "pre-forking workers");
        supervisor::install_signal_handlers(None)?;
        match supervisor::spawn_workers(workers)? {
            ForkOutcome::Child => self.run_worker(),
            ForkOutcome::Parent { children } => {
                supervisor::reap_children(&children);
                self.stop();
                Ok(())
            }
        }
    }

    /// Graceful shutdown. Runs exactly once per process and is safe to
    /// call even if `start` failed partway: protocol stop, accept
    /// deregistration (or plain socket close on a master that never
    /// served), stop hooks, connection teardown, reactor stop. A step
    /// that panics is logged and the remaining steps still run.
    pub fn stop(&self) {
        if self.state.get() == Lifecycle::Stopped {
            return;
        }
        self.state.set(Lifecycle::Stopped);
        info!(pid = std::process::id(), "shutting down");

        {
            let mut protocol = self.protocol.borrow_mut();
            if catch_unwind(AssertUnwindSafe(|| protocol.stop())).is_err() {
                error!("protocol stop hook panicked");
            }
        }

        if let Some(listener) = self.listener.borrow_mut().take() {
            if let Some(reactor) = self.reactor.borrow().as_ref() {
                let _ = reactor.unregister(listener.as_raw_fd());
            }
            drop(listener);
        }

        self.run_hooks(&self.stop_hooks);

        let conns = self.registry.borrow().all();
        for conn in conns {
            conn.close();
        }

        if let Some(reactor) = self.reactor.borrow().as_ref() {
            if let Some(dispatcher) = self.dispatcher.borrow().as_ref() {
                let _ = reactor.unregister(dispatcher.wake_fd());
            }
            if let Some(wake) = self.shutdown_wake.borrow().as_ref() {
                let _ = reactor.unregister(wake.fd());
            }
        }
        *self.dispatcher.borrow_mut() = None;
        // The handler must stop writing to the wake before its fds close.
        supervisor::detach_signal_wake();
        *self.shutdown_wake.borrow_mut() = None;

        if let Some(reactor) = self.reactor.borrow().as_ref() {
            reactor.stop();
        }
        info!(pid = std::process::id(), "stopped");
    }

    /// Per-process serving path. Success or failure, setup and run loop
    /// both converge on the single graceful stop.
    fn run_worker(self: &Rc<Self>) -> io::Result<()> {
        let result = self.serve();
        self.stop();

        match result {
            Err(e) => {
                error!(error = %e, "worker failed");
                Err(e)
            }
            Ok(()) => match self.run_error.borrow_mut().take() {
                Some(e) => Err(e),
                None => Ok(()),
            },
        }
    }

    /// Reactor, dispatcher, signal plumbing, protocol start, accept
    /// registration, run loop.
    fn serve(self: &Rc<Self>) -> io::Result<()> {
        let reactor: Rc<dyn Reactor> = {
            let factory = self.reactor_factory.borrow();
            match factory.as_ref() {
                Some(factory) => factory()?,
                None => Rc::new(MioReactor::new()?),
            }
        };
        *self.reactor.borrow_mut() = Some(Rc::clone(&reactor));

        let dispatcher = ResponseDispatcher::new()?;
        *self.dispatcher.borrow_mut() = Some(dispatcher.clone());

        let shutdown = Arc::new(WakeSignal::new()?);
        *self.shutdown_wake.borrow_mut() = Some(Arc::clone(&shutdown));
        supervisor::install_signal_handlers(Some(&shutdown))?;
        // A signal delivered before the handlers were connected to this
        // wake only set the interrupt flag; fold it into the wake so the
        // stop request is not lost.
        if supervisor::interrupted() {
            shutdown.set();
        }

        // Response wake: drain queued responses on the owning thread.
        let weak = Rc::downgrade(self);
        reactor.register(
            dispatcher.wake_fd(),
            Readiness::READABLE,
            reactor::callback(move |_fd, _ready| {
                let Some(server) = weak.upgrade() else { return };
                let dispatcher = server.dispatcher.borrow().clone();
                if let Some(dispatcher) = dispatcher {
                    dispatcher.drain(&server.registry);
                }
            }),
        )?;

        // Shutdown wake: interrupt signals and explicit stop requests
        // both land here and leave the run loop.
        let weak = Rc::downgrade(self);
        reactor.register(
            shutdown.fd(),
            Readiness::READABLE,
            reactor::callback(move |_fd, _ready| {
                let Some(server) = weak.upgrade() else { return };
                info!("stop requested, leaving the run loop");
                if let Some(wake) = server.shutdown_wake.borrow().as_ref() {
                    wake.clear();
                }
                let reactor = server.reactor.borrow().clone();
                if let Some(reactor) = reactor {
                    reactor.stop();
                }
            }),
        )?;

        {
            let ctx = ProtocolContext {
                dispatcher: &dispatcher,
                options: &self.config.options,
            };
            self.protocol.borrow_mut().start(&ctx)?;
        }
        self.state.set(Lifecycle::Started);
        self.run_hooks(&self.start_hooks);

        let listener_fd = match self.listener.borrow().as_ref() {
            Some(listener) => listener.as_raw_fd(),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "listener missing before serve",
                ))
            }
        };
        let weak = Rc::downgrade(self);
        reactor.register(
            listener_fd,
            Readiness::READABLE,
            reactor::callback(move |_fd, _ready| {
                let Some(server) = weak.upgrade() else { return };
                if let Err(e) = server.on_accept_ready() {
                    error!(error = %e, "accept failed, stopping worker");
                    *server.run_error.borrow_mut() = Some(e);
                    if let Some(reactor) = server.reactor.borrow().as_ref() {
                        reactor.stop();
                    }
                }
            }),
        )?;

        info!(pid = std::process::id(), "worker serving");
        reactor.run()
    }

    fn on_accept_ready(self: &Rc<Self>) -> io::Result<()> {
        let listener = self.listener.borrow();
        let Some(listener) = listener.as_ref() else {
            return Ok(());
        };
        let Some(reactor) = self.reactor.borrow().clone() else {
            return Ok(());
        };
        let Some(dispatcher) = self.dispatcher.borrow().clone() else {
            return Ok(());
        };

        let ctx = ProtocolContext {
            dispatcher: &dispatcher,
            options: &self.config.options,
        };
        let mut protocol = self.protocol.borrow_mut();
        dispatch_accept(
            listener,
            self.config.is_tcp(),
            &reactor,
            &self.registry,
            protocol.as_mut(),
            &ctx,
        )
    }

    fn run_hooks(&self, hooks: &RefCell<Vec<Hook>>) {
        let mut i = 0;
        loop {
            let hook = { hooks.borrow().get(i).cloned() };
            let Some(hook) = hook else { break };
            if catch_unwind(AssertUnwindSafe(|| hook(self))).is_err() {
                error!("server hook panicked");
            }
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Connection;

    struct NoopProtocol;

    impl Protocol for NoopProtocol {
        fn accept(&mut self, _ctx: &ProtocolContext<'_>, _conn: &Rc<Connection>) {}
    }

    #[test]
    fn test_stop_before_start_is_safe() {
        let server = Server::new(ServerConfig::tcp("127.0.0.1", 0), Box::new(NoopProtocol));
        // Nothing was set up; every teardown step must tolerate that.
        server.stop();
        assert_eq!(server.state(), Lifecycle::Stopped);

        // A stopped server cannot be started.
        assert!(server.start().is_err());
    }

    #[test]
    fn test_double_stop_runs_hooks_once() {
        let server = Server::new(ServerConfig::tcp("127.0.0.1", 0), Box::new(NoopProtocol));
        let count = Rc::new(Cell::new(0u32));
        let seen = Rc::clone(&count);
        server.on_stop(move |_server| {
            seen.set(seen.get() + 1);
        });

        server.stop();
        server.stop();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_interrupt_before_serving_still_stops_worker() {
        let _guard = supervisor::SIGNAL_TEST_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // The signal lands while only the flag-setting handler is in
        // place; starting afterwards must still honor the stop request.
        supervisor::simulate_interrupt();

        let server = Server::new(ServerConfig::tcp("127.0.0.1", 0), Box::new(NoopProtocol));
        let result = server.start();
        supervisor::clear_interrupt();

        result.unwrap();
        assert_eq!(server.state(), Lifecycle::Stopped);
    }

    #[test]
    fn test_stop_hook_reentrancy_is_harmless() {
        let server = Server::new(ServerConfig::tcp("127.0.0.1", 0), Box::new(NoopProtocol));
        let count = Rc::new(Cell::new(0u32));
        let seen = Rc::clone(&count);
        server.on_stop(move |inner| {
            seen.set(seen.get() + 1);
            inner.stop();
        });

        server.stop();
        assert_eq!(count.get(), 1);
    }
}
