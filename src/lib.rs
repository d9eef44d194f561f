//! mooring: a pre-fork socket server bootstrap.
//!
//! The crate owns the hard, reusable pieces of serving a socket:
//! - building a dual-stack, reusable listening socket ([`socket`])
//! - a pre-fork worker supervisor with safe post-fork state
//!   ([`supervisor`])
//! - the lifecycle contract a connection protocol satisfies
//!   ([`protocol`])
//! - a wake-driven hand-off so any thread can answer on a connection
//!   owned by the reactor thread ([`dispatcher`])
//!
//! The event loop and the buffered stream are collaborators specified at
//! their boundary ([`reactor::Reactor`], [`stream::Connection`]);
//! reference implementations backed by mio ship with the crate.

pub mod config;
pub mod dispatcher;
pub mod pool;
pub mod protocol;
pub mod protocols;
pub mod reactor;
pub mod server;
pub mod socket;
pub mod stream;
pub mod supervisor;
pub mod wake;

pub use config::{ProtocolKind, ServerConfig};
pub use dispatcher::ResponseDispatcher;
pub use protocol::{Lifecycle, Protocol, ProtocolContext};
pub use reactor::{MioReactor, Reactor, Readiness};
pub use server::{Server, ShutdownHandle};
pub use stream::{ConnId, Connection, PostWrite};
pub use wake::WakeSignal;
