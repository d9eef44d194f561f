//! Bundled protocol implementations.

pub mod echo;

pub use echo::EchoProtocol;
