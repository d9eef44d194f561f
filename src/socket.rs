//! Listening-socket construction.
//!
//! Produces a configured, bind-ready socket: resolved address, address
//! reuse, close-on-exec, non-blocking, and dual-stack where the platform
//! allows it. Binding and listening are the caller's responsibility and
//! must happen before any workers are forked.
//!
//! TCP_NODELAY belongs at the connection layer; the accept path applies
//! it to each accepted TCP socket, never to the listener.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where a server listens: a TCP endpoint, or a unix-domain socket path
/// when the configuration carries no port.
#[derive(Debug, Clone)]
pub enum BindTarget {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

/// A configured but unbound socket, plus the address to bind it to.
pub struct ListenerSpec {
    pub socket: Socket,
    pub addr: SockAddr,
}

/// Build a bind-ready socket for `target`.
pub fn create(target: &BindTarget) -> io::Result<ListenerSpec> {
    match target {
        BindTarget::Tcp { host, port } => create_tcp(host, *port),
        BindTarget::Unix { path } => create_unix(path),
    }
}

fn create_tcp(host: &str, port: u16) -> io::Result<ListenerSpec> {
    let mut addr = resolve(host, port)?;

    let socket = match new_tcp_socket(&addr) {
        Ok(socket) => socket,
        Err(_) if host.is_empty() && addr.is_ipv6() => {
            // No IPv6 support at all; the any-address default drops to v4.
            addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
            new_tcp_socket(&addr)?
        }
        Err(e) => return Err(e),
    };

    socket.set_reuse_address(true)?;
    socket.set_cloexec(true)?;
    socket.set_nonblocking(true)?;

    // Listening on the IPv6 any-address should serve IPv4 traffic too.
    // Platforms without the toggle simply stay v6-only.
    if let SocketAddr::V6(v6) = addr {
        if v6.ip().is_unspecified() {
            if let Err(e) = socket.set_only_v6(false) {
                debug!(error = %e, "could not enable dual-stack, continuing v6-only");
            }
        }
    }

    Ok(ListenerSpec {
        socket,
        addr: addr.into(),
    })
}

fn new_tcp_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
}

fn create_unix(path: &Path) -> io::Result<ListenerSpec> {
    remove_stale_socket(path)?;

    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_cloexec(true)?;
    socket.set_nonblocking(true)?;

    Ok(ListenerSpec {
        socket,
        addr: SockAddr::unix(path)?,
    })
}

/// A leftover socket file from a previous run would fail the bind.
/// Anything that is not a socket is left alone and the bind error
/// surfaces to the caller.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!(path = %path.display(), "removing stale socket file");
            std::fs::remove_file(path)
        }
        _ => Ok(()),
    }
}

/// Resolve `host:port` through system name resolution. On failure, fall
/// back to interpreting the host as an address literal: a colon means
/// IPv6, anything else IPv4.
fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    // Empty host means all interfaces; prefer the v6 any-address so the
    // dual-stack toggle can cover v4 as well.
    let host = if host.is_empty() { "::" } else { host };

    match (host, port).to_socket_addrs() {
        Ok(mut addrs) => addrs
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")),
        Err(_) => literal_fallback(host, port),
    }
}

fn literal_fallback(host: &str, port: u16) -> io::Result<SocketAddr> {
    if host.contains(':') {
        let ip: Ipv6Addr = host.parse().map_err(|_| unsupported_address(host))?;
        Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)))
    } else {
        let ip: Ipv4Addr = host.parse().map_err(|_| unsupported_address(host))?;
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }
}

fn unsupported_address(host: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unsupported listen address '{host}'"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_fallback_ipv4() {
        let addr = literal_fallback("127.0.0.1", 8000).unwrap();
        assert!(matches!(addr, SocketAddr::V4(a) if a.port() == 8000));
    }

    #[test]
    fn test_literal_fallback_ipv6() {
        let addr = literal_fallback("::1", 8000).unwrap();
        assert!(matches!(addr, SocketAddr::V6(a) if a.port() == 8000));
    }

    #[test]
    fn test_literal_fallback_rejects_garbage() {
        assert!(literal_fallback("not-an-address", 8000).is_err());
        assert!(literal_fallback("bad:v6:literal::zz", 8000).is_err());
    }

    #[test]
    fn test_empty_host_means_any_address() {
        let addr = resolve("", 0).unwrap();
        match addr {
            SocketAddr::V6(a) => assert!(a.ip().is_unspecified()),
            SocketAddr::V4(a) => assert!(a.ip().is_unspecified()),
        }
    }

    #[test]
    fn test_created_socket_binds_and_listens() {
        let target = BindTarget::Tcp {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        let spec = create(&target).unwrap();
        spec.socket.bind(&spec.addr).unwrap();
        spec.socket.listen(16).unwrap();

        let local = spec.socket.local_addr().unwrap().as_socket().unwrap();
        assert_ne!(local.port(), 0);

        // Non-blocking listener: accept with no client must not hang.
        let err = spec.socket.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_unix_target_binds_to_path() {
        let dir = std::env::temp_dir().join(format!("mooring-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("listen.sock");

        let target = BindTarget::Unix { path: path.clone() };
        let spec = create(&target).unwrap();
        spec.socket.bind(&spec.addr).unwrap();
        spec.socket.listen(16).unwrap();
        assert!(path.exists());

        // A second factory run must clear the stale file and bind again.
        drop(spec);
        let spec = create(&target).unwrap();
        spec.socket.bind(&spec.addr).unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }
}
