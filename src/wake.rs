//! Cross-thread wake signal built on a self-pipe.
//!
//! The reactor registers the read end for readiness; any thread may call
//! `set()` to interrupt the reactor's wait. The signal is level-triggered
//! and carries no payload.

use std::io;
use std::os::unix::io::RawFd;

/// A level-triggered, cross-thread notification primitive.
///
/// One end is readable by the reactor, the other is writable by any
/// thread (including signal handlers, since `write(2)` is
/// async-signal-safe). Both ends are non-blocking and close-on-exec.
#[derive(Debug)]
pub struct WakeSignal {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakeSignal {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let signal = WakeSignal {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        for fd in fds {
            set_nonblocking_cloexec(fd)?;
        }
        Ok(signal)
    }

    /// Signal the reactor. Safe to call from any thread, any number of
    /// times; a pipe that already holds a wake byte stays set (EAGAIN on
    /// a full pipe is the level-triggered no-op case).
    pub fn set(&self) {
        let byte = [1u8];
        unsafe { libc::write(self.write_fd, byte.as_ptr().cast(), 1) };
    }

    /// Drain all pending wake bytes. Called by the reactor thread before
    /// it consumes whatever the wake announced.
    pub fn clear(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    /// Whether a wake is currently pending.
    pub fn is_set(&self) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.read_fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, 0) };
        n > 0 && pfd.revents & libc::POLLIN != 0
    }

    /// The fd the reactor should register for read readiness.
    pub fn fd(&self) -> RawFd {
        self.read_fd
    }

    /// The writable end, for async-signal-safe wakes from a signal handler.
    pub(crate) fn write_fd(&self) -> RawFd {
        self.write_fd
    }
}

impl Drop for WakeSignal {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_clear() {
        let wake = WakeSignal::new().unwrap();
        assert!(!wake.is_set());

        wake.set();
        assert!(wake.is_set());

        wake.clear();
        assert!(!wake.is_set());
    }

    #[test]
    fn test_set_is_level_triggered() {
        let wake = WakeSignal::new().unwrap();
        wake.set();
        wake.set();
        wake.set();
        assert!(wake.is_set());

        // One clear drains every pending byte.
        wake.clear();
        assert!(!wake.is_set());
    }

    #[test]
    fn test_set_from_other_thread() {
        let wake = std::sync::Arc::new(WakeSignal::new().unwrap());
        let remote = std::sync::Arc::clone(&wake);
        std::thread::spawn(move || remote.set()).join().unwrap();
        assert!(wake.is_set());
    }
}
