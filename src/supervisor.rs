//! Worker-process supervision: fork-count resolution, pre-fork spawning,
//! post-fork state hygiene, child reaping, and signal plumbing.
//!
//! Signals are delivered through the self-pipe trick: the handler only
//! flips a flag and writes one byte to a wake pipe, both of which are
//! async-signal-safe. Workers register the pipe with their reactor; the
//! master notices the flag when `waitpid` returns EINTR.

use crate::wake::WakeSignal;
use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::fs::File;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Resolve a requested fork count to the number of worker processes.
///
/// `None` or `0` means one worker per logical core; a negative value
/// reserves that many cores for other use; a positive value is taken
/// unchanged. Always at least 1.
pub fn resolve_workers(requested: Option<i32>) -> usize {
    let cores = logical_cores() as i32;
    let resolved = match requested {
        Some(n) if n >= 1 => n,
        Some(n) => cores + n,
        None => cores,
    };
    resolved.max(1) as usize
}

fn logical_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Which side of the fork loop we ended up on.
pub(crate) enum ForkOutcome {
    /// The master, holding the pids of every spawned worker.
    Parent { children: Vec<Pid> },
    /// A freshly forked worker with its RNG already reseeded.
    Child,
}

/// Fork `count` workers. Each child reseeds its process-local RNG so
/// siblings do not share a random stream, then returns without forking
/// further.
pub(crate) fn spawn_workers(count: usize) -> io::Result<ForkOutcome> {
    let mut children = Vec::with_capacity(count);
    for _ in 0..count {
        match unsafe { fork() }.map_err(io::Error::from)? {
            ForkResult::Child => {
                reseed_rng();
                return Ok(ForkOutcome::Child);
            }
            ForkResult::Parent { child } => {
                debug!(pid = child.as_raw(), "spawned worker");
                children.push(child);
            }
        }
    }
    Ok(ForkOutcome::Parent { children })
}

/// Reseed the process-local RNG from OS entropy, falling back to the pid
/// mixed with the current time.
pub(crate) fn reseed_rng() {
    let seed = entropy_seed().unwrap_or_else(fallback_seed);
    fastrand::seed(seed);
}

fn entropy_seed() -> Option<u64> {
    let mut file = File::open("/dev/urandom").ok()?;
    let mut bytes = [0u8; 8];
    file.read_exact(&mut bytes).ok()?;
    Some(u64::from_ne_bytes(bytes))
}

fn fallback_seed() -> u64 {
    let pid = std::process::id() as u64;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    pid.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ nanos
}

/// Block until every worker has exited. "No more children" is the normal
/// end of service. An interrupt forwards SIGTERM to the workers once and
/// keeps reaping.
pub(crate) fn reap_children(children: &[Pid]) {
    let mut forwarded = false;
    loop {
        if interrupted() && !forwarded {
            info!("interrupt received, asking workers to stop");
            for pid in children {
                let _ = signal::kill(*pid, Signal::SIGTERM);
            }
            forwarded = true;
        }

        match waitpid(None::<Pid>, None) {
            Ok(WaitStatus::Exited(pid, code)) => {
                debug!(pid = pid.as_raw(), code, "worker exited");
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                debug!(pid = pid.as_raw(), signal = ?sig, "worker terminated by signal");
            }
            Ok(_) => {}
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!(error = %e, "waitpid failed");
                break;
            }
        }
    }
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_WAKE_FD: AtomicI32 = AtomicI32::new(-1);

pub(crate) fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

// Signal state is process-global; tests that touch it take this lock.
#[cfg(test)]
pub(crate) static SIGNAL_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub(crate) fn simulate_interrupt() {
    on_signal(libc::SIGTERM);
}

#[cfg(test)]
pub(crate) fn clear_interrupt() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

extern "C" fn on_signal(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
    let fd = SIGNAL_WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [1u8];
        unsafe { libc::write(fd, byte.as_ptr().cast(), 1) };
    }
}

/// Disconnect the signal handler from the wake pipe. Must run before the
/// pipe's descriptors are closed, or a late signal would write into a
/// closed (or reused) fd.
pub(crate) fn detach_signal_wake() {
    SIGNAL_WAKE_FD.store(-1, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers. Workers pass their shutdown wake so
/// the reactor leaves its wait; the master passes `None` and relies on
/// EINTR from `waitpid`. No SA_RESTART, so blocking syscalls wake up.
pub(crate) fn install_signal_handlers(wake: Option<&WakeSignal>) -> io::Result<()> {
    SIGNAL_WAKE_FD.store(wake.map(|w| w.write_fd()).unwrap_or(-1), Ordering::SeqCst);

    let action = signal::SigAction::new(
        SigHandler::Handler(on_signal),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    unsafe {
        signal::sigaction(Signal::SIGINT, &action).map_err(io::Error::from)?;
        signal::sigaction(Signal::SIGTERM, &action).map_err(io::Error::from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_count_is_unchanged() {
        assert_eq!(resolve_workers(Some(1)), 1);
        assert_eq!(resolve_workers(Some(7)), 7);
    }

    #[test]
    fn test_zero_and_unset_mean_all_cores() {
        let cores = logical_cores();
        assert_eq!(resolve_workers(Some(0)), cores);
        assert_eq!(resolve_workers(None), cores);
    }

    #[test]
    fn test_negative_reserves_cores_clamped_to_one() {
        let cores = logical_cores() as i32;
        assert_eq!(resolve_workers(Some(-1)), (cores - 1).max(1) as usize);
        assert_eq!(resolve_workers(Some(-1_000_000)), 1);
    }

    #[test]
    fn test_reseed_produces_usable_rng() {
        reseed_rng();
        // Just exercise the reseeded generator.
        let a = fastrand::u64(..);
        let b = fastrand::u64(..);
        let _ = (a, b);
    }

    #[test]
    fn test_detached_signal_wake_is_not_written() {
        let _guard = SIGNAL_TEST_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let wake = WakeSignal::new().unwrap();
        SIGNAL_WAKE_FD.store(wake.write_fd(), Ordering::SeqCst);
        on_signal(libc::SIGTERM);
        assert!(wake.is_set());

        // After detaching, a late signal must not touch the pipe.
        detach_signal_wake();
        wake.clear();
        on_signal(libc::SIGTERM);
        assert!(!wake.is_set());
    }

    #[test]
    fn test_fallback_seed_mixes_pid_and_time() {
        let a = fallback_seed();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = fallback_seed();
        assert_ne!(a, b);
    }
}
