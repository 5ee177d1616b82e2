//! Self-pipe wakeup signal
//!
//! A `WakeupSignal` folds signal delivery and worker completion into one
//! pollable descriptor. `set` is async-signal-safe: it touches only an atomic
//! flag and issues a single `write(2)` on a non-blocking pipe.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{read, write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WakeupError {
    #[error("Failed to create wakeup pipe: {0}")]
    Pipe(#[source] Errno),

    #[error("Failed to configure wakeup pipe: {0}")]
    Configure(#[source] Errno),

    #[error("Failed to wait on wakeup descriptor: {0}")]
    Wait(#[source] Errno),

    #[error("Main wakeup signal already installed")]
    AlreadyInstalled,
}

/// Cross-thread, signal-safe notification object
#[derive(Debug)]
pub struct WakeupSignal {
    read_end: OwnedFd,
    write_end: OwnedFd,
    pending: AtomicBool,
}

impl WakeupSignal {
    pub fn new() -> Result<Self, WakeupError> {
        let (read_end, write_end) = nix::unistd::pipe().map_err(WakeupError::Pipe)?;
        for fd in [&read_end, &write_end] {
            set_nonblocking_cloexec(fd).map_err(WakeupError::Configure)?;
        }
        Ok(Self {
            read_end,
            write_end,
            pending: AtomicBool::new(false),
        })
    }

    /// Mark the signal as pending. Safe to call from a signal handler.
    pub fn set(&self) {
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        // A full pipe (EAGAIN) already guarantees a wakeup. errno is put
        // back for whatever code the signal interrupted.
        let saved = Errno::last_raw();
        let _ = write(&self.write_end, &[1u8]);
        Errno::set_raw(saved);
    }

    /// Clear the pending state. The pipe is drained before the flag drops so
    /// that a `set` racing with `reset` always leaves either a byte in the
    /// pipe or an observable state change for the caller.
    pub fn reset(&self) {
        let mut buf = [0u8; 64];
        loop {
            match read(&self.read_end, &mut buf) {
                Ok(0) => break,
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
        self.pending.store(false, Ordering::Release);
    }

    /// Pollable read end of the pipe
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.read_end.as_fd()
    }

    /// Block until `set` has been called at least once since the last
    /// `reset`. Interrupted waits are retried.
    pub fn wait(&self) -> Result<(), WakeupError> {
        loop {
            let mut fds = [PollFd::new(self.fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(WakeupError::Wait(e)),
            }
        }
    }

    /// Block until `fd` is readable (or hung up) or this signal is set.
    /// A set signal wins over a readable `fd`.
    pub fn wait_or_readable(&self, fd: BorrowedFd<'_>) -> Result<Wake, Errno> {
        loop {
            let mut fds = [
                PollFd::new(fd, PollFlags::POLLIN),
                PollFd::new(self.fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
            let ready = |fd: &PollFd| fd.revents().map_or(false, |r| !r.is_empty());
            if ready(&fds[1]) {
                return Ok(Wake::Signalled);
            }
            if ready(&fds[0]) {
                return Ok(Wake::Readable);
            }
        }
    }
}

/// Outcome of [`WakeupSignal::wait_or_readable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Signalled,
    Readable,
}

fn set_nonblocking_cloexec(fd: &OwnedFd) -> Result<(), Errno> {
    let flags = OFlag::from_bits_retain(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    let fd_flags = FdFlag::from_bits_retain(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(fd_flags | FdFlag::FD_CLOEXEC))?;
    Ok(())
}

static MAIN_WAKEUP: OnceLock<Arc<WakeupSignal>> = OnceLock::new();

/// Install the process-wide wakeup signal. Must happen before any signal
/// handler that uses [`main_wakeup`] is registered, and only once.
pub fn install_main_wakeup(signal: Arc<WakeupSignal>) -> Result<(), WakeupError> {
    MAIN_WAKEUP
        .set(signal)
        .map_err(|_| WakeupError::AlreadyInstalled)
}

/// Accessor used from signal context. Aborts if called before
/// [`install_main_wakeup`].
pub fn main_wakeup() -> &'static WakeupSignal {
    match MAIN_WAKEUP.get() {
        Some(signal) => signal,
        None => {
            const MSG: &[u8] = b"Internal error: main wakeup signal is not installed\r\n";
            let _ = write(std::io::stderr(), MSG);
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn is_readable(signal: &WakeupSignal) -> bool {
        let mut fds = [PollFd::new(signal.fd(), PollFlags::POLLIN)];
        poll(&mut fds, PollTimeout::ZERO).unwrap() > 0
    }

    #[test]
    fn test_set_makes_fd_readable() {
        let signal = WakeupSignal::new().unwrap();
        assert!(!is_readable(&signal));

        signal.set();
        assert!(is_readable(&signal));

        signal.reset();
        assert!(!is_readable(&signal));
    }

    #[test]
    fn test_set_is_idempotent() {
        let signal = WakeupSignal::new().unwrap();
        for _ in 0..10_000 {
            signal.set();
        }
        assert!(is_readable(&signal));

        // A single reset clears everything
        signal.reset();
        assert!(!is_readable(&signal));
    }

    #[test]
    fn test_set_after_reset_wakes_again() {
        let signal = WakeupSignal::new().unwrap();
        signal.set();
        signal.reset();
        signal.set();
        assert!(is_readable(&signal));
    }

    #[test]
    fn test_wait_returns_when_set_from_other_thread() {
        let signal = Arc::new(WakeupSignal::new().unwrap());
        let remote = signal.clone();
        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.set();
        });

        signal.wait().unwrap();
        setter.join().unwrap();
        signal.reset();
        assert!(!is_readable(&signal));
    }

    #[test]
    fn test_set_before_wait_returns_immediately() {
        let signal = WakeupSignal::new().unwrap();
        signal.set();
        signal.wait().unwrap();
    }

    #[test]
    fn test_set_preserves_errno() {
        let signal = WakeupSignal::new().unwrap();
        Errno::set_raw(libc::EBADF);
        signal.set();
        assert_eq!(Errno::last_raw(), libc::EBADF);
    }

    #[test]
    fn test_wait_or_readable() {
        let signal = WakeupSignal::new().unwrap();
        let (read_end, write_end) = nix::unistd::pipe().unwrap();

        write(&write_end, b"x").unwrap();
        assert_eq!(
            signal.wait_or_readable(read_end.as_fd()).unwrap(),
            Wake::Readable
        );

        // Signal wins even with data waiting
        signal.set();
        assert_eq!(
            signal.wait_or_readable(read_end.as_fd()).unwrap(),
            Wake::Signalled
        );
    }
}
