//! Terminal size tracking
//!
//! SIGWINCH only records that something happened; the main loop re-reads
//! the size and decides whether to propagate it.

use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::debug;

use super::wakeup::main_wakeup;

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Current size of the terminal behind `fd`, if it is one
    pub fn query(fd: BorrowedFd<'_>) -> Option<Self> {
        let mut ws = MaybeUninit::<libc::winsize>::zeroed();
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, ws.as_mut_ptr()) };
        if ret < 0 {
            return None;
        }
        let ws = unsafe { ws.assume_init() };
        Some(Self::new(ws.ws_col, ws.ws_row))
    }

    /// Like [`query`](Self::query), falling back to 80x25
    pub fn query_or_default(fd: BorrowedFd<'_>) -> Self {
        Self::query(fd).unwrap_or_default()
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(80, 25)
    }
}

extern "C" fn terminal_resized(_: libc::c_int) {
    main_wakeup().set();
}

/// Install the SIGWINCH handler. The main wakeup signal must already be
/// installed. Interrupted system calls are restarted.
pub fn install_resize_handler() -> Result<(), Errno> {
    let action = SigAction::new(
        SigHandler::Handler(terminal_resized),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGWINCH, &action) }?;
    debug!("SIGWINCH handler installed");
    Ok(())
}
