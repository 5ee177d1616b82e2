//! Raw-mode management for the local terminal streams
//!
//! Captures the attributes of stdin/stdout/stderr, switches them to raw
//! mode, and puts them back on shutdown.

use std::fmt;
use std::os::fd::BorrowedFd;

use nix::errno::Errno;
use nix::sys::termios::{
    tcgetattr, tcsetattr, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices, Termios,
};
use nix::unistd::isatty;
use thiserror::Error;
use tracing::{debug, warn};

/// Logical role of a local terminal stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    Input,
    Output,
    Error,
}

impl StreamRole {
    pub fn name(self) -> &'static str {
        match self {
            StreamRole::Input => "stdin",
            StreamRole::Output => "stdout",
            StreamRole::Error => "stderr",
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug)]
pub enum TermModeError {
    #[error("{0} is not a tty")]
    NotATty(StreamRole),

    #[error("tcgetattr failed on {role}: {source}")]
    GetAttr {
        role: StreamRole,
        #[source]
        source: Errno,
    },

    #[error("tcsetattr failed on {role}: {source}")]
    SetAttr {
        role: StreamRole,
        #[source]
        source: Errno,
    },
}

/// Every stream that could not be restored. Each entry is its own failure.
#[derive(Debug)]
pub struct RestoreError {
    pub failures: Vec<(StreamRole, Errno)>,
}

impl fmt::Display for RestoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (role, errno)) in self.failures.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "error restoring terminal mode on {}: {}", role, errno)?;
        }
        Ok(())
    }
}

impl std::error::Error for RestoreError {}

/// Descriptors for the three local streams
#[derive(Debug, Clone, Copy)]
pub struct TerminalStreams<'fd> {
    pub input: BorrowedFd<'fd>,
    pub output: BorrowedFd<'fd>,
    pub error: BorrowedFd<'fd>,
}

impl TerminalStreams<'static> {
    /// The process's standard streams
    pub fn stdio() -> Self {
        // The standard descriptors stay open for the life of the process.
        unsafe {
            Self {
                input: BorrowedFd::borrow_raw(libc::STDIN_FILENO),
                output: BorrowedFd::borrow_raw(libc::STDOUT_FILENO),
                error: BorrowedFd::borrow_raw(libc::STDERR_FILENO),
            }
        }
    }
}

/// Which streams to put in raw mode
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureOptions {
    /// Skip streams that are not terminals instead of failing
    pub allow_non_ttys: bool,
    pub include_output: bool,
    pub include_error: bool,
}

#[derive(Debug, Clone)]
struct SavedMode<'fd> {
    fd: BorrowedFd<'fd>,
    termios: Termios,
}

/// Attributes captured before entering raw mode. A stream is only restored
/// if it was captured.
#[derive(Debug, Clone)]
pub struct TerminalModes<'fd> {
    input: Option<SavedMode<'fd>>,
    output: Option<SavedMode<'fd>>,
    error: Option<SavedMode<'fd>>,
}

/// Something that can put the terminal back the way it was
pub trait ModeRestore {
    fn restore(&self) -> Result<(), RestoreError>;
}

impl<'fd> TerminalModes<'fd> {
    /// Save the current attributes of the requested streams and switch them
    /// to raw mode. Raw mode is all-or-nothing: if any stream fails, the
    /// streams already switched are put back before the error is returned.
    pub fn capture(
        streams: TerminalStreams<'fd>,
        options: CaptureOptions,
    ) -> Result<Self, TermModeError> {
        let modes = Self {
            input: save(StreamRole::Input, streams.input, true, options.allow_non_ttys)?,
            output: save(
                StreamRole::Output,
                streams.output,
                options.include_output,
                options.allow_non_ttys,
            )?,
            error: save(
                StreamRole::Error,
                streams.error,
                options.include_error,
                options.allow_non_ttys,
            )?,
        };

        let mut applied: Vec<(StreamRole, &SavedMode<'fd>)> = Vec::new();
        for (role, saved) in modes.entries() {
            if let Err(e) = make_raw(role, saved.fd) {
                roll_back(&applied);
                return Err(e);
            }
            applied.push((role, saved));
        }

        debug!(
            "raw mode: stdin={} stdout={} stderr={}",
            modes.is_captured(StreamRole::Input),
            modes.is_captured(StreamRole::Output),
            modes.is_captured(StreamRole::Error)
        );
        Ok(modes)
    }

    /// Whether a stream was captured
    pub fn is_captured(&self, role: StreamRole) -> bool {
        match role {
            StreamRole::Input => self.input.is_some(),
            StreamRole::Output => self.output.is_some(),
            StreamRole::Error => self.error.is_some(),
        }
    }

    fn entries(&self) -> impl Iterator<Item = (StreamRole, &SavedMode<'fd>)> {
        [
            (StreamRole::Input, self.input.as_ref()),
            (StreamRole::Output, self.output.as_ref()),
            (StreamRole::Error, self.error.as_ref()),
        ]
        .into_iter()
        .filter_map(|(role, saved)| saved.map(|s| (role, s)))
    }
}

impl ModeRestore for TerminalModes<'_> {
    /// Re-apply the saved attributes to every captured stream. All streams
    /// are attempted even when an earlier one fails.
    fn restore(&self) -> Result<(), RestoreError> {
        let failures: Vec<(StreamRole, Errno)> = self
            .entries()
            .filter_map(|(role, saved)| {
                tcsetattr(saved.fd, SetArg::TCSAFLUSH, &saved.termios)
                    .err()
                    .map(|e| (role, e))
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RestoreError { failures })
        }
    }
}

fn save<'fd>(
    role: StreamRole,
    fd: BorrowedFd<'fd>,
    requested: bool,
    allow_non_ttys: bool,
) -> Result<Option<SavedMode<'fd>>, TermModeError> {
    if !requested {
        return Ok(None);
    }
    if !isatty(fd).unwrap_or(false) {
        if allow_non_ttys {
            debug!("{} is not a tty, leaving it alone", role);
            return Ok(None);
        }
        return Err(TermModeError::NotATty(role));
    }
    let termios = tcgetattr(fd).map_err(|source| TermModeError::GetAttr { role, source })?;
    Ok(Some(SavedMode { fd, termios }))
}

/// Undo a partial switch to raw mode, newest first. Failures are logged
/// and do not stop the remaining streams.
fn roll_back(applied: &[(StreamRole, &SavedMode<'_>)]) {
    for (role, saved) in applied.iter().rev() {
        if let Err(e) = tcsetattr(saved.fd, SetArg::TCSAFLUSH, &saved.termios) {
            warn!("failed to roll back raw mode on {}: {}", role, e);
        }
    }
}

fn make_raw(role: StreamRole, fd: BorrowedFd<'_>) -> Result<(), TermModeError> {
    // Re-read: stdin/stdout/stderr usually share one device.
    let mut raw = tcgetattr(fd).map_err(|source| TermModeError::GetAttr { role, source })?;

    raw.control_flags &= !(ControlFlags::CSIZE | ControlFlags::PARENB);
    raw.control_flags |= ControlFlags::CS8;

    match role {
        StreamRole::Input => {
            raw.local_flags &=
                !(LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::IEXTEN | LocalFlags::ISIG);
            raw.input_flags &= !(InputFlags::BRKINT
                | InputFlags::ICRNL
                | InputFlags::INPCK
                | InputFlags::ISTRIP
                | InputFlags::IXON);
            raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
            raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        }
        StreamRole::Output | StreamRole::Error => {
            raw.output_flags &= !OutputFlags::OPOST;
        }
    }

    tcsetattr(fd, SetArg::TCSAFLUSH, &raw).map_err(|source| TermModeError::SetAttr { role, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::{openpty, OpenptyResult, Winsize};
    use std::os::fd::{AsFd, OwnedFd};

    fn pty() -> OpenptyResult {
        openpty(None::<&Winsize>, None::<&Termios>).unwrap()
    }

    fn streams(fd: &OwnedFd) -> TerminalStreams<'_> {
        TerminalStreams {
            input: fd.as_fd(),
            output: fd.as_fd(),
            error: fd.as_fd(),
        }
    }

    fn flags(fd: &OwnedFd) -> (LocalFlags, InputFlags, OutputFlags, ControlFlags) {
        let t = tcgetattr(fd.as_fd()).unwrap();
        (t.local_flags, t.input_flags, t.output_flags, t.control_flags)
    }

    #[test]
    fn test_capture_enters_raw_mode() {
        let pair = pty();
        let options = CaptureOptions {
            allow_non_ttys: false,
            include_output: true,
            include_error: false,
        };
        let modes = TerminalModes::capture(streams(&pair.slave), options).unwrap();
        assert!(modes.is_captured(StreamRole::Input));
        assert!(modes.is_captured(StreamRole::Output));
        assert!(!modes.is_captured(StreamRole::Error));

        let t = tcgetattr(pair.slave.as_fd()).unwrap();
        assert!(!t.local_flags.contains(LocalFlags::ECHO));
        assert!(!t.local_flags.contains(LocalFlags::ICANON));
        assert!(!t.local_flags.contains(LocalFlags::ISIG));
        assert!(!t.input_flags.contains(InputFlags::ICRNL));
        assert!(!t.input_flags.contains(InputFlags::IXON));
        assert!(!t.output_flags.contains(OutputFlags::OPOST));
        assert!(t.control_flags.contains(ControlFlags::CS8));
        assert_eq!(t.control_chars[SpecialCharacterIndices::VMIN as usize], 1);
        assert_eq!(t.control_chars[SpecialCharacterIndices::VTIME as usize], 0);

        modes.restore().unwrap();
    }

    #[test]
    fn test_restore_returns_original_attributes() {
        let pair = pty();
        let before = flags(&pair.slave);

        let options = CaptureOptions {
            allow_non_ttys: false,
            include_output: true,
            include_error: true,
        };
        let modes = TerminalModes::capture(streams(&pair.slave), options).unwrap();
        assert_ne!(flags(&pair.slave), before);

        modes.restore().unwrap();
        assert_eq!(flags(&pair.slave), before);
    }

    #[test]
    fn test_restore_twice_is_pure_reapplication() {
        let pair = pty();
        let modes =
            TerminalModes::capture(streams(&pair.slave), CaptureOptions::default()).unwrap();

        modes.restore().unwrap();
        let after_first = flags(&pair.slave);
        modes.restore().unwrap();
        assert_eq!(flags(&pair.slave), after_first);
    }

    #[test]
    fn test_input_only_leaves_output_processing() {
        let pair = pty();
        let modes =
            TerminalModes::capture(streams(&pair.slave), CaptureOptions::default()).unwrap();

        let t = tcgetattr(pair.slave.as_fd()).unwrap();
        assert!(t.output_flags.contains(OutputFlags::OPOST));
        modes.restore().unwrap();
    }

    #[test]
    fn test_non_tty_is_fatal_unless_allowed() {
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        let s = TerminalStreams {
            input: read_end.as_fd(),
            output: read_end.as_fd(),
            error: read_end.as_fd(),
        };

        let err = TerminalModes::capture(s, CaptureOptions::default()).unwrap_err();
        assert!(matches!(err, TermModeError::NotATty(StreamRole::Input)));
        assert_eq!(err.to_string(), "stdin is not a tty");

        let options = CaptureOptions {
            allow_non_ttys: true,
            include_output: true,
            include_error: true,
        };
        let modes = TerminalModes::capture(s, options).unwrap();
        assert!(!modes.is_captured(StreamRole::Input));
        assert!(!modes.is_captured(StreamRole::Output));
        modes.restore().unwrap();
    }

    #[test]
    fn test_non_tty_output_with_tty_input() {
        let pair = pty();
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        let s = TerminalStreams {
            input: pair.slave.as_fd(),
            output: read_end.as_fd(),
            error: read_end.as_fd(),
        };
        let before = flags(&pair.slave);

        let options = CaptureOptions {
            allow_non_ttys: false,
            include_output: true,
            include_error: false,
        };
        let err = TerminalModes::capture(s, options).unwrap_err();
        assert_eq!(err.to_string(), "stdout is not a tty");
        // Nothing was switched to raw mode
        assert_eq!(flags(&pair.slave), before);
    }

    #[test]
    fn test_restore_error_lists_every_failure() {
        let err = RestoreError {
            failures: vec![
                (StreamRole::Input, Errno::EIO),
                (StreamRole::Output, Errno::EBADF),
            ],
        };
        let text = err.to_string();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("stdin"));
        assert!(text.contains("stdout"));
    }

    #[test]
    fn test_roll_back_continues_past_failed_stream() {
        let pair = pty();
        let before = tcgetattr(pair.slave.as_fd()).unwrap();
        make_raw(StreamRole::Input, pair.slave.as_fd()).unwrap();
        assert_ne!(flags(&pair.slave).0, before.local_flags);

        // The pipe is rolled back first and fails
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        let tty = SavedMode {
            fd: pair.slave.as_fd(),
            termios: before.clone(),
        };
        let not_tty = SavedMode {
            fd: read_end.as_fd(),
            termios: before.clone(),
        };
        roll_back(&[(StreamRole::Input, &tty), (StreamRole::Output, &not_tty)]);

        assert_eq!(flags(&pair.slave).0, before.local_flags);
    }
}
