//! Native pseudo-console session backend
//!
//! Implements [`PtySession`] on top of `portable-pty`, which uses the host's
//! own pseudo-terminal (a Unix PTY, or ConPTY on Windows). Like
//! `CreateProcess`, `spawn` receives one command-line string; it is split
//! back into arguments with the native rule before the child is started.

use std::ffi::OsString;
use std::io::{self, Cursor, Read};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard};

use nix::errno::Errno;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize, SlavePty};
use tracing::{debug, warn};

use super::cmdline::{split, WideString};
use super::resize::TerminalSize;
use super::session::{
    ChildProcess, MouseMode, PtySession, SessionConfig, SessionEndpoints, SessionEnvironment,
    SessionError, SessionFlags, SpawnError,
};
use super::wakeup::{Wake, WakeupSignal};

/// Turns on button, drag and SGR mouse reporting
const MOUSE_ENABLE: &[u8] = b"\x1b[?1000h\x1b[?1002h\x1b[?1006h";
const MOUSE_DISABLE: &[u8] = b"\x1b[?1006l\x1b[?1002l\x1b[?1000l";

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

fn lock_child(child: &SharedChild) -> MutexGuard<'_, Box<dyn Child + Send + Sync>> {
    child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Session backed by the host pseudo-terminal
pub struct NativePtySession {
    master: Box<dyn MasterPty + Send>,
    slave: Option<Box<dyn SlavePty + Send>>,
    child: Option<SharedChild>,
    /// Ends the output endpoint on `free`, whoever else holds the PTY
    stop: Arc<WakeupSignal>,
    environment: SessionEnvironment,
    mouse_mode: MouseMode,
    endpoints_taken: bool,
}

impl PtySession for NativePtySession {
    type Child = NativeChild;

    fn open(config: &SessionConfig) -> Result<Self, SessionError> {
        if config.flags.contains(SessionFlags::CONERR) {
            return Err(SessionError::ErrorChannelUnsupported);
        }
        if config
            .flags
            .intersects(SessionFlags::PLAIN_OUTPUT | SessionFlags::COLOR_ESCAPES)
        {
            // The native terminal already speaks escape sequences; bytes
            // pass through untouched.
            debug!("output framing flags {:?} have no effect", config.flags);
        }

        let stop = WakeupSignal::new().map_err(|e| SessionError::Backend(e.to_string()))?;
        let pair = native_pty_system()
            .openpty(pty_size(config.initial_size))
            .map_err(|e| SessionError::Backend(format!("{:#}", e)))?;

        debug!(
            "session opened: {}x{}",
            config.initial_size.cols, config.initial_size.rows
        );

        Ok(Self {
            master: pair.master,
            slave: Some(pair.slave),
            child: None,
            stop: Arc::new(stop),
            environment: config.environment.clone(),
            mouse_mode: config.mouse_mode,
            endpoints_taken: false,
        })
    }

    fn take_endpoints(&mut self) -> Result<SessionEndpoints, SessionError> {
        if self.endpoints_taken {
            return Err(SessionError::EndpointsTaken);
        }
        let input = self
            .master
            .take_writer()
            .map_err(|e| SessionError::Backend(format!("{:#}", e)))?;
        let master_fd = self
            .master
            .as_raw_fd()
            .ok_or_else(|| SessionError::Backend("PTY master has no descriptor".to_string()))?;
        // SAFETY: the master stays open for as long as `self` does
        let fd = unsafe { BorrowedFd::borrow_raw(master_fd) }
            .try_clone_to_owned()
            .map_err(|e| SessionError::Backend(e.to_string()))?;
        let reader = SessionOutput {
            fd,
            stop: self.stop.clone(),
        };
        self.endpoints_taken = true;

        let output: Box<dyn Read + Send> = match self.mouse_mode {
            MouseMode::Auto => Box::new(reader),
            MouseMode::Force => Box::new(
                Cursor::new(MOUSE_ENABLE)
                    .chain(reader)
                    .chain(Cursor::new(MOUSE_DISABLE)),
            ),
        };

        Ok(SessionEndpoints {
            input,
            output,
            error: None,
        })
    }

    fn spawn(&mut self, command_line: &WideString) -> Result<NativeChild, SpawnError> {
        let slave = self
            .slave
            .take()
            .ok_or_else(|| SpawnError::Internal("a child was already spawned".to_string()))?;

        let argv: Vec<OsString> = split(&command_line.to_string_lossy())
            .into_iter()
            .map(OsString::from)
            .collect();
        if argv.is_empty() {
            return Err(SpawnError::Internal("empty command line".to_string()));
        }

        let mut cmd = CommandBuilder::from_argv(argv);
        // portable-pty would otherwise start in the home directory
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        for (name, value) in &self.environment.set {
            cmd.env(name, value);
        }
        for name in &self.environment.remove {
            cmd.env_remove(name);
        }

        let child = slave.spawn_command(cmd).map_err(|e| {
            match e.downcast_ref::<io::Error>().and_then(io::Error::raw_os_error) {
                Some(code) => SpawnError::create_process(code),
                None => SpawnError::Internal(format!("{:#}", e)),
            }
        })?;
        // Our copy of the slave must go, or the output never hits EOF.
        drop(slave);

        debug!("child spawned: pid={:?}", child.process_id());
        let child = Arc::new(Mutex::new(child));
        self.child = Some(child.clone());
        Ok(NativeChild { child })
    }

    fn set_size(&mut self, size: TerminalSize) -> Result<(), SessionError> {
        self.master
            .resize(pty_size(size))
            .map_err(|e| SessionError::Backend(format!("{:#}", e)))
    }

    /// Ends the output endpoint, then kills the child. The kill sends
    /// SIGHUP and falls back to SIGKILL if the child is still alive after a
    /// short grace period.
    fn free(mut self) {
        self.stop.set();
        if let Some(child) = self.child.take() {
            if let Err(e) = lock_child(&child).kill() {
                // Usually just means the child is already gone
                debug!("kill on free: {}", e);
            }
        }
        drop(self.master);
        debug!("session freed");
    }
}

/// The process started inside a [`NativePtySession`]
pub struct NativeChild {
    child: SharedChild,
}

impl ChildProcess for NativeChild {
    fn exit_code(&mut self) -> Option<u32> {
        match lock_child(&self.child).wait() {
            Ok(status) => Some(status.exit_code()),
            Err(e) => {
                warn!("could not retrieve child exit status: {}", e);
                None
            }
        }
    }
}

/// Output endpoint: a private duplicate of the PTY master. Reads end
/// when the slave side hangs up (EIO on Linux) or when the session's stop
/// signal is set, even if some other process still holds the slave open.
struct SessionOutput {
    fd: OwnedFd,
    stop: Arc<WakeupSignal>,
}

impl Read for SessionOutput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.stop.wait_or_readable(self.fd.as_fd()) {
                Ok(Wake::Signalled) => return Ok(0),
                Ok(Wake::Readable) => {}
                Err(e) => return Err(e.into()),
            }
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EIO) => return Ok(0),
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}
