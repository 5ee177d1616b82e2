//! Pseudo-console session API
//!
//! The adapter talks to the session through [`PtySession`]: open it, take
//! its data endpoints, spawn one command line in it, resize it, and free it.
//! Everything behind that trait is the session's business.

use std::io::{Read, Write};

use bitflags::bitflags;
use thiserror::Error;

use super::cmdline::{format_os_error, WideString};
use super::resize::TerminalSize;

bitflags! {
    /// Options passed through to the session when it is opened
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SessionFlags: u32 {
        /// Expose a separate error channel
        const CONERR = 0x1;
        /// Plain text output, no escape sequences
        const PLAIN_OUTPUT = 0x2;
        /// Color escapes even in plain output mode
        const COLOR_ESCAPES = 0x4;
    }
}

/// Mouse input handling requested from the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MouseMode {
    /// Report mouse events only when the child asks for them
    #[default]
    Auto,
    /// Always turn terminal mouse reporting on
    Force,
}

/// Environment changes applied to the spawned child
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionEnvironment {
    pub set: Vec<(String, String)>,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub flags: SessionFlags,
    pub mouse_mode: MouseMode,
    pub initial_size: TerminalSize,
    pub environment: SessionEnvironment,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{0}")]
    Backend(String),

    #[error("a separate error channel is not supported by this session backend")]
    ErrorChannelUnsupported,

    #[error("session endpoints were already taken")]
    EndpointsTaken,
}

/// Why a spawn request failed
#[derive(Error, Debug)]
pub enum SpawnError {
    /// The OS could not create the process
    #[error("{message}")]
    CreateProcess { code: i32, message: String },

    /// The session itself failed
    #[error("internal error: {0}")]
    Internal(String),
}

impl SpawnError {
    pub fn create_process(code: i32) -> Self {
        SpawnError::CreateProcess {
            code,
            message: format_os_error(code),
        }
    }
}

/// The session's data channels, from the adapter's point of view
pub struct SessionEndpoints {
    /// Bytes written here reach the child's input
    pub input: Box<dyn Write + Send>,
    /// Child output
    pub output: Box<dyn Read + Send>,
    /// Child error output, when the session was opened with `CONERR`
    pub error: Option<Box<dyn Read + Send>>,
}

/// Handle to the process spawned inside a session
pub trait ChildProcess {
    /// Exit status, waiting for the process if needed. `None` if it cannot
    /// be retrieved.
    fn exit_code(&mut self) -> Option<u32>;
}

/// An open pseudo-console session
pub trait PtySession {
    type Child: ChildProcess;

    fn open(config: &SessionConfig) -> Result<Self, SessionError>
    where
        Self: Sized;

    /// Hand out the data endpoints. Only succeeds once.
    fn take_endpoints(&mut self) -> Result<SessionEndpoints, SessionError>;

    /// Start `command_line` inside the session
    fn spawn(&mut self, command_line: &WideString) -> Result<Self::Child, SpawnError>;

    fn set_size(&mut self, size: TerminalSize) -> Result<(), SessionError>;

    /// Tear the session down. This is what makes the session's data
    /// channels reach end-of-stream.
    fn free(self);
}
