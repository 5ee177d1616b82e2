//! Child launch protocol
//!
//! The session does not start the user's program directly. It starts this
//! same binary as
//!
//! ```text
//! "<self path>" --child-exec <escaped user command line>
//! ```
//!
//! and that second instance, seeing `--child-exec` as its very first
//! argument, replaces itself with the user's program before doing anything
//! else. The image replacement therefore happens inside the session's
//! process context instead of the adapter's. The sentinel's spelling and
//! position are a stable contract with the session side.

use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use thiserror::Error;
use tracing::{error, info};

use super::cmdline::{encode, WideString};
use super::session::{PtySession, SessionEnvironment, SpawnError};

/// First argument that selects the child image-replace phase
pub const CHILD_EXEC_FLAG: &str = "--child-exec";

/// Diagnostic variables copied into the session environment when set
pub const DIAGNOSTIC_VARS: [&str; 2] = ["PTYADAPTER_DEBUG", "PTYADAPTER_SHOW_CONSOLE"];

/// Terminal-type variable that does not describe the session's console
pub const TERMINAL_TYPE_VAR: &str = "TERM";

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Could not start '{command_line}': {reason}")]
    Spawn {
        command_line: String,
        reason: SpawnError,
    },
}

/// Parent-side launch request
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    self_path: &'a Path,
    argv: &'a [String],
}

impl<'a> LaunchRequest<'a> {
    pub fn new(self_path: &'a Path, argv: &'a [String]) -> Self {
        Self { self_path, argv }
    }

    /// The user's command, escaped
    pub fn child_command_line(&self) -> String {
        encode(self.argv)
    }

    /// What the session is asked to run
    pub fn session_command_line(&self) -> String {
        format!(
            "\"{}\" {} {}",
            self.self_path.to_string_lossy(),
            CHILD_EXEC_FLAG,
            self.child_command_line()
        )
    }

    /// Spawn the request in `session`. No retry: a failed spawn is final.
    pub fn launch<S: PtySession>(&self, session: &mut S) -> Result<S::Child, LaunchError> {
        let command_line = self.session_command_line();
        info!("spawning: {}", command_line);

        session
            .spawn(&WideString::from(command_line.as_str()))
            .map_err(|reason| {
                match &reason {
                    SpawnError::CreateProcess { code, .. } => {
                        error!(code, "process creation failed")
                    }
                    SpawnError::Internal(message) => error!("session spawn failed: {}", message),
                }
                LaunchError::Spawn {
                    command_line: self.child_command_line(),
                    reason,
                }
            })
    }
}

/// If `args` (including argv[0]) is a child image-replace request, the
/// target program and its arguments.
pub fn child_exec_target(args: &[OsString]) -> Option<&[OsString]> {
    match args {
        [_, flag, target @ ..] if flag == CHILD_EXEC_FLAG && !target.is_empty() => Some(target),
        _ => None,
    }
}

/// Child-side phase: replace this process with `target`. Only returns by
/// exiting with status 1 after reporting the exec failure.
pub fn exec_child(target: &[OsString]) -> ! {
    let err = Command::new(&target[0]).args(&target[1..]).exec();
    eprintln!("error: exec failed: {}", err);
    std::process::exit(1);
}

/// Environment changes for the session: the diagnostic variables (plus any
/// `extra` names) when set and non-empty, and removal of the terminal type.
pub fn session_environment<F>(extra: &[String], clear_term: bool, lookup: F) -> SessionEnvironment
where
    F: Fn(&str) -> Option<String>,
{
    let names = DIAGNOSTIC_VARS
        .iter()
        .map(|s| s.to_string())
        .chain(extra.iter().cloned());

    let mut set: Vec<(String, String)> = Vec::new();
    for name in names {
        if set.iter().any(|(existing, _)| *existing == name) {
            continue;
        }
        if let Some(value) = lookup(&name).filter(|v| !v.is_empty()) {
            set.push((name, value));
        }
    }

    let remove = if clear_term {
        vec![TERMINAL_TYPE_VAR.to_string()]
    } else {
        Vec::new()
    };

    SessionEnvironment { set, remove }
}
