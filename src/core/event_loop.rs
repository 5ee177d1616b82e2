//! Main event loop
//!
//! Runs on the coordinating thread once the child is up and the terminal is
//! in raw mode. The only thing it ever blocks on is the wakeup descriptor;
//! all terminal and session I/O happens in the forwarding workers.
//!
//! ```text
//! Launching -> Running -> Draining -> Terminated
//! ```
//!
//! Completion of any one worker ends `Running`. With a separate error
//! channel that means the error worker finishing first also starts teardown,
//! possibly before the output worker has drained everything.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::forward::ForwardingWorker;
use super::resize::TerminalSize;
use super::session::{ChildProcess, PtySession};
use super::termmode::{ModeRestore, RestoreError};
use super::wakeup::{WakeupError, WakeupSignal};

/// Exit status used when the child's own status cannot be retrieved
pub const FALLBACK_EXIT_CODE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Launching,
    Running,
    Draining,
    Terminated,
}

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("{0}")]
    Wait(#[from] WakeupError),

    #[error("{0}")]
    Restore(#[from] RestoreError),
}

/// The forwarding workers, one per direction
pub struct Workers {
    pub input: Box<dyn ForwardingWorker>,
    pub output: Box<dyn ForwardingWorker>,
    pub error: Option<Box<dyn ForwardingWorker>>,
}

impl Workers {
    fn any_complete(&self) -> bool {
        self.input.is_complete()
            || self.output.is_complete()
            || self.error.as_ref().map_or(false, |w| w.is_complete())
    }

    /// Stop every worker, then drop them, which closes their endpoints
    fn shutdown(mut self) {
        self.input.shutdown();
        self.output.shutdown();
        if let Some(error) = self.error.as_mut() {
            error.shutdown();
        }
        drop(self);
    }
}

pub struct EventLoop<S, Q, R>
where
    S: PtySession,
{
    session: S,
    child: S::Child,
    workers: Workers,
    wakeup: Arc<WakeupSignal>,
    query_size: Q,
    size: TerminalSize,
    modes: R,
    state: LoopState,
}

impl<S, Q, R> EventLoop<S, Q, R>
where
    S: PtySession,
    Q: FnMut() -> Option<TerminalSize>,
    R: ModeRestore,
{
    /// `size` is the size the session was opened with; `query_size` reads
    /// the current one.
    pub fn new(
        session: S,
        child: S::Child,
        workers: Workers,
        wakeup: Arc<WakeupSignal>,
        size: TerminalSize,
        query_size: Q,
        modes: R,
    ) -> Self {
        Self {
            session,
            child,
            workers,
            wakeup,
            query_size,
            size,
            modes,
            state: LoopState::Launching,
        }
    }

    /// Run to completion and return the child's exit status
    pub fn run(mut self) -> Result<u32, LoopError> {
        self.enter(LoopState::Running);
        let waited = self.wait_for_completion();

        self.enter(LoopState::Draining);
        let Self {
            session,
            mut child,
            workers,
            modes,
            ..
        } = self;

        // Freeing the session closes its channels, which is what lets the
        // workers finish.
        session.free();
        workers.shutdown();
        modes.restore()?;
        waited?;

        debug!("state: {:?}", LoopState::Terminated);
        let code = child.exit_code().unwrap_or_else(|| {
            warn!("child exit status unavailable, using {}", FALLBACK_EXIT_CODE);
            FALLBACK_EXIT_CODE
        });
        info!("child exited with status {}", code);
        Ok(code)
    }

    fn enter(&mut self, state: LoopState) {
        debug!("state: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn wait_for_completion(&mut self) -> Result<(), WakeupError> {
        loop {
            self.wakeup.wait()?;
            self.wakeup.reset();

            // Several SIGWINCHs may have arrived; only the latest size matters.
            if let Some(size) = (self.query_size)() {
                if size != self.size {
                    self.size = size;
                    debug!("resize: {}x{}", size.cols, size.rows);
                    if let Err(e) = self.session.set_size(size) {
                        warn!("failed to resize session: {}", e);
                    }
                }
            }

            if self.workers.any_complete() {
                debug!("forwarding worker completed");
                return Ok(());
            }
        }
    }
}
