//! Core adapter components.
//!
//! - **wakeup**: self-pipe signal shared by the SIGWINCH handler and the workers
//! - **termmode**: raw-mode capture and restore for the local terminal
//! - **resize**: terminal size queries and the SIGWINCH handler
//! - **cmdline**: argv <-> command-line string codec, wide strings, OS error text
//! - **session**: the pseudo-console session API
//! - **pty**: session backend on the host pseudo-terminal
//! - **forward**: byte-forwarding worker threads
//! - **launch**: two-phase child launch (`--child-exec`)
//! - **event_loop**: the coordinating loop and teardown
//!
//! # Architecture
//!
//! ```text
//! EventLoop (main thread, blocks only on WakeupSignal)
//! ├── PtySession ── spawn ──> "<self>" --child-exec <program> [args]
//! ├── InputWorker   stdin   ──> session input
//! ├── OutputWorker  session output ──> stdout
//! ├── OutputWorker  session error  ──> stderr (optional)
//! └── TerminalModes (restored last)
//!
//! SIGWINCH ──┐
//! workers ───┴──> WakeupSignal::set()
//! ```

pub mod cmdline;
pub mod event_loop;
pub mod forward;
pub mod launch;
pub mod pty;
pub mod resize;
pub mod session;
pub mod termmode;
pub mod wakeup;
