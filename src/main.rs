//! ptyadapter - run a program inside a pseudo-console from a POSIX terminal
//!
//! ptyadapter opens a pseudo-console session, starts the requested program
//! in it, puts the local terminal in raw mode and forwards bytes both ways
//! until the session goes away. Window size changes follow the terminal.
//! The adapter exits with the child's exit status.
//!
//! # Quick Start
//!
//! ```text
//! ptyadapter bash              # Run bash in a session
//! ptyadapter --mouse vim f.txt # Force mouse reporting on
//! ptyadapter -- -odd-name      # Program name starting with '-'
//! ptyadapter --showkey         # Dump what the keyboard sends
//! ```
//!
//! # Files
//!
//! - `~/.ptyadapter/config.toml`: optional settings (see `config`)
//! - `~/.ptyadapter/ptyadapter.log`: log output, level from `PTYADAPTER_LOG`

#[cfg(unix)]
mod args;
#[cfg(unix)]
mod config;
#[cfg(unix)]
mod core;
#[cfg(unix)]
mod showkey;

#[cfg(unix)]
use std::env;
#[cfg(unix)]
use std::ffi::OsString;
#[cfg(unix)]
use std::io;
#[cfg(unix)]
use std::sync::{Arc, Mutex};

#[cfg(unix)]
use anyhow::{anyhow, Context};
#[cfg(unix)]
use tracing::{error, info, warn};
#[cfg(unix)]
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[cfg(unix)]
use crate::args::{
    parse_args, print_usage, print_version, ArgsError, Command, LaunchArguments, VERSION,
};
#[cfg(unix)]
use crate::config::Config;
#[cfg(unix)]
use crate::core::event_loop::{EventLoop, Workers};
#[cfg(unix)]
use crate::core::forward::{ForwardingWorker, InputWorker, OutputWorker};
#[cfg(unix)]
use crate::core::launch::{child_exec_target, exec_child, session_environment, LaunchRequest};
#[cfg(unix)]
use crate::core::pty::NativePtySession;
#[cfg(unix)]
use crate::core::resize::{install_resize_handler, TerminalSize};
#[cfg(unix)]
use crate::core::session::{PtySession, SessionConfig, SessionEndpoints};
#[cfg(unix)]
use crate::core::termmode::{CaptureOptions, ModeRestore, TerminalModes, TerminalStreams};
#[cfg(unix)]
use crate::core::wakeup::{install_main_wakeup, WakeupSignal};

/// Environment variable holding an EnvFilter directive for the log file
#[cfg(unix)]
const LOG_ENV: &str = "PTYADAPTER_LOG";

#[cfg(unix)]
fn main() {
    // The child phase must run before anything else touches the process.
    let raw_args: Vec<OsString> = env::args_os().collect();
    if let Some(target) = child_exec_target(&raw_args) {
        exec_child(target);
    }

    let program = raw_args
        .first()
        .map(|a| a.to_string_lossy().into_owned())
        .unwrap_or_else(|| "<program>".to_string());
    let command = match parse_args(
        raw_args
            .iter()
            .skip(1)
            .map(|a| a.to_string_lossy().into_owned()),
    ) {
        Ok(c) => c,
        Err(ArgsError::MissingProgram) => {
            print_usage(&program);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let code = match command {
        Command::Help => {
            print_usage(&program);
            0
        }
        Command::Version => {
            print_version();
            0
        }
        Command::ShowKey { allow_non_ttys } => {
            init_logging(&load_config_quietly().log_level);
            match showkey::run(allow_non_ttys) {
                Ok(()) => 0,
                Err(e) => report(e),
            }
        }
        Command::Run(args) => {
            let config = load_config_quietly();
            init_logging(&config.log_level);
            match run(&args, &config) {
                Ok(code) => code,
                Err(e) => report(e),
            }
        }
    };

    std::process::exit(code as i32);
}

#[cfg(not(unix))]
fn main() {
    eprintln!("ptyadapter currently only supports Unix terminals.");
    std::process::exit(1);
}

/// Print a fatal error and give the adapter's failure status
#[cfg(unix)]
fn report(e: anyhow::Error) -> u32 {
    error!("{}", e);
    eprintln!("{}", e);
    1
}

/// Load the config file; a bad file falls back to the defaults. The
/// warning is logged once the subscriber is up.
#[cfg(unix)]
fn load_config_quietly() -> Config {
    match Config::load() {
        Ok(config) => config,
        Err(e) => {
            let config = Config::default();
            init_logging(&config.log_level);
            warn!("{}; using defaults", e);
            config
        }
    }
}

/// Log to `~/.ptyadapter/ptyadapter.log`. The terminal belongs to the
/// child, so nothing is ever logged to stdout or stderr.
#[cfg(unix)]
fn init_logging(default_level: &str) {
    let Some(dir) = config::data_dir() else {
        return;
    };
    let _ = std::fs::create_dir_all(&dir);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("ptyadapter.log"))
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_new(default_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .finish();
        // Already installed when a bad config file was reported first
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

/// Launch the child and forward until it goes away. Returns the child's
/// exit status.
#[cfg(unix)]
fn run(args: &LaunchArguments, config: &Config) -> anyhow::Result<u32> {
    info!("ptyadapter {} starting", VERSION);

    let wakeup = Arc::new(WakeupSignal::new()?);
    install_main_wakeup(wakeup.clone())?;

    let self_path = env::current_exe().context("Could not determine the adapter's own path")?;
    let environment = session_environment(
        &config.environment.propagate,
        config.environment.clear_term,
        |name| env::var(name).ok(),
    );

    let streams = TerminalStreams::stdio();
    let initial_size = TerminalSize::query_or_default(streams.input);

    let session_config = SessionConfig {
        flags: args.session_flags(),
        mouse_mode: args.mouse_mode(config.mouse),
        initial_size,
        environment,
    };
    let mut session = NativePtySession::open(&session_config)
        .map_err(|e| anyhow!("Error creating session: {}", e))?;
    let endpoints = match session.take_endpoints() {
        Ok(endpoints) => endpoints,
        Err(e) => {
            session.free();
            return Err(anyhow!("Error creating session: {}", e));
        }
    };

    let request = LaunchRequest::new(&self_path, &args.child_argv);
    let child = match request.launch(&mut session) {
        Ok(child) => child,
        Err(e) => {
            session.free();
            return Err(e.into());
        }
    };

    let modes = match prepare_terminal(streams, args) {
        Ok(modes) => modes,
        Err(e) => {
            session.free();
            return Err(e);
        }
    };

    let SessionEndpoints {
        input,
        output,
        error,
    } = endpoints;
    let input_worker = match InputWorker::spawn(io::stdin(), input, wakeup.clone()) {
        Ok(worker) => worker,
        Err(e) => {
            session.free();
            if let Err(restore) = modes.restore() {
                warn!("{}", restore);
            }
            return Err(e.into());
        }
    };
    let output_worker = OutputWorker::spawn("output", output, io::stdout(), wakeup.clone());
    let error_worker = error.map(|source| {
        Box::new(OutputWorker::spawn("error", source, io::stderr(), wakeup.clone()))
            as Box<dyn ForwardingWorker>
    });

    let workers = Workers {
        input: Box::new(input_worker),
        output: Box::new(output_worker),
        error: error_worker,
    };
    let event_loop = EventLoop::new(
        session,
        child,
        workers,
        wakeup,
        initial_size,
        move || TerminalSize::query(streams.input),
        modes,
    );
    Ok(event_loop.run()?)
}

/// Install the resize handler and switch the terminal to raw mode
#[cfg(unix)]
fn prepare_terminal(
    streams: TerminalStreams<'static>,
    args: &LaunchArguments,
) -> anyhow::Result<TerminalModes<'static>> {
    install_resize_handler().map_err(|e| anyhow!("Failed to install resize handler: {}", e))?;
    let modes = TerminalModes::capture(
        streams,
        CaptureOptions {
            allow_non_ttys: args.allow_non_ttys,
            include_output: true,
            include_error: args.conerr,
        },
    )?;
    Ok(modes)
}
