//! Command-line parsing
//!
//! Adapter options come first. The first argument that does not start with
//! `-` (or everything after `--`) is the child program, and every argument
//! from there on belongs to the child untouched.

use thiserror::Error;

use crate::core::session::{MouseMode, SessionFlags};

/// Version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ArgsError {
    #[error("unrecognized option: '{0}'")]
    UnrecognizedOption(String),

    #[error("no program given")]
    MissingProgram,
}

/// Parsed launch request. Immutable after parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchArguments {
    /// Child program and its arguments
    pub child_argv: Vec<String>,
    /// Force terminal mouse reporting on
    pub mouse_input: bool,
    /// Test-only: tolerate non-tty standard streams
    pub allow_non_ttys: bool,
    /// Test-only: request a separate error channel
    pub conerr: bool,
    /// Test-only: plain output framing
    pub plain_output: bool,
    /// Test-only: color escapes in plain output
    pub color_escapes: bool,
}

impl LaunchArguments {
    pub fn session_flags(&self) -> SessionFlags {
        let mut flags = SessionFlags::empty();
        flags.set(SessionFlags::CONERR, self.conerr);
        flags.set(SessionFlags::PLAIN_OUTPUT, self.plain_output);
        flags.set(SessionFlags::COLOR_ESCAPES, self.color_escapes);
        flags
    }

    /// `force_from_config` is the config file's `mouse` setting
    pub fn mouse_mode(&self, force_from_config: bool) -> MouseMode {
        if self.mouse_input || force_from_config {
            MouseMode::Force
        } else {
            MouseMode::Auto
        }
    }
}

/// What the invocation asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Version,
    ShowKey { allow_non_ttys: bool },
    Run(LaunchArguments),
}

/// Parse the arguments after the program name
pub fn parse_args<I>(args: I) -> Result<Command, ArgsError>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut out = LaunchArguments::default();
    let mut show_key = false;

    while let Some(arg) = args.next() {
        if !arg.starts_with('-') {
            out.child_argv.push(arg);
            break;
        }
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "--version" => return Ok(Command::Version),
            "--mouse" => out.mouse_input = true,
            "--showkey" => show_key = true,
            "-Xallow-non-tty" => out.allow_non_ttys = true,
            "-Xconerr" => out.conerr = true,
            "-Xplain" => out.plain_output = true,
            "-Xcolor" => out.color_escapes = true,
            "--" => break,
            _ => return Err(ArgsError::UnrecognizedOption(arg)),
        }
    }
    out.child_argv.extend(args);

    // --showkey wins over any child command
    if show_key {
        return Ok(Command::ShowKey {
            allow_non_ttys: out.allow_non_ttys,
        });
    }
    if out.child_argv.is_empty() {
        return Err(ArgsError::MissingProgram);
    }
    Ok(Command::Run(out))
}

pub fn print_usage(program: &str) {
    println!("Usage: {} [options] [--] program [args]", program);
    println!();
    println!("Options:");
    println!("  -h, --help  Show this help message");
    println!("  --mouse     Enable terminal mouse input");
    println!("  --showkey   Dump STDIN escape sequences");
    println!("  --version   Show the ptyadapter version number");
}

pub fn print_version() {
    println!("ptyadapter {}", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(items: &[&str]) -> Result<Command, ArgsError> {
        parse_args(items.iter().map(|s| s.to_string()))
    }

    fn run(items: &[&str]) -> LaunchArguments {
        match parse(items) {
            Ok(Command::Run(args)) => args,
            other => panic!("expected a launch, got {:?}", other),
        }
    }

    #[test]
    fn test_first_plain_argument_starts_child_argv() {
        let args = run(&["--mouse", "vim", "--mouse", "-x"]);
        assert!(args.mouse_input);
        assert_eq!(args.child_argv, vec!["vim", "--mouse", "-x"]);
    }

    #[test]
    fn test_double_dash_ends_options() {
        let args = run(&["--", "-weird-program", "--help"]);
        assert_eq!(args.child_argv, vec!["-weird-program", "--help"]);
        assert!(!args.mouse_input);
    }

    #[test]
    fn test_help_and_version() {
        assert_eq!(parse(&["-h"]), Ok(Command::Help));
        assert_eq!(parse(&["--help", "bogus"]), Ok(Command::Help));
        assert_eq!(parse(&["--version"]), Ok(Command::Version));
    }

    #[test]
    fn test_unrecognized_option() {
        let err = parse(&["--nope", "ls"]).unwrap_err();
        assert_eq!(err, ArgsError::UnrecognizedOption("--nope".to_string()));
        assert_eq!(err.to_string(), "unrecognized option: '--nope'");

        assert_eq!(
            parse(&["-"]),
            Err(ArgsError::UnrecognizedOption("-".to_string()))
        );
    }

    #[test]
    fn test_missing_program() {
        assert_eq!(parse(&[]), Err(ArgsError::MissingProgram));
        assert_eq!(parse(&["--mouse", "--"]), Err(ArgsError::MissingProgram));
    }

    #[test]
    fn test_showkey_ignores_child_command() {
        assert_eq!(
            parse(&["--showkey"]),
            Ok(Command::ShowKey {
                allow_non_ttys: false
            })
        );
        assert_eq!(
            parse(&["-Xallow-non-tty", "--showkey", "ls"]),
            Ok(Command::ShowKey {
                allow_non_ttys: true
            })
        );
    }

    #[test]
    fn test_session_flags() {
        let args = run(&["-Xconerr", "-Xplain", "cmd"]);
        assert_eq!(
            args.session_flags(),
            SessionFlags::CONERR | SessionFlags::PLAIN_OUTPUT
        );
        assert!(run(&["cmd"]).session_flags().is_empty());
    }

    #[test]
    fn test_mouse_mode() {
        assert_eq!(run(&["cmd"]).mouse_mode(false), MouseMode::Auto);
        assert_eq!(run(&["cmd"]).mouse_mode(true), MouseMode::Force);
        assert_eq!(run(&["--mouse", "cmd"]).mouse_mode(false), MouseMode::Force);
    }
}
