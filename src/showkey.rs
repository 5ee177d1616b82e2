//! `--showkey` diagnostic
//!
//! Echoes what the terminal sends for each key press: the bytes themselves
//! (control characters in caret notation) and one line per byte with its
//! decimal, octal and hex value.

use std::io::{self, Write};

use anyhow::Context;
use nix::unistd::read;
use tracing::info;

use crate::core::termmode::{CaptureOptions, ModeRestore, TerminalModes, TerminalStreams};

const BANNER: &str = "\nPress any keys -- Ctrl-D exits\n\n";

/// End of transmission (Ctrl-D)
const EOT: u8 = 4;

/// Caret letter for a control byte: `^@` through `^_`, and `^?` for DEL
pub fn decode_ctrl_char(byte: u8) -> Option<char> {
    const CTRL_LETTERS: &[u8; 32] = b"@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_";
    match byte {
        0..=31 => Some(CTRL_LETTERS[byte as usize] as char),
        127 => Some('?'),
        _ => None,
    }
}

/// Render one chunk the way `--showkey` prints it
pub fn render_chunk(chunk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(chunk.len() * 16);
    for &byte in chunk {
        match decode_ctrl_char(byte) {
            Some(letter) => {
                out.push(b'^');
                out.push(letter as u8);
            }
            None => out.push(byte),
        }
    }
    for &byte in chunk {
        out.extend_from_slice(format!("\t{:3} {:04o} 0x{:02x}\n", byte, byte, byte).as_bytes());
    }
    out
}

/// Run the diagnostic until Ctrl-D or end of input. Only stdin goes raw.
pub fn run(allow_non_ttys: bool) -> anyhow::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(BANNER.as_bytes())?;
    stdout.flush()?;

    let streams = TerminalStreams::stdio();
    let modes = TerminalModes::capture(
        streams,
        CaptureOptions {
            allow_non_ttys,
            ..CaptureOptions::default()
        },
    )?;
    info!("showkey started");

    let mut buf = [0u8; 128];
    let result = loop {
        let len = match read(streams.input, &mut buf) {
            Ok(0) | Err(_) => break Ok(()),
            Ok(n) => n,
        };
        let chunk = &buf[..len];
        if let Err(e) = stdout
            .write_all(&render_chunk(chunk))
            .and_then(|_| stdout.flush())
        {
            break Err(e);
        }
        if chunk[0] == EOT {
            break Ok(());
        }
    };

    modes.restore()?;
    result.context("writing key dump")
}
