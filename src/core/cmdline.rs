//! Single-string command lines
//!
//! The session spawns programs from one command-line string, the way
//! `CreateProcess` does. [`encode`] builds that string from an argument
//! vector so that the native splitting rule ([`split`], the
//! `CommandLineToArgvW` convention) gives back the exact same vector.

use std::io;

/// Join `argv` into one escaped command line.
///
/// An argument is quoted when it contains a space or a tab, or is empty.
/// Backslashes are literal unless they precede a quote, in which case they
/// are doubled and the quote is escaped. Inside quotes, a trailing run of
/// backslashes is doubled so the closing quote survives.
pub fn encode<S: AsRef<str>>(argv: &[S]) -> String {
    let mut result = String::new();
    for (index, arg) in argv.iter().enumerate() {
        let arg = arg.as_ref();
        if index > 0 {
            result.push(' ');
        }
        let quote = arg.is_empty() || arg.contains(' ') || arg.contains('\t');
        if quote {
            result.push('"');
        }
        let mut backslashes = 0usize;
        for ch in arg.chars() {
            match ch {
                '\\' => backslashes += 1,
                '"' => {
                    push_backslashes(&mut result, backslashes * 2 + 1);
                    result.push('"');
                    backslashes = 0;
                }
                _ => {
                    push_backslashes(&mut result, backslashes);
                    backslashes = 0;
                    result.push(ch);
                }
            }
        }
        if quote {
            push_backslashes(&mut result, backslashes * 2);
            result.push('"');
        } else {
            push_backslashes(&mut result, backslashes);
        }
    }
    result
}

fn push_backslashes(out: &mut String, count: usize) {
    out.extend(std::iter::repeat('\\').take(count));
}

/// Split a command line into arguments using the native rule that
/// [`encode`] reverses.
pub fn split(command_line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut chars = command_line.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(' ') | Some('\t')) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut arg = String::new();
        let mut in_quotes = false;
        loop {
            let mut backslashes = 0usize;
            while chars.peek() == Some(&'\\') {
                chars.next();
                backslashes += 1;
            }
            match chars.peek().copied() {
                Some('"') => {
                    arg.extend(std::iter::repeat('\\').take(backslashes / 2));
                    chars.next();
                    if backslashes % 2 == 1 {
                        arg.push('"');
                    } else if in_quotes && chars.peek() == Some(&'"') {
                        // "" inside quotes is a literal quote
                        chars.next();
                        arg.push('"');
                    } else {
                        in_quotes = !in_quotes;
                    }
                }
                Some(ch) => {
                    arg.extend(std::iter::repeat('\\').take(backslashes));
                    if (ch == ' ' || ch == '\t') && !in_quotes {
                        break;
                    }
                    arg.push(ch);
                    chars.next();
                }
                None => {
                    arg.extend(std::iter::repeat('\\').take(backslashes));
                    break;
                }
            }
        }
        args.push(arg);
    }

    args
}

/// Owned, NUL-terminated UTF-16 string for wide-character platform APIs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WideString {
    units: Vec<u16>,
}

impl WideString {
    pub fn new(text: &str) -> Self {
        let units = text.encode_utf16().chain(std::iter::once(0)).collect();
        Self { units }
    }

    /// Code units without the terminating NUL
    pub fn as_units(&self) -> &[u16] {
        &self.units[..self.units.len() - 1]
    }

    /// Narrow conversion; unpaired surrogates become U+FFFD.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(self.as_units())
    }
}

impl From<&str> for WideString {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

/// Describe an OS error code as `<message> (error 0x<code>)`, or just
/// `error 0x<code>` when the system has no text for it.
pub fn format_os_error(code: i32) -> String {
    let hex = format!("error {:#x}", code);
    let message = system_message(code);
    if message.is_empty() {
        hex
    } else {
        format!("{} ({})", message, hex)
    }
}

fn system_message(code: i32) -> String {
    let text = io::Error::from_raw_os_error(code).to_string();
    // std appends " (os error N)"; keep only the system text
    let text = match text.rfind(" (os error ") {
        Some(pos) => &text[..pos],
        None => text.as_str(),
    };
    let text = text.trim_end_matches([' ', '\r', '\n', '\t']);
    if text.starts_with("Unknown error") {
        String::new()
    } else {
        text.to_string()
    }
}
