use std::ffi::OsStr;
use std::fmt::Display;
use std::os::unix::ffi::OsStrExt;
use std::process::Command;

/// Helper to format a single argument (often a path) for display.
#[derive(Debug)]
pub struct ShellQuoted<'a> {
    value: &'a OsStr,
}

impl Display for ShellQuoted<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(s) = self.value.to_str() {
            if !s.is_empty()
                && s
                    .chars()
                    .all(|c| matches!(c, '/' | '.' | '-' | '_' | '=' | ':' | ',') || c.is_alphanumeric())
            {
                return f.write_str(s);
            }
        }
        let r = shlex::bytes::try_quote(self.value.as_bytes()).map_err(|_| std::fmt::Error)?;
        let s = std::str::from_utf8(&r).map_err(|_| std::fmt::Error)?;
        f.write_str(s)
    }
}

impl<'a> ShellQuoted<'a> {
    /// Quote a value in a way that it would be parsed by a default
    /// POSIX shell. If the value is UTF-8 with no spaces or shell meta-characters,
    /// it will be exactly the same as the input.
    pub fn new<S: AsRef<OsStr> + ?Sized>(value: &'a S) -> ShellQuoted<'a> {
        ShellQuoted {
            value: value.as_ref(),
        }
    }
}

/// Render a command and its arguments as a copy-pasteable shell command line.
pub fn command_line(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|a| ShellQuoted::new(a).to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
