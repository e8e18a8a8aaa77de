//! Running commands and reporting their output as it arrives.
//!
//! Commands are always structured: a program plus a vector of arguments. Nothing in sz-deploy
//! builds a shell string out of names it was given, so an application name can never be
//! reinterpreted by a shell on either machine.

use crate::error::{Error, Result};
use shlex::Quoter;
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Runs `"$0" "$@"` with stderr folded into stdout, so the caller sees one interleaved stream.
pub(crate) const MERGE_STDERR: &str = "exec \"$0\" \"$@\" 2>&1";

/// What to do when a command exits with a nonzero status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    /// Abort the current transition with [Error::CommandFailed].
    FailFast,

    /// Hand the status back to the caller, e.g. when "not running" is an acceptable answer.
    Tolerate,
}

/// A program, its arguments, and optionally the directory to run it in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends a path argument. Host paths are always UTF-8 in practice; anything else is
    /// converted lossily rather than rejected.
    pub fn path_arg(self, path: impl AsRef<Path>) -> Self {
        let arg = path.as_ref().to_string_lossy().into_owned();
        self.arg(arg)
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Parses a whitespace-separated command line from configuration, honoring shell quoting.
    ///
    /// Returns [None] for a blank or unparseable line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = shlex::split(line)?.into_iter();
        let program = words.next()?;
        Some(Self::new(program).args(words))
    }

    /// A user-friendly, shell-quoted rendition of the command for logs and error messages.
    pub fn display(&self) -> String {
        let mut components = Vec::with_capacity(self.args.len() + 1);
        components.push(self.program.as_str());
        components.extend(self.args.iter().map(String::as_str));

        // Try to use shlex to properly quote the string. If that fails, naively join with spaces.
        match Quoter::new().join(components.iter().copied()) {
            Ok(s) => s,
            Err(_) => components.join(" "),
        }
    }
}

/// Everything a command printed, one entry per line, plus how it exited.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub lines: Vec<String>,

    /// The exit code, or [None] if the command was killed by a signal.
    pub status: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Applies `policy` to a finished command.
    pub fn check(self, command: &CommandLine, policy: Policy) -> Result<Self> {
        if policy == Policy::FailFast && !self.success() {
            tracing::error!(
                command = %command.display(),
                status = ?self.status,
                "operation failed",
            );
            return Err(Error::CommandFailed {
                command: command.display(),
                status: self.status,
            });
        }
        Ok(self)
    }
}

/// Runs commands on the machine sz-deploy itself is running on.
pub trait Run {
    fn run(&mut self, command: &CommandLine, policy: Policy) -> Result<CommandOutput>;
}

/// Production implementation of [Run]. Streams each output line to `console` as soon as it is
/// read.
#[derive(Debug)]
pub struct LocalRunner<W: Write> {
    console: W,
}

impl LocalRunner<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> LocalRunner<W> {
    pub fn new(console: W) -> Self {
        Self { console }
    }

    pub fn into_console(self) -> W {
        self.console
    }
}

impl<W: Write> Run for LocalRunner<W> {
    fn run(&mut self, command: &CommandLine, policy: Policy) -> Result<CommandOutput> {
        tracing::info!(command = %command.display(), "running");

        let mut process = Command::new("sh");
        process
            .arg("-c")
            .arg(MERGE_STDERR)
            .arg(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped());
        if let Some(dir) = &command.cwd {
            process.current_dir(dir);
        }

        let mut child = process.spawn()?;
        let read = match child.stdout.take() {
            Some(stdout) => echo_lines(BufReader::new(stdout), &mut self.console),
            None => Ok(Vec::new()),
        };
        let lines = match read {
            Ok(lines) => lines,
            Err(err) => {
                // Don't leave the child running or unreaped behind the error. It may already
                // have exited, in which case kill fails harmlessly.
                let _ = child.kill();
                child.wait()?;
                return Err(err.into());
            }
        };
        let status = child.wait()?;

        CommandOutput {
            lines,
            status: status.code(),
        }
        .check(command, policy)
    }
}

/// Copies each line of `reader` to `console` and collects it. Bytes that aren't UTF-8 are
/// replaced rather than rejected.
fn echo_lines<R: BufRead, W: Write>(reader: R, console: &mut W) -> io::Result<Vec<String>> {
    let mut lines = Vec::new();
    for line in reader.split(b'\n') {
        let line = String::from_utf8_lossy(&line?).trim_end().to_string();
        writeln!(console, "{line}")?;
        lines.push(line);
    }
    Ok(lines)
}

/// Turns a path into a `String` argument, or fails if it is not valid UTF-8.
pub fn utf8_path(path: &Path) -> Result<String> {
    match path.to_str() {
        Some(s) => Ok(s.to_string()),
        None => Err(Error::precondition(format!(
            "path is not valid UTF-8: {:?}",
            OsString::from(path.as_os_str())
        ))),
    }
}
