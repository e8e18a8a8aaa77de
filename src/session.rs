//! The SSH connection to the managed host.
//!
//! One [Session] is opened per run and handed explicitly to everything that needs to reach the
//! managed host. There is no ambient connection state.

use crate::error::Result;
use crate::exec::{CommandLine, CommandOutput, Policy};

/// Runs commands on the managed host.
///
/// Implementations must run commands as structured argument vectors (never re-parsed by a
/// shell), fold stderr into stdout, stream output to the operator as it arrives, and apply
/// `policy` to the exit status.
pub trait Session {
    fn remote(&mut self, command: &CommandLine, policy: Policy) -> Result<CommandOutput>;
}

#[cfg(feature = "openssh")]
pub use ssh::SshSession;

#[cfg(feature = "openssh")]
mod ssh {
    use super::*;
    use crate::error::Error;
    use crate::exec::MERGE_STDERR;
    use crate::sync::Endpoint;
    use openssh::{KnownHosts, SessionBuilder, Stdio};
    use std::future::Future;
    use std::io::{self, Write};
    use std::time::Duration;
    use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

    /// An implementation of [Session] using the [openssh] crate. For production use.
    pub struct SshSession {
        /// The Tokio runtime. We need this so we can run async tasks using [block_on].
        ///
        /// [block_on]: tokio::runtime::Runtime::block_on
        runtime: tokio::runtime::Runtime,

        session: openssh::Session,

        /// Upper bound for each remote command.
        timeout: Option<Duration>,
    }

    impl SshSession {
        /// Opens a multiplexed SSH connection to `endpoint`.
        pub fn connect(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<Self> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;

            let mut builder = SessionBuilder::default();
            builder
                .user(endpoint.user.clone())
                .port(endpoint.port)
                .keyfile(&endpoint.key)
                .known_hosts_check(KnownHosts::Add);

            tracing::info!(
                host = %endpoint.host,
                port = endpoint.port,
                user = %endpoint.user,
                "connecting",
            );
            let session = runtime.block_on(builder.connect_mux(&endpoint.host))?;

            Ok(Self {
                runtime,
                session,
                timeout,
            })
        }

        /// Closes the connection, reporting any error from the SSH master process.
        pub fn close(self) -> Result<()> {
            let Self {
                runtime, session, ..
            } = self;
            runtime.block_on(session.close())?;
            Ok(())
        }
    }

    impl Session for SshSession {
        fn remote(&mut self, command: &CommandLine, policy: Policy) -> Result<CommandOutput> {
            tracing::info!(command = %command.display(), "[ssh] running");
            let run = stream(&self.session, command);
            let output = self
                .runtime
                .block_on(bounded(command, self.timeout, run))?;
            output.check(command, policy)
        }
    }

    /// Runs `run` to completion, or fails with [Error::Cancelled] once `limit` has passed.
    async fn bounded<F>(
        command: &CommandLine,
        limit: Option<Duration>,
        run: F,
    ) -> Result<CommandOutput>
    where
        F: Future<Output = Result<CommandOutput>>,
    {
        let Some(limit) = limit else {
            return run.await;
        };
        match tokio::time::timeout(limit, run).await {
            Ok(output) => output,
            Err(_) => {
                // Dropping the child abandons it; the remote process may keep running until the
                // connection closes.
                tracing::error!(
                    command = %command.display(),
                    seconds = limit.as_secs_f32(),
                    "timed out",
                );
                Err(Error::Cancelled {
                    command: command.display(),
                    timeout: limit,
                })
            }
        }
    }

    /// Runs `command` remotely, echoing each line to stdout as it arrives.
    async fn stream(session: &openssh::Session, command: &CommandLine) -> Result<CommandOutput> {
        let mut remote = session.command("sh");
        remote
            .arg("-c")
            .arg(MERGE_STDERR)
            .arg(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if let Some(dir) = &command.cwd {
            // Remote commands always run from the login directory; a working directory is a
            // local-only concept.
            tracing::warn!(dir = %dir.display(), "ignoring working directory for remote command");
        }

        let mut child = remote.spawn().await?;
        let read = match child.stdout().take() {
            Some(stdout) => read_lines(BufReader::new(stdout), &mut io::stdout()).await,
            None => Err(io::Error::other("remote stdout was not captured")),
        };
        // Reap the child even if reading failed.
        let status = child.wait().await?;

        Ok(CommandOutput {
            lines: read?,
            status: status.code(),
        })
    }

    /// Reads `reader` to the end, writing each line to `console` with a `==> ` prefix.
    ///
    /// Bytes that aren't valid UTF-8 are replaced rather than rejected.
    async fn read_lines<R, W>(mut reader: R, console: &mut W) -> io::Result<Vec<String>>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        let mut lines = Vec::new();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf).trim_end().to_string();
            writeln!(console, "==> {line}")?;
            lines.push(line);
        }
        Ok(lines)
    }

}
