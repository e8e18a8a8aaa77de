//! The error type shared by the operator-side and host-side halves of sz-deploy.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can stop a lifecycle transition.
///
/// Failures that a step explicitly tolerates (e.g. stopping an application that was never
/// running) never become an [Error]; they come back as a nonzero status in a
/// [CommandOutput](crate::exec::CommandOutput) instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Something the operation needs is missing or malformed. Raised before anything on the
    /// managed host has been changed.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A fail-fast command exited with a nonzero status.
    #[error("command exited with {}: {command}", describe_status(*status))]
    CommandFailed {
        command: String,
        status: Option<i32>,
    },

    /// A remote command outlived its timeout and was abandoned.
    #[error("command cancelled after {}s: {command}", timeout.as_secs())]
    Cancelled { command: String, timeout: Duration },

    #[error("io failed at `{path}`: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not unpack `{path}`: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("invalid config file `{path}`: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[cfg(feature = "openssh")]
    #[error(transparent)]
    Ssh(#[from] openssh::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionFailed(message.into())
    }

    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoAt {
            path: path.into(),
            source,
        }
    }

    /// The exit code the process should terminate with after this error.
    ///
    /// A failed command hands its own status through so that scripts wrapping sz-deploy see the
    /// same code they would have seen running the command by hand.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::CommandFailed {
                status: Some(code), ..
            } if *code != 0 => *code,
            _ => 1,
        }
    }
}

fn describe_status(status: Option<i32>) -> String {
    match status {
        Some(i) => format!("exit code {i}"),
        None => "error".to_string(),
    }
}
