//! Error types for vm-appliance

use std::io;
use thiserror::Error;

/// Result type alias for vm-appliance operations
pub type Result<T> = std::result::Result<T, Error>;

/// Appended to launch-related errors when the session is not verbose.
pub const DEBUG_ADVICE: &str = "\
To see full error messages you may need to enable debugging.
Do:
  export VM_APPLIANCE_DEBUG=1 VM_APPLIANCE_TRACE=1
and run the command again.  For further information, read the
troubleshooting section of the vm-appliance documentation.";

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or conflicting arguments, or a call made in the wrong state.
    Configuration,
    /// An operating system call failed.
    Resource,
    /// The appliance timed out, crashed or closed the connection.
    Protocol,
    /// The active backend does not implement the operation.
    Capability,
}

/// Errors that can occur during vm-appliance operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),

    #[error("{0}")]
    InvalidDrive(String),

    #[error("{0}")]
    InvalidParameter(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("invalid backend: {0}")]
    UnknownBackend(String),

    #[error("too many drives have been added, the current backend only supports {0} drives")]
    TooManyDrives(usize),

    #[error("{0}")]
    NotSupported(String),

    #[error("{context}: {source}")]
    Os {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("{0}")]
    LaunchFailed(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    UnexpectedClose(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an OS error with a short description of what was being done.
    pub fn os(context: impl Into<String>, source: impl Into<io::Error>) -> Self {
        Error::Os {
            context: context.into(),
            source: source.into(),
        }
    }

    /// The generic "launch failed" error.
    pub fn launch_failed(verbose: bool) -> Self {
        if verbose {
            Error::LaunchFailed("launch failed, see earlier error messages".to_string())
        } else {
            Error::LaunchFailed(format!(
                "launch failed.\nThis usually means the appliance failed to start or crashed.\n{}",
                DEBUG_ADVICE
            ))
        }
    }

    /// The appliance did not connect back within the accept budget.
    pub fn launch_timeout(verbose: bool) -> Self {
        if verbose {
            Error::Timeout("appliance launch timed out, see earlier error messages".to_string())
        } else {
            Error::Timeout(format!(
                "appliance launch timed out.\nThis usually means the kernel or appliance hung during launch.\n{}",
                DEBUG_ADVICE
            ))
        }
    }

    /// The appliance went away after it had been launched.
    ///
    /// [`Connection`](crate::Connection) reports a peer close as `Ok(0)`;
    /// the layer above it, which knows a reply was still due, turns that
    /// into this error.
    pub fn unexpected_close(verbose: bool) -> Self {
        if verbose {
            Error::UnexpectedClose(
                "appliance closed the connection unexpectedly, see earlier error messages"
                    .to_string(),
            )
        } else {
            Error::UnexpectedClose(format!(
                "appliance closed the connection unexpectedly.\nThis usually means the appliance crashed.\n{}",
                DEBUG_ADVICE
            ))
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownProtocol(_)
            | Error::InvalidDrive(_)
            | Error::InvalidParameter(_)
            | Error::InvalidState(_)
            | Error::UnknownBackend(_)
            | Error::TooManyDrives(_)
            | Error::Json(_) => ErrorKind::Configuration,
            Error::Os { .. } | Error::Io(_) | Error::CommandFailed { .. } => ErrorKind::Resource,
            Error::LaunchFailed(_) | Error::Timeout(_) | Error::UnexpectedClose(_) => {
                ErrorKind::Protocol
            }
            Error::NotSupported(_) => ErrorKind::Capability,
        }
    }

    /// The errno attached to this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Os { source, .. } | Error::Io(source) => source.raw_os_error(),
            Error::UnexpectedClose(_) => Some(nix::libc::EPIPE),
            Error::NotSupported(_) => Some(nix::libc::ENOTSUP),
            _ => None,
        }
    }
}
