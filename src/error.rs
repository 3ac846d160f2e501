use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy of the engine.
///
/// `InvalidBacklink`/`InconsistentWorktree` normally trigger an automatic
/// cache rebuild and are only surfaced when recovery itself fails. Parser
/// errors are always fatal: an ignored line risks a wrong build-cache key.
#[derive(Debug, Error)]
pub enum Error {
    #[error("command failed: {command}\nexit status: {status}\noutput:\n{output}")]
    CommandFailed {
        command: String,
        status: ExitStatus,
        output: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid worktree backlink file {path}: {reason}")]
    InvalidBacklink { path: PathBuf, reason: String },

    #[error("inconsistent worktree {path}: {reason}")]
    InconsistentWorktree { path: PathBuf, reason: String },

    #[error("unexpected diff line in state `{state}`: {line:?}")]
    UnexpectedDiffFormat { state: &'static str, line: String },

    #[error("unexpected git status line format: {line:?}")]
    UnexpectedStatusFormat { line: String },

    #[error("unsupported submodule state: {0}")]
    UnsupportedSubmoduleState(String),

    #[error("git version {detected} violates constraint: {constraint}")]
    VersionConstraintViolation { detected: String, constraint: String },

    #[error("invalid glob pattern {pattern:?}: {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("timed out acquiring host lock {name:?} after {timeout:?}")]
    LockTimeout { name: String, timeout: Duration },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}
