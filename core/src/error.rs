use std::path::PathBuf;
use std::time::Duration;

/// Errors raised by the frequency pipeline and the ranking stages.
///
/// Only `Configuration` and I/O setup failures are meant to abort a run.
/// Everything else is scoped to one document, one record or one shard.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("extraction failed for {scope}: {message}")]
    Extraction { scope: String, message: String },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{operation} timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    #[error("cannot persist {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("inconsistent depth for {expression}: {left} vs {right}")]
    InconsistentDepth {
        expression: String,
        left: u16,
        right: u16,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn extraction(scope: impl Into<String>, message: impl ToString) -> Self {
        Error::Extraction { scope: scope.into(), message: message.to_string() }
    }

    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Persistence { path: path.into(), source }
    }

    /// Per-document and per-record failures that callers log and skip.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Extraction { .. } | Error::Parse(_) | Error::Timeout { .. } | Error::InconsistentDepth { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed notation at byte {position}: {reason}")]
    Notation { position: usize, reason: String },

    #[error("malformed markup: {reason}")]
    Markup { reason: String },

    #[error("malformed record: {reason}")]
    Record { reason: String },
}

impl ParseError {
    pub(crate) fn notation(position: usize, reason: impl Into<String>) -> Self {
        ParseError::Notation { position, reason: reason.into() }
    }

    pub(crate) fn record(reason: impl Into<String>) -> Self {
        ParseError::Record { reason: reason.into() }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
