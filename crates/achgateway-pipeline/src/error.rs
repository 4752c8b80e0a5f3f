//! Error types for the aggregation pipeline.
//!
//! The taxonomy mirrors how a cutoff run degrades: per-file problems are
//! accumulated in an [`ErrorList`] and the run continues; isolation and
//! agent-construction problems abort the run; a replica that is not the
//! shard leader is not an error at all (see [`crate::leader::LockResult`]).

use std::fmt;
use std::path::PathBuf;

/// The result type used throughout achgateway-pipeline.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The staging directory could not be isolated for a cutoff run.
    #[error("problem isolating {}: {source}", dir.display())]
    Isolation {
        /// The isolation directory that could not be created.
        dir: PathBuf,
        /// The underlying filesystem error.
        #[source]
        source: std::io::Error,
    },

    /// The shard's upload agent could not be constructed.
    #[error("upload agent: {message}")]
    AgentConstruction {
        /// Description of the failure.
        message: String,
    },

    /// A filesystem or blob operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid cutoff schedule configuration.
    #[error("schedule error: {message}")]
    Schedule {
        /// Description of what made the configuration invalid.
        message: String,
    },

    /// A filename template failed to render.
    #[error("filename template: {message}")]
    Template {
        /// Description of the rendering failure.
        message: String,
    },

    /// A notification could not be delivered.
    #[error("notification error: {message}")]
    Notification {
        /// Description of the delivery failure.
        message: String,
        /// Whether the failure was a network timeout.
        timeout: bool,
    },

    /// A remote upload failed.
    #[error("upload error: {message}")]
    Upload {
        /// Description of the upload failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A cutoff run recorded one or more per-file errors.
    #[error("{0}")]
    Run(#[from] ErrorList),

    /// An internal invariant was violated.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },

    /// An error from the ACH document model.
    #[error(transparent)]
    Core(#[from] achgateway_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new upload error.
    #[must_use]
    pub fn upload(message: impl Into<String>) -> Self {
        Self::Upload {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a notification error, flagging whether it was a timeout.
    #[must_use]
    pub fn notification(message: impl Into<String>, timeout: bool) -> Self {
        Self::Notification {
            message: message.into(),
            timeout,
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Accumulates per-file errors across a cutoff run.
///
/// The merging engine records parse, flatten, write, and callback failures
/// here and keeps going; a non-empty list fails the run as a whole once all
/// files have been attempted.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<Error>);

impl ErrorList {
    /// Creates an empty error list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an error.
    pub fn push(&mut self, err: Error) {
        self.0.push(err);
    }

    /// Returns true when no errors have been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of recorded errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The recorded errors, in order.
    #[must_use]
    pub fn errors(&self) -> &[Error] {
        &self.0
    }

    /// Converts into `Ok(value)` when empty, `Err(Error::Run(self))`
    /// otherwise.
    pub fn into_result<T>(self, value: T) -> Result<T> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(Error::Run(self))
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: ", self.0.len())?;
        for (idx, err) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_list_display_joins_errors() {
        let mut el = ErrorList::new();
        el.push(Error::storage("problem reading f2.ach"));
        el.push(Error::upload("connection reset"));

        let msg = el.to_string();
        assert!(msg.starts_with("2 errors: "), "{msg}");
        assert!(msg.contains("problem reading f2.ach"), "{msg}");
        assert!(msg.contains("connection reset"), "{msg}");
    }

    #[test]
    fn error_list_into_result() {
        let el = ErrorList::new();
        assert_eq!(el.into_result(5).unwrap(), 5);

        let mut el = ErrorList::new();
        el.push(Error::storage("boom"));
        let err = el.into_result(()).unwrap_err();
        assert!(matches!(err, Error::Run(list) if list.len() == 1));
    }

    #[test]
    fn isolation_error_display_names_directory() {
        let err = Error::Isolation {
            dir: PathBuf::from("/tmp/testing-20250114-093000"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("testing-20250114-093000"));
    }
}
