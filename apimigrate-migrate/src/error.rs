//! Error types for the migration engine.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::store::Version;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Result type for operations that keep what they managed to do before failing.
pub type PartialResult<T> = Result<T, PartialFailure<T>>;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML decoding error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid migration file or format.
    #[error("Invalid migration: {0}")]
    InvalidMigration(String),

    /// Two migration files share a version.
    #[error("Duplicate migration version {version}: {} and {}", .first.display(), .second.display())]
    DuplicateVersion {
        /// The shared version.
        version: Version,
        /// First file (in filename order).
        first: PathBuf,
        /// Second file.
        second: PathBuf,
    },

    /// Malformed template.
    #[error("Template error: {0}")]
    Template(String),

    /// A strict render referenced an undefined key.
    #[error("Template references undefined key '{0}'")]
    MissingKey(String),

    /// No factory is registered for an auth provider type.
    #[error("Unknown auth provider type '{0}'")]
    UnknownAuthProvider(String),

    /// Credential acquisition failed.
    #[error("Auth error: {0}")]
    Auth(String),

    /// The HTTP call produced no response.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An operation ran past its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The response status is not one of the accepted codes.
    #[error("Unexpected status {status}: {body}")]
    UnexpectedStatus {
        /// Observed status code.
        status: u16,
        /// Response body (possibly empty).
        body: String,
    },

    /// A required extraction path was not found in the response.
    #[error("Response has no value for '{key}' at path '{path}'")]
    MissingEnv {
        /// Variable name.
        key: String,
        /// JSON path that failed.
        path: String,
    },

    /// Backing store error.
    #[error("Store error: {0}")]
    Store(String),

    /// Rollback target outside `0..=current`.
    #[error("Invalid target version {target}: must be between 0 and {current}")]
    InvalidTarget {
        /// Requested target.
        target: Version,
        /// Current version.
        current: Version,
    },

    /// A stage name is referenced but not declared.
    #[error("Stage '{0}' not found")]
    StageNotFound(String),

    /// A stage name is declared twice.
    #[error("Stage '{0}' is declared more than once")]
    DuplicateStage(String),

    /// The stage graph contains a cycle.
    #[error("Stage dependency cycle involving '{0}'")]
    StageCycle(String),

    /// A stage ran before one of its dependencies ever applied anything.
    #[error("Stage '{stage}': dependent stage '{dependency}' has not been executed")]
    DependencyNotExecuted {
        /// Stage being run.
        stage: String,
        /// Dependency without applied versions.
        dependency: String,
    },

    /// The health check never reported ready.
    #[error("Wait timed out: {0}")]
    WaitTimeout(String),

    /// The run was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// General migration error.
    #[error("Migration error: {0}")]
    Other(String),
}

impl MigrationError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid migration error.
    pub fn invalid_migration(msg: impl Into<String>) -> Self {
        Self::InvalidMigration(msg.into())
    }

    /// Create a template error.
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create an auth error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a store error.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create an other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this error is detected before any HTTP call or store write.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Yaml(_)
                | Self::InvalidMigration(_)
                | Self::DuplicateVersion { .. }
                | Self::StageNotFound(_)
                | Self::DuplicateStage(_)
                | Self::StageCycle(_)
                | Self::UnknownAuthProvider(_)
        )
    }

    /// The HTTP status carried by this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::UnexpectedStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for MigrationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// An error returned together with the results gathered before it happened.
#[derive(Debug)]
pub struct PartialFailure<T> {
    /// Results completed before the failure.
    pub partial: T,
    /// The first error encountered.
    pub error: MigrationError,
}

impl<T> PartialFailure<T> {
    /// Pair partial results with an error.
    pub fn new(partial: T, error: impl Into<MigrationError>) -> Self {
        Self {
            partial,
            error: error.into(),
        }
    }

    /// Drop the partial results, keeping the error.
    pub fn into_error(self) -> MigrationError {
        self.error
    }

    /// Map the partial results.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> PartialFailure<U> {
        PartialFailure {
            partial: f(self.partial),
            error: self.error,
        }
    }
}

impl<T: Default> From<MigrationError> for PartialFailure<T> {
    fn from(error: MigrationError) -> Self {
        Self {
            partial: T::default(),
            error,
        }
    }
}

impl<T> fmt::Display for PartialFailure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<T: fmt::Debug> std::error::Error for PartialFailure<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrationError::StageNotFound("billing".to_string());
        assert!(err.to_string().contains("billing"));
    }

    #[test]
    fn test_dependency_error_display() {
        let err = MigrationError::DependencyNotExecuted {
            stage: "b".to_string(),
            dependency: "a".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Stage 'b': dependent stage 'a' has not been executed"
        );
    }

    #[test]
    fn test_status_code() {
        let err = MigrationError::UnexpectedStatus {
            status: 409,
            body: "conflict".to_string(),
        };
        assert_eq!(err.status_code(), Some(409));
        assert_eq!(MigrationError::Cancelled.status_code(), None);
    }

    #[test]
    fn test_is_config_error() {
        assert!(MigrationError::StageCycle("a".to_string()).is_config_error());
        assert!(!MigrationError::transport("refused").is_config_error());
    }

    #[test]
    fn test_partial_failure_keeps_results() {
        let failure: PartialFailure<Vec<i64>> =
            PartialFailure::new(vec![1, 2], MigrationError::Cancelled);
        assert_eq!(failure.partial, vec![1, 2]);
        assert_eq!(failure.to_string(), "Operation cancelled");

        let mapped = failure.map(|v| v.len());
        assert_eq!(mapped.partial, 2);
    }
}
