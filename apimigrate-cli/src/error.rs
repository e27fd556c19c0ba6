//! CLI error types and result alias.

use apimigrate::MigrationError;
use miette::Diagnostic;
use thiserror::Error;

/// Result type alias for CLI operations
pub type CliResult<T> = Result<T, CliError>;

/// CLI error types
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// IO error
    #[error("IO error: {0}")]
    #[diagnostic(code(apimigrate::io))]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(apimigrate::config),
        help("check config.yaml / stages.yaml and the variables they reference")
    )]
    Config(String),

    /// Migration error
    #[error("Migration error: {0}")]
    #[diagnostic(code(apimigrate::migration))]
    Migration(String),

    /// API answered with an unexpected status
    #[error("Migration error: {0}")]
    #[diagnostic(code(apimigrate::status))]
    Status(String),

    /// Stage orchestration error
    #[error("Stage error: {0}")]
    #[diagnostic(code(apimigrate::stage))]
    Stage(String),

    /// Interrupted by the user
    #[error("Interrupted")]
    #[diagnostic(code(apimigrate::interrupted))]
    Interrupted,
}

impl From<MigrationError> for CliError {
    fn from(err: MigrationError) -> Self {
        match err {
            MigrationError::Cancelled => CliError::Interrupted,
            MigrationError::StageNotFound(_)
            | MigrationError::DuplicateStage(_)
            | MigrationError::StageCycle(_)
            | MigrationError::DependencyNotExecuted { .. } => CliError::Stage(err.to_string()),
            err if err.is_config_error() => CliError::Config(err.to_string()),
            err if err.status_code().is_some() => CliError::Status(err.to_string()),
            other => CliError::Migration(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_error_mapping() {
        let err: CliError = MigrationError::config("missing dsn").into();
        assert!(matches!(err, CliError::Config(ref msg) if msg.contains("missing dsn")));

        let err: CliError = MigrationError::Cancelled.into();
        assert!(matches!(err, CliError::Interrupted));

        let err: CliError = MigrationError::DependencyNotExecuted {
            stage: "billing".into(),
            dependency: "identity".into(),
        }
        .into();
        assert!(matches!(err, CliError::Stage(_)));
    }
}
