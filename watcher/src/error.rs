//! Error types for the scheduled watcher.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur in the scheduled watcher.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Configuration did not pass validation.
    #[error("invalid configuration: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    /// Schedule expression error.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// The notification source could not be attached to the watched root.
    #[error("failed to attach watcher to {path}: {source}")]
    Attach {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// Notify error.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// A single reason a configuration was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The watched directory does not exist.
    #[error("directory '{}' does not exist", .0.display())]
    PathNotFound(PathBuf),

    /// The cron expression could not be parsed.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },
}

/// Errors produced while parsing or evaluating a cron expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Wrong number of whitespace separated fields.
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    /// A field could not be parsed.
    #[error("invalid {field} field '{value}'")]
    InvalidField { field: &'static str, value: String },

    /// A value lies outside the range allowed for its field.
    #[error("{field} value {value} is out of range {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    /// The expression never fires within the search horizon.
    #[error("expression '{0}' has no upcoming occurrence")]
    NoOccurrence(String),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
