//! Error types for the daemon

use thiserror::Error;

/// Broad error classes used to decide how far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad configuration or task definition. Fatal at setup.
    Configuration,
    /// A call to an external collaborator failed. Recoverable per item.
    ExternalService,
    /// The record store failed. Recoverable per cycle.
    Persistence,
    /// The process must terminate.
    Fatal,
}

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid schedule format: '{0}' (expected cron expression, <n>[s|m|h|d] or milliseconds)")]
    InvalidScheduleFormat(String),

    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("external service error: {0}")]
    ExternalService(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record store is closed")]
    StoreClosed,

    #[error("invalid daemon state: {0}")]
    InvalidState(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to load config: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_)
            | Self::InvalidScheduleFormat(_)
            | Self::InvalidCron { .. }
            | Self::InvalidTask(_)
            | Self::TaskNotFound(_)
            | Self::ConfigLoad(_) => ErrorClass::Configuration,
            Self::ExternalService(_) | Self::Http(_) => ErrorClass::ExternalService,
            Self::Persistence(_) | Self::Database(_) | Self::StoreClosed | Self::Json(_) | Self::Io(_) => {
                ErrorClass::Persistence
            }
            Self::InvalidState(_) | Self::Fatal(_) => ErrorClass::Fatal,
        }
    }

    /// Whether the daemon can keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::ExternalService | ErrorClass::Persistence
        )
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
