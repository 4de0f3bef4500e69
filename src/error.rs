//! Error types for the analysis pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by pipeline stages.
///
/// Data-quality conditions (incomplete participants, flatliners, too few
/// observations for a statistic) are not errors: they are logged and the
/// affected unit is reported as `NaN`. What remains here is broken wiring
/// (configuration) and artifact I/O.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("required column not found: {column}")]
    MissingColumn { column: String },

    #[error("unknown value name: {name}")]
    UnknownValue { name: String },

    #[error("unknown pair name: {name}")]
    UnknownPair { name: String },

    #[error("unknown block id: {block}")]
    UnknownBlock { block: String },

    #[error("model term missing from fit: {term}")]
    MissingTerm { term: String },

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("{context}: {observations} observations cannot identify {parameters} parameters")]
    Underdetermined {
        context: String,
        observations: usize,
        parameters: usize,
    },

    #[error("{context}: need at least {needed}, got {got}")]
    InsufficientData {
        context: String,
        needed: usize,
        got: usize,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("spreadsheet error in {path}: {message}")]
    Workbook { path: PathBuf, message: String },
}

impl AnalysisError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn missing_column(column: impl Into<String>) -> Self {
        Self::MissingColumn {
            column: column.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors that indicate broken pipeline wiring rather than
    /// recoverable data conditions.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingColumn { .. }
                | Self::UnknownValue { .. }
                | Self::UnknownPair { .. }
                | Self::UnknownBlock { .. }
                | Self::MissingTerm { .. }
                | Self::InvalidConfig { .. }
                | Self::Yaml(_)
        )
    }

    /// True for fits that failed only because the sample was too small.
    pub fn is_underdetermined(&self) -> bool {
        matches!(
            self,
            Self::Underdetermined { .. } | Self::InsufficientData { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
