//! Error types for Synheart Glyco

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while processing one user's event table
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Unclassifiable event table: {0}")]
    Classification(String),

    #[error("Contract violation for {class} data: missing columns {missing:?}")]
    ContractViolation { class: String, missing: Vec<String> },

    #[error("No valid events to establish grid bounds: {0}")]
    EmptyGrid(String),

    #[error("Failed to parse event table: {0}")]
    Parse(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Input file not found: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("Worker panicked: {0}")]
    WorkerPanic(String),
}

impl ComputeError {
    /// Whether this failure means "nothing to compute" rather than a broken input.
    ///
    /// Skips are logged at warn level and reported separately in batch summaries.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            ComputeError::Classification(_)
                | ComputeError::EmptyGrid(_)
                | ComputeError::MissingInput(_)
        )
    }

    /// Short stable code used in batch reports and CLI errors
    pub fn code(&self) -> &'static str {
        match self {
            ComputeError::Classification(_) => "NA",
            ComputeError::ContractViolation { .. } => "CONTRACT_VIOLATION",
            ComputeError::EmptyGrid(_) => "EMPTY_GRID",
            ComputeError::Parse(_) => "PARSE_ERROR",
            ComputeError::Json(_) => "JSON_ERROR",
            ComputeError::Csv(_) => "CSV_ERROR",
            ComputeError::Io(_) => "IO_ERROR",
            ComputeError::InvalidConfig(_) => "INVALID_CONFIG",
            ComputeError::MissingInput(_) => "MISSING_INPUT",
            ComputeError::WorkerPanic(_) => "WORKER_PANIC",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_classification() {
        assert!(ComputeError::Classification("no columns".into()).is_skip());
        assert!(ComputeError::EmptyGrid("no events".into()).is_skip());
        assert!(ComputeError::MissingInput(PathBuf::from("a.csv")).is_skip());
        assert!(!ComputeError::ContractViolation {
            class: "CGM".into(),
            missing: vec!["value".into()],
        }
        .is_skip());
    }

    #[test]
    fn test_contract_violation_message() {
        let err = ComputeError::ContractViolation {
            class: "PUMP".into(),
            missing: vec!["rate".into(), "duration".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("PUMP"));
        assert!(msg.contains("duration"));
        assert_eq!(err.code(), "CONTRACT_VIOLATION");
    }
}
