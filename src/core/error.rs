use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuireError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Uniqueness error: {entity_type}.{field} = {value} already exists")]
    UniquenessError {
        entity_type: String,
        field: String,
        value: String,
    },
    #[error("Policy violation: {0}")]
    PolicyViolation(String),
    #[error("Transaction failed: {0}")]
    TransactionFailure(String),
    #[error("Workflow step {index} failed: {message}")]
    WorkflowStepFailure { index: usize, message: String },
    #[error("Workflow state error: {0}")]
    WorkflowStateError(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl QuireError {
    /// Errors that describe a broken caller contract rather than an engine fault.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            QuireError::ValidationError(_)
                | QuireError::UniquenessError { .. }
                | QuireError::PolicyViolation(_)
        )
    }
}
