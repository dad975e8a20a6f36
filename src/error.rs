//! Error taxonomy for the model lifecycle
//!
//! Every failure carries a machine-checkable [`ErrorKind`] and a readable
//! message. Callers at the request boundary turn an [`EngineError`] into an
//! [`ErrorResponse`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ml::matrix::ValidationError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("model '{0}' is already training")]
    AlreadyTraining(String),

    #[error("model '{0}' is not trained")]
    ModelNotTrained(String),

    #[error("fit failed: {0}")]
    FitFailure(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("training ticket for model '{0}' is no longer current")]
    StaleTicket(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Machine-checkable failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InvalidParameter,
    AlreadyTraining,
    ModelNotTrained,
    FitFailure,
    Persistence,
    StaleTicket,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::InvalidParameter => "InvalidParameterError",
            ErrorKind::AlreadyTraining => "AlreadyTrainingError",
            ErrorKind::ModelNotTrained => "ModelNotTrainedError",
            ErrorKind::FitFailure => "FitFailureError",
            ErrorKind::Persistence => "PersistenceError",
            ErrorKind::StaleTicket => "StaleTicketError",
            ErrorKind::Internal => "InternalError",
        }
    }

    /// Whether the failure is the caller's fault (4xx-equivalent)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::Validation
                | ErrorKind::InvalidParameter
                | ErrorKind::AlreadyTraining
                | ErrorKind::ModelNotTrained
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            EngineError::AlreadyTraining(_) => ErrorKind::AlreadyTraining,
            EngineError::ModelNotTrained(_) => ErrorKind::ModelNotTrained,
            EngineError::FitFailure(_) => ErrorKind::FitFailure,
            EngineError::Persistence(_) => ErrorKind::Persistence,
            EngineError::StaleTicket(_) => ErrorKind::StaleTicket,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only a concurrent training conflict clears up on its own
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::AlreadyTraining(_))
    }

    /// Message prefixed with the kind, for bodies that carry no separate kind field
    pub fn tagged_message(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for EngineError {
    fn from(e: bincode::error::EncodeError) -> Self {
        EngineError::Persistence(format!("encode failed: {}", e))
    }
}

impl From<bincode::error::DecodeError> for EngineError {
    fn from(e: bincode::error::DecodeError) -> Self {
        EngineError::Persistence(format!("decode failed: {}", e))
    }
}

/// Structured failure body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
}
