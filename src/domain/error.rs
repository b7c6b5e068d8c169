//! Engine error taxonomy and its HTTP mapping

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Missing or malformed request field. Nothing is recorded.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{entity} `{id}` was not found")]
    NotFound { entity: &'static str, id: String },

    /// Door hardware is disabled; an error-result access event is recorded.
    #[error("door `{door_id}` is inactive")]
    DoorInactive { door_id: String },

    #[error("unknown action `{0}`")]
    UnknownAction(String),

    /// Door controller did not acknowledge the command.
    #[error("door controller error: {0}")]
    Hardware(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("operation timed out after {0} ms")]
    Timeout(u64),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// HTTP status code reported for this error
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::Validation(_)
            | EngineError::DoorInactive { .. }
            | EngineError::UnknownAction(_) => 400,
            EngineError::NotFound { .. } => 404,
            EngineError::Hardware(_) | EngineError::Persistence(_) | EngineError::Timeout(_) => {
                500
            }
        }
    }

    /// Stable label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound { .. } => "not_found",
            EngineError::DoorInactive { .. } => "door_inactive",
            EngineError::UnknownAction(_) => "unknown_action",
            EngineError::Hardware(_) => "hardware",
            EngineError::Persistence(_) => "persistence",
            EngineError::Timeout(_) => "timeout",
        }
    }
}
