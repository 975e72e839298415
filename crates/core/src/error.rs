use crate::plan::PlanVersion;
use crate::status::Status;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("Operation not supported by a v{} plan: {operation}", version.number())]
    Unsupported {
        version: PlanVersion,
        operation: &'static str,
    },

    #[error("Malformed plan document: {0}")]
    Malformed(#[from] serde_json::Error),
}
