use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Failures raised by the pure domain layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("invalid attributes: {0}")]
    InvalidAttributes(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("corrupt update: {0}")]
    CorruptUpdate(String),
    #[error("node {0} is unreadable")]
    Unreadable(Uuid),
}
