use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Object storage error: {0}")]
    ObjectStorage(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Validation error for a single rejected input field.
    pub fn invalid_field(field: &str) -> Self {
        DispatchError::Validation(format!("invalid {}", field))
    }

    /// Data errors mark the job as failed and are never retried;
    /// everything else is retryable through queue re-delivery.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            DispatchError::Validation(_) | DispatchError::Data(_) | DispatchError::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_field_message() {
        let err = DispatchError::invalid_field("controlGroup");
        assert_eq!(err.to_string(), "Validation error: invalid controlGroup");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(DispatchError::Storage("timeout".into()).is_retryable());
        assert!(DispatchError::Bus("broker down".into()).is_retryable());
        assert!(!DispatchError::Data("no users matching the filters".into()).is_retryable());
        assert!(!DispatchError::invalid_field("service").is_retryable());
    }
}
