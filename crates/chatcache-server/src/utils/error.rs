use thiserror::Error;

/// Failures raised by a [`crate::store::KvStore`] backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store timeout during {op}")]
    Timeout { op: &'static str },

    #[error("Script {script} failed: {reason}")]
    Script { script: &'static str, reason: String },

    #[error("Wrong value type at key {key}")]
    WrongType { key: String },

    #[error("Invalid key pattern: {0}")]
    InvalidPattern(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl StoreError {
    /// Connectivity and timeout failures; the caller should fall back to a safe default.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Timeout { .. } => true,
            StoreError::Redis(e) => e.is_timeout() || e.is_connection_dropped() || e.is_io_error(),
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Reject blank or oversized identifiers before any store access.
pub fn validate_id(kind: &str, value: &str, max_len: usize) -> ServiceResult<()> {
    if value.trim().is_empty() {
        return Err(ServiceError::Validation(format!("{} cannot be null or empty", kind)));
    }
    if value.chars().count() > max_len {
        return Err(ServiceError::Validation(format!(
            "{} cannot exceed {} characters",
            kind, max_len
        )));
    }
    Ok(())
}
