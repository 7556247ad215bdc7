use sea_orm::error::DbErr;
use serde::Serialize;
use uuid::Uuid;

/// Error type shared by every procurement service.
///
/// Business-rule rejections (`ValidationError`, `ConsistencyViolation`, `PartialFailure`)
/// are distinguished from infrastructure failures (`DatabaseError`, `ExternalServiceError`)
/// so the calling service layer can decide whether the operator or the platform has to act.
#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    /// Optimistic-concurrency retries were exhausted; the caller retries the whole operation.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A single compare-and-swap lost against a concurrent writer. Retried internally.
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    /// An accounting identity would be broken. Never clamped.
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    /// Some supplier-grouped purchase orders exist although the award did not complete.
    #[error("Partial failure after creating {} purchase order(s): {message}", created_purchase_orders.len())]
    PartialFailure {
        created_purchase_orders: Vec<Uuid>,
        message: String,
    },

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    /// Whether the operation that produced this error may simply be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification(_))
    }

    /// Whether this error is an expected business-rule outcome rather than an
    /// infrastructure failure.
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::ValidationError(_)
                | Self::InvalidStatus(_)
                | Self::ConsistencyViolation(_)
                | Self::PartialFailure { .. }
        )
    }

    /// Short machine-readable code for the error category.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) | Self::InvalidStatus(_) => "validation_error",
            Self::Conflict(_) | Self::ConcurrentModification(_) => "conflict",
            Self::ConsistencyViolation(_) => "consistency_violation",
            Self::PartialFailure { .. } => "partial_failure",
            Self::ExternalServiceError(_) => "external_service_error",
            Self::SerializationError(_) | Self::ConfigError(_) | Self::Other(_) => "internal_error",
        }
    }
}
