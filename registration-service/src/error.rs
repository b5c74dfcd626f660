//! Error taxonomy of the registration core.

use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

use crate::models::PaymentStatus;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("{0}")]
    Validation(String),

    #[error("Batch {batch_id} is out of stock")]
    OutOfStock { batch_id: Uuid },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Illegal payment transition {from} -> {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RegistrationError {
    pub fn validation(message: impl Into<String>) -> Self {
        RegistrationError::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        RegistrationError::Conflict(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        RegistrationError::NotFound(what.into())
    }
}

impl From<AppError> for RegistrationError {
    fn from(err: AppError) -> Self {
        RegistrationError::Internal(anyhow::Error::new(err))
    }
}

impl From<RegistrationError> for AppError {
    fn from(err: RegistrationError) -> Self {
        match err {
            RegistrationError::Validation(msg) => AppError::Unprocessable(anyhow::anyhow!(msg)),
            e @ RegistrationError::OutOfStock { .. } => AppError::Conflict(anyhow::anyhow!(e)),
            e @ RegistrationError::NotFound(_) => AppError::NotFound(anyhow::anyhow!(e)),
            RegistrationError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            e @ RegistrationError::InvalidTransition { .. } => {
                AppError::Conflict(anyhow::anyhow!(e))
            }
            RegistrationError::Database(e) => AppError::from(e),
            RegistrationError::Internal(e) => AppError::InternalError(e),
        }
    }
}

pub type Result<T, E = RegistrationError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    fn status_of(err: RegistrationError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_http_mapping() {
        assert_eq!(
            status_of(RegistrationError::validation("amount must be positive")),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(RegistrationError::OutOfStock {
                batch_id: Uuid::new_v4()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(RegistrationError::not_found("Registration")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(RegistrationError::conflict("already confirmed")),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(RegistrationError::Database(sqlx::Error::PoolClosed)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
