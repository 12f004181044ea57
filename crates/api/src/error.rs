//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use duesledger_billing::{BillingError, ErrorKind};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found")]
    NotFound,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Billing(e) => match e.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                ErrorKind::PartialFailure | ErrorKind::Internal => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound => "NOT_FOUND",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ApiError::Database(_) => "DATABASE_ERROR",
            ApiError::Billing(e) => e.code(),
        }
    }

    /// Payment a partial failure left behind, for operator follow-up
    fn payment_id(&self) -> Option<Uuid> {
        match self {
            ApiError::Billing(
                BillingError::PaymentRecordedNotApplied { payment_id, .. }
                | BillingError::PartialSettlement { payment_id, .. }
                | BillingError::SettlementRolledBack { payment_id, .. },
            ) => Some(*payment_id),
            _ => None,
        }
    }

    fn is_internal(&self) -> bool {
        match self {
            ApiError::Database(_) => true,
            ApiError::Billing(e) => e.kind() == ErrorKind::Internal,
            _ => false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal details stay in the logs
        let message = if self.is_internal() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
            "An internal error occurred".to_string()
        } else {
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                tracing::error!(error = %self, code = self.code(), "Request partially applied");
            } else {
                tracing::debug!(error = %self, code = self.code(), "Request rejected");
            }
            self.to_string()
        };

        let mut body = json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        });
        if let Some(payment_id) = self.payment_id() {
            body["error"]["payment_id"] = json!(payment_id);
        }

        (status, Json(body)).into_response()
    }
}
