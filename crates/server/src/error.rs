use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use engine::LedgerError;
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`LedgerError`] and request-body rejections, and renders them as
/// `{"error": message, "code": CODE}`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The body was not valid JSON or did not match the submission shape
    #[error("Invalid request body: {0}")]
    Body(#[from] JsonRejection),
}

pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::Ledger(err) => match err {
                LedgerError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                LedgerError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                LedgerError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
                LedgerError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
                LedgerError::NotRunning { .. } => {
                    tracing::error!(error = %err, "Unexpected ledger transition error");
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                }
            },
            AppError::Body(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        };

        let body = json!({
            "error": self.to_string(),
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}
