use std::any::Any;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::error::AppError;

const INTERNAL_MESSAGE: &str = "Internal server error";

/// Handler error. Rendering into the `{ message, code, details, requestId }`
/// envelope happens in the request middleware, which owns the request id.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(AppError::validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(AppError::validation(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(AppError::validation(rejection.body_text()))
    }
}

/// Carried as a response extension until the middleware renders it.
#[derive(Debug, Clone)]
pub(crate) struct ErrorReport {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Value,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = StatusCode::from_u16(err.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = if err.is_internal() {
            tracing::error!(error = %err, "request failed");
            INTERNAL_MESSAGE.to_string()
        } else {
            tracing::debug!(code = err.code(), error = %err, "request rejected");
            err.to_string()
        };
        let mut response = status.into_response();
        response.extensions_mut().insert(ErrorReport {
            status,
            code: err.code(),
            message,
            details: err.details(),
        });
        response
    }
}

pub(crate) fn render(report: ErrorReport, request_id: &str) -> Response {
    let body = json!({
        "message": report.message,
        "code": report.code,
        "details": report.details,
        "requestId": request_id,
    });
    (report.status, Json(body)).into_response()
}

pub(crate) fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    ApiError(AppError::Internal(format!("handler panicked: {detail}"))).into_response()
}
