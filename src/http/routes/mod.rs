//! One router per resource, merged under `/api/v1`.

mod accounts;
mod approvals;
mod audit;
mod auth;
mod bank;
mod cari;
mod cash;
mod config;
pub mod health;
mod journals;
mod org;
mod periods;
mod reports;
mod settlements;

use axum::http::StatusCode;
use axum::{Json, Router};
use serde::Serialize;

use super::{ApiError, AppState};
use crate::error::AppError;

pub(crate) fn api() -> Router<AppState> {
    Router::new()
        .merge(auth::router())
        .merge(org::router())
        .merge(accounts::router())
        .merge(periods::router())
        .merge(journals::router())
        .merge(reports::router())
        .merge(config::router())
        .merge(cash::router())
        .merge(approvals::router())
        .merge(cari::router())
        .merge(settlements::router())
        .merge(bank::router())
        .merge(audit::router())
}

pub(crate) async fn not_found() -> ApiError {
    ApiError(AppError::not_found("Route"))
}

pub(crate) fn created<T: Serialize>(value: T) -> (StatusCode, Json<T>) {
    (StatusCode::CREATED, Json(value))
}

/// 200 for an idempotent replay, 201 for a fresh create.
pub(crate) fn created_unless(replay: bool) -> StatusCode {
    if replay {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    }
}
