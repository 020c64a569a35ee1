use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::http::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let db = state
        .unauthenticated(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM tenants", [], |row| row.get::<_, i64>(0))?)
        })
        .await;
    let (status, code, database) = match db {
        Ok(_) => ("ok", StatusCode::OK, "ok".to_string()),
        Err(e) => {
            tracing::warn!(error = %e.0, "health check failed");
            ("degraded", StatusCode::SERVICE_UNAVAILABLE, "unavailable".to_string())
        }
    };
    (
        code,
        Json(json!({
            "status": status,
            "database": database,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}
