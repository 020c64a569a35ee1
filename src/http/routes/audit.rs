use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::audit::{self, AuditEntry, AuditFilter};
use crate::http::extract::{Ctx, Params};
use crate::http::{ApiResult, AppState};
use crate::query::Page;

pub fn router() -> Router<AppState> {
    Router::new().route("/audit-logs", get(list))
}

async fn list(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Params(filter): Params<AuditFilter>,
    Params(page): Params<Page>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    state
        .read(ctx, move |conn, ctx| audit::list(conn, ctx, &filter, page))
        .await
        .map(Json)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::http::tests::test_app;

    #[tokio::test]
    async fn test_writes_are_audited_with_request_id() {
        let t = test_app();
        let (status, _) = t
            .call(
                "POST",
                "/api/v1/counterparties",
                Some(json!({ "code": "ACME", "name": "Acme", "kind": "CUSTOMER" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, logs) = t
            .call("GET", "/api/v1/audit-logs?resource_type=counterparty&limit=5", None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let logs = logs.as_array().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["action"], "cari.counterparty.create");
        assert!(!logs[0]["request_id"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requires_audit_permission() {
        let t = test_app();
        let clerk = t.login_as("clerk@acme.test", &["cari.read"]);
        let (status, _) = t.call_as(&clerk, "GET", "/api/v1/audit-logs", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
