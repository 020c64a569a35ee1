use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::http::extract::{Body, Ctx, Params};
use crate::http::{ApiResult, AppState};
use crate::purpose_accounts::{self, PurposeAccountRow, SetPurposeAccount};

pub fn router() -> Router<AppState> {
    Router::new().route("/purpose-accounts", get(list).put(set))
}

#[derive(Deserialize)]
struct PurposeQuery {
    legal_entity_id: Option<i64>,
}

async fn list(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Params(query): Params<PurposeQuery>,
) -> ApiResult<Json<Vec<PurposeAccountRow>>> {
    state
        .read(ctx, move |conn, ctx| purpose_accounts::list(conn, ctx, query.legal_entity_id))
        .await
        .map(Json)
}

async fn set(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Body(input): Body<SetPurposeAccount>,
) -> ApiResult<Json<PurposeAccountRow>> {
    state
        .write(ctx, move |conn, ctx| purpose_accounts::set(conn, ctx, &input))
        .await
        .map(Json)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::http::tests::test_app;

    #[tokio::test]
    async fn test_entity_override() {
        let t = test_app();
        let (status, row) = t
            .call(
                "PUT",
                "/api/v1/purpose-accounts",
                Some(json!({
                    "purpose": "CASH_OVER_SHORT",
                    "account_id": t.fx.expense,
                    "legal_entity_id": t.fx.le_id,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(row["account_code"], "5000");

        let (_, rows) = t
            .call("GET", &format!("/api/v1/purpose-accounts?legal_entity_id={}", t.fx.le_id), None)
            .await;
        let over_short: Vec<_> = rows
            .as_array()
            .unwrap()
            .iter()
            .filter(|r| r["purpose"] == "CASH_OVER_SHORT")
            .collect();
        assert!(over_short.iter().any(|r| r["legal_entity_id"] == t.fx.le_id));
    }

    #[tokio::test]
    async fn test_inactive_account_cannot_be_mapped() {
        let t = test_app();
        let (status, _) = t
            .call(
                "PUT",
                "/api/v1/purpose-accounts",
                Some(json!({ "purpose": "RETAINED_EARNINGS", "account_id": t.fx.inactive })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
