use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use super::created;
use crate::http::extract::{Body, Ctx, Id, OptionalBody, Params};
use crate::http::{ApiResult, AppState};
use crate::journal::{self, CreatedJournal, JournalFilter, NewJournal};
use crate::models::{JournalDetail, JournalEntry};
use crate::posting::{self, PostOptions, PostResult, ReverseOptions, ReverseResult};
use crate::query::Page;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/journals", get(list).post(create))
        .route("/journals/:id", get(show))
        .route("/journals/:id/post", post(post_journal))
        .route("/journals/:id/reverse", post(reverse))
}

async fn list(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Params(filter): Params<JournalFilter>,
    Params(page): Params<Page>,
) -> ApiResult<Json<Vec<JournalEntry>>> {
    state
        .read(ctx, move |conn, ctx| journal::list(conn, ctx, &filter, page))
        .await
        .map(Json)
}

async fn create(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Body(input): Body<NewJournal>,
) -> ApiResult<(StatusCode, Json<CreatedJournal>)> {
    state
        .write(ctx, move |conn, ctx| journal::create(conn, ctx, &input))
        .await
        .map(created)
}

async fn show(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(id): Id<i64>,
) -> ApiResult<Json<JournalDetail>> {
    state.read(ctx, move |conn, ctx| journal::get(conn, ctx, id)).await.map(Json)
}

async fn post_journal(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(id): Id<i64>,
    OptionalBody(options): OptionalBody<PostOptions>,
) -> ApiResult<Json<PostResult>> {
    state
        .write(ctx, move |conn, ctx| posting::post(conn, ctx, id, &options))
        .await
        .map(Json)
}

async fn reverse(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(id): Id<i64>,
    OptionalBody(options): OptionalBody<ReverseOptions>,
) -> ApiResult<(StatusCode, Json<ReverseResult>)> {
    state
        .write(ctx, move |conn, ctx| posting::reverse(conn, ctx, id, &options))
        .await
        .map(created)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::http::tests::{test_app, TestApp};

    fn cash_sale(t: &TestApp, source_type: &str) -> Value {
        json!({
            "legal_entity_id": t.fx.le_id,
            "book_id": t.fx.book_id,
            "entry_date": "2025-03-15",
            "source_type": source_type,
            "lines": [
                { "account_id": t.fx.cash, "debit_base": 100.0 },
                { "account_id": t.fx.revenue, "credit_base": 100.0 },
            ],
        })
    }

    #[tokio::test]
    async fn test_create_post_reverse() {
        let t = test_app();
        let (status, created) = t
            .call("POST", "/api/v1/journals", Some(cash_sale(&t, "MANUAL")))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["journal"]["status"], "DRAFT");
        let id = created["journal"]["id"].as_i64().unwrap();

        let (status, posted) = t.call("POST", &format!("/api/v1/journals/{id}/post"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(posted["journal"]["status"], "POSTED");

        let (status, reversed) = t
            .call(
                "POST",
                &format!("/api/v1/journals/{id}/reverse"),
                Some(json!({ "entry_date": "2025-03-20", "auto_post": true })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(reversed["original"]["status"], "REVERSED");
        let lines = reversed["reversal"]["lines"].as_array().unwrap();
        let cash_line = lines.iter().find(|l| l["account_id"] == t.fx.cash).unwrap();
        assert_eq!(cash_line["credit_base"], 100.0);

        let (status, body) = t.call("POST", &format!("/api/v1/journals/{id}/reverse"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "CONFLICT");

        let (_, listed) = t.call("GET", "/api/v1/journals?status=POSTED", None).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cash_source_is_reserved() {
        let t = test_app();
        let (status, body) = t.call("POST", "/api/v1/journals", Some(cash_sale(&t, "CASH"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("reserved"));
    }

    #[tokio::test]
    async fn test_unbalanced_lines_are_rejected() {
        let t = test_app();
        let mut input = cash_sale(&t, "MANUAL");
        input["lines"][1]["credit_base"] = json!(90.0);
        let (status, body) = t.call("POST", "/api/v1/journals", Some(input)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }
}
