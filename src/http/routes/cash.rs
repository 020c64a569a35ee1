use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use super::{created, created_unless};
use crate::cash::{
    self, CashRegister, CashSession, CashTransaction, CashTxnFilter, CashTxnView, CloseSession,
    NewCashTransaction, NewRegister, OpenSession, PostedCash, ReverseCash, Submitted,
};
use crate::http::extract::{Body, Ctx, Id, OptionalBody, Params};
use crate::http::{ApiResult, AppState};
use crate::query::Page;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/cash/registers", get(list_registers).post(create_register))
        .route("/cash/registers/:id/sessions", post(open_session))
        .route("/cash/sessions/:id/close", post(close_session))
        .route("/cash/transactions", get(list_transactions).post(create_transaction))
        .route("/cash/transactions/:id", get(show_transaction))
        .route("/cash/transactions/:id/submit", post(submit))
        .route("/cash/transactions/:id/post", post(post_transaction))
        .route("/cash/transactions/:id/cancel", post(cancel))
        .route("/cash/transactions/:id/reverse", post(reverse))
}

#[derive(Deserialize)]
struct RegisterQuery {
    legal_entity_id: Option<i64>,
}

async fn list_registers(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Params(query): Params<RegisterQuery>,
) -> ApiResult<Json<Vec<CashRegister>>> {
    state
        .read(ctx, move |conn, ctx| cash::list_registers(conn, ctx, query.legal_entity_id))
        .await
        .map(Json)
}

async fn create_register(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Body(input): Body<NewRegister>,
) -> ApiResult<(StatusCode, Json<CashRegister>)> {
    state
        .write(ctx, move |conn, ctx| cash::create_register(conn, ctx, &input))
        .await
        .map(created)
}

async fn open_session(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(register_id): Id<i64>,
    OptionalBody(input): OptionalBody<OpenSession>,
) -> ApiResult<(StatusCode, Json<CashSession>)> {
    state
        .write(ctx, move |conn, ctx| cash::open_session(conn, ctx, register_id, &input))
        .await
        .map(created)
}

async fn close_session(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(session_id): Id<i64>,
    Body(input): Body<CloseSession>,
) -> ApiResult<Json<CashSession>> {
    state
        .write(ctx, move |conn, ctx| cash::close_session(conn, ctx, session_id, &input))
        .await
        .map(Json)
}

async fn list_transactions(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Params(filter): Params<CashTxnFilter>,
    Params(page): Params<Page>,
) -> ApiResult<Json<Vec<CashTransaction>>> {
    state
        .read(ctx, move |conn, ctx| cash::list_transactions(conn, ctx, &filter, page))
        .await
        .map(Json)
}

async fn create_transaction(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Body(input): Body<NewCashTransaction>,
) -> ApiResult<(StatusCode, Json<CashTxnView>)> {
    let view = state
        .write(ctx, move |conn, ctx| cash::create_transaction(conn, ctx, &input))
        .await?;
    Ok((created_unless(view.idempotent_replay), Json(view)))
}

async fn show_transaction(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(id): Id<i64>,
) -> ApiResult<Json<CashTransaction>> {
    state.read(ctx, move |conn, ctx| cash::get_transaction(conn, ctx, id)).await.map(Json)
}

async fn submit(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(id): Id<i64>,
) -> ApiResult<Json<Submitted>> {
    state.write(ctx, move |conn, ctx| cash::submit(conn, ctx, id)).await.map(Json)
}

async fn post_transaction(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(id): Id<i64>,
) -> ApiResult<Json<PostedCash>> {
    state.write(ctx, move |conn, ctx| cash::post(conn, ctx, id)).await.map(Json)
}

async fn cancel(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(id): Id<i64>,
) -> ApiResult<Json<CashTransaction>> {
    state.write(ctx, move |conn, ctx| cash::cancel(conn, ctx, id)).await.map(Json)
}

async fn reverse(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(id): Id<i64>,
    OptionalBody(input): OptionalBody<ReverseCash>,
) -> ApiResult<Json<CashTransaction>> {
    state
        .write(ctx, move |conn, ctx| cash::reverse(conn, ctx, id, &input))
        .await
        .map(Json)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::http::tests::{test_app, TestApp};

    async fn register(t: &TestApp, requires_approval: bool) -> i64 {
        let (status, body) = t
            .call(
                "POST",
                "/api/v1/cash/registers",
                Some(json!({
                    "legal_entity_id": t.fx.le_id,
                    "operating_unit_id": t.fx.ou_id,
                    "book_id": t.fx.book_id,
                    "code": "TILL1",
                    "name": "Front till",
                    "account_id": t.fx.petty_cash,
                    "requires_approval": requires_approval,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_i64().unwrap()
    }

    fn receipt(t: &TestApp, register_id: i64, key: &str) -> Value {
        json!({
            "register_id": register_id,
            "txn_type": "RECEIPT",
            "txn_date": "2025-03-10",
            "amount": 40.0,
            "counter_account_id": t.fx.revenue,
            "idempotency_key": key,
        })
    }

    #[tokio::test]
    async fn test_direct_post_without_approval() {
        let t = test_app();
        let register_id = register(&t, false).await;
        let (status, created) = t
            .call("POST", "/api/v1/cash/transactions", Some(receipt(&t, register_id, "r-1")))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["idempotent_replay"], false);

        let (status, replay) = t
            .call("POST", "/api/v1/cash/transactions", Some(receipt(&t, register_id, "r-1")))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(replay["idempotent_replay"], true);
        assert_eq!(replay["id"], created["id"]);

        let id = created["id"].as_i64().unwrap();
        let (status, posted) = t
            .call("POST", &format!("/api/v1/cash/transactions/{id}/post"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(posted["transaction"]["status"], "POSTED");
        assert_eq!(posted["journal"]["source_type"], "CASH");

        let (status, reversed) = t
            .call(
                "POST",
                &format!("/api/v1/cash/transactions/{id}/reverse"),
                Some(json!({ "entry_date": "2025-03-11" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reversed["status"], "REVERSED");
    }

    #[tokio::test]
    async fn test_maker_checker_through_approvals() {
        let t = test_app();
        let register_id = register(&t, true).await;
        let (_, created) = t
            .call("POST", "/api/v1/cash/transactions", Some(receipt(&t, register_id, "r-2")))
            .await;
        let id = created["id"].as_i64().unwrap();

        let (status, body) = t
            .call("POST", &format!("/api/v1/cash/transactions/{id}/post"), None)
            .await;
        assert_eq!(status, StatusCode::CONFLICT, "{body}");

        let (status, submitted) = t.call(
            "POST",
            &format!("/api/v1/cash/transactions/{id}/submit"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let approval = submitted["approval_request_id"].as_i64().unwrap();

        let (status, body) = t
            .call("POST", &format!("/api/v1/approvals/{approval}/approve"), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "FORBIDDEN");

        let (_, pending) = t.call("GET", "/api/v1/approvals?status=PENDING", None).await;
        assert_eq!(pending.as_array().unwrap().len(), 1);

        let (status, cancelled) = t.call(
            "POST",
            &format!("/api/v1/cash/transactions/{id}/cancel"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "CANCELLED");
        let (_, pending) = t.call("GET", "/api/v1/approvals?status=PENDING", None).await;
        assert!(pending.as_array().unwrap().is_empty());
    }
}
