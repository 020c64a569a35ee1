use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::approvals::{self, ApprovalFilter, ApprovalRequest, Decided, DecisionInput};
use crate::http::extract::{Ctx, Id, OptionalBody, Params};
use crate::http::{ApiResult, AppState};
use crate::query::Page;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/approvals", get(list))
        .route("/approvals/:id/approve", post(approve))
        .route("/approvals/:id/reject", post(reject))
}

async fn list(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Params(filter): Params<ApprovalFilter>,
    Params(page): Params<Page>,
) -> ApiResult<Json<Vec<ApprovalRequest>>> {
    state
        .read(ctx, move |conn, ctx| approvals::list(conn, ctx, &filter, page))
        .await
        .map(Json)
}

async fn approve(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(id): Id<i64>,
    OptionalBody(input): OptionalBody<DecisionInput>,
) -> ApiResult<Json<Decided>> {
    state
        .write(ctx, move |conn, ctx| approvals::decide(conn, ctx, id, true, &input))
        .await
        .map(Json)
}

async fn reject(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(id): Id<i64>,
    OptionalBody(input): OptionalBody<DecisionInput>,
) -> ApiResult<Json<Decided>> {
    state
        .write(ctx, move |conn, ctx| approvals::decide(conn, ctx, id, false, &input))
        .await
        .map(Json)
}
