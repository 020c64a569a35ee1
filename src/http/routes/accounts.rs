use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use super::created;
use crate::accounts::{self, AccountFilter, AccountPatch, NewAccount};
use crate::http::extract::{Body, Ctx, Id, Params};
use crate::http::{ApiResult, AppState};
use crate::models::Account;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/accounts", get(list).post(create))
        .route("/accounts/:id", get(show).patch(update))
}

async fn list(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Params(filter): Params<AccountFilter>,
) -> ApiResult<Json<Vec<Account>>> {
    state.read(ctx, move |conn, ctx| accounts::list(conn, ctx, &filter)).await.map(Json)
}

async fn create(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Body(input): Body<NewAccount>,
) -> ApiResult<(StatusCode, Json<Account>)> {
    state
        .write(ctx, move |conn, ctx| accounts::create(conn, ctx, &input))
        .await
        .map(created)
}

async fn show(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(id): Id<i64>,
) -> ApiResult<Json<Account>> {
    state.read(ctx, move |conn, ctx| accounts::get(conn, ctx, id)).await.map(Json)
}

async fn update(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(id): Id<i64>,
    Body(patch): Body<AccountPatch>,
) -> ApiResult<Json<Account>> {
    state
        .write(ctx, move |conn, ctx| accounts::update(conn, ctx, id, &patch))
        .await
        .map(Json)
}
