use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use super::created_unless;
use crate::http::extract::{Body, Ctx, Id, Params};
use crate::http::{ApiResult, AppState};
use crate::query::Page;
use crate::settlement::{self, NewSettlement, SettlementBatch, SettlementFilter, SettlementView};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/settlements", get(list).post(create))
        .route("/settlements/:id", get(show))
}

async fn list(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Params(filter): Params<SettlementFilter>,
    Params(page): Params<Page>,
) -> ApiResult<Json<Vec<SettlementBatch>>> {
    state
        .read(ctx, move |conn, ctx| settlement::list(conn, ctx, &filter, page))
        .await
        .map(Json)
}

async fn create(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Body(input): Body<NewSettlement>,
) -> ApiResult<(StatusCode, Json<SettlementView>)> {
    let view = state
        .write(ctx, move |conn, ctx| settlement::create(conn, ctx, &input))
        .await?;
    Ok((created_unless(view.idempotent_replay), Json(view)))
}

async fn show(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(id): Id<i64>,
) -> ApiResult<Json<SettlementBatch>> {
    state.read(ctx, move |conn, ctx| settlement::get(conn, ctx, id)).await.map(Json)
}
