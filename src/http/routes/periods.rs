use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use super::created;
use crate::http::extract::{Body, Ctx, Id};
use crate::http::{ApiResult, AppState};
use crate::models::{FiscalCalendar, FiscalPeriod};
use crate::period_close::{self, CloseRequest, CloseResult, CloseRun, ReopenRequest, ReopenResult};
use crate::periods::{self, GeneratePeriods, GenerateResult, NewCalendar, PeriodStatusView};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/calendars", get(list_calendars).post(create_calendar))
        .route("/calendars/:id/generate", post(generate))
        .route("/calendars/:id/periods", get(list_periods))
        .route("/books/:book_id/periods/:period_id/status", get(status))
        .route("/books/:book_id/periods/:period_id/close", post(close))
        .route("/books/:book_id/periods/:period_id/reopen", post(reopen))
        .route("/books/:book_id/periods/:period_id/close-runs", get(close_runs))
}

async fn list_calendars(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
) -> ApiResult<Json<Vec<FiscalCalendar>>> {
    state.read(ctx, |conn, ctx| periods::list_calendars(conn, ctx)).await.map(Json)
}

async fn create_calendar(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Body(input): Body<NewCalendar>,
) -> ApiResult<(StatusCode, Json<FiscalCalendar>)> {
    state
        .write(ctx, move |conn, ctx| periods::create_calendar(conn, ctx, &input))
        .await
        .map(created)
}

async fn generate(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(calendar_id): Id<i64>,
    Body(input): Body<GeneratePeriods>,
) -> ApiResult<Json<GenerateResult>> {
    state
        .write(ctx, move |conn, ctx| periods::generate_periods(conn, ctx, calendar_id, &input))
        .await
        .map(Json)
}

async fn list_periods(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(calendar_id): Id<i64>,
) -> ApiResult<Json<Vec<FiscalPeriod>>> {
    state
        .read(ctx, move |conn, ctx| periods::list_periods(conn, ctx, calendar_id))
        .await
        .map(Json)
}

async fn status(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id((book_id, period_id)): Id<(i64, i64)>,
) -> ApiResult<Json<PeriodStatusView>> {
    state
        .read(ctx, move |conn, ctx| periods::status_view(conn, ctx, book_id, period_id))
        .await
        .map(Json)
}

async fn close(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id((book_id, period_id)): Id<(i64, i64)>,
    Body(request): Body<CloseRequest>,
) -> ApiResult<Json<CloseResult>> {
    state
        .write(ctx, move |conn, ctx| period_close::close(conn, ctx, book_id, period_id, &request))
        .await
        .map(Json)
}

async fn reopen(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id((book_id, period_id)): Id<(i64, i64)>,
    Body(request): Body<ReopenRequest>,
) -> ApiResult<Json<ReopenResult>> {
    state
        .write(ctx, move |conn, ctx| period_close::reopen(conn, ctx, book_id, period_id, &request))
        .await
        .map(Json)
}

async fn close_runs(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id((book_id, period_id)): Id<(i64, i64)>,
) -> ApiResult<Json<Vec<CloseRun>>> {
    state
        .read(ctx, move |conn, ctx| period_close::list_runs(conn, ctx, book_id, period_id))
        .await
        .map(Json)
}
