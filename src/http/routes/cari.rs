use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use super::{created, created_unless};
use crate::cari::{
    self, BootstrapResult, CariDocument, Counterparty, CounterpartyFilter, DocumentFilter,
    DocumentView, NewCounterparty, NewDocument, NewPaymentTerm, OpenItem, OpenItemFilter,
    PaymentTerm, PostedDocument,
};
use crate::http::extract::{Body, Ctx, Id, Params};
use crate::http::{ApiResult, AppState};
use crate::query::Page;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/payment-terms", get(list_terms).post(create_term))
        .route("/payment-terms/bootstrap", post(bootstrap_terms))
        .route("/counterparties", get(list_counterparties).post(create_counterparty))
        .route("/counterparties/:id", get(show_counterparty))
        .route("/cari/documents", get(list_documents).post(create_document))
        .route("/cari/documents/:id/post", post(post_document))
        .route("/cari/open-items", get(list_open_items))
}

async fn list_terms(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
) -> ApiResult<Json<Vec<PaymentTerm>>> {
    state.read(ctx, |conn, ctx| cari::list_payment_terms(conn, ctx)).await.map(Json)
}

async fn create_term(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Body(input): Body<NewPaymentTerm>,
) -> ApiResult<(StatusCode, Json<PaymentTerm>)> {
    state
        .write(ctx, move |conn, ctx| cari::create_payment_term(conn, ctx, &input))
        .await
        .map(created)
}

async fn bootstrap_terms(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
) -> ApiResult<Json<BootstrapResult>> {
    state.write(ctx, |conn, ctx| cari::bootstrap_payment_terms(conn, ctx)).await.map(Json)
}

async fn list_counterparties(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Params(filter): Params<CounterpartyFilter>,
    Params(page): Params<Page>,
) -> ApiResult<Json<Vec<Counterparty>>> {
    state
        .read(ctx, move |conn, ctx| cari::list_counterparties(conn, ctx, &filter, page))
        .await
        .map(Json)
}

async fn create_counterparty(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Body(input): Body<NewCounterparty>,
) -> ApiResult<(StatusCode, Json<Counterparty>)> {
    state
        .write(ctx, move |conn, ctx| cari::create_counterparty(conn, ctx, &input))
        .await
        .map(created)
}

async fn show_counterparty(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(id): Id<i64>,
) -> ApiResult<Json<Counterparty>> {
    state.read(ctx, move |conn, ctx| cari::get_counterparty(conn, ctx, id)).await.map(Json)
}

async fn list_documents(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Params(filter): Params<DocumentFilter>,
    Params(page): Params<Page>,
) -> ApiResult<Json<Vec<CariDocument>>> {
    state
        .read(ctx, move |conn, ctx| cari::list_documents(conn, ctx, &filter, page))
        .await
        .map(Json)
}

async fn create_document(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Body(input): Body<NewDocument>,
) -> ApiResult<(StatusCode, Json<DocumentView>)> {
    let view = state
        .write(ctx, move |conn, ctx| cari::create_document(conn, ctx, &input))
        .await?;
    Ok((created_unless(view.idempotent_replay), Json(view)))
}

async fn post_document(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(id): Id<i64>,
) -> ApiResult<Json<PostedDocument>> {
    state.write(ctx, move |conn, ctx| cari::post_document(conn, ctx, id)).await.map(Json)
}

async fn list_open_items(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Params(filter): Params<OpenItemFilter>,
    Params(page): Params<Page>,
) -> ApiResult<Json<Vec<OpenItem>>> {
    state
        .read(ctx, move |conn, ctx| cari::list_open_items(conn, ctx, &filter, page))
        .await
        .map(Json)
}
