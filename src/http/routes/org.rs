use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use super::created;
use crate::http::extract::{Body, Ctx, Id, Params};
use crate::http::{ApiResult, AppState};
use crate::models::{Book, Chart, LegalEntity, OperatingUnit};
use crate::org::{self, NewBook, NewChart, NewLegalEntity, NewOperatingUnit};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/legal-entities", get(list_legal_entities).post(create_legal_entity))
        .route("/legal-entities/:id/operating-units", post(create_operating_unit))
        .route("/charts", get(list_charts).post(create_chart))
        .route("/books", get(list_books).post(create_book))
}

async fn list_legal_entities(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
) -> ApiResult<Json<Vec<LegalEntity>>> {
    state.read(ctx, |conn, ctx| org::list_legal_entities(conn, ctx)).await.map(Json)
}

async fn create_legal_entity(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Body(input): Body<NewLegalEntity>,
) -> ApiResult<(StatusCode, Json<LegalEntity>)> {
    state
        .write(ctx, move |conn, ctx| org::create_legal_entity(conn, ctx, &input))
        .await
        .map(created)
}

async fn create_operating_unit(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Id(legal_entity_id): Id<i64>,
    Body(input): Body<NewOperatingUnit>,
) -> ApiResult<(StatusCode, Json<OperatingUnit>)> {
    state
        .write(ctx, move |conn, ctx| org::create_operating_unit(conn, ctx, legal_entity_id, &input))
        .await
        .map(created)
}

async fn list_charts(State(state): State<AppState>, Ctx(ctx): Ctx) -> ApiResult<Json<Vec<Chart>>> {
    state.read(ctx, |conn, ctx| org::list_charts(conn, ctx)).await.map(Json)
}

async fn create_chart(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Body(input): Body<NewChart>,
) -> ApiResult<(StatusCode, Json<Chart>)> {
    state
        .write(ctx, move |conn, ctx| org::create_chart(conn, ctx, &input))
        .await
        .map(created)
}

#[derive(Deserialize)]
struct BookQuery {
    legal_entity_id: Option<i64>,
}

async fn list_books(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Params(query): Params<BookQuery>,
) -> ApiResult<Json<Vec<Book>>> {
    state
        .read(ctx, move |conn, ctx| org::list_books(conn, ctx, query.legal_entity_id))
        .await
        .map(Json)
}

async fn create_book(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Body(input): Body<NewBook>,
) -> ApiResult<(StatusCode, Json<Book>)> {
    state
        .write(ctx, move |conn, ctx| org::create_book(conn, ctx, &input))
        .await
        .map(created)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::http::tests::test_app;

    #[tokio::test]
    async fn test_create_entity_unit_and_book() {
        let t = test_app();
        let (status, entity) = t
            .call(
                "POST",
                "/api/v1/legal-entities",
                Some(json!({ "code": "EU", "name": "Acme Europe", "base_currency": "EUR" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let le = entity["id"].as_i64().unwrap();

        let (status, unit) = t
            .call(
                "POST",
                &format!("/api/v1/legal-entities/{le}/operating-units"),
                Some(json!({ "code": "BER", "name": "Berlin" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(unit["legal_entity_id"], le);

        let (status, _) = t
            .call(
                "POST",
                "/api/v1/books",
                Some(json!({
                    "legal_entity_id": le,
                    "calendar_id": t.fx.calendar_id,
                    "code": "EU-LOCAL",
                    "name": "EU local book",
                    "book_type": "LOCAL",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let (_, books) = t.call("GET", &format!("/api/v1/books?legal_entity_id={le}"), None).await;
        assert_eq!(books.as_array().unwrap().len(), 1);
        assert_eq!(books[0]["base_currency"], "EUR");
    }

    #[tokio::test]
    async fn test_duplicate_entity_code_conflicts() {
        let t = test_app();
        let (status, body) = t
            .call(
                "POST",
                "/api/v1/legal-entities",
                Some(json!({ "code": "HQ", "name": "Again", "base_currency": "USD" })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "CONFLICT");
    }
}
