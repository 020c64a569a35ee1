use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use zeroize::Zeroize;

use crate::auth::{self, SESSION_COOKIE};
use crate::http::extract::{session_token, Body, Ctx};
use crate::http::{ApiResult, AppState};
use crate::scope::RequestContext;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/me", get(me))
}

#[derive(Deserialize)]
struct LoginInput {
    email: String,
    password: String,
}

fn session_cookie(value: &str, max_age_secs: i64) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}={value}; HttpOnly; SameSite=Lax; Path=/; Max-Age={max_age_secs}"
    ))
    .ok()
}

async fn login(
    State(state): State<AppState>,
    Body(input): Body<LoginInput>,
) -> ApiResult<Response> {
    let ttl = state.session_ttl_hours();
    let LoginInput { email, mut password } = input;
    let result = state
        .unauthenticated(move |conn| {
            let result = auth::login(conn, &email, &password, ttl);
            password.zeroize();
            result
        })
        .await?;
    let mut response = Json(&result).into_response();
    if let Some(cookie) = session_cookie(&result.token, ttl * 3600) {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    Ok(response)
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    if let Some(token) = session_token(&headers) {
        state.unauthenticated(move |conn| auth::logout(conn, &token)).await?;
    }
    let mut response = StatusCode::NO_CONTENT.into_response();
    if let Some(cookie) = session_cookie("", 0) {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    Ok(response)
}

async fn me(Ctx(ctx): Ctx) -> Json<RequestContext> {
    Json(ctx)
}
