use axum::extract::{MatchedPath, Request};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;

use super::error::{render, ErrorReport};

pub(crate) const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request id for the current request, available to extractors.
#[derive(Debug, Clone)]
pub(crate) struct RequestId(pub String);

/// The `http.request` span, so route-level middleware can fill in fields.
#[derive(Debug, Clone)]
pub(crate) struct RequestSpan(pub tracing::Span);

fn incoming_request_id(request: &Request) -> Option<String> {
    request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
}

/// Assign the request id, run the request inside an `http.request` span, and
/// render error envelopes with that id.
pub(crate) async fn request_context(mut request: Request, next: Next) -> Response {
    let request_id = incoming_request_id(&request)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let method = request.method().to_string();
    let span = tracing::info_span!(
        "http.request",
        request_id = %request_id,
        method = %method,
        route = tracing::field::Empty,
    );
    request.extensions_mut().insert(RequestId(request_id.clone()));
    request.extensions_mut().insert(RequestSpan(span.clone()));

    let mut response = next.run(request).instrument(span).await;
    if let Some(report) = response.extensions_mut().remove::<ErrorReport>() {
        response = render(report, &request_id);
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Route-level layer: records the matched route template (ids elided) on the
/// request span. Only route layers see `MatchedPath`.
pub(crate) async fn record_route(request: Request, next: Next) -> Response {
    if let (Some(path), Some(RequestSpan(span))) = (
        request.extensions().get::<MatchedPath>(),
        request.extensions().get::<RequestSpan>(),
    ) {
        span.record("route", path.as_str());
    }
    next.run(request).await
}
