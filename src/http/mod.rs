//! JSON API under `/api/v1`.
//!
//! Each request opens its own SQLite connection on a blocking worker thread.
//! Mutations run inside one `BEGIN IMMEDIATE` transaction; reads use a plain
//! connection.

pub mod error;
mod extract;
mod middleware;
mod routes;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use rusqlite::Connection;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::db::{get_connection, in_transaction};
use crate::error::AppError;
use crate::scope::RequestContext;
use crate::settings::Settings;

pub use error::ApiError;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    db_path: PathBuf,
    session_ttl_hours: i64,
}

impl AppState {
    pub fn new(db_path: PathBuf, settings: &Settings) -> Self {
        Self {
            inner: Arc::new(Inner {
                db_path,
                session_ttl_hours: settings.session_ttl_hours,
            }),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.inner.db_path
    }

    pub fn session_ttl_hours(&self) -> i64 {
        self.inner.session_ttl_hours
    }

    async fn blocking<T, F>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce(&Path) -> crate::error::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.inner.db_path.clone();
        tokio::task::spawn_blocking(move || f(&path))
            .await
            .map_err(|e| ApiError::from(AppError::Internal(format!("worker task failed: {e}"))))?
            .map_err(ApiError::from)
    }

    /// Run `f` against a fresh connection without a transaction.
    pub async fn read<T, F>(&self, ctx: RequestContext, f: F) -> ApiResult<T>
    where
        F: FnOnce(&Connection, &RequestContext) -> crate::error::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.blocking(move |path| {
            let conn = get_connection(path)?;
            f(&conn, &ctx)
        })
        .await
    }

    /// Run `f` inside one `BEGIN IMMEDIATE` transaction; any error rolls back.
    pub async fn write<T, F>(&self, ctx: RequestContext, f: F) -> ApiResult<T>
    where
        F: FnOnce(&Connection, &RequestContext) -> crate::error::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.blocking(move |path| {
            let mut conn = get_connection(path)?;
            in_transaction(&mut conn, |tx| f(tx, &ctx))
        })
        .await
    }

    /// Connection-level work that runs before a request context exists
    /// (login, session resolution, health).
    pub async fn unauthenticated<T, F>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce(&Connection) -> crate::error::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.blocking(move |path| {
            let conn = get_connection(path)?;
            f(&conn)
        })
        .await
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(routes::health::router())
        .nest("/api/v1", routes::api())
        .route_layer(axum::middleware::from_fn(middleware::record_route))
        .fallback(routes::not_found)
        .layer(CatchPanicLayer::custom(error::panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(middleware::request_context))
        .with_state(state)
}

pub async fn serve(settings: &Settings) -> anyhow::Result<()> {
    let db_path = settings.db_path();
    if !db_path.exists() {
        anyhow::bail!(
            "No database at {}. Run `backoffice init` first.",
            db_path.display()
        );
    }
    let app = router(AppState::new(db_path, settings));
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    tracing::info!(addr = %settings.bind_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
