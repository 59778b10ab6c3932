//! Read-only HTTP API over the files written by the sync.
//!
//! | Route | File |
//! |-------|------|
//! | `GET /magazine/list` | `{api_dir}/magazinesList` |
//! | `GET /magazine/{id}` | `{api_dir}/magazines/content-{id}` |
//!
//! Files are served verbatim. A file that has not been written yet is a
//! `404` with an empty JSON object as body.

use crate::error::Result;
use crate::store::ApiStore;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, instrument};

fn serve_file(result: Result<Option<String>>) -> Response {
    match result {
        Ok(Some(body)) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({}))).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to read API file");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))).into_response()
        }
    }
}

async fn magazine_list(State(api): State<ApiStore>) -> Response {
    serve_file(api.read_magazine_list().await)
}

async fn magazine_content(State(api): State<ApiStore>, Path(id): Path<String>) -> Response {
    if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
        return (StatusCode::BAD_REQUEST, Json(json!({}))).into_response();
    }
    serve_file(api.read_magazine_content(&id).await)
}

/// The API routes, with permissive CORS and request tracing.
pub fn router(api: ApiStore) -> Router {
    Router::new()
        .route("/magazine/list", get(magazine_list))
        .route("/magazine/{id}", get(magazine_content))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(api)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
    }
    info!("Received Ctrl-C; shutting down");
}

/// Serve the API on `addr` until Ctrl-C.
#[instrument(level = "info", skip(api))]
pub async fn serve(api: ApiStore, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Server is running");
    axum::serve(listener, router(api))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped");
    Ok(())
}
