//! HTTP surface.
//!
//! - `PUT /doxygen` (and `POST`): the documentation pipeline
//! - `GET /health`: liveness
//! - `/api/*`: content surface; `GET` serves the content root when static
//!   access is enabled, `PUT` is not authorized yet

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put, MethodRouter},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{ContentConfig, ServiceConfig};
use crate::contract::Generator;
use crate::generator::CommandGenerator;
use crate::pipeline::{Pipeline, ARCHIVE_MEDIA_TYPE};

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(config: &ServiceConfig, generator: Arc<dyn Generator>) -> Self {
        Self {
            pipeline: Arc::new(Pipeline::new(config, generator)),
        }
    }

    /// State wired to the external generator described in `config`.
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(
            config,
            Arc::new(CommandGenerator::from_config(&config.generator)),
        )
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Run the pipeline on an uploaded `.tar.gz` and answer with the HTML tarball.
pub async fn generate_docs(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    if let Err(e) = Pipeline::validate(content_type) {
        warn!(error = %e, "Error bad headers");
        return e.status().into_response();
    }
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(error = %rejection, "Failed to read request body");
            return rejection.status().into_response();
        }
    };

    match state.pipeline.run(content_type, body).await {
        Ok(archive) => {
            (StatusCode::OK, [(CONTENT_TYPE, ARCHIVE_MEDIA_TYPE)], archive).into_response()
        }
        Err(e) => e.status().into_response(),
    }
}

/// Uploads to the content surface are not authorized.
pub async fn put_content() -> StatusCode {
    StatusCode::UNAUTHORIZED
}

fn content_service(config: &ContentConfig) -> MethodRouter {
    let router = put(put_content);
    match &config.root {
        Some(root) if config.static_access => {
            info!(root = %root.display(), "Serving content root");
            router.get_service(ServeDir::new(root))
        }
        _ => router,
    }
}

/// Build the router with all endpoints.
pub fn build_router(state: AppState, config: &ServiceConfig) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/doxygen", put(generate_docs).post(generate_docs))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .nest_service("/api", content_service(&config.content))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `router` on an already bound listener.
pub async fn serve(listener: tokio::net::TcpListener, router: Router) -> std::io::Result<()> {
    axum::serve(listener, router).await
}

/// Bind `config.listen_addr` and serve until the process stops.
pub async fn start_server(config: &ServiceConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(config);
    let router = build_router(state, config);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %listener.local_addr()?, "Starting doxygen service");
    serve(listener, router).await?;
    Ok(())
}
