//! HTTP Front End (§4.G): route table, auth middleware, and handlers. This
//! is the only layer allowed to translate internal [`GatewayError`]s into
//! HTTP status codes (§7).

pub mod auth;
pub mod handlers;
pub mod sse;

use crate::capability::CapabilityReport;
use crate::catalogue::Catalogue;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::router::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The single gateway context value threaded through every handler (§9
/// "one context value, not a web of singletons").
pub struct GatewayContext {
    pub catalogue: RwLock<Catalogue>,
    pub router: Router,
    pub config: GatewayConfig,
    pub capabilities: CapabilityReport,
    pub log_path: std::path::PathBuf,
    pub started_at: std::time::Instant,
}

pub type SharedContext = Arc<GatewayContext>;

#[derive(Serialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    pub processor: String,
    pub os_version: String,
}

impl GatewayError {
    pub fn into_response_with(self, ctx: &GatewayContext) -> Response {
        let model_name = match &self {
            GatewayError::ModelNotFound { model_name, .. }
            | GatewayError::ModelNotLoaded { model_name }
            | GatewayError::ModelInvalidated { model_name, .. }
            | GatewayError::UnsupportedOperation { model_name, .. }
            | GatewayError::BackendStartupFailed { model_name, .. } => Some(model_name.clone()),
            _ => None,
        };
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error_type: self.type_tag(),
            message: self.message(),
            model_name,
            processor: ctx.capabilities.cpu_name.clone(),
            os_version: ctx.capabilities.os_version.clone(),
        };
        (status, Json(body)).into_response()
    }
}

/// Builds the route table, mounted identically under four prefixes (§4.G).
pub fn build_router(ctx: SharedContext) -> axum::Router {
    let api = axum::Router::new()
        .route("/health", get(handlers::health))
        .route("/live", get(handlers::live))
        .route("/models", get(handlers::list_models))
        .route("/models/:id", get(handlers::get_model))
        .route("/stats", get(handlers::stats))
        .route("/system-info", get(handlers::system_info))
        .route("/system-stats", get(handlers::system_stats))
        .route("/logs/stream", get(handlers::logs_stream))
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/completions", post(handlers::completions))
        .route("/embeddings", post(handlers::embeddings))
        .route("/reranking", post(handlers::reranking))
        .route("/responses", post(handlers::responses))
        .route("/audio/transcriptions", post(handlers::audio_transcriptions))
        .route("/audio/speech", post(handlers::audio_speech))
        .route("/images/generations", post(handlers::images_generations))
        .route("/pull", post(handlers::pull))
        .route("/load", post(handlers::load))
        .route("/unload", post(handlers::unload))
        .route("/delete", post(handlers::delete))
        .route("/params", post(handlers::params))
        .route("/log-level", post(handlers::log_level))
        .layer(axum::middleware::from_fn_with_state(ctx.clone(), auth::require_bearer_token));

    axum::Router::new()
        .nest("/api/v0", api.clone())
        .nest("/api/v1", api.clone())
        .nest("/v0", api.clone())
        .nest("/v1", api)
        .route("/internal/shutdown", post(handlers::shutdown))
        .fallback(handlers::not_found)
        .with_state(ctx)
}

pub async fn serve(ctx: SharedContext) -> anyhow::Result<()> {
    let addr = format!("{}:{}", ctx.config.host, ctx.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "gateway listening");
    let app = build_router(ctx.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(ctx))
        .await?;
    Ok(())
}

async fn shutdown_signal(ctx: SharedContext) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let mut sig = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sig.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, evicting all loaded backends");
    ctx.router.shutdown().await;
}
