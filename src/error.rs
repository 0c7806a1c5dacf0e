//! Crate-wide error taxonomy.
//!
//! Every error that crosses a component boundary is a tagged [`GatewayError`]
//! variant rather than a string. The Router's nuclear-retry classifier (see
//! `router.rs`) matches on these variants directly -- the source system used
//! message-substring matching for this, which §9 of the design calls out as
//! an accident not worth reproducing.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayError {
    #[error("{message}")]
    InvalidRequest { message: String },
    #[error("model '{model_name}' not found")]
    ModelNotFound { model_name: String, filter_reason: Option<String> },
    #[error("model '{model_name}' is not loaded")]
    ModelNotLoaded { model_name: String },
    #[error("model '{model_name}' invalidated: {message}")]
    ModelInvalidated { model_name: String, message: String },
    #[error("model '{model_name}' does not support {endpoint}")]
    UnsupportedOperation { model_name: String, endpoint: String },
    #[error("failed to install backend for recipe '{recipe}': {message}")]
    BackendInstallFailed { recipe: String, message: String },
    #[error("backend for '{model_name}' failed to start: {message}")]
    BackendStartupFailed { model_name: String, message: String, exit_code: Option<i32> },
    #[error("download of '{file}' cancelled")]
    DownloadCancelled { file: String },
    #[error("download of '{file}' failed: {message}")]
    DownloadFailed { file: String, message: String, partial_path: Option<String>, partial_bytes: Option<u64> },
    #[error("missing or invalid bearer token")]
    AuthFailed,
    #[error("{message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Human-readable message shown to the client, independent of the tag.
    pub fn message(&self) -> String {
        match self {
            GatewayError::InvalidRequest { message } => message.clone(),
            GatewayError::ModelNotFound { model_name, filter_reason } => match filter_reason {
                Some(reason) => format!("model '{model_name}' not found: {reason}"),
                None => format!("model '{model_name}' not found"),
            },
            GatewayError::ModelNotLoaded { model_name } => {
                format!("model '{model_name}' is not loaded")
            }
            GatewayError::ModelInvalidated { model_name, message } => {
                format!("model '{model_name}' invalidated: {message}")
            }
            GatewayError::UnsupportedOperation { model_name, endpoint } => {
                format!("model '{model_name}' does not support {endpoint}")
            }
            GatewayError::BackendInstallFailed { recipe, message } => {
                format!("failed to install backend for recipe '{recipe}': {message}")
            }
            GatewayError::BackendStartupFailed { model_name, message, .. } => {
                format!("backend for '{model_name}' failed to start: {message}")
            }
            GatewayError::DownloadCancelled { file } => format!("download of '{file}' cancelled"),
            GatewayError::DownloadFailed { file, message, partial_path, partial_bytes } => {
                let mut m = format!("download of '{file}' failed: {message}");
                if let (Some(p), Some(b)) = (partial_path, partial_bytes) {
                    m.push_str(&format!(" (partial file at {p}, {b} bytes; rerun to resume)"));
                }
                m
            }
            GatewayError::AuthFailed => "missing or invalid bearer token".to_string(),
            GatewayError::Internal { message } => message.clone(),
        }
    }

    /// Whether the Router should treat this as a terminal error that must
    /// not trigger the nuclear retry (§4.F step 7).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GatewayError::ModelNotFound { .. } | GatewayError::ModelInvalidated { .. }
        )
    }

    /// Tag used as the `type` field of the JSON error body (§7).
    pub fn type_tag(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest { .. } => "invalid_request",
            GatewayError::ModelNotFound { .. } => "model_not_found",
            GatewayError::ModelNotLoaded { .. } => "model_not_loaded",
            GatewayError::ModelInvalidated { .. } => "model_invalidated",
            GatewayError::UnsupportedOperation { .. } => "unsupported_operation",
            GatewayError::BackendInstallFailed { .. } => "backend_install_failed",
            GatewayError::BackendStartupFailed { .. } => "backend_startup_failed",
            GatewayError::DownloadCancelled { .. } => "download_cancelled",
            GatewayError::DownloadFailed { .. } => "download_failed",
            GatewayError::AuthFailed => "auth_failed",
            GatewayError::Internal { .. } => "internal_error",
        }
    }

    /// HTTP status the front end maps this to (§7). The HTTP front end is
    /// the sole layer that performs this translation.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::InvalidRequest { .. } => 400,
            GatewayError::ModelNotFound { .. } => 404,
            GatewayError::ModelNotLoaded { .. } => 409,
            GatewayError::ModelInvalidated { .. } => 409,
            GatewayError::UnsupportedOperation { .. } => 400,
            GatewayError::BackendInstallFailed { .. } => 500,
            GatewayError::BackendStartupFailed { .. } => 500,
            GatewayError::DownloadCancelled { .. } => 499,
            GatewayError::DownloadFailed { .. } => 500,
            GatewayError::AuthFailed => 401,
            GatewayError::Internal { .. } => 500,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
