//! Route handlers (§4.G). Each inference handler resolves the model name
//! from the body, then delegates to the Router; the Router is the only
//! layer that knows about supervisors.

use super::sse::{pull_stream, PullEvent};
use super::{ErrorBody, SharedContext};
use crate::catalogue::options::{LlamacppBackend, RecipeOptions};
use crate::error::GatewayError;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::body::Body;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn model_name_of(body: &Value) -> Result<String, GatewayError> {
    body.get("model")
        .or_else(|| body.get("model_name"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GatewayError::InvalidRequest { message: "request body is missing 'model'".to_string() })
}

fn err_response(ctx: &SharedContext, e: GatewayError) -> Response {
    e.into_response_with(ctx)
}

pub async fn not_found() -> Response {
    let body = serde_json::json!({"type": "not_found", "message": "no such route"});
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

pub async fn method_not_allowed() -> Response {
    let body = serde_json::json!({"type": "method_not_allowed", "message": "method not allowed on this route"});
    (StatusCode::METHOD_NOT_ALLOWED, Json(body)).into_response()
}

// ---- read-only endpoints ----

pub async fn health(State(ctx): State<SharedContext>) -> Response {
    let loaded = ctx.router.get_all_loaded_models().await;
    Json(serde_json::json!({"status": "ok", "loaded_models": loaded})).into_response()
}

pub async fn live() -> Response {
    StatusCode::OK.into_response()
}

pub async fn list_models(State(ctx): State<SharedContext>) -> Response {
    let cat = ctx.catalogue.read().await;
    let models: Vec<_> = cat.list().into_iter().cloned().collect();
    Json(serde_json::json!({"data": models})).into_response()
}

pub async fn get_model(State(ctx): State<SharedContext>, Path(id): Path<String>) -> Response {
    let cat = ctx.catalogue.read().await;
    match cat.get(&id) {
        Some(info) => Json(info.clone()).into_response(),
        None => err_response(
            &ctx,
            GatewayError::ModelNotFound { model_name: id.clone(), filter_reason: cat.filter_reason(&id) },
        ),
    }
}

pub async fn stats(State(ctx): State<SharedContext>) -> Response {
    match ctx.router.most_recent_telemetry().await {
        Some(snap) => Json(snap).into_response(),
        None => Json(crate::telemetry::TelemetrySnapshot::default()).into_response(),
    }
}

pub async fn system_info(State(ctx): State<SharedContext>) -> Response {
    Json(&ctx.capabilities).into_response()
}

pub async fn system_stats(State(ctx): State<SharedContext>) -> Response {
    let uptime_secs = ctx.started_at.elapsed().as_secs();
    Json(serde_json::json!({"uptime_secs": uptime_secs})).into_response()
}

pub async fn logs_stream(State(ctx): State<SharedContext>) -> Response {
    let (tx, rx) = mpsc::channel::<String>(64);
    let log_path = ctx.log_path.clone();
    tokio::spawn(tail_log_file(log_path, tx));
    let stream = tokio_stream::wrappers::ReceiverStream::new(rx)
        .map(|line| Ok::<_, std::convert::Infallible>(axum::response::sse::Event::default().data(line)));
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn tail_log_file(path: std::path::PathBuf, tx: mpsc::Sender<String>) {
    use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
    let Ok(mut file) = tokio::fs::File::open(&path).await else { return };
    let _ = file.seek(std::io::SeekFrom::End(0)).await;
    let mut reader = BufReader::new(file);
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => tokio::time::sleep(Duration::from_millis(500)).await,
            Ok(_) => {
                if tx.send(line.trim_end().to_string()).await.is_err() {
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

// ---- inference endpoints ----

async fn dispatch_json(ctx: &SharedContext, endpoint: &str, body: Value, timeout: Duration) -> Response {
    let model_name = match model_name_of(&body) {
        Ok(n) => n,
        Err(e) => return err_response(ctx, e),
    };
    match ctx.router.dispatch_request(&model_name, endpoint, body, timeout).await {
        Ok((status, json)) => {
            (StatusCode::from_u16(status).unwrap_or(StatusCode::OK), Json(json)).into_response()
        }
        Err(e) => err_response(ctx, e),
    }
}

async fn dispatch_stream(ctx: SharedContext, endpoint: &'static str, body: Value, timeout: Duration) -> Response {
    let model_name = match model_name_of(&body) {
        Ok(n) => n,
        Err(e) => return err_response(&ctx, e),
    };
    let (tx, rx) = mpsc::unbounded_channel::<bytes::Bytes>();
    let ctx2 = ctx.clone();
    let handle = tokio::spawn(async move {
        let sink = move |chunk: bytes::Bytes| tx.send(chunk).is_ok();
        ctx2.router.dispatch_streaming_request(&model_name, endpoint, body, sink, timeout).await
    });

    let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
    let body = Body::from_stream(stream.map(Ok::<_, std::io::Error>));
    tokio::spawn(async move {
        if let Err(e) = handle.await.unwrap_or_else(|e| {
            Err(GatewayError::Internal { message: format!("stream task panicked: {e}") })
        }) {
            tracing::warn!(error = %e, "streaming dispatch failed");
        }
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

pub async fn chat_completions(State(ctx): State<SharedContext>, Json(body): Json<Value>) -> Response {
    if body.get("stream").and_then(Value::as_bool).unwrap_or(false) {
        dispatch_stream(ctx, "chat/completions", body, Duration::from_secs(3600)).await
    } else {
        dispatch_json(&ctx, "chat/completions", body, Duration::from_secs(3600)).await
    }
}

pub async fn completions(State(ctx): State<SharedContext>, Json(body): Json<Value>) -> Response {
    if body.get("stream").and_then(Value::as_bool).unwrap_or(false) {
        dispatch_stream(ctx, "completions", body, Duration::from_secs(3600)).await
    } else {
        dispatch_json(&ctx, "completions", body, Duration::from_secs(3600)).await
    }
}

pub async fn responses(State(ctx): State<SharedContext>, Json(body): Json<Value>) -> Response {
    if body.get("stream").and_then(Value::as_bool).unwrap_or(false) {
        dispatch_stream(ctx, "responses", body, Duration::from_secs(3600)).await
    } else {
        dispatch_json(&ctx, "responses", body, Duration::from_secs(3600)).await
    }
}

pub async fn embeddings(State(ctx): State<SharedContext>, Json(body): Json<Value>) -> Response {
    dispatch_json(&ctx, "embeddings", body, Duration::from_secs(3600)).await
}

pub async fn reranking(State(ctx): State<SharedContext>, Json(body): Json<Value>) -> Response {
    dispatch_json(&ctx, "reranking", body, Duration::from_secs(3600)).await
}

pub async fn audio_transcriptions(State(ctx): State<SharedContext>, Json(body): Json<Value>) -> Response {
    dispatch_json(&ctx, "audio/transcriptions", body, Duration::from_secs(300)).await
}

pub async fn audio_speech(State(ctx): State<SharedContext>, Json(body): Json<Value>) -> Response {
    dispatch_stream(ctx, "audio/speech", body, Duration::from_secs(300)).await
}

pub async fn images_generations(State(ctx): State<SharedContext>, Json(body): Json<Value>) -> Response {
    dispatch_json(&ctx, "images/generations", body, Duration::from_secs(600)).await
}

// ---- control-plane endpoints ----

#[derive(Deserialize)]
pub struct LoadRequest {
    pub model_name: String,
    #[serde(default)]
    pub do_not_upgrade: bool,
    #[serde(default)]
    pub ctx_size: Option<u32>,
    #[serde(default)]
    pub llamacpp_backend: Option<String>,
    #[serde(default)]
    pub llamacpp_args: Option<String>,
}

pub async fn load(State(ctx): State<SharedContext>, Json(req): Json<LoadRequest>) -> Response {
    let (info, options) = {
        let cat = ctx.catalogue.read().await;
        let Some(info) = cat.get(&req.model_name).cloned() else {
            return err_response(
                &ctx,
                GatewayError::ModelNotFound {
                    model_name: req.model_name.clone(),
                    filter_reason: cat.filter_reason(&req.model_name),
                },
            );
        };
        let mut options = info.recipe_options.clone();
        if let RecipeOptions::Llamacpp { ctx_size, llamacpp_backend, llamacpp_args } = &mut options {
            if req.ctx_size.is_some() {
                *ctx_size = req.ctx_size;
            }
            if let Some(backend) = &req.llamacpp_backend {
                *llamacpp_backend = parse_llamacpp_backend(backend);
            }
            if req.llamacpp_args.is_some() {
                *llamacpp_args = req.llamacpp_args.clone();
            }
        }
        (info, options)
    };

    if !info.downloaded {
        let mut cat = ctx.catalogue.write().await;
        if let Err(e) =
            cat.download(&req.model_name, req.do_not_upgrade, &ctx.config, crate::download::no_op_progress()).await
        {
            return err_response(&ctx, e);
        }
    }

    match ctx.router.load_model(&req.model_name, info, options).await {
        Ok(()) => Json(serde_json::json!({"status": "loaded", "model_name": req.model_name})).into_response(),
        Err(e) => err_response(&ctx, e),
    }
}

#[derive(Deserialize)]
pub struct ModelNameRequest {
    pub model_name: String,
}

pub async fn unload(State(ctx): State<SharedContext>, Json(req): Json<ModelNameRequest>) -> Response {
    match ctx.router.unload_model(&req.model_name).await {
        Ok(()) => Json(serde_json::json!({"status": "unloaded"})).into_response(),
        Err(e) => err_response(&ctx, e),
    }
}

pub async fn delete(State(ctx): State<SharedContext>, Json(req): Json<ModelNameRequest>) -> Response {
    let mut cat = ctx.catalogue.write().await;
    match cat.delete(&req.model_name) {
        Ok(()) => Json(serde_json::json!({"status": "deleted"})).into_response(),
        Err(e) => err_response(&ctx, e),
    }
}

#[derive(Deserialize)]
pub struct ParamsRequest {
    pub model_name: String,
    #[serde(flatten)]
    pub options: serde_json::Value,
}

pub async fn params(State(ctx): State<SharedContext>, Json(req): Json<ParamsRequest>) -> Response {
    let mut all = crate::catalogue::options::load_recipe_options();
    let cat = ctx.catalogue.read().await;
    let Some(info) = cat.get_raw(&req.model_name) else {
        return err_response(&ctx, GatewayError::ModelNotFound { model_name: req.model_name, filter_reason: None });
    };
    let base = info.recipe_options.clone();
    drop(cat);
    let overlay: RecipeOptions = match serde_json::from_value({
        let mut v = req.options.clone();
        if let Some(obj) = v.as_object_mut() {
            obj.insert("recipe".to_string(), Value::String(base_recipe_tag(&base)));
        }
        v
    }) {
        Ok(o) => o,
        Err(e) => return err_response(&ctx, GatewayError::InvalidRequest { message: e.to_string() }),
    };
    let merged = base.merged_over(overlay);
    all.insert(req.model_name.clone(), merged);
    match crate::catalogue::options::save_recipe_options(&all) {
        Ok(()) => Json(serde_json::json!({"status": "saved"})).into_response(),
        Err(e) => err_response(&ctx, e),
    }
}

fn parse_llamacpp_backend(s: &str) -> Option<LlamacppBackend> {
    match s.to_ascii_lowercase().as_str() {
        "cpu" => Some(LlamacppBackend::Cpu),
        "vulkan" => Some(LlamacppBackend::Vulkan),
        "rocm" => Some(LlamacppBackend::Rocm),
        "metal" => Some(LlamacppBackend::Metal),
        _ => None,
    }
}

fn base_recipe_tag(opts: &RecipeOptions) -> String {
    match opts {
        RecipeOptions::Llamacpp { .. } => "llamacpp",
        RecipeOptions::Whispercpp { .. } => "whispercpp",
        RecipeOptions::Flm { .. } => "flm",
        RecipeOptions::RyzenaiLlm { .. } => "ryzenai-llm",
        RecipeOptions::SdCpp { .. } => "sd-cpp",
        RecipeOptions::Kokoro {} => "kokoro",
        RecipeOptions::Other(_) => "other",
    }
    .to_string()
}

#[derive(Deserialize)]
pub struct LogLevelRequest {
    pub level: String,
}

pub async fn log_level(State(ctx): State<SharedContext>, Json(req): Json<LogLevelRequest>) -> Response {
    match crate::telemetry::set_log_level(&req.level) {
        Ok(()) => Json(serde_json::json!({"status": "ok", "level": req.level})).into_response(),
        Err(e) => err_response(&ctx, e),
    }
}

#[derive(Deserialize)]
pub struct PullRequest {
    pub model_name: String,
    #[serde(default)]
    pub do_not_upgrade: bool,
}

pub async fn pull(State(ctx): State<SharedContext>, Json(req): Json<PullRequest>) -> Response {
    let (tx, rx) = mpsc::channel::<PullEvent>(32);
    tokio::spawn(run_pull(ctx, req, tx));
    Sse::new(pull_stream(rx)).keep_alive(KeepAlive::default()).into_response()
}

async fn run_pull(ctx: SharedContext, req: PullRequest, tx: mpsc::Sender<PullEvent>) {
    let cancelled = Arc::new(AtomicBool::new(false));
    let progress_tx = tx.clone();
    let cb_cancelled = cancelled.clone();
    let progress_cb: crate::download::ProgressCb = Arc::new(move |downloaded, total| {
        if progress_tx.is_closed() {
            cb_cancelled.store(true, Ordering::SeqCst);
            return false;
        }
        let _ = progress_tx.try_send(PullEvent::Progress { bytes_downloaded: downloaded, bytes_total: total });
        true
    });

    let result = {
        let mut cat = ctx.catalogue.write().await;
        cat.download(&req.model_name, req.do_not_upgrade, &ctx.config, progress_cb).await
    };

    match result {
        Ok(()) => {
            let _ = tx.send(PullEvent::Complete).await;
        }
        Err(e) => {
            let _ = tx.send(PullEvent::Error { message: e.message() }).await;
        }
    }
}

pub async fn shutdown(State(ctx): State<SharedContext>) -> Response {
    ctx.router.shutdown().await;
    Json(serde_json::json!({"status": "shutting down"})).into_response()
}

use futures_util::StreamExt;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_name_of_accepts_either_field_name() {
        let a = serde_json::json!({"model": "m1"});
        let b = serde_json::json!({"model_name": "m2"});
        assert_eq!(model_name_of(&a).unwrap(), "m1");
        assert_eq!(model_name_of(&b).unwrap(), "m2");
    }

    #[test]
    fn model_name_of_rejects_missing_field() {
        let empty = serde_json::json!({});
        assert!(model_name_of(&empty).is_err());
    }
}
