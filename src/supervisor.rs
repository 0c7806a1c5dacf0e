//! Backend Supervisor (§4.D): wraps one running child backend process,
//! forwards requests to it, and tracks the telemetry and access metadata
//! the Router needs for eviction decisions.

use crate::adapters::{self, pick_free_port, poll_readiness, BackendAdapter};
use crate::catalogue::{ModelInfo, ModelType, RecipeOptions};
use crate::config;
use crate::error::GatewayError;
use crate::process::{self, Handle, SpawnOpts};
use crate::telemetry::TelemetryAccumulator;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// A live, loaded backend. One per entry in the Router's pool.
pub struct Supervisor {
    pub model_name: String,
    pub info: ModelInfo,
    pub options: RecipeOptions,
    pub backend_url: String,
    port: u16,
    adapter: Box<dyn BackendAdapter>,
    handle: RwLock<Option<Handle>>,
    client: reqwest::Client,
    last_access_ms: AtomicU64,
    busy: AtomicBool,
    not_busy: Notify,
    pub telemetry: TelemetryAccumulator,
}

impl Supervisor {
    /// `load` per §4.D: resolve the adapter, pick a port, spawn, and poll
    /// readiness up to the adapter's chosen timeout.
    pub async fn load(
        model_name: String,
        info: ModelInfo,
        options: RecipeOptions,
    ) -> Result<Arc<Supervisor>, GatewayError> {
        let adapter = adapters::for_recipe(&info.recipe).ok_or_else(|| GatewayError::Internal {
            message: format!("no adapter registered for recipe '{}'", info.recipe),
        })?;

        if info.recipe == "flm" && !config::skip_npu_check() {
            crate::adapters::flm::check_driver_or_fail(config::npu_driver_version().as_deref())?;
        }

        let flavour = backend_flavour(&info, &options);
        adapter.install(&flavour).await?;

        if info.recipe == "flm" {
            let flm = crate::adapters::flm::FlmAdapter;
            let checkpoint = info.main_checkpoint().unwrap_or_default();
            flm.ensure_checkpoint_installed(&model_name, checkpoint).await?;
        }

        let port = pick_free_port().map_err(|e| GatewayError::BackendStartupFailed {
            model_name: model_name.clone(),
            message: format!("could not allocate a port: {e}"),
            exit_code: None,
        })?;

        let argv = adapter.build_argv(&info, &options, port)?;
        let exe = adapter.binary_path(&flavour);
        let log_path = config::cache_dir().join("logs").join(format!("{model_name}.log"));
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let spawn_opts = SpawnOpts {
            exe,
            argv,
            cwd: None,
            env_overlay: Default::default(),
            inherit_stdio: false,
            filter_regex: None,
            log_path: Some(log_path),
        };
        let handle = process::spawn(spawn_opts).map_err(|e| GatewayError::BackendStartupFailed {
            model_name: model_name.clone(),
            message: e.to_string(),
            exit_code: None,
        })?;

        let client = reqwest::Client::builder()
            .timeout(endpoint_timeout(&info))
            .build()
            .unwrap_or_default();
        let base_url = format!("http://127.0.0.1:{port}");

        let ready = poll_readiness(adapter.as_ref(), &client, &base_url, || process::try_running(&handle)).await;

        if !ready {
            let exit_code = process::exit_code(&handle).await;
            process::stop(&handle).await;
            return Err(GatewayError::BackendStartupFailed {
                model_name,
                message: "backend did not become ready before the readiness timeout".to_string(),
                exit_code,
            });
        }

        info!(model = %model_name, port, recipe = %info.recipe, "backend ready");

        Ok(Arc::new(Supervisor {
            model_name,
            info,
            options,
            backend_url: base_url,
            port,
            adapter,
            handle: RwLock::new(Some(handle)),
            client,
            last_access_ms: AtomicU64::new(now_ms()),
            busy: AtomicBool::new(false),
            not_busy: Notify::new(),
            telemetry: TelemetryAccumulator::default(),
        }))
    }

    pub fn touch(&self) {
        self.last_access_ms.store(now_ms(), Ordering::SeqCst);
    }

    pub fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn model_type(&self) -> ModelType {
        self.info.model_type()
    }

    pub fn mark_busy(&self) {
        self.busy.store(true, Ordering::SeqCst);
    }

    pub fn clear_busy(&self) {
        self.busy.store(false, Ordering::SeqCst);
        self.not_busy.notify_waiters();
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Blocks until the current in-flight request (if any) finishes. Used
    /// by the Router before evicting -- an eviction waits, it never cancels
    /// a request already in progress (§5).
    pub async fn wait_until_not_busy(&self) {
        while self.is_busy() {
            self.not_busy.notified().await;
        }
    }

    pub async fn running(&self) -> bool {
        match self.handle.read().await.as_ref() {
            Some(h) => process::running(h).await,
            None => false,
        }
    }

    /// Idempotent: a second call on an already-unloaded supervisor is a
    /// no-op.
    pub async fn unload(&self) {
        let mut guard = self.handle.write().await;
        if let Some(h) = guard.take() {
            process::stop(&h).await;
            info!(model = %self.model_name, "backend stopped");
        }
    }

    pub fn capabilities(&self) -> crate::adapters::Capabilities {
        self.adapter.capabilities()
    }

    pub fn endpoint_path(&self, endpoint: &str) -> Option<&'static str> {
        self.adapter.endpoint_path(endpoint)
    }

    /// Blocking request/response proxy. Applies the adapter's
    /// `transform_request`, forwards the body, and records telemetry from
    /// the response's `usage` object when present (§4.D).
    pub async fn forward_request(
        &self,
        endpoint: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<(u16, Value), GatewayError> {
        let path = self.endpoint_path(endpoint).ok_or_else(|| GatewayError::UnsupportedOperation {
            model_name: self.model_name.clone(),
            endpoint: endpoint.to_string(),
        })?;
        let mut body = self.adapter.transform_request(endpoint, body)?;

        let started = std::time::Instant::now();
        let request = match take_multipart_file(&mut body) {
            Some((file_path, mime)) => {
                let form = build_multipart_form(&body, &file_path, &mime).await?;
                self.client.post(format!("{}{}", self.backend_url, path)).timeout(timeout).multipart(form)
            }
            None => self.client.post(format!("{}{}", self.backend_url, path)).timeout(timeout).json(&body),
        };
        let resp = request.send().await.map_err(|e| backend_request_err(&self.model_name, e))?;
        let status = resp.status().as_u16();
        let json: Value = resp.json().await.unwrap_or(Value::Null);
        self.telemetry.record_from_response(&json, started.elapsed());
        self.touch();
        Ok((status, json))
    }

    /// Streaming proxy: copies bytes from the child to `sink` in receipt
    /// order until EOF, the child closes, or `sink` returns an error
    /// (interpreted as client disconnect). `sse` only changes how the
    /// caller frames the bytes -- this method always forwards raw chunks.
    pub async fn forward_streaming_request<F>(
        &self,
        endpoint: &str,
        body: Value,
        mut sink: F,
        timeout: Duration,
    ) -> Result<(), GatewayError>
    where
        F: FnMut(Bytes) -> bool + Send,
    {
        let path = self.endpoint_path(endpoint).ok_or_else(|| GatewayError::UnsupportedOperation {
            model_name: self.model_name.clone(),
            endpoint: endpoint.to_string(),
        })?;
        let body = self.adapter.transform_request(endpoint, body)?;

        let started = std::time::Instant::now();
        let mut first_byte_at = None;
        let resp = self
            .client
            .post(format!("{}{}", self.backend_url, path))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| backend_request_err(&self.model_name, e))?;

        let mut stream = resp.bytes_stream();
        let mut total_bytes = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| backend_request_err(&self.model_name, e))?;
            if first_byte_at.is_none() {
                first_byte_at = Some(started.elapsed());
            }
            total_bytes += chunk.len() as u64;
            if !sink(chunk) {
                warn!(model = %self.model_name, "streaming client disconnected");
                break;
            }
        }
        self.telemetry.record_stream(first_byte_at.unwrap_or_default(), started.elapsed(), total_bytes);
        self.touch();
        Ok(())
    }
}

/// Whispercpp's adapter stashes the repackaged audio under
/// `_multipart_file_path` / `_multipart_mime` (§4.C); pulling them out here
/// switches the request from JSON to `multipart/form-data` without the
/// adapter needing to know about `reqwest`.
fn take_multipart_file(body: &mut Value) -> Option<(String, String)> {
    let obj = body.as_object_mut()?;
    let path = obj.remove("_multipart_file_path")?.as_str()?.to_string();
    let mime = obj.remove("_multipart_mime").and_then(|v| v.as_str().map(str::to_string)).unwrap_or_else(|| "application/octet-stream".to_string());
    Some((path, mime))
}

async fn build_multipart_form(
    body: &Value,
    file_path: &str,
    mime: &str,
) -> Result<reqwest::multipart::Form, GatewayError> {
    let bytes = tokio::fs::read(file_path).await.map_err(|e| GatewayError::InvalidRequest {
        message: format!("failed to read uploaded audio file: {e}"),
    })?;
    let filename = std::path::Path::new(file_path).file_name().map(|f| f.to_string_lossy().to_string()).unwrap_or_else(|| "audio".to_string());
    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name(filename)
        .mime_str(mime)
        .map_err(|e| GatewayError::Internal { message: e.to_string() })?;
    let mut form = reqwest::multipart::Form::new().part("file", part);
    if let Some(obj) = body.as_object() {
        for (key, value) in obj {
            if let Some(s) = value.as_str() {
                form = form.text(key.clone(), s.to_string());
            } else if !value.is_null() {
                form = form.text(key.clone(), value.to_string());
            }
        }
    }
    let _ = tokio::fs::remove_file(file_path).await;
    Ok(form)
}

fn backend_request_err(model_name: &str, e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::BackendStartupFailed {
            model_name: model_name.to_string(),
            message: format!("request to backend timed out: {e}"),
            exit_code: None,
        }
    } else {
        GatewayError::BackendStartupFailed {
            model_name: model_name.to_string(),
            message: format!("backend connection failed: {e}"),
            exit_code: None,
        }
    }
}

fn backend_flavour(info: &ModelInfo, options: &RecipeOptions) -> String {
    match options {
        RecipeOptions::Llamacpp { llamacpp_backend, .. } => {
            llamacpp_backend.map(|b| format!("{b:?}").to_lowercase()).unwrap_or_else(|| "cpu".to_string())
        }
        RecipeOptions::Whispercpp { whispercpp_backend } => {
            whispercpp_backend.map(|b| format!("{b:?}").to_lowercase()).unwrap_or_else(|| "cpu".to_string())
        }
        RecipeOptions::SdCpp { sd_cpp_backend, .. } => {
            sd_cpp_backend.map(|b| format!("{b:?}").to_lowercase()).unwrap_or_else(|| "cpu".to_string())
        }
        _ => {
            let _ = info;
            "default".to_string()
        }
    }
}

/// Transport-level read/write timeouts per §5: ten minutes for image
/// generation, five minutes for audio, effectively unbounded for text.
fn endpoint_timeout(info: &ModelInfo) -> Duration {
    match info.model_type() {
        ModelType::Image => Duration::from_secs(600),
        ModelType::AudioTts | ModelType::AudioAsr => Duration::from_secs(300),
        _ => Duration::from_secs(3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn model() -> ModelInfo {
        ModelInfo {
            model_name: "m".to_string(),
            checkpoints: HashMap::new(),
            resolved_paths: HashMap::new(),
            recipe: "llamacpp".to_string(),
            labels: HashSet::new(),
            backend: None,
            size_gb: 1.0,
            downloaded: true,
            source: String::new(),
            recipe_options: RecipeOptions::default_for("llamacpp"),
            image_defaults: None,
        }
    }

    #[test]
    fn endpoint_timeout_is_longest_for_images() {
        let mut info = model();
        info.labels.insert("image".to_string());
        info.recipe = "sd-cpp".to_string();
        assert_eq!(endpoint_timeout(&info), Duration::from_secs(600));
    }

    #[test]
    fn endpoint_timeout_defaults_to_text() {
        assert_eq!(endpoint_timeout(&model()), Duration::from_secs(3600));
    }
}
