//! Router / Backend Pool (§4.F): owns the live set of Backend Supervisors,
//! serializes loads through a single critical section, and dispatches
//! inference requests to the right one.

use crate::catalogue::RecipeOptions;
use crate::error::GatewayError;
use crate::supervisor::Supervisor;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

struct PoolState {
    pool: Vec<Arc<Supervisor>>,
    is_loading: bool,
}

pub struct Router {
    state: Mutex<PoolState>,
    load_cv: Notify,
    max_loaded_per_type: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadedModelInfo {
    pub model_name: String,
    pub checkpoint: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub device: String,
    pub backend_url: String,
    pub recipe: String,
    pub recipe_options: RecipeOptions,
    pub last_use_ms: u64,
}

impl Router {
    pub fn new(max_loaded_per_type: i64) -> Router {
        Router {
            state: Mutex::new(PoolState { pool: Vec::new(), is_loading: false }),
            load_cv: Notify::new(),
            max_loaded_per_type,
        }
    }

    /// Load protocol, §4.F steps 1-8.
    pub async fn load_model(
        &self,
        name: &str,
        info: crate::catalogue::ModelInfo,
        options: RecipeOptions,
    ) -> Result<(), GatewayError> {
        self.acquire_load_slot().await;

        {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.pool.iter().find(|s| s.model_name == name) {
                existing.touch();
                state.is_loading = false;
                self.load_cv.notify_waiters();
                return Ok(());
            }

            if info.device().contains(crate::catalogue::DeviceType::NPU) {
                if let Some(holder) = state.pool.iter().find(|s| {
                    s.info.device().contains(crate::catalogue::DeviceType::NPU)
                }) {
                    let holder = holder.clone();
                    state.pool.retain(|s| !Arc::ptr_eq(s, &holder));
                    drop(state);
                    self.evict(&holder).await;
                    state = self.state.lock().await;
                }
            }

            if self.max_loaded_per_type >= 0 {
                let model_type = info.model_type();
                let count = state.pool.iter().filter(|s| s.model_type() == model_type).count() as i64;
                if count >= self.max_loaded_per_type {
                    if let Some(lru) = state
                        .pool
                        .iter()
                        .filter(|s| s.model_type() == model_type)
                        .min_by_key(|s| s.last_access_ms())
                        .cloned()
                    {
                        state.pool.retain(|s| !Arc::ptr_eq(s, &lru));
                        drop(state);
                        self.evict(&lru).await;
                        state = self.state.lock().await;
                    }
                }
            }
            drop(state);
        }

        let attempt = Supervisor::load(name.to_string(), info.clone(), options.clone()).await;

        match attempt {
            Ok(sup) => {
                let mut state = self.state.lock().await;
                state.pool.push(sup);
                state.is_loading = false;
                self.load_cv.notify_waiters();
                info!(model = name, "model loaded");
                Ok(())
            }
            Err(e) if e.is_terminal() => {
                let mut state = self.state.lock().await;
                state.is_loading = false;
                self.load_cv.notify_waiters();
                Err(e)
            }
            Err(first_err) => {
                warn!(model = name, error = %first_err, "load failed, evicting all supervisors and retrying once");
                self.evict_all().await;
                let retry = Supervisor::load(name.to_string(), info, options).await;
                let mut state = self.state.lock().await;
                state.is_loading = false;
                self.load_cv.notify_waiters();
                match retry {
                    Ok(sup) => {
                        state.pool.push(sup);
                        Ok(())
                    }
                    Err(retry_err) => Err(retry_err),
                }
            }
        }
    }

    pub async fn unload_model(&self, name: &str) -> Result<(), GatewayError> {
        let sup = {
            let mut state = self.state.lock().await;
            let idx = state.pool.iter().position(|s| s.model_name == name);
            match idx {
                Some(i) => Some(state.pool.remove(i)),
                None => None,
            }
        };
        match sup {
            Some(s) => {
                self.evict(&s).await;
                Ok(())
            }
            None => Err(GatewayError::ModelNotLoaded { model_name: name.to_string() }),
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Supervisor>> {
        self.state.lock().await.pool.iter().find(|s| s.model_name == name).cloned()
    }

    pub async fn get_all_loaded_models(&self) -> Vec<LoadedModelInfo> {
        self.state
            .lock()
            .await
            .pool
            .iter()
            .map(|s| LoadedModelInfo {
                model_name: s.model_name.clone(),
                checkpoint: s.info.main_checkpoint().unwrap_or_default().to_string(),
                model_type: format!("{:?}", s.model_type()).to_lowercase(),
                device: format!("{:?}", s.info.device()),
                backend_url: s.backend_url.clone(),
                recipe: s.info.recipe.clone(),
                recipe_options: s.options.clone(),
                last_use_ms: s.last_access_ms(),
            })
            .collect()
    }

    /// Telemetry is read from the most recently accessed supervisor (§4.F
    /// Observability).
    pub async fn most_recent_telemetry(&self) -> Option<crate::telemetry::TelemetrySnapshot> {
        self.state
            .lock()
            .await
            .pool
            .iter()
            .max_by_key(|s| s.last_access_ms())
            .map(|s| s.telemetry.snapshot())
    }

    /// Dispatch per §4.F: look up by name, mark busy, call, clear busy on
    /// every exit path.
    pub async fn dispatch_request(
        &self,
        model_name: &str,
        endpoint: &str,
        body: serde_json::Value,
        timeout: std::time::Duration,
    ) -> Result<(u16, serde_json::Value), GatewayError> {
        let sup = self
            .get(model_name)
            .await
            .ok_or_else(|| GatewayError::ModelNotLoaded { model_name: model_name.to_string() })?;

        if !sup.capabilities().supports(endpoint) {
            return Err(GatewayError::UnsupportedOperation {
                model_name: model_name.to_string(),
                endpoint: endpoint.to_string(),
            });
        }

        sup.mark_busy();
        sup.touch();
        let result = sup.forward_request(endpoint, body, timeout).await;
        sup.clear_busy();
        result
    }

    pub async fn dispatch_streaming_request<F>(
        &self,
        model_name: &str,
        endpoint: &str,
        body: serde_json::Value,
        sink: F,
        timeout: std::time::Duration,
    ) -> Result<(), GatewayError>
    where
        F: FnMut(bytes::Bytes) -> bool + Send,
    {
        let sup = self
            .get(model_name)
            .await
            .ok_or_else(|| GatewayError::ModelNotLoaded { model_name: model_name.to_string() })?;

        if !sup.capabilities().supports(endpoint) {
            return Err(GatewayError::UnsupportedOperation {
                model_name: model_name.to_string(),
                endpoint: endpoint.to_string(),
            });
        }

        sup.mark_busy();
        sup.touch();
        let result = sup.forward_streaming_request(endpoint, body, sink, timeout).await;
        sup.clear_busy();
        result
    }

    /// Process shutdown (§5): evict every supervisor in parallel.
    pub async fn shutdown(&self) {
        let pool = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.pool)
        };
        let futures = pool.iter().map(|s| self.evict(s));
        futures_util::future::join_all(futures).await;
    }

    async fn acquire_load_slot(&self) {
        loop {
            let mut state = self.state.lock().await;
            if !state.is_loading {
                state.is_loading = true;
                return;
            }
            drop(state);
            self.load_cv.notified().await;
        }
    }

    async fn evict(&self, sup: &Arc<Supervisor>) {
        sup.wait_until_not_busy().await;
        sup.unload().await;
    }

    async fn evict_all(&self) {
        let pool = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.pool)
        };
        for sup in &pool {
            self.evict(sup).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unload_of_unknown_model_reports_not_loaded() {
        let router = Router::new(-1);
        let err = router.unload_model("never-loaded").await.unwrap_err();
        assert!(matches!(err, GatewayError::ModelNotLoaded { .. }));
    }

    #[tokio::test]
    async fn get_all_loaded_models_is_empty_initially() {
        let router = Router::new(-1);
        assert!(router.get_all_loaded_models().await.is_empty());
    }
}
