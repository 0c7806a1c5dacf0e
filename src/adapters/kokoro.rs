use super::{already_installed, install_release, BackendAdapter, Capabilities};
use crate::catalogue::options::RecipeOptions;
use crate::catalogue::ModelInfo;
use crate::config;
use crate::error::GatewayError;
use async_trait::async_trait;
use serde_json::Value;

pub struct KokoroAdapter;

fn release_url(version: &str) -> String {
    let platform = if cfg!(target_os = "windows") {
        "win"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else {
        "linux"
    };
    format!("https://github.com/lemonade-sdk/kokoro-server/releases/download/{version}/kokoro-server-{platform}-x64.tar.gz")
}

#[async_trait]
impl BackendAdapter for KokoroAdapter {
    fn recipe(&self) -> &'static str {
        "kokoro"
    }

    async fn install(&self, flavour: &str) -> Result<String, GatewayError> {
        const VERSION: &str = "0.3.0";
        let install_dir = config::adapter_install_dir(self.recipe(), flavour);
        if let Some(v) = already_installed(&install_dir) {
            return Ok(v);
        }
        if config::adapter_bin_override(self.recipe(), Some(flavour)).is_some() {
            return Ok(VERSION.to_string());
        }
        install_release(self.recipe(), &install_dir, &release_url(VERSION), VERSION, self.binary_name()).await?;
        Ok(VERSION.to_string())
    }

    fn build_argv(
        &self,
        info: &ModelInfo,
        _options: &RecipeOptions,
        port: u16,
    ) -> Result<Vec<String>, GatewayError> {
        let model_path = info.resolved_paths.get("main").cloned().unwrap_or_default();
        Ok(vec![
            "--port".to_string(),
            port.to_string(),
            "--voices".to_string(),
            model_path,
        ])
    }

    fn endpoint_path(&self, endpoint: &str) -> Option<&'static str> {
        match endpoint {
            "audio/speech" => Some("/v1/audio/speech"),
            _ => None,
        }
    }

    fn transform_request(&self, _endpoint: &str, body: Value) -> Result<Value, GatewayError> {
        Ok(body)
    }

    async fn readiness_check(&self, client: &reqwest::Client, base_url: &str) -> bool {
        client
            .get(format!("{base_url}/health"))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { audio_speech: true, ..Default::default() }
    }

    fn binary_name(&self) -> &'static str {
        if cfg!(target_os = "windows") {
            "kokoro-server.exe"
        } else {
            "kokoro-server"
        }
    }
}
