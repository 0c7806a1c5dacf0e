use super::{already_installed, install_release, BackendAdapter, Capabilities};
use crate::catalogue::options::RecipeOptions;
use crate::catalogue::ModelInfo;
use crate::config;
use crate::error::GatewayError;
use async_trait::async_trait;
use serde_json::Value;

pub struct RyzenAiLlmAdapter;

fn release_url(version: &str) -> String {
    format!("https://github.com/amd/RyzenAI-SW/releases/download/{version}/ryzenai-llm-server-win-x64.zip")
}

#[async_trait]
impl BackendAdapter for RyzenAiLlmAdapter {
    fn recipe(&self) -> &'static str {
        "ryzenai-llm"
    }

    async fn install(&self, flavour: &str) -> Result<String, GatewayError> {
        const VERSION: &str = "1.3.0";
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
        options: &RecipeOptions,
        port: u16,
    ) -> Result<Vec<String>, GatewayError> {
        let RecipeOptions::RyzenaiLlm { ctx_size } = options else {
            return Err(GatewayError::InvalidRequest {
                message: "expected ryzenai-llm recipe options".to_string(),
            });
        };
        let model_path = info.resolved_paths.get("main").cloned().unwrap_or_default();
        let mut argv = vec![
            "--port".to_string(),
            port.to_string(),
            "--model-dir".to_string(),
            model_path,
        ];
        if let Some(ctx) = ctx_size {
            argv.push("--ctx-size".to_string());
            argv.push(ctx.to_string());
        }
        Ok(argv)
    }

    fn endpoint_path(&self, endpoint: &str) -> Option<&'static str> {
        match endpoint {
            "chat/completions" => Some("/v1/chat/completions"),
            "completions" => Some("/v1/completions"),
            "responses" => Some("/v1/chat/completions"),
            _ => None,
        }
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
        Capabilities { chat: true, completion: true, responses: true, ..Default::default() }
    }

    fn binary_name(&self) -> &'static str {
        "ryzenai-llm-server.exe"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn build_argv_uses_model_dir_flag() {
        let adapter = RyzenAiLlmAdapter;
        let info = ModelInfo {
            model_name: "m".to_string(),
            checkpoints: HashMap::from([("main".to_string(), "org/repo:npu".to_string())]),
            resolved_paths: HashMap::from([("main".to_string(), "/cache/npu-model".to_string())]),
            recipe: "ryzenai-llm".to_string(),
            labels: HashSet::new(),
            backend: None,
            size_gb: 2.0,
            downloaded: true,
            source: String::new(),
            recipe_options: RecipeOptions::default_for("ryzenai-llm"),
            image_defaults: None,
        };
        let argv = adapter.build_argv(&info, &info.recipe_options, 5555).unwrap();
        assert!(argv.windows(2).any(|w| w == ["--model-dir", "/cache/npu-model"]));
        assert!(argv.windows(2).any(|w| w == ["--port", "5555"]));
    }
}
