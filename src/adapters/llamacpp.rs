use super::{
    already_installed, install_release, tokenize_shell_args, validate_no_reserved_flags,
    BackendAdapter, Capabilities,
};
use crate::catalogue::options::{LlamacppBackend, RecipeOptions};
use crate::catalogue::ModelInfo;
use crate::config;
use crate::error::GatewayError;
use async_trait::async_trait;
use serde_json::Value;

pub struct LlamacppAdapter;

const RESERVED: &[&str] = &["--port", "--host", "--model", "--mmproj", "-m", "-c", "--ctx-size"];

fn backend_name(b: Option<LlamacppBackend>) -> &'static str {
    match b {
        Some(LlamacppBackend::Cpu) | None => "cpu",
        Some(LlamacppBackend::Vulkan) => "vulkan",
        Some(LlamacppBackend::Rocm) => "rocm",
        Some(LlamacppBackend::Metal) => "metal",
    }
}

fn release_url(flavour: &str, version: &str) -> String {
    let platform = if cfg!(target_os = "windows") {
        "win"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else {
        "linux"
    };
    format!(
        "https://github.com/ggml-org/llama.cpp/releases/download/{version}/llama-{version}-bin-{platform}-{flavour}-x64.zip"
    )
}

#[async_trait]
impl BackendAdapter for LlamacppAdapter {
    fn recipe(&self) -> &'static str {
        "llamacpp"
    }

    async fn install(&self, flavour: &str) -> Result<String, GatewayError> {
        const VERSION: &str = "b4700";
        let install_dir = config::adapter_install_dir(self.recipe(), flavour);
        if let Some(v) = already_installed(&install_dir) {
            return Ok(v);
        }
        if config::adapter_bin_override(self.recipe(), Some(flavour)).is_some() {
            return Ok(VERSION.to_string());
        }
        install_release(
            self.recipe(),
            &install_dir,
            &release_url(flavour, VERSION),
            VERSION,
            self.binary_name(),
        )
        .await?;
        Ok(VERSION.to_string())
    }

    fn build_argv(
        &self,
        info: &ModelInfo,
        options: &RecipeOptions,
        port: u16,
    ) -> Result<Vec<String>, GatewayError> {
        let RecipeOptions::Llamacpp { ctx_size, llamacpp_backend, llamacpp_args } = options else {
            return Err(GatewayError::InvalidRequest {
                message: "expected llamacpp recipe options".to_string(),
            });
        };
        let mut argv = vec!["--port".to_string(), port.to_string(), "--host".to_string(), "127.0.0.1".to_string()];

        let main_path = info.resolved_paths.get("main").cloned().unwrap_or_default();
        argv.push("--model".to_string());
        argv.push(main_path);

        if let Some(mmproj) = info.resolved_paths.get("mmproj") {
            if !mmproj.is_empty() {
                argv.push("--mmproj".to_string());
                argv.push(mmproj.clone());
            }
        }
        if let Some(ctx) = ctx_size {
            argv.push("--ctx-size".to_string());
            argv.push(ctx.to_string());
        }
        if info.labels.contains("embeddings") {
            argv.push("--embedding".to_string());
        }
        if info.labels.contains("reranking") {
            argv.push("--reranking".to_string());
        }

        let _ = backend_name(*llamacpp_backend);

        if let Some(extra) = llamacpp_args {
            let tokens = tokenize_shell_args(extra);
            validate_no_reserved_flags(&tokens, self.reserved_flags())?;
            argv.extend(tokens);
        }
        Ok(argv)
    }

    fn endpoint_path(&self, endpoint: &str) -> Option<&'static str> {
        match endpoint {
            "chat/completions" => Some("/v1/chat/completions"),
            "completions" => Some("/v1/completions"),
            "embeddings" => Some("/v1/embeddings"),
            "reranking" => Some("/v1/rerank"),
            "responses" => Some("/v1/chat/completions"),
            _ => None,
        }
    }

    fn transform_request(&self, endpoint: &str, mut body: Value) -> Result<Value, GatewayError> {
        if matches!(endpoint, "chat/completions" | "completions" | "responses") {
            if let Some(obj) = body.as_object_mut() {
                if !obj.contains_key("max_tokens") {
                    if let Some(v) = obj.remove("max_completion_tokens") {
                        obj.insert("max_tokens".to_string(), v);
                    }
                } else {
                    obj.remove("max_completion_tokens");
                }
            }
        }
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
        Capabilities {
            chat: true,
            completion: true,
            responses: true,
            embeddings: true,
            reranking: true,
            ..Default::default()
        }
    }

    fn reserved_flags(&self) -> &'static [&'static str] {
        RESERVED
    }

    fn binary_name(&self) -> &'static str {
        if cfg!(target_os = "windows") {
            "llama-server.exe"
        } else {
            "llama-server"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn model(labels: &[&str]) -> ModelInfo {
        ModelInfo {
            model_name: "m".to_string(),
            checkpoints: HashMap::from([("main".to_string(), "org/repo:q4".to_string())]),
            resolved_paths: HashMap::from([("main".to_string(), "/cache/model.gguf".to_string())]),
            recipe: "llamacpp".to_string(),
            labels: labels.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
            backend: None,
            size_gb: 1.0,
            downloaded: true,
            source: String::new(),
            recipe_options: RecipeOptions::default_for("llamacpp"),
            image_defaults: None,
        }
    }

    #[test]
    fn build_argv_includes_model_and_port() {
        let adapter = LlamacppAdapter;
        let info = model(&[]);
        let argv = adapter.build_argv(&info, &info.recipe_options, 12345).unwrap();
        assert!(argv.windows(2).any(|w| w == ["--port", "12345"]));
        assert!(argv.windows(2).any(|w| w == ["--model", "/cache/model.gguf"]));
    }

    #[test]
    fn reserved_flag_conflict_in_free_form_args_fails() {
        let adapter = LlamacppAdapter;
        let mut info = model(&[]);
        info.recipe_options = RecipeOptions::Llamacpp {
            ctx_size: None,
            llamacpp_backend: None,
            llamacpp_args: Some("--port 9999".to_string()),
        };
        let err = adapter.build_argv(&info, &info.recipe_options, 1234).unwrap_err();
        assert!(err.message().contains("--port"));
    }

    #[test]
    fn transform_request_maps_max_completion_tokens() {
        let adapter = LlamacppAdapter;
        let body = serde_json::json!({"model": "m", "max_completion_tokens": 128});
        let out = adapter.transform_request("chat/completions", body).unwrap();
        assert_eq!(out["max_tokens"], 128);
        assert!(out.get("max_completion_tokens").is_none());
    }
}
