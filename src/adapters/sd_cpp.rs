use super::{already_installed, install_release, BackendAdapter, Capabilities};
use crate::catalogue::options::{RecipeOptions, SdCppBackend};
use crate::catalogue::ModelInfo;
use crate::config;
use crate::error::GatewayError;
use async_trait::async_trait;
use serde_json::Value;

pub struct SdCppAdapter;

fn backend_name(b: Option<SdCppBackend>) -> &'static str {
    match b {
        Some(SdCppBackend::Rocm) => "rocm",
        _ => "cpu",
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
    format!("https://github.com/leejet/stable-diffusion.cpp/releases/download/{version}/sd-{version}-bin-{platform}-{flavour}-x64.zip")
}

#[async_trait]
impl BackendAdapter for SdCppAdapter {
    fn recipe(&self) -> &'static str {
        "sd-cpp"
    }

    async fn install(&self, flavour: &str) -> Result<String, GatewayError> {
        const VERSION: &str = "master-20250115";
        let install_dir = config::adapter_install_dir(self.recipe(), flavour);
        if let Some(v) = already_installed(&install_dir) {
            return Ok(v);
        }
        if config::adapter_bin_override(self.recipe(), Some(flavour)).is_some() {
            return Ok(VERSION.to_string());
        }
        install_release(self.recipe(), &install_dir, &release_url(flavour, VERSION), VERSION, self.binary_name())
            .await?;
        Ok(VERSION.to_string())
    }

    fn build_argv(
        &self,
        info: &ModelInfo,
        options: &RecipeOptions,
        port: u16,
    ) -> Result<Vec<String>, GatewayError> {
        let RecipeOptions::SdCpp { sd_cpp_backend, .. } = options else {
            return Err(GatewayError::InvalidRequest {
                message: "expected sd-cpp recipe options".to_string(),
            });
        };
        let model_path = info.resolved_paths.get("main").cloned().unwrap_or_default();
        let mut argv = vec![
            "--port".to_string(),
            port.to_string(),
            "--model".to_string(),
            model_path,
        ];
        if let Some(vae) = info.resolved_paths.get("vae") {
            if !vae.is_empty() {
                argv.push("--vae".to_string());
                argv.push(vae.clone());
            }
        }
        if let Some(te) = info.resolved_paths.get("text_encoder") {
            if !te.is_empty() {
                argv.push("--clip_l".to_string());
                argv.push(te.clone());
            }
        }
        if backend_name(*sd_cpp_backend) == "rocm" {
            argv.push("--backend".to_string());
            argv.push("rocm".to_string());
        }
        Ok(argv)
    }

    fn endpoint_path(&self, endpoint: &str) -> Option<&'static str> {
        match endpoint {
            "images/generations" => Some("/v1/images/generations"),
            _ => None,
        }
    }

    /// If any of `steps`, `cfg_scale`, `seed`, `sample_method`, `scheduler`
    /// are present, pack them into a sentinel marker appended to `prompt`
    /// (§4.C, boundary case in §8).
    fn transform_request(&self, endpoint: &str, mut body: Value) -> Result<Value, GatewayError> {
        if endpoint != "images/generations" {
            return Ok(body);
        }
        let Some(obj) = body.as_object_mut() else { return Ok(body) };
        let extra_keys = ["steps", "cfg_scale", "seed", "sample_method", "scheduler"];
        let mut extras = serde_json::Map::new();
        for key in extra_keys {
            if let Some(v) = obj.remove(key) {
                extras.insert(key.to_string(), v);
            }
        }
        if !extras.is_empty() {
            let marker = format!(
                " <sd_cpp_extra_args>{}</sd_cpp_extra_args>",
                Value::Object(extras)
            );
            let prompt = obj.entry("prompt").or_insert_with(|| Value::String(String::new()));
            if let Value::String(p) = prompt {
                p.push_str(&marker);
            }
        }
        Ok(body)
    }

    async fn readiness_check(&self, client: &reqwest::Client, base_url: &str) -> bool {
        client
            .get(base_url)
            .send()
            .await
            .map(|r| r.status().is_success() || r.status().is_client_error())
            .unwrap_or(false)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { image_generate: true, ..Default::default() }
    }

    fn binary_name(&self) -> &'static str {
        if cfg!(target_os = "windows") {
            "sd-server.exe"
        } else {
            "sd-server"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_request_appends_sentinel_marker_exactly() {
        let adapter = SdCppAdapter;
        let body = serde_json::json!({"prompt": "a cat", "steps": 30, "cfg_scale": 7.5});
        let out = adapter.transform_request("images/generations", body).unwrap();
        let prompt = out["prompt"].as_str().unwrap();
        assert!(prompt.starts_with("a cat <sd_cpp_extra_args>"));
        assert!(prompt.ends_with("</sd_cpp_extra_args>"));
        assert!(out.get("steps").is_none());
    }

    #[test]
    fn transform_request_is_noop_without_extra_keys() {
        let adapter = SdCppAdapter;
        let body = serde_json::json!({"prompt": "a cat"});
        let out = adapter.transform_request("images/generations", body.clone()).unwrap();
        assert_eq!(out, body);
    }
}
