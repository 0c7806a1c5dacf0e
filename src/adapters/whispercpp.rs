use super::{already_installed, install_release, BackendAdapter, Capabilities};
use crate::catalogue::options::{RecipeOptions, WhispercppBackend};
use crate::catalogue::ModelInfo;
use crate::config;
use crate::error::GatewayError;
use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use std::io::Write;

pub struct WhispercppAdapter;

fn release_url(flavour: &str, version: &str) -> String {
    let platform = if cfg!(target_os = "windows") {
        "win"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else {
        "linux"
    };
    format!("https://github.com/ggml-org/whisper.cpp/releases/download/{version}/whisper-{version}-bin-{platform}-{flavour}-x64.zip")
}

fn mime_for_extension(ext: &str) -> &'static str {
    match ext.to_lowercase().as_str() {
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl BackendAdapter for WhispercppAdapter {
    fn recipe(&self) -> &'static str {
        "whispercpp"
    }

    async fn install(&self, flavour: &str) -> Result<String, GatewayError> {
        const VERSION: &str = "v1.7.2";
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
        let RecipeOptions::Whispercpp { whispercpp_backend } = options else {
            return Err(GatewayError::InvalidRequest {
                message: "expected whispercpp recipe options".to_string(),
            });
        };
        let model_path = info.resolved_paths.get("main").cloned().unwrap_or_default();
        let mut argv = vec![
            "--port".to_string(),
            port.to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--model".to_string(),
            model_path,
        ];
        if matches!(whispercpp_backend, Some(WhispercppBackend::Npu)) {
            argv.push("--use-npu".to_string());
        }
        Ok(argv)
    }

    fn endpoint_path(&self, endpoint: &str) -> Option<&'static str> {
        match endpoint {
            "audio/transcriptions" => Some("/inference"),
            _ => None,
        }
    }

    fn transform_request(&self, endpoint: &str, mut body: Value) -> Result<Value, GatewayError> {
        if endpoint != "audio/transcriptions" {
            return Ok(body);
        }
        let Some(obj) = body.as_object_mut() else { return Ok(body) };
        if let Some(Value::String(inline)) = obj.remove("file_bytes_base64") {
            let ext = obj
                .get("filename")
                .and_then(|v| v.as_str())
                .and_then(|f| f.rsplit('.').next())
                .unwrap_or("wav")
                .to_string();
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(inline)
                .map_err(|e| GatewayError::InvalidRequest {
                    message: format!("invalid base64 audio payload: {e}"),
                })?;
            let mut tmp = tempfile::Builder::new()
                .suffix(&format!(".{ext}"))
                .tempfile()
                .map_err(|e| GatewayError::Internal { message: e.to_string() })?;
            tmp.write_all(&bytes).map_err(|e| GatewayError::Internal { message: e.to_string() })?;
            let (_, path) = tmp.keep().map_err(|e| GatewayError::Internal { message: e.to_string() })?;
            obj.insert(
                "_multipart_file_path".to_string(),
                Value::String(path.display().to_string()),
            );
            obj.insert(
                "_multipart_mime".to_string(),
                Value::String(mime_for_extension(&ext).to_string()),
            );
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
        Capabilities { audio_transcribe: true, ..Default::default() }
    }

    fn binary_name(&self) -> &'static str {
        if cfg!(target_os = "windows") {
            "whisper-server.exe"
        } else {
            "whisper-server"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_chosen_by_extension() {
        assert_eq!(mime_for_extension("WAV"), "audio/wav");
        assert_eq!(mime_for_extension("mp3"), "audio/mpeg");
        assert_eq!(mime_for_extension("xyz"), "application/octet-stream");
    }

    #[test]
    fn transform_request_repackages_inline_bytes() {
        let adapter = WhispercppAdapter;
        let body = serde_json::json!({
            "filename": "clip.wav",
            "file_bytes_base64": base64::engine::general_purpose::STANDARD.encode("RIFF"),
        });
        let out = adapter.transform_request("audio/transcriptions", body).unwrap();
        assert!(out.get("_multipart_file_path").is_some());
        assert_eq!(out["_multipart_mime"], "audio/wav");
    }
}
