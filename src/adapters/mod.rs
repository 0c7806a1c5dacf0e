//! Backend Adapters (§4.C): one per recipe/flavour family. Modelled as a
//! **capability record** (§9) -- each adapter is a value exposing a set of
//! named operations the Router checks for presence before dispatch, rather
//! than a polymorphic class hierarchy.

pub mod flm;
pub mod kokoro;
pub mod llamacpp;
pub mod ryzenai_llm;
pub mod sd_cpp;
pub mod whispercpp;

use crate::catalogue::{ModelInfo, RecipeOptions};
use crate::config;
use crate::error::GatewayError;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Named operations the Router dispatches by presence, not by downcasting a
/// trait object (§9 "there is no need for polymorphic class hierarchies").
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub chat: bool,
    pub completion: bool,
    pub responses: bool,
    pub embeddings: bool,
    pub reranking: bool,
    pub audio_transcribe: bool,
    pub audio_speech: bool,
    pub image_generate: bool,
}

impl Capabilities {
    pub fn supports(&self, endpoint: &str) -> bool {
        match endpoint {
            "chat/completions" => self.chat,
            "completions" => self.completion,
            "responses" => self.responses,
            "embeddings" => self.embeddings,
            "reranking" => self.reranking,
            "audio/transcriptions" => self.audio_transcribe,
            "audio/speech" => self.audio_speech,
            "images/generations" => self.image_generate,
            _ => false,
        }
    }
}

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn recipe(&self) -> &'static str;

    /// Fetches a release archive (unless a matching `version.txt` already
    /// exists or an env override points at a prebuilt binary), extracts it,
    /// and returns the installed version string.
    async fn install(&self, flavour: &str) -> Result<String, GatewayError>;

    /// Produces the child process invocation for one loaded model.
    fn build_argv(
        &self,
        info: &ModelInfo,
        options: &RecipeOptions,
        port: u16,
    ) -> Result<Vec<String>, GatewayError>;

    /// Maps a gateway endpoint to the path exposed by the child process, or
    /// `None` if unsupported.
    fn endpoint_path(&self, endpoint: &str) -> Option<&'static str>;

    /// Recipe-specific request rewrites.
    fn transform_request(&self, endpoint: &str, body: Value) -> Result<Value, GatewayError> {
        let _ = endpoint;
        Ok(body)
    }

    async fn readiness_check(&self, client: &reqwest::Client, base_url: &str) -> bool;

    fn capabilities(&self) -> Capabilities;

    /// CLI flags this adapter manages itself; free-form user args
    /// (`llamacpp_args` and friends) may not redeclare any of these.
    fn reserved_flags(&self) -> &'static [&'static str] {
        &[]
    }

    fn binary_name(&self) -> &'static str;

    fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(600)
    }

    /// Resolves the installed entry-point binary path, honouring the
    /// `LEMONADE_<RECIPE>[_<BACKEND>]_BIN` override.
    fn binary_path(&self, flavour: &str) -> PathBuf {
        if let Some(p) = config::adapter_bin_override(self.recipe(), Some(flavour)) {
            return p;
        }
        if let Some(p) = config::adapter_bin_override(self.recipe(), None) {
            return p;
        }
        config::adapter_install_dir(self.recipe(), flavour).join(self.binary_name())
    }
}

pub fn registry() -> Vec<Box<dyn BackendAdapter>> {
    vec![
        Box::new(llamacpp::LlamacppAdapter),
        Box::new(whispercpp::WhispercppAdapter),
        Box::new(kokoro::KokoroAdapter),
        Box::new(sd_cpp::SdCppAdapter),
        Box::new(flm::FlmAdapter),
        Box::new(ryzenai_llm::RyzenAiLlmAdapter),
    ]
}

pub fn for_recipe(recipe: &str) -> Option<Box<dyn BackendAdapter>> {
    registry().into_iter().find(|a| a.recipe() == recipe)
}

/// Tokenises a free-form CLI argument string respecting single and double
/// quotes (§4.C `llamacpp_args`).
pub fn tokenize_shell_args(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut has_token = false;

    for c in input.chars() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                has_token = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_token = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

/// Validates that none of `tokens` redeclares a reserved flag; fails fast
/// with a message listing every conflict found.
pub fn validate_no_reserved_flags(
    tokens: &[String],
    reserved: &[&str],
) -> Result<(), GatewayError> {
    let conflicts: Vec<&String> = tokens
        .iter()
        .filter(|t| reserved.iter().any(|r| t.as_str() == *r))
        .collect();
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(GatewayError::InvalidRequest {
            message: format!(
                "user-supplied args conflict with reserved flags: {}",
                conflicts
                    .into_iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        })
    }
}

/// Picks a free TCP port by binding to an ephemeral port then releasing it
/// (§4.D "port selection").
pub fn pick_free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Generic "already installed?" check shared by every adapter: a
/// `version.txt` already sitting in the install directory short-circuits
/// the release download.
pub fn already_installed(install_dir: &Path) -> Option<String> {
    std::fs::read_to_string(install_dir.join("version.txt"))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Downloads and extracts a release archive (`.zip` or `.tar.gz`) into
/// `install_dir`, writes `version.txt`, and on POSIX marks `entry_point`
/// executable.
pub async fn install_release(
    recipe: &str,
    install_dir: &Path,
    url: &str,
    version: &str,
    entry_point: &str,
) -> Result<(), GatewayError> {
    std::fs::create_dir_all(install_dir).map_err(|e| install_err(recipe, e.to_string()))?;

    let client = reqwest::Client::new();
    let resp = client.get(url).send().await.map_err(|e| install_err(recipe, e.to_string()))?;
    if !resp.status().is_success() {
        return Err(install_err(recipe, format!("install archive fetch returned {}", resp.status())));
    }
    let bytes = resp.bytes().await.map_err(|e| install_err(recipe, e.to_string()))?;

    if url.ends_with(".zip") {
        let cursor = std::io::Cursor::new(&bytes[..]);
        let mut archive = zip::ZipArchive::new(cursor)
            .map_err(|e| install_err(recipe, format!("bad zip archive: {e}")))?;
        archive
            .extract(install_dir)
            .map_err(|e| install_err(recipe, format!("zip extraction failed: {e}")))?;
    } else if url.ends_with(".tar.gz") || url.ends_with(".tgz") {
        let cursor = std::io::Cursor::new(&bytes[..]);
        let decoder = flate2::read::GzDecoder::new(cursor);
        let mut archive = tar::Archive::new(decoder);
        archive
            .unpack(install_dir)
            .map_err(|e| install_err(recipe, format!("tar.gz extraction failed: {e}")))?;
    } else {
        return Err(install_err(recipe, format!("unrecognised archive extension in '{url}'")));
    }

    std::fs::write(install_dir.join("version.txt"), version)
        .map_err(|e| install_err(recipe, e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let entry = install_dir.join(entry_point);
        if let Ok(meta) = std::fs::metadata(&entry) {
            let mut perms = meta.permissions();
            perms.set_mode(perms.mode() | 0o111);
            let _ = std::fs::set_permissions(&entry, perms);
        }
    }

    info!(recipe, version, dir = %install_dir.display(), "installed backend release");
    Ok(())
}

fn install_err(recipe: &str, message: String) -> GatewayError {
    GatewayError::BackendInstallFailed { recipe: recipe.to_string(), message }
}

pub async fn poll_readiness(
    adapter: &dyn BackendAdapter,
    client: &reqwest::Client,
    base_url: &str,
    is_alive: impl Fn() -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + adapter.readiness_timeout();
    loop {
        if adapter.readiness_check(client, base_url).await {
            return true;
        }
        if !is_alive() {
            warn!(base_url, "backend process exited before becoming ready");
            return false;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_respects_double_quotes() {
        let tokens = tokenize_shell_args(r#"--a 1 --b "two words" --c"#);
        assert_eq!(tokens, vec!["--a", "1", "--b", "two words", "--c"]);
    }

    #[test]
    fn tokenize_respects_single_quotes() {
        let tokens = tokenize_shell_args("--arg 'has spaces'");
        assert_eq!(tokens, vec!["--arg", "has spaces"]);
    }

    #[test]
    fn validate_reserved_flags_lists_all_conflicts() {
        let tokens = tokenize_shell_args("--port 1 --ctx-size 2048 --threads 4");
        let err = validate_no_reserved_flags(&tokens, &["--port", "--ctx-size"]).unwrap_err();
        let msg = err.message();
        assert!(msg.contains("--port"));
        assert!(msg.contains("--ctx-size"));
    }
}
