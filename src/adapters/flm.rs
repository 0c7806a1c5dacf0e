//! FLM adapter: the one recipe with genuinely special rules (§4.C).
//!
//! Before install, the minimum NPU driver version is checked against the
//! version table; if unmet the load aborts with a directed instruction
//! instead of silently failing. A detected FLM upgrade invalidates
//! previously-downloaded FLM models, surfaced as a distinctive
//! [`GatewayError::ModelInvalidated`] the Router never retries.

use super::{already_installed, install_release, BackendAdapter, Capabilities};
use crate::capability::min_flm_driver_version;
use crate::catalogue::options::RecipeOptions;
use crate::catalogue::ModelInfo;
use crate::config;
use crate::download::ProgressCb;
use crate::error::GatewayError;
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::warn;

pub struct FlmAdapter;

const INSTALLER_URL: &str = "https://lemonade-sdk.github.io/flm/install.sh";
const DRIVER_DOWNLOAD_URL: &str = "https://www.amd.com/en/support";

impl FlmAdapter {
    fn binary_path(&self) -> std::path::PathBuf {
        BackendAdapter::binary_path(self, "npu")
    }

    async fn installed_version(&self) -> Option<String> {
        let output = Command::new(self.binary_path()).arg("--version").output().await.ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// `flm list --filter installed --quiet`: one line per installed
    /// checkpoint name.
    pub async fn installed_checkpoints(&self) -> Vec<String> {
        let Ok(output) = Command::new(self.binary_path())
            .args(["list", "--filter", "installed", "--quiet"])
            .output()
            .await
        else {
            return Vec::new();
        };
        if !output.status.success() {
            return Vec::new();
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }

    /// Central entry point for FLM model acquisition: `flm pull <checkpoint>`.
    /// Progress reporting is coarse (FLM's CLI doesn't expose byte-level
    /// progress), so `progress_cb` only receives a single 0% / 100% pair.
    pub async fn pull(&self, checkpoint: &str, progress_cb: ProgressCb) -> Result<(), GatewayError> {
        progress_cb(0, None);
        let output = Command::new(self.binary_path())
            .args(["pull", checkpoint])
            .output()
            .await
            .map_err(|e| GatewayError::DownloadFailed {
                file: checkpoint.to_string(),
                message: format!("failed to invoke flm: {e}"),
                partial_path: None,
                partial_bytes: None,
            })?;
        if !output.status.success() {
            return Err(GatewayError::DownloadFailed {
                file: checkpoint.to_string(),
                message: String::from_utf8_lossy(&output.stderr).to_string(),
                partial_path: None,
                partial_bytes: None,
            });
        }
        progress_cb(1, Some(1));
        Ok(())
    }

    pub fn driver_version_sufficient(driver_version: &str) -> bool {
        version_ge(driver_version, min_flm_driver_version())
    }

    /// Called from the Supervisor's load path: confirms `checkpoint` is
    /// still reported installed. An FLM upgrade can silently drop previously
    /// pulled checkpoints from its own store, which must surface as a
    /// distinctive, non-retryable error rather than a generic startup
    /// failure (§4.C, §4.F step 7).
    pub async fn ensure_checkpoint_installed(
        &self,
        model_name: &str,
        checkpoint: &str,
    ) -> Result<(), GatewayError> {
        let installed = self.installed_checkpoints().await;
        if installed.iter().any(|c| c == checkpoint) {
            Ok(())
        } else {
            Err(GatewayError::ModelInvalidated {
                model_name: model_name.to_string(),
                message: format!(
                    "checkpoint '{checkpoint}' is no longer reported by `flm list --filter installed` \
                     (likely dropped by an FLM upgrade); re-run pull to restore it"
                ),
            })
        }
    }
}

fn version_ge(a: &str, b: &str) -> bool {
    let parse = |s: &str| -> Vec<u64> { s.split('.').filter_map(|p| p.parse().ok()).collect() };
    parse(a) >= parse(b)
}

#[async_trait]
impl BackendAdapter for FlmAdapter {
    fn recipe(&self) -> &'static str {
        "flm"
    }

    async fn install(&self, flavour: &str) -> Result<String, GatewayError> {
        let install_dir = config::adapter_install_dir(self.recipe(), flavour);
        if config::adapter_bin_override(self.recipe(), Some(flavour)).is_some() {
            return Ok(self.installed_version().await.unwrap_or_default());
        }
        if let Some(prior) = already_installed(&install_dir) {
            if let Some(current) = self.installed_version().await {
                if current != prior {
                    warn!(
                        previous = prior,
                        current, "FLM upgraded; previously downloaded FLM models may now be invalidated"
                    );
                }
                return Ok(current);
            }
            return Ok(prior);
        }

        install_release(self.recipe(), &install_dir, INSTALLER_URL, "latest", self.binary_name()).await?;
        let version = self.installed_version().await.ok_or_else(|| GatewayError::BackendInstallFailed {
            recipe: self.recipe().to_string(),
            message: "`flm --version` failed after install".to_string(),
        })?;
        Ok(version)
    }

    fn build_argv(
        &self,
        info: &ModelInfo,
        options: &RecipeOptions,
        port: u16,
    ) -> Result<Vec<String>, GatewayError> {
        let RecipeOptions::Flm { ctx_size } = options else {
            return Err(GatewayError::InvalidRequest { message: "expected flm recipe options".to_string() });
        };
        let checkpoint = info.main_checkpoint().unwrap_or_default().to_string();
        let mut argv = vec!["serve".to_string(), "--port".to_string(), port.to_string(), checkpoint];
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

    fn transform_request(&self, _endpoint: &str, body: Value) -> Result<Value, GatewayError> {
        Ok(body)
    }

    async fn readiness_check(&self, client: &reqwest::Client, base_url: &str) -> bool {
        client
            .get(format!("{base_url}/api/tags"))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { chat: true, completion: true, responses: true, ..Default::default() }
    }

    fn binary_name(&self) -> &'static str {
        if cfg!(target_os = "windows") {
            "flm.exe"
        } else {
            "flm"
        }
    }
}

/// Aborts a load fast, with a directed instruction, when the installed NPU
/// driver doesn't meet FLM's minimum. The "open a browser URL" step from the
/// source becomes a logged instruction plus the URL in the error body --
/// running headless never blocks on user interaction (§9 Open Questions).
pub fn check_driver_or_fail(driver_version: Option<&str>) -> Result<(), GatewayError> {
    let Some(v) = driver_version else {
        warn!(url = DRIVER_DOWNLOAD_URL, "no NPU driver detected; FLM requires one");
        return Err(GatewayError::BackendInstallFailed {
            recipe: "flm".to_string(),
            message: format!(
                "no NPU driver detected; install one from {DRIVER_DOWNLOAD_URL} and retry"
            ),
        });
    };
    if FlmAdapter::driver_version_sufficient(v) {
        Ok(())
    } else {
        warn!(url = DRIVER_DOWNLOAD_URL, current = v, "NPU driver below FLM's minimum version");
        Err(GatewayError::BackendInstallFailed {
            recipe: "flm".to_string(),
            message: format!(
                "NPU driver {v} is below the minimum {} required by FLM; update it from {DRIVER_DOWNLOAD_URL} and retry",
                min_flm_driver_version()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_comparison_is_numeric_not_lexicographic() {
        assert!(version_ge("32.0.203.0", "32.0.203.0"));
        assert!(version_ge("32.1.0.0", "32.0.203.0"));
        assert!(!version_ge("9.9.9.9", "32.0.203.0"));
    }

    #[test]
    fn missing_driver_fails_with_instruction() {
        let err = check_driver_or_fail(None).unwrap_err();
        assert!(err.message().contains("no NPU driver"));
    }

    #[test]
    fn old_driver_fails_with_minimum_version_in_message() {
        let err = check_driver_or_fail(Some("1.0.0.0")).unwrap_err();
        assert!(err.message().contains(min_flm_driver_version()));
    }
}
