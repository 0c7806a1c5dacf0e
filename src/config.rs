//! Environment variables, on-disk cache-directory layout, and global
//! defaults (§4.I / §6). CLI flags (see `cli.rs`) take precedence over the
//! `LEMONADE_*` env vars read here; both feed into `GatewayConfig`.

use std::env;
use std::path::PathBuf;

pub const ENV_API_KEY: &str = "LEMONADE_API_KEY";
pub const ENV_OFFLINE: &str = "LEMONADE_OFFLINE";
pub const ENV_DISABLE_FILTERING: &str = "LEMONADE_DISABLE_MODEL_FILTERING";
pub const ENV_ENABLE_DGPU_GTT: &str = "LEMONADE_ENABLE_DGPU_GTT";
pub const ENV_PORT: &str = "LEMONADE_PORT";
pub const ENV_HOST: &str = "LEMONADE_HOST";
pub const ENV_LOG_LEVEL: &str = "LEMONADE_LOG_LEVEL";
pub const ENV_MAX_LOADED_MODELS: &str = "LEMONADE_MAX_LOADED_MODELS";
pub const ENV_EXTRA_MODELS_DIR: &str = "LEMONADE_EXTRA_MODELS_DIR";
pub const ENV_NO_BROADCAST: &str = "LEMONADE_NO_BROADCAST";
pub const ENV_HF_HUB_CACHE: &str = "HF_HUB_CACHE";
pub const ENV_HF_HOME: &str = "HF_HOME";
pub const ENV_SKIP_NPU_CHECK: &str = "RYZENAI_SKIP_PROCESSOR_CHECK";
pub const ENV_NPU_DRIVER_VERSION: &str = "LEMONADE_NPU_DRIVER_VERSION";

fn env_flag_set(name: &str) -> bool {
    matches!(
        env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

/// Whether the NPU driver-version gate should be bypassed entirely (§6).
pub fn skip_npu_check() -> bool {
    env_flag_set(ENV_SKIP_NPU_CHECK)
}

/// The installed NPU driver version, as reported by the platform. No
/// OS-level driver enumeration is wired up here (out of scope per §1); only
/// the env override used by headless installs and tests is consulted.
pub fn npu_driver_version() -> Option<String> {
    env::var(ENV_NPU_DRIVER_VERSION).ok()
}

/// Per-adapter binary-path override: `LEMONADE_<RECIPE>[_<BACKEND>]_BIN`.
pub fn adapter_bin_override(recipe: &str, backend: Option<&str>) -> Option<PathBuf> {
    let recipe_upper = recipe.to_uppercase().replace('-', "_");
    let key = match backend {
        Some(b) => format!("LEMONADE_{recipe_upper}_{}_BIN", b.to_uppercase()),
        None => format!("LEMONADE_{recipe_upper}_BIN"),
    };
    env::var(key).ok().map(PathBuf::from)
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub extra_models_dir: Option<PathBuf>,
    pub no_broadcast: bool,
    /// `-1` means unbounded, matching the CLI/env contract in §6.
    pub max_loaded_models: i64,
    pub api_key: Option<String>,
    pub offline: bool,
    pub disable_filtering: bool,
    pub enable_dgpu_gtt: bool,
    pub skip_npu_check: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: env::var(ENV_HOST).unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var(ENV_PORT)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            log_level: env::var(ENV_LOG_LEVEL).unwrap_or_else(|_| "info".to_string()),
            extra_models_dir: env::var(ENV_EXTRA_MODELS_DIR).ok().map(PathBuf::from),
            no_broadcast: env_flag_set(ENV_NO_BROADCAST),
            max_loaded_models: env::var(ENV_MAX_LOADED_MODELS)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1),
            api_key: env::var(ENV_API_KEY).ok(),
            offline: env_flag_set(ENV_OFFLINE),
            disable_filtering: env_flag_set(ENV_DISABLE_FILTERING),
            enable_dgpu_gtt: env_flag_set(ENV_ENABLE_DGPU_GTT),
            skip_npu_check: env_flag_set(ENV_SKIP_NPU_CHECK),
        }
    }
}

/// The platform cache directory root under which all persisted state lives
/// (`user_models.json`, `recipe_options.json`, `hardware_cache.json`,
/// backend install directories).
pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join("citrine")
}

/// The HuggingFace-style content-addressed hub cache root:
/// `HF_HUB_CACHE` ?? `$HF_HOME/hub` ?? platform default.
pub fn hf_hub_cache() -> PathBuf {
    if let Ok(p) = env::var(ENV_HF_HUB_CACHE) {
        return PathBuf::from(p);
    }
    if let Ok(home) = env::var(ENV_HF_HOME) {
        return PathBuf::from(home).join("hub");
    }
    dirs::home_dir()
        .unwrap_or_else(env::temp_dir)
        .join(".cache")
        .join("huggingface")
        .join("hub")
}

pub fn user_models_path() -> PathBuf {
    cache_dir().join("user_models.json")
}

pub fn recipe_options_path() -> PathBuf {
    cache_dir().join("recipe_options.json")
}

pub fn hardware_cache_path() -> PathBuf {
    cache_dir().join("hardware_cache.json")
}

pub fn adapter_install_dir(recipe: &str, flavour: &str) -> PathBuf {
    cache_dir().join("backends").join(recipe).join(flavour)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_max_loaded_models_is_unbounded() {
        env::remove_var(ENV_MAX_LOADED_MODELS);
        assert_eq!(GatewayConfig::default().max_loaded_models, -1);
    }

    #[test]
    fn hf_hub_cache_prefers_explicit_env() {
        env::set_var(ENV_HF_HUB_CACHE, "/tmp/my-hub-cache");
        assert_eq!(hf_hub_cache(), PathBuf::from("/tmp/my-hub-cache"));
        env::remove_var(ENV_HF_HUB_CACHE);
    }

    #[test]
    fn adapter_bin_override_builds_recipe_and_backend_key() {
        env::set_var("LEMONADE_LLAMACPP_VULKAN_BIN", "/opt/llama-server");
        assert_eq!(
            adapter_bin_override("llamacpp", Some("vulkan")),
            Some(PathBuf::from("/opt/llama-server"))
        );
        env::remove_var("LEMONADE_LLAMACPP_VULKAN_BIN");
    }
}
