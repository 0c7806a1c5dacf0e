//! Capability Report (§4.H): a read-only hardware/driver snapshot computed
//! at startup and cached on disk keyed by gateway version. Filtering in
//! `catalogue` is the sole consumer.

use crate::config;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use sysinfo::System;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    pub vram_gb: f64,
    pub virtual_memory_gb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeCapability {
    pub supported: bool,
    pub available: bool,
    pub supported_backends_in_preference_order: Vec<String>,
    pub reason_if_unsupported: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub gateway_version: String,
    pub cpu_name: String,
    pub cpu_cores: usize,
    pub gpus: Vec<GpuInfo>,
    pub npu_present: bool,
    pub npu_driver_version: Option<String>,
    pub os_version: String,
    pub total_ram_gb: f64,
    pub recipes: HashMap<String, RecipeCapability>,
}

impl CapabilityReport {
    #[cfg(feature = "no-hardware-probe")]
    pub fn detect(_cfg: &config::GatewayConfig) -> CapabilityReport {
        CapabilityReport::permissive_for_tests()
    }

    #[cfg(not(feature = "no-hardware-probe"))]
    pub fn detect(cfg: &config::GatewayConfig) -> CapabilityReport {
        if let Some(cached) = load_cached() {
            if cached.gateway_version == env!("CARGO_PKG_VERSION") {
                info!("using cached hardware capability report");
                return cached;
            }
            info!("gateway version changed, recomputing capability report");
        }

        let mut sys = System::new_all();
        sys.refresh_all();

        let cpu_name = sys
            .cpus()
            .first()
            .map(|c| c.brand().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let total_ram_gb = sys.total_memory() as f64 / 1e9;
        let os_version = System::long_os_version().unwrap_or_else(|| "unknown".to_string());

        let npu_present = cfg.skip_npu_check || detect_npu();

        let mut recipes = HashMap::new();
        recipes.insert(
            "llamacpp".to_string(),
            RecipeCapability {
                supported: true,
                available: true,
                supported_backends_in_preference_order: preferred_llamacpp_backends(),
                reason_if_unsupported: None,
            },
        );
        recipes.insert(
            "whispercpp".to_string(),
            RecipeCapability {
                supported: true,
                available: true,
                supported_backends_in_preference_order: if npu_present {
                    vec!["npu".to_string(), "cpu".to_string()]
                } else {
                    vec!["cpu".to_string()]
                },
                reason_if_unsupported: None,
            },
        );
        recipes.insert(
            "kokoro".to_string(),
            RecipeCapability {
                supported: true,
                available: true,
                supported_backends_in_preference_order: vec!["cpu".to_string()],
                reason_if_unsupported: None,
            },
        );
        recipes.insert(
            "sd-cpp".to_string(),
            RecipeCapability {
                supported: !cfg!(target_os = "macos"),
                available: !cfg!(target_os = "macos"),
                supported_backends_in_preference_order: vec!["cpu".to_string(), "rocm".to_string()],
                reason_if_unsupported: if cfg!(target_os = "macos") {
                    Some("sd-cpp is not supported on macOS".to_string())
                } else {
                    None
                },
            },
        );
        recipes.insert(
            "flm".to_string(),
            RecipeCapability {
                supported: npu_present && !cfg!(target_os = "macos"),
                available: npu_present,
                supported_backends_in_preference_order: vec!["npu".to_string()],
                reason_if_unsupported: if npu_present {
                    None
                } else {
                    Some("no NPU detected".to_string())
                },
            },
        );
        recipes.insert(
            "ryzenai-llm".to_string(),
            RecipeCapability {
                supported: npu_present && !cfg!(target_os = "macos"),
                available: npu_present,
                supported_backends_in_preference_order: vec!["npu".to_string()],
                reason_if_unsupported: if npu_present {
                    None
                } else {
                    Some("no NPU detected".to_string())
                },
            },
        );

        let report = CapabilityReport {
            gateway_version: env!("CARGO_PKG_VERSION").to_string(),
            cpu_name,
            cpu_cores: sys.cpus().len(),
            gpus: Vec::new(),
            npu_present,
            npu_driver_version: None,
            os_version,
            total_ram_gb,
            recipes,
        };
        save_cache(&report);
        report
    }

    pub fn largest_memory_pool_gb(&self, enable_dgpu_gtt: bool) -> f64 {
        let mut best = 0.0f64;
        for gpu in &self.gpus {
            let pool = if enable_dgpu_gtt {
                gpu.vram_gb + gpu.virtual_memory_gb
            } else {
                gpu.vram_gb
            };
            best = best.max(pool);
        }
        best
    }

    /// A capability report with every recipe marked supported and available,
    /// for tests that exercise the HTTP/catalogue layers without real
    /// hardware or driver probing.
    pub fn permissive_for_tests() -> CapabilityReport {
        let mut recipes = HashMap::new();
        for r in ["llamacpp", "whispercpp", "kokoro", "sd-cpp", "flm", "ryzenai-llm"] {
            recipes.insert(
                r.to_string(),
                RecipeCapability {
                    supported: true,
                    available: true,
                    supported_backends_in_preference_order: vec!["cpu".to_string()],
                    reason_if_unsupported: None,
                },
            );
        }
        CapabilityReport {
            gateway_version: env!("CARGO_PKG_VERSION").to_string(),
            cpu_name: "test-cpu".to_string(),
            cpu_cores: 8,
            gpus: Vec::new(),
            npu_present: true,
            npu_driver_version: None,
            os_version: "test-os".to_string(),
            total_ram_gb: 64.0,
            recipes,
        }
    }
}

/// Minimum driver-version table consulted by the FLM adapter (§4.C).
pub fn min_flm_driver_version() -> &'static str {
    "32.0.203.0"
}

fn preferred_llamacpp_backends() -> Vec<String> {
    if cfg!(target_os = "macos") {
        vec!["metal".to_string(), "cpu".to_string()]
    } else {
        vec!["vulkan".to_string(), "rocm".to_string(), "cpu".to_string()]
    }
}

fn detect_npu() -> bool {
    // No OS-level NPU/driver enumeration is wired up here (out of scope per
    // §1); conservatively report "absent" unless the env override is set.
    false
}

fn load_cached() -> Option<CapabilityReport> {
    let bytes = fs::read(config::hardware_cache_path()).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn save_cache(report: &CapabilityReport) {
    if let Err(e) = crate::catalogue::atomic_write_json(&config::hardware_cache_path(), report) {
        warn!("failed to persist hardware capability cache: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn largest_memory_pool_ignores_virtual_memory_by_default() {
        let report = CapabilityReport {
            gpus: vec![GpuInfo { name: "gpu0".into(), vram_gb: 8.0, virtual_memory_gb: 16.0 }],
            ..CapabilityReport::permissive_for_tests()
        };
        assert_eq!(report.largest_memory_pool_gb(false), 8.0);
        assert_eq!(report.largest_memory_pool_gb(true), 24.0);
    }
}
