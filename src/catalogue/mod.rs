//! Model Catalogue & Resolver (§4.E).
//!
//! Merges three sources -- the shipped catalogue, the user-models JSON file,
//! and a filesystem scan of the "extra models directory" -- into a single
//! namespace, filters entries by capability, and resolves checkpoints to
//! concrete on-disk paths under the HuggingFace-style cache.

pub mod discovery;
pub mod options;
pub mod resolver;
pub mod shipped;

use crate::capability::CapabilityReport;
use crate::config::{self, GatewayConfig};
use crate::download::{DownloadEngine, ProgressCb};
use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub use options::RecipeOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelType {
    Image,
    AudioTts,
    AudioAsr,
    Embedding,
    Reranking,
    Llm,
}

impl ModelType {
    /// Total function deriving a model's type from its label set, with
    /// precedence `image > audio-tts > audio-asr > embedding > reranking > LLM`.
    pub fn from_labels(labels: &HashSet<String>) -> ModelType {
        if labels.contains("image") {
            ModelType::Image
        } else if labels.contains("audio-tts") {
            ModelType::AudioTts
        } else if labels.contains("audio-asr") {
            ModelType::AudioAsr
        } else if labels.contains("embeddings") {
            ModelType::Embedding
        } else if labels.contains("reranking") {
            ModelType::Reranking
        } else {
            ModelType::Llm
        }
    }
}

/// Bit-set over {CPU, iGPU, dGPU, NPU}, hand-rolled rather than pulled in
/// via a crate since the set is fixed and tiny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceType(u8);

impl DeviceType {
    pub const CPU: DeviceType = DeviceType(0b0001);
    pub const IGPU: DeviceType = DeviceType(0b0010);
    pub const DGPU: DeviceType = DeviceType(0b0100);
    pub const NPU: DeviceType = DeviceType(0b1000);

    pub fn contains(&self, other: DeviceType) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: DeviceType) -> DeviceType {
        DeviceType(self.0 | other.0)
    }

    pub fn from_recipe(recipe: &str, backend: Option<&str>) -> DeviceType {
        match backend {
            Some("npu") => DeviceType::NPU,
            Some("vulkan") | Some("rocm") | Some("metal") | Some("cuda") => DeviceType::DGPU,
            _ => match recipe {
                "ryzenai-llm" => DeviceType::NPU,
                _ => DeviceType::CPU,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageDefaults {
    pub steps: Option<u32>,
    pub cfg_scale: Option<f32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_name: String,
    pub checkpoints: HashMap<String, String>,
    #[serde(default)]
    pub resolved_paths: HashMap<String, String>,
    pub recipe: String,
    #[serde(default)]
    pub labels: HashSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    pub size_gb: f64,
    #[serde(default)]
    pub downloaded: bool,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub recipe_options: RecipeOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_defaults: Option<ImageDefaults>,
}

impl ModelInfo {
    pub fn model_type(&self) -> ModelType {
        ModelType::from_labels(&self.labels)
    }

    pub fn device(&self) -> DeviceType {
        DeviceType::from_recipe(&self.recipe, self.backend.as_deref())
    }

    pub fn main_checkpoint(&self) -> Option<&str> {
        self.checkpoints.get("main").map(|s| s.as_str())
    }

    /// §3 invariant: downloaded iff every resolved path exists, no `.partial`
    /// sibling exists, and no `.download_manifest.json` sits in the snapshot
    /// directory. FLM models are exempt -- their status comes from `flm list`.
    pub fn recompute_downloaded(&mut self) {
        if self.recipe == "flm" {
            return;
        }
        if self.resolved_paths.is_empty() {
            self.downloaded = false;
            return;
        }
        let mut all_present = true;
        for path in self.resolved_paths.values() {
            if path.is_empty() {
                all_present = false;
                break;
            }
            let p = PathBuf::from(path);
            if !p.exists() {
                all_present = false;
                break;
            }
            let partial = PathBuf::from(format!("{path}.partial"));
            if partial.exists() {
                all_present = false;
                break;
            }
            if let Some(parent) = p.parent() {
                if parent.join(".download_manifest.json").exists() {
                    all_present = false;
                    break;
                }
            }
        }
        self.downloaded = all_present;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserModelEntry {
    pub checkpoint: String,
    pub recipe: String,
    #[serde(default)]
    pub labels: HashSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmproj: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// The merged, filtered, resolved view of every model this gateway knows
/// about. Built once at startup and rebuilt whenever the extra-dir scan is
/// invalidated.
pub struct Catalogue {
    /// Every known entry, unfiltered -- used to distinguish "unregistered"
    /// from "registered but filtered out" for error messages.
    raw: HashMap<String, ModelInfo>,
    /// Visible (post-filter) subset.
    visible: HashMap<String, ModelInfo>,
    filter_reasons: HashMap<String, String>,
    extra_models_dir: Option<PathBuf>,
}

impl Catalogue {
    pub fn build(
        shipped: Vec<ModelInfo>,
        cfg: &GatewayConfig,
        caps: &CapabilityReport,
    ) -> Catalogue {
        let mut raw = HashMap::new();
        for m in shipped {
            raw.insert(m.model_name.clone(), m);
        }
        for (name, entry) in load_user_models() {
            raw.insert(name.clone(), user_entry_to_model_info(&name, &entry));
        }
        if let Some(dir) = &cfg.extra_models_dir {
            for m in discovery::scan_extra_dir(dir) {
                raw.insert(m.model_name.clone(), m);
            }
        }

        let saved_options = options::load_recipe_options();
        for m in raw.values_mut() {
            if let Some(opts) = saved_options.get(&m.model_name) {
                m.recipe_options = m.recipe_options.clone().merged_over(opts.clone());
            }
            resolver::resolve_paths(m);
            m.recompute_downloaded();
        }

        let (visible, filter_reasons) = filter_by_capability(&raw, cfg, caps);

        Catalogue {
            raw,
            visible,
            filter_reasons,
            extra_models_dir: cfg.extra_models_dir.clone(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelInfo> {
        self.visible.get(name)
    }

    pub fn get_raw(&self, name: &str) -> Option<&ModelInfo> {
        self.raw.get(name)
    }

    pub fn filter_reason(&self, name: &str) -> Option<String> {
        self.filter_reasons.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&ModelInfo> {
        self.visible.values().collect()
    }

    pub fn invalidate_extra_dir(&mut self) {
        if let Some(dir) = self.extra_models_dir.clone() {
            for m in discovery::scan_extra_dir(&dir) {
                self.raw.insert(m.model_name.clone(), m);
            }
        }
    }

    pub fn register_user(
        &mut self,
        name: &str,
        checkpoint: &str,
        recipe: &str,
        labels: HashSet<String>,
        mmproj: Option<String>,
        source: Option<String>,
    ) -> Result<(), GatewayError> {
        if !name.starts_with("user.") {
            return Err(GatewayError::InvalidRequest {
                message: format!("user model names must start with 'user.', got '{name}'"),
            });
        }
        let mut entries = load_user_models();
        entries.insert(
            name.to_string(),
            UserModelEntry {
                checkpoint: checkpoint.to_string(),
                recipe: recipe.to_string(),
                labels,
                mmproj,
                source,
            },
        );
        save_user_models(&entries)?;
        let info = user_entry_to_model_info(name, entries.get(name).unwrap());
        self.raw.insert(name.to_string(), info.clone());
        self.visible.insert(name.to_string(), info);
        self.filter_reasons.remove(name);
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> Result<(), GatewayError> {
        let info = self
            .raw
            .get(name)
            .ok_or_else(|| GatewayError::ModelNotFound {
                model_name: name.to_string(),
                filter_reason: None,
            })?
            .clone();

        for path in info.resolved_paths.values() {
            if !path.is_empty() {
                let _ = fs::remove_file(path);
            }
        }

        if name.starts_with("user.") || info.source == "local_upload" {
            self.raw.remove(name);
            self.visible.remove(name);
            let mut entries = load_user_models();
            entries.remove(name);
            save_user_models(&entries)?;
        } else if let Some(m) = self.raw.get_mut(name) {
            m.downloaded = false;
            for v in m.resolved_paths.values_mut() {
                v.clear();
            }
            self.visible.remove(name);
        }
        Ok(())
    }

    /// Central download entry point (§4.E "Operations").
    pub async fn download(
        &mut self,
        name: &str,
        do_not_upgrade: bool,
        cfg: &GatewayConfig,
        progress_cb: ProgressCb,
    ) -> Result<(), GatewayError> {
        if !self.raw.contains_key(name) && !name.starts_with("user.") {
            return Err(GatewayError::ModelNotFound {
                model_name: name.to_string(),
                filter_reason: None,
            });
        }
        if let Some(reason) = self.filter_reasons.get(name) {
            return Err(GatewayError::ModelNotFound {
                model_name: name.to_string(),
                filter_reason: Some(reason.clone()),
            });
        }
        let info = self
            .raw
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::ModelNotFound {
                model_name: name.to_string(),
                filter_reason: None,
            })?;

        if do_not_upgrade && info.downloaded {
            debug!(model = name, "cache hit, skipping download");
            return Ok(());
        }

        if info.recipe == "llamacpp" {
            if let Some(ckpt) = info.main_checkpoint() {
                if ckpt.contains("gguf") && !ckpt.contains(':') {
                    return Err(GatewayError::InvalidRequest {
                        message: format!(
                            "llamacpp registration of GGUF checkpoint '{ckpt}' requires a variant selector (org/repo:variant)"
                        ),
                    });
                }
            }
        }

        if cfg.offline {
            info!(model = name, "offline mode, skipping download");
            return Ok(());
        }

        if info.recipe == "flm" {
            let checkpoint = info.main_checkpoint().unwrap_or_default();
            crate::adapters::flm::FlmAdapter.pull(checkpoint, progress_cb).await?;
            if let Some(m) = self.raw.get_mut(name) {
                m.downloaded = true;
            }
            return Ok(());
        }

        let manifest = resolver::build_manifest(&info).await?;
        let snapshot_dir = PathBuf::from(&manifest.download_path);
        fs::create_dir_all(&snapshot_dir).map_err(|e| GatewayError::DownloadFailed {
            file: snapshot_dir.display().to_string(),
            message: e.to_string(),
            partial_path: None,
            partial_bytes: None,
        })?;
        let manifest_path = snapshot_dir.join(".download_manifest.json");
        fs::write(
            &manifest_path,
            serde_json::to_vec_pretty(&manifest).unwrap_or_default(),
        )
        .ok();

        let engine = DownloadEngine::default();
        engine.download_manifest(&manifest, progress_cb).await?;

        let _ = fs::remove_file(&manifest_path);

        if let Some(m) = self.raw.get_mut(name) {
            resolver::resolve_paths(m);
            m.recompute_downloaded();
        }
        self.invalidate_extra_dir();
        Ok(())
    }
}

fn filter_by_capability(
    raw: &HashMap<String, ModelInfo>,
    cfg: &GatewayConfig,
    caps: &CapabilityReport,
) -> (HashMap<String, ModelInfo>, HashMap<String, String>) {
    let mut visible = HashMap::new();
    let mut reasons = HashMap::new();

    if cfg.disable_filtering {
        return (raw.clone(), reasons);
    }

    let memory_pool_gb = caps.largest_memory_pool_gb(cfg.enable_dgpu_gtt);
    let ram_limit_gb = 0.8 * caps.total_ram_gb;
    let size_limit = memory_pool_gb.max(ram_limit_gb);

    for (name, info) in raw {
        if cfg!(target_os = "macos") && info.recipe != "llamacpp" {
            reasons.insert(
                name.clone(),
                "on macOS only the llamacpp recipe is supported".to_string(),
            );
            continue;
        }
        match caps.recipes.get(&info.recipe) {
            Some(r) if !r.supported => {
                reasons.insert(
                    name.clone(),
                    r.reason_if_unsupported
                        .clone()
                        .unwrap_or_else(|| format!("recipe '{}' is unsupported", info.recipe)),
                );
                continue;
            }
            None => {
                warn!(recipe = %info.recipe, "no capability entry for recipe, assuming unsupported");
                reasons.insert(name.clone(), format!("recipe '{}' is unknown", info.recipe));
                continue;
            }
            _ => {}
        }
        if info.size_gb > size_limit {
            reasons.insert(
                name.clone(),
                format!(
                    "model requires {:.1} GB, exceeds the available {:.1} GB memory pool",
                    info.size_gb, size_limit
                ),
            );
            continue;
        }
        visible.insert(name.clone(), info.clone());
    }

    (visible, reasons)
}

fn user_entry_to_model_info(name: &str, entry: &UserModelEntry) -> ModelInfo {
    let mut checkpoints = HashMap::new();
    checkpoints.insert("main".to_string(), entry.checkpoint.clone());
    if let Some(mmproj) = &entry.mmproj {
        checkpoints.insert("mmproj".to_string(), mmproj.clone());
    }
    let mut labels = entry.labels.clone();
    if entry.mmproj.is_some() {
        labels.insert("vision".to_string());
    }
    ModelInfo {
        model_name: name.to_string(),
        checkpoints,
        resolved_paths: HashMap::new(),
        recipe: entry.recipe.clone(),
        labels,
        backend: None,
        size_gb: 0.0,
        downloaded: false,
        source: entry.source.clone().unwrap_or_default(),
        recipe_options: RecipeOptions::default_for(&entry.recipe),
        image_defaults: None,
    }
}

pub fn load_user_models() -> HashMap<String, UserModelEntry> {
    let path = config::user_models_path();
    match fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

pub fn save_user_models(entries: &HashMap<String, UserModelEntry>) -> Result<(), GatewayError> {
    atomic_write_json(&config::user_models_path(), entries)
}

pub fn atomic_write_json<T: Serialize>(path: &PathBuf, value: &T) -> Result<(), GatewayError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| GatewayError::Internal { message: e.to_string() })?;
    }
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| GatewayError::Internal { message: e.to_string() })?;
    fs::write(&tmp, bytes).map_err(|e| GatewayError::Internal { message: e.to_string() })?;
    fs::rename(&tmp, path).map_err(|e| GatewayError::Internal { message: e.to_string() })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info(name: &str, recipe: &str, labels: &[&str]) -> ModelInfo {
        ModelInfo {
            model_name: name.to_string(),
            checkpoints: HashMap::from([("main".to_string(), "org/repo:q4".to_string())]),
            resolved_paths: HashMap::new(),
            recipe: recipe.to_string(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            backend: None,
            size_gb: 1.0,
            downloaded: false,
            source: String::new(),
            recipe_options: RecipeOptions::default_for(recipe),
            image_defaults: None,
        }
    }

    #[test]
    fn model_type_precedence_is_image_first() {
        let info = sample_info("m", "sd-cpp", &["image", "reasoning"]);
        assert_eq!(info.model_type(), ModelType::Image);
    }

    #[test]
    fn model_type_falls_back_to_llm() {
        let info = sample_info("m", "llamacpp", &["reasoning"]);
        assert_eq!(info.model_type(), ModelType::Llm);
    }

    #[test]
    fn register_user_rejects_missing_prefix() {
        let cfg = GatewayConfig::default();
        let caps = CapabilityReport::permissive_for_tests();
        let mut cat = Catalogue::build(vec![], &cfg, &caps);
        let err = cat
            .register_user("not-prefixed", "a/b", "llamacpp", HashSet::new(), None, None)
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    }
}
