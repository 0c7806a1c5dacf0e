//! Checkpoint parsing and on-disk path resolution (§3 "Checkpoint", §4.E
//! "Path resolution rules").

use super::ModelInfo;
use crate::config;
use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointKind {
    /// `org/repo:variant` -- variant may be empty.
    Remote { repo: String, variant: String },
    LocalPath(String),
    /// Opaque token understood only by a specific backend (e.g. FLM's
    /// `gemma3:4b`): anything that isn't a `org/repo` shape and isn't an
    /// absolute path.
    Opaque(String),
}

pub fn parse_checkpoint(ckpt: &str) -> CheckpointKind {
    if Path::new(ckpt).is_absolute() {
        return CheckpointKind::LocalPath(ckpt.to_string());
    }
    let (head, variant) = match ckpt.split_once(':') {
        Some((h, v)) => (h, v),
        None => (ckpt, ""),
    };
    if head.matches('/').count() == 1 && !head.starts_with('/') {
        return CheckpointKind::Remote {
            repo: head.to_string(),
            variant: variant.to_string(),
        };
    }
    CheckpointKind::Opaque(ckpt.to_string())
}

/// `models--org--repo`, substituting `--` for `/`.
pub fn cache_dir_name(repo: &str) -> String {
    format!("models--{}", repo.replace('/', "--"))
}

pub fn snapshot_dir(repo: &str) -> PathBuf {
    config::hf_hub_cache().join(cache_dir_name(repo)).join("snapshot")
}

/// Applies the llamacpp `main`-role variant selection order from §4.E to a
/// list of candidate relative file paths (forward-slash separated).
pub fn select_llamacpp_variant<'a>(files: &[&'a str], variant: &str) -> Option<&'a str> {
    let is_gguf = |f: &str| f.to_lowercase().ends_with(".gguf");
    let is_mmproj = |f: &str| f.to_lowercase().contains("mmproj");

    if variant.is_empty() || variant == "*" {
        return files.iter().copied().find(|f| is_gguf(f) && !is_mmproj(f));
    }
    if variant.to_lowercase().ends_with(".gguf") {
        if let Some(f) = files
            .iter()
            .copied()
            .find(|f| f.to_lowercase() == variant.to_lowercase())
        {
            return Some(f);
        }
    }
    let suffix = format!("{}.gguf", variant.to_lowercase());
    if let Some(f) = files
        .iter()
        .copied()
        .find(|f| f.to_lowercase().ends_with(&suffix))
    {
        return Some(f);
    }
    let prefix = format!("{}/", variant.to_lowercase());
    if let Some(f) = files
        .iter()
        .copied()
        .find(|f| f.to_lowercase().starts_with(&prefix))
    {
        return Some(f);
    }
    files.iter().copied().find(|f| is_gguf(f))
}

/// For non-llamacpp recipes with a non-empty variant: the file named exactly
/// `<variant>` under the cache directory.
pub fn select_exact_variant<'a>(files: &[&'a str], variant: &str) -> Option<&'a str> {
    files.iter().copied().find(|f| *f == variant)
}

fn walk_files(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&d) else { continue };
        for entry in entries.flatten() {
            let p = entry.path();
            if p.is_dir() {
                stack.push(p);
            } else {
                out.push(p);
            }
        }
    }
    out
}

fn relative_paths(dir: &Path) -> Vec<(PathBuf, String)> {
    walk_files(dir)
        .into_iter()
        .filter_map(|p| {
            let rel = p.strip_prefix(dir).ok()?.to_string_lossy().replace('\\', "/");
            Some((p, rel))
        })
        .collect()
}

/// Resolves every checkpoint role of `info` to a concrete absolute path (or
/// leaves it empty if not present on disk yet).
pub fn resolve_paths(info: &mut ModelInfo) {
    if info.source == "local_upload" || info.source == "local_path" || info.recipe == "flm" {
        // Local / opaque sources: the checkpoint string already *is* the path
        // (or an opaque token the backend resolves itself).
        for (role, ckpt) in info.checkpoints.clone() {
            if let CheckpointKind::LocalPath(p) = parse_checkpoint(&ckpt) {
                info.resolved_paths.insert(role, p);
            } else {
                info.resolved_paths.entry(role).or_default();
            }
        }
        return;
    }

    for (role, ckpt) in info.checkpoints.clone() {
        let resolved = match parse_checkpoint(&ckpt) {
            CheckpointKind::LocalPath(p) => Some(p),
            CheckpointKind::Opaque(_) => None,
            CheckpointKind::Remote { repo, variant } => {
                resolve_remote_role(&info.recipe, &repo, &variant, &role)
            }
        };
        info.resolved_paths.insert(role, resolved.unwrap_or_default());
    }
}

fn resolve_remote_role(recipe: &str, repo: &str, variant: &str, role: &str) -> Option<String> {
    let dir = snapshot_dir(repo);
    if !dir.exists() {
        return None;
    }
    let entries = relative_paths(&dir);
    let rels: Vec<&str> = entries.iter().map(|(_, r)| r.as_str()).collect();

    match recipe {
        "ryzenai-llm" => entries
            .iter()
            .find(|(_, r)| r.ends_with("genai_config.json"))
            .map(|(p, _)| p.parent().unwrap_or(&dir).display().to_string()),
        "kokoro" => entries
            .iter()
            .find(|(_, r)| r.ends_with("index.json"))
            .map(|(p, _)| p.display().to_string()),
        "whispercpp" => {
            let mut bins: Vec<&str> = rels.iter().copied().filter(|r| r.ends_with(".bin")).collect();
            bins.sort();
            bins.first().map(|r| dir.join(r).display().to_string())
        }
        "llamacpp" if role == "main" => {
            select_llamacpp_variant(&rels, variant).map(|r| dir.join(r).display().to_string())
        }
        _ if role == "mmproj" => rels
            .iter()
            .copied()
            .find(|r| r.to_lowercase().contains("mmproj"))
            .map(|r| dir.join(r).display().to_string()),
        _ if !variant.is_empty() => {
            select_exact_variant(&rels, variant).map(|r| dir.join(r).display().to_string())
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFileEntry {
    pub name: String,
    pub url: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadManifest {
    pub download_path: String,
    pub files_count: usize,
    pub files: Vec<ManifestFileEntry>,
}

/// Lists a HuggingFace repo's files via the public API. Kept tiny and
/// dependency-light: a GET to the models API plus the standard
/// `resolve/main/<file>` download URL shape, the same one `hf-hub`-style
/// clients use.
async fn list_repo_files(repo: &str) -> Result<Vec<ManifestFileEntry>, GatewayError> {
    let client = reqwest::Client::new();
    let url = format!("https://huggingface.co/api/models/{repo}");
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| GatewayError::DownloadFailed {
            file: repo.to_string(),
            message: format!("failed to list repo files: {e}"),
            partial_path: None,
            partial_bytes: None,
        })?;
    let body: serde_json::Value = resp.json().await.map_err(|e| GatewayError::DownloadFailed {
        file: repo.to_string(),
        message: format!("failed to parse repo listing: {e}"),
        partial_path: None,
        partial_bytes: None,
    })?;
    let siblings = body["siblings"].as_array().cloned().unwrap_or_default();
    Ok(siblings
        .into_iter()
        .filter_map(|s| {
            let name = s["rfilename"].as_str()?.to_string();
            let dl_url = format!("https://huggingface.co/{repo}/resolve/main/{name}");
            Some(ManifestFileEntry { name, url: dl_url, size: 0 })
        })
        .collect())
}

/// Builds the file manifest for one model's download, applying the same
/// variant-selection rules used for path resolution to decide which remote
/// files are actually needed (the `main` file plus any companion roles such
/// as `mmproj`).
pub async fn build_manifest(info: &ModelInfo) -> Result<DownloadManifest, GatewayError> {
    let main_ckpt = info
        .main_checkpoint()
        .ok_or_else(|| GatewayError::InvalidRequest {
            message: "model has no 'main' checkpoint".to_string(),
        })?;
    let CheckpointKind::Remote { repo, variant } = parse_checkpoint(main_ckpt) else {
        return Err(GatewayError::InvalidRequest {
            message: "download() only applies to remote org/repo checkpoints".to_string(),
        });
    };

    let all_files = list_repo_files(&repo).await?;
    let names: Vec<&str> = all_files.iter().map(|f| f.name.as_str()).collect();

    let mut wanted: Vec<String> = Vec::new();
    match info.recipe.as_str() {
        "llamacpp" => {
            if let Some(f) = select_llamacpp_variant(&names, &variant) {
                wanted.push(f.to_string());
            }
        }
        "whispercpp" => {
            if let Some(f) = names.iter().find(|f| f.ends_with(".bin")) {
                wanted.push(f.to_string());
            }
        }
        "kokoro" | "ryzenai-llm" => wanted.extend(names.iter().map(|f| f.to_string())),
        _ => {
            if !variant.is_empty() {
                if let Some(f) = select_exact_variant(&names, &variant) {
                    wanted.push(f.to_string());
                }
            } else {
                wanted.extend(names.iter().map(|f| f.to_string()));
            }
        }
    }
    for (role, ckpt) in &info.checkpoints {
        if role == "main" {
            continue;
        }
        if let CheckpointKind::Remote { variant: rv, .. } = parse_checkpoint(ckpt) {
            if role == "mmproj" {
                if let Some(f) = names.iter().find(|f| f.to_lowercase().contains("mmproj")) {
                    wanted.push(f.to_string());
                }
            } else if !rv.is_empty() {
                if let Some(f) = select_exact_variant(&names, &rv) {
                    wanted.push(f.to_string());
                }
            }
        }
    }
    wanted.sort();
    wanted.dedup();

    if wanted.is_empty() {
        return Err(GatewayError::DownloadFailed {
            file: repo.clone(),
            message: format!("no files in '{repo}' matched variant '{variant}'"),
            partial_path: None,
            partial_bytes: None,
        });
    }

    let files: Vec<ManifestFileEntry> = all_files
        .into_iter()
        .filter(|f| wanted.contains(&f.name))
        .collect();

    Ok(DownloadManifest {
        download_path: snapshot_dir(&repo).display().to_string(),
        files_count: files.len(),
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILES: &[&str] = &[
        "qwen3.gguf",
        "qwen3-Q4_1.gguf",
        "qwen3-Q4_0-00001-of-00002.gguf",
        "qwen3-Q4_0-00002-of-00002.gguf",
        "mmproj.gguf",
    ];

    #[test]
    fn empty_variant_picks_first_non_mmproj_gguf() {
        assert_eq!(select_llamacpp_variant(FILES, ""), Some("qwen3.gguf"));
    }

    #[test]
    fn wildcard_variant_picks_first_non_mmproj_gguf() {
        assert_eq!(select_llamacpp_variant(FILES, "*"), Some("qwen3.gguf"));
    }

    #[test]
    fn exact_filename_variant_matches_case_insensitively() {
        assert_eq!(
            select_llamacpp_variant(FILES, "qwen3.gguf"),
            Some("qwen3.gguf")
        );
    }

    #[test]
    fn suffix_variant_matches_q4_1() {
        assert_eq!(
            select_llamacpp_variant(FILES, "Q4_1"),
            Some("qwen3-Q4_1.gguf")
        );
    }

    #[test]
    fn folder_variant_matches_sharded_files() {
        // Folder-sharded form is modeled as a relative-path prefix, not
        // covered by the flat FILES list above, so use a dedicated set.
        let sharded = &["Q4_0/model-00001-of-00002.gguf", "Q4_0/model-00002-of-00002.gguf"];
        assert_eq!(
            select_llamacpp_variant(sharded, "Q4_0/"),
            Some("Q4_0/model-00001-of-00002.gguf")
        );
    }

    #[test]
    fn parse_checkpoint_detects_shapes() {
        assert_eq!(
            parse_checkpoint("Qwen/Qwen3-0.5B:Q4_0"),
            CheckpointKind::Remote {
                repo: "Qwen/Qwen3-0.5B".to_string(),
                variant: "Q4_0".to_string()
            }
        );
        assert_eq!(
            parse_checkpoint("/abs/path/model.gguf"),
            CheckpointKind::LocalPath("/abs/path/model.gguf".to_string())
        );
        assert_eq!(
            parse_checkpoint("gemma3:4b"),
            CheckpointKind::Opaque("gemma3:4b".to_string())
        );
    }
}
