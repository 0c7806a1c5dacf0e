//! Filesystem scan of the configured "extra models directory" (§4.E source
//! 3). Grounded on the teacher's own directory-walking auto-discovery code,
//! narrowed to the rule this gateway actually needs: every `.gguf` in the
//! directory root is a standalone model, every subdirectory holding a
//! non-`mmproj` `.gguf` is a model with the lexicographically smallest such
//! file as `main`.

use super::{ModelInfo, RecipeOptions};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

fn is_mmproj(filename: &str) -> bool {
    filename.to_lowercase().contains("mmproj")
}

fn gguf_files_in(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else { return Vec::new() };
    let mut out: Vec<String> = entries
        .flatten()
        .filter_map(|e| {
            let path = e.path();
            if path.is_file() && path.extension().and_then(|x| x.to_str()) == Some("gguf") {
                path.file_name().map(|n| n.to_string_lossy().to_string())
            } else {
                None
            }
        })
        .collect();
    out.sort();
    out
}

pub fn scan_extra_dir(dir: &Path) -> Vec<ModelInfo> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        tracing::warn!(dir = %dir.display(), "extra models directory is not readable");
        return out;
    };

    for file in gguf_files_in(dir) {
        let stem = Path::new(&file)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| file.clone());
        let name = format!("extra.{stem}");
        let path = dir.join(&file).display().to_string();
        out.push(single_file_model(&name, &path));
    }

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let gguf_files = gguf_files_in(&path);
        let non_mmproj: Vec<&String> = gguf_files.iter().filter(|f| !is_mmproj(f)).collect();
        if non_mmproj.is_empty() {
            continue;
        }
        let main_file = non_mmproj[0];
        let dirname = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = format!("extra.{dirname}");

        let mut checkpoints = HashMap::new();
        checkpoints.insert("main".to_string(), path.join(main_file).display().to_string());
        let mmproj_file = gguf_files.iter().find(|f| is_mmproj(f));
        let mut labels: HashSet<String> = HashSet::new();
        if let Some(mmproj) = mmproj_file {
            checkpoints.insert("mmproj".to_string(), path.join(mmproj).display().to_string());
            labels.insert("vision".to_string());
        }

        let mut resolved_paths = HashMap::new();
        for (role, ckpt) in &checkpoints {
            resolved_paths.insert(role.clone(), ckpt.clone());
        }

        out.push(ModelInfo {
            model_name: name,
            checkpoints,
            resolved_paths,
            recipe: "llamacpp".to_string(),
            labels,
            backend: None,
            size_gb: dir_size_gb(&path),
            downloaded: true,
            source: "extra_models_dir".to_string(),
            recipe_options: RecipeOptions::default_for("llamacpp"),
            image_defaults: None,
        });
    }

    out
}

fn single_file_model(name: &str, path: &str) -> ModelInfo {
    let mut checkpoints = HashMap::new();
    checkpoints.insert("main".to_string(), path.to_string());
    let mut resolved_paths = HashMap::new();
    resolved_paths.insert("main".to_string(), path.to_string());
    ModelInfo {
        model_name: name.to_string(),
        checkpoints,
        resolved_paths,
        recipe: "llamacpp".to_string(),
        labels: HashSet::new(),
        backend: None,
        size_gb: fs::metadata(path)
            .map(|m| m.len() as f64 / 1e9)
            .unwrap_or(0.0),
        downloaded: true,
        source: "extra_models_dir".to_string(),
        recipe_options: RecipeOptions::default_for("llamacpp"),
        image_defaults: None,
    }
}

fn dir_size_gb(dir: &Path) -> f64 {
    let Ok(entries) = fs::read_dir(dir) else { return 0.0 };
    let total: u64 = entries
        .flatten()
        .filter_map(|e| fs::metadata(e.path()).ok().map(|m| m.len()))
        .sum();
    total as f64 / 1e9
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn root_gguf_becomes_standalone_model() {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("tiny.gguf"))
            .unwrap()
            .write_all(b"x")
            .unwrap();
        let models = scan_extra_dir(dir.path());
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].model_name, "extra.tiny");
        assert!(models[0].downloaded);
    }

    #[test]
    fn subdirectory_smallest_gguf_becomes_main_and_mmproj_attaches() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("my-model");
        fs::create_dir(&sub).unwrap();
        File::create(sub.join("z-weights.gguf")).unwrap().write_all(b"x").unwrap();
        File::create(sub.join("a-weights.gguf")).unwrap().write_all(b"x").unwrap();
        File::create(sub.join("mmproj-f16.gguf")).unwrap().write_all(b"x").unwrap();

        let models = scan_extra_dir(dir.path());
        assert_eq!(models.len(), 1);
        let m = &models[0];
        assert_eq!(m.model_name, "extra.my-model");
        assert!(m.checkpoints["main"].ends_with("a-weights.gguf"));
        assert!(m.checkpoints.contains_key("mmproj"));
        assert!(m.labels.contains("vision"));
    }

    #[test]
    fn directory_with_only_mmproj_is_skipped() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("incomplete");
        fs::create_dir(&sub).unwrap();
        File::create(sub.join("mmproj.gguf")).unwrap().write_all(b"x").unwrap();
        assert!(scan_extra_dir(dir.path()).is_empty());
    }
}
