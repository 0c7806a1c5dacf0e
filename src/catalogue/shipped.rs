//! The shipped server-catalogue (§4.E source 1): a small, read-only seed
//! list of known models, one per recipe, in the repo-id/checkpoint shape the
//! original `model_manager` documents (e.g. `org/repo:variant`).

use super::{ImageDefaults, ModelInfo, RecipeOptions};
use std::collections::{HashMap, HashSet};

fn labels(tags: &[&str]) -> HashSet<String> {
    tags.iter().map(|t| t.to_string()).collect()
}

fn checkpoint(main: &str) -> HashMap<String, String> {
    HashMap::from([("main".to_string(), main.to_string())])
}

pub fn shipped_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            model_name: "Qwen2.5-Coder-3B-Instruct-GGUF".to_string(),
            checkpoints: checkpoint("Qwen/Qwen2.5-Coder-3B-Instruct-GGUF:Q4_0"),
            resolved_paths: HashMap::new(),
            recipe: "llamacpp".to_string(),
            labels: labels(&["reasoning"]),
            backend: None,
            size_gb: 2.1,
            downloaded: false,
            source: "shipped".to_string(),
            recipe_options: RecipeOptions::default_for("llamacpp"),
            image_defaults: None,
        },
        ModelInfo {
            model_name: "Llama-3.1-8B-Instruct-GGUF".to_string(),
            checkpoints: checkpoint("unsloth/Meta-Llama-3.1-8B-Instruct-GGUF:Q4_K_M"),
            resolved_paths: HashMap::new(),
            recipe: "llamacpp".to_string(),
            labels: labels(&["reasoning"]),
            backend: None,
            size_gb: 5.2,
            downloaded: false,
            source: "shipped".to_string(),
            recipe_options: RecipeOptions::default_for("llamacpp"),
            image_defaults: None,
        },
        ModelInfo {
            model_name: "Qwen2-VL-7B-Instruct-GGUF".to_string(),
            checkpoints: {
                let mut m = checkpoint("unsloth/Qwen2-VL-7B-Instruct-GGUF:Q4_K_M");
                m.insert("mmproj".to_string(), "unsloth/Qwen2-VL-7B-Instruct-GGUF:mmproj-f16.gguf".to_string());
                m
            },
            resolved_paths: HashMap::new(),
            recipe: "llamacpp".to_string(),
            labels: labels(&["reasoning", "vision"]),
            backend: None,
            size_gb: 6.3,
            downloaded: false,
            source: "shipped".to_string(),
            recipe_options: RecipeOptions::default_for("llamacpp"),
            image_defaults: None,
        },
        ModelInfo {
            model_name: "Nomic-Embed-Text-GGUF".to_string(),
            checkpoints: checkpoint("nomic-ai/nomic-embed-text-v1.5-GGUF:Q8_0"),
            resolved_paths: HashMap::new(),
            recipe: "llamacpp".to_string(),
            labels: labels(&["embeddings"]),
            backend: None,
            size_gb: 0.3,
            downloaded: false,
            source: "shipped".to_string(),
            recipe_options: RecipeOptions::default_for("llamacpp"),
            image_defaults: None,
        },
        ModelInfo {
            model_name: "BGE-Reranker-Base-GGUF".to_string(),
            checkpoints: checkpoint("BAAI/bge-reranker-base-GGUF:Q8_0"),
            resolved_paths: HashMap::new(),
            recipe: "llamacpp".to_string(),
            labels: labels(&["reranking"]),
            backend: None,
            size_gb: 0.3,
            downloaded: false,
            source: "shipped".to_string(),
            recipe_options: RecipeOptions::default_for("llamacpp"),
            image_defaults: None,
        },
        ModelInfo {
            model_name: "Whisper-Large-v3-GGUF".to_string(),
            checkpoints: checkpoint("ggerganov/whisper.cpp:ggml-large-v3.bin"),
            resolved_paths: HashMap::new(),
            recipe: "whispercpp".to_string(),
            labels: labels(&["audio-asr"]),
            backend: None,
            size_gb: 3.1,
            downloaded: false,
            source: "shipped".to_string(),
            recipe_options: RecipeOptions::default_for("whispercpp"),
            image_defaults: None,
        },
        ModelInfo {
            model_name: "Kokoro-82M".to_string(),
            checkpoints: checkpoint("hexgrad/Kokoro-82M"),
            resolved_paths: HashMap::new(),
            recipe: "kokoro".to_string(),
            labels: labels(&["audio-tts"]),
            backend: None,
            size_gb: 0.3,
            downloaded: false,
            source: "shipped".to_string(),
            recipe_options: RecipeOptions::default_for("kokoro"),
            image_defaults: None,
        },
        ModelInfo {
            model_name: "SDXL-Turbo-GGUF".to_string(),
            checkpoints: checkpoint("stabilityai/sdxl-turbo-GGUF:Q8_0"),
            resolved_paths: HashMap::new(),
            recipe: "sd-cpp".to_string(),
            labels: labels(&["image"]),
            backend: None,
            size_gb: 6.9,
            downloaded: false,
            source: "shipped".to_string(),
            recipe_options: RecipeOptions::default_for("sd-cpp"),
            image_defaults: Some(ImageDefaults {
                steps: Some(4),
                cfg_scale: Some(1.0),
                width: Some(512),
                height: Some(512),
            }),
        },
        ModelInfo {
            model_name: "Qwen3-8B-FLM".to_string(),
            checkpoints: checkpoint("unsloth/Qwen3-8B-GGUF:qwen3.gguf"),
            resolved_paths: HashMap::new(),
            recipe: "flm".to_string(),
            labels: labels(&["reasoning"]),
            backend: Some("npu".to_string()),
            size_gb: 4.8,
            downloaded: false,
            source: "shipped".to_string(),
            recipe_options: RecipeOptions::default_for("flm"),
            image_defaults: None,
        },
        ModelInfo {
            model_name: "Llama-3.2-3B-RyzenAI".to_string(),
            checkpoints: checkpoint("amd/Llama-3.2-3B-Instruct-RyzenAI"),
            resolved_paths: HashMap::new(),
            recipe: "ryzenai-llm".to_string(),
            labels: labels(&["reasoning"]),
            backend: Some("npu".to_string()),
            size_gb: 2.4,
            downloaded: false,
            source: "shipped".to_string(),
            recipe_options: RecipeOptions::default_for("ryzenai-llm"),
            image_defaults: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_shipped_model_has_a_main_checkpoint() {
        for m in shipped_models() {
            assert!(m.main_checkpoint().is_some(), "{} has no main checkpoint", m.model_name);
        }
    }

    #[test]
    fn shipped_model_names_are_unique() {
        let models = shipped_models();
        let mut names: Vec<&str> = models.iter().map(|m| m.model_name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), models.len());
    }
}
