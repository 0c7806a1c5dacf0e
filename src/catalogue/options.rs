//! `RecipeOptions` -- a scoped key/value bag, modelled as one variant per
//! recipe (§9: "model it as a tagged union ... so invalid combinations are
//! unrepresentable") rather than a free-form map.

use crate::config;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "recipe", rename_all = "kebab-case")]
pub enum RecipeOptions {
    Llamacpp {
        ctx_size: Option<u32>,
        llamacpp_backend: Option<LlamacppBackend>,
        llamacpp_args: Option<String>,
    },
    Whispercpp {
        whispercpp_backend: Option<WhispercppBackend>,
    },
    Flm {
        ctx_size: Option<u32>,
    },
    RyzenaiLlm {
        ctx_size: Option<u32>,
    },
    SdCpp {
        sd_cpp_backend: Option<SdCppBackend>,
        steps: Option<u32>,
        cfg_scale: Option<f32>,
        width: Option<u32>,
        height: Option<u32>,
    },
    Kokoro {},
    /// Unrecognised recipe: options pass through opaquely rather than
    /// failing catalogue construction.
    Other(HashMap<String, serde_json::Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlamacppBackend {
    Cpu,
    Vulkan,
    Rocm,
    Metal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhispercppBackend {
    Cpu,
    Npu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdCppBackend {
    Cpu,
    Rocm,
}

impl Default for RecipeOptions {
    fn default() -> Self {
        RecipeOptions::Llamacpp {
            ctx_size: None,
            llamacpp_backend: None,
            llamacpp_args: None,
        }
    }
}

impl RecipeOptions {
    pub fn default_for(recipe: &str) -> RecipeOptions {
        match recipe {
            "llamacpp" => RecipeOptions::Llamacpp {
                ctx_size: None,
                llamacpp_backend: None,
                llamacpp_args: None,
            },
            "whispercpp" => RecipeOptions::Whispercpp {
                whispercpp_backend: None,
            },
            "flm" => RecipeOptions::Flm { ctx_size: None },
            "ryzenai-llm" => RecipeOptions::RyzenaiLlm { ctx_size: None },
            "sd-cpp" => RecipeOptions::SdCpp {
                sd_cpp_backend: None,
                steps: None,
                cfg_scale: None,
                width: None,
                height: None,
            },
            "kokoro" => RecipeOptions::Kokoro {},
            other => RecipeOptions::Other(HashMap::from([(
                "recipe".to_string(),
                serde_json::Value::String(other.to_string()),
            )])),
        }
    }

    /// Inheritance order (most specific wins): load-call overrides -> saved
    /// per-model overrides -> global defaults -> recipe defaults. `self` is
    /// the less specific side, `over` the more specific side.
    pub fn merged_over(self, over: RecipeOptions) -> RecipeOptions {
        use RecipeOptions::*;
        match (self, over) {
            (
                Llamacpp { ctx_size: bc, llamacpp_backend: bb, llamacpp_args: ba },
                Llamacpp { ctx_size: oc, llamacpp_backend: ob, llamacpp_args: oa },
            ) => Llamacpp {
                ctx_size: oc.or(bc),
                llamacpp_backend: ob.or(bb),
                llamacpp_args: oa.or(ba),
            },
            (Whispercpp { whispercpp_backend: bb }, Whispercpp { whispercpp_backend: ob }) => {
                Whispercpp { whispercpp_backend: ob.or(bb) }
            }
            (Flm { ctx_size: bc }, Flm { ctx_size: oc }) => Flm { ctx_size: oc.or(bc) },
            (RyzenaiLlm { ctx_size: bc }, RyzenaiLlm { ctx_size: oc }) => {
                RyzenaiLlm { ctx_size: oc.or(bc) }
            }
            (
                SdCpp { sd_cpp_backend: bb, steps: bs, cfg_scale: bc, width: bw, height: bh },
                SdCpp { sd_cpp_backend: ob, steps: os, cfg_scale: oc, width: ow, height: oh },
            ) => SdCpp {
                sd_cpp_backend: ob.or(bb),
                steps: os.or(bs),
                cfg_scale: oc.or(bc),
                width: ow.or(bw),
                height: oh.or(bh),
            },
            (Kokoro {}, Kokoro {}) => Kokoro {},
            (_, over) => over,
        }
    }
}

pub fn load_recipe_options() -> HashMap<String, RecipeOptions> {
    match fs::read(config::recipe_options_path()) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

pub fn save_recipe_options(
    all: &HashMap<String, RecipeOptions>,
) -> Result<(), crate::error::GatewayError> {
    super::atomic_write_json(&config::recipe_options_path(), all)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_call_overrides_beat_saved_defaults() {
        let saved = RecipeOptions::Llamacpp {
            ctx_size: Some(4096),
            llamacpp_backend: Some(LlamacppBackend::Cpu),
            llamacpp_args: None,
        };
        let load_call = RecipeOptions::Llamacpp {
            ctx_size: Some(8192),
            llamacpp_backend: None,
            llamacpp_args: None,
        };
        let merged = saved.merged_over(load_call);
        match merged {
            RecipeOptions::Llamacpp { ctx_size, llamacpp_backend, .. } => {
                assert_eq!(ctx_size, Some(8192));
                assert_eq!(llamacpp_backend, Some(LlamacppBackend::Cpu));
            }
            _ => panic!("expected llamacpp options"),
        }
    }

    #[test]
    fn round_trips_through_json() {
        let opts = RecipeOptions::SdCpp {
            sd_cpp_backend: Some(SdCppBackend::Rocm),
            steps: Some(30),
            cfg_scale: Some(7.5),
            width: Some(512),
            height: Some(512),
        };
        let json = serde_json::to_string(&opts).unwrap();
        let back: RecipeOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(opts, back);
    }
}
