//! Integration tests for catalogue merging and capability-based filtering,
//! independent of the HTTP layer.

use citrine::capability::{CapabilityReport, RecipeCapability};
use citrine::catalogue::{shipped::shipped_models, Catalogue};
use citrine::config::GatewayConfig;

#[test]
fn unsupported_recipe_is_filtered_out_with_a_reason() {
    let cfg = GatewayConfig::default();
    let mut caps = CapabilityReport::permissive_for_tests();
    caps.recipes.insert(
        "sd-cpp".to_string(),
        RecipeCapability {
            supported: false,
            available: false,
            supported_backends_in_preference_order: vec![],
            reason_if_unsupported: Some("no compatible GPU driver found".to_string()),
        },
    );
    let cat = Catalogue::build(shipped_models(), &cfg, &caps);

    assert!(cat.get("SDXL-Turbo-GGUF").is_none());
    assert_eq!(
        cat.filter_reason("SDXL-Turbo-GGUF").as_deref(),
        Some("no compatible GPU driver found")
    );
    assert!(cat.get("Llama-3.1-8B-Instruct-GGUF").is_some());
}

#[test]
fn disable_filtering_bypasses_capability_checks_entirely() {
    let mut cfg = GatewayConfig::default();
    cfg.disable_filtering = true;
    let mut caps = CapabilityReport::permissive_for_tests();
    caps.recipes.insert(
        "sd-cpp".to_string(),
        RecipeCapability {
            supported: false,
            available: false,
            supported_backends_in_preference_order: vec![],
            reason_if_unsupported: Some("no compatible GPU driver found".to_string()),
        },
    );
    let cat = Catalogue::build(shipped_models(), &cfg, &caps);
    assert!(cat.get("SDXL-Turbo-GGUF").is_some());
}

#[test]
fn oversized_model_is_filtered_against_the_available_memory_pool() {
    let cfg = GatewayConfig::default();
    let mut caps = CapabilityReport::permissive_for_tests();
    caps.total_ram_gb = 1.0;
    let cat = Catalogue::build(shipped_models(), &cfg, &caps);

    // Llama-3.1-8B-Instruct-GGUF is 5.2 GB; an 0.8 GB ram-derived limit
    // excludes it while leaving the small embedding/reranking models visible.
    assert!(cat.get("Llama-3.1-8B-Instruct-GGUF").is_none());
    assert!(cat.get("Nomic-Embed-Text-GGUF").is_some());
}

#[test]
fn registering_a_user_model_requires_the_user_prefix() {
    let cfg = GatewayConfig::default();
    let caps = CapabilityReport::permissive_for_tests();
    let mut cat = Catalogue::build(shipped_models(), &cfg, &caps);
    let result = cat.register_user("no-prefix", "/abs/path/model.gguf", "llamacpp", Default::default(), None, None);
    assert!(result.is_err());
}

#[test]
fn every_shipped_model_is_visible_under_the_permissive_test_report() {
    let cfg = GatewayConfig::default();
    let caps = CapabilityReport::permissive_for_tests();
    let cat = Catalogue::build(shipped_models(), &cfg, &caps);
    for m in shipped_models() {
        assert!(cat.get(&m.model_name).is_some(), "{} unexpectedly filtered", m.model_name);
    }
}
