pub mod adapters;
pub mod capability;
pub mod catalogue;
pub mod cli;
pub mod config;
pub mod download;
pub mod error;
pub mod http;
pub mod process;
pub mod router;
pub mod supervisor;
pub mod telemetry;

use catalogue::{Catalogue, ModelInfo, RecipeOptions};
use cli::{Command, RecipeOptionArgs, ServeArgs};
use error::GatewayError;
use std::sync::Arc;
use tokio::sync::RwLock;

pub async fn run(cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Serve(args) => serve_foreground(args, None, false).await,
        Command::Run { model, serve, save_options } => {
            serve_foreground(serve, Some(model), save_options).await
        }
        Command::Tray(args) => {
            tracing::warn!("tray UI is out of scope for this gateway; running headless instead");
            serve_foreground(args, None, false).await
        }
        Command::Pull { model, checkpoint, recipe, reasoning, vision, embedding, reranking, mmproj } => {
            pull(model, checkpoint, recipe, reasoning, vision, embedding, reranking, mmproj).await
        }
        Command::List => list().await,
        Command::Delete { model } => delete(model).await,
        Command::Status => status().await,
        Command::Stop => stop().await,
        Command::Recipes => recipes(),
    }
}

fn apply_serve_args(args: &ServeArgs, cfg: &mut config::GatewayConfig) {
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(host) = &args.host {
        cfg.host = host.clone();
    }
    if let Some(dir) = &args.extra_models_dir {
        cfg.extra_models_dir = Some(std::path::PathBuf::from(dir));
    }
    if args.no_broadcast {
        cfg.no_broadcast = true;
    }
    if let Some(n) = args.max_loaded_models {
        cfg.max_loaded_models = n;
    }
    if let Some(level) = &args.log_level {
        cfg.log_level = level.clone();
    }
}

/// Applies the CLI's recipe-option passthrough flags as a `RecipeOptions`
/// overlay on top of a model's existing (saved or shipped-default) options.
pub fn apply_recipe_overlay(base: RecipeOptions, args: &RecipeOptionArgs) -> RecipeOptions {
    let recipe_forced = args
        .llamacpp
        .as_ref()
        .map(|_| "llamacpp")
        .or(args.sdcpp.as_ref().map(|_| "sd-cpp"))
        .or(args.whispercpp.as_ref().map(|_| "whispercpp"));

    let mut opts = match recipe_forced {
        Some(r) if current_recipe_tag(&base) != r => base.merged_over(RecipeOptions::default_for(r)),
        _ => base,
    };

    if let RecipeOptions::Llamacpp { ctx_size, llamacpp_backend, llamacpp_args } = &mut opts {
        if args.ctx_size.is_some() {
            *ctx_size = args.ctx_size;
        }
        if let Some(b) = &args.llamacpp {
            *llamacpp_backend = parse_backend(b);
        }
        if args.llamacpp_args.is_some() {
            *llamacpp_args = args.llamacpp_args.clone();
        }
    }
    if let RecipeOptions::Flm { ctx_size } | RecipeOptions::RyzenaiLlm { ctx_size } = &mut opts {
        if args.ctx_size.is_some() {
            *ctx_size = args.ctx_size;
        }
    }
    if let RecipeOptions::SdCpp { sd_cpp_backend, steps, cfg_scale, width, height } = &mut opts {
        if let Some(b) = &args.sdcpp {
            *sd_cpp_backend = match b.to_ascii_lowercase().as_str() {
                "cpu" => Some(catalogue::options::SdCppBackend::Cpu),
                "rocm" => Some(catalogue::options::SdCppBackend::Rocm),
                _ => *sd_cpp_backend,
            };
        }
        if args.steps.is_some() {
            *steps = args.steps;
        }
        if args.cfg_scale.is_some() {
            *cfg_scale = args.cfg_scale;
        }
        if args.width.is_some() {
            *width = args.width;
        }
        if args.height.is_some() {
            *height = args.height;
        }
    }
    if let RecipeOptions::Whispercpp { whispercpp_backend } = &mut opts {
        if let Some(b) = &args.whispercpp {
            *whispercpp_backend = match b.to_ascii_lowercase().as_str() {
                "cpu" => Some(catalogue::options::WhispercppBackend::Cpu),
                "npu" => Some(catalogue::options::WhispercppBackend::Npu),
                _ => *whispercpp_backend,
            };
        }
    }
    opts
}

fn current_recipe_tag(opts: &RecipeOptions) -> &'static str {
    match opts {
        RecipeOptions::Llamacpp { .. } => "llamacpp",
        RecipeOptions::Whispercpp { .. } => "whispercpp",
        RecipeOptions::Flm { .. } => "flm",
        RecipeOptions::RyzenaiLlm { .. } => "ryzenai-llm",
        RecipeOptions::SdCpp { .. } => "sd-cpp",
        RecipeOptions::Kokoro {} => "kokoro",
        RecipeOptions::Other(_) => "other",
    }
}

fn parse_backend(s: &str) -> Option<catalogue::options::LlamacppBackend> {
    use catalogue::options::LlamacppBackend::*;
    match s.to_ascii_lowercase().as_str() {
        "cpu" => Some(Cpu),
        "vulkan" => Some(Vulkan),
        "rocm" => Some(Rocm),
        "metal" => Some(Metal),
        _ => None,
    }
}

pub fn build_context(cfg: config::GatewayConfig) -> Arc<http::GatewayContext> {
    let caps = capability::CapabilityReport::detect(&cfg);
    let catalogue = Catalogue::build(catalogue::shipped::shipped_models(), &cfg, &caps);
    let router = router::Router::new(cfg.max_loaded_models);
    let log_path = telemetry::init_tracing(Some(&cfg.log_level), &config::cache_dir().join("logs"));
    Arc::new(http::GatewayContext {
        catalogue: RwLock::new(catalogue),
        router,
        config: cfg,
        capabilities: caps,
        log_path,
        started_at: std::time::Instant::now(),
    })
}

async fn serve_foreground(
    args: ServeArgs,
    preload: Option<String>,
    save_options: bool,
) -> anyhow::Result<()> {
    let mut cfg = config::GatewayConfig::default();
    apply_serve_args(&args, &mut cfg);
    let ctx = build_context(cfg);

    if let Some(model_name) = preload {
        load_model_at_startup(&ctx, &model_name, &args.recipe, save_options).await?;
    }

    http::serve(ctx).await
}

async fn load_model_at_startup(
    ctx: &Arc<http::GatewayContext>,
    model_name: &str,
    recipe_args: &RecipeOptionArgs,
    save_options: bool,
) -> anyhow::Result<()> {
    let (info, options) = {
        let cat = ctx.catalogue.read().await;
        let info = cat
            .get(model_name)
            .cloned()
            .ok_or_else(|| GatewayError::ModelNotFound {
                model_name: model_name.to_string(),
                filter_reason: cat.filter_reason(model_name),
            })?;
        let options = apply_recipe_overlay(info.recipe_options.clone(), recipe_args);
        (info, options)
    };

    if !info.downloaded {
        let mut cat = ctx.catalogue.write().await;
        cat.download(model_name, false, &ctx.config, download::no_op_progress()).await?;
    }

    if save_options {
        let mut all = catalogue::options::load_recipe_options();
        all.insert(model_name.to_string(), options.clone());
        catalogue::options::save_recipe_options(&all)?;
    }

    ctx.router.load_model(model_name, info, options).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn pull(
    model: String,
    checkpoint: Option<String>,
    recipe: Option<String>,
    reasoning: bool,
    vision: bool,
    embedding: bool,
    reranking: bool,
    mmproj: Option<String>,
) -> anyhow::Result<()> {
    let cfg = config::GatewayConfig::default();
    telemetry::init_tracing(Some(&cfg.log_level), &config::cache_dir().join("logs"));
    let caps = capability::CapabilityReport::detect(&cfg);
    let mut cat = Catalogue::build(catalogue::shipped::shipped_models(), &cfg, &caps);

    if let Some(ckpt) = &checkpoint {
        let is_local_path = std::path::Path::new(ckpt).is_absolute();
        if is_local_path && recipe.is_none() {
            anyhow::bail!("--recipe is mandatory when --checkpoint is a local path");
        }
        let mut labels = std::collections::HashSet::new();
        if reasoning {
            labels.insert("reasoning".to_string());
        }
        if vision {
            labels.insert("vision".to_string());
        }
        if embedding {
            labels.insert("embeddings".to_string());
        }
        if reranking {
            labels.insert("reranking".to_string());
        }
        let user_name = if model.starts_with("user.") { model.clone() } else { format!("user.{model}") };
        cat.register_user(
            &user_name,
            ckpt,
            recipe.as_deref().unwrap_or("llamacpp"),
            labels,
            mmproj,
            if is_local_path { Some("local_upload".to_string()) } else { None },
        )?;
        cat.download(&user_name, false, &cfg, progress_to_stdout()).await?;
    } else {
        cat.download(&model, false, &cfg, progress_to_stdout()).await?;
    }
    println!("pull complete: {model}");
    Ok(())
}

fn progress_to_stdout() -> download::ProgressCb {
    Arc::new(|downloaded, total| {
        match total {
            Some(total) if total > 0 => {
                let pct = (downloaded as f64 / total as f64) * 100.0;
                print!("\rdownloading... {pct:.1}%");
            }
            _ => print!("\rdownloading... {downloaded} bytes"),
        }
        use std::io::Write;
        let _ = std::io::stdout().flush();
        true
    })
}

async fn list() -> anyhow::Result<()> {
    let cfg = config::GatewayConfig::default();
    let caps = capability::CapabilityReport::detect(&cfg);
    let cat = Catalogue::build(catalogue::shipped::shipped_models(), &cfg, &caps);
    let mut models: Vec<&ModelInfo> = cat.list();
    models.sort_by(|a, b| a.model_name.cmp(&b.model_name));
    for m in models {
        println!(
            "{:<40} recipe={:<12} downloaded={} type={:?}",
            m.model_name,
            m.recipe,
            m.downloaded,
            m.model_type()
        );
    }
    Ok(())
}

async fn delete(model: String) -> anyhow::Result<()> {
    let cfg = config::GatewayConfig::default();
    let caps = capability::CapabilityReport::detect(&cfg);
    let mut cat = Catalogue::build(catalogue::shipped::shipped_models(), &cfg, &caps);
    cat.delete(&model)?;
    println!("deleted: {model}");
    Ok(())
}

fn admin_base_url() -> String {
    let cfg = config::GatewayConfig::default();
    format!("http://{}:{}", cfg.host, cfg.port)
}

async fn status() -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/health", admin_base_url());
    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Ok(resp) => anyhow::bail!("gateway returned {}", resp.status()),
        Err(_) => anyhow::bail!("no gateway listening at {}", admin_base_url()),
    }
}

async fn stop() -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{}/internal/shutdown", admin_base_url());
    match client.post(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            println!("shutdown requested");
            Ok(())
        }
        Ok(resp) => anyhow::bail!("gateway returned {}", resp.status()),
        Err(_) => anyhow::bail!("no gateway listening at {}", admin_base_url()),
    }
}

fn recipes() -> anyhow::Result<()> {
    let cfg = config::GatewayConfig::default();
    let caps = capability::CapabilityReport::detect(&cfg);
    let mut names: Vec<&String> = caps.recipes.keys().collect();
    names.sort();
    for name in names {
        let r = &caps.recipes[name];
        println!(
            "{:<14} supported={:<5} available={:<5} backends={:?}{}",
            name,
            r.supported,
            r.available,
            r.supported_backends_in_preference_order,
            r.reason_if_unsupported.as_ref().map(|m| format!(" ({m})")).unwrap_or_default()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipe_overlay_switches_variant_when_a_different_recipe_is_forced() {
        let base = RecipeOptions::Kokoro {};
        let args = RecipeOptionArgs { llamacpp: Some("vulkan".to_string()), ctx_size: Some(4096), ..Default::default() };
        let merged = apply_recipe_overlay(base, &args);
        match merged {
            RecipeOptions::Llamacpp { ctx_size, llamacpp_backend, .. } => {
                assert_eq!(ctx_size, Some(4096));
                assert_eq!(llamacpp_backend, Some(catalogue::options::LlamacppBackend::Vulkan));
            }
            _ => panic!("expected llamacpp options"),
        }
    }

    #[test]
    fn recipe_overlay_leaves_unrelated_recipe_untouched() {
        let base = RecipeOptions::Kokoro {};
        let args = RecipeOptionArgs::default();
        assert_eq!(apply_recipe_overlay(base, &args), RecipeOptions::Kokoro {});
    }
}
