//! Command-line surface (§6): `serve`/`run`/`pull`/`list`/`delete`/`status`/
//! `stop`/`recipes`/`tray`, plus the recipe-option passthrough flags that
//! seed the saved `recipe_options.json` defaults.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "citrine",
    version,
    about = "Citrine: local inference gateway multiplexing OpenAI-compatible requests across llama.cpp, FLM, RyzenAI, whisper.cpp, Kokoro and Stable Diffusion backends."
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Port to bind the HTTP front end to.
    #[arg(long)]
    pub port: Option<u16>,

    /// Host/address to bind the HTTP front end to.
    #[arg(long)]
    pub host: Option<String>,

    /// Log verbosity.
    #[arg(long, value_parser = ["critical", "error", "warning", "info", "debug", "trace"])]
    pub log_level: Option<String>,

    /// Additional directory to search for user-registered models.
    #[arg(long)]
    pub extra_models_dir: Option<String>,

    /// Disable the mDNS/LAN discovery broadcast.
    #[arg(long)]
    pub no_broadcast: bool,

    /// Maximum concurrently loaded backends per model type; -1 for unbounded.
    #[arg(long, allow_negative_numbers = true)]
    pub max_loaded_models: Option<i64>,

    #[command(flatten)]
    pub recipe: RecipeOptionArgs,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct RecipeOptionArgs {
    /// llama.cpp / FLM / RyzenAI-LLM context size, in tokens.
    #[arg(long)]
    pub ctx_size: Option<u32>,

    /// Force the llama.cpp recipe and select its compute backend
    /// (cpu, vulkan, rocm, metal).
    #[arg(long)]
    pub llamacpp: Option<String>,

    /// Extra arguments forwarded verbatim to the llama.cpp server binary.
    #[arg(long)]
    pub llamacpp_args: Option<String>,

    /// Force the sd-cpp recipe and select its compute backend (cpu, rocm).
    #[arg(long)]
    pub sdcpp: Option<String>,

    /// Force the whisper.cpp recipe and select its compute backend
    /// (cpu, npu).
    #[arg(long)]
    pub whispercpp: Option<String>,

    /// Diffusion step count (sd-cpp).
    #[arg(long)]
    pub steps: Option<u32>,

    /// Classifier-free-guidance scale (sd-cpp).
    #[arg(long)]
    pub cfg_scale: Option<f32>,

    /// Output image width (sd-cpp).
    #[arg(long)]
    pub width: Option<u32>,

    /// Output image height (sd-cpp).
    #[arg(long)]
    pub height: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server in the foreground, with no model preloaded.
    Serve(ServeArgs),

    /// Run the HTTP server and immediately load MODEL.
    Run {
        model: String,

        #[command(flatten)]
        serve: ServeArgs,

        /// Persist the resolved recipe options as this model's defaults.
        #[arg(long)]
        save_options: bool,
    },

    /// Download MODEL into the local cache without loading it.
    Pull {
        model: String,

        /// Checkpoint identifier, or an absolute local path to copy in
        /// (requires --recipe).
        #[arg(long)]
        checkpoint: Option<String>,

        /// Recipe to register the model under; mandatory when --checkpoint
        /// is a local path.
        #[arg(long)]
        recipe: Option<String>,

        #[arg(long)]
        reasoning: bool,

        #[arg(long)]
        vision: bool,

        #[arg(long)]
        embedding: bool,

        #[arg(long)]
        reranking: bool,

        /// Multimodal projector file to pull alongside the main checkpoint.
        #[arg(long)]
        mmproj: Option<String>,
    },

    /// List all catalogued models and whether each is downloaded/loaded.
    List,

    /// Remove a downloaded model's files from the local cache.
    Delete { model: String },

    /// Query a running gateway's health and loaded-model state.
    Status,

    /// Ask a running gateway to shut down gracefully.
    Stop,

    /// Print the supported recipes and their option schemas.
    Recipes,

    /// Run as a background process with a system-tray icon (desktop only).
    Tray(ServeArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_with_no_flags_parses() {
        let cli = Cli::try_parse_from(["citrine", "serve"]).unwrap();
        match cli.cmd {
            Command::Serve(args) => {
                assert!(args.port.is_none());
                assert!(!args.no_broadcast);
            }
            _ => panic!("expected Serve command"),
        }
    }

    #[test]
    fn serve_accepts_port_and_host_and_max_loaded_models() {
        let cli = Cli::try_parse_from([
            "citrine",
            "serve",
            "--port",
            "9999",
            "--host",
            "0.0.0.0",
            "--max-loaded-models",
            "-1",
        ])
        .unwrap();
        match cli.cmd {
            Command::Serve(args) => {
                assert_eq!(args.port, Some(9999));
                assert_eq!(args.host.as_deref(), Some("0.0.0.0"));
                assert_eq!(args.max_loaded_models, Some(-1));
            }
            _ => panic!("expected Serve command"),
        }
    }

    #[test]
    fn run_requires_model_and_accepts_save_options() {
        let cli = Cli::try_parse_from(["citrine", "run", "phi-4-mini", "--save-options"]).unwrap();
        match cli.cmd {
            Command::Run { model, save_options, .. } => {
                assert_eq!(model, "phi-4-mini");
                assert!(save_options);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn pull_with_local_checkpoint_and_recipe() {
        let cli = Cli::try_parse_from([
            "citrine",
            "pull",
            "my-model",
            "--checkpoint",
            "/abs/path/model.gguf",
            "--recipe",
            "llamacpp",
            "--reasoning",
        ])
        .unwrap();
        match cli.cmd {
            Command::Pull { model, checkpoint, recipe, reasoning, .. } => {
                assert_eq!(model, "my-model");
                assert_eq!(checkpoint.as_deref(), Some("/abs/path/model.gguf"));
                assert_eq!(recipe.as_deref(), Some("llamacpp"));
                assert!(reasoning);
            }
            _ => panic!("expected Pull command"),
        }
    }

    #[test]
    fn delete_requires_model_name() {
        let cli = Cli::try_parse_from(["citrine", "delete", "old-model"]).unwrap();
        match cli.cmd {
            Command::Delete { model } => assert_eq!(model, "old-model"),
            _ => panic!("expected Delete command"),
        }
    }

    #[test]
    fn bare_subcommands_parse() {
        assert!(matches!(Cli::try_parse_from(["citrine", "list"]).unwrap().cmd, Command::List));
        assert!(matches!(Cli::try_parse_from(["citrine", "status"]).unwrap().cmd, Command::Status));
        assert!(matches!(Cli::try_parse_from(["citrine", "stop"]).unwrap().cmd, Command::Stop));
        assert!(matches!(Cli::try_parse_from(["citrine", "recipes"]).unwrap().cmd, Command::Recipes));
    }
}
