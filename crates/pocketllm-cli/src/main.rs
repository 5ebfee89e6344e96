use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;
mod consumer;
mod store;

use commands::SamplingArgs;
use config::load_config;

/// pocketllm: run small GGUF language models on the local CPU
#[derive(Debug, Parser)]
#[command(name = "pocketllm", version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Path to a custom configuration file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log format: "pretty" (default) or "json".
    #[arg(long, global = true, default_value = "pretty", value_name = "FORMAT")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct GenerationArgs {
    /// Maximum number of new tokens to generate.
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Sampling temperature (0.0 = greedy, default 0.7).
    #[arg(long)]
    temperature: Option<f64>,

    /// Top-p nucleus sampling threshold (0.0 to 1.0, default 0.9).
    #[arg(long)]
    top_p: Option<f64>,

    /// Print throughput after each response.
    #[arg(long)]
    stats: bool,
}

impl GenerationArgs {
    fn sampling(&self) -> SamplingArgs {
        SamplingArgs {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single prompt and stream the reply to stdout.
    Run {
        /// Model id in the store, or a path to a .gguf file.
        /// Defaults to `model.selected` from the configuration.
        #[arg(long, short = 'm')]
        model: Option<String>,

        /// Prompt text.
        #[arg(long)]
        prompt: String,

        /// System prompt placed before the conversation.
        #[arg(long, default_value = "You are a helpful assistant.")]
        system: String,

        /// Skip chat-template formatting and send the raw prompt to the model.
        #[arg(long)]
        raw: bool,

        #[command(flatten)]
        generation: GenerationArgs,
    },

    /// Start an interactive multi-turn chat session (model stays in memory).
    Chat {
        /// Model id in the store, or a path to a .gguf file.
        #[arg(long, short = 'm')]
        model: Option<String>,

        /// System prompt placed before the conversation.
        #[arg(long, default_value = "You are a helpful assistant.")]
        system: String,

        #[command(flatten)]
        generation: GenerationArgs,
    },

    /// List models in the local store.
    List,

    /// Show the GGUF header of a model.
    Info {
        /// Model id in the store, or a path to a .gguf file.
        #[arg(long, short = 'm')]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_format);

    let cfg = load_config(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Run { model, prompt, system, raw, generation } => {
            commands::run::run(
                model.as_deref(),
                &prompt,
                &system,
                raw,
                generation.sampling(),
                generation.stats,
                &cfg,
            )
            .await?;
        }
        Commands::Chat { model, system, generation } => {
            commands::chat::run(model.as_deref(), &system, generation.sampling(), generation.stats, &cfg)
                .await?;
        }
        Commands::List => {
            commands::list::run(&cfg)?;
        }
        Commands::Info { model } => {
            commands::info::run(model.as_deref(), &cfg)?;
        }
    }

    Ok(())
}

/// Logs go to stderr; stdout carries the generated text.
fn init_tracing(log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().pretty().with_writer(std::io::stderr)).init();
    }
}
