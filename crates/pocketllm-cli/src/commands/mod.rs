pub mod chat;
pub mod info;
pub mod list;
pub mod run;

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use pocketllm_core::{ChatFormat, ControllerConfig, StreamController, StreamEvent};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

use crate::config::{expand_cache_dir, resolve_model_id, AppConfig};
use crate::consumer::Outcome;
use crate::store::ModelStore;

/// Per-request sampling options; `None` falls back to the configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SamplingArgs {
    pub max_tokens: Option<usize>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
}

impl SamplingArgs {
    pub fn max_tokens(&self, config: &AppConfig) -> usize {
        self.max_tokens.unwrap_or(config.inference.max_tokens)
    }

    pub fn temperature(&self, config: &AppConfig) -> f32 {
        self.temperature.unwrap_or(config.inference.temperature) as f32
    }

    pub fn top_p(&self, config: &AppConfig) -> f32 {
        self.top_p.unwrap_or(config.inference.top_p) as f32
    }
}

pub fn open_store(config: &AppConfig) -> anyhow::Result<ModelStore> {
    let root = expand_cache_dir(&config.model.cache_dir);
    ModelStore::new(&root).with_context(|| format!("Cannot open model store at {}", root.display()))
}

/// Resolve the model to a validated `.gguf` path. Returns `(id, path)`.
pub fn resolve_model(model: Option<&str>, config: &AppConfig) -> anyhow::Result<(String, PathBuf)> {
    let id = resolve_model_id(model, config)?;
    let path = open_store(config)?
        .resolve(&id)
        .with_context(|| format!("Cannot use model '{id}'"))?;
    Ok((id, path))
}

pub fn controller_config(config: &AppConfig) -> ControllerConfig {
    ControllerConfig {
        context_size: config.inference.context_size,
        threads: config.inference.threads,
        use_mmap: config.inference.use_mmap,
        reserved_for_generation: config.inference.reserved_for_generation,
        chat_format: config
            .model
            .chat_format
            .as_deref()
            .and_then(|s| s.parse::<ChatFormat>().ok()),
        stop_markers: None,
    }
}

/// Start the session worker on the runtime selected at build time.
pub fn start_controller(
    config: &AppConfig,
) -> anyhow::Result<(StreamController, UnboundedReceiver<StreamEvent>)> {
    #[cfg(feature = "llama-cpp")]
    let runtime = pocketllm_core::LlamaCppRuntime::new();
    #[cfg(not(feature = "llama-cpp"))]
    let runtime = pocketllm_core::CandleRuntime::new();

    info!(runtime = std::any::type_name_of_val(&runtime), "Starting session worker");
    StreamController::spawn(runtime, controller_config(config))
        .context("Failed to start the session worker thread")
}

/// Stop the worker and join its thread off the async executor.
pub async fn stop_controller(controller: StreamController) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || controller.shutdown())
        .await
        .context("Session worker did not shut down cleanly")
}

pub fn inactivity_timeout(config: &AppConfig) -> Duration {
    Duration::from_secs(config.inference.inactivity_timeout_secs.max(1))
}

pub fn print_text(text: &str) -> std::io::Result<()> {
    let mut out = std::io::stdout().lock();
    out.write_all(text.as_bytes())?;
    out.flush()
}

/// Turn a non-successful outcome into an error; print stats on success.
pub fn finish(outcome: Outcome, stats: bool, timeout: Duration) -> anyhow::Result<()> {
    match outcome {
        Outcome::Completed { tokens_per_second } => {
            if stats {
                match tokens_per_second {
                    Some(tps) => eprintln!("\n[stats] {tps:.1} tok/s"),
                    None => eprintln!("\n[stats] no tokens generated"),
                }
            }
            Ok(())
        }
        Outcome::Cancelled => {
            eprintln!("\n[cancelled]");
            Ok(())
        }
        Outcome::Failed(message) => bail!("Generation failed: {message}"),
        Outcome::TimedOut => bail!("No output for {} s; request cancelled", timeout.as_secs()),
        Outcome::Disconnected => bail!("Session worker stopped unexpectedly"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_args_fall_back_to_config() {
        let cfg = AppConfig::default();
        let args = SamplingArgs { max_tokens: Some(7), ..Default::default() };
        assert_eq!(args.max_tokens(&cfg), 7);
        assert!((args.temperature(&cfg) - 0.7).abs() < 1e-6);
        assert!((args.top_p(&cfg) - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_controller_config_maps_inference_section() {
        let mut cfg = AppConfig::default();
        cfg.inference.context_size = 2048;
        cfg.model.chat_format = Some("llama3".into());
        let cc = controller_config(&cfg);
        assert_eq!(cc.context_size, 2048);
        assert_eq!(cc.threads, 4);
        assert_eq!(cc.chat_format, Some(ChatFormat::LLaMA3));
        assert!(cc.stop_markers.is_none());
    }

    #[test]
    fn test_finish_maps_outcomes() {
        let t = Duration::from_secs(3);
        assert!(finish(Outcome::Completed { tokens_per_second: Some(1.0) }, true, t).is_ok());
        assert!(finish(Outcome::Cancelled, false, t).is_ok());
        assert!(finish(Outcome::Failed("x".into()), false, t).is_err());
        let err = finish(Outcome::TimedOut, false, t).unwrap_err();
        assert!(err.to_string().contains("3 s"));
    }
}
