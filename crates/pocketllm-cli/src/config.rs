use std::path::PathBuf;

use anyhow::bail;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Full runtime configuration loaded from TOML + env vars.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub inference: InferenceConfig,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InferenceConfig {
    /// Non-positive selects the session default (1024).
    pub context_size: i32,
    /// Non-positive selects the session default (4).
    pub threads: i32,
    pub use_mmap: bool,
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    /// Seconds without an event before the request is cancelled.
    pub inactivity_timeout_secs: u64,
    pub reserved_for_generation: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    pub cache_dir: String,
    /// Model used when `--model` is omitted.
    #[serde(default)]
    pub selected: Option<String>,
    /// Overrides the chat format detected from the vocabulary.
    #[serde(default)]
    pub chat_format: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            inference: InferenceConfig {
                context_size: 1024,
                threads: 4,
                use_mmap: true,
                max_tokens: 512,
                temperature: 0.7,
                top_p: 0.9,
                inactivity_timeout_secs: 60,
                reserved_for_generation: 256,
            },
            model: ModelConfig {
                cache_dir: "~/.cache/pocketllm".to_string(),
                selected: None,
                chat_format: None,
            },
        }
    }
}

/// Load configuration from:
/// 1. Built-in defaults
/// 2. `config/default.toml` (if present)
/// 3. A custom config file path (if provided)
/// 4. Environment variables prefixed with `POCKETLLM_`
pub fn load_config(config_file: Option<&PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder()
        // Layer 1: defaults baked in
        .set_default("inference.context_size", 1024_i64)?
        .set_default("inference.threads", 4_i64)?
        .set_default("inference.use_mmap", true)?
        .set_default("inference.max_tokens", 512_i64)?
        .set_default("inference.temperature", 0.7)?
        .set_default("inference.top_p", 0.9)?
        .set_default("inference.inactivity_timeout_secs", 60_i64)?
        .set_default("inference.reserved_for_generation", 256_i64)?
        .set_default("model.cache_dir", "~/.cache/pocketllm")?
        // Layer 2: project default.toml
        .add_source(File::with_name("config/default").required(false));

    // Layer 3: optional user-supplied config file
    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    // Layer 4: environment variables. Keys contain underscores, so nesting
    // uses a double underscore: POCKETLLM_INFERENCE__CONTEXT_SIZE.
    builder = builder.add_source(
        Environment::with_prefix("POCKETLLM")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// Expand `~` in cache_dir to the actual home directory.
pub fn expand_cache_dir(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches(['/', '\\']));
        }
    }
    PathBuf::from(raw)
}

/// The model named on the command line, else the stored selection.
pub fn resolve_model_id(cli_model: Option<&str>, config: &AppConfig) -> anyhow::Result<String> {
    match cli_model.or(config.model.selected.as_deref()) {
        Some(id) if !id.trim().is_empty() => Ok(id.to_string()),
        _ => bail!(
            "No model given. Pass --model or set `model.selected` \
             (POCKETLLM_MODEL__SELECTED) in the configuration."
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── load_config defaults ──────────────────────────────────────────────────

    #[test]
    fn test_default_inference_values() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.inference.context_size, 1024);
        assert_eq!(cfg.inference.threads, 4);
        assert!(cfg.inference.use_mmap);
        assert_eq!(cfg.inference.max_tokens, 512);
        assert!((cfg.inference.temperature - 0.7).abs() < f64::EPSILON);
        assert!((cfg.inference.top_p - 0.9).abs() < f64::EPSILON);
        assert_eq!(cfg.inference.inactivity_timeout_secs, 60);
        assert_eq!(cfg.inference.reserved_for_generation, 256);
    }

    #[test]
    fn test_default_model_section() {
        let cfg = load_config(None).unwrap();
        assert!(cfg.model.cache_dir.contains("pocketllm"));
        assert!(cfg.model.selected.is_none());
        assert!(cfg.model.chat_format.is_none());
    }

    // ── load_config from a custom file ────────────────────────────────────────

    #[test]
    fn test_custom_config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(
            &file,
            "[inference]\ncontext_size = 4096\ntemperature = 0.2\n\n\
             [model]\nselected = \"qwen/tiny\"\nchat_format = \"llama3\"\n",
        )
        .unwrap();

        let cfg = load_config(Some(&file)).unwrap();
        assert_eq!(cfg.inference.context_size, 4096);
        assert!((cfg.inference.temperature - 0.2).abs() < f64::EPSILON);
        // Untouched keys keep their defaults.
        assert_eq!(cfg.inference.threads, 4);
        assert_eq!(cfg.model.selected.as_deref(), Some("qwen/tiny"));
        assert_eq!(cfg.model.chat_format.as_deref(), Some("llama3"));
    }

    #[test]
    fn test_missing_custom_file_is_an_error() {
        let path = PathBuf::from("/nonexistent/pocketllm.toml");
        assert!(load_config(Some(&path)).is_err());
    }

    // ── expand_cache_dir ──────────────────────────────────────────────────────

    #[test]
    fn test_expand_absolute_path_unchanged() {
        let path = expand_cache_dir("/absolute/path/to/cache");
        assert_eq!(path, PathBuf::from("/absolute/path/to/cache"));
    }

    #[test]
    fn test_expand_tilde_produces_non_tilde_prefix() {
        let path = expand_cache_dir("~/.cache/pocketllm");
        let s = path.to_string_lossy();
        assert!(!s.starts_with('~'), "Expanded path must not start with '~', got: {s}");
        assert!(s.ends_with("pocketllm"), "got: {s}");
    }

    #[test]
    fn test_expand_relative_path_unchanged() {
        assert_eq!(expand_cache_dir("relative/path"), PathBuf::from("relative/path"));
    }

    // ── resolve_model_id ─────────────────────────────────────────────────────

    #[test]
    fn test_cli_model_wins_over_selection() {
        let mut cfg = AppConfig::default();
        cfg.model.selected = Some("stored".into());
        assert_eq!(resolve_model_id(Some("flag"), &cfg).unwrap(), "flag");
        assert_eq!(resolve_model_id(None, &cfg).unwrap(), "stored");
    }

    #[test]
    fn test_no_model_anywhere_is_an_error() {
        let cfg = AppConfig::default();
        let err = resolve_model_id(None, &cfg).unwrap_err();
        assert!(err.to_string().contains("model.selected"));
    }

    // ── AppConfig Default impl ────────────────────────────────────────────────

    #[test]
    fn test_app_config_default_matches_load_config() {
        let from_load = load_config(None).unwrap();
        let default = AppConfig::default();
        assert_eq!(from_load.inference.context_size, default.inference.context_size);
        assert_eq!(from_load.inference.max_tokens, default.inference.max_tokens);
        assert_eq!(from_load.model.cache_dir, default.model.cache_dir);
    }
}
