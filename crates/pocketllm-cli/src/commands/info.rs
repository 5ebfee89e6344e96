use std::fs::File;

use anyhow::Context;
use candle_core::quantized::gguf_file;

use super::resolve_model;
use crate::config::AppConfig;

/// Metadata keys shown by `info`, in display order. `{arch}` is replaced by
/// the model's architecture.
const KEYS: &[&str] = &[
    "general.name",
    "general.architecture",
    "general.file_type",
    "{arch}.context_length",
    "{arch}.embedding_length",
    "{arch}.block_count",
    "{arch}.attention.head_count",
    "{arch}.attention.head_count_kv",
    "tokenizer.ggml.model",
    "tokenizer.ggml.eos_token_id",
];

/// Print the GGUF header of a model.
pub fn run(model: Option<&str>, config: &AppConfig) -> anyhow::Result<()> {
    let (model_id, path) = resolve_model(model, config)?;
    let mut file = File::open(&path).with_context(|| format!("Cannot open {}", path.display()))?;
    let content = gguf_file::Content::read(&mut file)
        .with_context(|| format!("Cannot parse GGUF header of {}", path.display()))?;

    let arch = match content.metadata.get("general.architecture") {
        Some(gguf_file::Value::String(s)) => s.clone(),
        _ => "llama".to_string(),
    };

    println!("model:   {model_id}");
    println!("path:    {}", path.display());
    println!("tensors: {}", content.tensor_infos.len());
    for key in KEYS {
        let key = key.replace("{arch}", &arch);
        if let Some(value) = content.metadata.get(&key) {
            println!("{key:<36} {}", render(value));
        }
    }
    if let Some(gguf_file::Value::Array(tokens)) = content.metadata.get("tokenizer.ggml.tokens") {
        println!("{:<36} {}", "vocab_size", tokens.len());
    }
    println!(
        "{:<36} {}",
        "chat_template",
        if content.metadata.contains_key("tokenizer.chat_template") { "present" } else { "absent" }
    );
    Ok(())
}

fn render(value: &gguf_file::Value) -> String {
    use gguf_file::Value;
    match value {
        Value::U8(v) => v.to_string(),
        Value::I8(v) => v.to_string(),
        Value::U16(v) => v.to_string(),
        Value::I16(v) => v.to_string(),
        Value::U32(v) => v.to_string(),
        Value::I32(v) => v.to_string(),
        Value::U64(v) => v.to_string(),
        Value::I64(v) => v.to_string(),
        Value::F32(v) => v.to_string(),
        Value::F64(v) => v.to_string(),
        Value::Bool(v) => v.to_string(),
        Value::String(v) => v.clone(),
        Value::Array(v) => format!("[{} items]", v.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_scalars_and_arrays() {
        assert_eq!(render(&gguf_file::Value::U32(4096)), "4096");
        assert_eq!(render(&gguf_file::Value::String("qwen2".into())), "qwen2");
        let arr = gguf_file::Value::Array(vec![gguf_file::Value::U8(1), gguf_file::Value::U8(2)]);
        assert_eq!(render(&arr), "[2 items]");
    }
}
