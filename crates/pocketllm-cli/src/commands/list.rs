use super::open_store;
use crate::config::AppConfig;

/// List all models in the local store.
pub fn run(config: &AppConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let models = store.list()?;

    if models.is_empty() {
        println!("No models stored in {}.", store.root().display());
        println!("Place a .gguf file under <cache_dir>/<owner>__<name>/ to make it available.");
        return Ok(());
    }

    let selected = config.model.selected.as_deref();
    println!("  {:<40} {:<40} {:>10}", "MODEL ID", "FILE", "SIZE");
    println!("{}", "-".repeat(94));
    for model in &models {
        let marker = if selected == Some(model.id.as_str()) { "*" } else { " " };
        let file = model.path.file_name().map(|f| f.to_string_lossy()).unwrap_or_default();
        println!("{marker} {:<40} {:<40} {:>10}", model.id, file, human_size(model.size_bytes));
    }
    println!("\n{} model file(s) in {}", models.len(), store.root().display());

    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
