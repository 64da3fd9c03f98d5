use anyhow::{Context, Result};
use lingo_core::prompts::PromptSet;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Reads every `*.md` file in `dir_path`, keyed by file stem.
pub fn load_prompts(dir_path: &Path) -> Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();

    for entry in fs::read_dir(dir_path)
        .with_context(|| format!("Failed to read prompts directory: {}", dir_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem for prompt file")?
                .to_string();

            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;
            if content.trim().is_empty() {
                tracing::warn!("Skipping empty prompt file: {}", path.display());
                continue;
            }

            prompts.insert(prompt_key, content);
        }
    }

    Ok(prompts)
}

/// The built-in templates with any found in `dir_path` layered on top.
pub fn load_prompt_set(dir_path: &Path) -> Result<PromptSet> {
    let overrides = load_prompts(dir_path)?;
    tracing::info!(
        "Loaded {} prompt override(s) from {}",
        overrides.len(),
        dir_path.display()
    );
    Ok(PromptSet::with_overrides(overrides))
}
