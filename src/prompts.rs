use std::fs;

/// Loads the classification system prompt from disk. Kept as a thin
/// wrapper so the read site (and its error message) lives in one place.
pub fn load_prompt(prompt_path: &str) -> eyre::Result<String> {
    fs::read_to_string(prompt_path)
        .map_err(|err| eyre::eyre!("failed to read prompt file {prompt_path}: {err}"))
}
