//! Tokenizer loading from a local file or the Hugging Face Hub

use anyhow::{Context, Result};
use hf_hub::{api::sync::Api, Repo, RepoType};
use std::path::Path;
use tokenizers::Tokenizer;

/// Load a tokenizer by local `tokenizer.json` path or Hub model name.
///
/// - `load_tokenizer("./tokenizer.json")` -> local file
/// - `load_tokenizer("gpt2")` -> downloads `tokenizer.json` from the Hub
pub fn load_tokenizer(name: &str) -> Result<Tokenizer> {
    let path = Path::new(name);
    if path.is_file() {
        tracing::info!(path = name, "loading local tokenizer");
        return Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer from {name}: {e}"));
    }

    tracing::info!(repo = name, "downloading tokenizer");
    let api = Api::new().context("failed to initialize Hugging Face Hub API")?;
    let repo = api.repo(Repo::new(name.to_string(), RepoType::Model));
    let tokenizer_path = repo
        .get("tokenizer.json")
        .with_context(|| format!("failed to download tokenizer.json from {name}"))?;

    let tokenizer = Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| anyhow::anyhow!("failed to load downloaded tokenizer: {e}"))?;
    tracing::info!(repo = name, vocab_size = tokenizer.get_vocab_size(true), "tokenizer loaded");
    Ok(tokenizer)
}

/// Pad id: the named token if given, else the tokenizer's padding setting,
/// else its end-of-sequence token, else 0
pub fn pad_id(tokenizer: &Tokenizer, pad_token: Option<&str>) -> Result<u32> {
    match pad_token {
        Some(token) => lorafold_training::TokenizerAdapter::resolve_pad_id(tokenizer, token)
            .with_context(|| format!("resolving --pad-token {token}")),
        None => Ok(lorafold_training::TokenizerAdapter::default_pad_id(tokenizer)),
    }
}
