//! Finetune tags embedded in provider model names.
//!
//! A submitted model suffix is `finetune_hash + env + run`, where `env` and
//! `run` are single characters from a 36-symbol alphabet. The prefix
//! `finetune_hash + env` identifies the function in one environment; the
//! character after it is the index of the training run that produced the model.

use crate::models::{DistilleryError, Result};

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Largest integer with a single-character encoding.
pub const MAX_ENCODABLE: u32 = ALPHABET.len() as u32 - 1;

/// Encode `n` as one character, if it is in range.
pub fn encode(n: u32) -> Option<char> {
    ALPHABET.get(n as usize).map(|&b| b as char)
}

/// Inverse of [`encode`].
pub fn decode(c: char) -> Option<u32> {
    ALPHABET
        .iter()
        .position(|&b| b as char == c)
        .map(|i| i as u32)
}

fn encode_or_err(n: u32, what: &str) -> Result<char> {
    encode(n).ok_or_else(|| {
        DistilleryError::Internal(format!("{what} {n} exceeds the encodable maximum {MAX_ENCODABLE}"))
    })
}

/// Prefix identifying a function's fine-tuned models in one environment.
pub fn function_tag(finetune_hash: &str, environment_id: u32) -> Result<String> {
    let env = encode_or_err(environment_id, "environment id")?;
    Ok(format!("{finetune_hash}{env}"))
}

/// Full suffix submitted with a fine-tune request.
pub fn finetune_suffix(finetune_hash: &str, environment_id: u32, run_index: u32) -> Result<String> {
    let run = encode_or_err(run_index, "training run index")?;
    Ok(format!("{}{run}", function_tag(finetune_hash, environment_id)?))
}

/// Run index encoded after `function_tag` in a provider model name.
pub fn recover_run_index(model_name: &str, function_tag: &str) -> Option<u32> {
    let (_, rest) = model_name.split_once(function_tag)?;
    decode(rest.chars().next()?)
}
