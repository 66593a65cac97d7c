//! Cache strategies and deterministic cache-key derivation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::utils::canonical_json;

/// Bumped whenever the key record layout changes.
const KEY_FORMAT_VERSION: &str = "flowrun-cache-key/v1";

/// How a step's cache key is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CacheStrategy {
    /// Fingerprint of the logic plus input values.
    #[default]
    #[serde(rename = "code+input")]
    CodeAndInput,
    /// Input values only; logic changes keep hitting.
    #[serde(rename = "input-only")]
    InputOnly,
    /// Never cache.
    #[serde(rename = "disabled")]
    Disabled,
}

impl CacheStrategy {
    /// Returns the strategy label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeAndInput => "code+input",
            Self::InputOnly => "input-only",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "code+input" | "code_and_input" => Ok(Self::CodeAndInput),
            "input-only" | "input_only" => Ok(Self::InputOnly),
            "disabled" | "none" => Ok(Self::Disabled),
            other => Err(format!("unknown cache strategy '{other}'")),
        }
    }
}

/// A derived cache key (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wraps an existing key string.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn push_field(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_be_bytes());
    hasher.update(field.as_bytes());
}

/// Derives the cache key of one step invocation.
///
/// The hashed record holds the step name, the strategy, the fingerprint
/// (`code+input` only), every input value in declared order and the declared
/// parameters, each length-prefixed so that field boundaries cannot shift.
/// Returns `None` for [`CacheStrategy::Disabled`].
#[must_use]
pub fn derive_key(
    step: &str,
    strategy: CacheStrategy,
    fingerprint: &str,
    inputs: &[(&str, &Value)],
    params: &BTreeMap<String, Value>,
) -> Option<CacheKey> {
    if strategy == CacheStrategy::Disabled {
        return None;
    }

    let mut hasher = Sha256::new();
    push_field(&mut hasher, KEY_FORMAT_VERSION);
    push_field(&mut hasher, step);
    push_field(&mut hasher, strategy.as_str());
    if strategy == CacheStrategy::CodeAndInput {
        push_field(&mut hasher, fingerprint);
    }

    hasher.update((inputs.len() as u64).to_be_bytes());
    for (name, value) in inputs {
        push_field(&mut hasher, name);
        push_field(&mut hasher, &canonical_json(value));
    }

    hasher.update((params.len() as u64).to_be_bytes());
    for (name, value) in params {
        push_field(&mut hasher, name);
        push_field(&mut hasher, &canonical_json(value));
    }

    Some(CacheKey(hex::encode(hasher.finalize())))
}
