/// Config schema types (model request defaults, hook dispatch, extensions).
use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    /// Where per-extension state lives. Defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
    pub model: ModelConfig,
    pub hooks: HooksConfig,
    pub extensions: ExtensionsConfig,
}

/// Defaults used when building the request document sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model identifier placed in the request. Defaults to "gpt-3.5-turbo".
    pub name: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Optional base system prompt, sent as the first message.
    pub system_prompt: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "gpt-3.5-turbo".into(),
            temperature: 0.7,
            max_tokens: 2000,
            system_prompt: None,
        }
    }
}

/// Hook dispatch tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Consecutive failures before a handler is skipped. 0 disables the breaker.
    pub circuit_breaker_threshold: u64,
    /// Seconds a tripped handler stays skipped.
    pub circuit_breaker_cooldown_secs: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown_secs: 60,
        }
    }
}

/// Which bundled extensions run, and in what order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionsConfig {
    /// Extension ids that are not registered at startup.
    pub disabled: Vec<String>,
    /// Priority overrides keyed by extension id (lower runs first).
    pub priority: HashMap<String, i32>,
}

impl ExtensionsConfig {
    pub fn is_enabled(&self, id: &str) -> bool {
        !self.disabled.iter().any(|d| d == id)
    }

    pub fn priority_for(&self, id: &str, default: i32) -> i32 {
        self.priority.get(id).copied().unwrap_or(default)
    }
}
