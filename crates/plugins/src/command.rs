//! Operational commands exposed by extensions (reset counters, inspect config,
//! trigger a transform by hand).

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

/// String-keyed command parameters.
pub type CommandParams = serde_json::Map<String, Value>;

/// Describes one command an extension accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// Parameter hint, e.g. `count=<n>`. Empty when the command takes none.
    pub usage: &'static str,
}

impl CommandSpec {
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            usage: "",
        }
    }

    pub const fn with_usage(mut self, usage: &'static str) -> Self {
        self.usage = usage;
        self
    }
}

/// Outcome of a command. Failures are values, never errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

/// Text value of `key`. Numbers and booleans are rendered as text; blank
/// strings count as absent.
pub fn param_str(params: &CommandParams, key: &str) -> Option<String> {
    match params.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Positive integer value of `key`. `Ok(None)` when absent, `Err` with a
/// user-facing message when present but not a positive integer.
pub fn param_positive(params: &CommandParams, key: &str) -> Result<Option<usize>, String> {
    let Some(raw) = param_str(params, key) else {
        return Ok(None);
    };
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(Some(n)),
        _ => Err(format!("{key} must be a positive integer, got {raw:?}")),
    }
}
