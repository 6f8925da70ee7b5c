//! Typed access to an extension's key/value configuration.
//!
//! The persisted document stays a flat string-keyed map so existing files
//! keep loading; each option is read through a [`Setting`] that owns its key
//! and default.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::state_store::ExtensionStore;

/// One persisted configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

/// Flat configuration document. Ordered so files diff cleanly.
pub type ConfigMap = BTreeMap<String, ConfigValue>;

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for ConfigValue {
    fn from(v: u64) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<Vec<String>> for ConfigValue {
    fn from(v: Vec<String>) -> Self {
        Self::List(v)
    }
}

/// Conversion out of a stored value. `None` means the stored value has the
/// wrong shape and the caller should use its default.
pub trait FromConfigValue: Sized {
    fn from_config_value(value: &ConfigValue) -> Option<Self>;
}

impl FromConfigValue for bool {
    fn from_config_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Bool(b) => Some(*b),
            ConfigValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromConfigValue for i64 {
    fn from_config_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Int(i) => Some(*i),
            ConfigValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            ConfigValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromConfigValue for u64 {
    fn from_config_value(value: &ConfigValue) -> Option<Self> {
        i64::from_config_value(value).and_then(|i| u64::try_from(i).ok())
    }
}

impl FromConfigValue for f64 {
    fn from_config_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Float(f) => Some(*f),
            ConfigValue::Int(i) => Some(*i as f64),
            ConfigValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromConfigValue for String {
    fn from_config_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Text(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromConfigValue for Vec<String> {
    fn from_config_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::List(items) => Some(items.clone()),
            // Older documents store word lists as one comma-separated string.
            ConfigValue::Text(s) => Some(
                s.split(',')
                    .map(str::trim)
                    .filter(|w| !w.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// A named option with its default.
pub struct Setting<T> {
    key: &'static str,
    default: fn() -> T,
}

impl<T> Setting<T>
where
    T: FromConfigValue + Into<ConfigValue>,
{
    pub const fn new(key: &'static str, default: fn() -> T) -> Self {
        Self { key, default }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn default_value(&self) -> T {
        (self.default)()
    }

    /// `(key, default)` pair for [`ExtensionStore::commit_defaults`].
    pub fn default_entry(&self) -> (String, ConfigValue) {
        (self.key.to_string(), self.default_value().into())
    }

    /// Current value; absent or mistyped entries read as the default.
    pub fn get(&self, store: &ExtensionStore) -> T {
        store
            .get(self.key)
            .as_ref()
            .and_then(T::from_config_value)
            .unwrap_or_else(self.default)
    }

    pub fn set(&self, store: &ExtensionStore, value: T) -> crate::error::Result<()> {
        store.set(self.key, value.into())
    }
}
