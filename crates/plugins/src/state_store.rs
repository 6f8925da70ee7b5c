//! Per-extension durable state: a configuration document and named counters.
//!
//! Each extension owns one directory under `<data_dir>/extensions/<id>/`
//! holding `config.json` and `counters.json`. A store is shared by every
//! conversation the extension serves, so all mutation goes through one mutex.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use {
    chrono::{DateTime, Local},
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tracing::{debug, warn},
};

use crate::{
    error::{Context, Error, Result},
    settings::{ConfigMap, ConfigValue},
};

pub const CONFIG_FILE: &str = "config.json";
pub const COUNTERS_FILE: &str = "counters.json";

/// Current on-disk layout of [`CounterRecord`].
pub const COUNTER_RECORD_VERSION: u32 = 1;

/// Persisted counters for one extension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterRecord {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
    #[serde(default)]
    pub last_update: Option<DateTime<Local>>,
}

impl CounterRecord {
    /// Read a persisted document of any known layout.
    ///
    /// Versioned documents deserialize directly. Unversioned ones are flat
    /// objects such as `{"InjectCount": 3, "LastInjectTime": "..."}`; their
    /// counters are lifted through `aliases` (`legacy key → counter name`)
    /// and the newest `Last*` timestamp becomes `last_update`.
    pub fn migrate(value: Value, aliases: &[(&str, &str)]) -> Result<Self> {
        if value.get("version").is_some() {
            let mut record: Self = serde_json::from_value(value)?;
            record.version = COUNTER_RECORD_VERSION;
            return Ok(record);
        }

        let Value::Object(fields) = value else {
            return Err(Error::message("counter document is not an object"));
        };

        let mut record = Self {
            version: COUNTER_RECORD_VERSION,
            ..Default::default()
        };
        for (legacy, name) in aliases {
            if let Some(n) = fields.get(*legacy).and_then(Value::as_u64) {
                record.counters.insert((*name).to_string(), n);
            }
        }
        record.last_update = fields
            .iter()
            .filter(|(k, _)| k.starts_with("Last"))
            .filter_map(|(_, v)| v.as_str())
            .filter_map(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Local))
            .max();
        Ok(record)
    }
}

struct StoreState {
    config: ConfigMap,
    counters: CounterRecord,
}

/// Durable config and counters for one extension.
pub struct ExtensionStore {
    id: String,
    dir: PathBuf,
    state: Mutex<StoreState>,
}

impl ExtensionStore {
    /// Open the store for `id` under `root/extensions/`. Missing files are not
    /// an error; unreadable ones are logged and replaced by defaults.
    pub fn open(root: &Path, id: &str) -> Self {
        Self::open_with_aliases(root, id, &[])
    }

    /// Like [`open`](Self::open), lifting legacy counter keys through `aliases`.
    pub fn open_with_aliases(root: &Path, id: &str, aliases: &[(&str, &str)]) -> Self {
        let dir = root.join("extensions").join(id);

        let config = match read_document(&dir.join(CONFIG_FILE)) {
            Ok(Some(value)) => match serde_json::from_value::<ConfigMap>(value) {
                Ok(map) => map,
                Err(e) => {
                    warn!(extension = id, error = %e, "config document is malformed, using defaults");
                    ConfigMap::new()
                },
            },
            Ok(None) => ConfigMap::new(),
            Err(e) => {
                warn!(extension = id, error = %e, "failed to load config, using defaults");
                ConfigMap::new()
            },
        };

        let counters = match read_document(&dir.join(COUNTERS_FILE)) {
            Ok(Some(value)) => CounterRecord::migrate(value, aliases).unwrap_or_else(|e| {
                warn!(extension = id, error = %e, "counter document is malformed, starting from zero");
                CounterRecord::default()
            }),
            Ok(None) => CounterRecord::default(),
            Err(e) => {
                warn!(extension = id, error = %e, "failed to load counters, starting from zero");
                CounterRecord::default()
            },
        };

        debug!(
            extension = id,
            keys = config.len(),
            counters = counters.counters.len(),
            "extension state loaded"
        );

        Self {
            id: id.to_string(),
            dir,
            state: Mutex::new(StoreState { config, counters }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ── Config ──────────────────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<ConfigValue> {
        self.lock().config.get(key).cloned()
    }

    /// Snapshot of the whole configuration document.
    pub fn config(&self) -> ConfigMap {
        self.lock().config.clone()
    }

    /// Set one value and persist the document.
    pub fn set(&self, key: &str, value: ConfigValue) -> Result<()> {
        let mut state = self.lock();
        state.config.insert(key.to_string(), value);
        self.write_config(&state.config)
    }

    /// Add every default whose key is absent. Persists when anything was
    /// added; returns whether that happened.
    pub fn commit_defaults(
        &self,
        defaults: impl IntoIterator<Item = (String, ConfigValue)>,
    ) -> Result<bool> {
        let mut state = self.lock();
        let mut added = false;
        for (key, value) in defaults {
            if !state.config.contains_key(&key) {
                state.config.insert(key, value);
                added = true;
            }
        }
        if added {
            self.write_config(&state.config)?;
        }
        Ok(added)
    }

    /// Swap the whole document, as when the host pushes a new configuration.
    pub fn replace_config(&self, config: ConfigMap) -> Result<()> {
        let mut state = self.lock();
        state.config = config;
        self.write_config(&state.config)
    }

    // ── Counters ────────────────────────────────────────────────────────────

    /// Increment `name` in memory and return the new value. Call
    /// [`persist_counters`](Self::persist_counters) once the surrounding
    /// mutation is complete.
    pub fn increment(&self, name: &str) -> u64 {
        let mut state = self.lock();
        let slot = state.counters.counters.entry(name.to_string()).or_insert(0);
        *slot += 1;
        let value = *slot;
        state.counters.last_update = Some(Local::now());
        value
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.lock().counters.counters.get(name).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> CounterRecord {
        self.lock().counters.clone()
    }

    /// Zero every counter and persist.
    pub fn reset_counters(&self) -> Result<()> {
        let mut state = self.lock();
        for value in state.counters.counters.values_mut() {
            *value = 0;
        }
        state.counters.last_update = Some(Local::now());
        self.write_counters(&state.counters)
    }

    pub fn persist_counters(&self) -> Result<()> {
        let state = self.lock();
        self.write_counters(&state.counters)
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_config(&self, config: &ConfigMap) -> Result<()> {
        write_document(&self.dir.join(CONFIG_FILE), config)
    }

    fn write_counters(&self, counters: &CounterRecord) -> Result<()> {
        let record = CounterRecord {
            version: COUNTER_RECORD_VERSION,
            ..counters.clone()
        };
        write_document(&self.dir.join(COUNTERS_FILE), &record)
    }
}

fn read_document(path: &Path) -> Result<Option<Value>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::invalid_state(path, e.to_string())),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| Error::invalid_state(path, e.to_string()))
}

fn write_document<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    // Readers only ever see a complete document.
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
