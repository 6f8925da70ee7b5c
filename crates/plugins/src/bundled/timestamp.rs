//! `timestamp` extension: keeps exactly one fresh timestamp at the head of
//! every user turn, however many times the turn is re-processed.

use std::sync::{Arc, RwLock};

use {
    async_trait::async_trait,
    parley_common::{
        ConversationContext,
        hooks::{HookHandler, HookOutcome, HookPayload, HookPoint},
    },
    serde_json::json,
    tracing::{debug, warn},
};

use crate::{
    command::{CommandParams, CommandResult, CommandSpec},
    extension::{Extension, HostServices},
    settings::{ConfigValue, Setting},
    state_store::ExtensionStore,
    transforms::TimestampFormat,
};

pub const ID: &str = "timestamp";
pub const PRIORITY: i32 = 5;
pub const LEGACY_COUNTERS: &[(&str, &str)] = &[("TimestampCount", COUNTER)];

const COUNTER: &str = "timestamped";

const ENABLED: Setting<bool> = Setting::new("EnableTimestamp", || true);
const TIME_FORMAT: Setting<String> =
    Setting::new("TimeFormat", || "[yyyy-MM-dd HH:mm:ss] ".to_string());

pub struct TimestampExtension {
    store: ExtensionStore,
    services: HostServices,
    format: RwLock<Option<TimestampFormat>>,
}

impl TimestampExtension {
    pub fn new(store: ExtensionStore, services: HostServices) -> Self {
        Self {
            store,
            services,
            format: RwLock::new(None),
        }
    }

    fn current_format(&self) -> Option<TimestampFormat> {
        self.format
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl HookHandler for TimestampExtension {
    fn name(&self) -> &str {
        ID
    }

    fn points(&self) -> &[HookPoint] {
        &[HookPoint::PostMerge, HookPoint::MessageAppended]
    }

    async fn handle(
        &self,
        point: HookPoint,
        payload: &HookPayload,
        _ctx: &dyn ConversationContext,
    ) -> anyhow::Result<HookOutcome> {
        if !ENABLED.get(&self.store) {
            return Ok(HookOutcome::Continue);
        }
        let Some(format) = self.current_format() else {
            anyhow::bail!("time format {:?} is invalid", TIME_FORMAT.get(&self.store));
        };

        let text = format.normalize(payload.text(), self.services.now());
        let count = self.store.increment(COUNTER);
        if let Err(e) = self.store.persist_counters() {
            warn!(extension = ID, error = %e, "failed to persist counters");
        }
        debug!(extension = ID, point = %point, count, "timestamp normalized");
        Ok(HookOutcome::Modified(text))
    }
}

#[async_trait]
impl Extension for TimestampExtension {
    fn id(&self) -> &str {
        ID
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }

    fn store(&self) -> &ExtensionStore {
        &self.store
    }

    fn defaults(&self) -> Vec<(String, ConfigValue)> {
        vec![ENABLED.default_entry(), TIME_FORMAT.default_entry()]
    }

    fn hooks(self: Arc<Self>) -> Vec<Arc<dyn HookHandler>> {
        vec![self]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("reset", "Reset the timestamp counter"),
            CommandSpec::new("test", "Show the configured format with an example"),
        ]
    }

    async fn execute(
        &self,
        command: &str,
        _params: &CommandParams,
        _ctx: &dyn ConversationContext,
    ) -> CommandResult {
        match command {
            "reset" => match self.store.reset_counters() {
                Ok(()) => CommandResult::ok("timestamp counter reset"),
                Err(e) => CommandResult::fail(format!("failed to reset counters: {e}")),
            },
            "test" => {
                let pattern = TIME_FORMAT.get(&self.store);
                match self.current_format() {
                    Some(format) => {
                        let example = format.normalize("hello", self.services.now());
                        CommandResult::ok_with(
                            format!("example: {example}"),
                            json!({"format": pattern, "example": example}),
                        )
                    },
                    None => CommandResult::fail(format!("time format {pattern:?} is invalid")),
                }
            },
            other => CommandResult::fail(format!("unknown command: {other}")),
        }
    }

    fn on_config_changed(&self) {
        let pattern = TIME_FORMAT.get(&self.store);
        let compiled = match TimestampFormat::parse(&pattern) {
            Ok(format) => Some(format),
            Err(e) => {
                warn!(extension = ID, pattern = %pattern, error = %e, "invalid time format");
                None
            },
        };
        *self.format.write().unwrap_or_else(|e| e.into_inner()) = compiled;
        debug!(
            extension = ID,
            enabled = ENABLED.get(&self.store),
            pattern = %pattern,
            "timestamp configuration applied"
        );
    }
}
