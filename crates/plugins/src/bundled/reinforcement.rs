//! `reinforcement` extension: re-states the core instructions as a system
//! entry every N user turns so long conversations do not drift.

use std::sync::Arc;

use {
    async_trait::async_trait,
    parley_common::{
        ConversationContext, Role,
        hooks::{HookHandler, HookOutcome, HookPayload, HookPoint},
    },
    serde_json::json,
    tracing::{debug, info, warn},
};

use crate::{
    bundled::command_word,
    command::{CommandParams, CommandResult, CommandSpec},
    extension::Extension,
    settings::{ConfigValue, Setting},
    state_store::ExtensionStore,
    transforms::{InjectDecision, Injector, truncate_chars},
};

pub const ID: &str = "reinforcement";
pub const PRIORITY: i32 = 20;
pub const LEGACY_COUNTERS: &[(&str, &str)] = &[("InjectCount", INJECTED)];

/// Tag carried by every injected entry; also the double-injection guard.
pub const MARKER: &str = "[Instruction Reinforcement]";

const INJECTED: &str = "injected";
const STATS_TRIGGER: &str = "!reinforcement-stats";
const PREVIEW_CHARS: usize = 50;

const ENABLED: Setting<bool> = Setting::new("EnableReinforcement", || true);
const INTERVAL: Setting<u64> = Setting::new("ReinforcementInterval", || 3);
const PROMPT: Setting<String> = Setting::new("ReinforcementPrompt", || {
    "Core reminders:\n\
     1. Stay in the persona defined by the system prompt.\n\
     2. Reply strictly in the agreed JSON format.\n\
     3. Keep text and stickers in separate entries of the messages array."
        .to_string()
});

pub struct Reinforcement {
    store: ExtensionStore,
}

impl Reinforcement {
    pub fn new(store: ExtensionStore) -> Self {
        Self { store }
    }

    fn injector(&self) -> Injector {
        Injector::new(MARKER, INTERVAL.get(&self.store) as usize)
    }

    fn record_injection(&self) -> u64 {
        let count = self.store.increment(INJECTED);
        if let Err(e) = self.store.persist_counters() {
            warn!(extension = ID, error = %e, "failed to persist counters");
        }
        count
    }

    fn stats_text(&self) -> String {
        let prompt = PROMPT.get(&self.store);
        let preview = match truncate_chars(&prompt, PREVIEW_CHARS) {
            Some(head) => format!("{head}..."),
            None => prompt,
        };
        format!(
            "reinforcement stats\n\
             enabled: {}\n\
             interval: every {} user turns\n\
             injections: {}\n\
             prompt: {preview}",
            ENABLED.get(&self.store),
            INTERVAL.get(&self.store),
            self.store.counter(INJECTED),
        )
    }
}

#[async_trait]
impl HookHandler for Reinforcement {
    fn name(&self) -> &str {
        ID
    }

    fn points(&self) -> &[HookPoint] {
        &[HookPoint::PreMerge, HookPoint::PostMerge]
    }

    async fn handle(
        &self,
        _point: HookPoint,
        payload: &HookPayload,
        ctx: &dyn ConversationContext,
    ) -> anyhow::Result<HookOutcome> {
        match payload {
            HookPayload::PreMerge { fragment, .. }
                if command_word(fragment).eq_ignore_ascii_case(STATS_TRIGGER) =>
            {
                Ok(HookOutcome::Intercepted(self.stats_text()))
            },
            HookPayload::PostMerge { .. } if ENABLED.get(&self.store) => {
                let injector = self.injector();
                match injector.apply(ctx, &PROMPT.get(&self.store)) {
                    InjectDecision::Inject { ordinal } => {
                        let count = self.record_injection();
                        info!(extension = ID, turn = ordinal, count, "instructions reinforced");
                    },
                    InjectDecision::AlreadyInjected { ordinal } => {
                        debug!(extension = ID, turn = ordinal, "already reinforced");
                    },
                    InjectDecision::NotDue { .. } => {},
                }
                Ok(HookOutcome::Continue)
            },
            _ => Ok(HookOutcome::Continue),
        }
    }
}

#[async_trait]
impl Extension for Reinforcement {
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
        vec![
            ENABLED.default_entry(),
            INTERVAL.default_entry(),
            PROMPT.default_entry(),
        ]
    }

    fn hooks(self: Arc<Self>) -> Vec<Arc<dyn HookHandler>> {
        vec![self]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("reset", "Reset the injection counter"),
            CommandSpec::new("inject", "Append the reinforcement entry now"),
            CommandSpec::new("test", "Show the entry that would be injected"),
        ]
    }

    async fn execute(
        &self,
        command: &str,
        _params: &CommandParams,
        ctx: &dyn ConversationContext,
    ) -> CommandResult {
        match command {
            "reset" => match self.store.reset_counters() {
                Ok(()) => CommandResult::ok("injection counter reset"),
                Err(e) => CommandResult::fail(format!("failed to reset counters: {e}")),
            },
            "inject" => {
                let entry = self.injector().entry_text(&PROMPT.get(&self.store));
                ctx.append(Role::System, entry);
                let count = self.record_injection();
                CommandResult::ok_with("reinforcement injected", json!({INJECTED: count}))
            },
            "test" => {
                let entry = self.injector().entry_text(&PROMPT.get(&self.store));
                CommandResult::ok_with("entry preview", json!(entry))
            },
            other => CommandResult::fail(format!("unknown command: {other}")),
        }
    }

    fn on_config_changed(&self) {
        info!(
            extension = ID,
            enabled = ENABLED.get(&self.store),
            interval = INTERVAL.get(&self.store),
            "reinforcement configuration applied"
        );
    }
}
