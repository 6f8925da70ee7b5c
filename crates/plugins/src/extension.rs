//! The extension contract and the host capabilities extensions receive.

use std::sync::Arc;

use {
    async_trait::async_trait,
    chrono::{DateTime, Local},
    parley_common::{ConversationContext, hooks::HookHandler},
    parley_config::ModelConfig,
    tracing::info,
};

use crate::{
    command::{CommandParams, CommandResult, CommandSpec},
    error::Result,
    settings::ConfigValue,
    state_store::ExtensionStore,
};

// ── Host services ───────────────────────────────────────────────────────────

/// Backend that turns a request document into a response document.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &str) -> anyhow::Result<String>;
}

/// Channel for messages an extension sends to the user on its own.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Returns whether the message was delivered.
    async fn send(&self, text: &str) -> anyhow::Result<bool>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// Wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Clock stuck at one instant.
pub struct FixedClock(pub DateTime<Local>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        self.0
    }
}

/// Capabilities handed to extensions and the pipeline at construction.
#[derive(Clone)]
pub struct HostServices {
    pub model: Arc<dyn ModelClient>,
    pub outbox: Arc<dyn Outbox>,
    pub clock: Arc<dyn Clock>,
    pub model_config: ModelConfig,
}

impl HostServices {
    pub fn new(model: Arc<dyn ModelClient>, outbox: Arc<dyn Outbox>) -> Self {
        Self {
            model,
            outbox,
            clock: Arc::new(SystemClock),
            model_config: ModelConfig::default(),
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = model;
        self
    }

    #[must_use]
    pub fn with_outbox(mut self, outbox: Arc<dyn Outbox>) -> Self {
        self.outbox = outbox;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_model_config(mut self, model_config: ModelConfig) -> Self {
        self.model_config = model_config;
        self
    }

    pub fn now(&self) -> DateTime<Local> {
        self.clock.now()
    }
}

// ── Extension trait ─────────────────────────────────────────────────────────

/// An independently authored unit that hooks into the pipeline and exposes
/// operational commands.
#[async_trait]
pub trait Extension: Send + Sync {
    fn id(&self) -> &str;

    /// Default priority of this extension's handlers. Lower runs first.
    fn priority(&self) -> i32;

    fn store(&self) -> &ExtensionStore;

    /// Built-in configuration defaults, committed on first run.
    fn defaults(&self) -> Vec<(String, ConfigValue)>;

    /// Commit missing defaults and log the effective state.
    fn initialize(&self) -> Result<()> {
        let added = self.store().commit_defaults(self.defaults())?;
        info!(
            extension = self.id(),
            defaults_added = added,
            counters = ?self.store().counters().counters,
            "extension initialized"
        );
        self.on_config_changed();
        Ok(())
    }

    /// Handlers to register, one entry per handler.
    fn hooks(self: Arc<Self>) -> Vec<Arc<dyn HookHandler>>;

    fn commands(&self) -> Vec<CommandSpec>;

    /// Run a command. Unknown names and bad parameters yield `success: false`.
    async fn execute(
        &self,
        command: &str,
        params: &CommandParams,
        ctx: &dyn ConversationContext,
    ) -> CommandResult;

    /// Called after the configuration document was replaced.
    fn on_config_changed(&self) {}

    /// Persist counters before the process exits.
    fn shutdown(&self) -> Result<()> {
        self.store().persist_counters()?;
        info!(extension = self.id(), "extension stopped");
        Ok(())
    }
}
