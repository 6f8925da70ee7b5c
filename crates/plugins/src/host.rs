//! Extension host: owns the hook registry and the command table.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use {
    futures::FutureExt,
    parley_common::{ConversationContext, hooks::HookRegistry},
    parley_config::HooksConfig,
    tracing::{info, warn},
};

use crate::{
    command::{CommandParams, CommandResult, CommandSpec},
    error::{Context, Result},
    extension::Extension,
    settings::ConfigMap,
};

struct Registered {
    extension: Arc<dyn Extension>,
    priority: i32,
    commands: Vec<CommandSpec>,
}

/// A registered extension as seen from outside the host.
#[derive(Debug, Clone)]
pub struct ExtensionInfo {
    pub id: String,
    pub priority: i32,
    pub commands: Vec<CommandSpec>,
}

pub struct ExtensionHost {
    registry: HookRegistry,
    extensions: Vec<Registered>,
}

impl ExtensionHost {
    pub fn new(registry: HookRegistry) -> Self {
        Self {
            registry,
            extensions: Vec::new(),
        }
    }

    pub fn from_config(config: &HooksConfig) -> Self {
        Self::new(HookRegistry::new().with_circuit_breaker(
            config.circuit_breaker_threshold,
            Duration::from_secs(config.circuit_breaker_cooldown_secs),
        ))
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    /// Initialize `extension` and register its handlers under `priority`
    /// (its own default when `None`). Registering an id again replaces the
    /// earlier registration.
    pub fn register(&mut self, extension: Arc<dyn Extension>, priority: Option<i32>) -> Result<()> {
        let id = extension.id().to_string();
        extension
            .initialize()
            .with_context(|| format!("initialize extension {id}"))?;

        let priority = priority.unwrap_or_else(|| extension.priority());
        for handler in Arc::clone(&extension).hooks() {
            self.registry.register_with_priority(handler, priority);
        }

        let entry = Registered {
            commands: extension.commands(),
            extension,
            priority,
        };
        match self.extensions.iter_mut().find(|r| r.extension.id() == id) {
            Some(existing) => *existing = entry,
            None => self.extensions.push(entry),
        }
        info!(extension = %id, priority, "extension registered");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Extension>> {
        self.extensions
            .iter()
            .find(|r| r.extension.id() == id)
            .map(|r| &r.extension)
    }

    /// Registered extensions in ascending priority order.
    pub fn extensions(&self) -> Vec<ExtensionInfo> {
        let mut infos: Vec<ExtensionInfo> = self
            .extensions
            .iter()
            .map(|r| ExtensionInfo {
                id: r.extension.id().to_string(),
                priority: r.priority,
                commands: r.commands.clone(),
            })
            .collect();
        infos.sort_by_key(|i| i.priority);
        infos
    }

    /// Route a command to its extension. Never fails: unknown targets and
    /// panicking commands come back as `success: false`.
    pub async fn execute(
        &self,
        extension_id: &str,
        command: &str,
        params: &CommandParams,
        ctx: &dyn ConversationContext,
    ) -> CommandResult {
        let Some(entry) = self
            .extensions
            .iter()
            .find(|r| r.extension.id() == extension_id)
        else {
            return CommandResult::fail(format!("unknown extension: {extension_id}"));
        };
        if !entry.commands.iter().any(|c| c.name == command) {
            return CommandResult::fail(format!(
                "unknown command {command} for extension {extension_id}"
            ));
        }

        match AssertUnwindSafe(entry.extension.execute(command, params, ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => {
                info!(
                    extension = extension_id,
                    command,
                    success = result.success,
                    "extension command executed"
                );
                result
            },
            Err(_) => {
                warn!(extension = extension_id, command, "extension command panicked");
                CommandResult::fail(format!("command {command} failed unexpectedly"))
            },
        }
    }

    /// Replace an extension's configuration document and notify it.
    pub fn update_config(&self, extension_id: &str, config: ConfigMap) -> Result<()> {
        let extension = self
            .get(extension_id)
            .with_context(|| format!("unknown extension: {extension_id}"))?;
        extension.store().replace_config(config)?;
        extension.on_config_changed();
        info!(extension = extension_id, "extension configuration updated");
        Ok(())
    }

    /// Shut every extension down, persisting counters. Failures are logged
    /// and do not stop the remaining extensions.
    pub fn shutdown_all(&self) {
        for entry in &self.extensions {
            if let Err(e) = entry.extension.shutdown() {
                warn!(extension = entry.extension.id(), error = %e, "extension shutdown failed");
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use {
        async_trait::async_trait,
        parley_common::{
            InMemoryContext,
            hooks::{HookHandler, HookOutcome, HookPayload, HookPoint},
        },
    };

    use {
        super::*,
        crate::{settings::ConfigValue, state_store::ExtensionStore},
    };

    struct Probe {
        store: ExtensionStore,
        default_priority: i32,
        config_changes: AtomicUsize,
    }

    impl Probe {
        fn new(root: &std::path::Path, priority: i32) -> Arc<Self> {
            Arc::new(Self {
                store: ExtensionStore::open(root, "probe"),
                default_priority: priority,
                config_changes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HookHandler for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        fn points(&self) -> &[HookPoint] {
            &[HookPoint::PostMerge]
        }

        async fn handle(
            &self,
            _point: HookPoint,
            _payload: &HookPayload,
            _ctx: &dyn ConversationContext,
        ) -> anyhow::Result<HookOutcome> {
            Ok(HookOutcome::Continue)
        }
    }

    #[async_trait]
    impl Extension for Probe {
        fn id(&self) -> &str {
            "probe"
        }

        fn priority(&self) -> i32 {
            self.default_priority
        }

        fn store(&self) -> &ExtensionStore {
            &self.store
        }

        fn defaults(&self) -> Vec<(String, ConfigValue)> {
            vec![("Enabled".into(), ConfigValue::Bool(true))]
        }

        fn hooks(self: Arc<Self>) -> Vec<Arc<dyn HookHandler>> {
            vec![self]
        }

        fn commands(&self) -> Vec<CommandSpec> {
            vec![
                CommandSpec::new("ping", "Reply with pong"),
                CommandSpec::new("boom", "Panic"),
            ]
        }

        async fn execute(
            &self,
            command: &str,
            _params: &CommandParams,
            _ctx: &dyn ConversationContext,
        ) -> CommandResult {
            match command {
                "ping" => CommandResult::ok("pong"),
                "boom" => panic!("command exploded"),
                other => CommandResult::fail(format!("unhandled {other}")),
            }
        }

        fn on_config_changed(&self) {
            self.config_changes.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn register_commits_defaults_and_applies_priority_override() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = Probe::new(tmp.path(), 10);
        let mut host = ExtensionHost::new(HookRegistry::new());
        host.register(probe.clone(), Some(3)).unwrap();

        assert_eq!(probe.store.get("Enabled"), Some(ConfigValue::Bool(true)));
        let handlers = host.registry().handlers_at(HookPoint::PostMerge);
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].priority, 3);
        assert_eq!(host.extensions()[0].priority, 3);
    }

    #[test]
    fn reregistering_replaces() {
        let tmp = tempfile::tempdir().unwrap();
        let mut host = ExtensionHost::new(HookRegistry::new());
        host.register(Probe::new(tmp.path(), 10), None).unwrap();
        host.register(Probe::new(tmp.path(), 10), None).unwrap();
        assert_eq!(host.extensions().len(), 1);
        assert_eq!(host.registry().handlers_at(HookPoint::PostMerge).len(), 1);
    }

    #[tokio::test]
    async fn execute_routes_and_rejects_unknowns() {
        let tmp = tempfile::tempdir().unwrap();
        let mut host = ExtensionHost::new(HookRegistry::new());
        host.register(Probe::new(tmp.path(), 0), None).unwrap();
        let ctx = InMemoryContext::new();
        let params = CommandParams::new();

        let ok = host.execute("probe", "ping", &params, &ctx).await;
        assert!(ok.success);
        assert_eq!(ok.message, "pong");

        assert!(!host.execute("missing", "ping", &params, &ctx).await.success);
        assert!(!host.execute("probe", "nope", &params, &ctx).await.success);
    }

    #[tokio::test]
    async fn panicking_command_fails_softly() {
        let tmp = tempfile::tempdir().unwrap();
        let mut host = ExtensionHost::new(HookRegistry::new());
        host.register(Probe::new(tmp.path(), 0), None).unwrap();
        let ctx = InMemoryContext::new();
        let result = host
            .execute("probe", "boom", &CommandParams::new(), &ctx)
            .await;
        assert!(!result.success);
    }

    #[test]
    fn update_config_replaces_and_notifies() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = Probe::new(tmp.path(), 0);
        let mut host = ExtensionHost::new(HookRegistry::new());
        host.register(probe.clone(), None).unwrap();
        let before = probe.config_changes.load(Ordering::Relaxed);

        let mut config = ConfigMap::new();
        config.insert("Enabled".into(), ConfigValue::Bool(false));
        host.update_config("probe", config).unwrap();

        assert_eq!(probe.store.get("Enabled"), Some(ConfigValue::Bool(false)));
        assert_eq!(probe.config_changes.load(Ordering::Relaxed), before + 1);
        assert!(host.update_config("missing", ConfigMap::new()).is_err());
    }

    #[test]
    fn shutdown_persists_counters() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = Probe::new(tmp.path(), 0);
        let mut host = ExtensionHost::new(HookRegistry::new());
        host.register(probe.clone(), None).unwrap();
        probe.store.increment("seen");
        host.shutdown_all();

        let reopened = ExtensionStore::open(tmp.path(), "probe");
        assert_eq!(reopened.counter("seen"), 1);
    }
}
