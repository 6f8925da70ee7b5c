//! Extensions shipped with the host.

pub mod content_guard;
pub mod reinforcement;
pub mod timestamp;

use std::{path::Path, sync::Arc};

use {parley_config::ParleyConfig, tracing::info};

use crate::{
    error::Result,
    extension::{Extension, HostServices},
    host::ExtensionHost,
    state_store::ExtensionStore,
};

pub use {
    content_guard::ContentGuard, reinforcement::Reinforcement, timestamp::TimestampExtension,
};

/// Ids of the bundled extensions, in default priority order.
pub const BUNDLED: &[&str] = &[timestamp::ID, content_guard::ID, reinforcement::ID];

/// Open the state of every enabled bundled extension under `data_dir` and
/// register it with `host`, honoring the configured priority overrides.
pub fn register_all(
    host: &mut ExtensionHost,
    config: &ParleyConfig,
    data_dir: &Path,
    services: HostServices,
) -> Result<()> {
    let open = |id: &str, aliases: &[(&str, &str)]| {
        ExtensionStore::open_with_aliases(data_dir, id, aliases)
    };

    let mut extensions: Vec<Arc<dyn Extension>> = Vec::new();
    if config.extensions.is_enabled(timestamp::ID) {
        extensions.push(Arc::new(TimestampExtension::new(
            open(timestamp::ID, timestamp::LEGACY_COUNTERS),
            services.clone(),
        )));
    }
    if config.extensions.is_enabled(content_guard::ID) {
        extensions.push(Arc::new(ContentGuard::new(
            open(content_guard::ID, content_guard::LEGACY_COUNTERS),
            services.clone(),
        )?));
    }
    if config.extensions.is_enabled(reinforcement::ID) {
        extensions.push(Arc::new(Reinforcement::new(open(
            reinforcement::ID,
            reinforcement::LEGACY_COUNTERS,
        ))));
    }

    for extension in extensions {
        let priority = config
            .extensions
            .priority_for(extension.id(), extension.priority());
        host.register(extension, Some(priority))?;
    }

    for id in BUNDLED {
        if !config.extensions.is_enabled(id) {
            info!(extension = *id, "extension disabled by configuration");
        }
    }
    Ok(())
}

/// The text after any leading `[...]` tags, so chat commands still match
/// once another extension has stamped or tagged the message.
pub(crate) fn command_word(text: &str) -> &str {
    let mut rest = text.trim_start();
    while rest.starts_with('[') {
        match rest.find(']') {
            Some(end) => rest = rest[end + 1..].trim_start(),
            None => break,
        }
    }
    rest.trim_end()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use {
        async_trait::async_trait,
        chrono::{DateTime, Local},
    };

    use crate::extension::{FixedClock, HostServices, ModelClient, Outbox};

    /// Model that replays canned responses and records every request.
    #[derive(Default)]
    pub struct ScriptedModel {
        responses: Mutex<VecDeque<String>>,
        requests: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        pub fn new<I, S>(responses: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn complete(&self, request: &str) -> anyhow::Result<String> {
            self.requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(request.to_string());
            self.responses
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no scripted response left"))
        }
    }

    /// Outbox that keeps what it was given.
    #[derive(Default)]
    pub struct RecordingOutbox {
        sent: Mutex<Vec<String>>,
    }

    impl RecordingOutbox {
        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    #[async_trait]
    impl Outbox for RecordingOutbox {
        async fn send(&self, text: &str) -> anyhow::Result<bool> {
            self.sent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(text.to_string());
            Ok(true)
        }
    }

    /// Services with an empty model, a recording outbox and a clock fixed at `at`.
    pub fn services_at(at: DateTime<Local>) -> HostServices {
        HostServices::new(
            Arc::new(ScriptedModel::default()),
            Arc::new(RecordingOutbox::default()),
        )
        .with_clock(Arc::new(FixedClock(at)))
    }
}
