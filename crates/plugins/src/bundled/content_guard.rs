//! `content-guard` extension: input filtering, chat commands, request tuning
//! and reply post-processing.
//!
//! - PreMerge: masks banned words, limits fragment length, tags VIP sources.
//! - PostMerge: answers `!help`, `!status`, `!stats`, `!config`; optional
//!   short `[HH:mm:ss] ` stamp; unescapes literal `\n`.
//! - MessageAppended: collapses duplicate short stamps and repeated appends.
//! - PreLLMRequest: night-mode temperature, system time note, `max_tokens`
//!   by question shape, `!test` short-circuit.
//! - LLMResponse: reply prefix, delay clamp, length limit, optional block.

use std::sync::Arc;

use {
    async_trait::async_trait,
    chrono::Timelike,
    parley_common::{
        ConversationContext, Role,
        hooks::{HookHandler, HookOutcome, HookPayload, HookPoint},
    },
    serde_json::{Value, json},
    tracing::{debug, info, warn},
};

use crate::{
    bundled::command_word,
    command::{CommandParams, CommandResult, CommandSpec, param_positive, param_str},
    error::Result,
    extension::{Extension, HostServices},
    settings::{ConfigValue, Setting},
    state_store::ExtensionStore,
    transforms::{ContentFilter, TimestampFormat, truncate_chars},
};

pub const ID: &str = "content-guard";
pub const PRIORITY: i32 = 10;
pub const LEGACY_COUNTERS: &[(&str, &str)] =
    &[("ProcessCount", PROCESSED), ("MessageCount", MESSAGES)];

/// Replies modified at LLMResponse.
const PROCESSED: &str = "processed";
/// Turns seen at PostMerge.
const MESSAGES: &str = "messages";

const ENABLE_PREFIX: Setting<bool> = Setting::new("EnablePrefix", || true);
const PREFIX_TEXT: Setting<String> = Setting::new("PrefixText", || "[AI Enhanced]".into());
const MAX_DELAY: Setting<u64> = Setting::new("MaxDelay", || 5000);
const ENABLE_FILTER: Setting<bool> = Setting::new("EnableFilter", || true);
const SENSITIVE_WORDS: Setting<Vec<String>> = Setting::new("SensitiveWords", || {
    vec!["spam".into(), "scam".into(), "fraud".into()]
});
const MAX_MESSAGE_LENGTH: Setting<u64> = Setting::new("MaxMessageLength", || 2000);
const ENABLE_STATS: Setting<bool> = Setting::new("EnableStats", || true);
const ENABLE_TIMESTAMP: Setting<bool> = Setting::new("EnableTimestamp", || false);
const ENABLE_APPEND_MARK: Setting<bool> = Setting::new("EnableAppendMark", || false);
const MAX_CONTENT_LENGTH: Setting<u64> = Setting::new("MaxContentLength", || 1000);
const ENABLE_BLOCK_CHECK: Setting<bool> = Setting::new("EnableBlockCheck", || false);
const BLOCKED_PHRASES: Setting<Vec<String>> =
    Setting::new("BlockedPhrases", || vec!["sensitive content".into()]);
const VIP_SOURCES: Setting<Vec<String>> = Setting::new("VipSources", Vec::new);

const SHORT_STAMP: &str = "[HH:mm:ss] ";
const VIP_TAG: &str = "[VIP] ";
const APPEND_MARK: &str = " [appended]";
const CONTENT_TRUNCATED: &str = "...[content truncated]";
const SYSTEM_TIME_MARKER: &str = "[System time: ";
const TEST_TRIGGER: &str = "!test";
const CONTEXT_TAG: &str = "[Injected]";
const PREVIEW_CHARS: usize = 50;

pub struct ContentGuard {
    store: ExtensionStore,
    services: HostServices,
    short_stamp: TimestampFormat,
}

impl ContentGuard {
    pub fn new(store: ExtensionStore, services: HostServices) -> Result<Self> {
        Ok(Self {
            store,
            services,
            short_stamp: TimestampFormat::parse(SHORT_STAMP)?,
        })
    }

    fn record_stats(&self) {
        if !ENABLE_STATS.get(&self.store) {
            return;
        }
        if let Err(e) = self.store.persist_counters() {
            warn!(extension = ID, error = %e, "failed to persist counters");
        }
    }

    // ── PreMerge ────────────────────────────────────────────────────────────

    fn pre_merge(&self, fragment: &str, source: &str) -> HookOutcome {
        let mut text = fragment.to_string();

        if ENABLE_FILTER.get(&self.store) {
            let filter = ContentFilter::new(
                SENSITIVE_WORDS.get(&self.store),
                MAX_MESSAGE_LENGTH.get(&self.store) as usize,
            );
            let outcome = filter.apply(&text);
            if outcome.modified() {
                info!(
                    extension = ID,
                    masked = outcome.masked,
                    truncated = outcome.truncated,
                    "fragment filtered"
                );
                text = outcome.text;
            }
        }

        if VIP_SOURCES.get(&self.store).iter().any(|s| s == source) && !text.starts_with(VIP_TAG) {
            text = format!("{VIP_TAG}{text}");
        }

        if text == fragment {
            HookOutcome::Continue
        } else {
            HookOutcome::Modified(text)
        }
    }

    // ── PostMerge ───────────────────────────────────────────────────────────

    fn post_merge(&self, text: &str) -> HookOutcome {
        self.store.increment(MESSAGES);
        self.record_stats();

        match command_word(text).to_lowercase().as_str() {
            "!help" => return HookOutcome::Intercepted(help_text()),
            "!status" => return HookOutcome::Intercepted(self.status_text()),
            "!stats" => return HookOutcome::Intercepted(self.stats_text()),
            "!config" => return HookOutcome::Intercepted(self.config_text()),
            _ => {},
        }

        let mut next = text.replace("\\n", "\n");
        if ENABLE_TIMESTAMP.get(&self.store) && !self.short_stamp.is_match(&next) {
            next = format!("{}{next}", self.short_stamp.format(self.services.now()));
        }

        if next == text {
            HookOutcome::Continue
        } else {
            HookOutcome::Modified(next)
        }
    }

    fn status_text(&self) -> String {
        let on = |b: bool| if b { "on" } else { "off" };
        format!(
            "content-guard status\n\
             filter: {}\n\
             reply prefix: {} ({})\n\
             short timestamp: {}\n\
             block check: {}",
            on(ENABLE_FILTER.get(&self.store)),
            on(ENABLE_PREFIX.get(&self.store)),
            PREFIX_TEXT.get(&self.store),
            on(ENABLE_TIMESTAMP.get(&self.store)),
            on(ENABLE_BLOCK_CHECK.get(&self.store)),
        )
    }

    fn stats_text(&self) -> String {
        format!(
            "content-guard stats\nmessages seen: {}\nreplies modified: {}",
            self.store.counter(MESSAGES),
            self.store.counter(PROCESSED),
        )
    }

    fn config_text(&self) -> String {
        format!(
            "content-guard config\n\
             max message length: {}\n\
             max reply length: {}\n\
             max delay: {} ms\n\
             banned words: {}",
            MAX_MESSAGE_LENGTH.get(&self.store),
            MAX_CONTENT_LENGTH.get(&self.store),
            MAX_DELAY.get(&self.store),
            SENSITIVE_WORDS.get(&self.store).len(),
        )
    }

    // ── MessageAppended ─────────────────────────────────────────────────────

    fn message_appended(&self, original: &str, appended: &str, full: &str) -> HookOutcome {
        let mut text = full.to_string();

        if let Some(collapsed) = self.short_stamp.collapse_duplicates(&text) {
            debug!(extension = ID, "collapsed duplicate stamps");
            text = collapsed;
        }

        if !appended.is_empty() && original.ends_with(appended) {
            debug!(extension = ID, "collapsed repeated append");
            text = original.to_string();
        }

        if ENABLE_APPEND_MARK.get(&self.store) && !text.ends_with(APPEND_MARK) {
            text.push_str(APPEND_MARK);
        }

        if text == full {
            HookOutcome::Continue
        } else {
            HookOutcome::Modified(text)
        }
    }

    // ── PreLLMRequest ───────────────────────────────────────────────────────

    fn pre_llm_request(&self, request: &str, user_text: &str) -> anyhow::Result<HookOutcome> {
        if user_text.contains(TEST_TRIGGER) {
            info!(extension = ID, "test trigger, skipping model call");
            return Ok(HookOutcome::Intercepted(
                json!({"messages": [{"type": "text", "content": "🧪 Test reply from content-guard; the model was not called."}]})
                    .to_string(),
            ));
        }

        let mut doc: Value = serde_json::from_str(request)?;
        let mut modified = false;
        let now = self.services.now();

        let hour = now.hour();
        if hour >= 22 || hour < 6 {
            doc["temperature"] = json!(0.5);
            modified = true;
            debug!(extension = ID, hour, "night mode temperature");
        }

        if let Some(system) = doc
            .get_mut("messages")
            .and_then(Value::as_array_mut)
            .and_then(|msgs| msgs.iter_mut().find(|m| m["role"] == "system"))
        {
            let content = system["content"].as_str().unwrap_or_default().to_string();
            if !content.contains(SYSTEM_TIME_MARKER) {
                system["content"] = json!(format!(
                    "{content}\n\n{SYSTEM_TIME_MARKER}{}]",
                    now.format("%Y-%m-%d %H:%M:%S")
                ));
                modified = true;
            }
        }

        if !user_text.is_empty() {
            let chars = user_text.chars().count();
            let questions = user_text.chars().filter(|c| matches!(c, '?' | '？')).count();
            if chars < 10 && questions == 0 {
                doc["max_tokens"] = json!(512);
                modified = true;
            } else if questions > 2 || chars > 200 {
                doc["max_tokens"] = json!(2048);
                modified = true;
            }
        }

        Ok(if modified {
            HookOutcome::Modified(doc.to_string())
        } else {
            HookOutcome::Continue
        })
    }

    // ── LLMResponse ─────────────────────────────────────────────────────────

    fn llm_response(&self, response: &str) -> anyhow::Result<HookOutcome> {
        let mut doc: Value = serde_json::from_str(response)?;
        let Some(messages) = doc.get_mut("messages").and_then(Value::as_array_mut) else {
            return Ok(HookOutcome::Continue);
        };

        if ENABLE_BLOCK_CHECK.get(&self.store) {
            let first = messages
                .first()
                .and_then(|m| m["content"].as_str())
                .unwrap_or_default();
            if BLOCKED_PHRASES
                .get(&self.store)
                .iter()
                .any(|p| !p.is_empty() && first.contains(p.as_str()))
            {
                warn!(extension = ID, "reply blocked");
                return Ok(HookOutcome::Intercepted(
                    json!({"messages": [{"type": "text", "content": "⚠️ This reply was withheld because it contained blocked content."}]})
                        .to_string(),
                ));
            }
        }

        let prefix = ENABLE_PREFIX
            .get(&self.store)
            .then(|| PREFIX_TEXT.get(&self.store));
        let max_delay = MAX_DELAY.get(&self.store);
        let max_chars = MAX_CONTENT_LENGTH.get(&self.store) as usize;
        let mut modified = false;

        for msg in messages.iter_mut() {
            if let Some(content) = msg["content"].as_str().map(str::to_string) {
                let mut next = content.clone();
                if let Some(prefix) = &prefix
                    && !next.starts_with(prefix.as_str())
                {
                    next = format!("{prefix} {next}");
                }
                let already_truncated = next
                    .strip_suffix(CONTENT_TRUNCATED)
                    .is_some_and(|head| head.chars().count() <= max_chars);
                if !already_truncated && let Some(head) = truncate_chars(&next, max_chars) {
                    next = format!("{head}{CONTENT_TRUNCATED}");
                }
                if next != content {
                    msg["content"] = json!(next);
                    modified = true;
                }
            }

            if let Some(delay) = msg.get("delay_ms").and_then(Value::as_u64)
                && delay > max_delay
            {
                msg["delay_ms"] = json!(max_delay);
                modified = true;
            }
        }

        if !modified {
            return Ok(HookOutcome::Continue);
        }
        let count = self.store.increment(PROCESSED);
        self.record_stats();
        debug!(extension = ID, count, "reply modified");
        Ok(HookOutcome::Modified(doc.to_string()))
    }

    // ── Commands ────────────────────────────────────────────────────────────

    async fn request_llm(&self, prompt: &str) -> CommandResult {
        let request = json!({
            "model": self.services.model_config.name,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.services.model_config.temperature,
            "max_tokens": self.services.model_config.max_tokens,
        });
        match self.services.model.complete(&request.to_string()).await {
            Ok(response) => CommandResult::ok_with("model replied", json!({"response": response})),
            Err(e) => CommandResult::fail(format!("model request failed: {e:#}")),
        }
    }
}

/// The command word of a chat line, skipping leading `[...]` tags such as
/// timestamps added by earlier handlers.
fn help_text() -> String {
    "content-guard commands\n\
     !help    show this help\n\
     !status  show which features are on\n\
     !stats   show message and reply counters\n\
     !config  show the active limits"
        .to_string()
}

fn preview(text: &str) -> String {
    match truncate_chars(text, PREVIEW_CHARS) {
        Some(head) => format!("{head}..."),
        None => text.to_string(),
    }
}

#[async_trait]
impl HookHandler for ContentGuard {
    fn name(&self) -> &str {
        ID
    }

    fn points(&self) -> &[HookPoint] {
        HookPoint::ALL
    }

    async fn handle(
        &self,
        _point: HookPoint,
        payload: &HookPayload,
        _ctx: &dyn ConversationContext,
    ) -> anyhow::Result<HookOutcome> {
        match payload {
            HookPayload::PreMerge {
                fragment, source, ..
            } => Ok(self.pre_merge(fragment, source)),
            HookPayload::PostMerge { text, .. } => Ok(self.post_merge(text)),
            HookPayload::MessageAppended {
                original,
                appended,
                full,
                ..
            } => Ok(self.message_appended(original, appended, full)),
            HookPayload::PreLlmRequest { request, user_text } => {
                self.pre_llm_request(request, user_text)
            },
            HookPayload::LlmResponse { response } => self.llm_response(response),
        }
    }
}

#[async_trait]
impl Extension for ContentGuard {
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
            ENABLE_PREFIX.default_entry(),
            PREFIX_TEXT.default_entry(),
            MAX_DELAY.default_entry(),
            ENABLE_FILTER.default_entry(),
            SENSITIVE_WORDS.default_entry(),
            MAX_MESSAGE_LENGTH.default_entry(),
            ENABLE_STATS.default_entry(),
            ENABLE_TIMESTAMP.default_entry(),
            ENABLE_APPEND_MARK.default_entry(),
            MAX_CONTENT_LENGTH.default_entry(),
            ENABLE_BLOCK_CHECK.default_entry(),
            BLOCKED_PHRASES.default_entry(),
            VIP_SOURCES.default_entry(),
        ]
    }

    fn hooks(self: Arc<Self>) -> Vec<Arc<dyn HookHandler>> {
        vec![self]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("reset", "Reset message and reply counters"),
            CommandSpec::new("stats", "Show counters"),
            CommandSpec::new("get_config", "Show the configuration document"),
            CommandSpec::new("add_context", "Append a system entry to the conversation")
                .with_usage("content=<text>"),
            CommandSpec::new("clear_context", "Drop the whole conversation"),
            CommandSpec::new("remove_last_ai", "Remove the latest assistant replies")
                .with_usage("count=<n>"),
            CommandSpec::new("analyze_context", "Summarize the conversation by role"),
            CommandSpec::new("send_test", "Send a message through the outbox")
                .with_usage("message=<text>"),
            CommandSpec::new("request_llm", "Send a one-off prompt to the model")
                .with_usage("prompt=<text>"),
        ]
    }

    async fn execute(
        &self,
        command: &str,
        params: &CommandParams,
        ctx: &dyn ConversationContext,
    ) -> CommandResult {
        match command {
            "reset" => match self.store.reset_counters() {
                Ok(()) => CommandResult::ok_with(
                    "counters reset",
                    json!({PROCESSED: 0, MESSAGES: 0}),
                ),
                Err(e) => CommandResult::fail(format!("failed to reset counters: {e}")),
            },
            "stats" => {
                let record = self.store.counters();
                CommandResult::ok_with(
                    self.stats_text(),
                    json!({
                        PROCESSED: self.store.counter(PROCESSED),
                        MESSAGES: self.store.counter(MESSAGES),
                        "last_update": record.last_update,
                    }),
                )
            },
            "get_config" => match serde_json::to_value(self.store.config()) {
                Ok(config) => CommandResult::ok_with("current configuration", config),
                Err(e) => CommandResult::fail(format!("failed to serialize config: {e}")),
            },
            "add_context" => match param_str(params, "content") {
                Some(content) => {
                    ctx.append(Role::System, format!("{CONTEXT_TAG} {content}"));
                    CommandResult::ok("system entry added")
                },
                None => CommandResult::fail("missing parameter: content"),
            },
            "clear_context" => {
                ctx.clear();
                CommandResult::ok("conversation cleared")
            },
            "remove_last_ai" => match param_positive(params, "count") {
                Ok(count) => {
                    let removed = ctx.remove_last(Role::Assistant, count.unwrap_or(1));
                    CommandResult::ok_with(
                        format!("removed {removed} assistant entries"),
                        json!({"removed": removed}),
                    )
                },
                Err(message) => CommandResult::fail(message),
            },
            "analyze_context" => {
                let messages = ctx.messages();
                let count = |role: Role| messages.iter().filter(|m| m.role == role).count();
                let recent: Vec<Value> = messages
                    .iter()
                    .rev()
                    .take(3)
                    .rev()
                    .map(|m| json!({"role": m.role, "content": preview(&m.content)}))
                    .collect();
                CommandResult::ok_with(
                    format!("{} entries", messages.len()),
                    json!({
                        "total": messages.len(),
                        "user": count(Role::User),
                        "assistant": count(Role::Assistant),
                        "system": count(Role::System),
                        "recent": recent,
                    }),
                )
            },
            "send_test" => {
                let message = param_str(params, "message")
                    .unwrap_or_else(|| "Test message from content-guard".to_string());
                match self.services.outbox.send(&message).await {
                    Ok(true) => CommandResult::ok("test message sent"),
                    Ok(false) => CommandResult::fail("outbox rejected the message"),
                    Err(e) => CommandResult::fail(format!("failed to send: {e:#}")),
                }
            },
            "request_llm" => match param_str(params, "prompt") {
                Some(prompt) => self.request_llm(&prompt).await,
                None => CommandResult::fail("missing parameter: prompt"),
            },
            other => CommandResult::fail(format!("unknown command: {other}")),
        }
    }

    fn on_config_changed(&self) {
        info!(
            extension = ID,
            filter = ENABLE_FILTER.get(&self.store),
            prefix = ENABLE_PREFIX.get(&self.store),
            block_check = ENABLE_BLOCK_CHECK.get(&self.store),
            "content-guard configuration applied"
        );
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::bundled::testing::{RecordingOutbox, ScriptedModel, services_at},
        chrono::{Local, TimeZone},
        parley_common::InMemoryContext,
        rstest::rstest,
    };

    fn guard_at(root: &std::path::Path, hour: u32) -> ContentGuard {
        let at = Local.with_ymd_and_hms(2025, 5, 6, hour, 15, 0).single().unwrap();
        let guard = ContentGuard::new(ExtensionStore::open(root, ID), services_at(at)).unwrap();
        guard.initialize().unwrap();
        guard
    }

    fn guard(root: &std::path::Path) -> ContentGuard {
        guard_at(root, 12)
    }

    fn params(v: Value) -> CommandParams {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn pre_merge_masks_and_tags_vip() {
        let tmp = tempfile::tempdir().unwrap();
        let g = guard(tmp.path());
        VIP_SOURCES.set(&g.store, vec!["12345678".into()]).unwrap();

        assert_eq!(
            g.pre_merge("no spam please", "someone"),
            HookOutcome::Modified("no *** please".into())
        );
        assert_eq!(
            g.pre_merge("hello", "12345678"),
            HookOutcome::Modified("[VIP] hello".into())
        );
        assert_eq!(g.pre_merge("hello", "someone"), HookOutcome::Continue);
    }

    #[test]
    fn pre_merge_limits_length() {
        let tmp = tempfile::tempdir().unwrap();
        let g = guard(tmp.path());
        MAX_MESSAGE_LENGTH.set(&g.store, 4).unwrap();
        assert_eq!(
            g.pre_merge("abcdefgh", "u"),
            HookOutcome::Modified("abcd...[truncated]".into())
        );
    }

    #[rstest]
    #[case("!help")]
    #[case("  !STATUS ")]
    #[case("[2025-05-06 12:15:00] !stats")]
    #[case("[VIP] !config")]
    fn chat_commands_intercept(#[case] text: &str) {
        let tmp = tempfile::tempdir().unwrap();
        let g = guard(tmp.path());
        assert!(matches!(g.post_merge(text), HookOutcome::Intercepted(_)));
    }

    #[test]
    fn post_merge_counts_and_unescapes() {
        let tmp = tempfile::tempdir().unwrap();
        let g = guard(tmp.path());
        assert_eq!(
            g.post_merge(r"line one\nline two"),
            HookOutcome::Modified("line one\nline two".into())
        );
        assert_eq!(g.post_merge("plain"), HookOutcome::Continue);
        assert_eq!(g.store.counter(MESSAGES), 2);
    }

    #[test]
    fn short_stamp_is_added_once() {
        let tmp = tempfile::tempdir().unwrap();
        let g = guard(tmp.path());
        ENABLE_TIMESTAMP.set(&g.store, true).unwrap();
        let HookOutcome::Modified(stamped) = g.post_merge("hi") else {
            panic!("expected a stamp");
        };
        assert_eq!(stamped, "[12:15:00] hi");
        assert_eq!(g.post_merge(&stamped), HookOutcome::Continue);
    }

    #[test]
    fn appended_duplicates_collapse() {
        let tmp = tempfile::tempdir().unwrap();
        let g = guard(tmp.path());
        assert_eq!(
            g.message_appended("[10:00:00] a", "[10:00:05] b", "[10:00:00] a [10:00:05] b"),
            HookOutcome::Modified("[10:00:00] a b".into())
        );
        assert_eq!(
            g.message_appended("hi there", "there", "hi therethere"),
            HookOutcome::Modified("hi there".into())
        );
        assert_eq!(g.message_appended("a", "b", "ab"), HookOutcome::Continue);

        ENABLE_APPEND_MARK.set(&g.store, true).unwrap();
        assert_eq!(
            g.message_appended("a", "b", "ab"),
            HookOutcome::Modified("ab [appended]".into())
        );
        assert_eq!(
            g.message_appended("a", "b", "ab [appended]"),
            HookOutcome::Continue
        );
    }

    fn request(system: &str) -> String {
        json!({
            "model": "m",
            "messages": [{"role": "system", "content": system}, {"role": "user", "content": "x"}],
            "temperature": 0.7,
            "max_tokens": 1000
        })
        .to_string()
    }

    fn modified_doc(outcome: HookOutcome) -> Value {
        match outcome {
            HookOutcome::Modified(doc) => serde_json::from_str(&doc).unwrap(),
            other => panic!("expected Modified, got {other:?}"),
        }
    }

    #[test]
    fn request_tuning_by_time_and_question_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let night = guard_at(tmp.path(), 23);
        let doc = modified_doc(night.pre_llm_request(&request("be nice"), "hi").unwrap());
        assert_eq!(doc["temperature"], 0.5);
        assert_eq!(doc["max_tokens"], 512);
        assert_eq!(
            doc["messages"][0]["content"],
            "be nice\n\n[System time: 2025-05-06 23:15:00]"
        );

        let day = guard_at(tmp.path(), 12);
        let doc = modified_doc(
            day.pre_llm_request(&request("s"), "why? how? what? really")
                .unwrap(),
        );
        assert_eq!(doc["temperature"], 0.7);
        assert_eq!(doc["max_tokens"], 2048);
    }

    #[test]
    fn system_time_note_is_added_once() {
        let tmp = tempfile::tempdir().unwrap();
        let g = guard(tmp.path());
        let noted = request("s\n\n[System time: 2025-01-01 00:00:00]");
        assert_eq!(
            g.pre_llm_request(&noted, "a medium length question?")
                .unwrap(),
            HookOutcome::Continue
        );
    }

    #[test]
    fn test_trigger_intercepts_request() {
        let tmp = tempfile::tempdir().unwrap();
        let g = guard(tmp.path());
        let outcome = g.pre_llm_request(&request("s"), "please !test this").unwrap();
        let HookOutcome::Intercepted(doc) = outcome else {
            panic!("expected intercept");
        };
        let doc: Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(doc["messages"][0]["type"], "text");
    }

    #[test]
    fn malformed_request_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let g = guard(tmp.path());
        assert!(g.pre_llm_request("not json", "hello there").is_err());
    }

    #[test]
    fn response_prefix_clamp_and_truncate() {
        let tmp = tempfile::tempdir().unwrap();
        let g = guard(tmp.path());
        MAX_CONTENT_LENGTH.set(&g.store, 20).unwrap();
        let response = json!({"messages": [
            {"type": "text", "content": "short", "delay_ms": 9000},
            {"type": "text", "content": "[AI Enhanced] ok"},
            {"type": "text", "content": "a reply that is definitely too long"}
        ]})
        .to_string();

        let doc = modified_doc(g.llm_response(&response).unwrap());
        assert_eq!(doc["messages"][0]["content"], "[AI Enhanced] short");
        assert_eq!(doc["messages"][0]["delay_ms"], 5000);
        assert_eq!(doc["messages"][1]["content"], "[AI Enhanced] ok");
        assert_eq!(
            doc["messages"][2]["content"],
            "[AI Enhanced] a repl...[content truncated]"
        );
        assert_eq!(g.store.counter(PROCESSED), 1);

        // Running the modified document through again changes nothing.
        let again = serde_json::to_string(&doc).unwrap();
        assert_eq!(g.llm_response(&again).unwrap(), HookOutcome::Continue);
    }

    #[test]
    fn block_check_intercepts_reply() {
        let tmp = tempfile::tempdir().unwrap();
        let g = guard(tmp.path());
        let response =
            json!({"messages": [{"type": "text", "content": "this has sensitive content"}]})
                .to_string();
        assert!(matches!(
            g.llm_response(&response).unwrap(),
            HookOutcome::Modified(_)
        ));

        ENABLE_BLOCK_CHECK.set(&g.store, true).unwrap();
        assert!(matches!(
            g.llm_response(&response).unwrap(),
            HookOutcome::Intercepted(_)
        ));
    }

    #[test]
    fn response_without_messages_passes() {
        let tmp = tempfile::tempdir().unwrap();
        let g = guard(tmp.path());
        assert_eq!(
            g.llm_response(r#"{"choices":[]}"#).unwrap(),
            HookOutcome::Continue
        );
    }

    #[tokio::test]
    async fn context_commands() {
        let tmp = tempfile::tempdir().unwrap();
        let g = guard(tmp.path());
        let ctx = InMemoryContext::new();
        ctx.append(Role::User, "u1".into());
        ctx.append(Role::Assistant, "a1".into());
        ctx.append(Role::Assistant, "a2".into());

        let added = g
            .execute("add_context", &params(json!({"content": "be kind"})), &ctx)
            .await;
        assert!(added.success);
        assert_eq!(ctx.messages().last().unwrap().content, "[Injected] be kind");
        assert!(
            !g.execute("add_context", &CommandParams::new(), &ctx)
                .await
                .success
        );

        let analysis = g
            .execute("analyze_context", &CommandParams::new(), &ctx)
            .await;
        let data = analysis.data.unwrap();
        assert_eq!(data["total"], 4);
        assert_eq!(data["assistant"], 2);
        assert_eq!(data["recent"].as_array().unwrap().len(), 3);

        let bad = g
            .execute("remove_last_ai", &params(json!({"count": "zero"})), &ctx)
            .await;
        assert!(!bad.success);
        let removed = g
            .execute("remove_last_ai", &params(json!({"count": 5})), &ctx)
            .await;
        assert_eq!(removed.data.unwrap()["removed"], 2);

        assert!(
            g.execute("clear_context", &CommandParams::new(), &ctx)
                .await
                .success
        );
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn counter_commands() {
        let tmp = tempfile::tempdir().unwrap();
        let g = guard(tmp.path());
        let ctx = InMemoryContext::new();
        g.post_merge("hello");

        let stats = g.execute("stats", &CommandParams::new(), &ctx).await;
        assert_eq!(stats.data.unwrap()[MESSAGES], 1);

        let reset = g.execute("reset", &CommandParams::new(), &ctx).await;
        assert!(reset.success);
        assert_eq!(g.store.counter(MESSAGES), 0);

        let config = g.execute("get_config", &CommandParams::new(), &ctx).await;
        assert_eq!(config.data.unwrap()["PrefixText"], "[AI Enhanced]");
    }

    #[tokio::test]
    async fn outbox_and_model_commands() {
        let tmp = tempfile::tempdir().unwrap();
        let outbox = Arc::new(RecordingOutbox::default());
        let model = Arc::new(ScriptedModel::new(["pong"]));
        let at = Local.with_ymd_and_hms(2025, 5, 6, 12, 0, 0).single().unwrap();
        let services = services_at(at).with_outbox(outbox.clone()).with_model(model.clone());
        let g = ContentGuard::new(ExtensionStore::open(tmp.path(), ID), services).unwrap();
        let ctx = InMemoryContext::new();

        let sent = g
            .execute("send_test", &params(json!({"message": "ping"})), &ctx)
            .await;
        assert!(sent.success);
        assert_eq!(outbox.sent(), vec!["ping"]);

        let reply = g
            .execute("request_llm", &params(json!({"prompt": "hi"})), &ctx)
            .await;
        assert!(reply.success);
        assert_eq!(reply.data.unwrap()["response"], "pong");
        let request: Value = serde_json::from_str(&model.requests()[0]).unwrap();
        assert_eq!(request["messages"][0]["content"], "hi");

        assert!(
            !g.execute("request_llm", &CommandParams::new(), &ctx)
                .await
                .success
        );
    }
}
