#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end turns through the bundled extensions.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Local, TimeZone},
    parley_common::{ConversationContext, InMemoryContext, Role, Turn, TurnState},
    parley_config::ParleyConfig,
    parley_plugins::{
        CommandParams, ExtensionHost, ExtensionStore, FixedClock, FragmentOutcome, HostServices,
        ModelClient, Outbox, Pipeline, TurnOutcome,
        bundled::{self, content_guard, reinforcement, timestamp},
    },
    serde_json::{Value, json},
};

const STAMP: &str = "[2025-05-06 12:00:00] ";

/// Replies with the same one-entry document and keeps every request.
#[derive(Default)]
struct ReplyModel {
    requests: Mutex<Vec<String>>,
}

#[async_trait]
impl ModelClient for ReplyModel {
    async fn complete(&self, request: &str) -> anyhow::Result<String> {
        self.requests.lock().unwrap().push(request.to_string());
        Ok(json!({"messages": [{"type": "text", "content": "noted"}]}).to_string())
    }
}

struct SilentOutbox;

#[async_trait]
impl Outbox for SilentOutbox {
    async fn send(&self, _text: &str) -> anyhow::Result<bool> {
        Ok(true)
    }
}

fn noon() -> DateTime<Local> {
    Local.with_ymd_and_hms(2025, 5, 6, 12, 0, 0).single().unwrap()
}

fn pipeline(data_dir: &Path, model: Arc<ReplyModel>) -> Pipeline {
    let config = ParleyConfig::default();
    let services =
        HostServices::new(model, Arc::new(SilentOutbox)).with_clock(Arc::new(FixedClock(noon())));
    let mut host = ExtensionHost::from_config(&config.hooks);
    bundled::register_all(&mut host, &config, data_dir, services.clone()).unwrap();
    Pipeline::new(Arc::new(host), services)
}

fn user_entries(ctx: &InMemoryContext) -> Vec<String> {
    ctx.messages()
        .into_iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content)
        .collect()
}

#[tokio::test]
async fn six_turns_get_two_reinforcements_and_one_stamp_each() {
    let tmp = tempfile::tempdir().unwrap();
    let model = Arc::new(ReplyModel::default());
    let pipeline = pipeline(tmp.path(), model.clone());
    let ctx = InMemoryContext::new();

    for i in 1..=6 {
        let outcome = pipeline
            .submit("user", &[&format!("message number {i}")], &ctx)
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Delivered("[AI Enhanced] noted".into()));
    }

    let messages = ctx.messages();
    let injected: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.content.starts_with(reinforcement::MARKER))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(injected.len(), 2);
    assert_eq!(messages[injected[0] - 1].content, format!("{STAMP}message number 3"));
    assert_eq!(messages[injected[1] - 1].content, format!("{STAMP}message number 6"));

    for entry in user_entries(&ctx) {
        assert!(entry.starts_with(STAMP));
        assert_eq!(entry.matches("[2025-").count(), 1);
    }

    // The injected system entry reaches the model with a time note.
    let requests = model.requests.lock().unwrap();
    let third: Value = serde_json::from_str(&requests[2]).unwrap();
    let system = third["messages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["role"] == "system")
        .unwrap();
    assert!(
        system["content"]
            .as_str()
            .unwrap()
            .ends_with("[System time: 2025-05-06 12:00:00]")
    );
}

#[tokio::test]
async fn appended_fragments_keep_a_single_stamp() {
    let tmp = tempfile::tempdir().unwrap();
    let pipeline = pipeline(tmp.path(), Arc::new(ReplyModel::default()));
    let ctx = InMemoryContext::new();

    let mut turn = Turn::merged("user", "hello");
    pipeline.post_merge(&mut turn, &ctx).await.unwrap();
    assert_eq!(turn.text, format!("{STAMP}hello"));

    let full = format!("{} [2025-05-06 11:59:59] world", turn.text);
    pipeline
        .message_appended(&mut turn, "world", &full, &ctx)
        .await
        .unwrap();
    pipeline.post_merge(&mut turn, &ctx).await.unwrap();

    assert_eq!(user_entries(&ctx), vec![format!("{STAMP}hello world")]);

    let outcome = pipeline.complete(&mut turn, &ctx).await.unwrap();
    assert_eq!(outcome.text(), "[AI Enhanced] noted");
}

#[tokio::test]
async fn banned_words_are_masked_before_the_context() {
    let tmp = tempfile::tempdir().unwrap();
    let pipeline = pipeline(tmp.path(), Arc::new(ReplyModel::default()));
    let ctx = InMemoryContext::new();

    pipeline
        .submit("user", &["this looks like a scam", "and spam"], &ctx)
        .await
        .unwrap();
    assert_eq!(user_entries(&ctx), vec![format!(
        "{STAMP}this looks like a ***\nand ***"
    )]);
}

/// A turn whose first fragment "hello" went through PreMerge, merging and PostMerge.
async fn merged_hello(pipeline: &Pipeline, ctx: &InMemoryContext) -> Turn {
    let mut turn = Turn::new("user");
    pipeline.pre_merge(&mut turn, "hello", ctx).await.unwrap();
    turn.merge("hello").unwrap();
    pipeline.post_merge(&mut turn, ctx).await.unwrap();
    turn
}

#[tokio::test]
async fn banned_words_in_appended_fragments_are_masked() {
    let tmp = tempfile::tempdir().unwrap();
    let model = Arc::new(ReplyModel::default());
    let pipeline = pipeline(tmp.path(), model.clone());
    let ctx = InMemoryContext::new();
    let mut turn = merged_hello(&pipeline, &ctx).await;

    // Filtering a later fragment up front leaves the merged turn alone.
    let early = pipeline.pre_merge(&mut turn, "buy spam", &ctx).await.unwrap();
    assert_eq!(early, FragmentOutcome::Accepted("buy ***".into()));
    assert_eq!(turn.state(), TurnState::Merged);
    assert_eq!(turn.fragments, vec!["hello".to_string()]);

    // The host merged the raw fragment; it is filtered on the way in.
    let full = format!("{} buy spam", turn.text);
    let appended = pipeline
        .message_appended(&mut turn, "buy spam", &full, &ctx)
        .await
        .unwrap();
    assert_eq!(appended, FragmentOutcome::Accepted("buy ***".into()));
    assert_eq!(turn.state(), TurnState::Appended);
    assert_eq!(user_entries(&ctx), vec![format!("{STAMP}hello buy ***")]);

    pipeline.complete(&mut turn, &ctx).await.unwrap();
    let requests = model.requests.lock().unwrap();
    assert!(requests[0].contains("hello buy ***"));
    assert!(!requests[0].contains("spam"));
}

#[tokio::test]
async fn intercepted_append_leaves_the_turn_open() {
    let tmp = tempfile::tempdir().unwrap();
    let pipeline = pipeline(tmp.path(), Arc::new(ReplyModel::default()));
    let ctx = InMemoryContext::new();
    let mut turn = merged_hello(&pipeline, &ctx).await;

    let full = format!("{} !reinforcement-stats", turn.text);
    let outcome = pipeline
        .message_appended(&mut turn, "!reinforcement-stats", &full, &ctx)
        .await
        .unwrap();
    assert!(matches!(outcome, FragmentOutcome::Intercepted(ref t) if t.contains("injections: 0")));
    assert_eq!(turn.state(), TurnState::Merged);
    assert_eq!(user_entries(&ctx), vec![format!("{STAMP}hello")]);

    let reply = pipeline.complete(&mut turn, &ctx).await.unwrap();
    assert_eq!(reply, TurnOutcome::Delivered("[AI Enhanced] noted".into()));
}

#[tokio::test]
async fn chat_commands_never_reach_the_model() {
    let tmp = tempfile::tempdir().unwrap();
    let model = Arc::new(ReplyModel::default());
    let pipeline = pipeline(tmp.path(), model.clone());
    let ctx = InMemoryContext::new();

    let help = pipeline.submit("user", &["!help"], &ctx).await.unwrap();
    assert!(matches!(help, TurnOutcome::Intercepted(ref t) if t.contains("!status")));

    let stats = pipeline
        .submit("user", &["!reinforcement-stats"], &ctx)
        .await
        .unwrap();
    assert!(matches!(stats, TurnOutcome::Intercepted(ref t) if t.contains("injections: 0")));

    let test = pipeline.submit("user", &["!test"], &ctx).await.unwrap();
    assert!(matches!(test, TurnOutcome::Intercepted(ref t) if t.starts_with("🧪")));

    assert!(model.requests.lock().unwrap().is_empty());
    assert!(user_entries(&ctx).len() <= 1);
    assert!(ctx.messages().iter().all(|m| m.role != Role::Assistant));
}

#[tokio::test]
async fn commands_route_through_the_host() {
    let tmp = tempfile::tempdir().unwrap();
    let pipeline = pipeline(tmp.path(), Arc::new(ReplyModel::default()));
    let ctx = InMemoryContext::new();
    pipeline.submit("user", &["hello there"], &ctx).await.unwrap();

    let host = pipeline.host();
    let stats = host
        .execute(content_guard::ID, "stats", &CommandParams::new(), &ctx)
        .await;
    assert!(stats.success);
    assert_eq!(stats.data.unwrap()["messages"], 1);

    let mut params = CommandParams::new();
    params.insert("count".into(), json!(1));
    let removed = host
        .execute(content_guard::ID, "remove_last_ai", &params, &ctx)
        .await;
    assert_eq!(removed.data.unwrap()["removed"], 1);

    let example = host
        .execute(timestamp::ID, "test", &CommandParams::new(), &ctx)
        .await;
    assert_eq!(example.data.unwrap()["example"], format!("{STAMP}hello"));

    assert!(
        !host
            .execute("missing", "stats", &CommandParams::new(), &ctx)
            .await
            .success
    );
}

#[tokio::test]
async fn counters_survive_a_restart() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let pipeline = pipeline(tmp.path(), Arc::new(ReplyModel::default()));
        let ctx = InMemoryContext::new();
        for i in 0..3 {
            pipeline
                .submit("user", &[&format!("turn {i}")], &ctx)
                .await
                .unwrap();
        }
        pipeline.host().shutdown_all();
    }

    let guard = ExtensionStore::open(tmp.path(), content_guard::ID);
    assert_eq!(guard.counter("messages"), 3);
    assert_eq!(guard.counter("processed"), 3);
    let reinforcement = ExtensionStore::open(tmp.path(), reinforcement::ID);
    assert_eq!(reinforcement.counter("injected"), 1);

    // Defaults were committed once and are picked up again.
    let reopened = pipeline(tmp.path(), Arc::new(ReplyModel::default()));
    let ctx = InMemoryContext::new();
    let config = reopened
        .host()
        .execute(content_guard::ID, "get_config", &CommandParams::new(), &ctx)
        .await;
    assert_eq!(config.data.unwrap()["MaxDelay"], 5000);
}

#[tokio::test]
async fn config_updates_take_effect_on_the_next_turn() {
    let tmp = tempfile::tempdir().unwrap();
    let pipeline = pipeline(tmp.path(), Arc::new(ReplyModel::default()));
    let ctx = InMemoryContext::new();

    let store = pipeline.host().get(timestamp::ID).unwrap().store();
    let mut config = store.config();
    config.insert("EnableTimestamp".into(), false.into());
    pipeline.host().update_config(timestamp::ID, config).unwrap();

    pipeline.submit("user", &["plain"], &ctx).await.unwrap();
    assert_eq!(user_entries(&ctx), vec!["plain".to_string()]);
}
