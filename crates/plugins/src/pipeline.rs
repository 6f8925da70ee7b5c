//! Drives one turn through the five extension points.
//!
//! Fragment merging belongs to the host: it calls [`Pipeline::pre_merge`] per
//! fragment, merges what was accepted, and hands the merged turn to
//! [`Pipeline::post_merge`] and [`Pipeline::complete`] (or
//! [`Pipeline::run_turn`] for both).

use std::sync::Arc;

use {
    parley_common::{
        ContextMessage, ConversationContext, Role, Turn, TurnState,
        hooks::{HookOutcome, HookPayload},
    },
    parley_config::ModelConfig,
    serde_json::{Value, json},
    tracing::{debug, info},
};

use crate::{
    error::{Error, Result},
    extension::HostServices,
    host::ExtensionHost,
};

/// Result of the PreMerge stage for one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// The fragment (possibly rewritten) goes on to merging.
    Accepted(String),
    /// The fragment was answered directly; the turn is over.
    Intercepted(String),
}

/// Result of a stage that may end the turn early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Continue,
    Intercepted(String),
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Assistant reply appended to the context.
    Delivered(String),
    /// A handler answered instead of the model.
    Intercepted(String),
}

impl TurnOutcome {
    pub fn text(&self) -> &str {
        match self {
            Self::Delivered(t) | Self::Intercepted(t) => t,
        }
    }
}

pub struct Pipeline {
    host: Arc<ExtensionHost>,
    services: HostServices,
}

impl Pipeline {
    pub fn new(host: Arc<ExtensionHost>, services: HostServices) -> Self {
        Self { host, services }
    }

    pub fn host(&self) -> &Arc<ExtensionHost> {
        &self.host
    }

    /// PreMerge: filter one raw fragment before the host merges it.
    ///
    /// On a turn that is already merged the fragment is a later append: the
    /// turn is left as it is, and an intercept answers only that fragment.
    pub async fn pre_merge(
        &self,
        turn: &mut Turn,
        fragment: &str,
        ctx: &dyn ConversationContext,
    ) -> Result<FragmentOutcome> {
        let later = turn.is_merged();
        let payload = HookPayload::PreMerge {
            fragment: fragment.to_string(),
            source: turn.source.clone(),
            timestamp: self.services.now(),
        };
        let accepted = match self.host.registry().dispatch(&payload, ctx).await {
            HookOutcome::Continue => fragment.to_string(),
            HookOutcome::Modified(text) => text,
            HookOutcome::Intercepted(response) => {
                if later {
                    debug!(turn = %turn.id, "later fragment intercepted");
                } else {
                    turn.intercept();
                }
                return Ok(FragmentOutcome::Intercepted(response));
            },
        };
        if !later {
            turn.accept_fragment(accepted.clone())?;
        }
        Ok(FragmentOutcome::Accepted(accepted))
    }

    /// PostMerge: run the merged turn text through its handlers.
    ///
    /// The user entry is written to the context on the first run; later runs
    /// (after an append) rewrite it in place. An intercept on the run that
    /// wrote the entry takes it back out.
    pub async fn post_merge(
        &self,
        turn: &mut Turn,
        ctx: &dyn ConversationContext,
    ) -> Result<StageOutcome> {
        ensure_state(turn, &[TurnState::Merged, TurnState::Appended])?;

        let first_run = !turn.is_committed();
        if first_run {
            ctx.append(Role::User, turn.text.clone());
            turn.mark_committed();
        }

        let payload = HookPayload::PostMerge {
            text: turn.text.clone(),
            timestamp: turn.timestamp,
        };
        match self.host.registry().dispatch(&payload, ctx).await {
            HookOutcome::Continue => Ok(StageOutcome::Continue),
            HookOutcome::Modified(text) => {
                ctx.replace_last(Role::User, text.clone());
                turn.text = text;
                Ok(StageOutcome::Continue)
            },
            HookOutcome::Intercepted(response) => {
                if first_run {
                    ctx.remove_last(Role::User, 1);
                }
                turn.intercept();
                Ok(StageOutcome::Intercepted(response))
            },
        }
    }

    /// MessageAppended: a later fragment was merged into `turn`; `full` is
    /// the host's new merged text.
    ///
    /// The fragment goes through PreMerge first and its filtered form takes
    /// the raw one's place in `full`. An intercepted fragment is dropped and
    /// the turn keeps its text. MessageAppended handlers can only rewrite
    /// the text.
    pub async fn message_appended(
        &self,
        turn: &mut Turn,
        appended: &str,
        full: &str,
        ctx: &dyn ConversationContext,
    ) -> Result<FragmentOutcome> {
        ensure_state(turn, &[TurnState::Merged, TurnState::Appended])?;
        let filtered = match self.pre_merge(turn, appended, ctx).await? {
            FragmentOutcome::Accepted(text) => text,
            intercepted @ FragmentOutcome::Intercepted(_) => return Ok(intercepted),
        };

        let original = turn.text.clone();
        let full = splice_fragment(&original, full, appended, &filtered);
        let index = turn.fragments.len();
        turn.append_fragment(filtered.clone(), full.clone())?;

        let payload = HookPayload::MessageAppended {
            original,
            appended: filtered.clone(),
            full,
            index,
        };
        if let HookOutcome::Modified(text) = self.host.registry().dispatch(&payload, ctx).await {
            turn.text = text;
        }
        if turn.is_committed() {
            ctx.replace_last(Role::User, turn.text.clone());
        }
        Ok(FragmentOutcome::Accepted(filtered))
    }

    /// Build the request, run PreLLMRequest, call the model, run
    /// LLMResponse and deliver the reply into the context.
    pub async fn complete(
        &self,
        turn: &mut Turn,
        ctx: &dyn ConversationContext,
    ) -> Result<TurnOutcome> {
        turn.transition(TurnState::Requested)?;

        let mut request = build_request(&ctx.messages(), &self.services.model_config).to_string();
        let payload = HookPayload::PreLlmRequest {
            request: request.clone(),
            user_text: turn.text.clone(),
        };
        match self.host.registry().dispatch(&payload, ctx).await {
            HookOutcome::Continue => {},
            HookOutcome::Modified(doc) => request = doc,
            HookOutcome::Intercepted(response) => {
                turn.intercept();
                return Ok(TurnOutcome::Intercepted(render_response(&response)));
            },
        }

        debug!(turn = %turn.id, bytes = request.len(), "sending model request");
        let mut response = self
            .services
            .model
            .complete(&request)
            .await
            .map_err(Error::Model)?;
        turn.transition(TurnState::Responded)?;

        let payload = HookPayload::LlmResponse {
            response: response.clone(),
        };
        match self.host.registry().dispatch(&payload, ctx).await {
            HookOutcome::Continue => {},
            HookOutcome::Modified(doc) => response = doc,
            HookOutcome::Intercepted(doc) => {
                turn.intercept();
                return Ok(TurnOutcome::Intercepted(render_response(&doc)));
            },
        }

        let reply = render_response(&response);
        ctx.append(Role::Assistant, reply.clone());
        turn.transition(TurnState::Delivered)?;
        info!(turn = %turn.id, "turn delivered");
        Ok(TurnOutcome::Delivered(reply))
    }

    /// PostMerge then completion for an already merged turn.
    pub async fn run_turn(
        &self,
        turn: &mut Turn,
        ctx: &dyn ConversationContext,
    ) -> Result<TurnOutcome> {
        if let StageOutcome::Intercepted(response) = self.post_merge(turn, ctx).await? {
            return Ok(TurnOutcome::Intercepted(response));
        }
        self.complete(turn, ctx).await
    }

    /// Feed raw fragments through PreMerge, join the accepted ones and run
    /// the resulting turn to completion.
    pub async fn submit(
        &self,
        source: &str,
        fragments: &[&str],
        ctx: &dyn ConversationContext,
    ) -> Result<TurnOutcome> {
        let mut turn = Turn::new(source);
        let mut accepted = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            match self.pre_merge(&mut turn, fragment, ctx).await? {
                FragmentOutcome::Accepted(text) => accepted.push(text),
                FragmentOutcome::Intercepted(response) => {
                    return Ok(TurnOutcome::Intercepted(response));
                },
            }
        }
        turn.merge(accepted.join("\n"))?;
        self.run_turn(&mut turn, ctx).await
    }
}

/// `full` with the last occurrence of the raw fragment replaced by its
/// filtered form. When the host's merge does not contain the raw fragment
/// verbatim, the filtered fragment is joined onto `original` instead.
fn splice_fragment(original: &str, full: &str, raw: &str, filtered: &str) -> String {
    if raw == filtered {
        return full.to_string();
    }
    match full.rfind(raw) {
        Some(at) if !raw.is_empty() => {
            format!("{}{filtered}{}", &full[..at], &full[at + raw.len()..])
        },
        _ => format!("{original}\n{filtered}"),
    }
}

fn ensure_state(turn: &Turn, allowed: &[TurnState]) -> Result<()> {
    if allowed.contains(&turn.state()) {
        Ok(())
    } else {
        Err(Error::message(format!(
            "turn {} is {}, expected one of {allowed:?}",
            turn.id,
            turn.state()
        )))
    }
}

/// Chat-completion request document for the current context.
pub fn build_request(messages: &[ContextMessage], model: &ModelConfig) -> Value {
    let mut entries = Vec::with_capacity(messages.len() + 1);
    if let Some(prompt) = &model.system_prompt {
        entries.push(json!({"role": "system", "content": prompt}));
    }
    entries.extend(
        messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content})),
    );
    json!({
        "model": model.name,
        "messages": entries,
        "temperature": model.temperature,
        "max_tokens": model.max_tokens,
    })
}

/// Reply text carried by a response document.
///
/// Understands `{"messages":[{"content": ..}]}` and chat-completion
/// `{"choices":[{"message":{"content": ..}}]}`; anything else is returned
/// verbatim.
pub fn render_response(document: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(document) else {
        return document.to_string();
    };

    if let Some(messages) = value.get("messages").and_then(Value::as_array) {
        let parts: Vec<&str> = messages
            .iter()
            .filter_map(|m| m.get("content").and_then(Value::as_str))
            .collect();
        if !parts.is_empty() {
            return parts.join("\n");
        }
    }

    value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map_or_else(|| document.to_string(), str::to_string)
}
