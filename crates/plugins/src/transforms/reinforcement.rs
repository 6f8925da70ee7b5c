//! Periodic system-entry injection, guarded against doubles by a marker tag.

use parley_common::{ContextMessage, ConversationContext, Role};

/// What [`Injector::decide`] concluded for the current context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectDecision {
    /// The current user turn is not a multiple of the interval.
    NotDue { ordinal: usize },
    /// Due, but this turn already carries an injected entry.
    AlreadyInjected { ordinal: usize },
    /// Due and not yet injected.
    Inject { ordinal: usize },
}

/// Appends `marker + " " + prompt` as a system entry every `interval` user turns.
#[derive(Debug, Clone)]
pub struct Injector {
    marker: String,
    interval: usize,
}

impl Injector {
    /// An interval of zero never injects.
    pub fn new(marker: impl Into<String>, interval: usize) -> Self {
        Self {
            marker: marker.into(),
            interval,
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Content of an injected entry.
    pub fn entry_text(&self, prompt: &str) -> String {
        format!("{} {prompt}", self.marker)
    }

    pub fn decide(&self, messages: &[ContextMessage]) -> InjectDecision {
        let ordinal = messages.iter().filter(|m| m.role == Role::User).count();
        if self.interval == 0 || ordinal == 0 || ordinal % self.interval != 0 {
            return InjectDecision::NotDue { ordinal };
        }

        let Some(last_user) = messages.iter().rposition(|m| m.role == Role::User) else {
            return InjectDecision::NotDue { ordinal };
        };

        let carries = |m: &ContextMessage| m.content.contains(&self.marker);
        let before = last_user
            .checked_sub(1)
            .and_then(|i| messages.get(i))
            .is_some_and(carries);
        // Entries after the latest user turn come from a previous run on the
        // same turn.
        let after = messages[last_user + 1..].iter().any(carries);

        if before || after {
            InjectDecision::AlreadyInjected { ordinal }
        } else {
            InjectDecision::Inject { ordinal }
        }
    }

    /// Inject into `ctx` when due. Returns the decision that was taken.
    pub fn apply(&self, ctx: &dyn ConversationContext, prompt: &str) -> InjectDecision {
        let decision = self.decide(&ctx.messages());
        if matches!(decision, InjectDecision::Inject { .. }) {
            ctx.append(Role::System, self.entry_text(prompt));
        }
        decision
    }
}
