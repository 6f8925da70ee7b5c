//! A single user turn and its progress through the pipeline.

use std::fmt;

use {
    chrono::{DateTime, Local},
    serde::{Deserialize, Serialize},
    uuid::Uuid,
};

use crate::error::{Error, Result};

/// Where a turn currently sits in the pipeline.
///
/// `Raw → Filtered → Merged → (Appended)* → Requested → Responded → Delivered`,
/// with `Intercepted` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TurnState {
    Raw,
    Filtered,
    Merged,
    Appended,
    Requested,
    Responded,
    Delivered,
    Intercepted,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Intercepted)
    }

    pub fn can_transition(self, to: TurnState) -> bool {
        use TurnState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, to),
            (_, Intercepted)
                | (Raw | Filtered, Filtered)
                | (Filtered, Merged)
                | (Merged | Appended, Appended)
                | (Merged | Appended, Requested)
                | (Requested, Responded)
                | (Responded, Delivered)
        )
    }
}

/// One user conversational unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub text: String,
    pub source: String,
    pub timestamp: DateTime<Local>,
    pub fragments: Vec<String>,
    state: TurnState,
    /// Whether the merged text has been written to the conversation context.
    #[serde(default)]
    committed: bool,
}

impl Turn {
    /// A turn that has not received any fragment yet.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: String::new(),
            source: source.into(),
            timestamp: Local::now(),
            fragments: Vec::new(),
            state: TurnState::Raw,
            committed: false,
        }
    }

    /// Shorthand for a host that already filtered and merged a single fragment.
    pub fn merged(source: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let mut turn = Self::new(source);
        turn.fragments.push(text.clone());
        turn.text = text;
        turn.state = TurnState::Merged;
        turn
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Merged and still open to later fragments.
    pub fn is_merged(&self) -> bool {
        matches!(self.state, TurnState::Merged | TurnState::Appended)
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn mark_committed(&mut self) {
        self.committed = true;
    }

    pub fn transition(&mut self, to: TurnState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Record a fragment that survived the PreMerge stage.
    pub fn accept_fragment(&mut self, fragment: impl Into<String>) -> Result<()> {
        self.transition(TurnState::Filtered)?;
        self.fragments.push(fragment.into());
        Ok(())
    }

    /// Take the host-merged text for the accepted fragments.
    pub fn merge(&mut self, text: impl Into<String>) -> Result<()> {
        if self.fragments.is_empty() {
            return Err(Error::message("cannot merge a turn without fragments"));
        }
        self.transition(TurnState::Merged)?;
        self.text = text.into();
        Ok(())
    }

    /// Record a later fragment merged into this turn; `full` is the host's new text.
    pub fn append_fragment(
        &mut self,
        fragment: impl Into<String>,
        full: impl Into<String>,
    ) -> Result<()> {
        self.transition(TurnState::Appended)?;
        self.fragments.push(fragment.into());
        self.text = full.into();
        Ok(())
    }

    pub fn intercept(&mut self) {
        if !self.state.is_terminal() {
            self.state = TurnState::Intercepted;
        }
    }
}
