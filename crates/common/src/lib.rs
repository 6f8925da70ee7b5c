//! Shared types, error definitions, and the hook pipeline core used across all parley crates.

pub mod context;
pub mod error;
pub mod hooks;
pub mod turn;

pub use {
    context::{ContextMessage, ConversationContext, InMemoryContext, Role},
    error::{Error, FromMessage, Result},
    turn::{Turn, TurnState},
};
