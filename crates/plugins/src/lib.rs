//! Extension host and message pipeline.
//!
//! Extensions register handlers at five points of a conversation turn
//! (PreMerge, PostMerge, MessageAppended, PreLLMRequest, LLMResponse) and
//! expose operational commands. Each extension keeps its configuration and
//! counters under `<data_dir>/extensions/<id>/`.

pub mod bundled;
pub mod command;
pub mod error;
pub mod extension;
pub mod host;
pub mod pipeline;
pub mod settings;
pub mod state_store;
pub mod transforms;

pub use {
    command::{CommandParams, CommandResult, CommandSpec},
    error::{Error, Result},
    extension::{Clock, Extension, FixedClock, HostServices, ModelClient, Outbox, SystemClock},
    host::{ExtensionHost, ExtensionInfo},
    pipeline::{FragmentOutcome, Pipeline, StageOutcome, TurnOutcome},
    settings::{ConfigMap, ConfigValue, Setting},
    state_store::ExtensionStore,
};
