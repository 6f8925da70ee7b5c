//! Reusable text and context transforms used by the bundled extensions.

pub mod filter;
pub mod reinforcement;
pub mod timestamp;

pub use {
    filter::{ContentFilter, FilterOutcome, truncate_chars},
    reinforcement::{InjectDecision, Injector},
    timestamp::TimestampFormat,
};
