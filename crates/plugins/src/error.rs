use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    Turn(#[from] parley_common::Error),

    #[error("model request failed: {0:#}")]
    Model(anyhow::Error),

    #[error("failed to read state at {path}: {reason}")]
    InvalidState { path: PathBuf, reason: String },

    #[error("invalid time format {pattern:?}: {reason}")]
    InvalidTimeFormat { pattern: String, reason: String },

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn invalid_state(path: &Path, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn invalid_time_format(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTimeFormat {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }
}

impl parley_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

parley_common::impl_context!();
