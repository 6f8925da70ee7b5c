use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("invalid turn transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Context helpers ─────────────────────────────────────────────────────────

/// Error types buildable from a plain message. Required by [`impl_context!`].
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

/// `"<context>: <source>"`, the message shape every crate uses for wrapped errors.
#[doc(hidden)]
pub fn contextual<E: FromMessage>(context: impl Into<String>, source: impl std::fmt::Display) -> E {
    E::from_message(format!("{}: {source}", context.into()))
}

/// Define a crate-local `Context` trait adding `.context()` and
/// `.with_context()` to `Result` and `Option`, converting into the calling
/// module's `Error` (which must implement [`FromMessage`]) and `Result<T>`.
#[macro_export]
macro_rules! impl_context {
    () => {
        pub trait Context<T> {
            fn context(self, context: impl Into<String>) -> Result<T>;

            fn with_context<C: Into<String>>(self, f: impl FnOnce() -> C) -> Result<T>;
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.map_err(|source| $crate::error::contextual::<Error>(context, source))
            }

            fn with_context<C: Into<String>>(self, f: impl FnOnce() -> C) -> Result<T> {
                self.map_err(|source| $crate::error::contextual::<Error>(f(), source))
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(context.into()))
            }

            fn with_context<C: Into<String>>(self, f: impl FnOnce() -> C) -> Result<T> {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(f().into()))
            }
        }
    };
}
