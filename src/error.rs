//! Error types for the bridge.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Sending or editing a chat message failed. Logged and swallowed by the
    /// stream reconciler.
    #[error("delivery failed ({context}): {source}")]
    Delivery {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Bot login failed. Fatal at startup.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The assistant host rejected or aborted an injection.
    #[error("injection failed: {0}")]
    Injection(String),

    /// Writing the configuration document failed. In-memory state is kept.
    #[error("failed to persist config to {path}: {source}")]
    ConfigPersistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration document could not be read or parsed.
    #[error("invalid config: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    #[must_use]
    pub fn delivery(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Delivery {
            context: context.into(),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
