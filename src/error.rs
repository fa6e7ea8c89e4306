//! Error types for the room synchronization core

use thiserror::Error;

/// Room-sync error types
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("room '{0}' is not a producer room")]
    NotAProducer(String),

    #[error("pattern names are not allowed for producer rooms: '{0}'")]
    PatternNotAllowedForProducer(String),

    #[error("room name must not be empty")]
    EmptyRoomName,

    #[error("failed to initialize room '{name}': {source}")]
    Initialization {
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("redis error: {0}")]
    Redis(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Wrap `self` as the cause of an `Initialization` failure for `name`.
    #[must_use]
    pub fn into_initialization(self, name: &str) -> Self {
        Self::Initialization {
            name: name.to_string(),
            source: Box::new(self),
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::Redis(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type for room-sync operations
pub type Result<T> = std::result::Result<T, Error>;
