//! Error types for stash databases.

use crate::config::ConfigError;

/// Failure of a single synch round-trip.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("server responded with status {0}")]
    Status(u16),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl TransportError {
    /// The HTTP status, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status(status) => Some(*status),
            _ => None,
        }
    }
}

/// Database error type.
///
/// `Clone` so that one synch outcome can be handed to every coalesced caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("engine error: {0}")]
    Engine(#[from] stash_engine::Error),

    #[error("table '{0}' already exists")]
    TableExists(String),

    #[error("no table named '{0}'")]
    TableNotFound(String),

    #[error("synch is disabled for database '{0}'")]
    SynchDisabled(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("synch task was aborted")]
    Aborted,
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias for database operations.
pub type Result<T> = std::result::Result<T, Error>;
