//! Error types for the airgap push pipeline
//!
//! Every variant aborts the run it occurs in. Copy failures are only
//! surfaced here once the retry budget of the pusher is exhausted.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AirgapError>;

#[derive(Debug, Error)]
pub enum AirgapError {
    /// Archive read or extraction failures
    #[error("IO error: {0}")]
    Io(String),
    /// Unexpected path shape, unsupported transport format or unsafe entry names
    #[error("Malformed bundle: {0}")]
    MalformedBundle(String),
    /// Per-image transport failure
    #[error("Copy error: {0}")]
    Copy(String),
    /// Airgap metadata document missing or undecodable
    #[error("Metadata error: {0}")]
    Metadata(String),
    /// Temporary registry lifecycle errors
    #[error("Registry error: {0}")]
    Registry(String),
    /// Invalid configuration or arguments
    #[error("Configuration error: {0}")]
    Config(String),
    /// JSON/YAML encoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AirgapError {
    /// Prefixes the message with context while keeping the variant.
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        match self {
            AirgapError::Io(msg) => AirgapError::Io(format!("{}: {}", context, msg)),
            AirgapError::MalformedBundle(msg) => {
                AirgapError::MalformedBundle(format!("{}: {}", context, msg))
            }
            AirgapError::Copy(msg) => AirgapError::Copy(format!("{}: {}", context, msg)),
            AirgapError::Metadata(msg) => AirgapError::Metadata(format!("{}: {}", context, msg)),
            AirgapError::Registry(msg) => AirgapError::Registry(format!("{}: {}", context, msg)),
            AirgapError::Config(msg) => AirgapError::Config(format!("{}: {}", context, msg)),
            AirgapError::Serialization(msg) => {
                AirgapError::Serialization(format!("{}: {}", context, msg))
            }
        }
    }
}

impl From<std::io::Error> for AirgapError {
    fn from(err: std::io::Error) -> Self {
        AirgapError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AirgapError {
    fn from(err: serde_json::Error) -> Self {
        AirgapError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for AirgapError {
    fn from(err: serde_yaml::Error) -> Self {
        AirgapError::Metadata(err.to_string())
    }
}

impl From<reqwest::Error> for AirgapError {
    fn from(err: reqwest::Error) -> Self {
        AirgapError::Registry(err.to_string())
    }
}

impl From<url::ParseError> for AirgapError {
    fn from(err: url::ParseError) -> Self {
        AirgapError::Config(err.to_string())
    }
}
