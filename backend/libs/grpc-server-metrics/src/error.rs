//! Error types for metrics setup operations
//!
//! None of these ever reach an RPC caller. They are returned from
//! construction, configuration and exposition paths only.

use thiserror::Error;

/// Result type for metrics setup operations
pub type Result<T> = std::result::Result<T, MetricsError>;

#[derive(Debug, Error)]
pub enum MetricsError {
    /// The prometheus backend rejected a metric or registration
    #[error("Metrics backend error: {0}")]
    Backend(#[from] prometheus::Error),

    /// Configuration values are unusable
    #[error("Invalid metrics configuration: {0}")]
    InvalidConfig(String),

    /// A protobuf file descriptor set could not be decoded
    #[error("Failed to decode file descriptor set: {0}")]
    Descriptor(#[from] prost::DecodeError),

    /// Exposition output was not valid UTF-8
    #[error("Failed to encode metrics: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

impl MetricsError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
