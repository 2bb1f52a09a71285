//! Error types for TableWatch

use thiserror::Error;

/// TableWatch error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Unknown entity: {service}.{entity}")]
    UnknownEntity { service: String, entity: String },

    #[error("No change-tracking column could be resolved for {0}")]
    UnresolvableColumn(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    // Source Errors
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Source query timed out after {0}ms")]
    Timeout(u64),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    // Transport Errors
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    // General Errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for TableWatch operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Configuration errors are fatal to a subscription and never retried.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::UnknownService(_)
                | Self::UnknownEntity { .. }
                | Self::UnresolvableColumn(_)
                | Self::InvalidFilter(_)
        )
    }

    /// Transient source errors are reported and retried on the next tick.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Query(_) | Self::Timeout(_) | Self::SourceUnavailable(_) | Self::Io(_)
        )
    }

    /// Stable error code carried in `subscription_error` / `polling_error` payloads
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::UnknownService(_) => "unknown_service",
            Self::UnknownEntity { .. } => "unknown_entity",
            Self::UnresolvableColumn(_) => "unresolvable_column",
            Self::InvalidFilter(_) => "invalid_filter",
            Self::Query(_) => "query_error",
            Self::Timeout(_) => "timeout",
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::ChannelClosed(_) => "channel_closed",
            Self::InvalidMessage(_) => "invalid_message",
            Self::Internal(_) => "internal_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }

    /// HTTP status code for the snapshot endpoint
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidFilter(_) | Self::InvalidMessage(_) | Self::Json(_) => 400,
            Self::UnknownService(_) | Self::UnknownEntity { .. } => 404,
            Self::UnresolvableColumn(_) => 422,
            Self::Timeout(_) => 504,
            Self::SourceUnavailable(_) => 503,
            Self::Config(_)
            | Self::Query(_)
            | Self::ChannelClosed(_)
            | Self::Internal(_)
            | Self::Io(_) => 500,
        }
    }
}
