// ============================================================================
// Error Handling
// ============================================================================

use thiserror::Error;

use crate::models::SourceTag;

/// Failure of one poll against an upstream feed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    /// Transport failure (connect, timeout, non-2xx status, truncated body).
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The feed answered but the body is not the shape we expect.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Some of the per-route requests failed; the rest were used.
    #[error("{failed} of {total} per-route requests failed")]
    PartialSourceFailure { failed: usize, total: usize },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::NetworkError(_))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    #[error("Vehicle '{0}' is not currently visible")]
    UnknownVehicle(String),

    #[error("Vehicle '{0}' has neither a trip nor a route to draw")]
    NoShapeKey(String),

    #[error("Tracker is shutting down")]
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{tag} polling interval must be greater than zero")]
    ZeroInterval { tag: SourceTag },

    #[error("{tag} polling interval must be at most {max_secs} seconds")]
    IntervalTooLong { tag: SourceTag, max_secs: u64 },

    #[error("Per-route source is enabled but no routes are configured")]
    NoRoutes,

    #[error("Trail capacity must be greater than zero")]
    ZeroTrailCapacity,

    #[error("At least one source must be enabled")]
    NoSources,

    #[error("Unknown timezone '{0}'")]
    UnknownTimezone(String),
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to prepare HTTP client: {0}")]
    Http(#[from] FetchError),
}

pub type Result<T> = std::result::Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_retryable() {
        assert!(FetchError::NetworkError("timeout".to_string()).is_retryable());
        assert!(!FetchError::MalformedPayload("not an object".to_string()).is_retryable());
        assert!(!FetchError::PartialSourceFailure { failed: 2, total: 5 }.is_retryable());
    }

    #[test]
    fn partial_failure_message_reports_counts() {
        let e = FetchError::PartialSourceFailure { failed: 2, total: 5 };
        assert_eq!(e.to_string(), "2 of 5 per-route requests failed");
    }
}
