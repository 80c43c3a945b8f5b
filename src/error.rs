//! Error types for image generation.

use std::time::Duration;

/// Errors that can occur while talking to the generation service.
#[derive(Debug, thiserror::Error)]
pub enum StableGenError {
    /// API key missing, malformed or rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Rate limit exceeded.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Request exceeded the configured timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Network or HTTP error.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Failed to decode an artifact payload.
    #[error("failed to decode: {0}")]
    Decode(String),

    /// I/O error (e.g., saving file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The caller abandoned the request.
    #[error("generation cancelled")]
    Cancelled,
}

impl StableGenError {
    /// Returns true if this error is likely transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Network(_) => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns the suggested retry delay, if available.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            Self::Timeout(_) => Some(Duration::from_secs(1)),
            Self::Network(_) => Some(Duration::from_secs(2)),
            Self::Api { status, .. } if *status >= 500 => Some(Duration::from_secs(2)),
            _ => None,
        }
    }
}

/// Result type alias for generation operations.
pub type Result<T> = std::result::Result<T, StableGenError>;

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Redacts anything that looks like an API key and truncates long bodies.
///
/// Provider error bodies sometimes echo the request headers back, so the
/// secret could otherwise end up in logs or on screen.
pub(crate) fn sanitize_error_message(text: &str) -> String {
    let redacted = text
        .split(' ')
        .map(|word| {
            let bare = word.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-');
            if bare.starts_with("sk-") && bare.len() > 8 {
                word.replace(bare, "sk-***")
            } else {
                word.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    if redacted.chars().count() > MAX_ERROR_MESSAGE_LEN {
        let truncated: String = redacted.chars().take(MAX_ERROR_MESSAGE_LEN).collect();
        format!("{truncated}...")
    } else {
        redacted
    }
}

/// Parses a `Retry-After` header given in whole seconds.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
