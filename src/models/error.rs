//! Error types for distillery.
//!
//! Failure taxonomy:
//! - Configuration: bad or missing settings, fatal to the triggering call
//! - Provider: the fine-tuning backend refused or failed a request
//! - Persistence: local storage failures, usually recovered at the call site
//! - Internal: invariant violations (bugs)

use thiserror::Error;

/// Top-level error type for distillery.
#[derive(Debug, Error)]
pub enum DistilleryError {
    // ═══════════════════════════════════════════════════════════════════
    // CONFIGURATION — propagated to the caller
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("No provider registered under '{0}'")]
    MissingProvider(String),

    #[error("Prompt of {tokens} tokens does not fit any configured model")]
    PromptTooLong { tokens: usize },

    // ═══════════════════════════════════════════════════════════════════
    // PROVIDER — fine-tuning backend failures
    // ═══════════════════════════════════════════════════════════════════

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    // ═══════════════════════════════════════════════════════════════════
    // PERSISTENCE — local storage
    // ═══════════════════════════════════════════════════════════════════

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // INTERNAL — invariant broken
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Fine-tuning provider errors (OpenAI-compatible API semantics).
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication failed: invalid API key")]
    AuthenticationFailed,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited by provider: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<f64>,
    },

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

impl DistilleryError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True when the error means "nothing was there", as opposed to a real failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Network(_)
                | Self::Provider(ProviderError::RateLimited { .. })
        )
    }

    /// Get retry delay hint in seconds, if applicable.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::Provider(ProviderError::RateLimited {
                retry_after_secs, ..
            }) => *retry_after_secs,
            _ => None,
        }
    }
}

/// Result type alias for distillery.
pub type Result<T> = std::result::Result<T, DistilleryError>;
