//! How a single completion call can fail.
//!
//! The pipeline never retries; it only needs to know which call failed and
//! why. `is_retryable` exists for callers that wrap the gateway in their own
//! retry policy.

use std::time::Duration;
use thiserror::Error;

/// What the service reported alongside a failed call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDetail {
    pub http_status: Option<u16>,
    /// Gemini's `error.status`, e.g. "RESOURCE_EXHAUSTED".
    pub reason: Option<String>,
    /// `x-request-id` response header.
    pub request_id: Option<String>,
}

impl ServiceDetail {
    pub fn status(http_status: u16) -> Self {
        Self {
            http_status: Some(http_status),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Missing key or a client that could not be built. Nothing was sent.
    #[error("configuration error: {0}")]
    Config(String),

    /// The request itself is unacceptable and will fail the same way again.
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        detail: ServiceDetail,
    },

    #[error("authentication failed: {message}")]
    Auth {
        message: String,
        detail: ServiceDetail,
    },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        detail: ServiceDetail,
    },

    /// The service answered, but with an error or a body we could not use.
    #[error("{provider} error: {message}")]
    Service {
        provider: &'static str,
        message: String,
        retryable: bool,
        detail: ServiceDetail,
    },

    /// No complete response within the client's per-request limit.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
}

impl ProviderError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            detail: ServiceDetail::default(),
        }
    }

    /// A service-side failure with no HTTP detail attached.
    pub fn service(provider: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Service {
            provider,
            message: message.into(),
            retryable,
            detail: ServiceDetail::default(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) => true,
            Self::Service { retryable, .. } => *retryable,
            Self::Transport(e) => e.is_connect(),
            Self::Config(_) | Self::InvalidRequest { .. } | Self::Auth { .. } => false,
        }
    }

    /// Short stable code for usage records and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Auth { .. } => "auth_failed",
            Self::RateLimited { .. } => "rate_limited",
            Self::Service { .. } => "service_error",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport_error",
        }
    }

    pub fn detail(&self) -> Option<&ServiceDetail> {
        match self {
            Self::InvalidRequest { detail, .. }
            | Self::Auth { detail, .. }
            | Self::RateLimited { detail, .. }
            | Self::Service { detail, .. } => Some(detail),
            Self::Config(_) | Self::Timeout(_) | Self::Transport(_) => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.detail().and_then(|d| d.request_id.as_deref())
    }

    /// Earliest moment a retry makes sense, when the service said so.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}
