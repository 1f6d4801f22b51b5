//! Error taxonomy shared by every component, categorized for retry decisions
//! and for the HTTP error bodies the request dispatcher returns.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use thiserror::Error;

/// Broad classification used to decide retryability and log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad client input - never retried, 400 to the caller.
    Client,
    /// Upstream YouTube or LLM service misbehaved.
    Upstream,
    /// Local bug or resource exhaustion - 500 to the caller.
    Internal,
    /// Configuration or store problem discovered at startup or runtime.
    Config,
}

/// Distinguishes *why* a fetch to an external service failed, surfaced on
/// job rows for diagnostics (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Timeout,
    NonSuccessStatus,
    MalformedBody,
    ConnectionFailed,
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::NonSuccessStatus => "non_2xx",
            Self::MalformedBody => "malformed_body",
            Self::ConnectionFailed => "connection_failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("malformed subtitle input: {0}")]
    Codec(String),

    #[error("invalid video id")]
    InvalidVideoId,

    #[error("invalid language code")]
    InvalidLanguage,

    #[error("upstream fetch failed ({kind}): {message}")]
    UpstreamFetch {
        kind: FetchErrorKind,
        message: String,
    },

    #[error("translation failed: {0}")]
    Translation(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("unauthorized")]
    Unauthorized,
}

impl ProxyError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_) => ErrorCategory::Internal,
            Self::Json(_) => ErrorCategory::Internal,
            Self::Http(_) => ErrorCategory::Upstream,
            Self::Store(_) => ErrorCategory::Internal,
            Self::Codec(_) => ErrorCategory::Client,
            Self::InvalidVideoId | Self::InvalidLanguage => ErrorCategory::Client,
            Self::UpstreamFetch { .. } => ErrorCategory::Upstream,
            Self::Translation(_) => ErrorCategory::Upstream,
            Self::Config(_) => ErrorCategory::Config,
            Self::Unauthorized => ErrorCategory::Client,
        }
    }

    /// Whether the worker should schedule another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Upstream)
    }

    /// Stable machine-readable code used in job rows and JSON error bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidVideoId => "invalid_video_id",
            Self::InvalidLanguage => "invalid_language",
            Self::UpstreamFetch { .. } => "youtube_api_error",
            Self::Translation(_) => "translation_error",
            Self::Unauthorized => "unauthorized",
            _ => "internal_error",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidVideoId | Self::InvalidLanguage => StatusCode::BAD_REQUEST,
            Self::UpstreamFetch { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            _ if self.category() == ErrorCategory::Client => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.error_code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!ProxyError::InvalidVideoId.is_retryable());
        assert!(!ProxyError::InvalidLanguage.is_retryable());
    }

    #[test]
    fn upstream_errors_are_retryable() {
        let err = ProxyError::UpstreamFetch {
            kind: FetchErrorKind::Timeout,
            message: "timed out".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Upstream);
    }

    #[test]
    fn error_codes_match_spec_kinds() {
        assert_eq!(ProxyError::InvalidVideoId.error_code(), "invalid_video_id");
        assert_eq!(ProxyError::InvalidLanguage.error_code(), "invalid_language");
        assert_eq!(
            ProxyError::UpstreamFetch {
                kind: FetchErrorKind::NonSuccessStatus,
                message: "500".into()
            }
            .error_code(),
            "youtube_api_error"
        );
        assert_eq!(
            ProxyError::Translation("boom".into()).error_code(),
            "translation_error"
        );
        assert_eq!(ProxyError::Config("bad".into()).error_code(), "internal_error");
    }

    #[test]
    fn fetch_error_kind_display() {
        assert_eq!(FetchErrorKind::Timeout.to_string(), "timeout");
        assert_eq!(FetchErrorKind::NonSuccessStatus.to_string(), "non_2xx");
        assert_eq!(FetchErrorKind::MalformedBody.to_string(), "malformed_body");
    }
}
