use std::time::Duration;

use thiserror::Error;

use crate::auth::TokenError;

/// Errors produced by the HTTP transport and the auth-refresh layer.
///
/// A `401 Unauthorized` that survives every refresh attempt is not an error
/// at this level; the response is returned as-is (see
/// [`RetriesExhausted`](crate::layer::RetriesExhausted)).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Single request attempt timed out
    #[error("Request attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Transport error (network, connection, etc)
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Response body exceeded size limit
    #[error("Response body too large: limit {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// Invalid URL
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri { url: String, reason: String },

    /// URL scheme rejected by the transport security settings
    #[error("URL scheme '{scheme}' not allowed: {reason}")]
    InvalidScheme { scheme: String, reason: String },

    /// Bearer token acquisition failed
    #[error("Token acquisition failed: {0}")]
    Token(#[from] TokenError),

    /// The caller's cancellation token fired
    #[error("Request cancelled")]
    Cancelled,
}

impl From<hyper_util::client::legacy::Error> for HttpError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}

/// Format an [`HttpError`] into a message prefixed with the caller context
/// (e.g. `"OAuth2 token"`).
///
/// Status bodies and token errors are reduced to a fixed shape so secrets
/// echoed by a server never reach logs.
pub(crate) fn format_http_error(e: &HttpError, prefix: &str) -> String {
    match e {
        HttpError::Timeout(duration) => {
            format!("{prefix} request timed out after {duration:?}")
        }
        HttpError::Transport(err) => format!("{prefix} transport error: {err}"),
        HttpError::Tls(err) => format!("{prefix} TLS error: {err}"),
        HttpError::BodyTooLarge { limit } => {
            format!("{prefix} response too large: limit {limit} bytes")
        }
        HttpError::RequestBuild(err) => format!("{prefix} request build failed: {err}"),
        HttpError::InvalidHeaderValue(_) => format!("{prefix} invalid header value"),
        HttpError::InvalidUri { url, reason } => {
            format!("{prefix} invalid URL '{url}': {reason}")
        }
        HttpError::InvalidScheme { scheme, reason } => {
            format!("{prefix} invalid scheme '{scheme}': {reason}")
        }
        HttpError::Cancelled => format!("{prefix} request cancelled"),
        HttpError::Token(_) => format!("{prefix} request failed"),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn timeout_renders_duration() {
        let err = HttpError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "Request attempt timed out after 30s");
        assert_eq!(
            format_http_error(&err, "OAuth2 token"),
            "OAuth2 token request timed out after 30s"
        );
    }

    #[test]
    fn token_error_converts_and_is_not_echoed() {
        let err: HttpError = TokenError::InvalidResponse("tok-abc".into()).into();
        assert!(matches!(err, HttpError::Token(_)));
        let msg = format_http_error(&err, "CTX");
        assert_eq!(msg, "CTX request failed");
        assert!(!msg.contains("tok-abc"));
    }

    #[test]
    fn prefix_is_applied() {
        let cases = vec![
            HttpError::Cancelled,
            HttpError::BodyTooLarge { limit: 10 },
            HttpError::InvalidScheme {
                scheme: "http".into(),
                reason: "TLS required".into(),
            },
        ];
        for err in &cases {
            let msg = format_http_error(err, "CTX");
            assert!(msg.starts_with("CTX "), "Expected prefix 'CTX' in: {msg}");
        }
    }
}
