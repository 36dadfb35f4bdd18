use thiserror::Error;

use crate::auth::TokenError;
use crate::transport::HttpError;

/// Errors surfaced by [`GraphQlClient`](crate::GraphQlClient) and
/// [`GraphQlClientFactory`](crate::GraphQlClientFactory).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GraphQlError {
    /// A required argument was missing, blank, or malformed.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// The options do not provide a value the call needs.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no GraphQL client named '{0}' is configured")]
    UnknownClient(String),

    #[error(transparent)]
    Http(HttpError),

    /// Non-2xx response, including a `401` left after every refresh attempt.
    #[error("GraphQL endpoint returned HTTP {status}: {body_preview}")]
    HttpStatus {
        status: http::StatusCode,
        body_preview: String,
    },

    #[error("response body too large: limit {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Token(TokenError),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<HttpError> for GraphQlError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Cancelled | HttpError::Token(TokenError::Cancelled) => GraphQlError::Cancelled,
            HttpError::Token(token) => GraphQlError::Token(token),
            HttpError::BodyTooLarge { limit } => GraphQlError::BodyTooLarge { limit },
            other => GraphQlError::Http(other),
        }
    }
}

impl From<TokenError> for GraphQlError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Cancelled => GraphQlError::Cancelled,
            other => GraphQlError::Token(other),
        }
    }
}
