use thiserror::Error;

/// Errors returned while acquiring a bearer token.
///
/// No variant ever carries a client secret or an access token.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TokenError {
    /// HTTP transport or status error talking to the token endpoint.
    ///
    /// The message is built from a fixed shape and never includes the
    /// response body.
    #[error("{0}")]
    Http(String),

    /// The token endpoint returned an unparseable or incomplete response.
    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    /// The token endpoint returned a `token_type` that is not `Bearer`.
    #[error("unsupported token type: {0}")]
    UnsupportedTokenType(String),

    #[error("OAuth2 config error: {0}")]
    ConfigError(String),

    /// Failure raised by a custom [`AuthorizationService`](super::AuthorizationService).
    #[error("authorization service error: {0}")]
    Service(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The caller cancelled while waiting for the refresh lock or the fetch.
    #[error("token acquisition cancelled")]
    Cancelled,
}
