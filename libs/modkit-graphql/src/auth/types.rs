use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::secret::SecretString;

/// `OAuth2` client authentication method.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuthMethod {
    /// `Authorization: Basic base64(client_id:client_secret)` (RFC 6749 §2.3.1).
    #[default]
    Basic,
    /// `client_id` and `client_secret` as form fields.
    Form,
}

/// A client id / client secret pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: SecretString,
}

impl Credentials {
    #[must_use]
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::new(client_secret),
        }
    }

    /// Credentials with neither part set.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(String::new(), String::new())
    }

    /// Both id and secret are non-blank.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.client_id.trim().is_empty() && !self.client_secret.is_blank()
    }
}

/// A bearer token as issued by the authorization service.
///
/// The lifetime is informational; the cache keeps a token until it is
/// force-refreshed.
#[derive(Debug, Clone)]
pub struct AuthToken {
    access_token: SecretString,
    expires_in: Option<Duration>,
}

impl AuthToken {
    #[must_use]
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: SecretString::new(access_token),
            expires_in: None,
        }
    }

    #[must_use]
    pub fn with_expires_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    #[must_use]
    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    #[must_use]
    pub fn expires_in(&self) -> Option<Duration> {
        self.expires_in
    }

    /// The token value, or `None` when blank.
    #[must_use]
    pub fn into_secret(self) -> Option<SecretString> {
        if self.access_token.is_blank() {
            None
        } else {
            Some(self.access_token)
        }
    }
}

/// Token endpoint response body.
///
/// Unknown fields are ignored. `Serialize` is not derived so an access token
/// can never be written back out.
#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Must be `Bearer` (case-insensitive) when present.
    #[serde(default)]
    pub token_type: Option<String>,
}
