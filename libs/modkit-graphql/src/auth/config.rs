use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use super::error::TokenError;
use super::types::ClientAuthMethod;
use crate::secret::SecretString;

/// Settings for the built-in client-credentials token endpoint client.
///
/// Credentials are not part of this struct; they come from the GraphQL
/// client being built. Extra header values are treated as secrets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OAuthClientConfig {
    pub token_endpoint: Option<Url>,

    /// Requested scopes, sent space-separated. Empty means no `scope` field.
    pub scopes: Vec<String>,

    pub auth_method: ClientAuthMethod,

    /// Extra headers attached to every token request (vendor quirks).
    pub extra_headers: BTreeMap<String, SecretString>,
}

impl OAuthClientConfig {
    /// # Errors
    ///
    /// [`TokenError::ConfigError`] when `token_endpoint` is missing or not
    /// http(s), or a scope is blank.
    pub fn validate(&self) -> Result<(), TokenError> {
        let Some(endpoint) = &self.token_endpoint else {
            return Err(TokenError::ConfigError("token_endpoint is required".into()));
        };
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(TokenError::ConfigError(format!(
                "token_endpoint must be http or https, got '{}'",
                endpoint.scheme()
            )));
        }
        if self.scopes.iter().any(|s| s.trim().is_empty()) {
            return Err(TokenError::ConfigError("scopes must not be blank".into()));
        }
        Ok(())
    }
}
