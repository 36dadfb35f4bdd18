//! GraphQL client options and their layered loading.
//!
//! Precedence (lowest to highest): built-in defaults → YAML file →
//! `APP__GRAPHQL__*` environment variables. Everything lives under the
//! `graphql` key:
//!
//! ```yaml
//! graphql:
//!   endpoint: https://edge.example.com/api/graphql/v1
//!   client_id: svc-catalog
//!   client_secret: "..."
//!   max_unauthorized_retries: 2
//!   auth:
//!     token_endpoint: https://auth.example.com/oauth/token
//!   clients:
//!     preview:
//!       endpoint: https://preview.example.com/api/graphql/v1
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::auth::{Credentials, OAuthClientConfig};
use crate::secret::SecretString;
use crate::transport::TransportConfig;

/// Top-level key the options are extracted from.
pub const CONFIG_KEY: &str = "graphql";

/// Environment prefix; `__` separates nesting levels.
pub const ENV_PREFIX: &str = "APP__";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to load GraphQL configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid GraphQL configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

/// Backoff between forced token refreshes after a `401`.
///
/// Delay for attempt `n` (0-based) is `min(max, initial * 2^n * jitter)` with
/// `jitter` drawn uniformly from `[0.8, 1.2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UnauthorizedBackoff {
    #[serde(with = "crate::humantime_serde")]
    pub initial: Duration,
    #[serde(with = "crate::humantime_serde")]
    pub max: Duration,
}

impl Default for UnauthorizedBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(5),
        }
    }
}

/// Per-name overrides. Unset fields fall back to the defaults in
/// [`GraphQlOptions`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NamedClientOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<SecretString>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphQlOptions {
    /// Default GraphQL endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<SecretString>,

    /// Force a token refresh and resend when a request comes back `401`.
    pub enable_unauthorized_refresh: bool,
    /// Refresh-and-resend attempts after the initial `401`.
    pub max_unauthorized_retries: u32,
    pub unauthorized_backoff: UnauthorizedBackoff,

    pub clients: HashMap<String, NamedClientOptions>,

    /// Token endpoint used by the built-in `OAuth2` service.
    pub auth: OAuthClientConfig,
    pub http: TransportConfig,
}

impl Default for GraphQlOptions {
    fn default() -> Self {
        Self {
            endpoint: None,
            client_id: None,
            client_secret: None,
            enable_unauthorized_refresh: true,
            max_unauthorized_retries: 1,
            unauthorized_backoff: UnauthorizedBackoff::default(),
            clients: HashMap::new(),
            auth: OAuthClientConfig::default(),
            http: TransportConfig::default(),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn non_blank_secret(value: Option<&SecretString>) -> Option<&SecretString> {
    value.filter(|v| !v.is_blank())
}

fn endpoint_problem(raw: &str, allow_insecure_http: bool) -> Option<&'static str> {
    let url = Url::parse(raw).ok().filter(Url::has_host);
    match url.as_ref().map(Url::scheme) {
        Some("https") => None,
        Some("http") => {
            (!allow_insecure_http).then_some("uses plain http; set http.allow_insecure_http to allow it")
        }
        _ => Some("must be a valid http/https URL"),
    }
}

impl GraphQlOptions {
    /// Load from defaults, an optional YAML file and the environment, then
    /// validate.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Load`] for unreadable or mistyped sources,
    /// [`ConfigError::Invalid`] when [`validate`](Self::validate) fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment =
            Figment::new().merge(Serialized::default(CONFIG_KEY, serde_json::json!({})));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file_exact(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(&figment)
    }

    /// Extract and validate the `graphql` section of an existing figment.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let options: Self = figment.extract_inner(CONFIG_KEY)?;
        options.validate()?;
        Ok(options)
    }

    /// Default endpoint, if set and non-blank.
    #[must_use]
    pub fn default_endpoint(&self) -> Option<&str> {
        non_blank(self.endpoint.as_deref())
    }

    /// Default credentials when both id and secret are non-blank.
    #[must_use]
    pub fn default_credentials(&self) -> Option<Credentials> {
        let client_id = non_blank(self.client_id.as_deref())?;
        let client_secret = non_blank_secret(self.client_secret.as_ref())?;
        Some(Credentials {
            client_id: client_id.to_owned(),
            client_secret: client_secret.clone(),
        })
    }

    /// Resolve a named client's endpoint and credentials, field by field,
    /// falling back to the defaults.
    ///
    /// Returns `None` for an unknown name; `Some(Err(field))` names the first
    /// field that resolves to nothing.
    #[must_use]
    pub fn resolve_named(
        &self,
        name: &str,
    ) -> Option<Result<(String, Credentials), &'static str>> {
        let named = self.clients.get(name)?;
        let resolve = || -> Result<(String, Credentials), &'static str> {
            let endpoint = non_blank(named.endpoint.as_deref())
                .or_else(|| self.default_endpoint())
                .ok_or("endpoint")?;
            let client_id = non_blank(named.client_id.as_deref())
                .or_else(|| non_blank(self.client_id.as_deref()))
                .ok_or("client_id")?;
            let client_secret = non_blank_secret(named.client_secret.as_ref())
                .or_else(|| non_blank_secret(self.client_secret.as_ref()))
                .ok_or("client_secret")?;
            Ok((
                endpoint.to_owned(),
                Credentials {
                    client_id: client_id.to_owned(),
                    client_secret: client_secret.clone(),
                },
            ))
        };
        Some(resolve())
    }

    /// Check the option set can produce at least one client.
    ///
    /// - defaults (endpoint, id, secret) are complete, or at least one named
    ///   client is configured
    /// - every named client resolves completely after fallback
    /// - every endpoint is an absolute http/https URL
    /// - the backoff window is well-formed
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let has_defaults = self.default_endpoint().is_some() && self.default_credentials().is_some();
        if !has_defaults && self.clients.is_empty() {
            return Err(ConfigError::Invalid(
                "either default endpoint/client_id/client_secret or at least one named client \
                 with endpoint/client_id/client_secret must be configured"
                    .to_owned(),
            ));
        }

        let insecure = self.http.allow_insecure_http;
        if let Some(endpoint) = self.default_endpoint()
            && let Some(problem) = endpoint_problem(endpoint, insecure)
        {
            return Err(ConfigError::Invalid(format!(
                "default endpoint '{endpoint}' {problem}"
            )));
        }

        let mut names: Vec<&String> = self.clients.keys().collect();
        names.sort();
        for name in names {
            match self.resolve_named(name) {
                Some(Ok((endpoint, _))) => {
                    if let Some(problem) = endpoint_problem(&endpoint, insecure) {
                        return Err(ConfigError::Invalid(format!(
                            "client '{name}': endpoint '{endpoint}' {problem}"
                        )));
                    }
                }
                Some(Err(field)) => {
                    return Err(ConfigError::Invalid(format!(
                        "client '{name}': {field} is not set and has no default"
                    )));
                }
                None => {}
            }
        }

        if self.unauthorized_backoff.initial > self.unauthorized_backoff.max {
            return Err(ConfigError::Invalid(
                "unauthorized_backoff.initial must not exceed unauthorized_backoff.max".to_owned(),
            ));
        }

        Ok(())
    }
}
