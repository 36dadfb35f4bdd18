use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default User-Agent header value
pub const DEFAULT_USER_AGENT: &str = concat!("modkit-graphql/", env!("CARGO_PKG_VERSION"));

/// TLS root certificate source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsRootConfig {
    /// Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// OS native root certificate store
    Native,
}

/// Settings for the pooled HTTP transport shared by GraphQL clients and the
/// token endpoint client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Per-attempt timeout. Each 401 retry gets its own budget.
    #[serde(with = "crate::humantime_serde")]
    pub request_timeout: Duration,

    /// Idle pooled connections are closed after this long; `None` keeps them.
    #[serde(with = "crate::humantime_serde::option")]
    pub pool_idle_timeout: Option<Duration>,

    pub user_agent: String,

    /// Upper bound on response bodies read into memory.
    pub max_body_size: usize,

    pub tls_roots: TlsRootConfig,

    /// Accept `http://` URLs. Only honored in debug builds or with the
    /// `allow-insecure-http` feature.
    pub allow_insecure_http: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            pool_idle_timeout: Some(Duration::from_secs(90)),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            max_body_size: 10 * 1024 * 1024, // 10 MB
            tls_roots: TlsRootConfig::default(),
            allow_insecure_http: false,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = TransportConfig::default();
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.pool_idle_timeout, Some(Duration::from_secs(90)));
        assert_eq!(cfg.tls_roots, TlsRootConfig::WebPki);
        assert!(!cfg.allow_insecure_http);
        assert!(cfg.user_agent.starts_with("modkit-graphql/"));
    }

    #[test]
    fn deserializes_partial_yaml_style_json() {
        let cfg: TransportConfig = serde_json::from_str(
            r#"{"request_timeout":"5s","tls_roots":"native","pool_idle_timeout":null}"#,
        )
        .unwrap();
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
        assert_eq!(cfg.tls_roots, TlsRootConfig::Native);
        assert!(cfg.pool_idle_timeout.is_none());
        assert_eq!(cfg.max_body_size, TransportConfig::default().max_body_size);
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = serde_json::from_str::<TransportConfig>(r#"{"retries":3}"#).unwrap_err();
        assert!(err.to_string().contains("retries"), "unexpected error: {err}");
    }
}
