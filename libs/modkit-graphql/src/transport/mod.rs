//! Pooled HTTPS transport.
//!
//! Stack (outer to inner): error mapping → response boxing → timeout →
//! user-agent → hyper-util legacy client over a rustls connector.
//! The auth-refresh layer wraps this stack per GraphQL client.

mod config;
mod error;
mod tls;

pub use config::{DEFAULT_USER_AGENT, TlsRootConfig, TransportConfig};
pub use error::HttpError;
pub(crate) use error::format_http_error;

use std::time::Duration;

use bytes::Bytes;
use http::header::USER_AGENT;
use http::{HeaderValue, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceBuilder, ServiceExt};
use url::Url;

/// Type-erased response body.
pub type ResponseBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// The type-erased service every request flows through.
pub type TransportService =
    BoxCloneSyncService<Request<Full<Bytes>>, Response<ResponseBody>, HttpError>;

/// Cheaply cloneable handle on a pooled HTTP client.
///
/// Clones share the connection pool.
#[derive(Clone)]
pub struct HttpTransport {
    service: TransportService,
    max_body_size: usize,
    allow_insecure_http: bool,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("max_body_size", &self.max_body_size)
            .field("allow_insecure_http", &self.allow_insecure_http)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Build the pooled client described by `config`.
    ///
    /// # Errors
    ///
    /// - [`HttpError::Tls`] if native roots are requested but unusable
    /// - [`HttpError::InvalidHeaderValue`] if `user_agent` is not a valid header
    /// - [`HttpError::InvalidScheme`] if insecure HTTP is requested in a release
    ///   build without the `allow-insecure-http` feature
    pub fn new(config: &TransportConfig) -> Result<Self, HttpError> {
        #[cfg(not(any(debug_assertions, feature = "allow-insecure-http")))]
        if config.allow_insecure_http {
            return Err(HttpError::InvalidScheme {
                scheme: "http".to_owned(),
                reason: "insecure HTTP requires a debug build or the `allow-insecure-http` feature"
                    .to_owned(),
            });
        }

        if config.allow_insecure_http {
            tracing::warn!(
                target: "modkit_graphql::security",
                "insecure HTTP enabled; use only for testing with mock servers"
            );
        }

        let timeout = config.request_timeout;
        let user_agent = HeaderValue::from_str(&config.user_agent)?;
        let https = build_https_connector(config.tls_roots, config.allow_insecure_http)?;

        let mut client_builder = Client::builder(TokioExecutor::new());
        // pool_idle_timeout is inert without a pool timer
        client_builder.pool_timer(TokioTimer::new());
        if let Some(idle) = config.pool_idle_timeout {
            client_builder.pool_idle_timeout(idle);
        }
        let hyper_client = client_builder.build::<_, Full<Bytes>>(https);

        let service = ServiceBuilder::new()
            .layer(TimeoutLayer::new(timeout))
            .map_request(move |mut req: Request<Full<Bytes>>| {
                if !req.headers().contains_key(USER_AGENT) {
                    req.headers_mut().insert(USER_AGENT, user_agent.clone());
                }
                req
            })
            .service(hyper_client)
            .map_response(box_response)
            .map_err(move |e: tower::BoxError| map_tower_error(e, timeout));

        Ok(Self {
            service: BoxCloneSyncService::new(service),
            max_body_size: config.max_body_size,
            allow_insecure_http: config.allow_insecure_http,
        })
    }

    /// Wrap an arbitrary inner service (an in-memory fake, a proxy stack)
    /// instead of the pooled hyper client.
    #[must_use]
    pub fn from_service<S>(service: S, config: &TransportConfig) -> Self
    where
        S: Service<Request<Full<Bytes>>, Response = Response<ResponseBody>, Error = HttpError>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        Self {
            service: BoxCloneSyncService::new(service),
            max_body_size: config.max_body_size,
            allow_insecure_http: config.allow_insecure_http,
        }
    }

    /// A fresh handle on the underlying service.
    #[must_use]
    pub fn service(&self) -> TransportService {
        self.service.clone()
    }

    #[must_use]
    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// Reject URLs the transport would refuse to dial.
    ///
    /// # Errors
    ///
    /// [`HttpError::InvalidScheme`] for anything but `https`, or `http` when
    /// insecure HTTP is allowed. [`HttpError::InvalidUri`] when there is no host.
    pub fn check_url(&self, url: &Url) -> Result<(), HttpError> {
        match url.scheme() {
            "https" => {}
            "http" if self.allow_insecure_http => {}
            "http" => {
                return Err(HttpError::InvalidScheme {
                    scheme: "http".to_owned(),
                    reason: "TLS is required; enable allow_insecure_http for testing only"
                        .to_owned(),
                });
            }
            other => {
                return Err(HttpError::InvalidScheme {
                    scheme: other.to_owned(),
                    reason: "only http and https are supported".to_owned(),
                });
            }
        }
        if url.host_str().is_none() {
            return Err(HttpError::InvalidUri {
                url: url.to_string(),
                reason: "missing host".to_owned(),
            });
        }
        Ok(())
    }
}

/// Collect a response body into memory, failing once it exceeds `limit` bytes.
///
/// # Errors
///
/// [`HttpError::BodyTooLarge`] past the limit, [`HttpError::Transport`] on a
/// broken stream.
pub async fn read_body(body: ResponseBody, limit: usize) -> Result<Bytes, HttpError> {
    let mut collected = Vec::new();
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(HttpError::Transport)?;
        if let Some(chunk) = frame.data_ref() {
            if collected.len() + chunk.len() > limit {
                return Err(HttpError::BodyTooLarge { limit });
            }
            collected.extend_from_slice(chunk);
        }
    }

    Ok(Bytes::from(collected))
}

fn map_tower_error(err: tower::BoxError, timeout: Duration) -> HttpError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return HttpError::Timeout(timeout);
    }
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(other) => HttpError::Transport(other),
    }
}

fn box_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, body.map_err(Into::into).boxed())
}

/// HTTP/1.1 and h2 are both advertised via ALPN.
fn build_https_connector(
    tls_roots: TlsRootConfig,
    allow_http: bool,
) -> Result<HttpsConnector<HttpConnector>, HttpError> {
    match tls_roots {
        TlsRootConfig::WebPki => {
            let builder = hyper_rustls::HttpsConnectorBuilder::new()
                .with_provider_and_webpki_roots(tls::crypto_provider())
                .map_err(|e| HttpError::Tls(Box::new(e)))?;
            Ok(if allow_http {
                builder.https_or_http().enable_all_versions().build()
            } else {
                builder.https_only().enable_all_versions().build()
            })
        }
        TlsRootConfig::Native => {
            let client_config =
                tls::native_roots_client_config().map_err(|e| HttpError::Tls(e.into()))?;
            let builder = hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(client_config);
            Ok(if allow_http {
                builder.https_or_http().enable_all_versions().build()
            } else {
                builder.https_only().enable_all_versions().build()
            })
        }
    }
}
