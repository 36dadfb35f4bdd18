use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::{AuthorizationService, Credentials, OAuthClientCredentialsService, TokenCache};
use crate::client::GraphQlClient;
use crate::config::GraphQlOptions;
use crate::error::GraphQlError;
use crate::layer::UnauthorizedPolicy;
use crate::secret::SecretString;
use crate::transport::HttpTransport;

type ClientCell = Arc<OnceCell<Arc<GraphQlClient>>>;

/// Error for an endpoint the transport refuses: `Validation` when the caller
/// passed it, `Config` when it came from the options.
type EndpointError = fn(String) -> GraphQlError;

/// Hands out GraphQL clients, one per `(endpoint, client id)`.
///
/// The first request for a key constructs the client; concurrent requests
/// for the same key wait on that construction and receive the same `Arc`.
/// Entries are never evicted. A failed construction leaves the slot empty
/// and the next caller tries again.
///
/// Clients built for the same client id and secret share one [`TokenCache`],
/// so a refresh triggered by any of them (or by
/// [`refresh_token`](Self::refresh_token) for the default credentials) is seen
/// by all. A different secret for the same id gets a cache of its own.
pub struct GraphQlClientFactory {
    options: GraphQlOptions,
    transport: HttpTransport,
    auth: Arc<dyn AuthorizationService>,
    policy: UnauthorizedPolicy,
    clients: DashMap<String, ClientCell>,
    /// Per client id; one cache per distinct secret.
    token_caches: DashMap<String, Vec<Arc<TokenCache>>>,
}

impl std::fmt::Debug for GraphQlClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphQlClientFactory")
            .field("clients", &self.clients.len())
            .field("token_caches", &self.token_caches.len())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Builder for [`GraphQlClientFactory`].
///
/// Without overrides, the transport is built from `options.http` and the
/// token service is the `OAuth2` client-credentials client configured by
/// `options.auth`.
#[must_use]
pub struct GraphQlClientFactoryBuilder {
    options: GraphQlOptions,
    auth: Option<Arc<dyn AuthorizationService>>,
    transport: Option<HttpTransport>,
}

impl GraphQlClientFactoryBuilder {
    pub fn with_authorization_service(mut self, auth: Arc<dyn AuthorizationService>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_transport(mut self, transport: HttpTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// # Errors
    ///
    /// [`GraphQlError::Http`] if the transport cannot be built,
    /// [`GraphQlError::Config`] if the built-in token service is needed and
    /// `options.auth` is unusable.
    pub fn build(self) -> Result<GraphQlClientFactory, GraphQlError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => HttpTransport::new(&self.options.http)?,
        };
        let auth = match self.auth {
            Some(auth) => auth,
            None => Arc::new(
                OAuthClientCredentialsService::new(&self.options.auth, transport.clone())
                    .map_err(|e| GraphQlError::Config(e.to_string()))?,
            ),
        };
        Ok(GraphQlClientFactory::new(self.options, auth, transport))
    }
}

fn require(value: &str, name: &str) -> Result<(), GraphQlError> {
    if value.trim().is_empty() {
        return Err(GraphQlError::Validation(format!("{name} must not be empty")));
    }
    Ok(())
}

impl GraphQlClientFactory {
    pub fn builder(options: GraphQlOptions) -> GraphQlClientFactoryBuilder {
        GraphQlClientFactoryBuilder {
            options,
            auth: None,
            transport: None,
        }
    }

    /// Options are used as given; see [`GraphQlOptions::validate`].
    #[must_use]
    pub fn new(
        options: GraphQlOptions,
        auth: Arc<dyn AuthorizationService>,
        transport: HttpTransport,
    ) -> Self {
        let policy = UnauthorizedPolicy::from(&options);
        Self {
            options,
            transport,
            auth,
            policy,
            clients: DashMap::new(),
            token_caches: DashMap::new(),
        }
    }

    #[must_use]
    pub fn options(&self) -> &GraphQlOptions {
        &self.options
    }

    /// Client for an explicit endpoint and credential pair.
    ///
    /// # Errors
    ///
    /// - [`GraphQlError::Validation`] if any argument is blank or `url` is not
    ///   an absolute URL the transport accepts
    /// - [`GraphQlError::Cancelled`] if `cancel` fires while waiting
    pub async fn create_client_with(
        &self,
        url: &str,
        client_id: &str,
        client_secret: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<GraphQlClient>, GraphQlError> {
        require(url, "url")?;
        require(client_id, "client_id")?;
        require(client_secret, "client_secret")?;

        let credentials = Credentials {
            client_id: client_id.to_owned(),
            client_secret: SecretString::new(client_secret),
        };
        self.get_or_create(url, credentials, GraphQlError::Validation, cancel)
            .await
    }

    /// Client for `url` using the default credentials.
    ///
    /// # Errors
    ///
    /// [`GraphQlError::Config`] when default credentials are not configured;
    /// otherwise as [`create_client_with`](Self::create_client_with).
    pub async fn create_client_for(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<GraphQlClient>, GraphQlError> {
        require(url, "url")?;
        let credentials = self.default_credentials()?;
        self.get_or_create(url, credentials, GraphQlError::Validation, cancel)
            .await
    }

    /// Client for the default endpoint and credentials.
    ///
    /// # Errors
    ///
    /// [`GraphQlError::Config`] when the default endpoint or credentials are
    /// not configured, or the endpoint is refused by the transport.
    pub async fn create_client(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<GraphQlClient>, GraphQlError> {
        let endpoint = self
            .options
            .default_endpoint()
            .ok_or_else(|| GraphQlError::Config("default endpoint is not configured".to_owned()))?
            .to_owned();
        let credentials = self.default_credentials()?;
        self.get_or_create(&endpoint, credentials, GraphQlError::Config, cancel)
            .await
    }

    /// Client for a named entry in `options.clients`, each field falling back
    /// to the defaults.
    ///
    /// # Errors
    ///
    /// - [`GraphQlError::Validation`] for a blank name
    /// - [`GraphQlError::UnknownClient`] when no such entry exists
    /// - [`GraphQlError::Config`] when a field resolves to nothing or the
    ///   endpoint is refused by the transport
    pub async fn create_client_by_name(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<GraphQlClient>, GraphQlError> {
        require(name, "client name")?;
        let (endpoint, credentials) = self
            .options
            .resolve_named(name)
            .ok_or_else(|| GraphQlError::UnknownClient(name.to_owned()))?
            .map_err(|field| {
                GraphQlError::Config(format!(
                    "client '{name}': {field} is not configured and has no default"
                ))
            })?;
        self.get_or_create(&endpoint, credentials, GraphQlError::Config, cancel)
            .await
    }

    /// Force a token refresh for the default credentials.
    ///
    /// Returns `true` when a non-blank token was obtained. Without default
    /// credentials nothing is fetched and the result is `false`.
    ///
    /// # Errors
    ///
    /// [`GraphQlError::Token`] if the authorization service fails,
    /// [`GraphQlError::Cancelled`] if `cancel` fires.
    pub async fn refresh_token(&self, cancel: &CancellationToken) -> Result<bool, GraphQlError> {
        let tokens = match self.options.default_credentials() {
            Some(credentials) => self.token_cache(&credentials),
            None => Arc::new(TokenCache::new(self.auth.clone(), Credentials::empty())),
        };

        match tokens.force_refresh(cancel).await {
            Ok(Some(_)) => {
                tracing::info!(
                    client_id = %tokens.credentials().client_id,
                    "manual token refresh succeeded"
                );
                Ok(true)
            }
            Ok(None) => {
                tracing::warn!("manual token refresh returned no token");
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(error = %e, "manual token refresh failed");
                Err(e.into())
            }
        }
    }

    fn default_credentials(&self) -> Result<Credentials, GraphQlError> {
        self.options.default_credentials().ok_or_else(|| {
            GraphQlError::Config("default client_id/client_secret are not configured".to_owned())
        })
    }

    async fn get_or_create(
        &self,
        url: &str,
        credentials: Credentials,
        invalid: EndpointError,
        cancel: &CancellationToken,
    ) -> Result<Arc<GraphQlClient>, GraphQlError> {
        let key = format!("{url}::{}", credentials.client_id);
        // Clone the cell out so no shard guard is held across an await.
        let cell = self
            .clients
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        if let Some(client) = cell.get() {
            tracing::trace!(%key, "reusing GraphQL client");
            return Ok(client.clone());
        }

        let init = cell.get_or_try_init(|| async { self.build_client(url, &credentials, invalid) });
        let client = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(GraphQlError::Cancelled),
            result = init => result?,
        };
        Ok(client.clone())
    }

    fn build_client(
        &self,
        url: &str,
        credentials: &Credentials,
        invalid: EndpointError,
    ) -> Result<Arc<GraphQlClient>, GraphQlError> {
        let endpoint =
            Url::parse(url).map_err(|e| invalid(format!("url '{url}' is not valid: {e}")))?;
        self.transport
            .check_url(&endpoint)
            .map_err(|e| invalid(e.to_string()))?;

        tracing::debug!(
            endpoint = %endpoint,
            client_id = %credentials.client_id,
            "creating GraphQL client"
        );
        let tokens = self.token_cache(credentials);
        Ok(Arc::new(GraphQlClient::new(
            endpoint,
            &self.transport,
            tokens,
            self.policy,
        )))
    }

    /// The shared cache for exactly these credentials, created on first use.
    fn token_cache(&self, credentials: &Credentials) -> Arc<TokenCache> {
        let mut caches = self
            .token_caches
            .entry(credentials.client_id.clone())
            .or_default();
        if let Some(tokens) = caches.iter().find(|t| *t.credentials() == *credentials) {
            return tokens.clone();
        }
        if !caches.is_empty() {
            tracing::debug!(
                client_id = %credentials.client_id,
                "new secret for known client id, creating separate token cache"
            );
        }
        let tokens = Arc::new(TokenCache::new(self.auth.clone(), credentials.clone()));
        caches.push(tokens.clone());
        tokens
    }
}
