use std::sync::Arc;

use bytes::Bytes;
use graphql_client::{GraphQLQuery, Response};
use http::header::{ACCEPT, CONTENT_TYPE};
use http::Request;
use http_body_util::Full;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tower::util::BoxCloneSyncService;
use tower::{Layer, ServiceExt};
use url::Url;

use crate::auth::TokenCache;
use crate::error::GraphQlError;
use crate::layer::{AuthRefreshLayer, UnauthorizedPolicy};
use crate::request::GraphQlRequest;
use crate::transport::{HttpError, HttpTransport, TransportService, read_body};

/// Bytes of a non-2xx body kept in [`GraphQlError::HttpStatus`].
const BODY_PREVIEW_LIMIT: usize = 512;

/// A GraphQL endpoint bound to one set of credentials.
///
/// Obtained from [`GraphQlClientFactory`](crate::GraphQlClientFactory), which
/// hands out the same `Arc` for the same `(endpoint, client id)`. Every
/// request goes through the auth-refresh layer.
pub struct GraphQlClient {
    endpoint: Url,
    service: TransportService,
    tokens: Arc<TokenCache>,
    max_body_size: usize,
}

impl std::fmt::Debug for GraphQlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphQlClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

impl GraphQlClient {
    pub(crate) fn new(
        endpoint: Url,
        transport: &HttpTransport,
        tokens: Arc<TokenCache>,
        policy: UnauthorizedPolicy,
    ) -> Self {
        let service = AuthRefreshLayer::new(tokens.clone(), policy).layer(transport.service());
        Self {
            endpoint,
            service: BoxCloneSyncService::new(service),
            tokens,
            max_body_size: transport.max_body_size(),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// The token cache shared by every client using this client id.
    #[must_use]
    pub fn token_cache(&self) -> &Arc<TokenCache> {
        &self.tokens
    }

    /// POST a request and decode the GraphQL response envelope.
    ///
    /// GraphQL-level errors come back inside [`Response::errors`]; only
    /// transport and HTTP failures are `Err`.
    ///
    /// # Errors
    ///
    /// - [`GraphQlError::HttpStatus`] for a non-2xx reply (including a `401`
    ///   that survived every token refresh)
    /// - [`GraphQlError::Cancelled`] if `cancel` fires
    /// - [`GraphQlError::Token`], [`GraphQlError::Http`],
    ///   [`GraphQlError::BodyTooLarge`], [`GraphQlError::Json`]
    pub async fn send<V, T>(
        &self,
        request: &GraphQlRequest<V>,
        cancel: &CancellationToken,
    ) -> Result<Response<T>, GraphQlError>
    where
        V: Serialize,
        T: DeserializeOwned,
    {
        self.execute(request, cancel).await
    }

    /// Same as [`send`](Self::send).
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_query<V, T>(
        &self,
        request: &GraphQlRequest<V>,
        cancel: &CancellationToken,
    ) -> Result<Response<T>, GraphQlError>
    where
        V: Serialize,
        T: DeserializeOwned,
    {
        self.execute(request, cancel).await
    }

    /// Same as [`send`](Self::send).
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_mutation<V, T>(
        &self,
        request: &GraphQlRequest<V>,
        cancel: &CancellationToken,
    ) -> Result<Response<T>, GraphQlError>
    where
        V: Serialize,
        T: DeserializeOwned,
    {
        self.execute(request, cancel).await
    }

    /// Run a code-generated operation.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn post<Q: GraphQLQuery>(
        &self,
        variables: Q::Variables,
        cancel: &CancellationToken,
    ) -> Result<Response<Q::ResponseData>, GraphQlError> {
        let body = Q::build_query(variables);
        self.execute(&body, cancel).await
    }

    async fn execute<B, T>(
        &self,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<Response<T>, GraphQlError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let payload = serde_json::to_vec(body)?;
        let mut req = Request::post(self.endpoint.as_str())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/graphql-response+json, application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(HttpError::from)?;
        req.extensions_mut().insert(cancel.clone());

        let response = self.service.clone().oneshot(req).await?;
        let (parts, body) = response.into_parts();

        let bytes = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(GraphQlError::Cancelled),
            bytes = read_body(body, self.max_body_size) => bytes?,
        };

        if !parts.status.is_success() {
            let preview = &bytes[..bytes.len().min(BODY_PREVIEW_LIMIT)];
            return Err(GraphQlError::HttpStatus {
                status: parts.status,
                body_preview: String::from_utf8_lossy(preview).into_owned(),
            });
        }

        Ok(serde_json::from_slice(&bytes)?)
    }
}
