use std::fmt;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio_util::sync::CancellationToken;

use super::error::TokenError;
use super::service::AuthorizationService;
use super::types::Credentials;
use crate::secret::SecretString;

/// Single-slot bearer token cache for one set of credentials.
///
/// Reads are lock-free. Refreshes are serialized by an async mutex: callers
/// that arrive while a fetch is in flight wait for it and then reuse its
/// result (non-forced path), so N concurrent cold callers cause exactly one
/// call to the [`AuthorizationService`]. A forced refresh always calls the
/// service once.
///
/// There is no expiry tracking. A token is replaced only when a refresh is
/// forced, typically after the resource server answers `401`.
pub struct TokenCache {
    service: Arc<dyn AuthorizationService>,
    credentials: ArcSwap<Credentials>,
    token: ArcSwapOption<SecretString>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("client_id", &self.credentials.load().client_id)
            .field("has_token", &self.token.load().is_some())
            .finish_non_exhaustive()
    }
}

impl TokenCache {
    #[must_use]
    pub fn new(service: Arc<dyn AuthorizationService>, credentials: Credentials) -> Self {
        Self {
            service,
            credentials: ArcSwap::from_pointee(credentials),
            token: ArcSwapOption::empty(),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The cached token, if any. Never triggers a fetch.
    #[must_use]
    pub fn current(&self) -> Option<SecretString> {
        self.token.load().as_deref().cloned()
    }

    #[must_use]
    pub fn credentials(&self) -> Arc<Credentials> {
        self.credentials.load_full()
    }

    /// Replace the credentials used by subsequent refreshes.
    ///
    /// The cached token is kept; force a refresh to pick up the new identity.
    pub fn set_credentials(&self, credentials: Credentials) {
        self.credentials.store(Arc::new(credentials));
    }

    /// Return the cached token, fetching one if the slot is empty.
    ///
    /// `Ok(None)` means the credentials are incomplete; no fetch was made.
    ///
    /// # Errors
    ///
    /// The service's error unchanged, or [`TokenError::Cancelled`].
    pub async fn get_or_refresh(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<SecretString>, TokenError> {
        if let Some(token) = self.current() {
            return Ok(Some(token));
        }
        self.refresh(false, cancel).await
    }

    /// Fetch a new token regardless of what is cached.
    ///
    /// # Errors
    ///
    /// Same as [`get_or_refresh`](Self::get_or_refresh). On error the
    /// previously cached token stays in place.
    pub async fn force_refresh(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<SecretString>, TokenError> {
        self.refresh(true, cancel).await
    }

    async fn refresh(
        &self,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<SecretString>, TokenError> {
        let _guard = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TokenError::Cancelled),
            guard = self.refresh_lock.lock() => guard,
        };

        // Another caller may have filled the slot while we waited.
        if !force && let Some(token) = self.current() {
            tracing::trace!("token refreshed by a concurrent caller, reusing it");
            return Ok(Some(token));
        }

        let credentials = self.credentials.load_full();
        if !credentials.is_complete() {
            tracing::warn!(
                client_id = %credentials.client_id,
                "client credentials are not configured; sending requests without a bearer token"
            );
            self.token.store(None);
            return Ok(None);
        }

        tracing::debug!(client_id = %credentials.client_id, force, "fetching access token");
        let fetched = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TokenError::Cancelled),
            result = self.service.fetch_token(&credentials) => result?,
        };

        let token = fetched.into_secret();
        self.token.store(token.clone().map(Arc::new));
        if token.is_none() {
            tracing::warn!(
                client_id = %credentials.client_id,
                "authorization service returned an empty token"
            );
        }
        Ok(token)
    }
}
