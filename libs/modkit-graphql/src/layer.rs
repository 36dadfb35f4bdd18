//! Bearer injection with refresh-and-resend on `401 Unauthorized`.
//!
//! Per request:
//! 1. take the cached token (fetching one if the cache is empty)
//! 2. send with `Authorization: Bearer <token>`, or without the header when
//!    no token is available
//! 3. on `401`, if enabled: force a refresh, re-attach, resend; repeat up to
//!    `max_retries` times with backoff between attempts
//! 4. if every attempt is `401`, return the last response tagged with
//!    [`RetriesExhausted`]
//!
//! Cancellation comes from a [`CancellationToken`] in the request extensions
//! and is honored while waiting for a token, during each send, and during
//! backoff.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::request::Parts;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::Full;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service, ServiceExt};
use zeroize::Zeroizing;

use crate::auth::{TokenCache, TokenError};
use crate::config::{GraphQlOptions, UnauthorizedBackoff};
use crate::secret::SecretString;
use crate::transport::HttpError;

/// What to do when the resource server answers `401`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnauthorizedPolicy {
    pub enabled: bool,
    /// Refresh-and-resend attempts after the first `401`.
    pub max_retries: u32,
    pub backoff: UnauthorizedBackoff,
}

impl Default for UnauthorizedPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 1,
            backoff: UnauthorizedBackoff::default(),
        }
    }
}

impl From<&GraphQlOptions> for UnauthorizedPolicy {
    fn from(options: &GraphQlOptions) -> Self {
        Self {
            enabled: options.enable_unauthorized_refresh,
            max_retries: options.max_unauthorized_retries,
            backoff: options.unauthorized_backoff,
        }
    }
}

/// Response extension set when the request was still `401` after every
/// refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetriesExhausted {
    /// Refresh-and-resend attempts made after the first `401`.
    pub attempts: u32,
}

/// Tower layer producing [`AuthRefreshService`].
#[derive(Clone, Debug)]
pub struct AuthRefreshLayer {
    tokens: Arc<TokenCache>,
    policy: UnauthorizedPolicy,
}

impl AuthRefreshLayer {
    #[must_use]
    pub fn new(tokens: Arc<TokenCache>, policy: UnauthorizedPolicy) -> Self {
        Self { tokens, policy }
    }
}

impl<S> Layer<S> for AuthRefreshLayer {
    type Service = AuthRefreshService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthRefreshService {
            inner,
            tokens: self.tokens.clone(),
            policy: self.policy,
        }
    }
}

/// Created by [`AuthRefreshLayer`].
#[derive(Clone, Debug)]
pub struct AuthRefreshService<S> {
    inner: S,
    tokens: Arc<TokenCache>,
    policy: UnauthorizedPolicy,
}

impl<S, ResBody> Service<Request<Full<Bytes>>> for AuthRefreshService<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<ResBody>, Error = HttpError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
    ResBody: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<ResBody>, HttpError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        // Clone-swap: consume the instance that was poll_ready'd.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let tokens = self.tokens.clone();
        let policy = self.policy;

        Box::pin(async move {
            let cancel = req
                .extensions()
                .get::<CancellationToken>()
                .cloned()
                .unwrap_or_default();
            let (parts, body) = req.into_parts();

            let token = tokens.get_or_refresh(&cancel).await.map_err(token_error)?;
            let first = build_request(&parts, &body, token.as_ref(), false)?;
            let mut response = send(inner.clone(), first, &cancel).await?;

            if response.status() != StatusCode::UNAUTHORIZED || !policy.enabled {
                return Ok(response);
            }

            for attempt in 0..policy.max_retries {
                tracing::debug!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    uri = %parts.uri,
                    "received 401, forcing token refresh"
                );
                let token = tokens.force_refresh(&cancel).await.map_err(token_error)?;
                let retry = build_request(&parts, &body, token.as_ref(), true)?;
                drop(response);
                response = send(inner.clone(), retry, &cancel).await?;

                if response.status() != StatusCode::UNAUTHORIZED {
                    return Ok(response);
                }

                if attempt + 1 < policy.max_retries {
                    let delay = backoff_delay(&policy.backoff, attempt);
                    tracing::trace!(?delay, attempt = attempt + 1, "backing off before next refresh");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(HttpError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }

            tracing::debug!(
                attempts = policy.max_retries,
                uri = %parts.uri,
                "still unauthorized after token refresh"
            );
            response.extensions_mut().insert(RetriesExhausted {
                attempts: policy.max_retries,
            });
            Ok(response)
        })
    }
}

fn token_error(err: TokenError) -> HttpError {
    match err {
        TokenError::Cancelled => HttpError::Cancelled,
        other => HttpError::Token(other),
    }
}

/// Rebuild the request from its preserved parts and attach the token.
///
/// With `strip_stale`, an `Authorization` header is removed when there is no
/// token to replace it.
fn build_request(
    parts: &Parts,
    body: &Full<Bytes>,
    token: Option<&SecretString>,
    strip_stale: bool,
) -> Result<Request<Full<Bytes>>, HttpError> {
    let mut req = Request::from_parts(parts.clone(), body.clone());
    match token {
        Some(token) => {
            let raw = Zeroizing::new(format!("Bearer {}", token.expose()));
            let mut value = HeaderValue::from_str(&raw)?;
            value.set_sensitive(true);
            req.headers_mut().insert(AUTHORIZATION, value);
        }
        None if strip_stale => {
            req.headers_mut().remove(AUTHORIZATION);
        }
        None => {}
    }
    Ok(req)
}

async fn send<S, ResBody>(
    mut svc: S,
    req: Request<Full<Bytes>>,
    cancel: &CancellationToken,
) -> Result<Response<ResBody>, HttpError>
where
    S: Service<Request<Full<Bytes>>, Response = Response<ResBody>, Error = HttpError>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(HttpError::Cancelled),
        result = async {
            svc.ready().await?;
            svc.call(req).await
        } => result,
    }
}

/// `min(max, initial * 2^attempt * jitter)`, jitter uniform in `[0.8, 1.2]`.
pub(crate) fn backoff_delay(backoff: &UnauthorizedBackoff, attempt: u32) -> Duration {
    let max_secs = backoff.max.as_secs_f64();
    let jitter: f64 = rand::rng().random_range(0.8..=1.2);
    let exp = 2f64.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
    let raw = backoff.initial.as_secs_f64() * exp * jitter;
    let capped = if raw.is_finite() { raw.min(max_secs) } else { max_secs };
    // max_secs can round above what Duration holds
    Duration::try_from_secs_f64(capped.max(0.0)).unwrap_or(backoff.max)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::auth::{AuthToken, AuthorizationService, Credentials};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // -- fakes ------------------------------------------------------------

    /// Issues `tok-1`, `tok-2`, ...; blank once `blank_after` tokens were issued.
    struct SequenceAuth {
        calls: AtomicUsize,
        blank_after: usize,
    }

    impl SequenceAuth {
        fn new() -> Arc<Self> {
            Self::blank_after(usize::MAX)
        }

        fn blank_after(n: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                blank_after: n,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthorizationService for SequenceAuth {
        async fn fetch_token(&self, _: &Credentials) -> Result<AuthToken, TokenError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.blank_after {
                return Ok(AuthToken::new(""));
            }
            Ok(AuthToken::new(format!("tok-{n}")))
        }
    }

    struct BrokenAuth;

    #[async_trait]
    impl AuthorizationService for BrokenAuth {
        async fn fetch_token(&self, _: &Credentials) -> Result<AuthToken, TokenError> {
            Err(TokenError::Http("OAuth2 token HTTP 503 Service Unavailable".into()))
        }
    }

    /// Replies with scripted statuses (the last one repeats) and records the
    /// `Authorization` header and body of every request.
    #[derive(Clone, Default)]
    struct Scripted {
        statuses: Arc<Mutex<VecDeque<StatusCode>>>,
        seen: Arc<Mutex<Vec<(Option<String>, Bytes)>>>,
    }

    impl Scripted {
        fn new(statuses: &[StatusCode]) -> Self {
            Self {
                statuses: Arc::new(Mutex::new(statuses.iter().copied().collect())),
                seen: Arc::default(),
            }
        }

        fn sends(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn auth_headers(&self) -> Vec<Option<String>> {
            self.seen.lock().unwrap().iter().map(|(h, _)| h.clone()).collect()
        }
    }

    impl Service<Request<Full<Bytes>>> for Scripted {
        type Response = Response<Full<Bytes>>;
        type Error = HttpError;
        type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
            let header = req
                .headers()
                .get(AUTHORIZATION)
                .map(|v| v.to_str().unwrap().to_owned());
            let seen = self.seen.clone();
            let status = {
                let mut q = self.statuses.lock().unwrap();
                if q.len() > 1 { q.pop_front().unwrap() } else { q[0] }
            };
            Box::pin(async move {
                use http_body_util::BodyExt;
                let body = req.into_body().collect().await.unwrap().to_bytes();
                seen.lock().unwrap().push((header, body));
                Ok(Response::builder()
                    .status(status)
                    .body(Full::new(Bytes::new()))
                    .unwrap())
            })
        }
    }

    fn request() -> Request<Full<Bytes>> {
        Request::post("https://edge.example.com/graphql")
            .body(Full::new(Bytes::from_static(br#"{"query":"{ a }"}"#)))
            .unwrap()
    }

    fn service(
        auth: Arc<dyn AuthorizationService>,
        credentials: Credentials,
        inner: &Scripted,
        policy: UnauthorizedPolicy,
    ) -> AuthRefreshService<Scripted> {
        let tokens = Arc::new(TokenCache::new(auth, credentials));
        AuthRefreshLayer::new(tokens, policy).layer(inner.clone())
    }

    fn policy(max_retries: u32) -> UnauthorizedPolicy {
        UnauthorizedPolicy {
            max_retries,
            ..Default::default()
        }
    }

    fn creds() -> Credentials {
        Credentials::new("client", "secret")
    }

    // -- header injection -------------------------------------------------

    #[tokio::test]
    async fn attaches_bearer_token() {
        let auth = SequenceAuth::new();
        let inner = Scripted::new(&[StatusCode::OK]);
        let svc = service(auth.clone(), creds(), &inner, policy(1));

        let resp = svc.oneshot(request()).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(inner.auth_headers(), vec![Some("Bearer tok-1".to_owned())]);
        assert_eq!(auth.calls(), 1);
    }

    #[tokio::test]
    async fn cached_token_reused_across_requests() {
        let auth = SequenceAuth::new();
        let inner = Scripted::new(&[StatusCode::OK]);
        let svc = service(auth.clone(), creds(), &inner, policy(1));

        svc.clone().oneshot(request()).await.unwrap();
        svc.oneshot(request()).await.unwrap();

        assert_eq!(auth.calls(), 1);
        assert_eq!(inner.sends(), 2);
    }

    #[tokio::test]
    async fn missing_credentials_send_without_header() {
        let auth = SequenceAuth::new();
        let inner = Scripted::new(&[StatusCode::OK]);
        let svc = service(auth.clone(), Credentials::new("client", ""), &inner, policy(1));

        let resp = svc.oneshot(request()).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(inner.auth_headers(), vec![None]);
        assert_eq!(auth.calls(), 0);
    }

    // -- 401 handling -----------------------------------------------------

    #[tokio::test]
    async fn refresh_disabled_returns_first_401() {
        let auth = SequenceAuth::new();
        let inner = Scripted::new(&[StatusCode::UNAUTHORIZED]);
        let disabled = UnauthorizedPolicy {
            enabled: false,
            ..policy(3)
        };
        let svc = service(auth.clone(), creds(), &inner, disabled);

        let resp = svc.oneshot(request()).await.unwrap();

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.extensions().get::<RetriesExhausted>().is_none());
        assert_eq!(inner.sends(), 1);
        assert_eq!(auth.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_two_refreshes() {
        let auth = SequenceAuth::new();
        let inner = Scripted::new(&[
            StatusCode::UNAUTHORIZED,
            StatusCode::UNAUTHORIZED,
            StatusCode::OK,
        ]);
        let svc = service(auth.clone(), creds(), &inner, policy(2));

        let resp = svc.oneshot(request()).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(inner.sends(), 3);
        assert_eq!(auth.calls(), 3);
        assert_eq!(
            inner.auth_headers(),
            vec![
                Some("Bearer tok-1".to_owned()),
                Some("Bearer tok-2".to_owned()),
                Some("Bearer tok-3".to_owned()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn body_is_resent_on_retry() {
        let inner = Scripted::new(&[StatusCode::UNAUTHORIZED, StatusCode::OK]);
        let svc = service(SequenceAuth::new(), creds(), &inner, policy(1));

        svc.oneshot(request()).await.unwrap();

        let seen = inner.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, seen[1].1);
        assert!(!seen[1].1.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_last_401_tagged() {
        let auth = SequenceAuth::new();
        let inner = Scripted::new(&[StatusCode::UNAUTHORIZED]);
        let svc = service(auth.clone(), creds(), &inner, policy(3));

        let resp = svc.oneshot(request()).await.unwrap();

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.extensions().get::<RetriesExhausted>(),
            Some(&RetriesExhausted { attempts: 3 })
        );
        assert_eq!(inner.sends(), 4);
        assert_eq!(auth.calls(), 4);
    }

    #[tokio::test]
    async fn zero_retries_tags_first_401() {
        let inner = Scripted::new(&[StatusCode::UNAUTHORIZED]);
        let svc = service(SequenceAuth::new(), creds(), &inner, policy(0));

        let resp = svc.oneshot(request()).await.unwrap();

        assert_eq!(inner.sends(), 1);
        assert_eq!(
            resp.extensions().get::<RetriesExhausted>(),
            Some(&RetriesExhausted { attempts: 0 })
        );
    }

    #[tokio::test]
    async fn other_error_statuses_are_not_retried() {
        let auth = SequenceAuth::new();
        let inner = Scripted::new(&[StatusCode::FORBIDDEN]);
        let svc = service(auth.clone(), creds(), &inner, policy(3));

        let resp = svc.oneshot(request()).await.unwrap();

        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(inner.sends(), 1);
        assert_eq!(auth.calls(), 1);
    }

    #[tokio::test]
    async fn stale_header_removed_when_refresh_yields_nothing() {
        let auth = SequenceAuth::blank_after(1);
        let inner = Scripted::new(&[StatusCode::UNAUTHORIZED, StatusCode::OK]);
        let svc = service(auth, creds(), &inner, policy(1));

        let mut req = request();
        req.headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer caller-supplied"));
        svc.oneshot(req).await.unwrap();

        assert_eq!(inner.auth_headers(), vec![Some("Bearer tok-1".to_owned()), None]);
    }

    // -- failures ---------------------------------------------------------

    #[tokio::test]
    async fn token_failure_surfaces_as_token_error() {
        let inner = Scripted::new(&[StatusCode::OK]);
        let svc = service(Arc::new(BrokenAuth), creds(), &inner, policy(1));

        let err = svc.oneshot(request()).await.unwrap_err();

        assert!(matches!(err, HttpError::Token(TokenError::Http(_))));
        assert_eq!(inner.sends(), 0);
    }

    // -- cancellation -----------------------------------------------------

    #[tokio::test]
    async fn pre_cancelled_request_is_never_sent() {
        let inner = Scripted::new(&[StatusCode::OK]);
        let svc = service(SequenceAuth::new(), creds(), &inner, policy(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut req = request();
        req.extensions_mut().insert(cancel);
        let err = svc.oneshot(req).await.unwrap_err();

        assert!(matches!(err, HttpError::Cancelled));
        assert_eq!(inner.sends(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_after_two_sends() {
        let auth = SequenceAuth::new();
        let inner = Scripted::new(&[StatusCode::UNAUTHORIZED]);
        let slow = UnauthorizedPolicy {
            backoff: UnauthorizedBackoff {
                initial: Duration::from_secs(10),
                max: Duration::from_secs(60),
            },
            ..policy(2)
        };
        let svc = service(auth.clone(), creds(), &inner, slow);
        let cancel = CancellationToken::new();

        let mut req = request();
        req.extensions_mut().insert(cancel.clone());
        let call = tokio::spawn(svc.oneshot(req));

        // Both sends complete instantly; the first backoff is at least 8s.
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, HttpError::Cancelled));
        assert_eq!(inner.sends(), 2);
        assert_eq!(auth.calls(), 2);
    }

    // -- backoff ----------------------------------------------------------

    #[test]
    fn backoff_first_attempt_within_jitter_band() {
        let b = UnauthorizedBackoff::default();
        for _ in 0..100 {
            let d = backoff_delay(&b, 0);
            assert!(d >= Duration::from_millis(160), "too short: {d:?}");
            assert!(d <= Duration::from_millis(240), "too long: {d:?}");
        }
    }

    #[test]
    fn backoff_grows_exponentially() {
        let b = UnauthorizedBackoff::default();
        let d = backoff_delay(&b, 3);
        // 200ms * 8 * [0.8, 1.2]
        assert!(d >= Duration::from_millis(1280), "too short: {d:?}");
        assert!(d <= Duration::from_millis(1920), "too long: {d:?}");
    }

    #[test]
    fn backoff_is_capped() {
        let b = UnauthorizedBackoff::default();
        assert_eq!(backoff_delay(&b, 10), Duration::from_secs(5));
        assert_eq!(backoff_delay(&b, u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn backoff_with_unbounded_max_saturates() {
        let b = UnauthorizedBackoff {
            initial: Duration::from_secs(1),
            max: Duration::MAX,
        };
        assert_eq!(backoff_delay(&b, 200), Duration::MAX);
        assert_eq!(backoff_delay(&b, u32::MAX), Duration::MAX);
    }
}
