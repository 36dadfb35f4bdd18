#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! GraphQL client infrastructure for `ModKit`
//!
//! This crate hands out GraphQL-over-HTTP clients whose outbound requests are
//! authenticated with an `OAuth2` client-credentials bearer token:
//! - One token fetch at a time per credential set, cached until forced
//! - `Authorization: Bearer <token>` injected by a tower layer
//! - On `401 Unauthorized` the token is force-refreshed and the request
//!   retried with exponential backoff and jitter
//! - Clients are memoized per `(endpoint, client id)`; concurrent first
//!   requests for the same key share a single construction
//!
//! # Example
//!
//! ```ignore
//! use std::path::Path;
//! use modkit_graphql::{GraphQlClientFactory, GraphQlOptions, GraphQlRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! let options = GraphQlOptions::load(Some(Path::new("config.yaml")))?;
//! let factory = GraphQlClientFactory::builder(options).build()?;
//!
//! let cancel = CancellationToken::new();
//! let client = factory.create_client_by_name("content", &cancel).await?;
//! let response: graphql_client::Response<serde_json::Value> = client
//!     .send_query(&GraphQlRequest::new("{ item(path: \"/\") { id } }"), &cancel)
//!     .await?;
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod factory;
pub mod layer;
pub mod request;
pub mod secret;
pub mod transport;

mod humantime_serde;

pub use auth::{
    AuthToken, AuthorizationService, ClientAuthMethod, Credentials, OAuthClientConfig,
    OAuthClientCredentialsService, TokenCache, TokenError,
};
pub use client::GraphQlClient;
pub use config::{ConfigError, GraphQlOptions, NamedClientOptions, UnauthorizedBackoff};
pub use error::GraphQlError;
pub use factory::{GraphQlClientFactory, GraphQlClientFactoryBuilder};
pub use layer::{AuthRefreshLayer, AuthRefreshService, RetriesExhausted, UnauthorizedPolicy};
pub use request::GraphQlRequest;
pub use secret::SecretString;
pub use transport::{
    HttpError, HttpTransport, ResponseBody, TlsRootConfig, TransportConfig, TransportService,
};
