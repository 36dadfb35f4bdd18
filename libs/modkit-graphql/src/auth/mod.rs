//! Client-credentials token acquisition.
//!
//! [`AuthorizationService`] is the seam to whatever issues tokens;
//! [`OAuthClientCredentialsService`] is the built-in `OAuth2` implementation.
//! [`TokenCache`] sits in front of a service and owns the single cached token
//! for one set of [`Credentials`].

mod cache;
mod config;
mod error;
mod service;
mod types;

pub use cache::TokenCache;
pub use config::OAuthClientConfig;
pub use error::TokenError;
pub use service::{AuthorizationService, OAuthClientCredentialsService};
pub use types::{AuthToken, ClientAuthMethod, Credentials};
