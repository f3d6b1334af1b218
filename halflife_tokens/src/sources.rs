//! The collaborators a token manager reads credentials from and asks for refreshes

use async_trait::async_trait;
use std::{error, sync::Arc};

use crate::AccessToken;

#[cfg(feature = "cookies")]
pub mod cookie;
#[cfg(feature = "http")]
pub mod http;
pub mod in_memory;

#[cfg(feature = "cookies")]
pub use cookie::CookieJarStore;
#[cfg(feature = "http")]
pub use http::HttpRefreshEndpoint;
pub use in_memory::InMemoryCredentialStore;

/// A synchronous store that holds the current credential under a name
///
/// Reads must be side-effect free and must not touch the network. In a
/// browser-like client this is the cookie jar.
pub trait CredentialStore: Send + Sync {
    /// Reads the raw credential stored under `name`, if any
    fn read_raw(&self, name: &str) -> Option<AccessToken>;
}

impl<S: CredentialStore + ?Sized> CredentialStore for Arc<S> {
    fn read_raw(&self, name: &str) -> Option<AccessToken> {
        (**self).read_raw(name)
    }
}

/// An endpoint that asks the server to reissue the credential
///
/// A successful refresh does not return the credential; the server places it
/// in the [`CredentialStore`], where the manager picks it up.
#[async_trait]
pub trait RefreshEndpoint: Send + Sync {
    /// Requests that the server issue a fresh credential
    async fn request_refresh(&self) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>>;
}

#[async_trait]
impl<E: RefreshEndpoint + ?Sized> RefreshEndpoint for Arc<E> {
    async fn request_refresh(&self) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>> {
        (**self).request_refresh().await
    }
}
