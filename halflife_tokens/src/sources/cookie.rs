//! A credential store backed by the client's cookie jar

use std::{fmt, sync::Arc};

use reqwest::{
    cookie::{CookieStore, Jar},
    Url,
};

use crate::sources::CredentialStore;
use crate::AccessToken;

/// Reads credentials out of the cookies that would be sent to `url`
///
/// Share the same [`Jar`] with the `reqwest::Client` used by the refresh
/// endpoint so that a cookie set by a refresh response is visible here.
#[derive(Clone)]
pub struct CookieJarStore {
    jar: Arc<Jar>,
    url: Url,
}

impl CookieJarStore {
    /// Constructs a store reading the cookies in `jar` that apply to `url`
    pub fn new(jar: Arc<Jar>, url: Url) -> Self {
        Self { jar, url }
    }

    /// The cookie jar being read
    pub fn jar(&self) -> &Arc<Jar> {
        &self.jar
    }
}

impl fmt::Debug for CookieJarStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CookieJarStore")
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

impl CredentialStore for CookieJarStore {
    fn read_raw(&self, name: &str) -> Option<AccessToken> {
        let header = self.jar.cookies(&self.url)?;
        let header = header.to_str().ok()?;

        header
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| AccessToken::from(value))
    }
}
