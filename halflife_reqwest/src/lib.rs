//! Middleware to automatically attach credentials to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AccessTokenMiddleware`] in the middleware stack to attach
//! the current credential provided by a [`TokenManager`] to each outbound
//! request. The credential is refreshed on demand before it is attached.
//!
//! If a request already has specified a value for the credential header by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! ```
//! use halflife_reqwest::AccessTokenMiddleware;
//! use halflife_tokens::TokenManager;
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! # use halflife_tokens::sources::{InMemoryCredentialStore, RefreshEndpoint};
//! # struct NoRefresh;
//! # #[async_trait::async_trait]
//! # impl RefreshEndpoint for NoRefresh {
//! #     async fn request_refresh(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! #         Ok(())
//! #     }
//! # }
//! #
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let token_manager = TokenManager::builder(InMemoryCredentialStore::new(), NoRefresh)
//! #     .with_credential_name("bearer")
//! #     .build();
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AccessTokenMiddleware::new(token_manager))
//!     .build();
//!
//! let req = client
//!     .get("https://example.com");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! The middleware only attaches the credential to requests matching its
//! predicate. This can be useful in the event that you want to use a single
//! common middleware stack with multiple potential backends and want to
//! ensure that the credential is only ever sent to the backend that issued it.
//!
//! These predicates can be composed together to evaluate more complex
//! requirements prior to attaching a credential to a request.
//!
//! ```
//! use halflife_reqwest::{
//!     AccessTokenMiddleware, ExactHostMatch, HttpsOnly
//! };
//! use predicates::prelude::PredicateBooleanExt;
//! # use halflife_tokens::{sources::{InMemoryCredentialStore, RefreshEndpoint}, TokenManager};
//! # struct NoRefresh;
//! # #[async_trait::async_trait]
//! # impl RefreshEndpoint for NoRefresh {
//! #     async fn request_refresh(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! #         Ok(())
//! #     }
//! # }
//! # let token_manager = TokenManager::builder(InMemoryCredentialStore::new(), NoRefresh).build();
//!
//! AccessTokenMiddleware::new(token_manager)
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("example.com")))
//!     .with_always_refresh_token(true);
//! ```
//!
//! # Circuit breaker
//!
//! By default, the first time the manager reports that no credential is
//! available, the middleware stops asking for one and passes every later
//! request through untouched. This avoids a pointless refresh per request
//! for sessions that will never have a credential, such as anonymous usage.
//! Disable this with
//! [`with_disable_on_no_token(false)`][AccessTokenMiddleware::with_disable_on_no_token()],
//! or turn the middleware back on with
//! [`set_use_token(true)`][AccessTokenMiddleware::set_use_token()].

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use halflife_tokens::{AccessTokenRef, TokenManager};
use predicates::{prelude::*, reflection};
use reqwest::{
    header::{HeaderName, HeaderValue},
    Request, Response,
};
use reqwest_middleware::{Middleware, Next, Result};

/// The header credentials are attached under unless configured otherwise
pub const DEFAULT_HEADER_NAME: &str = "bearer";

/// A middleware that injects the current credential into outgoing requests
#[derive(Clone, Debug)]
pub struct AccessTokenMiddleware<P> {
    token_manager: TokenManager,
    predicate: P,
    header_name: HeaderName,
    policy: Arc<Policy>,
}

#[derive(Debug)]
struct Policy {
    always_refresh_token: AtomicBool,
    disable_on_no_token: AtomicBool,
    use_token: AtomicBool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            always_refresh_token: AtomicBool::new(false),
            disable_on_no_token: AtomicBool::new(true),
            use_token: AtomicBool::new(true),
        }
    }
}

impl AccessTokenMiddleware<HttpsOnly> {
    /// Construct a new middleware from a token manager
    ///
    /// By default, this middleware will only send its credential if the
    /// request is being sent via HTTPS. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(token_manager: TokenManager) -> Self {
        Self {
            token_manager,
            predicate: HttpsOnly,
            header_name: HeaderName::from_static(DEFAULT_HEADER_NAME),
            policy: Arc::new(Policy::default()),
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> AccessTokenMiddleware<P> {
        AccessTokenMiddleware {
            token_manager: self.token_manager,
            predicate,
            header_name: self.header_name,
            policy: self.policy,
        }
    }
}

impl<P> AccessTokenMiddleware<P> {
    /// Attaches the credential under `header_name` instead of `bearer`
    pub fn with_header_name(mut self, header_name: HeaderName) -> Self {
        self.header_name = header_name;
        self
    }

    /// Asks the manager for a credential even for requests that do not match
    /// the predicate, without attaching it to those requests
    pub fn with_always_refresh_token(self, value: bool) -> Self {
        self.set_always_refresh_token(value);
        self
    }

    /// Whether the middleware stops asking for a credential once the manager
    /// reports that none is available
    pub fn with_disable_on_no_token(self, value: bool) -> Self {
        self.set_disable_on_no_token(value);
        self
    }

    /// Whether the middleware asks for a credential at all
    pub fn with_use_token(self, value: bool) -> Self {
        self.set_use_token(value);
        self
    }

    /// The token manager credentials are requested from
    pub fn token_manager(&self) -> &TokenManager {
        &self.token_manager
    }

    /// The header credentials are attached under
    pub fn header_name(&self) -> &HeaderName {
        &self.header_name
    }

    /// Whether non-matching requests still trigger a refresh
    ///
    /// Settings are shared between all clones of this middleware.
    pub fn always_refresh_token(&self) -> bool {
        self.policy.always_refresh_token.load(Ordering::Acquire)
    }

    /// Sets whether non-matching requests still trigger a refresh
    pub fn set_always_refresh_token(&self, value: bool) {
        self.policy
            .always_refresh_token
            .store(value, Ordering::Release);
    }

    /// Whether the middleware disables itself when no credential is available
    pub fn disable_on_no_token(&self) -> bool {
        self.policy.disable_on_no_token.load(Ordering::Acquire)
    }

    /// Sets whether the middleware disables itself when no credential is available
    pub fn set_disable_on_no_token(&self, value: bool) {
        self.policy
            .disable_on_no_token
            .store(value, Ordering::Release);
    }

    /// Whether the middleware currently asks for credentials
    pub fn use_token(&self) -> bool {
        self.policy.use_token.load(Ordering::Acquire)
    }

    /// Turns asking for credentials on or off
    pub fn set_use_token(&self, value: bool) {
        self.policy.use_token.store(value, Ordering::Release);
    }

    fn trace_schedule(&self) {
        if !tracing::enabled!(tracing::Level::TRACE) {
            return;
        }

        if let Some(schedule) = self.token_manager.schedule() {
            let now = self.token_manager.now();

            tracing::trace!(
                token.status = ?schedule.status_at(now),
                token.anchor = schedule.anchor().0,
                token.half_life = schedule.half_life().0,
                token.until_stale = schedule.until_stale_at(now).0,
                token.expiry = schedule.expiry().0,
                "obtained access token"
            );
        }
    }
}

fn header_value(token: &AccessTokenRef) -> Result<HeaderValue> {
    let mut value =
        HeaderValue::from_str(token.as_str()).map_err(reqwest_middleware::Error::middleware)?;
    value.set_sensitive(true);
    Ok(value)
}

#[async_trait::async_trait]
impl<P> Middleware for AccessTokenMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if self.use_token() {
            let whitelisted = self.predicate.eval(&req);

            if whitelisted || self.always_refresh_token() {
                let token = self
                    .token_manager
                    .get_token()
                    .await
                    .map_err(reqwest_middleware::Error::middleware)?;

                match token {
                    Some(token) if whitelisted => {
                        self.trace_schedule();
                        let value = header_value(&token)?;
                        req.headers_mut()
                            .entry(self.header_name.clone())
                            .or_insert(value);
                    }
                    Some(_) => {}
                    None if self.disable_on_no_token() => {
                        tracing::debug!("no credential available, no longer requesting credentials");
                        self.set_use_token(false);
                    }
                    None => {
                        tracing::trace!("no credential available");
                    }
                }
            }
        }

        next.run(req, extensions).await
    }
}

/// Only attach a credential if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach a credential if the request is being sent to the exact host specified
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new<S>(host: S) -> Self
    where
        S: ToString,
    {
        Self {
            host: host.to_string(),
        }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url().host_str().unwrap_or("<no host>").to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)
    }
}
