//! Facilities for caching and renewing short-lived bearer credentials
//!
//! This library manages the credential an interactive client presents to its
//! backend. The server issues the credential into a store the client can read
//! (typically a cookie), and the [`TokenManager`] decides when the credential
//! should be turned in for a new one, asks the server to do so, and checks that
//! the new credential still belongs to the same user.
//!
//! In particular:
//!
//! * A credential is considered due for renewal once half of its lifetime has
//!   passed, leaving the remaining half as margin for clock skew and retries.
//! * Concurrent requests for a credential that needs renewing are coalesced
//!   into a single refresh; every caller sees the same outcome.
//! * If the subject of a renewed credential differs from the one first
//!   established, all cached state is discarded and the refresh fails.
//! * When the server will not renew a credential, registered
//!   [need-login handlers][TokenManager::on_need_login()] get a chance to
//!   log the user back in before the refresh is declared failed.
//!
//! ```
//! use std::sync::Arc;
//!
//! use halflife_tokens::{
//!     sources::{CookieJarStore, HttpRefreshEndpoint},
//!     TokenManager, TokenManagerConfig,
//! };
//! use reqwest::{cookie::Jar, Url};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let app_url = Url::parse("https://app.example.com/")?;
//! let jar = Arc::new(Jar::default());
//! let client = reqwest::Client::builder()
//!     .cookie_provider(jar.clone())
//!     .build()?;
//!
//! let manager = TokenManager::builder(
//!     CookieJarStore::new(jar, app_url.clone()),
//!     HttpRefreshEndpoint::new(client, app_url.join("/auth/refresh")?),
//! )
//! .with_config(TokenManagerConfig::new("bearer"))
//! .build();
//!
//! manager.on_need_login().add(|_manager: TokenManager| async move {
//!     // prompt the user to log in again here
//!     Some(false)
//! });
//! # /* Commented out due to this trying to interact with the world.
//! let token = manager.get_token().await?;
//! # */
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `http`: Provides [`HttpRefreshEndpoint`][sources::HttpRefreshEndpoint], which
//!   asks the server to renew the credential using [reqwest].
//! * `cookies`: Provides [`CookieJarStore`][sources::CookieJarStore], which reads
//!   the credential from a [reqwest] cookie jar.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
mod claims;
mod error;
pub mod login;
mod manager;
mod schedule;
pub mod sources;

pub use braids::*;
pub use claims::Claims;
pub use error::{Error, MalformedCredential};
pub use login::{HandlerId, NeedLoginEvent, NeedLoginHandler};
pub use manager::{TokenManager, TokenManagerBuilder, TokenManagerConfig};
pub use schedule::{RefreshSchedule, TokenStatus};
