//! Errors surfaced by the token manager

use std::sync::Arc;

use thiserror::Error;

use crate::Subject;

/// A credential could not be decoded into a claim set
#[derive(Clone, Debug, Error)]
pub enum MalformedCredential {
    /// The credential did not consist of exactly three `.`-separated segments
    #[error("credential must have three segments, found {0}")]
    SegmentCount(usize),
    /// The payload segment length cannot be produced by base64 encoding
    #[error("payload segment has an illegal base64url length")]
    IllegalLength,
    /// The payload segment was not valid base64url
    #[error("payload segment is not valid base64url")]
    Base64(#[from] base64::DecodeError),
    /// The payload was not a JSON object with `sub`, `nbf`, and `exp`
    #[error("payload is not a valid claim set")]
    Json(#[source] Arc<serde_json::Error>),
    /// The credential expires at or before the time it becomes valid
    #[error("credential lifetime is not positive (nbf {nbf}, exp {exp})")]
    NonPositiveLifetime {
        /// The not-before claim
        nbf: u64,
        /// The expiry claim
        exp: u64,
    },
}

impl From<serde_json::Error> for MalformedCredential {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

/// A failure to establish a credential
///
/// Every caller waiting on the same refresh observes the same error, so this
/// type is cheap to clone.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The stored credential could not be decoded
    #[error("credential could not be decoded")]
    MalformedCredential(#[from] MalformedCredential),
    /// A refreshed credential belongs to a different subject than the one
    /// previously established
    #[error("credential subject changed from {expected} to {found}, likely a different user")]
    IdentityMismatch {
        /// The subject previously established by the manager
        expected: Subject,
        /// The subject found on the new credential
        found: Subject,
    },
    /// The server refused to refresh the credential and no login handler
    /// recovered the session
    #[error("could not refresh access token or log back in")]
    RefreshFailed,
    /// The manager is missing required configuration
    #[error("token manager is misconfigured: {0}")]
    Configuration(&'static str),
    /// The refresh task ended without publishing an outcome
    #[error("token refresh was abandoned before completing")]
    RefreshAbandoned,
}
