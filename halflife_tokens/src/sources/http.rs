//! A refresh endpoint reached over HTTP

use async_trait::async_trait;
use reqwest::{header, StatusCode, Url};
use std::error;
use thiserror::Error;

use super::RefreshEndpoint;

/// Asks the server to reissue the credential by `POST`ing to a refresh URL
///
/// The request carries no body of its own; the server identifies the session
/// from the cookies the client sends along. Build the `reqwest::Client` with
/// the same cookie provider the [`CredentialStore`][super::CredentialStore]
/// reads from.
#[derive(Debug, Clone)]
pub struct HttpRefreshEndpoint {
    client: reqwest::Client,
    refresh_url: Url,
}

impl HttpRefreshEndpoint {
    /// Constructs a new HTTP refresh endpoint
    pub fn new(client: reqwest::Client, refresh_url: Url) -> Self {
        Self {
            client,
            refresh_url,
        }
    }

    /// The URL refresh requests are sent to
    pub fn refresh_url(&self) -> &Url {
        &self.refresh_url
    }

    #[tracing::instrument(err, skip(self), fields(refresh_url = %self.refresh_url))]
    async fn refresh(&self) -> Result<(), RefreshRequestError> {
        tracing::trace!("requesting credential refresh");

        let resp = self
            .client
            .post(self.refresh_url.clone())
            .header(header::CONTENT_TYPE, "application/json; charset=UTF-8")
            .header(header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(RefreshRequestError::RequestSend)?;

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received refresh response"
        );

        if status.is_success() {
            Ok(())
        } else {
            Err(RefreshRequestError::Rejected { status })
        }
    }
}

#[async_trait]
impl RefreshEndpoint for HttpRefreshEndpoint {
    async fn request_refresh(&self) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>> {
        Ok(self.refresh().await?)
    }
}

/// An error while attempting to refresh the credential
#[derive(Debug, Error)]
pub enum RefreshRequestError {
    /// Unable to send the refresh request
    #[error("error sending refresh request")]
    RequestSend(#[source] reqwest::Error),
    /// The server answered with a non-success status
    #[error("refresh endpoint responded with {status}")]
    Rejected {
        /// The response status
        status: StatusCode,
    },
}
