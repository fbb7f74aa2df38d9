//! A [`Facilitator`] implementation that talks to a remote facilitator
//! service over HTTP.
//!
//! The client posts [`VerifyRequest`] documents to the facilitator's
//! `./verify` endpoint and maps the outcome onto the error taxonomy the
//! validator needs: transport failures are unreachable (retryable), while
//! HTTP-level rejections and `isValid: false` verdicts are rejections.
//!
//! ```rust,no_run
//! use pressgate::facilitator_client::FacilitatorClient;
//!
//! let facilitator = FacilitatorClient::try_from("https://x402.org/facilitator").unwrap();
//! ```

use http::{HeaderMap, StatusCode};
use reqwest::Client;
use std::time::Duration;
use url::Url;

use crate::facilitator::{Facilitator, FacilitatorError};
use crate::proto::{VerifyRequest, VerifyResponse};

/// Errors that can occur while interacting with a remote facilitator.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorClientError {
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        context: &'static str,
        #[source]
        source: url::ParseError,
    },
    /// The request never produced a response: connect failure, DNS,
    /// timeout. The facilitator's verdict is unknown.
    #[error("facilitator unreachable: {context}: {source}")]
    Unreachable {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        context: &'static str,
        status: StatusCode,
        body: String,
    },
}

impl FacilitatorError for FacilitatorClientError {
    fn is_unreachable(&self) -> bool {
        matches!(self, FacilitatorClientError::Unreachable { .. })
    }
}

/// HTTP client for a remote facilitator's `./verify` endpoint.
#[derive(Clone, Debug)]
pub struct FacilitatorClient {
    /// Base URL of the facilitator, e.g. `https://x402.org/facilitator/`.
    base_url: Url,
    /// Full URL for `POST ./verify`.
    verify_url: Url,
    /// Shared reqwest HTTP client.
    client: Client,
    /// Optional custom headers sent with each request.
    headers: HeaderMap,
    /// Optional per-request timeout.
    timeout: Option<Duration>,
}

impl FacilitatorClient {
    /// Constructs a client from a base URL, deriving the `./verify`
    /// endpoint relative to it.
    pub fn try_new(base_url: Url) -> Result<Self, FacilitatorClientError> {
        let verify_url = base_url
            .join("./verify")
            .map_err(|e| FacilitatorClientError::UrlParse {
                context: "Failed to construct ./verify URL",
                source: e,
            })?;
        Ok(Self {
            base_url,
            verify_url,
            client: Client::new(),
            headers: HeaderMap::new(),
            timeout: None,
        })
    }

    /// Returns the base URL used by this client.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Returns the computed `./verify` URL.
    pub fn verify_url(&self) -> &Url {
        &self.verify_url
    }

    /// Attaches custom headers to all future requests.
    pub fn with_headers(&self, headers: HeaderMap) -> Self {
        let mut this = self.clone();
        this.headers = headers;
        this
    }

    /// Sets a timeout for all future requests.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut this = self.clone();
        this.timeout = Some(timeout);
        this
    }

    /// Sends a `POST ./verify` request to the facilitator.
    pub async fn verify(
        &self,
        request: &VerifyRequest,
    ) -> Result<VerifyResponse, FacilitatorClientError> {
        let context = "POST /verify";
        let mut req = self.client.post(self.verify_url.clone()).json(request);
        for (key, value) in self.headers.iter() {
            req = req.header(key, value);
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let http_response = req
            .send()
            .await
            .map_err(|e| FacilitatorClientError::Unreachable { context, source: e })?;

        if http_response.status() == StatusCode::OK {
            http_response
                .json::<VerifyResponse>()
                .await
                .map_err(|e| FacilitatorClientError::JsonDeserialization { context, source: e })
        } else {
            let status = http_response.status();
            let body = http_response.text().await.unwrap_or_default();
            Err(FacilitatorClientError::HttpStatus {
                context,
                status,
                body,
            })
        }
    }
}

impl Facilitator for FacilitatorClient {
    type Error = FacilitatorClientError;

    async fn verify(
        &self,
        request: &VerifyRequest,
    ) -> Result<VerifyResponse, FacilitatorClientError> {
        FacilitatorClient::verify(self, request).await
    }
}

/// Converts a string URL into a client, normalizing trailing slashes so
/// `.../facilitator` and `.../facilitator/` behave identically.
impl TryFrom<&str> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: &str) -> Result<Self, FacilitatorClientError> {
        let mut normalized = value.trim_end_matches('/').to_string();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|e| FacilitatorClientError::UrlParse {
            context: "Failed to parse base url",
            source: e,
        })?;
        FacilitatorClient::try_new(url)
    }
}

impl TryFrom<String> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: String) -> Result<Self, FacilitatorClientError> {
        FacilitatorClient::try_from(value.as_str())
    }
}
