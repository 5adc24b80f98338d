//! Shared JSON-over-HTTP plumbing for the API clients.
//!
//! ## Error Handling
//!
//! [`ApiClientError`] captures
//! - URL construction
//! - HTTP transport failures
//! - JSON deserialization errors
//! - Unexpected HTTP status responses

use std::fmt::Display;
use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use reqwest::{Client, RequestBuilder};
use url::Url;

#[cfg(feature = "telemetry")]
use tracing::{Instrument, Span};

/// Errors that can occur while talking to a remote API.
#[derive(Debug, thiserror::Error)]
pub enum ApiClientError {
    /// URL parse error.
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        /// Human-readable context.
        context: &'static str,
        /// The underlying parse error.
        #[source]
        source: url::ParseError,
    },
    /// A header value could not be encoded.
    #[error("invalid header {name}: {source}")]
    InvalidHeader {
        /// Header name.
        name: &'static str,
        /// The underlying error.
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    /// HTTP transport error.
    #[error("HTTP error: {context}: {source}")]
    Http {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// JSON deserialization error.
    #[error("Failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// Unexpected HTTP status code.
    #[error("Unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        /// Human-readable context.
        context: &'static str,
        /// The HTTP status code.
        status: StatusCode,
        /// The response body.
        body: String,
    },
    /// Failed to read response body.
    #[error("Failed to read response body as text: {context}: {source}")]
    ResponseBodyRead {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
}

/// A JSON API client rooted at a base URL.
#[derive(Clone, Debug)]
pub struct ApiClient {
    base_url: Url,
    client: Client,
    headers: HeaderMap,
    timeout: Option<Duration>,
}

impl ApiClient {
    /// Creates a client for `base_url`.
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            client: Client::new(),
            headers: HeaderMap::new(),
            timeout: None,
        }
    }

    /// Parses a base URL, normalizing it to exactly one trailing slash so
    /// that relative endpoints join under it.
    ///
    /// # Errors
    ///
    /// Returns [`ApiClientError::UrlParse`] for an invalid URL.
    pub fn parse(base_url: &str) -> Result<Self, ApiClientError> {
        let mut normalized = base_url.trim_end_matches('/').to_owned();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|e| ApiClientError::UrlParse {
            context: "Failed to parse base url",
            source: e,
        })?;
        Ok(Self::new(url))
    }

    /// Returns the base URL used by this client.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Returns the configured timeout, if any.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Sets a timeout for all future requests.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds a header sent with every request.
    ///
    /// # Errors
    ///
    /// Returns [`ApiClientError::InvalidHeader`] if the value is not a valid
    /// header value.
    pub fn with_header(mut self, name: &'static str, value: &str) -> Result<Self, ApiClientError> {
        let mut value = HeaderValue::from_str(value)
            .map_err(|source| ApiClientError::InvalidHeader { name, source })?;
        value.set_sensitive(true);
        self.headers.insert(HeaderName::from_static(name), value);
        Ok(self)
    }

    /// Resolves `path` relative to the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ApiClientError::UrlParse`] if the URL cannot be built.
    pub fn endpoint(&self, path: &str) -> Result<Url, ApiClientError> {
        self.base_url
            .join(path)
            .map_err(|e| ApiClientError::UrlParse {
                context: "Failed to construct endpoint URL",
                source: e,
            })
    }

    fn prepare(&self, mut req: RequestBuilder) -> RequestBuilder {
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        req
    }

    /// Sends a JSON `POST` and decodes a JSON response.
    ///
    /// `context` is a human-readable identifier used in tracing and error
    /// messages (e.g. `"POST /orders"`).
    ///
    /// # Errors
    ///
    /// Returns [`ApiClientError`] on transport failure, a non-success status
    /// or an undecodable body.
    pub async fn post_json<T, R>(
        &self,
        url: &Url,
        context: &'static str,
        payload: &T,
    ) -> Result<R, ApiClientError>
    where
        T: serde::Serialize + Sync + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let req = self.prepare(self.client.post(url.clone()).json(payload));
        let result = Self::execute(req, context).await;
        record_result_on_span(&result);
        result
    }

    /// Sends a `GET` and decodes a JSON response.
    ///
    /// # Errors
    ///
    /// Returns [`ApiClientError`] on transport failure, a non-success status
    /// or an undecodable body.
    pub async fn get_json<R>(&self, url: &Url, context: &'static str) -> Result<R, ApiClientError>
    where
        R: serde::de::DeserializeOwned,
    {
        let req = self.prepare(self.client.get(url.clone()));
        let result = Self::execute(req, context).await;
        record_result_on_span(&result);
        result
    }

    async fn execute<R>(req: RequestBuilder, context: &'static str) -> Result<R, ApiClientError>
    where
        R: serde::de::DeserializeOwned,
    {
        let http_response = req
            .send()
            .await
            .map_err(|e| ApiClientError::Http { context, source: e })?;

        if http_response.status().is_success() {
            http_response
                .json::<R>()
                .await
                .map_err(|e| ApiClientError::JsonDeserialization { context, source: e })
        } else {
            let status = http_response.status();
            let body = http_response
                .text()
                .await
                .map_err(|e| ApiClientError::ResponseBodyRead { context, source: e })?;
            Err(ApiClientError::HttpStatus {
                context,
                status,
                body,
            })
        }
    }
}

/// Records the outcome of a request on a tracing span, including status and errors.
#[cfg(feature = "telemetry")]
fn record_result_on_span<R, E: Display>(result: &Result<R, E>) {
    let span = Span::current();
    match result {
        Ok(_) => {
            span.record("otel.status_code", "OK");
        }
        Err(err) => {
            span.record("otel.status_code", "ERROR");
            span.record("error.message", tracing::field::display(err));
            tracing::event!(tracing::Level::ERROR, error = %err, "API request failed");
        }
    }
}

/// Records the outcome of a request on a tracing span, including status and errors.
/// Noop if telemetry feature is off.
#[cfg(not(feature = "telemetry"))]
fn record_result_on_span<R, E: Display>(_result: &Result<R, E>) {}

/// Instruments a future with a given tracing span.
#[cfg(feature = "telemetry")]
pub(crate) fn with_span<F: Future>(fut: F, span: Span) -> impl Future<Output = F::Output> {
    fut.instrument(span)
}

/// Awaits `$fut` inside an `info_span!` named `$name` when telemetry is on.
macro_rules! spanned {
    ($fut:expr, $name:literal $(, $($field:tt)*)?) => {{
        #[cfg(feature = "telemetry")]
        {
            $crate::client::with_span(
                $fut,
                tracing::info_span!(
                    $name,
                    otel.status_code = tracing::field::Empty,
                    error.message = tracing::field::Empty
                    $(, $($field)*)?
                ),
            )
            .await
        }
        #[cfg(not(feature = "telemetry"))]
        {
            $fut.await
        }
    }};
}

pub(crate) use spanned;
