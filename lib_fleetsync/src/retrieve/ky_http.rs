//! # HTTP Retrieval Utilities
//!
//! A thin asynchronous API client around `reqwest`. It joins paths onto a base
//! URL, attaches query parameters and a JSON body, and hands back the decoded
//! body together with the transaction metadata. Interpreting status codes is
//! left to the caller.

use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Transport-level failures. HTTP error statuses are not errors here.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("request body could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest_middleware::Error> for HttpError {
    fn from(e: reqwest_middleware::Error) -> Self {
        match e {
            reqwest_middleware::Error::Reqwest(inner) if inner.is_timeout() => HttpError::Timeout(inner.to_string()),
            other => HttpError::Transport(other.to_string()),
        }
    }
}

/// A standardized container for API responses.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized body, when it decoded as `T`.
    pub data: Option<T>,
    /// The raw body when it did not decode, or the body of a non-2xx reply.
    pub error_body: Option<String>,
    /// Why the body did not decode as `T`.
    pub decode_error: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// A JSON API client bound to one base URL.
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
}

impl ApiClient {
    /// Creates a client for `base_url` with a per-request `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, HttpError> {
        let url = Url::parse(base_url).map_err(|e| HttpError::InvalidUrl(format!("{base_url}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::Transport(e.to_string()))?;
        let client = ClientBuilder::new(http).build();
        Ok(Self { inner: client, base_url: url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs one HTTP request.
    ///
    /// # Arguments
    /// * `method` - The HTTP verb.
    /// * `path` - Path relative to the base URL.
    /// * `query` - Query string pairs.
    /// * `body` - Optional value sent as the JSON body.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<ApiResponse<T>, HttpError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let full_url = self
            .base_url
            .join(path)
            .map_err(|e| HttpError::InvalidUrl(format!("{path}: {e}")))?;
        let mut req = self.inner.request(method, full_url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(b) = body {
            let json_body = serde_json::to_string(b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let success = status.is_success();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout(e.to_string())
            } else {
                HttpError::Transport(e.to_string())
            }
        })?;

        if !success {
            return Ok(ApiResponse {
                data: None,
                error_body: Some(text),
                decode_error: None,
                status: status.as_u16(),
                success,
                headers,
            });
        }

        match serde_json::from_str::<T>(&text) {
            Ok(data) => Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                decode_error: None,
                status: status.as_u16(),
                success,
                headers,
            }),
            Err(e) => Ok(ApiResponse {
                data: None,
                error_body: Some(text),
                decode_error: Some(e.to_string()),
                status: status.as_u16(),
                success,
                headers,
            }),
        }
    }

    /// `POST` with a JSON body.
    pub async fn post_json<T, B>(&self, path: &str, query: &[(&str, &str)], body: &B) -> Result<ApiResponse<T>, HttpError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(Method::POST, path, query, Some(body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_base_url() {
        assert!(matches!(
            ApiClient::new("tracker/webapi", Duration::from_secs(1)),
            Err(HttpError::InvalidUrl(_))
        ));
    }

    #[test]
    fn keeps_absolute_base_url() {
        let client = ApiClient::new("http://127.0.0.1:9/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url().as_str(), "http://127.0.0.1:9/");
    }
}
