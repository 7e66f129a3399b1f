//! # Tracking Provider Client
//!
//! `TrackingProvider` is the seam between the engine and the third-party
//! platform. `HttpProvider` speaks the platform's JSON protocol:
//!
//! ```text
//! POST {base}/webapi?action=login                          -> token
//! POST {base}/webapi?action=querymonitorlist&token=...     -> groups[].devices[]
//! POST {base}/webapi?action=lastposition&token=...         -> records[] + lastquerypositiontime
//! ```
//!
//! The client never retries: each call is one gatekeeper admission.

use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;

use super::model::{
    LastPositionRequest, LastPositionResponse, LoginRequest, LoginResponse, MonitorListRequest,
    MonitorListResponse,
};
use crate::configs::Credentials;
use crate::core::errors::SyncError;
use crate::core::model::{Device, DeviceId, Position, SkippedPosition};
use crate::retrieve::ky_http::{ApiClient, ApiResponse, HttpError};

/// Result of one `lastposition` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionPage {
    pub positions: Vec<Position>,
    /// Records the provider sent that could not be turned into a position.
    pub rejected: Vec<SkippedPosition>,
    /// Watermark echoed by the provider, if any.
    pub cursor: Option<i64>,
}

/// Operations the engine needs from a tracking platform.
pub trait TrackingProvider: Send + Sync {
    /// Exchanges credentials for a session token.
    fn login<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, Result<String, SyncError>>;

    /// Full device roster, flattened across groups.
    fn query_monitor_list<'a>(&'a self, token: &'a str, username: &'a str)
        -> BoxFuture<'a, Result<Vec<Device>, SyncError>>;

    /// Positions changed since `cursor` for the given devices.
    fn last_position<'a>(
        &'a self,
        token: &'a str,
        device_ids: &'a [DeviceId],
        cursor: i64,
    ) -> BoxFuture<'a, Result<PositionPage, SyncError>>;
}

const ENDPOINT: &str = "webapi";
const DEFAULT_BROWSER: &str = "lib_fleetsync";

/// `TrackingProvider` over HTTP.
pub struct HttpProvider {
    client: ApiClient,
    browser: String,
}

impl HttpProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let base = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let client = ApiClient::new(&base, timeout).map_err(|e| SyncError::Config(e.to_string()))?;
        Ok(Self {
            client,
            browser: DEFAULT_BROWSER.to_string(),
        })
    }

    pub fn from_credentials(credentials: &Credentials, timeout: Duration) -> Result<Self, SyncError> {
        Self::new(&credentials.base_url, timeout)
    }

    /// Overrides the `browser` tag sent on login.
    pub fn with_browser(mut self, browser: impl Into<String>) -> Self {
        self.browser = browser.into();
        self
    }

    async fn call<T, B>(&self, action: &str, token: Option<&str>, body: &B) -> Result<T, SyncError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let mut query = vec![("action", action)];
        if let Some(token) = token {
            query.push(("token", token));
        }
        let response: ApiResponse<T> = self
            .client
            .post_json(ENDPOINT, &query, body)
            .await
            .map_err(transport_error)?;
        decode_response(action, response)
    }
}

fn transport_error(e: HttpError) -> SyncError {
    match e {
        HttpError::InvalidUrl(msg) => SyncError::Config(msg),
        HttpError::Encode(e) => SyncError::Provider {
            status: -1,
            message: e.to_string(),
        },
        HttpError::Timeout(msg) | HttpError::Transport(msg) => SyncError::Network(msg),
    }
}

/// Maps an HTTP reply onto the error taxonomy.
fn decode_response<T>(action: &str, response: ApiResponse<T>) -> Result<T, SyncError> {
    let body = response.error_body.unwrap_or_default();
    match response.status {
        401 | 403 => return Err(SyncError::Auth(format!("{action}: HTTP {}", response.status))),
        429 => return Err(SyncError::ServerError(format!("{action}: HTTP 429 too many requests"))),
        s if s >= 500 => return Err(SyncError::ServerError(format!("{action}: HTTP {s}"))),
        _ => {}
    }
    if !response.success {
        return Err(SyncError::Provider {
            status: i64::from(response.status),
            message: format!("{action}: {}", truncate(&body)),
        });
    }
    response.data.ok_or_else(|| SyncError::Provider {
        status: -1,
        message: format!(
            "{action}: undecodable body ({}): {}",
            response.decode_error.unwrap_or_default(),
            truncate(&body)
        ),
    })
}

/// Non-zero provider status: token problems are auth failures, the rest provider errors.
fn status_error(action: &str, status: i64, cause: Option<String>) -> SyncError {
    let message = cause.unwrap_or_else(|| "no cause given".to_string());
    let lowered = message.to_ascii_lowercase();
    if ["token", "login", "password", "session"].iter().any(|k| lowered.contains(k)) {
        SyncError::Auth(format!("{action}: status {status}: {message}"))
    } else {
        SyncError::Provider {
            status,
            message: format!("{action}: {message}"),
        }
    }
}

fn truncate(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(200)
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    &body[..end]
}

impl TrackingProvider for HttpProvider {
    fn login<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, Result<String, SyncError>> {
        async move {
            let request = LoginRequest {
                kind: "USER",
                from: "WEB",
                username: &credentials.username,
                password: &credentials.password_hash,
                browser: &self.browser,
            };
            let response: LoginResponse = self.call("login", None, &request).await?;
            if response.status != 0 {
                return Err(SyncError::Auth(format!(
                    "login rejected with status {}: {}",
                    response.status,
                    response.cause.unwrap_or_default()
                )));
            }
            match response.token.filter(|t| !t.is_empty()) {
                Some(token) => {
                    tracing::info!(username = %credentials.username, "Provider login succeeded");
                    Ok(token)
                }
                None => Err(SyncError::Auth("login response carried no token".into())),
            }
        }
        .boxed()
    }

    fn query_monitor_list<'a>(
        &'a self,
        token: &'a str,
        username: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Device>, SyncError>> {
        async move {
            let response: MonitorListResponse = self
                .call("querymonitorlist", Some(token), &MonitorListRequest { username })
                .await?;
            if response.status != 0 {
                return Err(status_error("querymonitorlist", response.status, response.cause));
            }
            let mut seen = HashSet::new();
            let mut devices = Vec::new();
            for group in response.groups {
                let group_name = group.groupname.as_deref();
                for wire in group.devices {
                    if seen.insert(wire.deviceid.clone()) {
                        devices.push(wire.into_device(group_name));
                    }
                }
            }
            tracing::debug!(device_count = devices.len(), "Monitor list fetched");
            Ok(devices)
        }
        .boxed()
    }

    fn last_position<'a>(
        &'a self,
        token: &'a str,
        device_ids: &'a [DeviceId],
        cursor: i64,
    ) -> BoxFuture<'a, Result<PositionPage, SyncError>> {
        async move {
            let request = LastPositionRequest {
                deviceids: device_ids,
                lastquerypositiontime: cursor,
            };
            let response: LastPositionResponse = self.call("lastposition", Some(token), &request).await?;
            if response.status != 0 {
                return Err(status_error("lastposition", response.status, response.cause));
            }
            let mut page = PositionPage {
                cursor: response.lastquerypositiontime,
                ..PositionPage::default()
            };
            for record in response.records.unwrap_or_default() {
                match record.into_position() {
                    Ok(p) => page.positions.push(p),
                    Err((device_id, reason)) => page.rejected.push(SkippedPosition { device_id, reason }),
                }
            }
            tracing::debug!(
                requested = device_ids.len(),
                received = page.positions.len(),
                rejected = page.rejected.len(),
                cursor = ?page.cursor,
                "Positions fetched"
            );
            Ok(page)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;

    fn response<T>(status: u16, data: Option<T>, body: Option<&str>) -> ApiResponse<T> {
        ApiResponse {
            data,
            error_body: body.map(str::to_string),
            decode_error: None,
            status,
            success: (200..300).contains(&status),
            headers: HeaderMap::new(),
        }
    }

    #[test]
    fn http_statuses_map_onto_the_taxonomy() {
        assert!(matches!(decode_response::<()>("x", response(401, None, None)), Err(SyncError::Auth(_))));
        assert!(matches!(decode_response::<()>("x", response(403, None, None)), Err(SyncError::Auth(_))));
        assert!(matches!(
            decode_response::<()>("x", response(429, None, None)),
            Err(SyncError::ServerError(_))
        ));
        assert!(matches!(
            decode_response::<()>("x", response(503, None, None)),
            Err(SyncError::ServerError(_))
        ));
        assert!(matches!(
            decode_response::<()>("x", response(404, None, Some("gone"))),
            Err(SyncError::Provider { status: 404, .. })
        ));
        assert!(matches!(
            decode_response::<()>("x", response(200, None, Some("<html>"))),
            Err(SyncError::Provider { status: -1, .. })
        ));
        assert_eq!(decode_response("x", response(200, Some(5), None)), Ok(5));
    }

    #[test]
    fn token_causes_are_auth_failures() {
        assert!(matches!(
            status_error("lastposition", 1, Some("Token expired".into())),
            SyncError::Auth(_)
        ));
        assert!(matches!(
            status_error("lastposition", 3, Some("busy".into())),
            SyncError::Provider { status: 3, .. }
        ));
    }

    #[test]
    fn timeouts_are_network_errors() {
        assert!(matches!(
            transport_error(HttpError::Timeout("30s".into())),
            SyncError::Network(_)
        ));
    }

    #[test]
    fn base_url_gets_a_trailing_slash() {
        let provider = HttpProvider::new("http://127.0.0.1:9/tracker", Duration::from_secs(1)).unwrap();
        assert_eq!(provider.client.base_url().as_str(), "http://127.0.0.1:9/tracker/");
    }
}
