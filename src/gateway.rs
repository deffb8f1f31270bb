//! Authenticated request gateway
//!
//! Every outbound API call goes through [`RequestGateway::call`]. The gateway
//! attaches the bearer credential, and on an unauthorized response runs the
//! refresh protocol at most once before retrying the original request.
//!
//! Concurrent callers that all observe an unauthorized response share one
//! refresh: the refresh runs under a single async lock, and a caller that
//! acquires the lock after another caller already rotated the pair reuses
//! the rotated access token instead of refreshing again.

use std::sync::Arc;

use reqwest::{header, Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ApiConfig;
use crate::error::{Result, SyncError};
use crate::model::TokenPair;
use crate::session::Session;

/// Path of the refresh endpoint
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Successful outcome of a gateway call
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    /// Success response with a decodable JSON body
    Json(JsonValue),
    /// Success response without a decodable JSON body, returned as-is
    Raw { status: u16, body: String },
}

impl ApiResponse {
    /// Decode the body into a typed value
    pub fn into_json<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            ApiResponse::Json(value) => Ok(serde_json::from_value(value)?),
            ApiResponse::Raw { body, .. } => Ok(serde_json::from_str(&body)?),
        }
    }
}

/// Issues every outbound API call on behalf of the session
pub struct RequestGateway {
    base_url: String,
    http: Client,
    session: Arc<Session>,
    /// Held for the duration of a refresh; see module docs
    refresh_lock: Mutex<()>,
}

impl RequestGateway {
    pub fn new(config: &ApiConfig, session: Arc<Session>) -> Result<Self> {
        let http = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
            session,
            refresh_lock: Mutex::new(()),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Issue a request against `endpoint` (a path relative to the base URL)
    pub async fn call(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&JsonValue>,
    ) -> Result<ApiResponse> {
        let sent_token = self.session.access_token();
        let response = self
            .send(&method, endpoint, body, sent_token.as_deref())
            .await?;

        // Login and refresh answer 401 for bad credentials; that is a
        // rejection, not an expired session.
        if response.status() == StatusCode::UNAUTHORIZED && !is_auth_endpoint(endpoint) {
            debug!(%method, endpoint, "Unauthorized, refreshing session");
            let token = self.refresh_after(sent_token.as_deref()).await?;
            let retried = self.send(&method, endpoint, body, Some(&token)).await?;
            return classify(retried).await;
        }

        classify(response).await
    }

    /// Issue a request and decode the JSON body
    pub async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&JsonValue>,
    ) -> Result<T> {
        self.call(method, endpoint, body).await?.into_json()
    }

    async fn send(
        &self,
        method: &Method,
        endpoint: &str,
        body: Option<&JsonValue>,
        token: Option<&str>,
    ) -> Result<Response> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut request = self.http.request(method.clone(), &url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(%method, endpoint, authenticated = token.is_some(), "Sending request");
        Ok(request.send().await?)
    }

    /// Obtain a usable access token after `stale` was rejected.
    ///
    /// Returns the rotated token, or fails with `SessionExpired` after
    /// clearing the session.
    async fn refresh_after(&self, stale: Option<&str>) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;

        let pair = match self.session.current() {
            Some(pair) => pair,
            // Cleared by logout or by a refresh that failed while we waited
            None => return Err(SyncError::SessionExpired),
        };

        if stale != Some(pair.access_token.as_str()) {
            debug!("Session already refreshed by a concurrent call");
            return Ok(pair.access_token);
        }

        match self.request_refresh(&pair.refresh_token).await {
            Ok(rotated) => {
                info!("Session refreshed");
                let token = rotated.access_token.clone();
                self.session.set(rotated);
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "Session refresh failed, logging out");
                self.session.clear();
                Err(SyncError::SessionExpired)
            }
        }
    }

    async fn request_refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let url = format!("{}{}", self.base_url, REFRESH_PATH);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "token": refresh_token }))
            .send()
            .await?;

        match classify(response).await? {
            ApiResponse::Json(value) => Ok(serde_json::from_value(value)?),
            ApiResponse::Raw { status, .. } => Err(SyncError::Api {
                status,
                message: "refresh returned no credentials".to_string(),
            }),
        }
    }
}

fn is_auth_endpoint(endpoint: &str) -> bool {
    endpoint.starts_with("/auth/")
}

/// Turn a non-401 response into the call outcome
async fn classify(response: Response) -> Result<ApiResponse> {
    let status = response.status();
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false);
    let bytes = response.bytes().await?;

    if status.is_success() {
        if is_json {
            if let Ok(value) = serde_json::from_slice::<JsonValue>(&bytes) {
                return Ok(ApiResponse::Json(value));
            }
        }
        return Ok(ApiResponse::Raw {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }

    Err(SyncError::Api {
        status: status.as_u16(),
        message: error_message(status, &bytes),
    })
}

/// Best-effort message from an error body
fn error_message(status: StatusCode, body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<JsonValue>(body) {
        for key in ["message", "detail", "error"] {
            match value.get(key) {
                Some(JsonValue::String(s)) => return s.clone(),
                Some(JsonValue::Null) | None => {}
                Some(other) => return other.to_string(),
            }
        }
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if !text.is_empty() {
        return text.to_string();
    }

    status
        .canonical_reason()
        .unwrap_or("API error")
        .to_string()
}
