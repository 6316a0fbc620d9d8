use crate::error::AppError;
use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
    Decode,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    pub fn into_app_error(self) -> AppError {
        let status = self
            .status
            .filter(|s| s.is_client_error() || s.is_server_error())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let code = self.code.unwrap_or_else(|| "upstream_error".to_string());
        AppError::new(status, code, self.message).with_type("upstream_error")
    }
}

pub type UpstreamByteStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

/// Where a bot's provider lives and the key it authenticates with.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    #[default]
    Blocking,
    Streaming,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub inputs: Value,
    pub query: String,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Value>,
    pub response_mode: ResponseMode,
}

impl ChatRequest {
    pub fn new(query: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            inputs: Value::Object(Map::new()),
            query: query.into(),
            user: user.into(),
            conversation_id: None,
            files: None,
            response_mode: ResponseMode::Blocking,
        }
    }
}

/// Result of a blocking chat call.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// One HTTP client per process, built at startup and shared through `AppState`.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("botrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self { http, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Single-shot chat call, bounded by the configured timeout.
    pub async fn chat_blocking(
        &self,
        target: &UpstreamTarget,
        request: &ChatRequest,
    ) -> Result<ChatCompletion, UpstreamCallError> {
        let value = self.chat_blocking_raw(target, request).await?;
        serde_json::from_value(value).map_err(|err| {
            UpstreamCallError::new(
                UpstreamErrorKind::Decode,
                None,
                format!("malformed upstream response: {err}"),
            )
        })
    }

    /// Blocking call returning the provider's JSON untouched.
    pub async fn chat_blocking_raw(
        &self,
        target: &UpstreamTarget,
        request: &ChatRequest,
    ) -> Result<Value, UpstreamCallError> {
        let mut request = request.clone();
        request.response_mode = ResponseMode::Blocking;
        let req = self
            .http
            .post(join_url(&target.base_url, "/chat-messages"))
            .bearer_auth(&target.api_key)
            .timeout(self.timeout)
            .json(&request);
        let resp = send_checked(req).await?;
        read_json(resp).await
    }

    /// Opens the provider's event stream. No overall timeout applies: the stream
    /// lives until the provider ends it or the consumer drops it.
    pub async fn chat_streaming(
        &self,
        target: &UpstreamTarget,
        request: &ChatRequest,
    ) -> Result<UpstreamByteStream, UpstreamCallError> {
        let mut request = request.clone();
        request.response_mode = ResponseMode::Streaming;
        let req = self
            .http
            .post(join_url(&target.base_url, "/chat-messages"))
            .bearer_auth(&target.api_key)
            .json(&request);
        let resp = send_checked(req).await?;
        Ok(resp.bytes_stream().boxed())
    }

    /// `GET {base}/{path}` with the bot's key, e.g. `info`, `parameters`, `meta`.
    pub async fn get_json(
        &self,
        target: &UpstreamTarget,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, UpstreamCallError> {
        let req = self
            .http
            .get(join_url(&target.base_url, path))
            .bearer_auth(&target.api_key)
            .timeout(self.timeout)
            .query(query);
        let resp = send_checked(req).await?;
        read_json(resp).await
    }
}

async fn send_checked(req: reqwest::RequestBuilder) -> Result<reqwest::Response, UpstreamCallError> {
    let resp = req.send().await.map_err(|err| {
        let message = if err.is_timeout() {
            format!("upstream request timed out: {err}")
        } else {
            format!("upstream unreachable: {err}")
        };
        UpstreamCallError::new(UpstreamErrorKind::Network, None, message)
    })?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let code = extract_error_code(&text);
        let message = extract_error_message(&text)
            .unwrap_or_else(|| format!("upstream status {}: {}", status, text));
        return Err(UpstreamCallError::new(UpstreamErrorKind::Http, Some(status), message).with_code(code));
    }
    Ok(resp)
}

async fn read_json(resp: reqwest::Response) -> Result<Value, UpstreamCallError> {
    let status = resp.status();
    let text = resp.text().await.map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Network, Some(status), err.to_string())
    })?;
    serde_json::from_str(&text).map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Decode, Some(status), err.to_string())
    })
}

pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

// Providers answer `{"code": "...", "message": "...", "status": 400}`; some wrap it in `error`.
fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("code")
        .or_else(|| value.get("error").and_then(|v| v.get("code")))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn extract_error_message(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("message")
        .or_else(|| value.get("error").and_then(|v| v.get("message")))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}
