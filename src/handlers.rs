use crate::api_keys::CHAT_PERMISSION;
use crate::app::AppState;
use crate::auth::AuthResult;
use crate::chat::{SendMessageInput, StartConversationInput};
use crate::error::{AppError, AppResult};
use crate::relay::{self, RELAY_CHANNEL_CAPACITY};
use crate::upstream::{ChatRequest, ResponseMode};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use tokio::sync::mpsc;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> AppResult<AuthResult> {
    state.auth.authenticate(headers, query).await
}

pub async fn start_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> AppResult<Response> {
    let auth = authenticate(&state, &headers, &query).await?;
    let body: StartConversationInput = parse_body(&body)?;
    let started = state.chat.start_conversation(&auth, body).await?;
    Ok(Json(started).into_response())
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> AppResult<Response> {
    let auth = authenticate(&state, &headers, &query).await?;
    let body: SendMessageInput = parse_body(&body)?;
    match body.response_mode {
        ResponseMode::Streaming => {
            state
                .chat
                .send_message_streaming(&auth, &conversation_id, body)
                .await
        }
        ResponseMode::Blocking => {
            let reply = state.chat.send_message(&auth, &conversation_id, body).await?;
            Ok(Json(reply).into_response())
        }
    }
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let auth = authenticate(&state, &headers, &query).await?;
    let limit = parse_i64_param(&query, "limit")?;
    let offset = parse_i64_param(&query, "offset")?;
    let history = state
        .chat
        .history(&auth, &conversation_id, limit, offset)
        .await?;
    Ok(Json(history).into_response())
}

pub async fn close_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let auth = authenticate(&state, &headers, &query).await?;
    let closed = state.chat.close(&auth, &conversation_id).await?;
    Ok(Json(json!({
        "message": "conversation closed",
        "conversationId": closed.id,
        "status": closed.status,
    }))
    .into_response())
}

/// Bodies are decoded only after the caller is authenticated, so a bad
/// credential is always reported as such.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> AppResult<T> {
    serde_json::from_slice(body)
        .map_err(|err| AppError::bad_request("invalid_json", format!("invalid request body: {err}")))
}

fn parse_i64_param(query: &HashMap<String, String>, name: &str) -> AppResult<Option<i64>> {
    match query.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw.parse::<i64>().map(Some).map_err(|_| {
            AppError::bad_request("invalid_query", format!("{name} must be an integer"))
                .with_param(name)
        }),
    }
}

/// Body of `POST /v1/chat-messages`, in the provider's own shape.
#[derive(Debug, Deserialize)]
pub struct ProxyChatRequest {
    #[serde(default)]
    pub inputs: Option<Value>,
    pub query: String,
    pub user: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub files: Option<Value>,
    #[serde(default)]
    pub response_mode: ResponseMode,
}

impl ProxyChatRequest {
    fn into_chat_request(self) -> ChatRequest {
        let mut request = ChatRequest::new(self.query, self.user);
        request.inputs = self.inputs.unwrap_or_else(|| Value::Object(Map::new()));
        request.conversation_id = self.conversation_id.filter(|id| !id.is_empty());
        request.files = self.files;
        request.response_mode = self.response_mode;
        request
    }
}

/// Pass-through to the provider's chat endpoint; nothing is persisted.
pub async fn proxy_chat_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> AppResult<Response> {
    let auth = authenticate(&state, &headers, &query).await?;
    auth.require_permission(CHAT_PERMISSION)?;
    let body: ProxyChatRequest = parse_body(&body)?;
    let target = auth.bot.upstream_target();
    let mode = body.response_mode;
    let request = body.into_chat_request();

    match mode {
        ResponseMode::Blocking => {
            let value = state
                .upstream
                .chat_blocking_raw(&target, &request)
                .await
                .map_err(|err| {
                    metrics::counter!("botrelay_upstream_requests_total", "mode" => "blocking", "outcome" => "error")
                        .increment(1);
                    err.into_app_error()
                })?;
            metrics::counter!("botrelay_upstream_requests_total", "mode" => "blocking", "outcome" => "ok")
                .increment(1);
            Ok(Json(value).into_response())
        }
        ResponseMode::Streaming => {
            let upstream = match state.upstream.chat_streaming(&target, &request).await {
                Ok(stream) => stream,
                Err(err) => {
                    metrics::counter!("botrelay_upstream_requests_total", "mode" => "streaming", "outcome" => "error")
                        .increment(1);
                    tracing::warn!(bot_id = %auth.bot.id, error = %err, "proxy stream failed to open");
                    return Ok(relay::sse_error_response(&err.message));
                }
            };
            metrics::counter!("botrelay_upstream_requests_total", "mode" => "streaming", "outcome" => "ok")
                .increment(1);
            let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
            tokio::spawn(async move {
                relay::relay_stream(upstream, &tx).await;
            });
            Ok(relay::sse_response(rx))
        }
    }
}

async fn proxy_get(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    path: &str,
) -> AppResult<Response> {
    let auth = authenticate(state, headers, query).await?;
    auth.require_permission(CHAT_PERMISSION)?;
    let user = query.get("user").map(String::as_str).unwrap_or_default();
    let params: Vec<(&str, &str)> = if user.is_empty() {
        Vec::new()
    } else {
        vec![("user", user)]
    };
    let value = state
        .upstream
        .get_json(&auth.bot.upstream_target(), path, &params)
        .await
        .map_err(|err| err.into_app_error())?;
    Ok(Json(value).into_response())
}

pub async fn proxy_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    proxy_get(&state, &headers, &query, "info").await
}

pub async fn proxy_parameters(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    proxy_get(&state, &headers, &query, "parameters").await
}

pub async fn proxy_meta(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    proxy_get(&state, &headers, &query, "meta").await
}
