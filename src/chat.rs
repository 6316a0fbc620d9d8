use crate::api_keys::CHAT_PERMISSION;
use crate::auth::AuthResult;
use crate::bots::Bot;
use crate::conversations::{
    Conversation, ConversationError, ConversationStatus, ConversationStore, Message, MessageRole,
    NewMessage,
};
use crate::error::{AppError, AppResult};
use crate::relay::{self, RELAY_CHANNEL_CAPACITY};
use crate::upstream::{ChatRequest, ResponseMode, UpstreamClient};
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartConversationInput {
    #[serde(default)]
    pub bot_id: Option<String>,
    pub user_id: String,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageInput {
    pub message: String,
    #[serde(default)]
    pub files: Option<Value>,
    #[serde(default)]
    pub response_mode: ResponseMode,
}

/// Public face of a bot as chat clients see it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotProfile {
    pub id: String,
    pub name: String,
    pub avatar: Option<String>,
    pub welcome_message: Option<String>,
}

impl From<&Bot> for BotProfile {
    fn from(bot: &Bot) -> Self {
        Self {
            id: bot.id.clone(),
            name: bot.name.clone(),
            avatar: bot.avatar.clone(),
            welcome_message: bot.welcome_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartConversationResponse {
    pub conversation_id: String,
    pub bot: BotProfile,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: String,
    pub content: String,
    pub role: MessageRole,
    pub created_at: DateTime<Utc>,
}

impl From<Message> for MessageView {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            content: message.content,
            role: message.role,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub user_message: MessageView,
    pub bot_message: MessageView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationHistory {
    pub conversation: Conversation,
    pub bot: BotProfile,
    pub messages: Vec<Message>,
}

/// Chat orchestration over the conversation store and the upstream client.
#[derive(Clone)]
pub struct ChatService {
    conversations: ConversationStore,
    upstream: UpstreamClient,
    default_fallback: String,
}

impl ChatService {
    pub fn new(
        conversations: ConversationStore,
        upstream: UpstreamClient,
        default_fallback: String,
    ) -> Self {
        Self {
            conversations,
            upstream,
            default_fallback,
        }
    }

    pub fn fallback_for(&self, bot: &Bot) -> String {
        bot.fallback_message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.default_fallback.clone())
    }

    pub async fn start_conversation(
        &self,
        auth: &AuthResult,
        input: StartConversationInput,
    ) -> AppResult<StartConversationResponse> {
        auth.require_permission(CHAT_PERMISSION)?;
        let bot = &auth.bot;
        if let Some(requested) = input.bot_id.as_deref().filter(|id| !id.is_empty()) {
            if requested != bot.id {
                return Err(AppError::forbidden("api key does not belong to this bot"));
            }
        }
        if input.user_id.trim().is_empty() {
            return Err(AppError::bad_request("invalid_user_id", "userId is required").with_param("userId"));
        }

        let (conversation, created) = self
            .conversations
            .get_or_create_active(
                &bot.id,
                &input.user_id,
                input.user_name.as_deref(),
                input.user_email.as_deref(),
                bot.welcome_message.as_deref(),
            )
            .await
            .map_err(AppError::internal)?;
        if !created {
            tracing::debug!(conversation_id = %conversation.id, "resuming active conversation");
        }

        let messages = self
            .conversations
            .list_messages(&conversation.id, i64::MAX, 0)
            .await
            .map_err(AppError::internal)?;

        Ok(StartConversationResponse {
            conversation_id: conversation.id,
            bot: BotProfile::from(bot),
            messages,
        })
    }

    /// Loads a conversation the caller may write to: it exists, belongs to the
    /// caller's bot and is still ACTIVE.
    async fn open_conversation(&self, auth: &AuthResult, conversation_id: &str) -> AppResult<Conversation> {
        auth.require_permission(CHAT_PERMISSION)?;
        let conversation = self.owned_conversation(auth, conversation_id).await?;
        if conversation.status != ConversationStatus::Active {
            return Err(AppError::not_found(
                "conversation_closed",
                "conversation closed",
            ));
        }
        Ok(conversation)
    }

    async fn owned_conversation(&self, auth: &AuthResult, conversation_id: &str) -> AppResult<Conversation> {
        let conversation = self
            .conversations
            .get(conversation_id)
            .await
            .map_err(AppError::internal)?
            .ok_or_else(|| {
                AppError::not_found("conversation_not_found", "conversation not found")
            })?;
        if conversation.bot_id != auth.bot.id {
            return Err(AppError::forbidden(
                "conversation does not belong to this api key's bot",
            ));
        }
        Ok(conversation)
    }

    async fn persist_user_message(
        &self,
        conversation_id: &str,
        input: &SendMessageInput,
    ) -> AppResult<Message> {
        let metadata = input.files.as_ref().map(|files| json!({ "files": files }));
        self.conversations
            .append_message(
                conversation_id,
                NewMessage::new(MessageRole::User, &input.message).with_metadata(metadata.as_ref()),
            )
            .await
            .map_err(conversation_error)
    }

    fn upstream_request(conversation: &Conversation, input: &SendMessageInput) -> ChatRequest {
        let mut request = ChatRequest::new(input.message.clone(), conversation.user_id.clone());
        request.conversation_id = conversation.upstream_conversation_id.clone();
        request.files = input.files.clone();
        request
    }

    /// Blocking turn. Upstream failures are recovered into the fallback reply and
    /// reported through `error`; they never fail the call.
    pub async fn send_message(
        &self,
        auth: &AuthResult,
        conversation_id: &str,
        input: SendMessageInput,
    ) -> AppResult<SendMessageResponse> {
        validate_message(&input)?;
        let conversation = self.open_conversation(auth, conversation_id).await?;
        let user_message = self.persist_user_message(&conversation.id, &input).await?;

        let request = Self::upstream_request(&conversation, &input);
        match self
            .upstream
            .chat_blocking(&auth.bot.upstream_target(), &request)
            .await
        {
            Ok(completion) => {
                metrics::counter!("botrelay_upstream_requests_total", "mode" => "blocking", "outcome" => "ok")
                    .increment(1);
                if let Some(handle) = completion.conversation_id.as_deref() {
                    self.conversations
                        .record_upstream_handle(&conversation.id, handle)
                        .await
                        .map_err(AppError::internal)?;
                }
                let bot_message = self
                    .conversations
                    .append_message(
                        &conversation.id,
                        NewMessage::new(MessageRole::Assistant, &completion.answer)
                            .with_upstream_id(completion.message_id.as_deref())
                            .with_metadata(completion.metadata.as_ref()),
                    )
                    .await
                    .map_err(conversation_error)?;
                Ok(SendMessageResponse {
                    user_message: user_message.into(),
                    bot_message: bot_message.into(),
                    error: None,
                })
            }
            Err(err) => {
                metrics::counter!("botrelay_upstream_requests_total", "mode" => "blocking", "outcome" => "error")
                    .increment(1);
                metrics::counter!("botrelay_fallback_replies_total").increment(1);
                tracing::warn!(
                    conversation_id = %conversation.id,
                    bot_id = %auth.bot.id,
                    error = %err,
                    "upstream chat failed, replying with fallback"
                );
                let fallback = self.fallback_for(&auth.bot);
                let bot_message = self
                    .conversations
                    .append_message(
                        &conversation.id,
                        NewMessage::new(MessageRole::Assistant, &fallback),
                    )
                    .await
                    .map_err(conversation_error)?;
                Ok(SendMessageResponse {
                    user_message: user_message.into(),
                    bot_message: bot_message.into(),
                    error: Some(err.message),
                })
            }
        }
    }

    /// Streaming turn. Bytes are relayed as they arrive; the assistant reply is
    /// persisted only when the upstream stream completes cleanly.
    pub async fn send_message_streaming(
        &self,
        auth: &AuthResult,
        conversation_id: &str,
        input: SendMessageInput,
    ) -> AppResult<Response> {
        validate_message(&input)?;
        let conversation = self.open_conversation(auth, conversation_id).await?;
        self.persist_user_message(&conversation.id, &input).await?;

        let request = Self::upstream_request(&conversation, &input);
        let upstream = match self
            .upstream
            .chat_streaming(&auth.bot.upstream_target(), &request)
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                metrics::counter!("botrelay_upstream_requests_total", "mode" => "streaming", "outcome" => "error")
                    .increment(1);
                metrics::counter!("botrelay_fallback_replies_total").increment(1);
                tracing::warn!(
                    conversation_id = %conversation.id,
                    error = %err,
                    "upstream stream failed to open, replying with fallback"
                );
                let fallback = self.fallback_for(&auth.bot);
                self.conversations
                    .append_message(
                        &conversation.id,
                        NewMessage::new(MessageRole::Assistant, &fallback),
                    )
                    .await
                    .map_err(conversation_error)?;
                return Ok(relay::sse_error_response(&err.message));
            }
        };
        metrics::counter!("botrelay_upstream_requests_total", "mode" => "streaming", "outcome" => "ok")
            .increment(1);

        let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        let conversations = self.conversations.clone();
        let conversation_id = conversation.id.clone();
        tokio::spawn(async move {
            let outcome = relay::relay_stream(upstream, &tx).await;
            if !outcome.completed() {
                tracing::info!(
                    conversation_id = %conversation_id,
                    end = ?outcome.end,
                    "stream did not complete, assistant reply not persisted"
                );
                return;
            }
            let acc = outcome.accumulator;
            if let Some(handle) = acc.conversation_id.as_deref() {
                if let Err(err) = conversations
                    .record_upstream_handle(&conversation_id, handle)
                    .await
                {
                    tracing::error!(conversation_id = %conversation_id, error = %err, "failed to record upstream handle");
                }
            }
            if let Err(err) = conversations
                .append_message(
                    &conversation_id,
                    NewMessage::new(MessageRole::Assistant, &acc.answer)
                        .with_upstream_id(acc.message_id.as_deref())
                        .with_metadata(acc.metadata.as_ref()),
                )
                .await
            {
                tracing::error!(conversation_id = %conversation_id, error = ?err, "failed to persist streamed reply");
            }
            // `tx` drops here, so the client sees the end of the body only after persistence.
        });

        Ok(relay::sse_response(rx))
    }

    pub async fn history(
        &self,
        auth: &AuthResult,
        conversation_id: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> AppResult<ConversationHistory> {
        auth.require_permission(CHAT_PERMISSION)?;
        let conversation = self.owned_conversation(auth, conversation_id).await?;
        let limit = limit.filter(|l| *l > 0).unwrap_or(DEFAULT_HISTORY_LIMIT);
        let offset = offset.filter(|o| *o >= 0).unwrap_or(0);
        let messages = self
            .conversations
            .list_messages(&conversation.id, limit, offset)
            .await
            .map_err(AppError::internal)?;
        Ok(ConversationHistory {
            conversation,
            bot: BotProfile::from(&auth.bot),
            messages,
        })
    }

    /// Closing is idempotent: a closed conversation closes again without error.
    pub async fn close(&self, auth: &AuthResult, conversation_id: &str) -> AppResult<Conversation> {
        auth.require_permission(CHAT_PERMISSION)?;
        let conversation = self.owned_conversation(auth, conversation_id).await?;
        let closed = self
            .conversations
            .close(&conversation.id)
            .await
            .map_err(conversation_error)?;
        tracing::info!(conversation_id = %closed.id, "conversation closed");
        Ok(closed)
    }
}

fn validate_message(input: &SendMessageInput) -> AppResult<()> {
    if input.message.trim().is_empty() {
        return Err(AppError::bad_request("invalid_message", "message is required").with_param("message"));
    }
    Ok(())
}

fn conversation_error(err: ConversationError) -> AppError {
    match err {
        ConversationError::NotFound => {
            AppError::not_found("conversation_not_found", "conversation not found")
        }
        ConversationError::Storage(msg) => AppError::internal(msg),
    }
}
