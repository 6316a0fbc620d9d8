use crate::api_keys::{ApiKey, CreateApiKeyInput, UpdateApiKeyInput};
use crate::app::AppState;
use crate::bots::{Bot, CreateBotInput, UpdateBotInput};
use crate::error::{AppError, AppResult};
use crate::users::{CreateUserError, User, UserRole, UserStore};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::json;

const MAX_PAGE_SIZE: i64 = 100;

fn is_valid_username(username: &str) -> bool {
    (3..=32).contains(&username.len())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserResponse,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub username: String,
    pub role: UserRole,
    pub created_at: String,
    pub last_login_at: Option<String>,
    pub enabled: bool,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            role: user.role,
            created_at: user.created_at.to_rfc3339(),
            last_login_at: user.last_login_at.map(|t| t.to_rfc3339()),
            enabled: user.enabled,
        }
    }
}

fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

async fn get_current_user(headers: &HeaderMap, state: &AppState) -> AppResult<User> {
    let token = extract_session_token(headers)
        .ok_or_else(|| AppError::unauthorized("missing authorization header"))?;

    let session = state
        .user_store
        .get_session_by_token(&token)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::unauthorized("invalid or expired session"))?;

    let user = state
        .user_store
        .get_user_by_id(&session.user_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::unauthorized("user not found"))?;

    if !user.enabled {
        return Err(AppError::forbidden("user account is disabled"));
    }

    Ok(user)
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> AppResult<impl IntoResponse> {
    let user_store = &state.user_store;

    if !is_valid_username(&body.username) {
        return Err(AppError::bad_request(
            "invalid_username",
            "username must be 3-32 characters, only letters, digits and underscores",
        )
        .with_param("username"));
    }

    if body.password.len() < 6 {
        return Err(AppError::bad_request(
            "invalid_password",
            "password must be at least 6 characters",
        )
        .with_param("password"));
    }

    let user_count = user_store.user_count().await.map_err(AppError::internal)?;
    let role = if user_count == 0 {
        UserRole::Admin
    } else {
        UserRole::User
    };

    let user = user_store
        .create_user(&body.username, &body.password, role)
        .await
        .map_err(|e| match e {
            CreateUserError::UsernameTaken => AppError::new(
                StatusCode::CONFLICT,
                "username_taken",
                "username already exists",
            ),
            CreateUserError::Storage(msg) => AppError::internal(msg),
        })?;

    let session = user_store
        .create_session(&user.id)
        .await
        .map_err(AppError::internal)?;

    tracing::info!(user_id = %user.id, role = role.as_str(), "user registered");
    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            token: session.token,
            user: user.into(),
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> AppResult<impl IntoResponse> {
    let user_store = &state.user_store;
    let invalid = || {
        AppError::new(
            StatusCode::UNAUTHORIZED,
            "invalid_credentials",
            "invalid username or password",
        )
        .with_type("authentication_error")
    };

    let user = user_store
        .get_user_by_username(&body.username)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(invalid)?;

    if !user.enabled {
        return Err(AppError::new(
            StatusCode::FORBIDDEN,
            "account_disabled",
            "your account has been disabled",
        ));
    }

    let valid = UserStore::verify_password(&body.password, &user.password_hash)
        .map_err(AppError::internal)?;
    if !valid {
        return Err(invalid());
    }

    if let Err(err) = user_store.update_last_login(&user.id).await {
        tracing::warn!(user_id = %user.id, error = %err, "failed to record last login");
    }

    let session = user_store
        .create_session(&user.id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(AuthResponse {
        token: session.token,
        user: user.into(),
    }))
}

pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let token = extract_session_token(&headers)
        .ok_or_else(|| AppError::unauthorized("missing authorization header"))?;
    state
        .user_store
        .delete_session(&token)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(json!({ "success": true })))
}

pub async fn get_me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let user = get_current_user(&headers, &state).await?;
    Ok(Json(UserResponse::from(user)))
}

// ---- bots ----

/// Loads a bot the user may manage: admins manage all, others only their own.
async fn load_managed_bot(state: &AppState, user: &User, bot_id: &str) -> AppResult<Bot> {
    let bot = state
        .bot_store
        .get_bot(bot_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found("bot_not_found", "bot not found"))?;
    if !user.can_manage_bot(&bot.created_by) {
        return Err(AppError::forbidden("you do not have access to this bot"));
    }
    Ok(bot)
}

#[derive(Debug, Deserialize)]
pub struct ListBotsQuery {
    pub search: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_bots(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListBotsQuery>,
) -> AppResult<impl IntoResponse> {
    let user = get_current_user(&headers, &state).await?;
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(10).clamp(1, MAX_PAGE_SIZE);
    let offset = (page - 1).checked_mul(limit).ok_or_else(|| {
        AppError::bad_request("invalid_page", "page is out of range").with_param("page")
    })?;
    let owner = (!user.role.is_admin()).then_some(user.id.as_str());

    let (bots, total) = state
        .bot_store
        .list_bots(owner, query.search.as_deref(), limit, offset)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(json!({
        "data": bots,
        "pagination": {
            "page": page,
            "limit": limit,
            "total": total,
            "total_pages": (total + limit - 1) / limit,
        }
    })))
}

/// Every signed-in user may browse active bots, owned or not.
pub async fn list_public_bots(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    get_current_user(&headers, &state).await?;
    let bots = state
        .bot_store
        .list_public_bots()
        .await
        .map_err(AppError::internal)?;
    Ok(Json(bots))
}

fn validate_bot_name(name: &str) -> AppResult<()> {
    let len = name.trim().chars().count();
    if len == 0 || len > 100 {
        return Err(
            AppError::bad_request("invalid_name", "name must be 1-100 characters")
                .with_param("name"),
        );
    }
    Ok(())
}

pub async fn create_bot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateBotInput>,
) -> AppResult<impl IntoResponse> {
    let user = get_current_user(&headers, &state).await?;
    validate_bot_name(&body.name)?;
    if body.upstream_api_key.trim().is_empty() {
        return Err(AppError::bad_request(
            "invalid_upstream_api_key",
            "upstream_api_key is required",
        )
        .with_param("upstream_api_key"));
    }

    let bot = state
        .bot_store
        .create_bot(&user.id, body)
        .await
        .map_err(AppError::internal)?;
    tracing::info!(bot_id = %bot.id, user_id = %user.id, "bot created");
    Ok((StatusCode::CREATED, Json(bot)))
}

pub async fn get_bot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bot_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let user = get_current_user(&headers, &state).await?;
    let bot = load_managed_bot(&state, &user, &bot_id).await?;
    Ok(Json(bot))
}

pub async fn update_bot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bot_id): Path<String>,
    Json(body): Json<UpdateBotInput>,
) -> AppResult<impl IntoResponse> {
    let user = get_current_user(&headers, &state).await?;
    load_managed_bot(&state, &user, &bot_id).await?;
    if let Some(name) = body.name.as_deref() {
        validate_bot_name(name)?;
    }
    let bot = state
        .bot_store
        .update_bot(&bot_id, body)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found("bot_not_found", "bot not found"))?;
    Ok(Json(bot))
}

pub async fn delete_bot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bot_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let user = get_current_user(&headers, &state).await?;
    load_managed_bot(&state, &user, &bot_id).await?;
    let deleted = state
        .bot_store
        .delete_bot(&bot_id)
        .await
        .map_err(AppError::internal)?;
    if !deleted {
        return Err(AppError::not_found("bot_not_found", "bot not found"));
    }
    tracing::info!(bot_id = %bot_id, "bot deleted");
    Ok(Json(json!({ "success": true })))
}

pub async fn validate_bot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bot_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let user = get_current_user(&headers, &state).await?;
    let bot = load_managed_bot(&state, &user, &bot_id).await?;
    let result = crate::bot_sync::validate_target(&state.upstream, &bot.upstream_target()).await;
    Ok(Json(result))
}

pub async fn sync_bot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bot_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let user = get_current_user(&headers, &state).await?;
    let bot = load_managed_bot(&state, &user, &bot_id).await?;
    let synced = crate::bot_sync::sync_bot(&state.upstream, &state.bot_store, &bot)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(synced))
}

pub async fn list_bot_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bot_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> AppResult<impl IntoResponse> {
    let user = get_current_user(&headers, &state).await?;
    let bot = load_managed_bot(&state, &user, &bot_id).await?;
    let limit = query.limit.unwrap_or(20).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);
    let (items, total) = state
        .conversation_store
        .list_by_bot(&bot.id, limit, offset)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(json!({ "data": items, "total": total })))
}

// ---- api keys ----

/// Returned by create and regenerate; the only time the secret is shown.
#[derive(Debug, Serialize)]
pub struct IssuedApiKey {
    #[serde(flatten)]
    pub api_key: ApiKey,
    pub key: String,
}

fn validate_key_fields(
    name: Option<&str>,
    rate_limit: Option<i64>,
    permissions: Option<&str>,
) -> AppResult<()> {
    if let Some(name) = name {
        let len = name.trim().chars().count();
        if len == 0 || len > 100 {
            return Err(
                AppError::bad_request("invalid_name", "name must be 1-100 characters")
                    .with_param("name"),
            );
        }
    }
    if let Some(rate_limit) = rate_limit {
        if !(1..=10_000).contains(&rate_limit) {
            return Err(AppError::bad_request(
                "invalid_rate_limit",
                "rate_limit must be between 1 and 10000",
            )
            .with_param("rate_limit"));
        }
    }
    if let Some(permissions) = permissions {
        if permissions.split(',').all(|p| p.trim().is_empty()) {
            return Err(AppError::bad_request(
                "invalid_permissions",
                "permissions must name at least one scope",
            )
            .with_param("permissions"));
        }
    }
    Ok(())
}

async fn load_managed_key(state: &AppState, user: &User, key_id: &str) -> AppResult<ApiKey> {
    let key = state
        .api_key_store
        .get_api_key(key_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found("api_key_not_found", "api key not found"))?;
    load_managed_bot(state, user, &key.bot_id).await?;
    Ok(key)
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bot_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let user = get_current_user(&headers, &state).await?;
    let bot = load_managed_bot(&state, &user, &bot_id).await?;
    let keys = state
        .api_key_store
        .list_by_bot(&bot.id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(keys))
}

pub async fn create_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bot_id): Path<String>,
    Json(body): Json<CreateApiKeyInput>,
) -> AppResult<impl IntoResponse> {
    let user = get_current_user(&headers, &state).await?;
    let bot = load_managed_bot(&state, &user, &bot_id).await?;
    validate_key_fields(
        Some(&body.name),
        body.rate_limit,
        body.permissions.as_deref(),
    )?;

    let (api_key, key) = state
        .api_key_store
        .create_api_key(&bot.id, body)
        .await
        .map_err(AppError::internal)?;
    tracing::info!(api_key_id = %api_key.id, bot_id = %bot.id, "api key issued");
    Ok((StatusCode::CREATED, Json(IssuedApiKey { api_key, key })))
}

pub async fn get_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let user = get_current_user(&headers, &state).await?;
    let key = load_managed_key(&state, &user, &key_id).await?;
    Ok(Json(key))
}

pub async fn update_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
    Json(body): Json<UpdateApiKeyInput>,
) -> AppResult<impl IntoResponse> {
    let user = get_current_user(&headers, &state).await?;
    load_managed_key(&state, &user, &key_id).await?;
    validate_key_fields(
        body.name.as_deref(),
        body.rate_limit,
        body.permissions.as_deref(),
    )?;
    let key = state
        .api_key_store
        .update_api_key(&key_id, body)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found("api_key_not_found", "api key not found"))?;
    Ok(Json(key))
}

pub async fn delete_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let user = get_current_user(&headers, &state).await?;
    load_managed_key(&state, &user, &key_id).await?;
    let deleted = state
        .api_key_store
        .delete_api_key(&key_id)
        .await
        .map_err(AppError::internal)?;
    if !deleted {
        return Err(AppError::not_found("api_key_not_found", "api key not found"));
    }
    Ok(Json(json!({ "success": true })))
}

pub async fn regenerate_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let user = get_current_user(&headers, &state).await?;
    load_managed_key(&state, &user, &key_id).await?;
    let (api_key, key) = state
        .api_key_store
        .regenerate_api_key(&key_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found("api_key_not_found", "api key not found"))?;
    tracing::info!(api_key_id = %api_key.id, "api key regenerated");
    Ok(Json(IssuedApiKey { api_key, key }))
}
