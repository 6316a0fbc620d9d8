use crate::api_keys::ApiKeyStore;
use crate::auth::AuthState;
use crate::bots::BotStore;
use crate::chat::ChatService;
use crate::conversations::ConversationStore;
use crate::error::{AppError, AppResult};
use crate::store::connect_pool;
use crate::upstream::UpstreamClient;
use crate::users::{CreateUserError, UserRole, UserStore};
use axum::Router;
use axum::routing::{get, patch, post};
use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "Sorry, I can't answer right now. Please try again later.";
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "http://localhost/api";
const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub auth: AuthState,
    pub upstream: UpstreamClient,
    pub metrics: PrometheusHandle,
    pub user_store: UserStore,
    pub bot_store: BotStore,
    pub api_key_store: ApiKeyStore,
    pub conversation_store: ConversationStore,
    pub chat: ChatService,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub upstream_timeout_ms: u64,
    pub default_base_url: String,
    pub fallback_message: String,
    pub bot_sync_interval_secs: u64,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = env_non_empty("BOTRELAY_LISTEN").unwrap_or_else(|| "0.0.0.0:3001".to_string());
        let metrics_path =
            env_non_empty("BOTRELAY_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        let upstream_timeout_ms = env_non_empty("BOTRELAY_UPSTREAM_TIMEOUT_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(30_000);
        let default_base_url = env_non_empty("BOTRELAY_DEFAULT_BASE_URL")
            .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string());
        let fallback_message = env_non_empty("BOTRELAY_FALLBACK_MESSAGE")
            .unwrap_or_else(|| DEFAULT_FALLBACK_MESSAGE.to_string());
        let bot_sync_interval_secs = env_non_empty("BOTRELAY_BOT_SYNC_INTERVAL_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);
        Self {
            listen,
            metrics_path,
            database_dsn: resolve_database_dsn(),
            upstream_timeout_ms,
            default_base_url,
            fallback_message,
            bot_sync_interval_secs,
            admin_username: env_non_empty("BOTRELAY_ADMIN_USERNAME"),
            admin_password: env_non_empty("BOTRELAY_ADMIN_PASSWORD"),
        }
    }

    /// Defaults for everything except the database, used by tests and embedders.
    pub fn with_database(database_dsn: impl Into<String>) -> Self {
        Self {
            listen: "127.0.0.1:0".to_string(),
            metrics_path: "/metrics".to_string(),
            database_dsn: database_dsn.into(),
            upstream_timeout_ms: 30_000,
            default_base_url: DEFAULT_UPSTREAM_BASE_URL.to_string(),
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
            bot_sync_interval_secs: 0,
            admin_username: None,
            admin_password: None,
        }
    }
}

fn resolve_database_dsn() -> String {
    env_non_empty("BOTRELAY_DATABASE_DSN")
        .or_else(|| env_non_empty("DATABASE_URL"))
        .unwrap_or_else(|| "sqlite://./data/botrelay.db".to_string())
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

fn init_error(code: &str, err: String) -> AppError {
    AppError::new(axum::http::StatusCode::INTERNAL_SERVER_ERROR, code, err)
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let upstream = UpstreamClient::new(Duration::from_millis(runtime.upstream_timeout_ms))
        .map_err(|err| init_error("http_client_init_failed", err))?;

    let pool = connect_pool(&runtime.database_dsn)
        .await
        .map_err(|err| init_error("database_init_failed", err))?;

    let user_store = UserStore::new(pool.clone())
        .await
        .map_err(|err| init_error("user_store_init_failed", err))?;
    let bot_store = BotStore::new(pool.clone(), runtime.default_base_url.clone())
        .await
        .map_err(|err| init_error("bot_store_init_failed", err))?;
    let api_key_store = ApiKeyStore::new(pool.clone(), bot_store.clone())
        .await
        .map_err(|err| init_error("api_key_store_init_failed", err))?;
    let conversation_store = ConversationStore::new(pool)
        .await
        .map_err(|err| init_error("conversation_store_init_failed", err))?;

    seed_admin(&user_store, &runtime).await?;

    let metrics = init_metrics()?;

    let auth = AuthState::new(api_key_store.clone());
    let chat = ChatService::new(
        conversation_store.clone(),
        upstream.clone(),
        runtime.fallback_message.clone(),
    );

    if runtime.bot_sync_interval_secs > 0 {
        tracing::info!(
            interval_secs = runtime.bot_sync_interval_secs,
            "starting periodic bot sync"
        );
        crate::bot_sync::spawn_sync_loop(
            upstream.clone(),
            bot_store.clone(),
            Duration::from_secs(runtime.bot_sync_interval_secs),
        );
    }

    Ok(AppState {
        runtime: Arc::new(runtime),
        auth,
        upstream,
        metrics,
        user_store,
        bot_store,
        api_key_store,
        conversation_store,
        chat,
    })
}

async fn seed_admin(user_store: &UserStore, runtime: &RuntimeConfig) -> AppResult<()> {
    let (Some(username), Some(password)) = (&runtime.admin_username, &runtime.admin_password) else {
        return Ok(());
    };
    let count = user_store
        .user_count()
        .await
        .map_err(|err| init_error("admin_seed_failed", err))?;
    if count > 0 {
        return Ok(());
    }
    match user_store.create_user(username, password, UserRole::Admin).await {
        Ok(user) => {
            tracing::info!(username = %user.username, "seeded admin account");
            Ok(())
        }
        Err(CreateUserError::UsernameTaken) => Ok(()),
        Err(CreateUserError::Storage(err)) => Err(init_error("admin_seed_failed", err)),
    }
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                describe_metrics();
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(init_error("metrics_init_failed", err.to_string()));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        init_error(
            "metrics_init_failed",
            "metrics recorder not available".to_string(),
        )
    })
}

fn describe_metrics() {
    describe_counter!(
        "botrelay_key_validations_total",
        "API key validations by outcome"
    );
    describe_counter!(
        "botrelay_upstream_requests_total",
        "Upstream chat calls by mode and outcome"
    );
    describe_counter!("botrelay_relay_chunks_total", "Chunks forwarded downstream");
    describe_counter!(
        "botrelay_relay_streams_total",
        "Relayed streams by terminal outcome"
    );
    describe_counter!(
        "botrelay_fallback_replies_total",
        "Assistant replies substituted with the fallback text"
    );
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .merge(build_chat_router())
        .merge(build_proxy_router(&metrics_path))
        .nest("/api", build_dashboard_api_router())
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_chat_router() -> Router<AppState> {
    Router::new()
        .route("/chat/start", post(crate::handlers::start_conversation))
        .route(
            "/chat/{conversation_id}/messages",
            post(crate::handlers::send_message),
        )
        .route(
            "/chat/{conversation_id}",
            get(crate::handlers::get_conversation),
        )
        .route(
            "/chat/{conversation_id}/close",
            patch(crate::handlers::close_conversation),
        )
}

fn build_proxy_router(metrics_path: &str) -> Router<AppState> {
    Router::new()
        .route(
            "/v1/chat-messages",
            post(crate::handlers::proxy_chat_messages),
        )
        .route("/v1/info", get(crate::handlers::proxy_info))
        .route("/v1/parameters", get(crate::handlers::proxy_parameters))
        .route("/v1/meta", get(crate::handlers::proxy_meta))
        .route("/health", get(crate::handlers::health))
        .route(metrics_path, get(crate::handlers::metrics))
}

fn build_dashboard_api_router() -> Router<AppState> {
    Router::new()
        .route(
            "/dashboard/auth/register",
            post(crate::dashboard_handlers::register),
        )
        .route(
            "/dashboard/auth/login",
            post(crate::dashboard_handlers::login),
        )
        .route(
            "/dashboard/auth/logout",
            post(crate::dashboard_handlers::logout),
        )
        .route("/dashboard/auth/me", get(crate::dashboard_handlers::get_me))
        .route(
            "/dashboard/bots",
            get(crate::dashboard_handlers::list_bots).post(crate::dashboard_handlers::create_bot),
        )
        .route(
            "/dashboard/bots/public",
            get(crate::dashboard_handlers::list_public_bots),
        )
        .route(
            "/dashboard/bots/{bot_id}",
            get(crate::dashboard_handlers::get_bot)
                .patch(crate::dashboard_handlers::update_bot)
                .delete(crate::dashboard_handlers::delete_bot),
        )
        .route(
            "/dashboard/bots/{bot_id}/validate",
            post(crate::dashboard_handlers::validate_bot),
        )
        .route(
            "/dashboard/bots/{bot_id}/sync",
            post(crate::dashboard_handlers::sync_bot),
        )
        .route(
            "/dashboard/bots/{bot_id}/api-keys",
            get(crate::dashboard_handlers::list_api_keys)
                .post(crate::dashboard_handlers::create_api_key),
        )
        .route(
            "/dashboard/bots/{bot_id}/conversations",
            get(crate::dashboard_handlers::list_bot_conversations),
        )
        .route(
            "/dashboard/api-keys/{key_id}",
            get(crate::dashboard_handlers::get_api_key)
                .patch(crate::dashboard_handlers::update_api_key)
                .delete(crate::dashboard_handlers::delete_api_key),
        )
        .route(
            "/dashboard/api-keys/{key_id}/regenerate",
            post(crate::dashboard_handlers::regenerate_api_key),
        )
}
